//! Append-only event streams.
//!
//! Events are journaled into per-aggregate streams (`events:task:{id}`,
//! `events:instance:{id}`, `events:global`, …) in the same critical section
//! as the state mutation that produced them, so the journal never disagrees
//! with the keyspace. Ordering is total per stream and by monotonic event id;
//! there is no cross-stream ordering. Streams are trimmed to a count cap.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The global stream receiving every event in addition to its home stream's
/// copy being discoverable by id.
pub const GLOBAL_STREAM: &str = "events:global";

/// Stream carrying hook validator audit decisions.
pub const AUDIT_STREAM: &str = "events:hooks:audit";

/// Stream name for a task aggregate.
pub fn task_stream(task_id: &str) -> String {
    format!("events:task:{task_id}")
}

/// Stream name for an instance aggregate.
pub fn instance_stream(instance_id: &str) -> String {
    format!("events:instance:{instance_id}")
}

/// A single journaled event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    /// Monotonic id, unique across the whole keyspace.
    pub id: u64,
    /// Dotted event name, e.g. `task.create`, `subtask.unblocked`.
    #[serde(rename = "type")]
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
    /// Home stream this event was journaled into.
    pub stream: String,
}

/// One append-only stream with count-based trimming.
#[derive(Debug, Clone, Default)]
pub struct EventStream {
    entries: VecDeque<EventRecord>,
}

impl EventStream {
    /// Append an event, dropping the oldest entries beyond `cap`.
    pub fn append(&mut self, event: EventRecord, cap: usize) {
        self.entries.push_back(event);
        while self.entries.len() > cap {
            self.entries.pop_front();
        }
    }

    /// Events with id strictly greater than `after`, oldest first, at most
    /// `limit`.
    pub fn read_after(&self, after: u64, limit: usize) -> Vec<EventRecord> {
        self.entries
            .iter()
            .filter(|e| e.id > after)
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Highest event id in the stream, if any.
    pub fn last_id(&self) -> Option<u64> {
        self.entries.back().map(|e| e.id)
    }
}
