//! Durable, at-least-once pub/sub over the store.
//!
//! Publishing journals the event into its stream atomically with whatever
//! keyspace mutation the caller performs (scripts emit inside their critical
//! section; [`EventBus::publish`] covers standalone events). Live delivery
//! fans out over the store's broadcast channel wrapped in [`Subscription`]s
//! that filter by dotted patterns. Per-subscriber cursors in the keyspace
//! give dedup and journal-based catch-up after a lag.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::debug;

use swarmd_store::{EventRecord, GLOBAL_STREAM, Store};

use crate::error::{BusError, BusResult};
use crate::pattern::PatternSet;

/// Handle for publishing and subscribing to coordination events.
#[derive(Clone)]
pub struct EventBus {
    store: Store,
}

impl EventBus {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Journal and broadcast a standalone event (one not produced inside a
    /// script). Returns the assigned event id.
    pub fn publish(
        &self,
        stream: impl Into<String>,
        event_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> u64 {
        let stream = stream.into();
        let event_type = event_type.into();
        debug!(stream = %stream, event = %event_type, "bus publish");
        self.store
            .run(move |ks| ks.emit(stream, event_type, payload, Utc::now()))
    }

    /// Open a live subscription filtered by the given dotted patterns.
    ///
    /// `subscriber_id` names the dedup cursor in the keyspace; two
    /// subscriptions sharing an id share delivery progress.
    pub fn subscribe<I, S>(&self, subscriber_id: &str, patterns: I) -> BusResult<Subscription>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = PatternSet::parse_all(patterns)?;
        Ok(Subscription {
            subscriber_id: subscriber_id.to_string(),
            patterns,
            rx: self.store.subscribe_events(),
            store: self.store.clone(),
        })
    }

    /// Read journaled events a subscriber has not yet acknowledged, oldest
    /// first. Used to recover after a lag or reconnect.
    pub fn catch_up(&self, subscriber_id: &str, limit: usize) -> Vec<EventRecord> {
        self.store.run(|ks| {
            let cursor = ks.cursor(subscriber_id);
            ks.read_stream(GLOBAL_STREAM, cursor, limit)
        })
    }

    /// Record that a subscriber has processed everything up to `event_id`.
    pub fn ack(&self, subscriber_id: &str, event_id: u64) {
        self.store.run(|ks| ks.set_cursor(subscriber_id, event_id));
    }
}

/// One live, pattern-filtered event feed.
pub struct Subscription {
    subscriber_id: String,
    patterns: PatternSet,
    rx: broadcast::Receiver<Arc<EventRecord>>,
    store: Store,
}

impl Subscription {
    /// Wait for the next event matching this subscription's patterns.
    ///
    /// Events already acknowledged (id at or below the cursor) are skipped,
    /// which deduplicates redelivery when a caller mixes `recv` with
    /// [`EventBus::catch_up`].
    pub async fn recv(&mut self) -> BusResult<Arc<EventRecord>> {
        loop {
            let event = match self.rx.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Closed) => return Err(BusError::Closed),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    return Err(BusError::Lagged { skipped });
                }
            };

            if !self.patterns.matches(&event.event_type) {
                continue;
            }
            let cursor = self.store.run(|ks| ks.cursor(&self.subscriber_id));
            if event.id <= cursor {
                continue;
            }
            return Ok(event);
        }
    }

    /// Acknowledge an event as processed.
    pub fn ack(&self, event_id: u64) {
        self.store
            .run(|ks| ks.set_cursor(&self.subscriber_id, event_id));
    }

    pub fn subscriber_id(&self) -> &str {
        &self.subscriber_id
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
