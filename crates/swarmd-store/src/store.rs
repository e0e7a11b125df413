//! The shared store handle.
//!
//! [`Store`] wraps the [`Keyspace`] behind a single mutex and is the only
//! way the rest of the system touches coordination state. Every closure
//! passed to [`Store::run`] executes while holding the guard — the Rust
//! analogue of a server-side script running single-threaded on the store —
//! so multi-key transitions are serializable without any other locking.
//!
//! No caller ever holds the guard across an await: `run` takes a synchronous
//! closure, and the critical sections are short (pure in-memory mutation).
//! Events emitted during a critical section are fanned out to live
//! subscribers *after* the guard is released, in emission order.

use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;

use crate::keyspace::{DEFAULT_STREAM_CAP, Keyspace};
use crate::streams::EventRecord;

/// Capacity of the live-event broadcast channel. Slow subscribers that lag
/// past this many events fall back to cursor-based stream reads.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Store construction options.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Count cap per event stream before trimming.
    pub stream_cap: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            stream_cap: DEFAULT_STREAM_CAP,
        }
    }
}

/// Thread-safe handle to the coordination keyspace.
///
/// Cheaply cloneable (`Arc`-backed) and `Send + Sync`.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    keyspace: Mutex<Keyspace>,
    events_tx: broadcast::Sender<Arc<EventRecord>>,
}

impl Store {
    pub fn new(config: StoreConfig) -> Self {
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(StoreInner {
                keyspace: Mutex::new(Keyspace::new(config.stream_cap)),
                events_tx,
            }),
        }
    }

    /// Execute `f` atomically against the keyspace.
    ///
    /// This is the script-execution entry point: the closure observes and
    /// mutates a consistent snapshot, and any events it emits are journaled
    /// inside the critical section and broadcast to live subscribers once
    /// the guard is dropped.
    pub fn run<F, T>(&self, f: F) -> T
    where
        F: FnOnce(&mut Keyspace) -> T,
    {
        let (result, events) = {
            let mut guard = self
                .inner
                .keyspace
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            let result = f(&mut guard);
            (result, guard.take_notifications())
        };

        for event in events {
            // Send fails only when there are no live subscribers; the
            // journal copy already exists either way.
            let _ = self.inner.events_tx.send(Arc::new(event));
        }

        result
    }

    /// Subscribe to the live event feed.
    pub fn subscribe_events(&self) -> broadcast::Receiver<Arc<EventRecord>> {
        self.inner.events_tx.subscribe()
    }

    /// Number of live event subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.events_tx.receiver_count()
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new(StoreConfig::default())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streams::GLOBAL_STREAM;
    use crate::types::TaskRecord;
    use chrono::Utc;

    #[test]
    fn run_is_atomic_and_returns_value() {
        let store = Store::default();
        let count = store.run(|ks| {
            ks.insert_task(TaskRecord::new("t1", "a", 10, Utc::now()));
            ks.insert_task(TaskRecord::new("t2", "b", 20, Utc::now()));
            ks.stats().tasks
        });
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn events_broadcast_after_commit() {
        let store = Store::default();
        let mut rx = store.subscribe_events();

        store.run(|ks| {
            ks.emit(
                GLOBAL_STREAM,
                "system.started",
                serde_json::json!({"ok": true}),
                Utc::now(),
            );
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type, "system.started");
        assert_eq!(event.id, 1);
    }

    #[tokio::test]
    async fn concurrent_runs_serialize() {
        let store = Store::default();
        store.run(|ks| ks.insert_task(TaskRecord::new("t1", "x", 0, Utc::now())));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..100 {
                    store.run(|ks| ks.incr_counter("hits", 1));
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let total = store.run(|ks| ks.counters().get("hits").copied().unwrap());
        assert_eq!(total, 1600);
    }
}
