//! Shared handles threaded into every method handler.
//!
//! One [`SwarmContext`] is built at startup and passed around explicitly —
//! no ambient singletons. Handlers are stateless; everything durable lives
//! behind the store and sink handles.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::debug;

use swarmd_bus::EventBus;
use swarmd_coord::{InstanceManager, SwarmCoordinator, TaskQueue};
use swarmd_hooks::HookValidator;
use swarmd_registry::Persister;
use swarmd_store::{Sink, Store, TaskRecord};

/// Process-scoped context shared by all handlers.
pub struct SwarmContext {
    pub store: Store,
    pub sink: Sink,
    pub bus: EventBus,
    pub queue: TaskQueue,
    pub instances: InstanceManager,
    pub coordinator: SwarmCoordinator,
    pub hooks: HookValidator,
    /// Guard token required by `system.flush`. Flush is refused entirely
    /// when unset.
    pub flush_token: Option<String>,
    pub started_at: DateTime<Utc>,
}

impl SwarmContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store,
        sink: Sink,
        bus: EventBus,
        queue: TaskQueue,
        instances: InstanceManager,
        coordinator: SwarmCoordinator,
        hooks: HookValidator,
        flush_token: Option<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            sink,
            bus,
            queue,
            instances,
            coordinator,
            hooks,
            flush_token,
            started_at: Utc::now(),
        })
    }
}

/// Mirrors `persist`-flagged task results into the relational sink.
pub struct SinkPersister {
    sink: Sink,
}

impl SinkPersister {
    pub fn new(sink: Sink) -> Arc<Self> {
        Arc::new(Self { sink })
    }
}

#[async_trait]
impl Persister for SinkPersister {
    async fn persist(&self, method: &str, result: &Value) -> Result<(), String> {
        match method {
            "task.create" | "task.update" | "task.complete" | "task.claim" | "task.assign" => {
                // These methods return the full task record.
                let Ok(task) = serde_json::from_value::<TaskRecord>(result.clone()) else {
                    debug!(method, "persist skipped: result is not a task record");
                    return Ok(());
                };
                self.sink
                    .archive_task(&task)
                    .await
                    .map_err(|e| e.to_string())
            }
            _ => Ok(()),
        }
    }
}
