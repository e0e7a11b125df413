//! Task queue: priority enqueue, capacity-checked pull with bounded
//! long-poll, explicit assignment, and completion.
//!
//! Parent tasks flow through `queue:tasks:pending` until a worker claims
//! them (or `swarm.decompose` converts them into a subtask graph). Equal
//! priorities are FIFO by enqueue sequence; a pull returns nothing when the
//! instance is at `max_load`.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::debug;

use swarmd_store::{Store, StoreError, TaskRecord, WorkStatus, task_stream};

use crate::error::{CoordError, CoordResult};

/// Metadata key marking which instance holds a claimed task.
pub const CLAIMED_BY_KEY: &str = "claimed_by";

/// Queue operations over the store.
#[derive(Clone)]
pub struct TaskQueue {
    store: Store,
}

impl TaskQueue {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Create a task and enqueue it by priority.
    pub fn create_task(
        &self,
        id: Option<String>,
        text: String,
        priority: u8,
        metadata: serde_json::Map<String, serde_json::Value>,
        now: DateTime<Utc>,
    ) -> TaskRecord {
        let id = id.unwrap_or_else(|| format!("t-{}", uuid::Uuid::now_v7()));
        self.store.run(|ks| {
            let mut task = TaskRecord::new(&id, &text, priority, now);
            task.metadata = metadata.clone();
            ks.insert_task(task.clone());
            ks.pending_push(&id, task.priority);
            ks.incr_counter("tasks_created", 1);
            ks.emit(
                task_stream(&id),
                "task.create",
                json!({ "task_id": id, "priority": task.priority }),
                now,
            );
            task
        })
    }

    /// Claim the highest-priority pending task for an instance, without
    /// waiting. Returns `None` when nothing matches or the instance is at
    /// capacity.
    pub fn try_claim(&self, instance_id: &str, now: DateTime<Utc>) -> CoordResult<Option<TaskRecord>> {
        let claimed = self.store.run(|ks| {
            let instance = ks.instance(instance_id)?;
            if !instance.has_capacity() {
                return Ok::<_, StoreError>(None);
            }

            let Some(entry) = ks.pending_pop(|task| task.status == WorkStatus::Pending) else {
                return Ok(None);
            };

            {
                let instance = ks.instance_mut(instance_id)?;
                instance.current_load += 1;
                instance.recompute_status();
            }
            let task = {
                let task = ks.task_mut(&entry.task_id)?;
                task.status = WorkStatus::InProgress;
                task.updated_at = now;
                task.metadata
                    .insert(CLAIMED_BY_KEY.to_string(), json!(instance_id));
                task.clone()
            };

            ks.incr_counter("tasks_claimed", 1);
            ks.emit(
                task_stream(&task.id),
                "task.claimed",
                json!({ "task_id": task.id, "instance_id": instance_id }),
                now,
            );
            Ok(Some(task))
        })?;

        Ok(claimed)
    }

    /// Claim with a bounded long-poll: waits up to `wait` for matching work
    /// to appear. Cancellable by dropping the future.
    pub async fn claim(
        &self,
        instance_id: &str,
        wait: Duration,
    ) -> CoordResult<Option<TaskRecord>> {
        // Subscribe before the first attempt so an enqueue between the
        // attempt and the wait is never missed.
        let mut events = self.store.subscribe_events();
        let deadline = tokio::time::Instant::now() + wait;

        loop {
            if let Some(task) = self.try_claim(instance_id, Utc::now())? {
                return Ok(Some(task));
            }

            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }

            match tokio::time::timeout(remaining, events.recv()).await {
                Ok(Ok(event)) => {
                    if matches!(event.event_type.as_str(), "task.create" | "task.requeued") {
                        debug!(instance_id, event = %event.event_type, "long-poll wakeup");
                    }
                }
                // Missed events just mean another claim attempt.
                Ok(Err(tokio::sync::broadcast::error::RecvError::Lagged(_))) => {}
                Ok(Err(tokio::sync::broadcast::error::RecvError::Closed)) => return Ok(None),
                Err(_) => return Ok(None),
            }
        }
    }

    /// Admin override: hand a specific pending task to a specific instance,
    /// still honoring the capacity invariant.
    pub fn assign(
        &self,
        task_id: &str,
        instance_id: &str,
        now: DateTime<Utc>,
    ) -> CoordResult<TaskRecord> {
        let task = self.store.run(|ks| {
            let instance = ks.instance(instance_id)?;
            if !instance.has_capacity() {
                return Err(StoreError::InvalidTransition {
                    entity: "instance",
                    id: instance_id.to_string(),
                    reason: "instance is at max load".into(),
                });
            }
            let status = ks.task(task_id)?.status;
            if status != WorkStatus::Pending {
                return Err(StoreError::InvalidTransition {
                    entity: "task",
                    id: task_id.to_string(),
                    reason: format!("cannot assign a {} task", status.as_str()),
                });
            }

            ks.pending_remove(task_id);
            {
                let instance = ks.instance_mut(instance_id)?;
                instance.current_load += 1;
                instance.recompute_status();
            }
            let task = {
                let task = ks.task_mut(task_id)?;
                task.status = WorkStatus::InProgress;
                task.updated_at = now;
                task.metadata
                    .insert(CLAIMED_BY_KEY.to_string(), json!(instance_id));
                task.clone()
            };
            ks.emit(
                task_stream(task_id),
                "task.assigned",
                json!({ "task_id": task_id, "instance_id": instance_id }),
                now,
            );
            Ok(task)
        })?;
        Ok(task)
    }

    /// Complete a claimed task, releasing the holder's capacity.
    pub fn complete_task(
        &self,
        task_id: &str,
        status: WorkStatus,
        result: Option<String>,
        now: DateTime<Utc>,
    ) -> CoordResult<TaskRecord> {
        if !status.is_terminal() {
            return Err(CoordError::Store(StoreError::InvalidArgument(
                "completion status must be completed or failed".into(),
            )));
        }

        let task = self.store.run(|ks| {
            let holder = {
                let task = ks.task_mut(task_id)?;
                if task.status.is_terminal() {
                    // Idempotent re-delivery.
                    return Ok::<_, StoreError>(task.clone());
                }
                task.finish(status, now);
                if let Some(result) = &result {
                    task.metadata.insert("result".to_string(), json!(result));
                }
                task.metadata
                    .get(CLAIMED_BY_KEY)
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
            };

            if let Some(holder) = holder {
                if let Ok(instance) = ks.instance_mut(&holder) {
                    instance.current_load = instance.current_load.saturating_sub(1);
                    instance.recompute_status();
                }
            }
            ks.pending_remove(task_id);

            ks.incr_counter(
                if status == WorkStatus::Completed {
                    "tasks_completed"
                } else {
                    "tasks_failed"
                },
                1,
            );
            ks.emit(
                task_stream(task_id),
                "task.complete",
                json!({ "task_id": task_id, "status": status.as_str() }),
                now,
            );
            Ok(ks.task(task_id)?.clone())
        })?;
        Ok(task)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instances::{InstanceConfig, InstanceManager, RegisterRequest};
    use std::collections::BTreeSet;
    use swarmd_store::{InstanceStatus, SpecialistKind};

    fn setup() -> (Store, TaskQueue, InstanceManager) {
        let store = Store::default();
        let queue = TaskQueue::new(store.clone());
        let manager = InstanceManager::new(store.clone(), InstanceConfig::default());
        (store, queue, manager)
    }

    fn register(manager: &InstanceManager, id: &str, max_load: u32) {
        manager.register(
            RegisterRequest {
                id: id.to_string(),
                roles: BTreeSet::from([SpecialistKind::General]),
                capabilities: BTreeSet::new(),
                max_load: Some(max_load),
                metadata: serde_json::Map::new(),
            },
            Utc::now(),
        );
    }

    #[tokio::test]
    async fn priority_pull_takes_highest_first() {
        let (_store, queue, manager) = setup();
        for (text, priority) in [("a", 10u8), ("b", 90), ("c", 50)] {
            queue.create_task(None, text.to_string(), priority, serde_json::Map::new(), Utc::now());
        }
        register(&manager, "w1", 5);

        let first = queue.try_claim("w1", Utc::now()).unwrap().unwrap();
        assert_eq!(first.priority, 90);
        let second = queue.try_claim("w1", Utc::now()).unwrap().unwrap();
        assert_eq!(second.priority, 50);
    }

    #[tokio::test]
    async fn pull_respects_capacity() {
        let (store, queue, manager) = setup();
        register(&manager, "w1", 1);
        queue.create_task(None, "one".into(), 50, serde_json::Map::new(), Utc::now());
        queue.create_task(None, "two".into(), 50, serde_json::Map::new(), Utc::now());

        let first = queue.try_claim("w1", Utc::now()).unwrap();
        assert!(first.is_some());
        // At max load: the pull comes back empty even though work exists.
        let second = queue.try_claim("w1", Utc::now()).unwrap();
        assert!(second.is_none());

        store.run(|ks| {
            assert_eq!(ks.instance("w1").unwrap().status, InstanceStatus::Busy);
        });
    }

    #[tokio::test]
    async fn long_poll_wakes_on_enqueue() {
        let (_store, queue, manager) = setup();
        register(&manager, "w1", 2);

        let poller = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.claim("w1", Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        queue.create_task(None, "late arrival".into(), 30, serde_json::Map::new(), Utc::now());

        let claimed = poller.await.unwrap().unwrap();
        assert_eq!(claimed.unwrap().text, "late arrival");
    }

    #[tokio::test]
    async fn long_poll_times_out_empty() {
        let (_store, queue, manager) = setup();
        register(&manager, "w1", 2);

        let claimed = queue.claim("w1", Duration::from_millis(100)).await.unwrap();
        assert!(claimed.is_none());
    }

    #[tokio::test]
    async fn complete_releases_capacity_and_is_idempotent() {
        let (store, queue, manager) = setup();
        register(&manager, "w1", 1);
        let task = queue.create_task(None, "job".into(), 50, serde_json::Map::new(), Utc::now());
        queue.try_claim("w1", Utc::now()).unwrap().unwrap();

        let done = queue
            .complete_task(&task.id, WorkStatus::Completed, Some("ok".into()), Utc::now())
            .unwrap();
        assert_eq!(done.status, WorkStatus::Completed);
        assert!(done.completed_at.is_some());

        store.run(|ks| {
            assert_eq!(ks.instance("w1").unwrap().current_load, 0);
        });

        // Re-delivery changes nothing.
        let again = queue
            .complete_task(&task.id, WorkStatus::Completed, None, Utc::now())
            .unwrap();
        assert_eq!(again.completed_at, done.completed_at);
        store.run(|ks| {
            assert_eq!(ks.instance("w1").unwrap().current_load, 0);
        });
    }

    #[tokio::test]
    async fn explicit_assign_overrides_queue_order() {
        let (_store, queue, manager) = setup();
        register(&manager, "w1", 2);
        let low = queue.create_task(None, "low".into(), 5, serde_json::Map::new(), Utc::now());
        queue.create_task(None, "high".into(), 95, serde_json::Map::new(), Utc::now());

        let assigned = queue.assign(&low.id, "w1", Utc::now()).unwrap();
        assert_eq!(assigned.id, low.id);
        assert_eq!(assigned.status, WorkStatus::InProgress);

        // The high-priority task is still first in line for a normal pull.
        let next = queue.try_claim("w1", Utc::now()).unwrap().unwrap();
        assert_eq!(next.text, "high");
    }
}
