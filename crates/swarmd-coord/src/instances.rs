//! Instance lifecycle: registration, heartbeats, failure detection, and
//! task reassignment.
//!
//! A periodic sweeper marks any instance whose heartbeat is older than
//! `offline_after` as OFFLINE and drains its queue through the store's
//! reassignment script, so no subtask outlives its worker. OFFLINE records
//! linger for `evict_after` so operators can see what died, then disappear.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use swarmd_store::{
    InstanceRecord, InstanceStatus, SpecialistKind, Store, instance_stream,
};

use crate::error::CoordResult;

/// Sweeper and TTL configuration.
#[derive(Debug, Clone)]
pub struct InstanceConfig {
    /// Heartbeat age past which an instance is declared OFFLINE.
    pub offline_after: Duration,
    /// Sweeper wake interval.
    pub sweep_interval: Duration,
    /// How long an OFFLINE record lingers before removal.
    pub evict_after: Duration,
    /// Default `max_load` when registration does not supply one.
    pub default_max_load: u32,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            offline_after: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(2),
            evict_after: Duration::from_secs(300),
            default_max_load: 3,
        }
    }
}

/// Registration input from `system.register`.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct RegisterRequest {
    pub id: String,
    pub roles: BTreeSet<SpecialistKind>,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    #[serde(default)]
    pub max_load: Option<u32>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// One sweep's outcome, for logs and tests.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct SweepReport {
    pub marked_offline: Vec<String>,
    pub reassigned_subtasks: usize,
    pub evicted: Vec<String>,
}

/// Manages worker instance lifecycle against the store.
#[derive(Clone)]
pub struct InstanceManager {
    store: Store,
    config: InstanceConfig,
    shutdown_tx: Arc<watch::Sender<bool>>,
}

impl InstanceManager {
    pub fn new(store: Store, config: InstanceConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            store,
            config,
            shutdown_tx: Arc::new(shutdown_tx),
        }
    }

    /// Register (or re-register) an instance. Re-registration refreshes the
    /// record but keeps any load the store still tracks for the id.
    pub fn register(&self, request: RegisterRequest, now: DateTime<Utc>) -> InstanceRecord {
        let max_load = request
            .max_load
            .unwrap_or(self.config.default_max_load)
            .max(1);

        let record = self.store.run(|ks| {
            let current_load = ks
                .instance(&request.id)
                .map(|existing| existing.current_load)
                .unwrap_or(0);

            let mut record = InstanceRecord {
                id: request.id.clone(),
                roles: request.roles.clone(),
                capabilities: request.capabilities.clone(),
                current_load,
                max_load,
                last_heartbeat: now,
                status: InstanceStatus::Idle,
                metadata: request.metadata.clone(),
                started_at: now,
            };
            record.recompute_status();

            ks.pool_remove(&record.id);
            ks.pool_add(&record);
            ks.instances.insert(record.id.clone(), record.clone());
            ks.incr_counter("instances_registered", 1);
            ks.emit(
                instance_stream(&record.id),
                "instance.registered",
                json!({
                    "instance_id": record.id,
                    "roles": record.roles,
                    "max_load": record.max_load,
                }),
                now,
            );
            record
        });

        info!(instance_id = %record.id, roles = ?record.roles, "instance registered");
        record
    }

    /// Refresh an instance's heartbeat, optionally merging transient
    /// metadata. Revives OFFLINE instances.
    pub fn heartbeat(
        &self,
        instance_id: &str,
        metadata: Option<serde_json::Map<String, serde_json::Value>>,
        now: DateTime<Utc>,
    ) -> CoordResult<InstanceStatus> {
        let status = self.store.run(|ks| {
            let instance = ks.instance_mut(instance_id)?;
            instance.last_heartbeat = now;
            if instance.status == InstanceStatus::Offline {
                debug!(instance_id, "offline instance revived by heartbeat");
                instance.status = InstanceStatus::Idle;
            }
            if let Some(metadata) = metadata {
                for (k, v) in metadata {
                    instance.metadata.insert(k, v);
                }
            }
            instance.recompute_status();
            Ok::<_, swarmd_store::StoreError>(instance.status)
        })?;
        Ok(status)
    }

    /// Explicitly remove an instance, reassigning anything it still holds.
    pub fn unregister(&self, instance_id: &str, now: DateTime<Utc>) -> CoordResult<usize> {
        let reassigned = self.store.run(|ks| {
            ks.instance(instance_id)?;
            let outcome = ks.reassign_from_instance(instance_id, now)?;
            ks.pool_remove(instance_id);
            ks.instances.remove(instance_id);
            ks.emit(
                instance_stream(instance_id),
                "instance.unregistered",
                json!({ "instance_id": instance_id }),
                now,
            );
            Ok::<_, swarmd_store::StoreError>(outcome.reassigned_count)
        })?;

        info!(instance_id, reassigned, "instance unregistered");
        Ok(reassigned)
    }

    /// One failure-detection pass: OFFLINE stale instances, reassign their
    /// work, evict long-dead records.
    pub fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let offline_after =
            chrono::Duration::from_std(self.config.offline_after).unwrap_or(chrono::Duration::zero());
        let evict_after =
            chrono::Duration::from_std(self.config.evict_after).unwrap_or(chrono::Duration::zero());

        self.store.run(|ks| {
            let mut report = SweepReport::default();

            let stale: Vec<String> = ks
                .instances
                .values()
                .filter(|i| i.status != InstanceStatus::Offline)
                .filter(|i| now - i.last_heartbeat > offline_after)
                .map(|i| i.id.clone())
                .collect();

            for id in stale {
                if let Ok(instance) = ks.instance_mut(&id) {
                    instance.status = InstanceStatus::Offline;
                }
                ks.emit(
                    instance_stream(&id),
                    "instance.offline",
                    json!({ "instance_id": id }),
                    now,
                );
                match ks.reassign_from_instance(&id, now) {
                    Ok(outcome) => report.reassigned_subtasks += outcome.reassigned_count,
                    Err(err) => warn!(instance_id = %id, error = %err, "reassignment failed"),
                }
                report.marked_offline.push(id);
            }

            let dead: Vec<String> = ks
                .instances
                .values()
                .filter(|i| i.status == InstanceStatus::Offline)
                .filter(|i| now - i.last_heartbeat > evict_after)
                .map(|i| i.id.clone())
                .collect();
            for id in dead {
                ks.pool_remove(&id);
                ks.instances.remove(&id);
                report.evicted.push(id);
            }

            if !report.marked_offline.is_empty() || !report.evicted.is_empty() {
                ks.incr_counter("sweeps_with_changes", 1);
            }
            report
        })
    }

    /// Spawn the background sweeper. Returns a handle that resolves after
    /// [`InstanceManager::shutdown`].
    pub fn start_sweeper(&self) -> JoinHandle<()> {
        let manager = self.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            info!(
                interval = ?manager.config.sweep_interval,
                offline_after = ?manager.config.offline_after,
                "instance sweeper started"
            );
            let mut ticker = tokio::time::interval(manager.config.sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let report = manager.sweep(Utc::now());
                        if !report.marked_offline.is_empty() {
                            warn!(
                                offline = ?report.marked_offline,
                                reassigned = report.reassigned_subtasks,
                                "sweeper marked instances offline"
                            );
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        info!("instance sweeper stopped");
                        break;
                    }
                }
            }
        })
    }

    /// Stop the background sweeper.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Snapshot of all instances for `system.get_state`.
    pub fn snapshot(&self) -> Vec<InstanceRecord> {
        self.store.run(|ks| {
            let mut all: Vec<InstanceRecord> = ks.instances.values().cloned().collect();
            all.sort_by(|a, b| a.id.cmp(&b.id));
            all
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use swarmd_store::{DecompositionPlan, PlannedSubtask, TaskRecord, WorkStatus};

    fn manager(offline_secs: u64) -> InstanceManager {
        InstanceManager::new(
            Store::default(),
            InstanceConfig {
                offline_after: Duration::from_secs(offline_secs),
                sweep_interval: Duration::from_millis(50),
                evict_after: Duration::from_secs(3600),
                default_max_load: 3,
            },
        )
    }

    fn request(id: &str) -> RegisterRequest {
        RegisterRequest {
            id: id.to_string(),
            roles: BTreeSet::from([SpecialistKind::General]),
            capabilities: BTreeSet::new(),
            max_load: None,
            metadata: serde_json::Map::new(),
        }
    }

    #[tokio::test]
    async fn register_heartbeat_unregister() {
        let mgr = manager(30);
        let record = mgr.register(request("w1"), Utc::now());
        assert_eq!(record.status, InstanceStatus::Idle);
        assert_eq!(record.max_load, 3);

        let status = mgr.heartbeat("w1", None, Utc::now()).unwrap();
        assert_eq!(status, InstanceStatus::Idle);

        let reassigned = mgr.unregister("w1", Utc::now()).unwrap();
        assert_eq!(reassigned, 0);
        assert!(mgr.heartbeat("w1", None, Utc::now()).is_err());
    }

    #[tokio::test]
    async fn sweep_marks_stale_offline_and_reassigns() {
        let mgr = manager(30);
        let store = mgr.store.clone();
        mgr.register(request("w1"), Utc::now());

        // Give w1 one assigned subtask.
        store.run(|ks| {
            ks.insert_task(TaskRecord::new("t1", "project", 50, Utc::now()));
            ks.decompose_and_store(
                "t1",
                &DecompositionPlan {
                    subtasks: vec![PlannedSubtask {
                        id: Some("A".into()),
                        description: "a".into(),
                        specialist: SpecialistKind::General,
                        complexity: 1,
                        estimated_minutes: 1,
                        dependencies: vec![],
                    }],
                    strategy: None,
                },
                Utc::now(),
            )
            .unwrap();
            ks.assign_to_specialist(
                "t1",
                "A",
                SpecialistKind::General,
                &BTreeSet::new(),
                Utc::now(),
            )
            .unwrap();
        });

        // Force the heartbeat stale.
        store.run(|ks| {
            ks.instance_mut("w1").unwrap().last_heartbeat =
                Utc::now() - chrono::Duration::seconds(120);
        });

        let report = mgr.sweep(Utc::now());
        assert_eq!(report.marked_offline, vec!["w1".to_string()]);
        assert_eq!(report.reassigned_subtasks, 1);

        store.run(|ks| {
            assert_eq!(ks.instance("w1").unwrap().status, InstanceStatus::Offline);
            assert!(ks.ready_contains("t1", "A"));
            assert_eq!(ks.subtask("t1", "A").unwrap().status, WorkStatus::Pending);
        });

        // A fresh sweep is a no-op.
        let report = mgr.sweep(Utc::now());
        assert!(report.marked_offline.is_empty());
    }

    #[tokio::test]
    async fn heartbeat_revives_offline_instance() {
        let mgr = manager(30);
        let store = mgr.store.clone();
        mgr.register(request("w1"), Utc::now());
        store.run(|ks| {
            ks.instance_mut("w1").unwrap().last_heartbeat =
                Utc::now() - chrono::Duration::seconds(120);
        });
        mgr.sweep(Utc::now());

        let status = mgr.heartbeat("w1", None, Utc::now()).unwrap();
        assert_eq!(status, InstanceStatus::Idle);
    }

    #[tokio::test]
    async fn eviction_removes_long_dead_records() {
        let mgr = InstanceManager::new(
            Store::default(),
            InstanceConfig {
                offline_after: Duration::from_secs(10),
                sweep_interval: Duration::from_millis(50),
                evict_after: Duration::from_secs(60),
                default_max_load: 3,
            },
        );
        mgr.register(request("w1"), Utc::now());
        mgr.store.run(|ks| {
            ks.instance_mut("w1").unwrap().last_heartbeat =
                Utc::now() - chrono::Duration::seconds(600);
        });

        // First sweep: offline. Second: evicted (heartbeat far past both
        // thresholds).
        let first = mgr.sweep(Utc::now());
        assert_eq!(first.marked_offline.len(), 1);
        let second = mgr.sweep(Utc::now());
        assert_eq!(second.evicted, vec!["w1".to_string()]);
        assert!(mgr.snapshot().is_empty());
    }

    #[tokio::test]
    async fn background_sweeper_runs_and_stops() {
        let mgr = manager(1);
        mgr.register(request("w1"), Utc::now());
        mgr.store.run(|ks| {
            ks.instance_mut("w1").unwrap().last_heartbeat =
                Utc::now() - chrono::Duration::seconds(60);
        });

        let handle = mgr.start_sweeper();
        tokio::time::sleep(Duration::from_millis(150)).await;

        let snapshot = mgr.snapshot();
        assert_eq!(snapshot[0].status, InstanceStatus::Offline);

        mgr.shutdown();
        handle.await.unwrap();
    }
}
