//! Atomic multi-key scripts.
//!
//! Each script is a method on [`Keyspace`] executed while the store guard is
//! held, so every multi-key transition here — graph install, assignment,
//! unblocking, reassignment — is serializable with respect to every other
//! script. Scripts journal their events inside the same critical section and
//! are idempotent under at-least-once delivery.

use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::error::{StoreError, StoreResult};
use crate::keyspace::Keyspace;
use crate::streams::{instance_stream, task_stream};
use crate::types::{
    AssignmentRecord, ConflictRecord, DecompositionPlan, DecompositionRecord, Proposal,
    SpecialistKind, SubtaskRecord, SubtaskResult, WorkStatus,
};

// ---------------------------------------------------------------------------
// Script outcomes
// ---------------------------------------------------------------------------

/// Result of installing a decomposition.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DecomposeOutcome {
    pub success: bool,
    pub subtask_count: usize,
    pub queued_count: usize,
}

/// Result of assigning a subtask to a specialist.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AssignOutcome {
    pub success: bool,
    pub specialist_id: String,
    pub score: i64,
    pub queue_position: usize,
}

/// Result of appending a conflict proposal.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ConflictOutcome {
    pub conflict_id: String,
    pub conflict_detected: bool,
    pub solution_count: usize,
}

/// Result of recording subtask progress.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProgressOutcome {
    pub success: bool,
    pub unblocked_count: usize,
    pub ready_for_synthesis: bool,
}

/// Result of draining a failed instance.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ReassignOutcome {
    pub reassigned_count: usize,
}

// ---------------------------------------------------------------------------
// Scripts
// ---------------------------------------------------------------------------

impl Keyspace {
    /// Install a decomposition for `parent_id`: subtask records, both
    /// dependency-set directions, and ready-queue inserts for
    /// dependency-free subtasks.
    ///
    /// Members of a dependency cycle are never queued; a fully cyclic graph
    /// installs with `queued_count == 0`. Re-delivery for an already-installed
    /// parent is a no-op returning the original counts.
    pub fn decompose_and_store(
        &mut self,
        parent_id: &str,
        plan: &DecompositionPlan,
        now: DateTime<Utc>,
    ) -> StoreResult<DecomposeOutcome> {
        // Idempotent re-delivery: the first install wins.
        if let Some(existing) = self.decompositions.get(parent_id) {
            return Ok(DecomposeOutcome {
                success: true,
                subtask_count: existing.subtask_count,
                queued_count: existing.queued_count,
            });
        }

        let priority = self.task(parent_id)?.priority;

        // Materialize ids and validate the sibling graph before touching
        // any state.
        let mut ids = Vec::with_capacity(plan.subtasks.len());
        let mut deps_by_id: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for (index, planned) in plan.subtasks.iter().enumerate() {
            let id = planned
                .id
                .clone()
                .unwrap_or_else(|| format!("st-{}", index + 1));
            if deps_by_id
                .insert(id.clone(), planned.dependencies.iter().cloned().collect())
                .is_some()
            {
                return Err(StoreError::InvalidArgument(format!(
                    "duplicate subtask id in decomposition: {id}"
                )));
            }
            ids.push(id);
        }
        for (id, deps) in &deps_by_id {
            for dep in deps {
                if !deps_by_id.contains_key(dep) {
                    return Err(StoreError::UnknownDependency {
                        subtask_id: id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        let cyclic = cycle_members(&deps_by_id);

        let mut total_complexity = 0u64;
        let mut queued = 0usize;
        for (planned, id) in plan.subtasks.iter().zip(&ids) {
            let deps = &deps_by_id[id];
            total_complexity += u64::from(planned.complexity);

            self.insert_subtask(SubtaskRecord {
                id: id.clone(),
                parent_id: parent_id.to_string(),
                description: planned.description.clone(),
                specialist: planned.specialist,
                complexity: planned.complexity,
                estimated_minutes: planned.estimated_minutes,
                dependencies: deps.clone(),
                status: WorkStatus::Pending,
                assigned_to: None,
                output: None,
                created_at: now,
                updated_at: now,
                completed_at: None,
            });

            if !deps.is_empty() {
                self.dependencies
                    .insert((parent_id.to_string(), id.clone()), deps.clone());
                for dep in deps {
                    self.dependents
                        .entry((parent_id.to_string(), dep.clone()))
                        .or_default()
                        .insert(id.clone());
                }
            }

            if cyclic.contains(id) {
                self.blocked.insert((parent_id.to_string(), id.clone()));
                self.emit(
                    task_stream(parent_id),
                    "subtask.blocked",
                    json!({ "subtask_id": id, "reason": "dependency_cycle" }),
                    now,
                );
            } else if deps.is_empty() {
                self.ready_push(priority, parent_id, id);
                queued += 1;
                self.emit(
                    task_stream(parent_id),
                    "subtask.ready",
                    json!({ "subtask_id": id, "priority": priority }),
                    now,
                );
            }
        }

        // A decomposed project is driven through its subtasks, not claimed
        // whole.
        self.pending_remove(parent_id);
        {
            let task = self.task_mut(parent_id)?;
            task.status = WorkStatus::InProgress;
            task.updated_at = now;
        }

        self.decompositions.insert(
            parent_id.to_string(),
            DecompositionRecord {
                task_id: parent_id.to_string(),
                subtask_ids: ids.clone(),
                strategy: plan.strategy.clone(),
                subtask_count: ids.len(),
                queued_count: queued,
                total_complexity,
                installed_at: now,
            },
        );

        self.incr_counter("decompositions_installed", 1);
        self.incr_counter("subtasks_created", ids.len() as u64);
        self.emit(
            task_stream(parent_id),
            "task.decomposed",
            json!({
                "task_id": parent_id,
                "subtask_count": ids.len(),
                "queued_count": queued,
                "cyclic": cyclic.iter().collect::<Vec<_>>(),
            }),
            now,
        );

        Ok(DecomposeOutcome {
            success: true,
            subtask_count: ids.len(),
            queued_count: queued,
        })
    }

    /// Pick the best specialist of `kind` for a subtask and dispatch to it.
    ///
    /// Candidates must have free capacity and a capability superset of
    /// `required_capabilities`; they are scored
    /// `matched_capabilities * 10 - current_load` and ties break toward the
    /// lighter-loaded, lexically-smaller instance. Re-delivery for an
    /// already-assigned subtask returns the existing assignment.
    pub fn assign_to_specialist(
        &mut self,
        parent_id: &str,
        subtask_id: &str,
        kind: SpecialistKind,
        required_capabilities: &BTreeSet<String>,
        now: DateTime<Utc>,
    ) -> StoreResult<AssignOutcome> {
        let status = self.subtask(parent_id, subtask_id)?.status;

        let key = (parent_id.to_string(), subtask_id.to_string());
        if let Some(existing) = self.assignments.get(&key) {
            let position = self
                .instance_queue(&existing.specialist_id)
                .iter()
                .position(|(p, s)| p == parent_id && s == subtask_id)
                .map(|p| p + 1)
                .unwrap_or(0);
            return Ok(AssignOutcome {
                success: true,
                specialist_id: existing.specialist_id.clone(),
                score: existing.score,
                queue_position: position,
            });
        }

        if status.is_terminal() {
            return Err(StoreError::InvalidTransition {
                entity: "subtask",
                id: format!("{parent_id}/{subtask_id}"),
                reason: format!("cannot assign a {} subtask", status.as_str()),
            });
        }

        let best = self
            .pool_view(kind)
            .into_iter()
            .filter(|s| s.current_load < s.max_load)
            .filter(|s| required_capabilities.iter().all(|c| s.capabilities.contains(c)))
            .filter(|s| self.instance(&s.id).map(|i| i.has_capacity()).unwrap_or(false))
            .map(|s| {
                let matched = s
                    .capabilities
                    .intersection(required_capabilities)
                    .count() as i64;
                let score = matched * 10 - i64::from(s.current_load);
                (score, s)
            })
            .max_by(|(sa, a), (sb, b)| {
                sa.cmp(sb)
                    .then(b.current_load.cmp(&a.current_load))
                    .then_with(|| b.id.cmp(&a.id))
            });

        let Some((score, chosen)) = best else {
            return Err(StoreError::NoneAvailable { kind });
        };

        {
            let instance = self.instance_mut(&chosen.id)?;
            instance.current_load += 1;
            instance.recompute_status();
        }

        let position = self.instance_enqueue(&chosen.id, parent_id, subtask_id);
        self.ready_remove(parent_id, subtask_id);

        {
            let subtask = self.subtask_mut(parent_id, subtask_id)?;
            subtask.status = WorkStatus::InProgress;
            subtask.assigned_to = Some(chosen.id.clone());
            subtask.updated_at = now;
        }

        self.assignments.insert(
            key,
            AssignmentRecord {
                parent_id: parent_id.to_string(),
                subtask_id: subtask_id.to_string(),
                specialist_id: chosen.id.clone(),
                kind,
                score,
                assigned_at: now,
            },
        );

        self.incr_counter("assignments", 1);
        self.emit(
            task_stream(parent_id),
            "subtask.assigned",
            json!({
                "subtask_id": subtask_id,
                "specialist_id": chosen.id,
                "kind": kind.as_str(),
                "score": score,
            }),
            now,
        );
        self.emit(
            instance_stream(&chosen.id),
            "instance.dispatched",
            json!({ "parent_id": parent_id, "subtask_id": subtask_id }),
            now,
        );

        Ok(AssignOutcome {
            success: true,
            specialist_id: chosen.id,
            score,
            queue_position: position,
        })
    }

    /// Append a proposal for `(task, subtask)`. The 1→2 transition emits the
    /// conflict-ready marker into the global conflict queue; later proposals
    /// keep appending without re-emitting.
    pub fn detect_and_queue_conflict(
        &mut self,
        task_id: &str,
        subtask_id: &str,
        proposal: Proposal,
        now: DateTime<Utc>,
    ) -> StoreResult<ConflictOutcome> {
        // The subtask must exist; a proposal against nothing is a client bug.
        self.subtask(task_id, subtask_id)?;

        let key = (task_id.to_string(), subtask_id.to_string());
        let conflict = self.conflicts.entry(key.clone()).or_insert_with(|| ConflictRecord {
            id: uuid::Uuid::now_v7().to_string(),
            task_id: task_id.to_string(),
            subtask_id: subtask_id.to_string(),
            proposals: Vec::new(),
            resolution: None,
            created_at: now,
        });

        conflict.proposals.push(proposal);
        let solution_count = conflict.proposals.len();
        let conflict_id = conflict.id.clone();

        if solution_count == 2 {
            self.conflict_queue.push_back(key);
            self.incr_counter("conflicts_detected", 1);
            self.emit(
                task_stream(task_id),
                "conflict.detected",
                json!({
                    "conflict_id": conflict_id,
                    "subtask_id": subtask_id,
                    "solution_count": solution_count,
                }),
                now,
            );
        }

        Ok(ConflictOutcome {
            conflict_id,
            conflict_detected: solution_count >= 2,
            solution_count,
        })
    }

    /// Record a terminal subtask result: release the specialist, unblock any
    /// dependents whose predecessors are now all completed, and report
    /// whether the whole parent is ready for synthesis.
    ///
    /// Re-delivery for an already-terminal subtask returns `success = true`
    /// without changing state.
    pub fn synthesize_progress(
        &mut self,
        parent_id: &str,
        subtask_id: &str,
        result: &SubtaskResult,
        now: DateTime<Utc>,
    ) -> StoreResult<ProgressOutcome> {
        if !result.status.is_terminal() {
            return Err(StoreError::InvalidArgument(format!(
                "subtask result status must be terminal, got {}",
                result.status.as_str()
            )));
        }

        if self.subtask(parent_id, subtask_id)?.status.is_terminal() {
            return Ok(ProgressOutcome {
                success: true,
                unblocked_count: 0,
                ready_for_synthesis: self.all_subtasks_completed(parent_id),
            });
        }

        {
            let subtask = self.subtask_mut(parent_id, subtask_id)?;
            subtask.status = result.status;
            subtask.output = result.output.clone();
            subtask.completed_at = Some(now);
            subtask.updated_at = now;
        }

        // Release the owning specialist.
        let key = (parent_id.to_string(), subtask_id.to_string());
        if let Some(assignment) = self.assignments.remove(&key) {
            self.instance_queue_remove(&assignment.specialist_id, parent_id, subtask_id);
            if let Ok(instance) = self.instance_mut(&assignment.specialist_id) {
                instance.current_load = instance.current_load.saturating_sub(1);
                instance.recompute_status();
            }
        }

        let priority = self.task(parent_id)?.priority;
        let dependents: Vec<String> = self
            .dependents_of(parent_id, subtask_id)
            .map(|d| d.iter().cloned().collect())
            .unwrap_or_default();

        let mut unblocked = 0usize;
        match result.status {
            WorkStatus::Completed => {
                for dependent in &dependents {
                    let eligible = self
                        .subtask(parent_id, dependent)
                        .map(|s| s.status == WorkStatus::Pending)
                        .unwrap_or(false)
                        && self.deps_satisfied(parent_id, dependent)
                        && !self.ready_contains(parent_id, dependent)
                        && !self.dispatched_anywhere(parent_id, dependent);
                    if eligible {
                        self.ready_push(priority, parent_id, dependent);
                        unblocked += 1;
                        self.emit(
                            task_stream(parent_id),
                            "subtask.unblocked",
                            json!({ "subtask_id": dependent, "completed_dependency": subtask_id }),
                            now,
                        );
                    }
                }
                self.incr_counter("subtasks_completed", 1);
                self.emit(
                    task_stream(parent_id),
                    "subtask.completed",
                    json!({ "subtask_id": subtask_id }),
                    now,
                );
            }
            WorkStatus::Failed => {
                for dependent in &dependents {
                    let pending = self
                        .subtask(parent_id, dependent)
                        .map(|s| !s.status.is_terminal())
                        .unwrap_or(false);
                    if pending {
                        self.blocked
                            .insert((parent_id.to_string(), dependent.clone()));
                        self.emit(
                            task_stream(parent_id),
                            "subtask.blocked",
                            json!({ "subtask_id": dependent, "failed_dependency": subtask_id }),
                            now,
                        );
                    }
                }
                self.incr_counter("subtasks_failed", 1);
                self.emit(
                    task_stream(parent_id),
                    "subtask.failed",
                    json!({ "subtask_id": subtask_id }),
                    now,
                );
            }
            _ => unreachable!("terminal status checked above"),
        }

        self.task_mut(parent_id)?.updated_at = now;

        let ready_for_synthesis = self.all_subtasks_completed(parent_id);
        if ready_for_synthesis {
            self.emit(
                task_stream(parent_id),
                "task.ready_for_synthesis",
                json!({ "task_id": parent_id }),
                now,
            );
        }

        Ok(ProgressOutcome {
            success: true,
            unblocked_count: unblocked,
            ready_for_synthesis,
        })
    }

    /// Drain a failed instance's queue: clear assignments, give the load
    /// back, and either re-queue each subtask (dependencies satisfied,
    /// priority preserved) or park it in the blocked set.
    pub fn reassign_from_instance(
        &mut self,
        instance_id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<ReassignOutcome> {
        let drained: Vec<(String, String)> = self
            .instance_queues
            .remove(instance_id)
            .map(|queue| queue.into_iter().collect())
            .unwrap_or_default();

        for (parent_id, subtask_id) in &drained {
            self.assignments
                .remove(&(parent_id.clone(), subtask_id.clone()));

            if let Ok(instance) = self.instance_mut(instance_id) {
                instance.current_load = instance.current_load.saturating_sub(1);
            }

            let still_open = {
                let subtask = self.subtask_mut(parent_id, subtask_id)?;
                if subtask.status.is_terminal() {
                    false
                } else {
                    subtask.status = WorkStatus::Pending;
                    subtask.assigned_to = None;
                    subtask.updated_at = now;
                    true
                }
            };
            if !still_open {
                continue;
            }

            let priority = self.task(parent_id)?.priority;
            if self.deps_satisfied(parent_id, subtask_id) {
                self.ready_push(priority, parent_id, subtask_id);
            } else {
                self.blocked
                    .insert((parent_id.clone(), subtask_id.clone()));
            }
            self.emit(
                task_stream(parent_id),
                "subtask.reassigned",
                json!({ "subtask_id": subtask_id, "from_instance": instance_id }),
                now,
            );
        }

        // Whole tasks the instance had claimed (never decomposed) go back
        // to the pending queue.
        let claimed: Vec<(String, u8)> = self
            .tasks
            .values()
            .filter(|t| t.status == WorkStatus::InProgress)
            .filter(|t| !self.decompositions.contains_key(&t.id))
            .filter(|t| {
                t.metadata
                    .get("claimed_by")
                    .and_then(|v| v.as_str())
                    .is_some_and(|holder| holder == instance_id)
            })
            .map(|t| (t.id.clone(), t.priority))
            .collect();
        let requeued = claimed.len();
        for (task_id, priority) in claimed {
            {
                let task = self.task_mut(&task_id)?;
                task.status = WorkStatus::Pending;
                task.metadata.remove("claimed_by");
                task.updated_at = now;
            }
            self.pending_push(&task_id, priority);
            if let Ok(instance) = self.instance_mut(instance_id) {
                instance.current_load = instance.current_load.saturating_sub(1);
            }
            self.emit(
                task_stream(&task_id),
                "task.requeued",
                json!({ "task_id": task_id, "from_instance": instance_id }),
                now,
            );
        }

        if let Ok(instance) = self.instance_mut(instance_id) {
            instance.recompute_status();
        }

        let reassigned_count = drained.len() + requeued;
        if reassigned_count > 0 {
            self.incr_counter("reassignments", reassigned_count as u64);
            self.emit(
                instance_stream(instance_id),
                "instance.drained",
                json!({ "instance_id": instance_id, "reassigned": reassigned_count }),
                now,
            );
        }

        Ok(ReassignOutcome { reassigned_count })
    }

    /// True iff the parent has at least one subtask and every subtask is
    /// completed.
    pub fn all_subtasks_completed(&self, parent_id: &str) -> bool {
        let subtasks = self.subtasks_of(parent_id);
        !subtasks.is_empty()
            && subtasks
                .iter()
                .all(|s| s.status == WorkStatus::Completed)
    }
}

/// Subtask ids that participate in (or are trapped behind) a dependency
/// cycle, computed with a single Kahn elimination pass: whatever cannot be
/// topologically eliminated is cyclic or downstream of a cycle.
fn cycle_members(deps_by_id: &BTreeMap<String, BTreeSet<String>>) -> BTreeSet<String> {
    let mut indegree: BTreeMap<&str, usize> = deps_by_id
        .iter()
        .map(|(id, deps)| (id.as_str(), deps.len()))
        .collect();
    let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for (id, deps) in deps_by_id {
        for dep in deps {
            dependents.entry(dep.as_str()).or_default().push(id.as_str());
        }
    }

    let mut frontier: VecDeque<&str> = indegree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(id, _)| *id)
        .collect();

    while let Some(id) = frontier.pop_front() {
        for dependent in dependents.get(id).into_iter().flatten() {
            let d = indegree.get_mut(dependent).expect("dependent is a known id");
            *d -= 1;
            if *d == 0 {
                frontier.push_back(dependent);
            }
        }
    }

    indegree
        .into_iter()
        .filter(|(_, d)| *d > 0)
        .map(|(id, _)| id.to_string())
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
