//! Swarm coordination phases: decompose, context, resolve, synthesize.
//!
//! Each phase calls the sampling provider at most once per invocation, then
//! commits its result through the store's atomic scripts. Every phase is
//! idempotent — the final state write keys on `(task, phase)` (the installed
//! decomposition, the `context_{subtask}` attachment, the conflict's
//! resolution, the `synthesis_{task}` attachment) — so at-least-once
//! delivery and retries are safe. A deterministic fallback stands in
//! whenever the provider is unreachable or returns an invalid shape: a
//! submitted project never wedges.

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{info, instrument, warn};

use swarmd_store::{
    AttachmentPayload, AttachmentRecord, DecomposeOutcome, DecompositionPlan, PlannedSubtask,
    Proposal, Resolution, Sink, SpecialistKind, Store, StoreError, TaskRecord, WorkStatus,
    task_stream,
};

use crate::error::{CoordError, CoordResult};
use crate::sampling::{
    CompletedWork, ContextBrief, ContextRequest, DecomposeRequest, IntegrationStatus, PoolEntry,
    ResolveRequest, SamplingClient, SynthesisReport, SynthesizeRequest,
};
use crate::templates::TemplateEngine;

/// Outcome of `swarm.decompose`, including whether the deterministic
/// fallback replaced the provider.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DecomposeSummary {
    pub success: bool,
    pub subtask_count: usize,
    pub queued_count: usize,
    pub fallback_used: bool,
    pub latency_ms: u64,
}

/// Orchestrates the LLM-driven phases against the store.
#[derive(Clone)]
pub struct SwarmCoordinator {
    store: Store,
    sink: Sink,
    sampling: SamplingClient,
    templates: TemplateEngine,
}

impl SwarmCoordinator {
    pub fn new(store: Store, sink: Sink, sampling: SamplingClient) -> CoordResult<Self> {
        Ok(Self {
            store,
            sink,
            sampling,
            templates: TemplateEngine::new()?,
        })
    }

    // -- Decompose -----------------------------------------------------------

    /// Decompose a project into subtasks and install the dependency graph.
    ///
    /// Creates the parent task when it does not exist yet. Re-delivery for an
    /// already-decomposed parent is a no-op reporting the original counts.
    #[instrument(skip(self, text, constraints))]
    pub async fn decompose(
        &self,
        task_id: &str,
        text: &str,
        priority: u8,
        constraints: Option<serde_json::Value>,
        now: DateTime<Utc>,
    ) -> CoordResult<DecomposeSummary> {
        let started = tokio::time::Instant::now();

        // Ensure the parent exists; pull the pool snapshot in the same pass.
        let (already, specialists) = self.store.run(|ks| {
            if ks.task(task_id).is_err() {
                ks.insert_task(TaskRecord::new(task_id, text, priority, now));
                ks.emit(
                    task_stream(task_id),
                    "task.create",
                    json!({ "task_id": task_id, "priority": priority }),
                    now,
                );
            }
            let already = ks.decompositions.contains_key(task_id);
            let mut pool = Vec::new();
            for kind in SpecialistKind::ALL {
                for view in ks.pool_view(kind) {
                    pool.push(PoolEntry::from_view(kind.as_str(), &view));
                }
            }
            (already, pool)
        });

        if already {
            let outcome = self.install(task_id, &DecompositionPlan {
                subtasks: Vec::new(),
                strategy: None,
            }, now)?;
            return Ok(DecomposeSummary {
                success: outcome.success,
                subtask_count: outcome.subtask_count,
                queued_count: outcome.queued_count,
                fallback_used: false,
                latency_ms: started.elapsed().as_millis() as u64,
            });
        }

        let prompt = self.templates.decompose_prompt(
            task_id,
            text,
            priority,
            constraints.as_ref(),
            &specialists,
        )?;
        let request = DecomposeRequest {
            task_id: task_id.to_string(),
            text: text.to_string(),
            priority,
            constraints,
            specialists,
            prompt,
        };

        let (plan, fallback_used) = match self.sampling.decompose(&request).await {
            Ok(plan) if !plan.subtasks.is_empty() => (plan, false),
            Ok(_) => {
                warn!(task_id, "provider returned an empty decomposition, using fallback");
                (fallback_plan(text), true)
            }
            Err(err) => {
                warn!(task_id, error = %err, "sampling decompose failed, using fallback");
                (fallback_plan(text), true)
            }
        };

        let outcome = match self.install(task_id, &plan, now) {
            Ok(outcome) => outcome,
            // A structurally invalid provider plan (unknown dependency,
            // duplicate id) degrades to the fallback rather than wedging
            // the project.
            Err(CoordError::Store(
                err @ (StoreError::UnknownDependency { .. } | StoreError::InvalidArgument(_)),
            )) => {
                warn!(task_id, error = %err, "provider plan rejected, using fallback");
                self.install(task_id, &fallback_plan(text), now)?
            }
            Err(err) => return Err(err),
        };

        let latency_ms = started.elapsed().as_millis() as u64;
        let total_complexity: u64 = plan.subtasks.iter().map(|s| u64::from(s.complexity)).sum();
        self.store.run(|ks| {
            ks.incr_counter("decompose_calls", 1);
            ks.incr_counter("decompose_latency_ms_total", latency_ms);
            ks.incr_counter("decompose_complexity_total", total_complexity);
        });

        // Write-through to the archive.
        let (task, subtasks) = self.store.run(|ks| {
            let task = ks.task(task_id).cloned();
            let subtasks: Vec<_> = ks.subtasks_of(task_id).into_iter().cloned().collect();
            (task, subtasks)
        });
        if let Ok(task) = task {
            if let Err(err) = self.sink.archive_task(&task).await {
                warn!(task_id, error = %err, "task archive failed");
            }
        }
        for subtask in &subtasks {
            if let Err(err) = self.sink.archive_subtask(subtask).await {
                warn!(task_id, subtask_id = %subtask.id, error = %err, "subtask archive failed");
            }
        }

        info!(
            task_id,
            subtask_count = outcome.subtask_count,
            queued = outcome.queued_count,
            fallback_used,
            "decomposition installed"
        );

        Ok(DecomposeSummary {
            success: outcome.success,
            subtask_count: outcome.subtask_count,
            queued_count: outcome.queued_count,
            fallback_used,
            latency_ms,
        })
    }

    fn install(
        &self,
        task_id: &str,
        plan: &DecompositionPlan,
        now: DateTime<Utc>,
    ) -> CoordResult<DecomposeOutcome> {
        Ok(self
            .store
            .run(|ks| ks.decompose_and_store(task_id, plan, now))?)
    }

    // -- Context -------------------------------------------------------------

    /// Produce (or return the cached) execution brief for one subtask.
    ///
    /// Generated once per subtask and cached as the `context_{subtask}`
    /// attachment on the parent.
    #[instrument(skip(self))]
    pub async fn context(
        &self,
        parent_task_id: &str,
        subtask_id: &str,
        now: DateTime<Utc>,
    ) -> CoordResult<String> {
        let attachment_key = format!("context_{subtask_id}");

        let (cached, subtask, completed) = self.store.run(|ks| {
            let cached = ks
                .attachment(parent_task_id, &attachment_key)
                .and_then(|a| match &a.payload {
                    AttachmentPayload::Markdown { content } => Some(content.clone()),
                    _ => None,
                });
            let subtask = ks.subtask(parent_task_id, subtask_id).cloned();
            let completed: Vec<CompletedWork> = ks
                .subtasks_of(parent_task_id)
                .into_iter()
                .filter(|s| s.status == WorkStatus::Completed)
                .map(|s| CompletedWork {
                    subtask_id: s.id.clone(),
                    specialist: s.specialist.as_str().to_string(),
                    output: s.output.clone().unwrap_or_default(),
                })
                .collect();
            (cached, subtask, completed)
        });

        if let Some(brief) = cached {
            return Ok(brief);
        }
        let subtask = subtask?;

        let request = ContextRequest {
            subtask_id: subtask_id.to_string(),
            parent_task_id: parent_task_id.to_string(),
            specialist: subtask.specialist.as_str().to_string(),
            description: subtask.description.clone(),
            completed_work: completed,
        };

        let brief = match self.sampling.context(&request).await {
            Ok(brief) => brief,
            Err(err) => {
                warn!(subtask_id, error = %err, "sampling context failed, using fallback brief");
                fallback_brief(&subtask.description)
            }
        };

        let rendered = self.templates.execution_brief(
            subtask_id,
            subtask.specialist.as_str(),
            parent_task_id,
            &brief,
        )?;

        self.put_attachment(
            parent_task_id,
            &attachment_key,
            AttachmentPayload::Markdown {
                content: rendered.clone(),
            },
            None,
            now,
        )
        .await?;

        Ok(rendered)
    }

    // -- Resolve -------------------------------------------------------------

    /// Arbitrate a conflict: pick one proposal, write it into the subtask
    /// record, and notify the losing specialists via the event bus.
    #[instrument(skip(self, context))]
    pub async fn resolve(
        &self,
        task_id: &str,
        subtask_id: &str,
        context: Option<serde_json::Value>,
        now: DateTime<Utc>,
    ) -> CoordResult<Resolution> {
        let (conflict_id, proposals, existing) = self.store.run(|ks| {
            let key = (task_id.to_string(), subtask_id.to_string());
            match ks.conflicts.get(&key) {
                Some(conflict) => Ok((
                    conflict.id.clone(),
                    conflict.proposals.clone(),
                    conflict.resolution.clone(),
                )),
                None => Err(StoreError::ConflictNotFound {
                    conflict_id: format!("{task_id}/{subtask_id}"),
                }),
            }
        })?;

        // Idempotent: the first arbitration wins.
        if let Some(resolution) = existing {
            return Ok(resolution);
        }

        let request = ResolveRequest {
            conflict_id: conflict_id.clone(),
            task_id: task_id.to_string(),
            subtask_id: subtask_id.to_string(),
            solutions: proposals.clone(),
            context,
        };

        let choice = match self.sampling.resolve(&request).await {
            Ok(choice)
                if proposals
                    .iter()
                    .any(|p| p.instance_id == choice.chosen_instance_id) =>
            {
                choice
            }
            Ok(choice) => {
                warn!(
                    conflict_id,
                    chosen = %choice.chosen_instance_id,
                    "provider chose an unknown instance, falling back to first proposal"
                );
                fallback_choice(&proposals)
            }
            Err(err) => {
                warn!(conflict_id, error = %err, "sampling resolve failed, using fallback");
                fallback_choice(&proposals)
            }
        };

        let resolution = Resolution {
            chosen_instance_id: choice.chosen_instance_id.clone(),
            reasoning: choice.reasoning,
            recommendations: choice.recommendations,
            resolved_at: now,
        };

        let resolution = self.store.run(|ks| {
            let key = (task_id.to_string(), subtask_id.to_string());

            // The winning proposal's content lands on the subtask record.
            let chosen = ks
                .conflicts
                .get(&key)
                .and_then(|c| {
                    c.proposals
                        .iter()
                        .find(|p| p.instance_id == resolution.chosen_instance_id)
                        .cloned()
                });
            if let Some(chosen) = chosen {
                if let Ok(subtask) = ks.subtask_mut(task_id, subtask_id) {
                    if !subtask.status.is_terminal() {
                        subtask.output = Some(chosen.code.unwrap_or(chosen.approach));
                        subtask.updated_at = now;
                    }
                }
            }

            if let Some(conflict) = ks.conflicts.get_mut(&key) {
                conflict.resolution = Some(resolution.clone());
            }
            ks.conflict_queue.retain(|k| k != &key);
            ks.incr_counter("conflicts_resolved", 1);
            ks.emit(
                task_stream(task_id),
                "conflict.resolved",
                json!({
                    "conflict_id": conflict_id,
                    "subtask_id": subtask_id,
                    "chosen_instance_id": resolution.chosen_instance_id,
                    "recommendations": resolution.recommendations,
                }),
                now,
            );
            resolution.clone()
        });

        Ok(resolution)
    }

    /// Resolve by conflict id alone (the RPC surface accepts either shape).
    pub async fn resolve_by_id(
        &self,
        conflict_id: &str,
        context: Option<serde_json::Value>,
        now: DateTime<Utc>,
    ) -> CoordResult<Resolution> {
        let key = self.store.run(|ks| {
            ks.conflicts
                .iter()
                .find(|(_, c)| c.id == conflict_id)
                .map(|(key, _)| key.clone())
        });
        let Some((task_id, subtask_id)) = key else {
            return Err(CoordError::Store(StoreError::ConflictNotFound {
                conflict_id: conflict_id.to_string(),
            }));
        };
        self.resolve(&task_id, &subtask_id, context, now).await
    }

    // -- Synthesize ----------------------------------------------------------

    /// Produce the integration report for a parent whose subtasks are all
    /// terminal. Completes (or fails) the parent task and attaches the
    /// report; re-delivery returns the stored report.
    #[instrument(skip(self))]
    pub async fn synthesize(
        &self,
        task_id: &str,
        now: DateTime<Utc>,
    ) -> CoordResult<SynthesisReport> {
        let attachment_key = format!("synthesis_{task_id}");

        let (cached, task, subtasks) = self.store.run(|ks| {
            let cached = ks
                .attachment(task_id, &attachment_key)
                .and_then(|a| match &a.payload {
                    AttachmentPayload::Json { value } => {
                        serde_json::from_value::<SynthesisReport>(value["report"].clone()).ok()
                    }
                    _ => None,
                });
            let task = ks.task(task_id).cloned();
            let subtasks: Vec<_> = ks.subtasks_of(task_id).into_iter().cloned().collect();
            (cached, task, subtasks)
        });
        if let Some(report) = cached {
            return Ok(report);
        }
        let task = task?;

        let failed: Vec<&str> = subtasks
            .iter()
            .filter(|s| s.status == WorkStatus::Failed)
            .map(|s| s.id.as_str())
            .collect();
        let outstanding: Vec<&str> = subtasks
            .iter()
            .filter(|s| !s.status.is_terminal())
            .map(|s| s.id.as_str())
            .collect();

        let report = if failed.is_empty() && outstanding.is_empty() && !subtasks.is_empty() {
            let completed: Vec<CompletedWork> = subtasks
                .iter()
                .map(|s| CompletedWork {
                    subtask_id: s.id.clone(),
                    specialist: s.specialist.as_str().to_string(),
                    output: s.output.clone().unwrap_or_default(),
                })
                .collect();
            let request = SynthesizeRequest {
                task_id: task_id.to_string(),
                text: task.text.clone(),
                completed_subtasks: completed,
            };
            match self.sampling.synthesize(&request).await {
                Ok(report) => report,
                Err(err) => {
                    warn!(task_id, error = %err, "sampling synthesize failed, using fallback");
                    fallback_synthesis(&subtasks.iter().map(|s| s.id.as_str()).collect::<Vec<_>>())
                }
            }
        } else if !failed.is_empty() {
            // Failed subtasks: report the damage, including dependents that
            // will never unblock.
            let blocked = self.store.run(|ks| {
                let mut blocked: Vec<String> = ks
                    .blocked
                    .iter()
                    .filter(|(parent, _)| parent == task_id)
                    .map(|(_, sub)| sub.clone())
                    .collect();
                blocked.sort();
                blocked
            });
            SynthesisReport {
                status: IntegrationStatus::RequiresFixes,
                integration_steps: Vec::new(),
                next_actions: failed
                    .iter()
                    .map(|id| format!("rework failed subtask {id}"))
                    .chain(blocked.iter().map(|id| format!("unblock dependent {id}")))
                    .collect(),
                summary: Some(format!(
                    "{} subtask(s) failed; {} dependent(s) blocked",
                    failed.len(),
                    blocked.len()
                )),
            }
        } else {
            return Err(CoordError::NotReadyForSynthesis {
                task_id: task_id.to_string(),
            });
        };

        let markdown = self.templates.synthesis_summary(task_id, &report)?;
        self.put_attachment(
            task_id,
            &attachment_key,
            AttachmentPayload::Json {
                value: json!({ "report": report, "markdown": markdown }),
            },
            None,
            now,
        )
        .await?;

        let final_status = if report.status == IntegrationStatus::RequiresFixes {
            WorkStatus::Failed
        } else {
            WorkStatus::Completed
        };
        let task = self.store.run(|ks| {
            let task = ks.task_mut(task_id)?;
            if !task.status.is_terminal() {
                task.finish(final_status, now);
            }
            let task = task.clone();
            ks.incr_counter("tasks_synthesized", 1);
            ks.emit(
                task_stream(task_id),
                "task.synthesized",
                json!({ "task_id": task_id, "status": report.status }),
                now,
            );
            Ok::<_, StoreError>(task)
        })?;
        if let Err(err) = self.sink.archive_task(&task).await {
            warn!(task_id, error = %err, "task archive failed");
        }

        Ok(report)
    }

    // -- Attachments ---------------------------------------------------------

    /// Store an attachment in the keyspace and write it through to the sink.
    /// Sink failure fails the whole operation — no partial success.
    pub async fn put_attachment(
        &self,
        task_id: &str,
        key: &str,
        payload: AttachmentPayload,
        created_by: Option<String>,
        now: DateTime<Utc>,
    ) -> CoordResult<AttachmentRecord> {
        let record = AttachmentRecord {
            id: uuid::Uuid::now_v7().to_string(),
            task_id: task_id.to_string(),
            key: key.to_string(),
            payload,
            created_at: now,
            created_by,
        };

        self.store.run(|ks| {
            ks.task(task_id)?;
            Ok::<_, StoreError>(())
        })?;

        // The sink is the durability boundary: write it first so an archive
        // failure never leaves a keyspace copy the archive does not have.
        self.sink.put_attachment(&record).await?;

        self.store.run(|ks| {
            ks.put_attachment(record.clone());
            ks.incr_counter("attachments_created", 1);
            ks.emit(
                task_stream(task_id),
                "task.attachment_created",
                json!({ "task_id": task_id, "key": key }),
                now,
            );
        });

        Ok(record)
    }

    /// Fetch an attachment, reading through to the sink (and re-hydrating
    /// the keyspace) when the in-store copy is missing.
    pub async fn get_attachment(
        &self,
        task_id: &str,
        key: &str,
    ) -> CoordResult<AttachmentRecord> {
        if let Some(record) = self.store.run(|ks| ks.attachment(task_id, key).cloned()) {
            return Ok(record);
        }

        match self.sink.get_attachment(task_id, key).await? {
            Some(record) => {
                self.store.run(|ks| ks.put_attachment(record.clone()));
                Ok(record)
            }
            None => Err(CoordError::Store(StoreError::AttachmentNotFound {
                task_id: task_id.to_string(),
                key: key.to_string(),
            })),
        }
    }
}

// ---------------------------------------------------------------------------
// Deterministic fallbacks
// ---------------------------------------------------------------------------

/// One general subtask covering the whole project.
fn fallback_plan(text: &str) -> DecompositionPlan {
    DecompositionPlan {
        subtasks: vec![PlannedSubtask {
            id: Some("st-1".to_string()),
            description: text.to_string(),
            specialist: SpecialistKind::General,
            complexity: 5,
            estimated_minutes: 60,
            dependencies: Vec::new(),
        }],
        strategy: Some("single general subtask (provider unavailable)".to_string()),
    }
}

/// A minimal brief derived from the subtask description.
fn fallback_brief(description: &str) -> ContextBrief {
    ContextBrief {
        scope: description.to_string(),
        mandatory_readings: Vec::new(),
        architecture_constraints: Vec::new(),
        success_criteria: vec!["implements the described scope".to_string()],
        related_work: Vec::new(),
    }
}

/// First proposal wins when arbitration is unavailable.
fn fallback_choice(proposals: &[Proposal]) -> crate::sampling::ResolutionChoice {
    crate::sampling::ResolutionChoice {
        chosen_instance_id: proposals
            .first()
            .map(|p| p.instance_id.clone())
            .unwrap_or_default(),
        reasoning: "earliest proposal chosen (arbitration unavailable)".to_string(),
        recommendations: Vec::new(),
    }
}

/// Conservative synthesis verdict listing every completed subtask.
fn fallback_synthesis(subtask_ids: &[&str]) -> SynthesisReport {
    SynthesisReport {
        status: IntegrationStatus::ReadyForIntegration,
        integration_steps: subtask_ids
            .iter()
            .map(|id| format!("integrate output of {id}"))
            .collect(),
        next_actions: vec!["review integrated output".to_string()],
        summary: Some("synthesis provider unavailable; manual integration checklist".to_string()),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampling::SamplingConfig;
    use std::time::Duration;
    use swarmd_store::SubtaskResult;
    use url::Url;

    /// Coordinator wired to an unreachable provider: every phase exercises
    /// its deterministic fallback.
    fn coordinator() -> SwarmCoordinator {
        let mut config = SamplingConfig::new(Url::parse("http://127.0.0.1:1/").unwrap());
        config.max_attempts = 1;
        config.backoff_base = Duration::from_millis(1);
        SwarmCoordinator::new(
            Store::default(),
            Sink::open_in_memory().unwrap(),
            SamplingClient::new(config).unwrap(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn decompose_falls_back_to_single_subtask() {
        let coord = coordinator();
        let summary = coord
            .decompose("t1", "build a parser", 50, None, Utc::now())
            .await
            .unwrap();

        assert!(summary.success);
        assert!(summary.fallback_used);
        assert_eq!(summary.subtask_count, 1);
        assert_eq!(summary.queued_count, 1);

        coord.store.run(|ks| {
            let subtask = ks.subtask("t1", "st-1").unwrap();
            assert_eq!(subtask.specialist, SpecialistKind::General);
            assert!(ks.ready_contains("t1", "st-1"));
        });
    }

    #[tokio::test]
    async fn decompose_redelivery_is_noop() {
        let coord = coordinator();
        let first = coord
            .decompose("t1", "build", 50, None, Utc::now())
            .await
            .unwrap();
        let second = coord
            .decompose("t1", "build", 50, None, Utc::now())
            .await
            .unwrap();

        assert_eq!(second.subtask_count, first.subtask_count);
        assert_eq!(second.queued_count, first.queued_count);
        coord.store.run(|ks| assert_eq!(ks.subtasks_of("t1").len(), 1));
    }

    #[tokio::test]
    async fn context_is_generated_once_and_cached() {
        let coord = coordinator();
        coord
            .decompose("t1", "build", 50, None, Utc::now())
            .await
            .unwrap();

        let first = coord.context("t1", "st-1", Utc::now()).await.unwrap();
        assert!(first.contains("Execution brief: st-1"));

        let second = coord.context("t1", "st-1", Utc::now()).await.unwrap();
        assert_eq!(first, second);

        coord.store.run(|ks| {
            assert!(ks.attachment("t1", "context_st-1").is_some());
        });
    }

    #[tokio::test]
    async fn resolve_picks_first_proposal_on_fallback() {
        let coord = coordinator();
        coord
            .decompose("t1", "build", 50, None, Utc::now())
            .await
            .unwrap();

        let proposal = |who: &str| Proposal {
            instance_id: who.to_string(),
            approach: format!("{who}'s way"),
            reasoning: "works".into(),
            code: None,
            submitted_at: Utc::now(),
        };
        coord.store.run(|ks| {
            ks.detect_and_queue_conflict("t1", "st-1", proposal("w1"), Utc::now())
                .unwrap();
            ks.detect_and_queue_conflict("t1", "st-1", proposal("w2"), Utc::now())
                .unwrap();
        });

        let resolution = coord.resolve("t1", "st-1", None, Utc::now()).await.unwrap();
        assert_eq!(resolution.chosen_instance_id, "w1");

        // Chosen proposal written into the subtask; queue drained.
        coord.store.run(|ks| {
            assert_eq!(
                ks.subtask("t1", "st-1").unwrap().output.as_deref(),
                Some("w1's way")
            );
            assert!(ks.conflict_queue.is_empty());
        });

        // Idempotent re-delivery.
        let again = coord.resolve("t1", "st-1", None, Utc::now()).await.unwrap();
        assert_eq!(again.chosen_instance_id, "w1");
        assert_eq!(again.resolved_at, resolution.resolved_at);
    }

    #[tokio::test]
    async fn resolve_by_id_finds_the_conflict() {
        let coord = coordinator();
        coord
            .decompose("t1", "build", 50, None, Utc::now())
            .await
            .unwrap();
        let conflict_id = coord.store.run(|ks| {
            let p = Proposal {
                instance_id: "w1".into(),
                approach: "a".into(),
                reasoning: "r".into(),
                code: None,
                submitted_at: Utc::now(),
            };
            ks.detect_and_queue_conflict("t1", "st-1", p.clone(), Utc::now())
                .unwrap();
            ks.detect_and_queue_conflict("t1", "st-1", p, Utc::now())
                .unwrap()
                .conflict_id
        });

        let resolution = coord
            .resolve_by_id(&conflict_id, None, Utc::now())
            .await
            .unwrap();
        assert_eq!(resolution.chosen_instance_id, "w1");

        let missing = coord.resolve_by_id("nope", None, Utc::now()).await;
        assert!(missing.is_err());
    }

    #[tokio::test]
    async fn synthesize_completes_parent_when_all_done() {
        let coord = coordinator();
        coord
            .decompose("t1", "build", 50, None, Utc::now())
            .await
            .unwrap();

        // Not ready yet.
        let early = coord.synthesize("t1", Utc::now()).await;
        assert!(matches!(early, Err(CoordError::NotReadyForSynthesis { .. })));

        coord.store.run(|ks| {
            ks.synthesize_progress(
                "t1",
                "st-1",
                &SubtaskResult {
                    status: WorkStatus::Completed,
                    output: Some("done".into()),
                },
                Utc::now(),
            )
            .unwrap()
        });

        let report = coord.synthesize("t1", Utc::now()).await.unwrap();
        assert_eq!(report.status, IntegrationStatus::ReadyForIntegration);

        coord.store.run(|ks| {
            let task = ks.task("t1").unwrap();
            assert_eq!(task.status, WorkStatus::Completed);
            assert!(task.completed_at.is_some());
            assert!(ks.attachment("t1", "synthesis_t1").is_some());
        });

        // Re-delivery returns the stored report without re-finishing.
        let again = coord.synthesize("t1", Utc::now()).await.unwrap();
        assert_eq!(again.status, report.status);
    }

    #[tokio::test]
    async fn synthesize_reports_failures_and_blocked_dependents() {
        let coord = coordinator();
        coord.store.run(|ks| {
            ks.insert_task(TaskRecord::new("t1", "build", 50, Utc::now()));
            ks.decompose_and_store(
                "t1",
                &DecompositionPlan {
                    subtasks: vec![
                        PlannedSubtask {
                            id: Some("A".into()),
                            description: "a".into(),
                            specialist: SpecialistKind::Backend,
                            complexity: 1,
                            estimated_minutes: 1,
                            dependencies: vec![],
                        },
                        PlannedSubtask {
                            id: Some("B".into()),
                            description: "b".into(),
                            specialist: SpecialistKind::Testing,
                            complexity: 1,
                            estimated_minutes: 1,
                            dependencies: vec!["A".into()],
                        },
                    ],
                    strategy: None,
                },
                Utc::now(),
            )
            .unwrap();
            ks.synthesize_progress(
                "t1",
                "A",
                &SubtaskResult {
                    status: WorkStatus::Failed,
                    output: Some("broken".into()),
                },
                Utc::now(),
            )
            .unwrap();
        });

        let report = coord.synthesize("t1", Utc::now()).await.unwrap();
        assert_eq!(report.status, IntegrationStatus::RequiresFixes);
        assert!(report.next_actions.iter().any(|a| a.contains("A")));
        assert!(report.next_actions.iter().any(|a| a.contains("B")));

        coord.store.run(|ks| {
            let task = ks.task("t1").unwrap();
            assert_eq!(task.status, WorkStatus::Failed);
            assert!(task.completed_at.is_some());
        });
    }

    #[tokio::test]
    async fn attachment_roundtrip_through_sink() {
        let coord = coordinator();
        coord
            .decompose("t2", "build", 10, None, Utc::now())
            .await
            .unwrap();

        coord
            .put_attachment(
                "t2",
                "k1",
                AttachmentPayload::Json {
                    value: json!({"foo": "bar"}),
                },
                Some("w1".into()),
                Utc::now(),
            )
            .await
            .unwrap();

        // Evict the keyspace copy; the get re-hydrates from the sink.
        coord.store.run(|ks| {
            ks.remove_attachment("t2", "k1");
        });
        let record = coord.get_attachment("t2", "k1").await.unwrap();
        match record.payload {
            AttachmentPayload::Json { value } => assert_eq!(value["foo"], "bar"),
            other => panic!("unexpected payload: {other:?}"),
        }

        // Now cached in the keyspace again.
        coord
            .store
            .run(|ks| assert!(ks.attachment("t2", "k1").is_some()));
    }

    #[tokio::test]
    async fn attachment_on_unknown_task_is_rejected() {
        let coord = coordinator();
        let err = coord
            .put_attachment(
                "ghost",
                "k1",
                AttachmentPayload::Text {
                    content: "x".into(),
                },
                None,
                Utc::now(),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CoordError::Store(StoreError::TaskNotFound { .. })
        ));
    }
}
