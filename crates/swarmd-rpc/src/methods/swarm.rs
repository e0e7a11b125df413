//! `swarm.*` handlers: the LLM-driven coordination phases plus specialist
//! assignment and proposal submission.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;
use serde_json::{Value, json};

use swarmd_registry::{FnHandler, MethodConfig, Registry, RegistryError};
use swarmd_store::{Proposal, SpecialistKind};

use crate::methods::{coord_err, parse_params, store_err, to_value};
use crate::state::SwarmContext;

/// One sampling call plus store commit; the transport adds a little slack
/// over the provider deadline.
const PHASE_TIMEOUT: Duration = Duration::from_secs(35);

#[derive(Deserialize)]
struct DecomposeParams {
    task_id: String,
    /// The project description.
    task: String,
    #[serde(default)]
    priority: Option<i64>,
    #[serde(default)]
    constraints: Option<Value>,
}

#[derive(Deserialize)]
struct ContextParams {
    subtask_id: String,
    parent_task_id: String,
}

#[derive(Deserialize)]
struct ResolveParams {
    #[serde(default)]
    conflict_id: Option<String>,
    #[serde(default)]
    task_id: Option<String>,
    #[serde(default)]
    subtask_id: Option<String>,
    #[serde(default)]
    context: Option<Value>,
}

#[derive(Deserialize)]
struct SynthesizeParams {
    task_id: String,
}

#[derive(Deserialize)]
struct AssignParams {
    task_id: String,
    subtask_id: String,
    #[serde(default)]
    kind: Option<SpecialistKind>,
    #[serde(default)]
    required_capabilities: BTreeSet<String>,
}

#[derive(Deserialize)]
struct ProposeParams {
    task_id: String,
    subtask_id: String,
    instance_id: String,
    approach: String,
    #[serde(default)]
    reasoning: String,
    #[serde(default)]
    code: Option<String>,
}

pub fn register(registry: &Registry, ctx: &Arc<SwarmContext>) {
    // swarm.decompose — one provider call; circuit-protected.
    {
        let ctx = Arc::clone(ctx);
        registry.register(
            "swarm.decompose",
            MethodConfig::new()
                .require_fields(&["task_id", "task"])
                .timeout(PHASE_TIMEOUT)
                .circuit(5, Duration::from_secs(30))
                .rate_limit(10, 1.0),
            FnHandler::new(move |params, _rc| {
                let ctx = Arc::clone(&ctx);
                async move {
                    let p: DecomposeParams = parse_params("swarm.decompose", params)?;
                    let priority = match p.priority {
                        Some(raw) if !(0..=100).contains(&raw) => {
                            return Err(RegistryError::InvalidParams {
                                method: "swarm.decompose".into(),
                                reason: format!("priority must be in [0, 100], got {raw}"),
                            });
                        }
                        Some(raw) => raw as u8,
                        None => 50,
                    };
                    let summary = ctx
                        .coordinator
                        .decompose(&p.task_id, &p.task, priority, p.constraints, Utc::now())
                        .await
                        .map_err(coord_err)?;
                    to_value(summary)
                }
            }),
        );
    }

    // swarm.context — generated once per subtask, then served from the
    // attachment; the result cache absorbs identical bursts on top.
    {
        let ctx = Arc::clone(ctx);
        registry.register(
            "swarm.context",
            MethodConfig::new()
                .require_fields(&["subtask_id", "parent_task_id"])
                .timeout(PHASE_TIMEOUT)
                .cache(Duration::from_secs(300), &["subtask_id", "parent_task_id"]),
            FnHandler::new(move |params, _rc| {
                let ctx = Arc::clone(&ctx);
                async move {
                    let p: ContextParams = parse_params("swarm.context", params)?;
                    let brief = ctx
                        .coordinator
                        .context(&p.parent_task_id, &p.subtask_id, Utc::now())
                        .await
                        .map_err(coord_err)?;
                    to_value(json!({
                        "subtask_id": p.subtask_id,
                        "parent_task_id": p.parent_task_id,
                        "brief": brief,
                    }))
                }
            }),
        );
    }

    // swarm.resolve — accepts a conflict id or the (task, subtask) pair.
    {
        let ctx = Arc::clone(ctx);
        registry.register(
            "swarm.resolve",
            MethodConfig::new()
                .timeout(PHASE_TIMEOUT)
                .circuit(5, Duration::from_secs(30)),
            FnHandler::new(move |params, _rc| {
                let ctx = Arc::clone(&ctx);
                async move {
                    let p: ResolveParams = parse_params("swarm.resolve", params)?;
                    let resolution = match (&p.conflict_id, &p.task_id, &p.subtask_id) {
                        (Some(conflict_id), _, _) => ctx
                            .coordinator
                            .resolve_by_id(conflict_id, p.context, Utc::now())
                            .await
                            .map_err(coord_err)?,
                        (None, Some(task_id), Some(subtask_id)) => ctx
                            .coordinator
                            .resolve(task_id, subtask_id, p.context, Utc::now())
                            .await
                            .map_err(coord_err)?,
                        _ => {
                            return Err(RegistryError::InvalidParams {
                                method: "swarm.resolve".into(),
                                reason: "provide conflict_id, or task_id and subtask_id".into(),
                            });
                        }
                    };
                    to_value(resolution)
                }
            }),
        );
    }

    // swarm.synthesize
    {
        let ctx = Arc::clone(ctx);
        registry.register(
            "swarm.synthesize",
            MethodConfig::new()
                .require_fields(&["task_id"])
                .timeout(PHASE_TIMEOUT)
                .circuit(5, Duration::from_secs(30)),
            FnHandler::new(move |params, _rc| {
                let ctx = Arc::clone(&ctx);
                async move {
                    let p: SynthesizeParams = parse_params("swarm.synthesize", params)?;
                    let report = ctx
                        .coordinator
                        .synthesize(&p.task_id, Utc::now())
                        .await
                        .map_err(coord_err)?;
                    to_value(report)
                }
            }),
        );
    }

    // swarm.assign — race-free specialist assignment via the store script.
    {
        let ctx = Arc::clone(ctx);
        registry.register(
            "swarm.assign",
            MethodConfig::new().require_fields(&["task_id", "subtask_id"]),
            FnHandler::new(move |params, _rc| {
                let ctx = Arc::clone(&ctx);
                async move {
                    let p: AssignParams = parse_params("swarm.assign", params)?;
                    let now = Utc::now();

                    let (outcome, assignment) = ctx
                        .store
                        .run(|ks| {
                            let kind = match p.kind {
                                Some(kind) => kind,
                                None => ks.subtask(&p.task_id, &p.subtask_id)?.specialist,
                            };
                            let outcome = ks.assign_to_specialist(
                                &p.task_id,
                                &p.subtask_id,
                                kind,
                                &p.required_capabilities,
                                now,
                            )?;
                            let assignment = ks
                                .assignments
                                .get(&(p.task_id.clone(), p.subtask_id.clone()))
                                .cloned();
                            Ok::<_, swarmd_store::StoreError>((outcome, assignment))
                        })
                        .map_err(store_err)?;

                    // Assignment history is archival, not coordination
                    // state; a sink hiccup must not fail the dispatch.
                    if let Some(assignment) = assignment {
                        if let Err(err) = ctx.sink.record_assignment(&assignment).await {
                            tracing::warn!(error = %err, "assignment history write failed");
                        }
                    }
                    to_value(outcome)
                }
            }),
        );
    }

    // swarm.propose — a specialist's solution for a contested subtask; the
    // second proposal flips the conflict marker.
    {
        let ctx = Arc::clone(ctx);
        registry.register(
            "swarm.propose",
            MethodConfig::new().require_fields(&["task_id", "subtask_id", "instance_id", "approach"]),
            FnHandler::new(move |params, _rc| {
                let ctx = Arc::clone(&ctx);
                async move {
                    let p: ProposeParams = parse_params("swarm.propose", params)?;
                    let now = Utc::now();
                    let outcome = ctx
                        .store
                        .run(|ks| {
                            ks.detect_and_queue_conflict(
                                &p.task_id,
                                &p.subtask_id,
                                Proposal {
                                    instance_id: p.instance_id.clone(),
                                    approach: p.approach.clone(),
                                    reasoning: p.reasoning.clone(),
                                    code: p.code.clone(),
                                    submitted_at: now,
                                },
                                now,
                            )
                        })
                        .map_err(store_err)?;
                    to_value(outcome)
                }
            }),
        );
    }
}
