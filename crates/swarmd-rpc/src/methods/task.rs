//! `task.*` handlers: CRUD, claim/complete, and attachments.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;
use serde_json::{Value, json};

use swarmd_registry::{FnHandler, MethodConfig, Registry, RegistryError};
use swarmd_store::{AttachmentPayload, WorkStatus};

use crate::methods::{clamp_limit, coord_err, parse_params, store_err, to_value};
use crate::state::SwarmContext;

/// Bound on a single long-poll claim.
const MAX_CLAIM_WAIT: Duration = Duration::from_secs(30);

#[derive(Deserialize)]
struct CreateParams {
    #[serde(default)]
    id: Option<String>,
    text: String,
    #[serde(default)]
    priority: Option<i64>,
    #[serde(default)]
    metadata: Option<serde_json::Map<String, Value>>,
}

#[derive(Deserialize)]
struct ListParams {
    #[serde(default)]
    status: Option<WorkStatus>,
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    offset: Option<usize>,
}

#[derive(Deserialize)]
struct GetProjectParams {
    id: String,
}

#[derive(Deserialize)]
struct UpdateParams {
    id: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    priority: Option<i64>,
    #[serde(default)]
    metadata: Option<serde_json::Map<String, Value>>,
}

#[derive(Deserialize)]
struct AssignParams {
    task_id: String,
    instance_id: String,
}

#[derive(Deserialize)]
struct ClaimParams {
    instance_id: String,
    #[serde(default)]
    wait_ms: Option<u64>,
}

#[derive(Deserialize)]
struct CompleteParams {
    id: String,
    #[serde(default)]
    status: Option<WorkStatus>,
    #[serde(default)]
    result: Option<String>,
}

#[derive(Deserialize)]
struct CreateAttachmentParams {
    task_id: String,
    key: String,
    #[serde(flatten)]
    payload: AttachmentPayload,
    #[serde(default)]
    created_by: Option<String>,
}

#[derive(Deserialize)]
struct GetAttachmentParams {
    task_id: String,
    key: String,
}

#[derive(Deserialize)]
struct ListAttachmentsParams {
    task_id: String,
}

#[derive(Deserialize)]
struct BatchAttachmentsParams {
    task_id: String,
    keys: Vec<String>,
}

/// Validate a caller-supplied priority into `[0, 100]`.
fn check_priority(priority: Option<i64>, method: &str) -> Result<u8, RegistryError> {
    let priority = priority.unwrap_or(50);
    if !(0..=100).contains(&priority) {
        return Err(RegistryError::InvalidParams {
            method: method.to_string(),
            reason: format!("priority must be in [0, 100], got {priority}"),
        });
    }
    Ok(priority as u8)
}

pub fn register(registry: &Registry, ctx: &Arc<SwarmContext>) {
    // task.create
    {
        let ctx = Arc::clone(ctx);
        registry.register(
            "task.create",
            MethodConfig::new()
                .require_fields(&["text"])
                .rate_limit(30, 5.0)
                .persist(),
            FnHandler::new(move |params, _rc| {
                let ctx = Arc::clone(&ctx);
                async move {
                    let p: CreateParams = parse_params("task.create", params)?;
                    let priority = check_priority(p.priority, "task.create")?;
                    let task = ctx.queue.create_task(
                        p.id,
                        p.text,
                        priority,
                        p.metadata.unwrap_or_default(),
                        Utc::now(),
                    );
                    to_value(task)
                }
            }),
        );
    }

    // task.list
    {
        let ctx = Arc::clone(ctx);
        registry.register(
            "task.list",
            MethodConfig::new(),
            FnHandler::new(move |params, _rc| {
                let ctx = Arc::clone(&ctx);
                async move {
                    let p: ListParams = parse_params("task.list", params)?;
                    let limit = clamp_limit(p.limit);
                    let tasks = ctx
                        .store
                        .run(|ks| ks.list_tasks(p.status, limit, p.offset.unwrap_or(0)));
                    let count = tasks.len();
                    to_value(json!({ "tasks": tasks, "count": count }))
                }
            }),
        );
    }

    // task.get_project — the parent with its whole graph.
    {
        let ctx = Arc::clone(ctx);
        registry.register(
            "task.get_project",
            MethodConfig::new().require_fields(&["id"]),
            FnHandler::new(move |params, _rc| {
                let ctx = Arc::clone(&ctx);
                async move {
                    let p: GetProjectParams = parse_params("task.get_project", params)?;
                    let project = ctx.store.run(|ks| {
                        let task = ks.task(&p.id)?.clone();
                        let subtasks: Vec<_> =
                            ks.subtasks_of(&p.id).into_iter().cloned().collect();
                        let edges: Vec<Value> = subtasks
                            .iter()
                            .flat_map(|s| {
                                s.dependencies.iter().map(|dep| {
                                    json!({ "from": dep, "to": s.id })
                                })
                            })
                            .collect();
                        let decomposition = ks.decompositions.get(&p.id).cloned();
                        let attachments = ks.attachment_keys(&p.id);
                        Ok::<_, swarmd_store::StoreError>(json!({
                            "task": task,
                            "subtasks": subtasks,
                            "dependency_edges": edges,
                            "decomposition": decomposition,
                            "attachment_keys": attachments,
                        }))
                    });
                    project.map_err(store_err)
                }
            }),
        );
    }

    // task.update
    {
        let ctx = Arc::clone(ctx);
        registry.register(
            "task.update",
            MethodConfig::new().require_fields(&["id"]).persist(),
            FnHandler::new(move |params, _rc| {
                let ctx = Arc::clone(&ctx);
                async move {
                    let p: UpdateParams = parse_params("task.update", params)?;
                    let priority = match p.priority {
                        Some(raw) => Some(check_priority(Some(raw), "task.update")?),
                        None => None,
                    };
                    let task = ctx
                        .store
                        .run(|ks| {
                            let now = Utc::now();
                            let (old_priority, was_pending) = {
                                let task = ks.task(&p.id)?;
                                if task.status.is_terminal() {
                                    return Err(swarmd_store::StoreError::InvalidTransition {
                                        entity: "task",
                                        id: p.id.clone(),
                                        reason: format!(
                                            "cannot update a {} task",
                                            task.status.as_str()
                                        ),
                                    });
                                }
                                (task.priority, task.status == WorkStatus::Pending)
                            };

                            {
                                let task = ks.task_mut(&p.id)?;
                                if let Some(text) = &p.text {
                                    task.text = text.clone();
                                }
                                if let Some(priority) = priority {
                                    task.priority = priority;
                                }
                                if let Some(metadata) = &p.metadata {
                                    for (k, v) in metadata {
                                        task.metadata.insert(k.clone(), v.clone());
                                    }
                                }
                                task.updated_at = now;
                            }

                            // A pending task whose priority moved gets
                            // re-scored in the queue.
                            if let Some(new_priority) = priority {
                                if was_pending && new_priority != old_priority {
                                    ks.pending_remove(&p.id);
                                    ks.pending_push(&p.id, new_priority);
                                }
                            }

                            ks.emit(
                                swarmd_store::task_stream(&p.id),
                                "task.update",
                                json!({ "task_id": p.id }),
                                now,
                            );
                            Ok(ks.task(&p.id)?.clone())
                        })
                        .map_err(store_err)?;
                    to_value(task)
                }
            }),
        );
    }

    // task.assign — admin override.
    {
        let ctx = Arc::clone(ctx);
        registry.register(
            "task.assign",
            MethodConfig::new().require_fields(&["task_id", "instance_id"]).persist(),
            FnHandler::new(move |params, _rc| {
                let ctx = Arc::clone(&ctx);
                async move {
                    let p: AssignParams = parse_params("task.assign", params)?;
                    let task = ctx
                        .queue
                        .assign(&p.task_id, &p.instance_id, Utc::now())
                        .map_err(coord_err)?;
                    to_value(task)
                }
            }),
        );
    }

    // task.claim — bounded long-poll.
    {
        let ctx = Arc::clone(ctx);
        registry.register(
            "task.claim",
            MethodConfig::new()
                .require_fields(&["instance_id"])
                .timeout(MAX_CLAIM_WAIT + Duration::from_secs(2)),
            FnHandler::new(move |params, _rc| {
                let ctx = Arc::clone(&ctx);
                async move {
                    let p: ClaimParams = parse_params("task.claim", params)?;
                    let wait = Duration::from_millis(p.wait_ms.unwrap_or(0))
                        .min(MAX_CLAIM_WAIT);
                    let task = ctx.queue.claim(&p.instance_id, wait).await.map_err(coord_err)?;
                    to_value(json!({ "task": task }))
                }
            }),
        );
    }

    // task.complete
    {
        let ctx = Arc::clone(ctx);
        registry.register(
            "task.complete",
            MethodConfig::new().require_fields(&["id"]).persist(),
            FnHandler::new(move |params, _rc| {
                let ctx = Arc::clone(&ctx);
                async move {
                    let p: CompleteParams = parse_params("task.complete", params)?;
                    let status = p.status.unwrap_or(WorkStatus::Completed);
                    let task = ctx
                        .queue
                        .complete_task(&p.id, status, p.result, Utc::now())
                        .map_err(coord_err)?;
                    to_value(task)
                }
            }),
        );
    }

    // task.create_attachment — write-through; sink failure fails the call.
    {
        let ctx = Arc::clone(ctx);
        registry.register(
            "task.create_attachment",
            MethodConfig::new().require_fields(&["task_id", "key", "type"]),
            FnHandler::new(move |params, _rc| {
                let ctx = Arc::clone(&ctx);
                async move {
                    let p: CreateAttachmentParams =
                        parse_params("task.create_attachment", params)?;
                    let record = ctx
                        .coordinator
                        .put_attachment(&p.task_id, &p.key, p.payload, p.created_by, Utc::now())
                        .await
                        .map_err(coord_err)?;
                    to_value(record)
                }
            }),
        );
    }

    // task.get_attachment — read-through from the sink on keyspace miss.
    {
        let ctx = Arc::clone(ctx);
        registry.register(
            "task.get_attachment",
            MethodConfig::new().require_fields(&["task_id", "key"]),
            FnHandler::new(move |params, _rc| {
                let ctx = Arc::clone(&ctx);
                async move {
                    let p: GetAttachmentParams = parse_params("task.get_attachment", params)?;
                    let record = ctx
                        .coordinator
                        .get_attachment(&p.task_id, &p.key)
                        .await
                        .map_err(coord_err)?;
                    to_value(record)
                }
            }),
        );
    }

    // task.list_attachments
    {
        let ctx = Arc::clone(ctx);
        registry.register(
            "task.list_attachments",
            MethodConfig::new().require_fields(&["task_id"]),
            FnHandler::new(move |params, _rc| {
                let ctx = Arc::clone(&ctx);
                async move {
                    let p: ListAttachmentsParams =
                        parse_params("task.list_attachments", params)?;
                    let keys = ctx.store.run(|ks| {
                        ks.task(&p.task_id)?;
                        Ok::<_, swarmd_store::StoreError>(ks.attachment_keys(&p.task_id))
                    })
                    .map_err(store_err)?;
                    let count = keys.len();
                    to_value(json!({ "task_id": p.task_id, "keys": keys, "count": count }))
                }
            }),
        );
    }

    // task.get_attachments_batch
    {
        let ctx = Arc::clone(ctx);
        registry.register(
            "task.get_attachments_batch",
            MethodConfig::new().require_fields(&["task_id", "keys"]),
            FnHandler::new(move |params, _rc| {
                let ctx = Arc::clone(&ctx);
                async move {
                    let p: BatchAttachmentsParams =
                        parse_params("task.get_attachments_batch", params)?;
                    if p.keys.len() > 100 {
                        return Err(RegistryError::InvalidParams {
                            method: "task.get_attachments_batch".into(),
                            reason: format!("at most 100 keys per batch, got {}", p.keys.len()),
                        });
                    }
                    let mut attachments = serde_json::Map::new();
                    for key in &p.keys {
                        let value = match ctx.coordinator.get_attachment(&p.task_id, key).await {
                            Ok(record) => to_value(record)?,
                            Err(swarmd_coord::CoordError::Store(
                                swarmd_store::StoreError::AttachmentNotFound { .. },
                            )) => Value::Null,
                            Err(err) => return Err(coord_err(err)),
                        };
                        attachments.insert(key.clone(), value);
                    }
                    to_value(json!({ "task_id": p.task_id, "attachments": attachments }))
                }
            }),
        );
    }
}
