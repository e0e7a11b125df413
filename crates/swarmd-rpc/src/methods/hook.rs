//! `hook.*` handlers: tool policy validation around specialist workers.
//!
//! `hook.pre_tool` is on every worker's hot path and is rate-limited per
//! session (the session id doubles as the rate-limit key).

use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use serde_json::{Value, json};

use swarmd_registry::{FnHandler, MethodConfig, Registry, RegistryError};

use crate::methods::{parse_params, to_value};
use crate::state::SwarmContext;

#[derive(Deserialize)]
struct PreToolParams {
    #[serde(default)]
    session_id: Option<String>,
    tool: String,
    #[serde(default)]
    params: Value,
}

#[derive(Deserialize)]
struct PostToolParams {
    tool: String,
    #[serde(default)]
    result: Value,
}

#[derive(Deserialize)]
struct UserPromptParams {
    prompt: String,
}

#[derive(Deserialize)]
struct TodoWriteParams {
    todos: Value,
}

pub fn register(registry: &Registry, ctx: &Arc<SwarmContext>) {
    // hook.pre_tool
    {
        let ctx = Arc::clone(ctx);
        registry.register(
            "hook.pre_tool",
            MethodConfig::new()
                .require_fields(&["tool"])
                .rate_limit(120, 20.0),
            FnHandler::new(move |params, rc| {
                let ctx = Arc::clone(&ctx);
                async move {
                    let p: PreToolParams = parse_params("hook.pre_tool", params)?;
                    let session = p.session_id.unwrap_or(rc.client_id);
                    let decision = ctx.hooks.pre_tool(&session, &p.tool, &p.params, Utc::now());
                    to_value(decision)
                }
            }),
        );
    }

    // hook.post_tool — pass-through with registered transforms.
    {
        let ctx = Arc::clone(ctx);
        registry.register(
            "hook.post_tool",
            MethodConfig::new().require_fields(&["tool"]),
            FnHandler::new(move |params, _rc| {
                let ctx = Arc::clone(&ctx);
                async move {
                    let p: PostToolParams = parse_params("hook.post_tool", params)?;
                    let result = ctx.hooks.post_tool(&p.tool, p.result);
                    to_value(json!({ "result": result }))
                }
            }),
        );
    }

    // hook.user_prompt
    {
        let ctx = Arc::clone(ctx);
        registry.register(
            "hook.user_prompt",
            MethodConfig::new().require_fields(&["prompt"]),
            FnHandler::new(move |params, _rc| {
                let ctx = Arc::clone(&ctx);
                async move {
                    let p: UserPromptParams = parse_params("hook.user_prompt", params)?;
                    let decision = ctx.hooks.user_prompt(&p.prompt);
                    to_value(decision)
                }
            }),
        );
    }

    // hook.todo_write
    {
        let ctx = Arc::clone(ctx);
        registry.register(
            "hook.todo_write",
            MethodConfig::new().require_fields(&["todos"]),
            FnHandler::new(move |params, _rc| {
                let ctx = Arc::clone(&ctx);
                async move {
                    let p: TodoWriteParams = parse_params("hook.todo_write", params)?;
                    let count = ctx.hooks.todo_write(&p.todos).map_err(|reason| {
                        RegistryError::Validation { reason }
                    })?;
                    to_value(json!({ "accepted": true, "count": count }))
                }
            }),
        );
    }
}
