//! `system.*` handlers: instance lifecycle, diagnostics, metrics, flush,
//! and the read-only sink query surface.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;
use serde_json::{Value, json};

use swarmd_coord::RegisterRequest;
use swarmd_registry::{FnHandler, MethodConfig, Registry, RegistryError};

use crate::methods::{clamp_limit, coord_err, parse_params, store_err, to_value};
use crate::state::SwarmContext;

#[derive(Deserialize)]
struct HeartbeatParams {
    id: String,
    #[serde(default)]
    metadata: Option<serde_json::Map<String, Value>>,
}

#[derive(Deserialize)]
struct UnregisterParams {
    id: String,
}

#[derive(Deserialize)]
struct FlushParams {
    confirm: String,
}

#[derive(Deserialize)]
struct SinkQueryParams {
    sql: String,
    #[serde(default)]
    limit: Option<usize>,
}

pub fn register(registry: &Registry, ctx: &Arc<SwarmContext>) {
    // system.register
    {
        let ctx = Arc::clone(ctx);
        registry.register(
            "system.register",
            MethodConfig::new().require_fields(&["id", "roles"]),
            FnHandler::new(move |params, _rc| {
                let ctx = Arc::clone(&ctx);
                async move {
                    let request: RegisterRequest = parse_params("system.register", params)?;
                    let record = ctx.instances.register(request, Utc::now());
                    to_value(record)
                }
            }),
        );
    }

    // system.heartbeat — high-frequency; generous per-client bucket.
    {
        let ctx = Arc::clone(ctx);
        registry.register(
            "system.heartbeat",
            MethodConfig::new()
                .require_fields(&["id"])
                .rate_limit(60, 10.0),
            FnHandler::new(move |params, _rc| {
                let ctx = Arc::clone(&ctx);
                async move {
                    let p: HeartbeatParams = parse_params("system.heartbeat", params)?;
                    let status = ctx
                        .instances
                        .heartbeat(&p.id, p.metadata, Utc::now())
                        .map_err(coord_err)?;
                    to_value(json!({ "id": p.id, "status": status }))
                }
            }),
        );
    }

    // system.unregister
    {
        let ctx = Arc::clone(ctx);
        registry.register(
            "system.unregister",
            MethodConfig::new().require_fields(&["id"]),
            FnHandler::new(move |params, _rc| {
                let ctx = Arc::clone(&ctx);
                async move {
                    let p: UnregisterParams = parse_params("system.unregister", params)?;
                    let reassigned = ctx
                        .instances
                        .unregister(&p.id, Utc::now())
                        .map_err(coord_err)?;
                    to_value(json!({ "id": p.id, "reassigned": reassigned }))
                }
            }),
        );
    }

    // system.get_state
    {
        let ctx = Arc::clone(ctx);
        registry.register(
            "system.get_state",
            MethodConfig::new(),
            FnHandler::new(move |_params, _rc| {
                let ctx = Arc::clone(&ctx);
                async move {
                    let (keys, stats, ready) = ctx.store.run(|ks| {
                        (ks.dump_keys(), ks.stats(), ks.ready_snapshot())
                    });
                    let instances = ctx.instances.snapshot();
                    to_value(json!({
                        "keys": keys,
                        "stats": stats,
                        "instances": instances,
                        "ready_queue": ready
                            .into_iter()
                            .map(|e| json!({
                                "parent_id": e.parent_id,
                                "subtask_id": e.subtask_id,
                                "priority": e.priority,
                            }))
                            .collect::<Vec<_>>(),
                    }))
                }
            }),
        );
    }

    // system.health
    {
        let ctx = Arc::clone(ctx);
        let registry_handle = registry.clone();
        registry.register(
            "system.health",
            MethodConfig::new().timeout(Duration::from_secs(5)),
            FnHandler::new(move |_params, _rc| {
                let ctx = Arc::clone(&ctx);
                let registry = registry_handle.clone();
                async move {
                    let stats = ctx.store.run(|ks| ks.stats());
                    let sink_ok = ctx.sink.tables().await.is_ok();
                    let circuits: Vec<Value> = registry
                        .circuit_states()
                        .into_iter()
                        .map(|(method, state)| json!({ "method": method, "state": format!("{state:?}") }))
                        .collect();
                    to_value(json!({
                        "status": if sink_ok { "ok" } else { "degraded" },
                        "uptime_secs": (Utc::now() - ctx.started_at).num_seconds(),
                        "stats": stats,
                        "sink_ok": sink_ok,
                        "circuits": circuits,
                    }))
                }
            }),
        );
    }

    // system.metrics
    {
        let ctx = Arc::clone(ctx);
        let registry_handle = registry.clone();
        registry.register(
            "system.metrics",
            MethodConfig::new(),
            FnHandler::new(move |_params, _rc| {
                let ctx = Arc::clone(&ctx);
                let registry = registry_handle.clone();
                async move {
                    let counters = ctx.store.run(|ks| ks.counters().clone());
                    to_value(json!({
                        "methods": registry.metrics().snapshot(),
                        "counters": counters,
                        "result_cache": {
                            "hits": registry.cache().stats().hits(),
                            "misses": registry.cache().stats().misses(),
                            "entries": registry.cache().entry_count(),
                        },
                    }))
                }
            }),
        );
    }

    // system.flush — destructive; guarded by the confirm token.
    {
        let ctx = Arc::clone(ctx);
        registry.register(
            "system.flush",
            MethodConfig::new().require_fields(&["confirm"]),
            FnHandler::new(move |params, _rc| {
                let ctx = Arc::clone(&ctx);
                async move {
                    let p: FlushParams = parse_params("system.flush", params)?;
                    let expected = ctx.flush_token.as_deref().ok_or_else(|| {
                        RegistryError::Unauthorized {
                            reason: "flush is disabled (no guard token configured)".into(),
                        }
                    })?;
                    if p.confirm != expected {
                        return Err(store_err(swarmd_store::StoreError::FlushDenied));
                    }
                    let flushed = ctx.store.run(|ks| {
                        let stats = ks.stats();
                        ks.flush();
                        stats
                    });
                    tracing::warn!("keyspace flushed by operator request");
                    to_value(json!({ "flushed": true, "previous": flushed }))
                }
            }),
        );
    }

    // system.sink.tables
    {
        let ctx = Arc::clone(ctx);
        registry.register(
            "system.sink.tables",
            MethodConfig::new().cache(Duration::from_secs(60), &[]),
            FnHandler::new(move |_params, _rc| {
                let ctx = Arc::clone(&ctx);
                async move {
                    let tables = ctx.sink.tables().await.map_err(store_err)?;
                    to_value(json!({ "tables": tables }))
                }
            }),
        );
    }

    // system.sink.query — read-only, bounded.
    {
        let ctx = Arc::clone(ctx);
        registry.register(
            "system.sink.query",
            MethodConfig::new()
                .require_fields(&["sql"])
                .rate_limit(10, 1.0)
                .timeout(Duration::from_secs(10)),
            FnHandler::new(move |params, _rc| {
                let ctx = Arc::clone(&ctx);
                async move {
                    let p: SinkQueryParams = parse_params("system.sink.query", params)?;
                    let limit = clamp_limit(p.limit);
                    let rows = ctx.sink.query(&p.sql, limit).await.map_err(store_err)?;
                    let count = rows.len();
                    to_value(json!({ "rows": rows, "count": count }))
                }
            }),
        );
    }
}
