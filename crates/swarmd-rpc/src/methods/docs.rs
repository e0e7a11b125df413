//! `docs.*` handlers: embedded protocol documentation.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::json;

use swarmd_registry::{FnHandler, MethodConfig, Registry, RegistryError};

use crate::methods::{parse_params, to_value};
use crate::state::SwarmContext;

/// Embedded documents served to clients and the dashboard.
const DOCS: &[(&str, &str, &str)] = &[
    (
        "protocol",
        "RPC protocol",
        include_str!("../../docs/protocol.md"),
    ),
    (
        "methods",
        "Method catalog",
        include_str!("../../docs/methods.md"),
    ),
    (
        "events",
        "Event reference",
        include_str!("../../docs/events.md"),
    ),
];

#[derive(Deserialize)]
struct GetParams {
    name: String,
}

pub fn register(registry: &Registry, ctx: &Arc<SwarmContext>) {
    let _ = ctx;

    // docs.list
    registry.register(
        "docs.list",
        MethodConfig::new().cache(Duration::from_secs(3600), &[]),
        FnHandler::new(move |_params, _rc| async move {
            let docs: Vec<_> = DOCS
                .iter()
                .map(|(name, title, _)| json!({ "name": name, "title": title }))
                .collect();
            to_value(json!({ "docs": docs }))
        }),
    );

    // docs.get
    registry.register(
        "docs.get",
        MethodConfig::new()
            .require_fields(&["name"])
            .cache(Duration::from_secs(3600), &["name"]),
        FnHandler::new(move |params, _rc| async move {
            let p: GetParams = parse_params("docs.get", params)?;
            let Some((name, title, content)) = DOCS.iter().find(|(name, _, _)| *name == p.name)
            else {
                return Err(RegistryError::Validation {
                    reason: format!("unknown document: {}", p.name),
                });
            };
            to_value(json!({ "name": name, "title": title, "content": content }))
        }),
    );
}
