//! Method handler implementations, one module per catalog namespace.
//!
//! Each module registers its handlers with the decorator configuration
//! (rate limits, caching, timeouts, circuit breaking, persistence) the
//! method needs. Handlers are thin: parse params, call into the context
//! handles, map errors onto the registry's classified variants.

use serde::de::DeserializeOwned;
use serde_json::Value;

use swarmd_coord::CoordError;
use swarmd_registry::{Registry, RegistryError};
use swarmd_store::StoreError;

pub mod docs;
pub mod hook;
pub mod swarm;
pub mod system;
pub mod task;

use std::sync::Arc;

use crate::state::SwarmContext;

/// Register the full method catalog.
pub fn register_all(registry: &Registry, ctx: &Arc<SwarmContext>) {
    system::register(registry, ctx);
    task::register(registry, ctx);
    swarm::register(registry, ctx);
    hook::register(registry, ctx);
    docs::register(registry, ctx);
}

/// Deserialize params into the handler's input shape.
pub(crate) fn parse_params<T: DeserializeOwned>(
    method: &str,
    params: Value,
) -> Result<T, RegistryError> {
    serde_json::from_value(params).map_err(|e| RegistryError::InvalidParams {
        method: method.to_string(),
        reason: e.to_string(),
    })
}

/// Clamp a caller-supplied page size into `[1, 100]`, defaulting to 50.
pub(crate) fn clamp_limit(limit: Option<usize>) -> usize {
    limit.unwrap_or(50).clamp(1, 100)
}

/// Map store errors onto the classified registry variants.
pub(crate) fn store_err(err: StoreError) -> RegistryError {
    match err {
        StoreError::NoneAvailable { kind } => {
            RegistryError::handler("NONE_AVAILABLE", format!("no {kind} specialist available"))
                .with_data(serde_json::json!({ "specialist_kind": kind.as_str() }))
        }
        StoreError::FlushDenied => RegistryError::Unauthorized {
            reason: "flush confirm token mismatch".into(),
        },
        err @ (StoreError::TaskNotFound { .. }
        | StoreError::SubtaskNotFound { .. }
        | StoreError::InstanceNotFound { .. }
        | StoreError::AttachmentNotFound { .. }
        | StoreError::ConflictNotFound { .. }
        | StoreError::UnknownDependency { .. }
        | StoreError::InvalidTransition { .. }
        | StoreError::InvalidArgument(_)) => RegistryError::Validation {
            reason: err.to_string(),
        },
        err @ (StoreError::Sqlite(_) | StoreError::SinkQueryRejected(_)) => {
            let kind = err.kind();
            RegistryError::handler(kind, err.to_string())
        }
        err => RegistryError::Internal(err.to_string()),
    }
}

/// Map coordination errors onto the classified registry variants.
pub(crate) fn coord_err(err: CoordError) -> RegistryError {
    match err {
        CoordError::Store(err) => store_err(err),
        err @ CoordError::NotReadyForSynthesis { .. } => RegistryError::Validation {
            reason: err.to_string(),
        },
        err @ (CoordError::SamplingRequestFailed { .. }
        | CoordError::SamplingExhausted { .. }
        | CoordError::SamplingSchemaInvalid { .. }) => {
            RegistryError::handler("SAMPLING_ERROR", err.to_string())
        }
        err @ CoordError::PollTimeout => RegistryError::handler("POLL_TIMEOUT", err.to_string()),
        err => RegistryError::Internal(err.to_string()),
    }
}

/// Serialize a handler result; serialization failure is an internal bug.
pub(crate) fn to_value<T: serde::Serialize>(value: T) -> Result<Value, RegistryError> {
    serde_json::to_value(value).map_err(|e| RegistryError::Internal(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use swarmd_store::SpecialistKind;

    #[test]
    fn none_available_maps_to_handler_error() {
        let err = store_err(StoreError::NoneAvailable {
            kind: SpecialistKind::Backend,
        });
        match err {
            RegistryError::Handler { kind, data, .. } => {
                assert_eq!(kind, "NONE_AVAILABLE");
                assert_eq!(data.unwrap()["specialist_kind"], "backend");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn not_found_maps_to_validation() {
        let err = store_err(StoreError::TaskNotFound {
            task_id: "t1".into(),
        });
        assert!(matches!(err, RegistryError::Validation { .. }));
    }

    #[test]
    fn limits_clamp() {
        assert_eq!(clamp_limit(None), 50);
        assert_eq!(clamp_limit(Some(0)), 1);
        assert_eq!(clamp_limit(Some(1_000)), 100);
        assert_eq!(clamp_limit(Some(7)), 7);
    }
}
