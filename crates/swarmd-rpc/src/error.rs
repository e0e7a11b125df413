//! The fixed RPC error-code table and conversions from pipeline errors.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use swarmd_registry::RegistryError;

/// Error codes on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcCode {
    ParseError,
    InvalidRequest,
    MethodNotFound,
    InvalidParams,
    InternalError,
    RateLimitExceeded,
    CircuitBreakerOpen,
    Unauthorized,
    ValidationError,
    HandlerError,
}

impl RpcCode {
    pub fn code(self) -> i64 {
        match self {
            Self::ParseError => -32700,
            Self::InvalidRequest => -32600,
            Self::MethodNotFound => -32601,
            Self::InvalidParams => -32602,
            Self::InternalError => -32603,
            Self::RateLimitExceeded => -32001,
            Self::CircuitBreakerOpen => -32002,
            Self::Unauthorized => -32003,
            Self::ValidationError => -32004,
            Self::HandlerError => -32005,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::ParseError => "PARSE_ERROR",
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::MethodNotFound => "METHOD_NOT_FOUND",
            Self::InvalidParams => "INVALID_PARAMS",
            Self::InternalError => "INTERNAL_ERROR",
            Self::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            Self::CircuitBreakerOpen => "CIRCUIT_BREAKER_OPEN",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::ValidationError => "VALIDATION_ERROR",
            Self::HandlerError => "HANDLER_ERROR",
        }
    }
}

/// The `error` member of a response envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcErrorObject {
    pub fn new(code: RpcCode, message: impl Into<String>) -> Self {
        Self {
            code: code.code(),
            message: message.into(),
            data: Some(json!({ "kind": code.name() })),
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

impl From<RegistryError> for RpcErrorObject {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::MethodNotFound { .. } => {
                Self::new(RpcCode::MethodNotFound, err.to_string())
            }
            RegistryError::InvalidParams { .. } => Self::new(RpcCode::InvalidParams, err.to_string()),
            RegistryError::RateLimited { .. } => {
                Self::new(RpcCode::RateLimitExceeded, err.to_string())
            }
            RegistryError::CircuitOpen { .. } => {
                Self::new(RpcCode::CircuitBreakerOpen, err.to_string())
            }
            RegistryError::Timeout { ref method, ms } => {
                Self::new(RpcCode::HandlerError, err.to_string()).with_data(json!({
                    "kind": "TIMEOUT",
                    "method": method,
                    "deadline_ms": ms,
                }))
            }
            RegistryError::Unauthorized { .. } => Self::new(RpcCode::Unauthorized, err.to_string()),
            RegistryError::Validation { .. } => Self::new(RpcCode::ValidationError, err.to_string()),
            RegistryError::Handler {
                ref kind,
                ref message,
                ref data,
            } => Self {
                code: RpcCode::HandlerError.code(),
                message: message.clone(),
                data: Some(json!({ "kind": kind, "detail": data })),
            },
            RegistryError::Internal(_) => Self::new(RpcCode::InternalError, err.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_table_is_stable() {
        assert_eq!(RpcCode::ParseError.code(), -32700);
        assert_eq!(RpcCode::InvalidRequest.code(), -32600);
        assert_eq!(RpcCode::MethodNotFound.code(), -32601);
        assert_eq!(RpcCode::InvalidParams.code(), -32602);
        assert_eq!(RpcCode::InternalError.code(), -32603);
        assert_eq!(RpcCode::RateLimitExceeded.code(), -32001);
        assert_eq!(RpcCode::CircuitBreakerOpen.code(), -32002);
        assert_eq!(RpcCode::Unauthorized.code(), -32003);
        assert_eq!(RpcCode::ValidationError.code(), -32004);
        assert_eq!(RpcCode::HandlerError.code(), -32005);
    }

    #[test]
    fn registry_errors_map_to_codes() {
        let err: RpcErrorObject = RegistryError::MethodNotFound {
            method: "x.y".into(),
        }
        .into();
        assert_eq!(err.code, -32601);

        let err: RpcErrorObject = RegistryError::RateLimited {
            method: "x.y".into(),
        }
        .into();
        assert_eq!(err.code, -32001);

        let err: RpcErrorObject = RegistryError::handler("NONE_AVAILABLE", "no capacity").into();
        assert_eq!(err.code, -32005);
        assert_eq!(err.data.unwrap()["kind"], "NONE_AVAILABLE");
    }

    #[test]
    fn timeout_maps_to_handler_error_with_kind() {
        let err: RpcErrorObject = RegistryError::Timeout {
            method: "swarm.decompose".into(),
            ms: 30_000,
        }
        .into();
        assert_eq!(err.code, -32005);
        let data = err.data.unwrap();
        assert_eq!(data["kind"], "TIMEOUT");
        assert_eq!(data["deadline_ms"], 30_000);
    }
}
