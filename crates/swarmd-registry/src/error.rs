//! Error types for the swarmd-registry crate.
//!
//! Dispatch failures carry enough structure for the RPC surface to map them
//! onto the fixed error-code table without string inspection.

use thiserror::Error;

/// Alias for `Result<T, RegistryError>`.
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Errors produced by the dispatch pipeline or classified from handlers.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// No handler registered for the method.
    #[error("method not found: {method}")]
    MethodNotFound { method: String },

    /// Params failed the handler's declared validation.
    #[error("invalid params for {method}: {reason}")]
    InvalidParams { method: String, reason: String },

    /// The per-client token bucket rejected the request.
    #[error("rate limit exceeded for {method}")]
    RateLimited { method: String },

    /// The method's circuit breaker is open.
    #[error("circuit breaker open for {method}")]
    CircuitOpen { method: String },

    /// The handler did not finish before its deadline.
    #[error("{method} timed out after {ms}ms")]
    Timeout { method: String, ms: u64 },

    /// The caller lacks permission for this method.
    #[error("unauthorized: {reason}")]
    Unauthorized { reason: String },

    /// Business validation failed inside the handler (bad reference,
    /// out-of-range value, dependency cycle on a follow-up call, …).
    #[error("validation error: {reason}")]
    Validation { reason: String },

    /// A classified handler failure with a machine-readable kind.
    #[error("handler error ({kind}): {message}")]
    Handler {
        kind: String,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// Uncaught handler failure.
    #[error("internal error: {0}")]
    Internal(String),
}

impl RegistryError {
    /// Build a classified handler error.
    pub fn handler(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Handler {
            kind: kind.into(),
            message: message.into(),
            data: None,
        }
    }

    /// Attach structured data to a handler error.
    pub fn with_data(self, data: serde_json::Value) -> Self {
        match self {
            Self::Handler { kind, message, .. } => Self::Handler {
                kind,
                message,
                data: Some(data),
            },
            other => other,
        }
    }
}
