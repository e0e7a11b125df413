//! Error types for the swarmd-hooks crate.

use thiserror::Error;

/// Alias for `Result<T, HookError>`.
pub type HookResult<T> = Result<T, HookError>;

/// Errors from policy construction or evaluation.
#[derive(Debug, Error)]
pub enum HookError {
    /// A policy rule pattern failed to compile.
    #[error("invalid policy pattern `{pattern}`: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    /// JSON handling failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
