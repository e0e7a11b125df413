//! Error types for the swarmd-coord crate.

use thiserror::Error;

/// Alias for `Result<T, CoordError>`.
pub type CoordResult<T> = Result<T, CoordError>;

/// Errors from instance lifecycle, queueing, and coordination phases.
#[derive(Debug, Error)]
pub enum CoordError {
    /// An error propagated from the store.
    #[error(transparent)]
    Store(#[from] swarmd_store::StoreError),

    /// An HTTP request to the sampling provider failed.
    #[error("sampling request failed: {reason}")]
    SamplingRequestFailed { reason: String },

    /// The provider's response did not match the phase schema. The caller
    /// takes the fallback path.
    #[error("sampling response failed validation: {reason}")]
    SamplingSchemaInvalid { reason: String },

    /// All retry attempts against the provider were exhausted.
    #[error("sampling provider unavailable after {attempts} attempts: {last_error}")]
    SamplingExhausted { attempts: u32, last_error: String },

    /// A prompt or brief template failed to render.
    #[error("template render failed: {0}")]
    Template(#[from] handlebars::RenderError),

    /// A template failed to compile at engine construction.
    #[error("template registration failed: {0}")]
    TemplateRegistration(String),

    /// The synthesis phase was invoked before every subtask completed.
    #[error("task {task_id} is not ready for synthesis")]
    NotReadyForSynthesis { task_id: String },

    /// A long-poll pull expired without matching work.
    #[error("no work available within the poll window")]
    PollTimeout,

    /// JSON serialization or deserialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
