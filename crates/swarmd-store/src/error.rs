//! Error types for the swarmd-store crate.
//!
//! All keyspace, script, stream, and sink operations return [`StoreError`]
//! via [`StoreResult`]. Script-level failures (e.g. no specialist with free
//! capacity) get their own typed variants so that callers can map them onto
//! the RPC error surface without string matching.

use thiserror::Error;

use crate::types::SpecialistKind;

/// Alias for `Result<T, StoreError>`.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in the coordination store.
#[derive(Debug, Error)]
pub enum StoreError {
    // -- Script errors -------------------------------------------------------
    /// No specialist of the requested kind has free capacity.
    #[error("no {kind} specialist available with free capacity")]
    NoneAvailable { kind: SpecialistKind },

    /// The referenced parent task does not exist.
    #[error("task not found: {task_id}")]
    TaskNotFound { task_id: String },

    /// The referenced subtask does not exist under its parent.
    #[error("subtask not found: {parent_id}/{subtask_id}")]
    SubtaskNotFound {
        parent_id: String,
        subtask_id: String,
    },

    /// The referenced instance is not registered.
    #[error("instance not found: {instance_id}")]
    InstanceNotFound { instance_id: String },

    /// A declared dependency names a subtask that is not part of the same
    /// decomposition.
    #[error("subtask {subtask_id} depends on unknown sibling {dependency}")]
    UnknownDependency {
        subtask_id: String,
        dependency: String,
    },

    /// The requested state transition is not legal for the record's current
    /// status.
    #[error("invalid transition for {entity} {id}: {reason}")]
    InvalidTransition {
        entity: &'static str,
        id: String,
        reason: String,
    },

    /// The referenced attachment key does not exist on the task.
    #[error("attachment not found: {task_id}/{key}")]
    AttachmentNotFound { task_id: String, key: String },

    /// The referenced conflict does not exist.
    #[error("conflict not found: {conflict_id}")]
    ConflictNotFound { conflict_id: String },

    // -- Validation ----------------------------------------------------------
    /// An invalid argument was provided to a store operation.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The flush guard token did not match.
    #[error("flush rejected: confirm token mismatch")]
    FlushDenied,

    // -- Sink errors ---------------------------------------------------------
    /// SQLite operation against the relational sink failed.
    #[error("sink error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Only read-only statements are allowed through the sink query surface.
    #[error("sink query rejected: {0}")]
    SinkQueryRejected(String),

    // -- Infrastructure ------------------------------------------------------
    /// JSON serialization or deserialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A blocking task was cancelled or panicked.
    #[error("background task failed: {0}")]
    TaskJoin(String),
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::TaskJoin(err.to_string())
    }
}

impl StoreError {
    /// Machine-readable discriminator used in structured RPC error `data`.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NoneAvailable { .. } => "NONE_AVAILABLE",
            Self::TaskNotFound { .. } => "TASK_NOT_FOUND",
            Self::SubtaskNotFound { .. } => "SUBTASK_NOT_FOUND",
            Self::InstanceNotFound { .. } => "INSTANCE_NOT_FOUND",
            Self::UnknownDependency { .. } => "UNKNOWN_DEPENDENCY",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::AttachmentNotFound { .. } => "ATTACHMENT_NOT_FOUND",
            Self::ConflictNotFound { .. } => "CONFLICT_NOT_FOUND",
            Self::InvalidArgument(_) => "INVALID_ARGUMENT",
            Self::FlushDenied => "FLUSH_DENIED",
            Self::Sqlite(_) => "SINK_ERROR",
            Self::SinkQueryRejected(_) => "SINK_QUERY_REJECTED",
            Self::Json(_) => "JSON_ERROR",
            Self::TaskJoin(_) => "TASK_JOIN",
        }
    }
}
