//! Error types for the swarmd-bus crate.

use thiserror::Error;

/// Alias for `Result<T, BusError>`.
pub type BusResult<T> = Result<T, BusError>;

/// Errors surfaced by subscriptions.
#[derive(Debug, Error)]
pub enum BusError {
    /// The live channel closed because the store was dropped.
    #[error("event channel closed")]
    Closed,

    /// The subscriber fell behind the live channel and `skipped` events were
    /// dropped from its buffer. The durable copies are still in the journal;
    /// callers should catch up via their cursor.
    #[error("subscriber lagged, {skipped} events skipped")]
    Lagged { skipped: u64 },

    /// An invalid subscription pattern was supplied.
    #[error("invalid event pattern: {0}")]
    InvalidPattern(String),
}
