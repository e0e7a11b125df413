//! swarmd event bus.
//!
//! Durable at-least-once pub/sub layered on the store's event journal:
//! publishing is synchronous with the mutating script, live delivery fans
//! out over a broadcast channel, and per-subscriber cursors provide dedup
//! and catch-up. Ordering is total per stream; there is no cross-stream
//! ordering.

pub mod bus;
pub mod error;
pub mod pattern;

pub use bus::{EventBus, Subscription};
pub use error::{BusError, BusResult};
pub use pattern::{EventPattern, PatternSet};
