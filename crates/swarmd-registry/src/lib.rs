//! swarmd method registry.
//!
//! Handler table keyed by dotted method names, with the cross-cutting
//! pipeline applied as declarative configuration at registration time:
//!
//! - **[`registry`]** -- Dispatch: validate → rate limit → circuit → cache →
//!   invoke → record.
//! - **[`handler`]** -- The [`handler::Handler`] trait, [`handler::FnHandler`]
//!   closure adapter, [`handler::MethodConfig`], and the sink
//!   [`handler::Persister`] hook.
//! - **[`rate_limit`]** -- Per-client token buckets.
//! - **[`circuit`]** -- Closed/Open/HalfOpen breaker with single-probe
//!   half-open.
//! - **[`cache`]** -- moka-backed result cache keyed by param fingerprints.
//! - **[`metrics`]** -- Per-method counters and a bounded latency ring.

pub mod cache;
pub mod circuit;
pub mod error;
pub mod handler;
pub mod metrics;
pub mod rate_limit;
pub mod registry;

pub use cache::{CacheStats, ResultCache};
pub use circuit::{CircuitBreaker, CircuitState};
pub use error::{RegistryError, RegistryResult};
pub use handler::{
    CacheRule, CircuitRule, FnHandler, Handler, MethodConfig, Persister, RateLimitRule,
    RequestContext, Validator,
};
pub use metrics::{MethodMetrics, MetricsRegistry};
pub use rate_limit::RateLimiter;
pub use registry::Registry;
