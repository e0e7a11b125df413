//! swarmd coordination services.
//!
//! Everything between the RPC surface and the store:
//!
//! - **[`instances`]** -- Worker registration, heartbeat TTL, the failure
//!   sweeper, and reassignment on OFFLINE.
//! - **[`queue`]** -- Priority task queue with capacity-checked, bounded
//!   long-poll pulls.
//! - **[`coordinator`]** -- The LLM-driven phases (decompose, context,
//!   resolve, synthesize) with idempotent state writes and deterministic
//!   fallbacks.
//! - **[`sampling`]** -- The provider HTTP client with backoff, jitter, and
//!   schema validation.
//! - **[`templates`]** -- handlebars prompt/brief rendering (HTML-escaping,
//!   total on empty input).

pub mod coordinator;
pub mod error;
pub mod instances;
pub mod queue;
pub mod sampling;
pub mod templates;

pub use coordinator::{DecomposeSummary, SwarmCoordinator};
pub use error::{CoordError, CoordResult};
pub use instances::{InstanceConfig, InstanceManager, RegisterRequest, SweepReport};
pub use queue::{CLAIMED_BY_KEY, TaskQueue};
pub use sampling::{
    CompletedWork, ContextBrief, ContextRequest, DecomposeRequest, IntegrationStatus, PoolEntry,
    ResolutionChoice, ResolveRequest, SamplingClient, SamplingConfig, SynthesisReport,
    SynthesizeRequest,
};
pub use templates::TemplateEngine;
