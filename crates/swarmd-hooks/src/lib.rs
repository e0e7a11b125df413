//! swarmd hook validator.
//!
//! Pre/post tool policy evaluation for specialist workers: a deny list for
//! destructive commands, a `sudo`-strip rewrite, a warn list for heavyweight
//! operations, and a system-path write block — with a short-TTL decision
//! cache and an append-only audit stream.

pub mod error;
pub mod policy;
pub mod validator;

pub use error::{HookError, HookResult};
pub use policy::{Decision, HookPolicy, ToolInvocation};
pub use validator::{HookValidator, PostTransform};
