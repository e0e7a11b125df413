//! swarmd RPC surface.
//!
//! - **[`envelope`]** -- `{protocol: "2.0", method, params, id?}` parsing,
//!   batches, notifications.
//! - **[`error`]** -- The fixed error-code table and conversions from the
//!   dispatch pipeline.
//! - **[`server`]** -- axum `POST /rpc` plus registry wiring.
//! - **[`ws`]** -- The bidirectional transport: envelopes plus
//!   subscribe/unsubscribe control frames and event delivery.
//! - **[`methods`]** -- The full method catalog (`system.*`, `task.*`,
//!   `swarm.*`, `hook.*`, `docs.*`) with per-method decorator configs.
//! - **[`state`]** -- The process-scoped [`state::SwarmContext`] threaded
//!   into every handler.

pub mod envelope;
pub mod error;
pub mod methods;
pub mod server;
pub mod state;
mod ws;

pub use envelope::{
    PROTOCOL_VERSION, RequestDocument, RequestEnvelope, RequestId, ResponseEnvelope,
    parse_request,
};
pub use error::{RpcCode, RpcErrorObject};
pub use server::RpcServer;
pub use state::{SinkPersister, SwarmContext};
