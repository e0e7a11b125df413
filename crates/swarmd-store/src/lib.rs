//! swarmd coordination store.
//!
//! This crate owns all durable coordination state:
//!
//! - **[`keyspace`]** -- The typed keyspace mirroring the `sw:` key families,
//!   with queues, dependency indexes, pools, and metrics counters.
//! - **[`scripts`]** -- The atomic multi-key scripts (decomposition install,
//!   specialist assignment, conflict detection, progress/unblocking,
//!   instance reassignment) that run single-threaded on the store.
//! - **[`store`]** -- The mutex-guarded [`store::Store`] handle whose `run`
//!   closures are the serialization point for every script.
//! - **[`streams`]** -- Append-only event journal streams partitioned by
//!   aggregate, trimmed by count.
//! - **[`sink`]** -- SQLite write-through archive of tasks, subtasks,
//!   attachments, and assignment history, with attachment read-through.
//! - **[`types`]** -- The domain records (tasks, subtasks, instances,
//!   conflicts, attachments, decompositions).

pub mod error;
pub mod keyspace;
pub mod scripts;
pub mod sink;
pub mod store;
pub mod streams;
pub mod types;

pub use error::{StoreError, StoreResult};
pub use keyspace::{KEY_PREFIX, Keyspace, KeyspaceStats, PendingTaskEntry, ReadyEntry};
pub use scripts::{
    AssignOutcome, ConflictOutcome, DecomposeOutcome, ProgressOutcome, ReassignOutcome,
};
pub use sink::Sink;
pub use store::{Store, StoreConfig};
pub use streams::{AUDIT_STREAM, EventRecord, GLOBAL_STREAM, instance_stream, task_stream};
pub use types::{
    AssignmentRecord, AttachmentPayload, AttachmentRecord, ConflictRecord, DecompositionPlan,
    DecompositionRecord, InstanceRecord, InstanceStatus, PlannedSubtask, Proposal, Resolution,
    SpecialistKind, SpecialistView, SubtaskRecord, SubtaskResult, TaskRecord, WorkStatus,
};
