//! Domain records held in the keyspace.
//!
//! Components hold ids, never cross-owning references — the keyspace is the
//! arena. Every record here is plain serde data; status transitions are
//! driven exclusively by the atomic scripts in [`crate::scripts`].

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};

// ---------------------------------------------------------------------------
// Specialist kinds
// ---------------------------------------------------------------------------

/// Role classification used for routing subtasks to workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpecialistKind {
    Frontend,
    Backend,
    Testing,
    Docs,
    General,
}

impl SpecialistKind {
    /// All kinds, in routing-priority order.
    pub const ALL: [SpecialistKind; 5] = [
        Self::Frontend,
        Self::Backend,
        Self::Testing,
        Self::Docs,
        Self::General,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Frontend => "frontend",
            Self::Backend => "backend",
            Self::Testing => "testing",
            Self::Docs => "docs",
            Self::General => "general",
        }
    }

    pub fn parse(s: &str) -> StoreResult<Self> {
        match s {
            "frontend" => Ok(Self::Frontend),
            "backend" => Ok(Self::Backend),
            "testing" => Ok(Self::Testing),
            "docs" => Ok(Self::Docs),
            "general" => Ok(Self::General),
            other => Err(StoreError::InvalidArgument(format!(
                "unknown specialist kind: {other}"
            ))),
        }
    }
}

impl std::fmt::Display for SpecialistKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Work status (tasks and subtasks)
// ---------------------------------------------------------------------------

/// Lifecycle state shared by parent tasks and subtasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl WorkStatus {
    /// Completed or failed.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

// ---------------------------------------------------------------------------
// Parent tasks
// ---------------------------------------------------------------------------

/// A top-level project submitted by a client.
///
/// Invariant: the task is terminal iff `completed_at` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    /// Natural-language project description.
    pub text: String,
    /// Priority in `[0, 100]`; higher is more urgent.
    pub priority: u8,
    pub status: WorkStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Free-form bag: project id, constraints, requirements.
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl TaskRecord {
    pub fn new(id: impl Into<String>, text: impl Into<String>, priority: u8, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            priority: priority.min(100),
            status: WorkStatus::Pending,
            created_at: now,
            updated_at: now,
            completed_at: None,
            metadata: serde_json::Map::new(),
        }
    }

    /// Move to a terminal status, stamping `completed_at`.
    pub fn finish(&mut self, status: WorkStatus, now: DateTime<Utc>) {
        debug_assert!(status.is_terminal());
        self.status = status;
        self.completed_at = Some(now);
        self.updated_at = now;
    }
}

// ---------------------------------------------------------------------------
// Subtasks
// ---------------------------------------------------------------------------

/// A unit of work produced by decomposition, owned by exactly one parent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubtaskRecord {
    /// Identity, scoped by the parent task.
    pub id: String,
    pub parent_id: String,
    pub description: String,
    pub specialist: SpecialistKind,
    /// Relative complexity estimate from decomposition.
    pub complexity: u32,
    pub estimated_minutes: u32,
    /// Declared predecessors (sibling subtask ids).
    pub dependencies: BTreeSet<String>,
    pub status: WorkStatus,
    /// Specialist instance currently assigned, if any.
    pub assigned_to: Option<String>,
    /// Output produced on completion.
    pub output: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Terminal result reported for a subtask by its specialist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubtaskResult {
    /// `completed` or `failed`.
    pub status: WorkStatus,
    pub output: Option<String>,
}

// ---------------------------------------------------------------------------
// Decomposition input and record
// ---------------------------------------------------------------------------

/// One subtask as proposed by the sampling provider (or the fallback path).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedSubtask {
    /// Stable id within the decomposition; generated when absent.
    #[serde(default)]
    pub id: Option<String>,
    pub description: String,
    pub specialist: SpecialistKind,
    #[serde(default = "default_complexity")]
    pub complexity: u32,
    #[serde(default)]
    pub estimated_minutes: u32,
    /// Sibling ids this subtask depends on.
    #[serde(default)]
    pub dependencies: Vec<String>,
}

fn default_complexity() -> u32 {
    1
}

/// A full decomposition proposal for one parent task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecompositionPlan {
    pub subtasks: Vec<PlannedSubtask>,
    /// Short provider-supplied description of the decomposition strategy.
    #[serde(default)]
    pub strategy: Option<String>,
}

/// Installed decomposition, kept for idempotent re-delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecompositionRecord {
    pub task_id: String,
    pub subtask_ids: Vec<String>,
    pub strategy: Option<String>,
    pub subtask_count: usize,
    pub queued_count: usize,
    pub total_complexity: u64,
    pub installed_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Instances
// ---------------------------------------------------------------------------

/// Liveness/utilization state of a worker instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum InstanceStatus {
    Active,
    Idle,
    Busy,
    Offline,
}

/// A running worker process identified by a stable id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub id: String,
    /// Specialist kinds this instance serves.
    pub roles: BTreeSet<SpecialistKind>,
    pub capabilities: BTreeSet<String>,
    /// Count of currently assigned subtasks. Invariant: `<= max_load`.
    pub current_load: u32,
    pub max_load: u32,
    pub last_heartbeat: DateTime<Utc>,
    pub status: InstanceStatus,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub started_at: DateTime<Utc>,
}

impl InstanceRecord {
    /// Derive ACTIVE/IDLE/BUSY from the load counters. OFFLINE is sticky and
    /// only set by the sweeper or an explicit transition.
    pub fn recompute_status(&mut self) {
        if self.status == InstanceStatus::Offline {
            return;
        }
        self.status = if self.current_load == 0 {
            InstanceStatus::Idle
        } else if self.current_load >= self.max_load {
            InstanceStatus::Busy
        } else {
            InstanceStatus::Active
        };
    }

    pub fn has_capacity(&self) -> bool {
        self.status != InstanceStatus::Offline && self.current_load < self.max_load
    }
}

/// Per-kind pool view: one specialist as seen by the assignment script.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpecialistView {
    pub id: String,
    pub capabilities: BTreeSet<String>,
    pub current_load: u32,
    pub max_load: u32,
    pub last_heartbeat: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Assignments
// ---------------------------------------------------------------------------

/// Live assignment of a subtask to a specialist instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignmentRecord {
    pub parent_id: String,
    pub subtask_id: String,
    pub specialist_id: String,
    pub kind: SpecialistKind,
    /// Match score computed by the assignment script.
    pub score: i64,
    pub assigned_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Conflicts
// ---------------------------------------------------------------------------

/// One specialist's proposed solution for a contested subtask.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proposal {
    pub instance_id: String,
    pub approach: String,
    pub reasoning: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub submitted_at: DateTime<Utc>,
}

/// Arbitration outcome written back by `swarm.resolve`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resolution {
    /// Instance whose proposal was chosen.
    pub chosen_instance_id: String,
    pub reasoning: String,
    #[serde(default)]
    pub recommendations: Vec<String>,
    pub resolved_at: DateTime<Utc>,
}

/// Diverging proposals for the same subtask, keyed `(task, subtask)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub id: String,
    pub task_id: String,
    pub subtask_id: String,
    pub proposals: Vec<Proposal>,
    pub resolution: Option<Resolution>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Attachments
// ---------------------------------------------------------------------------

/// Typed attachment payload. The wire shape matches the catalog: `type`
/// selects the variant and the payload field is `value`, `content`, `url`,
/// or `bytes` accordingly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AttachmentPayload {
    Json { value: serde_json::Value },
    Markdown { content: String },
    Text { content: String },
    Url { url: String },
    Binary {
        #[serde(with = "b64")]
        bytes: Vec<u8>,
    },
}

impl AttachmentPayload {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Json { .. } => "json",
            Self::Markdown { .. } => "markdown",
            Self::Text { .. } => "text",
            Self::Url { .. } => "url",
            Self::Binary { .. } => "binary",
        }
    }
}

/// Attachment on a parent task; `key` is unique per task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentRecord {
    pub id: String,
    pub task_id: String,
    pub key: String,
    #[serde(flatten)]
    pub payload: AttachmentPayload,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
}

/// Serde helper: binary payload bytes as base64 strings on the wire.
mod b64 {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
