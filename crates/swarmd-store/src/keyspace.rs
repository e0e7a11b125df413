//! The shared keyspace.
//!
//! All durable coordination state lives here, as typed maps that mirror the
//! `sw:` key families (`task:{id}`, `subtask:{parent}:{id}`,
//! `dependencies:{parent}:{id}`, `queue:subtasks`, `queue:instance:{id}`,
//! `instance:{id}`, `specialists:{kind}`, `assignment:{subtask}`,
//! `conflict:{task}:{subtask}`, `decomposition:{task}`, `metrics:*`,
//! `events:{stream}`). [`Keyspace`] is never shared directly: the
//! [`crate::store::Store`] wraps it in a mutex and every multi-key mutation
//! runs while holding the guard, which is what makes the scripts in
//! [`crate::scripts`] atomic with respect to each other.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use chrono::{DateTime, Utc};

use crate::error::{StoreError, StoreResult};
use crate::streams::{EventRecord, EventStream, GLOBAL_STREAM};
use crate::types::{
    AssignmentRecord, AttachmentRecord, ConflictRecord, DecompositionRecord, InstanceRecord,
    SpecialistKind, SpecialistView, SubtaskRecord, TaskRecord, WorkStatus,
};

/// Prefix for every key this system owns in the shared namespace.
pub const KEY_PREFIX: &str = "sw:";

/// Default count cap per event stream.
pub const DEFAULT_STREAM_CAP: usize = 10_000;

// ---------------------------------------------------------------------------
// Queue entries
// ---------------------------------------------------------------------------

/// Ready-queue membership: one subtask whose dependencies are satisfied.
///
/// Ordering is priority descending, then enqueue sequence ascending (FIFO
/// among equal priorities), so `BTreeSet::first` is always the next subtask
/// to dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadyEntry {
    pub priority: u8,
    pub seq: u64,
    pub parent_id: String,
    pub subtask_id: String,
}

impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then(self.seq.cmp(&other.seq))
            .then_with(|| self.parent_id.cmp(&other.parent_id))
            .then_with(|| self.subtask_id.cmp(&other.subtask_id))
    }
}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Pending parent-task queue membership (`queue:tasks:pending`), same
/// ordering rule as [`ReadyEntry`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingTaskEntry {
    pub priority: u8,
    pub seq: u64,
    pub task_id: String,
}

impl Ord for PendingTaskEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then(self.seq.cmp(&other.seq))
            .then_with(|| self.task_id.cmp(&other.task_id))
    }
}

impl PartialOrd for PendingTaskEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

// ---------------------------------------------------------------------------
// Keyspace
// ---------------------------------------------------------------------------

/// Aggregate key counts for diagnostics (`system.get_state` /
/// `system.health`).
#[derive(Debug, Clone, serde::Serialize)]
pub struct KeyspaceStats {
    pub tasks: usize,
    pub subtasks: usize,
    pub instances: usize,
    pub ready_queue_depth: usize,
    pub pending_task_depth: usize,
    pub blocked: usize,
    pub conflicts: usize,
    pub attachments: usize,
    pub streams: usize,
    pub events_journaled: u64,
}

/// The full in-memory coordination state.
pub struct Keyspace {
    // task:{id}
    pub tasks: HashMap<String, TaskRecord>,
    // queue:tasks:pending
    pub pending_tasks: BTreeSet<PendingTaskEntry>,
    // subtask:{parent}:{id}
    pub subtasks: HashMap<String, BTreeMap<String, SubtaskRecord>>,
    // dependencies:{parent}:{id} — predecessors
    pub dependencies: HashMap<(String, String), BTreeSet<String>>,
    // dependents:{parent}:{id} — successors (derived reverse index)
    pub dependents: HashMap<(String, String), BTreeSet<String>>,
    // queue:subtasks — the global ready queue
    pub ready: BTreeSet<ReadyEntry>,
    // blocked holding set: dependents of failed/cyclic predecessors
    pub blocked: BTreeSet<(String, String)>,
    // queue:instance:{id}
    pub instance_queues: HashMap<String, VecDeque<(String, String)>>,
    // instance:{id}
    pub instances: HashMap<String, InstanceRecord>,
    // specialists:{kind} — pool membership per kind
    pub specialists: HashMap<SpecialistKind, BTreeSet<String>>,
    // assignment:{subtask}
    pub assignments: HashMap<(String, String), AssignmentRecord>,
    // conflict:{task}:{subtask}
    pub conflicts: HashMap<(String, String), ConflictRecord>,
    // global conflict-ready markers awaiting arbitration
    pub conflict_queue: VecDeque<(String, String)>,
    // decomposition:{task}
    pub decompositions: HashMap<String, DecompositionRecord>,
    // attachments, task -> key -> record (ordered by key)
    pub attachments: HashMap<String, BTreeMap<String, AttachmentRecord>>,
    // events:{stream}
    pub streams: HashMap<String, EventStream>,
    // per-subscriber last-processed event id
    pub cursors: HashMap<String, u64>,
    // metrics:* counters
    pub counters: BTreeMap<String, u64>,
    // free-form values at stable keys (e.g. last hook rejection per session)
    pub values: BTreeMap<String, serde_json::Value>,

    event_seq: u64,
    queue_seq: u64,
    stream_cap: usize,
    /// Events emitted since the guard was taken; drained by the store after
    /// the lock is released and fanned out to live subscribers.
    pending_notifications: Vec<EventRecord>,
}

impl Keyspace {
    pub fn new(stream_cap: usize) -> Self {
        Self {
            tasks: HashMap::new(),
            pending_tasks: BTreeSet::new(),
            subtasks: HashMap::new(),
            dependencies: HashMap::new(),
            dependents: HashMap::new(),
            ready: BTreeSet::new(),
            blocked: BTreeSet::new(),
            instance_queues: HashMap::new(),
            instances: HashMap::new(),
            specialists: HashMap::new(),
            assignments: HashMap::new(),
            conflicts: HashMap::new(),
            conflict_queue: VecDeque::new(),
            decompositions: HashMap::new(),
            attachments: HashMap::new(),
            streams: HashMap::new(),
            cursors: HashMap::new(),
            counters: BTreeMap::new(),
            values: BTreeMap::new(),
            event_seq: 0,
            queue_seq: 0,
            stream_cap,
            pending_notifications: Vec::new(),
        }
    }

    // -- Events --------------------------------------------------------------

    /// Journal an event into its home stream (and the global stream) and
    /// queue it for live fan-out. Called from inside scripts so the journal
    /// write is atomic with the state mutation.
    pub fn emit(
        &mut self,
        stream: impl Into<String>,
        event_type: impl Into<String>,
        payload: serde_json::Value,
        now: DateTime<Utc>,
    ) -> u64 {
        self.event_seq += 1;
        let stream = stream.into();
        let event = EventRecord {
            id: self.event_seq,
            event_type: event_type.into(),
            timestamp: now,
            payload,
            stream: stream.clone(),
        };

        let cap = self.stream_cap;
        self.streams
            .entry(stream.clone())
            .or_default()
            .append(event.clone(), cap);
        if stream != GLOBAL_STREAM {
            self.streams
                .entry(GLOBAL_STREAM.to_string())
                .or_default()
                .append(event.clone(), cap);
        }

        self.pending_notifications.push(event);
        self.event_seq
    }

    /// Drain events emitted during the current critical section.
    pub fn take_notifications(&mut self) -> Vec<EventRecord> {
        std::mem::take(&mut self.pending_notifications)
    }

    /// Read a stream after the given event id.
    pub fn read_stream(&self, stream: &str, after: u64, limit: usize) -> Vec<EventRecord> {
        self.streams
            .get(stream)
            .map(|s| s.read_after(after, limit))
            .unwrap_or_default()
    }

    /// Record a subscriber's last-processed event id (dedup cursor).
    pub fn set_cursor(&mut self, subscriber: &str, event_id: u64) {
        let entry = self.cursors.entry(subscriber.to_string()).or_insert(0);
        if event_id > *entry {
            *entry = event_id;
        }
    }

    pub fn cursor(&self, subscriber: &str) -> u64 {
        self.cursors.get(subscriber).copied().unwrap_or(0)
    }

    pub fn last_event_id(&self) -> u64 {
        self.event_seq
    }

    // -- Tasks ---------------------------------------------------------------

    pub fn insert_task(&mut self, task: TaskRecord) {
        self.tasks.insert(task.id.clone(), task);
    }

    pub fn task(&self, id: &str) -> StoreResult<&TaskRecord> {
        self.tasks.get(id).ok_or_else(|| StoreError::TaskNotFound {
            task_id: id.to_string(),
        })
    }

    pub fn task_mut(&mut self, id: &str) -> StoreResult<&mut TaskRecord> {
        self.tasks
            .get_mut(id)
            .ok_or_else(|| StoreError::TaskNotFound {
                task_id: id.to_string(),
            })
    }

    /// Tasks filtered by status, newest first, bounded by `limit`/`offset`.
    pub fn list_tasks(
        &self,
        status: Option<WorkStatus>,
        limit: usize,
        offset: usize,
    ) -> Vec<TaskRecord> {
        let mut tasks: Vec<&TaskRecord> = self
            .tasks
            .values()
            .filter(|t| status.is_none_or(|s| t.status == s))
            .collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        tasks.into_iter().skip(offset).take(limit).cloned().collect()
    }

    // -- Pending task queue --------------------------------------------------

    pub fn pending_push(&mut self, task_id: &str, priority: u8) {
        self.queue_seq += 1;
        self.pending_tasks.insert(PendingTaskEntry {
            priority,
            seq: self.queue_seq,
            task_id: task_id.to_string(),
        });
    }

    /// Pop the highest-priority pending task satisfying `accept`.
    pub fn pending_pop<F>(&mut self, accept: F) -> Option<PendingTaskEntry>
    where
        F: Fn(&TaskRecord) -> bool,
    {
        let found = self
            .pending_tasks
            .iter()
            .find(|e| self.tasks.get(&e.task_id).is_some_and(&accept))
            .cloned()?;
        self.pending_tasks.remove(&found);
        Some(found)
    }

    pub fn pending_remove(&mut self, task_id: &str) {
        self.pending_tasks.retain(|e| e.task_id != task_id);
    }

    // -- Subtasks ------------------------------------------------------------

    pub fn insert_subtask(&mut self, subtask: SubtaskRecord) {
        self.subtasks
            .entry(subtask.parent_id.clone())
            .or_default()
            .insert(subtask.id.clone(), subtask);
    }

    pub fn subtask(&self, parent_id: &str, subtask_id: &str) -> StoreResult<&SubtaskRecord> {
        self.subtasks
            .get(parent_id)
            .and_then(|m| m.get(subtask_id))
            .ok_or_else(|| StoreError::SubtaskNotFound {
                parent_id: parent_id.to_string(),
                subtask_id: subtask_id.to_string(),
            })
    }

    pub fn subtask_mut(
        &mut self,
        parent_id: &str,
        subtask_id: &str,
    ) -> StoreResult<&mut SubtaskRecord> {
        self.subtasks
            .get_mut(parent_id)
            .and_then(|m| m.get_mut(subtask_id))
            .ok_or_else(|| StoreError::SubtaskNotFound {
                parent_id: parent_id.to_string(),
                subtask_id: subtask_id.to_string(),
            })
    }

    /// All subtasks of a parent, ordered by id.
    pub fn subtasks_of(&self, parent_id: &str) -> Vec<&SubtaskRecord> {
        self.subtasks
            .get(parent_id)
            .map(|m| m.values().collect())
            .unwrap_or_default()
    }

    /// Locate a subtask's parent when only the subtask id is known.
    pub fn find_parent_of(&self, subtask_id: &str) -> Option<String> {
        self.subtasks
            .iter()
            .find(|(_, m)| m.contains_key(subtask_id))
            .map(|(parent, _)| parent.clone())
    }

    // -- Dependency graph ----------------------------------------------------

    pub fn deps_of(&self, parent_id: &str, subtask_id: &str) -> Option<&BTreeSet<String>> {
        self.dependencies
            .get(&(parent_id.to_string(), subtask_id.to_string()))
    }

    pub fn dependents_of(&self, parent_id: &str, subtask_id: &str) -> Option<&BTreeSet<String>> {
        self.dependents
            .get(&(parent_id.to_string(), subtask_id.to_string()))
    }

    /// True iff every declared predecessor of the subtask is completed.
    pub fn deps_satisfied(&self, parent_id: &str, subtask_id: &str) -> bool {
        match self.deps_of(parent_id, subtask_id) {
            None => true,
            Some(deps) => deps.iter().all(|dep| {
                self.subtask(parent_id, dep)
                    .map(|s| s.status == WorkStatus::Completed)
                    .unwrap_or(false)
            }),
        }
    }

    // -- Ready queue ---------------------------------------------------------

    /// Insert into the ready queue. Callers must have checked the membership
    /// invariant (deps satisfied, status pending, not dispatched).
    pub fn ready_push(&mut self, priority: u8, parent_id: &str, subtask_id: &str) {
        self.queue_seq += 1;
        self.ready.insert(ReadyEntry {
            priority,
            seq: self.queue_seq,
            parent_id: parent_id.to_string(),
            subtask_id: subtask_id.to_string(),
        });
        self.blocked
            .remove(&(parent_id.to_string(), subtask_id.to_string()));
    }

    pub fn ready_contains(&self, parent_id: &str, subtask_id: &str) -> bool {
        self.ready
            .iter()
            .any(|e| e.parent_id == parent_id && e.subtask_id == subtask_id)
    }

    pub fn ready_remove(&mut self, parent_id: &str, subtask_id: &str) {
        self.ready
            .retain(|e| !(e.parent_id == parent_id && e.subtask_id == subtask_id));
    }

    /// Pop the best ready entry whose subtask satisfies `accept`.
    pub fn ready_pop<F>(&mut self, accept: F) -> Option<ReadyEntry>
    where
        F: Fn(&SubtaskRecord) -> bool,
    {
        let found = self
            .ready
            .iter()
            .find(|e| {
                self.subtask(&e.parent_id, &e.subtask_id)
                    .map(&accept)
                    .unwrap_or(false)
            })
            .cloned()?;
        self.ready.remove(&found);
        Some(found)
    }

    pub fn ready_snapshot(&self) -> Vec<ReadyEntry> {
        self.ready.iter().cloned().collect()
    }

    // -- Per-instance queues -------------------------------------------------

    pub fn instance_enqueue(&mut self, instance_id: &str, parent_id: &str, subtask_id: &str) -> usize {
        let queue = self.instance_queues.entry(instance_id.to_string()).or_default();
        queue.push_back((parent_id.to_string(), subtask_id.to_string()));
        queue.len()
    }

    pub fn instance_queue(&self, instance_id: &str) -> Vec<(String, String)> {
        self.instance_queues
            .get(instance_id)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn instance_queue_remove(&mut self, instance_id: &str, parent_id: &str, subtask_id: &str) {
        if let Some(queue) = self.instance_queues.get_mut(instance_id) {
            queue.retain(|(p, s)| !(p == parent_id && s == subtask_id));
        }
    }

    /// True iff the subtask sits in any per-instance queue.
    pub fn dispatched_anywhere(&self, parent_id: &str, subtask_id: &str) -> bool {
        self.instance_queues
            .values()
            .any(|q| q.iter().any(|(p, s)| p == parent_id && s == subtask_id))
    }

    // -- Instances & specialist pools ----------------------------------------

    pub fn instance(&self, id: &str) -> StoreResult<&InstanceRecord> {
        self.instances
            .get(id)
            .ok_or_else(|| StoreError::InstanceNotFound {
                instance_id: id.to_string(),
            })
    }

    pub fn instance_mut(&mut self, id: &str) -> StoreResult<&mut InstanceRecord> {
        self.instances
            .get_mut(id)
            .ok_or_else(|| StoreError::InstanceNotFound {
                instance_id: id.to_string(),
            })
    }

    /// Register pool membership for each of the instance's roles.
    pub fn pool_add(&mut self, instance: &InstanceRecord) {
        for role in &instance.roles {
            self.specialists
                .entry(*role)
                .or_default()
                .insert(instance.id.clone());
        }
    }

    pub fn pool_remove(&mut self, instance_id: &str) {
        for members in self.specialists.values_mut() {
            members.remove(instance_id);
        }
    }

    /// Snapshot of the specialist pool for one kind, as the assignment
    /// script sees it.
    pub fn pool_view(&self, kind: SpecialistKind) -> Vec<SpecialistView> {
        self.specialists
            .get(&kind)
            .into_iter()
            .flatten()
            .filter_map(|id| self.instances.get(id))
            .map(|inst| SpecialistView {
                id: inst.id.clone(),
                capabilities: inst.capabilities.clone(),
                current_load: inst.current_load,
                max_load: inst.max_load,
                last_heartbeat: inst.last_heartbeat,
            })
            .collect()
    }

    // -- Attachments ---------------------------------------------------------

    pub fn put_attachment(&mut self, attachment: AttachmentRecord) {
        self.attachments
            .entry(attachment.task_id.clone())
            .or_default()
            .insert(attachment.key.clone(), attachment);
    }

    pub fn attachment(&self, task_id: &str, key: &str) -> Option<&AttachmentRecord> {
        self.attachments.get(task_id).and_then(|m| m.get(key))
    }

    pub fn remove_attachment(&mut self, task_id: &str, key: &str) -> Option<AttachmentRecord> {
        self.attachments.get_mut(task_id).and_then(|m| m.remove(key))
    }

    /// Attachment keys on a task, in key order.
    pub fn attachment_keys(&self, task_id: &str) -> Vec<String> {
        self.attachments
            .get(task_id)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default()
    }

    // -- Metrics -------------------------------------------------------------

    pub fn incr_counter(&mut self, name: &str, by: u64) {
        *self.counters.entry(name.to_string()).or_insert(0) += by;
    }

    pub fn counters(&self) -> &BTreeMap<String, u64> {
        &self.counters
    }

    // -- Stable-key values ---------------------------------------------------

    pub fn set_value(&mut self, key: &str, value: serde_json::Value) {
        self.values.insert(key.to_string(), value);
    }

    pub fn value(&self, key: &str) -> Option<&serde_json::Value> {
        self.values.get(key)
    }

    // -- Diagnostics ---------------------------------------------------------

    pub fn stats(&self) -> KeyspaceStats {
        KeyspaceStats {
            tasks: self.tasks.len(),
            subtasks: self.subtasks.values().map(|m| m.len()).sum(),
            instances: self.instances.len(),
            ready_queue_depth: self.ready.len(),
            pending_task_depth: self.pending_tasks.len(),
            blocked: self.blocked.len(),
            conflicts: self.conflicts.len(),
            attachments: self.attachments.values().map(|m| m.len()).sum(),
            streams: self.streams.len(),
            events_journaled: self.event_seq,
        }
    }

    /// Render the current state as prefixed key names, the shape
    /// `system.get_state` reports.
    pub fn dump_keys(&self) -> Vec<String> {
        let mut keys = Vec::new();
        for id in self.tasks.keys() {
            keys.push(format!("{KEY_PREFIX}task:{id}"));
        }
        for (parent, subs) in &self.subtasks {
            for id in subs.keys() {
                keys.push(format!("{KEY_PREFIX}subtask:{parent}:{id}"));
            }
        }
        for (parent, id) in self.dependencies.keys() {
            keys.push(format!("{KEY_PREFIX}dependencies:{parent}:{id}"));
        }
        for (parent, id) in self.dependents.keys() {
            keys.push(format!("{KEY_PREFIX}dependents:{parent}:{id}"));
        }
        if !self.ready.is_empty() {
            keys.push(format!("{KEY_PREFIX}queue:subtasks"));
        }
        if !self.pending_tasks.is_empty() {
            keys.push(format!("{KEY_PREFIX}queue:tasks:pending"));
        }
        for id in self.instance_queues.keys() {
            keys.push(format!("{KEY_PREFIX}queue:instance:{id}"));
        }
        for id in self.instances.keys() {
            keys.push(format!("{KEY_PREFIX}instance:{id}"));
        }
        for kind in self.specialists.keys() {
            keys.push(format!("{KEY_PREFIX}specialists:{kind}"));
        }
        for (parent, id) in self.assignments.keys() {
            keys.push(format!("{KEY_PREFIX}assignment:{parent}:{id}"));
        }
        for (task, sub) in self.conflicts.keys() {
            keys.push(format!("{KEY_PREFIX}conflict:{task}:{sub}"));
        }
        for id in self.decompositions.keys() {
            keys.push(format!("{KEY_PREFIX}decomposition:{id}"));
        }
        for name in self.counters.keys() {
            keys.push(format!("{KEY_PREFIX}metrics:{name}"));
        }
        for name in self.values.keys() {
            keys.push(format!("{KEY_PREFIX}{name}"));
        }
        for stream in self.streams.keys() {
            keys.push(format!("{KEY_PREFIX}{stream}"));
        }
        keys.sort();
        keys
    }

    /// Clear all runtime state. The event sequence keeps counting so ids
    /// stay monotonic across a flush.
    pub fn flush(&mut self) {
        self.tasks.clear();
        self.pending_tasks.clear();
        self.subtasks.clear();
        self.dependencies.clear();
        self.dependents.clear();
        self.ready.clear();
        self.blocked.clear();
        self.instance_queues.clear();
        self.instances.clear();
        self.specialists.clear();
        self.assignments.clear();
        self.conflicts.clear();
        self.conflict_queue.clear();
        self.decompositions.clear();
        self.attachments.clear();
        self.streams.clear();
        self.cursors.clear();
        self.counters.clear();
        self.values.clear();
    }
}

impl Default for Keyspace {
    fn default() -> Self {
        Self::new(DEFAULT_STREAM_CAP)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
