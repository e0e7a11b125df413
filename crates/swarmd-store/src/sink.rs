//! Relational sink: write-through archival of tasks, subtasks, attachments,
//! and assignment history.
//!
//! SQLite with WAL mode behind an `Arc<Mutex<Connection>>`; all access goes
//! through [`Sink::execute`], which dispatches onto the blocking thread pool
//! via `tokio::task::spawn_blocking` so the async runtime never stalls on
//! file I/O. The sink is the slower, durable path: handlers write through to
//! it after the keyspace commit, and attachment reads fall back to it when
//! the in-store copy has been evicted.

use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::Connection;
use tracing::{debug, info};

use crate::error::{StoreError, StoreResult};
use crate::types::{AssignmentRecord, AttachmentRecord, SubtaskRecord, TaskRecord};

/// Thread-safe handle to the archival database.
#[derive(Clone)]
pub struct Sink {
    conn: Arc<Mutex<Connection>>,
}

impl Sink {
    /// Open (or create) the sink at `path`, apply pragmas, and ensure the
    /// schema exists.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "opening relational sink");

        let conn = Connection::open(path)?;
        Self::apply_pragmas(&conn)?;
        Self::init_schema(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory sink — used by tests and by deployments that opt out of
    /// durable archival.
    pub fn open_in_memory() -> StoreResult<Self> {
        debug!("opening in-memory sink");
        let conn = Connection::open_in_memory()?;
        Self::apply_pragmas(&conn)?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Execute a closure against the connection on the blocking pool.
    pub async fn execute<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&Connection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|e| StoreError::TaskJoin(format!("mutex poisoned: {e}")))?;
            f(&conn)
        })
        .await?
    }

    fn apply_pragmas(conn: &Connection) -> StoreResult<()> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "temp_store", "MEMORY")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "busy_timeout", 5_000_i32)?;
        Ok(())
    }

    fn init_schema(conn: &Connection) -> StoreResult<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS tasks (
                 id           TEXT PRIMARY KEY,
                 status       TEXT NOT NULL,
                 priority     INTEGER NOT NULL,
                 created_at   INTEGER NOT NULL,
                 completed_at INTEGER,
                 record       TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS subtasks (
                 parent_id    TEXT NOT NULL,
                 id           TEXT NOT NULL,
                 status       TEXT NOT NULL,
                 specialist   TEXT NOT NULL,
                 record       TEXT NOT NULL,
                 PRIMARY KEY (parent_id, id)
             );
             CREATE TABLE IF NOT EXISTS attachments (
                 task_id    TEXT NOT NULL,
                 key        TEXT NOT NULL,
                 type       TEXT NOT NULL,
                 created_at INTEGER NOT NULL,
                 record     TEXT NOT NULL,
                 PRIMARY KEY (task_id, key)
             );
             CREATE TABLE IF NOT EXISTS assignment_history (
                 seq           INTEGER PRIMARY KEY AUTOINCREMENT,
                 parent_id     TEXT NOT NULL,
                 subtask_id    TEXT NOT NULL,
                 specialist_id TEXT NOT NULL,
                 kind          TEXT NOT NULL,
                 score         INTEGER NOT NULL,
                 assigned_at   INTEGER NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_subtasks_parent ON subtasks (parent_id);
             CREATE INDEX IF NOT EXISTS idx_history_subtask
                 ON assignment_history (parent_id, subtask_id);",
        )?;
        Ok(())
    }

    // -- Write-through -------------------------------------------------------

    /// Upsert a parent task.
    pub async fn archive_task(&self, task: &TaskRecord) -> StoreResult<()> {
        let record = serde_json::to_string(task)?;
        let id = task.id.clone();
        let status = task.status.as_str();
        let priority = i64::from(task.priority);
        let created_at = task.created_at.timestamp();
        let completed_at = task.completed_at.map(|t| t.timestamp());

        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO tasks (id, status, priority, created_at, completed_at, record)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT (id) DO UPDATE SET
                     status = excluded.status,
                     completed_at = excluded.completed_at,
                     record = excluded.record",
                rusqlite::params![id, status, priority, created_at, completed_at, record],
            )?;
            Ok(())
        })
        .await
    }

    /// Upsert a subtask.
    pub async fn archive_subtask(&self, subtask: &SubtaskRecord) -> StoreResult<()> {
        let record = serde_json::to_string(subtask)?;
        let parent_id = subtask.parent_id.clone();
        let id = subtask.id.clone();
        let status = subtask.status.as_str();
        let specialist = subtask.specialist.as_str();

        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO subtasks (parent_id, id, status, specialist, record)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (parent_id, id) DO UPDATE SET
                     status = excluded.status,
                     record = excluded.record",
                rusqlite::params![parent_id, id, status, specialist, record],
            )?;
            Ok(())
        })
        .await
    }

    /// Write an attachment through to the archive. Failure here is fatal to
    /// the attachment create — the caller must not report partial success.
    pub async fn put_attachment(&self, attachment: &AttachmentRecord) -> StoreResult<()> {
        let record = serde_json::to_string(attachment)?;
        let task_id = attachment.task_id.clone();
        let key = attachment.key.clone();
        let type_name = attachment.payload.type_name();
        let created_at = attachment.created_at.timestamp();

        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO attachments (task_id, key, type, created_at, record)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (task_id, key) DO UPDATE SET
                     type = excluded.type,
                     record = excluded.record",
                rusqlite::params![task_id, key, type_name, created_at, record],
            )?;
            Ok(())
        })
        .await
    }

    /// Read-through path: fetch an attachment the keyspace no longer holds.
    pub async fn get_attachment(
        &self,
        task_id: &str,
        key: &str,
    ) -> StoreResult<Option<AttachmentRecord>> {
        let task_id = task_id.to_string();
        let key = key.to_string();

        self.execute(move |conn| {
            let record: Option<String> = conn
                .query_row(
                    "SELECT record FROM attachments WHERE task_id = ?1 AND key = ?2",
                    rusqlite::params![task_id, key],
                    |row| row.get(0),
                )
                .map(Some)
                .or_else(|err| match err {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(other),
                })?;
            match record {
                Some(json) => Ok(Some(serde_json::from_str(&json)?)),
                None => Ok(None),
            }
        })
        .await
    }

    /// Append one row of assignment history.
    pub async fn record_assignment(&self, assignment: &AssignmentRecord) -> StoreResult<()> {
        let parent_id = assignment.parent_id.clone();
        let subtask_id = assignment.subtask_id.clone();
        let specialist_id = assignment.specialist_id.clone();
        let kind = assignment.kind.as_str();
        let score = assignment.score;
        let assigned_at = assignment.assigned_at.timestamp();

        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO assignment_history
                     (parent_id, subtask_id, specialist_id, kind, score, assigned_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![parent_id, subtask_id, specialist_id, kind, score, assigned_at],
            )?;
            Ok(())
        })
        .await
    }

    // -- Query surface -------------------------------------------------------

    /// Names of user tables in the archive.
    pub async fn tables(&self) -> StoreResult<Vec<String>> {
        self.execute(|conn| {
            let mut stmt = conn.prepare(
                "SELECT name FROM sqlite_master
                 WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
                 ORDER BY name",
            )?;
            let names = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(names)
        })
        .await
    }

    /// Run a read-only query against the archive and return rows as JSON
    /// objects. Anything other than a single SELECT is rejected.
    pub async fn query(&self, sql: &str, limit: usize) -> StoreResult<Vec<serde_json::Value>> {
        let trimmed = sql.trim();
        if !trimmed.to_ascii_lowercase().starts_with("select") {
            return Err(StoreError::SinkQueryRejected(
                "only SELECT statements are allowed".into(),
            ));
        }
        if trimmed.trim_end_matches(';').contains(';') {
            return Err(StoreError::SinkQueryRejected(
                "multiple statements are not allowed".into(),
            ));
        }

        let sql = trimmed.to_string();
        self.execute(move |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();

            let mut rows_out = Vec::new();
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                if rows_out.len() >= limit {
                    break;
                }
                let mut object = serde_json::Map::new();
                for (i, name) in columns.iter().enumerate() {
                    let value = match row.get_ref(i)? {
                        rusqlite::types::ValueRef::Null => serde_json::Value::Null,
                        rusqlite::types::ValueRef::Integer(v) => v.into(),
                        rusqlite::types::ValueRef::Real(v) => serde_json::Number::from_f64(v)
                            .map(serde_json::Value::Number)
                            .unwrap_or(serde_json::Value::Null),
                        rusqlite::types::ValueRef::Text(v) => {
                            serde_json::Value::String(String::from_utf8_lossy(v).into_owned())
                        }
                        rusqlite::types::ValueRef::Blob(v) => {
                            serde_json::Value::String(format!("<{} bytes>", v.len()))
                        }
                    };
                    object.insert(name.clone(), value);
                }
                rows_out.push(serde_json::Value::Object(object));
            }
            Ok(rows_out)
        })
        .await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AttachmentPayload, SpecialistKind, WorkStatus};
    use chrono::Utc;

    #[tokio::test]
    async fn archive_and_query_task() {
        let sink = Sink::open_in_memory().unwrap();
        let mut task = TaskRecord::new("t1", "ship it", 80, Utc::now());
        sink.archive_task(&task).await.unwrap();

        // Upsert on status change.
        task.finish(WorkStatus::Completed, Utc::now());
        sink.archive_task(&task).await.unwrap();

        let rows = sink
            .query("SELECT id, status, priority FROM tasks", 10)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["id"], "t1");
        assert_eq!(rows[0]["status"], "completed");
        assert_eq!(rows[0]["priority"], 80);
    }

    #[tokio::test]
    async fn attachment_roundtrip() {
        let sink = Sink::open_in_memory().unwrap();
        let attachment = AttachmentRecord {
            id: "a1".into(),
            task_id: "t2".into(),
            key: "k1".into(),
            payload: AttachmentPayload::Json {
                value: serde_json::json!({"foo": "bar"}),
            },
            created_at: Utc::now(),
            created_by: Some("w1".into()),
        };
        sink.put_attachment(&attachment).await.unwrap();

        let loaded = sink.get_attachment("t2", "k1").await.unwrap().unwrap();
        assert_eq!(loaded.payload, attachment.payload);
        assert_eq!(loaded.created_by.as_deref(), Some("w1"));

        assert!(sink.get_attachment("t2", "missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn query_rejects_writes() {
        let sink = Sink::open_in_memory().unwrap();
        let err = sink.query("DELETE FROM tasks", 10).await.unwrap_err();
        assert!(matches!(err, StoreError::SinkQueryRejected(_)));

        let err = sink
            .query("SELECT 1; DROP TABLE tasks", 10)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::SinkQueryRejected(_)));
    }

    #[tokio::test]
    async fn tables_lists_schema() {
        let sink = Sink::open_in_memory().unwrap();
        let tables = sink.tables().await.unwrap();
        assert!(tables.contains(&"tasks".to_string()));
        assert!(tables.contains(&"subtasks".to_string()));
        assert!(tables.contains(&"attachments".to_string()));
        assert!(tables.contains(&"assignment_history".to_string()));
    }

    #[tokio::test]
    async fn assignment_history_appends() {
        let sink = Sink::open_in_memory().unwrap();
        let assignment = AssignmentRecord {
            parent_id: "t1".into(),
            subtask_id: "st-1".into(),
            specialist_id: "w1".into(),
            kind: SpecialistKind::Backend,
            score: 9,
            assigned_at: Utc::now(),
        };
        sink.record_assignment(&assignment).await.unwrap();
        sink.record_assignment(&assignment).await.unwrap();

        let rows = sink
            .query("SELECT count(*) AS n FROM assignment_history", 10)
            .await
            .unwrap();
        assert_eq!(rows[0]["n"], 2);
    }

    #[tokio::test]
    async fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sink.db");

        {
            let sink = Sink::open(&path).unwrap();
            sink.archive_task(&TaskRecord::new("t1", "x", 5, Utc::now()))
                .await
                .unwrap();
        }

        let sink = Sink::open(&path).unwrap();
        let rows = sink.query("SELECT id FROM tasks", 10).await.unwrap();
        assert_eq!(rows.len(), 1);
    }
}
