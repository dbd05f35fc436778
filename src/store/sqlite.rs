//! SQLite-backed store - survives process restarts

use super::{CasOutcome, DurableStore};
use crate::core::{Graph, NodeState, NodeStatus, ResultEntry, Snapshot, TaskInstance, TaskStatus};
use crate::error::StoreError;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

const SCHEMA: &str = "
    PRAGMA journal_mode=WAL;
    PRAGMA synchronous=NORMAL;
    PRAGMA busy_timeout=2000;

    CREATE TABLE IF NOT EXISTS tasks (
        id TEXT PRIMARY KEY,
        workflow_id TEXT NOT NULL,
        graph_json TEXT NOT NULL,
        status TEXT NOT NULL,
        submitted_by TEXT NOT NULL,
        cancel_requested_by TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status, created_at);

    CREATE TABLE IF NOT EXISTS node_states (
        task_id TEXT NOT NULL REFERENCES tasks(id),
        node_id TEXT NOT NULL,
        position INTEGER NOT NULL,
        status TEXT NOT NULL,
        output TEXT,
        error TEXT,
        attempts INTEGER NOT NULL DEFAULT 0,
        resolved_by TEXT,
        started_at TEXT,
        finished_at TEXT,
        heartbeat_at TEXT,
        PRIMARY KEY (task_id, node_id)
    );

    CREATE TABLE IF NOT EXISTS results (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        task_id TEXT NOT NULL REFERENCES tasks(id),
        node_id TEXT NOT NULL,
        output TEXT NOT NULL,
        recorded_at TEXT NOT NULL,
        UNIQUE (task_id, node_id)
    );
";

const NODE_COLUMNS: &str =
    "node_id, status, output, error, attempts, resolved_by, started_at, finished_at, heartbeat_at";

/// Persistent store in a single SQLite database
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create the database at `path`
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::Backend(format!("creating {}: {}", parent.display(), e))
                })?;
            }
        }
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Private database that vanishes with the store
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn ts(value: &DateTime<Utc>) -> String {
    value.to_rfc3339()
}

fn opt_ts(value: &Option<DateTime<Utc>>) -> Option<String> {
    value.as_ref().map(ts)
}

fn parse_ts(value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))
}

fn parse_opt_ts(value: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    value.as_deref().map(parse_ts).transpose()
}

fn conversion_error(msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        msg.into(),
    )
}

fn node_from_row(row: &Row<'_>) -> rusqlite::Result<NodeState> {
    let status: String = row.get(1)?;
    Ok(NodeState {
        node_id: row.get(0)?,
        status: status.parse().map_err(conversion_error)?,
        output: row.get(2)?,
        error: row.get(3)?,
        attempts: row.get::<_, i64>(4)? as u32,
        resolved_by: row.get(5)?,
        started_at: parse_opt_ts(row.get(6)?)?,
        finished_at: parse_opt_ts(row.get(7)?)?,
        heartbeat_at: parse_opt_ts(row.get(8)?)?,
    })
}

fn select_node(conn: &Connection, task_id: &str, node_id: &str) -> Result<Option<NodeState>, StoreError> {
    let sql = format!(
        "SELECT {} FROM node_states WHERE task_id = ?1 AND node_id = ?2",
        NODE_COLUMNS
    );
    let node = conn
        .query_row(&sql, params![task_id, node_id], node_from_row)
        .optional()?;
    Ok(node)
}

fn select_task(conn: &Connection, task_id: &str) -> Result<TaskInstance, StoreError> {
    let row = conn
        .query_row(
            "SELECT id, workflow_id, graph_json, status, submitted_by, created_at, updated_at,
                    cancel_requested_by
             FROM tasks WHERE id = ?1",
            params![task_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, Option<String>>(7)?,
                ))
            },
        )
        .optional()?
        .ok_or_else(|| StoreError::TaskNotFound(task_id.to_string()))?;

    let (id, workflow_id, graph_json, status, submitted_by, created_at, updated_at, cancel_requested_by) = row;
    let graph: Graph = serde_json::from_str(&graph_json)?;
    Ok(TaskInstance {
        id,
        workflow_id,
        graph,
        status: status.parse().map_err(StoreError::Backend)?,
        submitted_by,
        cancel_requested_by,
        created_at: parse_ts(&created_at)?,
        updated_at: parse_ts(&updated_at)?,
    })
}

impl DurableStore for SqliteStore {
    fn create_task(&self, task: &TaskInstance, nodes: &[NodeState]) -> Result<(), StoreError> {
        let graph_json = serde_json::to_string(&task.graph)?;
        let mut conn = self.lock();
        let tx = conn.transaction()?;

        let exists: bool = tx
            .query_row("SELECT 1 FROM tasks WHERE id = ?1", params![task.id], |_| Ok(true))
            .optional()?
            .unwrap_or(false);
        if exists {
            return Err(StoreError::TaskExists(task.id.clone()));
        }

        tx.execute(
            "INSERT INTO tasks (id, workflow_id, graph_json, status, submitted_by, cancel_requested_by,
                                created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                task.id,
                task.workflow_id,
                graph_json,
                task.status.as_str(),
                task.submitted_by,
                task.cancel_requested_by,
                ts(&task.created_at),
                ts(&task.updated_at),
            ],
        )?;

        for (position, node) in nodes.iter().enumerate() {
            tx.execute(
                "INSERT INTO node_states (task_id, node_id, position, status, output, error, attempts,
                                          resolved_by, started_at, finished_at, heartbeat_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    task.id,
                    node.node_id,
                    position as i64,
                    node.status.as_str(),
                    node.output,
                    node.error,
                    node.attempts as i64,
                    node.resolved_by,
                    opt_ts(&node.started_at),
                    opt_ts(&node.finished_at),
                    opt_ts(&node.heartbeat_at),
                ],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    fn load_snapshot(&self, task_id: &str) -> Result<Snapshot, StoreError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let task = select_task(&tx, task_id)?;

        let sql = format!(
            "SELECT {} FROM node_states WHERE task_id = ?1 ORDER BY position",
            NODE_COLUMNS
        );
        let nodes = {
            let mut stmt = tx.prepare(&sql)?;
            let rows = stmt.query_map(params![task_id], node_from_row)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        tx.commit()?;

        Ok(Snapshot { task, nodes })
    }

    fn load_node(&self, task_id: &str, node_id: &str) -> Result<NodeState, StoreError> {
        let conn = self.lock();
        select_node(&conn, task_id, node_id)?.ok_or_else(|| StoreError::NodeNotFound {
            task_id: task_id.to_string(),
            node_id: node_id.to_string(),
        })
    }

    fn compare_and_set_node(
        &self,
        task_id: &str,
        expected: NodeStatus,
        next: &NodeState,
    ) -> Result<CasOutcome, StoreError> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE node_states
             SET status = ?3, output = ?4, error = ?5, attempts = ?6, resolved_by = ?7,
                 started_at = ?8, finished_at = ?9, heartbeat_at = ?10
             WHERE task_id = ?1 AND node_id = ?2 AND status = ?11",
            params![
                task_id,
                next.node_id,
                next.status.as_str(),
                next.output,
                next.error,
                next.attempts as i64,
                next.resolved_by,
                opt_ts(&next.started_at),
                opt_ts(&next.finished_at),
                opt_ts(&next.heartbeat_at),
                expected.as_str(),
            ],
        )?;

        let current = select_node(&conn, task_id, &next.node_id)?.ok_or_else(|| {
            StoreError::NodeNotFound {
                task_id: task_id.to_string(),
                node_id: next.node_id.clone(),
            }
        })?;

        if changed == 1 {
            Ok(CasOutcome::Applied(current))
        } else {
            Ok(CasOutcome::Conflict(current))
        }
    }

    fn touch_node(&self, task_id: &str, node_id: &str, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE node_states SET heartbeat_at = ?3
             WHERE task_id = ?1 AND node_id = ?2 AND status = 'running'",
            params![task_id, node_id, ts(&at)],
        )?;
        Ok(changed == 1)
    }

    fn set_task_status(&self, task_id: &str, status: TaskStatus, at: DateTime<Utc>) -> Result<(), StoreError> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE tasks SET status = ?2, updated_at = ?3 WHERE id = ?1",
            params![task_id, status.as_str(), ts(&at)],
        )?;
        if changed == 0 {
            return Err(StoreError::TaskNotFound(task_id.to_string()));
        }
        Ok(())
    }

    fn request_cancel(&self, task_id: &str, actor: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE tasks SET cancel_requested_by = COALESCE(cancel_requested_by, ?2), updated_at = ?3
             WHERE id = ?1",
            params![task_id, actor, ts(&at)],
        )?;
        if changed == 0 {
            return Err(StoreError::TaskNotFound(task_id.to_string()));
        }
        Ok(())
    }

    fn append_result(&self, task_id: &str, entry: &ResultEntry) -> Result<bool, StoreError> {
        let conn = self.lock();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO results (task_id, node_id, output, recorded_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![task_id, entry.node_id, entry.output, ts(&entry.recorded_at)],
        )?;
        Ok(inserted == 1)
    }

    fn load_results(&self, task_id: &str) -> Result<Vec<ResultEntry>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT node_id, output, recorded_at FROM results WHERE task_id = ?1 ORDER BY seq",
        )?;
        let rows = stmt.query_map(params![task_id], |row| {
            let recorded_at: String = row.get(2)?;
            Ok(ResultEntry {
                node_id: row.get(0)?,
                output: row.get(1)?,
                recorded_at: parse_ts(&recorded_at)?,
            })
        })?;
        let entries = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    fn list_tasks(&self, statuses: &[TaskStatus]) -> Result<Vec<String>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT id, created_at FROM tasks WHERE status = ?1")?;
        let mut found: Vec<(String, String)> = Vec::new();
        for status in statuses {
            let rows = stmt.query_map(params![status.as_str()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            for row in rows {
                found.push(row?);
            }
        }
        found.sort_by(|a, b| a.1.cmp(&b.1));
        Ok(found.into_iter().map(|(id, _)| id).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{EdgeSpec, Payload, RawNode};

    fn sample_task() -> TaskInstance {
        let graph = Graph::build(
            vec![
                RawNode {
                    id: "draft".into(),
                    kind: "agent".into(),
                    config: serde_json::json!({ "agent_id": "writer", "prompt": "write" }),
                },
                RawNode {
                    id: "review".into(),
                    kind: "human".into(),
                    config: serde_json::json!({ "instructions": "check tone" }),
                },
            ],
            vec![EdgeSpec::new("draft", "review")],
        )
        .unwrap();
        TaskInstance::new("wf-9", graph, "alice")
    }

    #[test]
    fn test_snapshot_round_trip() {
        let store = SqliteStore::open_in_memory().unwrap();
        let task = sample_task();
        store.create_task(&task, &task.initial_node_states()).unwrap();

        let snap = store.load_snapshot(&task.id).unwrap();
        assert_eq!(snap.task.workflow_id, "wf-9");
        assert_eq!(snap.task.submitted_by, "alice");
        assert_eq!(snap.task.graph.nodes(), task.graph.nodes());
        let ids: Vec<&str> = snap.nodes.iter().map(|n| n.node_id.as_str()).collect();
        assert_eq!(ids, vec!["draft", "review"]);
        assert!(snap.nodes.iter().all(|n| n.status == NodeStatus::Pending));
    }

    #[test]
    fn test_cas_conflict_returns_current_row() {
        let store = SqliteStore::open_in_memory().unwrap();
        let task = sample_task();
        store.create_task(&task, &task.initial_node_states()).unwrap();

        let now = Utc::now();
        let pending = store.load_node(&task.id, "draft").unwrap();
        let ready = pending.advance(NodeStatus::Ready, Payload::default(), now);
        assert!(matches!(
            store.compare_and_set_node(&task.id, NodeStatus::Pending, &ready).unwrap(),
            CasOutcome::Applied(_)
        ));

        match store.compare_and_set_node(&task.id, NodeStatus::Pending, &ready).unwrap() {
            CasOutcome::Conflict(row) => assert_eq!(row.status, NodeStatus::Ready),
            other => panic!("expected conflict, got {other:?}"),
        }

        let running = ready.advance(NodeStatus::Running, Payload::default(), now);
        store.compare_and_set_node(&task.id, NodeStatus::Ready, &running).unwrap();
        let row = store.load_node(&task.id, "draft").unwrap();
        assert_eq!(row.attempts, 1);
        assert!(row.heartbeat_at.is_some());
        assert!(store.touch_node(&task.id, "draft", Utc::now()).unwrap());
        assert!(!store.touch_node(&task.id, "review", Utc::now()).unwrap());
    }

    #[test]
    fn test_results_are_unique_per_node() {
        let store = SqliteStore::open_in_memory().unwrap();
        let task = sample_task();
        store.create_task(&task, &task.initial_node_states()).unwrap();

        let entry = ResultEntry {
            node_id: "draft".into(),
            output: "hello".into(),
            recorded_at: Utc::now(),
        };
        assert!(store.append_result(&task.id, &entry).unwrap());
        assert!(!store.append_result(&task.id, &entry).unwrap());

        let log = store.load_results(&task.id).unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].output, "hello");
    }

    #[test]
    fn test_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state/dagrun.db");
        let task = sample_task();
        {
            let store = SqliteStore::open(&path).unwrap();
            store.create_task(&task, &task.initial_node_states()).unwrap();
            store.set_task_status(&task.id, TaskStatus::Running, Utc::now()).unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.list_tasks(&[TaskStatus::Running]).unwrap(), vec![task.id.clone()]);
        assert_eq!(store.load_snapshot(&task.id).unwrap().task.status, TaskStatus::Running);
    }

    #[test]
    fn test_missing_task() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(matches!(
            store.load_snapshot("nope").unwrap_err(),
            StoreError::TaskNotFound(_)
        ));
        assert!(matches!(
            store.set_task_status("nope", TaskStatus::Failed, Utc::now()).unwrap_err(),
            StoreError::TaskNotFound(_)
        ));
        assert!(matches!(
            store.request_cancel("nope", "bob", Utc::now()).unwrap_err(),
            StoreError::TaskNotFound(_)
        ));
    }

    #[test]
    fn test_cancel_request_keeps_first_actor() {
        let store = SqliteStore::open_in_memory().unwrap();
        let task = sample_task();
        store.create_task(&task, &task.initial_node_states()).unwrap();
        assert!(store.load_snapshot(&task.id).unwrap().task.cancel_requested_by.is_none());

        store.request_cancel(&task.id, "bob", Utc::now()).unwrap();
        store.request_cancel(&task.id, "carol", Utc::now()).unwrap();
        let snap = store.load_snapshot(&task.id).unwrap();
        assert_eq!(snap.task.cancel_requested_by.as_deref(), Some("bob"));
        assert!(snap.cancel_requested());
    }
}
