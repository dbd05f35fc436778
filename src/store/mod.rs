//! Durable store - the persistence seam for tasks, node rows and the result log
//!
//! Every node write is a row-level compare-and-set on the node's status.
//! Implementations must make that check-and-write atomic.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::core::{NodeState, NodeStatus, ResultEntry, Snapshot, TaskInstance, TaskStatus};
use crate::error::StoreError;
use chrono::{DateTime, Utc};

/// Result of a conditional node update
#[derive(Debug, Clone, PartialEq)]
pub enum CasOutcome {
    /// The row held the expected status and now holds the new state
    Applied(NodeState),
    /// Another writer got there first; this is the row as it stands
    Conflict(NodeState),
}

/// Persistence backend for the engine
pub trait DurableStore: Send + Sync {
    /// Insert a task together with its node rows. Fails if the id exists.
    fn create_task(&self, task: &TaskInstance, nodes: &[NodeState]) -> Result<(), StoreError>;

    /// Read a task and all of its node rows in one consistent view
    fn load_snapshot(&self, task_id: &str) -> Result<Snapshot, StoreError>;

    fn load_node(&self, task_id: &str, node_id: &str) -> Result<NodeState, StoreError>;

    /// Replace the node row with `next` only if its status is still `expected`
    fn compare_and_set_node(
        &self,
        task_id: &str,
        expected: NodeStatus,
        next: &NodeState,
    ) -> Result<CasOutcome, StoreError>;

    /// Refresh `heartbeat_at` if the node is still running; returns whether it was
    fn touch_node(&self, task_id: &str, node_id: &str, at: DateTime<Utc>) -> Result<bool, StoreError>;

    fn set_task_status(&self, task_id: &str, status: TaskStatus, at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Record a cancel request on the task. The first requester is kept.
    fn request_cancel(&self, task_id: &str, actor: &str, at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Append to the result log; returns false if the node already has an entry
    fn append_result(&self, task_id: &str, entry: &ResultEntry) -> Result<bool, StoreError>;

    /// Result log in append order
    fn load_results(&self, task_id: &str) -> Result<Vec<ResultEntry>, StoreError>;

    /// Ids of tasks currently in any of `statuses`, oldest first
    fn list_tasks(&self, statuses: &[TaskStatus]) -> Result<Vec<String>, StoreError>;
}
