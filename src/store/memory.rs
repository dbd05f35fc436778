//! In-process store - for tests and single-run embedding

use super::{CasOutcome, DurableStore};
use crate::core::{NodeState, NodeStatus, ResultEntry, Snapshot, TaskInstance, TaskStatus};
use crate::error::StoreError;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

struct TaskRecord {
    task: TaskInstance,
    nodes: Vec<NodeState>,
    results: Vec<ResultEntry>,
}

/// Store kept entirely in memory, guarded by a single mutex
#[derive(Default)]
pub struct MemoryStore {
    tasks: Mutex<HashMap<String, TaskRecord>>,
    /// Number of upcoming writes that fail with a transient error
    injected_failures: AtomicU32,
    /// Same for reads
    injected_read_failures: AtomicU32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` write operations fail with [`StoreError::Transient`]
    pub fn fail_next_writes(&self, count: u32) {
        self.injected_failures.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` read operations fail with [`StoreError::Transient`]
    pub fn fail_next_reads(&self, count: u32) {
        self.injected_read_failures.store(count, Ordering::SeqCst);
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, TaskRecord>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_injected(&self) -> Result<(), StoreError> {
        take_injected(&self.injected_failures, "injected write failure")
    }

    fn check_injected_read(&self) -> Result<(), StoreError> {
        take_injected(&self.injected_read_failures, "injected read failure")
    }
}

fn take_injected(counter: &AtomicU32, what: &str) -> Result<(), StoreError> {
    match counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)) {
        Ok(_) => Err(StoreError::Transient(what.to_string())),
        Err(_) => Ok(()),
    }
}

fn not_found(task_id: &str) -> StoreError {
    StoreError::TaskNotFound(task_id.to_string())
}

fn node_not_found(task_id: &str, node_id: &str) -> StoreError {
    StoreError::NodeNotFound {
        task_id: task_id.to_string(),
        node_id: node_id.to_string(),
    }
}

impl DurableStore for MemoryStore {
    fn create_task(&self, task: &TaskInstance, nodes: &[NodeState]) -> Result<(), StoreError> {
        self.check_injected()?;
        let mut tasks = self.lock();
        if tasks.contains_key(&task.id) {
            return Err(StoreError::TaskExists(task.id.clone()));
        }
        tasks.insert(
            task.id.clone(),
            TaskRecord {
                task: task.clone(),
                nodes: nodes.to_vec(),
                results: Vec::new(),
            },
        );
        Ok(())
    }

    fn load_snapshot(&self, task_id: &str) -> Result<Snapshot, StoreError> {
        self.check_injected_read()?;
        let tasks = self.lock();
        let record = tasks.get(task_id).ok_or_else(|| not_found(task_id))?;
        Ok(Snapshot {
            task: record.task.clone(),
            nodes: record.nodes.clone(),
        })
    }

    fn load_node(&self, task_id: &str, node_id: &str) -> Result<NodeState, StoreError> {
        self.check_injected_read()?;
        let tasks = self.lock();
        let record = tasks.get(task_id).ok_or_else(|| not_found(task_id))?;
        record
            .nodes
            .iter()
            .find(|n| n.node_id == node_id)
            .cloned()
            .ok_or_else(|| node_not_found(task_id, node_id))
    }

    fn compare_and_set_node(
        &self,
        task_id: &str,
        expected: NodeStatus,
        next: &NodeState,
    ) -> Result<CasOutcome, StoreError> {
        self.check_injected()?;
        let mut tasks = self.lock();
        let record = tasks.get_mut(task_id).ok_or_else(|| not_found(task_id))?;
        let row = record
            .nodes
            .iter_mut()
            .find(|n| n.node_id == next.node_id)
            .ok_or_else(|| node_not_found(task_id, &next.node_id))?;

        if row.status != expected {
            return Ok(CasOutcome::Conflict(row.clone()));
        }
        *row = next.clone();
        Ok(CasOutcome::Applied(row.clone()))
    }

    fn touch_node(&self, task_id: &str, node_id: &str, at: DateTime<Utc>) -> Result<bool, StoreError> {
        self.check_injected()?;
        let mut tasks = self.lock();
        let record = tasks.get_mut(task_id).ok_or_else(|| not_found(task_id))?;
        let row = record
            .nodes
            .iter_mut()
            .find(|n| n.node_id == node_id)
            .ok_or_else(|| node_not_found(task_id, node_id))?;
        if row.status != NodeStatus::Running {
            return Ok(false);
        }
        row.heartbeat_at = Some(at);
        Ok(true)
    }

    fn set_task_status(&self, task_id: &str, status: TaskStatus, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.check_injected()?;
        let mut tasks = self.lock();
        let record = tasks.get_mut(task_id).ok_or_else(|| not_found(task_id))?;
        record.task.status = status;
        record.task.updated_at = at;
        Ok(())
    }

    fn request_cancel(&self, task_id: &str, actor: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.check_injected()?;
        let mut tasks = self.lock();
        let record = tasks.get_mut(task_id).ok_or_else(|| not_found(task_id))?;
        record.task.cancel_requested_by.get_or_insert_with(|| actor.to_string());
        record.task.updated_at = at;
        Ok(())
    }

    fn append_result(&self, task_id: &str, entry: &ResultEntry) -> Result<bool, StoreError> {
        self.check_injected()?;
        let mut tasks = self.lock();
        let record = tasks.get_mut(task_id).ok_or_else(|| not_found(task_id))?;
        if record.results.iter().any(|r| r.node_id == entry.node_id) {
            return Ok(false);
        }
        record.results.push(entry.clone());
        Ok(true)
    }

    fn load_results(&self, task_id: &str) -> Result<Vec<ResultEntry>, StoreError> {
        self.check_injected_read()?;
        let tasks = self.lock();
        let record = tasks.get(task_id).ok_or_else(|| not_found(task_id))?;
        Ok(record.results.clone())
    }

    fn list_tasks(&self, statuses: &[TaskStatus]) -> Result<Vec<String>, StoreError> {
        self.check_injected_read()?;
        let tasks = self.lock();
        let mut matching: Vec<&TaskRecord> = tasks
            .values()
            .filter(|r| statuses.contains(&r.task.status))
            .collect();
        matching.sort_by_key(|r| r.task.created_at);
        Ok(matching.into_iter().map(|r| r.task.id.clone()).collect())
    }
}
