//! Status store - task-scoped access to the durable store
//!
//! All node mutations go through [`StatusStore::compare_and_set`]. Transient
//! backend failures are retried with bounded backoff; when retries run out the
//! node being written is marked failed with a store-error annotation so the
//! task can still converge.

use super::status::{NodeState, NodeStatus, Payload, ResultEntry, Snapshot, TaskInstance, TaskStatus};
use crate::config::RetryPolicy;
use crate::error::{EngineError, StoreError};
use crate::store::{CasOutcome, DurableStore};
use chrono::Utc;
use std::sync::{Arc, PoisonError, RwLock};

pub struct StatusStore {
    task_id: String,
    store: Arc<dyn DurableStore>,
    retry: RetryPolicy,
    /// Last snapshot read, patched with every write this process made
    cache: RwLock<Option<Snapshot>>,
}

impl StatusStore {
    /// Handle for an existing task
    pub fn new(task_id: impl Into<String>, store: Arc<dyn DurableStore>, retry: RetryPolicy) -> Self {
        Self {
            task_id: task_id.into(),
            store,
            retry,
            cache: RwLock::new(None),
        }
    }

    /// Persist a new task with every node `pending`
    pub async fn initialize(
        task: TaskInstance,
        store: Arc<dyn DurableStore>,
        retry: RetryPolicy,
    ) -> Result<Self, EngineError> {
        let nodes = task.initial_node_states();
        let status = Self::new(task.id.clone(), store, retry);
        status
            .with_retry("create task", || status.store.create_task(&task, &nodes))
            .await?;
        status.replace_cache(Snapshot { task, nodes });
        Ok(status)
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Fresh read of the task and all node rows
    pub async fn load_snapshot(&self) -> Result<Snapshot, EngineError> {
        let snapshot = self
            .with_retry("load snapshot", || self.store.load_snapshot(&self.task_id))
            .await
            .map_err(EngineError::from_store)?;
        self.replace_cache(snapshot.clone());
        Ok(snapshot)
    }

    pub async fn load_node(&self, node_id: &str) -> Result<NodeState, EngineError> {
        let node = self
            .with_retry("load node", || self.store.load_node(&self.task_id, node_id))
            .await
            .map_err(EngineError::from_store)?;
        self.remember(&node);
        Ok(node)
    }

    /// Last known state without touching the backend
    pub fn cached_snapshot(&self) -> Option<Snapshot> {
        self.cache.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Move `current` to `target` if the stored row still has `current.status`.
    ///
    /// A [`CasOutcome::Conflict`] means another writer advanced the node; the
    /// caller must re-read and re-evaluate rather than retry.
    pub async fn compare_and_set(
        &self,
        current: &NodeState,
        target: NodeStatus,
        payload: Payload,
    ) -> Result<CasOutcome, EngineError> {
        if !current.status.can_transition_to(target) {
            return Err(EngineError::IllegalTransition {
                node_id: current.node_id.clone(),
                from: current.status,
                to: target,
            });
        }
        let next = current.advance(target, payload, Utc::now());
        self.write(current, next).await
    }

    /// Hand a crashed `running` node back to `pending` for re-dispatch
    pub async fn reclaim(&self, current: &NodeState) -> Result<CasOutcome, EngineError> {
        if current.status != NodeStatus::Running {
            return Err(EngineError::IllegalTransition {
                node_id: current.node_id.clone(),
                from: current.status,
                to: NodeStatus::Pending,
            });
        }
        self.write(current, current.reclaimed()).await
    }

    /// Refresh a running node's lease
    pub async fn heartbeat(&self, node_id: &str) -> Result<bool, EngineError> {
        let alive = self
            .with_retry("heartbeat", || self.store.touch_node(&self.task_id, node_id, Utc::now()))
            .await
            .map_err(EngineError::from_store)?;
        Ok(alive)
    }

    pub async fn set_task_status(&self, status: TaskStatus) -> Result<(), EngineError> {
        let now = Utc::now();
        self.with_retry("set task status", || self.store.set_task_status(&self.task_id, status, now))
            .await
            .map_err(EngineError::from_store)?;

        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(snapshot) = cache.as_mut() {
            snapshot.task.status = status;
            snapshot.task.updated_at = now;
        }
        Ok(())
    }

    /// Persist a cancel request so any scheduler for the task, now or after
    /// a restart, cancels its open nodes
    pub async fn request_cancel(&self, actor: &str) -> Result<(), EngineError> {
        let now = Utc::now();
        self.with_retry("request cancel", || self.store.request_cancel(&self.task_id, actor, now))
            .await
            .map_err(EngineError::from_store)?;

        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(snapshot) = cache.as_mut() {
            snapshot.task.cancel_requested_by.get_or_insert_with(|| actor.to_string());
        }
        Ok(())
    }

    /// Append to the result log. Returns false if the node already had an entry.
    pub async fn append_result(&self, node_id: &str, output: &str) -> Result<bool, EngineError> {
        let entry = ResultEntry {
            node_id: node_id.to_string(),
            output: output.to_string(),
            recorded_at: Utc::now(),
        };
        let added = self
            .with_retry("append result", || self.store.append_result(&self.task_id, &entry))
            .await
            .map_err(EngineError::from_store)?;
        Ok(added)
    }

    pub async fn results(&self) -> Result<Vec<ResultEntry>, EngineError> {
        self.with_retry("load results", || self.store.load_results(&self.task_id))
            .await
            .map_err(EngineError::from_store)
    }

    async fn write(&self, current: &NodeState, next: NodeState) -> Result<CasOutcome, EngineError> {
        let expected = current.status;
        let result = self
            .with_retry("node update", || {
                self.store.compare_and_set_node(&self.task_id, expected, &next)
            })
            .await;

        match result {
            Ok(outcome) => {
                match &outcome {
                    CasOutcome::Applied(row) | CasOutcome::Conflict(row) => self.remember(row),
                }
                Ok(outcome)
            }
            Err(err @ (StoreError::TaskNotFound(_) | StoreError::NodeNotFound { .. })) => {
                Err(EngineError::from_store(err))
            }
            Err(err) => {
                self.annotate_store_failure(current, &err).await;
                Err(EngineError::Store(err))
            }
        }
    }

    /// Best-effort: mark the node failed so the task does not hang on it
    async fn annotate_store_failure(&self, current: &NodeState, err: &StoreError) {
        if current.status.is_terminal() {
            return;
        }
        let failed = current.advance(
            NodeStatus::Failed,
            Payload::error(format!("store error: {}", err)),
            Utc::now(),
        );
        let result = self
            .with_retry("store-error annotation", || {
                self.store.compare_and_set_node(&self.task_id, current.status, &failed)
            })
            .await;

        match result {
            Ok(CasOutcome::Applied(row)) => {
                log::warn!(
                    "Task {} node {} marked failed after store error: {}",
                    self.task_id,
                    current.node_id,
                    err
                );
                self.remember(&row);
            }
            Ok(CasOutcome::Conflict(row)) => self.remember(&row),
            Err(e) => {
                log::error!(
                    "Task {} node {}: could not record store failure ({}); original error: {}",
                    self.task_id,
                    current.node_id,
                    e,
                    err
                );
            }
        }
    }

    async fn with_retry<T, F>(&self, what: &str, op: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Result<T, StoreError>,
    {
        retry_store(&self.retry, &format!("task {}", self.task_id), what, op).await
    }

    fn replace_cache(&self, snapshot: Snapshot) {
        *self.cache.write().unwrap_or_else(PoisonError::into_inner) = Some(snapshot);
    }

    fn remember(&self, row: &NodeState) {
        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(slot) = cache
            .as_mut()
            .and_then(|s| s.nodes.iter_mut().find(|n| n.node_id == row.node_id))
        {
            *slot = row.clone();
        }
    }
}

/// Run a store call, retrying transient failures with the policy's backoff.
/// `scope` names the task or caller in log lines.
pub(crate) async fn retry_store<T, F>(retry: &RetryPolicy, scope: &str, what: &str, mut op: F) -> Result<T, StoreError>
where
    F: FnMut() -> Result<T, StoreError>,
{
    let mut attempt = 0;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < retry.max_retries => {
                let delay = retry.backoff(attempt);
                log::warn!(
                    "Store {} for {} failed ({}), retrying in {:?} ({}/{})",
                    what,
                    scope,
                    e,
                    delay,
                    attempt + 1,
                    retry.max_retries
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
