//! Engine - the public face of the orchestrator
//!
//! Accepts submissions, runs one scheduler per live task, routes human input,
//! answers status queries and re-admits unfinished tasks after a restart.

use crate::agent::AgentStepExecutor;
use crate::config::EngineConfig;
use crate::core::{
    retry_store, Dispatcher, Graph, GraphSpec, NodeKind, NodeState, NodeStatus, Payload, Phase, ResultEntry,
    ResumeOutcome, Scheduler, Snapshot, StatusStore, TaskControl, TaskInstance, TaskStatus,
};
use crate::error::EngineError;
use crate::events::{EngineEvent, EventStream};
use crate::store::{CasOutcome, DurableStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Semaphore;

/// A graph submitted for execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    pub workflow_id: String,
    #[serde(alias = "dag")]
    pub graph: GraphSpec,
}

/// Who is acting; recorded on submissions and human input
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: String,
}

impl Actor {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

/// Status query answer
#[derive(Debug, Clone, Serialize)]
pub struct TaskReport {
    pub task_id: String,
    pub workflow_id: String,
    pub status: TaskStatus,
    pub submitted_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub nodes: Vec<NodeReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeReport {
    pub id: String,
    pub kind: NodeKind,
    pub status: NodeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskReport {
    fn from_snapshot(snapshot: Snapshot) -> Self {
        let status = snapshot.derived_status();
        let Snapshot { task, nodes } = snapshot;
        let nodes = nodes
            .into_iter()
            .map(|row| NodeReport {
                kind: task
                    .graph
                    .node(&row.node_id)
                    .map(|n| n.kind())
                    .unwrap_or(NodeKind::Agent),
                id: row.node_id,
                status: row.status,
                output: row.output,
                error: row.error,
                attempts: row.attempts,
                resolved_by: row.resolved_by,
                started_at: row.started_at,
                finished_at: row.finished_at,
            })
            .collect();

        Self {
            task_id: task.id,
            workflow_id: task.workflow_id,
            status,
            submitted_by: task.submitted_by,
            created_at: task.created_at,
            updated_at: task.updated_at,
            nodes,
        }
    }

    pub fn node(&self, id: &str) -> Option<&NodeReport> {
        self.nodes.iter().find(|n| n.id == id)
    }
}

struct Inner {
    store: Arc<dyn DurableStore>,
    dispatcher: Arc<Dispatcher>,
    events: EventStream,
    config: EngineConfig,
    global_limit: Option<Arc<Semaphore>>,
    /// Tasks with a live scheduler in this process
    active: Mutex<HashMap<String, Arc<TaskControl>>>,
}

/// Cheap to clone; clones share the same schedulers and event stream
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

impl Engine {
    /// Fails if `config` does not pass [`EngineConfig::validate`]
    pub fn new(
        store: Arc<dyn DurableStore>,
        executor: Arc<dyn AgentStepExecutor>,
        config: EngineConfig,
    ) -> Result<Self, EngineError> {
        config
            .validate()
            .map_err(|e| EngineError::InvalidConfig(format!("{:#}", e)))?;
        let dispatcher = Arc::new(Dispatcher::new(executor, config.agent_timeout()));
        let global_limit = config
            .global_max_concurrency
            .map(|n| Arc::new(Semaphore::new(n)));
        Ok(Self {
            inner: Arc::new(Inner {
                store,
                dispatcher,
                events: EventStream::default(),
                config,
                global_limit,
                active: Mutex::new(HashMap::new()),
            }),
        })
    }

    pub fn events(&self) -> &EventStream {
        &self.inner.events
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Validate and persist a graph, then start executing it.
    /// Returns the new task id; execution continues in the background.
    pub async fn submit(&self, submission: Submission, actor: &Actor) -> Result<String, EngineError> {
        let graph = Graph::from_spec(submission.graph)?;
        let task = TaskInstance::new(submission.workflow_id, graph, actor.id.clone());
        let task_id = task.id.clone();
        let workflow_id = task.workflow_id.clone();
        let node_count = task.graph.len();

        let status = StatusStore::initialize(task, self.inner.store.clone(), self.inner.config.store_retry.clone()).await?;
        log::info!(
            "Task {} submitted by {} (workflow {}, {} nodes)",
            task_id,
            actor.id,
            workflow_id,
            node_count
        );
        self.inner.events.emit(EngineEvent::TaskSubmitted {
            task_id: task_id.clone(),
            workflow_id,
        });

        self.admit(Arc::new(status));
        Ok(task_id)
    }

    /// Supply input to a human node waiting on it
    pub async fn resume(
        &self,
        task_id: &str,
        node_id: &str,
        input: &str,
        actor: &Actor,
    ) -> Result<ResumeOutcome, EngineError> {
        let status = Arc::new(self.status_store(task_id));
        let outcome = self
            .inner
            .dispatcher
            .resume(&status, node_id, input, &actor.id)
            .await?;

        if matches!(outcome, ResumeOutcome::Completed | ResumeOutcome::Failed(_)) {
            let event = match &outcome {
                ResumeOutcome::Failed(error) => EngineEvent::NodeFailed {
                    task_id: task_id.to_string(),
                    node_id: node_id.to_string(),
                    error: error.clone(),
                },
                _ => EngineEvent::NodeCompleted {
                    task_id: task_id.to_string(),
                    node_id: node_id.to_string(),
                },
            };
            self.inner.events.emit(event);

            match self.control(task_id) {
                Some(control) => control.wake(),
                None => {
                    self.admit(status);
                }
            }
        }
        Ok(outcome)
    }

    /// Cancel a task. Unstarted and parked nodes are cancelled and in-flight
    /// agent steps are dropped.
    ///
    /// The request is recorded before any node moves, so a cancel cut short
    /// by a crash or store error is finished by the next scheduler.
    pub async fn cancel(&self, task_id: &str, actor: &Actor) -> Result<(), EngineError> {
        let status = self.status_store(task_id);
        status.request_cancel(&actor.id).await?;

        if let Some(control) = self.control(task_id) {
            log::info!("Task {} cancelled by {}", task_id, actor.id);
            control.cancel();
            return Ok(());
        }

        // no scheduler here; settle it through the store
        let snapshot = status.load_snapshot().await?;
        for row in snapshot.nodes.iter().filter(|n| !n.status.is_terminal()) {
            self.cancel_node(&status, row, actor).await?;
        }

        let settled = status.load_snapshot().await?;
        let derived = settled.derived_status();
        if settled.task.status != derived {
            status.set_task_status(derived).await?;
        }
        if derived.is_terminal() && !snapshot.task.status.is_terminal() {
            log::info!("Task {} cancelled by {} ({})", task_id, actor.id, derived);
            self.inner.events.emit(EngineEvent::TaskFinished {
                task_id: task_id.to_string(),
                status: derived,
            });
        }
        Ok(())
    }

    /// Move one node to `cancelled`, following it through any concurrent writes
    async fn cancel_node(&self, status: &StatusStore, row: &NodeState, actor: &Actor) -> Result<(), EngineError> {
        let mut current = row.clone();
        while !current.status.is_terminal() {
            let payload = Payload::error("cancelled by request").with_actor(actor.id.clone());
            match status.compare_and_set(&current, NodeStatus::Cancelled, payload).await? {
                CasOutcome::Applied(_) => {
                    self.inner.events.emit(EngineEvent::NodeCancelled {
                        task_id: status.task_id().to_string(),
                        node_id: current.node_id.clone(),
                    });
                    break;
                }
                CasOutcome::Conflict(moved) => {
                    log::debug!(
                        "Task {} node {} moved to {} during cancel, retrying",
                        status.task_id(),
                        moved.node_id,
                        moved.status
                    );
                    current = moved;
                }
            }
        }
        Ok(())
    }

    pub async fn status(&self, task_id: &str) -> Result<TaskReport, EngineError> {
        let snapshot = self.status_store(task_id).load_snapshot().await?;
        Ok(TaskReport::from_snapshot(snapshot))
    }

    /// The result log in append order
    pub async fn results(&self, task_id: &str) -> Result<Vec<ResultEntry>, EngineError> {
        let status = self.status_store(task_id);
        status.load_snapshot().await?;
        status.results().await
    }

    /// Re-admit every stored task that is not finished. Returns their ids.
    pub async fn recover(&self) -> Result<Vec<String>, EngineError> {
        let store = &self.inner.store;
        let ids = retry_store(&self.inner.config.store_retry, "recovery", "list tasks", || {
            store.list_tasks(&[TaskStatus::Pending, TaskStatus::Running])
        })
        .await
        .map_err(EngineError::from_store)?;
        for id in &ids {
            self.admit(Arc::new(self.status_store(id)));
        }
        if !ids.is_empty() {
            log::info!("Recovered {} unfinished task(s)", ids.len());
        }
        Ok(ids)
    }

    /// Wait until the task is finished or parked on human input
    pub async fn wait_settled(&self, task_id: &str) -> Result<TaskReport, EngineError> {
        self.wait_for_phase(task_id, Phase::is_settled).await;
        self.status(task_id).await
    }

    /// Wait until the task reaches a terminal status
    pub async fn wait_finished(&self, task_id: &str) -> Result<TaskReport, EngineError> {
        self.wait_for_phase(task_id, |phase| matches!(phase, Phase::Finished(_) | Phase::Stopped))
            .await;
        self.status(task_id).await
    }

    /// Phase of the live scheduler, if this process runs one for the task
    pub fn phase(&self, task_id: &str) -> Option<Phase> {
        self.control(task_id).map(|c| c.phase())
    }

    async fn wait_for_phase(&self, task_id: &str, done: impl Fn(&Phase) -> bool) {
        if let Some(control) = self.control(task_id) {
            let mut phase = control.subscribe();
            let _ = phase.wait_for(|p| done(p)).await;
        }
    }

    /// Start a scheduler for the task unless one is already live
    fn admit(&self, status: Arc<StatusStore>) -> Arc<TaskControl> {
        let task_id = status.task_id().to_string();
        let control = {
            let mut active = self.lock_active();
            if let Some(control) = active.get(&task_id) {
                return control.clone();
            }
            let control = Arc::new(TaskControl::new());
            active.insert(task_id.clone(), control.clone());
            control
        };

        let scheduler = Scheduler::new(
            status,
            self.inner.dispatcher.clone(),
            self.inner.events.clone(),
            self.inner.config.clone(),
            control.clone(),
            self.inner.global_limit.clone(),
        );
        let engine = self.clone();
        tokio::spawn(async move {
            let _ = scheduler.run().await;
            engine.lock_active().remove(&task_id);
        });
        control
    }

    fn control(&self, task_id: &str) -> Option<Arc<TaskControl>> {
        self.lock_active().get(task_id).cloned()
    }

    fn status_store(&self, task_id: &str) -> StatusStore {
        StatusStore::new(task_id, self.inner.store.clone(), self.inner.config.store_retry.clone())
    }

    fn lock_active(&self) -> MutexGuard<'_, HashMap<String, Arc<TaskControl>>> {
        self.inner.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
