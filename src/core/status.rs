//! Task and node state - status enums, transition rules, persisted records

use super::graph::Graph;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Per-node execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Ready,
    Running,
    AwaitingInput,
    Completed,
    Failed,
    Blocked,
    Cancelled,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::AwaitingInput => "awaiting_input",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Blocked => "blocked",
            Self::Cancelled => "cancelled",
        }
    }

    /// No transition leaves a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Blocked | Self::Cancelled
        )
    }

    /// Forward-only transition rules. Crash-recovery reclaim
    /// (`running -> pending`) is deliberately not listed here.
    pub fn can_transition_to(&self, next: NodeStatus) -> bool {
        use NodeStatus::*;
        match (*self, next) {
            (Pending, Ready) | (Ready, Running) | (AwaitingInput, Running) => true,
            (Running, Completed) | (Running, AwaitingInput) => true,
            (Pending | Ready | AwaitingInput, Blocked) => true,
            (from, Failed | Cancelled) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "pending" => Self::Pending,
            "ready" => Self::Ready,
            "running" => Self::Running,
            "awaiting_input" => Self::AwaitingInput,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "blocked" => Self::Blocked,
            "cancelled" => Self::Cancelled,
            other => return Err(format!("unknown node status '{}'", other)),
        })
    }
}

/// Task-level status, always derived from the node set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "pending" => Self::Pending,
            "running" => Self::Running,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "cancelled" => Self::Cancelled,
            other => return Err(format!("unknown task status '{}'", other)),
        })
    }
}

/// Derive the task status from its node statuses.
///
/// - any non-terminal node: `pending` if nothing has left `pending`, else `running`
/// - all terminal, any `cancelled`: `cancelled`
/// - all terminal, any `failed` or `blocked`: `failed`
/// - otherwise `completed`
pub fn derive_task_status<I>(statuses: I) -> TaskStatus
where
    I: IntoIterator<Item = NodeStatus>,
{
    let mut all_pending = true;
    let mut any_open = false;
    let mut any_cancelled = false;
    let mut any_failed = false;

    for status in statuses {
        all_pending &= status == NodeStatus::Pending;
        any_open |= !status.is_terminal();
        any_cancelled |= status == NodeStatus::Cancelled;
        any_failed |= matches!(status, NodeStatus::Failed | NodeStatus::Blocked);
    }

    if any_open {
        if all_pending {
            TaskStatus::Pending
        } else {
            TaskStatus::Running
        }
    } else if any_cancelled {
        TaskStatus::Cancelled
    } else if any_failed {
        TaskStatus::Failed
    } else {
        TaskStatus::Completed
    }
}

/// One execution of a graph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInstance {
    pub id: String,
    pub workflow_id: String,
    pub graph: Graph,
    pub status: TaskStatus,
    pub submitted_by: String,
    /// Actor who asked for cancellation; once set, every open node is cancelled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel_requested_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskInstance {
    /// Create a new pending task with a fresh id
    pub fn new(workflow_id: impl Into<String>, graph: Graph, submitted_by: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            workflow_id: workflow_id.into(),
            graph,
            status: TaskStatus::Pending,
            submitted_by: submitted_by.into(),
            cancel_requested_by: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// One pending row per graph node, in submission order
    pub fn initial_node_states(&self) -> Vec<NodeState> {
        self.graph
            .nodes()
            .iter()
            .map(|node| NodeState::pending(&node.id))
            .collect()
    }
}

/// Persisted state of one node within one task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeState {
    pub node_id: String,
    pub status: NodeStatus,
    pub output: Option<String>,
    pub error: Option<String>,
    /// Number of `ready -> running` dispatches
    pub attempts: u32,
    /// Actor that supplied human input
    pub resolved_by: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Last sign of life while running, or when the node parked for input
    pub heartbeat_at: Option<DateTime<Utc>>,
}

/// Extra data carried by a transition
#[derive(Debug, Clone, Default)]
pub struct Payload {
    pub output: Option<String>,
    pub error: Option<String>,
    pub actor: Option<String>,
}

impl Payload {
    pub fn output(output: impl Into<String>) -> Self {
        Self {
            output: Some(output.into()),
            ..Self::default()
        }
    }

    pub fn error(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::default()
        }
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }
}

impl NodeState {
    pub fn pending(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            status: NodeStatus::Pending,
            output: None,
            error: None,
            attempts: 0,
            resolved_by: None,
            started_at: None,
            finished_at: None,
            heartbeat_at: None,
        }
    }

    /// The row as it looks after moving to `target`.
    /// Does not check transition legality.
    pub fn advance(&self, target: NodeStatus, payload: Payload, now: DateTime<Utc>) -> Self {
        let mut next = self.clone();
        next.status = target;

        match target {
            NodeStatus::Running => {
                if self.status == NodeStatus::Ready {
                    next.attempts += 1;
                }
                next.started_at.get_or_insert(now);
                next.heartbeat_at = Some(now);
            }
            NodeStatus::AwaitingInput => {
                next.heartbeat_at = Some(now);
            }
            NodeStatus::Completed => {
                next.output = payload.output;
                next.error = None;
                next.finished_at = Some(now);
            }
            NodeStatus::Failed | NodeStatus::Blocked | NodeStatus::Cancelled => {
                next.error = payload.error;
                next.finished_at = Some(now);
            }
            NodeStatus::Pending | NodeStatus::Ready => {}
        }

        if let Some(actor) = payload.actor {
            next.resolved_by = Some(actor);
        }
        next
    }

    /// The row after a crashed `running` node is handed back for re-dispatch
    pub fn reclaimed(&self) -> Self {
        Self {
            status: NodeStatus::Pending,
            started_at: None,
            heartbeat_at: None,
            ..self.clone()
        }
    }

    /// Whether a running node's lease has lapsed
    pub fn is_stale(&self, now: DateTime<Utc>, stale_after: chrono::Duration) -> bool {
        if self.status != NodeStatus::Running {
            return false;
        }
        match self.heartbeat_at.or(self.started_at) {
            Some(seen) => now - seen > stale_after,
            None => true,
        }
    }
}

/// One entry of the append-only result log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultEntry {
    pub node_id: String,
    pub output: String,
    pub recorded_at: DateTime<Utc>,
}

/// Consistent read of a task and all of its node rows
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub task: TaskInstance,
    pub nodes: Vec<NodeState>,
}

impl Snapshot {
    pub fn node(&self, node_id: &str) -> Option<&NodeState> {
        self.nodes.iter().find(|n| n.node_id == node_id)
    }

    pub fn derived_status(&self) -> TaskStatus {
        derive_task_status(self.nodes.iter().map(|n| n.status))
    }

    /// A recorded cancel request, or a node already cancelled by one
    pub fn cancel_requested(&self) -> bool {
        self.task.cancel_requested_by.is_some()
            || self.nodes.iter().any(|n| n.status == NodeStatus::Cancelled)
    }
}
