//! Event streaming for engine consumers
//!
//! JSON-serializable events that can be tailed by a CLI or any automation.

use crate::core::TaskStatus;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Events emitted while tasks execute
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// Task accepted and persisted
    TaskSubmitted {
        task_id: String,
        workflow_id: String,
    },
    /// Node won its dispatch
    NodeStarted {
        task_id: String,
        node_id: String,
        attempt: u32,
    },
    NodeCompleted {
        task_id: String,
        node_id: String,
    },
    NodeFailed {
        task_id: String,
        node_id: String,
        error: String,
    },
    /// Node can never run because an upstream node did not complete
    NodeBlocked {
        task_id: String,
        node_id: String,
    },
    /// Human node parked
    NodeAwaitingInput {
        task_id: String,
        node_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prompt: Option<String>,
    },
    NodeCancelled {
        task_id: String,
        node_id: String,
    },
    /// Task reached a terminal status
    TaskFinished {
        task_id: String,
        status: TaskStatus,
    },
}

impl EngineEvent {
    pub fn task_id(&self) -> &str {
        match self {
            Self::TaskSubmitted { task_id, .. }
            | Self::NodeStarted { task_id, .. }
            | Self::NodeCompleted { task_id, .. }
            | Self::NodeFailed { task_id, .. }
            | Self::NodeBlocked { task_id, .. }
            | Self::NodeAwaitingInput { task_id, .. }
            | Self::NodeCancelled { task_id, .. }
            | Self::TaskFinished { task_id, .. } => task_id,
        }
    }

    /// Serialize to JSON line
    pub fn to_json_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Broadcast-based event stream for multiple consumers
#[derive(Clone)]
pub struct EventStream {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventStream {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Emit an event to all subscribers
    pub fn emit(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }

    /// Subscribe to the event stream
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventStream {
    fn default() -> Self {
        Self::new(256)
    }
}
