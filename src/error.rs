//! Error types for graph validation, persistence and the engine

use crate::core::NodeStatus;
use thiserror::Error;

/// A submitted graph was rejected. No task is created.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("graph has no nodes")]
    EmptyGraph,

    #[error("duplicate node id: {0}")]
    DuplicateNode(String),

    #[error("node {id}: unknown kind '{kind}' (expected 'agent' or 'human')")]
    UnknownKind { id: String, kind: String },

    #[error("node {id}: invalid config: {reason}")]
    InvalidConfig { id: String, reason: String },

    #[error("edge {from} -> {to} references unknown node {missing}")]
    DanglingEdge {
        from: String,
        to: String,
        missing: String,
    },

    #[error("self-loop on node {0}")]
    SelfLoop(String),

    #[error("cycle detected: {}", .0.join(" -> "))]
    Cycle(Vec<String>),
}

/// Failure reported by a [`DurableStore`](crate::store::DurableStore) backend.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("task {0} not found")]
    TaskNotFound(String),

    #[error("node {node_id} not found in task {task_id}")]
    NodeNotFound { task_id: String, node_id: String },

    #[error("task {0} already exists")]
    TaskExists(String),

    /// Worth retrying: lock contention, busy database, injected fault.
    #[error("transient store failure: {0}")]
    Transient(String),

    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;
        match &err {
            rusqlite::Error::SqliteFailure(code, _)
                if matches!(
                    code.code,
                    ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
                ) =>
            {
                Self::Transient(err.to_string())
            }
            _ => Self::Backend(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Backend(format!("serialization: {}", err))
    }
}

/// Errors surfaced by the engine's public operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("invalid engine config: {0}")]
    InvalidConfig(String),

    #[error("task {0} not found")]
    UnknownTask(String),

    #[error("node {node_id} not found in task {task_id}")]
    UnknownNode { task_id: String, node_id: String },

    #[error("illegal transition for node {node_id}: {from} -> {to}")]
    IllegalTransition {
        node_id: String,
        from: NodeStatus,
        to: NodeStatus,
    },
}

impl EngineError {
    /// Collapse store-level "not found" into the engine's own variants.
    pub(crate) fn from_store(err: StoreError) -> Self {
        match err {
            StoreError::TaskNotFound(id) => Self::UnknownTask(id),
            StoreError::NodeNotFound { task_id, node_id } => {
                Self::UnknownNode { task_id, node_id }
            }
            other => Self::Store(other),
        }
    }
}
