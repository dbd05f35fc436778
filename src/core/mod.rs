//! Core engine - graph model, node state, dispatch and scheduling

mod dispatcher;
mod graph;
mod scheduler;
mod status;
mod status_store;

pub use dispatcher::{Dispatcher, Outcome, ResumeOutcome};
pub use graph::{AgentConfig, EdgeSpec, Graph, GraphSpec, HumanConfig, NodeConfig, NodeKind, NodeSpec, RawNode};
pub use scheduler::{Phase, Scheduler, TaskControl};
pub use status::{
    derive_task_status, NodeState, NodeStatus, Payload, ResultEntry, Snapshot, TaskInstance, TaskStatus,
};
pub use status_store::StatusStore;
pub(crate) use status_store::retry_store;
