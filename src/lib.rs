//! dagrun - DAG task orchestration with agent and human steps
//!
//! Validates submitted node/edge graphs, executes agent nodes through a
//! pluggable executor, parks human nodes until input arrives and persists
//! every node transition so tasks survive a restart.

pub mod agent;
pub mod config;
pub mod core;
pub mod engine;
pub mod error;
pub mod events;
pub mod store;

// Re-exports
pub use agent::{AgentStepExecutor, EchoExecutor, StepRequest};
pub use config::{EngineConfig, FailurePolicy, RetryPolicy};
pub use self::core::{Graph, GraphSpec, NodeStatus, Phase, ResumeOutcome, TaskStatus};
pub use engine::{Actor, Engine, NodeReport, Submission, TaskReport};
pub use error::{EngineError, StoreError, ValidationError};
pub use events::{EngineEvent, EventStream};
pub use store::{DurableStore, MemoryStore, SqliteStore};

/// Result type alias
pub type Result<T> = anyhow::Result<T>;
