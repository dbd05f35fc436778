//! Agent step executor - the seam through which agent nodes produce output

use crate::core::AgentConfig;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;

/// Everything an executor gets for one agent step
#[derive(Debug, Clone)]
pub struct StepRequest {
    pub task_id: String,
    pub node_id: String,
    /// Dispatch number; `task_id/node_id/attempt` is a usable idempotency key
    pub attempt: u32,
    pub config: AgentConfig,
    /// Outputs of completed predecessors, keyed by node id
    pub inputs: BTreeMap<String, String>,
}

impl StepRequest {
    pub fn idempotency_key(&self) -> String {
        format!("{}/{}/{}", self.task_id, self.node_id, self.attempt)
    }
}

/// Runs one agent step. Called under a timeout and may be dropped mid-flight
/// on cancellation, so implementations should tolerate re-execution.
#[async_trait]
pub trait AgentStepExecutor: Send + Sync {
    async fn execute(&self, request: StepRequest) -> Result<String>;
}

/// Executor that echoes the step's prompt, or the agent id when there is none
#[derive(Debug, Clone, Default)]
pub struct EchoExecutor;

#[async_trait]
impl AgentStepExecutor for EchoExecutor {
    async fn execute(&self, request: StepRequest) -> Result<String> {
        let mut output = request
            .config
            .prompt
            .clone()
            .unwrap_or_else(|| format!("{} done", request.config.agent_id));
        for (node_id, upstream) in &request.inputs {
            output.push_str(&format!("\n[{}] {}", node_id, upstream));
        }
        Ok(output)
    }
}
