//! Node dispatcher - executes a single node that won its `ready -> running` CAS
//!
//! Agent nodes are handed to the [`AgentStepExecutor`] under a timeout.
//! Human nodes park immediately and are finished later through [`Dispatcher::resume`].

use super::graph::{NodeConfig, NodeSpec};
use super::status::{NodeStatus, Payload};
use super::status_store::StatusStore;
use crate::agent::{AgentStepExecutor, StepRequest};
use crate::error::EngineError;
use crate::store::CasOutcome;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Result of executing one node
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Completed(String),
    Failed(String),
    /// Parked for a person; carries the prompt to show them
    AwaitingInput(Option<String>),
    /// Cancellation arrived before the step finished
    Cancelled,
}

/// Result of supplying input to a human node
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum ResumeOutcome {
    Completed,
    /// The input was accepted but could not be recorded
    Failed(String),
    NotAwaitingInput,
    /// Lost the race to a timeout, cancellation or another resume
    Conflict,
    /// Input refused; the node keeps waiting
    Rejected(String),
}

pub struct Dispatcher {
    executor: Arc<dyn AgentStepExecutor>,
    timeout: Duration,
}

impl Dispatcher {
    pub fn new(executor: Arc<dyn AgentStepExecutor>, timeout: Duration) -> Self {
        Self { executor, timeout }
    }

    /// Execute a node. Never blocks past the agent timeout.
    pub async fn execute(
        &self,
        task_id: &str,
        node: &NodeSpec,
        attempt: u32,
        inputs: BTreeMap<String, String>,
        cancel: &CancellationToken,
    ) -> Outcome {
        let config = match &node.config {
            NodeConfig::Human(config) => return Outcome::AwaitingInput(config.prompt()),
            NodeConfig::Agent(config) => config.clone(),
        };

        let request = StepRequest {
            task_id: task_id.to_string(),
            node_id: node.id.clone(),
            attempt,
            config,
            inputs,
        };

        log::debug!("Dispatching agent step {}", request.idempotency_key());

        tokio::select! {
            _ = cancel.cancelled() => Outcome::Cancelled,
            result = tokio::time::timeout(self.timeout, self.executor.execute(request)) => match result {
                Ok(Ok(output)) => Outcome::Completed(output),
                Ok(Err(e)) => Outcome::Failed(format!("{:#}", e)),
                Err(_) => Outcome::Failed(format!("timed out after {:?}", self.timeout)),
            },
        }
    }

    /// Supply input to a node parked in `awaiting_input`.
    ///
    /// Goes `awaiting_input -> running -> completed` through CAS, so a resume
    /// racing a timeout or cancellation has exactly one winner.
    pub async fn resume(
        &self,
        status: &StatusStore,
        node_id: &str,
        input: &str,
        actor: &str,
    ) -> Result<ResumeOutcome, EngineError> {
        let node = status.load_node(node_id).await?;
        if node.status != NodeStatus::AwaitingInput {
            return Ok(ResumeOutcome::NotAwaitingInput);
        }
        if input.trim().is_empty() {
            return Ok(ResumeOutcome::Rejected("input must not be empty".to_string()));
        }

        let running = match status
            .compare_and_set(&node, NodeStatus::Running, Payload::default().with_actor(actor))
            .await?
        {
            CasOutcome::Applied(row) => row,
            CasOutcome::Conflict(_) => return Ok(ResumeOutcome::Conflict),
        };

        match status
            .compare_and_set(&running, NodeStatus::Completed, Payload::output(input))
            .await
        {
            Ok(CasOutcome::Applied(_)) => {}
            Ok(CasOutcome::Conflict(_)) => return Ok(ResumeOutcome::Conflict),
            Err(EngineError::Store(e)) => return Ok(ResumeOutcome::Failed(e.to_string())),
            Err(e) => return Err(e),
        }

        if let Err(e) = status.append_result(node_id, input).await {
            // the scheduler repairs missing entries for completed nodes on start
            log::error!(
                "Task {} node {} completed but result was not logged: {}",
                status.task_id(),
                node_id,
                e
            );
        }

        log::info!("Task {} node {} resumed by {}", status.task_id(), node_id, actor);
        Ok(ResumeOutcome::Completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use crate::core::{AgentConfig, Graph, HumanConfig, RawNode, TaskInstance};
    use crate::store::MemoryStore;
    use anyhow::anyhow;
    use async_trait::async_trait;

    struct Scripted {
        delay: Duration,
        fail: bool,
    }

    #[async_trait]
    impl AgentStepExecutor for Scripted {
        async fn execute(&self, request: StepRequest) -> anyhow::Result<String> {
            tokio::time::sleep(self.delay).await;
            if self.fail {
                Err(anyhow!("model unavailable"))
            } else {
                Ok(format!("{} ok", request.node_id))
            }
        }
    }

    fn agent_node(id: &str) -> NodeSpec {
        NodeSpec {
            id: id.to_string(),
            config: NodeConfig::Agent(AgentConfig {
                agent_id: "writer".into(),
                model: None,
                prompt: None,
                temperature: None,
                max_tokens: None,
                use_rag: false,
            }),
        }
    }

    fn dispatcher(delay_ms: u64, fail: bool, timeout_ms: u64) -> Dispatcher {
        Dispatcher::new(
            Arc::new(Scripted {
                delay: Duration::from_millis(delay_ms),
                fail,
            }),
            Duration::from_millis(timeout_ms),
        )
    }

    #[tokio::test]
    async fn test_agent_completes() {
        let outcome = dispatcher(0, false, 1000)
            .execute("t", &agent_node("a"), 1, BTreeMap::new(), &CancellationToken::new())
            .await;
        assert_eq!(outcome, Outcome::Completed("a ok".into()));
    }

    #[tokio::test]
    async fn test_executor_error_becomes_failed() {
        let outcome = dispatcher(0, true, 1000)
            .execute("t", &agent_node("a"), 1, BTreeMap::new(), &CancellationToken::new())
            .await;
        assert_eq!(outcome, Outcome::Failed("model unavailable".into()));
    }

    #[tokio::test]
    async fn test_timeout_becomes_failed() {
        let outcome = dispatcher(5_000, false, 20)
            .execute("t", &agent_node("a"), 1, BTreeMap::new(), &CancellationToken::new())
            .await;
        match outcome {
            Outcome::Failed(msg) => assert!(msg.starts_with("timed out")),
            other => panic!("expected timeout failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_step() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let outcome = dispatcher(5_000, false, 10_000)
            .execute("t", &agent_node("a"), 1, BTreeMap::new(), &cancel)
            .await;
        assert_eq!(outcome, Outcome::Cancelled);
    }

    #[tokio::test]
    async fn test_human_parks_immediately() {
        let node = NodeSpec {
            id: "review".into(),
            config: NodeConfig::Human(HumanConfig {
                assignee: None,
                task: Some("approve".into()),
                instructions: None,
            }),
        };
        let outcome = dispatcher(5_000, false, 10)
            .execute("t", &node, 1, BTreeMap::new(), &CancellationToken::new())
            .await;
        assert_eq!(outcome, Outcome::AwaitingInput(Some("approve".into())));
    }

    async fn parked_human() -> StatusStore {
        let graph = Graph::build(
            vec![RawNode {
                id: "h".into(),
                kind: "human".into(),
                config: serde_json::Value::Null,
            }],
            vec![],
        )
        .unwrap();
        let task = TaskInstance::new("wf", graph, "tester");
        let status = StatusStore::initialize(task, Arc::new(MemoryStore::new()), RetryPolicy::default())
            .await
            .unwrap();

        let mut row = status.load_node("h").await.unwrap();
        for target in [NodeStatus::Ready, NodeStatus::Running, NodeStatus::AwaitingInput] {
            row = match status.compare_and_set(&row, target, Payload::default()).await.unwrap() {
                CasOutcome::Applied(next) => next,
                other => panic!("unexpected {other:?}"),
            };
        }
        status
    }

    #[tokio::test]
    async fn test_resume_completes_and_logs() {
        let status = parked_human().await;
        let d = dispatcher(0, false, 10);

        assert_eq!(d.resume(&status, "h", "approved", "bob").await.unwrap(), ResumeOutcome::Completed);
        let row = status.load_node("h").await.unwrap();
        assert_eq!(row.status, NodeStatus::Completed);
        assert_eq!(row.output.as_deref(), Some("approved"));
        assert_eq!(row.resolved_by.as_deref(), Some("bob"));
        assert_eq!(status.results().await.unwrap().len(), 1);

        assert_eq!(
            d.resume(&status, "h", "again", "bob").await.unwrap(),
            ResumeOutcome::NotAwaitingInput
        );
    }

    #[tokio::test]
    async fn test_resume_rejects_blank_input() {
        let status = parked_human().await;
        let outcome = dispatcher(0, false, 10).resume(&status, "h", "   ", "bob").await.unwrap();
        assert!(matches!(outcome, ResumeOutcome::Rejected(_)));
        assert_eq!(status.load_node("h").await.unwrap().status, NodeStatus::AwaitingInput);
    }

    #[tokio::test]
    async fn test_resume_unknown_node() {
        let status = parked_human().await;
        let err = dispatcher(0, false, 10).resume(&status, "ghost", "x", "bob").await.unwrap_err();
        assert!(matches!(err, EngineError::UnknownNode { .. }));
    }
}
