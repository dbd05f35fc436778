//! Task Scheduler - drives one task instance to a terminal status
//!
//! Each pass reads a fresh snapshot, settles nodes that can no longer run,
//! dispatches ready nodes to workers and derives the task status. The loop
//! never awaits an agent call itself; it waits on worker exits, wake-ups,
//! cancellation and a poll interval.

use super::dispatcher::{Dispatcher, Outcome};
use super::graph::{Graph, NodeSpec};
use super::status::{NodeState, NodeStatus, Payload, Snapshot, TaskStatus};
use super::status_store::StatusStore;
use crate::config::{EngineConfig, FailurePolicy};
use crate::error::EngineError;
use crate::events::{EngineEvent, EventStream};
use crate::store::CasOutcome;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Scheduler liveness as seen from outside
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Work is in flight or runnable
    Running,
    /// Nothing in flight and nothing runnable, typically waiting on human input
    Parked,
    Finished(TaskStatus),
    /// Scheduler exited on a store error before the task finished
    Stopped,
}

impl Phase {
    /// True once the scheduler has nothing left to do without outside input
    pub fn is_settled(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Handle shared between a live scheduler and whoever controls the task
pub struct TaskControl {
    cancel: CancellationToken,
    wake: Notify,
    /// Bumped on every wake so a pass started before it cannot publish `Parked`
    wakes: AtomicU64,
    phase: watch::Sender<Phase>,
}

impl Default for TaskControl {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskControl {
    pub fn new() -> Self {
        let (phase, _) = watch::channel(Phase::Running);
        Self {
            cancel: CancellationToken::new(),
            wake: Notify::new(),
            wakes: AtomicU64::new(0),
            phase,
        }
    }

    /// Request cancellation of the whole task
    pub fn cancel(&self) {
        self.cancel.cancel();
        self.wake();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Ask the scheduler for another pass, e.g. after human input arrived
    pub fn wake(&self) {
        self.wakes.fetch_add(1, Ordering::SeqCst);
        self.phase.send_if_modified(|phase| {
            if *phase == Phase::Parked {
                *phase = Phase::Running;
                true
            } else {
                false
            }
        });
        self.wake.notify_one();
    }

    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Phase> {
        self.phase.subscribe()
    }

    pub(crate) fn publish(&self, next: Phase) {
        self.phase.send_if_modified(|phase| {
            if *phase == next {
                return false;
            }
            *phase = next;
            true
        });
    }

    /// Publish `Parked` unless a wake arrived after `seen` was read
    fn park(&self, seen: u64) {
        self.phase.send_if_modified(|phase| {
            if self.wakes.load(Ordering::SeqCst) != seen || *phase == Phase::Parked {
                return false;
            }
            *phase = Phase::Parked;
            true
        });
    }

    fn wakes(&self) -> u64 {
        self.wakes.load(Ordering::SeqCst)
    }
}

/// What a settling pass decided for one node
enum Verdict {
    Reclaim,
    Move(NodeStatus, String),
}

struct WorkerExit {
    node_id: String,
    clean: bool,
}

/// Reports a worker's exit to the scheduler, including exit by panic
struct ExitGuard {
    node_id: String,
    clean: bool,
    tx: mpsc::UnboundedSender<WorkerExit>,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        let _ = self.tx.send(WorkerExit {
            node_id: std::mem::take(&mut self.node_id),
            clean: self.clean,
        });
    }
}

type Permits = (OwnedSemaphorePermit, Option<OwnedSemaphorePermit>);

/// Executes one dispatched node and records its outcome
#[derive(Clone)]
struct Worker {
    task_id: String,
    status: Arc<StatusStore>,
    dispatcher: Arc<Dispatcher>,
    events: EventStream,
    cancel: CancellationToken,
    heartbeat: Duration,
}

impl Worker {
    async fn run(
        self,
        node: NodeSpec,
        running: NodeState,
        inputs: BTreeMap<String, String>,
        mut guard: ExitGuard,
        permits: Permits,
    ) {
        let outcome = self.execute(&node, running.attempts, inputs).await;
        self.record(&running, outcome).await;
        drop(permits);
        guard.clean = true;
    }

    /// Run the step while keeping the node's lease fresh
    async fn execute(&self, node: &NodeSpec, attempt: u32, inputs: BTreeMap<String, String>) -> Outcome {
        let step = self
            .dispatcher
            .execute(&self.task_id, node, attempt, inputs, &self.cancel);
        tokio::pin!(step);

        let mut ticker = tokio::time::interval(self.heartbeat);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                outcome = &mut step => return outcome,
                _ = ticker.tick() => match self.status.heartbeat(&node.id).await {
                    Ok(true) => {}
                    Ok(false) => log::debug!("Task {} node {} no longer running", self.task_id, node.id),
                    Err(e) => log::warn!("Task {} node {} heartbeat failed: {}", self.task_id, node.id, e),
                },
            }
        }
    }

    async fn record(&self, running: &NodeState, outcome: Outcome) {
        let task_id = self.task_id.clone();
        let node_id = running.node_id.clone();

        let (target, payload) = match &outcome {
            Outcome::Completed(output) => (NodeStatus::Completed, Payload::output(output.clone())),
            Outcome::Failed(error) => (NodeStatus::Failed, Payload::error(error.clone())),
            Outcome::AwaitingInput(_) => (NodeStatus::AwaitingInput, Payload::default()),
            Outcome::Cancelled => (NodeStatus::Cancelled, Payload::error("cancelled")),
        };

        match self.status.compare_and_set(running, target, payload).await {
            Ok(CasOutcome::Applied(_)) => {}
            Ok(CasOutcome::Conflict(row)) => {
                log::warn!(
                    "Task {} node {}: dropping {} outcome, node is already {}",
                    task_id,
                    node_id,
                    target,
                    row.status
                );
                return;
            }
            Err(e) => {
                log::error!("Task {} node {}: could not record outcome: {}", task_id, node_id, e);
                self.events.emit(EngineEvent::NodeFailed {
                    task_id,
                    node_id,
                    error: e.to_string(),
                });
                return;
            }
        }

        let event = match outcome {
            Outcome::Completed(output) => {
                if let Err(e) = self.status.append_result(&node_id, &output).await {
                    log::error!("Task {} node {}: result not logged: {}", task_id, node_id, e);
                }
                log::info!("Task {} node {} completed", task_id, node_id);
                EngineEvent::NodeCompleted { task_id, node_id }
            }
            Outcome::Failed(error) => {
                log::warn!("Task {} node {} failed: {}", task_id, node_id, error);
                EngineEvent::NodeFailed {
                    task_id,
                    node_id,
                    error,
                }
            }
            Outcome::AwaitingInput(prompt) => {
                log::info!("Task {} node {} awaiting input", task_id, node_id);
                EngineEvent::NodeAwaitingInput {
                    task_id,
                    node_id,
                    prompt,
                }
            }
            Outcome::Cancelled => {
                log::info!("Task {} node {} cancelled in flight", task_id, node_id);
                EngineEvent::NodeCancelled { task_id, node_id }
            }
        };
        self.events.emit(event);
    }
}

/// Drives a single task instance
pub struct Scheduler {
    status: Arc<StatusStore>,
    dispatcher: Arc<Dispatcher>,
    events: EventStream,
    config: EngineConfig,
    control: Arc<TaskControl>,
    global_limit: Option<Arc<Semaphore>>,
}

impl Scheduler {
    pub fn new(
        status: Arc<StatusStore>,
        dispatcher: Arc<Dispatcher>,
        events: EventStream,
        config: EngineConfig,
        control: Arc<TaskControl>,
        global_limit: Option<Arc<Semaphore>>,
    ) -> Self {
        Self {
            status,
            dispatcher,
            events,
            config,
            control,
            global_limit,
        }
    }

    /// Run until the task is terminal and no worker is in flight
    pub async fn run(self) -> Result<TaskStatus, EngineError> {
        let result = self.drive().await;
        match &result {
            Ok(status) => self.control.publish(Phase::Finished(*status)),
            Err(e) => {
                log::error!("Scheduler for task {} stopped: {}", self.status.task_id(), e);
                self.control.publish(Phase::Stopped);
            }
        }
        result
    }

    async fn drive(&self) -> Result<TaskStatus, EngineError> {
        let task_id = self.status.task_id().to_string();
        let snapshot = self.status.load_snapshot().await?;
        let graph = snapshot.task.graph.clone();
        self.repair_results(&snapshot).await?;

        let local = Arc::new(Semaphore::new(self.config.max_concurrency));
        let (exit_tx, mut exit_rx) = mpsc::unbounded_channel();
        let mut in_flight: HashSet<String> = HashSet::new();
        let mut cancel_seen = false;

        log::info!("Scheduler started for task {} ({} nodes)", task_id, graph.len());

        loop {
            let seen_wakes = self.control.wakes();
            let snapshot = self.status.load_snapshot().await?;

            // recorded by another process, or by a cancel that was cut short
            if snapshot.cancel_requested() && !self.control.is_cancelled() {
                log::info!(
                    "Task {} has a recorded cancel request (by {})",
                    task_id,
                    snapshot.task.cancel_requested_by.as_deref().unwrap_or("unknown")
                );
                self.control.cancel();
            }

            if self.settle(&graph, &snapshot, &in_flight).await? {
                continue;
            }

            let deferred = if self.control.is_cancelled() {
                false
            } else {
                self.dispatch(&graph, &snapshot, &mut in_flight, &local, &exit_tx).await?
            };

            let current = self.status.cached_snapshot().unwrap_or(snapshot);
            let derived = current.derived_status();
            if current.task.status != derived {
                self.status.set_task_status(derived).await?;
            }

            if derived.is_terminal() && in_flight.is_empty() {
                log::info!("Task {} finished: {}", task_id, derived);
                self.events.emit(EngineEvent::TaskFinished {
                    task_id,
                    status: derived,
                });
                return Ok(derived);
            }

            let busy = !in_flight.is_empty()
                || deferred
                || current
                    .nodes
                    .iter()
                    .any(|n| matches!(n.status, NodeStatus::Ready | NodeStatus::Running));
            if busy {
                self.control.publish(Phase::Running);
            } else {
                self.control.park(seen_wakes);
            }

            tokio::select! {
                Some(exit) = exit_rx.recv() => self.worker_exited(exit, &mut in_flight).await?,
                _ = self.control.wake.notified() => {}
                _ = self.control.cancel.cancelled(), if !cancel_seen => {
                    cancel_seen = true;
                    log::info!("Task {} cancellation requested", task_id);
                }
                _ = tokio::time::sleep(self.config.poll_interval()) => {}
            }
            while let Ok(exit) = exit_rx.try_recv() {
                self.worker_exited(exit, &mut in_flight).await?;
            }
        }
    }

    /// Append result entries for completed nodes that lack one
    async fn repair_results(&self, snapshot: &Snapshot) -> Result<(), EngineError> {
        for row in snapshot.nodes.iter().filter(|n| n.status == NodeStatus::Completed) {
            let output = row.output.as_deref().unwrap_or_default();
            if self.status.append_result(&row.node_id, output).await? {
                log::warn!(
                    "Task {}: restored missing result entry for node {}",
                    self.status.task_id(),
                    row.node_id
                );
            }
        }
        Ok(())
    }

    /// Move nodes that can no longer run. Returns true if anything changed.
    async fn settle(&self, graph: &Graph, snapshot: &Snapshot, in_flight: &HashSet<String>) -> Result<bool, EngineError> {
        let now = Utc::now();
        let failed = snapshot
            .nodes
            .iter()
            .find(|n| n.status == NodeStatus::Failed)
            .map(|n| n.node_id.as_str());
        let mut changed = false;

        for row in &snapshot.nodes {
            if row.status.is_terminal() || in_flight.contains(&row.node_id) {
                continue;
            }
            let verdict = match self.verdict(graph, snapshot, row, now, failed) {
                Some(verdict) => verdict,
                None => continue,
            };

            match verdict {
                Verdict::Reclaim => {
                    if let CasOutcome::Applied(_) = self.status.reclaim(row).await? {
                        log::warn!(
                            "Task {} node {}: lease expired after attempt {}, reclaimed",
                            self.status.task_id(),
                            row.node_id,
                            row.attempts
                        );
                        changed = true;
                    }
                }
                Verdict::Move(target, reason) => {
                    let payload = Payload::error(reason.clone());
                    if let CasOutcome::Applied(_) = self.status.compare_and_set(row, target, payload).await? {
                        log::info!("Task {} node {} {}: {}", self.status.task_id(), row.node_id, target, reason);
                        self.emit_settled(&row.node_id, target, reason);
                        changed = true;
                    }
                }
            }
        }
        Ok(changed)
    }

    fn verdict(
        &self,
        graph: &Graph,
        snapshot: &Snapshot,
        row: &NodeState,
        now: DateTime<Utc>,
        failed: Option<&str>,
    ) -> Option<Verdict> {
        if self.control.is_cancelled() {
            return Some(Verdict::Move(NodeStatus::Cancelled, "cancelled by request".to_string()));
        }
        if row.is_stale(now, to_chrono(self.config.stale_after())) {
            return Some(Verdict::Reclaim);
        }

        if matches!(row.status, NodeStatus::Pending | NodeStatus::Ready) {
            let upstream = graph.predecessors(&row.node_id).iter().find_map(|p| {
                let status = snapshot.node(p)?.status;
                matches!(status, NodeStatus::Failed | NodeStatus::Blocked | NodeStatus::Cancelled)
                    .then_some((p, status))
            });
            match upstream {
                Some((upstream, NodeStatus::Cancelled)) => {
                    return Some(Verdict::Move(
                        NodeStatus::Cancelled,
                        format!("upstream node '{}' was cancelled", upstream),
                    ));
                }
                Some((upstream, _)) => {
                    return Some(Verdict::Move(
                        NodeStatus::Blocked,
                        format!("upstream node '{}' did not complete", upstream),
                    ));
                }
                None => {}
            }
        }

        if self.config.failure_policy == FailurePolicy::FailFast
            && matches!(
                row.status,
                NodeStatus::Pending | NodeStatus::Ready | NodeStatus::AwaitingInput
            )
        {
            if let Some(failed) = failed {
                return Some(Verdict::Move(
                    NodeStatus::Blocked,
                    format!("fail-fast: node '{}' failed", failed),
                ));
            }
        }

        if row.status == NodeStatus::AwaitingInput {
            if let Some(limit) = self.config.human_input_timeout() {
                let parked_at = row.heartbeat_at.or(row.started_at).unwrap_or(now);
                if now - parked_at > to_chrono(limit) {
                    return Some(Verdict::Move(
                        NodeStatus::Failed,
                        format!("no input within {:?}", limit),
                    ));
                }
            }
        }
        None
    }

    fn emit_settled(&self, node_id: &str, target: NodeStatus, reason: String) {
        let task_id = self.status.task_id().to_string();
        let node_id = node_id.to_string();
        let event = match target {
            NodeStatus::Blocked => EngineEvent::NodeBlocked { task_id, node_id },
            NodeStatus::Cancelled => EngineEvent::NodeCancelled { task_id, node_id },
            _ => EngineEvent::NodeFailed {
                task_id,
                node_id,
                error: reason,
            },
        };
        self.events.emit(event);
    }

    /// Start every runnable node the limits allow.
    /// Returns true if a runnable node had to wait for a permit.
    async fn dispatch(
        &self,
        graph: &Graph,
        snapshot: &Snapshot,
        in_flight: &mut HashSet<String>,
        local: &Arc<Semaphore>,
        exit_tx: &mpsc::UnboundedSender<WorkerExit>,
    ) -> Result<bool, EngineError> {
        for node in graph.nodes() {
            if in_flight.contains(&node.id) {
                continue;
            }
            let row = match snapshot.node(&node.id) {
                Some(row) => row,
                None => continue,
            };
            let runnable = match row.status {
                // left behind by a crash between the two dispatch writes
                NodeStatus::Ready => true,
                NodeStatus::Pending => graph.predecessors(&node.id).iter().all(|p| {
                    snapshot
                        .node(p)
                        .map_or(false, |n| n.status == NodeStatus::Completed)
                }),
                _ => false,
            };
            if !runnable {
                continue;
            }

            let permits = match self.acquire(local) {
                Some(permits) => permits,
                None => return Ok(true),
            };

            let ready = if row.status == NodeStatus::Pending {
                match self.status.compare_and_set(row, NodeStatus::Ready, Payload::default()).await? {
                    CasOutcome::Applied(ready) => ready,
                    CasOutcome::Conflict(_) => continue,
                }
            } else {
                row.clone()
            };
            let running = match self.status.compare_and_set(&ready, NodeStatus::Running, Payload::default()).await? {
                CasOutcome::Applied(running) => running,
                CasOutcome::Conflict(_) => continue,
            };

            let task_id = self.status.task_id().to_string();
            log::info!("Task {} node {} started (attempt {})", task_id, node.id, running.attempts);
            self.events.emit(EngineEvent::NodeStarted {
                task_id: task_id.clone(),
                node_id: node.id.clone(),
                attempt: running.attempts,
            });

            in_flight.insert(node.id.clone());
            let guard = ExitGuard {
                node_id: node.id.clone(),
                clean: false,
                tx: exit_tx.clone(),
            };
            let worker = Worker {
                task_id,
                status: self.status.clone(),
                dispatcher: self.dispatcher.clone(),
                events: self.events.clone(),
                cancel: self.control.cancel.clone(),
                heartbeat: self.config.heartbeat_interval(),
            };
            let inputs = upstream_outputs(graph, snapshot, &node.id);
            tokio::spawn(worker.run(node.clone(), running, inputs, guard, permits));
        }
        Ok(false)
    }

    fn acquire(&self, local: &Arc<Semaphore>) -> Option<Permits> {
        let task_permit = local.clone().try_acquire_owned().ok()?;
        let global_permit = match &self.global_limit {
            Some(global) => Some(global.clone().try_acquire_owned().ok()?),
            None => None,
        };
        Some((task_permit, global_permit))
    }

    async fn worker_exited(&self, exit: WorkerExit, in_flight: &mut HashSet<String>) -> Result<(), EngineError> {
        in_flight.remove(&exit.node_id);
        if exit.clean {
            return Ok(());
        }

        log::error!("Task {} node {}: worker panicked", self.status.task_id(), exit.node_id);
        let row = self.status.load_node(&exit.node_id).await?;
        if row.status == NodeStatus::Running {
            let payload = Payload::error("worker panicked");
            if let CasOutcome::Applied(_) = self.status.compare_and_set(&row, NodeStatus::Failed, payload).await? {
                self.emit_settled(&exit.node_id, NodeStatus::Failed, "worker panicked".to_string());
            }
        }
        Ok(())
    }
}

/// Outputs of a node's completed predecessors, keyed by node id
fn upstream_outputs(graph: &Graph, snapshot: &Snapshot, node_id: &str) -> BTreeMap<String, String> {
    graph
        .predecessors(node_id)
        .iter()
        .filter_map(|p| {
            let row = snapshot.node(p)?;
            Some((p.clone(), row.output.clone().unwrap_or_default()))
        })
        .collect()
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::weeks(52 * 100))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::EchoExecutor;
    use crate::config::RetryPolicy;
    use crate::core::{EdgeSpec, RawNode, TaskInstance};
    use crate::store::MemoryStore;

    fn agent(id: &str) -> RawNode {
        RawNode {
            id: id.into(),
            kind: "agent".into(),
            config: serde_json::json!({ "agent_id": id, "prompt": format!("{} out", id) }),
        }
    }

    fn fast_config() -> EngineConfig {
        EngineConfig {
            poll_interval_ms: 10,
            heartbeat_interval_secs: 1,
            stale_after_secs: 2,
            ..EngineConfig::default()
        }
    }

    async fn scheduler_for(graph: Graph) -> (Scheduler, Arc<StatusStore>, Arc<TaskControl>) {
        let task = TaskInstance::new("wf", graph, "tester");
        let status = Arc::new(
            StatusStore::initialize(task, Arc::new(MemoryStore::new()), RetryPolicy::default())
                .await
                .unwrap(),
        );
        let control = Arc::new(TaskControl::new());
        let scheduler = Scheduler::new(
            status.clone(),
            Arc::new(Dispatcher::new(Arc::new(EchoExecutor), Duration::from_secs(5))),
            EventStream::default(),
            fast_config(),
            control.clone(),
            None,
        );
        (scheduler, status, control)
    }

    #[tokio::test]
    async fn test_chain_runs_in_order_and_passes_outputs() {
        let graph = Graph::build(vec![agent("a"), agent("b")], vec![EdgeSpec::new("a", "b")]).unwrap();
        let (scheduler, status, control) = scheduler_for(graph).await;

        let finished = scheduler.run().await.unwrap();
        assert_eq!(finished, TaskStatus::Completed);
        assert_eq!(control.phase(), Phase::Finished(TaskStatus::Completed));

        let b = status.load_node("b").await.unwrap();
        assert_eq!(b.output.as_deref(), Some("b out\n[a] a out"));
        let order: Vec<String> = status.results().await.unwrap().into_iter().map(|r| r.node_id).collect();
        assert_eq!(order, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_parks_on_human_node() {
        let human = RawNode {
            id: "h".into(),
            kind: "human".into(),
            config: serde_json::Value::Null,
        };
        let graph = Graph::build(vec![agent("a"), human], vec![EdgeSpec::new("a", "h")]).unwrap();
        let (scheduler, status, control) = scheduler_for(graph).await;
        let mut phase = control.subscribe();
        let handle = tokio::spawn(scheduler.run());

        tokio::time::timeout(Duration::from_secs(5), phase.wait_for(|p| *p == Phase::Parked))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status.load_node("h").await.unwrap().status, NodeStatus::AwaitingInput);

        control.cancel();
        let finished = tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
        assert_eq!(finished.unwrap(), TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_recorded_cancel_request_is_honoured() {
        let graph = Graph::build(vec![agent("a"), agent("b")], vec![EdgeSpec::new("a", "b")]).unwrap();
        let (scheduler, status, control) = scheduler_for(graph).await;
        status.request_cancel("bob").await.unwrap();

        let finished = tokio::time::timeout(Duration::from_secs(5), scheduler.run())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(finished, TaskStatus::Cancelled);
        assert!(control.is_cancelled());
        assert!(status.results().await.unwrap().is_empty());
        for id in ["a", "b"] {
            assert_eq!(status.load_node(id).await.unwrap().status, NodeStatus::Cancelled);
        }
    }

    #[test]
    fn test_wake_unparks() {
        let control = TaskControl::new();
        control.park(control.wakes());
        assert_eq!(control.phase(), Phase::Parked);
        control.wake();
        assert_eq!(control.phase(), Phase::Running);

        // a pass that started before the wake must not park again
        let stale = control.wakes() - 1;
        control.park(stale);
        assert_eq!(control.phase(), Phase::Running);
    }
}
