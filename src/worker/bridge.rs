//! Bridge worker loop
//!
//! ```text
//! Starting ─▶ Polling ─▶ Replaying ─┬─(drained)─▶ Executing ─┐
//!               ▲                   └─(stalled)──────────────┤
//!               └──────────────── Backoff ◀─────────────────┘
//!                                    │ shutdown
//!                                    ▼
//!                                 Stopped
//! ```
//!
//! Queued requests always go out before anything new, oldest first. A
//! retryable failure during replay stalls the cycle so nothing is sent out
//! of order.

use crate::agent::AgentSupervisor;
use crate::config::BridgeConfig;
use crate::error::Result;
use crate::executor::{Task, TaskExecutor, TaskFailure, TaskResult};
use crate::queue::OfflineQueue;
use crate::transport::{ApiRequest, Outcome, Transport};
use crate::worker::state::{PollCycleResult, WorkerState, WorkerStatus};
use chrono::Utc;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Poll endpoint used by single-agent workers
pub const AGENT_POLL_ENDPOINT: &str = "agent-task-queue";

/// Endpoints and cadence for one worker
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub poll_endpoint: String,
    pub poll_payload: Value,
    pub result_endpoint: String,
    pub poll_interval: Duration,
    pub status_path: PathBuf,
}

impl WorkerOptions {
    /// Machine-level bridge
    pub fn bridge(config: &BridgeConfig) -> Self {
        Self {
            poll_endpoint: config.worker.poll_endpoint.clone(),
            poll_payload: json!({
                "machine_name": config.worker.resolved_machine_name(),
                "capabilities": config.worker.capabilities,
            }),
            result_endpoint: config.worker.result_endpoint.clone(),
            poll_interval: config.worker.poll_interval(),
            status_path: config.storage.status_file(),
        }
    }

    /// Single agent polling its own task queue
    pub fn agent(config: &BridgeConfig, agent_id: &str) -> Self {
        Self {
            poll_endpoint: AGENT_POLL_ENDPOINT.to_string(),
            poll_payload: json!({}),
            result_endpoint: config.worker.result_endpoint.clone(),
            poll_interval: config.worker.poll_interval(),
            status_path: config.storage.agent_status_file(agent_id),
        }
    }
}

/// How a single outbound request was handled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    /// Kept in the offline queue under this sequence number
    Queued(u64),
    /// Rejected by the backend with a 4xx
    Discarded(u16),
}

pub struct BridgeWorker {
    transport: Arc<dyn Transport>,
    queue: OfflineQueue,
    supervisor: Option<AgentSupervisor>,
    executor: TaskExecutor,
    options: WorkerOptions,
    state: WorkerState,
    last_cycle: Option<PollCycleResult>,
}

impl BridgeWorker {
    pub fn new(
        transport: Arc<dyn Transport>,
        queue: OfflineQueue,
        supervisor: Option<AgentSupervisor>,
        executor: TaskExecutor,
        options: WorkerOptions,
    ) -> Self {
        Self {
            transport,
            queue,
            supervisor,
            executor,
            options,
            state: WorkerState::Starting,
            last_cycle: None,
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn queue(&self) -> &OfflineQueue {
        &self.queue
    }

    pub fn supervisor_mut(&mut self) -> Option<&mut AgentSupervisor> {
        self.supervisor.as_mut()
    }

    pub fn last_cycle(&self) -> Option<&PollCycleResult> {
        self.last_cycle.as_ref()
    }

    fn transition(&mut self, next: WorkerState) {
        if self.state != next {
            tracing::trace!(from = %self.state, to = %next, "Worker state change");
            self.state = next;
        }
    }

    /// Apply the reloadable parts of a new configuration
    pub fn apply_reload(&mut self, config: &BridgeConfig) {
        let interval = config.worker.poll_interval();
        if interval != self.options.poll_interval {
            tracing::info!(
                poll_interval_secs = config.worker.poll_interval_secs,
                "Poll interval updated"
            );
            self.options.poll_interval = interval;
        }
        if let Some(supervisor) = self.supervisor.as_mut() {
            if supervisor.auto_restart() != config.agents.auto_restart {
                tracing::info!(auto_restart = config.agents.auto_restart, "Agent auto-restart updated");
                supervisor.set_auto_restart(config.agents.auto_restart);
            }
        }
    }

    /// Run until `cancel` fires. Config updates arriving on `reload` are
    /// applied at the start of the next cycle.
    pub async fn run(
        mut self,
        cancel: CancellationToken,
        mut reload: Option<watch::Receiver<BridgeConfig>>,
    ) -> Result<()> {
        tracing::info!(
            poll_endpoint = %self.options.poll_endpoint,
            poll_interval_secs = self.options.poll_interval.as_secs(),
            queued = self.queue.len(),
            "Bridge worker started"
        );

        while !cancel.is_cancelled() {
            if let Some(rx) = reload.as_mut() {
                if rx.has_changed().unwrap_or(false) {
                    let config = rx.borrow_and_update().clone();
                    self.apply_reload(&config);
                }
            }

            self.run_cycle(&cancel).await;
            if cancel.is_cancelled() {
                break;
            }

            self.transition(WorkerState::Backoff);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.options.poll_interval) => {}
            }
        }

        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        self.transition(WorkerState::Stopped);
        let persisted = self.queue.persist();
        self.write_status();

        if let Some(supervisor) = self.supervisor.as_mut() {
            let running = supervisor.status().filter(|s| s.running).count();
            if running > 0 {
                tracing::info!(running = running, "Leaving agents running");
            }
        }
        tracing::info!(queued = self.queue.len(), "Bridge worker stopped");
        persisted
    }

    /// One full Polling → Replaying → Executing pass
    pub async fn run_cycle(&mut self, cancel: &CancellationToken) -> PollCycleResult {
        let mut cycle = PollCycleResult::default();

        self.transition(WorkerState::Polling);
        if let Some(supervisor) = self.supervisor.as_mut() {
            let restarted = supervisor.reconcile();
            if !restarted.is_empty() {
                tracing::info!(agents = ?restarted, "Restarted crashed agents");
            }
        }

        self.transition(WorkerState::Replaying);
        if self.replay(&mut cycle).await {
            self.transition(WorkerState::Executing);
            self.poll_and_execute(&mut cycle, cancel).await;
        }

        if cycle.is_idle() {
            tracing::debug!(reachable = cycle.backend_reachable, queued = self.queue.len(), "Poll cycle complete");
        } else {
            tracing::info!(
                replayed = cycle.replayed,
                discarded = cycle.discarded,
                fetched = cycle.fetched,
                executed = cycle.executed,
                failures = cycle.failures,
                reachable = cycle.backend_reachable,
                queued = self.queue.len(),
                "Poll cycle complete"
            );
        }

        self.last_cycle = Some(cycle.clone());
        self.write_status();
        cycle
    }

    /// Drain the queue oldest-first. Returns false if a retryable failure
    /// stalled the drain.
    async fn replay(&mut self, cycle: &mut PollCycleResult) -> bool {
        let pending: Vec<(u64, ApiRequest)> = self
            .queue
            .peek_all()
            .map(|entry| (entry.seq, entry.request.clone()))
            .collect();

        for (seq, request) in pending {
            match self.transport.send(&request).await {
                Outcome::Success(_) => {
                    self.queue.remove(seq);
                    cycle.replayed += 1;
                    cycle.backend_reachable = true;
                }
                Outcome::ClientError { status, body } => {
                    tracing::warn!(
                        seq = seq,
                        endpoint = %request.endpoint,
                        status = status,
                        body = %body,
                        "Discarding queued request rejected by backend"
                    );
                    self.queue.remove(seq);
                    cycle.discarded += 1;
                    cycle.backend_reachable = true;
                }
                outcome => {
                    tracing::info!(
                        seq = seq,
                        outcome = %outcome.label(),
                        remaining = self.queue.len(),
                        "Backend unavailable, replay paused"
                    );
                    self.queue.mark_retry(seq);
                    cycle.backend_reachable = false;
                    return false;
                }
            }
        }

        if cycle.replayed + cycle.discarded > 0 {
            tracing::info!(
                replayed = cycle.replayed,
                discarded = cycle.discarded,
                "Offline queue drained"
            );
        }
        true
    }

    async fn poll_and_execute(&mut self, cycle: &mut PollCycleResult, cancel: &CancellationToken) {
        let poll = ApiRequest::post(&self.options.poll_endpoint, self.options.poll_payload.clone());
        let body = match self.transport.send(&poll).await {
            Outcome::Success(body) => {
                cycle.backend_reachable = true;
                body
            }
            Outcome::ClientError { status, body } => {
                cycle.backend_reachable = true;
                tracing::warn!(status = status, body = %body, "Poll rejected by backend, check credentials");
                return;
            }
            outcome => {
                cycle.backend_reachable = false;
                tracing::debug!(outcome = %outcome.label(), "Poll failed");
                return;
            }
        };

        let (tasks, messages) = split_poll_response(body);
        cycle.fetched = tasks.len();

        for message in &messages {
            let from = message.get("from_agent_id").and_then(Value::as_str).unwrap_or("?");
            let content = message.get("content").and_then(Value::as_str).unwrap_or("");
            tracing::info!(from = from, content = content, "Agent message");
        }

        for raw in tasks {
            let result = match serde_json::from_value::<Task>(raw.clone()) {
                Ok(task) if cancel.is_cancelled() => {
                    TaskResult::failed(&task.id, TaskFailure::Cancelled, "Bridge shutting down")
                }
                Ok(task) => {
                    cycle.executed += 1;
                    self.executor.execute(&task, cancel).await
                }
                Err(e) => match raw.get("id").and_then(Value::as_str) {
                    Some(id) => {
                        TaskResult::failed(id, TaskFailure::InvalidTask, format!("Malformed task: {}", e))
                    }
                    None => {
                        tracing::warn!(error = %e, "Skipping task without an id");
                        cycle.failures += 1;
                        continue;
                    }
                },
            };

            if !result.is_success() {
                cycle.failures += 1;
            }
            let report = result.to_request(&self.options.result_endpoint);
            if cancel.is_cancelled() {
                self.queue.enqueue(report);
            } else {
                self.deliver(report).await;
            }
        }
    }

    /// Send a state-carrying request, queueing it when the backend is not
    /// available. Anything already queued goes first, so a non-empty queue
    /// means this request joins the back of it.
    pub async fn deliver(&mut self, request: ApiRequest) -> Delivery {
        if !self.queue.is_empty() {
            let seq = self.queue.enqueue(request);
            return Delivery::Queued(seq);
        }

        match self.transport.send(&request).await {
            Outcome::Success(_) => Delivery::Sent,
            Outcome::ClientError { status, body } => {
                tracing::warn!(
                    endpoint = %request.endpoint,
                    status = status,
                    body = %body,
                    "Backend rejected request"
                );
                Delivery::Discarded(status)
            }
            outcome => {
                let seq = self.queue.enqueue(request);
                tracing::info!(seq = seq, outcome = %outcome.label(), "Queued request for replay");
                Delivery::Queued(seq)
            }
        }
    }

    pub fn status(&mut self) -> WorkerStatus {
        let agents = match self.supervisor.as_mut() {
            Some(supervisor) => supervisor.status().collect(),
            None => Vec::new(),
        };
        WorkerStatus {
            state: self.state,
            pid: Some(std::process::id()),
            queue_len: self.queue.len(),
            agents,
            last_cycle: self.last_cycle.clone(),
            updated_at: Utc::now(),
        }
    }

    fn write_status(&mut self) {
        let status = self.status();
        if let Err(e) = status.write(&self.options.status_path) {
            tracing::warn!(path = %self.options.status_path.display(), error = %e, "Failed to write status file");
        }
    }
}

/// `{"tasks": [...], "messages": [...]}`; anything missing or malformed is empty
fn split_poll_response(body: Value) -> (Vec<Value>, Vec<Value>) {
    let Value::Object(mut map) = body else {
        return (Vec::new(), Vec::new());
    };
    let mut take = |key: &str| match map.remove(key) {
        Some(Value::Array(items)) => items,
        _ => Vec::new(),
    };
    let tasks = take("tasks");
    let messages = take("messages");
    (tasks, messages)
}
