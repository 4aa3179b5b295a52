//! Task execution
//!
//! Turns a fetched [`Task`] into a [`TaskResult`]. Every command or script
//! passes the [`CommandGuard`] first; blocked text never reaches a process.

mod runner;
mod task;

pub use runner::{run_command, CommandSpec, ExecEnd, ExecLimits, ExecOutput, TRUNCATION_MARKER};
pub use task::{Task, TaskAction, TaskFailure, TaskResult, TaskStatus};

use crate::config::ExecutorConfig;
use crate::guard::CommandGuard;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Runs tasks under the guard and the configured limits
pub struct TaskExecutor {
    guard: Arc<CommandGuard>,
    config: ExecutorConfig,
}

impl TaskExecutor {
    pub fn new(guard: Arc<CommandGuard>, config: ExecutorConfig) -> Self {
        Self { guard, config }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    fn limits(&self) -> ExecLimits {
        ExecLimits {
            timeout: self.config.timeout(),
            max_output_bytes: self.config.max_output_bytes,
            kill_grace: self.config.kill_grace(),
        }
    }

    /// Execute one task. Never fails; problems are folded into the result.
    pub async fn execute(&self, task: &Task, cancel: &CancellationToken) -> TaskResult {
        match task.action() {
            TaskAction::Shell { command, cwd } => {
                let cwd = cwd.unwrap_or_else(|| self.config.resolved_cwd());
                self.run_guarded(task, &command, CommandSpec::shell(&command, Some(cwd)), cancel)
                    .await
            }
            TaskAction::Script { script, cwd } => {
                let cwd = cwd.unwrap_or_else(|| self.config.resolved_cwd());
                let spec = CommandSpec::script(&self.config.python, &script, Some(cwd));
                self.run_guarded(task, &script, spec, cancel).await
            }
            TaskAction::Acknowledge { action_type } => {
                tracing::info!(task_id = %task.id, action_type = %action_type, "Acknowledged task");
                let mut data = Map::new();
                data.insert(
                    "message".to_string(),
                    json!(format!("Acknowledged task type: {}", action_type)),
                );
                data.insert("description".to_string(), json!(task.action_description));
                TaskResult::completed(&task.id, data)
            }
            TaskAction::Invalid { reason } => {
                tracing::warn!(task_id = %task.id, reason = %reason, "Invalid task");
                TaskResult::failed(&task.id, TaskFailure::InvalidTask, reason)
            }
        }
    }

    async fn run_guarded(
        &self,
        task: &Task,
        text: &str,
        spec: CommandSpec,
        cancel: &CancellationToken,
    ) -> TaskResult {
        if let Some(violation) = self.guard.check(text) {
            tracing::warn!(
                task_id = %task.id,
                rule = %violation.rule,
                "Blocked command by safety guard"
            );
            return TaskResult::failed(
                &task.id,
                TaskFailure::PolicyViolation,
                format!("Blocked by safety rule '{}': {}", violation.rule, violation.description),
            )
            .with("rule", json!(violation.rule));
        }

        tracing::info!(task_id = %task.id, program = %spec.program, "Executing task");
        let cwd_label = spec.cwd.as_ref().map(|p| p.display().to_string());

        let out = match run_command(&spec, self.limits(), cancel).await {
            Ok(out) => out,
            Err(e) => {
                tracing::warn!(task_id = %task.id, error = %e, "Failed to spawn task process");
                return TaskResult::failed(
                    &task.id,
                    TaskFailure::SpawnFailure,
                    format!("Failed to start {}: {}", spec.program, e),
                )
                .with("cwd", json!(cwd_label));
            }
        };

        let result = match out.end {
            ExecEnd::Exited => {
                TaskResult::exited(&task.id, output_data(&out), out.success())
            }
            ExecEnd::TimedOut => TaskResult::failed(
                &task.id,
                TaskFailure::ExecutionTimeout,
                format!("Timed out after {}s", self.config.timeout_secs),
            ),
            ExecEnd::Cancelled => {
                TaskResult::failed(&task.id, TaskFailure::Cancelled, "Cancelled by shutdown")
            }
            ExecEnd::OutputLimit => TaskResult::failed(
                &task.id,
                TaskFailure::OutputLimit,
                format!("Output exceeded {} bytes", self.config.max_output_bytes),
            ),
        };

        let result = if out.end == ExecEnd::Exited {
            result
        } else {
            output_data(&out)
                .into_iter()
                .fold(result, |r, (k, v)| r.with(&k, v))
        };

        tracing::info!(
            task_id = %task.id,
            status = ?result.status,
            exit_code = ?out.exit_code,
            truncated = out.truncated,
            "Task finished"
        );
        result
    }
}

fn output_data(out: &ExecOutput) -> Map<String, Value> {
    let mut data = Map::new();
    data.insert("exit_code".to_string(), json!(out.exit_code));
    data.insert("output".to_string(), json!(out.output));
    data.insert("truncated".to_string(), json!(out.truncated));
    data
}
