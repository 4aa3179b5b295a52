//! Task model and result reporting

use crate::transport::ApiRequest;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;
use std::path::PathBuf;

/// A unit of work fetched from the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    #[serde(default)]
    pub action_type: String,
    #[serde(default)]
    pub action_description: String,
    #[serde(default)]
    pub action_data: Option<Value>,
}

/// What a task asks the machine to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskAction {
    /// Shell command run via `sh -c`
    Shell { command: String, cwd: Option<PathBuf> },
    /// Inline script run by the configured interpreter
    Script { script: String, cwd: Option<PathBuf> },
    /// Unknown action type; acknowledged without running anything
    Acknowledge { action_type: String },
    /// Task cannot be run as given
    Invalid { reason: String },
}

impl Task {
    fn data_str(&self, key: &str) -> Option<&str> {
        self.action_data
            .as_ref()
            .and_then(|d| d.get(key))
            .and_then(Value::as_str)
    }

    fn cwd(&self) -> Option<PathBuf> {
        self.data_str("cwd")
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from)
    }

    /// Interpret `action_type` and `action_data`
    pub fn action(&self) -> TaskAction {
        match self.action_type.as_str() {
            "shell" | "command" | "execute" => {
                let command = self
                    .data_str("command")
                    .filter(|c| !c.trim().is_empty())
                    .unwrap_or(&self.action_description);
                if command.trim().is_empty() {
                    TaskAction::Invalid {
                        reason: "No command provided".to_string(),
                    }
                } else {
                    TaskAction::Shell {
                        command: command.to_string(),
                        cwd: self.cwd(),
                    }
                }
            }
            "python" | "script" => match self.data_str("script") {
                Some(script) if !script.trim().is_empty() => TaskAction::Script {
                    script: script.to_string(),
                    cwd: self.cwd(),
                },
                _ => TaskAction::Invalid {
                    reason: "No script provided".to_string(),
                },
            },
            other => TaskAction::Acknowledge {
                action_type: other.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Completed,
    Failed,
}

/// Why a task failed before or during execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskFailure {
    PolicyViolation,
    ExecutionTimeout,
    SpawnFailure,
    Cancelled,
    InvalidTask,
    OutputLimit,
}

impl TaskFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PolicyViolation => "policy_violation",
            Self::ExecutionTimeout => "execution_timeout",
            Self::SpawnFailure => "spawn_failure",
            Self::Cancelled => "cancelled",
            Self::InvalidTask => "invalid_task",
            Self::OutputLimit => "output_limit",
        }
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one task, ready to report
#[derive(Debug, Clone, PartialEq)]
pub struct TaskResult {
    pub task_id: String,
    pub status: TaskStatus,
    pub failure: Option<TaskFailure>,
    pub data: Map<String, Value>,
}

impl TaskResult {
    pub fn completed(task_id: impl Into<String>, data: Map<String, Value>) -> Self {
        Self {
            task_id: task_id.into(),
            status: TaskStatus::Completed,
            failure: None,
            data,
        }
    }

    /// A failure with an `error` message and `error_kind` tag
    pub fn failed(
        task_id: impl Into<String>,
        failure: TaskFailure,
        error: impl Into<String>,
    ) -> Self {
        let mut data = Map::new();
        data.insert("error".to_string(), Value::String(error.into()));
        data.insert(
            "error_kind".to_string(),
            Value::String(failure.as_str().to_string()),
        );
        Self {
            task_id: task_id.into(),
            status: TaskStatus::Failed,
            failure: Some(failure),
            data,
        }
    }

    /// Non-zero exit without an execution-layer failure
    pub fn exited(task_id: impl Into<String>, data: Map<String, Value>, success: bool) -> Self {
        Self {
            task_id: task_id.into(),
            status: if success {
                TaskStatus::Completed
            } else {
                TaskStatus::Failed
            },
            failure: None,
            data,
        }
    }

    /// Merge extra fields into the result data
    pub fn with(mut self, key: &str, value: Value) -> Self {
        self.data.insert(key.to_string(), value);
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Completed
    }

    pub fn to_payload(&self) -> Value {
        json!({
            "task_id": self.task_id,
            "result_status": self.status,
            "result_data": self.data,
        })
    }

    /// Report request for the result endpoint
    pub fn to_request(&self, endpoint: &str) -> ApiRequest {
        ApiRequest::post(endpoint, self.to_payload())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(action_type: &str, description: &str, data: Option<Value>) -> Task {
        Task {
            id: "t-1".to_string(),
            action_type: action_type.to_string(),
            action_description: description.to_string(),
            action_data: data,
        }
    }

    #[test]
    fn test_parse_task_with_defaults() {
        let t: Task = serde_json::from_value(json!({"id": "abc"})).unwrap();
        assert_eq!(t.id, "abc");
        assert!(t.action_type.is_empty());
        assert!(t.action_data.is_none());
    }

    #[test]
    fn test_shell_action_prefers_command() {
        let t = task("shell", "ignored", Some(json!({"command": "ls", "cwd": "/tmp"})));
        assert_eq!(
            t.action(),
            TaskAction::Shell {
                command: "ls".to_string(),
                cwd: Some(PathBuf::from("/tmp")),
            }
        );
    }

    #[test]
    fn test_shell_action_falls_back_to_description() {
        for kind in ["shell", "command", "execute"] {
            let t = task(kind, "echo hi", None);
            assert_eq!(
                t.action(),
                TaskAction::Shell {
                    command: "echo hi".to_string(),
                    cwd: None,
                }
            );
        }
    }

    #[test]
    fn test_empty_shell_command_is_invalid() {
        let t = task("shell", "  ", Some(json!({"command": ""})));
        assert!(matches!(t.action(), TaskAction::Invalid { .. }));
    }

    #[test]
    fn test_script_action() {
        let t = task("python", "", Some(json!({"script": "print(1)"})));
        assert!(matches!(t.action(), TaskAction::Script { .. }));

        let empty = task("script", "desc", None);
        assert_eq!(
            empty.action(),
            TaskAction::Invalid {
                reason: "No script provided".to_string()
            }
        );
    }

    #[test]
    fn test_unknown_action_is_acknowledged() {
        let t = task("reminder", "water plants", None);
        assert_eq!(
            t.action(),
            TaskAction::Acknowledge {
                action_type: "reminder".to_string()
            }
        );
    }

    #[test]
    fn test_failed_payload_shape() {
        let result = TaskResult::failed("t-9", TaskFailure::PolicyViolation, "blocked");
        let payload = result.to_payload();
        assert_eq!(payload["task_id"], "t-9");
        assert_eq!(payload["result_status"], "failed");
        assert_eq!(payload["result_data"]["error"], "blocked");
        assert_eq!(payload["result_data"]["error_kind"], "policy_violation");
    }

    #[test]
    fn test_to_request_targets_endpoint() {
        let result = TaskResult::completed("t-2", Map::new()).with("output", json!("ok"));
        let request = result.to_request("agent-task-result");
        assert_eq!(request.endpoint, "agent-task-result");
        assert_eq!(request.payload["result_status"], "completed");
        assert_eq!(request.payload["result_data"]["output"], "ok");
    }

    #[test]
    fn test_failure_serializes_snake_case() {
        let v = serde_json::to_value(TaskFailure::ExecutionTimeout).unwrap();
        assert_eq!(v, json!("execution_timeout"));
        assert_eq!(TaskFailure::SpawnFailure.to_string(), "spawn_failure");
    }
}
