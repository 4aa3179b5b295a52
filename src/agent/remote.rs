//! Backend-side agent registry: the agents bound to this bridge key and
//! deployment requests.
//!
//! These calls are interactive, so they go out once and are never queued.

use crate::error::{Error, Result};
use crate::transport::{ApiRequest, Outcome, Transport};
use serde::Deserialize;
use serde_json::{json, Value};

/// Endpoint that registers an agent for deployment
pub const SPAWN_ENDPOINT: &str = "agent-spawn-request";

/// An agent as the backend knows it
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RemoteAgent {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub agent_type: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

impl RemoteAgent {
    pub fn is_active(&self) -> bool {
        self.status.as_deref() == Some("active")
    }
}

fn backend_error(outcome: Outcome) -> Error {
    match outcome {
        Outcome::ClientError { status, body } | Outcome::ServerError { status, body } => {
            Error::Backend(format!("HTTP {}: {}", status, body))
        }
        other => Error::Backend(other.label()),
    }
}

/// Agents bound to this bridge key, asked through the poll endpoint
pub async fn list_remote_agents(
    transport: &dyn Transport,
    poll_endpoint: &str,
) -> Result<Vec<RemoteAgent>> {
    let request = ApiRequest::post(poll_endpoint, json!({"action": "list_agents"}));
    let body = match transport.send(&request).await {
        Outcome::Success(body) => body,
        outcome => return Err(backend_error(outcome)),
    };

    let agents = match body {
        Value::Object(mut map) => map.remove("agents"),
        _ => None,
    };
    match agents {
        Some(agents @ Value::Array(_)) => Ok(serde_json::from_value(agents)?),
        _ => Err(Error::Backend("response has no agent list".to_string())),
    }
}

/// Register `agent_id` for local deployment on `platform`
pub async fn request_deploy(transport: &dyn Transport, agent_id: &str, platform: &str) -> Result<()> {
    let request = ApiRequest::post(
        SPAWN_ENDPOINT,
        json!({
            "agent_id": agent_id,
            "platform": platform,
            "deploy_local": true,
        }),
    );
    let body = match transport.send(&request).await {
        Outcome::Success(body) => body,
        outcome => return Err(backend_error(outcome)),
    };

    if body.get("success").and_then(Value::as_bool) == Some(true) {
        tracing::info!(agent_id = agent_id, platform = platform, "Agent registered for deployment");
        return Ok(());
    }
    let reason = body
        .get("error")
        .and_then(Value::as_str)
        .unwrap_or("deployment was not accepted");
    Err(Error::Backend(reason.to_string()))
}
