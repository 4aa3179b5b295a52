//! Request and outcome types exchanged with the backend

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// HTTP method of an outbound request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    #[default]
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        }
    }
}

impl From<Method> for reqwest::Method {
    fn from(method: Method) -> Self {
        match method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Patch => reqwest::Method::PATCH,
            Method::Delete => reqwest::Method::DELETE,
        }
    }
}

/// One outbound API call
///
/// `id` is assigned once at creation and travels with the request through
/// the offline queue, so a replay carries the same `x-request-id` as the
/// original attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiRequest {
    pub id: Uuid,
    pub endpoint: String,
    #[serde(default)]
    pub method: Method,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl ApiRequest {
    pub fn new(endpoint: impl Into<String>, method: Method, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            endpoint: endpoint.into(),
            method,
            payload,
        }
    }

    pub fn post(endpoint: impl Into<String>, payload: serde_json::Value) -> Self {
        Self::new(endpoint, Method::Post, payload)
    }
}

/// Result of a single send attempt
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// 2xx with the parsed JSON body (`Null` when the body is empty or not JSON)
    Success(serde_json::Value),
    /// Non-2xx below 500: permanent, never retried
    ClientError { status: u16, body: String },
    /// 5xx: retryable through the offline queue
    ServerError { status: u16, body: String },
    /// No HTTP response at all (DNS, connect, timeout)
    Unreachable(String),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    /// Whether the request should be kept for a later replay
    pub fn is_retryable(&self) -> bool {
        matches!(self, Outcome::ServerError { .. } | Outcome::Unreachable(_))
    }

    /// Short label for logs
    pub fn label(&self) -> String {
        match self {
            Outcome::Success(_) => "success".to_string(),
            Outcome::ClientError { status, .. } => format!("client error {}", status),
            Outcome::ServerError { status, .. } => format!("server error {}", status),
            Outcome::Unreachable(cause) => format!("unreachable ({})", cause),
        }
    }
}
