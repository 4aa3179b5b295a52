//! reqwest-backed transport to the backend functions API

use super::types::{ApiRequest, Outcome};
use super::Transport;
use crate::config::BackendConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::time::Duration;

/// Longest error body kept on an outcome
const MAX_ERROR_BODY: usize = 2000;

/// Credential header attached to every request
#[derive(Debug, Clone)]
pub struct Credential {
    header: &'static str,
    value: String,
}

impl Credential {
    /// Bridge worker credential (`x-bridge-key`)
    pub fn bridge_key(value: impl Into<String>) -> Self {
        Self {
            header: "x-bridge-key",
            value: value.into(),
        }
    }

    /// Agent worker credential (`x-connection-token`)
    pub fn connection_token(value: impl Into<String>) -> Self {
        Self {
            header: "x-connection-token",
            value: value.into(),
        }
    }
}

/// HTTP transport
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    anon_key: String,
    credential: Credential,
    max_body_bytes: usize,
}

impl HttpTransport {
    pub fn new(backend: &BackendConfig, credential: Credential) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(backend.request_timeout_secs))
            .connect_timeout(Duration::from_secs(backend.request_timeout_secs.min(10)))
            .user_agent(concat!("pl-bridge/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(Error::Http)?;

        Ok(Self {
            client,
            base_url: backend.url.trim_end_matches('/').to_string(),
            anon_key: backend.anon_key.clone(),
            credential,
            max_body_bytes: backend.max_body_bytes,
        })
    }

    fn url_for(&self, endpoint: &str) -> String {
        format!(
            "{}/functions/v1/{}",
            self.base_url,
            endpoint.trim_start_matches('/')
        )
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: &ApiRequest) -> Outcome {
        let body = match serde_json::to_vec(&request.payload) {
            Ok(body) => body,
            Err(e) => {
                return Outcome::ClientError {
                    status: 400,
                    body: format!("payload not serializable: {}", e),
                }
            }
        };

        if body.len() > self.max_body_bytes {
            tracing::warn!(
                endpoint = %request.endpoint,
                size = body.len(),
                limit = self.max_body_bytes,
                "Refusing oversized request body"
            );
            return Outcome::ClientError {
                status: 413,
                body: format!(
                    "request body of {} bytes exceeds limit of {}",
                    body.len(),
                    self.max_body_bytes
                ),
            };
        }

        let mut builder = self
            .client
            .request(request.method.into(), self.url_for(&request.endpoint))
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header("apikey", &self.anon_key)
            .bearer_auth(&self.anon_key)
            .header(self.credential.header, &self.credential.value)
            .header("x-request-id", request.id.to_string());
        if !request.payload.is_null() {
            builder = builder.body(body);
        }

        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) => {
                tracing::debug!(endpoint = %request.endpoint, error = %e, "Request failed");
                return Outcome::Unreachable(describe_error(&e));
            }
        };

        let status = response.status();
        let text = match response.text().await {
            Ok(text) => text,
            Err(e) => return Outcome::Unreachable(describe_error(&e)),
        };

        if status.is_success() {
            let value = serde_json::from_str(&text).unwrap_or(serde_json::Value::Null);
            Outcome::Success(value)
        } else if status.is_server_error() {
            Outcome::ServerError {
                status: status.as_u16(),
                body: truncate_body(text),
            }
        } else {
            Outcome::ClientError {
                status: status.as_u16(),
                body: truncate_body(text),
            }
        }
    }
}

fn describe_error(e: &reqwest::Error) -> String {
    if e.is_timeout() {
        "timed out".to_string()
    } else if e.is_connect() {
        format!("connection failed: {}", e)
    } else {
        e.to_string()
    }
}

fn truncate_body(mut text: String) -> String {
    if text.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
    }
    text
}
