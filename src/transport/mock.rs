//! Scripted transport for worker tests

use super::{ApiRequest, Outcome, Transport};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

/// Records every request and answers from a per-endpoint script.
///
/// Scripted outcomes are consumed in order; once an endpoint's script is
/// empty the transport-wide default answers.
pub struct MockTransport {
    scripts: Mutex<HashMap<String, VecDeque<Outcome>>>,
    default: Mutex<Outcome>,
    sent: Mutex<Vec<ApiRequest>>,
}

impl MockTransport {
    /// Every request succeeds with an empty body
    pub fn online() -> Self {
        Self::with_default(Outcome::Success(serde_json::json!({})))
    }

    /// Every request fails as unreachable
    pub fn offline() -> Self {
        Self::with_default(Outcome::Unreachable("network down".to_string()))
    }

    pub fn with_default(default: Outcome) -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            default: Mutex::new(default),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn set_default(&self, outcome: Outcome) {
        *self.default.lock().unwrap() = outcome;
    }

    /// Queue one outcome for the next request to `endpoint`
    pub fn push(&self, endpoint: &str, outcome: Outcome) {
        self.scripts
            .lock()
            .unwrap()
            .entry(endpoint.to_string())
            .or_default()
            .push_back(outcome);
    }

    /// All requests in send order
    pub fn sent(&self) -> Vec<ApiRequest> {
        self.sent.lock().unwrap().clone()
    }

    /// Requests sent to one endpoint, in order
    pub fn sent_to(&self, endpoint: &str) -> Vec<ApiRequest> {
        self.sent()
            .into_iter()
            .filter(|r| r.endpoint == endpoint)
            .collect()
    }

    pub fn clear_sent(&self) {
        self.sent.lock().unwrap().clear();
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, request: &ApiRequest) -> Outcome {
        self.sent.lock().unwrap().push(request.clone());
        let scripted = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&request.endpoint)
            .and_then(|q| q.pop_front());
        scripted.unwrap_or_else(|| self.default.lock().unwrap().clone())
    }
}
