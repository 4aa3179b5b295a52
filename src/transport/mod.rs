//! Transport client for the backend control plane
//!
//! A single `send` call per request: no retries here. The worker decides
//! what to do with each [`Outcome`] (drop, keep, or queue for replay).

mod client;
#[cfg(test)]
pub(crate) mod mock;
mod types;

pub use client::{Credential, HttpTransport};
pub use types::{ApiRequest, Method, Outcome};

use async_trait::async_trait;

/// Request/response exchange with the backend
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one request and classify what happened
    async fn send(&self, request: &ApiRequest) -> Outcome;
}
