//! Provider-facing abstraction and the request/result shapes of the layer

mod client;
mod request;
mod response;

pub use client::HttpUpstream;
pub use request::{Payload, Priority, ProcessRequest, TemplateInvocation};
pub use response::{ProcessResult, TokenUsage, UpstreamResponse};

use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Rate limited: retry after {retry_after_secs} seconds")]
    RateLimited { retry_after_secs: u64 },

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// The metered inference provider sitting behind the layer
#[async_trait]
pub trait UpstreamProvider: Send + Sync {
    /// Execute every payload of one service type in a single provider call.
    ///
    /// Responses must come back in input order. An error fails the whole
    /// call; there is no partial success.
    async fn send_batch(
        &self,
        service: &str,
        payloads: Vec<Payload>,
    ) -> Result<Vec<UpstreamResponse>, ApiError>;

    /// Get provider name for logging
    fn name(&self) -> &str;
}
