//! OpenAI-compatible HTTP provider

use super::{ApiError, Payload, TokenUsage, UpstreamProvider, UpstreamResponse};
use crate::config::UpstreamSettings;
use async_trait::async_trait;
use futures_util::{StreamExt, TryStreamExt};
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

/// Chat-completions client; a batch is fanned out as concurrent calls
pub struct HttpUpstream {
    settings: UpstreamSettings,
    client: Client,
}

impl HttpUpstream {
    pub fn new(settings: UpstreamSettings) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()?;

        Ok(Self { settings, client })
    }

    fn build_request(&self, payload: &Payload) -> Value {
        let mut messages = Vec::new();

        if let Some(system) = &payload.system {
            messages.push(json!({
                "role": "system",
                "content": system
            }));
        }

        messages.push(json!({
            "role": "user",
            "content": payload.prompt
        }));

        let mut body = json!({
            "model": payload.model.as_deref().unwrap_or(&self.settings.model),
            "messages": messages,
        });

        if let Some(max_tokens) = payload.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }

        body
    }

    fn parse_response(&self, response: Value) -> Result<UpstreamResponse, ApiError> {
        let content = response["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| ApiError::Provider("response has no message content".to_string()))?
            .to_string();

        let mut usage = TokenUsage::new(
            response["usage"]["prompt_tokens"].as_u64().unwrap_or(0) as u32,
            response["usage"]["completion_tokens"].as_u64().unwrap_or(0) as u32,
        );
        // Some gateways bill per call and report the charge alongside the tokens
        usage.estimated_cost_usd = response["usage"]["cost"].as_f64().filter(|c| *c >= 0.0);

        Ok(UpstreamResponse {
            content,
            usage,
            model: response["model"]
                .as_str()
                .unwrap_or(&self.settings.model)
                .to_string(),
        })
    }

    async fn send_one(&self, payload: Payload) -> Result<UpstreamResponse, ApiError> {
        let url = format!(
            "{}/chat/completions",
            self.settings.base_url.trim_end_matches('/')
        );
        let body = self.build_request(&payload);

        let mut request = self
            .client
            .post(&url)
            .header("Content-Type", "application/json");

        if let Some(key) = &self.settings.api_key {
            request = request.header("Authorization", format!("Bearer {}", key));
        }

        let response = request.json(&body).send().await?;
        let status = response.status();

        if status.is_success() {
            let json: Value = response.json().await?;
            return self.parse_response(json);
        }

        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(ApiError::Auth(response.text().await.unwrap_or_default()))
            }
            StatusCode::TOO_MANY_REQUESTS => {
                let retry_after_secs = response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(1);
                Err(ApiError::RateLimited { retry_after_secs })
            }
            _ => {
                let error_text = response.text().await.unwrap_or_default();
                Err(ApiError::Provider(format!("{}: {}", status, error_text)))
            }
        }
    }
}

#[async_trait]
impl UpstreamProvider for HttpUpstream {
    async fn send_batch(
        &self,
        service: &str,
        payloads: Vec<Payload>,
    ) -> Result<Vec<UpstreamResponse>, ApiError> {
        debug!(service, size = payloads.len(), "sending provider call");

        futures_util::stream::iter(payloads)
            .map(|payload| self.send_one(payload))
            .buffered(self.settings.max_concurrency.max(1))
            .try_collect()
            .await
    }

    fn name(&self) -> &str {
        "http"
    }
}
