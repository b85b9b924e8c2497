//! API response structures

use serde::{Deserialize, Serialize};

/// Response from the inference provider for a single payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamResponse {
    /// The generated content
    pub content: String,

    /// Token usage statistics
    pub usage: TokenUsage,

    /// Model that generated the response
    pub model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TokenUsage {
    /// Tokens in the prompt
    pub prompt_tokens: u32,
    /// Tokens in the response
    pub completion_tokens: u32,
    /// Total tokens used
    pub total_tokens: u32,
    /// Cost in USD reported by the provider (if available)
    pub estimated_cost_usd: Option<f64>,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
            estimated_cost_usd: None,
        }
    }
}

/// Result returned to application code
#[derive(Debug, Clone, Serialize)]
pub struct ProcessResult {
    pub request_id: String,
    pub output: String,
    pub from_cache: bool,
    pub was_batched: bool,
    /// Size of the provider call this request rode in (0 when cached)
    pub batch_size: usize,
    pub actual_cost: f64,
    /// Similarity of the matched entry when served from cache
    pub cache_similarity: Option<f32>,
    /// Tokens removed by prompt optimization
    pub tokens_saved: usize,
}
