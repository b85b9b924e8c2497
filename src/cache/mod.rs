//! Result cache keyed by exact request hash and by embedding similarity
//!
//! ## Lookup
//!
//! 1. **Exact key**: SHA-256 of the normalised request
//! 2. **Semantic**: highest cosine similarity among live entries of the same
//!    service type, at or above the configured threshold
//!
//! TTL is enforced lazily on access and by [`SemanticCache::sweep`], which
//! the orchestrator runs on a timer.

mod embedding;
mod semantic;
mod tracker;

pub use embedding::{cosine_similarity, request_key, Embedder, HashingEmbedder};
pub use semantic::SemanticCache;
pub use tracker::CacheMetrics;

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// Similarity at or above which a paraphrase is served from cache
pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.90;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CacheError {
    #[error("Cache store unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid cache entry: {0}")]
    InvalidEntry(String),
}

/// Which entry to drop when the store is full
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionStrategy {
    /// Oldest `last_accessed_at` goes first
    #[default]
    Lru,
    /// Lowest `hit_count` goes first, oldest access breaks ties
    Lfu,
}

/// Runtime policy of the cache, replaceable on config reload
#[derive(Debug, Clone, PartialEq)]
pub struct CachePolicy {
    pub max_size: usize,
    pub default_ttl: Duration,
    pub eviction: EvictionStrategy,
    pub similarity_threshold: f32,
    pub semantic_matching: bool,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            max_size: 10_000,
            default_ttl: Duration::from_secs(3600),
            eviction: EvictionStrategy::Lru,
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            semantic_matching: true,
        }
    }
}

/// Snapshot of a stored entry
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: String,
    pub service: String,
    pub embedding: Option<Vec<f32>>,
    pub value: String,
    pub created_at: Instant,
    pub last_accessed_at: Instant,
    pub hit_count: u64,
    pub ttl_seconds: u64,
    /// Provider cost avoided each time this entry is served
    pub cost_saved: f64,
}

/// Data needed to store a new entry
#[derive(Debug, Clone)]
pub struct CacheInsert {
    pub service: String,
    pub key: String,
    pub embedding: Option<Vec<f32>>,
    pub value: String,
    /// Falls back to the policy's default TTL
    pub ttl: Option<Duration>,
    pub cost_saved: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    Exact,
    Semantic,
}

/// A successful lookup
#[derive(Debug, Clone)]
pub struct CacheHit {
    pub entry: CacheEntry,
    pub kind: MatchKind,
    /// 1.0 for exact matches
    pub similarity: f32,
}
