//! Request, token and cost counters for the layer

mod report;

pub use report::CostReport;

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

/// Usage counters since startup
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageMetrics {
    /// Requests handed to `process_request`
    pub requests: u64,
    /// Served from cache
    pub cache_hits: u64,
    /// Completed through a batch queue
    pub batched: u64,
    /// Completed as a batch of one
    pub direct: u64,
    /// Upstream or dispatch failures
    pub failed: u64,
    /// Refused with a budget error
    pub denied: u64,
    /// Parked for later retry
    pub deferred: u64,
    /// Admitted after a throttle delay
    pub throttled: u64,
    /// Prompt tokens sent upstream
    pub prompt_tokens: u64,
    /// Completion tokens received
    pub completion_tokens: u64,
    /// Tokens removed by prompt optimization
    pub tokens_saved: u64,
    /// Provider spend (USD)
    pub total_cost: f64,
    /// Spend avoided by cache hits (USD)
    pub cost_saved: f64,
}

impl UsageMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_completion(
        &mut self,
        prompt_tokens: u32,
        completion_tokens: u32,
        tokens_saved: usize,
        cost: f64,
        batched: bool,
    ) {
        self.prompt_tokens += prompt_tokens as u64;
        self.completion_tokens += completion_tokens as u64;
        self.tokens_saved += tokens_saved as u64;
        self.total_cost += cost;
        if batched {
            self.batched += 1;
        } else {
            self.direct += 1;
        }
    }

    pub fn record_cache_hit(&mut self, tokens_saved: usize, cost_saved: f64) {
        self.cache_hits += 1;
        self.tokens_saved += tokens_saved as u64;
        self.cost_saved += cost_saved;
    }

    /// Share of the would-be prompt tokens that actually went upstream
    pub fn compression_ratio(&self) -> f64 {
        let total_before = self.prompt_tokens + self.tokens_saved;
        if total_before == 0 {
            return 1.0;
        }
        self.prompt_tokens as f64 / total_before as f64
    }

    pub fn average_cost_per_call(&self) -> f64 {
        let calls = self.batched + self.direct;
        if calls == 0 {
            return 0.0;
        }
        self.total_cost / calls as f64
    }

    pub fn cache_hit_rate(&self) -> f64 {
        if self.requests == 0 {
            return 0.0;
        }
        self.cache_hits as f64 / self.requests as f64
    }
}

/// Thread-safe usage tracker
#[derive(Clone, Default)]
pub struct UsageTracker {
    inner: Arc<Mutex<UsageMetrics>>,
}

impl UsageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn update(&self, f: impl FnOnce(&mut UsageMetrics)) {
        if let Ok(mut metrics) = self.inner.lock() {
            f(&mut metrics);
        }
    }

    pub fn record_request(&self) {
        self.update(|m| m.requests += 1);
    }

    pub fn record_completion(
        &self,
        prompt_tokens: u32,
        completion_tokens: u32,
        tokens_saved: usize,
        cost: f64,
        batched: bool,
    ) {
        self.update(|m| {
            m.record_completion(prompt_tokens, completion_tokens, tokens_saved, cost, batched)
        });
    }

    pub fn record_cache_hit(&self, tokens_saved: usize, cost_saved: f64) {
        self.update(|m| m.record_cache_hit(tokens_saved, cost_saved));
    }

    pub fn record_failure(&self) {
        self.update(|m| m.failed += 1);
    }

    pub fn record_denied(&self) {
        self.update(|m| m.denied += 1);
    }

    pub fn record_deferred(&self) {
        self.update(|m| m.deferred += 1);
    }

    pub fn record_throttled(&self) {
        self.update(|m| m.throttled += 1);
    }

    pub fn get_metrics(&self) -> UsageMetrics {
        self.inner
            .lock()
            .map(|m| m.clone())
            .unwrap_or_default()
    }
}

impl std::fmt::Display for UsageMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "=== Usage ===")?;
        writeln!(f, "Requests: {}", self.requests)?;
        writeln!(
            f,
            "Cache hits: {} ({:.1}%)",
            self.cache_hits,
            self.cache_hit_rate() * 100.0
        )?;
        writeln!(f, "Batched: {}, direct: {}", self.batched, self.direct)?;
        writeln!(
            f,
            "Failed: {}, denied: {}, deferred: {}, throttled: {}",
            self.failed, self.denied, self.deferred, self.throttled
        )?;
        writeln!(
            f,
            "Tokens: {} prompt, {} completion, {} saved",
            self.prompt_tokens, self.completion_tokens, self.tokens_saved
        )?;
        writeln!(f, "Compression ratio: {:.2}%", self.compression_ratio() * 100.0)?;
        writeln!(f, "Total cost: ${:.4}", self.total_cost)?;
        writeln!(f, "Cost saved: ${:.4}", self.cost_saved)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracker_counts() {
        let tracker = UsageTracker::new();

        tracker.record_request();
        tracker.record_request();
        tracker.record_request();
        tracker.record_completion(100, 20, 25, 0.5, true);
        tracker.record_completion(50, 10, 0, 0.25, false);
        tracker.record_cache_hit(5, 0.5);

        let metrics = tracker.get_metrics();
        assert_eq!(metrics.batched, 1);
        assert_eq!(metrics.direct, 1);
        assert_eq!(metrics.tokens_saved, 30);
        assert!((metrics.total_cost - 0.75).abs() < 1e-9);
        assert!((metrics.average_cost_per_call() - 0.375).abs() < 1e-9);
        assert!((metrics.cache_hit_rate() - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_compression_ratio() {
        let mut metrics = UsageMetrics::new();
        assert_eq!(metrics.compression_ratio(), 1.0);

        metrics.record_completion(75, 0, 25, 0.0, false);
        assert!((metrics.compression_ratio() - 0.75).abs() < 1e-9);
    }
}
