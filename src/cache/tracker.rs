//! Cache tracking and metrics for monitoring cache efficiency

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Metrics for cache performance
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheMetrics {
    /// Hits on the exact request key
    pub exact_hits: u64,
    /// Hits through embedding similarity
    pub semantic_hits: u64,
    /// Total cache hits
    pub cache_hits: u64,
    /// Total cache misses
    pub cache_misses: u64,
    /// Entries written
    pub cache_writes: u64,
    /// Entries dropped to make room
    pub evictions: u64,
    /// Entries dropped because their TTL ran out
    pub expirations: u64,
    /// Live entries
    pub entries: usize,
    /// Approximate bytes held by keys, values and embeddings
    pub bytes_stored: usize,
    /// Provider cost avoided by hits (USD)
    pub cost_saved: f64,
    /// Cache hit rate (0.0 - 1.0)
    pub hit_rate: f64,
}

impl CacheMetrics {
    fn update_hit_rate(&mut self) {
        let total = self.cache_hits + self.cache_misses;
        self.hit_rate = if total > 0 {
            self.cache_hits as f64 / total as f64
        } else {
            0.0
        };
    }
}

impl std::fmt::Display for CacheMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "=== Cache Metrics ===")?;
        writeln!(f, "Cache hits: {} ({} exact, {} semantic)", self.cache_hits, self.exact_hits, self.semantic_hits)?;
        writeln!(f, "Cache misses: {}", self.cache_misses)?;
        writeln!(f, "Hit rate: {:.1}%", self.hit_rate * 100.0)?;
        writeln!(f, "Entries: {} (~{} bytes)", self.entries, self.bytes_stored)?;
        writeln!(f, "Evictions: {}, expirations: {}", self.evictions, self.expirations)?;
        writeln!(f, "Cost saved: ${:.4}", self.cost_saved)?;
        Ok(())
    }
}

/// Lock-free counters updated on the read path
#[derive(Debug, Default)]
pub(crate) struct CacheCounters {
    exact_hits: AtomicU64,
    semantic_hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    /// Bits of an `f64` dollar total
    cost_saved_bits: AtomicU64,
}

impl CacheCounters {
    pub fn record_hit(&self, semantic: bool, cost_saved: f64) {
        if semantic {
            self.semantic_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.exact_hits.fetch_add(1, Ordering::Relaxed);
        }
        let cost_saved = cost_saved.max(0.0);
        if cost_saved > 0.0 {
            let _ = self
                .cost_saved_bits
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
                    Some((f64::from_bits(bits) + cost_saved).to_bits())
                });
        }
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_expirations(&self, count: u64) {
        self.expirations.fetch_add(count, Ordering::Relaxed);
    }

    pub fn snapshot(&self, entries: usize, bytes_stored: usize) -> CacheMetrics {
        let exact_hits = self.exact_hits.load(Ordering::Relaxed);
        let semantic_hits = self.semantic_hits.load(Ordering::Relaxed);

        let mut metrics = CacheMetrics {
            exact_hits,
            semantic_hits,
            cache_hits: exact_hits + semantic_hits,
            cache_misses: self.misses.load(Ordering::Relaxed),
            cache_writes: self.writes.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            entries,
            bytes_stored,
            cost_saved: f64::from_bits(self.cost_saved_bits.load(Ordering::Relaxed)),
            hit_rate: 0.0,
        };
        metrics.update_hit_rate();
        metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_hit_rate() {
        let counters = CacheCounters::default();

        counters.record_hit(false, 0.02);
        counters.record_hit(true, 0.01);
        counters.record_miss();

        let metrics = counters.snapshot(2, 128);
        assert_eq!(metrics.cache_hits, 2);
        assert!((metrics.hit_rate - 0.666).abs() < 0.01);
        assert!((metrics.cost_saved - 0.03).abs() < 1e-9);
    }

    #[test]
    fn test_tiny_savings_accumulate() {
        let counters = CacheCounters::default();
        for _ in 0..1000 {
            counters.record_hit(false, 2e-7);
        }
        counters.record_hit(false, -1.0);

        let metrics = counters.snapshot(1, 0);
        assert!((metrics.cost_saved - 2e-4).abs() < 1e-12);
    }

    #[test]
    fn test_empty_hit_rate() {
        let metrics = CacheCounters::default().snapshot(0, 0);
        assert_eq!(metrics.hit_rate, 0.0);
    }
}
