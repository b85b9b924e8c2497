//! Sharded result store with exact and semantic lookup

use super::tracker::{CacheCounters, CacheMetrics};
use super::{
    cosine_similarity, CacheEntry, CacheError, CacheHit, CacheInsert, CachePolicy,
    EvictionStrategy, MatchKind,
};
use arc_swap::ArcSwap;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

const DEFAULT_SHARDS: usize = 16;

type Shard = HashMap<String, StoredEntry>;

struct StoredEntry {
    service: String,
    embedding: Option<Vec<f32>>,
    value: String,
    created_at: Instant,
    ttl: Duration,
    cost_saved: f64,
    /// Nanoseconds since the cache epoch
    last_accessed: AtomicU64,
    /// Logical clock at last access; gives LRU a strict order
    last_tick: AtomicU64,
    hit_count: AtomicU64,
}

impl StoredEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now > self.created_at + self.ttl
    }

    fn size(&self, key: &str) -> usize {
        key.len()
            + self.service.len()
            + self.value.len()
            + self.embedding.as_ref().map_or(0, |e| e.len() * 4)
    }

    fn snapshot(&self, key: &str, epoch: Instant) -> CacheEntry {
        CacheEntry {
            key: key.to_string(),
            service: self.service.clone(),
            embedding: self.embedding.clone(),
            value: self.value.clone(),
            created_at: self.created_at,
            last_accessed_at: epoch + Duration::from_nanos(self.last_accessed.load(Ordering::Relaxed)),
            hit_count: self.hit_count.load(Ordering::Relaxed),
            ttl_seconds: self.ttl.as_secs(),
            cost_saved: self.cost_saved,
        }
    }
}

/// Result cache shared by every in-flight request.
///
/// Entries live in lock-striped shards. A hit only takes its shard's read
/// lock; hit count and access time are atomics on the entry. Inserts are
/// serialised so the entry count never exceeds `max_size`.
pub struct SemanticCache {
    shards: Vec<RwLock<Shard>>,
    policy: ArcSwap<CachePolicy>,
    write_lock: Mutex<()>,
    len: AtomicUsize,
    bytes: AtomicUsize,
    clock: AtomicU64,
    epoch: Instant,
    counters: CacheCounters,
}

impl SemanticCache {
    pub fn new(policy: CachePolicy) -> Self {
        Self::with_shards(policy, DEFAULT_SHARDS)
    }

    pub fn with_shards(policy: CachePolicy, shards: usize) -> Self {
        Self {
            shards: (0..shards.max(1)).map(|_| RwLock::new(HashMap::new())).collect(),
            policy: ArcSwap::from_pointee(policy),
            write_lock: Mutex::new(()),
            len: AtomicUsize::new(0),
            bytes: AtomicUsize::new(0),
            clock: AtomicU64::new(0),
            epoch: Instant::now(),
            counters: CacheCounters::default(),
        }
    }

    pub fn policy(&self) -> CachePolicy {
        self.policy.load().as_ref().clone()
    }

    /// Swap in a new policy; a smaller `max_size` takes effect on the next insert
    pub fn update_policy(&self, policy: CachePolicy) {
        self.policy.store(policy.into());
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn metrics(&self) -> CacheMetrics {
        self.counters
            .snapshot(self.len(), self.bytes.load(Ordering::Relaxed))
    }

    /// Look up by exact key, then by similarity among entries of `service`
    pub fn get(
        &self,
        service: &str,
        key: &str,
        embedding: Option<&[f32]>,
    ) -> Result<Option<CacheHit>, CacheError> {
        let now = Instant::now();
        let policy = self.policy.load();
        let index = self.shard_index(key);

        let expired = {
            let shard = self.read_shard(index)?;
            match shard.get(key) {
                Some(entry) if !entry.is_expired(now) => {
                    self.touch(entry, now);
                    self.counters.record_hit(false, entry.cost_saved);
                    debug!(service, "exact cache hit");
                    return Ok(Some(CacheHit {
                        entry: entry.snapshot(key, self.epoch),
                        kind: MatchKind::Exact,
                        similarity: 1.0,
                    }));
                }
                Some(_) => true,
                None => false,
            }
        };

        if expired {
            self.remove_if_expired(index, key, now)?;
        }

        if policy.semantic_matching {
            if let Some(embedding) = embedding {
                if let Some(hit) =
                    self.find_similar(service, embedding, policy.similarity_threshold, now)?
                {
                    return Ok(Some(hit));
                }
            }
        }

        self.counters.record_miss();
        Ok(None)
    }

    /// Insert or overwrite; evicts by the configured strategy when full
    pub fn set(&self, insert: CacheInsert) -> Result<(), CacheError> {
        let policy = self.policy.load();
        let ttl = insert.ttl.unwrap_or(policy.default_ttl);

        if ttl.is_zero() {
            return Err(CacheError::InvalidEntry("ttl must be positive".to_string()));
        }
        if insert.embedding.as_ref().is_some_and(|e| e.is_empty()) {
            return Err(CacheError::InvalidEntry("embedding is empty".to_string()));
        }

        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| CacheError::Unavailable("cache write lock poisoned".to_string()))?;

        let index = self.shard_index(&insert.key);
        let exists = self.read_shard(index)?.contains_key(&insert.key);

        if !exists {
            while self.len() >= policy.max_size {
                if !self.evict_one(policy.eviction)? {
                    break;
                }
            }
        }

        let now = Instant::now();
        let entry = StoredEntry {
            service: insert.service,
            embedding: insert.embedding,
            value: insert.value,
            created_at: now,
            ttl,
            cost_saved: insert.cost_saved,
            last_accessed: AtomicU64::new(self.nanos_since_epoch(now)),
            last_tick: AtomicU64::new(self.next_tick()),
            hit_count: AtomicU64::new(0),
        };
        let size = entry.size(&insert.key);

        let mut shard = self.write_shard(index)?;
        match shard.insert(insert.key.clone(), entry) {
            Some(old) => {
                self.bytes.fetch_sub(old.size(&insert.key), Ordering::Relaxed);
            }
            None => {
                self.len.fetch_add(1, Ordering::AcqRel);
            }
        }
        self.bytes.fetch_add(size, Ordering::Relaxed);
        self.counters.record_write();

        Ok(())
    }

    pub fn remove(&self, key: &str) -> Result<bool, CacheError> {
        let mut shard = self.write_shard(self.shard_index(key))?;
        match shard.remove(key) {
            Some(entry) => {
                self.forget(key, &entry);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn clear(&self) -> Result<(), CacheError> {
        for index in 0..self.shards.len() {
            let mut shard = self.write_shard(index)?;
            for (key, entry) in shard.drain() {
                self.forget(&key, &entry);
            }
        }
        Ok(())
    }

    /// Drop every expired entry, one shard at a time. Returns the count removed.
    pub fn sweep(&self) -> Result<usize, CacheError> {
        let now = Instant::now();
        let mut removed = 0;

        for index in 0..self.shards.len() {
            let mut shard = self.write_shard(index)?;
            let expired: Vec<String> = shard
                .iter()
                .filter(|(_, entry)| entry.is_expired(now))
                .map(|(key, _)| key.clone())
                .collect();

            for key in expired {
                if let Some(entry) = shard.remove(&key) {
                    self.forget(&key, &entry);
                    removed += 1;
                }
            }
        }

        if removed > 0 {
            self.counters.record_expirations(removed as u64);
            debug!(removed, "cache sweep removed expired entries");
        }

        Ok(removed)
    }

    fn find_similar(
        &self,
        service: &str,
        embedding: &[f32],
        threshold: f32,
        now: Instant,
    ) -> Result<Option<CacheHit>, CacheError> {
        // (shard, key, similarity, tick)
        let mut best: Option<(usize, String, f32, u64)> = None;

        for index in 0..self.shards.len() {
            let shard = self.read_shard(index)?;
            for (key, entry) in shard.iter() {
                if entry.service != service || entry.is_expired(now) {
                    continue;
                }
                let Some(candidate) = entry.embedding.as_deref() else {
                    continue;
                };

                let similarity = cosine_similarity(embedding, candidate);
                if similarity < threshold {
                    continue;
                }

                let tick = entry.last_tick.load(Ordering::Relaxed);
                let better = match &best {
                    None => true,
                    Some((_, _, best_sim, best_tick)) => {
                        similarity > *best_sim || (similarity == *best_sim && tick > *best_tick)
                    }
                };
                if better {
                    best = Some((index, key.clone(), similarity, tick));
                }
            }
        }

        let Some((index, key, similarity, _)) = best else {
            return Ok(None);
        };

        let shard = self.read_shard(index)?;
        let Some(entry) = shard.get(&key) else {
            return Ok(None);
        };

        self.touch(entry, now);
        self.counters.record_hit(true, entry.cost_saved);
        debug!(service, similarity, "semantic cache hit");

        Ok(Some(CacheHit {
            entry: entry.snapshot(&key, self.epoch),
            kind: MatchKind::Semantic,
            similarity,
        }))
    }

    /// Remove one entry chosen by `strategy`. Caller holds the write lock.
    fn evict_one(&self, strategy: EvictionStrategy) -> Result<bool, CacheError> {
        // (shard, key, hit_count, tick)
        let mut victim: Option<(usize, String, u64, u64)> = None;

        for index in 0..self.shards.len() {
            let shard = self.read_shard(index)?;
            for (key, entry) in shard.iter() {
                let hits = entry.hit_count.load(Ordering::Relaxed);
                let tick = entry.last_tick.load(Ordering::Relaxed);

                let worse = match &victim {
                    None => true,
                    Some((_, _, v_hits, v_tick)) => match strategy {
                        EvictionStrategy::Lru => tick < *v_tick,
                        EvictionStrategy::Lfu => (hits, tick) < (*v_hits, *v_tick),
                    },
                };
                if worse {
                    victim = Some((index, key.clone(), hits, tick));
                }
            }
        }

        let Some((index, key, hits, _)) = victim else {
            return Ok(false);
        };

        let mut shard = self.write_shard(index)?;
        if let Some(entry) = shard.remove(&key) {
            self.forget(&key, &entry);
            self.counters.record_eviction();
            debug!(?strategy, hits, "evicted cache entry");
        }

        Ok(true)
    }

    fn remove_if_expired(&self, index: usize, key: &str, now: Instant) -> Result<(), CacheError> {
        let mut shard = self.write_shard(index)?;
        if shard.get(key).is_some_and(|e| e.is_expired(now)) {
            if let Some(entry) = shard.remove(key) {
                self.forget(key, &entry);
                self.counters.record_expirations(1);
            }
        }
        Ok(())
    }

    fn forget(&self, key: &str, entry: &StoredEntry) {
        self.len.fetch_sub(1, Ordering::AcqRel);
        self.bytes.fetch_sub(entry.size(key), Ordering::Relaxed);
    }

    fn touch(&self, entry: &StoredEntry, now: Instant) {
        entry.last_tick.store(self.next_tick(), Ordering::Relaxed);
        entry
            .last_accessed
            .store(self.nanos_since_epoch(now), Ordering::Relaxed);
        entry.hit_count.fetch_add(1, Ordering::Relaxed);
    }

    fn next_tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn nanos_since_epoch(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.epoch).as_nanos() as u64
    }

    fn shard_index(&self, key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.shards.len() as u64) as usize
    }

    fn read_shard(&self, index: usize) -> Result<RwLockReadGuard<'_, Shard>, CacheError> {
        self.shards[index]
            .read()
            .map_err(|_| CacheError::Unavailable(format!("cache shard {} poisoned", index)))
    }

    fn write_shard(&self, index: usize) -> Result<RwLockWriteGuard<'_, Shard>, CacheError> {
        self.shards[index]
            .write()
            .map_err(|_| CacheError::Unavailable(format!("cache shard {} poisoned", index)))
    }
}

impl Default for SemanticCache {
    fn default() -> Self {
        Self::new(CachePolicy::default())
    }
}
