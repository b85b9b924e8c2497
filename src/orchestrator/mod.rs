//! Request façade of the cost layer
//!
//! For every request:
//! 1. Optimize the prompt
//! 2. Look it up in the cache (exact key, then similarity)
//! 3. Ask the budget for admission, reserving the estimated cost
//! 4. Queue it for batching or send it as a batch of one
//! 5. Settle the actual cost and cache the answer
//!
//! A failed provider call releases the reservation and writes nothing.

mod deferred;
mod guard;

pub use deferred::DeferredRequest;

use crate::api::{ApiError, ProcessRequest, ProcessResult, UpstreamProvider};
use crate::batch::{BatchError, BatchQueueItem, BatchScheduler, BatchTicket};
use crate::budget::{Admission, AdmissionDecision, BudgetController, DenyReason, ForecastPeriod};
use crate::cache::{request_key, CacheError, CacheInsert, Embedder, HashingEmbedder, SemanticCache};
use crate::config::{Config, ConfigError, ServiceSettings};
use crate::metrics::{CostReport, UsageTracker};
use crate::optimization::{count_tokens, PromptOptimizer};
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use deferred::DeferredQueue;
use guard::{HeldReservation, QueuedGuard};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

#[derive(Error, Debug, Clone)]
pub enum CostError {
    #[error("Budget exceeded for '{service}' ({scope}): {reason}")]
    BudgetExceeded {
        service: String,
        scope: String,
        reason: DenyReason,
    },

    #[error("Request {request_id} deferred: {reason}")]
    Deferred {
        request_id: String,
        reason: DenyReason,
    },

    #[error("Batch dispatch failed: {0}")]
    BatchDispatchFailed(BatchError),

    #[error("Cache unavailable: {0}")]
    CacheUnavailable(#[from] CacheError),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Upstream error: {0}")]
    Upstream(Arc<ApiError>),

    #[error("Request {0} timed out while queued")]
    Timeout(String),
}

impl CostError {
    /// Errors the caller may retry later without changing the request
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CostError::BudgetExceeded { .. } | CostError::Deferred { .. } | CostError::Timeout(_)
        )
    }
}

/// The cost layer: owns the cache, budget, scheduler and optimizer.
///
/// Lifecycle is `init` → `start` → `shutdown`. Without `start` the layer
/// still serves requests; only the background sweep and reset loops are
/// missing.
pub struct CostOptimizationOrchestrator {
    config: ArcSwap<Config>,
    optimizer: ArcSwap<PromptOptimizer>,
    embedder: Arc<dyn Embedder>,
    cache: Arc<SemanticCache>,
    budget: Arc<BudgetController>,
    scheduler: BatchScheduler,
    usage: UsageTracker,
    deferred: DeferredQueue,
    next_request: AtomicU64,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl CostOptimizationOrchestrator {
    pub fn init(config: Config, upstream: Arc<dyn UpstreamProvider>) -> Result<Self, ConfigError> {
        config.validate()?;

        let cache = SemanticCache::with_shards(config.cache_policy(), config.cache.shards);
        let budget = BudgetController::new(
            config.budget.limits(),
            config.service_limits(),
            config.budget.options(),
        );
        let scheduler = BatchScheduler::new(upstream, config.batch_policies());
        let (shutdown_tx, _) = watch::channel(false);

        info!(
            services = config.services.len(),
            eviction = ?config.cache.eviction,
            "Cost layer initialised"
        );

        Ok(Self {
            optimizer: ArcSwap::from_pointee(PromptOptimizer::new(config.optimization.clone())),
            embedder: Arc::new(HashingEmbedder::new(config.cache.embedding_dimensions)),
            cache: Arc::new(cache),
            budget: Arc::new(budget),
            scheduler,
            usage: UsageTracker::new(),
            deferred: DeferredQueue::default(),
            next_request: AtomicU64::new(1),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
            config: ArcSwap::from_pointee(config),
        })
    }

    /// Replace the built-in hashing embedder
    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = embedder;
        self
    }

    /// Spawn the cache sweep and budget reset loops
    pub async fn start(&self) {
        let mut tasks = self.tasks.lock().await;
        if !tasks.is_empty() {
            return;
        }

        let config = self.config.load();
        tasks.push(spawn_sweep_loop(
            Arc::clone(&self.cache),
            Duration::from_secs(config.cache.sweep_interval_secs),
            self.shutdown_tx.subscribe(),
        ));
        tasks.push(spawn_reset_loop(
            Arc::clone(&self.budget),
            Duration::from_secs(config.budget.reset_check_interval_secs),
            Utc::now,
            self.shutdown_tx.subscribe(),
        ));

        info!("Background loops started");
    }

    /// Stop background loops and flush queued batches
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Background loop ended abnormally: {}", e);
            }
        }

        self.scheduler.shutdown().await;
        info!("Cost layer shut down");
    }

    pub async fn process_request(&self, request: ProcessRequest) -> Result<ProcessResult, CostError> {
        let request_id = format!("req-{}", self.next_request.fetch_add(1, Ordering::Relaxed));
        self.run(request_id, request).await
    }

    /// Re-submit every parked request; each keeps its request id
    pub async fn resume_deferred(&self) -> Vec<(String, Result<ProcessResult, CostError>)> {
        let parked = self.deferred.drain();
        if parked.is_empty() {
            return Vec::new();
        }
        info!(count = parked.len(), "Resuming deferred requests");

        let runs = parked.into_iter().map(|d| async move {
            let id = d.request_id.clone();
            (id, self.run(d.request_id, d.request).await)
        });
        futures_util::future::join_all(runs).await
    }

    pub fn deferred_count(&self) -> usize {
        self.deferred.len()
    }

    pub fn deferred_ids(&self) -> Vec<String> {
        self.deferred.ids()
    }

    /// Validate and apply a new configuration. Spend, cache contents and
    /// queued work survive; loop intervals apply on the next `start`.
    pub fn reload_config(&self, config: Config) -> Result<(), ConfigError> {
        config.validate()?;

        self.budget
            .update_limits(config.budget.limits(), config.service_limits());
        self.budget.update_options(config.budget.options());
        self.cache.update_policy(config.cache_policy());
        self.scheduler.update_policies(config.batch_policies());
        self.optimizer
            .store(Arc::new(PromptOptimizer::new(config.optimization.clone())));
        self.config.store(Arc::new(config));

        info!("Configuration reloaded");
        Ok(())
    }

    pub fn config(&self) -> Arc<Config> {
        self.config.load_full()
    }

    pub fn cache(&self) -> &SemanticCache {
        &self.cache
    }

    pub fn budget(&self) -> &BudgetController {
        &self.budget
    }

    pub fn scheduler(&self) -> &BatchScheduler {
        &self.scheduler
    }

    pub fn usage(&self) -> &UsageTracker {
        &self.usage
    }

    pub fn report(&self) -> CostReport {
        CostReport {
            generated_at: Utc::now(),
            budgets: self.budget.snapshot(),
            spend_breakdown: self.budget.spend_breakdown(),
            cache: self.cache.metrics(),
            batching: self.scheduler.stats(),
            usage: self.usage.get_metrics(),
            daily_forecast: self.budget.get_forecast(ForecastPeriod::Day),
            monthly_forecast: self.budget.get_forecast(ForecastPeriod::Month),
            deferred_requests: self.deferred.len(),
        }
    }

    async fn run(&self, request_id: String, request: ProcessRequest) -> Result<ProcessResult, CostError> {
        self.usage.record_request();
        let config = self.config.load_full();
        let service_type = request.service_type.as_str();

        let service = config
            .service(service_type)
            .ok_or_else(|| CostError::Configuration(format!("unknown service type '{}'", service_type)))?;

        let optimized = self
            .optimizer
            .load()
            .optimize(&request.payload)
            .map_err(|e| CostError::Configuration(e.to_string()))?;
        let tokens_saved = optimized.tokens_saved();
        let payload = optimized.payload;

        let use_cache = request.enable_cache && config.cache.enabled;
        let key = request_key(service_type, &payload);
        let embedding = (use_cache && config.cache.semantic_matching)
            .then(|| self.embedder.embed(&payload.semantic_text()));

        if use_cache {
            match self.cache.get(service_type, &key, embedding.as_deref()) {
                Ok(Some(hit)) => {
                    self.usage.record_cache_hit(tokens_saved, hit.entry.cost_saved);
                    return Ok(ProcessResult {
                        request_id,
                        output: hit.entry.value,
                        from_cache: true,
                        was_batched: false,
                        batch_size: 0,
                        actual_cost: 0.0,
                        cache_similarity: Some(hit.similarity),
                        tokens_saved,
                    });
                }
                Ok(None) => {}
                Err(e) => warn!(request_id = %request_id, "Skipping cache: {}", e),
            }
        }

        let estimate = service.estimate_cost(count_tokens(&payload.semantic_text()));
        let Admission {
            decision,
            reservation,
        } = self
            .budget
            .admit(service_type, estimate, request.priority.is_essential(), &request_id)
            .map_err(|e| CostError::Configuration(e.to_string()))?;

        let held = reservation.map(|r| HeldReservation::new(Arc::clone(&self.budget), r));

        let mut force_batch = false;
        match decision {
            AdmissionDecision::Deny { scope, reason } => {
                return Err(self.on_denied(request_id, request, scope, reason));
            }
            AdmissionDecision::Throttle(delay) => {
                self.usage.record_throttled();
                debug!(request_id = %request_id, ?delay, "Throttling request");
                tokio::time::sleep(delay).await;
                force_batch = true;
            }
            AdmissionDecision::Allow => {}
        }

        let held = held
            .ok_or_else(|| CostError::Configuration("admission held no reservation".to_string()))?;

        let policy = service.batch_policy();
        let via_queue = policy.batchable && (request.enable_batch || force_batch);
        let item = BatchQueueItem::new(
            request_id.clone(),
            service_type,
            payload,
            request.priority,
        );

        let ticket = if via_queue {
            self.scheduler.enqueue(item)
        } else {
            self.scheduler.dispatch_now(item)
        };
        let ticket = match ticket {
            Ok(ticket) => ticket,
            Err(e) => {
                held.release();
                self.usage.record_failure();
                return Err(dispatch_error(e, via_queue));
            }
        };

        // Settlement runs in its own task so a dispatched call is billed even
        // if this future is dropped; a still-queued item is withdrawn instead.
        let queued = via_queue
            .then(|| QueuedGuard::new(self.scheduler.clone(), service_type, &request_id));
        let completion = Completion {
            request_id: request_id.clone(),
            service_type: service_type.to_string(),
            service: service.clone(),
            usage: self.usage.clone(),
            cache: use_cache.then(|| (Arc::clone(&self.cache), key, embedding)),
            tokens_saved,
            via_queue,
        };
        let outcome = tokio::spawn(completion.finish(ticket, request.timeout, held)).await;
        if let Some(queued) = queued {
            queued.disarm();
        }

        outcome.unwrap_or_else(|e| {
            warn!(request_id = %request_id, "Request task failed: {}", e);
            Err(CostError::BatchDispatchFailed(BatchError::Cancelled(request_id)))
        })
    }

    /// Essential requests fail fast; best-effort ones are parked while the
    /// deferred queue has room
    fn on_denied(
        &self,
        request_id: String,
        request: ProcessRequest,
        scope: String,
        reason: DenyReason,
    ) -> CostError {
        if request.priority.is_essential() {
            self.usage.record_denied();
            return CostError::BudgetExceeded {
                service: request.service_type,
                scope,
                reason,
            };
        }

        let capacity = self.config.load().budget.max_deferred;
        let parked = DeferredRequest {
            request_id: request_id.clone(),
            request,
            reason: reason.clone(),
            deferred_at: Utc::now(),
        };
        if let Err(refused) = self.deferred.push(parked, capacity) {
            warn!(
                request_id = %request_id,
                service = %refused.request.service_type,
                capacity,
                "Deferred queue full, refusing request"
            );
            self.usage.record_denied();
            return CostError::BudgetExceeded {
                service: refused.request.service_type,
                scope,
                reason,
            };
        }

        info!(request_id = %request_id, "Deferring request: {}", reason);
        self.usage.record_deferred();
        CostError::Deferred { request_id, reason }
    }
}

/// Everything needed to finish an admitted request once its ticket resolves
struct Completion {
    request_id: String,
    service_type: String,
    service: ServiceSettings,
    usage: UsageTracker,
    cache: Option<(Arc<SemanticCache>, String, Option<Vec<f32>>)>,
    tokens_saved: usize,
    via_queue: bool,
}

impl Completion {
    async fn finish(
        self,
        ticket: BatchTicket,
        timeout: Option<Duration>,
        held: HeldReservation,
    ) -> Result<ProcessResult, CostError> {
        let outcome = match timeout {
            Some(timeout) => ticket.wait_timeout(timeout).await,
            None => ticket.wait().await,
        };

        let delivery = match outcome {
            Ok(delivery) => delivery,
            Err(e) => {
                held.release();
                self.usage.record_failure();
                return Err(dispatch_error(e, self.via_queue));
            }
        };

        let usage = &delivery.response.usage;
        let actual_cost = self.service.cost_for(usage);
        held.settle(actual_cost);
        self.usage.record_completion(
            usage.prompt_tokens,
            usage.completion_tokens,
            self.tokens_saved,
            actual_cost,
            self.via_queue,
        );

        if let Some((cache, key, embedding)) = self.cache {
            let insert = CacheInsert {
                service: self.service_type,
                key,
                embedding,
                value: delivery.response.content.clone(),
                ttl: self.service.cache_ttl(),
                cost_saved: actual_cost,
            };
            if let Err(e) = cache.set(insert) {
                warn!(request_id = %self.request_id, "Failed to cache result: {}", e);
            }
        }

        Ok(ProcessResult {
            request_id: self.request_id,
            output: delivery.response.content,
            from_cache: false,
            was_batched: self.via_queue,
            batch_size: delivery.batch_size,
            actual_cost,
            cache_similarity: None,
            tokens_saved: self.tokens_saved,
        })
    }
}

fn dispatch_error(error: BatchError, via_queue: bool) -> CostError {
    match error {
        BatchError::TimedOut(id) => CostError::Timeout(id),
        BatchError::UnknownService(service) => {
            CostError::Configuration(format!("no batch policy for '{}'", service))
        }
        BatchError::DispatchFailed { source, .. } if !via_queue => CostError::Upstream(source),
        other => CostError::BatchDispatchFailed(other),
    }
}

fn spawn_sweep_loop(
    cache: Arc<SemanticCache>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => match cache.sweep() {
                    Ok(removed) if removed > 0 => debug!(removed, "Swept expired cache entries"),
                    Ok(_) => {}
                    Err(e) => warn!("Cache sweep failed: {}", e),
                },
                _ = shutdown.changed() => break,
            }
        }
    })
}

/// Roll budget periods over on every tick, reading the date from `clock`
fn spawn_reset_loop(
    budget: Arc<BudgetController>,
    period: Duration,
    clock: impl Fn() -> DateTime<Utc> + Send + 'static,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let reset = budget.reset_if_due_at(clock());
                    if reset > 0 {
                        debug!(reset, "Budget periods rolled over");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    })
}
