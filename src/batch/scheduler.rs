//! Queue management and dispatch

use super::{BatchDelivery, BatchError, BatchPolicy, BatchQueueItem, BatchStats, FlushReason};
use crate::api::{Payload, UpstreamProvider};
use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

type Reply = oneshot::Sender<Result<BatchDelivery, BatchError>>;

struct Pending {
    item: BatchQueueItem,
    seq: u64,
    reply: Reply,
}

#[derive(Default)]
struct QueueState {
    pending: Vec<Pending>,
    timer: Option<JoinHandle<()>>,
    /// Bumped whenever the timer is re-armed or cancelled; a timer that
    /// wakes with an older generation does nothing
    generation: u64,
    next_seq: u64,
}

#[derive(Default)]
struct ServiceQueue {
    state: Mutex<QueueState>,
}

impl ServiceQueue {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

struct SchedulerInner {
    upstream: Arc<dyn UpstreamProvider>,
    policies: ArcSwap<HashMap<String, BatchPolicy>>,
    queues: RwLock<HashMap<String, Arc<ServiceQueue>>>,
    accepting: AtomicBool,
    in_flight: Mutex<Vec<JoinHandle<()>>>,
    stats: Mutex<BatchStats>,
}

/// Groups requests per service type and sends them upstream together.
///
/// Each service has its own queue lock, so unrelated services never
/// contend. Must be used from within a tokio runtime: flush timers and
/// dispatches are spawned tasks.
#[derive(Clone)]
pub struct BatchScheduler {
    inner: Arc<SchedulerInner>,
}

impl BatchScheduler {
    pub fn new(
        upstream: Arc<dyn UpstreamProvider>,
        policies: HashMap<String, BatchPolicy>,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                upstream,
                policies: ArcSwap::from_pointee(policies),
                queues: RwLock::new(HashMap::new()),
                accepting: AtomicBool::new(true),
                in_flight: Mutex::new(Vec::new()),
                stats: Mutex::new(BatchStats::default()),
            }),
        }
    }

    /// Replace batch policies. Queued items keep their deadline.
    pub fn update_policies(&self, policies: HashMap<String, BatchPolicy>) {
        self.inner.policies.store(Arc::new(policies));
    }

    pub fn policy(&self, service: &str) -> Option<BatchPolicy> {
        self.inner.policies.load().get(service).cloned()
    }

    pub fn stats(&self) -> BatchStats {
        self.inner
            .stats
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    /// Items still waiting in `service`'s queue
    pub fn pending(&self, service: &str) -> usize {
        self.inner
            .existing_queue(service)
            .map_or(0, |queue| queue.lock().pending.len())
    }

    /// Queue an item; non-batchable services are dispatched at once
    pub fn enqueue(&self, item: BatchQueueItem) -> Result<BatchTicket, BatchError> {
        let policy = self.inner.admit(&item.service_type)?;

        if !policy.batchable {
            return self.dispatch_now(item);
        }

        let (reply, ticket) = self.ticket(&item);
        let service = item.service_type.clone();
        let queue = self.inner.queue(&service);

        let ready = {
            let mut state = queue.lock();
            let seq = state.next_seq;
            state.next_seq += 1;

            let deadline = item.enqueued_at + policy.max_wait;
            let was_empty = state.pending.is_empty();
            state.pending.push(Pending { item, seq, reply });

            if state.pending.len() >= policy.max_batch_size {
                let batch = take_batch(&mut state.pending, policy.max_batch_size);
                match oldest_enqueue(&state.pending) {
                    Some(oldest) => self.arm_timer(&mut state, &queue, &service, oldest + policy.max_wait),
                    None => cancel_timer(&mut state),
                }
                Some(batch)
            } else {
                if was_empty {
                    self.arm_timer(&mut state, &queue, &service, deadline);
                }
                None
            }
        };

        if let Some(batch) = ready {
            self.inner.spawn_dispatch(service, batch, FlushReason::Size);
        }

        Ok(ticket)
    }

    /// Send one item upstream as a batch of one, bypassing the queue
    pub fn dispatch_now(&self, item: BatchQueueItem) -> Result<BatchTicket, BatchError> {
        self.inner.admit(&item.service_type)?;

        let (reply, ticket) = self.ticket(&item);
        let service = item.service_type.clone();
        let pending = Pending {
            item,
            seq: 0,
            reply,
        };
        self.inner
            .spawn_dispatch(service, vec![pending], FlushReason::Immediate);

        Ok(ticket)
    }

    /// Remove a still-queued item. Returns false once it has been dispatched.
    pub fn cancel(&self, service: &str, request_id: &str) -> bool {
        let Some(queue) = self.inner.existing_queue(service) else {
            return false;
        };

        let mut state = queue.lock();
        let Some(position) = state
            .pending
            .iter()
            .position(|p| p.item.request_id == request_id)
        else {
            return false;
        };

        let cancelled = state.pending.remove(position);
        let _ = cancelled
            .reply
            .send(Err(BatchError::Cancelled(request_id.to_string())));

        if state.pending.is_empty() {
            cancel_timer(&mut state);
        }
        drop(state);

        if let Ok(mut stats) = self.inner.stats.lock() {
            stats.cancelled += 1;
        }
        debug!(service, request_id, "cancelled queued request");
        true
    }

    /// Stop accepting work, flush every queue and wait for all dispatches
    pub async fn shutdown(&self) {
        self.inner.accepting.store(false, Ordering::SeqCst);

        let queues: Vec<(String, Arc<ServiceQueue>)> = self
            .inner
            .queues
            .read()
            .map(|q| q.iter().map(|(k, v)| (k.clone(), Arc::clone(v))).collect())
            .unwrap_or_default();

        for (service, queue) in queues {
            let max = self
                .policy(&service)
                .map_or(usize::MAX, |p| p.max_batch_size.max(1));
            let batches = {
                let mut state = queue.lock();
                cancel_timer(&mut state);
                drain_batches(&mut state.pending, max)
            };
            for batch in batches {
                self.inner
                    .spawn_dispatch(service.clone(), batch, FlushReason::Shutdown);
            }
        }

        let handles: Vec<JoinHandle<()>> = self
            .inner
            .in_flight
            .lock()
            .map(|mut h| h.drain(..).collect())
            .unwrap_or_default();

        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Batch dispatch task failed: {}", e);
            }
        }
        info!("Batch scheduler drained");
    }

    fn ticket(&self, item: &BatchQueueItem) -> (Reply, BatchTicket) {
        let (reply, receiver) = oneshot::channel();
        let ticket = BatchTicket {
            request_id: item.request_id.clone(),
            service: item.service_type.clone(),
            receiver,
            scheduler: self.clone(),
        };
        (reply, ticket)
    }

    fn arm_timer(
        &self,
        state: &mut QueueState,
        queue: &Arc<ServiceQueue>,
        service: &str,
        deadline: Instant,
    ) {
        cancel_timer(state);
        let generation = state.generation;
        let inner = Arc::clone(&self.inner);
        let queue = Arc::clone(queue);
        let service = service.to_string();

        state.timer = Some(tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            inner.flush_on_timer(service, &queue, generation);
        }));
    }
}

impl SchedulerInner {
    fn admit(&self, service: &str) -> Result<BatchPolicy, BatchError> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(BatchError::ShuttingDown);
        }
        self.policies
            .load()
            .get(service)
            .cloned()
            .ok_or_else(|| BatchError::UnknownService(service.to_string()))
    }

    fn existing_queue(&self, service: &str) -> Option<Arc<ServiceQueue>> {
        self.queues.read().ok()?.get(service).cloned()
    }

    fn queue(&self, service: &str) -> Arc<ServiceQueue> {
        if let Some(queue) = self.existing_queue(service) {
            return queue;
        }
        let mut queues = self.queues.write().unwrap_or_else(|e| e.into_inner());
        Arc::clone(queues.entry(service.to_string()).or_default())
    }

    fn flush_on_timer(self: &Arc<Self>, service: String, queue: &ServiceQueue, generation: u64) {
        let max = self
            .policies
            .load()
            .get(&service)
            .map_or(usize::MAX, |p| p.max_batch_size.max(1));

        let batches = {
            let mut state = queue.lock();
            if state.generation != generation {
                return;
            }
            state.timer = None;
            state.generation += 1;
            drain_batches(&mut state.pending, max)
        };

        for batch in batches {
            self.spawn_dispatch(service.clone(), batch, FlushReason::Timer);
        }
    }

    fn spawn_dispatch(self: &Arc<Self>, service: String, batch: Vec<Pending>, reason: FlushReason) {
        if batch.is_empty() {
            return;
        }
        let inner = Arc::clone(self);
        let handle = tokio::spawn(async move { inner.dispatch(service, batch, reason).await });

        if let Ok(mut in_flight) = self.in_flight.lock() {
            in_flight.retain(|h| !h.is_finished());
            in_flight.push(handle);
        }
    }

    async fn dispatch(&self, service: String, batch: Vec<Pending>, reason: FlushReason) {
        let size = batch.len();
        let (payloads, replies): (Vec<Payload>, Vec<Reply>) = batch
            .into_iter()
            .map(|p| (p.item.payload, p.reply))
            .unzip();

        info!(
            service = %service,
            size,
            reason = ?reason,
            provider = self.upstream.name(),
            "Dispatching batch"
        );

        let result = self.upstream.send_batch(&service, payloads).await;

        if let Ok(mut stats) = self.stats.lock() {
            let failed = !matches!(&result, Ok(r) if r.len() == size);
            stats.record(size, reason, failed);
        }

        match result {
            Ok(responses) if responses.len() == size => {
                for (reply, response) in replies.into_iter().zip(responses) {
                    let _ = reply.send(Ok(BatchDelivery {
                        response,
                        batch_size: size,
                    }));
                }
            }
            Ok(responses) => {
                let error = BatchError::InvalidBatchResponse {
                    expected: size,
                    got: responses.len(),
                };
                warn!(service = %service, "{}", error);
                fail_all(replies, error);
            }
            Err(e) => {
                warn!(service = %service, size, "Batch dispatch failed: {}", e);
                fail_all(
                    replies,
                    BatchError::DispatchFailed {
                        service,
                        size,
                        source: Arc::new(e),
                    },
                );
            }
        }
    }
}

fn fail_all(replies: Vec<Reply>, error: BatchError) {
    for reply in replies {
        let _ = reply.send(Err(error.clone()));
    }
}

fn cancel_timer(state: &mut QueueState) {
    state.generation += 1;
    if let Some(timer) = state.timer.take() {
        timer.abort();
    }
}

/// Higher priority first, then enqueue order
fn sort_for_dispatch(pending: &mut [Pending]) {
    pending.sort_by(|a, b| {
        b.item
            .priority
            .cmp(&a.item.priority)
            .then(a.seq.cmp(&b.seq))
    });
}

/// Take up to `max` items in dispatch order, leaving the rest queued
fn take_batch(pending: &mut Vec<Pending>, max: usize) -> Vec<Pending> {
    sort_for_dispatch(pending);
    let rest = pending.split_off(max.min(pending.len()));
    std::mem::replace(pending, rest)
}

fn drain_batches(pending: &mut Vec<Pending>, max: usize) -> Vec<Vec<Pending>> {
    let mut batches = Vec::new();
    while !pending.is_empty() {
        batches.push(take_batch(pending, max));
    }
    batches
}

fn oldest_enqueue(pending: &[Pending]) -> Option<Instant> {
    pending.iter().map(|p| p.item.enqueued_at).min()
}

/// Handle to the eventual result of a queued request
pub struct BatchTicket {
    request_id: String,
    service: String,
    receiver: oneshot::Receiver<Result<BatchDelivery, BatchError>>,
    scheduler: BatchScheduler,
}

impl BatchTicket {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub async fn wait(self) -> Result<BatchDelivery, BatchError> {
        self.receiver
            .await
            .unwrap_or_else(|_| Err(BatchError::ShuttingDown))
    }

    /// Wait at most `timeout` for dispatch. A request still queued at the
    /// deadline is cancelled; one already dispatched is waited for.
    pub async fn wait_timeout(mut self, timeout: Duration) -> Result<BatchDelivery, BatchError> {
        match tokio::time::timeout(timeout, &mut self.receiver).await {
            Ok(result) => result.unwrap_or_else(|_| Err(BatchError::ShuttingDown)),
            Err(_) => {
                if self.scheduler.cancel(&self.service, &self.request_id) {
                    Err(BatchError::TimedOut(self.request_id))
                } else {
                    self.receiver
                        .await
                        .unwrap_or_else(|_| Err(BatchError::ShuttingDown))
                }
            }
        }
    }

    /// Withdraw the request if it has not been dispatched yet
    pub fn cancel(&self) -> bool {
        self.scheduler.cancel(&self.service, &self.request_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ApiError, Priority, TokenUsage, UpstreamResponse};
    use async_trait::async_trait;

    #[derive(Default)]
    struct RecordingUpstream {
        calls: Mutex<Vec<Vec<String>>>,
        fail: bool,
    }

    impl RecordingUpstream {
        fn failing() -> Self {
            Self {
                fail: true,
                ..Default::default()
            }
        }

        fn calls(&self) -> Vec<Vec<String>> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl UpstreamProvider for RecordingUpstream {
        async fn send_batch(
            &self,
            _service: &str,
            payloads: Vec<Payload>,
        ) -> Result<Vec<UpstreamResponse>, ApiError> {
            self.calls
                .lock()
                .unwrap()
                .push(payloads.iter().map(|p| p.prompt.clone()).collect());

            if self.fail {
                return Err(ApiError::Provider("upstream down".to_string()));
            }

            Ok(payloads
                .into_iter()
                .map(|p| UpstreamResponse {
                    content: format!("echo: {}", p.prompt),
                    usage: TokenUsage::new(10, 5),
                    model: "test".to_string(),
                })
                .collect())
        }

        fn name(&self) -> &str {
            "recording"
        }
    }

    fn scheduler(
        upstream: Arc<RecordingUpstream>,
        batchable: bool,
        max_batch_size: usize,
        max_wait_ms: u64,
    ) -> BatchScheduler {
        let mut policies = HashMap::new();
        policies.insert(
            "bulk".to_string(),
            BatchPolicy {
                batchable,
                max_batch_size,
                max_wait: Duration::from_millis(max_wait_ms),
            },
        );
        BatchScheduler::new(upstream, policies)
    }

    fn item(id: &str, priority: Priority) -> BatchQueueItem {
        BatchQueueItem::new(id, "bulk", Payload::new(id), priority)
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_by_size() {
        let upstream = Arc::new(RecordingUpstream::default());
        let scheduler = scheduler(upstream.clone(), true, 3, 10_000);
        let start = Instant::now();

        let tickets: Vec<_> = ["a", "b", "c"]
            .iter()
            .map(|id| scheduler.enqueue(item(id, Priority::Medium)).unwrap())
            .collect();

        for ticket in tickets {
            let delivery = ticket.wait().await.unwrap();
            assert_eq!(delivery.batch_size, 3);
        }

        assert!(start.elapsed() < Duration::from_millis(10_000));
        assert_eq!(upstream.calls().len(), 1);
        assert_eq!(scheduler.stats().size_flushes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticket_pending_while_queued() {
        let upstream = Arc::new(RecordingUpstream::default());
        let scheduler = scheduler(upstream.clone(), true, 10, 50);

        let ticket = scheduler.enqueue(item("a", Priority::Medium)).unwrap();
        let mut wait = tokio_test::task::spawn(ticket.wait());

        tokio_test::assert_pending!(wait.poll());
        assert_eq!(scheduler.pending("bulk"), 1);
        assert!(upstream.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_by_timer() {
        let upstream = Arc::new(RecordingUpstream::default());
        let scheduler = scheduler(upstream.clone(), true, 10, 50);
        let start = Instant::now();

        let first = scheduler.enqueue(item("a", Priority::Medium)).unwrap();
        let second = scheduler.enqueue(item("b", Priority::Medium)).unwrap();

        assert_eq!(first.wait().await.unwrap().batch_size, 2);
        assert_eq!(second.wait().await.unwrap().response.content, "echo: b");
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert_eq!(scheduler.stats().timer_flushes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_priority_then_fifo_order() {
        let upstream = Arc::new(RecordingUpstream::default());
        let scheduler = scheduler(upstream.clone(), true, 4, 1_000);

        let tickets = vec![
            scheduler.enqueue(item("low", Priority::Low)).unwrap(),
            scheduler.enqueue(item("med-1", Priority::Medium)).unwrap(),
            scheduler.enqueue(item("high", Priority::High)).unwrap(),
            scheduler.enqueue(item("med-2", Priority::Medium)).unwrap(),
        ];
        for ticket in tickets {
            ticket.wait().await.unwrap();
        }

        assert_eq!(upstream.calls()[0], vec!["high", "med-1", "med-2", "low"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batches_never_exceed_max_size() {
        let upstream = Arc::new(RecordingUpstream::default());
        let scheduler = scheduler(upstream.clone(), true, 4, 100);

        let tickets: Vec<_> = (0..10)
            .map(|i| scheduler.enqueue(item(&format!("r{}", i), Priority::Low)).unwrap())
            .collect();
        for ticket in tickets {
            ticket.wait().await.unwrap();
        }

        let sizes: Vec<usize> = upstream.calls().iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![4, 4, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_fails_every_member() {
        let upstream = Arc::new(RecordingUpstream::failing());
        let scheduler = scheduler(upstream.clone(), true, 2, 1_000);

        let a = scheduler.enqueue(item("a", Priority::Medium)).unwrap();
        let b = scheduler.enqueue(item("b", Priority::Medium)).unwrap();

        for ticket in [a, b] {
            match ticket.wait().await {
                Err(BatchError::DispatchFailed { size, .. }) => assert_eq!(size, 2),
                other => panic!("expected dispatch failure, got {:?}", other.map(|d| d.batch_size)),
            }
        }
        assert_eq!(scheduler.stats().failed_batches, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_batchable_dispatches_alone() {
        let upstream = Arc::new(RecordingUpstream::default());
        let scheduler = scheduler(upstream.clone(), false, 8, 10_000);

        let a = scheduler.enqueue(item("a", Priority::Medium)).unwrap();
        let b = scheduler.enqueue(item("b", Priority::Medium)).unwrap();

        assert_eq!(a.wait().await.unwrap().batch_size, 1);
        assert_eq!(b.wait().await.unwrap().batch_size, 1);
        assert_eq!(upstream.calls().len(), 2);
        assert_eq!(scheduler.stats().immediate_dispatches, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_queued_item() {
        let upstream = Arc::new(RecordingUpstream::default());
        let scheduler = scheduler(upstream.clone(), true, 5, 100);

        let a = scheduler.enqueue(item("a", Priority::Medium)).unwrap();
        let b = scheduler.enqueue(item("b", Priority::Medium)).unwrap();

        assert!(a.cancel());
        assert!(matches!(a.wait().await, Err(BatchError::Cancelled(_))));

        assert_eq!(b.wait().await.unwrap().batch_size, 1);
        assert_eq!(upstream.calls(), vec![vec!["b".to_string()]]);
        assert!(!scheduler.cancel("bulk", "b"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_timeout_cancels_queued_item() {
        let upstream = Arc::new(RecordingUpstream::default());
        let scheduler = scheduler(upstream.clone(), true, 5, 1_000);

        let ticket = scheduler.enqueue(item("slow", Priority::Low)).unwrap();
        let result = ticket.wait_timeout(Duration::from_millis(100)).await;
        assert!(matches!(result, Err(BatchError::TimedOut(_))));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(upstream.calls().is_empty());
        assert_eq!(scheduler.pending("bulk"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_flushes_and_rejects() {
        let upstream = Arc::new(RecordingUpstream::default());
        let scheduler = scheduler(upstream.clone(), true, 5, 60_000);

        let ticket = scheduler.enqueue(item("a", Priority::Medium)).unwrap();
        scheduler.shutdown().await;

        assert_eq!(ticket.wait().await.unwrap().batch_size, 1);
        assert!(matches!(
            scheduler.enqueue(item("b", Priority::Medium)),
            Err(BatchError::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn test_unknown_service() {
        let upstream = Arc::new(RecordingUpstream::default());
        let scheduler = scheduler(upstream, true, 5, 50);

        let item = BatchQueueItem::new("x", "nope", Payload::new("x"), Priority::Low);
        assert!(matches!(
            scheduler.enqueue(item),
            Err(BatchError::UnknownService(_))
        ));
    }
}
