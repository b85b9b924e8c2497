//! Per-service request batching
//!
//! Requests of one service type share a queue. A queue is flushed when it
//! holds `max_batch_size` items or when its oldest item has waited
//! `max_wait`, whichever comes first. Each flush becomes one call to
//! [`UpstreamProvider::send_batch`](crate::api::UpstreamProvider::send_batch).

mod scheduler;

pub use scheduler::{BatchScheduler, BatchTicket};

use crate::api::{ApiError, Payload, Priority, UpstreamResponse};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

#[derive(Error, Debug, Clone)]
pub enum BatchError {
    #[error("Batch of {size} for '{service}' failed: {source}")]
    DispatchFailed {
        service: String,
        size: usize,
        source: Arc<ApiError>,
    },

    #[error("Provider returned {got} responses for a batch of {expected}")]
    InvalidBatchResponse { expected: usize, got: usize },

    #[error("Request {0} was cancelled before dispatch")]
    Cancelled(String),

    #[error("Request {0} timed out while queued")]
    TimedOut(String),

    #[error("Batch scheduler is shutting down")]
    ShuttingDown,

    #[error("No batch policy for service '{0}'")]
    UnknownService(String),
}

/// A request waiting for dispatch
#[derive(Debug, Clone)]
pub struct BatchQueueItem {
    pub request_id: String,
    pub service_type: String,
    pub payload: Payload,
    pub priority: Priority,
    pub enqueued_at: Instant,
}

impl BatchQueueItem {
    pub fn new(
        request_id: impl Into<String>,
        service_type: impl Into<String>,
        payload: Payload,
        priority: Priority,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            service_type: service_type.into(),
            payload,
            priority,
            enqueued_at: Instant::now(),
        }
    }
}

/// Batching rules of one service type
#[derive(Debug, Clone, PartialEq)]
pub struct BatchPolicy {
    /// Non-batchable services are sent as a batch of one on enqueue
    pub batchable: bool,
    pub max_batch_size: usize,
    pub max_wait: Duration,
}

impl Default for BatchPolicy {
    fn default() -> Self {
        Self {
            batchable: false,
            max_batch_size: 8,
            max_wait: Duration::from_millis(50),
        }
    }
}

/// What a queued request receives once its batch returns
#[derive(Debug, Clone)]
pub struct BatchDelivery {
    pub response: UpstreamResponse,
    /// Number of requests in the provider call
    pub batch_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FlushReason {
    Size,
    Timer,
    Immediate,
    Shutdown,
}

/// Dispatch counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchStats {
    pub batches_dispatched: u64,
    pub items_dispatched: u64,
    pub size_flushes: u64,
    pub timer_flushes: u64,
    pub immediate_dispatches: u64,
    pub failed_batches: u64,
    pub cancelled: u64,
    pub largest_batch: usize,
}

impl BatchStats {
    pub fn average_batch_size(&self) -> f64 {
        if self.batches_dispatched == 0 {
            return 0.0;
        }
        self.items_dispatched as f64 / self.batches_dispatched as f64
    }

    pub(crate) fn record(&mut self, size: usize, reason: FlushReason, failed: bool) {
        self.batches_dispatched += 1;
        self.items_dispatched += size as u64;
        self.largest_batch = self.largest_batch.max(size);
        match reason {
            FlushReason::Size => self.size_flushes += 1,
            FlushReason::Timer | FlushReason::Shutdown => self.timer_flushes += 1,
            FlushReason::Immediate => self.immediate_dispatches += 1,
        }
        if failed {
            self.failed_batches += 1;
        }
    }
}
