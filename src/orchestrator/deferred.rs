//! Parking lot for best-effort requests refused by the budget

use crate::api::ProcessRequest;
use crate::budget::DenyReason;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::Mutex;

/// A request waiting for [`resume_deferred`](super::CostOptimizationOrchestrator::resume_deferred)
#[derive(Debug, Clone)]
pub struct DeferredRequest {
    pub request_id: String,
    pub request: ProcessRequest,
    pub reason: DenyReason,
    pub deferred_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub(crate) struct DeferredQueue {
    inner: Mutex<VecDeque<DeferredRequest>>,
}

impl DeferredQueue {
    /// Park a request unless `capacity` are already waiting; a refused
    /// request is handed back
    pub fn push(&self, request: DeferredRequest, capacity: usize) -> Result<(), DeferredRequest> {
        let Ok(mut queue) = self.inner.lock() else {
            return Err(request);
        };
        if queue.len() >= capacity {
            return Err(request);
        }
        queue.push_back(request);
        Ok(())
    }

    /// Take every parked request, oldest first
    pub fn drain(&self) -> Vec<DeferredRequest> {
        self.inner
            .lock()
            .map(|mut q| q.drain(..).collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|q| q.len()).unwrap_or(0)
    }

    pub fn ids(&self) -> Vec<String> {
        self.inner
            .lock()
            .map(|q| q.iter().map(|d| d.request_id.clone()).collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::Payload;

    fn parked(id: &str) -> DeferredRequest {
        DeferredRequest {
            request_id: id.to_string(),
            request: ProcessRequest::new("chat", Payload::new(id)),
            reason: DenyReason::Exhausted,
            deferred_at: Utc::now(),
        }
    }

    #[test]
    fn test_drain_is_fifo() {
        let queue = DeferredQueue::default();
        for id in ["req-1", "req-2"] {
            queue.push(parked(id), 10).unwrap();
        }

        assert_eq!(queue.ids(), vec!["req-1", "req-2"]);
        let drained = queue.drain();
        assert_eq!(drained[0].request_id, "req-1");
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn test_full_queue_refuses() {
        let queue = DeferredQueue::default();
        queue.push(parked("req-1"), 2).unwrap();
        queue.push(parked("req-2"), 2).unwrap();

        let refused = queue.push(parked("req-3"), 2).unwrap_err();
        assert_eq!(refused.request_id, "req-3");
        assert_eq!(queue.ids(), vec!["req-1", "req-2"]);

        queue.drain();
        assert!(queue.push(parked("req-3"), 2).is_ok());
    }
}
