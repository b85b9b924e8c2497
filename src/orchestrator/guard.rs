//! Drop guards for work a caller may abandon mid-request
//!
//! A `process_request` future can be dropped at any await point. These
//! guards make sure an abandoned request gives back its reserved budget and
//! leaves the batch queue instead of being sent unbilled.

use crate::batch::BatchScheduler;
use crate::budget::{BudgetController, Reservation};
use std::sync::Arc;
use tracing::debug;

/// A reservation that is released on drop unless settled first
pub(crate) struct HeldReservation {
    budget: Arc<BudgetController>,
    reservation: Option<Reservation>,
}

impl HeldReservation {
    pub fn new(budget: Arc<BudgetController>, reservation: Reservation) -> Self {
        Self {
            budget,
            reservation: Some(reservation),
        }
    }

    pub fn settle(mut self, actual_cost: f64) {
        if let Some(reservation) = self.reservation.take() {
            self.budget.settle(reservation, actual_cost);
        }
    }

    pub fn release(mut self) {
        if let Some(reservation) = self.reservation.take() {
            self.budget.release(reservation);
        }
    }
}

impl Drop for HeldReservation {
    fn drop(&mut self) {
        if let Some(reservation) = self.reservation.take() {
            debug!(
                request_id = reservation.request_id(),
                amount = reservation.amount(),
                "Releasing abandoned reservation"
            );
            self.budget.release(reservation);
        }
    }
}

/// Withdraws a still-queued item when dropped while armed
pub(crate) struct QueuedGuard {
    scheduler: BatchScheduler,
    service: String,
    request_id: String,
    armed: bool,
}

impl QueuedGuard {
    pub fn new(scheduler: BatchScheduler, service: &str, request_id: &str) -> Self {
        Self {
            scheduler,
            service: service.to_string(),
            request_id: request_id.to_string(),
            armed: true,
        }
    }

    pub fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for QueuedGuard {
    fn drop(&mut self) {
        if self.armed && self.scheduler.cancel(&self.service, &self.request_id) {
            debug!(request_id = %self.request_id, "Withdrew abandoned request from queue");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::{BudgetLimits, BudgetOptions};
    use std::collections::HashMap;

    fn controller() -> Arc<BudgetController> {
        let mut services = HashMap::new();
        services.insert(
            "chat".to_string(),
            BudgetLimits {
                daily_limit: 10.0,
                monthly_limit: 100.0,
            },
        );
        Arc::new(BudgetController::new(
            BudgetLimits {
                daily_limit: 50.0,
                monthly_limit: 500.0,
            },
            services,
            BudgetOptions::default(),
        ))
    }

    #[test]
    fn test_dropped_reservation_is_released() {
        let budget = controller();
        let admission = budget.admit("chat", 2.0, false, "req-1").unwrap();
        let held = HeldReservation::new(Arc::clone(&budget), admission.reservation.unwrap());
        assert_eq!(budget.state("chat").unwrap().reserved, 2.0);

        drop(held);

        let state = budget.state("chat").unwrap();
        assert_eq!(state.reserved, 0.0);
        assert_eq!(state.daily_spent, 0.0);
        assert_eq!(budget.global_state().reserved, 0.0);
    }

    #[test]
    fn test_settled_reservation_is_not_released_twice() {
        let budget = controller();
        let admission = budget.admit("chat", 2.0, false, "req-1").unwrap();
        HeldReservation::new(Arc::clone(&budget), admission.reservation.unwrap()).settle(1.5);

        let state = budget.state("chat").unwrap();
        assert_eq!(state.reserved, 0.0);
        assert!((state.daily_spent - 1.5).abs() < 1e-9);
        assert_eq!(budget.history().len(), 1);
    }
}
