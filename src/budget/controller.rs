//! Budget envelopes, reservations and alerts

use super::forecast::{project, Forecast, ForecastPeriod};
use super::{
    AdmissionDecision, AlertThresholds, AlertTier, Admission, BudgetAlert, BudgetError,
    BudgetLimits, BudgetOptions, BudgetState, BudgetStatus, DenyReason, Reservation, SpendRecord,
    GLOBAL_SCOPE,
};
use arc_swap::ArcSwap;
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tracing::{debug, info, warn};

/// Slack for float comparisons against limits
const EPSILON: f64 = 1e-9;

struct Envelope {
    scope: String,
    limits: BudgetLimits,
    daily_spent: f64,
    monthly_spent: f64,
    reserved: f64,
    status: BudgetStatus,
    fired: Vec<AlertTier>,
    last_reset_day: NaiveDate,
    last_reset_month: NaiveDate,
}

impl Envelope {
    fn new(scope: &str, limits: BudgetLimits, now: DateTime<Utc>) -> Self {
        let today = now.date_naive();
        Self {
            scope: scope.to_string(),
            limits,
            daily_spent: 0.0,
            monthly_spent: 0.0,
            reserved: 0.0,
            status: BudgetStatus::Normal,
            fired: Vec::new(),
            last_reset_day: today,
            last_reset_month: month_start(today),
        }
    }

    /// Zero the counters whose period ended. Returns true if anything reset.
    fn roll(&mut self, now: DateTime<Utc>) -> bool {
        let today = now.date_naive();
        let month = month_start(today);
        let mut reset = false;

        if today != self.last_reset_day {
            self.daily_spent = 0.0;
            self.status = BudgetStatus::Normal;
            self.fired.clear();
            self.last_reset_day = today;
            reset = true;
        }
        if month != self.last_reset_month {
            self.monthly_spent = 0.0;
            self.last_reset_month = month;
            reset = true;
        }

        reset
    }

    /// Would `estimate`, on top of spend and outstanding reservations, breach a cap?
    fn check(&self, estimate: f64) -> Option<DenyReason> {
        let daily = self.daily_spent + self.reserved + estimate;
        if daily > self.limits.daily_limit + EPSILON {
            return Some(DenyReason::DailyLimit {
                projected: daily,
                limit: self.limits.daily_limit,
            });
        }

        let monthly = self.monthly_spent + self.reserved + estimate;
        if monthly > self.limits.monthly_limit + EPSILON {
            return Some(DenyReason::MonthlyLimit {
                projected: monthly,
                limit: self.limits.monthly_limit,
            });
        }

        None
    }

    fn release(&mut self, amount: f64) {
        self.reserved = (self.reserved - amount).max(0.0);
    }

    fn record(
        &mut self,
        amount: f64,
        thresholds: &AlertThresholds,
        now: DateTime<Utc>,
    ) -> Vec<BudgetAlert> {
        self.daily_spent += amount;
        self.monthly_spent += amount;

        let ratio = self.daily_ratio();
        let mut alerts = Vec::new();

        for tier in AlertTier::ALL {
            if ratio + EPSILON < thresholds.threshold(tier) {
                continue;
            }
            self.status = self.status.max(tier.status());
            if !self.fired.contains(&tier) {
                self.fired.push(tier);
                alerts.push(BudgetAlert {
                    scope: self.scope.clone(),
                    tier,
                    ratio,
                    spent: self.daily_spent,
                    limit: self.limits.daily_limit,
                    timestamp: now,
                });
            }
        }

        alerts
    }

    fn daily_ratio(&self) -> f64 {
        if self.limits.daily_limit > 0.0 {
            self.daily_spent / self.limits.daily_limit
        } else {
            0.0
        }
    }

    fn state(&self) -> BudgetState {
        BudgetState {
            service: self.scope.clone(),
            daily_spent: self.daily_spent,
            monthly_spent: self.monthly_spent,
            daily_limit: self.limits.daily_limit,
            monthly_limit: self.limits.monthly_limit,
            reserved: self.reserved,
            status: self.status,
            last_reset_day: self.last_reset_day,
            last_reset_month: self.last_reset_month,
        }
    }
}

fn month_start(day: NaiveDate) -> NaiveDate {
    day.with_day(1).unwrap_or(day)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Tracks spend against per-service and global envelopes and gates
/// admission of new work.
///
/// Updates to one service are serialised by that service's lock. When both
/// a service envelope and the global envelope are needed, the service lock
/// is always taken first.
pub struct BudgetController {
    services: RwLock<HashMap<String, Arc<Mutex<Envelope>>>>,
    global: Mutex<Envelope>,
    options: ArcSwap<BudgetOptions>,
    history: Mutex<VecDeque<SpendRecord>>,
    next_reservation: AtomicU64,
}

impl BudgetController {
    pub fn new(
        global: BudgetLimits,
        services: HashMap<String, BudgetLimits>,
        options: BudgetOptions,
    ) -> Self {
        let now = Utc::now();
        let services = services
            .into_iter()
            .map(|(name, limits)| {
                let envelope = Envelope::new(&name, limits, now);
                (name, Arc::new(Mutex::new(envelope)))
            })
            .collect();

        Self {
            services: RwLock::new(services),
            global: Mutex::new(Envelope::new(GLOBAL_SCOPE, global, now)),
            options: ArcSwap::from_pointee(options),
            history: Mutex::new(VecDeque::new()),
            next_reservation: AtomicU64::new(1),
        }
    }

    /// Allow or deny a request of `estimated_cost`, without reserving it
    pub fn can_proceed(
        &self,
        service: &str,
        estimated_cost: f64,
    ) -> Result<AdmissionDecision, BudgetError> {
        self.can_proceed_at(service, estimated_cost, Utc::now())
    }

    pub fn can_proceed_at(
        &self,
        service: &str,
        estimated_cost: f64,
        now: DateTime<Utc>,
    ) -> Result<AdmissionDecision, BudgetError> {
        let envelope = self.envelope(service)?;
        let mut service_env = lock(&envelope);
        let mut global = lock(&self.global);
        service_env.roll(now);
        global.roll(now);

        Ok(self.decide(&service_env, &global, estimated_cost, false))
    }

    /// Decide and, when allowed, reserve `estimated_cost` in one step
    pub fn admit(
        &self,
        service: &str,
        estimated_cost: f64,
        essential: bool,
        request_id: &str,
    ) -> Result<Admission, BudgetError> {
        self.admit_at(service, estimated_cost, essential, request_id, Utc::now())
    }

    pub fn admit_at(
        &self,
        service: &str,
        estimated_cost: f64,
        essential: bool,
        request_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Admission, BudgetError> {
        let envelope = self.envelope(service)?;
        let mut service_env = lock(&envelope);
        let mut global = lock(&self.global);
        service_env.roll(now);
        global.roll(now);

        let decision = self.decide(&service_env, &global, estimated_cost, essential);

        let reservation = match &decision {
            AdmissionDecision::Deny { scope, reason } => {
                info!(service, scope = %scope, request_id, "Admission denied: {}", reason);
                None
            }
            _ => {
                if let AdmissionDecision::Throttle(delay) = &decision {
                    debug!(service, request_id, ?delay, "Admission throttled");
                }
                service_env.reserved += estimated_cost;
                global.reserved += estimated_cost;
                Some(Reservation {
                    id: self.next_reservation.fetch_add(1, Ordering::Relaxed),
                    service: service.to_string(),
                    amount: estimated_cost,
                    request_id: request_id.to_string(),
                })
            }
        };

        Ok(Admission {
            decision,
            reservation,
        })
    }

    /// Turn a reservation into recorded spend of `actual_cost`
    pub fn settle(&self, reservation: Reservation, actual_cost: f64) -> Vec<BudgetAlert> {
        self.settle_at(reservation, actual_cost, Utc::now())
    }

    pub fn settle_at(
        &self,
        reservation: Reservation,
        actual_cost: f64,
        now: DateTime<Utc>,
    ) -> Vec<BudgetAlert> {
        if actual_cost > reservation.amount + EPSILON {
            debug!(
                service = %reservation.service,
                estimate = reservation.amount,
                actual = actual_cost,
                "Actual cost above estimate"
            );
        }

        let alerts = self.apply(&reservation.service, reservation.amount, Some(actual_cost), now);
        self.push_record(SpendRecord {
            service: reservation.service,
            amount: actual_cost,
            timestamp: now,
            request_id: reservation.request_id,
        });

        alerts
    }

    /// Drop a reservation without spending it
    pub fn release(&self, reservation: Reservation) {
        self.apply(&reservation.service, reservation.amount, None, Utc::now());
    }

    /// Commit spend that was not reserved through [`admit`](Self::admit)
    pub fn record_spending(
        &self,
        service: &str,
        actual_cost: f64,
    ) -> Result<Vec<BudgetAlert>, BudgetError> {
        self.record_spending_at(service, actual_cost, Utc::now())
    }

    pub fn record_spending_at(
        &self,
        service: &str,
        actual_cost: f64,
        now: DateTime<Utc>,
    ) -> Result<Vec<BudgetAlert>, BudgetError> {
        self.envelope(service)?;

        let alerts = self.apply(service, 0.0, Some(actual_cost), now);
        self.push_record(SpendRecord {
            service: service.to_string(),
            amount: actual_cost,
            timestamp: now,
            request_id: String::new(),
        });

        Ok(alerts)
    }

    /// Zero counters whose day or month has ended. Returns envelopes reset.
    pub fn reset_if_due(&self) -> usize {
        self.reset_if_due_at(Utc::now())
    }

    pub fn reset_if_due_at(&self, now: DateTime<Utc>) -> usize {
        let mut reset = 0;

        for envelope in self.envelopes() {
            let mut envelope = lock(&envelope);
            if envelope.roll(now) {
                info!(scope = %envelope.scope, "Budget period reset");
                reset += 1;
            }
        }

        let mut global = lock(&self.global);
        if global.roll(now) {
            info!(scope = GLOBAL_SCOPE, "Budget period reset");
            reset += 1;
        }

        reset
    }

    /// Apply new limits; spent counters and reservations carry over
    pub fn update_limits(&self, global: BudgetLimits, services: HashMap<String, BudgetLimits>) {
        let now = Utc::now();
        lock(&self.global).limits = global;

        let mut current = self.services.write().unwrap_or_else(|e| e.into_inner());
        current.retain(|name, _| services.contains_key(name));

        for (name, limits) in services {
            match current.get(&name) {
                Some(envelope) => lock(envelope).limits = limits,
                None => {
                    let envelope = Envelope::new(&name, limits, now);
                    current.insert(name, Arc::new(Mutex::new(envelope)));
                }
            }
        }
    }

    pub fn update_options(&self, options: BudgetOptions) {
        self.options.store(Arc::new(options));
    }

    pub fn state(&self, service: &str) -> Result<BudgetState, BudgetError> {
        let envelope = self.envelope(service)?;
        let state = lock(&envelope).state();
        Ok(state)
    }

    pub fn global_state(&self) -> BudgetState {
        lock(&self.global).state()
    }

    /// Global envelope first, then services by name
    pub fn snapshot(&self) -> Vec<BudgetState> {
        let mut services: Vec<BudgetState> = self
            .envelopes()
            .iter()
            .map(|envelope| lock(envelope).state())
            .collect();
        services.sort_by(|a, b| a.service.cmp(&b.service));

        let mut states = vec![self.global_state()];
        states.extend(services);
        states
    }

    /// Total recorded spend per service over the retained history
    pub fn spend_breakdown(&self) -> BTreeMap<String, f64> {
        let history = lock(&self.history);
        let mut breakdown = BTreeMap::new();
        for record in history.iter() {
            *breakdown.entry(record.service.clone()).or_insert(0.0) += record.amount;
        }
        breakdown
    }

    pub fn history(&self) -> Vec<SpendRecord> {
        lock(&self.history).iter().cloned().collect()
    }

    /// Projected global spend at the end of `period`
    pub fn get_forecast(&self, period: ForecastPeriod) -> Forecast {
        self.get_forecast_at(period, Utc::now())
    }

    pub fn get_forecast_at(&self, period: ForecastPeriod, now: DateTime<Utc>) -> Forecast {
        let (spent, limit) = {
            let global = lock(&self.global);
            match period {
                ForecastPeriod::Day => (global.daily_spent, global.limits.daily_limit),
                ForecastPeriod::Month => (global.monthly_spent, global.limits.monthly_limit),
            }
        };

        let window = self.options.load().forecast_window;
        let history = lock(&self.history);
        project(period, spent, limit, history.iter(), window, now)
    }

    fn decide(
        &self,
        service: &Envelope,
        global: &Envelope,
        estimate: f64,
        essential: bool,
    ) -> AdmissionDecision {
        for envelope in [service, global] {
            if let Some(reason) = envelope.check(estimate) {
                return AdmissionDecision::Deny {
                    scope: envelope.scope.clone(),
                    reason,
                };
            }
        }

        let worst = if service.status >= global.status {
            service
        } else {
            global
        };

        match worst.status {
            BudgetStatus::Exhausted if !essential => AdmissionDecision::Deny {
                scope: worst.scope.clone(),
                reason: DenyReason::Exhausted,
            },
            BudgetStatus::Throttled | BudgetStatus::Exhausted => {
                AdmissionDecision::Throttle(self.options.load().throttle_delay)
            }
            _ => AdmissionDecision::Allow,
        }
    }

    /// Release `reserved` and record `actual` on the service and global envelopes
    fn apply(
        &self,
        service: &str,
        reserved: f64,
        actual: Option<f64>,
        now: DateTime<Utc>,
    ) -> Vec<BudgetAlert> {
        let thresholds = self.options.load().thresholds;
        let envelope = self.envelope(service).ok();
        let mut service_env = envelope.as_ref().map(|e| lock(e));
        let mut global = lock(&self.global);

        let mut alerts = Vec::new();
        for envelope in service_env
            .as_deref_mut()
            .into_iter()
            .chain(std::iter::once(&mut *global))
        {
            envelope.roll(now);
            envelope.release(reserved);
            if let Some(actual) = actual {
                alerts.extend(envelope.record(actual, &thresholds, now));
            }
        }

        for alert in &alerts {
            warn!("Budget alert: {}", alert);
        }

        alerts
    }

    fn push_record(&self, record: SpendRecord) {
        let retention = self.options.load().history_retention.max(1);
        let mut history = lock(&self.history);
        history.push_back(record);
        while history.len() > retention {
            history.pop_front();
        }
    }

    fn envelope(&self, service: &str) -> Result<Arc<Mutex<Envelope>>, BudgetError> {
        self.services
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(service)
            .cloned()
            .ok_or_else(|| BudgetError::UnknownService(service.to_string()))
    }

    fn envelopes(&self) -> Vec<Arc<Mutex<Envelope>>> {
        self.services
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::time::Duration;

    fn limits(daily: f64, monthly: f64) -> BudgetLimits {
        BudgetLimits {
            daily_limit: daily,
            monthly_limit: monthly,
        }
    }

    fn controller(daily: f64) -> BudgetController {
        let mut services = HashMap::new();
        services.insert("chat".to_string(), limits(daily, daily * 30.0));
        services.insert("bulk".to_string(), limits(1_000.0, 10_000.0));
        BudgetController::new(limits(10_000.0, 100_000.0), services, BudgetOptions::default())
    }

    fn noon(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, day, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_budget_denial() {
        let budget = controller(100.0);
        budget.record_spending("chat", 95.0).unwrap();

        let denied = budget.can_proceed("chat", 10.0).unwrap();
        assert!(matches!(
            denied,
            AdmissionDecision::Deny {
                reason: DenyReason::DailyLimit { .. },
                ..
            }
        ));

        assert!(budget.can_proceed("chat", 4.0).unwrap().is_allowed());
    }

    #[test]
    fn test_unknown_service() {
        let budget = controller(100.0);
        assert_eq!(
            budget.can_proceed("nope", 1.0),
            Err(BudgetError::UnknownService("nope".to_string()))
        );
    }

    #[test]
    fn test_alerts_fire_once_per_tier() {
        let budget = controller(100.0);

        let alerts = budget.record_spending("chat", 81.0).unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].tier, AlertTier::Warning);

        // Still in the warning band
        assert!(budget.record_spending("chat", 1.0).unwrap().is_empty());

        // Jumps over critical and severe at once
        let alerts = budget.record_spending("chat", 14.0).unwrap();
        let tiers: Vec<AlertTier> = alerts.iter().map(|a| a.tier).collect();
        assert_eq!(tiers, vec![AlertTier::Critical, AlertTier::Severe]);
        assert_eq!(budget.state("chat").unwrap().status, BudgetStatus::Throttled);
    }

    #[test]
    fn test_throttle_then_exhausted() {
        let budget = controller(100.0);
        budget.record_spending("chat", 96.0).unwrap();

        assert_eq!(
            budget.can_proceed("chat", 1.0).unwrap(),
            AdmissionDecision::Throttle(BudgetOptions::default().throttle_delay)
        );

        budget.record_spending("chat", 4.0).unwrap();
        assert_eq!(budget.state("chat").unwrap().status, BudgetStatus::Exhausted);

        let admission = budget.admit("chat", 0.0, false, "req-1").unwrap();
        assert!(matches!(
            admission.decision,
            AdmissionDecision::Deny {
                reason: DenyReason::Exhausted,
                ..
            }
        ));
        assert!(admission.reservation.is_none());

        // Essential work still passes if it fits under the cap
        let admission = budget.admit("chat", 0.0, true, "req-2").unwrap();
        assert!(admission.decision.is_allowed());
    }

    #[test]
    fn test_reservations_block_concurrent_overspend() {
        let budget = controller(10.0);

        let first = budget.admit("chat", 6.0, false, "a").unwrap();
        assert!(first.decision.is_allowed());

        let second = budget.admit("chat", 6.0, false, "b").unwrap();
        assert!(!second.decision.is_allowed());

        budget.release(first.reservation.unwrap());
        let third = budget.admit("chat", 6.0, false, "c").unwrap();
        assert!(third.decision.is_allowed());

        budget.settle(third.reservation.unwrap(), 5.5);
        let state = budget.state("chat").unwrap();
        assert!((state.daily_spent - 5.5).abs() < 1e-9);
        assert_eq!(state.reserved, 0.0);
    }

    #[test]
    fn test_global_envelope_applies_across_services() {
        let mut services = HashMap::new();
        services.insert("a".to_string(), limits(100.0, 1_000.0));
        services.insert("b".to_string(), limits(100.0, 1_000.0));
        let budget =
            BudgetController::new(limits(50.0, 1_000.0), services, BudgetOptions::default());

        budget.record_spending("a", 45.0).unwrap();

        match budget.can_proceed("b", 10.0).unwrap() {
            AdmissionDecision::Deny { scope, .. } => assert_eq!(scope, GLOBAL_SCOPE),
            other => panic!("expected global denial, got {:?}", other),
        }
    }

    #[test]
    fn test_monthly_limit() {
        let mut services = HashMap::new();
        services.insert("chat".to_string(), limits(100.0, 150.0));
        let budget =
            BudgetController::new(limits(1_000.0, 10_000.0), services, BudgetOptions::default());

        budget.record_spending_at("chat", 70.0, noon(1)).unwrap();
        budget.record_spending_at("chat", 70.0, noon(2)).unwrap();

        let decision = budget.can_proceed_at("chat", 20.0, noon(3)).unwrap();
        assert!(matches!(
            decision,
            AdmissionDecision::Deny {
                reason: DenyReason::MonthlyLimit { .. },
                ..
            }
        ));
    }

    #[test]
    fn test_daily_reset_restores_normal() {
        let budget = controller(100.0);
        budget.record_spending_at("chat", 100.0, noon(4)).unwrap();
        assert_eq!(budget.state("chat").unwrap().status, BudgetStatus::Exhausted);

        let next_day = Utc.with_ymd_and_hms(2024, 3, 5, 0, 0, 1).unwrap();
        assert!(budget.reset_if_due_at(next_day) >= 1);

        let state = budget.state("chat").unwrap();
        assert_eq!(state.status, BudgetStatus::Normal);
        assert_eq!(state.daily_spent, 0.0);
        assert!((state.monthly_spent - 100.0).abs() < 1e-9);

        // Alerts can fire again in the new period
        let alerts = budget.record_spending_at("chat", 85.0, next_day).unwrap();
        assert_eq!(alerts.len(), 1);
    }

    #[test]
    fn test_monthly_reset() {
        let budget = controller(100.0);
        budget
            .record_spending_at("chat", 50.0, Utc.with_ymd_and_hms(2024, 3, 31, 23, 0, 0).unwrap())
            .unwrap();

        budget.reset_if_due_at(Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap());
        let state = budget.state("chat").unwrap();
        assert_eq!(state.monthly_spent, 0.0);
        assert_eq!(state.last_reset_month, NaiveDate::from_ymd_opt(2024, 4, 1).unwrap());
    }

    #[test]
    fn test_spend_never_exceeds_cap_when_admitted() {
        let budget = controller(100.0);
        let mut admitted = 0;

        for i in 0..50 {
            let admission = budget.admit("chat", 7.0, false, &format!("r{}", i)).unwrap();
            if let Some(reservation) = admission.reservation {
                budget.settle(reservation, 7.0);
                admitted += 1;
            }
            let state = budget.state("chat").unwrap();
            assert!(state.daily_spent <= state.daily_limit + EPSILON);
        }

        assert_eq!(admitted, 14);
    }

    #[test]
    fn test_breakdown_and_history_retention() {
        let budget = controller(1_000.0);
        budget.update_options(BudgetOptions {
            history_retention: 3,
            ..BudgetOptions::default()
        });

        for _ in 0..3 {
            budget.record_spending("chat", 1.0).unwrap();
        }
        budget.record_spending("bulk", 2.0).unwrap();

        assert_eq!(budget.history().len(), 3);
        let breakdown = budget.spend_breakdown();
        assert_eq!(breakdown.get("chat"), Some(&2.0));
        assert_eq!(breakdown.get("bulk"), Some(&2.0));
    }

    #[test]
    fn test_update_limits_keeps_spend() {
        let budget = controller(100.0);
        budget.record_spending("chat", 40.0).unwrap();

        let mut services = HashMap::new();
        services.insert("chat".to_string(), limits(50.0, 500.0));
        budget.update_limits(limits(10_000.0, 100_000.0), services);

        let state = budget.state("chat").unwrap();
        assert_eq!(state.daily_limit, 50.0);
        assert!((state.daily_spent - 40.0).abs() < 1e-9);
        assert!(budget.state("bulk").is_err());
        assert!(!budget.can_proceed("chat", 15.0).unwrap().is_allowed());
    }

    #[test]
    fn test_forecast_uses_global_spend() {
        let budget = controller(100.0);
        budget.update_options(BudgetOptions {
            forecast_window: Duration::from_secs(3600),
            ..BudgetOptions::default()
        });
        let now = Utc::now();
        budget.record_spending_at("chat", 2.0, now).unwrap();

        let forecast = budget.get_forecast_at(ForecastPeriod::Month, now);
        assert!(forecast.spent_so_far >= 2.0);
        assert!(forecast.projected_total >= forecast.spent_so_far);
    }
}
