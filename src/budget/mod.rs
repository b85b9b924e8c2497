//! Spend tracking and admission control
//!
//! Every service has its own daily/monthly envelope, checked in addition to
//! the global envelope. Alerts fire once per tier per day as the daily
//! ratio crosses each threshold:
//!
//! | ratio | tier | status afterwards |
//! |-------|------|-------------------|
//! | 0.80 | warning | `Warning` |
//! | 0.90 | critical | `Critical` |
//! | 0.95 | severe | `Throttled`: admissions are delayed |
//! | 1.00 | emergency | `Exhausted`: non-essential work is denied |

mod controller;
mod forecast;

pub use controller::BudgetController;
pub use forecast::{Forecast, ForecastPeriod, Trend, MAX_FORECAST_WINDOW};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Name of the envelope covering all services together
pub const GLOBAL_SCOPE: &str = "global";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BudgetError {
    #[error("No budget configured for service '{0}'")]
    UnknownService(String),
}

/// Fractions of the daily limit at which each alert tier fires
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertThresholds {
    pub warning: f64,
    pub critical: f64,
    pub severe: f64,
    pub emergency: f64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            warning: 0.80,
            critical: 0.90,
            severe: 0.95,
            emergency: 1.00,
        }
    }
}

impl AlertThresholds {
    pub fn threshold(&self, tier: AlertTier) -> f64 {
        match tier {
            AlertTier::Warning => self.warning,
            AlertTier::Critical => self.critical,
            AlertTier::Severe => self.severe,
            AlertTier::Emergency => self.emergency,
        }
    }

    /// Strictly ascending within (0, 1]
    pub fn is_valid(&self) -> bool {
        let values = [self.warning, self.critical, self.severe, self.emergency];
        values[0] > 0.0 && values[3] <= 1.0 && values.windows(2).all(|w| w[0] < w[1])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertTier {
    Warning,
    Critical,
    Severe,
    Emergency,
}

impl AlertTier {
    pub const ALL: [AlertTier; 4] = [
        AlertTier::Warning,
        AlertTier::Critical,
        AlertTier::Severe,
        AlertTier::Emergency,
    ];

    pub fn status(&self) -> BudgetStatus {
        match self {
            AlertTier::Warning => BudgetStatus::Warning,
            AlertTier::Critical => BudgetStatus::Critical,
            AlertTier::Severe => BudgetStatus::Throttled,
            AlertTier::Emergency => BudgetStatus::Exhausted,
        }
    }
}

/// Budget status of one envelope. Only moves forward until the daily reset.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum BudgetStatus {
    #[default]
    Normal,
    Warning,
    Critical,
    Throttled,
    Exhausted,
}

impl std::fmt::Display for BudgetStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            BudgetStatus::Normal => "normal",
            BudgetStatus::Warning => "warning",
            BudgetStatus::Critical => "critical",
            BudgetStatus::Throttled => "throttled",
            BudgetStatus::Exhausted => "exhausted",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum DenyReason {
    /// The request would push daily spend past the limit
    DailyLimit { projected: f64, limit: f64 },
    /// The request would push monthly spend past the limit
    MonthlyLimit { projected: f64, limit: f64 },
    /// Emergency tier reached; only essential work is admitted
    Exhausted,
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DenyReason::DailyLimit { projected, limit } => {
                write!(f, "daily spend would reach ${:.4} of ${:.4}", projected, limit)
            }
            DenyReason::MonthlyLimit { projected, limit } => {
                write!(f, "monthly spend would reach ${:.4} of ${:.4}", projected, limit)
            }
            DenyReason::Exhausted => write!(f, "budget exhausted until the next reset"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AdmissionDecision {
    Allow,
    Deny { scope: String, reason: DenyReason },
    /// Admitted, but the caller should hold back for this long first
    Throttle(Duration),
}

impl AdmissionDecision {
    /// True for `Allow` and `Throttle`
    pub fn is_allowed(&self) -> bool {
        !matches!(self, AdmissionDecision::Deny { .. })
    }
}

/// Estimated cost held against an envelope until settled or released
#[derive(Debug)]
pub struct Reservation {
    id: u64,
    service: String,
    amount: f64,
    request_id: String,
}

impl Reservation {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn amount(&self) -> f64 {
        self.amount
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }
}

/// Outcome of [`BudgetController::admit`]; a reservation is held only when allowed
#[derive(Debug)]
pub struct Admission {
    pub decision: AdmissionDecision,
    pub reservation: Option<Reservation>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BudgetLimits {
    pub daily_limit: f64,
    pub monthly_limit: f64,
}

/// Tunables of the controller other than limits
#[derive(Debug, Clone, PartialEq)]
pub struct BudgetOptions {
    pub thresholds: AlertThresholds,
    pub throttle_delay: Duration,
    /// Most recent spend records kept for forecasting and breakdowns
    pub history_retention: usize,
    pub forecast_window: Duration,
}

impl Default for BudgetOptions {
    fn default() -> Self {
        Self {
            thresholds: AlertThresholds::default(),
            throttle_delay: Duration::from_millis(500),
            history_retention: 10_000,
            forecast_window: Duration::from_secs(3600),
        }
    }
}

/// Snapshot of one envelope
#[derive(Debug, Clone, Serialize)]
pub struct BudgetState {
    pub service: String,
    pub daily_spent: f64,
    pub monthly_spent: f64,
    pub daily_limit: f64,
    pub monthly_limit: f64,
    /// Estimates held by admitted requests still in flight
    pub reserved: f64,
    pub status: BudgetStatus,
    pub last_reset_day: NaiveDate,
    pub last_reset_month: NaiveDate,
}

impl BudgetState {
    pub fn daily_ratio(&self) -> f64 {
        if self.daily_limit > 0.0 {
            self.daily_spent / self.daily_limit
        } else {
            0.0
        }
    }
}

/// Completed provider spend
#[derive(Debug, Clone, Serialize)]
pub struct SpendRecord {
    pub service: String,
    pub amount: f64,
    pub timestamp: DateTime<Utc>,
    pub request_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BudgetAlert {
    pub scope: String,
    pub tier: AlertTier,
    pub ratio: f64,
    pub spent: f64,
    pub limit: f64,
    pub timestamp: DateTime<Utc>,
}

impl std::fmt::Display for BudgetAlert {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{:?}] {} at {:.1}% of daily limit (${:.4} / ${:.4})",
            self.tier,
            self.scope,
            self.ratio * 100.0,
            self.spent,
            self.limit
        )
    }
}
