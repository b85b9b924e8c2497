//! End-of-period spend projection

use super::SpendRecord;
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Relative change between window halves treated as a real trend
const TREND_TOLERANCE: f64 = 0.2;

/// Longest look-back a projection uses
pub const MAX_FORECAST_WINDOW: Duration = Duration::from_secs(366 * 24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForecastPeriod {
    Day,
    Month,
}

impl ForecastPeriod {
    /// First instant of the next period
    pub fn end_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let today = now.date_naive();
        let next = match self {
            ForecastPeriod::Day => today.succ_opt(),
            ForecastPeriod::Month => {
                let (year, month) = if today.month() == 12 {
                    (today.year() + 1, 1)
                } else {
                    (today.year(), today.month() + 1)
                };
                NaiveDate::from_ymd_opt(year, month, 1)
            }
        };

        next.and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|dt| dt.and_utc())
            .unwrap_or(now)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Rising,
    Falling,
    Stable,
}

#[derive(Debug, Clone, Serialize)]
pub struct Forecast {
    pub period: ForecastPeriod,
    pub spent_so_far: f64,
    pub projected_total: f64,
    pub limit: f64,
    /// Spend rate over the forecast window, USD per hour
    pub hourly_rate: f64,
    pub trend: Trend,
    pub will_exceed_limit: bool,
    pub period_end: DateTime<Utc>,
}

impl std::fmt::Display for Forecast {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?}: ${:.4} spent, ${:.4} projected of ${:.4} ({:?}, ${:.4}/h){}",
            self.period,
            self.spent_so_far,
            self.projected_total,
            self.limit,
            self.trend,
            self.hourly_rate,
            if self.will_exceed_limit { " OVER LIMIT" } else { "" }
        )
    }
}

/// Linear projection: spent so far plus the recent rate over the time left
pub(crate) fn project<'a>(
    period: ForecastPeriod,
    spent: f64,
    limit: f64,
    records: impl Iterator<Item = &'a SpendRecord>,
    window: Duration,
    now: DateTime<Utc>,
) -> Forecast {
    let window = window.clamp(Duration::from_secs(1), MAX_FORECAST_WINDOW);
    let span = chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::hours(1));
    let start = now.checked_sub_signed(span).unwrap_or(DateTime::<Utc>::MIN_UTC);
    let midpoint = now - span / 2;

    let mut first_half = 0.0;
    let mut second_half = 0.0;
    for record in records.filter(|r| r.timestamp > start && r.timestamp <= now) {
        if record.timestamp <= midpoint {
            first_half += record.amount;
        } else {
            second_half += record.amount;
        }
    }

    let per_second = (first_half + second_half) / window.as_secs_f64();
    let period_end = period.end_after(now);
    let remaining = (period_end - now).num_seconds().max(0) as f64;
    let projected_total = spent + per_second * remaining;

    Forecast {
        period,
        spent_so_far: spent,
        projected_total,
        limit,
        hourly_rate: per_second * 3600.0,
        trend: trend(first_half, second_half),
        will_exceed_limit: projected_total > limit,
        period_end,
    }
}

fn trend(first_half: f64, second_half: f64) -> Trend {
    if first_half == 0.0 && second_half == 0.0 {
        return Trend::Stable;
    }
    if second_half > first_half * (1.0 + TREND_TOLERANCE) {
        Trend::Rising
    } else if second_half < first_half * (1.0 - TREND_TOLERANCE) {
        Trend::Falling
    } else {
        Trend::Stable
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(amount: f64, timestamp: DateTime<Utc>) -> SpendRecord {
        SpendRecord {
            service: "chat".to_string(),
            amount,
            timestamp,
            request_id: "req".to_string(),
        }
    }

    #[test]
    fn test_period_end() {
        let now = Utc.with_ymd_and_hms(2024, 12, 31, 15, 30, 0).unwrap();
        assert_eq!(
            ForecastPeriod::Day.end_after(now),
            Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
        );
        assert_eq!(
            ForecastPeriod::Month.end_after(now),
            Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_rising_projection() {
        let now = Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap();
        let records = vec![
            record(1.0, now - chrono::Duration::minutes(50)),
            record(3.0, now - chrono::Duration::minutes(10)),
            // Outside the window
            record(100.0, now - chrono::Duration::hours(3)),
        ];

        let forecast = project(
            ForecastPeriod::Day,
            10.0,
            50.0,
            records.iter(),
            Duration::from_secs(3600),
            now,
        );

        assert_eq!(forecast.trend, Trend::Rising);
        assert!((forecast.hourly_rate - 4.0).abs() < 1e-9);
        // 12 hours left at $4/h
        assert!((forecast.projected_total - 58.0).abs() < 1e-6);
        assert!(forecast.will_exceed_limit);
    }

    #[test]
    fn test_no_history_is_flat() {
        let now = Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap();
        let forecast = project(
            ForecastPeriod::Month,
            5.0,
            100.0,
            std::iter::empty(),
            Duration::from_secs(3600),
            now,
        );

        assert_eq!(forecast.trend, Trend::Stable);
        assert_eq!(forecast.projected_total, 5.0);
        assert!(!forecast.will_exceed_limit);
    }

    #[test]
    fn test_oversized_window_is_clamped() {
        let now = Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap();
        let records = vec![record(2.0, now - chrono::Duration::days(400))];

        let forecast = project(
            ForecastPeriod::Day,
            1.0,
            10.0,
            records.iter(),
            Duration::from_secs(u64::MAX),
            now,
        );

        assert_eq!(forecast.hourly_rate, 0.0);
        assert_eq!(forecast.projected_total, 1.0);
    }

    #[test]
    fn test_falling_trend() {
        assert_eq!(trend(5.0, 1.0), Trend::Falling);
        assert_eq!(trend(1.0, 1.1), Trend::Stable);
    }
}
