//! Point-in-time report for dashboards and the CLI

use super::UsageMetrics;
use crate::batch::BatchStats;
use crate::budget::{BudgetState, Forecast};
use crate::cache::CacheMetrics;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write as _;

/// Budget status per service, cache efficiency, usage and forecasts
#[derive(Debug, Clone, Serialize)]
pub struct CostReport {
    pub generated_at: DateTime<Utc>,
    /// Global envelope first
    pub budgets: Vec<BudgetState>,
    pub spend_breakdown: BTreeMap<String, f64>,
    pub cache: CacheMetrics,
    pub batching: BatchStats,
    pub usage: UsageMetrics,
    pub daily_forecast: Forecast,
    pub monthly_forecast: Forecast,
    /// Requests parked until `resume_deferred`
    pub deferred_requests: usize,
}

impl CostReport {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Markdown rendering, suitable for termimad
    pub fn to_markdown(&self) -> String {
        let mut out = String::new();

        let _ = writeln!(out, "# Cost report");
        let _ = writeln!(out, "*{}*\n", self.generated_at.format("%Y-%m-%d %H:%M:%S UTC"));

        let _ = writeln!(out, "## Budgets\n");
        let _ = writeln!(out, "|scope|status|daily|monthly|reserved|");
        let _ = writeln!(out, "|:-|:-:|-:|-:|-:|");
        for state in &self.budgets {
            let _ = writeln!(
                out,
                "|{}|{}|${:.4} / ${:.2} ({:.0}%)|${:.4} / ${:.2}|${:.4}|",
                state.service,
                state.status,
                state.daily_spent,
                state.daily_limit,
                state.daily_ratio() * 100.0,
                state.monthly_spent,
                state.monthly_limit,
                state.reserved
            );
        }

        if !self.spend_breakdown.is_empty() {
            let _ = writeln!(out, "\n## Spend by service\n");
            let _ = writeln!(out, "|service|spend|");
            let _ = writeln!(out, "|:-|-:|");
            for (service, amount) in &self.spend_breakdown {
                let _ = writeln!(out, "|{}|${:.4}|", service, amount);
            }
        }

        let _ = writeln!(out, "\n## Cache\n");
        let _ = writeln!(
            out,
            "* hit rate: **{:.1}%** ({} exact, {} semantic, {} misses)",
            self.cache.hit_rate * 100.0,
            self.cache.exact_hits,
            self.cache.semantic_hits,
            self.cache.cache_misses
        );
        let _ = writeln!(
            out,
            "* entries: {} (~{} bytes), evictions: {}, expirations: {}",
            self.cache.entries, self.cache.bytes_stored, self.cache.evictions, self.cache.expirations
        );
        let _ = writeln!(out, "* cost saved: **${:.4}**", self.cache.cost_saved);

        let _ = writeln!(out, "\n## Batching\n");
        let _ = writeln!(
            out,
            "* {} batches, {} requests, average size {:.1}, largest {}",
            self.batching.batches_dispatched,
            self.batching.items_dispatched,
            self.batching.average_batch_size(),
            self.batching.largest_batch
        );

        let _ = writeln!(out, "\n## Usage\n");
        let _ = writeln!(
            out,
            "* requests: {}, failed: {}, denied: {}, deferred: {} ({} waiting)",
            self.usage.requests,
            self.usage.failed,
            self.usage.denied,
            self.usage.deferred,
            self.deferred_requests
        );
        let _ = writeln!(
            out,
            "* tokens saved by optimization: {}",
            self.usage.tokens_saved
        );
        let _ = writeln!(out, "* total cost: **${:.4}**", self.usage.total_cost);

        let _ = writeln!(out, "\n## Forecast\n");
        for forecast in [&self.daily_forecast, &self.monthly_forecast] {
            let _ = writeln!(out, "* {}", forecast);
        }

        out
    }
}

impl std::fmt::Display for CostReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "=== Budgets ===")?;
        for state in &self.budgets {
            writeln!(
                f,
                "{}: {} | daily ${:.4}/${:.2} | monthly ${:.4}/${:.2}",
                state.service,
                state.status,
                state.daily_spent,
                state.daily_limit,
                state.monthly_spent,
                state.monthly_limit
            )?;
        }
        writeln!(f)?;
        write!(f, "{}", self.cache)?;
        writeln!(f)?;
        write!(f, "{}", self.usage)?;
        writeln!(f)?;
        writeln!(f, "=== Forecast ===")?;
        writeln!(f, "{}", self.daily_forecast)?;
        writeln!(f, "{}", self.monthly_forecast)?;
        Ok(())
    }
}
