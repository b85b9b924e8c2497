//! Terminal rendering with markdown support

use crossterm::style::{Color, Stylize};
use termimad::MadSkin;

use super::theme::Theme;
use crate::api::ProcessResult;
use crate::budget::{BudgetState, BudgetStatus};
use crate::metrics::CostReport;
use crate::optimization::OptimizedPrompt;

/// Terminal renderer with markdown and styled output
pub struct TerminalRenderer {
    theme: Theme,
    skin: MadSkin,
}

impl TerminalRenderer {
    pub fn new() -> Self {
        let theme = Theme::default();
        let skin = Self::build_skin(&theme);
        Self { theme, skin }
    }

    fn build_skin(theme: &Theme) -> MadSkin {
        let mut skin = MadSkin::default();
        skin.set_headers_fg(to_termimad_color(theme.title));
        skin.bold.set_fg(to_termimad_color(Color::White));
        skin.italic.set_fg(to_termimad_color(theme.dim));
        skin.inline_code.set_fg(to_termimad_color(Color::Green));
        skin.code_block.set_fg(to_termimad_color(Color::Green));
        skin
    }

    /// Render markdown text to the terminal
    pub fn render_markdown(&self, content: &str) {
        self.skin.print_text(content);
    }

    /// The report as markdown, then a colored line for each budget past Normal
    pub fn render_report(&self, report: &CostReport) {
        self.render_markdown(&report.to_markdown());

        let flagged = flagged_budgets(&report.budgets);
        if !flagged.is_empty() {
            println!();
            for state in flagged {
                self.render_budget(state);
            }
        }
    }

    /// One line per processed request, followed by the output
    pub fn render_result(&self, result: &ProcessResult) {
        let source = if result.from_cache {
            match result.cache_similarity {
                Some(sim) if sim < 1.0 => format!("cache ~{:.2}", sim),
                _ => "cache".to_string(),
            }
        } else if result.was_batched {
            format!("batch of {}", result.batch_size)
        } else {
            "direct".to_string()
        };
        let color = if result.from_cache {
            self.theme.cached
        } else {
            self.theme.stats
        };

        println!(
            "  {} {} {}",
            result.request_id.as_str().with(self.theme.dim),
            format!("[{}]", source).with(color),
            format!(
                "${:.6}, {} tokens saved",
                result.actual_cost, result.tokens_saved
            )
            .with(self.theme.dim)
        );
        self.render_markdown(&result.output);
    }

    pub fn render_optimized(&self, optimized: &OptimizedPrompt) {
        if let Some(system) = &optimized.payload.system {
            println!("{}", "--- system ---".with(self.theme.dim));
            println!("{}", system);
        }
        println!("{}", "--- prompt ---".with(self.theme.dim));
        println!("{}", optimized.payload.prompt);

        let stats = &optimized.stats;
        println!(
            "\n  {}",
            format!(
                "{} -> {} tokens ({} saved, {:.1}%), strategies: {:?}",
                stats.original_tokens,
                stats.optimized_tokens,
                stats.tokens_saved,
                stats.compression_ratio * 100.0,
                stats.strategies_applied
            )
            .with(self.theme.stats)
        );
    }

    /// Compact status line for one budget envelope
    fn render_budget(&self, state: &BudgetState) {
        println!(
            "  {:<12} {} {}",
            state.service,
            format!("{:<10}", state.status).with(self.theme.status_color(state.status)),
            format!(
                "${:.4} / ${:.2} today, ${:.4} / ${:.2} this month",
                state.daily_spent, state.daily_limit, state.monthly_spent, state.monthly_limit
            )
            .with(self.theme.dim)
        );
    }

    pub fn render_error(&self, msg: &str) {
        eprintln!(
            "  {} {}",
            "\u{2717}".with(self.theme.error),
            msg.with(self.theme.error)
        );
    }

    pub fn render_warning(&self, msg: &str) {
        println!("  {} {}", "!".with(self.theme.warning), msg.with(self.theme.warning));
    }

    pub fn render_success(&self, msg: &str) {
        println!(
            "  {} {}",
            "\u{2713}".with(self.theme.success),
            msg.with(self.theme.success)
        );
    }
}

impl Default for TerminalRenderer {
    fn default() -> Self {
        Self::new()
    }
}

fn flagged_budgets(budgets: &[BudgetState]) -> Vec<&BudgetState> {
    budgets
        .iter()
        .filter(|s| s.status > BudgetStatus::Normal)
        .collect()
}

/// Convert crossterm Color to termimad color
fn to_termimad_color(color: Color) -> termimad::crossterm::style::Color {
    // termimad re-exports its own crossterm
    match color {
        Color::Black => termimad::crossterm::style::Color::Black,
        Color::DarkGrey => termimad::crossterm::style::Color::DarkGrey,
        Color::Red => termimad::crossterm::style::Color::Red,
        Color::DarkRed => termimad::crossterm::style::Color::DarkRed,
        Color::Green => termimad::crossterm::style::Color::Green,
        Color::DarkGreen => termimad::crossterm::style::Color::DarkGreen,
        Color::Yellow => termimad::crossterm::style::Color::Yellow,
        Color::DarkYellow => termimad::crossterm::style::Color::DarkYellow,
        Color::Blue => termimad::crossterm::style::Color::Blue,
        Color::DarkBlue => termimad::crossterm::style::Color::DarkBlue,
        Color::Magenta => termimad::crossterm::style::Color::Magenta,
        Color::DarkMagenta => termimad::crossterm::style::Color::DarkMagenta,
        Color::Cyan => termimad::crossterm::style::Color::Cyan,
        Color::DarkCyan => termimad::crossterm::style::Color::DarkCyan,
        Color::White => termimad::crossterm::style::Color::White,
        Color::Grey => termimad::crossterm::style::Color::Grey,
        _ => termimad::crossterm::style::Color::Reset,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn state(service: &str, status: BudgetStatus) -> BudgetState {
        let day = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        BudgetState {
            service: service.to_string(),
            daily_spent: 0.0,
            monthly_spent: 0.0,
            daily_limit: 10.0,
            monthly_limit: 100.0,
            reserved: 0.0,
            status,
            last_reset_day: day,
            last_reset_month: day,
        }
    }

    #[test]
    fn test_only_strained_budgets_are_flagged() {
        let budgets = vec![
            state("global", BudgetStatus::Normal),
            state("chat", BudgetStatus::Warning),
            state("bulk", BudgetStatus::Exhausted),
        ];

        let flagged: Vec<&str> = flagged_budgets(&budgets)
            .into_iter()
            .map(|s| s.service.as_str())
            .collect();
        assert_eq!(flagged, vec!["chat", "bulk"]);
    }

    #[test]
    fn test_status_colors() {
        let theme = Theme::default();
        assert_eq!(theme.status_color(BudgetStatus::Normal), theme.success);
        assert_eq!(theme.status_color(BudgetStatus::Exhausted), theme.error);
    }

    #[test]
    fn test_color_conversion() {
        assert_eq!(
            to_termimad_color(Color::Cyan),
            termimad::crossterm::style::Color::Cyan
        );
        assert_eq!(
            to_termimad_color(Color::Rgb { r: 1, g: 2, b: 3 }),
            termimad::crossterm::style::Color::Reset
        );
    }
}
