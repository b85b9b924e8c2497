//! Terminal theme and color definitions

use crate::budget::BudgetStatus;
use crossterm::style::Color;

/// Theme colors for CLI output
pub struct Theme {
    /// Report headers
    pub title: Color,
    /// Secondary info
    pub dim: Color,
    pub error: Color,
    pub success: Color,
    /// Results served from cache
    pub cached: Color,
    /// Cost and token numbers
    pub stats: Color,
    /// Budget warnings
    pub warning: Color,
}

impl Theme {
    /// Color used for a budget status
    pub fn status_color(&self, status: BudgetStatus) -> Color {
        match status {
            BudgetStatus::Normal => self.success,
            BudgetStatus::Warning => self.warning,
            BudgetStatus::Critical | BudgetStatus::Throttled => Color::DarkYellow,
            BudgetStatus::Exhausted => self.error,
        }
    }
}

impl Default for Theme {
    fn default() -> Self {
        Self {
            title: Color::Magenta,
            dim: Color::DarkGrey,
            error: Color::Red,
            success: Color::Green,
            cached: Color::Cyan,
            stats: Color::Blue,
            warning: Color::Yellow,
        }
    }
}
