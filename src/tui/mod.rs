//! Terminal output for the CLI
//!
//! Reports are rendered from markdown through termimad; single-line
//! results and alerts are styled with crossterm.

pub mod renderer;
pub mod theme;

pub use renderer::TerminalRenderer;
pub use theme::Theme;
