//! Prompt compression applied before a payload reaches cache or provider

mod strategies;
mod tokens;

pub use strategies::PromptOptimizer;
pub use tokens::count_tokens;

use crate::api::Payload;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum OptimizationError {
    #[error("Prompt template not found: {0}")]
    TemplateNotFound(String),

    #[error("Template '{template}' is missing variable '{variable}'")]
    MissingVariable { template: String, variable: String },
}

/// Configuration for optimization
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizationConfig {
    /// Strategies to apply (in order, repeated until stable)
    pub strategies: Vec<StrategyType>,
    /// Named templates that payloads can expand
    pub templates: Vec<PromptTemplate>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyType {
    /// Collapse runs of spaces and blank lines outside code blocks
    StripWhitespace,
    /// Drop lines that repeat an earlier line
    Deduplicate,
    /// Remove politeness filler that carries no instruction
    StripFiller,
    /// Move standing instructions out of the prompt into the system part
    ExtractSystem,
}

impl Default for OptimizationConfig {
    fn default() -> Self {
        Self {
            strategies: vec![
                StrategyType::StripWhitespace,
                StrategyType::Deduplicate,
                StrategyType::StripFiller,
                StrategyType::ExtractSystem,
            ],
            templates: Vec::new(),
        }
    }
}

/// A reusable prompt with `{{name}}` placeholders
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptTemplate {
    pub id: String,
    pub template_text: String,
    #[serde(default)]
    pub variable_names: Vec<String>,
}

impl PromptTemplate {
    pub fn new(id: impl Into<String>, template_text: impl Into<String>) -> Self {
        let template_text = template_text.into();
        let variable_names = placeholder_names(&template_text);
        Self {
            id: id.into(),
            template_text,
            variable_names,
        }
    }

    /// Names a rendering must supply; read from the text when none are listed
    pub fn variables(&self) -> Cow<'_, [String]> {
        if self.variable_names.is_empty() {
            Cow::Owned(placeholder_names(&self.template_text))
        } else {
            Cow::Borrowed(&self.variable_names)
        }
    }
}

/// Collect `{{name}}` placeholders in order of first appearance
fn placeholder_names(text: &str) -> Vec<String> {
    let mut names = Vec::new();
    let mut rest = text;

    while let Some(start) = rest.find("{{") {
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            break;
        };
        let name = after[..end].trim().to_string();
        if !name.is_empty() && !names.contains(&name) {
            names.push(name);
        }
        rest = &after[end + 2..];
    }

    names
}

/// Statistics about optimization results
#[derive(Debug, Clone, Default)]
pub struct OptimizationStats {
    pub original_tokens: usize,
    pub optimized_tokens: usize,
    pub tokens_saved: usize,
    pub compression_ratio: f32,
    pub strategies_applied: Vec<StrategyType>,
}

impl OptimizationStats {
    pub fn new(original: usize, optimized: usize) -> Self {
        let saved = original.saturating_sub(optimized);
        let ratio = if original > 0 {
            optimized as f32 / original as f32
        } else {
            1.0
        };

        Self {
            original_tokens: original,
            optimized_tokens: optimized,
            tokens_saved: saved,
            compression_ratio: ratio,
            strategies_applied: Vec::new(),
        }
    }
}

/// Output of [`PromptOptimizer::optimize`]
#[derive(Debug, Clone)]
pub struct OptimizedPrompt {
    pub payload: Payload,
    pub stats: OptimizationStats,
}

impl OptimizedPrompt {
    pub fn tokens_saved(&self) -> usize {
        self.stats.tokens_saved
    }
}
