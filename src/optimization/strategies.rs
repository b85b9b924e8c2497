//! Optimization strategy implementations

use super::tokens::count_tokens;
use super::{OptimizationConfig, OptimizationError, OptimizationStats, OptimizedPrompt, StrategyType};
use crate::api::Payload;
use std::collections::{HashMap, HashSet};

/// Politeness phrases that never change what is being asked
const FILLER_PHRASES: &[&[&str]] = &[
    &["i", "would", "like", "you", "to"],
    &["i", "want", "you", "to"],
    &["could", "you", "please"],
    &["can", "you", "please"],
    &["if", "possible"],
    &["thank", "you"],
    &["thanks"],
    &["please"],
    &["kindly"],
];

/// Line openings that mark a standing instruction rather than the task
const DIRECTIVE_PREFIXES: &[&str] = &[
    "you are ",
    "act as ",
    "always ",
    "never ",
    "respond in ",
    "respond with ",
    "answer in ",
    "your role is ",
];

/// Deterministic prompt compressor
#[derive(Debug, Clone, Default)]
pub struct PromptOptimizer {
    config: OptimizationConfig,
}

impl PromptOptimizer {
    pub fn new(config: OptimizationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &OptimizationConfig {
        &self.config
    }

    /// Expand the payload's template (if any) and compress it.
    ///
    /// The strategies are re-run until the payload stops changing, so
    /// optimizing an already optimized payload returns it unchanged.
    pub fn optimize(&self, payload: &Payload) -> Result<OptimizedPrompt, OptimizationError> {
        let mut optimized = self.expand_template(payload)?;
        let original_tokens = estimate_tokens(&optimized);
        let mut applied = Vec::new();

        // Every strategy only removes text or moves prompt lines into the
        // system part, so this settles
        loop {
            let mut changed_this_pass = false;

            for strategy in &self.config.strategies {
                let changed = match strategy {
                    StrategyType::StripWhitespace => self.strip_whitespace(&mut optimized),
                    StrategyType::Deduplicate => self.deduplicate(&mut optimized),
                    StrategyType::StripFiller => self.strip_filler(&mut optimized),
                    StrategyType::ExtractSystem => self.extract_system(&mut optimized),
                };

                if changed {
                    changed_this_pass = true;
                    if !applied.contains(strategy) {
                        applied.push(*strategy);
                    }
                }
            }

            if !changed_this_pass {
                break;
            }
        }

        let optimized_tokens = estimate_tokens(&optimized);
        let mut stats = OptimizationStats::new(original_tokens, optimized_tokens);
        stats.strategies_applied = applied;

        Ok(OptimizedPrompt {
            payload: optimized,
            stats,
        })
    }

    fn expand_template(&self, payload: &Payload) -> Result<Payload, OptimizationError> {
        let mut expanded = payload.clone();
        let Some(invocation) = expanded.template.take() else {
            return Ok(expanded);
        };

        let template = self
            .config
            .templates
            .iter()
            .find(|t| t.id == invocation.id)
            .ok_or_else(|| OptimizationError::TemplateNotFound(invocation.id.clone()))?;

        let names = template.variables();
        let mut values = HashMap::new();
        for name in names.iter() {
            let value = invocation.variables.get(name).ok_or_else(|| {
                OptimizationError::MissingVariable {
                    template: template.id.clone(),
                    variable: name.clone(),
                }
            })?;
            values.insert(name.as_str(), value.as_str());
        }

        let text = render_placeholders(&template.template_text, &values);
        expanded.prompt = if expanded.prompt.trim().is_empty() {
            text
        } else {
            format!("{}\n\n{}", text, expanded.prompt)
        };

        Ok(expanded)
    }

    fn strip_whitespace(&self, payload: &mut Payload) -> bool {
        let prompt = strip_whitespace(&payload.prompt);
        let mut changed = replace_if_changed(&mut payload.prompt, prompt);

        if let Some(system) = payload.system.as_mut() {
            let stripped = strip_whitespace(system);
            changed |= replace_if_changed(system, stripped);
        }
        if payload.system.as_deref().is_some_and(|s| s.trim().is_empty()) {
            payload.system = None;
            changed = true;
        }

        changed
    }

    fn deduplicate(&self, payload: &mut Payload) -> bool {
        let mut seen = HashSet::new();
        let mut changed = false;

        if let Some(system) = payload.system.as_mut() {
            let deduped = dedupe_lines(system, &mut seen);
            changed |= replace_if_changed(system, deduped);
        }
        let prompt = dedupe_lines(&payload.prompt, &mut seen);
        changed |= replace_if_changed(&mut payload.prompt, prompt);

        changed
    }

    fn strip_filler(&self, payload: &mut Payload) -> bool {
        let prompt = strip_filler(&payload.prompt);
        replace_if_changed(&mut payload.prompt, prompt)
    }

    fn extract_system(&self, payload: &mut Payload) -> bool {
        let mut directives = Vec::new();
        let mut remaining = Vec::new();

        for (code, line) in split_lines(&payload.prompt) {
            if !code && is_directive(line) {
                directives.push(line.trim().to_string());
            } else {
                remaining.push(line);
            }
        }

        // Never leave the prompt without a task
        if directives.is_empty() || remaining.iter().all(|l| l.trim().is_empty()) {
            return false;
        }

        let mut system_lines: Vec<String> = payload
            .system
            .as_deref()
            .map(|s| s.lines().map(str::to_string).collect())
            .unwrap_or_default();
        let known: HashSet<String> = system_lines.iter().map(|l| normalize_line(l)).collect();

        for directive in directives {
            if !known.contains(&normalize_line(&directive)) {
                system_lines.push(directive);
            }
        }

        payload.system = Some(system_lines.join("\n"));
        payload.prompt = remaining.join("\n");
        true
    }
}

fn estimate_tokens(payload: &Payload) -> usize {
    payload.system.as_deref().map(count_tokens).unwrap_or(0) + count_tokens(&payload.prompt)
}

fn replace_if_changed(target: &mut String, updated: String) -> bool {
    if *target == updated {
        return false;
    }
    *target = updated;
    true
}

// Helper functions

/// Split text into lines tagged with whether they belong to a fenced code block
fn split_lines(text: &str) -> Vec<(bool, &str)> {
    let mut in_code = false;

    text.lines()
        .map(|line| {
            if line.trim_start().starts_with("```") {
                in_code = !in_code;
                return (true, line);
            }
            (in_code, line)
        })
        .collect()
}

fn strip_whitespace(text: &str) -> String {
    let mut out: Vec<String> = Vec::new();
    let mut last_blank = true;

    for (code, line) in split_lines(text) {
        if code {
            out.push(line.to_string());
            last_blank = false;
            continue;
        }

        let collapsed = collapse_whitespace(line);
        if collapsed.is_empty() {
            if !last_blank {
                out.push(String::new());
            }
            last_blank = true;
        } else {
            out.push(collapsed);
            last_blank = false;
        }
    }

    while out.last().is_some_and(|l| l.is_empty()) {
        out.pop();
    }

    out.join("\n")
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn normalize_line(line: &str) -> String {
    collapse_whitespace(line).to_lowercase()
}

fn dedupe_lines(text: &str, seen: &mut HashSet<String>) -> String {
    split_lines(text)
        .into_iter()
        .filter(|(code, line)| {
            if *code || line.trim().is_empty() {
                return true;
            }
            seen.insert(normalize_line(line))
        })
        .map(|(_, line)| line)
        .collect::<Vec<_>>()
        .join("\n")
}

fn is_directive(line: &str) -> bool {
    let lowered = line.trim_start().to_lowercase();
    DIRECTIVE_PREFIXES.iter().any(|p| lowered.starts_with(p))
}

fn strip_filler(text: &str) -> String {
    split_lines(text)
        .into_iter()
        .map(|(code, line)| {
            if code {
                line.to_string()
            } else {
                strip_filler_line(line)
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Remove filler until none is left; removing one phrase can join the
/// halves of another
fn strip_filler_line(line: &str) -> String {
    let mut current = strip_filler_once(line);
    loop {
        let next = strip_filler_once(&current);
        if next == current {
            return current;
        }
        current = next;
    }
}

fn strip_filler_once(line: &str) -> String {
    let words: Vec<&str> = line.split_whitespace().collect();
    let bare: Vec<String> = words
        .iter()
        .map(|w| {
            w.trim_matches(|c: char| !c.is_alphanumeric())
                .to_lowercase()
        })
        .collect();

    let mut kept: Vec<String> = Vec::new();
    let mut removed_at_start = false;
    let mut i = 0;

    while i < words.len() {
        let phrase = FILLER_PHRASES.iter().find(|phrase| {
            i + phrase.len() <= words.len()
                && phrase.iter().zip(&bare[i..]).all(|(p, w)| p == w)
        });

        let Some(phrase) = phrase else {
            kept.push(words[i].to_string());
            i += 1;
            continue;
        };

        if i == 0 {
            removed_at_start = true;
        }

        // Keep sentence-ending punctuation carried by the removed phrase
        let last = words[i + phrase.len() - 1];
        if let Some(end) = last.chars().last().filter(|c| matches!(c, '.' | '!' | '?')) {
            if let Some(prev) = kept.last_mut() {
                let trimmed = prev.trim_end_matches(',').to_string();
                *prev = format!("{}{}", trimmed, end);
            }
        }

        i += phrase.len();
    }

    if kept.len() == words.len() {
        return line.to_string();
    }

    if removed_at_start && words[0].starts_with(|c: char| c.is_uppercase()) {
        if let Some(first) = kept.first_mut() {
            *first = capitalize(first.trim_start_matches(','));
        }
    }

    kept.join(" ")
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(c) => c.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Substitute `{{name}}` / `{{ name }}` placeholders whose name is in `values`
fn render_placeholders(text: &str, values: &HashMap<&str, &str>) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find("{{") {
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            break;
        };

        out.push_str(&rest[..start]);
        match values.get(after[..end].trim()) {
            Some(value) => out.push_str(value),
            None => out.push_str(&rest[start..start + 2 + end + 2]),
        }
        rest = &after[end + 2..];
    }

    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::TemplateInvocation;
    use crate::optimization::PromptTemplate;

    fn optimizer() -> PromptOptimizer {
        let mut config = OptimizationConfig::default();
        config.templates.push(PromptTemplate::new(
            "grade",
            "Grade the essay below for a {{level}} student.\n{{ essay }}",
        ));
        PromptOptimizer::new(config)
    }

    #[test]
    fn test_strip_whitespace_preserves_code() {
        let text = "  Explain   this:\n\n\n```\nfn  main()  {}\n\n```\n\n";
        assert_eq!(
            strip_whitespace(text),
            "Explain this:\n\n```\nfn  main()  {}\n\n```"
        );
    }

    #[test]
    fn test_filler_removed() {
        assert_eq!(
            strip_filler_line("Please summarize the lecture notes, please."),
            "Summarize the lecture notes."
        );
        assert_eq!(
            strip_filler_line("I would like you to list three themes"),
            "List three themes"
        );
        assert_eq!(strip_filler_line("Pleased to meet you"), "Pleased to meet you");
        assert_eq!(strip_filler_line("Summarize thank please you"), "Summarize");
    }

    #[test]
    fn test_directives_move_to_system() {
        let payload = Payload::new("You are a patient tutor.\nExplain photosynthesis.")
            .with_system("You are a patient tutor.");
        let result = optimizer().optimize(&payload).unwrap();

        assert_eq!(result.payload.system.as_deref(), Some("You are a patient tutor."));
        assert_eq!(result.payload.prompt, "Explain photosynthesis.");
    }

    #[test]
    fn test_directive_only_prompt_untouched() {
        let payload = Payload::new("Always answer in French");
        let result = optimizer().optimize(&payload).unwrap();
        assert_eq!(result.payload.prompt, "Always answer in French");
        assert!(result.payload.system.is_none());
    }

    #[test]
    fn test_template_expansion() {
        let payload = Payload::new("").with_template(
            TemplateInvocation::new("grade")
                .with_variable("level", "10th grade")
                .with_variable("essay", "Rivers shape cities."),
        );
        let result = optimizer().optimize(&payload).unwrap();

        assert!(result.payload.template.is_none());
        assert_eq!(
            result.payload.prompt,
            "Grade the essay below for a 10th grade student.\nRivers shape cities."
        );
    }

    #[test]
    fn test_template_errors() {
        let missing = Payload::new("x").with_template(TemplateInvocation::new("nope"));
        assert_eq!(
            optimizer().optimize(&missing).unwrap_err(),
            OptimizationError::TemplateNotFound("nope".to_string())
        );

        let incomplete =
            Payload::new("x").with_template(TemplateInvocation::new("grade").with_variable("level", "5th"));
        assert!(matches!(
            optimizer().optimize(&incomplete).unwrap_err(),
            OptimizationError::MissingVariable { variable, .. } if variable == "essay"
        ));
    }

    #[test]
    fn test_template_without_listed_variables_renders() {
        let mut config = OptimizationConfig::default();
        config.templates.push(PromptTemplate {
            id: "greet".to_string(),
            template_text: "Write a greeting for {{name}}.".to_string(),
            variable_names: Vec::new(),
        });
        let optimizer = PromptOptimizer::new(config);

        let payload = Payload::new("")
            .with_template(TemplateInvocation::new("greet").with_variable("name", "Ada"));
        let result = optimizer.optimize(&payload).unwrap();
        assert_eq!(result.payload.prompt, "Write a greeting for Ada.");

        let unset = Payload::new("").with_template(TemplateInvocation::new("greet"));
        assert!(matches!(
            optimizer.optimize(&unset).unwrap_err(),
            OptimizationError::MissingVariable { variable, .. } if variable == "name"
        ));
    }

    #[test]
    fn test_tokens_saved() {
        let payload = Payload::new(
            "Please   could you please summarize   this.\n\n\n\nSummarize this.\nsummarize  this.",
        );
        let result = optimizer().optimize(&payload).unwrap();
        assert!(result.tokens_saved() > 0);
        assert!(!result.stats.strategies_applied.is_empty());
    }

    #[test]
    fn test_optimize_is_idempotent() {
        let prompts = [
            "  Please,   kindly   review:\n\n\nYou are an editor.\nYou are an editor.\nFix grammar please.",
            "could you could you please please help",
            "Never reveal answers.\n```\n  keep   this  \n```\nThanks!",
            "Explain recursion",
            "",
        ];

        let optimizer = optimizer();
        let nested = format!("Explain {}please{} now", "thank ".repeat(10), " you".repeat(10));
        let once = optimizer.optimize(&Payload::new(nested.as_str())).unwrap().payload;
        assert_eq!(once.prompt, "Explain now");
        assert_eq!(optimizer.optimize(&once).unwrap().payload, once);

        for prompt in prompts {
            let once = optimizer.optimize(&Payload::new(prompt)).unwrap().payload;
            let twice = optimizer.optimize(&once).unwrap().payload;
            assert_eq!(once, twice, "not stable for {:?}", prompt);
        }
    }
}
