//! Request structures handed to the cost layer

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Caller-assigned priority of a request
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

impl Priority {
    /// High priority work is essential: it fails fast on denial instead of
    /// being parked, and is still admitted once a budget is exhausted as
    /// long as it fits under the hard cap.
    pub fn is_essential(&self) -> bool {
        matches!(self, Priority::High)
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "medium" => Ok(Priority::Medium),
            "high" => Ok(Priority::High),
            other => Err(format!("unknown priority '{}'", other)),
        }
    }
}

/// Invocation of a configured prompt template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateInvocation {
    pub id: String,
    #[serde(default)]
    pub variables: HashMap<String, String>,
}

impl TemplateInvocation {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            variables: HashMap::new(),
        }
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(name.into(), value.into());
        self
    }
}

/// Outbound payload for the inference provider
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    /// Static system-level instructions
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,

    /// The per-call prompt
    pub prompt: String,

    /// Template to expand in front of the prompt
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template: Option<TemplateInvocation>,

    /// Model override
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Maximum completion tokens
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl Payload {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_template(mut self, template: TemplateInvocation) -> Self {
        self.template = Some(template);
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Text that carries the meaning of the request, used for embeddings
    pub fn semantic_text(&self) -> String {
        match &self.system {
            Some(system) => format!("{}\n{}", system, self.prompt),
            None => self.prompt.clone(),
        }
    }
}

/// A unit of work submitted by application code
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessRequest {
    pub service_type: String,
    pub payload: Payload,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default = "enabled")]
    pub enable_cache: bool,
    #[serde(default = "enabled")]
    pub enable_batch: bool,
    /// Give up if the request is still queued after this long
    #[serde(skip)]
    pub timeout: Option<Duration>,
}

fn enabled() -> bool {
    true
}

impl ProcessRequest {
    pub fn new(service_type: impl Into<String>, payload: Payload) -> Self {
        Self {
            service_type: service_type.into(),
            payload,
            priority: Priority::default(),
            enable_cache: true,
            enable_batch: true,
            timeout: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn without_cache(mut self) -> Self {
        self.enable_cache = false;
        self
    }

    pub fn without_batch(mut self) -> Self {
        self.enable_batch = false;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::High > Priority::Medium);
        assert!(Priority::Medium > Priority::Low);
        assert!(Priority::High.is_essential());
        assert!(!Priority::Low.is_essential());
    }

    #[test]
    fn test_request_defaults_from_json() {
        let request: ProcessRequest = serde_json::from_str(
            r#"{"service_type": "chat", "payload": {"prompt": "hi"}}"#,
        )
        .unwrap();

        assert_eq!(request.priority, Priority::Medium);
        assert!(request.enable_cache);
        assert!(request.enable_batch);
        assert!(request.timeout.is_none());
    }

    #[test]
    fn test_priority_from_str() {
        assert_eq!("HIGH".parse::<Priority>().unwrap(), Priority::High);
        assert!("urgent".parse::<Priority>().is_err());
    }
}
