//! Configuration management for spend-guard
//!
//! Supports configuration via:
//! 1. Config file (~/.config/spend-guard/config.toml)
//! 2. Environment variables (SPEND_GUARD_API_KEY, SPEND_GUARD_BASE_URL, SPEND_GUARD_MODEL)
//! 3. CLI arguments (override file/env settings)

use crate::api::TokenUsage;
use crate::batch::BatchPolicy;
use crate::budget::{AlertThresholds, BudgetLimits, BudgetOptions, MAX_FORECAST_WINDOW};
use crate::cache::{CachePolicy, EvictionStrategy, DEFAULT_SIMILARITY_THRESHOLD};
use crate::optimization::{OptimizationConfig, PromptTemplate};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to read config: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),

    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Global envelope and alerting
    pub budget: BudgetSettings,

    /// Result cache
    pub cache: CacheSettings,

    /// Prompt optimization
    pub optimization: OptimizationConfig,

    /// Inference provider
    pub upstream: UpstreamSettings,

    /// Per service type budgets, batching and pricing
    pub services: BTreeMap<String, ServiceSettings>,
}

impl Default for Config {
    fn default() -> Self {
        let mut services = BTreeMap::new();
        services.insert("chat".to_string(), ServiceSettings::default());
        services.insert(
            "bulk".to_string(),
            ServiceSettings {
                daily_limit: 50.0,
                monthly_limit: 1000.0,
                batchable: true,
                max_batch_size: 16,
                max_wait_ms: 200,
                ..ServiceSettings::default()
            },
        );

        Self {
            budget: BudgetSettings::default(),
            cache: CacheSettings::default(),
            optimization: OptimizationConfig::default(),
            upstream: UpstreamSettings::default(),
            services,
        }
    }
}

/// Global budget settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetSettings {
    /// Daily ceiling across all services (USD)
    pub daily_limit: f64,

    /// Monthly ceiling across all services (USD)
    pub monthly_limit: f64,

    /// Alert tiers as fractions of the daily limit
    pub alerts: AlertThresholds,

    /// Delay applied to admissions once a budget is throttled
    pub throttle_delay_ms: u64,

    /// How often the reset loop checks for day/month boundaries
    pub reset_check_interval_secs: u64,

    /// Spend records kept for forecasts and breakdowns
    pub history_retention: usize,

    /// Look-back window for the spend rate used in forecasts
    pub forecast_window_secs: u64,

    /// Deferred requests held at once; further best-effort denials are refused
    pub max_deferred: usize,
}

impl Default for BudgetSettings {
    fn default() -> Self {
        Self {
            daily_limit: 100.0,
            monthly_limit: 2000.0,
            alerts: AlertThresholds::default(),
            throttle_delay_ms: 500,
            reset_check_interval_secs: 60,
            history_retention: 10_000,
            forecast_window_secs: 3600,
            max_deferred: 1000,
        }
    }
}

impl BudgetSettings {
    pub fn limits(&self) -> BudgetLimits {
        BudgetLimits {
            daily_limit: self.daily_limit,
            monthly_limit: self.monthly_limit,
        }
    }

    pub fn options(&self) -> BudgetOptions {
        BudgetOptions {
            thresholds: self.alerts,
            throttle_delay: Duration::from_millis(self.throttle_delay_ms),
            history_retention: self.history_retention,
            forecast_window: Duration::from_secs(self.forecast_window_secs),
        }
    }
}

/// Cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Disable to send every request upstream
    pub enabled: bool,

    /// Maximum number of entries
    pub max_size: usize,

    /// TTL for entries of services without their own
    pub default_ttl_secs: u64,

    /// Eviction strategy (lru, lfu)
    pub eviction: EvictionStrategy,

    /// Minimum cosine similarity for a semantic hit (0.0 - 1.0)
    pub similarity_threshold: f32,

    /// Match paraphrases by embedding, not only exact keys
    pub semantic_matching: bool,

    /// Vector size of the built-in embedder
    pub embedding_dimensions: usize,

    /// Interval of the expired-entry sweep
    pub sweep_interval_secs: u64,

    /// Number of lock stripes
    pub shards: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_size: 10_000,
            default_ttl_secs: 3600,
            eviction: EvictionStrategy::Lru,
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            semantic_matching: true,
            embedding_dimensions: 256,
            sweep_interval_secs: 120,
            shards: 16,
        }
    }
}

impl From<&CacheSettings> for CachePolicy {
    fn from(settings: &CacheSettings) -> Self {
        CachePolicy {
            max_size: settings.max_size,
            default_ttl: Duration::from_secs(settings.default_ttl_secs),
            eviction: settings.eviction,
            similarity_threshold: settings.similarity_threshold,
            semantic_matching: settings.semantic_matching,
        }
    }
}

/// Inference provider settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamSettings {
    /// Base URL of an OpenAI-compatible API
    pub base_url: String,

    /// API key (can also use SPEND_GUARD_API_KEY env var)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Default model to use
    pub model: String,

    /// Per-call timeout
    pub timeout_secs: u64,

    /// Concurrent calls used to execute one batch
    pub max_concurrency: usize,
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            timeout_secs: 60,
            max_concurrency: 4,
        }
    }
}

/// Settings of one service type
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceSettings {
    /// Daily ceiling for this service (USD)
    pub daily_limit: f64,

    /// Monthly ceiling for this service (USD)
    pub monthly_limit: f64,

    /// Whether requests may wait to be grouped
    pub batchable: bool,

    pub max_batch_size: usize,

    pub max_wait_ms: u64,

    /// Price per 1k prompt tokens (USD)
    pub cost_per_1k_input: f64,

    /// Price per 1k completion tokens (USD)
    pub cost_per_1k_output: f64,

    /// Completion size assumed when estimating cost
    pub expected_output_tokens: u32,

    /// Overrides the cache default TTL
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_ttl_secs: Option<u64>,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            daily_limit: 20.0,
            monthly_limit: 400.0,
            batchable: false,
            max_batch_size: 8,
            max_wait_ms: 50,
            cost_per_1k_input: 0.00015,
            cost_per_1k_output: 0.0006,
            expected_output_tokens: 256,
            cache_ttl_secs: None,
        }
    }
}

impl ServiceSettings {
    pub fn limits(&self) -> BudgetLimits {
        BudgetLimits {
            daily_limit: self.daily_limit,
            monthly_limit: self.monthly_limit,
        }
    }

    pub fn batch_policy(&self) -> BatchPolicy {
        BatchPolicy {
            batchable: self.batchable,
            max_batch_size: self.max_batch_size,
            max_wait: Duration::from_millis(self.max_wait_ms),
        }
    }

    /// Cost of `prompt_tokens` plus the expected completion
    pub fn estimate_cost(&self, prompt_tokens: usize) -> f64 {
        (prompt_tokens as f64 / 1000.0) * self.cost_per_1k_input
            + (self.expected_output_tokens as f64 / 1000.0) * self.cost_per_1k_output
    }

    /// Provider-reported cost, or the price list applied to reported usage
    pub fn cost_for(&self, usage: &TokenUsage) -> f64 {
        usage.estimated_cost_usd.unwrap_or_else(|| {
            (usage.prompt_tokens as f64 / 1000.0) * self.cost_per_1k_input
                + (usage.completion_tokens as f64 / 1000.0) * self.cost_per_1k_output
        })
    }

    pub fn cache_ttl(&self) -> Option<Duration> {
        self.cache_ttl_secs.map(Duration::from_secs)
    }
}

impl Config {
    /// Get default config file path
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("spend-guard")
            .join("config.toml")
    }

    /// Load config from default location
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(Self::default_path())
    }

    /// Load config from specific path; a missing file yields the defaults
    pub fn load_from(path: PathBuf) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default().with_env_overrides());
        }

        let content = std::fs::read_to_string(&path)?;
        let config: Config = toml::from_str(&content)?;

        Ok(config.with_env_overrides())
    }

    /// Load config that must exist on disk
    pub fn load_existing(path: PathBuf) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path));
        }
        Self::load_from(path)
    }

    /// Apply environment variable overrides
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(key) = std::env::var("SPEND_GUARD_API_KEY") {
            self.upstream.api_key = Some(key);
        }
        if let Ok(url) = std::env::var("SPEND_GUARD_BASE_URL") {
            self.upstream.base_url = url;
        }
        if let Ok(model) = std::env::var("SPEND_GUARD_MODEL") {
            self.upstream.model = model;
        }

        self
    }

    /// Save config to default location
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(Self::default_path())
    }

    /// Save config to specific path
    pub fn save_to(&self, path: PathBuf) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(&path, content)?;

        Ok(())
    }

    /// Reject configurations the layer cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.services.is_empty() {
            return Err(ConfigError::MissingRequired(
                "At least one [services.<name>] section".to_string(),
            ));
        }

        check_limits("budget", self.budget.daily_limit, self.budget.monthly_limit)?;

        if !self.budget.alerts.is_valid() {
            return invalid("budget.alerts must be strictly ascending within (0, 1]");
        }
        if self.budget.reset_check_interval_secs == 0 {
            return invalid("budget.reset_check_interval_secs must be positive");
        }
        if self.budget.history_retention == 0 {
            return invalid("budget.history_retention must be positive");
        }
        if !(1..=MAX_FORECAST_WINDOW.as_secs()).contains(&self.budget.forecast_window_secs) {
            return invalid("budget.forecast_window_secs must be between 1 second and 366 days");
        }
        if self.budget.max_deferred == 0 {
            return invalid("budget.max_deferred must be positive");
        }

        let cache = &self.cache;
        if !(0.0..=1.0).contains(&cache.similarity_threshold) {
            return invalid("cache.similarity_threshold must be within [0, 1]");
        }
        if cache.default_ttl_secs == 0 {
            return invalid("cache.default_ttl_secs must be positive");
        }
        if cache.max_size == 0 {
            return invalid("cache.max_size must be positive");
        }
        if cache.embedding_dimensions == 0 {
            return invalid("cache.embedding_dimensions must be positive");
        }
        if cache.sweep_interval_secs == 0 || cache.shards == 0 {
            return invalid("cache.sweep_interval_secs and cache.shards must be positive");
        }

        for (name, service) in &self.services {
            check_limits(&format!("services.{}", name), service.daily_limit, service.monthly_limit)?;

            if service.max_batch_size == 0 {
                return invalid(&format!("services.{}.max_batch_size must be positive", name));
            }
            if service.cost_per_1k_input < 0.0 || service.cost_per_1k_output < 0.0 {
                return invalid(&format!("services.{} prices must not be negative", name));
            }
            if service.cache_ttl_secs == Some(0) {
                return invalid(&format!("services.{}.cache_ttl_secs must be positive", name));
            }
        }

        let mut seen = Vec::new();
        for template in &self.optimization.templates {
            if seen.contains(&template.id) {
                return invalid(&format!("duplicate template id '{}'", template.id));
            }
            seen.push(template.id.clone());
        }

        Ok(())
    }

    pub fn service(&self, name: &str) -> Option<&ServiceSettings> {
        self.services.get(name)
    }

    pub fn service_limits(&self) -> HashMap<String, BudgetLimits> {
        self.services
            .iter()
            .map(|(name, s)| (name.clone(), s.limits()))
            .collect()
    }

    pub fn batch_policies(&self) -> HashMap<String, BatchPolicy> {
        self.services
            .iter()
            .map(|(name, s)| (name.clone(), s.batch_policy()))
            .collect()
    }

    pub fn cache_policy(&self) -> CachePolicy {
        CachePolicy::from(&self.cache)
    }

    /// Generate example config content
    pub fn example() -> String {
        let mut example = Config::default();
        example.optimization.templates.push(PromptTemplate::new(
            "summarize",
            "Summarize the following text in {{style}} style:",
        ));
        toml::to_string_pretty(&example).unwrap_or_default()
    }
}

fn check_limits(scope: &str, daily: f64, monthly: f64) -> Result<(), ConfigError> {
    if daily > 0.0 && monthly > 0.0 {
        Ok(())
    } else {
        invalid(&format!("{} limits must be positive", scope))
    }
}

fn invalid(message: &str) -> Result<(), ConfigError> {
    Err(ConfigError::Invalid(message.to_string()))
}

/// Builder for creating Config programmatically
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    /// Start with no services
    pub fn empty() -> Self {
        let mut config = Config::default();
        config.services.clear();
        Self { config }
    }

    pub fn global_limits(mut self, daily: f64, monthly: f64) -> Self {
        self.config.budget.daily_limit = daily;
        self.config.budget.monthly_limit = monthly;
        self
    }

    pub fn service(mut self, name: impl Into<String>, settings: ServiceSettings) -> Self {
        self.config.services.insert(name.into(), settings);
        self
    }

    pub fn eviction(mut self, eviction: EvictionStrategy) -> Self {
        self.config.cache.eviction = eviction;
        self
    }

    pub fn cache_max_size(mut self, max_size: usize) -> Self {
        self.config.cache.max_size = max_size;
        self
    }

    pub fn similarity_threshold(mut self, threshold: f32) -> Self {
        self.config.cache.similarity_threshold = threshold;
        self
    }

    pub fn cache_enabled(mut self, enabled: bool) -> Self {
        self.config.cache.enabled = enabled;
        self
    }

    pub fn throttle_delay_ms(mut self, delay: u64) -> Self {
        self.config.budget.throttle_delay_ms = delay;
        self
    }

    pub fn template(mut self, template: PromptTemplate) -> Self {
        self.config.optimization.templates.push(template);
        self
    }

    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.config.upstream.api_key = Some(key.into());
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.upstream.model = model.into();
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.cache.eviction, EvictionStrategy::Lru);
        assert!(config.service("bulk").unwrap().batchable);
        assert!(!config.service("chat").unwrap().batchable);
    }

    #[test]
    fn test_config_builder() {
        let config = ConfigBuilder::empty()
            .service("grading", ServiceSettings::default())
            .eviction(EvictionStrategy::Lfu)
            .cache_max_size(2)
            .api_key("test-key")
            .build();

        assert_eq!(config.services.len(), 1);
        assert_eq!(config.cache.eviction, EvictionStrategy::Lfu);
        assert_eq!(config.upstream.api_key, Some("test-key".to_string()));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_example_config() {
        let example = Config::example();
        assert!(example.contains("[budget]"));
        assert!(example.contains("[services.chat]"));

        let parsed: Config = toml::from_str(&example).unwrap();
        assert!(parsed.validate().is_ok());
        assert_eq!(parsed.optimization.templates.len(), 1);
    }

    #[test]
    fn test_parse_partial_file() {
        let config: Config = toml::from_str(
            r#"
            [cache]
            eviction = "lfu"
            similarity_threshold = 0.85

            [services.search]
            daily_limit = 5.0
            batchable = true
            max_wait_ms = 100
            "#,
        )
        .unwrap();

        assert_eq!(config.cache.eviction, EvictionStrategy::Lfu);
        assert_eq!(config.cache.max_size, 10_000);
        assert_eq!(config.services.len(), 1);

        let search = config.service("search").unwrap();
        assert_eq!(search.monthly_limit, 400.0);
        assert_eq!(search.batch_policy().max_wait, Duration::from_millis(100));
    }

    #[test]
    fn test_unknown_eviction_rejected() {
        let result: Result<Config, _> = toml::from_str("[cache]\neviction = \"fifo\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_validation_failures() {
        let mut config = Config::default();
        config.budget.alerts.critical = 0.7;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = Config::default();
        config.cache.similarity_threshold = 1.5;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.services.get_mut("bulk").unwrap().max_batch_size = 0;
        assert!(config.validate().is_err());

        let config = ConfigBuilder::empty().build();
        assert!(matches!(config.validate(), Err(ConfigError::MissingRequired(_))));
    }

    #[test]
    fn test_forecast_window_is_capped() {
        let mut config = Config::default();
        config.budget.forecast_window_secs = u64::MAX;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        config.budget.forecast_window_secs = 0;
        assert!(config.validate().is_err());

        config.budget.forecast_window_secs = MAX_FORECAST_WINDOW.as_secs();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_max_deferred() {
        let config: Config = toml::from_str("[budget]\nmax_deferred = 2\n").unwrap();
        assert_eq!(config.budget.max_deferred, 2);
        assert_eq!(Config::default().budget.max_deferred, 1000);

        let mut config = Config::default();
        config.budget.max_deferred = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_cost_model() {
        let service = ServiceSettings {
            cost_per_1k_input: 0.01,
            cost_per_1k_output: 0.03,
            expected_output_tokens: 500,
            ..ServiceSettings::default()
        };

        assert!((service.estimate_cost(2000) - 0.035).abs() < 1e-9);
        assert!((service.cost_for(&TokenUsage::new(1000, 1000)) - 0.04).abs() < 1e-9);

        let mut reported = TokenUsage::new(1000, 1000);
        reported.estimated_cost_usd = Some(0.5);
        assert_eq!(service.cost_for(&reported), 0.5);
    }

    #[test]
    fn test_save_and_load() {
        let path = std::env::temp_dir()
            .join(format!("spend-guard-test-{}", std::process::id()))
            .join("config.toml");

        let config = ConfigBuilder::new().global_limits(10.0, 100.0).build();
        config.save_to(path.clone()).unwrap();

        let loaded = Config::load_existing(path.clone()).unwrap();
        assert_eq!(loaded.budget.daily_limit, 10.0);
        assert_eq!(loaded.services.len(), 2);

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }
}
