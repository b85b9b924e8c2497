//! spend-guard - Cost optimization and adaptive caching in front of metered LLM APIs
//!
//! Every request passes through one pipeline before it may reach the provider:
//!
//! - **Prompt Optimization**: Strip redundant tokens and expand templates
//! - **Semantic Cache**: Serve exact and near-duplicate requests without a provider call
//! - **Budget Control**: Per-service and global spending envelopes with alerts, throttling and hard caps
//! - **Batch Scheduling**: Coalesce batchable requests into one provider call
//! - **Reporting**: Spend breakdown, cache efficiency and forecasts

pub mod api;
pub mod batch;
pub mod budget;
pub mod cache;
pub mod config;
pub mod metrics;
pub mod optimization;
pub mod orchestrator;
pub mod tui;

pub use api::{
    ApiError, HttpUpstream, Payload, Priority, ProcessRequest, ProcessResult, UpstreamProvider,
    UpstreamResponse,
};
pub use batch::{BatchError, BatchPolicy, BatchScheduler};
pub use budget::{AdmissionDecision, BudgetController, BudgetError, BudgetStatus, Forecast};
pub use cache::{CacheError, CacheMetrics, CachePolicy, SemanticCache};
pub use config::{Config, ConfigBuilder, ConfigError};
pub use metrics::{CostReport, UsageTracker};
pub use optimization::{OptimizationConfig, PromptOptimizer};
pub use orchestrator::{CostError, CostOptimizationOrchestrator, DeferredRequest};
