//! spend-guard CLI - Run prompts through the cost layer and inspect budgets

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use futures_util::future::join_all;
use spend_guard::{
    api::{HttpUpstream, Payload, Priority, ProcessRequest, TemplateInvocation},
    config::Config,
    optimization::PromptOptimizer,
    orchestrator::{CostError, CostOptimizationOrchestrator},
    tui::TerminalRenderer,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "spend-guard")]
#[command(about = "Cost optimization and adaptive caching in front of metered LLM APIs")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbosity level (RUST_LOG takes precedence)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Config file (default: platform config dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Send prompts through optimization, cache, budget and batching
    Process {
        /// Service type the prompts are billed to
        #[arg(short, long, default_value = "chat")]
        service: String,

        /// Prompts to send; submitted concurrently so they can share a batch
        prompts: Vec<String>,

        /// Read one more prompt from a file
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// System instructions for every prompt
        #[arg(long)]
        system: Option<String>,

        /// Configured template to place in front of each prompt
        #[arg(short, long)]
        template: Option<String>,

        /// Template variables as name=value
        #[arg(long = "var", value_parser = parse_var)]
        vars: Vec<(String, String)>,

        /// low, medium or high; high is treated as essential
        #[arg(short, long, default_value = "medium")]
        priority: Priority,

        /// Skip the semantic cache
        #[arg(long)]
        no_cache: bool,

        /// Dispatch immediately instead of queueing for a batch
        #[arg(long)]
        no_batch: bool,

        /// Give up on requests still queued after this many milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Print results and the cost report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show what prompt optimization does to a prompt, without sending it
    Optimize {
        /// Input file or prompt text
        #[arg(short, long)]
        input: String,

        /// System instructions to include
        #[arg(long)]
        system: Option<String>,
    },

    /// Configuration management
    #[command(subcommand)]
    Config(ConfigCommands),
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Initialize configuration file with defaults
    Init {
        /// Overwrite existing config
        #[arg(long)]
        force: bool,
    },

    /// Show current configuration
    Show {
        /// Show only one section (budget, cache, optimization, upstream, services)
        #[arg(short, long)]
        section: Option<String>,
    },

    /// Show configuration file path
    Path,

    /// Validate configuration
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level.to_lowercase()));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config_path = cli.config.unwrap_or_else(Config::default_path);

    match cli.command {
        Commands::Process {
            service,
            mut prompts,
            input,
            system,
            template,
            vars,
            priority,
            no_cache,
            no_batch,
            timeout_ms,
            json,
        } => {
            if let Some(path) = input {
                prompts.push(
                    std::fs::read_to_string(&path)
                        .with_context(|| format!("reading {}", path.display()))?,
                );
            }
            if prompts.is_empty() {
                bail!("no prompts given; pass them as arguments or with --input");
            }

            let requests = prompts
                .into_iter()
                .map(|prompt| {
                    let mut payload = Payload::new(prompt);
                    if let Some(id) = &template {
                        let invocation = vars
                            .iter()
                            .fold(TemplateInvocation::new(id.clone()), |inv, (k, v)| {
                                inv.with_variable(k.clone(), v.clone())
                            });
                        payload = payload.with_template(invocation);
                    }
                    if let Some(system) = &system {
                        payload = payload.with_system(system.clone());
                    }

                    let mut request =
                        ProcessRequest::new(service.clone(), payload).with_priority(priority);
                    if no_cache {
                        request = request.without_cache();
                    }
                    if no_batch {
                        request = request.without_batch();
                    }
                    if let Some(ms) = timeout_ms {
                        request = request.with_timeout(Duration::from_millis(ms));
                    }
                    request
                })
                .collect();

            run_process(config_path, requests, json).await?;
        }
        Commands::Optimize { input, system } => {
            run_optimize(config_path, input, system)?;
        }
        Commands::Config(cmd) => {
            run_config_command(config_path, cmd)?;
        }
    }

    Ok(())
}

fn parse_var(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.to_string()))
        .ok_or_else(|| format!("expected name=value, got '{}'", s))
}

async fn run_process(config_path: PathBuf, requests: Vec<ProcessRequest>, json: bool) -> Result<()> {
    let config = Config::load_from(config_path)?;
    config.validate()?;

    if config.upstream.api_key.is_none() {
        info!("No API key configured; set SPEND_GUARD_API_KEY if the provider requires one");
    }

    let upstream = Arc::new(HttpUpstream::new(config.upstream.clone())?);
    let orchestrator = CostOptimizationOrchestrator::init(config, upstream)?;
    orchestrator.start().await;

    info!("Processing {} request(s)", requests.len());
    let results = join_all(
        requests
            .into_iter()
            .map(|request| orchestrator.process_request(request)),
    )
    .await;

    let report = orchestrator.report();
    orchestrator.shutdown().await;

    if json {
        let rendered: Vec<serde_json::Value> = results
            .iter()
            .map(|result| match result {
                Ok(result) => serde_json::to_value(result).unwrap_or_default(),
                Err(e) => serde_json::json!({ "error": e.to_string() }),
            })
            .collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "results": rendered,
                "report": report,
            }))?
        );
        return Ok(());
    }

    let renderer = TerminalRenderer::new();
    for result in &results {
        match result {
            Ok(result) => renderer.render_result(result),
            Err(CostError::Deferred { request_id, reason }) => renderer.render_warning(&format!(
                "{} deferred ({}); it was not sent",
                request_id, reason
            )),
            Err(e) => renderer.render_error(&e.to_string()),
        }
        println!();
    }

    renderer.render_report(&report);
    Ok(())
}

fn run_optimize(config_path: PathBuf, input: String, system: Option<String>) -> Result<()> {
    let config = Config::load_from(config_path)?;

    // Check if input is a file path
    let prompt = if std::path::Path::new(&input).exists() {
        std::fs::read_to_string(&input)?
    } else {
        input
    };

    let mut payload = Payload::new(prompt);
    if let Some(system) = system {
        payload = payload.with_system(system);
    }

    let optimizer = PromptOptimizer::new(config.optimization);
    let optimized = optimizer.optimize(&payload)?;

    TerminalRenderer::new().render_optimized(&optimized);
    Ok(())
}

fn run_config_command(path: PathBuf, cmd: ConfigCommands) -> Result<()> {
    match cmd {
        ConfigCommands::Init { force } => config_init(path, force),
        ConfigCommands::Show { section } => config_show(path, section),
        ConfigCommands::Path => {
            config_path(path);
            Ok(())
        }
        ConfigCommands::Validate => config_validate(path),
    }
}

fn config_init(path: PathBuf, force: bool) -> Result<()> {
    if path.exists() && !force {
        println!("Configuration file already exists at: {}", path.display());
        println!("Use --force to overwrite");
        return Ok(());
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, Config::example())?;

    println!("Configuration file created at: {}", path.display());
    println!();
    println!("Next steps:");
    println!("  1. Set budget limits under [budget] and per service under [services.<name>]");
    println!("  2. Add your API key to [upstream], or:");
    println!("     export SPEND_GUARD_API_KEY=your_key");

    Ok(())
}

fn config_show(path: PathBuf, section: Option<String>) -> Result<()> {
    let config = Config::load_from(path)?;

    let display = if let Some(sec) = section {
        match sec.to_lowercase().as_str() {
            "budget" => toml::to_string_pretty(&config.budget)?,
            "cache" => toml::to_string_pretty(&config.cache)?,
            "optimization" => toml::to_string_pretty(&config.optimization)?,
            "upstream" => {
                let mut upstream = config.upstream.clone();
                if upstream.api_key.is_some() {
                    upstream.api_key = Some("***".to_string());
                }
                toml::to_string_pretty(&upstream)?
            }
            "services" => toml::to_string_pretty(&config.services)?,
            _ => {
                println!("Unknown section: {}", sec);
                println!("Available: budget, cache, optimization, upstream, services");
                return Ok(());
            }
        }
    } else {
        // Mask API key in display
        let mut display_config = config.clone();
        if display_config.upstream.api_key.is_some() {
            display_config.upstream.api_key = Some("***".to_string());
        }
        toml::to_string_pretty(&display_config)?
    };

    println!("{}", display);

    println!("\n--- Environment Variables ---");
    for var in ["SPEND_GUARD_API_KEY", "SPEND_GUARD_BASE_URL", "SPEND_GUARD_MODEL"] {
        println!(
            "{}: {}",
            var,
            if std::env::var(var).is_ok() { "set" } else { "not set" }
        );
    }

    Ok(())
}

fn config_path(path: PathBuf) {
    println!("{}", path.display());

    if path.exists() {
        println!("(file exists)");
    } else {
        println!("(file does not exist - run 'config init' to create)");
    }
}

fn config_validate(path: PathBuf) -> Result<()> {
    let config = Config::load_from(path)?;
    let renderer = TerminalRenderer::new();

    match config.validate() {
        Ok(()) => {
            renderer.render_success("Configuration is valid");
            println!();
            println!(
                "Global budget: ${:.2}/day, ${:.2}/month",
                config.budget.daily_limit, config.budget.monthly_limit
            );
            println!("Services:");
            for (name, service) in &config.services {
                let batching = if service.batchable {
                    format!(
                        "batches of up to {} within {}ms",
                        service.max_batch_size, service.max_wait_ms
                    )
                } else {
                    "dispatched immediately".to_string()
                };
                println!(
                    "  {}: ${:.2}/day, ${:.2}/month, {}",
                    name, service.daily_limit, service.monthly_limit, batching
                );
            }
            println!();
            if config.cache.enabled {
                println!(
                    "Cache: {} entries, {:?} eviction, similarity >= {:.2}",
                    config.cache.max_size,
                    config.cache.eviction,
                    config.cache.similarity_threshold
                );
            } else {
                println!("Cache: disabled");
            }
            if config.upstream.api_key.is_none() {
                renderer.render_warning("No upstream API key configured");
            }
        }
        Err(e) => {
            renderer.render_error(&format!("Configuration error: {}", e));
            std::process::exit(1);
        }
    }

    Ok(())
}
