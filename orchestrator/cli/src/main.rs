//! ollama-master - Command-Line Surface for the Orchestrator
//!
//! Drives the orchestrator core against a fleet of Ollama instances and
//! prints results as JSON on stdout. Logs go to stderr.
//!
//! # Usage
//!
//! ```bash
//! # Probe the address space and list instances
//! ollama-master discover
//!
//! # Models and where they are served
//! ollama-master models
//!
//! # Run a prompt on the best instance
//! ollama-master route "Why is the sky blue?" --tier fast --max-time 10
//!
//! # Ask whether the fleet could handle a task
//! ollama-master assess "multi-step proof of a lemma"
//!
//! # Multi-step workflows
//! ollama-master workflows
//! ollama-master workflow code_review "fn main() {}" --context '{"lang": "rust"}'
//! ollama-master auto "Please review code in this diff: ..."
//!
//! # Keep discovery running until Ctrl-C
//! ollama-master watch
//!
//! # Extra targets and verbose logging
//! RUST_LOG=debug ollama-master --target 192.168.0.224:11434/remote discover
//! ```

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};

use orchestrator_core::config::{load_config_from_path, ConfigOverrides};
use orchestrator_core::discovery::DiscoveryTarget;
use orchestrator_core::{
    AutoOutcome, Orchestrator, OrchestratorError, Requirements, RouteParams, Tier, WorkflowRun,
};

/// ollama-master - Route inference requests across a fleet of Ollama instances
#[derive(Parser, Debug)]
#[command(name = "ollama-master")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, env = "ORCHESTRATOR_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Address to probe, `host:ports[/locality[/gpus]]` (repeatable; replaces
    /// the configured address space)
    #[arg(short = 't', long = "target", value_name = "TARGET")]
    targets: Vec<DiscoveryTarget>,

    /// Per-probe timeout in milliseconds
    #[arg(long, value_name = "MS")]
    probe_timeout_ms: Option<u64>,

    /// Consecutive failed probes before an instance is evicted
    #[arg(long, value_name = "N")]
    eviction_threshold: Option<u32>,

    /// Score bonus for local instances
    #[arg(long, value_name = "WEIGHT")]
    locality_weight: Option<f64>,

    /// Retries after a failed dispatch
    #[arg(long, value_name = "N")]
    retry_budget: Option<u32>,

    /// Guess a tier from prompt length when none is given
    #[arg(long)]
    infer_tier: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "ORCHESTRATOR_LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Probe the address space and print every known instance
    Discover,

    /// Print each model with the healthy instances serving it
    Models,

    /// Route a prompt to the best instance and print the answer
    Route {
        /// Prompt text
        prompt: String,

        /// Use this model
        #[arg(short, long)]
        model: Option<String>,

        /// Performance tier (fast, balanced, powerful)
        #[arg(long)]
        tier: Option<Tier>,

        /// Time budget in seconds
        #[arg(long, value_name = "SECS")]
        max_time: Option<f64>,
    },

    /// Report whether the fleet could handle a task, without running it
    Assess {
        /// Free-text task description
        description: String,

        /// Performance tier (fast, balanced, powerful)
        #[arg(long)]
        tier: Option<Tier>,

        /// Required task tag (repeatable)
        #[arg(long = "tag")]
        tags: Vec<String>,

        /// Time budget in seconds
        #[arg(long, value_name = "SECS")]
        max_time: Option<f64>,
    },

    /// Print the workflow templates
    Workflows,

    /// Run a workflow template, feeding each step's output to the next
    Workflow {
        /// Template name (see `workflows`)
        template: String,

        /// Input of the first step
        input: String,

        /// JSON object appended to every step's prompt
        #[arg(long, value_name = "JSON")]
        context: Option<String>,
    },

    /// Run the workflow matching a prompt, or route it once if none does
    Auto {
        /// Prompt text
        prompt: String,
    },

    /// Run periodic discovery until interrupted
    Watch,

    /// Refresh once and print metrics in Prometheus text format
    Metrics,
}

/// Initialize logging with the specified level
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!(
            "ollama_master={level},orchestrator_core={level}"
        ))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value).context("Failed to encode output")?;
    println!("{text}");
    Ok(())
}

fn seconds(secs: Option<f64>) -> Result<Option<Duration>> {
    secs.map(|s| {
        if s.is_nan() || s <= 0.0 {
            anyhow::bail!("Invalid time budget: {s} (must be positive)");
        }
        Duration::try_from_secs_f64(s).with_context(|| format!("Invalid time budget: {s}"))
    })
    .transpose()
}

fn parse_context(context: Option<&str>) -> Result<Option<serde_json::Value>> {
    context
        .map(|text| serde_json::from_str(text).context("Invalid --context JSON"))
        .transpose()
}

fn finish_workflow(run: &WorkflowRun) -> Result<()> {
    print_json(run)?;
    if !run.succeeded() {
        anyhow::bail!(
            "Workflow '{}' failed: {}",
            run.template,
            run.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

/// Print the structured reason behind a failed request
fn report_failure(err: &OrchestratorError) -> Result<()> {
    let details = match err {
        OrchestratorError::Infeasible(reason) => serde_json::to_value(reason)?,
        OrchestratorError::DispatchFailed(failure) => serde_json::to_value(failure)?,
        other => serde_json::Value::String(other.to_string()),
    };
    print_json(&serde_json::json!({
        "error": err.kind(),
        "message": err.to_string(),
        "details": details,
    }))
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        let mut overrides = ConfigOverrides::new().with_targets(self.targets.clone());
        overrides.probe_timeout_ms = self.probe_timeout_ms;
        overrides.eviction_threshold = self.eviction_threshold;
        overrides.locality_weight = self.locality_weight;
        overrides.retry_budget = self.retry_budget;
        if self.infer_tier {
            overrides = overrides.with_infer_tier_from_prompt(true);
        }
        overrides
    }
}

async fn run(args: Args) -> Result<()> {
    let config_path = args
        .config
        .clone()
        .or_else(orchestrator_core::config::default_config_path);
    let mut config = load_config_from_path(config_path).context("Failed to load configuration")?;
    args.overrides().apply(&mut config);
    config.validate().context("Invalid configuration")?;

    info!(
        source = %config.source(),
        targets = config.discovery.address_space.len(),
        "Configuration loaded"
    );

    let orchestrator = Orchestrator::from_config(config)?;

    match args.command {
        Command::Discover => {
            let instances = orchestrator.discover_instances().await;
            print_json(&instances)?;
        }
        Command::Models => {
            print_json(&orchestrator.list_models().await)?;
        }
        Command::Route {
            prompt,
            model,
            tier,
            max_time,
        } => {
            let mut params = RouteParams::new(prompt);
            params.model = model;
            params.tier = tier;
            params.max_time = seconds(max_time)?;

            match orchestrator.route_request(params).await {
                Ok(response) => print_json(&response)?,
                Err(err) => {
                    report_failure(&err)?;
                    return Err(err.into());
                }
            }
        }
        Command::Assess {
            description,
            tier,
            tags,
            max_time,
        } => {
            let max_time = seconds(max_time)?;
            let requirements = (tier.is_some() || !tags.is_empty() || max_time.is_some()).then(
                || Requirements {
                    tier,
                    tags: tags.into_iter().collect(),
                    max_time,
                    ..Requirements::default()
                },
            );
            orchestrator.refresh().await;
            print_json(&orchestrator.assess_capability(&description, requirements))?;
        }
        Command::Workflows => {
            print_json(&orchestrator.list_workflows())?;
        }
        Command::Workflow {
            template,
            input,
            context,
        } => {
            let context = parse_context(context.as_deref())?;
            let run = orchestrator
                .execute_workflow(&template, &input, context.as_ref())
                .await?;
            finish_workflow(&run)?;
        }
        Command::Auto { prompt } => match orchestrator.auto_orchestrate(&prompt).await {
            Ok(AutoOutcome::Workflow(run)) => finish_workflow(&run)?,
            Ok(outcome @ AutoOutcome::Single(_)) => print_json(&outcome)?,
            Err(err) => {
                report_failure(&err)?;
                return Err(err.into());
            }
        },
        Command::Watch => {
            let handle = orchestrator.spawn_discovery();
            info!("Watching fleet, press Ctrl-C to stop");
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for Ctrl-C");
            }
            info!("Stopping discovery");
            handle.shutdown().await;
            print_json(&orchestrator.registry().snapshot().instances())?;
        }
        Command::Metrics => {
            orchestrator.refresh().await;
            print!("{}", orchestrator.metrics().to_prometheus());
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level);

    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    run(args).await
}
