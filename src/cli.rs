//! Stagehand command line
//!
//! Resolve plugin sets, print the environment they build, host the
//! scheduling service, or run an action graph.

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::Config;
use crate::context::Context;
use crate::errors::StagehandError;
use crate::observability::telemetry::init_tracing;
use crate::plugin::version::split_query;
use crate::plugin::{Plugin, VersionQuery};
use crate::scheduling::local::{CommandRegistry, LocalScheduler};
use crate::scheduling::remote::RemoteScheduler;
use crate::scheduling::transport::ServerHandle;
use crate::scheduling::{ClientPool, ExecutionContext, SchedulerSet, SchedulingService};
use crate::tools::{Action, ToolCatalog};

/// How often long-running commands check the shutdown flag.
const SHUTDOWN_POLL: Duration = Duration::from_millis(200);

#[derive(Parser)]
#[command(name = "stagehand")]
#[command(about = "Resolve pipeline plugins and run their actions")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<String>,

    /// Debug logging for stagehand
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    /// Log as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,
}

/// Output format for `resolve`
#[derive(Debug, Clone, Copy, Default, clap::ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, Default, clap::ValueEnum)]
pub enum RunMode {
    #[default]
    Execute,
    Undo,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the plugin set satisfying a query
    Resolve {
        /// Space separated constraints, e.g. "maya>=2024 arnold==7.2"
        query: String,

        #[arg(long, value_enum, default_value = "text")]
        output_format: OutputFormat,
    },

    /// Print the environment a resolved plugin set builds
    Env {
        query: String,

        /// Start from the current process environment
        #[arg(long)]
        inherit: bool,
    },

    /// Host the scheduling service processors register with
    Serve {
        #[arg(long)]
        host: Option<String>,

        #[arg(long)]
        port: Option<u16>,
    },

    /// Run an action definition file
    Run {
        action_file: PathBuf,

        /// Plugins to run the action under
        #[arg(short, long, default_value = "")]
        query: String,

        #[arg(short, long, value_enum, default_value = "execute")]
        mode: RunMode,
    },
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref())?;
    if cli.verbose {
        config.logging.filter = "stagehand=debug".to_string();
    }
    if cli.json_logs {
        config.logging.json = true;
    }
    init_tracing(&config.logging);
    config.validate()?;

    match cli.command {
        Commands::Resolve {
            query,
            output_format,
        } => {
            validate_query(&query)?;
            let context = Context::resolve(&query, &config.plugins)?;
            match output_format {
                OutputFormat::Text => {
                    for line in format_plugins(&context.plugins) {
                        println!("{line}");
                    }
                }
                OutputFormat::Json => {
                    println!("{}", serde_json::to_string_pretty(&plugins_json(&context))?);
                }
            }
        }

        Commands::Env { query, inherit } => {
            validate_query(&query)?;
            let context = Context::resolve(&query, &config.plugins)?;
            for line in context.environ(inherit) {
                println!("{line}");
            }
        }

        Commands::Serve { host, port } => {
            if let Some(host) = host {
                config.network.host = host;
            }
            if let Some(port) = port {
                config.network.port = port;
            }
            serve(&config).await?;
        }

        Commands::Run {
            action_file,
            query,
            mode,
        } => {
            if !query.trim().is_empty() {
                validate_query(&query)?;
            }
            run_action(&config, &action_file, &query, mode).await?;
        }
    }

    Ok(())
}

/// Reject constraints without an operator instead of matching them by name.
pub fn validate_query(query: &str) -> Result<(), StagehandError> {
    let mut tokens = split_query(query).peekable();
    if tokens.peek().is_none() {
        return Err(StagehandError::Config("empty plugin query".to_string()));
    }
    for token in tokens {
        VersionQuery::parse_strict(token)?;
    }
    Ok(())
}

pub fn format_plugins(plugins: &[Plugin]) -> Vec<String> {
    plugins
        .iter()
        .map(|plugin| {
            format!(
                "{}@{}\t{}",
                plugin.name,
                plugin.version,
                plugin.path.display()
            )
        })
        .collect()
}

fn plugins_json(context: &Context) -> serde_json::Value {
    let plugins: Vec<serde_json::Value> = context
        .plugins
        .iter()
        .map(|plugin| {
            serde_json::json!({
                "name": plugin.name,
                "version": plugin.version,
                "label": plugin.label,
                "path": plugin.path,
            })
        })
        .collect();
    serde_json::json!({
        "query": context.query,
        "resolved_at": chrono::Utc::now().to_rfc3339(),
        "plugins": plugins,
    })
}

async fn wait_for_shutdown() {
    while !crate::is_shutdown_requested() {
        tokio::time::sleep(SHUTDOWN_POLL).await;
    }
}

async fn serve(config: &Config) -> Result<()> {
    let service = SchedulingService::default();
    let server = ServerHandle::bind(service.clone(), &config.core_address())
        .await
        .with_context(|| format!("Failed to bind {}", config.core_address()))?;
    info!(address = %server.address(), "Scheduling service listening");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let liveness = Duration::from_secs(config.scheduling.liveness_timeout_secs);
    let monitor = service.spawn_liveness_monitor(liveness / 4, liveness, shutdown_rx);

    wait_for_shutdown().await;

    let _ = shutdown_tx.send(true);
    server.stop().await;
    let _ = monitor.await;
    Ok(())
}

async fn run_action(config: &Config, path: &Path, query: &str, mode: RunMode) -> Result<()> {
    let service = SchedulingService::default();
    // Processors started on demand register with this in-process core.
    let server = ServerHandle::bind(service.clone(), &format!("{}:0", config.network.host))
        .await
        .context("Failed to start the scheduling service")?;
    let address = server.address();

    let context = Context::resolve(query, &config.plugins)?
        .with_core_address(address.ip().to_string(), address.port());
    let catalog = ToolCatalog::discover(&context);
    let action = Action::load(path, &catalog)?;

    let clients = ClientPool::new();
    let local = LocalScheduler::new(CommandRegistry::new(), clients.clone());
    let remote = RemoteScheduler::new(service, clients).with_registration_timeout(
        Duration::from_secs(config.network.registration_timeout_secs),
    );
    let schedulers = SchedulerSet::new(config.scheduling.default_scheduler.clone())
        .with(Arc::new(local))
        .with(Arc::new(remote));
    let exec = ExecutionContext::new(context, schedulers, config.scheduling.max_concurrency);

    info!(action = action.base.name.as_str(), mode = ?mode, "Running action");
    let run = async {
        match mode {
            RunMode::Execute => action.execute(&exec).await,
            RunMode::Undo => action.undo(&exec).await,
        }
    };
    tokio::pin!(run);

    let mut cancelled = false;
    let outcome = loop {
        tokio::select! {
            outcome = &mut run => break outcome,
            _ = tokio::time::sleep(SHUTDOWN_POLL), if !cancelled => {
                if crate::is_shutdown_requested() {
                    warn!("Shutdown requested, cancelling running commands");
                    cancelled = true;
                    if let Err(e) = action.cancel(&exec).await {
                        warn!(error = %e, "Cancellation failed");
                    }
                }
            }
        }
    };

    for command in action.commands() {
        println!("{}\t{:?}", command.base.name, command.base.status());
    }
    server.stop().await;
    outcome?;
    Ok(())
}
