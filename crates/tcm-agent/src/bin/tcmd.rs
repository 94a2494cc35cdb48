//! Main binary for the cardinality manager daemon (tcmd)

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tcm_agent::{
    build_store, init_logging, AgentConfig, AgentError, Controller, IntervalTicker,
    PrometheusBackend, Result,
};
use tcm_core::{InstrumentationSink, MetricsBackend};
use tcm_engine::build_keep_set;
use tcm_metrics::{init_metrics, MetricsRegistry};
use tokio::sync::watch;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "tcmd")]
#[command(about = "Timeseries cardinality manager daemon")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the control loop until interrupted
    Run,
    /// Run a single pass and print its report as JSON
    Once,
    /// Validate configuration
    Validate,
    /// Print the metric names protected by the configured rules
    KeepSet,
    /// Generate default configuration
    Config {
        /// Output file path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.as_deref();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(config_path).await,
        Commands::Once => once(config_path).await,
        Commands::Validate => validate_config(config_path),
        Commands::KeepSet => print_keep_set(config_path),
        Commands::Config { output } => generate_config(output),
    }
}

fn build_controller(
    config: &AgentConfig,
    sink: Arc<dyn InstrumentationSink>,
) -> Result<Controller> {
    let backend: Arc<dyn MetricsBackend> = Arc::new(PrometheusBackend::from_config(&config.backend)?);
    let store = build_store(&config.store);
    Controller::new(&config.core, backend, store, sink)
}

async fn run(config_path: Option<&Path>) -> Result<()> {
    let config = AgentConfig::load(config_path)?;
    init_logging(&config.logging)?;

    let metrics = init_metrics(config.metrics.clone())?;
    if let Some(addr) = metrics.start_exporters().await? {
        info!("Serving metrics on http://{}/metrics", addr);
    }

    let controller = build_controller(&config, Arc::new(metrics.clone()))?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let reloader = controller.clone();
    let reload_path = config_path.map(Path::to_path_buf);
    let health = metrics.clone();
    tokio::spawn(async move { reload_on_hangup(reloader, reload_path, health).await });

    tokio::spawn(async move {
        wait_for_termination().await;
        info!("Shutdown requested, finishing current pass");
        let _ = shutdown_tx.send(true);
    });

    info!(
        backend = %config.backend.url,
        interval_seconds = config.core.control.interval_seconds,
        jobs = config.core.scrape_jobs.len(),
        "Starting cardinality manager"
    );

    controller
        .run(IntervalTicker::new(config.core.control.interval()), shutdown_rx)
        .await;

    metrics.stop_exporters().await;
    info!("Cardinality manager stopped");
    Ok(())
}

async fn once(config_path: Option<&Path>) -> Result<()> {
    let config = AgentConfig::load(config_path)?;
    init_logging(&config.logging)?;

    let metrics = init_metrics(config.metrics.clone())?;
    let controller = build_controller(&config, Arc::new(metrics))?;

    let report = controller.run_pass().await;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

#[cfg(unix)]
async fn wait_for_termination() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(e) => {
            warn!("Failed to install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C signal"),
        _ = terminate.recv() => info!("Received termination signal"),
    }
}

#[cfg(not(unix))]
async fn wait_for_termination() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Received Ctrl+C signal");
}

/// Re-read the configuration and reload the controller on every SIGHUP
///
/// `/health` fails while the running configuration differs from a file
/// that could not be loaded.
#[cfg(unix)]
async fn reload_on_hangup(controller: Controller, config_path: Option<PathBuf>, health: MetricsRegistry) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(e) => {
            warn!("Failed to install SIGHUP handler, reload disabled: {}", e);
            return;
        }
    };

    while hangup.recv().await.is_some() {
        info!("Received SIGHUP, reloading configuration");
        let reloaded = match AgentConfig::load(config_path.as_deref()) {
            Ok(config) => config,
            Err(e) => {
                error!("Keeping current configuration: {}", e);
                health.mark_unhealthy("configuration reload failed");
                continue;
            }
        };

        match controller.reload(&reloaded.core).await {
            Ok(()) => health.mark_healthy(),
            Err(e) => {
                error!("Reload failed: {}", e);
                health.mark_unhealthy("configuration reload failed");
            }
        }
    }
}

#[cfg(not(unix))]
async fn reload_on_hangup(_controller: Controller, _config_path: Option<PathBuf>, _health: MetricsRegistry) {}

fn validate_config(config_path: Option<&Path>) -> Result<()> {
    let config = AgentConfig::load(config_path)?;

    println!("Configuration is valid");
    println!("Backend: {}", config.backend.url);
    println!("Interval: {}s", config.core.control.interval_seconds);
    println!("Scrape jobs:");
    for job in &config.core.scrape_jobs {
        match config.core.budgets.jobs.get(&job.name) {
            Some(budget) => println!("  - {} (budget {})", job.name, budget),
            None => println!("  - {} (no budget)", job.name),
        }
    }
    for job in config.core.unmatched_budgets() {
        println!("Warning: budget for unknown job {} is ignored", job);
    }
    if let Some(remote_write) = &config.core.remote_write {
        println!(
            "Remote write: {} (budget {})",
            remote_write.destination, remote_write.budget
        );
    }

    Ok(())
}

fn print_keep_set(config_path: Option<&Path>) -> Result<()> {
    let config = AgentConfig::load(config_path)?;
    for metric in build_keep_set(&config.core.rules).iter() {
        println!("{}", metric);
    }
    Ok(())
}

fn generate_config(output: Option<PathBuf>) -> Result<()> {
    let config = AgentConfig::default();

    if let Some(output_path) = output {
        config.to_file(&output_path)?;
        println!("Generated configuration file: {}", output_path.display());
    } else {
        let yaml = serde_yaml::to_string(&config)
            .map_err(|e| AgentError::Config(format!("cannot encode default configuration: {}", e)))?;
        println!("{}", yaml);
    }

    Ok(())
}
