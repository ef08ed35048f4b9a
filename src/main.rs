mod batch;
mod config;
mod encoding;
mod error;
mod error_tracker;
mod health;
mod journal;
mod model;
mod orchestrator;
mod pipeline;
mod retention;
mod upload;
mod watcher;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use config::AgentConfig;
use orchestrator::Orchestrator;

#[derive(Parser)]
#[command(name = "edge-log-agent", version, about = "Edge log-collection agent")]
struct Cli {
    /// Path to the TOML config file.
    #[arg(long, short = 'c', default_value = "config.toml", global = true)]
    config: PathBuf,

    /// Extra directories to monitor, appended to the config file's list.
    #[arg(long = "watch", global = true)]
    extra_paths: Vec<PathBuf>,

    /// Override `log.level` from the config file.
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the agent (default if no subcommand is given).
    Run,
    /// Load and validate the config file, then exit.
    CheckConfig,
    /// Run filesystem and upload-endpoint health checks, then exit.
    Health,
}

fn init_logging(config: &AgentConfig) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log.level.clone()));

    match &config.log.dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating log directory: {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "edge-log-agent.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_env_filter(filter)
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
            Ok(None)
        }
    }
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let ctrl_c = tokio::signal::ctrl_c();
    let mut sigterm =
        signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");

    tokio::select! {
        _ = ctrl_c => { info!("received SIGINT"); }
        _ = sigterm.recv() => { info!("received SIGTERM"); }
    }
}

fn load_config(cli: &Cli) -> Result<AgentConfig, anyhow::Error> {
    let config = AgentConfig::load(&cli.config)
        .with_context(|| format!("loading config: {}", cli.config.display()))?;
    Ok(config.with_overrides(&cli.extra_paths, cli.log_level.as_deref()))
}

fn main() -> std::process::ExitCode {
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("config error: {e:#}");
            return std::process::ExitCode::from(1);
        }
    };

    let command = cli.command.unwrap_or(Commands::Run);
    if matches!(command, Commands::CheckConfig) {
        println!("config OK: {} monitoring path(s)", config.monitoring_paths.len());
        return std::process::ExitCode::SUCCESS;
    }

    let _guard = match init_logging(&config) {
        Ok(g) => g,
        Err(e) => {
            eprintln!("logging setup failed: {e:#}");
            return std::process::ExitCode::from(1);
        }
    };

    let rt = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start tokio runtime: {e:#}");
            return std::process::ExitCode::from(2);
        }
    };

    let result = rt.block_on(async move {
        match command {
            Commands::Run => run(config).await,
            Commands::Health => run_health_check(config).await,
            Commands::CheckConfig => unreachable!("handled above"),
        }
    });

    match result {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "fatal error");
            std::process::ExitCode::from(2)
        }
    }
}

async fn run(config: AgentConfig) -> Result<()> {
    let orchestrator = Orchestrator::new(config).context("constructing orchestrator")?;
    let cancel = CancellationToken::new();

    let watch_cancel = cancel.clone();
    let watcher_handle = tokio::spawn(async move {
        shutdown_signal().await;
        watch_cancel.cancel();
    });

    orchestrator.run(cancel).await?;
    watcher_handle.abort();
    info!("agent stopped cleanly");
    Ok(())
}

async fn run_health_check(config: AgentConfig) -> Result<()> {
    let orchestrator = Orchestrator::new(config).context("constructing orchestrator")?;
    let report = orchestrator.health_snapshot().await;
    println!("{}", serde_json::to_string_pretty(&report)?);
    if report.filesystem == model::HealthState::Unhealthy || report.iothub == model::HealthState::Unhealthy {
        anyhow::bail!("one or more subsystems unhealthy");
    }
    Ok(())
}
