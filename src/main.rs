#![forbid(unsafe_code)]

//! `azurite-session`: run, probe, or clean a local Azurite emulator.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use azurite_session::models::session::SessionSnapshot;
use azurite_session::notify::LogNotifier;
use azurite_session::orchestrator::probe::probe_features;
use azurite_session::orchestrator::{CleanOutcome, SessionEvent, StartOutcome, StopReason};
use azurite_session::process::TokioLauncher;
use azurite_session::{AppError, AzuriteConfig, Result, SessionManager};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "azurite-session", about = "Local Azurite emulator supervisor", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Override the configured workspace directory.
    #[arg(long)]
    workspace: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the emulator and supervise it until interrupted or it exits.
    Run,
    /// Delete and recreate the workspace directory.
    Clean,
    /// Print the optional features the emulator supports, as JSON.
    Probe,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    let mut config = AzuriteConfig::load_from_path(&args.config)?;
    if let Some(ws) = args.workspace {
        config.workspace_path = ws;
    }
    info!(config = %args.config.display(), "configuration loaded");

    let launcher = Arc::new(TokioLauncher);
    let manager = SessionManager::new(launcher.clone(), Arc::new(LogNotifier));

    match args.command {
        Command::Run => supervise(&manager, &config).await,
        Command::Clean => match manager.clean(&config.workspace_path).await {
            CleanOutcome::Cleaned => Ok(()),
            CleanOutcome::Failed(reason) => Err(AppError::Io(reason)),
        },
        Command::Probe => {
            let features =
                probe_features(launcher.as_ref(), &config.executable_path, config.probe_timeout())
                    .await;
            let json = serde_json::to_string_pretty(&features)
                .map_err(|err| AppError::Probe(format!("failed to encode features: {err}")))?;
            println!("{json}");
            Ok(())
        }
    }
}

async fn supervise(manager: &SessionManager, config: &AzuriteConfig) -> Result<()> {
    let mut events = manager.events().subscribe_channel();
    let cancel = CancellationToken::new();

    let start = manager.start_with_cancel(config, &cancel);
    let outcome = tokio::select! {
        outcome = start => outcome,
        () = shutdown_signal() => {
            cancel.cancel();
            info!("shutdown signal received during start");
            return Ok(());
        }
    };

    let info = match outcome {
        StartOutcome::Started(info) => info,
        StartOutcome::AlreadyRunning | StartOutcome::Cancelled => return Ok(()),
        StartOutcome::Rejected(reason) => return Err(AppError::Config(reason)),
        StartOutcome::SpawnFailed(reason) => return Err(AppError::Spawn(reason)),
    };
    print_snapshot(&SessionSnapshot::Active(info))?;

    let crashed = tokio::select! {
        () = shutdown_signal() => {
            info!("shutdown signal received");
            None
        }
        reason = wait_for_stop(&mut events) => reason,
    };
    manager.shutdown().await;
    print_snapshot(&manager.snapshot())?;

    match crashed.as_ref().and_then(StopReason::crash_error) {
        Some(err) => {
            error!(%err, "emulator exited");
            Err(err)
        }
        None => Ok(()),
    }
}

async fn wait_for_stop(
    events: &mut tokio::sync::mpsc::UnboundedReceiver<SessionEvent>,
) -> Option<StopReason> {
    while let Some(event) = events.recv().await {
        if let SessionEvent::Stopped { reason, .. } = event {
            return Some(reason);
        }
    }
    None
}

fn print_snapshot(snapshot: &SessionSnapshot) -> Result<()> {
    let json = serde_json::to_string(snapshot)
        .map_err(|err| AppError::Io(format!("failed to encode session state: {err}")))?;
    println!("{json}");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter).with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
