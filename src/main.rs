#![forbid(unsafe_code)]

//! `channel-supervisor` — session lifecycle and connection health supervisor.
//!
//! Bootstraps configuration, runs the startup sequence (reaper, session
//! activation, health monitor, periodic jobs), serves the admin IPC socket
//! for `channel-supervisor-ctl`, and shuts everything down on SIGINT/SIGTERM.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use channel_supervisor::config::GlobalConfig;
use channel_supervisor::engine::chromium::ChromiumEngine;
use channel_supervisor::ipc::server::{spawn_ipc_server, IpcContext};
use channel_supervisor::orchestrator::startup::Orchestrator;
use channel_supervisor::process_table::SystemProcessTable;
use channel_supervisor::scheduler::command_job::CommandJob;
use channel_supervisor::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "channel-supervisor", about = "Messaging channel session supervisor", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("channel-supervisor bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let config = GlobalConfig::load_from_path(&args.config)?;
    info!(
        sessions = config.sessions.len(),
        jobs = config.jobs.len(),
        data_dir = %config.data_dir.display(),
        "configuration loaded"
    );

    // ── Wire components ─────────────────────────────────
    let ct = CancellationToken::new();
    let engine = Arc::new(ChromiumEngine::new(config.engine.clone())?);
    let orchestrator = Orchestrator::from_config(
        &config,
        engine,
        Arc::new(SystemProcessTable::new()),
        ct.clone(),
    )?;

    // Signals during startup cancel the remaining phases.
    let signal_ct = ct.clone();
    let signal_handle = tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received");
        signal_ct.cancel();
    });

    // ── Admin IPC ───────────────────────────────────────
    // The supervisor refuses `activate` until startup reaches activation.
    let context = Arc::new(IpcContext {
        supervisor: Arc::clone(orchestrator.supervisor()),
        auth_token: config.ipc_auth_token.clone(),
    });
    let ipc_handle = spawn_ipc_server(&config.ipc_name, context, ct.clone())?;

    // ── Startup sequence ────────────────────────────────
    let jobs: Vec<CommandJob> = config.jobs.iter().map(CommandJob::from).collect();
    let running = orchestrator
        .start(move |scheduler| {
            for job in jobs {
                job.register(scheduler)?;
            }
            Ok(())
        })
        .await
        .map_err(|err| {
            error!(%err, "startup failed");
            err
        })?;

    info!("channel-supervisor ready");

    // ── Wait for shutdown ───────────────────────────────
    ct.cancelled().await;
    running.shutdown().await;

    signal_handle.abort();
    let _ = ipc_handle.await;
    info!("channel-supervisor shut down");

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
    let subscriber = fmt().with_env_filter(env_filter);

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
