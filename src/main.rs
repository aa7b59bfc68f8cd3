#![forbid(unsafe_code)]

//! `server-launcher` — runs and supervises the game server modules.
//!
//! Loads `config.toml`, writes the mods manifest, starts every enabled
//! module, and keeps crashed jobs running until a shutdown signal arrives
//! or a worker requests shutdown over the control socket.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use server_launcher::control;
use server_launcher::resolver::NodePackageResolver;
use server_launcher::scheduler::process::ProcessScheduler;
use server_launcher::{AppError, LauncherConfig, ModuleManager, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "server-launcher", about = "Game server module supervisor", version, long_about = None)]
struct Cli {
    /// Server directory holding `config.toml`; relative paths resolve here.
    #[arg(long)]
    dir: Option<PathBuf>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("server-launcher bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    if let Some(dir) = &args.dir {
        std::env::set_current_dir(dir).map_err(|err| {
            AppError::Config(format!("cannot enter {}: {err}", dir.display()))
        })?;
    }
    let config = LauncherConfig::load(".")?;
    let enabled: Vec<&'static str> = config.enabled_modules().map(|d| d.name).collect();
    info!(
        mods = config.mods.len(),
        bots = config.bots.len(),
        processors = config.processors,
        "configuration loaded"
    );

    let control_path = config
        .launcher
        .control_socket()
        .map(std::path::absolute)
        .transpose()
        .map_err(|err| AppError::Config(format!("invalid control socket path: {err}")))?;

    // ── Build the manager ───────────────────────────────
    let mut scheduler = ProcessScheduler::new(config.launcher.runtime.clone());
    if let Some(path) = &control_path {
        scheduler = scheduler.with_control(path.clone());
    }
    let resolver = Arc::new(NodePackageResolver::new(&config.launcher.package_root));
    let manager = ModuleManager::new(config, Arc::new(scheduler), resolver);

    let ct = CancellationToken::new();
    let terminate = CancellationToken::new();
    let listener = manager.spawn_exit_listener(ct.clone());
    let control_server = control_path
        .as_deref()
        .map(|path| control::spawn_control_server(path, terminate.clone(), ct.clone()))
        .transpose()?;

    // ── Manifest, then modules ──────────────────────────
    manager.write_mods().await?;

    for module in enabled {
        if let Err(err) = manager.start_module(module).await {
            error!(module, %err, "module failed to start");
            ct.cancel();
            if let Err(stop_err) = manager.stop_all().await {
                error!(%stop_err, "cleanup after failed start was incomplete");
            }
            let _ = listener.await;
            if let Some(server) = control_server {
                let _ = server.await;
            }
            return Err(err);
        }
    }
    info!("all modules started");

    // ── Wait for shutdown signal or worker request ──────
    tokio::select! {
        () = shutdown_signal() => info!("shutdown signal received"),
        () = terminate.cancelled() => info!("worker requested shutdown"),
    }

    if let Err(err) = manager.stop_all().await {
        error!(%err, "error while stopping modules");
    }
    ct.cancel();
    let _ = listener.await;
    if let Some(server) = control_server {
        let _ = server.await;
    }
    info!("server-launcher shut down");

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
