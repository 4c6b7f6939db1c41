#![forbid(unsafe_code)]

//! `exthost-guest`: reference guest runtime.
//!
//! Launched by the `exthost` host with the connection target in its
//! environment. Connects back, completes the handshake and serves the guest
//! services until the host terminates the session.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use exthost_bridge::guest::{GuestExit, GuestOptions, GuestRuntime};
use exthost_bridge::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "exthost-guest", about = "Reference extension host guest runtime", version, long_about = None)]
struct Cli {
    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Seconds to wait for the host to accept the connection.
    #[arg(long, default_value_t = 10)]
    connect_timeout_secs: u64,

    /// Seconds to wait for the init payload after `Ready`.
    #[arg(long, default_value_t = 10)]
    init_timeout_secs: u64,

    /// Entry module handed over by the host; only logged.
    entry: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Setup(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    info!(entry = ?args.entry, pid = std::process::id(), "exthost-guest starting");

    let options = GuestOptions {
        connect_timeout: Duration::from_secs(args.connect_timeout_secs),
        init_timeout: Duration::from_secs(args.init_timeout_secs),
        ..GuestOptions::default()
    };
    let runtime = GuestRuntime::connect_from_env(&options).await.map_err(|err| {
        error!(%err, "guest startup failed");
        err
    })?;

    let shutdown = CancellationToken::new();
    let signal_ct = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received");
        signal_ct.cancel();
    });

    match runtime.serve(shutdown).await {
        GuestExit::Terminated => info!("terminated by host"),
        GuestExit::Shutdown => info!("stopped by signal"),
        GuestExit::Disconnected(reason) => info!(%reason, "host disconnected"),
    }
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

/// Logs go to stderr; the host forwards both streams line by line.
fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_ansi(false);

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
