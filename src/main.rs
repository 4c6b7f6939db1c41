#![forbid(unsafe_code)]

//! `exthost`: extension host bridge driver.
//!
//! Loads configuration, builds the extension catalog, launches the guest
//! runtime (or dials a debug target), and keeps the session alive until a
//! shutdown signal arrives or the guest goes away.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use exthost_bridge::config::GlobalConfig;
use exthost_bridge::extensions::ExtensionCatalog;
use exthost_bridge::session::{ExtensionHostSession, SessionState};
use exthost_bridge::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "exthost", about = "Extension host bridge", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Override the workspace root.
    #[arg(long)]
    workspace: Option<PathBuf>,

    /// Extension to activate once the session is active (repeatable).
    #[arg(long = "activate", value_name = "ID")]
    activate: Vec<String>,

    /// Connect to an already running guest at `host:port` instead of
    /// launching one.
    #[arg(long, value_name = "HOST:PORT")]
    debug_connect: Option<String>,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("exthost bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let mut config = GlobalConfig::load_from_path(&args.config)?;
    if let Some(ws) = &args.workspace {
        config.set_workspace_root(ws)?;
    }
    for id in args.activate {
        if !config.activate.contains(&id) {
            config.activate.push(id);
        }
    }
    if let Some(target) = &args.debug_connect {
        let (host, port) = parse_debug_target(target)?;
        config.transport.debug_host = Some(host);
        config.transport.debug_port = Some(port);
    }
    info!(workspace = %config.workspace_root.display(), "configuration loaded");

    // ── Build catalog and session ───────────────────────
    let catalog = ExtensionCatalog::from_config(&config)?;
    info!(extensions = catalog.len(), "extension catalog built");

    let session = ExtensionHostSession::new(config, catalog);
    if let Err(err) = session.start().await {
        error!(%err, "session startup failed");
        return Err(err);
    }
    info!(session_id = session.id(), pid = ?session.guest_pid(), "session active");

    // ── Run until signal or guest exit ──────────────────
    let mut states = session.subscribe_state();
    tokio::select! {
        () = shutdown_signal() => info!("shutdown signal received"),
        changed = states.wait_for(|state| *state != SessionState::Active) => {
            let state = changed.map_or(SessionState::Disposed, |state| *state);
            warn!(%state, failure = ?session.failure(), "session left active state");
        }
    }

    for (id, status) in session.host_services().activations().snapshot() {
        info!(extension = %id, ?status, "activation summary");
    }

    session.dispose().await;
    info!("exthost shut down");
    Ok(())
}

fn parse_debug_target(raw: &str) -> Result<(String, u16)> {
    let (host, port) = raw
        .rsplit_once(':')
        .ok_or_else(|| AppError::Config(format!("debug target '{raw}' must be host:port")))?;
    let port = port
        .parse()
        .map_err(|err| AppError::Config(format!("invalid debug port '{port}': {err}")))?;
    Ok((host.to_owned(), port))
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
