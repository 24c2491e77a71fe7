#![forbid(unsafe_code)]

//! `acp-conduit` — run an ACP agent subprocess from the command line.
//!
//! Bootstraps configuration and tracing, connects to the configured agent,
//! and either sends a single prompt turn or stays attached until a shutdown
//! signal arrives, echoing streamed agent output to stdout.

use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use serde_json::Value;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use acp_conduit::permission::NullChooser;
use acp_conduit::proto::wire::{SessionNotification, SessionUpdate};
use acp_conduit::{AgentConnection, AppError, ConduitConfig, ConnectionState, Result, UiSink};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "acp-conduit", about = "ACP agent bridge", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Override the configured workspace root.
    #[arg(long)]
    workspace: Option<PathBuf>,

    /// Prompt to send; with no prompt the bridge stays attached until
    /// interrupted.
    prompt: Option<String>,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("acp-conduit bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    let mut config = ConduitConfig::load_from_path(&args.config)?;

    if let Some(ws) = args.workspace {
        config.workspace_root = ws
            .canonicalize()
            .map_err(|err| AppError::Config(format!("invalid workspace override: {err}")))?;
    }
    info!(workspace = %config.workspace_root.display(), "configuration loaded");

    // No interactive chooser on the CLI: permission requests not decided by
    // policy resolve as cancelled.
    let connection = AgentConnection::new(config, Arc::new(NullChooser));
    connection.subscribe(Arc::new(ConsoleSink));

    connection.connect().await?;

    if let Some(prompt) = args.prompt {
        let result = connection.prompt(&prompt).await?;
        println!();
        info!(stop_reason = %result.stop_reason, "prompt turn finished");
    } else {
        info!("attached; press ctrl-c to disconnect");
        shutdown_signal().await;
        info!("shutdown signal received");
    }

    connection.disconnect();
    Ok(())
}

/// Echoes agent message chunks to stdout and logs lifecycle changes.
struct ConsoleSink;

impl UiSink for ConsoleSink {
    fn on_state_change(&self, state: ConnectionState) {
        info!(?state, "connection state changed");
    }

    fn on_session_update(&self, notification: &SessionNotification) {
        if let SessionUpdate::AgentMessageChunk { content } = &notification.update {
            if let Some(text) = content.get("text").and_then(Value::as_str) {
                print!("{text}");
                let _ = std::io::stdout().flush();
            }
        }
    }
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
                warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
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
