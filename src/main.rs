//! termhub server daemon: HTTP/WebSocket access to shared shell sessions.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use termhub::{
    api,
    config::{Config, ConfigError},
    session::SessionRegistry,
};

/// termhub - shared terminal sessions over HTTP/WebSocket.
///
/// Spawns shells in pseudo-terminals and lets multiple clients attach to,
/// observe, and drive the same session concurrently.
#[derive(Parser, Debug)]
#[command(name = "termhub", version, about, long_about = None)]
struct Cli {
    /// Address to bind the HTTP/WebSocket server
    #[arg(long, env = "TERMHUB_BIND", default_value = "127.0.0.1:8080")]
    bind: SocketAddr,

    /// Path to a TOML config file
    #[arg(long, env = "TERMHUB_CONFIG")]
    config: Option<PathBuf>,

    /// Root directory for per-project workspaces (overrides config)
    #[arg(long, env = "TERMHUB_WORKSPACE")]
    workspace: Option<PathBuf>,

    /// Shell to spawn in new sessions (overrides config and $SHELL)
    #[arg(long)]
    shell: Option<String>,
}

#[derive(Error, Debug)]
enum MainError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to bind {0}: {1}")]
    Bind(SocketAddr, #[source] std::io::Error),

    #[error("server error: {0}")]
    Serve(#[source] std::io::Error),
}

#[tokio::main]
async fn main() -> Result<(), MainError> {
    init_tracing();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load(path)?.unwrap_or_else(|| {
            tracing::warn!(path = %path.display(), "config file not found, using defaults");
            Config::default()
        }),
        None => Config::default(),
    };
    if let Some(workspace) = cli.workspace {
        config.workspace_root = workspace;
    }
    if cli.shell.is_some() {
        config.shell = cli.shell;
    }

    let sessions = SessionRegistry::new(config);
    let state = api::AppState {
        sessions: sessions.clone(),
    };

    let listener = tokio::net::TcpListener::bind(cli.bind)
        .await
        .map_err(|e| MainError::Bind(cli.bind, e))?;
    tracing::info!(addr = %cli.bind, "termhub listening");

    // `serve` ends every session when the signal fires, before draining
    // connections; no child process or PTY descriptor survives a controlled
    // exit.
    api::serve(listener, state, shutdown_signal())
        .await
        .map_err(MainError::Serve)?;

    // Catches anything created while connections drained.
    sessions.cleanup_all().await;
    tracing::info!("termhub shut down");
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "termhub=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(?e, "failed to install ctrl-c handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => tracing::error!(?e, "failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received ctrl-c, shutting down"),
        _ = terminate => tracing::info!("received SIGTERM, shutting down"),
    }
}
