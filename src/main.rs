//! wssh - browser-to-SSH terminal relay.
//!
//! Serves a WebSocket endpoint that browser terminals use to open SSH
//! shells, plus a one-shot `POST /api/exec` endpoint. Runs until Ctrl-C.

use anyhow::Context;
use clap::Parser as ClapParser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use wssh::{
    api,
    config::{self, RelayConfig},
    gateway::Gateway,
    registry::Registry,
    session::InputMode,
    shutdown::ShutdownCoordinator,
    ssh::SshConnector,
};

/// How long open WebSockets get to send their close frames on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// wssh - relay browser terminals to remote SSH shells
#[derive(ClapParser, Debug)]
#[command(name = "wssh", version, about, long_about = None)]
struct Cli {
    /// Address to bind the HTTP/WebSocket server (overrides the config file)
    #[arg(long, env = "WSSH_BIND")]
    bind: Option<SocketAddr>,

    /// Path to the TOML config file
    #[arg(long, env = "WSSH_CONFIG")]
    config: Option<PathBuf>,

    /// How keystrokes are forwarded to remote shells
    #[arg(long, value_enum)]
    input_mode: Option<InputMode>,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "wssh=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_config(cli: &Cli) -> anyhow::Result<RelayConfig> {
    let mut config = match cli.config.clone().or_else(config::default_config_path) {
        Some(path) => RelayConfig::load(&path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => RelayConfig::default(),
    };
    if let Some(bind) = cli.bind {
        config.server.bind = bind;
    }
    if let Some(mode) = cli.input_mode {
        config.relay.input_mode = mode;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let config = load_config(&cli)?;
    tracing::info!(
        bind = %config.server.bind,
        input_mode = ?config.relay.input_mode,
        "wssh starting"
    );

    let connector = Arc::new(SshConnector::new(config.ssh.clone()));
    let gateway = Gateway::new(
        Registry::new(config.relay.max_sessions_per_channel)
            .with_max_line_bytes(config.relay.max_line_bytes),
        connector,
        config.relay.input_mode,
    );
    let shutdown = ShutdownCoordinator::new();
    let state = api::AppState::new(gateway, shutdown.clone(), config.server.max_channels);
    let app = api::router(
        state,
        api::RouterConfig {
            bind: config.server.bind,
            allowed_origins: config.server.allowed_origins.clone(),
        },
    );

    let listener = tokio::net::TcpListener::bind(config.server.bind)
        .await
        .with_context(|| format!("binding {}", config.server.bind))?;
    tracing::info!(addr = %config.server.bind, "HTTP/WS server listening");

    let (server_shutdown_tx, server_shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let http_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                server_shutdown_rx.await.ok();
            })
            .await
    });

    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl+C")?;
    tracing::info!("received Ctrl+C");

    // Signal WebSocket handlers to send close frames
    shutdown.shutdown();
    let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
    while shutdown.active_count() > 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let _ = server_shutdown_tx.send(());

    http_handle
        .await
        .context("HTTP server task panicked")?
        .context("HTTP server failed")?;

    tracing::info!("wssh stopped");
    Ok(())
}
