//! SSE bridge daemon.
//!
//! Receives client connections from Apache via SCM_RIGHTS and streams
//! generated tokens to them as Server-Sent Events.
//!
//! # Usage
//!
//! ```bash
//! # With config file
//! sse-bridged config/bridge.toml
//!
//! # With environment variables
//! BRIDGE_SOCKET_PATH=/var/run/test.sock sse-bridged
//!
//! # OpenAI-compatible upstream
//! OPENAI_API_KEY=... sse-bridged --generator openai
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use sse_stream_bridge::{
    config::{Config, LoggingConfig},
    generation::create_generator,
    metrics::{init_metrics, start_metrics_server},
    server::{ConnectionHandler, HandoffListener},
    shutdown::ShutdownCoordinator,
};

/// SSE bridge daemon for Apache socket handoffs.
#[derive(Parser, Debug)]
#[command(name = "sse-bridged")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (TOML).
    #[arg(value_name = "CONFIG")]
    config: Option<PathBuf>,

    /// Override socket path.
    #[arg(short, long)]
    socket: Option<String>,

    /// Override generator provider (mock, openai).
    #[arg(short, long)]
    generator: Option<String>,

    /// Enable debug logging.
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = Config::load(args.config.as_ref())?;
    if let Some(socket) = args.socket {
        config.server.socket_path = socket;
    }
    if let Some(generator) = args.generator {
        config.generator.provider = generator;
    }
    if args.debug {
        config.logging.level = "debug".to_string();
    }

    init_logging(&config.logging)?;

    tracing::info!(
        socket_path = %config.server.socket_path,
        generator = %config.generator.provider,
        max_connections = config.server.max_connections,
        "Starting SSE bridge daemon"
    );

    init_metrics();
    if config.metrics.enabled {
        let addr = config.metrics.listen_addr.parse()?;
        start_metrics_server(addr).await?;
    }

    let generator = create_generator(&config.generator)?;
    tracing::info!(generator = generator.name(), "Generator initialized");

    let shutdown = ShutdownCoordinator::new();
    let listener = HandoffListener::bind(&config.server, shutdown.clone()).await?;
    tracing::info!(
        socket_path = %listener.socket_path().display(),
        "Daemon listening"
    );

    tokio::spawn(handle_signals(shutdown.clone()));

    let handler = Arc::new(ConnectionHandler::new(config.server.clone(), generator));

    while let Some(conn) = listener.accept().await {
        let handler = handler.clone();
        tokio::spawn(async move {
            // The connection permit stays in `conn` until this task ends.
            handler.handle(conn.stream, conn.guard).await;
        });
    }
    tracing::info!("Accept loop terminated");

    tracing::info!(
        active = shutdown.active_streams(),
        timeout_secs = config.server.shutdown_timeout_secs,
        "Waiting for streams to drain"
    );
    match tokio::time::timeout(config.server.shutdown_timeout(), shutdown.wait_for_drain()).await
    {
        Ok(()) => tracing::info!("All streams drained"),
        Err(_) => tracing::warn!(
            active = shutdown.active_streams(),
            "Shutdown timeout reached, forcing exit"
        ),
    }

    tracing::info!("Daemon stopped");
    Ok(())
}

/// Initialize logging with tracing.
fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let filter =
        EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&config.level))?;

    match config.format.as_str() {
        "json" => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init(),
        _ => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .init(),
    }

    Ok(())
}

/// Handle Unix signals until shutdown is requested.
async fn handle_signals(shutdown: ShutdownCoordinator) {
    let (mut sigint, mut sigterm, mut sighup) = match (
        signal(SignalKind::interrupt()),
        signal(SignalKind::terminate()),
        signal(SignalKind::hangup()),
    ) {
        (Ok(int), Ok(term), Ok(hup)) => (int, term, hup),
        _ => {
            tracing::error!("Failed to register signal handlers");
            return;
        }
    };

    loop {
        tokio::select! {
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, initiating shutdown");
                shutdown.shutdown();
                break;
            }
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, initiating shutdown");
                shutdown.shutdown();
                break;
            }
            _ = sighup.recv() => {
                tracing::info!(
                    active_streams = shutdown.active_streams(),
                    "Received SIGHUP, status report"
                );
            }
        }
    }
}
