//! Half-duplex WebSocket reverse proxy.
//!
//! ```text
//!     client ──▶ HttpServer ──▶ HalfDuplexProxy ──▶ backend
//!        ▲                           │
//!        └──── embedder `send` ◀─────┴── backend text → Viewer
//! ```

use std::path::PathBuf;

use clap::Parser;
use tokio::net::TcpListener;

use ws_relay_proxy::config::{self, validation::validate_config, ServerConfig};
use ws_relay_proxy::http::HttpServer;
use ws_relay_proxy::lifecycle::{signals, Shutdown};
use ws_relay_proxy::observability::{logging, metrics, LogInit};

#[derive(Debug, Parser)]
#[command(name = "ws-relay-proxy", version, about = "Half-duplex WebSocket reverse proxy")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override `listener.bind_address`.
    #[arg(long)]
    listen: Option<String>,

    /// Override `backend.url`.
    #[arg(long)]
    backend: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => config::load_config(path)?,
        None => ServerConfig::default(),
    };
    if let Some(listen) = cli.listen {
        config.listener.bind_address = listen;
    }
    if let Some(backend) = cli.backend {
        config.backend.url = backend;
    }
    validate_config(&config).map_err(config::ConfigError::Validation)?;

    logging::init(LogInit {
        level: config.observability.log_level,
        debug_file_path: config.observability.debug_file_path.clone(),
    })?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        bind_address = %config.listener.bind_address,
        backend_url = %config.backend.url,
        natural_tunnel = config.backend.natural_tunnel,
        "ws-relay-proxy starting"
    );

    if config.observability.metrics_enabled {
        let addr = config.observability.metrics_address.parse()?;
        metrics::init_exporter(addr)?;
    }

    let listener = TcpListener::bind(&config.listener.bind_address).await?;
    tracing::info!(address = %listener.local_addr()?, "Listening for connections");

    let shutdown = Shutdown::new();
    tokio::spawn(signals::trigger_on_signal(shutdown.clone()));

    let server = HttpServer::new(&config)?;
    server.run(listener, shutdown).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
