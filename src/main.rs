//! Reference host for the proxy engines.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use clap::Parser;
use tokio::net::TcpListener;

use web_proxy::config::{load_config, watcher::restart_required, ConfigWatcher, ProxyConfig};
use web_proxy::lifecycle::{spawn_signal_handler, Shutdown};
use web_proxy::net::tls::load_server_config;
use web_proxy::observability::{logging, metrics};
use web_proxy::{ClientSettings, HttpServer, TlsContext, TokenAuth, UpstreamClient};

#[derive(Parser, Debug)]
#[command(name = "web-proxy", version, about = "Authenticated HTTP and WebSocket reverse proxy")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override `listener.bind_address`.
    #[arg(short, long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => ProxyConfig::default(),
    };
    if let Some(bind) = cli.bind {
        config.listener.bind_address = bind;
    }

    logging::init_logging(&config.observability.log_level);
    tracing::info!("web-proxy v{} starting", env!("CARGO_PKG_VERSION"));

    if rustls::crypto::ring::default_provider().install_default().is_err() {
        tracing::debug!("rustls crypto provider already installed");
    }

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse::<SocketAddr>() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(e) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                error = %e,
                "Failed to parse metrics address"
            ),
        }
    }

    let default_tls = match &config.client.ca_bundle {
        Some(bundle) => TlsContext::with_ca_bundle(Path::new(bundle))?,
        None => TlsContext::platform_default()?,
    };
    let client = UpstreamClient::new(default_tls, ClientSettings::from(&config.client))?;
    let auth = TokenAuth::new(config.auth.tokens.clone());
    if config.auth.tokens.is_empty() {
        tracing::warn!("No auth tokens configured, only routes allowing unauthenticated callers will forward");
    }

    let shutdown = Shutdown::new();
    spawn_signal_handler(&shutdown);

    // Keep the watcher alive for the lifetime of the server.
    let _watcher = match &cli.config {
        Some(path) => {
            let (watcher, mut updates) = ConfigWatcher::new(path);
            let auth = auth.clone();
            let current = config.clone();
            tokio::spawn(async move {
                while let Some(new_config) = updates.recv().await {
                    auth.replace(new_config.auth.tokens.clone());
                    let pending = restart_required(&current, &new_config);
                    if !pending.is_empty() {
                        tracing::warn!(sections = ?pending, "Config changes require a restart to apply");
                    }
                }
            });
            match watcher.run() {
                Ok(handle) => Some(handle),
                Err(e) => {
                    tracing::error!(error = %e, "Failed to start config watcher");
                    None
                }
            }
        }
        None => None,
    };

    let server = HttpServer::new(&config, client, auth)?;

    match &config.listener.tls {
        Some(tls) => {
            let addr: SocketAddr = config.listener.bind_address.parse()?;
            let tls = load_server_config(Path::new(&tls.cert_path), Path::new(&tls.key_path)).await?;
            server.run_tls(addr, tls, shutdown).await?;
        }
        None => {
            let listener = TcpListener::bind(&config.listener.bind_address).await?;
            tracing::info!(address = %listener.local_addr()?, "Listening for connections");
            server.run(listener, shutdown).await?;
        }
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
