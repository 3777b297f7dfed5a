use std::io;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::EnvFilter;

use throttle_rs::config::{self, Config, ConfigError};
use throttle_rs::metrics::start_metrics_server;
use throttle_rs::server::{SinkOptions, SinkServer};
use throttle_rs::{LimitingListener, ListenerOptions};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(Level::INFO.into())
                .from_env_lossy(),
        )
        .init();

    // Load configuration
    let config = load_or_default_config()?;

    if let Some(metrics_addr) = config.metrics.listen_addr.clone() {
        tokio::spawn(async move {
            if let Err(e) = start_metrics_server(&metrics_addr).await {
                error!(error = %e, "Metrics server failed");
            }
        });
    }

    let addr = config.listen_addr();
    let tcp_listener = TcpListener::bind(&addr).await?;
    let listener = LimitingListener::with_options(tcp_listener, ListenerOptions::from(&config))?;

    info!(
        addr = %addr,
        per_connection = config.limits.per_connection,
        global = config.limits.global,
        scheduled_updates = config.schedule.len(),
        "Throttling sink server listening"
    );

    let server = SinkServer::new(listener, SinkOptions::from(&config));
    let shutdown = CancellationToken::new();

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl-C, shutting down"),
            Err(e) => error!(error = %e, "Failed to listen for Ctrl-C"),
        }
        signal_token.cancel();
    });

    server.run(shutdown).await;
    Ok(())
}

/// Default config locations, tried after `$THROTTLE_CONFIG`
const DEFAULT_CONFIG_PATHS: [&str; 2] = ["config/throttle.toml", "throttle.toml"];

/// Load the first config file that exists
///
/// A missing file moves on to the next candidate; a file that exists but does
/// not parse or validate is an error.
fn load_or_default_config() -> Result<Config, ConfigError> {
    let candidates = std::env::var("THROTTLE_CONFIG")
        .into_iter()
        .chain(DEFAULT_CONFIG_PATHS.iter().map(|p| p.to_string()));

    for path in candidates {
        match config::load_config(&path) {
            Ok(config) => {
                info!(path = %path, "Loaded configuration");
                return Ok(config);
            }
            Err(ConfigError::IoError(e)) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path, "No config file");
            }
            Err(e) => {
                warn!(path = %path, error = %e, "Failed to load config");
                return Err(e);
            }
        }
    }

    info!("Using default configuration");
    Ok(Config::default())
}
