//! Switchyard router
//!
//! TLS-terminating proxy that routes gRPC connections by service name.
//!
//! This service:
//! - Loads the routing file and TLS material at startup
//! - Accepts TLS connections on the configured port
//! - Reads the first request's `:path` to identify the gRPC service
//! - Relays the connection, prefix included, to the matching backend
//! - Falls back to the default backend for anything it cannot identify

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use switchyard_router::config::{RouterConfig, Settings};
use switchyard_router::proxy::Listener;
use switchyard_router::tls;

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to ROUTER_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| settings.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting switchyard router");

    let config = RouterConfig::load(&settings.config_path)
        .and_then(RouterConfig::validate)
        .with_context(|| format!("Invalid routing file {}", settings.config_path.display()))?;

    info!(
        config_path = %settings.config_path.display(),
        listen_port = config.listen_port,
        services = ?config.routing_table.identifiers(),
        fallback = %config.routing_table.fallback(),
        "Configuration loaded"
    );

    let acceptor = tls::load_acceptor(&config.tls.cert_file, &config.tls.key_file)
        .context("Failed to load TLS certificate and key")?;

    let listener_config = settings.listener_config(config.listen_port);
    let bind_addr = listener_config.bind_addr;

    let listener = match Listener::bind(
        listener_config,
        Arc::new(config.routing_table),
        acceptor,
    )
    .await
    {
        Ok(listener) => Arc::new(listener),
        Err(e) => {
            error!(bind_addr = %bind_addr, error = %e, "Failed to bind listener");
            return Err(e.into());
        }
    };

    tokio::select! {
        result = listener.run() => {
            if let Err(e) = &result {
                error!(error = %e, "Listener error");
            }
            result?;
        }
        result = shutdown_signal() => {
            result?;
            info!("Shutdown signal received, stopping listener");
        }
    }

    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = sigterm.recv() => {}
            result = tokio::signal::ctrl_c() => result?,
        }
        Ok(())
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}
