//! torpool - Entry Point
//!
//! Starts the default pool of Tor processes, optionally fetches one URL
//! through it, and keeps the pool up until shutdown.

use std::env;

use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use torpool::config::LogConfig;
use torpool::models::ClientStatus;
use torpool::{Config, TorPoolFactory};

#[tokio::main]
async fn main() -> torpool::Result<()> {
    // Load configuration
    let config = Config::from_env()?;
    init_tracing(&config.log);
    info!("Starting torpool");

    let factory = TorPoolFactory::new(&config);
    let pool = factory.get_or_default().await?;

    if pool.status() == ClientStatus::ConnectedToProxy {
        info!("Pool ready with {} clients", pool.len());
    } else {
        warn!("Pool started with failures (status: {})", pool.status());
    }

    for client in pool.clients() {
        match client.last_probe() {
            Some(probe) if probe.success => {
                info!("{}: exit address {}", client.id(), probe.ip.unwrap_or_default())
            }
            _ => warn!(
                "{}: {}",
                client.id(),
                client.last_error().unwrap_or_else(|| client.status().to_string())
            ),
        }
    }

    if let Ok(url) = env::var("TORPOOL_FETCH_URL") {
        match pool.get(&url).await {
            Ok(response) => {
                let status = response.status();
                match response.text().await {
                    Ok(body) => info!("Fetched {} ({}, {} bytes)", url, status, body.len()),
                    Err(e) => error!("Failed to read body of {}: {}", url, e),
                }
            }
            Err(e) => error!("Failed to fetch {}: {}", url, e),
        }
    }

    // Wait for shutdown signal
    shutdown_signal().await;
    info!("Shutdown signal received");

    factory.disconnect_all().await;
    // Failed pools are not registered with the factory.
    if pool.status() != ClientStatus::Disconnected {
        pool.disconnect_all().await;
    }

    info!("torpool stopped");
    Ok(())
}

fn init_tracing(log: &LogConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("torpool={}", log.level).into());

    if log.format.eq_ignore_ascii_case("json") {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
