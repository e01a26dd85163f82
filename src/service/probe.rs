//! Network status probe through a Tor SOCKS port

use std::time::Duration;

use tracing::{debug, instrument, warn};

use crate::error::{Result, TorPoolError};
use crate::models::{NetworkProbeResult, ProcessInstanceConfig, StatusCheckResponse};

/// Fetch the status endpoint through the instance's SOCKS port
///
/// Never fails: transport and parse errors land in the result.
#[instrument(skip(config), fields(socks_port = config.socks_port))]
pub async fn probe_network(
    config: &ProcessInstanceConfig,
    status_url: &str,
    limit: Duration,
) -> NetworkProbeResult {
    match fetch_status(config, status_url, limit).await {
        Ok(response) => {
            let result = NetworkProbeResult::from_response(response);
            debug!(
                "Probe through port {} saw exit {:?} (tor: {})",
                config.socks_port, result.ip, result.is_tor
            );
            result
        }
        Err(e) => {
            warn!("Probe through port {} failed: {}", config.socks_port, e);
            NetworkProbeResult::failed(e.to_string())
        }
    }
}

async fn fetch_status(
    config: &ProcessInstanceConfig,
    status_url: &str,
    limit: Duration,
) -> Result<StatusCheckResponse> {
    let proxy = reqwest::Proxy::all(config.socks_proxy_url())?;
    let client = reqwest::Client::builder()
        .proxy(proxy)
        .timeout(limit)
        .build()?;

    let response = client
        .get(status_url)
        .send()
        .await
        .map_err(|e| TorPoolError::Probe(format!("request failed: {}", e)))?
        .error_for_status()
        .map_err(|e| TorPoolError::Probe(format!("bad status: {}", e)))?;

    let body = response
        .text()
        .await
        .map_err(|e| TorPoolError::Probe(format!("failed to read body: {}", e)))?;

    serde_json::from_str(&body)
        .map_err(|e| TorPoolError::Probe(format!("invalid status response: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeSocksServer, FakeStatusServer};

    const LIMIT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_probe_through_socks() {
        let status = FakeStatusServer::start(true).await;
        let socks = FakeSocksServer::start().await;
        let config = ProcessInstanceConfig::new(1, socks.port);

        let result = probe_network(&config, &status.url(), LIMIT).await;

        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.ip.as_deref(), Some(FakeStatusServer::EXIT_IP));
        assert_eq!(status.hits(), 1);
        assert_eq!(socks.connections(), 1);
    }

    #[tokio::test]
    async fn test_probe_reports_non_tor_exit() {
        let status = FakeStatusServer::start(false).await;
        let socks = FakeSocksServer::start().await;
        let config = ProcessInstanceConfig::new(1, socks.port);

        let result = probe_network(&config, &status.url(), LIMIT).await;

        assert!(!result.success);
        assert!(!result.is_tor);
        assert!(result.error.is_some());
    }

    #[tokio::test]
    async fn test_probe_without_socks_listener_fails_softly() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let config = ProcessInstanceConfig::new(1, port);
        let result = probe_network(&config, "http://127.0.0.1:9/api/ip", LIMIT).await;

        assert!(!result.success);
        assert!(result.error.unwrap().contains("request failed"));
    }
}
