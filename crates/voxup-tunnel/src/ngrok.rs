//! ngrok adapter
//!
//! Discovery goes through ngrok's local control-plane API
//! (`GET http://127.0.0.1:4040/api/tunnels`), which lists active tunnels
//! with their local address and public URL.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::debug;
use url::Url;
use voxup_core::ProviderKind;

use crate::handle::TunnelHandle;
use crate::provider::{TunnelError, TunnelProvider, DISCOVERY_POLL};

/// Default ngrok control-plane endpoint
const DEFAULT_CONTROL_URL: &str = "http://127.0.0.1:4040";

pub struct NgrokProvider {
    control_url: String,
    client: reqwest::Client,
}

impl Default for NgrokProvider {
    fn default() -> Self {
        Self::new(DEFAULT_CONTROL_URL)
    }
}

impl NgrokProvider {
    pub fn new(control_url: &str) -> Self {
        Self {
            control_url: control_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    async fn list_tunnels(&self) -> Result<TunnelsResponse, TunnelError> {
        let url = format!("{}/api/tunnels", self.control_url);
        let response = self.client.get(&url).send().await?;
        Ok(response.json().await?)
    }
}

#[async_trait]
impl TunnelProvider for NgrokProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Ngrok
    }

    async fn spawn(&self, local_port: u16) -> Result<TunnelHandle, TunnelError> {
        let args = crate::provider::spawn_args(ProviderKind::Ngrok, local_port);
        let mut cmd = Command::new(&args[0]);
        cmd.args(&args[1..]);
        TunnelHandle::spawn(ProviderKind::Ngrok, local_port, &mut cmd).await
    }

    async fn discover(
        &self,
        handle: &mut TunnelHandle,
        timeout: Duration,
    ) -> Result<Url, TunnelError> {
        let deadline = Instant::now() + timeout;
        let local_port = handle.local_port();

        loop {
            if handle.has_exited() {
                return Err(TunnelError::ProviderUnavailable {
                    provider: ProviderKind::Ngrok.binary().to_string(),
                    reason: handle
                        .recent_output()
                        .last()
                        .cloned()
                        .unwrap_or_else(|| "ngrok exited during discovery".to_string()),
                });
            }

            // The control API only answers once the agent is up; connection
            // errors here just mean "not yet".
            match self.list_tunnels().await {
                Ok(response) => {
                    if let Some(public_url) = find_tunnel_url(&response, local_port) {
                        return Ok(Url::parse(public_url)?);
                    }
                    debug!(local_port, "ngrok is up but the tunnel is not listed yet");
                }
                Err(TunnelError::ControlApi(e)) => {
                    debug!(error = %e, "ngrok control API not reachable yet");
                }
                Err(e) => return Err(e),
            }

            if Instant::now() + DISCOVERY_POLL > deadline {
                return Err(TunnelError::DiscoveryTimeout {
                    local_port,
                    timeout,
                });
            }
            tokio::time::sleep(DISCOVERY_POLL).await;
        }
    }
}

/// `GET /api/tunnels` payload
#[derive(Debug, Deserialize)]
struct TunnelsResponse {
    tunnels: Vec<ApiTunnel>,
}

#[derive(Debug, Deserialize)]
struct ApiTunnel {
    public_url: String,
    config: ApiTunnelConfig,
}

#[derive(Debug, Deserialize)]
struct ApiTunnelConfig {
    /// Local address the tunnel forwards to, e.g. `http://localhost:8080`
    addr: String,
}

/// Pick the tunnel forwarding to `local_port` out of the control API
/// listing, if present.
fn find_tunnel_url(response: &TunnelsResponse, local_port: u16) -> Option<&str> {
    let suffix = format!(":{}", local_port);
    response
        .tunnels
        .iter()
        .find(|t| t.config.addr.ends_with(&suffix))
        .map(|t| t.public_url.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_response() -> TunnelsResponse {
        serde_json::from_str(
            r#"{
                "tunnels": [
                    {
                        "name": "command_line",
                        "public_url": "https://abc123.ngrok.app",
                        "config": {"addr": "http://localhost:8080", "inspect": true}
                    },
                    {
                        "name": "command_line (http)",
                        "public_url": "https://def456.ngrok.app",
                        "config": {"addr": "http://localhost:5000", "inspect": true}
                    }
                ],
                "uri": "/api/tunnels"
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn finds_tunnel_by_local_port() {
        let response = sample_response();
        assert_eq!(
            find_tunnel_url(&response, 8080),
            Some("https://abc123.ngrok.app")
        );
        assert_eq!(
            find_tunnel_url(&response, 5000),
            Some("https://def456.ngrok.app")
        );
    }

    #[test]
    fn missing_port_yields_none() {
        let response = sample_response();
        assert_eq!(find_tunnel_url(&response, 9999), None);
    }

    #[test]
    fn port_match_is_exact_suffix() {
        // Port 80 must not match an addr ending in :8080
        let response = sample_response();
        assert_eq!(find_tunnel_url(&response, 80), None);
    }
}
