//! cloudflared adapter
//!
//! cloudflared has no local control API for quick tunnels; it prints the
//! assigned `*.trycloudflare.com` hostname to its own log stream. Discovery
//! scans the captured output ring for it.

use async_trait::async_trait;
use std::time::{Duration, Instant};
use tokio::process::Command;
use url::Url;
use voxup_core::ProviderKind;

use crate::handle::TunnelHandle;
use crate::provider::{TunnelError, TunnelProvider, DISCOVERY_POLL};

#[derive(Default)]
pub struct CloudflaredProvider;

#[async_trait]
impl TunnelProvider for CloudflaredProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Cloudflared
    }

    async fn spawn(&self, local_port: u16) -> Result<TunnelHandle, TunnelError> {
        let args = crate::provider::spawn_args(ProviderKind::Cloudflared, local_port);
        let mut cmd = Command::new(&args[0]);
        cmd.args(&args[1..]);
        TunnelHandle::spawn(ProviderKind::Cloudflared, local_port, &mut cmd).await
    }

    async fn discover(
        &self,
        handle: &mut TunnelHandle,
        timeout: Duration,
    ) -> Result<Url, TunnelError> {
        let deadline = Instant::now() + timeout;

        loop {
            if handle.has_exited() {
                return Err(TunnelError::ProviderUnavailable {
                    provider: ProviderKind::Cloudflared.binary().to_string(),
                    reason: handle
                        .recent_output()
                        .last()
                        .cloned()
                        .unwrap_or_else(|| "cloudflared exited during discovery".to_string()),
                });
            }

            if let Some(url) = extract_public_url(&handle.recent_output()) {
                return Ok(Url::parse(&url)?);
            }

            if Instant::now() + DISCOVERY_POLL > deadline {
                return Err(TunnelError::DiscoveryTimeout {
                    local_port: handle.local_port(),
                    timeout,
                });
            }
            tokio::time::sleep(DISCOVERY_POLL).await;
        }
    }
}

/// Find the first quick-tunnel hostname in the captured log lines.
fn extract_public_url(lines: &[String]) -> Option<String> {
    let re = regex_lite::Regex::new(r"https://[a-z0-9-]+\.trycloudflare\.com").unwrap();
    lines
        .iter()
        .find_map(|line| re.find(line).map(|m| m.as_str().to_string()))
}
