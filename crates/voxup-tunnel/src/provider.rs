//! Provider trait and errors

use async_trait::async_trait;
use std::time::Duration;
use url::Url;
use voxup_core::ProviderKind;

use crate::handle::TunnelHandle;
use crate::{CloudflaredProvider, NgrokProvider};

/// Errors from starting or discovering a tunnel
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("provider '{provider}' unavailable: {reason}")]
    ProviderUnavailable { provider: String, reason: String },

    #[error("no public URL for port {local_port} within {timeout:?}")]
    DiscoveryTimeout { local_port: u16, timeout: Duration },

    #[error("control API request failed: {0}")]
    ControlApi(#[from] reqwest::Error),

    #[error("discovered URL is not parseable: {0}")]
    BadUrl(#[from] url::ParseError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A tunnel provider: spawns the client process and discovers the
/// assigned public URL.
#[async_trait]
pub trait TunnelProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Start the provider client pointed at `local_port`. Fails with
    /// `ProviderUnavailable` when the binary is missing or exits
    /// immediately after launch.
    async fn spawn(&self, local_port: u16) -> Result<TunnelHandle, TunnelError>;

    /// Poll for the public URL with short backoff until `timeout`.
    async fn discover(
        &self,
        handle: &mut TunnelHandle,
        timeout: Duration,
    ) -> Result<Url, TunnelError>;
}

/// Construct the adapter for a configured provider kind.
pub fn provider_for(kind: ProviderKind) -> Box<dyn TunnelProvider> {
    match kind {
        ProviderKind::Ngrok => Box::new(NgrokProvider::default()),
        ProviderKind::Cloudflared => Box::new(CloudflaredProvider::default()),
    }
}

/// Interval between discovery polls
pub(crate) const DISCOVERY_POLL: Duration = Duration::from_millis(400);

/// Command line a provider client is launched with for `local_port`. This
/// doubles as the unit's process-table signature, so it must stay in sync
/// with what the adapters actually spawn.
pub fn spawn_args(kind: ProviderKind, local_port: u16) -> Vec<String> {
    match kind {
        ProviderKind::Ngrok => vec![
            "ngrok".to_string(),
            "http".to_string(),
            local_port.to_string(),
            "--log".to_string(),
            "stdout".to_string(),
        ],
        ProviderKind::Cloudflared => vec![
            "cloudflared".to_string(),
            "tunnel".to_string(),
            "--url".to_string(),
            format!("http://localhost:{}", local_port),
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_for_matches_kind() {
        assert_eq!(provider_for(ProviderKind::Ngrok).kind(), ProviderKind::Ngrok);
        assert_eq!(
            provider_for(ProviderKind::Cloudflared).kind(),
            ProviderKind::Cloudflared
        );
    }
}
