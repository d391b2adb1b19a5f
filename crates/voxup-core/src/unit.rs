//! Managed unit model
//!
//! A managed unit is a named, restartable OS process tracked by the
//! supervisor: either a local service or an outbound tunnel exposing one of
//! the service ports.

use serde::{Deserialize, Serialize};

/// Tunnel provider selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Ngrok,
    Cloudflared,
}

impl ProviderKind {
    /// Name of the provider client binary, used for spawning and for
    /// process-table matching.
    pub fn binary(&self) -> &'static str {
        match self {
            ProviderKind::Ngrok => "ngrok",
            ProviderKind::Cloudflared => "cloudflared",
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.binary())
    }
}

/// What the consuming service expects the discovered URL to look like
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BindingScheme {
    /// WebSocket endpoint: `https` is rewritten to `wss`, `http` to `ws`
    Socket,
    /// Plain webhook base URL: scheme kept as discovered
    Webhook,
}

/// Relation between a tunnel and the environment key its URL is injected
/// under in the consuming service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelBinding {
    /// Environment variable the consuming service reads, e.g. `WEBSOCKET_URL`
    pub env_key: String,
    pub scheme: BindingScheme,
}

impl TunnelBinding {
    /// Local fallback URL used when the public URL has not been discovered
    /// yet, so services can always start for local testing.
    pub fn fallback_url(&self, local_port: u16) -> String {
        match self.scheme {
            BindingScheme::Socket => format!("ws://localhost:{}", local_port),
            BindingScheme::Webhook => format!("http://localhost:{}", local_port),
        }
    }
}

/// What kind of process a unit launches
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum UnitKind {
    Service {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        /// Port the service listens on locally
        port: u16,
        /// Port serving `GET /health`, when the service exposes one
        #[serde(default)]
        health_port: Option<u16>,
    },
    Tunnel {
        provider: ProviderKind,
        local_port: u16,
        binding: TunnelBinding,
    },
}

impl UnitKind {
    pub fn is_tunnel(&self) -> bool {
        matches!(self, UnitKind::Tunnel { .. })
    }
}

/// Lifecycle status of a unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitStatus {
    Stopped,
    Starting,
    Running,
    /// Running without its expected public URL, on the local fallback
    Degraded,
    Failed,
}

impl std::fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            UnitStatus::Stopped => "stopped",
            UnitStatus::Starting => "starting",
            UnitStatus::Running => "running",
            UnitStatus::Degraded => "degraded",
            UnitStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Restart policy applied by the supervisor loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RestartPolicy {
    #[default]
    Always,
    Never,
}

/// A named, restartable process tracked by the supervisor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedUnit {
    pub name: String,
    #[serde(flatten)]
    pub kind: UnitKind,
    #[serde(default)]
    pub restart: RestartPolicy,
}

impl ManagedUnit {
    pub fn service(name: &str, command: &str, args: &[&str], port: u16) -> Self {
        Self {
            name: name.to_string(),
            kind: UnitKind::Service {
                command: command.to_string(),
                args: args.iter().map(|s| s.to_string()).collect(),
                port,
                health_port: None,
            },
            restart: RestartPolicy::Always,
        }
    }

    pub fn tunnel(
        name: &str,
        provider: ProviderKind,
        local_port: u16,
        env_key: &str,
        scheme: BindingScheme,
    ) -> Self {
        Self {
            name: name.to_string(),
            kind: UnitKind::Tunnel {
                provider,
                local_port,
                binding: TunnelBinding {
                    env_key: env_key.to_string(),
                    scheme,
                },
            },
            restart: RestartPolicy::Always,
        }
    }

    /// The local port this unit exposes or fronts
    pub fn port(&self) -> u16 {
        match &self.kind {
            UnitKind::Service { port, .. } => *port,
            UnitKind::Tunnel { local_port, .. } => *local_port,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_url_matches_binding_scheme() {
        let socket = TunnelBinding {
            env_key: "WEBSOCKET_URL".to_string(),
            scheme: BindingScheme::Socket,
        };
        assert_eq!(socket.fallback_url(8080), "ws://localhost:8080");

        let webhook = TunnelBinding {
            env_key: "TWIML_URL".to_string(),
            scheme: BindingScheme::Webhook,
        };
        assert_eq!(webhook.fallback_url(5000), "http://localhost:5000");
    }

    #[test]
    fn unit_kind_round_trips_through_json() {
        let unit = ManagedUnit::tunnel(
            "twiml-tunnel",
            ProviderKind::Ngrok,
            5000,
            "TWIML_URL",
            BindingScheme::Webhook,
        );

        let json = serde_json::to_string(&unit).unwrap();
        let parsed: ManagedUnit = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, unit);
        assert!(parsed.kind.is_tunnel());
        assert_eq!(parsed.port(), 5000);
    }

    #[test]
    fn default_restart_policy_is_always() {
        let unit = ManagedUnit::service("voice-agent", "python3", &["main.py"], 8080);
        assert_eq!(unit.restart, RestartPolicy::Always);
    }
}
