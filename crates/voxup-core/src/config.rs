//! Supervisor configuration
//!
//! Loaded from `~/.voxup/config.json`, falling back to built-in defaults
//! describing the stock voice-agent topology (media server on 8080, TwiML
//! server on 5000, one tunnel in front of each).

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{env, fs};

use crate::error::SupervisorError;
use crate::unit::{
    BindingScheme, ManagedUnit, ProviderKind, RestartPolicy, TunnelBinding, UnitKind,
};

/// What to do when a tunnel's URL discovery exceeds its timeout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TimeoutPolicy {
    /// Start the dependent service on the local fallback URL, flagged degraded
    #[default]
    Degrade,
    /// Fail the one-shot start (the supervisor loop still only logs)
    Fail,
}

/// A supervised local service process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Port the service listens on
    pub port: u16,
    /// Port serving `GET /health`, if any
    #[serde(default)]
    pub health_port: Option<u16>,
    #[serde(default)]
    pub restart: RestartPolicy,
}

/// A tunnel exposing one service port to the public internet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelSpec {
    pub name: String,
    pub provider: ProviderKind,
    pub local_port: u16,
    /// Environment variable the consuming service reads the URL from
    pub env_key: String,
    pub scheme: BindingScheme,
    #[serde(default)]
    pub restart: RestartPolicy,
}

/// Phone-provider credentials for webhook registration.
///
/// Values support `${ENV_VAR}` expansion so secrets can stay out of the
/// config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderCredentials {
    pub account_sid: String,
    pub auth_token: String,
    /// SID of the incoming phone number to point at the webhook URL
    pub phone_sid: String,
}

impl ProviderCredentials {
    /// Expand `${ENV_VAR}` references in each field.
    pub fn expanded(&self) -> Self {
        Self {
            account_sid: expand_env_vars(&self.account_sid),
            auth_token: expand_env_vars(&self.auth_token),
            phone_sid: expand_env_vars(&self.phone_sid),
        }
    }

    fn is_complete(&self) -> bool {
        let c = self.expanded();
        !c.account_sid.is_empty() && !c.auth_token.is_empty() && !c.phone_sid.is_empty()
    }
}

/// Top-level supervisor configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Supervisor loop tick interval, seconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Per-tunnel URL discovery budget, seconds
    #[serde(default = "default_discovery_timeout")]
    pub discovery_timeout_secs: u64,
    /// Graceful stop window before SIGKILL, seconds
    #[serde(default = "default_grace_period")]
    pub grace_period_secs: u64,
    #[serde(default)]
    pub on_discovery_timeout: TimeoutPolicy,
    /// Data directory for unit records, logs, and backups
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub services: Vec<ServiceSpec>,
    #[serde(default)]
    pub tunnels: Vec<TunnelSpec>,
    /// Optional phone-provider credentials for webhook registration
    #[serde(default)]
    pub twilio: Option<ProviderCredentials>,
}

fn default_poll_interval() -> u64 {
    10
}

fn default_discovery_timeout() -> u64 {
    10
}

fn default_grace_period() -> u64 {
    10
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(".voxup")
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            discovery_timeout_secs: default_discovery_timeout(),
            grace_period_secs: default_grace_period(),
            on_discovery_timeout: TimeoutPolicy::default(),
            data_dir: default_data_dir(),
            services: vec![
                ServiceSpec {
                    name: "voice-agent".to_string(),
                    command: "python3".to_string(),
                    args: vec!["main.py".to_string()],
                    port: 8080,
                    health_port: Some(8081),
                    restart: RestartPolicy::Always,
                },
                ServiceSpec {
                    name: "twiml".to_string(),
                    command: "python3".to_string(),
                    args: vec!["twiml_server.py".to_string()],
                    port: 5000,
                    health_port: Some(5000),
                    restart: RestartPolicy::Always,
                },
            ],
            tunnels: vec![
                TunnelSpec {
                    name: "voice-agent-tunnel".to_string(),
                    provider: ProviderKind::Ngrok,
                    local_port: 8080,
                    env_key: "WEBSOCKET_URL".to_string(),
                    scheme: BindingScheme::Socket,
                    restart: RestartPolicy::Always,
                },
                TunnelSpec {
                    name: "twiml-tunnel".to_string(),
                    provider: ProviderKind::Ngrok,
                    local_port: 5000,
                    env_key: "TWIML_URL".to_string(),
                    scheme: BindingScheme::Webhook,
                    restart: RestartPolicy::Always,
                },
            ],
            twilio: None,
        }
    }
}

impl SupervisorConfig {
    /// Default config file location (`~/.voxup/config.json`)
    pub fn default_path() -> PathBuf {
        default_data_dir().join("config.json")
    }

    /// Load from the given path, or built-in defaults when the file does
    /// not exist.
    pub fn load(path: &Path) -> Result<Self, SupervisorError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let json = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&json)?;
        Ok(config)
    }

    /// Write the configuration as pretty JSON, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<(), SupervisorError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_secs(self.discovery_timeout_secs)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    /// All units in startup order: tunnels before the services that
    /// consume their URLs.
    pub fn units(&self) -> Vec<ManagedUnit> {
        let mut units: Vec<ManagedUnit> = self
            .tunnels
            .iter()
            .map(|t| ManagedUnit {
                name: t.name.clone(),
                kind: UnitKind::Tunnel {
                    provider: t.provider,
                    local_port: t.local_port,
                    binding: TunnelBinding {
                        env_key: t.env_key.clone(),
                        scheme: t.scheme,
                    },
                },
                restart: t.restart,
            })
            .collect();

        units.extend(self.services.iter().map(|s| ManagedUnit {
            name: s.name.clone(),
            kind: UnitKind::Service {
                command: s.command.clone(),
                args: s.args.clone(),
                port: s.port,
                health_port: s.health_port,
            },
            restart: s.restart,
        }));

        units
    }

    /// The tunnels whose local port belongs to the given service.
    pub fn tunnels_for_service(&self, service: &ServiceSpec) -> Vec<&TunnelSpec> {
        self.tunnels
            .iter()
            .filter(|t| t.local_port == service.port)
            .collect()
    }

    /// Validate the topology. `require_credentials` additionally checks the
    /// phone-provider credentials, which only `install`/`start` care about.
    pub fn validate(&self, require_credentials: bool) -> Result<(), SupervisorError> {
        let mut names = std::collections::HashSet::new();
        for unit in self.units() {
            if unit.name.is_empty() {
                return Err(SupervisorError::ConfigValidation(
                    "unit name cannot be empty".to_string(),
                ));
            }
            if !names.insert(unit.name.clone()) {
                return Err(SupervisorError::ConfigValidation(format!(
                    "duplicate unit name '{}'",
                    unit.name
                )));
            }
        }

        for service in &self.services {
            if service.command.is_empty() {
                return Err(SupervisorError::ConfigValidation(format!(
                    "service '{}' has an empty command",
                    service.name
                )));
            }
        }

        for tunnel in &self.tunnels {
            if !self.services.iter().any(|s| s.port == tunnel.local_port) {
                return Err(SupervisorError::ConfigValidation(format!(
                    "tunnel '{}' fronts port {} but no service listens there",
                    tunnel.name, tunnel.local_port
                )));
            }
        }

        if require_credentials {
            if let Some(creds) = &self.twilio {
                if !creds.is_complete() {
                    return Err(SupervisorError::ConfigValidation(
                        "phone provider credentials are set but incomplete \
                         (account_sid, auth_token and phone_sid are all required)"
                            .to_string(),
                    ));
                }
            }
        }

        Ok(())
    }
}

/// Expand `${VAR}` references against the process environment.
/// Unset variables expand to the empty string.
pub fn expand_env_vars(input: &str) -> String {
    let re = regex_lite::Regex::new(r"\$\{([^}]+)\}").unwrap();
    let mut result = input.to_string();
    for cap in re.captures_iter(input) {
        let value = env::var(&cap[1]).unwrap_or_default();
        result = result.replace(&cap[0], &value);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn default_topology_is_valid() {
        let config = SupervisorConfig::default();
        config.validate(true).unwrap();

        let units = config.units();
        assert_eq!(units.len(), 4);
        // Tunnels come first in startup order
        assert!(units[0].kind.is_tunnel());
        assert!(units[1].kind.is_tunnel());
        assert_eq!(units[2].name, "voice-agent");
        assert_eq!(units[3].name, "twiml");
    }

    #[test]
    fn load_missing_file_yields_defaults() {
        let temp = TempDir::new().unwrap();
        let config = SupervisorConfig::load(&temp.path().join("config.json")).unwrap();
        assert_eq!(config, SupervisorConfig::default());
    }

    #[test]
    fn save_and_load_round_trip() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.json");

        let mut config = SupervisorConfig::default();
        config.poll_interval_secs = 5;
        config.save(&path).unwrap();

        let loaded = SupervisorConfig::load(&path).unwrap();
        assert_eq!(loaded.poll_interval_secs, 5);
        assert_eq!(loaded, config);
    }

    #[test]
    fn orphan_tunnel_fails_validation() {
        let mut config = SupervisorConfig::default();
        config.tunnels.push(TunnelSpec {
            name: "orphan".to_string(),
            provider: ProviderKind::Cloudflared,
            local_port: 9999,
            env_key: "ORPHAN_URL".to_string(),
            scheme: BindingScheme::Webhook,
            restart: RestartPolicy::Always,
        });

        let err = config.validate(false).unwrap_err();
        assert!(matches!(err, SupervisorError::ConfigValidation(_)));
    }

    #[test]
    fn duplicate_names_fail_validation() {
        let mut config = SupervisorConfig::default();
        let dup = config.services[0].clone();
        config.services.push(dup);

        assert!(config.validate(false).is_err());
    }

    #[test]
    fn partial_credentials_fail_only_when_required() {
        let mut config = SupervisorConfig::default();
        config.twilio = Some(ProviderCredentials {
            account_sid: "AC123".to_string(),
            auth_token: String::new(),
            phone_sid: "PN456".to_string(),
        });

        assert!(config.validate(true).is_err());
        // The restart loop path does not revalidate credentials
        config.validate(false).unwrap();
    }

    #[test]
    fn credential_env_expansion() {
        std::env::set_var("VOXUP_TEST_SID", "AC999");
        let creds = ProviderCredentials {
            account_sid: "${VOXUP_TEST_SID}".to_string(),
            auth_token: "tok".to_string(),
            phone_sid: "PN1".to_string(),
        };
        assert_eq!(creds.expanded().account_sid, "AC999");
    }

    #[test]
    fn tunnels_for_service_matches_by_port() {
        let config = SupervisorConfig::default();
        let twiml = config.services.iter().find(|s| s.name == "twiml").unwrap();
        let tunnels = config.tunnels_for_service(twiml);
        assert_eq!(tunnels.len(), 1);
        assert_eq!(tunnels[0].env_key, "TWIML_URL");
    }
}
