//! Supervisor error taxonomy

use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the supervision layer.
///
/// `ProviderUnavailable` and `UrlDiscoveryTimeout` are transient: the
/// supervisor loop recovers them on its next tick. `ConfigValidation` is
/// fatal only for the one-shot `install`/`start` paths.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("tunnel provider '{provider}' unavailable: {reason}")]
    ProviderUnavailable { provider: String, reason: String },

    #[error("public URL for '{unit}' not discovered within {timeout:?}")]
    UrlDiscoveryTimeout { unit: String, timeout: Duration },

    #[error("failed to start process for '{unit}'")]
    ProcessStartFailure {
        unit: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    ConfigValidation(String),

    #[error("unit '{0}' is not known to the supervisor")]
    UnknownUnit(String),

    #[error("state store error: {0}")]
    Store(#[from] std::io::Error),

    #[error("malformed unit record: {0}")]
    Record(#[from] serde_json::Error),
}

impl SupervisorError {
    /// Whether the next supervisor tick is expected to recover this error.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SupervisorError::ProviderUnavailable { .. }
                | SupervisorError::UrlDiscoveryTimeout { .. }
        )
    }
}
