//! Engine error taxonomy

use crate::backend::BackendKind;
use crate::config::{ConfigError, TunnelId};
use std::time::Duration;

/// Failures reported by a backend adapter
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("Endpoint DNS resolution failed: {0}")]
    DnsFailure(String),

    #[error("Not authorized to manage tunnels")]
    NotAuthorized,

    #[error("Backend rejected configuration: {0}")]
    InvalidConfig(String),

    #[error("Kernel WireGuard is not available")]
    KernelUnsupported,

    #[error("Failed to update running tunnel: {0}")]
    UpdateFailed(String),

    #[error("No {0} backend is available")]
    Unavailable(BackendKind),

    #[error("{0} backend cannot enforce lockdown; traffic outside the tunnel is not blocked")]
    LockdownUnsupported(BackendKind),

    #[error("Tunnel service is not running")]
    ServiceNotRunning,

    #[error("Backend command failed: {0}")]
    Command(String),

    #[error("{0}")]
    Unknown(String),
}

/// Engine-level errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TunnelError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Tunnel {0} is not running")]
    NotRunning(TunnelId),

    #[error("Tunnel {0} is already running")]
    AlreadyRunning(TunnelId),

    #[error("Operation cancelled")]
    Cancelled,
}

impl TunnelError {
    /// Expected during shutdown and stop; never shown to users
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TunnelError::Cancelled)
    }

    pub fn is_user_visible(&self) -> bool {
        !self.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancelled_is_suppressed() {
        assert!(!TunnelError::Cancelled.is_user_visible());
        assert!(TunnelError::NotRunning(TunnelId(1)).is_user_visible());
    }

    #[test]
    fn test_conversions() {
        let err: TunnelError = ConfigError::NoPeers.into();
        assert!(matches!(err, TunnelError::Config(ConfigError::NoPeers)));

        let err: TunnelError = BackendError::NotAuthorized.into();
        assert_eq!(err.to_string(), "Backend error: Not authorized to manage tunnels");
    }
}
