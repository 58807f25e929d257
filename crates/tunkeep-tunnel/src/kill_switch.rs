//! Kill Switch Posture
//!
//! The global backend mode, orthogonal to per-tunnel status.
//!
//! # Behavior
//!
//! In lockdown the backend blocks all traffic that does not go through a
//! tunnel. With LAN bypass the permitted routes are the public IPv4
//! ranges, which leaves RFC 1918 and link-local networks reachable
//! directly.

use crate::config::AllowedIp;
use crate::store::LockdownSettings;
use tracing::debug;

/// Public IPv4 space, i.e. everything except private and reserved ranges
pub const IPV4_PUBLIC_NETWORKS: &[&str] = &[
    "0.0.0.0/5",
    "8.0.0.0/7",
    "11.0.0.0/8",
    "12.0.0.0/6",
    "16.0.0.0/4",
    "32.0.0.0/3",
    "64.0.0.0/2",
    "128.0.0.0/3",
    "160.0.0.0/5",
    "168.0.0.0/6",
    "172.0.0.0/12",
    "172.32.0.0/11",
    "172.64.0.0/10",
    "172.128.0.0/9",
    "173.0.0.0/8",
    "174.0.0.0/7",
    "176.0.0.0/4",
    "192.0.0.0/9",
    "192.128.0.0/11",
    "192.160.0.0/13",
    "192.169.0.0/16",
    "192.170.0.0/15",
    "192.172.0.0/14",
    "192.176.0.0/12",
    "192.192.0.0/10",
    "193.0.0.0/8",
    "194.0.0.0/7",
    "196.0.0.0/6",
    "200.0.0.0/5",
    "208.0.0.0/4",
];

/// Global VPN posture
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum BackendMode {
    /// No service, no blocking
    #[default]
    Inactive,
    /// Tunnel service running
    Active,
    /// Non-tunnel traffic blocked except `allowed_ips`
    KillSwitch {
        allowed_ips: Vec<AllowedIp>,
        metered: bool,
        dual_stack: bool,
    },
}

impl BackendMode {
    /// Lockdown posture for the given settings
    pub fn lockdown(settings: &LockdownSettings) -> Self {
        let allowed_ips = if settings.bypass_lan {
            IPV4_PUBLIC_NETWORKS
                .iter()
                .filter_map(|cidr| cidr.parse().ok())
                .collect()
        } else {
            Vec::new()
        };
        debug!("Kill switch posture with {} allowed routes", allowed_ips.len());

        BackendMode::KillSwitch {
            allowed_ips,
            metered: settings.metered,
            dual_stack: settings.dual_stack,
        }
    }

    pub fn is_kill_switch(&self) -> bool {
        matches!(self, BackendMode::KillSwitch { .. })
    }

    /// Traffic outside tunnels is allowed
    pub fn allows_bypass(&self) -> bool {
        !self.is_kill_switch()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_networks_all_parse() {
        let parsed: Vec<AllowedIp> = IPV4_PUBLIC_NETWORKS
            .iter()
            .map(|c| c.parse().unwrap())
            .collect();
        assert_eq!(parsed.len(), 30);
        assert!(parsed.iter().all(|ip| ip.addr.is_ipv4()));
    }

    #[test]
    fn test_lockdown_with_lan_bypass() {
        let settings = LockdownSettings { bypass_lan: true, metered: false, dual_stack: true };
        let mode = BackendMode::lockdown(&settings);

        match &mode {
            BackendMode::KillSwitch { allowed_ips, dual_stack, .. } => {
                assert_eq!(allowed_ips.len(), IPV4_PUBLIC_NETWORKS.len());
                assert!(dual_stack);
            }
            other => panic!("unexpected mode {other:?}"),
        }
        assert!(!mode.allows_bypass());
    }

    #[test]
    fn test_lockdown_without_bypass_blocks_everything() {
        let mode = BackendMode::lockdown(&LockdownSettings::default());
        assert_eq!(
            mode,
            BackendMode::KillSwitch { allowed_ips: Vec::new(), metered: false, dual_stack: false }
        );
        assert!(BackendMode::Inactive.allows_bypass());
    }
}
