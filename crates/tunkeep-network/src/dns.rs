//! Endpoint DNS Resolution
//!
//! Resolves peer endpoint hostnames through the host's own resolver
//! configuration, so lookups never depend on a tunnel that may be
//! broken at the time of the query. Provides:
//! - Literal IP short-circuit (no lookup for `203.0.113.7`)
//! - Address-family preference per tunnel
//!
//! Answers are never cached.

use async_trait::async_trait;
use hickory_resolver::TokioAsyncResolver;
use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// DNS resolution errors
#[derive(Debug, Clone, Error)]
pub enum DnsError {
    #[error("Resolution failed for {host}: {reason}")]
    ResolutionFailed { host: String, reason: String },

    #[error("No addresses found for {0}")]
    NoAddresses(String),

    #[error("Resolution of {0} timed out")]
    Timeout(String),

    #[error("Resolver error: {0}")]
    ResolverError(String),
}

/// Something that turns an endpoint host into one address.
///
/// Implementations must not route the query through a tunnel.
#[async_trait]
pub trait HostResolver: Send + Sync {
    /// Resolve `host` with a fresh lookup.
    async fn resolve_host(&self, host: &str, prefer_ipv4: bool) -> Result<IpAddr, DnsError>;
}

/// DNS resolver configuration
#[derive(Debug, Clone)]
pub struct DnsConfig {
    /// Timeout for one lookup
    pub timeout: Duration,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
        }
    }
}

/// Async endpoint resolver backed by hickory and the system resolver
/// configuration
pub struct DnsResolver {
    resolver: TokioAsyncResolver,
    config: DnsConfig,
}

impl DnsResolver {
    /// Create a new resolver
    pub fn new(config: DnsConfig) -> Result<Self, DnsError> {
        let (resolver_config, mut opts) = hickory_resolver::system_conf::read_system_conf()
            .map_err(|e| DnsError::ResolverError(e.to_string()))?;
        opts.timeout = config.timeout;
        // Every call is a fresh lookup
        opts.cache_size = 0;
        info!("Endpoint resolver initialized from system configuration");

        Ok(Self {
            resolver: TokioAsyncResolver::tokio(resolver_config, opts),
            config,
        })
    }

    /// Create with default configuration
    pub fn with_defaults() -> Result<Self, DnsError> {
        Self::new(DnsConfig::default())
    }

    /// Resolve a host to every address it currently has
    pub async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, DnsError> {
        if let Some(ip) = literal_ip(host) {
            return Ok(vec![ip]);
        }

        let host = host.to_lowercase();
        debug!("DNS lookup for {}", host);
        let lookup = tokio::time::timeout(self.config.timeout, self.resolver.lookup_ip(host.as_str()))
            .await
            .map_err(|_| DnsError::Timeout(host.clone()))?
            .map_err(|e| DnsError::ResolutionFailed {
                host: host.clone(),
                reason: e.to_string(),
            })?;

        let addresses: Vec<IpAddr> = lookup.iter().collect();
        if addresses.is_empty() {
            warn!("DNS lookup for {} returned no addresses", host);
            return Err(DnsError::NoAddresses(host));
        }
        Ok(addresses)
    }
}

#[async_trait]
impl HostResolver for DnsResolver {
    async fn resolve_host(&self, host: &str, prefer_ipv4: bool) -> Result<IpAddr, DnsError> {
        let addresses = self.resolve(host).await?;
        pick_address(&addresses, prefer_ipv4).ok_or_else(|| DnsError::NoAddresses(host.to_string()))
    }
}

/// An endpoint host that is already an address, bracketed or not
pub(crate) fn literal_ip(host: &str) -> Option<IpAddr> {
    host.trim_matches(['[', ']']).parse().ok()
}

/// First address of the preferred family, else the first address
pub(crate) fn pick_address(addresses: &[IpAddr], prefer_ipv4: bool) -> Option<IpAddr> {
    addresses
        .iter()
        .find(|a| a.is_ipv4() == prefer_ipv4)
        .or_else(|| addresses.first())
        .copied()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn test_pick_address_family() {
        let v4 = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7));
        let v6 = IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1));

        assert_eq!(pick_address(&[v6, v4], true), Some(v4));
        assert_eq!(pick_address(&[v4, v6], false), Some(v6));
        assert_eq!(pick_address(&[v6], true), Some(v6));
        assert_eq!(pick_address(&[], true), None);
    }

    #[test]
    fn test_literal_endpoints_skip_lookup() {
        assert_eq!(literal_ip("203.0.113.7"), Some(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7))));
        assert_eq!(
            literal_ip("[2001:db8::1]"),
            Some(IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1)))
        );
        assert_eq!(literal_ip("vpn.example.net"), None);
        assert_eq!(literal_ip(""), None);
    }
}
