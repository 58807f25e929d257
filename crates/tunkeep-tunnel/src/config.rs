//! Tunnel Configuration
//!
//! Structured tunnel definitions (interface + peers) and the per-tunnel
//! metadata the engine acts on: ping target override, restart-on-unhealthy,
//! role flags and ordering.

use crate::keys::{PrivateKey, PublicKey};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::fmt::Write as _;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// Longest interface name the Linux kernel accepts (IFNAMSIZ - 1)
pub const MAX_KERNEL_NAME_LEN: usize = 15;

/// Upper bound on a rendered tunnel definition
pub const MAX_DEFINITION_BYTES: usize = 64 * 1024;

/// Stable tunnel identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TunnelId(pub u32);

impl fmt::Display for TunnelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One allowed-ips route, e.g. `10.8.0.0/24`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AllowedIp {
    pub addr: IpAddr,
    pub prefix: u8,
}

impl AllowedIp {
    pub fn new(addr: IpAddr, prefix: u8) -> Self {
        Self { addr, prefix }
    }

    /// Default route, or one half of a split default route (`/0`, `/1`)
    pub fn is_catch_all(&self) -> bool {
        self.prefix <= 1
    }
}

impl FromStr for AllowedIp {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (addr, prefix) = match s.split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (s, None),
        };

        let addr: IpAddr = addr
            .trim_matches(['[', ']'])
            .parse()
            .map_err(|_| ConfigError::InvalidAddress(s.to_string()))?;
        let max = if addr.is_ipv4() { 32 } else { 128 };
        let prefix = match prefix {
            Some(p) => p
                .parse::<u8>()
                .ok()
                .filter(|p| *p <= max)
                .ok_or_else(|| ConfigError::InvalidAddress(s.to_string()))?,
            None => max,
        };

        Ok(Self { addr, prefix })
    }
}

impl fmt::Display for AllowedIp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

/// Peer endpoint: a hostname or literal address plus UDP port
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }

    /// The address when `host` is a literal IP
    pub fn literal_ip(&self) -> Option<IpAddr> {
        self.host.trim_matches(['[', ']']).parse().ok()
    }

    /// Needs DNS before a socket can be bound to it
    pub fn is_hostname(&self) -> bool {
        self.literal_ip().is_none()
    }

    /// Same port, host replaced by a resolved address
    pub fn with_ip(&self, ip: IpAddr) -> Self {
        Self {
            host: ip.to_string(),
            port: self.port,
        }
    }
}

impl FromStr for Endpoint {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let invalid = || ConfigError::InvalidEndpoint(s.to_string());

        let (host, port) = if let Some(rest) = s.strip_prefix('[') {
            let (host, port) = rest.split_once("]:").ok_or_else(invalid)?;
            (host, port)
        } else {
            s.rsplit_once(':').ok_or_else(invalid)?
        };

        if host.is_empty() || host.contains(char::is_whitespace) {
            return Err(invalid());
        }
        let port = port.parse::<u16>().map_err(|_| invalid())?;
        Ok(Self::new(host, port))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.literal_ip() {
            Some(IpAddr::V6(v6)) => write!(f, "[{}]:{}", v6, self.port),
            _ => write!(f, "{}:{}", self.host, self.port),
        }
    }
}

macro_rules! serde_via_str {
    ($ty:ty) => {
        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

serde_via_str!(AllowedIp);
serde_via_str!(Endpoint);

/// `[Interface]` section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceConfig {
    pub private_key: PrivateKey,
    #[serde(default)]
    pub addresses: Vec<AllowedIp>,
    #[serde(default)]
    pub dns: Vec<IpAddr>,
    #[serde(default)]
    pub listen_port: Option<u16>,
    #[serde(default)]
    pub mtu: Option<u16>,
}

/// `[Peer]` section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    pub public_key: PublicKey,
    #[serde(default)]
    pub preshared_key: Option<String>,
    #[serde(default)]
    pub endpoint: Option<Endpoint>,
    #[serde(default)]
    pub allowed_ips: Vec<AllowedIp>,
    #[serde(default)]
    pub persistent_keepalive: Option<u16>,
}

impl PeerConfig {
    pub fn new(public_key: PublicKey) -> Self {
        Self {
            public_key,
            preshared_key: None,
            endpoint: None,
            allowed_ips: Vec::new(),
            persistent_keepalive: None,
        }
    }

    pub fn with_endpoint(mut self, endpoint: Endpoint) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    pub fn with_allowed_ip(mut self, allowed: AllowedIp) -> Self {
        self.allowed_ips.push(allowed);
        self
    }

    /// Peers without routes carry no traffic and are never pinged
    pub fn is_pingable(&self) -> bool {
        !self.allowed_ips.is_empty()
    }
}

/// Interface plus peers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelDefinition {
    pub interface: InterfaceConfig,
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
}

impl TunnelDefinition {
    pub fn new(private_key: PrivateKey) -> Self {
        Self {
            interface: InterfaceConfig {
                private_key,
                addresses: Vec::new(),
                dns: Vec::new(),
                listen_port: None,
                mtu: None,
            },
            peers: Vec::new(),
        }
    }

    pub fn with_peer(mut self, peer: PeerConfig) -> Self {
        self.peers.push(peer);
        self
    }

    /// Hostnames used by peer endpoints, deduplicated
    pub fn endpoint_hostnames(&self) -> BTreeSet<String> {
        self.peers
            .iter()
            .filter_map(|p| p.endpoint.as_ref())
            .filter(|e| e.is_hostname())
            .map(|e| e.host.clone())
            .collect()
    }

    /// Copy with hostname endpoints swapped for the addresses in `resolved`
    pub fn with_resolved_endpoints(&self, resolved: &HashMap<String, IpAddr>) -> Self {
        let mut def = self.clone();
        for peer in &mut def.peers {
            if let Some(endpoint) = &peer.endpoint {
                if let Some(ip) = resolved.get(&endpoint.host) {
                    peer.endpoint = Some(endpoint.with_ip(*ip));
                }
            }
        }
        def
    }

    /// Render as a wg-quick configuration file
    pub fn to_wg_quick(&self) -> String {
        let mut out = String::from("[Interface]\n");
        let iface = &self.interface;
        let _ = writeln!(out, "PrivateKey = {}", iface.private_key.to_base64());
        if !iface.addresses.is_empty() {
            let _ = writeln!(out, "Address = {}", join(&iface.addresses));
        }
        if !iface.dns.is_empty() {
            let _ = writeln!(out, "DNS = {}", join(&iface.dns));
        }
        if let Some(port) = iface.listen_port {
            let _ = writeln!(out, "ListenPort = {}", port);
        }
        if let Some(mtu) = iface.mtu {
            let _ = writeln!(out, "MTU = {}", mtu);
        }

        for peer in &self.peers {
            out.push_str("\n[Peer]\n");
            let _ = writeln!(out, "PublicKey = {}", peer.public_key);
            if let Some(psk) = &peer.preshared_key {
                let _ = writeln!(out, "PresharedKey = {}", psk);
            }
            if !peer.allowed_ips.is_empty() {
                let _ = writeln!(out, "AllowedIPs = {}", join(&peer.allowed_ips));
            }
            if let Some(endpoint) = &peer.endpoint {
                let _ = writeln!(out, "Endpoint = {}", endpoint);
            }
            if let Some(keepalive) = peer.persistent_keepalive {
                let _ = writeln!(out, "PersistentKeepalive = {}", keepalive);
            }
        }
        out
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.peers.is_empty() {
            return Err(ConfigError::NoPeers);
        }
        let mut seen = BTreeSet::new();
        for peer in &self.peers {
            if !seen.insert(peer.public_key.to_bytes()) {
                return Err(ConfigError::DuplicatePeer(peer.public_key.to_base64()));
            }
        }
        let size = self.to_wg_quick().len();
        if size > MAX_DEFINITION_BYTES {
            return Err(ConfigError::TooLarge(size));
        }
        Ok(())
    }
}

fn join<T: fmt::Display>(items: &[T]) -> String {
    items.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
}

/// A configured tunnel
///
/// Equality is by content: two configs loaded at different times compare
/// equal when every field matches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelConfig {
    pub id: TunnelId,
    pub name: String,
    pub definition: TunnelDefinition,
    /// SSIDs / network names this tunnel is bound to
    #[serde(default)]
    pub tunnel_networks: BTreeSet<String>,
    #[serde(default)]
    pub is_mobile_data_tunnel: bool,
    #[serde(default)]
    pub is_primary_tunnel: bool,
    #[serde(default)]
    pub is_ethernet_tunnel: bool,
    /// Persisted "was running" flag used by restore
    #[serde(default)]
    pub is_active: bool,
    /// Opt in to DNS refresh when the tunnel turns unhealthy
    #[serde(default)]
    pub restart_on_ping_failure: bool,
    /// Ping this host instead of deriving one from allowed-ips
    #[serde(default)]
    pub ping_target: Option<String>,
    #[serde(default = "default_true")]
    pub is_ipv4_preferred: bool,
    #[serde(default)]
    pub position: u32,
}

fn default_true() -> bool {
    true
}

impl TunnelConfig {
    pub fn new(id: TunnelId, name: impl Into<String>, definition: TunnelDefinition) -> Self {
        Self {
            id,
            name: name.into(),
            definition,
            tunnel_networks: BTreeSet::new(),
            is_mobile_data_tunnel: false,
            is_primary_tunnel: false,
            is_ethernet_tunnel: false,
            is_active: false,
            restart_on_ping_failure: false,
            ping_target: None,
            is_ipv4_preferred: true,
            position: 0,
        }
    }

    /// Validate before any backend call
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::EmptyName);
        }
        self.definition.validate()
    }

    /// The name must double as a Linux interface name
    pub fn validate_kernel_name(&self) -> Result<(), ConfigError> {
        let name = self.name.as_str();
        let valid = !name.is_empty()
            && name.len() <= MAX_KERNEL_NAME_LEN
            && name != "."
            && name != ".."
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '=' | '+' | '.' | '-'));

        if valid {
            Ok(())
        } else {
            Err(ConfigError::InvalidKernelName(self.name.clone()))
        }
    }

    /// Differs in anything the running tunnel was built from
    ///
    /// Bookkeeping fields (`is_active`, `position`, role flags) change
    /// without touching the running tunnel.
    pub fn differs_at_runtime(&self, other: &TunnelConfig) -> bool {
        self.name != other.name
            || self.definition != other.definition
            || self.ping_target != other.ping_target
    }

    pub fn pingable_peers(&self) -> impl Iterator<Item = &PeerConfig> {
        self.definition.peers.iter().filter(|p| p.is_pingable())
    }
}

/// Well-known public ping targets for catch-all routes
pub const CLOUDFLARE_IPV4: IpAddr = IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1));
pub const CLOUDFLARE_IPV6: IpAddr = IpAddr::V6(Ipv6Addr::new(0x2606, 0x4700, 0x4700, 0, 0, 0, 0, 0x1111));

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Tunnel name is empty")]
    EmptyName,

    #[error("Tunnel name {0:?} is not a valid kernel interface name")]
    InvalidKernelName(String),

    #[error("Tunnel has no peers")]
    NoPeers,

    #[error("Peer {0} appears more than once")]
    DuplicatePeer(String),

    #[error("Tunnel definition too large ({0} bytes)")]
    TooLarge(usize),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),
}
