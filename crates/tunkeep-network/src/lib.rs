//! tunkeep Network Layer
//!
//! The pieces of the host network the tunnel engine reacts to:
//!
//! 1. Connectivity snapshots (Wi-Fi SSID/BSSID, cellular, ethernet)
//!    published on a `watch` channel
//! 2. Endpoint resolution through the system resolver, outside any tunnel
//! 3. ICMP reachability checks through the system `ping` binary

mod dns;
mod connectivity;
mod ping;

pub use dns::{DnsResolver, DnsConfig, DnsError, HostResolver};
pub use connectivity::{
    ActiveNetwork, ConnectivityState, NetworkMonitor, SysfsNetworkSource, WifiInfo,
    is_valid_bssid, parse_iw_link,
};
pub use ping::{Pinger, PingStats, PingError, SystemPinger, parse_ping_output};
