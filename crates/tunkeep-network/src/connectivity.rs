//! Connectivity Snapshots
//!
//! The engine never asks the OS about the network directly; it watches a
//! [`ConnectivityState`] published through a [`NetworkMonitor`]. On Linux
//! hosts [`SysfsNetworkSource`] fills that monitor by polling
//! `/sys/class/net` and `iw`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// BSSIDs reported by drivers when the real one is hidden or unknown
const INVALID_BSSIDS: &[&str] = &[
    "02:00:00:00:00:00",
    "00:00:00:00:00:00",
    "ff:ff:ff:ff:ff:ff",
];

/// Wi-Fi association details
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WifiInfo {
    pub ssid: String,
    pub bssid: Option<String>,
}

/// The network currently carrying default traffic
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ActiveNetwork {
    #[default]
    Disconnected,
    Wifi(WifiInfo),
    Cellular,
    Ethernet,
}

/// Observable connectivity snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectivityState {
    pub active_network: ActiveNetwork,
    pub wifi_connected: bool,
    pub cellular_connected: bool,
    pub ethernet_connected: bool,
}

impl ConnectivityState {
    pub fn disconnected() -> Self {
        Self::default()
    }

    pub fn wifi(ssid: impl Into<String>, bssid: Option<&str>) -> Self {
        Self {
            active_network: ActiveNetwork::Wifi(WifiInfo {
                ssid: ssid.into(),
                bssid: bssid.map(str::to_string),
            }),
            wifi_connected: true,
            ..Self::default()
        }
    }

    pub fn ethernet() -> Self {
        Self {
            active_network: ActiveNetwork::Ethernet,
            ethernet_connected: true,
            ..Self::default()
        }
    }

    pub fn cellular() -> Self {
        Self {
            active_network: ActiveNetwork::Cellular,
            cellular_connected: true,
            ..Self::default()
        }
    }

    /// Any transport is up
    pub fn has_connectivity(&self) -> bool {
        self.wifi_connected || self.cellular_connected || self.ethernet_connected
    }

    /// Wi-Fi details when Wi-Fi is the active network
    pub fn active_wifi(&self) -> Option<&WifiInfo> {
        match &self.active_network {
            ActiveNetwork::Wifi(info) => Some(info),
            _ => None,
        }
    }
}

/// BSSID is present, not a placeholder, and looks like a MAC address
pub fn is_valid_bssid(bssid: &str) -> bool {
    let bssid = bssid.trim();
    if bssid.is_empty() {
        return false;
    }
    if INVALID_BSSIDS.iter().any(|b| b.eq_ignore_ascii_case(bssid)) {
        return false;
    }

    let octets: Vec<&str> = bssid.split(':').collect();
    octets.len() == 6
        && octets
            .iter()
            .all(|o| o.len() == 2 && o.chars().all(|c| c.is_ascii_hexdigit()))
}

/// Publishes connectivity snapshots to any number of observers
#[derive(Clone)]
pub struct NetworkMonitor {
    tx: Arc<watch::Sender<ConnectivityState>>,
}

impl NetworkMonitor {
    pub fn new(initial: ConnectivityState) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> ConnectivityState {
        self.tx.borrow().clone()
    }

    /// Publish a snapshot; observers only wake when it differs
    pub fn publish(&self, state: ConnectivityState) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            debug!("Connectivity changed: {:?}", state.active_network);
            *current = state;
            true
        })
    }
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new(ConnectivityState::default())
    }
}

/// Parse `iw dev <iface> link` output into SSID/BSSID
pub fn parse_iw_link(output: &str) -> Option<WifiInfo> {
    let mut bssid = None;
    let mut ssid = None;

    for line in output.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("Connected to ") {
            bssid = rest.split_whitespace().next().map(|b| b.to_lowercase());
        } else if let Some(rest) = line.strip_prefix("SSID:") {
            ssid = Some(rest.trim().to_string());
        }
    }

    ssid.map(|ssid| WifiInfo { ssid, bssid })
}

/// Polls Linux interface state into a [`NetworkMonitor`]
pub struct SysfsNetworkSource {
    root: PathBuf,
    /// Interfaces to ignore (loopback, tunnel interfaces)
    ignored_prefixes: Vec<String>,
    interval: Duration,
}

impl SysfsNetworkSource {
    pub fn new(interval: Duration) -> Self {
        Self {
            root: PathBuf::from("/sys/class/net"),
            ignored_prefixes: vec!["lo".into(), "wg".into(), "tun".into(), "docker".into(), "veth".into()],
            interval,
        }
    }

    /// Take one snapshot of the host's interfaces
    pub async fn snapshot(&self) -> ConnectivityState {
        let mut state = ConnectivityState::default();
        let mut wifi: Option<WifiInfo> = None;

        let mut dir = match tokio::fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(e) => {
                warn!("Cannot read {}: {}", self.root.display(), e);
                return state;
            }
        };

        while let Ok(Some(entry)) = dir.next_entry().await {
            let name = entry.file_name().to_string_lossy().to_string();
            if self.ignored_prefixes.iter().any(|p| name.starts_with(p.as_str())) {
                continue;
            }
            if !is_oper_up(&entry.path()).await {
                continue;
            }

            if tokio::fs::metadata(entry.path().join("wireless")).await.is_ok() {
                state.wifi_connected = true;
                if wifi.is_none() {
                    wifi = query_iw_link(&name).await;
                }
            } else if name.starts_with("wwan") || name.starts_with("rmnet") {
                state.cellular_connected = true;
            } else {
                state.ethernet_connected = true;
            }
        }

        // Wired beats wireless beats cellular for the default route
        state.active_network = if state.ethernet_connected {
            ActiveNetwork::Ethernet
        } else if let Some(info) = wifi {
            ActiveNetwork::Wifi(info)
        } else if state.cellular_connected {
            ActiveNetwork::Cellular
        } else {
            ActiveNetwork::Disconnected
        };

        state
    }

    /// Poll until the monitor has no observers left
    pub async fn run(self, monitor: NetworkMonitor) {
        info!("Polling network state every {:?}", self.interval);
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let state = self.snapshot().await;
            monitor.publish(state);
            if monitor.tx.receiver_count() == 0 {
                debug!("No connectivity observers left, stopping poller");
                return;
            }
        }
    }
}

async fn is_oper_up(path: &Path) -> bool {
    match tokio::fs::read_to_string(path.join("operstate")).await {
        Ok(state) => state.trim() == "up",
        Err(_) => false,
    }
}

async fn query_iw_link(iface: &str) -> Option<WifiInfo> {
    let output = Command::new("iw")
        .args(["dev", iface, "link"])
        .output()
        .await
        .map_err(|e| debug!("iw unavailable: {}", e))
        .ok()?;

    parse_iw_link(&String::from_utf8_lossy(&output.stdout))
}
