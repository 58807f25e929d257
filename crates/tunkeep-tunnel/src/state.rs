//! Tunnel State
//!
//! Everything observers can see about a running tunnel, and the shared
//! active-tunnel map it lives in.
//!
//! # Invariants
//!
//! - An id is in the map iff its status is Starting, Up or Stopping
//! - Status only moves forward: Starting → Up → Stopping → Down,
//!   or Starting → Down on failure
//! - Only the lifecycle writes the map; everyone else subscribes

use crate::config::TunnelId;
use crate::keys::PublicKey;
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::watch;

/// A healthy log line stays authoritative this long
pub const LOG_HEALTH_WINDOW: Duration = Duration::from_secs(2 * 60);

/// Uptime after which zero received bytes counts as unhealthy
pub const STATS_HEALTH_GRACE: Duration = Duration::from_secs(15);

/// Handshakes older than this mean the session is stale
pub const HANDSHAKE_STALE_AFTER: Duration = Duration::from_secs(180);

/// Wall clock in milliseconds since the epoch
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Why a tunnel is being stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StopReason {
    User,
    Ping,
    ConfigChanged,
    Roaming,
}

/// Per-tunnel lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelStatus {
    Down,
    Starting,
    Up,
    Stopping(StopReason),
}

impl TunnelStatus {
    pub fn is_up(&self) -> bool {
        matches!(self, TunnelStatus::Up)
    }

    pub fn is_down(&self) -> bool {
        matches!(self, TunnelStatus::Down)
    }

    /// Statuses that keep an entry in the active map
    pub fn is_active(&self) -> bool {
        !self.is_down()
    }

    fn rank(&self) -> u8 {
        match self {
            TunnelStatus::Starting => 0,
            TunnelStatus::Up => 1,
            TunnelStatus::Stopping(_) => 2,
            TunnelStatus::Down => 3,
        }
    }

    /// Forward-only transitions; Up → Starting and Stopping → Up are rejected
    pub fn can_transition_to(&self, next: TunnelStatus) -> bool {
        next.rank() >= self.rank()
    }
}

/// Derived tunnel health
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Unknown,
    Healthy,
    Unhealthy,
    Stale,
}

/// Why a peer was last marked unreachable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    NoResolvedEndpoint,
    NoConnectivity,
    PingFailed,
}

/// Last ping result for one peer
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PingState {
    pub transmitted: u32,
    pub received: u32,
    pub packet_loss: f64,
    pub rtt_min: f64,
    pub rtt_max: f64,
    pub rtt_avg: f64,
    pub rtt_stddev: f64,
    pub is_reachable: bool,
    pub failure_reason: Option<FailureReason>,
    pub consecutive_failures: u32,
    pub last_successful_ping_millis: Option<u64>,
    pub last_ping_attempt_millis: Option<u64>,
    pub ping_target: Option<String>,
}

/// Health as reported by the backend's own log output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogHealthState {
    pub is_healthy: bool,
    pub timestamp_millis: u64,
}

/// Counters for one peer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerStats {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub latest_handshake_millis: Option<u64>,
    pub resolved_endpoint: Option<SocketAddr>,
}

/// Backend counters for one tunnel
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TunnelStatistics {
    pub peers: HashMap<PublicKey, PeerStats>,
}

impl TunnelStatistics {
    pub fn peer(&self, key: &PublicKey) -> Option<&PeerStats> {
        self.peers.get(key)
    }

    pub fn rx(&self) -> u64 {
        self.peers.values().map(|p| p.rx_bytes).sum()
    }

    pub fn tx(&self) -> u64 {
        self.peers.values().map(|p| p.tx_bytes).sum()
    }

    /// Every peer that ever completed a handshake has gone quiet
    pub fn is_stale(&self, now_millis: u64) -> bool {
        let limit = HANDSHAKE_STALE_AFTER.as_millis() as u64;
        let mut handshakes = self.peers.values().filter_map(|p| p.latest_handshake_millis).peekable();
        handshakes.peek().is_some() && handshakes.all(|at| now_millis.saturating_sub(at) > limit)
    }
}

/// Observable state of one active tunnel
#[derive(Debug, Clone, PartialEq)]
pub struct TunnelState {
    pub status: TunnelStatus,
    /// Distinguishes one start of this id from the next
    pub session: u64,
    pub up_since_millis: Option<u64>,
    pub statistics: Option<TunnelStatistics>,
    pub ping_states: Option<HashMap<PublicKey, PingState>>,
    pub log_health: Option<LogHealthState>,
}

impl TunnelState {
    pub fn starting(session: u64) -> Self {
        Self {
            status: TunnelStatus::Starting,
            session,
            up_since_millis: None,
            statistics: None,
            ping_states: None,
            log_health: None,
        }
    }

    pub fn uptime_millis(&self, now_millis: u64) -> u64 {
        match (self.status, self.up_since_millis) {
            (TunnelStatus::Up, Some(since)) => now_millis.saturating_sub(since),
            _ => 0,
        }
    }

    /// Health from log output, ping results and counters, in that order
    pub fn health(&self, now_millis: u64) -> HealthStatus {
        if !self.status.is_up() {
            return HealthStatus::Unknown;
        }
        if self.ping_states.is_none() && self.log_health.is_none() && self.statistics.is_none() {
            return HealthStatus::Unknown;
        }

        let any_unreachable = self
            .ping_states
            .as_ref()
            .is_some_and(|pings| pings.values().any(|p| !p.is_reachable));

        if let Some(log) = self.log_health {
            if !log.is_healthy {
                return HealthStatus::Unhealthy;
            }
            let age = now_millis.saturating_sub(log.timestamp_millis);
            if age <= LOG_HEALTH_WINDOW.as_millis() as u64 {
                return if any_unreachable {
                    HealthStatus::Unhealthy
                } else {
                    HealthStatus::Healthy
                };
            }
        }

        if self.ping_states.is_some() {
            return if any_unreachable {
                HealthStatus::Unhealthy
            } else {
                HealthStatus::Healthy
            };
        }

        if let Some(stats) = &self.statistics {
            if stats.is_stale(now_millis) {
                return HealthStatus::Stale;
            }
            let rx = stats.rx();
            if rx == 0 && self.uptime_millis(now_millis) >= STATS_HEALTH_GRACE.as_millis() as u64 {
                return HealthStatus::Unhealthy;
            }
            if rx == 0 {
                return HealthStatus::Unknown;
            }
            return HealthStatus::Healthy;
        }

        HealthStatus::Unknown
    }
}

/// Partial update merged into a [`TunnelState`]; `None` keeps the current value
#[derive(Debug, Clone, Default)]
pub struct TunnelUpdate {
    pub status: Option<TunnelStatus>,
    pub statistics: Option<TunnelStatistics>,
    pub ping_states: Option<HashMap<PublicKey, PingState>>,
    pub log_health: Option<LogHealthState>,
}

impl TunnelUpdate {
    pub fn status(status: TunnelStatus) -> Self {
        Self { status: Some(status), ..Self::default() }
    }

    pub fn statistics(statistics: TunnelStatistics) -> Self {
        Self { statistics: Some(statistics), ..Self::default() }
    }

    pub fn ping_states(ping_states: HashMap<PublicKey, PingState>) -> Self {
        Self { ping_states: Some(ping_states), ..Self::default() }
    }

    pub fn log_health(log_health: LogHealthState) -> Self {
        Self { log_health: Some(log_health), ..Self::default() }
    }
}

/// tunnel id → state
pub type ActiveTunnels = BTreeMap<TunnelId, TunnelState>;

/// Shared, observable active-tunnel map
///
/// Cloning shares the same map. Reads are open to everyone; writes go
/// through [`TunnelMap::modify`], which only the lifecycle calls.
#[derive(Clone)]
pub struct TunnelMap {
    tx: Arc<watch::Sender<ActiveTunnels>>,
    sessions: Arc<AtomicU64>,
}

impl TunnelMap {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ActiveTunnels::new());
        Self {
            tx: Arc::new(tx),
            sessions: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Fresh session number, unique across every lifecycle sharing this map
    pub(crate) fn next_session(&self) -> u64 {
        self.sessions.fetch_add(1, Ordering::Relaxed)
    }

    pub fn subscribe(&self) -> watch::Receiver<ActiveTunnels> {
        self.tx.subscribe()
    }

    pub fn snapshot(&self) -> ActiveTunnels {
        self.tx.borrow().clone()
    }

    pub fn get(&self, id: TunnelId) -> Option<TunnelState> {
        self.tx.borrow().get(&id).cloned()
    }

    pub fn contains(&self, id: TunnelId) -> bool {
        self.tx.borrow().contains_key(&id)
    }

    pub fn ids(&self) -> Vec<TunnelId> {
        self.tx.borrow().keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.borrow().is_empty()
    }

    /// Atomic read-modify-write; observers wake only when `f` returns true
    pub(crate) fn modify(&self, f: impl FnOnce(&mut ActiveTunnels) -> bool) -> bool {
        self.tx.send_if_modified(f)
    }
}

impl Default for TunnelMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::PrivateKey;

    fn up_state(up_since: u64) -> TunnelState {
        TunnelState {
            status: TunnelStatus::Up,
            up_since_millis: Some(up_since),
            ..TunnelState::starting(1)
        }
    }

    fn ping(reachable: bool) -> PingState {
        PingState { is_reachable: reachable, ..PingState::default() }
    }

    fn stats_with(rx: u64, handshake: Option<u64>) -> TunnelStatistics {
        let key = PrivateKey::generate().public_key();
        let peer = PeerStats { rx_bytes: rx, latest_handshake_millis: handshake, ..PeerStats::default() };
        TunnelStatistics { peers: HashMap::from([(key, peer)]) }
    }

    #[test]
    fn test_transitions_are_monotonic() {
        use TunnelStatus::*;
        assert!(Starting.can_transition_to(Up));
        assert!(Starting.can_transition_to(Down));
        assert!(Up.can_transition_to(Stopping(StopReason::User)));
        assert!(Stopping(StopReason::Ping).can_transition_to(Down));

        assert!(!Up.can_transition_to(Starting));
        assert!(!Stopping(StopReason::User).can_transition_to(Up));
        assert!(!Down.can_transition_to(Up));
    }

    #[test]
    fn test_health_unknown_unless_up() {
        let mut state = TunnelState::starting(1);
        state.ping_states = Some(HashMap::new());
        assert_eq!(state.health(0), HealthStatus::Unknown);

        assert_eq!(up_state(0).health(1_000), HealthStatus::Unknown);
    }

    #[test]
    fn test_health_from_pings() {
        let key = PrivateKey::generate().public_key();
        let mut state = up_state(0);

        state.ping_states = Some(HashMap::from([(key, ping(true))]));
        assert_eq!(state.health(1_000), HealthStatus::Healthy);

        state.ping_states = Some(HashMap::from([(key, ping(false))]));
        assert_eq!(state.health(1_000), HealthStatus::Unhealthy);
    }

    #[test]
    fn test_log_health_takes_precedence() {
        let key = PrivateKey::generate().public_key();
        let mut state = up_state(0);
        state.log_health = Some(LogHealthState { is_healthy: true, timestamp_millis: 10_000 });
        assert_eq!(state.health(20_000), HealthStatus::Healthy);

        // Recent healthy log is overridden by an unreachable peer
        state.ping_states = Some(HashMap::from([(key, ping(false))]));
        assert_eq!(state.health(20_000), HealthStatus::Unhealthy);

        state.ping_states = None;
        state.log_health = Some(LogHealthState { is_healthy: false, timestamp_millis: 10_000 });
        assert_eq!(state.health(20_000), HealthStatus::Unhealthy);

        // Old healthy log with no other data falls through to unknown
        state.log_health = Some(LogHealthState { is_healthy: true, timestamp_millis: 0 });
        assert_eq!(state.health(10 * 60_000), HealthStatus::Unknown);
    }

    #[test]
    fn test_health_from_statistics() {
        let mut state = up_state(0);

        state.statistics = Some(stats_with(0, None));
        assert_eq!(state.health(5_000), HealthStatus::Unknown);
        assert_eq!(state.health(15_000), HealthStatus::Unhealthy);

        state.statistics = Some(stats_with(4096, Some(10_000)));
        assert_eq!(state.health(20_000), HealthStatus::Healthy);

        state.statistics = Some(stats_with(4096, Some(0)));
        assert_eq!(state.health(181_000), HealthStatus::Stale);
    }

    #[tokio::test]
    async fn test_map_modify_notifies_only_on_change() {
        let map = TunnelMap::new();
        let mut rx = map.subscribe();

        assert!(!map.modify(|_| false));
        assert!(!rx.has_changed().unwrap());

        assert!(map.modify(|m| m.insert(TunnelId(1), TunnelState::starting(1)).is_none()));
        assert!(rx.has_changed().unwrap());
        assert!(map.contains(TunnelId(1)));
        assert_eq!(map.ids(), vec![TunnelId(1)]);
    }
}
