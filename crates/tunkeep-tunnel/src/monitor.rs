//! Health Monitor
//!
//! One job per active tunnel session, each running independent loops:
//!
//! 1. **Config drift**: watches the stored config and bounces the tunnel
//!    with [`StopReason::ConfigChanged`] when it no longer matches what is
//!    running
//! 2. **Statistics**: pulls backend counters every second
//! 3. **Reachability**: pings every pingable peer on the ping interval,
//!    on reconnect and once right after the tunnel comes up; restarted
//!    whenever the ping settings change
//! 4. **Log health** (optional): classifies backend log lines
//!
//! Nothing here writes the active map directly; results go back through
//! [`TunnelControl::update_tunnel_status`].

use crate::config::{
    AllowedIp, Endpoint, PeerConfig, TunnelConfig, TunnelId, CLOUDFLARE_IPV4, CLOUDFLARE_IPV6,
};
use crate::control::TunnelControl;
use crate::jobs::JobSet;
use crate::keys::PublicKey;
use crate::state::{
    now_millis, FailureReason, LogHealthState, PingState, StopReason, TunnelStatistics, TunnelUpdate,
};
use crate::store::{ConfigStore, MonitoringSettings};
use futures_util::future::join_all;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tunkeep_network::{ConnectivityState, PingError, PingStats, Pinger};

/// Backend counter poll period
pub const STATS_POLL_INTERVAL: Duration = Duration::from_millis(1000);

/// Per-ping timeout when settings leave it unset
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(5);

const KEEPALIVE_RESPONSE_TEXT: &str = "Receiving keepalive packet";
const HANDSHAKE_RESPONSE_TEXT: &str = "Received handshake response";
const HANDSHAKE_INIT_FAILED_TEXT: &str = "Failed to send handshake initiation: write udp";
const DATA_PACKET_FAILED_TEXT: &str = "Failed to send data packets";
const HANDSHAKE_NOT_COMPLETED_TEXT: &str = "Handshake did not complete after 5 seconds, retrying";

/// One line of backend log output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    /// Interface name the line was logged for
    pub tag: String,
    pub message: String,
}

/// Health verdict of a log line, if it carries one
///
/// Matching ignores case for every rule.
pub fn classify_log_line(message: &str) -> Option<bool> {
    let lower = message.to_lowercase();
    let contains = |needle: &str| lower.contains(&needle.to_lowercase());

    if contains(HANDSHAKE_RESPONSE_TEXT) || contains(KEEPALIVE_RESPONSE_TEXT) {
        Some(true)
    } else if contains(HANDSHAKE_INIT_FAILED_TEXT)
        || contains(HANDSHAKE_NOT_COMPLETED_TEXT)
        || contains(DATA_PACKET_FAILED_TEXT)
    {
        Some(false)
    } else {
        None
    }
}

/// Address pinged to judge a peer's reachability
///
/// An explicit tunnel target wins. A catch-all route is pinged through a
/// public resolver in the endpoint's address family: the resolved endpoint
/// from statistics, else a literal endpoint, else IPv4 for a hostname not
/// resolved yet. Other peers are pinged at their first allowed address.
pub fn ping_target(
    config: &TunnelConfig,
    peer: &PeerConfig,
    stats: Option<&TunnelStatistics>,
) -> Result<String, FailureReason> {
    if let Some(target) = &config.ping_target {
        return Ok(target.clone());
    }

    if peer.allowed_ips.iter().any(AllowedIp::is_catch_all) {
        let resolved = stats
            .and_then(|s| s.peer(&peer.public_key))
            .and_then(|p| p.resolved_endpoint)
            .map(|addr| addr.ip());
        let literal = peer.endpoint.as_ref().and_then(Endpoint::literal_ip);

        return match (resolved.or(literal), &peer.endpoint) {
            (Some(IpAddr::V6(_)), _) => Ok(CLOUDFLARE_IPV6.to_string()),
            (Some(IpAddr::V4(_)), _) | (None, Some(_)) => Ok(CLOUDFLARE_IPV4.to_string()),
            (None, None) => Err(FailureReason::NoResolvedEndpoint),
        };
    }

    peer.allowed_ips
        .first()
        .map(|allowed| allowed.addr.to_string())
        .ok_or(FailureReason::NoResolvedEndpoint)
}

/// Next state of one peer after a ping
fn pinged_state(
    previous: Option<&PingState>,
    target: Result<String, FailureReason>,
    outcome: Option<Result<PingStats, PingError>>,
    attempted_at: u64,
) -> PingState {
    let mut state = previous.cloned().unwrap_or_default();
    state.last_ping_attempt_millis = Some(attempted_at);

    let target = match target {
        Ok(target) => target,
        Err(reason) => {
            state.is_reachable = false;
            state.failure_reason = Some(reason);
            state.consecutive_failures += 1;
            return state;
        }
    };
    state.ping_target = Some(target);

    match outcome {
        Some(Ok(stats)) if stats.is_reachable() => {
            state.transmitted = stats.transmitted;
            state.received = stats.received;
            state.packet_loss = stats.packet_loss;
            state.rtt_min = stats.rtt_min;
            state.rtt_max = stats.rtt_max;
            state.rtt_avg = stats.rtt_avg;
            state.rtt_stddev = stats.rtt_stddev;
            state.is_reachable = true;
            state.failure_reason = None;
            state.consecutive_failures = 0;
            state.last_successful_ping_millis = Some(attempted_at);
        }
        Some(Ok(stats)) => {
            state.transmitted = stats.transmitted;
            state.received = stats.received;
            state.packet_loss = stats.packet_loss;
            state.is_reachable = false;
            state.failure_reason = Some(FailureReason::PingFailed);
            state.consecutive_failures += 1;
        }
        Some(Err(_)) | None => {
            state.is_reachable = false;
            state.failure_reason = Some(FailureReason::PingFailed);
            state.consecutive_failures += 1;
        }
    }
    state
}

struct Context {
    control: Arc<dyn TunnelControl>,
    store: Arc<dyn ConfigStore>,
    pinger: Arc<dyn Pinger>,
    connectivity: watch::Receiver<ConnectivityState>,
    logs: Option<broadcast::Sender<LogLine>>,
}

/// Per-tunnel health supervision
pub struct HealthMonitor {
    ctx: Arc<Context>,
}

impl HealthMonitor {
    pub fn new(
        control: Arc<dyn TunnelControl>,
        store: Arc<dyn ConfigStore>,
        pinger: Arc<dyn Pinger>,
        connectivity: watch::Receiver<ConnectivityState>,
    ) -> Self {
        Self {
            ctx: Arc::new(Context {
                control,
                store,
                pinger,
                connectivity,
                logs: None,
            }),
        }
    }

    /// Feed backend log lines into health when local logs are enabled
    pub fn with_logs(self, logs: broadcast::Sender<LogLine>) -> Self {
        let ctx = Context {
            control: Arc::clone(&self.ctx.control),
            store: Arc::clone(&self.ctx.store),
            pinger: Arc::clone(&self.ctx.pinger),
            connectivity: self.ctx.connectivity.clone(),
            logs: Some(logs),
        };
        Self { ctx: Arc::new(ctx) }
    }

    /// Follow the active map until `shutdown` fires
    pub async fn run(self, shutdown: CancellationToken) {
        let mut jobs: JobSet<(TunnelId, u64)> = JobSet::new(shutdown.clone());
        let mut rx = self.ctx.control.tunnels().subscribe();

        loop {
            let sessions: HashMap<TunnelId, u64> = rx
                .borrow_and_update()
                .iter()
                .map(|(id, state)| (*id, state.session))
                .collect();

            jobs.retain(|(id, session)| sessions.get(id) == Some(session));
            for (id, session) in sessions {
                if jobs.contains(&(id, session)) {
                    continue;
                }
                let ctx = Arc::clone(&self.ctx);
                jobs.spawn((id, session), move |cancel| monitor_tunnel(ctx, id, cancel));
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                changed = rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        debug!("Health monitor stopped");
    }
}

async fn monitor_tunnel(ctx: Arc<Context>, id: TunnelId, cancel: CancellationToken) {
    let Some(config) = ctx.control.running_config(id).or_else(|| ctx.store.tunnel(id)) else {
        warn!("No config for tunnel {}, not monitoring", id);
        return;
    };
    info!("Monitoring tunnel {}", config.name);

    let with_logs = ctx.logs.is_some() && ctx.store.settings().monitoring.is_local_logs_enabled;
    tokio::join!(
        watch_drift(&ctx, &config, &cancel),
        poll_statistics(&ctx, id, &cancel),
        ping_peers(&ctx, &config, &cancel),
        async {
            if with_logs {
                watch_logs(&ctx, &config, &cancel).await;
            }
        },
    );
    debug!("Stopped monitoring {}", config.name);
}

async fn watch_drift(ctx: &Context, running: &TunnelConfig, cancel: &CancellationToken) {
    let mut rx = ctx.store.subscribe_tunnels();
    loop {
        let latest = rx.borrow_and_update().iter().find(|t| t.id == running.id).cloned();
        if let Some(latest) = latest {
            if running.differs_at_runtime(&latest) {
                info!("Config of {} changed, bouncing", running.name);
                // The bounce stops this tunnel and with it this job
                let control = Arc::clone(&ctx.control);
                tokio::spawn(async move {
                    let name = latest.name.clone();
                    if let Err(e) = control.bounce_tunnel(latest, StopReason::ConfigChanged).await {
                        warn!("Failed to bounce {}: {}", name, e);
                    }
                });
                return;
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            changed = rx.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
    }
}

async fn poll_statistics(ctx: &Context, id: TunnelId, cancel: &CancellationToken) {
    let mut ticker = interval(STATS_POLL_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        if let Some(stats) = ctx.control.statistics(id).await {
            ctx.control.update_tunnel_status(id, TunnelUpdate::statistics(stats));
        }
    }
}

async fn ping_peers(ctx: &Context, config: &TunnelConfig, cancel: &CancellationToken) {
    let mut settings = ctx.store.subscribe_settings();
    loop {
        let monitoring = settings.borrow_and_update().monitoring.clone();
        let key = monitoring.ping_key();

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ping_pipeline(ctx, config, &monitoring) => return,
            _ = ping_settings_changed(&mut settings, key) => {
                debug!("Ping settings changed, restarting pings for {}", config.name);
            }
        }
    }
}

async fn ping_settings_changed(
    rx: &mut watch::Receiver<crate::store::Settings>,
    key: (bool, u64, u32, Option<u64>),
) {
    loop {
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
        if rx.borrow_and_update().monitoring.ping_key() != key {
            return;
        }
    }
}

/// Ping until cancelled; never returns while pinging is possible
async fn ping_pipeline(ctx: &Context, config: &TunnelConfig, monitoring: &MonitoringSettings) {
    let id = config.id;
    if !monitoring.is_ping_enabled {
        debug!("Ping disabled for {}", config.name);
        return std::future::pending().await;
    }

    let peers: Vec<PeerConfig> = config.pingable_peers().cloned().collect();
    if peers.is_empty() {
        debug!("No pingable peers in {}", config.name);
        return std::future::pending().await;
    }

    let mut map = ctx.control.tunnels().subscribe();
    let came_up = map
        .wait_for(|m| m.get(&id).is_some_and(|s| s.status.is_up()))
        .await
        .is_ok();
    if !came_up {
        return std::future::pending().await;
    }

    let mut connectivity = ctx.connectivity.clone();
    let mut connected = connectivity.borrow_and_update().has_connectivity();
    let mut ticker = interval(monitoring.ping_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last: HashMap<PublicKey, PingState> = HashMap::new();

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if connected {
                    ping_all(ctx, config, &peers, monitoring, &mut last).await;
                } else {
                    mark_disconnected(ctx, config, &peers, &mut last);
                }
            }
            changed = connectivity.changed() => {
                if changed.is_err() {
                    return std::future::pending().await;
                }
                let now_connected = connectivity.borrow_and_update().has_connectivity();
                match (connected, now_connected) {
                    (true, false) => mark_disconnected(ctx, config, &peers, &mut last),
                    (false, true) => ping_all(ctx, config, &peers, monitoring, &mut last).await,
                    _ => {}
                }
                connected = now_connected;
            }
        }
    }
}

async fn ping_all(
    ctx: &Context,
    config: &TunnelConfig,
    peers: &[PeerConfig],
    monitoring: &MonitoringSettings,
    last: &mut HashMap<PublicKey, PingState>,
) {
    let stats = ctx.control.tunnels().get(config.id).and_then(|s| s.statistics);
    let timeout = monitoring.ping_timeout().unwrap_or(DEFAULT_PING_TIMEOUT);
    let attempted_at = now_millis();

    let pings = peers.iter().map(|peer| {
        let target = ping_target(config, peer, stats.as_ref());
        let pinger = Arc::clone(&ctx.pinger);
        async move {
            let outcome = match &target {
                Ok(host) => Some(pinger.ping(host, monitoring.ping_attempts, timeout).await),
                Err(_) => None,
            };
            (peer.public_key, target, outcome)
        }
    });

    for (key, target, outcome) in join_all(pings).await {
        if let Some(Err(e)) = &outcome {
            debug!("Ping for peer {} of {} failed: {}", key.short(), config.name, e);
        }
        let state = pinged_state(last.get(&key), target, outcome, attempted_at);
        last.insert(key, state);
    }

    ctx.control
        .update_tunnel_status(config.id, TunnelUpdate::ping_states(last.clone()));
}

fn mark_disconnected(
    ctx: &Context,
    config: &TunnelConfig,
    peers: &[PeerConfig],
    last: &mut HashMap<PublicKey, PingState>,
) {
    let now = now_millis();
    for peer in peers {
        let state = last.entry(peer.public_key).or_default();
        state.is_reachable = false;
        state.failure_reason = Some(FailureReason::NoConnectivity);
        state.consecutive_failures = 0;
        state.last_ping_attempt_millis = Some(now);
    }
    debug!("No connectivity, marking peers of {} unreachable", config.name);
    ctx.control
        .update_tunnel_status(config.id, TunnelUpdate::ping_states(last.clone()));
}

async fn watch_logs(ctx: &Context, config: &TunnelConfig, cancel: &CancellationToken) {
    let Some(logs) = &ctx.logs else {
        return;
    };
    let mut rx = logs.subscribe();
    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => return,
            line = rx.recv() => line,
        };
        match line {
            Ok(line) => {
                if line.tag != config.name {
                    continue;
                }
                if let Some(is_healthy) = classify_log_line(&line.message) {
                    let health = LogHealthState {
                        is_healthy,
                        timestamp_millis: now_millis(),
                    };
                    ctx.control.update_tunnel_status(config.id, TunnelUpdate::log_health(health));
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => debug!("Skipped {} log lines", n),
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}
