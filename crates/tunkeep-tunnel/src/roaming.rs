//! Roaming Recovery
//!
//! When the device moves to another access point of the same Wi-Fi
//! network, UDP sockets bound to the old path can go silent. Instead of
//! restarting tunnels, recovery re-applies each running tunnel's
//! definition so the backend rebinds its sockets:
//!
//! 1. Hot-apply with endpoint addresses cached while the tunnel was up
//! 2. If that fails, resolve endpoint hostnames again and retry once
//!
//! Roams are debounced: a new roam cancels the pending recovery and the
//! delay starts over, so a burst of handoffs yields one recovery against
//! the latest stored config.

use crate::config::{TunnelConfig, TunnelId};
use crate::control::TunnelControl;
use crate::events::EngineMessage;
use crate::jobs::JobSet;
use crate::store::ConfigStore;
use async_trait::async_trait;
use futures_util::future::join_all;
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tunkeep_network::{is_valid_bssid, ConnectivityState, HostResolver};

/// Quiet period after the last roam before recovering
pub const ROAMING_DEBOUNCE: Duration = Duration::from_secs(2);

/// Upper bound on how long a recovery keeps the system awake
pub const WAKE_LOCK_TIMEOUT: Duration = Duration::from_secs(15);

const WAKE_LOCK_NAME: &str = "tunkeep-roaming";

/// Keeps the system from suspending during a recovery
#[async_trait]
pub trait WakeLock: Send + Sync {
    async fn acquire(&self, name: &str, timeout: Duration);
    async fn release(&self, name: &str);
}

/// Wake lock that does nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopWakeLock;

#[async_trait]
impl WakeLock for NoopWakeLock {
    async fn acquire(&self, _name: &str, _timeout: Duration) {}
    async fn release(&self, _name: &str) {}
}

/// Linux autosleep wake lock through `/sys/power/wake_lock`
#[derive(Debug, Clone)]
pub struct SysfsWakeLock {
    root: PathBuf,
}

impl SysfsWakeLock {
    pub fn new() -> Self {
        Self::with_root("/sys/power")
    }

    /// Wake lock files under `root` instead of `/sys/power`
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Default for SysfsWakeLock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WakeLock for SysfsWakeLock {
    async fn acquire(&self, name: &str, timeout: Duration) {
        let request = format!("{} {}", name, timeout.as_nanos());
        if let Err(e) = tokio::fs::write(self.root.join("wake_lock"), request).await {
            debug!("Wake lock unavailable: {}", e);
        }
    }

    async fn release(&self, name: &str) {
        if let Err(e) = tokio::fs::write(self.root.join("wake_unlock"), name).await {
            debug!("Wake unlock failed: {}", e);
        }
    }
}

/// What a connectivity snapshot means for roaming
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoamEvent {
    NotOnWifi,
    /// Joined a different network, or the first one seen
    NetworkChanged,
    /// Same network, different access point
    Roamed { from: String, to: String },
    Unchanged,
}

/// Last seen SSID and BSSID
#[derive(Debug, Default, Clone)]
pub struct RoamTracker {
    ssid: Option<String>,
    bssid: Option<String>,
}

impl RoamTracker {
    pub fn observe(&mut self, state: &ConnectivityState) -> RoamEvent {
        // Off Wi-Fi the last values stay so a return to the same AP is not a roam
        let Some(wifi) = state.active_wifi() else {
            return RoamEvent::NotOnWifi;
        };
        let bssid = wifi.bssid.as_deref().filter(|b| is_valid_bssid(b));

        if self.ssid.as_deref() != Some(wifi.ssid.as_str()) {
            self.ssid = Some(wifi.ssid.clone());
            self.bssid = bssid.map(str::to_string);
            return RoamEvent::NetworkChanged;
        }

        match (bssid, self.bssid.take()) {
            (Some(new), Some(old)) if !new.eq_ignore_ascii_case(&old) => {
                self.bssid = Some(new.to_string());
                RoamEvent::Roamed { from: old, to: new.to_string() }
            }
            (Some(new), None) => {
                self.bssid = Some(new.to_string());
                RoamEvent::Unchanged
            }
            (_, old) => {
                self.bssid = old;
                RoamEvent::Unchanged
            }
        }
    }
}

/// Resolve every hostname endpoint of `config`; failures are left out
pub async fn resolve_endpoints(resolver: &dyn HostResolver, config: &TunnelConfig) -> HashMap<String, IpAddr> {
    let lookups = config.definition.endpoint_hostnames().into_iter().map(|host| async move {
        let result = resolver.resolve_host(&host, config.is_ipv4_preferred).await;
        (host, result)
    });

    let mut resolved = HashMap::new();
    for (host, result) in join_all(lookups).await {
        match result {
            Ok(ip) => {
                resolved.insert(host, ip);
            }
            Err(e) => warn!("Failed to resolve {} for {}: {}", host, config.name, e),
        }
    }
    resolved
}

type EndpointCache = Mutex<HashMap<TunnelId, HashMap<String, IpAddr>>>;

struct Context {
    control: Arc<dyn TunnelControl>,
    store: Arc<dyn ConfigStore>,
    resolver: Arc<dyn HostResolver>,
    connectivity: watch::Receiver<ConnectivityState>,
    wake_lock: Arc<dyn WakeLock>,
    cache: EndpointCache,
}

impl Context {
    fn cached(&self, id: TunnelId) -> HashMap<String, IpAddr> {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
            .unwrap_or_default()
    }

    fn remember(&self, id: TunnelId, resolved: HashMap<String, IpAddr>) {
        if resolved.is_empty() {
            return;
        }
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        cache.entry(id).or_default().extend(resolved);
    }
}

/// Wi-Fi handoff recovery
pub struct RoamingRecovery {
    ctx: Arc<Context>,
}

impl RoamingRecovery {
    pub fn new(
        control: Arc<dyn TunnelControl>,
        store: Arc<dyn ConfigStore>,
        resolver: Arc<dyn HostResolver>,
        connectivity: watch::Receiver<ConnectivityState>,
    ) -> Self {
        Self::with_wake_lock(control, store, resolver, connectivity, Arc::new(NoopWakeLock))
    }

    pub fn with_wake_lock(
        control: Arc<dyn TunnelControl>,
        store: Arc<dyn ConfigStore>,
        resolver: Arc<dyn HostResolver>,
        connectivity: watch::Receiver<ConnectivityState>,
        wake_lock: Arc<dyn WakeLock>,
    ) -> Self {
        Self {
            ctx: Arc::new(Context {
                control,
                store,
                resolver,
                connectivity,
                wake_lock,
                cache: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Follow roams and maintain the endpoint cache until `shutdown` fires
    pub async fn run(self, shutdown: CancellationToken) {
        tokio::join!(
            follow_roaming(&self.ctx, &shutdown),
            maintain_cache(&self.ctx, &shutdown)
        );
        debug!("Roaming recovery stopped");
    }
}

async fn follow_roaming(ctx: &Arc<Context>, shutdown: &CancellationToken) {
    let mut rx = ctx.connectivity.clone();
    let mut tracker = RoamTracker::default();
    let mut pending: Option<CancellationToken> = None;

    loop {
        let state = rx.borrow_and_update().clone();
        match tracker.observe(&state) {
            RoamEvent::NotOnWifi | RoamEvent::NetworkChanged => {
                if let Some(token) = pending.take() {
                    debug!("Left the roamed network, cancelling recovery");
                    token.cancel();
                }
            }
            RoamEvent::Roamed { from, to } => {
                if let Some(token) = pending.take() {
                    token.cancel();
                }
                info!("Roamed from {} to {}, recovering in {:?}", from, to, ROAMING_DEBOUNCE);
                let token = shutdown.child_token();
                tokio::spawn(recover(Arc::clone(ctx), token.clone()));
                pending = Some(token);
            }
            RoamEvent::Unchanged => {}
        }

        tokio::select! {
            _ = shutdown.cancelled() => return,
            changed = rx.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
    }
}

async fn recover(ctx: Arc<Context>, cancel: CancellationToken) {
    tokio::select! {
        _ = cancel.cancelled() => return,
        _ = sleep(ROAMING_DEBOUNCE) => {}
    }

    if ctx.connectivity.borrow().active_wifi().is_none() {
        debug!("No longer on Wi-Fi, skipping roaming recovery");
        return;
    }

    let up: Vec<TunnelId> = ctx
        .control
        .tunnels()
        .snapshot()
        .into_iter()
        .filter(|(_, state)| state.status.is_up())
        .map(|(id, _)| id)
        .filter(|id| {
            let native = ctx.control.capabilities(*id).native_roaming;
            if native {
                debug!("Backend of tunnel {} handles roaming itself", id);
            }
            !native
        })
        .collect();
    if up.is_empty() {
        return;
    }

    ctx.wake_lock.acquire(WAKE_LOCK_NAME, WAKE_LOCK_TIMEOUT).await;
    for id in up {
        let Some(config) = ctx.store.tunnel(id).or_else(|| ctx.control.running_config(id)) else {
            continue;
        };
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = recover_tunnel(&ctx, &config) => {}
        }
    }
    ctx.wake_lock.release(WAKE_LOCK_NAME).await;
}

async fn recover_tunnel(ctx: &Context, config: &TunnelConfig) -> bool {
    let cached = config.definition.with_resolved_endpoints(&ctx.cached(config.id));
    let first = match ctx.control.apply_definition(config.id, &cached).await {
        Ok(()) => {
            info!("Rebound {} after roaming", config.name);
            ctx.control.events().message(Some(&config.name), EngineMessage::RoamingRecovered);
            return true;
        }
        Err(e) => e,
    };
    warn!("Cached endpoints failed for {}: {}, resolving again", config.name, first);

    let fresh = resolve_endpoints(ctx.resolver.as_ref(), config).await;
    ctx.remember(config.id, fresh.clone());
    let definition = config.definition.with_resolved_endpoints(&fresh);
    match ctx.control.apply_definition(config.id, &definition).await {
        Ok(()) => {
            info!("Rebound {} after roaming with fresh DNS", config.name);
            ctx.control.events().message(Some(&config.name), EngineMessage::RoamingRecovered);
            true
        }
        Err(e) => {
            error!("Roaming recovery of {} failed: {}", config.name, e);
            false
        }
    }
}

/// Capture endpoint addresses once per session after Up; drop them when
/// the tunnel leaves the active set
async fn maintain_cache(ctx: &Arc<Context>, shutdown: &CancellationToken) {
    let mut jobs: JobSet<(TunnelId, u64)> = JobSet::new(shutdown.clone());
    let mut populated: HashSet<(TunnelId, u64)> = HashSet::new();
    let mut rx = ctx.control.tunnels().subscribe();

    loop {
        let sessions: Vec<(TunnelId, u64, bool)> = rx
            .borrow_and_update()
            .iter()
            .map(|(id, state)| (*id, state.session, state.status.is_up()))
            .collect();

        let live: HashSet<(TunnelId, u64)> = sessions.iter().map(|(id, s, _)| (*id, *s)).collect();
        let ids: HashSet<TunnelId> = live.iter().map(|(id, _)| *id).collect();
        populated.retain(|key| live.contains(key));
        jobs.retain(|key| live.contains(key));
        ctx.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|id, _| ids.contains(id));

        for (id, session, is_up) in sessions {
            if !is_up || !populated.insert((id, session)) {
                continue;
            }
            let ctx = Arc::clone(ctx);
            jobs.spawn((id, session), move |cancel| async move {
                let Some(config) = ctx.control.running_config(id).or_else(|| ctx.store.tunnel(id)) else {
                    return;
                };
                if config.definition.endpoint_hostnames().is_empty() {
                    return;
                }
                let resolved = tokio::select! {
                    _ = cancel.cancelled() => return,
                    resolved = resolve_endpoints(ctx.resolver.as_ref(), &config) => resolved,
                };
                debug!("Cached {} endpoint address(es) for {}", resolved.len(), config.name);
                ctx.remember(id, resolved);
            });
        }

        tokio::select! {
            _ = shutdown.cancelled() => return,
            changed = rx.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
    }
}
