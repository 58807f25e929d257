//! Dynamic DNS refresh
//!
//! Tunnels that opted in with `restart_on_ping_failure` get their peer
//! hostnames re-resolved while they are unhealthy. Attempts back off
//! exponentially and the backoff starts over once the tunnel is healthy
//! again or a refresh changed something.

use crate::config::TunnelId;
use crate::control::TunnelControl;
use crate::events::EngineMessage;
use crate::jobs::JobSet;
use crate::state::{now_millis, HealthStatus};
use crate::store::ConfigStore;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DNS_BACKOFF_BASE: Duration = Duration::from_secs(30);
pub const DNS_BACKOFF_FACTOR: f64 = 1.5;
pub const DNS_BACKOFF_MAX: Duration = Duration::from_secs(300);

/// Exponential delay between refresh attempts
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    factor: f64,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(base: Duration, factor: f64, max: Duration) -> Self {
        Self {
            base,
            factor,
            max,
            current: base,
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn advance(&mut self) {
        self.current = self.current.mul_f64(self.factor).min(self.max);
    }

    pub fn reset(&mut self) {
        self.current = self.base;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(DNS_BACKOFF_BASE, DNS_BACKOFF_FACTOR, DNS_BACKOFF_MAX)
    }
}

/// Re-resolves endpoints of unhealthy opted-in tunnels
pub struct DnsRefresher {
    control: Arc<dyn TunnelControl>,
    store: Arc<dyn ConfigStore>,
}

impl DnsRefresher {
    pub fn new(control: Arc<dyn TunnelControl>, store: Arc<dyn ConfigStore>) -> Self {
        Self { control, store }
    }

    fn eligible(&self) -> BTreeSet<TunnelId> {
        let active = self.control.tunnels().ids();
        active
            .into_iter()
            .filter(|id| !self.control.capabilities(*id).self_manages_endpoints)
            .filter(|id| self.store.tunnel(*id).is_some_and(|c| c.restart_on_ping_failure))
            .collect()
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let mut jobs: JobSet<TunnelId> = JobSet::new(shutdown.clone());
        let mut tunnels_rx = self.control.tunnels().subscribe();
        let mut configs_rx = self.store.subscribe_tunnels();

        loop {
            tunnels_rx.mark_unchanged();
            configs_rx.mark_unchanged();

            let eligible = self.eligible();
            jobs.retain(|id| eligible.contains(id));
            for id in eligible {
                if jobs.contains(&id) {
                    continue;
                }
                let control = Arc::clone(&self.control);
                let store = Arc::clone(&self.store);
                jobs.spawn(id, move |cancel| refresh_while_unhealthy(control, store, id, cancel));
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                changed = tunnels_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                changed = configs_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        debug!("DNS refresher stopped");
    }
}

fn is_unhealthy(control: &dyn TunnelControl, id: TunnelId) -> bool {
    control
        .tunnels()
        .get(id)
        .is_some_and(|state| state.health(now_millis()) == HealthStatus::Unhealthy)
}

async fn refresh_while_unhealthy(
    control: Arc<dyn TunnelControl>,
    store: Arc<dyn ConfigStore>,
    id: TunnelId,
    cancel: CancellationToken,
) {
    let mut backoff = Backoff::default();
    let mut rx = control.tunnels().subscribe();

    loop {
        rx.mark_unchanged();
        if !is_unhealthy(control.as_ref(), id) {
            backoff.reset();
            tokio::select! {
                _ = cancel.cancelled() => return,
                changed = rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
            continue;
        }

        let Some(config) = store.tunnel(id).or_else(|| control.running_config(id)) else {
            return;
        };
        debug!("{} is unhealthy, refreshing DNS", config.name);
        match control.resolve_dns(&config).await {
            Ok(true) => {
                info!("Updated endpoints of {}", config.name);
                control.events().message(Some(&config.name), EngineMessage::DynamicDnsSuccess);
                backoff.reset();
            }
            Ok(false) => debug!("Endpoints of {} unchanged", config.name),
            Err(e) => warn!("DNS refresh of {} failed: {}", config.name, e),
        }

        let delay = backoff.current();
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = sleep(delay) => {}
        }
        backoff.advance();
    }
}
