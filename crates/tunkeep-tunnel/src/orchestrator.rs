//! Tunnel Orchestrator
//!
//! Holds one [`TunnelLifecycle`] per backend, all writing into the same
//! [`TunnelMap`], and follows the settings stream to decide which one is
//! selected. New commands go to the selected lifecycle; commands for a
//! running tunnel go to whichever lifecycle supervises it.
//!
//! Error and message events of the selected lifecycle are re-published on
//! the orchestrator's own bus. On a backend switch the forwarder moves to
//! the new lifecycle (latest wins).

use crate::backend::{BackendCapabilities, BackendKind, TunnelBackend};
use crate::config::{TunnelConfig, TunnelDefinition, TunnelId};
use crate::control::TunnelControl;
use crate::error::{BackendError, TunnelError};
use crate::events::EventBus;
use crate::kill_switch::BackendMode;
use crate::lifecycle::TunnelLifecycle;
use crate::state::{StopReason, TunnelMap, TunnelStatistics, TunnelUpdate};
use crate::store::{ConfigStore, Settings};
use async_trait::async_trait;
use futures_util::future::join_all;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

struct Inner {
    lifecycles: BTreeMap<BackendKind, TunnelLifecycle>,
    selected: watch::Sender<TunnelLifecycle>,
    tunnels: TunnelMap,
    store: Arc<dyn ConfigStore>,
    events: EventBus,
}

/// Multi-backend dispatcher
#[derive(Clone)]
pub struct TunnelOrchestrator {
    inner: Arc<Inner>,
}

impl TunnelOrchestrator {
    /// Build one lifecycle per backend and select the one named in settings
    pub fn new(backends: Vec<Arc<dyn TunnelBackend>>, store: Arc<dyn ConfigStore>) -> Result<Self, TunnelError> {
        let tunnels = TunnelMap::new();
        let lifecycles: BTreeMap<_, _> = backends
            .into_iter()
            .map(|backend| (backend.kind(), TunnelLifecycle::new(backend, tunnels.clone())))
            .collect();

        let requested = store.settings().general.backend;
        let initial = match lifecycles.get(&requested) {
            Some(lifecycle) => lifecycle.clone(),
            None => {
                let fallback = lifecycles
                    .values()
                    .next()
                    .cloned()
                    .ok_or(TunnelError::Backend(BackendError::Unavailable(requested)))?;
                warn!("{} backend not available, using {}", requested, fallback.kind());
                fallback
            }
        };
        info!("Orchestrator ready with {} backend(s), {} selected", lifecycles.len(), initial.kind());

        let (selected, _) = watch::channel(initial);
        Ok(Self {
            inner: Arc::new(Inner {
                lifecycles,
                selected,
                tunnels,
                store,
                events: EventBus::new(),
            }),
        })
    }

    /// The selected lifecycle
    pub fn active(&self) -> TunnelLifecycle {
        self.inner.selected.borrow().clone()
    }

    pub fn active_kind(&self) -> BackendKind {
        self.active().kind()
    }

    pub fn store(&self) -> Arc<dyn ConfigStore> {
        Arc::clone(&self.inner.store)
    }

    /// Lifecycle supervising `id`, or the selected one
    fn owner(&self, id: TunnelId) -> TunnelLifecycle {
        self.inner
            .lifecycles
            .values()
            .find(|l| l.running_config(id).is_some())
            .cloned()
            .unwrap_or_else(|| self.active())
    }

    /// Follow settings and forward events until `shutdown` fires
    pub async fn run(self, shutdown: CancellationToken) {
        tokio::join!(self.follow_settings(shutdown.clone()), self.forward_events(shutdown));
        debug!("Orchestrator stopped");
    }

    async fn follow_settings(&self, shutdown: CancellationToken) {
        let mut rx = self.inner.store.subscribe_settings();
        loop {
            let settings = rx.borrow_and_update().clone();
            self.apply_settings(&settings).await;

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

    /// Apply backend selection and lockdown posture
    pub async fn apply_settings(&self, settings: &Settings) {
        let requested = settings.general.backend;
        let current = self.active();

        if current.kind() != requested {
            match self.inner.lifecycles.get(&requested) {
                Some(next) => {
                    info!("Switching backend from {} to {}", current.kind(), requested);
                    current.stop_all(StopReason::User).await;
                    if current.backend_mode().is_kill_switch() {
                        if let Err(e) = current.set_backend_mode(BackendMode::Inactive).await {
                            warn!("Failed to clear {} backend mode: {}", current.kind(), e);
                        }
                    }
                    self.inner.selected.send_replace(next.clone());
                }
                None => warn!("{} backend not available, staying on {}", requested, current.kind()),
            }
        }

        let active = self.active();
        let mode = active.backend_mode();
        let target = if settings.general.is_lockdown_enabled {
            BackendMode::lockdown(&settings.lockdown)
        } else if mode.is_kill_switch() {
            BackendMode::Inactive
        } else {
            return;
        };

        if mode != target {
            if let Err(e) = active.set_backend_mode(target).await {
                error!("Failed to apply backend mode: {}", e);
                self.inner.events.error(None, e);
            }
        }
    }

    async fn forward_events(&self, shutdown: CancellationToken) {
        let mut selected = self.inner.selected.subscribe();
        loop {
            let lifecycle = selected.borrow_and_update().clone();
            let source = lifecycle.events();
            let mut errors = source.subscribe_errors();
            let mut messages = source.subscribe_messages();
            debug!("Forwarding events from {} backend", lifecycle.kind());

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    changed = selected.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        break;
                    }
                    event = errors.recv() => match event {
                        Ok(event) => self.inner.events.forward_error(event),
                        Err(broadcast::error::RecvError::Lagged(n)) => warn!("Dropped {} error events", n),
                        Err(broadcast::error::RecvError::Closed) => return,
                    },
                    event = messages.recv() => match event {
                        Ok(event) => self.inner.events.forward_message(event),
                        Err(broadcast::error::RecvError::Lagged(n)) => warn!("Dropped {} message events", n),
                        Err(broadcast::error::RecvError::Closed) => return,
                    },
                }
            }
        }
    }

    /// Start every previously active tunnel that is not running yet
    ///
    /// The selected backend's concurrency limit caps how many are started,
    /// in store order. Returns the number started.
    pub async fn restore_previous_state(&self) -> usize {
        let settings = self.inner.store.settings();
        if !settings.general.is_restore_on_boot_enabled {
            debug!("Restore on boot disabled");
            return 0;
        }

        let active = self.active();
        let candidates: Vec<TunnelConfig> = self
            .inner
            .store
            .tunnels()
            .into_iter()
            .filter(|t| t.is_active && !self.inner.tunnels.contains(t.id))
            .collect();

        let capabilities = active.capabilities();
        let room = capabilities
            .max_concurrent_tunnels
            .map_or(usize::MAX, |max| max.saturating_sub(self.inner.tunnels.ids().len()));
        let limit = capabilities.restore_limit(candidates.len()).min(room);
        if limit < candidates.len() {
            info!("Restoring {} of {} previously active tunnels", limit, candidates.len());
        }

        let starts = candidates.into_iter().take(limit).map(|config| {
            let lifecycle = active.clone();
            async move {
                let name = config.name.clone();
                (name, lifecycle.start_tunnel(config).await)
            }
        });

        let mut started = 0;
        for (name, result) in join_all(starts).await {
            match result {
                Ok(()) => started += 1,
                Err(e) => warn!("Failed to restore tunnel {}: {}", name, e),
            }
        }
        info!("Restored {} tunnel(s)", started);
        started
    }

    /// Bounce every active tunnel with its stored config
    pub async fn restart_active_tunnels(&self) {
        for id in self.inner.tunnels.ids() {
            let owner = self.owner(id);
            let Some(config) = self.inner.store.tunnel(id).or_else(|| owner.running_config(id)) else {
                continue;
            };
            if let Err(e) = owner.bounce(config, StopReason::ConfigChanged).await {
                warn!("Failed to restart tunnel {}: {}", id, e);
            }
        }
    }

    pub async fn start_tunnel(&self, config: TunnelConfig) -> Result<(), TunnelError> {
        self.active().start_tunnel(config).await
    }

    pub async fn stop_tunnel(&self, id: TunnelId, reason: StopReason) -> Result<(), TunnelError> {
        self.owner(id).stop_tunnel(id, reason).await
    }

    pub async fn force_stop_tunnel(&self, id: TunnelId) {
        self.owner(id).force_stop_tunnel(id).await
    }

    pub async fn stop_all(&self, reason: StopReason) {
        for lifecycle in self.inner.lifecycles.values() {
            lifecycle.stop_all(reason).await;
        }
    }

    /// Names of tunnels running on any backend
    pub async fn running_tunnel_names(&self) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        for lifecycle in self.inner.lifecycles.values() {
            match lifecycle.running_tunnel_names().await {
                Ok(found) => names.extend(found),
                Err(e) => debug!("Cannot list {} tunnels: {}", lifecycle.kind(), e),
            }
        }
        names
    }
}

#[async_trait]
impl TunnelControl for TunnelOrchestrator {
    fn tunnels(&self) -> TunnelMap {
        self.inner.tunnels.clone()
    }

    fn capabilities(&self, id: TunnelId) -> BackendCapabilities {
        self.owner(id).capabilities()
    }

    fn events(&self) -> EventBus {
        self.inner.events.clone()
    }

    fn update_tunnel_status(&self, id: TunnelId, update: TunnelUpdate) {
        self.owner(id).update_tunnel_status(id, update)
    }

    fn running_config(&self, id: TunnelId) -> Option<TunnelConfig> {
        self.owner(id).running_config(id)
    }

    async fn statistics(&self, id: TunnelId) -> Option<TunnelStatistics> {
        self.owner(id).statistics(id).await
    }

    async fn bounce_tunnel(&self, config: TunnelConfig, reason: StopReason) -> Result<(), TunnelError> {
        self.owner(config.id).bounce(config, reason).await
    }

    async fn apply_definition(&self, id: TunnelId, definition: &TunnelDefinition) -> Result<(), TunnelError> {
        self.owner(id).apply_definition(id, definition).await
    }

    async fn resolve_dns(&self, config: &TunnelConfig) -> Result<bool, TunnelError> {
        self.owner(config.id).resolve_dns(config).await
    }
}
