//! Tunnel Lifecycle
//!
//! Per-tunnel state machine over one backend. Each started tunnel gets a
//! supervising task that follows the backend's status stream and feeds
//! every status into the shared [`TunnelMap`].
//!
//! ```text
//!   start_tunnel ──► Starting ──► Up ──► Stopping(reason) ──► Down
//!                       │                                      ▲
//!                       └──────────── failure ─────────────────┘
//! ```
//!
//! Start, stop and force-stop are serialized by one coarse lock per
//! lifecycle. Map writes go through [`TunnelLifecycle::update_tunnel_status`]
//! or the supervisor, both of which merge under the map's own lock.
//!
//! Every supervisor holds a cleanup guard: however the task ends (stream
//! closed, failure, cancellation, abort) the guard removes its own map
//! entry and registry slot. Sessions keep a finishing task from removing
//! the entry of a newer start of the same id.

use crate::backend::{BackendCapabilities, BackendKind, TargetState, TunnelBackend};
use crate::config::{TunnelConfig, TunnelDefinition, TunnelId};
use crate::control::TunnelControl;
use crate::error::{BackendError, TunnelError};
use crate::events::{EngineMessage, EventBus};
use crate::kill_switch::BackendMode;
use crate::state::{
    now_millis, StopReason, TunnelMap, TunnelState, TunnelStatistics, TunnelStatus, TunnelUpdate,
};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Graceful stop budget before escalating to force-stop
pub const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Budget for the backend's own force-stop
pub const FORCE_STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// Pause between stop and start when bouncing
pub const BOUNCE_DELAY: Duration = Duration::from_millis(300);

struct TaskEntry {
    session: u64,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    config: TunnelConfig,
}

struct Inner {
    backend: Arc<dyn TunnelBackend>,
    tunnels: TunnelMap,
    tasks: Mutex<HashMap<TunnelId, TaskEntry>>,
    /// Coarse start/stop lock
    lifecycle_lock: tokio::sync::Mutex<()>,
    bounce_lock: tokio::sync::Mutex<()>,
    events: EventBus,
}

impl Inner {
    fn lock_tasks(&self) -> MutexGuard<'_, HashMap<TunnelId, TaskEntry>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Merge `update` into the map
    ///
    /// `session` is set for updates coming from a supervisor; those are
    /// dropped when the entry belongs to a different start.
    fn apply_update(&self, id: TunnelId, session: Option<u64>, update: TunnelUpdate) -> bool {
        let task_session = self.lock_tasks().get(&id).map(|t| t.session);

        self.tunnels.modify(|map| {
            let Some(current) = map.get(&id) else {
                // Absent ids only come back as Starting, and only while
                // their supervisor is still registered
                return match (update.status, task_session) {
                    (Some(TunnelStatus::Starting), Some(live)) if session.is_none_or(|s| s == live) => {
                        let mut state = TunnelState::starting(live);
                        merge_payload(&mut state, update);
                        map.insert(id, state);
                        true
                    }
                    _ => false,
                };
            };

            if session.is_some_and(|s| s != current.session) {
                return false;
            }

            let mut next = current.clone();
            if let Some(status) = update.status {
                if status != current.status {
                    if !current.status.can_transition_to(status) {
                        debug!("Ignoring {:?} -> {:?} for tunnel {}", current.status, status, id);
                    } else if status.is_down() {
                        map.remove(&id);
                        return true;
                    } else {
                        next.status = status;
                        if status.is_up() {
                            next.up_since_millis = Some(now_millis());
                        }
                    }
                }
            }
            merge_payload(&mut next, update);

            if next == *current {
                return false;
            }
            map.insert(id, next);
            true
        })
    }
}

fn merge_payload(state: &mut TunnelState, update: TunnelUpdate) {
    if let Some(statistics) = update.statistics {
        state.statistics = Some(statistics);
    }
    if let Some(ping_states) = update.ping_states {
        state.ping_states = Some(ping_states);
    }
    if let Some(log_health) = update.log_health {
        state.log_health = Some(log_health);
    }
}

/// Removes the supervisor's traces when its task ends, however it ends
struct Cleanup {
    inner: Arc<Inner>,
    id: TunnelId,
    session: u64,
}

impl Drop for Cleanup {
    fn drop(&mut self) {
        let (id, session) = (self.id, self.session);
        {
            let mut tasks = self.inner.lock_tasks();
            if tasks.get(&id).is_some_and(|t| t.session == session) {
                tasks.remove(&id);
            }
        }
        let removed = self.inner.tunnels.modify(|map| {
            if map.get(&id).is_some_and(|s| s.session == session) {
                map.remove(&id);
                true
            } else {
                false
            }
        });
        if removed {
            debug!("Tunnel {} removed on task exit", id);
        }
    }
}

/// One-shot startup result, reported at most once
struct Startup(Option<oneshot::Sender<Result<(), TunnelError>>>);

impl Startup {
    fn report(&mut self, result: Result<(), TunnelError>) {
        if let Some(tx) = self.0.take() {
            let _ = tx.send(result);
        }
    }
}

async fn supervise(
    inner: Arc<Inner>,
    config: TunnelConfig,
    session: u64,
    cancel: CancellationToken,
    result_tx: oneshot::Sender<Result<(), TunnelError>>,
) {
    let id = config.id;
    let _cleanup = Cleanup {
        inner: Arc::clone(&inner),
        id,
        session,
    };
    let mut startup = Startup(Some(result_tx));

    let opened = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            startup.report(Err(TunnelError::Cancelled));
            teardown(&inner, &config, session).await;
            return;
        }
        opened = inner.backend.set_state(&config, TargetState::Up) => opened,
    };

    let mut stream = match opened {
        Ok(stream) => stream,
        Err(e) => {
            error!("Failed to start tunnel {}: {}", config.name, e);
            let err = TunnelError::from(e);
            inner.events.error(Some(&config.name), err.clone());
            startup.report(Err(err));
            return;
        }
    };

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                startup.report(Err(TunnelError::Cancelled));
                teardown(&inner, &config, session).await;
                return;
            }
            next = stream.recv() => match next {
                Some(Ok(status)) => {
                    inner.apply_update(id, Some(session), TunnelUpdate::status(status));
                    match status {
                        TunnelStatus::Up => {
                            info!("Tunnel {} is up", config.name);
                            startup.report(Ok(()));
                        }
                        TunnelStatus::Down => {
                            info!("Tunnel {} went down", config.name);
                            startup.report(Err(BackendError::Unknown("tunnel went down during startup".into()).into()));
                            return;
                        }
                        TunnelStatus::Starting | TunnelStatus::Stopping(_) => {}
                    }
                }
                Some(Err(e)) => {
                    error!("Tunnel {} failed: {}", config.name, e);
                    let err = TunnelError::from(e);
                    inner.events.error(Some(&config.name), err.clone());
                    startup.report(Err(err));
                    if let Err(e) = force_stop_backend(&inner, id).await {
                        warn!("Force stop of {} after failure: {}", config.name, e);
                    }
                    return;
                }
                None => {
                    debug!("Status stream for {} closed", config.name);
                    startup.report(Err(TunnelError::Cancelled));
                    return;
                }
            }
        }
    }
}

/// Bring the backend down and follow its stream to Down
async fn teardown(inner: &Inner, config: &TunnelConfig, session: u64) {
    match inner.backend.set_state(config, TargetState::Down).await {
        Ok(mut stream) => {
            while let Some(next) = stream.recv().await {
                match next {
                    Ok(status) => {
                        inner.apply_update(config.id, Some(session), TunnelUpdate::status(status));
                        if status.is_down() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("Error while stopping {}: {}", config.name, e);
                        inner.events.error(Some(&config.name), e.into());
                        break;
                    }
                }
            }
        }
        Err(e) => {
            warn!("Failed to stop tunnel {}: {}", config.name, e);
            inner.events.error(Some(&config.name), e.into());
        }
    }
    inner.apply_update(config.id, Some(session), TunnelUpdate::status(TunnelStatus::Down));
}

async fn force_stop_backend(inner: &Inner, id: TunnelId) -> Result<(), TunnelError> {
    match timeout(FORCE_STOP_TIMEOUT, inner.backend.force_stop(id)).await {
        Ok(result) => result.map_err(TunnelError::from),
        Err(_) => Err(TunnelError::Timeout(FORCE_STOP_TIMEOUT)),
    }
}

/// Tunnel state machine over one backend
#[derive(Clone)]
pub struct TunnelLifecycle {
    inner: Arc<Inner>,
}

impl TunnelLifecycle {
    /// Lifecycle writing into `tunnels`, which may be shared with other lifecycles
    pub fn new(backend: Arc<dyn TunnelBackend>, tunnels: TunnelMap) -> Self {
        Self {
            inner: Arc::new(Inner {
                backend,
                tunnels,
                tasks: Mutex::new(HashMap::new()),
                lifecycle_lock: tokio::sync::Mutex::new(()),
                bounce_lock: tokio::sync::Mutex::new(()),
                events: EventBus::new(),
            }),
        }
    }

    pub fn kind(&self) -> BackendKind {
        self.inner.backend.kind()
    }

    pub fn capabilities(&self) -> BackendCapabilities {
        self.inner.backend.capabilities()
    }

    pub fn tunnels(&self) -> TunnelMap {
        self.inner.tunnels.clone()
    }

    pub fn events(&self) -> EventBus {
        self.inner.events.clone()
    }

    /// Config the tunnel was started with, while its supervisor runs
    pub fn running_config(&self, id: TunnelId) -> Option<TunnelConfig> {
        self.inner.lock_tasks().get(&id).map(|t| t.config.clone())
    }

    /// Ids supervised by this lifecycle
    pub fn supervised(&self) -> Vec<TunnelId> {
        let mut ids: Vec<_> = self.inner.lock_tasks().keys().copied().collect();
        ids.sort();
        ids
    }

    fn check_config(&self, config: &TunnelConfig) -> Result<(), TunnelError> {
        config.validate()?;
        if self.capabilities().requires_kernel_name {
            config.validate_kernel_name()?;
        }
        Ok(())
    }

    /// Start a tunnel and wait until the backend reports Up
    pub async fn start_tunnel(&self, config: TunnelConfig) -> Result<(), TunnelError> {
        if let Err(e) = self.check_config(&config) {
            warn!("Refusing to start {}: {}", config.name, e);
            self.inner.events.error(Some(&config.name), e.clone());
            return Err(e);
        }

        let id = config.id;
        let (result_tx, result_rx) = oneshot::channel();
        {
            let _guard = self.inner.lifecycle_lock.lock().await;
            if self.inner.tunnels.contains(id) {
                return Err(TunnelError::AlreadyRunning(id));
            }

            info!("Starting tunnel {} on {} backend", config.name, self.kind());
            let session = self.inner.tunnels.next_session();
            self.inner.tunnels.modify(|map| {
                map.insert(id, TunnelState::starting(session));
                true
            });

            let cancel = CancellationToken::new();
            let mut tasks = self.inner.lock_tasks();
            let handle = tokio::spawn(supervise(
                Arc::clone(&self.inner),
                config.clone(),
                session,
                cancel.clone(),
                result_tx,
            ));
            tasks.insert(
                id,
                TaskEntry {
                    session,
                    cancel,
                    handle,
                    config,
                },
            );
        }

        result_rx.await.unwrap_or(Err(TunnelError::Cancelled))
    }

    /// Stop a tunnel, escalating to force-stop after [`STOP_TIMEOUT`]
    ///
    /// Stopping a tunnel that is not running succeeds.
    pub async fn stop_tunnel(&self, id: TunnelId, reason: StopReason) -> Result<(), TunnelError> {
        let _guard = self.inner.lifecycle_lock.lock().await;
        if !self.inner.tunnels.contains(id) {
            debug!("Tunnel {} already stopped", id);
            return Ok(());
        }

        let cancel = self.inner.lock_tasks().get(&id).map(|t| t.cancel.clone());
        let Some(cancel) = cancel else {
            warn!("Tunnel {} has no supervisor, forcing stop", id);
            self.force_stop_locked(id).await;
            return Ok(());
        };

        info!("Stopping tunnel {} ({:?})", id, reason);
        self.inner.apply_update(id, None, TunnelUpdate::status(TunnelStatus::Stopping(reason)));
        let mut rx = self.inner.tunnels.subscribe();
        cancel.cancel();

        let stopped = timeout(STOP_TIMEOUT, rx.wait_for(|map| !map.contains_key(&id)))
            .await
            .is_ok();
        if !stopped {
            warn!("Tunnel {} did not stop within {:?}, forcing", id, STOP_TIMEOUT);
            self.force_stop_locked(id).await;
        }
        Ok(())
    }

    /// Tear a tunnel down without the graceful path
    pub async fn force_stop_tunnel(&self, id: TunnelId) {
        let _guard = self.inner.lifecycle_lock.lock().await;
        self.force_stop_locked(id).await;
    }

    async fn force_stop_locked(&self, id: TunnelId) {
        if let Some(task) = self.inner.lock_tasks().remove(&id) {
            task.cancel.cancel();
            task.handle.abort();
        }
        if let Err(e) = force_stop_backend(&self.inner, id).await {
            warn!("Backend force stop of {} failed: {}", id, e);
        }
        if self.inner.tunnels.modify(|map| map.remove(&id).is_some()) {
            info!("Tunnel {} force stopped", id);
        }
    }

    /// Stop every tunnel this lifecycle supervises
    pub async fn stop_all(&self, reason: StopReason) {
        for id in self.supervised() {
            if let Err(e) = self.stop_tunnel(id, reason).await {
                warn!("Failed to stop tunnel {}: {}", id, e);
            }
        }
    }

    /// Merge a partial update from an observer
    pub fn update_tunnel_status(&self, id: TunnelId, update: TunnelUpdate) {
        self.inner.apply_update(id, None, update);
    }

    /// Stop, pause, start; serialized per lifecycle
    pub async fn bounce(&self, config: TunnelConfig, reason: StopReason) -> Result<(), TunnelError> {
        let _guard = self.inner.bounce_lock.lock().await;
        info!("Bouncing tunnel {} ({:?})", config.name, reason);
        self.stop_tunnel(config.id, reason).await?;
        sleep(BOUNCE_DELAY).await;

        let name = config.name.clone();
        self.start_tunnel(config).await?;
        self.inner.events.message(Some(&name), EngineMessage::BounceSuccess);
        Ok(())
    }

    pub async fn statistics(&self, id: TunnelId) -> Option<TunnelStatistics> {
        match self.inner.backend.statistics(id).await {
            Ok(stats) => Some(stats),
            Err(e) => {
                debug!("No statistics for {}: {}", id, e);
                None
            }
        }
    }

    pub async fn apply_definition(&self, id: TunnelId, definition: &TunnelDefinition) -> Result<(), TunnelError> {
        if !self.inner.tunnels.contains(id) {
            return Err(TunnelError::NotRunning(id));
        }
        self.inner.backend.apply_definition(id, definition).await?;
        Ok(())
    }

    pub async fn resolve_dns(&self, config: &TunnelConfig) -> Result<bool, TunnelError> {
        Ok(self.inner.backend.resolve_dns(config).await?)
    }

    pub async fn running_tunnel_names(&self) -> Result<BTreeSet<String>, TunnelError> {
        Ok(self.inner.backend.running_tunnel_names().await?)
    }

    pub async fn set_backend_mode(&self, mode: BackendMode) -> Result<(), TunnelError> {
        info!("Setting {} backend mode to {:?}", self.kind(), mode);
        Ok(self.inner.backend.set_mode(mode).await?)
    }

    pub fn backend_mode(&self) -> BackendMode {
        self.inner.backend.mode()
    }
}

#[async_trait]
impl TunnelControl for TunnelLifecycle {
    fn tunnels(&self) -> TunnelMap {
        TunnelLifecycle::tunnels(self)
    }

    fn capabilities(&self, _id: TunnelId) -> BackendCapabilities {
        TunnelLifecycle::capabilities(self)
    }

    fn events(&self) -> EventBus {
        TunnelLifecycle::events(self)
    }

    fn update_tunnel_status(&self, id: TunnelId, update: TunnelUpdate) {
        TunnelLifecycle::update_tunnel_status(self, id, update)
    }

    fn running_config(&self, id: TunnelId) -> Option<TunnelConfig> {
        TunnelLifecycle::running_config(self, id)
    }

    async fn statistics(&self, id: TunnelId) -> Option<TunnelStatistics> {
        TunnelLifecycle::statistics(self, id).await
    }

    async fn bounce_tunnel(&self, config: TunnelConfig, reason: StopReason) -> Result<(), TunnelError> {
        self.bounce(config, reason).await
    }

    async fn apply_definition(&self, id: TunnelId, definition: &TunnelDefinition) -> Result<(), TunnelError> {
        TunnelLifecycle::apply_definition(self, id, definition).await
    }

    async fn resolve_dns(&self, config: &TunnelConfig) -> Result<bool, TunnelError> {
        TunnelLifecycle::resolve_dns(self, config).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::sample_config;
    use crate::config::ConfigError;
    use crate::state::{LogHealthState, PeerStats};
    use crate::testing::{Call, MockBackend, UpBehavior};
    use tokio::time::Instant;

    fn setup() -> (Arc<MockBackend>, TunnelLifecycle) {
        let backend = Arc::new(MockBackend::new(BackendKind::Userspace));
        let lifecycle = TunnelLifecycle::new(backend.clone(), TunnelMap::new());
        (backend, lifecycle)
    }

    #[tokio::test]
    async fn test_start_reports_starting_then_up() {
        let (_, lifecycle) = setup();
        let mut rx = lifecycle.tunnels().subscribe();
        let recorder = tokio::spawn(async move {
            let mut seen = Vec::new();
            while rx.changed().await.is_ok() {
                let status = rx.borrow_and_update().get(&TunnelId(1)).map(|s| s.status);
                if let Some(status) = status {
                    if seen.last() != Some(&status) {
                        seen.push(status);
                    }
                    if status.is_up() {
                        break;
                    }
                }
            }
            seen
        });

        lifecycle.start_tunnel(sample_config(1, "office")).await.unwrap();

        let seen = recorder.await.unwrap();
        assert_eq!(seen, vec![TunnelStatus::Starting, TunnelStatus::Up]);
        let state = lifecycle.tunnels().get(TunnelId(1)).unwrap();
        assert!(state.status.is_up());
        assert!(state.up_since_millis.is_some());
    }

    #[tokio::test]
    async fn test_concurrent_start_rejected() {
        let (backend, lifecycle) = setup();
        let config = sample_config(1, "office");

        let (a, b) = tokio::join!(
            lifecycle.start_tunnel(config.clone()),
            lifecycle.start_tunnel(config.clone())
        );

        let results = [a, b];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results.contains(&Err(TunnelError::AlreadyRunning(TunnelId(1)))));
        assert_eq!(lifecycle.tunnels().ids(), vec![TunnelId(1)]);
        assert_eq!(backend.count(|c| matches!(c, Call::Up(_))), 1);
    }

    #[tokio::test]
    async fn test_backend_failure_leaves_no_entry() {
        let (backend, lifecycle) = setup();
        backend.set_up_behavior(UpBehavior::Fail(BackendError::NotAuthorized));
        let mut errors = lifecycle.events().subscribe_errors();

        let result = lifecycle.start_tunnel(sample_config(1, "office")).await;
        assert_eq!(result, Err(TunnelError::Backend(BackendError::NotAuthorized)));

        tokio::task::yield_now().await;
        assert!(lifecycle.tunnels().is_empty());
        assert!(lifecycle.supervised().is_empty());

        let event = errors.recv().await.unwrap();
        assert_eq!(event.tunnel_name.as_deref(), Some("office"));
    }

    #[tokio::test]
    async fn test_config_error_aborts_before_backend() {
        let (backend, lifecycle) = setup();
        let mut config = sample_config(1, "office");
        config.name = "  ".into();

        let result = lifecycle.start_tunnel(config).await;
        assert_eq!(result, Err(TunnelError::Config(ConfigError::EmptyName)));
        assert!(backend.calls().is_empty());
        assert!(lifecycle.tunnels().is_empty());
    }

    #[tokio::test]
    async fn test_kernel_name_checked_when_required() {
        let caps = BackendCapabilities {
            max_concurrent_tunnels: None,
            self_manages_endpoints: true,
            native_roaming: true,
            requires_kernel_name: true,
        };
        let backend = Arc::new(MockBackend::with_capabilities(BackendKind::Kernel, caps));
        let lifecycle = TunnelLifecycle::new(backend.clone(), TunnelMap::new());

        let result = lifecycle.start_tunnel(sample_config(1, "much-too-long-interface")).await;
        assert!(matches!(result, Err(TunnelError::Config(ConfigError::InvalidKernelName(_)))));
        assert!(backend.calls().is_empty());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let (backend, lifecycle) = setup();
        lifecycle.stop_tunnel(TunnelId(9), StopReason::User).await.unwrap();

        lifecycle.start_tunnel(sample_config(1, "office")).await.unwrap();
        lifecycle.stop_tunnel(TunnelId(1), StopReason::User).await.unwrap();
        lifecycle.stop_tunnel(TunnelId(1), StopReason::User).await.unwrap();

        assert!(lifecycle.tunnels().is_empty());
        assert!(lifecycle.supervised().is_empty());
        assert_eq!(backend.count(|c| matches!(c, Call::Down(_))), 1);
        assert_eq!(backend.count(|c| matches!(c, Call::ForceStop(_))), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_escalates_when_backend_hangs() {
        let (backend, lifecycle) = setup();
        lifecycle.start_tunnel(sample_config(1, "office")).await.unwrap();
        backend.hang_on_down(true);

        let started = Instant::now();
        lifecycle.stop_tunnel(TunnelId(1), StopReason::User).await.unwrap();

        assert!(started.elapsed() >= STOP_TIMEOUT);
        assert!(!lifecycle.tunnels().contains(TunnelId(1)));
        assert!(lifecycle.supervised().is_empty());
        assert_eq!(backend.count(|c| *c == Call::ForceStop(TunnelId(1))), 1);
    }

    #[tokio::test]
    async fn test_stop_while_starting_cancels_start() {
        let (backend, lifecycle) = setup();
        backend.set_up_behavior(UpBehavior::Hang);

        let starter = {
            let lifecycle = lifecycle.clone();
            tokio::spawn(async move { lifecycle.start_tunnel(sample_config(1, "office")).await })
        };
        while !lifecycle.tunnels().contains(TunnelId(1)) {
            tokio::task::yield_now().await;
        }

        lifecycle.stop_tunnel(TunnelId(1), StopReason::User).await.unwrap();
        assert_eq!(starter.await.unwrap(), Err(TunnelError::Cancelled));
        assert!(lifecycle.tunnels().is_empty());
    }

    #[tokio::test]
    async fn test_stream_failure_removes_tunnel() {
        let (backend, lifecycle) = setup();
        lifecycle.start_tunnel(sample_config(1, "office")).await.unwrap();
        let mut errors = lifecycle.events().subscribe_errors();

        let mut rx = lifecycle.tunnels().subscribe();
        backend
            .push_status(TunnelId(1), Err(BackendError::Command("wireguard-go exited".into())))
            .await;
        rx.wait_for(|map| map.is_empty()).await.unwrap();

        assert!(errors.recv().await.is_ok());
        assert_eq!(backend.count(|c| *c == Call::ForceStop(TunnelId(1))), 1);
    }

    #[tokio::test]
    async fn test_closed_stream_removes_tunnel() {
        let (backend, lifecycle) = setup();
        lifecycle.start_tunnel(sample_config(1, "office")).await.unwrap();

        let mut rx = lifecycle.tunnels().subscribe();
        backend.close_stream(TunnelId(1));
        rx.wait_for(|map| map.is_empty()).await.unwrap();
        tokio::task::yield_now().await;
        assert!(lifecycle.supervised().is_empty());
    }

    #[tokio::test]
    async fn test_update_ignores_absent_tunnels() {
        let (_, lifecycle) = setup();
        lifecycle.update_tunnel_status(TunnelId(1), TunnelUpdate::status(TunnelStatus::Up));
        lifecycle.update_tunnel_status(TunnelId(1), TunnelUpdate::status(TunnelStatus::Starting));
        assert!(lifecycle.tunnels().is_empty());
    }

    #[tokio::test]
    async fn test_update_merges_and_rejects_backwards() {
        let (_, lifecycle) = setup();
        lifecycle.start_tunnel(sample_config(1, "office")).await.unwrap();
        let mut rx = lifecycle.tunnels().subscribe();
        rx.borrow_and_update();

        // Up -> Starting is illegal and carries nothing else: dropped
        lifecycle.update_tunnel_status(TunnelId(1), TunnelUpdate::status(TunnelStatus::Starting));
        assert!(!rx.has_changed().unwrap());

        let key = sample_config(1, "office").definition.peers[0].public_key;
        let stats = TunnelStatistics {
            peers: HashMap::from([(key, PeerStats { rx_bytes: 10, ..PeerStats::default() })]),
        };
        lifecycle.update_tunnel_status(TunnelId(1), TunnelUpdate::statistics(stats.clone()));
        let log = LogHealthState { is_healthy: true, timestamp_millis: 5 };
        lifecycle.update_tunnel_status(TunnelId(1), TunnelUpdate::log_health(log));

        let state = lifecycle.tunnels().get(TunnelId(1)).unwrap();
        assert!(state.status.is_up());
        assert_eq!(state.statistics, Some(stats.clone()));
        assert_eq!(state.log_health, Some(log));

        // Identical update is dropped without notifying
        rx.borrow_and_update();
        lifecycle.update_tunnel_status(TunnelId(1), TunnelUpdate::statistics(stats));
        assert!(!rx.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_bounce_restarts_and_notifies() {
        let (backend, lifecycle) = setup();
        let config = sample_config(1, "office");
        lifecycle.start_tunnel(config.clone()).await.unwrap();
        let mut messages = lifecycle.events().subscribe_messages();

        lifecycle.bounce(config, StopReason::ConfigChanged).await.unwrap();

        assert!(lifecycle.tunnels().get(TunnelId(1)).unwrap().status.is_up());
        assert_eq!(backend.count(|c| matches!(c, Call::Up(_))), 2);
        assert_eq!(messages.recv().await.unwrap().message, EngineMessage::BounceSuccess);
    }

    #[tokio::test]
    async fn test_map_presence_tracks_supervisors() {
        let (_, lifecycle) = setup();
        for id in 1..=3 {
            lifecycle.start_tunnel(sample_config(id, &format!("t{}", id))).await.unwrap();
        }
        assert_eq!(lifecycle.tunnels().ids(), lifecycle.supervised());

        lifecycle.stop_tunnel(TunnelId(2), StopReason::User).await.unwrap();
        assert_eq!(lifecycle.tunnels().ids(), lifecycle.supervised());
        assert_eq!(lifecycle.supervised(), vec![TunnelId(1), TunnelId(3)]);

        lifecycle.stop_all(StopReason::User).await;
        assert!(lifecycle.tunnels().is_empty());
        assert!(lifecycle.supervised().is_empty());
    }
}
