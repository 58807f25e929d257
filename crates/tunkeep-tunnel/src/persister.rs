//! Active-state persistence and host service coordination
//!
//! [`ActiveStatePersister`] mirrors the set of active tunnel ids into the
//! store so a restart can restore them. [`ServiceCoordinator`] keeps the
//! hosting service (a foreground notification, a status file) running
//! exactly while at least one tunnel is active.

use crate::config::TunnelId;
use crate::state::TunnelMap;
use crate::store::ConfigStore;
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const SERVICE_START_TIMEOUT: Duration = Duration::from_secs(5);
pub const SERVICE_STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// Writes the active id set to the store whenever it changes
pub struct ActiveStatePersister {
    tunnels: TunnelMap,
    store: Arc<dyn ConfigStore>,
}

impl ActiveStatePersister {
    pub fn new(tunnels: TunnelMap, store: Arc<dyn ConfigStore>) -> Self {
        Self { tunnels, store }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let mut rx = self.tunnels.subscribe();
        let mut last: Option<BTreeSet<TunnelId>> = None;

        loop {
            let active: BTreeSet<TunnelId> = rx.borrow_and_update().keys().copied().collect();
            if last.as_ref() != Some(&active) {
                match self.store.set_active(&active).await {
                    Ok(()) => {
                        debug!("Persisted {} active tunnel(s)", active.len());
                        last = Some(active);
                    }
                    Err(e) => error!("Failed to persist active tunnels: {}", e),
                }
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
        debug!("Active state persister stopped");
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    #[error("Service start failed: {0}")]
    StartFailed(String),

    #[error("Service stop failed: {0}")]
    StopFailed(String),
}

/// The process-level service that hosts running tunnels
#[async_trait]
pub trait ServiceHost: Send + Sync {
    async fn start(&self) -> Result<(), ServiceError>;

    async fn stop(&self) -> Result<(), ServiceError>;

    fn is_running(&self) -> bool;

    /// Drop any local handle after a failed start or stop
    fn force_cleanup(&self);
}

/// Daemon service host: a status file present while tunnels run
pub struct PidFileHost {
    path: PathBuf,
    running: AtomicBool,
}

impl PidFileHost {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            path: state_dir.into().join("tunkeep.pid"),
            running: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl ServiceHost for PidFileHost {
    async fn start(&self) -> Result<(), ServiceError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ServiceError::StartFailed(format!("create {}: {e}", parent.display())))?;
        }
        tokio::fs::write(&self.path, format!("{}\n", std::process::id()))
            .await
            .map_err(|e| ServiceError::StartFailed(format!("write {}: {e}", self.path.display())))?;
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<(), ServiceError> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(ServiceError::StopFailed(format!("remove {}: {e}", self.path.display()))),
        }
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn force_cleanup(&self) {
        let _ = std::fs::remove_file(&self.path);
        self.running.store(false, Ordering::SeqCst);
    }
}

/// Starts the host when the first tunnel becomes active and stops it
/// after the last one is gone
pub struct ServiceCoordinator {
    tunnels: TunnelMap,
    host: Arc<dyn ServiceHost>,
}

impl ServiceCoordinator {
    pub fn new(tunnels: TunnelMap, host: Arc<dyn ServiceHost>) -> Self {
        Self { tunnels, host }
    }

    async fn sync(&self, any_active: bool) {
        if any_active && !self.host.is_running() {
            info!("Starting tunnel service");
            match timeout(SERVICE_START_TIMEOUT, self.host.start()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!("Tunnel service failed to start: {}", e);
                    self.host.force_cleanup();
                }
                Err(_) => {
                    warn!("Tunnel service did not start within {:?}", SERVICE_START_TIMEOUT);
                    self.host.force_cleanup();
                }
            }
        } else if !any_active && self.host.is_running() {
            info!("Stopping tunnel service");
            match timeout(SERVICE_STOP_TIMEOUT, self.host.stop()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!("Tunnel service failed to stop: {}", e);
                    self.host.force_cleanup();
                }
                Err(_) => {
                    warn!("Tunnel service did not stop within {:?}", SERVICE_STOP_TIMEOUT);
                    self.host.force_cleanup();
                }
            }
        }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let mut rx = self.tunnels.subscribe();
        loop {
            let any_active = !rx.borrow_and_update().is_empty();
            self.sync(any_active).await;

            tokio::select! {
                _ = shutdown.cancelled() => break,
                changed = rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        if self.host.is_running() {
            self.sync(false).await;
        }
        debug!("Service coordinator stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendKind;
    use crate::config::tests::sample_config;
    use crate::lifecycle::TunnelLifecycle;
    use crate::state::StopReason;
    use crate::store::{EngineConfig, Settings, TunnelStore};
    use crate::testing::MockBackend;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_active_set_follows_map() {
        let tunnels = TunnelMap::new();
        let lifecycle = TunnelLifecycle::new(Arc::new(MockBackend::new(BackendKind::Userspace)), tunnels.clone());
        let store = TunnelStore::new(EngineConfig {
            settings: Settings::default(),
            tunnels: vec![sample_config(1, "office"), sample_config(2, "home")],
        })
        .into_shared();
        let shutdown = CancellationToken::new();
        tokio::spawn(ActiveStatePersister::new(tunnels, store.clone()).run(shutdown.clone()));

        let mut configs = store.subscribe_tunnels();
        lifecycle.start_tunnel(sample_config(2, "home")).await.unwrap();
        configs
            .wait_for(|all| all.iter().any(|c| c.id == TunnelId(2) && c.is_active))
            .await
            .unwrap();
        assert!(!store.tunnel(TunnelId(1)).unwrap().is_active);

        lifecycle.stop_tunnel(TunnelId(2), StopReason::User).await.unwrap();
        configs.wait_for(|all| all.iter().all(|c| !c.is_active)).await.unwrap();
        shutdown.cancel();
    }

    #[derive(Default)]
    struct ScriptedHost {
        running: AtomicBool,
        hang_start: AtomicBool,
        starts: AtomicUsize,
        stops: AtomicUsize,
        cleanups: AtomicUsize,
    }

    #[async_trait]
    impl ServiceHost for ScriptedHost {
        async fn start(&self) -> Result<(), ServiceError> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            if self.hang_start.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            self.running.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn stop(&self) -> Result<(), ServiceError> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            self.running.store(false, Ordering::SeqCst);
            Ok(())
        }

        fn is_running(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }

        fn force_cleanup(&self) {
            self.cleanups.fetch_add(1, Ordering::SeqCst);
            self.running.store(false, Ordering::SeqCst);
        }
    }

    fn coordinated(host: Arc<ScriptedHost>) -> (TunnelLifecycle, CancellationToken) {
        let tunnels = TunnelMap::new();
        let lifecycle = TunnelLifecycle::new(Arc::new(MockBackend::new(BackendKind::Userspace)), tunnels.clone());
        let shutdown = CancellationToken::new();
        tokio::spawn(ServiceCoordinator::new(tunnels, host).run(shutdown.clone()));
        (lifecycle, shutdown)
    }

    #[tokio::test(start_paused = true)]
    async fn test_host_runs_while_tunnels_are_active() {
        let host = Arc::new(ScriptedHost::default());
        let (lifecycle, shutdown) = coordinated(host.clone());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(host.starts.load(Ordering::SeqCst), 0);

        lifecycle.start_tunnel(sample_config(1, "office")).await.unwrap();
        lifecycle.start_tunnel(sample_config(2, "home")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(host.is_running());
        assert_eq!(host.starts.load(Ordering::SeqCst), 1);

        lifecycle.stop_tunnel(TunnelId(1), StopReason::User).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(host.is_running());

        lifecycle.stop_tunnel(TunnelId(2), StopReason::User).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!host.is_running());
        assert_eq!(host.stops.load(Ordering::SeqCst), 1);
        shutdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_timeout_forces_cleanup() {
        let host = Arc::new(ScriptedHost::default());
        host.hang_start.store(true, Ordering::SeqCst);
        let (lifecycle, shutdown) = coordinated(host.clone());

        lifecycle.start_tunnel(sample_config(1, "office")).await.unwrap();
        tokio::time::sleep(SERVICE_START_TIMEOUT + Duration::from_millis(10)).await;
        assert_eq!(host.cleanups.load(Ordering::SeqCst), 1);
        assert!(!host.is_running());
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_pid_file_host() {
        let dir = std::env::temp_dir().join(format!("tunkeep-pid-{}", std::process::id()));
        let host = PidFileHost::new(dir.clone());
        host.start().await.unwrap();
        assert!(host.is_running());
        let content = tokio::fs::read_to_string(dir.join("tunkeep.pid")).await.unwrap();
        assert_eq!(content.trim(), std::process::id().to_string());

        host.stop().await.unwrap();
        assert!(!host.is_running());
        assert!(!dir.join("tunkeep.pid").exists());
        host.stop().await.unwrap();
        let _ = std::fs::remove_dir_all(&dir);
    }
}
