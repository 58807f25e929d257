//! wg-quick Backend
//!
//! Drives the stock WireGuard tools through `tokio::process`:
//!
//! | Operation        | Command                                        |
//! |------------------|------------------------------------------------|
//! | up / down        | `wg-quick up|down <dir>/<name>.conf`           |
//! | statistics       | `wg show <iface> dump`                         |
//! | hot apply        | `wg set <iface> peer <key> endpoint <ip:port>` |
//! | running names    | `wg show interfaces`                           |
//! | force stop       | `ip link delete dev <iface>`                   |
//!
//! The userspace flavour sets `WG_QUICK_USERSPACE_IMPLEMENTATION` so
//! wg-quick spawns wireguard-go instead of using the kernel module.
//!
//! A tunnel is registered before `wg-quick up` runs, so a start that is
//! cancelled halfway is still torn down by a later stop.

use crate::backend::{BackendCapabilities, BackendKind, StatusStream, TargetState, TunnelBackend};
use crate::config::{TunnelConfig, TunnelDefinition, TunnelId};
use crate::error::BackendError;
use crate::keys::PublicKey;
use crate::kill_switch::BackendMode;
use crate::state::{PeerStats, TunnelStatistics, TunnelStatus};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use tunkeep_network::HostResolver;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);
const STATUS_BUFFER: usize = 8;

const USERSPACE_ENV: &[(&str, &str)] = &[
    ("WG_QUICK_USERSPACE_IMPLEMENTATION", "wireguard-go"),
    ("WG_I_PREFER_BUGGY_USERSPACE_TO_POLISHED_KMOD", "1"),
];

/// Runs the WireGuard tools and returns their stdout
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[&str], env: &[(&str, &str)]) -> Result<String, BackendError>;
}

/// Runs commands as child processes
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, program: &str, args: &[&str], env: &[(&str, &str)]) -> Result<String, BackendError> {
        let mut cmd = Command::new(program);
        cmd.args(args).envs(env.iter().copied()).kill_on_drop(true);

        debug!("Running {} {}", program, args.join(" "));
        let output = tokio::time::timeout(COMMAND_TIMEOUT, cmd.output())
            .await
            .map_err(|_| BackendError::Command(format!("{program} timed out")))?
            .map_err(|e| BackendError::Command(format!("{program}: {e}")))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(BackendError::Command(format!("{program} failed: {}", stderr.trim())))
        }
    }
}

struct RunningTunnel {
    iface: String,
    conf_path: PathBuf,
    status_tx: mpsc::Sender<Result<TunnelStatus, BackendError>>,
}

/// Backend driving `wg-quick` and `wg`
pub struct WgQuickBackend {
    kind: BackendKind,
    config_dir: PathBuf,
    resolver: Arc<dyn HostResolver>,
    runner: Arc<dyn CommandRunner>,
    running: Mutex<HashMap<TunnelId, RunningTunnel>>,
    mode: RwLock<BackendMode>,
}

impl WgQuickBackend {
    /// Kernel module backend
    pub fn kernel(config_dir: impl Into<PathBuf>, resolver: Arc<dyn HostResolver>) -> Self {
        Self::new(BackendKind::Kernel, config_dir.into(), resolver)
    }

    /// wireguard-go backend
    pub fn userspace(config_dir: impl Into<PathBuf>, resolver: Arc<dyn HostResolver>) -> Self {
        Self::new(BackendKind::Userspace, config_dir.into(), resolver)
    }

    fn new(kind: BackendKind, config_dir: PathBuf, resolver: Arc<dyn HostResolver>) -> Self {
        Self {
            kind,
            config_dir,
            resolver,
            runner: Arc::new(SystemRunner),
            running: Mutex::new(HashMap::new()),
            mode: RwLock::new(BackendMode::Inactive),
        }
    }

    /// Run the tools through `runner` instead of child processes
    pub fn with_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = runner;
        self
    }

    async fn run(&self, program: &str, args: &[&str]) -> Result<String, BackendError> {
        let env: &[(&str, &str)] = match self.kind {
            BackendKind::Userspace => USERSPACE_ENV,
            BackendKind::Kernel => &[],
        };
        self.runner.run(program, args, env).await
    }

    async fn iface(&self, id: TunnelId) -> Result<String, BackendError> {
        self.running
            .lock()
            .await
            .get(&id)
            .map(|t| t.iface.clone())
            .ok_or(BackendError::ServiceNotRunning)
    }

    async fn write_config(&self, config: &TunnelConfig) -> Result<PathBuf, BackendError> {
        tokio::fs::create_dir_all(&self.config_dir)
            .await
            .map_err(|e| BackendError::Command(format!("create {}: {e}", self.config_dir.display())))?;

        let path = self.conf_path(&config.name);
        tokio::fs::write(&path, config.definition.to_wg_quick())
            .await
            .map_err(|e| BackendError::Command(format!("write {}: {e}", path.display())))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            tokio::fs::set_permissions(&path, perms)
                .await
                .map_err(|e| BackendError::Command(format!("chmod {}: {e}", path.display())))?;
        }
        Ok(path)
    }

    fn conf_path(&self, name: &str) -> PathBuf {
        self.config_dir.join(format!("{name}.conf"))
    }

    async fn bring_up(&self, config: &TunnelConfig) -> Result<StatusStream, BackendError> {
        if self.kind == BackendKind::Kernel
            && tokio::fs::metadata("/sys/module/wireguard").await.is_err()
        {
            return Err(BackendError::KernelUnsupported);
        }

        let conf_path = self.write_config(config).await?;
        let (tx, rx) = mpsc::channel(STATUS_BUFFER);
        let _ = tx.try_send(Ok(TunnelStatus::Starting));
        self.running.lock().await.insert(config.id, RunningTunnel {
            iface: config.name.clone(),
            conf_path: conf_path.clone(),
            status_tx: tx.clone(),
        });

        let path = conf_path.to_string_lossy().into_owned();
        if let Err(e) = self.run("wg-quick", &["up", &path]).await {
            self.running.lock().await.remove(&config.id);
            let _ = tokio::fs::remove_file(&conf_path).await;
            return Err(e);
        }
        info!("{} tunnel {} is up", self.kind, config.name);

        let _ = tx.try_send(Ok(TunnelStatus::Up));
        Ok(rx)
    }

    async fn bring_down(&self, config: &TunnelConfig) -> Result<StatusStream, BackendError> {
        let (tx, rx) = mpsc::channel(1);
        let running = self.running.lock().await.remove(&config.id);
        let conf_path = match &running {
            Some(running) => running.conf_path.clone(),
            None => {
                // A config left on disk means an interface may still exist
                let leftover = self.conf_path(&config.name);
                if tokio::fs::metadata(&leftover).await.is_err() {
                    let _ = tx.try_send(Ok(TunnelStatus::Down));
                    return Ok(rx);
                }
                debug!("Cleaning up leftover {}", leftover.display());
                leftover
            }
        };

        let path = conf_path.to_string_lossy().into_owned();
        let result = self.run("wg-quick", &["down", &path]).await;
        if let Some(running) = running {
            let _ = running.status_tx.try_send(Ok(TunnelStatus::Down));
        }
        let _ = tokio::fs::remove_file(&conf_path).await;

        result?;
        info!("{} tunnel {} is down", self.kind, config.name);
        let _ = tx.try_send(Ok(TunnelStatus::Down));
        Ok(rx)
    }

    async fn set_endpoint(&self, iface: &str, peer: &PublicKey, endpoint: &str) -> Result<(), BackendError> {
        let key = peer.to_base64();
        self.run("wg", &["set", iface, "peer", &key, "endpoint", endpoint])
            .await
            .map(|_| ())
            .map_err(|e| BackendError::UpdateFailed(e.to_string()))
    }
}

#[async_trait]
impl TunnelBackend for WgQuickBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn capabilities(&self) -> BackendCapabilities {
        match self.kind {
            BackendKind::Kernel => BackendCapabilities {
                max_concurrent_tunnels: None,
                self_manages_endpoints: true,
                native_roaming: true,
                requires_kernel_name: true,
            },
            BackendKind::Userspace => BackendCapabilities {
                max_concurrent_tunnels: Some(1),
                self_manages_endpoints: false,
                native_roaming: false,
                requires_kernel_name: true,
            },
        }
    }

    async fn set_state(&self, config: &TunnelConfig, target: TargetState) -> Result<StatusStream, BackendError> {
        match target {
            TargetState::Up => self.bring_up(config).await,
            TargetState::Down => self.bring_down(config).await,
        }
    }

    async fn force_stop(&self, id: TunnelId) -> Result<(), BackendError> {
        let Some(running) = self.running.lock().await.remove(&id) else {
            return Ok(());
        };

        warn!("Force stopping {}", running.iface);
        if let Err(e) = self.run("ip", &["link", "delete", "dev", &running.iface]).await {
            debug!("Interface {} already gone: {}", running.iface, e);
        }
        let _ = running.status_tx.try_send(Ok(TunnelStatus::Down));
        let _ = tokio::fs::remove_file(&running.conf_path).await;
        Ok(())
    }

    async fn statistics(&self, id: TunnelId) -> Result<TunnelStatistics, BackendError> {
        let iface = self.iface(id).await?;
        let dump = self.run("wg", &["show", &iface, "dump"]).await?;
        Ok(parse_wg_dump(&dump))
    }

    async fn resolve_dns(&self, config: &TunnelConfig) -> Result<bool, BackendError> {
        let iface = self.iface(config.id).await?;
        let mut applied = false;

        for peer in &config.definition.peers {
            let Some(endpoint) = peer.endpoint.as_ref().filter(|e| e.is_hostname()) else {
                continue;
            };
            let ip = self
                .resolver
                .resolve_host(&endpoint.host, config.is_ipv4_preferred)
                .await
                .map_err(|e| BackendError::DnsFailure(e.to_string()))?;
            let resolved = endpoint.with_ip(ip).to_string();
            self.set_endpoint(&iface, &peer.public_key, &resolved).await?;
            debug!("{}: {} now at {}", config.name, endpoint.host, resolved);
            applied = true;
        }
        Ok(applied)
    }

    async fn apply_definition(&self, id: TunnelId, definition: &TunnelDefinition) -> Result<(), BackendError> {
        let iface = self.iface(id).await?;
        for peer in &definition.peers {
            if let Some(endpoint) = &peer.endpoint {
                self.set_endpoint(&iface, &peer.public_key, &endpoint.to_string()).await?;
            }
        }
        Ok(())
    }

    async fn running_tunnel_names(&self) -> Result<BTreeSet<String>, BackendError> {
        let out = self.run("wg", &["show", "interfaces"]).await?;
        Ok(out.split_whitespace().map(str::to_string).collect())
    }

    /// No firewall rules are installed, so a kill switch is refused and
    /// the mode stays what it was
    async fn set_mode(&self, mode: BackendMode) -> Result<(), BackendError> {
        if mode.is_kill_switch() {
            warn!("{} backend does not install firewall rules, lockdown is not enforced", self.kind);
            return Err(BackendError::LockdownUnsupported(self.kind));
        }
        *self.mode.write().unwrap_or_else(PoisonError::into_inner) = mode;
        Ok(())
    }

    fn mode(&self) -> BackendMode {
        self.mode.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

/// Parse `wg show <iface> dump`
///
/// The first line describes the interface; each following line is one
/// peer: key, psk, endpoint, allowed-ips, handshake (epoch seconds), rx,
/// tx, keepalive.
pub fn parse_wg_dump(dump: &str) -> TunnelStatistics {
    let mut stats = TunnelStatistics::default();

    for line in dump.lines().skip(1) {
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < 7 {
            continue;
        }
        let Ok(key) = PublicKey::from_base64(fields[0]) else {
            continue;
        };

        let handshake_secs = fields[4].parse::<u64>().unwrap_or(0);
        stats.peers.insert(key, PeerStats {
            rx_bytes: fields[5].parse().unwrap_or(0),
            tx_bytes: fields[6].parse().unwrap_or(0),
            latest_handshake_millis: (handshake_secs > 0).then(|| handshake_secs * 1000),
            resolved_endpoint: fields[2].parse().ok(),
        });
    }
    stats
}
