//! tunkeep: WireGuard tunnel keeper
//!
//! Loads the engine config, wires the orchestrator to its observers and
//! keeps tunnels up until interrupted.

mod journal;

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use tunkeep_network::{DnsResolver, HostResolver, NetworkMonitor, SysfsNetworkSource, SystemPinger};
use tunkeep_tunnel::{
    ActiveStatePersister, DnsRefresher, HealthMonitor, PidFileHost, RoamingRecovery, StopReason,
    ServiceCoordinator, SysfsWakeLock, TunnelBackend, TunnelControl, TunnelOrchestrator, TunnelStore, WgQuickBackend,
};

// Use mimalloc as the global allocator for reduced memory fragmentation
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

const DEFAULT_CONFIG_PATH: &str = "/etc/tunkeep/tunkeep.toml";
const NETWORK_POLL_INTERVAL: Duration = Duration::from_secs(2);
const LOG_BUFFER: usize = 256;

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    info!("tunkeep starting with {}", config_path.display());

    let store = TunnelStore::open(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?
        .into_shared();
    let settings = store.settings();
    let state_dir = settings.general.state_dir.clone();

    let resolver: Arc<dyn HostResolver> = Arc::new(DnsResolver::with_defaults().context("creating resolver")?);
    let network_source = SysfsNetworkSource::new(NETWORK_POLL_INTERVAL);
    let network = NetworkMonitor::new(network_source.snapshot().await);

    let config_dir = state_dir.join("configs");
    let backends: Vec<Arc<dyn TunnelBackend>> = vec![
        Arc::new(WgQuickBackend::kernel(config_dir.clone(), Arc::clone(&resolver))),
        Arc::new(WgQuickBackend::userspace(config_dir, Arc::clone(&resolver))),
    ];
    let orchestrator = TunnelOrchestrator::new(backends, Arc::clone(&store)).context("creating orchestrator")?;
    let control: Arc<dyn TunnelControl> = Arc::new(orchestrator.clone());
    let tunnels = control.tunnels();

    let shutdown = CancellationToken::new();
    let (logs, _) = broadcast::channel(LOG_BUFFER);

    let monitor = HealthMonitor::new(
        Arc::clone(&control),
        Arc::clone(&store),
        Arc::new(SystemPinger),
        network.subscribe(),
    )
    .with_logs(logs.clone());
    let roaming = RoamingRecovery::with_wake_lock(
        Arc::clone(&control),
        Arc::clone(&store),
        Arc::clone(&resolver),
        network.subscribe(),
        Arc::new(SysfsWakeLock::new()),
    );
    let dns = DnsRefresher::new(Arc::clone(&control), Arc::clone(&store));
    let persister = ActiveStatePersister::new(tunnels.clone(), Arc::clone(&store));
    let coordinator = ServiceCoordinator::new(tunnels, Arc::new(PidFileHost::new(state_dir)));

    let mut tasks = vec![
        tokio::spawn(orchestrator.clone().run(shutdown.clone())),
        tokio::spawn(monitor.run(shutdown.clone())),
        tokio::spawn(roaming.run(shutdown.clone())),
        tokio::spawn(dns.run(shutdown.clone())),
        tokio::spawn(coordinator.run(shutdown.clone())),
    ];
    let poller = tokio::spawn(network_source.run(network.clone()));
    if settings.monitoring.is_local_logs_enabled {
        tasks.push(tokio::spawn(journal::follow(logs, shutdown.clone())));
    }

    // The persister starts after restore so it cannot clear the saved set first
    orchestrator.restore_previous_state().await;
    tasks.push(tokio::spawn(persister.run(shutdown.clone())));

    tokio::signal::ctrl_c().await.context("waiting for interrupt")?;
    info!("Shutting down");

    // Stop the persister before any tunnel goes down
    shutdown.cancel();
    for task in tasks {
        if let Err(e) = task.await {
            if e.is_panic() {
                error!("Task panicked: {}", e);
            }
        }
    }
    poller.abort();
    orchestrator.stop_all(StopReason::User).await;

    info!("tunkeep stopped");
    Ok(())
}
