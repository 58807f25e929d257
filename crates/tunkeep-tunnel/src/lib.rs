//! tunkeep Tunnel Engine
//!
//! Keeps WireGuard tunnels up across network changes, backend failures
//! and restarts.
//!
//! # Architecture
//!
//! ```text
//!                       ┌──────────────────────┐
//!   ConfigStore ───────▶│  TunnelOrchestrator  │◀──── NetworkMonitor
//!   (settings, tunnels) │  kernel │ userspace  │      (connectivity)
//!                       └────┬─────────┬───────┘
//!                            │         │
//!                  ┌─────────▼──┐   ┌──▼─────────┐
//!                  │ Lifecycle  │   │ Lifecycle  │   one per backend
//!                  └─────┬──────┘   └──────┬─────┘
//!                        └──── TunnelMap ──┘        watch channel
//!                                  │
//!        ┌──────────────┬──────────┼───────────────┬────────────────┐
//!        ▼              ▼          ▼               ▼                ▼
//!  HealthMonitor  RoamingRecovery  DnsRefresher  ActiveState   ServiceCoordinator
//!                                                Persister
//! ```
//!
//! Observers never write the map directly. They go through
//! [`TunnelControl`], which the orchestrator routes to the lifecycle that
//! owns the tunnel.
//!
//! # Features
//!
//! - **Two backends**: kernel and userspace `wg-quick`, switched at runtime
//! - **Kill switch**: lockdown mode with allowed LAN ranges, refused by
//!   backends that cannot enforce it
//! - **Health**: pings, counter staleness and backend log lines
//! - **Roaming**: socket rebind on Wi-Fi access point handoff
//! - **Dynamic DNS**: endpoint re-resolution for unhealthy tunnels
//! - **Restore**: previously active tunnels come back after a restart

mod backend;
mod config;
mod control;
mod dynamic_dns;
mod error;
mod events;
mod jobs;
mod keys;
mod kill_switch;
mod lifecycle;
mod monitor;
mod orchestrator;
mod persister;
mod roaming;
mod state;
mod store;
mod wg_quick;

#[cfg(test)]
mod testing;

pub use backend::{BackendCapabilities, BackendKind, StatusStream, TargetState, TunnelBackend};
pub use config::{
    AllowedIp, ConfigError, Endpoint, InterfaceConfig, PeerConfig, TunnelConfig, TunnelDefinition,
    TunnelId, MAX_DEFINITION_BYTES, MAX_KERNEL_NAME_LEN,
};
pub use control::TunnelControl;
pub use dynamic_dns::{Backoff, DnsRefresher};
pub use error::{BackendError, TunnelError};
pub use events::{EngineMessage, ErrorEvent, EventBus, MessageEvent};
pub use keys::{KeyError, PrivateKey, PublicKey};
pub use kill_switch::BackendMode;
pub use lifecycle::TunnelLifecycle;
pub use monitor::{classify_log_line, ping_target, HealthMonitor, LogLine};
pub use orchestrator::TunnelOrchestrator;
pub use persister::{ActiveStatePersister, PidFileHost, ServiceCoordinator, ServiceError, ServiceHost};
pub use roaming::{
    NoopWakeLock, RoamEvent, RoamTracker, RoamingRecovery, SysfsWakeLock, WakeLock, ROAMING_DEBOUNCE,
};
pub use state::{
    now_millis, ActiveTunnels, FailureReason, HealthStatus, LogHealthState, PeerStats, PingState,
    StopReason, TunnelMap, TunnelState, TunnelStatistics, TunnelStatus, TunnelUpdate,
};
pub use store::{
    ConfigFormat, ConfigStore, EngineConfig, GeneralSettings, LockdownSettings, MonitoringSettings,
    Settings, StoreError, TunnelStore,
};
pub use wg_quick::{parse_wg_dump, CommandRunner, SystemRunner, WgQuickBackend};
