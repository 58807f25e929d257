//! Backend Adapter Contract
//!
//! A backend is an already-implemented tunneling engine (kernel
//! WireGuard, wireguard-go, ...). The engine only needs to bring tunnels
//! up and down, read counters, and hot-apply endpoint changes.
//!
//! Status is reported as a stream per tunnel: the receiver returned by
//! [`TunnelBackend::set_state`] yields every status change until the
//! backend drops its sender.

use crate::config::{TunnelConfig, TunnelDefinition, TunnelId};
use crate::error::BackendError;
use crate::kill_switch::BackendMode;
use crate::state::{TunnelStatistics, TunnelStatus};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use tokio::sync::mpsc;

/// Per-tunnel status stream
pub type StatusStream = mpsc::Receiver<Result<TunnelStatus, BackendError>>;

/// Selectable backend flavours
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Kernel,
    Userspace,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Kernel => write!(f, "kernel"),
            BackendKind::Userspace => write!(f, "userspace"),
        }
    }
}

/// Requested direction for [`TunnelBackend::set_state`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetState {
    Up,
    Down,
}

/// What a backend can do; drives engine policy instead of per-type branches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendCapabilities {
    /// `None` means unlimited
    pub max_concurrent_tunnels: Option<usize>,
    /// Backend re-resolves endpoints itself; the DNS refresher skips it
    pub self_manages_endpoints: bool,
    /// Backend follows access-point changes itself; roaming recovery skips it
    pub native_roaming: bool,
    /// Tunnel names must be valid kernel interface names
    pub requires_kernel_name: bool,
}

impl BackendCapabilities {
    /// How many previously active tunnels a restore may start
    pub fn restore_limit(&self, candidates: usize) -> usize {
        self.max_concurrent_tunnels.map_or(candidates, |max| candidates.min(max))
    }
}

/// Opaque tunneling engine
#[async_trait]
pub trait TunnelBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn capabilities(&self) -> BackendCapabilities;

    /// Bring a tunnel up or down; the stream reports progress
    async fn set_state(&self, config: &TunnelConfig, target: TargetState) -> Result<StatusStream, BackendError>;

    /// Tear down without waiting for a graceful stop
    async fn force_stop(&self, id: TunnelId) -> Result<(), BackendError>;

    async fn statistics(&self, id: TunnelId) -> Result<TunnelStatistics, BackendError>;

    /// Re-resolve endpoint hostnames and apply them to the running tunnel
    async fn resolve_dns(&self, config: &TunnelConfig) -> Result<bool, BackendError>;

    /// Apply a definition to the running tunnel without restarting it,
    /// rebinding sockets to the given endpoints
    async fn apply_definition(&self, id: TunnelId, definition: &TunnelDefinition) -> Result<(), BackendError>;

    async fn running_tunnel_names(&self) -> Result<BTreeSet<String>, BackendError>;

    async fn set_mode(&self, mode: BackendMode) -> Result<(), BackendError>;

    fn mode(&self) -> BackendMode;
}
