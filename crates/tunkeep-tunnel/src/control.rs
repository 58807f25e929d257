//! The surface observers call back into
//!
//! Monitors and handlers never touch the active map. They read it through
//! [`TunnelControl::tunnels`] and report through
//! [`TunnelControl::update_tunnel_status`]; both the lifecycle and the
//! orchestrator implement this.

use crate::backend::BackendCapabilities;
use crate::config::{TunnelConfig, TunnelDefinition, TunnelId};
use crate::error::TunnelError;
use crate::events::EventBus;
use crate::state::{StopReason, TunnelMap, TunnelStatistics, TunnelUpdate};
use async_trait::async_trait;

#[async_trait]
pub trait TunnelControl: Send + Sync {
    /// Read-only view of the active map
    fn tunnels(&self) -> TunnelMap;

    /// Capabilities of the backend that runs (or would run) tunnel `id`
    fn capabilities(&self, id: TunnelId) -> BackendCapabilities;

    fn events(&self) -> EventBus;

    fn update_tunnel_status(&self, id: TunnelId, update: TunnelUpdate);

    /// Config a running tunnel was started with
    fn running_config(&self, id: TunnelId) -> Option<TunnelConfig>;

    /// Backend counters; `None` on any failure
    async fn statistics(&self, id: TunnelId) -> Option<TunnelStatistics>;

    /// Stop, pause, start
    async fn bounce_tunnel(&self, config: TunnelConfig, reason: StopReason) -> Result<(), TunnelError>;

    /// Hot-apply a definition to a running tunnel
    async fn apply_definition(&self, id: TunnelId, definition: &TunnelDefinition) -> Result<(), TunnelError>;

    async fn resolve_dns(&self, config: &TunnelConfig) -> Result<bool, TunnelError>;
}
