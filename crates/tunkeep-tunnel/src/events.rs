//! Engine Events
//!
//! One-shot notifications for external observers. Errors are tagged with
//! the tunnel name (or `None` for engine-wide failures) and never stop the
//! engine itself.

use crate::error::TunnelError;
use tokio::sync::broadcast;
use tracing::debug;

const EVENT_CAPACITY: usize = 64;

/// Informational notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineMessage {
    /// Endpoints re-resolved after the tunnel turned unhealthy
    DynamicDnsSuccess,
    /// Tunnel restarted after config drift or failure
    BounceSuccess,
    /// Tunnel rebound to a new access point without a restart
    RoamingRecovered,
}

#[derive(Debug, Clone)]
pub struct ErrorEvent {
    pub tunnel_name: Option<String>,
    pub error: TunnelError,
}

#[derive(Debug, Clone)]
pub struct MessageEvent {
    pub tunnel_name: Option<String>,
    pub message: EngineMessage,
}

/// Broadcast pair for error and message events
#[derive(Clone)]
pub struct EventBus {
    errors: broadcast::Sender<ErrorEvent>,
    messages: broadcast::Sender<MessageEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (errors, _) = broadcast::channel(EVENT_CAPACITY);
        let (messages, _) = broadcast::channel(EVENT_CAPACITY);
        Self { errors, messages }
    }

    /// Publish an error; cancellations are dropped here
    pub fn error(&self, tunnel_name: Option<&str>, error: TunnelError) {
        if !error.is_user_visible() {
            return;
        }
        let event = ErrorEvent {
            tunnel_name: tunnel_name.map(str::to_string),
            error,
        };
        if self.errors.send(event).is_err() {
            debug!("No error observers");
        }
    }

    pub fn message(&self, tunnel_name: Option<&str>, message: EngineMessage) {
        let event = MessageEvent {
            tunnel_name: tunnel_name.map(str::to_string),
            message,
        };
        if self.messages.send(event).is_err() {
            debug!("No message observers");
        }
    }

    pub(crate) fn forward_error(&self, event: ErrorEvent) {
        let _ = self.errors.send(event);
    }

    pub(crate) fn forward_message(&self, event: MessageEvent) {
        let _ = self.messages.send(event);
    }

    pub fn subscribe_errors(&self) -> broadcast::Receiver<ErrorEvent> {
        self.errors.subscribe()
    }

    pub fn subscribe_messages(&self) -> broadcast::Receiver<MessageEvent> {
        self.messages.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
