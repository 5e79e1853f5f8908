//! Transition events.

use serde::{Deserialize, Serialize};
use stackgrid_core::{NodeId, ServiceStatus};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// One emitted lifecycle transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionEvent {
    pub workspace: String,
    pub node_id: NodeId,
    pub previous_status: ServiceStatus,
    pub new_status: ServiceStatus,
    pub timestamp: u64,
}

/// Receives transition events. Emission must not block.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: TransitionEvent);
}

/// Logs every event through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl EventSink for LogSink {
    fn emit(&self, event: TransitionEvent) {
        info!(
            workspace = %event.workspace,
            node = %event.node_id,
            from = %event.previous_status,
            to = %event.new_status,
            "service transition"
        );
    }
}

/// Forwards events into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<TransitionEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TransitionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: TransitionEvent) {
        if self.tx.send(event).is_err() {
            debug!("event receiver dropped");
        }
    }
}
