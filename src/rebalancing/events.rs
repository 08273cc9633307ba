//! Migration events.

use super::task::{MigrationProgress, MigrationStatus};
use crate::types::{ShardId, ShardState};
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

/// Observable rebalancer activity.
#[derive(Debug, Clone, PartialEq)]
pub enum MigrationEvent {
    /// A task moved to a new status.
    StatusChanged {
        task: Uuid,
        from: MigrationStatus,
        to: MigrationStatus,
        /// Failure reason, for `Failed`.
        error: Option<String>,
    },

    /// Copy progress after a page.
    Progress { task: Uuid, progress: MigrationProgress },

    /// One catch-up round finished.
    CatchUp {
        task: Uuid,
        round: u32,
        /// Keys replayed this round.
        replayed: usize,
    },

    /// The health sweep or lifecycle changed a shard's state.
    ShardStateChanged {
        shard: ShardId,
        from: ShardState,
        to: ShardState,
    },
}

impl MigrationEvent {
    /// Task the event belongs to, if any.
    pub fn task(&self) -> Option<Uuid> {
        match self {
            MigrationEvent::StatusChanged { task, .. }
            | MigrationEvent::Progress { task, .. }
            | MigrationEvent::CatchUp { task, .. } => Some(*task),
            MigrationEvent::ShardStateChanged { .. } => None,
        }
    }
}

/// Receives migration events. Delivery is best effort.
pub trait EventSink: Send + Sync + std::fmt::Debug {
    fn emit(&self, event: MigrationEvent);
}

/// Logs events through `tracing`.
#[derive(Debug, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: MigrationEvent) {
        match event {
            MigrationEvent::StatusChanged { task, from, to, error } => {
                info!(%task, %from, %to, error = error.as_deref().unwrap_or(""), "Migration status changed")
            }
            MigrationEvent::Progress { task, progress } => debug!(
                %task,
                entries = progress.copied_entries,
                bytes = progress.copied_bytes,
                "Migration progress"
            ),
            MigrationEvent::CatchUp { task, round, replayed } => {
                debug!(%task, round, replayed, "Migration catch-up round")
            }
            MigrationEvent::ShardStateChanged { shard, from, to } => {
                info!(shard, %from, %to, "Shard state changed")
            }
        }
    }
}

/// Forwards events into an unbounded channel.
#[derive(Debug)]
pub struct ChannelEventSink {
    tx: mpsc::UnboundedSender<MigrationEvent>,
}

impl ChannelEventSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<MigrationEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelEventSink {
    fn emit(&self, event: MigrationEvent) {
        // A dropped receiver just means nobody is listening.
        let _ = self.tx.send(event);
    }
}
