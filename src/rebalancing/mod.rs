//! Rebalancing: moving spans between shards without losing writes.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Rebalancer                            │
//! │  ┌──────────────────────────────────────────────────────┐  │
//! │  │  Planner                                              │  │
//! │  │  - Membership change / skew / strategy switch         │  │
//! │  │  - Emits MigrationTasks, never touches the topology   │  │
//! │  └──────────────────────────────────────────────────────┘  │
//! │                          ↓                                   │
//! │  ┌──────────────────────────────────────────────────────┐  │
//! │  │  MigrationRun                                         │  │
//! │  │  - Copy while the source serves                       │  │
//! │  │  - Replay dirty keys, fence, drain, final replay      │  │
//! │  │  - Cutover: one topology mutation                     │  │
//! │  │  - Release and purge the source                       │  │
//! │  └──────────────────────────────────────────────────────┘  │
//! │                          ↑                                   │
//! │  ┌──────────────────────────────────────────────────────┐  │
//! │  │  MigrationTracker (shared with the router)            │  │
//! │  │  - Records keys written during a migration            │  │
//! │  │  - Holds writes back while a span is fenced           │  │
//! │  └──────────────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Tasks are persisted through the topology persistence layer at every
//! status change, so [`Rebalancer::recover`] can resume after a restart.

mod coordinator;
mod events;
mod planner;
mod task;
mod tracker;

pub use coordinator::{MigrationRun, Rebalancer, RebalancerHandle};
pub use events::{ChannelEventSink, EventSink, MigrationEvent, TracingEventSink};
pub use planner::{Planner, ShardLoads};
pub use task::{MigrationProgress, MigrationReason, MigrationStatus, MigrationTask, TaskRoute};
pub use tracker::{ActiveMigration, MigrationTracker, WriteGuard};

use crate::error::{BackendError, Result};
use std::future::Future;
use std::time::Duration;

/// Await a backend call, turning an elapsed `timeout` into
/// `BackendError::Timeout`.
pub(crate) async fn backend_call<T>(
    timeout: Duration,
    fut: impl Future<Output = crate::error::BackendResult<T>>,
) -> Result<T> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result.map_err(Into::into),
        Err(_) => Err(BackendError::Timeout.into()),
    }
}
