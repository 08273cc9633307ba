//! Shard routing and rebalancing coordinator.
//!
//! This crate sits between clients and a set of independent storage shards:
//! - **Partitioning** maps every key to exactly one shard through a
//!   pluggable placement (hash slots, consistent hashing, modulo, key ranges,
//!   a tag directory, or a directory with hash fallback)
//! - **Routing** dispatches single-key and scatter-gather operations against
//!   a versioned topology snapshot, refreshing it when a shard reports it no
//!   longer owns a key
//! - **Rebalancing** moves spans between shards online: copy, catch up,
//!   fence, verify, then publish ownership in one topology mutation
//!
//! # Example
//!
//! ```rust,no_run
//! use shardgate::{CoordinatorConfig, ShardCoordinator, SingleKeyOp, StrategyKind};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let coordinator = ShardCoordinator::builder(CoordinatorConfig::new(StrategyKind::consistent_hash()))
//!         .with_shards(["mem://a", "mem://b", "mem://c"])
//!         .build()
//!         .await?;
//!
//!     coordinator.execute(SingleKeyOp::put("user:123", "Alice")).await?;
//!     let found = coordinator.execute(SingleKeyOp::get("user:123")).await?;
//!     println!("{:?} (generation {})", found.value, found.generation);
//!
//!     // Grow the cluster; data moves on the next rebalance pass.
//!     coordinator.admin_add_shard("mem://d").await?;
//!     coordinator.rebalance_now().await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │                 Clients                     │
//! └─────────────────────────────────────────────┘
//!                     │
//!                     ▼
//! ┌─────────────────────────────────────────────┐
//! │             ShardCoordinator                │
//! │  • execute / execute_scatter                │
//! │  • admin_add_shard / admin_remove_shard     │
//! │  • admin_assign_tag / admin_restrategy      │
//! └─────────────────────────────────────────────┘
//!        │                 │                │
//!        ▼                 ▼                ▼
//! ┌────────────┐   ┌──────────────┐   ┌──────────────┐
//! │   Router   │◄──│ Rebalancer   │──►│ TopologyStore│
//! │ (tracker)  │   │ (tasks)      │   │ (CAS on gen) │
//! └────────────┘   └──────────────┘   └──────────────┘
//!        │                 │
//!        ▼                 ▼
//! ┌─────────────────────────────────────────────┐
//! │        ShardBackend  (one per shard)        │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! # Consistency Model
//!
//! - **Ownership**: exactly one shard owns a key at any generation
//! - **Writes**: acknowledged writes survive every migration; writes to a
//!   span are held back only for the short fenced window before cutover
//! - **Topology**: every change is a compare-and-swap on the generation, so
//!   concurrent coordinators sharing persistence never overwrite each other

pub mod backend;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod metrics;
pub mod partitioning;
pub mod rebalancing;
pub mod router;
pub mod topology;
pub mod types;

#[cfg(test)]
mod testing;

// Re-export main types for convenience
pub use config::{CoordinatorConfig, RebalanceConfig, RouterConfig, TopologyConfig};
pub use coordinator::{CoordinatorBuilder, ShardCoordinator};
pub use error::{BackendError, BackendResult, Error, Result};
pub use types::{encode_u64_key, KeyRange, OperationId, ShardId, ShardState, SlotRange, Span};

// Re-export backend types
pub use backend::{BackendConnector, HealthState, InMemoryBackend, InMemoryConnector, ShardBackend};

// Re-export partitioning types
pub use partitioning::{resolve, Placement, Resolution, StrategyKind};

// Re-export routing types
pub use router::{
    Aggregate, AggregateResult, ExecuteResult, MultiKeyOp, RetryPolicy, Router, ScatterPredicate,
    SingleKeyOp,
};

// Re-export rebalancing types
pub use rebalancing::{
    EventSink, MigrationEvent, MigrationReason, MigrationStatus, MigrationTask, Rebalancer,
};

// Re-export topology types
pub use topology::{FilePersistence, InMemoryPersistence, Topology, TopologyPersistence, TopologyStore};

// Re-export metrics types
pub use metrics::CoordinatorMetrics;
