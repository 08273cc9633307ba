//! Topology: the versioned record of shards and span ownership.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        TopologyStore                        │
//! │                                                             │
//! │  apply_mutation(base_gen, m)                                │
//! │     │                                                       │
//! │     ├─ load current ── gen != base_gen ─► StaleGeneration   │
//! │     ├─ current.apply(m) ── validate coverage                │
//! │     ├─ persistence.compare_and_swap(base_gen, next)         │
//! │     └─ publish Arc<Topology> ──► watch ──► Routers          │
//! │                                                             │
//! │  TopologyPersistence: InMemoryPersistence | FilePersistence │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Only the rebalancer and admin operations write; routers read snapshots.

mod model;
mod mutation;
mod persistence;
mod store;

pub use model::{ShardEntry, Topology};
pub use mutation::{strategy_of, TopologyMutation};
pub use persistence::{FilePersistence, InMemoryPersistence, TopologyPersistence};
pub use store::TopologyStore;
