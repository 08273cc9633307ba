//! Partitioning: mapping keys to shards.
//!
//! Every strategy answers the same question, "which shard owns this key at
//! this generation", from data stored inside the topology snapshot.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     Topology snapshot (gen N)                │
//! │  ┌────────────────────────────────────────────────────────┐  │
//! │  │                      Placement                         │  │
//! │  │  Hash ─────────── SlotTable  [0,5461)→0 [5461,..)→1 .. │  │
//! │  │  ConsistentHash ─ VnodeRing ─materialise─► SlotTable   │  │
//! │  │  Modulo ───────── sorted shard list                    │  │
//! │  │  Range ────────── RangeTable ["",m)→0 [m,+inf)→1       │  │
//! │  │  Directory ────── tag → shard, default shard           │  │
//! │  │  Composite ────── Directory, then SlotTable            │  │
//! │  └────────────────────────────────────────────────────────┘  │
//! │                                                              │
//! │  "tenant7:order:9" → locate → (shard 2, Span::Tag(tenant7))  │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use shardgate::partitioning::{resolve, StrategyKind};
//! use shardgate::topology::Topology;
//!
//! let topology = Topology::bootstrap(StrategyKind::hash(), &addresses)?;
//! let resolution = resolve(&topology, b"user:123")?;
//! println!("shard {} at generation {}", resolution.shard, resolution.generation);
//! ```

mod directory;
mod hashring;
mod placement;
mod ranges;
mod resolver;
mod slots;

pub use directory::{Directory, DEFAULT_TAG_DELIMITER};
pub use hashring::{ring_position, VnodeRing, DEFAULT_VNODES_PER_SHARD, RING_POSITIONS};
pub use placement::{slot_span, Placement, StrategyKind};
pub use ranges::RangeTable;
pub use resolver::{resolve, scatter_targets, Resolution};
pub use slots::{take_slots, SlotTable, DEFAULT_RING_SIZE};

use std::hash::Hasher;
use twox_hash::XxHash64;

/// xxHash64 of a key, seed 0.
pub fn hash_key(key: &[u8]) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(key);
    hasher.finish()
}
