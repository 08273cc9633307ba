//! The topology record.

use crate::error::{Error, Result};
use crate::partitioning::{Placement, StrategyKind};
use crate::types::{ShardId, ShardState};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One shard in the topology.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardEntry {
    /// Backend address handed to the connector.
    pub address: String,
    pub state: ShardState,
}

/// Immutable, generation-versioned description of the shard set.
///
/// Readers share snapshots behind an `Arc`; a mutation produces a new value
/// with `generation + 1` rather than editing in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    /// Monotonic version; 0 means nothing has been persisted yet.
    pub generation: u64,
    /// Next id handed to `AddShard`.
    pub next_shard_id: ShardId,
    pub shards: BTreeMap<ShardId, ShardEntry>,
    /// Strategy used when the placement is (re)built from scratch.
    pub strategy: StrategyKind,
    /// `None` until the first shard exists.
    pub placement: Option<Placement>,
}

impl Topology {
    /// Generation-0 topology with no shards.
    pub fn empty(strategy: StrategyKind) -> Self {
        Self {
            generation: 0,
            next_shard_id: 0,
            shards: BTreeMap::new(),
            strategy,
            placement: None,
        }
    }

    /// Generation-1 topology with `addresses` as active shards `0..n`.
    pub fn bootstrap(strategy: StrategyKind, addresses: &[String]) -> Result<Self> {
        Topology::empty(strategy).apply(&super::TopologyMutation::Bootstrap {
            addresses: addresses.to_vec(),
        })
    }

    pub fn shard(&self, id: ShardId) -> Option<&ShardEntry> {
        self.shards.get(&id)
    }

    pub fn state_of(&self, id: ShardId) -> Option<ShardState> {
        self.shards.get(&id).map(|e| e.state)
    }

    pub fn shard_ids(&self) -> Vec<ShardId> {
        self.shards.keys().copied().collect()
    }

    /// Shards in the given states.
    pub fn shards_in(&self, states: &[ShardState]) -> Vec<ShardId> {
        self.shards
            .iter()
            .filter(|(_, e)| states.contains(&e.state))
            .map(|(&id, _)| id)
            .collect()
    }

    /// Whether `shard` owns anything at this generation.
    pub fn owns_anything(&self, shard: ShardId) -> bool {
        self.placement
            .as_ref()
            .is_some_and(|p| p.references(shard))
    }

    /// Check the structural invariants of a topology.
    ///
    /// The placement must cover the keyspace exactly once and reference only
    /// known shards.
    pub fn validate(&self) -> Result<()> {
        if let Some(&max) = self.shards.keys().next_back() {
            if max >= self.next_shard_id {
                return Err(Error::InvalidTopology(format!(
                    "shard {} is not below next_shard_id {}",
                    max, self.next_shard_id
                )));
            }
        }
        match &self.placement {
            None if self.shards.is_empty() => Ok(()),
            None => Err(Error::InvalidTopology(
                "shards exist but no placement is set".to_string(),
            )),
            Some(_) if self.shards.is_empty() => Err(Error::InvalidTopology(
                "placement set on a topology with no shards".to_string(),
            )),
            Some(placement) => {
                placement.validate()?;
                for shard in placement.shards() {
                    if !self.shards.contains_key(&shard) {
                        return Err(Error::InvalidTopology(format!(
                            "placement references unknown shard {}",
                            shard
                        )));
                    }
                }
                Ok(())
            }
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(data)?)
    }
}
