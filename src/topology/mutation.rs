//! Topology mutations.
//!
//! `Topology::apply` is pure: it checks the mutation against the current
//! record, produces the successor with `generation + 1`, and validates it.
//! Nothing is persisted here.

use super::model::{ShardEntry, Topology};
use crate::error::{Error, Result};
use crate::partitioning::{Placement, StrategyKind};
use crate::types::{ShardId, ShardState, Span};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A single change to the topology.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TopologyMutation {
    /// Create the first generation with `addresses` as active shards.
    Bootstrap { addresses: Vec<String> },
    /// Register a new shard. `id` must equal `next_shard_id`.
    AddShard { id: ShardId, address: String },
    SetShardState { shard: ShardId, state: ShardState },
    /// Forget a shard that owns nothing.
    RemoveShard { shard: ShardId },
    /// Cutover: hand `span` from `from` to `to`.
    TransferSpan { span: Span, from: ShardId, to: ShardId },
    /// Map a tag that currently has no entry.
    AssignTag { tag: String, shard: ShardId },
    /// Re-strategy cutover.
    ReplacePlacement { placement: Placement },
}

impl TopologyMutation {
    pub fn name(&self) -> &'static str {
        match self {
            TopologyMutation::Bootstrap { .. } => "bootstrap",
            TopologyMutation::AddShard { .. } => "add_shard",
            TopologyMutation::SetShardState { .. } => "set_shard_state",
            TopologyMutation::RemoveShard { .. } => "remove_shard",
            TopologyMutation::TransferSpan { .. } => "transfer_span",
            TopologyMutation::AssignTag { .. } => "assign_tag",
            TopologyMutation::ReplacePlacement { .. } => "replace_placement",
        }
    }
}

impl fmt::Display for TopologyMutation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopologyMutation::Bootstrap { addresses } => write!(f, "bootstrap({} shards)", addresses.len()),
            TopologyMutation::AddShard { id, address } => write!(f, "add_shard({} @ {})", id, address),
            TopologyMutation::SetShardState { shard, state } => write!(f, "set_shard_state({} -> {})", shard, state),
            TopologyMutation::RemoveShard { shard } => write!(f, "remove_shard({})", shard),
            TopologyMutation::TransferSpan { span, from, to } => write!(f, "transfer_span({}: {} -> {})", span, from, to),
            TopologyMutation::AssignTag { tag, shard } => write!(f, "assign_tag({} -> {})", tag, shard),
            TopologyMutation::ReplacePlacement { placement } => write!(f, "replace_placement({})", placement.name()),
        }
    }
}

impl Topology {
    /// Produce the successor topology.
    pub fn apply(&self, mutation: &TopologyMutation) -> Result<Topology> {
        let mut next = self.clone();
        next.generation = self.generation + 1;

        match mutation {
            TopologyMutation::Bootstrap { addresses } => {
                if self.generation != 0 || !self.shards.is_empty() {
                    return Err(Error::InvalidMutation(
                        "bootstrap applies only to an empty generation-0 topology".to_string(),
                    ));
                }
                if addresses.is_empty() {
                    return Err(Error::NoShardsAvailable);
                }
                let ids: Vec<ShardId> = (0..addresses.len() as ShardId).collect();
                for (&id, address) in ids.iter().zip(addresses) {
                    next.insert_shard(id, address, ShardState::Active)?;
                }
                next.next_shard_id = ids.len() as ShardId;
                next.placement = Some(Placement::build(&self.strategy, &ids)?);
            }
            TopologyMutation::AddShard { id, address } => {
                if *id != self.next_shard_id {
                    return Err(Error::InvalidMutation(format!(
                        "shard id {} is not the next id {}",
                        id, self.next_shard_id
                    )));
                }
                next.next_shard_id = id + 1;
                match next.placement.as_mut() {
                    None => {
                        next.insert_shard(*id, address, ShardState::Active)?;
                        next.placement = Some(Placement::build(&self.strategy, &[*id])?);
                    }
                    Some(placement) => {
                        placement.add_member(*id);
                        next.insert_shard(*id, address, ShardState::Joining)?;
                    }
                }
            }
            TopologyMutation::SetShardState { shard, state } => {
                let entry = next
                    .shards
                    .get_mut(shard)
                    .ok_or(Error::ShardNotFound(*shard))?;
                if entry.state == *state {
                    return Err(Error::InvalidMutation(format!(
                        "shard {} is already {}",
                        shard, state
                    )));
                }
                entry.state = *state;
            }
            TopologyMutation::RemoveShard { shard } => {
                if !self.shards.contains_key(shard) {
                    return Err(Error::ShardNotFound(*shard));
                }
                if self.owns_anything(*shard) {
                    return Err(Error::InvalidMutation(format!(
                        "shard {} still owns spans",
                        shard
                    )));
                }
                next.shards.remove(shard);
                if next.shards.is_empty() {
                    next.placement = None;
                } else if let Some(placement) = next.placement.as_mut() {
                    placement.remove_member(*shard);
                }
            }
            TopologyMutation::TransferSpan { span, from, to } => {
                if from == to {
                    return Err(Error::InvalidMutation("transfer to the same shard".to_string()));
                }
                for shard in [from, to] {
                    if !self.shards.contains_key(shard) {
                        return Err(Error::ShardNotFound(*shard));
                    }
                }
                next.placement
                    .as_mut()
                    .ok_or(Error::NoShardsAvailable)?
                    .transfer(span, *from, *to)?;
            }
            TopologyMutation::AssignTag { tag, shard } => {
                if !self.shards.contains_key(shard) {
                    return Err(Error::ShardNotFound(*shard));
                }
                next.placement
                    .as_mut()
                    .ok_or(Error::NoShardsAvailable)?
                    .assign_tag(tag, *shard)?;
            }
            TopologyMutation::ReplacePlacement { placement } => {
                next.strategy = placement.kind();
                next.placement = Some(placement.clone());
            }
        }

        next.validate()?;
        Ok(next)
    }

    fn insert_shard(&mut self, id: ShardId, address: &str, state: ShardState) -> Result<()> {
        if address.is_empty() {
            return Err(Error::InvalidMutation("shard address is empty".to_string()));
        }
        if self.shards.values().any(|e| e.address == address) {
            return Err(Error::InvalidMutation(format!(
                "address {} is already registered",
                address
            )));
        }
        self.shards.insert(
            id,
            ShardEntry {
                address: address.to_string(),
                state,
            },
        );
        Ok(())
    }
}

/// Strategy kind used when rebuilding a topology's placement.
pub fn strategy_of(topology: &Topology) -> StrategyKind {
    topology
        .placement
        .as_ref()
        .map(Placement::kind)
        .unwrap_or_else(|| topology.strategy.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{KeyRange, encode_u64_key};

    fn addresses(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("mem://shard-{}", i)).collect()
    }

    #[test]
    fn test_bootstrap_creates_generation_one() {
        let topo = Topology::bootstrap(StrategyKind::hash(), &addresses(3)).unwrap();
        assert_eq!(topo.generation, 1);
        assert_eq!(topo.next_shard_id, 3);
        assert!(topo.shards.values().all(|e| e.state == ShardState::Active));
        topo.validate().unwrap();

        let again = topo.apply(&TopologyMutation::Bootstrap { addresses: addresses(1) });
        assert!(matches!(again, Err(Error::InvalidMutation(_))));
    }

    #[test]
    fn test_add_shard_joins_without_ownership() {
        let topo = Topology::bootstrap(StrategyKind::consistent_hash(), &addresses(2)).unwrap();
        let next = topo
            .apply(&TopologyMutation::AddShard {
                id: 2,
                address: "mem://shard-2".into(),
            })
            .unwrap();
        assert_eq!(next.generation, topo.generation + 1);
        assert_eq!(next.state_of(2), Some(ShardState::Joining));
        assert!(!next.owns_anything(2));

        let dup = next.apply(&TopologyMutation::AddShard {
            id: 2,
            address: "mem://other".into(),
        });
        assert!(dup.is_err());
    }

    #[test]
    fn test_first_shard_bootstraps_placement() {
        let topo = Topology::empty(StrategyKind::range());
        let next = topo
            .apply(&TopologyMutation::AddShard {
                id: 0,
                address: "mem://a".into(),
            })
            .unwrap();
        assert_eq!(next.state_of(0), Some(ShardState::Active));
        assert!(next.owns_anything(0));
    }

    #[test]
    fn test_remove_requires_empty_shard() {
        let topo = Topology::bootstrap(StrategyKind::range(), &addresses(1)).unwrap();
        let topo = topo
            .apply(&TopologyMutation::AddShard {
                id: 1,
                address: "mem://b".into(),
            })
            .unwrap();
        assert!(topo.apply(&TopologyMutation::RemoveShard { shard: 0 }).is_err());

        let removed = topo.apply(&TopologyMutation::RemoveShard { shard: 1 }).unwrap();
        assert!(removed.shard(1).is_none());
        assert_eq!(removed.next_shard_id, 2);
    }

    #[test]
    fn test_transfer_requires_full_ownership() {
        let topo = Topology::bootstrap(StrategyKind::range(), &addresses(2)).unwrap();
        let span = Span::Keys(KeyRange::new(encode_u64_key(100), encode_u64_key(200)));
        let moved = topo
            .apply(&TopologyMutation::TransferSpan {
                span: span.clone(),
                from: 0,
                to: 1,
            })
            .unwrap();
        assert_eq!(moved.placement.as_ref().unwrap().owner_of(&encode_u64_key(150)), Some(1));

        let replay = moved.apply(&TopologyMutation::TransferSpan { span, from: 0, to: 1 });
        assert!(matches!(replay, Err(Error::InvalidMutation(_))));
    }

    #[test]
    fn test_set_state_round_trip() {
        let topo = Topology::bootstrap(StrategyKind::hash(), &addresses(2)).unwrap();
        let down = topo
            .apply(&TopologyMutation::SetShardState {
                shard: 1,
                state: ShardState::Down,
            })
            .unwrap();
        assert_eq!(down.state_of(1), Some(ShardState::Down));
        assert!(down
            .apply(&TopologyMutation::SetShardState {
                shard: 1,
                state: ShardState::Down
            })
            .is_err());
        assert!(matches!(
            down.apply(&TopologyMutation::SetShardState {
                shard: 9,
                state: ShardState::Active
            }),
            Err(Error::ShardNotFound(9))
        ));
    }

    #[test]
    fn test_replace_placement_updates_strategy() {
        let topo = Topology::bootstrap(StrategyKind::Modulo, &addresses(3)).unwrap();
        let placement = Placement::build(&StrategyKind::consistent_hash(), &[0, 1, 2]).unwrap();
        let next = topo
            .apply(&TopologyMutation::ReplacePlacement { placement })
            .unwrap();
        assert_eq!(next.strategy.name(), "consistent_hash");
        assert_eq!(strategy_of(&next).name(), "consistent_hash");
    }
}
