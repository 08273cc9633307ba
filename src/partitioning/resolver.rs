//! Key-to-shard resolution against a topology snapshot.
//!
//! Resolution is a pure function of `(key, snapshot)`: the same key and
//! generation always yield the same shard.

use crate::error::{Error, Result};
use crate::topology::Topology;
use crate::types::{KeyRange, ShardId, ShardState, Span};

/// Where a key lives at a given generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// Owning shard.
    pub shard: ShardId,
    /// Ownership span the key falls in.
    pub span: Span,
    /// Generation the resolution was computed at.
    pub generation: u64,
    /// State of the owning shard in that snapshot.
    pub state: ShardState,
}

/// Resolve the shard owning `key`.
pub fn resolve(topology: &Topology, key: &[u8]) -> Result<Resolution> {
    let placement = topology.placement.as_ref().ok_or(Error::NoShardsAvailable)?;
    let (shard, span) = placement.locate(key).ok_or(Error::NoShardsAvailable)?;
    let entry = topology.shards.get(&shard).ok_or_else(|| {
        Error::InvalidTopology(format!(
            "placement references unknown shard {} at generation {}",
            shard, topology.generation
        ))
    })?;
    Ok(Resolution {
        shard,
        span,
        generation: topology.generation,
        state: entry.state,
    })
}

/// Shards that may hold keys in `range`, or every owning shard when `None`.
pub fn scatter_targets(topology: &Topology, range: Option<&KeyRange>) -> Result<Vec<ShardId>> {
    let placement = topology.placement.as_ref().ok_or(Error::NoShardsAvailable)?;
    let targets = match range {
        Some(range) => placement.shards_for_range(range),
        None => placement.shards().into_iter().collect(),
    };
    if targets.is_empty() {
        return Err(Error::NoShardsAvailable);
    }
    Ok(targets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partitioning::StrategyKind;
    use crate::types::encode_u64_key;
    use std::collections::{BTreeSet, HashMap};

    fn topology(kind: StrategyKind, shards: usize) -> Topology {
        let addresses: Vec<String> = (0..shards).map(|i| format!("mem://{}", i)).collect();
        Topology::bootstrap(kind, &addresses).unwrap()
    }

    #[test]
    fn test_empty_topology_has_no_shards() {
        let empty = Topology::empty(StrategyKind::hash());
        assert!(matches!(resolve(&empty, b"k"), Err(Error::NoShardsAvailable)));
        assert!(matches!(scatter_targets(&empty, None), Err(Error::NoShardsAvailable)));
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let topo = topology(StrategyKind::consistent_hash(), 4);
        for i in 0..500 {
            let key = format!("user:{}", i);
            let a = resolve(&topo, key.as_bytes()).unwrap();
            let b = resolve(&topo, key.as_bytes()).unwrap();
            assert_eq!(a, b);
            assert_eq!(a.generation, topo.generation);
            assert_eq!(a.state, ShardState::Active);
        }
    }

    #[test]
    fn test_hash_strategy_total_and_disjoint() {
        let topo = topology(StrategyKind::hash(), 3);
        let mut per_shard: HashMap<ShardId, BTreeSet<String>> = HashMap::new();
        for i in 0..1000 {
            let key = format!("key-{}", i);
            let res = resolve(&topo, key.as_bytes()).unwrap();
            per_shard.entry(res.shard).or_default().insert(key);
        }
        let total: usize = per_shard.values().map(BTreeSet::len).sum();
        assert_eq!(total, 1000);
        assert_eq!(per_shard.len(), 3);
    }

    #[test]
    fn test_range_boundary_resolution() {
        let kind = StrategyKind::Range {
            boundaries: vec![encode_u64_key(100)],
        };
        let topo = topology(kind, 2);
        assert_eq!(resolve(&topo, &encode_u64_key(99)).unwrap().shard, 0);
        assert_eq!(resolve(&topo, &encode_u64_key(100)).unwrap().shard, 1);

        let range = KeyRange::new(encode_u64_key(0), encode_u64_key(50));
        assert_eq!(scatter_targets(&topo, Some(&range)).unwrap(), vec![0]);
        assert_eq!(scatter_targets(&topo, None).unwrap(), vec![0, 1]);
    }
}
