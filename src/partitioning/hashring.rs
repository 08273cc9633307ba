//! Consistent hashing with virtual nodes.
//!
//! Each shard places `vnodes_per_shard` tokens on a 2^32 ring. A key maps to
//! the first token at or after its ring position (`hash(key) >> 32`),
//! wrapping around at the top. Adding or removing a shard only moves the
//! keys between its tokens and their predecessors, roughly 1/N of the total.
//!
//! The ring is never consulted on the request path. It is materialised into
//! a [`SlotTable`] over the 2^32 positions so ownership can be migrated span
//! by span like any other slot strategy.

use super::hash_key;
use super::slots::SlotTable;
use crate::types::{ShardId, SlotRange};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Number of ring positions.
pub const RING_POSITIONS: u64 = 1 << 32;

/// Virtual nodes per shard.
/// More vnodes give a more even spread at the cost of larger tables.
pub const DEFAULT_VNODES_PER_SHARD: u32 = 128;

/// Ring position of a key.
pub fn ring_position(key: &[u8]) -> u64 {
    hash_key(key) >> 32
}

/// A consistent hash ring of shard tokens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VnodeRing {
    vnodes_per_shard: u32,
    /// Token position -> owning shard.
    tokens: BTreeMap<u32, ShardId>,
    members: BTreeSet<ShardId>,
}

impl VnodeRing {
    /// Create an empty ring.
    pub fn new(vnodes_per_shard: u32) -> Self {
        Self {
            vnodes_per_shard: vnodes_per_shard.max(1),
            tokens: BTreeMap::new(),
            members: BTreeSet::new(),
        }
    }

    /// Create a ring containing `shards`.
    pub fn with_shards(vnodes_per_shard: u32, shards: &[ShardId]) -> Self {
        let mut ring = Self::new(vnodes_per_shard);
        for &shard in shards {
            ring.add_shard(shard);
        }
        ring
    }

    pub fn vnodes_per_shard(&self) -> u32 {
        self.vnodes_per_shard
    }

    pub fn members(&self) -> &BTreeSet<ShardId> {
        &self.members
    }

    pub fn contains(&self, shard: ShardId) -> bool {
        self.members.contains(&shard)
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Place the shard's virtual nodes on the ring.
    ///
    /// On a token collision the shard already holding the position keeps it.
    pub fn add_shard(&mut self, shard: ShardId) {
        if !self.members.insert(shard) {
            return;
        }
        for i in 0..self.vnodes_per_shard {
            let token = format!("shard-{}#{}", shard, i);
            let position = ring_position(token.as_bytes()) as u32;
            self.tokens.entry(position).or_insert(shard);
        }
    }

    /// Remove the shard's virtual nodes.
    pub fn remove_shard(&mut self, shard: ShardId) {
        if self.members.remove(&shard) {
            self.tokens.retain(|_, owner| *owner != shard);
        }
    }

    /// Shard owning a ring position.
    pub fn owner_at(&self, position: u64) -> Option<ShardId> {
        let position = position.min(RING_POSITIONS - 1) as u32;
        self.tokens
            .range(position..)
            .next()
            .or_else(|| self.tokens.iter().next())
            .map(|(_, &shard)| shard)
    }

    /// Shard owning a key.
    pub fn owner_of(&self, key: &[u8]) -> Option<ShardId> {
        self.owner_at(ring_position(key))
    }

    /// Materialise the ring as a slot table over all 2^32 positions.
    ///
    /// Token `t_i` owns `[t_{i-1} + 1, t_i + 1)`; the wrap-around tail above
    /// the last token belongs to the first token's shard.
    pub fn to_table(&self) -> SlotTable {
        let Some((&first, &first_owner)) = self.tokens.iter().next() else {
            return SlotTable::empty(RING_POSITIONS);
        };
        let mut ranges = Vec::with_capacity(self.tokens.len() + 1);
        ranges.push((SlotRange::new(0, u64::from(first) + 1), first_owner));
        let mut prev = u64::from(first) + 1;
        for (&token, &owner) in self.tokens.iter().skip(1) {
            let end = u64::from(token) + 1;
            ranges.push((SlotRange::new(prev, end), owner));
            prev = end;
        }
        if prev < RING_POSITIONS {
            ranges.push((SlotRange::new(prev, RING_POSITIONS), first_owner));
        }
        SlotTable::from_ranges(RING_POSITIONS, ranges)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_add_remove_shards() {
        let mut ring = VnodeRing::new(16);
        ring.add_shard(1);
        ring.add_shard(2);
        assert!(ring.contains(1));
        assert_eq!(ring.members().len(), 2);

        ring.add_shard(1);
        assert_eq!(ring.members().len(), 2);

        ring.remove_shard(1);
        assert!(!ring.contains(1));
        assert!(ring.owner_of(b"key").is_some());
        ring.remove_shard(2);
        assert!(ring.owner_of(b"key").is_none());
    }

    #[test]
    fn test_table_agrees_with_ring_walk() {
        let ring = VnodeRing::with_shards(32, &[0, 1, 2]);
        let table = ring.to_table();
        table.validate().unwrap();

        for i in 0..2000 {
            let key = format!("key-{}", i);
            let position = ring_position(key.as_bytes());
            let by_ring = ring.owner_of(key.as_bytes()).unwrap();
            let by_table = table.owner_of(position).unwrap().1;
            assert_eq!(by_ring, by_table, "disagreement for {}", key);
        }
    }

    #[test]
    fn test_distribution_is_roughly_even() {
        let ring = VnodeRing::with_shards(DEFAULT_VNODES_PER_SHARD, &[0, 1, 2, 3]);
        let mut counts: HashMap<ShardId, usize> = HashMap::new();
        for i in 0..20_000 {
            let key = format!("user:{}", i);
            *counts.entry(ring.owner_of(key.as_bytes()).unwrap()).or_default() += 1;
        }
        assert_eq!(counts.len(), 4);
        for count in counts.values() {
            assert!(*count > 3000 && *count < 7000, "skewed count {}", count);
        }
    }

    #[test]
    fn test_adding_shard_moves_keys_only_to_new_shard() {
        let before = VnodeRing::with_shards(64, &[0, 1, 2]);
        let mut after = before.clone();
        after.add_shard(3);

        let mut moved = 0;
        for i in 0..5000 {
            let key = format!("k{}", i);
            let a = before.owner_of(key.as_bytes()).unwrap();
            let b = after.owner_of(key.as_bytes()).unwrap();
            if a != b {
                assert_eq!(b, 3);
                moved += 1;
            }
        }
        assert!(moved > 0 && moved < 5000 / 4 + 500, "moved {}", moved);
    }
}
