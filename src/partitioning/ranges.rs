//! Ordered key-range ownership for the range strategy.
//!
//! Ranges are half-open `[start, end)` and keyed by their start, so a lookup
//! is a reverse range probe for the greatest start `<= key`. A key equal to a
//! boundary belongs to the range that starts there.
//!
//! Monotonically increasing keys (timestamps, sequence numbers) all land in
//! the last range. Skew detection will split it, but the hotspot is inherent
//! to the strategy.

use crate::error::{Error, Result};
use crate::types::{KeyRange, ShardId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::Bound;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct RangeEntry {
    end: Option<Vec<u8>>,
    shard: ShardId,
}

/// Sorted key-range table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeTable {
    entries: BTreeMap<Vec<u8>, RangeEntry>,
}

impl RangeTable {
    /// One shard owns the whole keyspace.
    pub fn single(shard: ShardId) -> Self {
        let mut entries = BTreeMap::new();
        entries.insert(Vec::new(), RangeEntry { end: None, shard });
        Self { entries }
    }

    /// Split the keyspace at `boundaries`, assigning ranges to `shards` in order.
    ///
    /// With fewer boundaries than `shards.len() - 1`, trailing shards own
    /// nothing; extra boundaries are ignored.
    pub fn with_boundaries(shards: &[ShardId], boundaries: &[Vec<u8>]) -> Result<Self> {
        let Some(&first) = shards.first() else {
            return Err(Error::NoShardsAvailable);
        };
        let mut sorted = boundaries.to_vec();
        sorted.sort();
        sorted.dedup();
        sorted.retain(|b| !b.is_empty());

        let mut table = Self::single(first);
        for (boundary, &shard) in sorted.iter().zip(shards.iter().skip(1)) {
            table.assign(&KeyRange::starting_at(boundary.clone()), shard);
        }
        Ok(table)
    }

    /// Owner of `key`, with its range.
    pub fn owner_of(&self, key: &[u8]) -> Option<(KeyRange, ShardId)> {
        self.entries
            .range::<[u8], _>((Bound::Unbounded, Bound::Included(key)))
            .next_back()
            .filter(|(_, entry)| match &entry.end {
                Some(end) => key < end.as_slice(),
                None => true,
            })
            .map(|(start, entry)| {
                (
                    KeyRange {
                        start: start.clone(),
                        end: entry.end.clone(),
                    },
                    entry.shard,
                )
            })
    }

    /// All ranges in key order.
    pub fn ranges(&self) -> impl Iterator<Item = (KeyRange, ShardId)> + '_ {
        self.entries.iter().map(|(start, entry)| {
            (
                KeyRange {
                    start: start.clone(),
                    end: entry.end.clone(),
                },
                entry.shard,
            )
        })
    }

    pub fn ranges_of(&self, shard: ShardId) -> Vec<KeyRange> {
        self.ranges()
            .filter(|(_, owner)| *owner == shard)
            .map(|(range, _)| range)
            .collect()
    }

    /// Shards whose ranges intersect `range`.
    pub fn owners_overlapping(&self, range: &KeyRange) -> Vec<ShardId> {
        let mut owners: Vec<ShardId> = self
            .ranges()
            .filter(|(r, _)| r.overlaps(range))
            .map(|(_, shard)| shard)
            .collect();
        owners.sort_unstable();
        owners.dedup();
        owners
    }

    /// Whether `shard` owns every key of `range`.
    pub fn owns_all(&self, shard: ShardId, range: &KeyRange) -> bool {
        let mut pos = range.start.clone();
        loop {
            match self.owner_of(&pos) {
                Some((owned, owner)) if owner == shard => match (owned.end, &range.end) {
                    (None, _) => return true,
                    (Some(end), Some(want)) if &end >= want => return true,
                    (Some(end), _) => pos = end,
                },
                _ => return false,
            }
        }
    }

    /// Hand `range` to `shard`.
    pub fn assign(&mut self, range: &KeyRange, shard: ShardId) {
        self.split_at(&range.start);
        if let Some(end) = &range.end {
            self.split_at(end);
        }
        let covered: Vec<Vec<u8>> = self
            .entries
            .keys()
            .filter(|start| range.contains(start))
            .cloned()
            .collect();
        for start in covered {
            self.entries.remove(&start);
        }
        self.entries.insert(
            range.start.clone(),
            RangeEntry {
                end: range.end.clone(),
                shard,
            },
        );
        self.coalesce();
    }

    fn split_at(&mut self, at: &[u8]) {
        let Some((start, entry)) = self.entries.range::<[u8], _>((Bound::Unbounded, Bound::Excluded(at))).next_back() else {
            return;
        };
        let inside = match &entry.end {
            Some(end) => at < end.as_slice(),
            None => true,
        };
        if inside {
            let (start, entry) = (start.clone(), entry.clone());
            self.entries.insert(
                start,
                RangeEntry {
                    end: Some(at.to_vec()),
                    shard: entry.shard,
                },
            );
            self.entries.insert(at.to_vec(), entry);
        }
    }

    fn coalesce(&mut self) {
        let mut merged: BTreeMap<Vec<u8>, RangeEntry> = BTreeMap::new();
        let mut current: Option<(Vec<u8>, RangeEntry)> = None;
        for (start, entry) in std::mem::take(&mut self.entries) {
            current = match current {
                Some((cs, ce)) if ce.end.as_deref() == Some(start.as_slice()) && ce.shard == entry.shard => {
                    Some((cs, RangeEntry { end: entry.end, shard: ce.shard }))
                }
                Some((cs, ce)) => {
                    merged.insert(cs, ce);
                    Some((start, entry))
                }
                None => Some((start, entry)),
            };
        }
        if let Some((cs, ce)) = current {
            merged.insert(cs, ce);
        }
        self.entries = merged;
    }

    /// Check the ranges cover the whole keyspace contiguously.
    pub fn validate(&self) -> Result<()> {
        let mut expected: Option<Vec<u8>> = Some(Vec::new());
        for (start, entry) in &self.entries {
            match &expected {
                Some(want) if want == start => {}
                Some(want) => {
                    return Err(Error::InvalidTopology(format!(
                        "range coverage breaks at {} (expected {})",
                        KeyRange::starting_at(start.clone()),
                        KeyRange::starting_at(want.clone())
                    )))
                }
                None => {
                    return Err(Error::InvalidTopology(
                        "range follows an unbounded range".to_string(),
                    ))
                }
            }
            if let Some(end) = &entry.end {
                if end <= start {
                    return Err(Error::InvalidTopology("empty key range".to_string()));
                }
            }
            expected = entry.end.clone();
        }
        if expected.is_some() {
            return Err(Error::InvalidTopology(
                "key ranges do not extend to the end of the keyspace".to_string(),
            ));
        }
        Ok(())
    }
}
