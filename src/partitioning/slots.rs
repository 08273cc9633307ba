//! Slot ownership tables.
//!
//! A [`SlotTable`] maps every slot of a fixed-size ring to exactly one shard.
//! It stores maximal runs of consecutive slots owned by the same shard, keyed
//! by their start slot, so lookups are a single ordered-map probe.

use crate::error::{Error, Result};
use crate::types::{ShardId, SlotRange};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Default number of slots for the hash strategy.
pub const DEFAULT_RING_SIZE: u64 = 16384;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct SlotRun {
    end: u64,
    shard: ShardId,
}

/// Sorted slot-range table: `[start, end) -> shard`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotTable {
    ring_size: u64,
    runs: BTreeMap<u64, SlotRun>,
}

impl SlotTable {
    /// Create a table that owns nothing.
    pub fn empty(ring_size: u64) -> Self {
        Self {
            ring_size,
            runs: BTreeMap::new(),
        }
    }

    /// Split the ring into contiguous, near-equal chunks, one per shard.
    pub fn uniform(ring_size: u64, shards: &[ShardId]) -> Self {
        let mut table = Self::empty(ring_size);
        if shards.is_empty() || ring_size == 0 {
            return table;
        }
        let n = shards.len() as u64;
        let base = ring_size / n;
        let extra = ring_size % n;
        let mut start = 0;
        for (i, &shard) in shards.iter().enumerate() {
            let len = base + u64::from((i as u64) < extra);
            if len == 0 {
                continue;
            }
            table.runs.insert(start, SlotRun { end: start + len, shard });
            start += len;
        }
        table.coalesce();
        table
    }

    /// Build a table from explicit `(range, shard)` assignments.
    pub fn from_ranges(ring_size: u64, ranges: impl IntoIterator<Item = (SlotRange, ShardId)>) -> Self {
        let mut table = Self::empty(ring_size);
        for (range, shard) in ranges {
            if !range.is_empty() {
                table.assign_range(range, shard);
            }
        }
        table.coalesce();
        table
    }

    pub fn ring_size(&self) -> u64 {
        self.ring_size
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    /// Number of stored runs.
    pub fn len(&self) -> usize {
        self.runs.len()
    }

    /// Owner of a slot, with the run that contains it.
    pub fn owner_of(&self, slot: u64) -> Option<(SlotRange, ShardId)> {
        self.runs
            .range(..=slot)
            .next_back()
            .filter(|(_, run)| slot < run.end)
            .map(|(&start, run)| (SlotRange::new(start, run.end), run.shard))
    }

    /// All runs in slot order.
    pub fn ranges(&self) -> impl Iterator<Item = (SlotRange, ShardId)> + '_ {
        self.runs
            .iter()
            .map(|(&start, run)| (SlotRange::new(start, run.end), run.shard))
    }

    /// Runs owned by one shard.
    pub fn ranges_of(&self, shard: ShardId) -> Vec<SlotRange> {
        self.ranges()
            .filter(|(_, owner)| *owner == shard)
            .map(|(range, _)| range)
            .collect()
    }

    /// Number of slots owned per shard.
    pub fn slot_counts(&self) -> BTreeMap<ShardId, u64> {
        let mut counts = BTreeMap::new();
        for (range, shard) in self.ranges() {
            *counts.entry(shard).or_insert(0) += range.len();
        }
        counts
    }

    /// Whether `shard` owns every slot in `ranges`.
    pub fn owns_all(&self, shard: ShardId, ranges: &[SlotRange]) -> bool {
        ranges.iter().all(|range| {
            let mut pos = range.start;
            while pos < range.end {
                match self.owner_of(pos) {
                    Some((run, owner)) if owner == shard => pos = run.end,
                    _ => return false,
                }
            }
            true
        })
    }

    /// Hand `ranges` to `shard`.
    pub fn assign(&mut self, ranges: &[SlotRange], shard: ShardId) {
        for range in ranges {
            if !range.is_empty() {
                self.assign_range(*range, shard);
            }
        }
        self.coalesce();
    }

    fn assign_range(&mut self, range: SlotRange, shard: ShardId) {
        let end = range.end.min(self.ring_size);
        if range.start >= end {
            return;
        }
        self.split_at(range.start);
        self.split_at(end);
        let covered: Vec<u64> = self.runs.range(range.start..end).map(|(&s, _)| s).collect();
        for start in covered {
            self.runs.remove(&start);
        }
        self.runs.insert(range.start, SlotRun { end, shard });
    }

    fn split_at(&mut self, at: u64) {
        if let Some((&start, &run)) = self.runs.range(..at).next_back() {
            if at < run.end {
                self.runs.insert(start, SlotRun { end: at, shard: run.shard });
                self.runs.insert(at, SlotRun { end: run.end, shard: run.shard });
            }
        }
    }

    fn coalesce(&mut self) {
        let mut merged: BTreeMap<u64, SlotRun> = BTreeMap::new();
        let mut current: Option<(u64, SlotRun)> = None;
        for (&start, &run) in &self.runs {
            current = match current {
                Some((cs, cr)) if cr.end == start && cr.shard == run.shard => {
                    Some((cs, SlotRun { end: run.end, shard: cr.shard }))
                }
                Some((cs, cr)) => {
                    merged.insert(cs, cr);
                    Some((start, run))
                }
                None => Some((start, run)),
            };
        }
        if let Some((cs, cr)) = current {
            merged.insert(cs, cr);
        }
        self.runs = merged;
    }

    /// Check the table covers `[0, ring_size)` with no gaps or overlaps.
    pub fn validate(&self) -> Result<()> {
        let mut expected = 0;
        for (&start, run) in &self.runs {
            if start != expected {
                return Err(Error::InvalidTopology(format!(
                    "slot coverage gap or overlap at slot {} (expected {})",
                    start, expected
                )));
            }
            if run.end <= start {
                return Err(Error::InvalidTopology(format!("empty slot run at {}", start)));
            }
            expected = run.end;
        }
        if expected != self.ring_size {
            return Err(Error::InvalidTopology(format!(
                "slot coverage ends at {} but ring has {} slots",
                expected, self.ring_size
            )));
        }
        Ok(())
    }

    /// Slot ranges whose owner differs between `self` and `target`.
    ///
    /// Returns `(range, current_owner, target_owner)` with adjacent ranges of
    /// the same move merged.
    pub fn diff(&self, target: &SlotTable) -> Vec<(SlotRange, ShardId, ShardId)> {
        let mut bounds: Vec<u64> = self
            .runs
            .iter()
            .flat_map(|(&s, r)| [s, r.end])
            .chain(target.runs.iter().flat_map(|(&s, r)| [s, r.end]))
            .collect();
        bounds.sort_unstable();
        bounds.dedup();

        let mut moves: Vec<(SlotRange, ShardId, ShardId)> = Vec::new();
        for pair in bounds.windows(2) {
            let (start, end) = (pair[0], pair[1]);
            let (Some((_, from)), Some((_, to))) = (self.owner_of(start), target.owner_of(start)) else {
                continue;
            };
            if from == to {
                continue;
            }
            match moves.last_mut() {
                Some((range, f, t)) if range.end == start && *f == from && *t == to => range.end = end,
                _ => moves.push((SlotRange::new(start, end), from, to)),
            }
        }
        moves
    }

    /// Target table giving each of `shards` an even share with minimal movement.
    ///
    /// Every shard keeps up to its quota of the slots it already owns; the
    /// surplus, plus everything owned by shards not in `shards`, is handed to
    /// shards below quota in ascending id order.
    pub fn rebalanced(&self, shards: &[ShardId]) -> SlotTable {
        let mut members: Vec<ShardId> = shards.to_vec();
        members.sort_unstable();
        members.dedup();
        if members.is_empty() || self.ring_size == 0 {
            return SlotTable::empty(self.ring_size);
        }
        if self.is_empty() {
            return SlotTable::uniform(self.ring_size, &members);
        }

        let n = members.len() as u64;
        let base = self.ring_size / n;
        let extra = self.ring_size % n;
        let quota: BTreeMap<ShardId, u64> = members
            .iter()
            .enumerate()
            .map(|(i, &s)| (s, base + u64::from((i as u64) < extra)))
            .collect();

        let mut kept: BTreeMap<ShardId, u64> = BTreeMap::new();
        let mut assignments: Vec<(SlotRange, ShardId)> = Vec::new();
        let mut free: Vec<SlotRange> = Vec::new();

        for (range, owner) in self.ranges() {
            match quota.get(&owner) {
                Some(&q) => {
                    let have = kept.entry(owner).or_insert(0);
                    let keep = (q - *have).min(range.len());
                    if keep > 0 {
                        assignments.push((SlotRange::new(range.start, range.start + keep), owner));
                        *have += keep;
                    }
                    if keep < range.len() {
                        free.push(SlotRange::new(range.start + keep, range.end));
                    }
                }
                None => free.push(range),
            }
        }

        let mut free = free.into_iter();
        let mut pending = free.next();
        for &shard in &members {
            let mut deficit = quota[&shard] - kept.get(&shard).copied().unwrap_or(0);
            while deficit > 0 {
                let Some(range) = pending else { break };
                let take = deficit.min(range.len());
                assignments.push((SlotRange::new(range.start, range.start + take), shard));
                deficit -= take;
                pending = if take < range.len() {
                    Some(SlotRange::new(range.start + take, range.end))
                } else {
                    free.next()
                };
            }
        }

        SlotTable::from_ranges(self.ring_size, assignments)
    }
}

/// Take `count` slots from the tail of `ranges` (highest slots first).
pub fn take_slots(ranges: &[SlotRange], count: u64) -> Vec<SlotRange> {
    let mut taken = Vec::new();
    let mut remaining = count;
    for range in ranges.iter().rev() {
        if remaining == 0 {
            break;
        }
        let take = remaining.min(range.len());
        taken.push(SlotRange::new(range.end - take, range.end));
        remaining -= take;
    }
    taken.reverse();
    taken
}
