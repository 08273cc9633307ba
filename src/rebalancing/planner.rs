//! Migration planning.
//!
//! Turns a membership change, a skew report or a strategy switch into
//! migration tasks for the current placement. Planning never changes the
//! topology; each task's cutover does.
//!
//! | placement        | join                          | leave                          |
//! |------------------|-------------------------------|--------------------------------|
//! | hash / composite | even-share table, diff        | even-share table without it    |
//! | consistent hash  | ring with it, moves onto it   | ring without it, moves off it  |
//! | range            | split largest range at median | merge into adjacent owner      |
//! | directory        | nothing                       | tags and default to least load |
//! | modulo           | reshard                       | reshard                        |

use super::task::{MigrationReason, MigrationTask};
use super::backend_call;
use crate::backend::BackendRegistry;
use crate::error::{Error, Result};
use crate::partitioning::{take_slots, Directory, Placement, RangeTable, SlotTable, StrategyKind};
use crate::topology::Topology;
use crate::types::{KeyRange, ShardId, ShardState, SlotRange, Span};
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Per-shard load used to pick targets and detect skew.
pub type ShardLoads = BTreeMap<ShardId, u64>;

#[derive(Debug, Clone)]
pub struct Planner {
    registry: Arc<BackendRegistry>,
    call_timeout: Duration,
    page_size: usize,
}

impl Planner {
    pub fn new(registry: Arc<BackendRegistry>, call_timeout: Duration, page_size: usize) -> Self {
        Self {
            registry,
            call_timeout,
            page_size,
        }
    }

    /// Tasks handing `shard` its share after it joined.
    pub async fn plan_join(&self, topology: &Topology, shard: ShardId) -> Result<Vec<MigrationTask>> {
        let placement = placement_of(topology)?;
        let reason = MigrationReason::AddShard;
        let tasks = match placement {
            Placement::Hash { table } | Placement::Composite { fallback: table, .. } => {
                let target = table.rebalanced(&receivers(topology, None));
                group_moves(topology, table.diff(&target), reason)
            }
            Placement::ConsistentHash { ring, table } => {
                let mut ring = ring.clone();
                ring.add_shard(shard);
                let moves = table
                    .diff(&ring.to_table())
                    .into_iter()
                    .filter(|(_, _, to)| *to == shard)
                    .collect();
                group_moves(topology, moves, reason)
            }
            Placement::Range { table } => self.split_largest(topology, table, None, shard, reason).await?,
            Placement::Directory(_) => Vec::new(),
            Placement::Modulo { shards } => {
                let mut members = shards.clone();
                members.push(shard);
                vec![MigrationTask::reshard(
                    Placement::build(&StrategyKind::Modulo, &members)?,
                    reason,
                )]
            }
        };
        debug!(shard, tasks = tasks.len(), placement = placement.name(), "Planned join");
        Ok(tasks)
    }

    /// Tasks moving everything `shard` owns elsewhere.
    pub async fn plan_leave(&self, topology: &Topology, shard: ShardId, loads: &ShardLoads) -> Result<Vec<MigrationTask>> {
        let placement = placement_of(topology)?;
        let remaining = receivers(topology, Some(shard));
        if remaining.is_empty() {
            return Err(Error::InvalidMutation(format!(
                "shard {} is the last shard able to own data",
                shard
            )));
        }
        let reason = MigrationReason::RemoveShard;
        let tasks = match placement {
            Placement::Hash { table } => {
                let moves = moves_off(table, &table.rebalanced(&remaining), shard);
                group_moves(topology, moves, reason)
            }
            Placement::Composite { directory, fallback } => {
                let moves = moves_off(fallback, &fallback.rebalanced(&remaining), shard);
                let mut tasks = group_moves(topology, moves, reason);
                tasks.extend(drain_directory(directory, shard, &remaining, loads, false, reason));
                tasks
            }
            Placement::ConsistentHash { ring, table } => {
                let mut ring = ring.clone();
                ring.remove_shard(shard);
                let moves = moves_off(table, &ring.to_table(), shard);
                group_moves(topology, moves, reason)
            }
            Placement::Range { table } => merge_ranges(table, shard, &remaining, loads, reason),
            Placement::Directory(directory) => drain_directory(directory, shard, &remaining, loads, true, reason),
            Placement::Modulo { shards } => {
                let members: Vec<ShardId> = shards.iter().copied().filter(|&s| s != shard).collect();
                vec![MigrationTask::reshard(
                    Placement::build(&StrategyKind::Modulo, &members)?,
                    reason,
                )]
            }
        };
        debug!(shard, tasks = tasks.len(), placement = placement.name(), "Planned leave");
        Ok(tasks)
    }

    /// Tasks relieving the hottest shard when its load exceeds `factor` times
    /// the mean. Returns nothing when the load is balanced.
    pub async fn plan_skew(&self, topology: &Topology, loads: &ShardLoads, factor: f64) -> Result<Vec<MigrationTask>> {
        let placement = placement_of(topology)?;
        let candidates = receivers(topology, None);
        if candidates.len() < 2 {
            return Ok(Vec::new());
        }
        let load_of = |s: &ShardId| loads.get(s).copied().unwrap_or(0);
        let total: u64 = candidates.iter().map(load_of).sum();
        if total == 0 {
            return Ok(Vec::new());
        }
        let mean = total as f64 / candidates.len() as f64;
        let (Some(&hot), Some(&cold)) = (
            candidates.iter().max_by_key(|s| (load_of(s), std::cmp::Reverse(**s))),
            candidates.iter().min_by_key(|s| (load_of(s), **s)),
        ) else {
            return Ok(Vec::new());
        };
        let hot_load = load_of(&hot) as f64;
        if hot == cold || hot_load <= factor * mean {
            return Ok(Vec::new());
        }
        let excess = (hot_load - mean) / hot_load;
        debug!(hot, cold, hot_load, mean, "Shard load skewed");

        let reason = MigrationReason::Skew;
        let tasks = match placement {
            Placement::Hash { table } | Placement::Composite { fallback: table, .. } | Placement::ConsistentHash { table, .. } => {
                let owned = table.ranges_of(hot);
                let owned_slots: u64 = owned.iter().map(SlotRange::len).sum();
                if owned_slots < 2 {
                    Vec::new()
                } else {
                    let count = ((owned_slots as f64 * excess) as u64).clamp(1, owned_slots - 1);
                    vec![MigrationTask::moving(
                        Span::Slots(take_slots(&owned, count)),
                        hot,
                        cold,
                        reason,
                    )]
                }
            }
            Placement::Range { table } => self.split_largest(topology, table, Some(hot), cold, reason).await?,
            Placement::Directory(_) | Placement::Modulo { .. } => Vec::new(),
        };
        Ok(tasks)
    }

    /// A single reshard task switching to `kind`.
    pub fn plan_restrategy(&self, topology: &Topology, kind: &StrategyKind) -> Result<Vec<MigrationTask>> {
        let members = receivers(topology, None);
        let target = Placement::build(kind, &members)?;
        if topology.placement.as_ref() == Some(&target) {
            return Ok(Vec::new());
        }
        Ok(vec![MigrationTask::reshard(target, MigrationReason::Restrategy)])
    }

    /// Split the most populated range (of `owner`, when given) at its median
    /// key and move the upper half to `dest`.
    async fn split_largest(
        &self,
        topology: &Topology,
        table: &RangeTable,
        owner: Option<ShardId>,
        dest: ShardId,
        reason: MigrationReason,
    ) -> Result<Vec<MigrationTask>> {
        let mut largest: Option<(KeyRange, ShardId, u64)> = None;
        for (range, shard) in table.ranges() {
            if shard == dest || owner.is_some_and(|o| o != shard) {
                continue;
            }
            if !topology.state_of(shard).is_some_and(|s| s.is_routable()) {
                continue;
            }
            let backend = self.registry.get(shard)?;
            let count = backend_call(self.call_timeout, backend.count_range(&range)).await?;
            if largest.as_ref().map_or(true, |(_, _, c)| count > *c) {
                largest = Some((range, shard, count));
            }
        }
        let Some((range, source, count)) = largest else {
            return Ok(Vec::new());
        };
        if count < 2 {
            debug!(source, %range, count, "Largest range too small to split");
            return Ok(Vec::new());
        }

        let median = self.key_at(source, &range, count / 2).await?;
        let upper = KeyRange {
            start: median.to_vec(),
            end: range.end.clone(),
        };
        Ok(vec![MigrationTask::moving(Span::Keys(upper), source, dest, reason)])
    }

    /// The `index`-th key of `range` on `shard`.
    async fn key_at(&self, shard: ShardId, range: &KeyRange, index: u64) -> Result<Bytes> {
        let backend = self.registry.get(shard)?;
        let mut seen = 0u64;
        let mut cursor: Option<Bytes> = None;
        loop {
            let page = backend_call(
                self.call_timeout,
                backend.scan_range(range, cursor.as_deref(), self.page_size),
            )
            .await?;
            let len = page.entries.len() as u64;
            if index < seen + len {
                return Ok(page.entries[(index - seen) as usize].0.clone());
            }
            seen += len;
            match page.next {
                Some(next) => cursor = Some(next),
                None => {
                    return Err(Error::Internal(format!(
                        "range {} shrank below {} keys while planning",
                        range, index
                    )))
                }
            }
        }
    }
}

fn placement_of(topology: &Topology) -> Result<&Placement> {
    topology.placement.as_ref().ok_or(Error::NoShardsAvailable)
}

/// Shards that may receive spans, excluding `leaving`.
fn receivers(topology: &Topology, leaving: Option<ShardId>) -> Vec<ShardId> {
    topology
        .shards_in(&[ShardState::Joining, ShardState::Active])
        .into_iter()
        .filter(|&s| Some(s) != leaving)
        .collect()
}

fn moves_off(current: &SlotTable, target: &SlotTable, shard: ShardId) -> Vec<(SlotRange, ShardId, ShardId)> {
    current
        .diff(target)
        .into_iter()
        .filter(|(_, from, _)| *from == shard)
        .collect()
}

/// One task per `(source, dest)` pair. Moves off a `Down` shard are skipped
/// since there is nothing to copy from.
fn group_moves(
    topology: &Topology,
    moves: Vec<(SlotRange, ShardId, ShardId)>,
    reason: MigrationReason,
) -> Vec<MigrationTask> {
    let mut grouped: BTreeMap<(ShardId, ShardId), Vec<SlotRange>> = BTreeMap::new();
    for (range, from, to) in moves {
        if topology.state_of(from) == Some(ShardState::Down) {
            warn!(from, to, %range, "Skipping move off a down shard");
            continue;
        }
        grouped.entry((from, to)).or_default().push(range);
    }
    grouped
        .into_iter()
        .map(|((from, to), ranges)| MigrationTask::moving(Span::Slots(ranges), from, to, reason))
        .collect()
}

/// Least loaded shard among `candidates`, lowest id on ties.
fn least_loaded(candidates: &[ShardId], loads: &ShardLoads) -> Option<ShardId> {
    candidates
        .iter()
        .copied()
        .min_by_key(|s| (loads.get(s).copied().unwrap_or(0), *s))
}

/// Move the tags (and default, when `with_default`) of `shard` to the least
/// loaded of `remaining`, spreading them as they are assigned.
fn drain_directory(
    directory: &Directory,
    shard: ShardId,
    remaining: &[ShardId],
    loads: &ShardLoads,
    with_default: bool,
    reason: MigrationReason,
) -> Vec<MigrationTask> {
    let mut loads = loads.clone();
    let mut spans: Vec<Span> = directory.tags_of(shard).into_iter().map(Span::Tag).collect();
    if with_default && directory.default_shard() == shard {
        spans.push(Span::DirectoryDefault);
    }
    let mut tasks = Vec::new();
    for span in spans {
        let Some(dest) = least_loaded(remaining, &loads) else { break };
        *loads.entry(dest).or_insert(0) += 1;
        tasks.push(MigrationTask::moving(span, shard, dest, reason));
    }
    tasks
}

/// Hand each range of `shard` to the owner of the range before it, or after
/// it for the first range.
fn merge_ranges(
    table: &RangeTable,
    shard: ShardId,
    remaining: &[ShardId],
    loads: &ShardLoads,
    reason: MigrationReason,
) -> Vec<MigrationTask> {
    let ranges: Vec<(KeyRange, ShardId)> = table.ranges().collect();
    let mut tasks = Vec::new();
    for (i, (range, owner)) in ranges.iter().enumerate() {
        if *owner != shard {
            continue;
        }
        let previous = i.checked_sub(1).map(|p| ranges[p].1);
        let next = ranges.get(i + 1).map(|(_, s)| *s);
        let dest = [previous, next]
            .into_iter()
            .flatten()
            .find(|s| remaining.contains(s))
            .or_else(|| least_loaded(remaining, loads));
        if let Some(dest) = dest {
            tasks.push(MigrationTask::moving(Span::Keys(range.clone()), shard, dest, reason));
        }
    }
    tasks
}
