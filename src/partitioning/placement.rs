//! Placement strategies.
//!
//! A [`Placement`] is the strategy descriptor together with its ownership
//! table. It is chosen once per topology; switching strategies is an
//! explicit re-strategy migration that replaces the whole placement.

use super::directory::{Directory, DEFAULT_TAG_DELIMITER};
use super::hashring::{ring_position, VnodeRing, DEFAULT_VNODES_PER_SHARD, RING_POSITIONS};
use super::ranges::RangeTable;
use super::slots::{SlotTable, DEFAULT_RING_SIZE};
use super::hash_key;
use crate::error::{Error, Result};
use crate::types::{KeyRange, ShardId, SlotRange, Span};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Strategy selector used to build a placement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StrategyKind {
    /// `xxhash64(key) mod ring_size` into a slot table.
    Hash { ring_size: u64 },
    /// Virtual-node ring over 2^32 positions.
    ConsistentHash { vnodes: u32 },
    /// `xxhash64(key) mod num_shards` into the ordered shard list.
    Modulo,
    /// Sorted key ranges split at `boundaries`.
    Range { boundaries: Vec<Vec<u8>> },
    /// Explicit tag table with a default shard.
    Directory { delimiter: u8 },
    /// Directory entries first, hash slots for everything else.
    Composite { delimiter: u8, ring_size: u64 },
}

impl StrategyKind {
    pub fn hash() -> Self {
        StrategyKind::Hash {
            ring_size: DEFAULT_RING_SIZE,
        }
    }

    pub fn consistent_hash() -> Self {
        StrategyKind::ConsistentHash {
            vnodes: DEFAULT_VNODES_PER_SHARD,
        }
    }

    pub fn range() -> Self {
        StrategyKind::Range {
            boundaries: Vec::new(),
        }
    }

    pub fn directory() -> Self {
        StrategyKind::Directory {
            delimiter: DEFAULT_TAG_DELIMITER,
        }
    }

    pub fn composite() -> Self {
        StrategyKind::Composite {
            delimiter: DEFAULT_TAG_DELIMITER,
            ring_size: DEFAULT_RING_SIZE,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            StrategyKind::Hash { .. } => "hash",
            StrategyKind::ConsistentHash { .. } => "consistent_hash",
            StrategyKind::Modulo => "modulo",
            StrategyKind::Range { .. } => "range",
            StrategyKind::Directory { .. } => "directory",
            StrategyKind::Composite { .. } => "composite",
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            StrategyKind::Hash { ring_size } | StrategyKind::Composite { ring_size, .. } => {
                if *ring_size == 0 {
                    return Err(Error::Config("ring_size must be > 0".to_string()));
                }
            }
            StrategyKind::ConsistentHash { vnodes } => {
                if *vnodes == 0 {
                    return Err(Error::Config("vnodes must be > 0".to_string()));
                }
            }
            _ => {}
        }
        Ok(())
    }
}

impl Default for StrategyKind {
    fn default() -> Self {
        Self::consistent_hash()
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Strategy descriptor plus ownership table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Placement {
    Hash {
        table: SlotTable,
    },
    ConsistentHash {
        /// Ring membership, used for planning.
        ring: VnodeRing,
        /// Authoritative ownership, materialised from the ring and then
        /// moved span by span.
        table: SlotTable,
    },
    Modulo {
        /// Sorted shard list; a key's index is `hash % len`.
        shards: Vec<ShardId>,
    },
    Range {
        table: RangeTable,
    },
    Directory(Directory),
    Composite {
        directory: Directory,
        fallback: SlotTable,
    },
}

impl Placement {
    /// Build a fresh placement distributing ownership across `shards`.
    pub fn build(kind: &StrategyKind, shards: &[ShardId]) -> Result<Self> {
        kind.validate()?;
        let mut members = shards.to_vec();
        members.sort_unstable();
        members.dedup();
        let Some(&first) = members.first() else {
            return Err(Error::NoShardsAvailable);
        };
        Ok(match kind {
            StrategyKind::Hash { ring_size } => Placement::Hash {
                table: SlotTable::uniform(*ring_size, &members),
            },
            StrategyKind::ConsistentHash { vnodes } => {
                let ring = VnodeRing::with_shards(*vnodes, &members);
                let table = ring.to_table();
                Placement::ConsistentHash { ring, table }
            }
            StrategyKind::Modulo => Placement::Modulo { shards: members },
            StrategyKind::Range { boundaries } => Placement::Range {
                table: RangeTable::with_boundaries(&members, boundaries)?,
            },
            StrategyKind::Directory { delimiter } => Placement::Directory(Directory::new(*delimiter, first)),
            StrategyKind::Composite { delimiter, ring_size } => Placement::Composite {
                directory: Directory::new(*delimiter, first),
                fallback: SlotTable::uniform(*ring_size, &members),
            },
        })
    }

    /// Strategy this placement was built from.
    pub fn kind(&self) -> StrategyKind {
        match self {
            Placement::Hash { table } => StrategyKind::Hash {
                ring_size: table.ring_size(),
            },
            Placement::ConsistentHash { ring, .. } => StrategyKind::ConsistentHash {
                vnodes: ring.vnodes_per_shard(),
            },
            Placement::Modulo { .. } => StrategyKind::Modulo,
            Placement::Range { table } => StrategyKind::Range {
                boundaries: table.ranges().skip(1).map(|(r, _)| r.start).collect(),
            },
            Placement::Directory(dir) => StrategyKind::Directory {
                delimiter: dir.delimiter(),
            },
            Placement::Composite { directory, fallback } => StrategyKind::Composite {
                delimiter: directory.delimiter(),
                ring_size: fallback.ring_size(),
            },
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Placement::Hash { .. } => "hash",
            Placement::ConsistentHash { .. } => "consistent_hash",
            Placement::Modulo { .. } => "modulo",
            Placement::Range { .. } => "range",
            Placement::Directory(_) => "directory",
            Placement::Composite { .. } => "composite",
        }
    }

    /// Owning shard of a key and the span it falls in.
    pub fn locate(&self, key: &[u8]) -> Option<(ShardId, Span)> {
        match self {
            Placement::Hash { table } => {
                let slot = hash_key(key) % table.ring_size();
                table.owner_of(slot).map(|(run, shard)| (shard, Span::Slots(vec![run])))
            }
            Placement::ConsistentHash { table, .. } => table
                .owner_of(ring_position(key))
                .map(|(run, shard)| (shard, Span::Slots(vec![run]))),
            Placement::Modulo { shards } => {
                if shards.is_empty() {
                    return None;
                }
                let index = (hash_key(key) % shards.len() as u64) as usize;
                Some((shards[index], Span::All))
            }
            Placement::Range { table } => table.owner_of(key).map(|(range, shard)| (shard, Span::Keys(range))),
            Placement::Directory(dir) => Some(match dir.mapped_owner(key) {
                Some((tag, shard)) => (shard, Span::Tag(tag.to_string())),
                None => (dir.default_shard(), Span::DirectoryDefault),
            }),
            Placement::Composite { directory, fallback } => match directory.mapped_owner(key) {
                Some((tag, shard)) => Some((shard, Span::Tag(tag.to_string()))),
                None => {
                    let slot = hash_key(key) % fallback.ring_size();
                    fallback
                        .owner_of(slot)
                        .map(|(run, shard)| (shard, Span::Slots(vec![run])))
                }
            },
        }
    }

    /// Owning shard of a key.
    pub fn owner_of(&self, key: &[u8]) -> Option<ShardId> {
        self.locate(key).map(|(shard, _)| shard)
    }

    /// Slot of a key for slot-based placements.
    fn slot_of(&self, key: &[u8]) -> Option<u64> {
        match self {
            Placement::Hash { table } => Some(hash_key(key) % table.ring_size()),
            Placement::ConsistentHash { .. } => Some(ring_position(key)),
            Placement::Composite { directory, fallback } => {
                if directory.mapped_owner(key).is_some() {
                    None
                } else {
                    Some(hash_key(key) % fallback.ring_size())
                }
            }
            _ => None,
        }
    }

    fn directory(&self) -> Option<&Directory> {
        match self {
            Placement::Directory(dir) => Some(dir),
            Placement::Composite { directory, .. } => Some(directory),
            _ => None,
        }
    }

    /// Whether `key` belongs to `span` under this placement.
    pub fn span_contains(&self, span: &Span, key: &[u8]) -> bool {
        match span {
            Span::All => true,
            Span::Slots(ranges) => match self.slot_of(key) {
                Some(slot) => ranges.iter().any(|r| r.contains(slot)),
                None => false,
            },
            Span::Keys(range) => range.contains(key),
            Span::Tag(tag) => self
                .directory()
                .and_then(|dir| dir.tag_of(key))
                .is_some_and(|t| t == tag),
            Span::DirectoryDefault => match self {
                Placement::Directory(dir) => dir.mapped_owner(key).is_none(),
                _ => false,
            },
        }
    }

    /// Key interval a scan must cover to find every key of `span`.
    pub fn scan_bounds(&self, span: &Span) -> KeyRange {
        match (span, self.directory()) {
            (Span::Keys(range), _) => range.clone(),
            (Span::Tag(tag), Some(dir)) => dir.tag_bounds(tag),
            _ => KeyRange::full(),
        }
    }

    /// Whether `shard` owns the whole span.
    pub fn owns_all(&self, shard: ShardId, span: &Span) -> bool {
        match (self, span) {
            (_, Span::All) => self.shards().into_iter().eq([shard]),
            (Placement::Hash { table }, Span::Slots(ranges))
            | (Placement::ConsistentHash { table, .. }, Span::Slots(ranges))
            | (Placement::Composite { fallback: table, .. }, Span::Slots(ranges)) => {
                table.owns_all(shard, ranges)
            }
            (Placement::Range { table }, Span::Keys(range)) => table.owns_all(shard, range),
            (Placement::Directory(dir), Span::Tag(tag)) => dir.owner_of_tag(tag) == shard,
            // Unmapped tags of a composite placement are spread over the
            // fallback slots, so only mapped ones are owned as a whole.
            (Placement::Composite { directory, .. }, Span::Tag(tag)) => {
                directory.is_mapped(tag) && directory.owner_of_tag(tag) == shard
            }
            (Placement::Directory(dir), Span::DirectoryDefault) => dir.default_shard() == shard,
            _ => false,
        }
    }

    /// Move ownership of `span` from `from` to `to`.
    pub fn transfer(&mut self, span: &Span, from: ShardId, to: ShardId) -> Result<()> {
        if !self.owns_all(from, span) {
            return Err(Error::InvalidMutation(format!(
                "shard {} does not own all of {}",
                from, span
            )));
        }
        match (self, span) {
            (Placement::Hash { table }, Span::Slots(ranges))
            | (Placement::ConsistentHash { table, .. }, Span::Slots(ranges))
            | (Placement::Composite { fallback: table, .. }, Span::Slots(ranges)) => {
                table.assign(ranges, to);
            }
            (Placement::Range { table }, Span::Keys(range)) => table.assign(range, to),
            (Placement::Directory(dir), Span::Tag(tag)) | (Placement::Composite { directory: dir, .. }, Span::Tag(tag)) => {
                dir.assign(tag.clone(), to)
            }
            (Placement::Directory(dir), Span::DirectoryDefault) => dir.set_default(to),
            (placement, span) => {
                return Err(Error::InvalidMutation(format!(
                    "{} cannot be transferred under {} placement",
                    span,
                    placement.name()
                )))
            }
        }
        Ok(())
    }

    /// Map an unmapped tag directly to a shard.
    pub fn assign_tag(&mut self, tag: &str, shard: ShardId) -> Result<()> {
        let dir = match self {
            Placement::Directory(dir) => dir,
            Placement::Composite { directory, .. } => directory,
            other => {
                return Err(Error::InvalidMutation(format!(
                    "{} placement has no directory",
                    other.name()
                )))
            }
        };
        if dir.is_mapped(tag) {
            return Err(Error::InvalidMutation(format!(
                "tag {} is already mapped; reassign it with a migration",
                tag
            )));
        }
        dir.assign(tag.to_string(), shard);
        Ok(())
    }

    /// Register a new shard with strategies that track membership.
    ///
    /// Only the consistent-hash ring does; the shard owns nothing until a
    /// migration hands it spans.
    pub fn add_member(&mut self, shard: ShardId) {
        if let Placement::ConsistentHash { ring, .. } = self {
            ring.add_shard(shard);
        }
    }

    pub fn remove_member(&mut self, shard: ShardId) {
        if let Placement::ConsistentHash { ring, .. } = self {
            ring.remove_shard(shard);
        }
    }

    /// Shards that own at least one key.
    pub fn shards(&self) -> BTreeSet<ShardId> {
        match self {
            Placement::Hash { table } | Placement::ConsistentHash { table, .. } => {
                table.slot_counts().into_keys().collect()
            }
            Placement::Modulo { shards } => shards.iter().copied().collect(),
            Placement::Range { table } => table.ranges().map(|(_, s)| s).collect(),
            Placement::Directory(dir) => dir.shards(),
            Placement::Composite { directory, fallback } => {
                let mut shards: BTreeSet<ShardId> = directory.tags().values().copied().collect();
                shards.extend(fallback.slot_counts().into_keys());
                shards
            }
        }
    }

    /// Whether `shard` owns anything.
    pub fn references(&self, shard: ShardId) -> bool {
        self.shards().contains(&shard)
    }

    /// Spans currently owned by `shard`.
    pub fn owned_spans(&self, shard: ShardId) -> Vec<Span> {
        match self {
            Placement::Hash { table } | Placement::ConsistentHash { table, .. } => {
                let ranges = table.ranges_of(shard);
                if ranges.is_empty() {
                    Vec::new()
                } else {
                    vec![Span::Slots(ranges)]
                }
            }
            Placement::Modulo { shards } => {
                if shards.contains(&shard) {
                    vec![Span::All]
                } else {
                    Vec::new()
                }
            }
            Placement::Range { table } => table.ranges_of(shard).into_iter().map(Span::Keys).collect(),
            Placement::Directory(dir) => {
                let mut spans: Vec<Span> = dir.tags_of(shard).into_iter().map(Span::Tag).collect();
                if dir.default_shard() == shard {
                    spans.push(Span::DirectoryDefault);
                }
                spans
            }
            Placement::Composite { directory, fallback } => {
                let mut spans: Vec<Span> = directory.tags_of(shard).into_iter().map(Span::Tag).collect();
                let ranges = fallback.ranges_of(shard);
                if !ranges.is_empty() {
                    spans.push(Span::Slots(ranges));
                }
                spans
            }
        }
    }

    /// Check total, disjoint coverage of the keyspace.
    pub fn validate(&self) -> Result<()> {
        match self {
            Placement::Hash { table } | Placement::Composite { fallback: table, .. } => table.validate(),
            Placement::ConsistentHash { ring, table } => {
                if table.ring_size() != RING_POSITIONS {
                    return Err(Error::InvalidTopology(format!(
                        "consistent-hash table must span {} positions",
                        RING_POSITIONS
                    )));
                }
                if ring.is_empty() {
                    return Err(Error::InvalidTopology("consistent-hash ring is empty".to_string()));
                }
                table.validate()
            }
            Placement::Modulo { shards } => {
                if shards.is_empty() {
                    return Err(Error::InvalidTopology("modulo placement has no shards".to_string()));
                }
                if shards.windows(2).any(|w| w[0] >= w[1]) {
                    return Err(Error::InvalidTopology(
                        "modulo shard list must be sorted and unique".to_string(),
                    ));
                }
                Ok(())
            }
            Placement::Range { table } => table.validate(),
            Placement::Directory(_) => Ok(()),
        }
    }

    /// Slot table target for slot-based placements, if any.
    pub fn slot_table(&self) -> Option<&SlotTable> {
        match self {
            Placement::Hash { table } | Placement::ConsistentHash { table, .. } => Some(table),
            Placement::Composite { fallback, .. } => Some(fallback),
            _ => None,
        }
    }

    /// Shards whose keys may fall inside `range`.
    pub fn shards_for_range(&self, range: &KeyRange) -> Vec<ShardId> {
        match self {
            Placement::Range { table } => table.owners_overlapping(range),
            _ => self.shards().into_iter().collect(),
        }
    }
}

/// Slot span covering one whole run, handy in tests and planning.
pub fn slot_span(start: u64, end: u64) -> Span {
    Span::Slots(vec![SlotRange::new(start, end)])
}
