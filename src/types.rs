//! Core types used throughout the shard coordinator.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Shard identifier.
///
/// Allocated from the topology's monotonically increasing counter, so an id is
/// never reused for a different backend.
pub type ShardId = u32;

/// Identifier attached to every write so backends can drop duplicate retries.
pub type OperationId = Uuid;

/// Lifecycle state of a shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShardState {
    /// Added to the topology; spans are still migrating in.
    Joining,
    /// Fully serving.
    Active,
    /// Spans are migrating away ahead of removal.
    Draining,
    /// Failed health checks; operations are refused.
    Down,
}

impl ShardState {
    /// Whether the router may dispatch to a shard in this state.
    pub fn is_routable(&self) -> bool {
        !matches!(self, ShardState::Down)
    }

    /// Whether new spans may be placed on a shard in this state.
    pub fn accepts_new_spans(&self) -> bool {
        matches!(self, ShardState::Joining | ShardState::Active)
    }
}

impl fmt::Display for ShardState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShardState::Joining => write!(f, "joining"),
            ShardState::Active => write!(f, "active"),
            ShardState::Draining => write!(f, "draining"),
            ShardState::Down => write!(f, "down"),
        }
    }
}

/// A half-open byte-wise key interval `[start, end)`.
///
/// `end == None` means the range is unbounded above.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyRange {
    pub start: Vec<u8>,
    pub end: Option<Vec<u8>>,
}

impl KeyRange {
    /// Create a bounded range.
    pub fn new(start: impl Into<Vec<u8>>, end: impl Into<Vec<u8>>) -> Self {
        Self {
            start: start.into(),
            end: Some(end.into()),
        }
    }

    /// Create a range unbounded above.
    pub fn starting_at(start: impl Into<Vec<u8>>) -> Self {
        Self {
            start: start.into(),
            end: None,
        }
    }

    /// The whole keyspace.
    pub fn full() -> Self {
        Self {
            start: Vec::new(),
            end: None,
        }
    }

    /// Whether `key` falls in `[start, end)`.
    pub fn contains(&self, key: &[u8]) -> bool {
        key >= self.start.as_slice()
            && match &self.end {
                Some(end) => key < end.as_slice(),
                None => true,
            }
    }

    /// Whether the two ranges share at least one key.
    pub fn overlaps(&self, other: &KeyRange) -> bool {
        let self_before_other = match &self.end {
            Some(end) => end.as_slice() <= other.start.as_slice(),
            None => false,
        };
        let other_before_self = match &other.end {
            Some(end) => end.as_slice() <= self.start.as_slice(),
            None => false,
        };
        !self_before_other && !other_before_self
    }

    /// Whether `other` lies entirely inside this range.
    pub fn covers(&self, other: &KeyRange) -> bool {
        if other.start < self.start {
            return false;
        }
        match (&self.end, &other.end) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(a), Some(b)) => b <= a,
        }
    }

    /// Intersection of two ranges, if non-empty.
    pub fn intersect(&self, other: &KeyRange) -> Option<KeyRange> {
        let start = std::cmp::max(&self.start, &other.start).clone();
        let end = match (&self.end, &other.end) {
            (None, None) => None,
            (Some(a), None) | (None, Some(a)) => Some(a.clone()),
            (Some(a), Some(b)) => Some(std::cmp::min(a, b).clone()),
        };
        let range = KeyRange { start, end };
        match &range.end {
            Some(end) if end <= &range.start => None,
            _ => Some(range),
        }
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.end {
            Some(end) => write!(f, "[{}, {})", show_key(&self.start), show_key(end)),
            None => write!(f, "[{}, +inf)", show_key(&self.start)),
        }
    }
}

/// A half-open slot interval `[start, end)` on a hash ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SlotRange {
    pub start: u64,
    pub end: u64,
}

impl SlotRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    pub fn contains(&self, slot: u64) -> bool {
        slot >= self.start && slot < self.end
    }

    pub fn overlaps(&self, other: &SlotRange) -> bool {
        self.start < other.end && other.start < self.end
    }
}

impl fmt::Display for SlotRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// The unit of ownership and of migration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Span {
    /// Hash-slot intervals (hash, consistent hash, composite fallback).
    Slots(Vec<SlotRange>),
    /// A key interval (range strategy).
    Keys(KeyRange),
    /// One directory tag.
    Tag(String),
    /// Keys whose tag has no explicit directory entry.
    DirectoryDefault,
    /// The whole keyspace.
    All,
}

impl Span {
    /// Whether two spans can contain a common key.
    ///
    /// Spans of different kinds are treated as overlapping. A tag overlaps
    /// the directory default because an unmapped tag's keys fall under it.
    pub fn overlaps(&self, other: &Span) -> bool {
        match (self, other) {
            (Span::All, _) | (_, Span::All) => true,
            (Span::Slots(a), Span::Slots(b)) => {
                a.iter().any(|x| b.iter().any(|y| x.overlaps(y)))
            }
            (Span::Keys(a), Span::Keys(b)) => a.overlaps(b),
            (Span::Tag(a), Span::Tag(b)) => a == b,
            _ => true,
        }
    }

    /// Total number of slots in a slot span.
    pub fn slot_count(&self) -> Option<u64> {
        match self {
            Span::Slots(ranges) => Some(ranges.iter().map(SlotRange::len).sum()),
            _ => None,
        }
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Span::Slots(ranges) => {
                let total: u64 = ranges.iter().map(SlotRange::len).sum();
                match ranges.as_slice() {
                    [single] => write!(f, "slots{}", single),
                    _ => write!(f, "slots x{} ({} slots)", ranges.len(), total),
                }
            }
            Span::Keys(range) => write!(f, "keys{}", range),
            Span::Tag(tag) => write!(f, "tag:{}", tag),
            Span::DirectoryDefault => write!(f, "directory-default"),
            Span::All => write!(f, "all"),
        }
    }
}

/// Encode a numeric key so byte-wise order matches numeric order.
pub fn encode_u64_key(value: u64) -> Vec<u8> {
    value.to_be_bytes().to_vec()
}

fn show_key(key: &[u8]) -> String {
    match std::str::from_utf8(key) {
        Ok(s) if s.chars().all(|c| !c.is_control()) => format!("{:?}", s),
        _ => format!("0x{}", key.iter().map(|b| format!("{:02x}", b)).collect::<String>()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_range_boundaries() {
        let range = KeyRange::new(encode_u64_key(100), encode_u64_key(200));
        assert!(range.contains(&encode_u64_key(100)));
        assert!(range.contains(&encode_u64_key(199)));
        assert!(!range.contains(&encode_u64_key(200)));
        assert!(!range.contains(&encode_u64_key(99)));
    }

    #[test]
    fn test_key_range_overlap_and_cover() {
        let a = KeyRange::new("a", "m");
        let b = KeyRange::new("m", "z");
        let c = KeyRange::starting_at("k");
        assert!(!a.overlaps(&b));
        assert!(a.overlaps(&c));
        assert!(KeyRange::full().covers(&b));
        assert!(!a.covers(&c));
        assert_eq!(a.intersect(&c), Some(KeyRange::new("k", "m")));
        assert_eq!(a.intersect(&b), None);
    }

    #[test]
    fn test_span_overlap() {
        let a = Span::Slots(vec![SlotRange::new(0, 10)]);
        let b = Span::Slots(vec![SlotRange::new(10, 20)]);
        let c = Span::Slots(vec![SlotRange::new(5, 6), SlotRange::new(30, 40)]);
        assert!(!a.overlaps(&b));
        assert!(a.overlaps(&c));
        assert!(Span::All.overlaps(&b));
        assert!(!Span::Tag("x".into()).overlaps(&Span::Tag("y".into())));
        assert!(Span::Tag("x".into()).overlaps(&Span::DirectoryDefault));
    }

    #[test]
    fn test_shard_state_display() {
        assert_eq!(ShardState::Joining.to_string(), "joining");
        assert_eq!(ShardState::Down.to_string(), "down");
        assert!(!ShardState::Down.is_routable());
        assert!(ShardState::Draining.is_routable());
        assert!(!ShardState::Draining.accepts_new_spans());
    }
}
