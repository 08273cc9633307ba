//! Shards the router suspects are down.
//!
//! The router never changes shard state itself. When a shard exhausts the
//! retry budget it is recorded here; the rebalancer's health sweep confirms
//! and marks it `Down` through the topology store.

use crate::types::ShardId;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::time::Instant;

/// Why a shard was suspected, and when.
#[derive(Debug, Clone)]
pub struct Suspicion {
    pub since: Instant,
    pub failures: u32,
    pub last_error: String,
}

#[derive(Debug, Default)]
pub struct DownCandidates {
    suspects: Mutex<BTreeMap<ShardId, Suspicion>>,
}

impl DownCandidates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, shard: ShardId, error: impl Into<String>) {
        let error = error.into();
        let mut suspects = self.suspects.lock();
        let entry = suspects.entry(shard).or_insert_with(|| Suspicion {
            since: Instant::now(),
            failures: 0,
            last_error: String::new(),
        });
        entry.failures += 1;
        entry.last_error = error;
    }

    pub fn contains(&self, shard: ShardId) -> bool {
        self.suspects.lock().contains_key(&shard)
    }

    /// Take every suspect, leaving the set empty.
    pub fn drain(&self) -> Vec<(ShardId, Suspicion)> {
        std::mem::take(&mut *self.suspects.lock()).into_iter().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.suspects.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_accumulates() {
        let candidates = DownCandidates::new();
        candidates.record(2, "timeout");
        candidates.record(2, "refused");
        assert!(candidates.contains(2));

        let drained = candidates.drain();
        assert_eq!(drained.len(), 1);
        let (shard, suspicion) = &drained[0];
        assert_eq!(*shard, 2);
        assert_eq!(suspicion.failures, 2);
        assert_eq!(suspicion.last_error, "refused");
        assert!(candidates.is_empty());
    }
}
