//! Write tracking for in-flight migrations.
//!
//! ```text
//!   Router                          Rebalancer
//!   ──────                          ──────────
//!   begin_write(shard, key) ──┐     register(span) ── copy ── take_dirty ...
//!        │ in_flight += 1     │                                  │
//!        │ fenced? ─ yes ─► MigrationFenced                      fence()
//!        ▼                    │                                  wait_idle()
//!   backend.put(...)          │                                  final replay
//!        ▼                    │                                  cutover
//!   drop(guard) ─ dirty += key, in_flight -= 1 ───────────────►  unfence()
//! ```
//!
//! The source stays authoritative while a span migrates; every key written
//! to it is remembered so the rebalancer can replay it onto the destination.
//!
//! Every write also takes a ticket from a global epoch. Registering a
//! migration closes the current epoch, and the rebalancer waits for the
//! writes holding older tickets before it starts scanning: those writes
//! looked for covering migrations before this one existed and are never
//! recorded as dirty.

use crate::error::{Error, Result};
use crate::partitioning::Placement;
use crate::types::{ShardId, Span};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;
use uuid::Uuid;

/// Router-visible state of one running migration.
pub struct ActiveMigration {
    id: Uuid,
    span: Span,
    /// Shard writes are tracked on; `None` tracks every shard (reshard).
    source: Option<ShardId>,
    /// Placement the span is interpreted against.
    placement: Arc<Placement>,
    dirty: Mutex<HashSet<Bytes>>,
    fenced: AtomicBool,
    in_flight: AtomicUsize,
    drained: Notify,
    /// Last write epoch that could not see this migration.
    opened_after: u64,
}

impl ActiveMigration {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    fn covers(&self, shard: ShardId, key: &[u8]) -> bool {
        self.source.map_or(true, |s| s == shard) && self.placement.span_contains(&self.span, key)
    }

    /// Keys written since the last call.
    pub fn take_dirty(&self) -> Vec<Bytes> {
        let mut dirty = self.dirty.lock();
        let mut keys: Vec<Bytes> = dirty.drain().collect();
        keys.sort();
        keys
    }

    pub fn dirty_len(&self) -> usize {
        self.dirty.lock().len()
    }

    /// Refuse new writes to the span.
    pub fn fence(&self) {
        self.fenced.store(true, Ordering::SeqCst);
        debug!(task = %self.id, span = %self.span, "Fenced span");
    }

    pub fn unfence(&self) {
        self.fenced.store(false, Ordering::SeqCst);
        debug!(task = %self.id, span = %self.span, "Unfenced span");
    }

    pub fn is_fenced(&self) -> bool {
        self.fenced.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Wait until no tracked write is in flight. Returns `false` on timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.drained.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.in_flight() == 0 {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }

    fn finish_write(&self, key: &Bytes) {
        self.dirty.lock().insert(key.clone());
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.drained.notify_waiters();
        }
    }

    fn abandon_write(&self) {
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.drained.notify_waiters();
        }
    }
}

impl std::fmt::Debug for ActiveMigration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveMigration")
            .field("id", &self.id)
            .field("span", &self.span)
            .field("source", &self.source)
            .field("fenced", &self.is_fenced())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

/// Open writes per epoch.
#[derive(Debug, Default)]
struct WriteEpochs {
    state: Mutex<EpochState>,
    settled: Notify,
}

#[derive(Debug, Default)]
struct EpochState {
    current: u64,
    open: BTreeMap<u64, usize>,
}

impl WriteEpochs {
    fn enter(&self) -> u64 {
        let mut state = self.state.lock();
        let epoch = state.current;
        *state.open.entry(epoch).or_insert(0) += 1;
        epoch
    }

    fn leave(&self, epoch: u64) {
        let settled = {
            let mut state = self.state.lock();
            let remaining = match state.open.get_mut(&epoch) {
                Some(count) => {
                    *count -= 1;
                    *count
                }
                None => return,
            };
            if remaining == 0 {
                state.open.remove(&epoch);
            }
            remaining == 0
        };
        if settled {
            self.settled.notify_waiters();
        }
    }

    /// Close the current epoch and return it.
    fn close(&self) -> u64 {
        let mut state = self.state.lock();
        let closed = state.current;
        state.current += 1;
        closed
    }

    fn open_through(&self, epoch: u64) -> usize {
        self.state.lock().open.range(..=epoch).map(|(_, &n)| n).sum()
    }
}

/// Registry of running migrations, shared by the router and the rebalancer.
#[derive(Debug, Default)]
pub struct MigrationTracker {
    active: RwLock<HashMap<Uuid, Arc<ActiveMigration>>>,
    epochs: Arc<WriteEpochs>,
}

impl MigrationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking writes to `span`.
    ///
    /// Fails with `MigrationConflict` if a running migration overlaps it.
    pub fn register(
        &self,
        id: Uuid,
        span: Span,
        source: Option<ShardId>,
        placement: Arc<Placement>,
    ) -> Result<Arc<ActiveMigration>> {
        let mut active = self.active.write();
        if let Some(other) = active.values().find(|m| m.span.overlaps(&span)) {
            return Err(Error::MigrationConflict(format!(
                "{} overlaps {} of running migration {}",
                span, other.span, other.id
            )));
        }
        let migration = Arc::new(ActiveMigration {
            id,
            span,
            source,
            placement,
            dirty: Mutex::new(HashSet::new()),
            fenced: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            drained: Notify::new(),
            opened_after: self.epochs.close(),
        });
        active.insert(id, migration.clone());
        Ok(migration)
    }

    pub fn unregister(&self, id: Uuid) -> Option<Arc<ActiveMigration>> {
        self.active.write().remove(&id)
    }

    pub fn get(&self, id: Uuid) -> Option<Arc<ActiveMigration>> {
        self.active.read().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.active.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.read().is_empty()
    }

    /// Wait until every write that started before `migration` was registered
    /// has returned. Returns `false` on timeout.
    pub async fn wait_for_earlier_writes(&self, migration: &ActiveMigration, timeout: Duration) -> bool {
        let barrier = migration.opened_after;
        let wait = async {
            loop {
                let notified = self.epochs.settled.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.epochs.open_through(barrier) == 0 {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }

    /// Writes currently between `begin_write` and the end of their guard.
    pub fn writes_in_flight(&self) -> usize {
        self.epochs.state.lock().open.values().sum()
    }

    /// Whether a running migration overlaps `span`.
    pub fn overlaps(&self, span: &Span) -> bool {
        self.active.read().values().any(|m| m.span.overlaps(span))
    }

    /// Announce a write of `key` on `shard`.
    ///
    /// The returned guard must live until the backend call returns; dropping
    /// it records the key for catch-up.
    pub fn begin_write(&self, shard: ShardId, key: &Bytes) -> Result<WriteGuard> {
        // The epoch is taken under the same lock `register` closes it under,
        // so a write either sees a migration or is older than it.
        let (epoch, covering) = {
            let active = self.active.read();
            let epoch = self.epochs.enter();
            let covering: Vec<Arc<ActiveMigration>> =
                active.values().filter(|m| m.covers(shard, key)).cloned().collect();
            (epoch, covering)
        };

        // Count the write before looking at the fence, so a fence either
        // sees it in flight or the write sees the fence.
        for migration in &covering {
            migration.in_flight.fetch_add(1, Ordering::SeqCst);
        }
        if covering.iter().any(|m| m.is_fenced()) {
            for migration in &covering {
                migration.abandon_write();
            }
            self.epochs.leave(epoch);
            return Err(Error::MigrationFenced { shard });
        }
        Ok(WriteGuard {
            key: key.clone(),
            migrations: covering,
            epochs: self.epochs.clone(),
            epoch,
        })
    }
}

/// An announced write. See [`MigrationTracker::begin_write`].
#[derive(Debug)]
pub struct WriteGuard {
    key: Bytes,
    migrations: Vec<Arc<ActiveMigration>>,
    epochs: Arc<WriteEpochs>,
    epoch: u64,
}

impl WriteGuard {
    /// Whether any migration tracks this write.
    pub fn is_tracked(&self) -> bool {
        !self.migrations.is_empty()
    }
}

impl Drop for WriteGuard {
    fn drop(&mut self) {
        for migration in &self.migrations {
            migration.finish_write(&self.key);
        }
        self.epochs.leave(self.epoch);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partitioning::StrategyKind;
    use crate::types::{encode_u64_key, KeyRange};

    fn range_placement() -> Arc<Placement> {
        Arc::new(Placement::build(&StrategyKind::range(), &[0]).unwrap())
    }

    fn span_100_200() -> Span {
        Span::Keys(KeyRange::new(encode_u64_key(100), encode_u64_key(200)))
    }

    #[test]
    fn test_overlapping_registration_conflicts() {
        let tracker = MigrationTracker::new();
        tracker
            .register(Uuid::new_v4(), span_100_200(), Some(0), range_placement())
            .unwrap();
        let overlapping = Span::Keys(KeyRange::new(encode_u64_key(150), encode_u64_key(300)));
        let err = tracker
            .register(Uuid::new_v4(), overlapping, Some(0), range_placement())
            .unwrap_err();
        assert!(matches!(err, Error::MigrationConflict(_)));

        let disjoint = Span::Keys(KeyRange::new(encode_u64_key(200), encode_u64_key(300)));
        tracker
            .register(Uuid::new_v4(), disjoint, Some(0), range_placement())
            .unwrap();
        assert_eq!(tracker.len(), 2);
    }

    #[test]
    fn test_writes_in_span_are_recorded() {
        let tracker = MigrationTracker::new();
        let migration = tracker
            .register(Uuid::new_v4(), span_100_200(), Some(0), range_placement())
            .unwrap();

        let inside = Bytes::from(encode_u64_key(150));
        let outside = Bytes::from(encode_u64_key(250));
        drop(tracker.begin_write(0, &inside).unwrap());
        drop(tracker.begin_write(0, &outside).unwrap());
        // Other shards are not the source.
        assert!(!tracker.begin_write(1, &inside).unwrap().is_tracked());

        assert_eq!(migration.take_dirty(), vec![inside]);
        assert_eq!(migration.dirty_len(), 0);
    }

    #[test]
    fn test_fence_rejects_new_writes() {
        let tracker = MigrationTracker::new();
        let migration = tracker
            .register(Uuid::new_v4(), span_100_200(), Some(0), range_placement())
            .unwrap();
        migration.fence();
        let key = Bytes::from(encode_u64_key(150));
        assert!(matches!(
            tracker.begin_write(0, &key),
            Err(Error::MigrationFenced { shard: 0 })
        ));
        assert_eq!(migration.in_flight(), 0);

        migration.unfence();
        assert!(tracker.begin_write(0, &key).is_ok());
    }

    #[tokio::test]
    async fn test_wait_idle_waits_for_in_flight_writes() {
        let tracker = Arc::new(MigrationTracker::new());
        let migration = tracker
            .register(Uuid::new_v4(), span_100_200(), Some(0), range_placement())
            .unwrap();
        let key = Bytes::from(encode_u64_key(120));
        let guard = tracker.begin_write(0, &key).unwrap();
        migration.fence();

        assert!(!migration.wait_idle(Duration::from_millis(20)).await);

        let waiter = {
            let migration = migration.clone();
            tokio::spawn(async move { migration.wait_idle(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(guard);
        assert!(waiter.await.unwrap());
        assert_eq!(migration.take_dirty(), vec![key]);
    }

    #[tokio::test]
    async fn test_registration_waits_for_untracked_writes() {
        let tracker = Arc::new(MigrationTracker::new());
        let key = Bytes::from(encode_u64_key(150));

        // Announced before the migration exists, so it is never recorded.
        let early = tracker.begin_write(0, &key).unwrap();
        assert!(!early.is_tracked());

        let migration = tracker
            .register(Uuid::new_v4(), span_100_200(), Some(0), range_placement())
            .unwrap();
        let late = tracker.begin_write(0, &key).unwrap();
        assert!(late.is_tracked());
        assert_eq!(tracker.writes_in_flight(), 2);

        assert!(!tracker.wait_for_earlier_writes(&migration, Duration::from_millis(20)).await);

        let waiter = {
            let tracker = tracker.clone();
            let migration = migration.clone();
            tokio::spawn(async move { tracker.wait_for_earlier_writes(&migration, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(early);
        // Writes that can see the migration do not hold it back.
        assert!(waiter.await.unwrap());
        drop(late);
        assert_eq!(tracker.writes_in_flight(), 0);
        assert_eq!(migration.take_dirty(), vec![key]);
    }

    #[test]
    fn test_fenced_write_leaves_no_open_epoch() {
        let tracker = MigrationTracker::new();
        let migration = tracker
            .register(Uuid::new_v4(), span_100_200(), Some(0), range_placement())
            .unwrap();
        migration.fence();
        assert!(tracker.begin_write(0, &Bytes::from(encode_u64_key(150))).is_err());
        assert_eq!(tracker.writes_in_flight(), 0);
    }
}
