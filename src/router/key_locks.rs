//! Per-key async locks.
//!
//! Operations on the same key through one router run one at a time, so no
//! operation overtakes an in-flight one on the identical key. Entries are
//! dropped as soon as nobody holds or waits on them.

use bytes::Bytes;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Debug, Default)]
pub struct KeyLocks {
    locks: DashMap<Bytes, Arc<Mutex<()>>>,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`.
    ///
    /// A waiter dropped before it gets the lock still removes the entry if
    /// it was the last one interested in it.
    pub async fn lock(&self, key: &Bytes) -> KeyGuard<'_> {
        let lock = self
            .locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let mut held = KeyGuard {
            locks: self,
            key: key.clone(),
            guard: None,
        };
        held.guard = Some(lock.lock_owned().await);
        held
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Holds a key's lock until dropped, or marks a waiter for cleanup.
pub struct KeyGuard<'a> {
    locks: &'a KeyLocks,
    key: Bytes,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        // Release before checking, so the count below only sees the map's
        // reference and any waiters'.
        drop(self.guard.take());
        self.locks
            .locks
            .remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

impl std::fmt::Debug for KeyGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyGuard").field("key", &self.key).finish()
    }
}
