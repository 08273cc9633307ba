//! In-memory shard backend with fault injection.

use super::registry::BackendConnector;
use super::{HealthState, OwnershipFence, ScanPage, ShardBackend};
use crate::error::{BackendError, BackendResult, Result};
use crate::types::{KeyRange, OperationId, Span};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Operation ids remembered for de-duplication.
const DEDUP_WINDOW: usize = 65_536;

#[derive(Debug, Default)]
struct AppliedOps {
    seen: HashSet<OperationId>,
    order: VecDeque<OperationId>,
}

impl AppliedOps {
    /// Record `id`; returns false if it was already applied.
    fn record(&mut self, id: OperationId) -> bool {
        if !self.seen.insert(id) {
            return false;
        }
        self.order.push_back(id);
        if self.order.len() > DEDUP_WINDOW {
            if let Some(old) = self.order.pop_front() {
                self.seen.remove(&old);
            }
        }
        true
    }
}

/// A shard stored in a `BTreeMap`, for tests and embedding.
///
/// Faults can be injected at runtime: unhealthy health checks, a fully
/// unreachable backend, a number of transient failures, and added latency.
#[derive(Debug)]
pub struct InMemoryBackend {
    address: String,
    data: RwLock<BTreeMap<Bytes, Bytes>>,
    applied: Mutex<AppliedOps>,
    fences: RwLock<Vec<OwnershipFence>>,
    unhealthy: AtomicBool,
    unavailable: AtomicBool,
    fail_next: AtomicU32,
    latency: Mutex<Option<Duration>>,
    writes: AtomicU64,
    duplicates: AtomicU64,
}

impl InMemoryBackend {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            data: RwLock::new(BTreeMap::new()),
            applied: Mutex::new(AppliedOps::default()),
            fences: RwLock::new(Vec::new()),
            unhealthy: AtomicBool::new(false),
            unavailable: AtomicBool::new(false),
            fail_next: AtomicU32::new(0),
            latency: Mutex::new(None),
            writes: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Make health checks report `Unhealthy` (data calls keep working).
    pub fn set_healthy(&self, healthy: bool) {
        self.unhealthy.store(!healthy, Ordering::SeqCst);
    }

    /// Make every call fail with `Unavailable`.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Fail the next `n` data calls with `Unavailable`.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    /// Read a key directly, ignoring faults and fences.
    pub fn peek(&self, key: &[u8]) -> Option<Bytes> {
        self.data.read().get(key).cloned()
    }

    /// Write a key directly, ignoring faults and fences.
    pub fn insert(&self, key: impl Into<Bytes>, value: impl Into<Bytes>) {
        self.data.write().insert(key.into(), value.into());
    }

    /// Every stored key.
    pub fn keys(&self) -> Vec<Bytes> {
        self.data.read().keys().cloned().collect()
    }

    /// Writes applied (duplicates excluded).
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Writes dropped because their operation id was already applied.
    pub fn duplicate_count(&self) -> u64 {
        self.duplicates.load(Ordering::Relaxed)
    }

    pub fn fence_count(&self) -> usize {
        self.fences.read().len()
    }

    async fn enter(&self) -> BackendResult<()> {
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable(format!("{} is unreachable", self.address)));
        }
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(BackendError::Unavailable(format!("{} injected failure", self.address)));
        }
        Ok(())
    }

    fn check_owned(&self, key: &[u8]) -> BackendResult<()> {
        if self.fences.read().iter().any(|f| f.rejects(key)) {
            return Err(BackendError::NotOwner);
        }
        Ok(())
    }

    fn first_application(&self, op_id: Option<OperationId>) -> bool {
        match op_id {
            Some(id) => {
                let fresh = self.applied.lock().record(id);
                if !fresh {
                    self.duplicates.fetch_add(1, Ordering::Relaxed);
                }
                fresh
            }
            None => true,
        }
    }
}

#[async_trait]
impl ShardBackend for InMemoryBackend {
    async fn get(&self, key: &[u8]) -> BackendResult<Option<Bytes>> {
        self.enter().await?;
        self.check_owned(key)?;
        Ok(self.data.read().get(key).cloned())
    }

    async fn put(&self, key: Bytes, value: Bytes, op_id: Option<OperationId>) -> BackendResult<()> {
        self.enter().await?;
        self.check_owned(&key)?;
        if self.first_application(op_id) {
            self.data.write().insert(key, value);
            self.writes.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    async fn delete(&self, key: &[u8], op_id: Option<OperationId>) -> BackendResult<()> {
        self.enter().await?;
        self.check_owned(key)?;
        if self.first_application(op_id) {
            self.data.write().remove(key);
            self.writes.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    async fn scan_range(&self, range: &KeyRange, after: Option<&[u8]>, limit: usize) -> BackendResult<ScanPage> {
        self.enter().await?;
        if let Some(end) = &range.end {
            let floor = after.unwrap_or(range.start.as_slice()).max(range.start.as_slice());
            if floor >= end.as_slice() {
                return Ok(ScanPage::default());
            }
        }
        let lower = match after {
            Some(after) if after >= range.start.as_slice() => Bound::Excluded(after),
            _ => Bound::Included(range.start.as_slice()),
        };
        let upper = match &range.end {
            Some(end) => Bound::Excluded(end.as_slice()),
            None => Bound::Unbounded,
        };

        let data = self.data.read();
        let mut iter = data.range::<[u8], _>((lower, upper));
        let entries: Vec<(Bytes, Bytes)> = iter
            .by_ref()
            .take(limit)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let next = match (entries.last(), iter.next()) {
            (Some((last, _)), Some(_)) => Some(last.clone()),
            _ => None,
        };
        Ok(ScanPage { entries, next })
    }

    async fn count_range(&self, range: &KeyRange) -> BackendResult<u64> {
        self.enter().await?;
        let data = self.data.read();
        Ok(data.keys().filter(|k| range.contains(k)).count() as u64)
    }

    async fn health_check(&self) -> BackendResult<HealthState> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable(format!("{} is unreachable", self.address)));
        }
        if self.unhealthy.load(Ordering::SeqCst) {
            return Ok(HealthState::Unhealthy);
        }
        Ok(HealthState::Healthy)
    }

    async fn purge(&self, key: &[u8]) -> BackendResult<()> {
        self.enter().await?;
        self.data.write().remove(key);
        Ok(())
    }

    async fn release_range(&self, fence: OwnershipFence) -> BackendResult<()> {
        self.fences.write().push(fence);
        Ok(())
    }

    async fn acquire_range(&self, span: &Span) -> BackendResult<()> {
        self.fences.write().retain(|f| !f.lifted_by(span));
        Ok(())
    }
}

/// Connector handing out in-memory backends, one per address.
///
/// Keeps the concrete handles so tests can inject faults by address.
#[derive(Debug, Default)]
pub struct InMemoryConnector {
    backends: DashMap<String, Arc<InMemoryBackend>>,
}

impl InMemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// The backend behind `address`, created on first use.
    pub fn backend(&self, address: &str) -> Arc<InMemoryBackend> {
        self.backends
            .entry(address.to_string())
            .or_insert_with(|| Arc::new(InMemoryBackend::new(address)))
            .clone()
    }
}

#[async_trait]
impl BackendConnector for InMemoryConnector {
    async fn connect(&self, address: &str) -> Result<Arc<dyn ShardBackend>> {
        let backend: Arc<dyn ShardBackend> = self.backend(address);
        Ok(backend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partitioning::{Placement, StrategyKind};
    use uuid::Uuid;

    fn b(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let backend = InMemoryBackend::new("mem://a");
        backend.put(b("k1"), b("v1"), None).await.unwrap();
        assert_eq!(backend.get(b"k1").await.unwrap(), Some(b("v1")));
        backend.delete(b"k1", None).await.unwrap();
        assert_eq!(backend.get(b"k1").await.unwrap(), None);
        backend.delete(b"missing", None).await.unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_op_id_is_applied_once() {
        let backend = InMemoryBackend::new("mem://a");
        let op = Uuid::new_v4();
        backend.put(b("k"), b("first"), Some(op)).await.unwrap();
        backend.put(b("k"), b("second"), Some(op)).await.unwrap();
        assert_eq!(backend.peek(b"k"), Some(b("first")));
        assert_eq!(backend.write_count(), 1);
        assert_eq!(backend.duplicate_count(), 1);
    }

    #[tokio::test]
    async fn test_scan_pages() {
        let backend = InMemoryBackend::new("mem://a");
        for i in 0..10 {
            backend.insert(format!("key-{}", i), "v");
        }
        let range = KeyRange::full();
        let first = backend.scan_range(&range, None, 4).await.unwrap();
        assert_eq!(first.entries.len(), 4);
        let cursor = first.next.clone().unwrap();
        assert_eq!(cursor, b("key-3"));

        let second = backend.scan_range(&range, Some(&cursor), 4).await.unwrap();
        assert_eq!(second.entries[0].0, b("key-4"));
        let third = backend
            .scan_range(&range, second.next.as_deref(), 4)
            .await
            .unwrap();
        assert_eq!(third.entries.len(), 2);
        assert!(third.next.is_none());

        assert_eq!(backend.count_range(&KeyRange::new("key-2", "key-5")).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let backend = InMemoryBackend::new("mem://a");
        backend.fail_next(2);
        assert!(backend.get(b"k").await.unwrap_err().is_transient());
        assert!(backend.get(b"k").await.is_err());
        assert!(backend.get(b"k").await.is_ok());

        backend.set_healthy(false);
        assert_eq!(backend.health_check().await.unwrap(), HealthState::Unhealthy);
        assert!(backend.get(b"k").await.is_ok());

        backend.set_available(false);
        assert!(backend.health_check().await.is_err());
        assert!(matches!(backend.get(b"k").await, Err(BackendError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_fence_rejects_released_span() {
        let backend = InMemoryBackend::new("mem://a");
        backend.insert("acme:1", "v");
        let placement = Arc::new(Placement::build(&StrategyKind::directory(), &[0]).unwrap());
        let span = Span::Tag("acme".to_string());

        backend
            .release_range(OwnershipFence::span(placement, span.clone()))
            .await
            .unwrap();
        assert_eq!(backend.get(b"acme:1").await.unwrap_err(), BackendError::NotOwner);
        assert!(backend.get(b"other:1").await.is_ok());

        backend.purge(b"acme:1").await.unwrap();
        assert!(backend.peek(b"acme:1").is_none());

        backend.acquire_range(&span).await.unwrap();
        assert_eq!(backend.fence_count(), 0);
        assert!(backend.get(b"acme:1").await.is_ok());
    }

    #[tokio::test]
    async fn test_connector_reuses_backends() {
        let connector = InMemoryConnector::new();
        let a = connector.connect("mem://a").await.unwrap();
        a.put(b("k"), b("v"), None).await.unwrap();
        assert_eq!(connector.backend("mem://a").peek(b"k"), Some(b("v")));
    }
}
