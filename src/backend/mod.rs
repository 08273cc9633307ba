//! Shard backend adapters.
//!
//! A backend is one shard's storage, reached through a minimal async
//! key-value contract. The coordinator never looks inside a shard; it only
//! reads, writes, scans and health-checks through [`ShardBackend`].

mod memory;
mod registry;

pub use memory::{InMemoryBackend, InMemoryConnector};
pub use registry::{BackendConnector, BackendRegistry};

use crate::error::BackendResult;
use crate::partitioning::Placement;
use crate::types::{KeyRange, OperationId, ShardId, Span};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

/// Health reported by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Healthy,
    /// Serving, but slow or partially impaired.
    Degraded,
    Unhealthy,
}

impl HealthState {
    pub fn is_serving(&self) -> bool {
        !matches!(self, HealthState::Unhealthy)
    }
}

/// One page of a range scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanPage {
    /// Entries in key order.
    pub entries: Vec<(Bytes, Bytes)>,
    /// Cursor for the next page: resume strictly after this key.
    pub next: Option<Bytes>,
}

/// Tells a backend to reject keys it no longer owns.
///
/// Installed on a migration source after cutover so routers holding a stale
/// snapshot get `NotOwner` instead of writing to the old owner.
#[derive(Debug, Clone)]
pub struct OwnershipFence {
    /// Placement the span refers to.
    pub placement: Arc<Placement>,
    pub rule: FenceRule,
}

/// Which keys a fence rejects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FenceRule {
    /// Every key in the span.
    Span(Span),
    /// Every key the placement assigns to another shard.
    NotOwnedBy(ShardId),
}

impl OwnershipFence {
    pub fn span(placement: Arc<Placement>, span: Span) -> Self {
        Self {
            placement,
            rule: FenceRule::Span(span),
        }
    }

    pub fn not_owned_by(placement: Arc<Placement>, shard: ShardId) -> Self {
        Self {
            placement,
            rule: FenceRule::NotOwnedBy(shard),
        }
    }

    /// Whether the fence rejects `key`.
    pub fn rejects(&self, key: &[u8]) -> bool {
        match &self.rule {
            FenceRule::Span(span) => self.placement.span_contains(span, key),
            FenceRule::NotOwnedBy(shard) => self.placement.owner_of(key) != Some(*shard),
        }
    }

    /// Whether acquiring `span` lifts this fence.
    pub fn lifted_by(&self, span: &Span) -> bool {
        match &self.rule {
            FenceRule::Span(fenced) => fenced.overlaps(span),
            FenceRule::NotOwnedBy(_) => true,
        }
    }
}

/// Uniform interface to one shard's storage.
#[async_trait]
pub trait ShardBackend: Send + Sync + std::fmt::Debug {
    /// Read a key.
    async fn get(&self, key: &[u8]) -> BackendResult<Option<Bytes>>;

    /// Write a key. A repeated `op_id` must not be applied twice.
    async fn put(&self, key: Bytes, value: Bytes, op_id: Option<OperationId>) -> BackendResult<()>;

    /// Delete a key. Deleting a missing key succeeds.
    async fn delete(&self, key: &[u8], op_id: Option<OperationId>) -> BackendResult<()>;

    /// Scan up to `limit` entries of `range` in key order, strictly after
    /// `after` when given.
    async fn scan_range(&self, range: &KeyRange, after: Option<&[u8]>, limit: usize) -> BackendResult<ScanPage>;

    /// Count the entries of `range`.
    async fn count_range(&self, range: &KeyRange) -> BackendResult<u64> {
        let mut total = 0;
        let mut cursor: Option<Bytes> = None;
        loop {
            let page = self.scan_range(range, cursor.as_deref(), 1024).await?;
            total += page.entries.len() as u64;
            match page.next {
                Some(next) => cursor = Some(next),
                None => return Ok(total),
            }
        }
    }

    async fn health_check(&self) -> BackendResult<HealthState>;

    /// Delete a key on behalf of the coordinator, bypassing ownership fences.
    ///
    /// Used to garbage-collect a migrated span after the source was told to
    /// reject it.
    async fn purge(&self, key: &[u8]) -> BackendResult<()> {
        self.delete(key, None).await
    }

    /// Start rejecting keys matched by `fence`.
    async fn release_range(&self, _fence: OwnershipFence) -> BackendResult<()> {
        Ok(())
    }

    /// Stop rejecting keys of `span`.
    async fn acquire_range(&self, _span: &Span) -> BackendResult<()> {
        Ok(())
    }
}
