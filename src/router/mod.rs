//! Request routing.
//!
//! ```text
//!   execute(op) ──► per-key lock ──► snapshot ──► resolve ──► dispatch
//!                                       ▲                       │
//!                                       │ NotOwner: refresh once │
//!                                       └───────────────────────┤
//!                                         Fenced: back off ◄─────┤
//!                                         Transient: retry ◄─────┘
//! ```
//!
//! The router reads an immutable `Arc<Topology>` snapshot and never writes
//! the topology. Snapshots come from the in-process store as soon as it
//! publishes and are re-read from persistence once `snapshot_ttl` expires.
//! When persistence is unreachable the router keeps serving reads from the
//! last snapshot and refuses writes until it recovers.

mod health;
mod key_locks;
mod ops;
mod retry;

pub use health::{DownCandidates, Suspicion};
pub use key_locks::{KeyGuard, KeyLocks};
pub use ops::{
    Aggregate, AggregateResult, ExecuteResult, KeyCommand, MultiKeyCommand, MultiKeyOp, ScatterPredicate,
    SingleKeyOp,
};
pub use retry::RetryPolicy;

use crate::backend::{BackendRegistry, ShardBackend};
use crate::config::RouterConfig;
use crate::error::{BackendError, Error, Result};
use crate::metrics::CoordinatorMetrics;
use crate::partitioning::{resolve, scatter_targets};
use crate::rebalancing::MigrationTracker;
use crate::topology::{Topology, TopologyStore};
use crate::types::{KeyRange, ShardId, ShardState};
use bytes::Bytes;
use futures::future::join_all;
use parking_lot::RwLock;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

struct CachedSnapshot {
    topology: Arc<Topology>,
    fetched_at: Instant,
}

/// What one shard contributed to a scatter-gather operation.
enum ShardPart {
    Count(u64),
    Entries(Vec<(Bytes, Bytes)>),
    Values(Vec<(usize, Option<Bytes>)>),
}

/// Executes client operations against the owning shard(s).
pub struct Router {
    config: RouterConfig,
    store: Arc<TopologyStore>,
    registry: Arc<BackendRegistry>,
    tracker: Arc<MigrationTracker>,
    candidates: Arc<DownCandidates>,
    metrics: Arc<CoordinatorMetrics>,
    key_locks: KeyLocks,
    snapshot: RwLock<CachedSnapshot>,
    degraded: AtomicBool,
}

impl Router {
    pub fn new(
        config: RouterConfig,
        store: Arc<TopologyStore>,
        registry: Arc<BackendRegistry>,
        tracker: Arc<MigrationTracker>,
        candidates: Arc<DownCandidates>,
        metrics: Arc<CoordinatorMetrics>,
    ) -> Self {
        let snapshot = CachedSnapshot {
            topology: store.cached(),
            fetched_at: Instant::now(),
        };
        Self {
            config,
            store,
            registry,
            tracker,
            candidates,
            metrics,
            key_locks: KeyLocks::new(),
            snapshot: RwLock::new(snapshot),
            degraded: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Whether the router is serving a possibly stale snapshot because the
    /// topology store is unreachable.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    /// Shards that exhausted the retry budget since the last health sweep.
    pub fn down_candidates(&self) -> &Arc<DownCandidates> {
        &self.candidates
    }

    /// Snapshot the router is currently routing with.
    pub fn current(&self) -> Arc<Topology> {
        self.snapshot.read().topology.clone()
    }

    /// Re-read the topology from persistence.
    pub async fn refresh(&self) -> Result<Arc<Topology>> {
        self.snapshot(true).await
    }

    async fn snapshot(&self, force: bool) -> Result<Arc<Topology>> {
        let published = self.store.cached();
        {
            let mut cached = self.snapshot.write();
            if published.generation > cached.topology.generation {
                cached.topology = published;
            }
            if !force && cached.fetched_at.elapsed() < self.config.snapshot_ttl {
                return Ok(cached.topology.clone());
            }
        }

        self.metrics.resolution_cache_misses.inc();
        match self.store.get_snapshot().await {
            Ok(fresh) => {
                let mut cached = self.snapshot.write();
                if fresh.generation >= cached.topology.generation {
                    cached.topology = fresh;
                }
                cached.fetched_at = Instant::now();
                if self.degraded.swap(false, Ordering::SeqCst) {
                    self.metrics.degraded.set(0);
                    info!(generation = cached.topology.generation, "Topology store reachable again; leaving degraded mode");
                }
                Ok(cached.topology.clone())
            }
            Err(e) => {
                let mut cached = self.snapshot.write();
                // Do not hammer an unreachable store on every request.
                cached.fetched_at = Instant::now();
                if !self.degraded.swap(true, Ordering::SeqCst) {
                    self.metrics.degraded.set(1);
                    warn!(
                        error = %e,
                        generation = cached.topology.generation,
                        "Topology store unreachable; serving last snapshot, writes refused"
                    );
                }
                Ok(cached.topology.clone())
            }
        }
    }

    /// Execute a single-key operation.
    pub async fn execute(&self, op: SingleKeyOp) -> Result<ExecuteResult> {
        let deadline = op.deadline.unwrap_or(self.config.default_deadline);
        let started = Instant::now();
        let name = op.name();

        let result = match tokio::time::timeout(deadline, self.execute_inner(&op)).await {
            Ok(result) => result,
            Err(_) => {
                self.metrics.deadline_exceeded.inc();
                Err(Error::DeadlineExceeded {
                    elapsed: started.elapsed(),
                })
            }
        };

        self.metrics.request_latency.observe(started.elapsed());
        match &result {
            Ok(_) => self.metrics.requests.inc([name, "ok"]),
            Err(e) => {
                self.metrics.requests.inc([name, "error"]);
                self.metrics.request_errors.inc([e.label()]);
                debug!(op = name, error = %e, "Operation failed");
            }
        }
        result
    }

    async fn execute_inner(&self, op: &SingleKeyOp) -> Result<ExecuteResult> {
        let _key_guard = self.key_locks.lock(&op.key).await;

        let mut attempts = 0u32;
        let mut retries = 0u32;
        let mut fenced_rounds = 0u32;
        let mut refreshed = false;
        let mut force_refresh = false;

        loop {
            let snapshot = self.snapshot(force_refresh).await?;
            force_refresh = false;

            if op.is_write() && self.is_degraded() {
                self.metrics.degraded_rejections.inc();
                return Err(Error::Degraded(format!(
                    "topology store unreachable; refusing {} at generation {}",
                    op.name(),
                    snapshot.generation
                )));
            }

            let resolution = resolve(&snapshot, &op.key)?;
            let shard = resolution.shard;
            if resolution.state == ShardState::Down {
                return Err(Error::ShardUnavailable {
                    shard,
                    reason: "shard is down".to_string(),
                });
            }

            attempts += 1;
            match self.dispatch(op, shard, &snapshot).await {
                Ok(value) => {
                    return Ok(ExecuteResult {
                        value,
                        shard,
                        generation: resolution.generation,
                        attempts,
                    })
                }
                Err(Error::NotOwner { shard }) => {
                    self.metrics.not_owner_rejections.inc();
                    if refreshed {
                        return Err(Error::NotOwner { shard });
                    }
                    debug!(shard, generation = snapshot.generation, "Shard rejected key; refreshing topology");
                    refreshed = true;
                    force_refresh = true;
                }
                Err(Error::MigrationFenced { shard }) => {
                    self.metrics.fenced_retries.inc();
                    fenced_rounds += 1;
                    let delay = self.config.retry.backoff(fenced_rounds).max(Duration::from_millis(1));
                    debug!(shard, ?delay, "Span fenced for cutover; backing off");
                    tokio::time::sleep(delay).await;
                }
                Err(e) if e.is_transient() => {
                    if !self.config.retry.allows(retries) {
                        warn!(shard, attempts, error = %e, "Retry budget exhausted; marking shard as down candidate");
                        self.candidates.record(shard, e.to_string());
                        return Err(Error::ShardUnavailable {
                            shard,
                            reason: e.to_string(),
                        });
                    }
                    retries += 1;
                    self.metrics.retries.inc();
                    let delay = self.config.retry.backoff(retries);
                    debug!(shard, retry = retries, ?delay, error = %e, "Retrying shard call");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn dispatch(&self, op: &SingleKeyOp, shard: ShardId, snapshot: &Topology) -> Result<Option<Bytes>> {
        let backend = self.backend(shard, snapshot).await?;
        self.metrics.record_shard_op(shard, op.name());
        match &op.command {
            KeyCommand::Get => self.call(shard, backend.get(&op.key)).await,
            KeyCommand::Put(value) => {
                let _write = self.tracker.begin_write(shard, &op.key)?;
                self.call(shard, backend.put(op.key.clone(), value.clone(), Some(op.op_id)))
                    .await
                    .map(|()| None)
            }
            KeyCommand::Delete => {
                let _write = self.tracker.begin_write(shard, &op.key)?;
                self.call(shard, backend.delete(&op.key, Some(op.op_id)))
                    .await
                    .map(|()| None)
            }
        }
    }

    /// Backend handle for `shard`, connecting on first use.
    async fn backend(&self, shard: ShardId, snapshot: &Topology) -> Result<Arc<dyn ShardBackend>> {
        match self.registry.get(shard) {
            Ok(backend) => Ok(backend),
            Err(Error::ShardNotFound(_)) => {
                let entry = snapshot.shard(shard).ok_or(Error::ShardNotFound(shard))?;
                self.registry.connect(shard, &entry.address).await
            }
            Err(e) => Err(e),
        }
    }

    async fn call<T>(
        &self,
        shard: ShardId,
        fut: impl Future<Output = std::result::Result<T, BackendError>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.config.call_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(BackendError::NotOwner)) => Err(Error::NotOwner { shard }),
            Ok(Err(e)) => Err(Error::Backend(e)),
            Err(_) => Err(Error::Backend(BackendError::Timeout)),
        }
    }

    /// Execute an operation on every shard matching `predicate` and merge the
    /// results.
    ///
    /// A failing shard makes the result partial; with `all_or_nothing` the
    /// first failure is returned instead.
    pub async fn execute_scatter(&self, op: MultiKeyOp, predicate: ScatterPredicate) -> Result<AggregateResult> {
        let deadline = op.deadline.unwrap_or(self.config.default_deadline);
        let started = Instant::now();
        let name = op.name();
        self.metrics.scatter_requests.inc();

        let result = match tokio::time::timeout(deadline, self.scatter_inner(&op, &predicate)).await {
            Ok(result) => result,
            Err(_) => {
                self.metrics.deadline_exceeded.inc();
                Err(Error::DeadlineExceeded {
                    elapsed: started.elapsed(),
                })
            }
        };

        self.metrics.request_latency.observe(started.elapsed());
        match &result {
            Ok(aggregate) if aggregate.partial => {
                self.metrics.scatter_partial.inc();
                self.metrics.requests.inc([name, "partial"]);
            }
            Ok(_) => self.metrics.requests.inc([name, "ok"]),
            Err(e) => {
                self.metrics.requests.inc([name, "error"]);
                self.metrics.request_errors.inc([e.label()]);
            }
        }
        result
    }

    async fn scatter_inner(&self, op: &MultiKeyOp, predicate: &ScatterPredicate) -> Result<AggregateResult> {
        let snapshot = self.snapshot(false).await?;
        let range = predicate.range();
        let targets = match predicate {
            ScatterPredicate::All => scatter_targets(&snapshot, None)?,
            ScatterPredicate::KeyRange(range) => scatter_targets(&snapshot, Some(range))?,
            ScatterPredicate::Shards(ids) => {
                for &id in ids {
                    if snapshot.shard(id).is_none() {
                        return Err(Error::ShardNotFound(id));
                    }
                }
                let mut ids = ids.clone();
                ids.sort_unstable();
                ids.dedup();
                ids
            }
        };

        // Multi-get only visits the owners of the requested keys.
        let mut key_groups: Vec<(ShardId, Vec<(usize, Bytes)>)> = Vec::new();
        if let MultiKeyCommand::MultiGet(keys) = &op.command {
            for (index, key) in keys.iter().enumerate() {
                if !range.contains(key) {
                    continue;
                }
                let shard = resolve(&snapshot, key)?.shard;
                if !targets.contains(&shard) {
                    continue;
                }
                match key_groups.iter_mut().find(|(s, _)| *s == shard) {
                    Some((_, group)) => group.push((index, key.clone())),
                    None => key_groups.push((shard, vec![(index, key.clone())])),
                }
            }
        }
        let targets: Vec<ShardId> = match &op.command {
            MultiKeyCommand::MultiGet(_) => key_groups.iter().map(|(s, _)| *s).collect(),
            _ => targets,
        };

        debug!(op = op.name(), shards = targets.len(), generation = snapshot.generation, "Scattering");
        let calls = targets.iter().map(|&shard| {
            let keys = key_groups
                .iter()
                .find(|(s, _)| *s == shard)
                .map(|(_, keys)| keys.as_slice())
                .unwrap_or(&[]);
            self.scatter_one(&snapshot, shard, &op.command, &range, keys)
        });
        let outcomes = join_all(calls).await;

        let mut parts = Vec::new();
        let mut failed = Vec::new();
        let mut first_error = None;
        for (&shard, outcome) in targets.iter().zip(outcomes) {
            match outcome {
                Ok(part) => parts.push(part),
                Err(e) => {
                    warn!(shard, error = %e, "Scatter call failed");
                    failed.push((shard, e.to_string()));
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Some(e) = first_error {
            if op.all_or_nothing || parts.is_empty() {
                return Err(e);
            }
        }

        let value = match &op.command {
            MultiKeyCommand::Count => Aggregate::Count(
                parts
                    .iter()
                    .map(|p| match p {
                        ShardPart::Count(n) => *n,
                        _ => 0,
                    })
                    .sum(),
            ),
            MultiKeyCommand::Scan { limit } => {
                let mut entries: Vec<(Bytes, Bytes)> = parts
                    .into_iter()
                    .flat_map(|p| match p {
                        ShardPart::Entries(entries) => entries,
                        _ => Vec::new(),
                    })
                    .collect();
                entries.sort_by(|a, b| a.0.cmp(&b.0));
                entries.truncate(*limit);
                Aggregate::Entries(entries)
            }
            MultiKeyCommand::MultiGet(keys) => {
                let mut values = vec![None; keys.len()];
                for part in parts {
                    if let ShardPart::Values(found) = part {
                        for (index, value) in found {
                            values[index] = value;
                        }
                    }
                }
                Aggregate::Values(values)
            }
        };

        Ok(AggregateResult {
            value,
            partial: !failed.is_empty(),
            failed_shards: failed,
            generation: snapshot.generation,
        })
    }

    async fn scatter_one(
        &self,
        snapshot: &Topology,
        shard: ShardId,
        command: &MultiKeyCommand,
        range: &KeyRange,
        keys: &[(usize, Bytes)],
    ) -> Result<ShardPart> {
        if snapshot.state_of(shard) == Some(ShardState::Down) {
            return Err(Error::ShardUnavailable {
                shard,
                reason: "shard is down".to_string(),
            });
        }
        let backend = self.backend(shard, snapshot).await?;
        let placement = snapshot.placement.as_ref().ok_or(Error::NoShardsAvailable)?;
        // A shard may still hold copies of keys it no longer owns (or not yet
        // owns) while a span migrates; only count what it owns here.
        let owned = |key: &[u8]| placement.owner_of(key) == Some(shard);

        match command {
            MultiKeyCommand::Count | MultiKeyCommand::Scan { .. } => {
                let limit = match command {
                    MultiKeyCommand::Scan { limit } => *limit,
                    _ => usize::MAX,
                };
                let mut count = 0u64;
                let mut entries = Vec::new();
                let mut cursor: Option<Bytes> = None;
                loop {
                    self.metrics.record_shard_op(shard, "scan");
                    let page = self
                        .call(
                            shard,
                            backend.scan_range(range, cursor.as_deref(), self.config.scan_page_size),
                        )
                        .await?;
                    for (key, value) in page.entries {
                        if !owned(&key) {
                            continue;
                        }
                        count += 1;
                        if entries.len() < limit && matches!(command, MultiKeyCommand::Scan { .. }) {
                            entries.push((key, value));
                        }
                    }
                    let scan_full = matches!(command, MultiKeyCommand::Scan { .. }) && entries.len() >= limit;
                    match page.next {
                        Some(next) if !scan_full => cursor = Some(next),
                        _ => break,
                    }
                }
                Ok(match command {
                    MultiKeyCommand::Count => ShardPart::Count(count),
                    _ => ShardPart::Entries(entries),
                })
            }
            MultiKeyCommand::MultiGet(_) => {
                let mut values = Vec::with_capacity(keys.len());
                for (index, key) in keys {
                    self.metrics.record_shard_op(shard, "get");
                    let value = self.call(shard, backend.get(key)).await?;
                    values.push((*index, value));
                }
                Ok(ShardPart::Values(values))
            }
        }
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("generation", &self.snapshot.read().topology.generation)
            .field("degraded", &self.is_degraded())
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{InMemoryConnector, OwnershipFence};
    use crate::partitioning::StrategyKind;
    use crate::topology::{InMemoryPersistence, TopologyMutation};
    use crate::config::TopologyConfig;
    use uuid::Uuid;

    struct Harness {
        persistence: Arc<InMemoryPersistence>,
        connector: Arc<InMemoryConnector>,
        store: Arc<TopologyStore>,
        tracker: Arc<MigrationTracker>,
        metrics: Arc<CoordinatorMetrics>,
        router: Router,
    }

    async fn harness(kind: StrategyKind, shards: usize, config: RouterConfig) -> Harness {
        let persistence = Arc::new(InMemoryPersistence::new());
        let connector = Arc::new(InMemoryConnector::new());
        let metrics = Arc::new(CoordinatorMetrics::new());
        let addresses: Vec<String> = (0..shards).map(|i| format!("mem://{}", i)).collect();
        let store = Arc::new(
            TopologyStore::open(
                persistence.clone(),
                TopologyConfig::default(),
                Topology::bootstrap(kind, &addresses).unwrap(),
                metrics.clone(),
            )
            .await
            .unwrap(),
        );
        let registry = Arc::new(BackendRegistry::new(connector.clone()));
        registry.sync(&store.cached()).await.unwrap();
        let tracker = Arc::new(MigrationTracker::new());
        let router = Router::new(
            config,
            store.clone(),
            registry,
            tracker.clone(),
            Arc::new(DownCandidates::new()),
            metrics.clone(),
        );
        Harness {
            persistence,
            connector,
            store,
            tracker,
            metrics,
            router,
        }
    }

    fn fast_retries() -> RouterConfig {
        RouterConfig::default().with_retry(
            RetryPolicy::default()
                .with_jitter(false)
                .with_initial_backoff(Duration::from_millis(1)),
        )
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let h = harness(StrategyKind::hash(), 3, fast_retries()).await;
        let put = h.router.execute(SingleKeyOp::put("user:1", "alice")).await.unwrap();
        let owner = resolve(&h.store.cached(), b"user:1").unwrap().shard;
        assert_eq!(put.shard, owner);
        assert_eq!(put.attempts, 1);

        let got = h.router.execute(SingleKeyOp::get("user:1")).await.unwrap();
        assert_eq!(got.value, Some(Bytes::from("alice")));
        assert_eq!(
            h.connector.backend(&format!("mem://{}", owner)).peek(b"user:1"),
            Some(Bytes::from("alice"))
        );

        h.router.execute(SingleKeyOp::delete("user:1")).await.unwrap();
        let got = h.router.execute(SingleKeyOp::get("user:1")).await.unwrap();
        assert_eq!(got.value, None);
        assert_eq!(h.metrics.requests.get(["put", "ok"]), 1);
        assert_eq!(h.metrics.requests.get(["get", "ok"]), 2);
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried_with_same_op_id() {
        let h = harness(StrategyKind::hash(), 1, fast_retries()).await;
        let backend = h.connector.backend("mem://0");
        backend.fail_next(2);

        let result = h.router.execute(SingleKeyOp::put("k", "v")).await.unwrap();
        assert_eq!(result.attempts, 3);
        assert_eq!(h.metrics.retries.get(), 2);
        assert_eq!(backend.write_count(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_budget_surfaces_shard_unavailable() {
        let h = harness(StrategyKind::hash(), 1, fast_retries()).await;
        h.connector.backend("mem://0").set_available(false);

        let err = h.router.execute(SingleKeyOp::get("k")).await.unwrap_err();
        assert!(matches!(err, Error::ShardUnavailable { shard: 0, .. }));
        assert!(h.router.down_candidates().contains(0));
        assert_eq!(h.metrics.retries.get(), 3);
    }

    #[tokio::test]
    async fn test_not_owner_refreshes_once() {
        let config = fast_retries().with_snapshot_ttl(Duration::from_secs(60));
        let h = harness(StrategyKind::hash(), 2, config).await;
        let before = h.store.cached();
        let (source, span) = before.placement.as_ref().unwrap().locate(b"moved").unwrap();
        let dest = 1 - source;

        // Another coordinator process moves the span behind this router's back.
        let other = TopologyStore::open(
            h.persistence.clone(),
            TopologyConfig::default(),
            Topology::empty(StrategyKind::hash()),
            Arc::new(CoordinatorMetrics::new()),
        )
        .await
        .unwrap();
        let after = other
            .update(|_| {
                Ok(TopologyMutation::TransferSpan {
                    span: span.clone(),
                    from: source,
                    to: dest,
                })
            })
            .await
            .unwrap();
        let placement = Arc::new(after.placement.clone().unwrap());
        h.connector
            .backend(&format!("mem://{}", source))
            .release_range(OwnershipFence::span(placement, span))
            .await
            .unwrap();

        let result = h.router.execute(SingleKeyOp::put("moved", "v")).await.unwrap();
        assert_eq!(result.shard, dest);
        assert_eq!(result.generation, after.generation);
        assert_eq!(result.attempts, 2);
        assert_eq!(h.metrics.not_owner_rejections.get(), 1);
    }

    #[tokio::test]
    async fn test_degraded_mode_serves_reads_refuses_writes() {
        let config = fast_retries().with_snapshot_ttl(Duration::ZERO);
        let h = harness(StrategyKind::hash(), 2, config).await;
        h.router.execute(SingleKeyOp::put("k", "v")).await.unwrap();

        h.persistence.set_available(false);
        let got = h.router.execute(SingleKeyOp::get("k")).await.unwrap();
        assert_eq!(got.value, Some(Bytes::from("v")));
        assert!(h.router.is_degraded());
        assert_eq!(h.metrics.degraded.get(), 1);

        let err = h.router.execute(SingleKeyOp::put("k", "w")).await.unwrap_err();
        assert!(matches!(err, Error::Degraded(_)));

        h.persistence.set_available(true);
        h.router.execute(SingleKeyOp::put("k", "w")).await.unwrap();
        assert!(!h.router.is_degraded());
        assert_eq!(h.metrics.degraded.get(), 0);
    }

    #[tokio::test]
    async fn test_deadline_exceeded() {
        let h = harness(StrategyKind::hash(), 1, fast_retries()).await;
        h.connector.backend("mem://0").set_latency(Some(Duration::from_millis(200)));

        let err = h
            .router
            .execute(SingleKeyOp::get("slow").with_deadline(Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DeadlineExceeded { .. }));
        assert_eq!(h.metrics.deadline_exceeded.get(), 1);
    }

    #[tokio::test]
    async fn test_fenced_write_waits_for_unfence() {
        let h = harness(StrategyKind::hash(), 2, fast_retries()).await;
        let topology = h.store.cached();
        let placement = Arc::new(topology.placement.clone().unwrap());
        let (source, span) = placement.locate(b"hot").unwrap();
        let migration = h
            .tracker
            .register(Uuid::new_v4(), span, Some(source), placement)
            .unwrap();
        migration.fence();

        let unfence = {
            let migration = migration.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                migration.unfence();
            })
        };
        let result = h.router.execute(SingleKeyOp::put("hot", "v")).await.unwrap();
        unfence.await.unwrap();

        assert_eq!(result.shard, source);
        assert!(h.metrics.fenced_retries.get() >= 1);
        assert_eq!(migration.take_dirty(), vec![Bytes::from("hot")]);
    }

    #[tokio::test]
    async fn test_down_shard_is_not_dispatched() {
        let h = harness(StrategyKind::Modulo, 1, fast_retries()).await;
        h.store
            .apply_mutation(1, TopologyMutation::SetShardState { shard: 0, state: ShardState::Down })
            .await
            .unwrap();
        let err = h.router.execute(SingleKeyOp::get("k")).await.unwrap_err();
        assert!(matches!(err, Error::ShardUnavailable { shard: 0, .. }));
        assert_eq!(h.metrics.shard_load(0), 0);
    }

    #[tokio::test]
    async fn test_scatter_count_scan_and_multi_get() {
        let h = harness(StrategyKind::hash(), 3, fast_retries()).await;
        for i in 0..60 {
            h.router
                .execute(SingleKeyOp::put(format!("k{:02}", i), format!("v{}", i)))
                .await
                .unwrap();
        }

        let count = h
            .router
            .execute_scatter(MultiKeyOp::count(), ScatterPredicate::All)
            .await
            .unwrap();
        assert_eq!(count.count(), Some(60));
        assert!(!count.partial);

        let scan = h
            .router
            .execute_scatter(MultiKeyOp::scan(5), ScatterPredicate::All)
            .await
            .unwrap();
        let keys: Vec<Bytes> = scan.entries().unwrap().iter().map(|(k, _)| k.clone()).collect();
        assert_eq!(keys, vec!["k00", "k01", "k02", "k03", "k04"]);

        let ranged = h
            .router
            .execute_scatter(
                MultiKeyOp::count(),
                ScatterPredicate::KeyRange(KeyRange::new(b"k10".to_vec(), b"k20".to_vec())),
            )
            .await
            .unwrap();
        assert_eq!(ranged.count(), Some(10));

        let values = h
            .router
            .execute_scatter(
                MultiKeyOp::multi_get(vec![Bytes::from("k07"), Bytes::from("missing")]),
                ScatterPredicate::All,
            )
            .await
            .unwrap();
        assert_eq!(
            values.value,
            Aggregate::Values(vec![Some(Bytes::from("v7")), None])
        );
    }

    #[tokio::test]
    async fn test_scatter_partial_and_all_or_nothing() {
        let h = harness(StrategyKind::hash(), 3, fast_retries()).await;
        for i in 0..30 {
            h.router.execute(SingleKeyOp::put(format!("k{}", i), "v")).await.unwrap();
        }
        let on_two = h.connector.backend("mem://2").len() as u64;
        h.connector.backend("mem://2").set_available(false);

        let result = h
            .router
            .execute_scatter(MultiKeyOp::count(), ScatterPredicate::All)
            .await
            .unwrap();
        assert!(result.partial);
        assert_eq!(result.failed_shard_ids(), vec![2]);
        assert_eq!(result.count(), Some(30 - on_two));
        assert_eq!(h.metrics.scatter_partial.get(), 1);

        let err = h
            .router
            .execute_scatter(MultiKeyOp::count().all_or_nothing(), ScatterPredicate::All)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Backend(_)));
    }
}
