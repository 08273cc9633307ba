//! The coordinator facade.
//!
//! [`ShardCoordinator`] wires the topology store, router and rebalancer
//! together and exposes the client and admin operations. Admin operations
//! only plan and queue migrations; they run on the next
//! [`rebalance_now`](ShardCoordinator::rebalance_now) or background tick.

use crate::backend::{BackendConnector, BackendRegistry, InMemoryConnector};
use crate::config::CoordinatorConfig;
use crate::error::{Error, Result};
use crate::metrics::CoordinatorMetrics;
use crate::partitioning::{Placement, StrategyKind};
use crate::rebalancing::{
    EventSink, MigrationReason, MigrationTask, MigrationTracker, Rebalancer, RebalancerHandle, TracingEventSink,
};
use crate::router::{AggregateResult, DownCandidates, ExecuteResult, MultiKeyOp, Router, ScatterPredicate, SingleKeyOp};
use crate::topology::{InMemoryPersistence, Topology, TopologyMutation, TopologyPersistence, TopologyStore};
use crate::types::{ShardId, ShardState, Span};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// A shard routing and rebalancing coordinator.
pub struct ShardCoordinator {
    config: CoordinatorConfig,
    store: Arc<TopologyStore>,
    registry: Arc<BackendRegistry>,
    router: Router,
    rebalancer: Arc<Rebalancer>,
    metrics: Arc<CoordinatorMetrics>,
    background: Mutex<Option<RebalancerHandle>>,
}

impl ShardCoordinator {
    pub fn builder(config: CoordinatorConfig) -> CoordinatorBuilder {
        CoordinatorBuilder::new(config)
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn rebalancer(&self) -> &Arc<Rebalancer> {
        &self.rebalancer
    }

    pub fn store(&self) -> &Arc<TopologyStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<CoordinatorMetrics> {
        &self.metrics
    }

    /// Latest topology published in this process.
    pub fn snapshot(&self) -> Arc<Topology> {
        self.store.cached()
    }

    /// Execute a single-key operation.
    pub async fn execute(&self, op: SingleKeyOp) -> Result<ExecuteResult> {
        self.router.execute(op).await
    }

    /// Execute a multi-shard operation.
    pub async fn execute_scatter(&self, op: MultiKeyOp, predicate: ScatterPredicate) -> Result<AggregateResult> {
        self.router.execute_scatter(op, predicate).await
    }

    /// Register a backend at `address` as a new `Joining` shard and queue
    /// the migrations giving it its share.
    pub async fn admin_add_shard(&self, address: impl Into<String>) -> Result<ShardId> {
        let address = address.into();
        let topology = self
            .store
            .update(|current| {
                Ok(TopologyMutation::AddShard {
                    id: current.next_shard_id,
                    address: address.clone(),
                })
            })
            .await?;
        let shard = topology.next_shard_id - 1;

        if let Err(e) = self.registry.connect(shard, &address).await {
            warn!(shard, address = %address, error = %e, "Could not connect new shard; removing it");
            if let Err(undo) = self.store.update(|_| Ok(TopologyMutation::RemoveShard { shard })).await {
                warn!(shard, error = %undo, "Failed to remove unreachable shard");
            }
            return Err(e);
        }

        let tasks = self.rebalancer.plan_join(shard).await?;
        info!(shard, address = %address, tasks = tasks.len(), "Shard added");
        Ok(shard)
    }

    /// Mark `shard` as draining and queue the migrations emptying it. The
    /// shard is removed once it owns nothing.
    pub async fn admin_remove_shard(&self, shard: ShardId) -> Result<Vec<Uuid>> {
        let previous = self.store.get_snapshot().await?.state_of(shard).ok_or(Error::ShardNotFound(shard))?;
        if previous != ShardState::Draining {
            self.store
                .update(|_| {
                    Ok(TopologyMutation::SetShardState {
                        shard,
                        state: ShardState::Draining,
                    })
                })
                .await?;
        }

        match self.rebalancer.plan_leave(shard).await {
            Ok(tasks) => {
                info!(shard, tasks = tasks.len(), "Shard draining");
                Ok(tasks)
            }
            Err(e) => {
                if previous != ShardState::Draining {
                    let restored = self
                        .store
                        .update(|_| Ok(TopologyMutation::SetShardState { shard, state: previous }))
                        .await;
                    if let Err(undo) = restored {
                        warn!(shard, error = %undo, "Failed to restore shard state");
                    }
                }
                Err(e)
            }
        }
    }

    /// Map `tag` to `shard`.
    ///
    /// Returns the queued migration, or `None` when no data has to move.
    pub async fn admin_assign_tag(&self, tag: &str, shard: ShardId) -> Result<Option<Uuid>> {
        let topology = self.store.get_snapshot().await?;
        match topology.state_of(shard) {
            Some(state) if state.accepts_new_spans() => {}
            Some(state) => {
                return Err(Error::InvalidMutation(format!(
                    "shard {} is {} and cannot take tag {}",
                    shard, state, tag
                )))
            }
            None => return Err(Error::ShardNotFound(shard)),
        }
        let placement = topology.placement.as_ref().ok_or(Error::NoShardsAvailable)?;
        let span = Span::Tag(tag.to_string());

        let task = match placement {
            Placement::Directory(dir) | Placement::Composite { directory: dir, .. } if dir.is_mapped(tag) => {
                let owner = dir.owner_of_tag(tag);
                if owner == shard {
                    return Ok(None);
                }
                MigrationTask::moving(span, owner, shard, MigrationReason::TagAssignment)
            }
            Placement::Directory(dir) => {
                let default = dir.default_shard();
                if default == shard {
                    self.store
                        .update(|_| {
                            Ok(TopologyMutation::AssignTag {
                                tag: tag.to_string(),
                                shard,
                            })
                        })
                        .await?;
                    return Ok(None);
                }
                MigrationTask::moving(span, default, shard, MigrationReason::TagAssignment)
            }
            Placement::Composite { .. } => {
                // An unmapped tag's keys are spread over the fallback slots.
                let mut target = placement.clone();
                target.assign_tag(tag, shard)?;
                MigrationTask::reshard(target, MigrationReason::TagAssignment)
            }
            other => {
                return Err(Error::InvalidMutation(format!(
                    "{} placement has no directory",
                    other.name()
                )))
            }
        };
        self.rebalancer.submit(task).await.map(Some)
    }

    /// Queue a switch of the whole keyspace to another placement strategy.
    pub async fn admin_restrategy(&self, kind: StrategyKind) -> Result<Vec<Uuid>> {
        self.rebalancer.plan_restrategy(&kind).await
    }

    /// Run every queued migration now.
    pub async fn rebalance_now(&self) -> Result<Vec<MigrationTask>> {
        self.rebalancer.run_pending().await
    }

    /// Start the background rebalancer loop. Does nothing if it is running.
    pub fn start_background(&self) {
        let mut background = self.background.lock();
        if background.is_none() {
            *background = Some(self.rebalancer.clone().spawn());
        }
    }

    /// Stop the background loop, if running.
    pub async fn shutdown(&self) {
        let handle = self.background.lock().take();
        if let Some(handle) = handle {
            handle.shutdown().await;
        }
        info!("Shard coordinator shut down");
    }
}

impl std::fmt::Debug for ShardCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let topology = self.store.cached();
        f.debug_struct("ShardCoordinator")
            .field("generation", &topology.generation)
            .field("shards", &topology.shards.len())
            .field("rebalancer", &self.rebalancer)
            .finish()
    }
}

/// Assembles a [`ShardCoordinator`].
///
/// Defaults to in-memory persistence, in-memory backends and a tracing
/// event sink.
pub struct CoordinatorBuilder {
    config: CoordinatorConfig,
    persistence: Option<Arc<dyn TopologyPersistence>>,
    connector: Option<Arc<dyn BackendConnector>>,
    events: Option<Arc<dyn EventSink>>,
    shards: Vec<String>,
}

impl CoordinatorBuilder {
    pub fn new(config: CoordinatorConfig) -> Self {
        Self {
            config,
            persistence: None,
            connector: None,
            events: None,
            shards: Vec::new(),
        }
    }

    pub fn with_persistence(mut self, persistence: Arc<dyn TopologyPersistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    pub fn with_connector(mut self, connector: Arc<dyn BackendConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    /// Shards to bootstrap with when the persistence layer is empty.
    pub fn with_shards<I, S>(mut self, addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.shards = addresses.into_iter().map(Into::into).collect();
        self
    }

    /// Open the topology, connect the backends and recover persisted tasks.
    pub async fn build(self) -> Result<ShardCoordinator> {
        self.config.validate()?;
        let config = self.config;
        let persistence = self
            .persistence
            .unwrap_or_else(|| Arc::new(InMemoryPersistence::new()));
        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(InMemoryConnector::new()));
        let events = self.events.unwrap_or_else(|| Arc::new(TracingEventSink));
        let metrics = Arc::new(CoordinatorMetrics::new());

        let initial = if self.shards.is_empty() {
            Topology::empty(config.strategy.clone())
        } else {
            Topology::bootstrap(config.strategy.clone(), &self.shards)?
        };
        let store = Arc::new(TopologyStore::open(persistence, config.topology.clone(), initial, metrics.clone()).await?);
        let registry = Arc::new(BackendRegistry::new(connector));
        registry.sync(&store.cached()).await?;

        let tracker = Arc::new(MigrationTracker::new());
        let candidates = Arc::new(DownCandidates::new());
        let router = Router::new(
            config.router.clone(),
            store.clone(),
            registry.clone(),
            tracker.clone(),
            candidates.clone(),
            metrics.clone(),
        );
        let rebalancer = Arc::new(Rebalancer::new(
            config.rebalance.clone(),
            store.clone(),
            registry.clone(),
            tracker,
            candidates,
            metrics.clone(),
            events,
        ));
        let recovered = rebalancer.recover().await?;

        let topology = store.cached();
        info!(
            generation = topology.generation,
            shards = topology.shards.len(),
            strategy = %topology.strategy,
            recovered,
            "Shard coordinator ready"
        );
        Ok(ShardCoordinator {
            config,
            store,
            registry,
            router,
            rebalancer,
            metrics,
            background: Mutex::new(None),
        })
    }
}

impl std::fmt::Debug for CoordinatorBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinatorBuilder")
            .field("config", &self.config)
            .field("shards", &self.shards)
            .finish()
    }
}
