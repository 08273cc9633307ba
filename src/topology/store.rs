//! The topology store: CAS writes and snapshot publication.

use super::model::Topology;
use super::mutation::TopologyMutation;
use super::persistence::TopologyPersistence;
use crate::config::TopologyConfig;
use crate::error::{Error, Result};
use crate::metrics::CoordinatorMetrics;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Single source of truth for the topology.
///
/// Writes go through [`apply_mutation`](Self::apply_mutation), which is a
/// compare-and-swap on the generation, in this process and across every
/// process sharing the persistence. A new topology is durably persisted
/// before it is published on the watch channel, so readers never observe a
/// generation that could be lost.
pub struct TopologyStore {
    persistence: Arc<dyn TopologyPersistence>,
    config: TopologyConfig,
    published: watch::Sender<Arc<Topology>>,
    metrics: Arc<CoordinatorMetrics>,
}

impl TopologyStore {
    /// Open the store, persisting `initial` if nothing is stored yet.
    ///
    /// `initial` must be a generation-1 topology (see `Topology::bootstrap`)
    /// or an empty generation-0 one.
    pub async fn open(
        persistence: Arc<dyn TopologyPersistence>,
        config: TopologyConfig,
        initial: Topology,
        metrics: Arc<CoordinatorMetrics>,
    ) -> Result<Self> {
        config.validate()?;
        let timeout = config.call_timeout;
        let current = match with_timeout(timeout, persistence.load()).await? {
            Some(stored) => {
                info!(generation = stored.generation, shards = stored.shards.len(), "Loaded persisted topology");
                stored
            }
            None if initial.generation == 0 => initial,
            None => {
                initial.validate()?;
                match with_timeout(timeout, persistence.compare_and_swap(0, &initial)).await {
                    Ok(()) => {
                        info!(generation = initial.generation, shards = initial.shards.len(), "Bootstrapped topology");
                        initial
                    }
                    Err(Error::StaleGeneration { .. }) => with_timeout(timeout, persistence.load())
                        .await?
                        .ok_or_else(|| Error::Internal("topology vanished during bootstrap".to_string()))?,
                    Err(e) => return Err(e),
                }
            }
        };
        metrics.topology_generation.set(current.generation as i64);
        let (published, _) = watch::channel(Arc::new(current));

        Ok(Self {
            persistence,
            config,
            published,
            metrics,
        })
    }

    /// Latest published snapshot, without touching persistence.
    pub fn cached(&self) -> Arc<Topology> {
        self.published.borrow().clone()
    }

    /// Subscribe to newly published snapshots.
    pub fn subscribe(&self) -> watch::Receiver<Arc<Topology>> {
        self.published.subscribe()
    }

    pub fn persistence(&self) -> &Arc<dyn TopologyPersistence> {
        &self.persistence
    }

    /// Latest generation from the persistence layer.
    ///
    /// Picks up writes made by other processes sharing the same persistence
    /// and republishes them locally.
    pub async fn get_snapshot(&self) -> Result<Arc<Topology>> {
        let loaded = with_timeout(self.config.call_timeout, self.persistence.load()).await?;
        match loaded {
            Some(topology) => Ok(self.publish(topology)),
            None => Ok(self.cached()),
        }
    }

    /// Apply `mutation` if `base_generation` is still current.
    ///
    /// Returns the new generation, or `Error::StaleGeneration` if another
    /// writer got there first.
    pub async fn apply_mutation(&self, base_generation: u64, mutation: TopologyMutation) -> Result<u64> {
        self.apply(base_generation, &mutation).await.map(|t| t.generation)
    }

    async fn apply(&self, base_generation: u64, mutation: &TopologyMutation) -> Result<Arc<Topology>> {
        // No lock is held across the persistence calls: the CAS below is what
        // turns away a writer that raced past this check.
        let current = self.get_snapshot().await?;
        if current.generation != base_generation {
            self.metrics.stale_generation_conflicts.inc();
            return Err(Error::StaleGeneration {
                expected: base_generation,
                actual: current.generation,
            });
        }

        let next = current.apply(mutation)?;
        if let Err(e) = with_timeout(self.config.call_timeout, self.persistence.compare_and_swap(base_generation, &next)).await {
            if matches!(e, Error::StaleGeneration { .. }) {
                self.metrics.stale_generation_conflicts.inc();
            }
            return Err(e);
        }

        self.metrics.topology_mutations.inc([mutation.name()]);
        info!(
            generation = next.generation,
            mutation = %mutation,
            "Applied topology mutation"
        );
        Ok(self.publish(next))
    }

    /// Optimistic update: build a mutation from the latest snapshot and apply
    /// it, re-reading and rebuilding on `StaleGeneration`.
    ///
    /// `build` may return an error to abort, e.g. when a precondition no
    /// longer holds on the fresh snapshot.
    pub async fn update<F>(&self, mut build: F) -> Result<Arc<Topology>>
    where
        F: FnMut(&Topology) -> Result<TopologyMutation>,
    {
        let mut last_err = None;
        for attempt in 0..self.config.max_update_attempts {
            let snapshot = self.get_snapshot().await?;
            let mutation = build(&snapshot)?;
            match self.apply(snapshot.generation, &mutation).await {
                Ok(topology) => return Ok(topology),
                Err(e @ Error::StaleGeneration { .. }) => {
                    debug!(attempt, error = %e, "Topology update raced; retrying");
                    last_err = Some(e);
                    tokio::time::sleep(self.config.update_backoff * (attempt + 1)).await;
                }
                Err(e) => return Err(e),
            }
        }
        warn!(attempts = self.config.max_update_attempts, "Topology update gave up after repeated conflicts");
        Err(last_err.unwrap_or_else(|| Error::Internal("no update attempts configured".to_string())))
    }

    fn publish(&self, topology: Topology) -> Arc<Topology> {
        let generation = topology.generation;
        let topology = Arc::new(topology);
        let published = self.published.send_if_modified(|current| {
            if generation > current.generation {
                *current = topology.clone();
                true
            } else {
                false
            }
        });
        if published {
            self.metrics.topology_generation.set(generation as i64);
            debug!(generation, "Published topology snapshot");
            topology
        } else {
            self.cached()
        }
    }
}

impl std::fmt::Debug for TopologyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopologyStore")
            .field("generation", &self.published.borrow().generation)
            .field("config", &self.config)
            .finish()
    }
}

async fn with_timeout<T>(
    duration: std::time::Duration,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(duration, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::TopologyUnavailable(format!(
            "persistence call timed out after {:?}",
            duration
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partitioning::StrategyKind;
    use crate::topology::InMemoryPersistence;
    use crate::types::ShardState;

    async fn open_store(persistence: Arc<InMemoryPersistence>) -> TopologyStore {
        let initial = Topology::bootstrap(
            StrategyKind::hash(),
            &["mem://a".to_string(), "mem://b".to_string()],
        )
        .unwrap();
        TopologyStore::open(persistence, TopologyConfig::default(), initial, Arc::new(CoordinatorMetrics::new()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_open_bootstraps_once() {
        let persistence = Arc::new(InMemoryPersistence::new());
        let store = open_store(persistence.clone()).await;
        assert_eq!(store.cached().generation, 1);

        store
            .apply_mutation(1, TopologyMutation::SetShardState { shard: 1, state: ShardState::Draining })
            .await
            .unwrap();

        let reopened = open_store(persistence).await;
        assert_eq!(reopened.cached().generation, 2);
    }

    #[tokio::test]
    async fn test_apply_mutation_increments_generation_by_one() {
        let store = open_store(Arc::new(InMemoryPersistence::new())).await;
        let mut rx = store.subscribe();

        let generation = store
            .apply_mutation(1, TopologyMutation::AddShard { id: 2, address: "mem://c".into() })
            .await
            .unwrap();
        assert_eq!(generation, 2);

        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().generation, 2);
        assert_eq!(store.get_snapshot().await.unwrap().generation, 2);
    }

    #[tokio::test]
    async fn test_stale_base_is_rejected() {
        let store = open_store(Arc::new(InMemoryPersistence::new())).await;
        store
            .apply_mutation(1, TopologyMutation::SetShardState { shard: 0, state: ShardState::Draining })
            .await
            .unwrap();

        let err = store
            .apply_mutation(1, TopologyMutation::SetShardState { shard: 1, state: ShardState::Draining })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::StaleGeneration { expected: 1, actual: 2 }));
    }

    #[tokio::test]
    async fn test_invalid_mutation_does_not_bump_generation() {
        let store = open_store(Arc::new(InMemoryPersistence::new())).await;
        let err = store
            .apply_mutation(1, TopologyMutation::RemoveShard { shard: 0 })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidMutation(_)));
        assert_eq!(store.get_snapshot().await.unwrap().generation, 1);
    }

    #[tokio::test]
    async fn test_unavailable_persistence_surfaces() {
        let persistence = Arc::new(InMemoryPersistence::new());
        let store = open_store(persistence.clone()).await;
        persistence.set_available(false);

        assert!(matches!(store.get_snapshot().await, Err(Error::TopologyUnavailable(_))));
        assert_eq!(store.cached().generation, 1);
    }

    #[tokio::test]
    async fn test_update_rebuilds_on_conflict() {
        let persistence = Arc::new(InMemoryPersistence::new());
        let store = open_store(persistence.clone()).await;

        // A second store over the same persistence plays the competing writer.
        let other = open_store(persistence).await;
        let mut raced = false;
        let result = store
            .update(|snapshot| {
                if !raced {
                    raced = true;
                    let next = snapshot.apply(&TopologyMutation::SetShardState {
                        shard: 0,
                        state: ShardState::Draining,
                    })?;
                    futures::executor::block_on(other.persistence().compare_and_swap(snapshot.generation, &next))?;
                }
                Ok(TopologyMutation::SetShardState { shard: 1, state: ShardState::Draining })
            })
            .await
            .unwrap();

        assert_eq!(result.generation, 3);
        assert_eq!(result.state_of(0), Some(ShardState::Draining));
        assert_eq!(result.state_of(1), Some(ShardState::Draining));
    }

    #[tokio::test]
    async fn test_racing_writers_are_settled_by_persistence() {
        let persistence = Arc::new(InMemoryPersistence::new());
        let store = open_store(persistence.clone()).await;
        // Slow persistence keeps both writers between their read and their CAS.
        persistence.set_latency(Some(std::time::Duration::from_millis(20)));

        let (first, second) = tokio::join!(
            store.apply_mutation(1, TopologyMutation::AddShard { id: 2, address: "mem://c".into() }),
            store.apply_mutation(1, TopologyMutation::SetShardState { shard: 0, state: ShardState::Draining }),
        );
        let results = [first, second];
        assert_eq!(results.iter().filter(|r| matches!(r, Ok(2))).count(), 1);
        assert_eq!(
            results
                .iter()
                .filter(|r| matches!(r, Err(Error::StaleGeneration { expected: 1, actual: 2 })))
                .count(),
            1
        );
        assert_eq!(store.get_snapshot().await.unwrap().generation, 2);
    }
}
