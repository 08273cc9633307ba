//! Shard id -> backend handle registry.

use super::ShardBackend;
use crate::error::{Error, Result};
use crate::topology::Topology;
use crate::types::ShardId;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Turns a shard address into a backend handle.
#[async_trait]
pub trait BackendConnector: Send + Sync + std::fmt::Debug {
    async fn connect(&self, address: &str) -> Result<Arc<dyn ShardBackend>>;
}

/// Live backend handles, keyed by shard id.
#[derive(Debug)]
pub struct BackendRegistry {
    backends: DashMap<ShardId, Arc<dyn ShardBackend>>,
    connector: Arc<dyn BackendConnector>,
}

impl BackendRegistry {
    pub fn new(connector: Arc<dyn BackendConnector>) -> Self {
        Self {
            backends: DashMap::new(),
            connector,
        }
    }

    /// Backend for a shard.
    pub fn get(&self, shard: ShardId) -> Result<Arc<dyn ShardBackend>> {
        self.backends
            .get(&shard)
            .map(|b| b.value().clone())
            .ok_or(Error::ShardNotFound(shard))
    }

    pub fn contains(&self, shard: ShardId) -> bool {
        self.backends.contains_key(&shard)
    }

    /// Connect to `address` and register it as `shard`.
    pub async fn connect(&self, shard: ShardId, address: &str) -> Result<Arc<dyn ShardBackend>> {
        let backend = self.connector.connect(address).await?;
        self.backends.insert(shard, backend.clone());
        info!(shard, address, "Connected shard backend");
        Ok(backend)
    }

    pub fn remove(&self, shard: ShardId) -> Option<Arc<dyn ShardBackend>> {
        let removed = self.backends.remove(&shard).map(|(_, b)| b);
        if removed.is_some() {
            debug!(shard, "Dropped shard backend");
        }
        removed
    }

    /// Connect every shard in `topology` that has no handle yet, and drop
    /// handles for shards no longer present.
    pub async fn sync(&self, topology: &Topology) -> Result<()> {
        for (&shard, entry) in &topology.shards {
            if !self.contains(shard) {
                self.connect(shard, &entry.address).await?;
            }
        }
        let stale: Vec<ShardId> = self
            .backends
            .iter()
            .map(|e| *e.key())
            .filter(|id| !topology.shards.contains_key(id))
            .collect();
        for shard in stale {
            self.remove(shard);
        }
        Ok(())
    }

    pub fn shard_ids(&self) -> Vec<ShardId> {
        let mut ids: Vec<ShardId> = self.backends.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryConnector;
    use crate::partitioning::StrategyKind;
    use crate::topology::TopologyMutation;

    #[tokio::test]
    async fn test_sync_follows_topology() {
        let registry = BackendRegistry::new(Arc::new(InMemoryConnector::new()));
        let topo = Topology::bootstrap(
            StrategyKind::hash(),
            &["mem://a".to_string(), "mem://b".to_string()],
        )
        .unwrap();
        registry.sync(&topo).await.unwrap();
        assert_eq!(registry.shard_ids(), vec![0, 1]);
        assert!(matches!(registry.get(5), Err(Error::ShardNotFound(5))));

        let topo = topo
            .apply(&TopologyMutation::AddShard { id: 2, address: "mem://c".into() })
            .unwrap()
            .apply(&TopologyMutation::RemoveShard { shard: 2 })
            .unwrap();
        registry.connect(2, "mem://c").await.unwrap();
        registry.sync(&topo).await.unwrap();
        assert_eq!(registry.shard_ids(), vec![0, 1]);
    }
}
