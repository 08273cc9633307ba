//! End-to-end test support.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          TestCluster                            │
//! │                                                                 │
//! │  ShardCoordinator ──► Router ──► InMemoryBackend  mem://0       │
//! │        │                    └──► InMemoryBackend  mem://1       │
//! │        └──► Rebalancer           ...                            │
//! │                                                                 │
//! │  InMemoryPersistence (shared, survives a coordinator restart)   │
//! │  Fault injection by shard id: unhealthy / unreachable / flaky   │
//! └─────────────────────────────────────────────────────────────────┘
//! ```


use crate::backend::{InMemoryBackend, InMemoryConnector};
use crate::config::{CoordinatorConfig, RebalanceConfig, RouterConfig};
use crate::coordinator::ShardCoordinator;
use crate::partitioning::{resolve, StrategyKind};
use crate::router::{RetryPolicy, SingleKeyOp};
use crate::topology::{InMemoryPersistence, Topology};
use crate::types::ShardId;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;

/// Coordinator over in-memory shards and persistence.
pub struct TestCluster {
    pub coordinator: ShardCoordinator,
    pub connector: Arc<InMemoryConnector>,
    pub persistence: Arc<InMemoryPersistence>,
}

impl TestCluster {
    /// Config with short retry backoff and throttling switched off.
    pub fn fast_config(strategy: StrategyKind) -> CoordinatorConfig {
        CoordinatorConfig::new(strategy)
            .with_router_config(
                RouterConfig::default().with_retry(
                    RetryPolicy::default()
                        .with_jitter(false)
                        .with_initial_backoff(Duration::from_millis(1)),
                ),
            )
            .with_rebalance_config(
                RebalanceConfig::default()
                    .with_batch_size(64)
                    .with_batch_delay(Duration::ZERO)
                    .with_retry_delay(Duration::from_millis(1)),
            )
    }

    pub async fn new(strategy: StrategyKind, shards: usize) -> Self {
        Self::with_config(Self::fast_config(strategy), shards).await
    }

    pub async fn with_config(config: CoordinatorConfig, shards: usize) -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("warn")
            .with_test_writer()
            .try_init();

        let connector = Arc::new(InMemoryConnector::new());
        let persistence = Arc::new(InMemoryPersistence::new());
        let coordinator = ShardCoordinator::builder(config)
            .with_connector(connector.clone())
            .with_persistence(persistence.clone())
            .with_shards((0..shards).map(Self::address))
            .build()
            .await
            .unwrap_or_else(|e| panic!("failed to build test cluster: {}", e));
        Self {
            coordinator,
            connector,
            persistence,
        }
    }

    pub fn address(shard: usize) -> String {
        format!("mem://{}", shard)
    }

    /// Backend of a shard present in the current topology.
    pub fn backend(&self, shard: ShardId) -> Arc<InMemoryBackend> {
        let topology = self.topology();
        let entry = topology
            .shard(shard)
            .unwrap_or_else(|| panic!("shard {} not in topology", shard));
        self.connector.backend(&entry.address)
    }

    pub fn topology(&self) -> Arc<Topology> {
        self.coordinator.snapshot()
    }

    pub fn owner(&self, key: &[u8]) -> ShardId {
        resolve(&self.topology(), key).unwrap().shard
    }

    pub async fn put(&self, key: impl Into<Bytes>, value: impl Into<Bytes>) {
        self.coordinator
            .execute(SingleKeyOp::put(key, value))
            .await
            .unwrap();
    }

    pub async fn get(&self, key: impl Into<Bytes>) -> Option<Bytes> {
        self.coordinator.execute(SingleKeyOp::get(key)).await.unwrap().value
    }

    /// Write `key -> key` for every key through the coordinator.
    pub async fn fill(&self, keys: &[Bytes]) {
        for key in keys {
            self.put(key.clone(), key.clone()).await;
        }
    }

    /// Every key is stored on its owner and on no other shard.
    pub fn assert_placed(&self, keys: &[Bytes]) {
        let topology = self.topology();
        for key in keys {
            let owner = self.owner(key);
            for (&shard, entry) in &topology.shards {
                let held = self.connector.backend(&entry.address).peek(key);
                if shard == owner {
                    assert_eq!(held.as_ref(), Some(key), "{:?} missing on owner {}", key, owner);
                } else {
                    assert!(held.is_none(), "{:?} left behind on shard {}", key, shard);
                }
            }
        }
    }
}

/// `prefix0 .. prefix{n-1}` as keys.
pub fn keys(prefix: &str, n: usize) -> Vec<Bytes> {
    (0..n).map(|i| Bytes::from(format!("{}{}", prefix, i))).collect()
}
