//! Configuration types for the shard coordinator.

use crate::error::{Error, Result};
use crate::partitioning::StrategyKind;
use crate::router::RetryPolicy;
use std::time::Duration;

/// Main configuration for the shard coordinator.
#[derive(Debug, Clone, Default)]
pub struct CoordinatorConfig {
    /// Strategy used to bootstrap an empty topology.
    pub strategy: StrategyKind,

    /// Request routing configuration.
    pub router: RouterConfig,

    /// Migration and rebalancing configuration.
    pub rebalance: RebalanceConfig,

    /// Topology store configuration.
    pub topology: TopologyConfig,
}

impl CoordinatorConfig {
    pub fn new(strategy: StrategyKind) -> Self {
        Self {
            strategy,
            ..Default::default()
        }
    }

    /// Set the bootstrap strategy.
    pub fn with_strategy(mut self, strategy: StrategyKind) -> Self {
        self.strategy = strategy;
        self
    }

    /// Set router configuration.
    pub fn with_router_config(mut self, router: RouterConfig) -> Self {
        self.router = router;
        self
    }

    /// Set rebalance configuration.
    pub fn with_rebalance_config(mut self, rebalance: RebalanceConfig) -> Self {
        self.rebalance = rebalance;
        self
    }

    /// Set topology store configuration.
    pub fn with_topology_config(mut self, topology: TopologyConfig) -> Self {
        self.topology = topology;
        self
    }

    /// Validate every section.
    pub fn validate(&self) -> Result<()> {
        self.strategy.validate()?;
        self.router.validate()?;
        self.rebalance.validate()?;
        self.topology.validate()
    }
}

/// Router configuration.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Deadline applied to operations that do not carry one.
    pub default_deadline: Duration,

    /// Timeout for a single backend call.
    pub call_timeout: Duration,

    /// Retry policy for transient shard errors.
    pub retry: RetryPolicy,

    /// Maximum age of the cached snapshot before it is re-read from the
    /// topology store.
    pub snapshot_ttl: Duration,

    /// Page size used by scatter scans and counts.
    pub scan_page_size: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            default_deadline: Duration::from_secs(5),
            call_timeout: Duration::from_secs(1),
            retry: RetryPolicy::default(),
            snapshot_ttl: Duration::from_secs(1),
            scan_page_size: 1000,
        }
    }
}

impl RouterConfig {
    pub fn with_default_deadline(mut self, deadline: Duration) -> Self {
        self.default_deadline = deadline;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_snapshot_ttl(mut self, ttl: Duration) -> Self {
        self.snapshot_ttl = ttl;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.default_deadline.is_zero() {
            return Err(Error::Config("default_deadline must be > 0".to_string()));
        }
        if self.call_timeout.is_zero() {
            return Err(Error::Config("call_timeout must be > 0".to_string()));
        }
        if self.scan_page_size == 0 {
            return Err(Error::Config("scan_page_size must be > 0".to_string()));
        }
        self.retry.validate()
    }
}

/// Rebalancer configuration.
#[derive(Debug, Clone)]
pub struct RebalanceConfig {
    /// Entries copied per scan page.
    pub batch_size: usize,

    /// Pause between copy pages, to throttle migration traffic.
    pub batch_delay: Duration,

    /// Timeout for a single backend call made by a migration.
    pub call_timeout: Duration,

    /// Upper bound on the whole verification phase.
    pub verify_timeout: Duration,

    /// Catch-up stops once at most this many keys were replayed in a round.
    pub catchup_tolerance: usize,

    /// Pause between catch-up rounds.
    pub catchup_interval: Duration,

    /// Upper bound on waiting for in-flight writes once a span is fenced.
    pub fence_timeout: Duration,

    /// Compare the full span on both shards before cutover.
    pub verify_full_compare: bool,

    /// Maximum migrations running at once.
    pub max_concurrent_migrations: usize,

    /// Attempts before a failed task is given up on.
    pub max_attempts: u32,

    /// Pause before a failed task is retried.
    pub retry_delay: Duration,

    /// A shard is skewed when its load exceeds `skew_factor` times the mean.
    pub skew_factor: f64,

    /// Run skew detection from the background loop.
    pub auto_rebalance: bool,

    /// Background loop period.
    pub tick_interval: Duration,

    /// Completed tasks kept for inspection.
    pub max_history: usize,
}

impl Default for RebalanceConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            batch_delay: Duration::ZERO,
            call_timeout: Duration::from_secs(5),
            verify_timeout: Duration::from_secs(30),
            catchup_tolerance: 16,
            catchup_interval: Duration::from_millis(10),
            fence_timeout: Duration::from_secs(5),
            verify_full_compare: true,
            max_concurrent_migrations: 4,
            max_attempts: 3,
            retry_delay: Duration::from_millis(100),
            skew_factor: 1.5,
            auto_rebalance: false,
            tick_interval: Duration::from_secs(1),
            max_history: 100,
        }
    }
}

impl RebalanceConfig {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_batch_delay(mut self, delay: Duration) -> Self {
        self.batch_delay = delay;
        self
    }

    pub fn with_verify_timeout(mut self, timeout: Duration) -> Self {
        self.verify_timeout = timeout;
        self
    }

    pub fn with_catchup_tolerance(mut self, tolerance: usize) -> Self {
        self.catchup_tolerance = tolerance;
        self
    }

    pub fn with_max_concurrent_migrations(mut self, max: usize) -> Self {
        self.max_concurrent_migrations = max;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_fence_timeout(mut self, timeout: Duration) -> Self {
        self.fence_timeout = timeout;
        self
    }

    pub fn with_verify_full_compare(mut self, enabled: bool) -> Self {
        self.verify_full_compare = enabled;
        self
    }

    pub fn with_skew_factor(mut self, factor: f64) -> Self {
        self.skew_factor = factor;
        self
    }

    pub fn with_auto_rebalance(mut self, enabled: bool) -> Self {
        self.auto_rebalance = enabled;
        self
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be > 0".to_string()));
        }
        if self.max_concurrent_migrations == 0 {
            return Err(Error::Config("max_concurrent_migrations must be > 0".to_string()));
        }
        if self.max_attempts == 0 {
            return Err(Error::Config("max_attempts must be > 0".to_string()));
        }
        if !(self.skew_factor > 1.0) {
            return Err(Error::Config("skew_factor must be > 1.0".to_string()));
        }
        if self.verify_timeout.is_zero() || self.call_timeout.is_zero() {
            return Err(Error::Config("migration timeouts must be > 0".to_string()));
        }
        if self.tick_interval.is_zero() {
            return Err(Error::Config("tick_interval must be > 0".to_string()));
        }
        Ok(())
    }
}

/// Topology store configuration.
#[derive(Debug, Clone)]
pub struct TopologyConfig {
    /// Timeout for a single persistence call.
    pub call_timeout: Duration,

    /// Attempts `update` makes before surfacing `StaleGeneration`.
    pub max_update_attempts: u32,

    /// Base pause between `update` attempts, multiplied by the attempt number.
    pub update_backoff: Duration,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(2),
            max_update_attempts: 8,
            update_backoff: Duration::from_millis(5),
        }
    }
}

impl TopologyConfig {
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_max_update_attempts(mut self, attempts: u32) -> Self {
        self.max_update_attempts = attempts;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.call_timeout.is_zero() {
            return Err(Error::Config("topology call_timeout must be > 0".to_string()));
        }
        if self.max_update_attempts == 0 {
            return Err(Error::Config("max_update_attempts must be > 0".to_string()));
        }
        Ok(())
    }
}
