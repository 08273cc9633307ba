//! Coordinator metrics.
//!
//! Counters are plain atomics so the request path never blocks on them;
//! [`CoordinatorMetrics::to_prometheus`] renders the text exposition format.

mod primitives;

pub use primitives::{Counter, Gauge, Histogram, HistogramSnapshot, LabeledCounter, LATENCY_BUCKETS_US};

use crate::types::ShardId;

/// All metrics exported by a coordinator.
#[derive(Debug)]
pub struct CoordinatorMetrics {
    // Router
    pub requests: LabeledCounter<2>,
    pub request_errors: LabeledCounter<1>,
    pub request_latency: Histogram,
    pub retries: Counter,
    pub not_owner_rejections: Counter,
    pub fenced_retries: Counter,
    pub deadline_exceeded: Counter,
    pub degraded_rejections: Counter,
    pub degraded: Gauge,
    pub resolution_cache_misses: Counter,
    pub shard_operations: LabeledCounter<2>,
    pub scatter_requests: Counter,
    pub scatter_partial: Counter,

    // Topology
    pub topology_generation: Gauge,
    pub topology_mutations: LabeledCounter<1>,
    pub stale_generation_conflicts: Counter,

    // Rebalancer
    pub migrations_started: Counter,
    pub migrations_completed: Counter,
    pub migrations_failed: Counter,
    pub migrations_active: Gauge,
    pub migration_duration: Histogram,
    pub entries_copied: Counter,
    pub bytes_copied: Counter,
    pub keys_replayed: Counter,
    pub entries_collected: Counter,
    pub shards_marked_down: Counter,
}

impl CoordinatorMetrics {
    pub fn new() -> Self {
        Self {
            requests: LabeledCounter::new(
                "shardgate_requests_total",
                "Client operations by kind and outcome",
                ["op", "outcome"],
            ),
            request_errors: LabeledCounter::new(
                "shardgate_request_errors_total",
                "Failed client operations by error kind",
                ["error"],
            ),
            request_latency: Histogram::new(
                "shardgate_request_duration_seconds",
                "End-to-end client operation latency",
            ),
            retries: Counter::new("shardgate_retries_total", "Shard calls retried after a transient error"),
            not_owner_rejections: Counter::new(
                "shardgate_not_owner_total",
                "Shard calls rejected because the shard does not own the key",
            ),
            fenced_retries: Counter::new(
                "shardgate_fenced_retries_total",
                "Writes delayed by a cutover fence",
            ),
            deadline_exceeded: Counter::new(
                "shardgate_deadline_exceeded_total",
                "Operations that ran past their deadline",
            ),
            degraded_rejections: Counter::new(
                "shardgate_degraded_rejections_total",
                "Writes refused while serving a possibly stale topology",
            ),
            degraded: Gauge::new("shardgate_router_degraded", "1 while the topology store is unreachable"),
            resolution_cache_misses: Counter::new(
                "shardgate_resolution_cache_misses_total",
                "Topology snapshot refreshes performed by the router",
            ),
            shard_operations: LabeledCounter::new(
                "shardgate_shard_operations_total",
                "Backend calls per shard",
                ["shard", "op"],
            ),
            scatter_requests: Counter::new("shardgate_scatter_requests_total", "Scatter-gather operations"),
            scatter_partial: Counter::new(
                "shardgate_scatter_partial_total",
                "Scatter-gather operations returning partial results",
            ),
            topology_generation: Gauge::new("shardgate_topology_generation", "Latest published topology generation"),
            topology_mutations: LabeledCounter::new(
                "shardgate_topology_mutations_total",
                "Applied topology mutations by kind",
                ["mutation"],
            ),
            stale_generation_conflicts: Counter::new(
                "shardgate_stale_generation_total",
                "Topology writes rejected by generation compare-and-swap",
            ),
            migrations_started: Counter::new("shardgate_migrations_started_total", "Migration tasks started"),
            migrations_completed: Counter::new("shardgate_migrations_completed_total", "Migration tasks done"),
            migrations_failed: Counter::new("shardgate_migrations_failed_total", "Migration task failures"),
            migrations_active: Gauge::new("shardgate_migrations_active", "Migration tasks in flight"),
            migration_duration: Histogram::new(
                "shardgate_migration_duration_seconds",
                "Time from copy start to cutover",
            ),
            entries_copied: Counter::new("shardgate_entries_copied_total", "Entries copied by migrations"),
            bytes_copied: Counter::new("shardgate_bytes_copied_total", "Key and value bytes copied by migrations"),
            keys_replayed: Counter::new(
                "shardgate_keys_replayed_total",
                "Keys re-copied during migration catch-up",
            ),
            entries_collected: Counter::new(
                "shardgate_entries_collected_total",
                "Entries deleted from migration sources after cutover",
            ),
            shards_marked_down: Counter::new(
                "shardgate_shards_marked_down_total",
                "Shards moved to Down by the health sweep",
            ),
        }
    }

    /// Record one backend call against a shard.
    pub fn record_shard_op(&self, shard: ShardId, op: &str) {
        self.shard_operations.inc([&shard.to_string(), op]);
    }

    /// Backend calls recorded against a shard, across all operations.
    pub fn shard_load(&self, shard: ShardId) -> u64 {
        let id = shard.to_string();
        self.shard_operations
            .values()
            .into_iter()
            .filter(|(labels, _)| labels[0] == id)
            .map(|(_, v)| v)
            .sum()
    }

    /// Render every metric in Prometheus text format.
    pub fn to_prometheus(&self) -> String {
        let mut out = String::new();
        self.requests.render(&mut out);
        self.request_errors.render(&mut out);
        self.request_latency.render(&mut out);
        for counter in [
            &self.retries,
            &self.not_owner_rejections,
            &self.fenced_retries,
            &self.deadline_exceeded,
            &self.degraded_rejections,
            &self.resolution_cache_misses,
            &self.scatter_requests,
            &self.scatter_partial,
            &self.stale_generation_conflicts,
            &self.migrations_started,
            &self.migrations_completed,
            &self.migrations_failed,
            &self.entries_copied,
            &self.bytes_copied,
            &self.keys_replayed,
            &self.entries_collected,
            &self.shards_marked_down,
        ] {
            counter.render(&mut out);
        }
        for gauge in [
            &self.degraded,
            &self.topology_generation,
            &self.migrations_active,
        ] {
            gauge.render(&mut out);
        }
        self.shard_operations.render(&mut out);
        self.topology_mutations.render(&mut out);
        self.migration_duration.render(&mut out);
        out
    }
}

impl Default for CoordinatorMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_load_sums_ops() {
        let metrics = CoordinatorMetrics::new();
        metrics.record_shard_op(1, "get");
        metrics.record_shard_op(1, "put");
        metrics.record_shard_op(2, "get");
        assert_eq!(metrics.shard_load(1), 2);
        assert_eq!(metrics.shard_load(2), 1);
        assert_eq!(metrics.shard_load(3), 0);
    }

    #[test]
    fn test_prometheus_output() {
        let metrics = CoordinatorMetrics::new();
        metrics.resolution_cache_misses.inc();
        metrics.topology_generation.set(7);
        metrics.topology_mutations.inc(["add_shard"]);

        let text = metrics.to_prometheus();
        assert!(text.contains("# TYPE shardgate_resolution_cache_misses_total counter"));
        assert!(text.contains("shardgate_resolution_cache_misses_total 1"));
        assert!(text.contains("shardgate_topology_generation 7"));
        assert!(text.contains("shardgate_topology_mutations_total{mutation=\"add_shard\"} 1"));
    }
}
