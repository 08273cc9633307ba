//! Client operation and result types.

use crate::types::{KeyRange, OperationId, ShardId};
use bytes::Bytes;
use std::time::Duration;
use uuid::Uuid;

/// What to do with a single key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyCommand {
    Get,
    Put(Bytes),
    Delete,
}

/// An operation on one key.
#[derive(Debug, Clone)]
pub struct SingleKeyOp {
    pub key: Bytes,
    pub command: KeyCommand,
    /// Carried to the backend with every attempt of a write so retries are
    /// applied at most once.
    pub op_id: OperationId,
    /// Overrides the router's default deadline.
    pub deadline: Option<Duration>,
}

impl SingleKeyOp {
    fn new(key: impl Into<Bytes>, command: KeyCommand) -> Self {
        Self {
            key: key.into(),
            command,
            op_id: Uuid::new_v4(),
            deadline: None,
        }
    }

    pub fn get(key: impl Into<Bytes>) -> Self {
        Self::new(key, KeyCommand::Get)
    }

    pub fn put(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self::new(key, KeyCommand::Put(value.into()))
    }

    pub fn delete(key: impl Into<Bytes>) -> Self {
        Self::new(key, KeyCommand::Delete)
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_op_id(mut self, op_id: OperationId) -> Self {
        self.op_id = op_id;
        self
    }

    pub fn is_write(&self) -> bool {
        !matches!(self.command, KeyCommand::Get)
    }

    /// Label used in metrics and logs.
    pub fn name(&self) -> &'static str {
        match self.command {
            KeyCommand::Get => "get",
            KeyCommand::Put(_) => "put",
            KeyCommand::Delete => "delete",
        }
    }
}

/// Outcome of a single-key operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecuteResult {
    /// The value read, for `Get`.
    pub value: Option<Bytes>,
    /// Shard that served the operation.
    pub shard: ShardId,
    /// Topology generation the operation was routed with.
    pub generation: u64,
    /// Backend calls made, including retries.
    pub attempts: u32,
}

/// What a scatter-gather operation computes on each shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MultiKeyCommand {
    /// Count entries.
    Count,
    /// Collect up to `limit` entries in key order.
    Scan { limit: usize },
    /// Fetch the given keys.
    MultiGet(Vec<Bytes>),
}

/// An operation fanned out across shards.
#[derive(Debug, Clone)]
pub struct MultiKeyOp {
    pub command: MultiKeyCommand,
    /// Fail the whole operation if any shard fails, instead of returning a
    /// partial result.
    pub all_or_nothing: bool,
    pub deadline: Option<Duration>,
}

impl MultiKeyOp {
    fn new(command: MultiKeyCommand) -> Self {
        Self {
            command,
            all_or_nothing: false,
            deadline: None,
        }
    }

    pub fn count() -> Self {
        Self::new(MultiKeyCommand::Count)
    }

    pub fn scan(limit: usize) -> Self {
        Self::new(MultiKeyCommand::Scan { limit })
    }

    pub fn multi_get(keys: Vec<Bytes>) -> Self {
        Self::new(MultiKeyCommand::MultiGet(keys))
    }

    pub fn all_or_nothing(mut self) -> Self {
        self.all_or_nothing = true;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn name(&self) -> &'static str {
        match self.command {
            MultiKeyCommand::Count => "count",
            MultiKeyCommand::Scan { .. } => "scan",
            MultiKeyCommand::MultiGet(_) => "multi_get",
        }
    }
}

/// Which shards a scatter-gather operation reaches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScatterPredicate {
    /// Every shard owning part of the keyspace.
    All,
    /// Only keys inside the range, and only shards that may hold them.
    KeyRange(KeyRange),
    /// An explicit shard list.
    Shards(Vec<ShardId>),
}

impl ScatterPredicate {
    /// Key interval the predicate restricts scans to.
    pub fn range(&self) -> KeyRange {
        match self {
            ScatterPredicate::KeyRange(range) => range.clone(),
            _ => KeyRange::full(),
        }
    }
}

/// Merged per-shard results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Aggregate {
    Count(u64),
    /// Entries in key order.
    Entries(Vec<(Bytes, Bytes)>),
    /// Values aligned with the requested keys.
    Values(Vec<Option<Bytes>>),
}

/// Result of a scatter-gather operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateResult {
    pub value: Aggregate,
    /// Some targeted shard did not contribute.
    pub partial: bool,
    /// Shards that failed, with the reason.
    pub failed_shards: Vec<(ShardId, String)>,
    pub generation: u64,
}

impl AggregateResult {
    /// The count, for `Count` operations.
    pub fn count(&self) -> Option<u64> {
        match self.value {
            Aggregate::Count(n) => Some(n),
            _ => None,
        }
    }

    pub fn entries(&self) -> Option<&[(Bytes, Bytes)]> {
        match &self.value {
            Aggregate::Entries(entries) => Some(entries),
            _ => None,
        }
    }

    pub fn failed_shard_ids(&self) -> Vec<ShardId> {
        self.failed_shards.iter().map(|(id, _)| *id).collect()
    }
}
