//! Error types for the shard coordinator.

use crate::types::ShardId;
use std::io;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Result type alias for coordinator operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the shard coordinator.
#[derive(Error, Debug)]
pub enum Error {
    /// Optimistic-concurrency conflict on a topology write.
    #[error("stale generation: based on {expected}, current is {actual}")]
    StaleGeneration { expected: u64, actual: u64 },

    /// The topology has no shards to route to.
    #[error("no shards available")]
    NoShardsAvailable,

    /// A shard failed health checks or exhausted the retry budget.
    #[error("shard {shard} unavailable: {reason}")]
    ShardUnavailable { shard: ShardId, reason: String },

    /// The shard rejected the key because it does not own it (anymore, or yet).
    #[error("shard {shard} does not own the requested key")]
    NotOwner { shard: ShardId },

    /// A migration task could not complete.
    #[error("migration {task} failed: {reason}")]
    MigrationFailed { task: Uuid, reason: String },

    /// The client deadline elapsed.
    ///
    /// Shard operations that were already dispatched are not cancelled and
    /// may still complete.
    #[error("deadline exceeded after {elapsed:?}; dispatched shard operations may still complete")]
    DeadlineExceeded { elapsed: Duration },

    /// Writes to the span are paused while its ownership is cut over.
    #[error("span on shard {shard} is fenced for cutover")]
    MigrationFenced { shard: ShardId },

    /// Another migration already covers (part of) the span.
    #[error("migration conflict: {0}")]
    MigrationConflict(String),

    /// The topology persistence layer could not be reached.
    #[error("topology store unavailable: {0}")]
    TopologyUnavailable(String),

    /// The router is serving a possibly stale snapshot and refused the operation.
    #[error("router degraded: {0}")]
    Degraded(String),

    /// A topology failed validation (coverage, references).
    #[error("invalid topology: {0}")]
    InvalidTopology(String),

    /// A mutation cannot be applied to the current topology.
    #[error("invalid mutation: {0}")]
    InvalidMutation(String),

    /// Shard not present in the topology or backend registry.
    #[error("shard not found: {0}")]
    ShardNotFound(ShardId),

    /// Error returned by a shard backend.
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    /// Persistence (serialization or I/O) errors.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// Configuration errors.
    #[error("config error: {0}")]
    Config(String),

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the router may retry locally before surfacing the error.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::StaleGeneration { .. }
            | Error::NotOwner { .. }
            | Error::MigrationFenced { .. } => true,
            Error::Backend(e) => e.is_transient(),
            _ => false,
        }
    }

    /// Short label used for error metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Error::StaleGeneration { .. } => "stale_generation",
            Error::NoShardsAvailable => "no_shards",
            Error::ShardUnavailable { .. } => "shard_unavailable",
            Error::NotOwner { .. } => "not_owner",
            Error::MigrationFailed { .. } => "migration_failed",
            Error::DeadlineExceeded { .. } => "deadline_exceeded",
            Error::MigrationFenced { .. } => "fenced",
            Error::MigrationConflict(_) => "migration_conflict",
            Error::TopologyUnavailable(_) => "topology_unavailable",
            Error::Degraded(_) => "degraded",
            Error::InvalidTopology(_) => "invalid_topology",
            Error::InvalidMutation(_) => "invalid_mutation",
            Error::ShardNotFound(_) => "shard_not_found",
            Error::Backend(_) => "backend",
            Error::Persistence(_) => "persistence",
            Error::Config(_) => "config",
            Error::Internal(_) => "internal",
        }
    }
}

/// Errors reported by a shard backend adapter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// The backend could not be reached.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// The call did not complete within its timeout.
    #[error("backend call timed out")]
    Timeout,

    /// The shard does not own the key.
    #[error("shard does not own key")]
    NotOwner,

    /// Non-retryable backend failure.
    #[error("backend failure: {0}")]
    Internal(String),
}

impl BackendError {
    /// Timeouts and unreachable backends are worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, BackendError::Unavailable(_) | BackendError::Timeout)
    }
}

/// Result type for backend adapter calls.
pub type BackendResult<T> = std::result::Result<T, BackendError>;

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Persistence(e.to_string())
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Persistence(e.to_string())
    }
}
