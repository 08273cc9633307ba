//! Migration tasks and their state machine.

use crate::error::{Error, Result};
use crate::partitioning::Placement;
use crate::types::{ShardId, Span};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Status of a migration task.
///
/// ```text
/// Pending ──► Copying ──► Verifying ──► Cutover ──► Done
///    ▲           │            │            │
///    └─ requeue ─┴── Failed ◄─┘            └──► Failed (needs intervention)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MigrationStatus {
    Pending,
    /// Bulk copy from source to destination; the source keeps serving.
    Copying,
    /// Catch-up replay, fence, final replay and comparison.
    Verifying,
    /// Publishing the ownership change.
    Cutover,
    Done,
    Failed,
}

impl fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MigrationStatus::Pending => write!(f, "pending"),
            MigrationStatus::Copying => write!(f, "copying"),
            MigrationStatus::Verifying => write!(f, "verifying"),
            MigrationStatus::Cutover => write!(f, "cutover"),
            MigrationStatus::Done => write!(f, "done"),
            MigrationStatus::Failed => write!(f, "failed"),
        }
    }
}

impl MigrationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, MigrationStatus::Done | MigrationStatus::Failed)
    }

    pub fn can_transition_to(&self, next: MigrationStatus) -> bool {
        use MigrationStatus::*;
        matches!(
            (self, next),
            (Pending, Copying)
                | (Copying, Verifying)
                | (Verifying, Cutover)
                | (Cutover, Done)
                | (Copying, Failed)
                | (Verifying, Failed)
                | (Cutover, Failed)
                | (Pending, Failed)
                | (Failed, Pending)
        )
    }
}

/// Why a migration was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MigrationReason {
    Manual,
    AddShard,
    RemoveShard,
    Skew,
    Restrategy,
    TagAssignment,
}

impl fmt::Display for MigrationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MigrationReason::Manual => "manual",
            MigrationReason::AddShard => "add_shard",
            MigrationReason::RemoveShard => "remove_shard",
            MigrationReason::Skew => "skew",
            MigrationReason::Restrategy => "restrategy",
            MigrationReason::TagAssignment => "tag_assignment",
        };
        write!(f, "{}", name)
    }
}

/// Where a task moves data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskRoute {
    /// Hand one span from `source` to `dest`.
    Move { source: ShardId, dest: ShardId },
    /// Copy every key to its owner under `target` and cut over by replacing
    /// the placement. Used for modulo membership changes and re-strategy.
    Reshard { target: Placement },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationProgress {
    pub copied_entries: u64,
    pub copied_bytes: u64,
    pub catchup_rounds: u32,
    pub replayed_keys: u64,
    /// Entries garbage-collected from the source after cutover.
    pub removed_entries: u64,
}

/// A unit of rebalancing work, persisted so it survives restarts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationTask {
    pub id: Uuid,
    pub span: Span,
    pub route: TaskRoute,
    pub status: MigrationStatus,
    /// Generation that published the ownership change.
    pub cutover_generation: Option<u64>,
    pub attempts: u32,
    pub error: Option<String>,
    /// Set when the cutover write failed in a way that may or may not have
    /// been applied.
    pub needs_intervention: bool,
    pub progress: MigrationProgress,
    pub reason: MigrationReason,
    /// Milliseconds since the Unix epoch.
    pub created_at_ms: u64,
}

impl MigrationTask {
    fn new(span: Span, route: TaskRoute, reason: MigrationReason) -> Self {
        Self {
            id: Uuid::new_v4(),
            span,
            route,
            status: MigrationStatus::Pending,
            cutover_generation: None,
            attempts: 0,
            error: None,
            needs_intervention: false,
            progress: MigrationProgress::default(),
            reason,
            created_at_ms: now_ms(),
        }
    }

    /// Move `span` from `source` to `dest`.
    pub fn moving(span: Span, source: ShardId, dest: ShardId, reason: MigrationReason) -> Self {
        Self::new(span, TaskRoute::Move { source, dest }, reason)
    }

    /// Redistribute the whole keyspace under `target`.
    pub fn reshard(target: Placement, reason: MigrationReason) -> Self {
        Self::new(Span::All, TaskRoute::Reshard { target }, reason)
    }

    pub fn source(&self) -> Option<ShardId> {
        match self.route {
            TaskRoute::Move { source, .. } => Some(source),
            TaskRoute::Reshard { .. } => None,
        }
    }

    pub fn dest(&self) -> Option<ShardId> {
        match self.route {
            TaskRoute::Move { dest, .. } => Some(dest),
            TaskRoute::Reshard { .. } => None,
        }
    }

    /// Whether the task sends data to `shard`.
    pub fn targets(&self, shard: ShardId) -> bool {
        match &self.route {
            TaskRoute::Move { dest, .. } => *dest == shard,
            TaskRoute::Reshard { target } => target.references(shard),
        }
    }

    /// Whether the task takes data from `shard`.
    pub fn drains(&self, shard: ShardId) -> bool {
        match &self.route {
            TaskRoute::Move { source, .. } => *source == shard,
            TaskRoute::Reshard { .. } => true,
        }
    }

    /// Advance the state machine.
    pub fn transition(&mut self, next: MigrationStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::Internal(format!(
                "migration {}: illegal transition {} -> {}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        Ok(())
    }

    /// Mark the task failed.
    pub fn fail(&mut self, reason: impl Into<String>) {
        self.status = MigrationStatus::Failed;
        self.error = Some(reason.into());
    }

    /// Put a failed task back in the queue, counting the attempt.
    pub fn requeue(&mut self) -> Result<()> {
        self.transition(MigrationStatus::Pending)?;
        self.attempts += 1;
        self.progress = MigrationProgress::default();
        Ok(())
    }

    /// Whether the task may be retried.
    pub fn is_retryable(&self, max_attempts: u32) -> bool {
        self.status == MigrationStatus::Failed && !self.needs_intervention && self.attempts + 1 < max_attempts
    }

    /// Error to surface for a failed task.
    pub fn to_error(&self) -> Error {
        Error::MigrationFailed {
            task: self.id,
            reason: self.error.clone().unwrap_or_else(|| "unknown".to_string()),
        }
    }
}

impl fmt::Display for MigrationTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.route {
            TaskRoute::Move { source, dest } => write!(
                f,
                "{} {}: {} -> {} [{}]",
                self.id, self.span, source, dest, self.status
            ),
            TaskRoute::Reshard { target } => write!(
                f,
                "{} reshard to {} [{}]",
                self.id,
                target.name(),
                self.status
            ),
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
