//! The rebalancer: runs migration tasks through their state machine.
//!
//! A task is driven in four steps, each of which can also be called on its
//! own through [`MigrationRun`]:
//!
//! 1. `copy`: page through the source and write the span to the destination
//!    while the source keeps serving.
//! 2. `verify`: replay keys written meanwhile until the backlog is small,
//!    fence the span, drain in-flight writes, replay the rest and compare.
//! 3. `cutover`: publish the ownership change as one topology mutation.
//! 4. `finish`: tell the source to reject the span, delete its copy and
//!    lift the fence.
//!
//! Only `cutover` writes the topology, so a task that fails before it leaves
//! ownership untouched.

use super::backend_call;
use super::events::{EventSink, MigrationEvent};
use super::planner::{Planner, ShardLoads};
use super::task::{MigrationStatus, MigrationTask, TaskRoute};
use super::tracker::{ActiveMigration, MigrationTracker};
use crate::backend::{BackendRegistry, OwnershipFence, ShardBackend};
use crate::config::RebalanceConfig;
use crate::error::{Error, Result};
use crate::metrics::CoordinatorMetrics;
use crate::partitioning::{Placement, StrategyKind};
use crate::router::DownCandidates;
use crate::topology::{Topology, TopologyMutation, TopologyStore};
use crate::types::{KeyRange, ShardId, ShardState, Span};
use bytes::Bytes;
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Background rebalancing and the migration queue.
pub struct Rebalancer {
    config: RebalanceConfig,
    store: Arc<TopologyStore>,
    registry: Arc<BackendRegistry>,
    tracker: Arc<MigrationTracker>,
    candidates: Arc<DownCandidates>,
    metrics: Arc<CoordinatorMetrics>,
    events: Arc<dyn EventSink>,
    planner: Planner,
    queue: Mutex<VecDeque<MigrationTask>>,
    history: Mutex<VecDeque<MigrationTask>>,
    /// Shard load counters at the previous skew check.
    last_loads: Mutex<ShardLoads>,
    /// One `run_pending` pass at a time.
    pass_lock: tokio::sync::Mutex<()>,
}

impl Rebalancer {
    pub fn new(
        config: RebalanceConfig,
        store: Arc<TopologyStore>,
        registry: Arc<BackendRegistry>,
        tracker: Arc<MigrationTracker>,
        candidates: Arc<DownCandidates>,
        metrics: Arc<CoordinatorMetrics>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let planner = Planner::new(registry.clone(), config.call_timeout, config.batch_size);
        Self {
            config,
            store,
            registry,
            tracker,
            candidates,
            metrics,
            events,
            planner,
            queue: Mutex::new(VecDeque::new()),
            history: Mutex::new(VecDeque::new()),
            last_loads: Mutex::new(ShardLoads::new()),
            pass_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn config(&self) -> &RebalanceConfig {
        &self.config
    }

    pub fn tracker(&self) -> &Arc<MigrationTracker> {
        &self.tracker
    }

    /// Tasks waiting to run.
    pub fn pending(&self) -> Vec<MigrationTask> {
        self.queue.lock().iter().cloned().collect()
    }

    /// Recently finished tasks, oldest first.
    pub fn history(&self) -> Vec<MigrationTask> {
        self.history.lock().iter().cloned().collect()
    }

    /// Persist and queue a task.
    pub async fn submit(&self, task: MigrationTask) -> Result<Uuid> {
        self.store.persistence().save_task(&task).await?;
        info!(task = %task.id, span = %task.span, reason = %task.reason, "Queued migration");
        let id = task.id;
        self.queue.lock().push_back(task);
        Ok(id)
    }

    pub async fn submit_all(&self, tasks: Vec<MigrationTask>) -> Result<Vec<Uuid>> {
        let mut ids = Vec::with_capacity(tasks.len());
        for task in tasks {
            ids.push(self.submit(task).await?);
        }
        Ok(ids)
    }

    /// Plan and queue the migrations giving a newly added shard its share.
    pub async fn plan_join(&self, shard: ShardId) -> Result<Vec<Uuid>> {
        let snapshot = self.store.get_snapshot().await?;
        let tasks = self.planner.plan_join(&snapshot, shard).await?;
        self.submit_all(tasks).await
    }

    /// Plan and queue the migrations emptying a draining shard.
    pub async fn plan_leave(&self, shard: ShardId) -> Result<Vec<Uuid>> {
        let snapshot = self.store.get_snapshot().await?;
        let loads = self.current_loads(&snapshot);
        let tasks = self.planner.plan_leave(&snapshot, shard, &loads).await?;
        self.submit_all(tasks).await
    }

    /// Plan and queue a switch to another placement strategy.
    pub async fn plan_restrategy(&self, kind: &StrategyKind) -> Result<Vec<Uuid>> {
        kind.validate()?;
        let snapshot = self.store.get_snapshot().await?;
        let tasks = self.planner.plan_restrategy(&snapshot, kind)?;
        self.submit_all(tasks).await
    }

    fn current_loads(&self, topology: &Topology) -> ShardLoads {
        topology
            .shard_ids()
            .into_iter()
            .map(|s| (s, self.metrics.shard_load(s)))
            .collect()
    }

    /// Re-queue tasks persisted by a previous run.
    ///
    /// Tasks interrupted before cutover start over. A task interrupted during
    /// cutover is finished if its ownership change was published, and started
    /// over otherwise. Returns the number of tasks queued.
    pub async fn recover(&self) -> Result<usize> {
        let tasks = self.store.persistence().load_tasks().await?;
        if tasks.is_empty() {
            return Ok(0);
        }
        let snapshot = self.store.get_snapshot().await?;
        let queued: BTreeSet<Uuid> = self.queue.lock().iter().map(|t| t.id).collect();
        let mut requeued = 0;

        for mut task in tasks {
            if queued.contains(&task.id) {
                continue;
            }
            if task.needs_intervention {
                error!(task = %task.id, span = %task.span, "Migration needs manual intervention; not resuming");
                self.record_history(task);
                continue;
            }
            match task.status {
                MigrationStatus::Done => {
                    self.store.persistence().remove_task(task.id).await?;
                    continue;
                }
                MigrationStatus::Cutover if cutover_applied(&task, &snapshot) => {
                    info!(task = %task.id, "Resuming cleanup of a migration cut over before restart");
                    let placement = snapshot.placement.clone().ok_or(Error::NoShardsAvailable)?;
                    match self.collect(&task, &Arc::new(placement)).await {
                        Ok(removed) => task.progress.removed_entries = removed,
                        Err(e) => warn!(task = %task.id, error = %e, "Source cleanup incomplete"),
                    }
                    task.cutover_generation.get_or_insert(snapshot.generation);
                    task.status = MigrationStatus::Done;
                    self.store.persistence().remove_task(task.id).await?;
                    self.record_history(task);
                    continue;
                }
                MigrationStatus::Failed if !task.is_retryable(self.config.max_attempts) => {
                    self.store.persistence().remove_task(task.id).await?;
                    self.record_history(task);
                    continue;
                }
                MigrationStatus::Failed => task.requeue()?,
                _ => {
                    task.status = MigrationStatus::Pending;
                    task.progress = Default::default();
                }
            }
            self.store.persistence().save_task(&task).await?;
            info!(task = %task.id, span = %task.span, attempts = task.attempts, "Recovered migration");
            self.queue.lock().push_back(task);
            requeued += 1;
        }
        Ok(requeued)
    }

    /// Start a task: check its preconditions, register it with the tracker
    /// and open the destination for the span.
    pub async fn begin(&self, mut task: MigrationTask) -> Result<MigrationRun<'_>> {
        if task.status != MigrationStatus::Pending {
            return Err(Error::Internal(format!(
                "migration {} is {}, not pending",
                task.id, task.status
            )));
        }
        let snapshot = self.store.get_snapshot().await?;
        let placement = Arc::new(snapshot.placement.clone().ok_or(Error::NoShardsAvailable)?);

        let receivers: Vec<ShardId> = match &task.route {
            TaskRoute::Move { source, dest } => {
                if !placement.owns_all(*source, &task.span) {
                    return Err(Error::MigrationConflict(format!(
                        "shard {} does not own {} at generation {}",
                        source, task.span, snapshot.generation
                    )));
                }
                if snapshot.state_of(*source) == Some(ShardState::Down) {
                    return Err(Error::ShardUnavailable {
                        shard: *source,
                        reason: "source is down".to_string(),
                    });
                }
                vec![*dest]
            }
            TaskRoute::Reshard { target } => target.shards().into_iter().collect(),
        };
        for &shard in &receivers {
            match snapshot.state_of(shard) {
                Some(state) if state.accepts_new_spans() => {}
                Some(state) => {
                    return Err(Error::InvalidMutation(format!(
                        "destination shard {} is {}",
                        shard, state
                    )))
                }
                None => return Err(Error::ShardNotFound(shard)),
            }
        }

        let active = self
            .tracker
            .register(task.id, task.span.clone(), task.source(), placement.clone())?;
        if let Err(e) = self.prepare(&task, &receivers, &active, &placement).await {
            self.tracker.unregister(task.id);
            return Err(e);
        }

        let from = task.status;
        task.transition(MigrationStatus::Copying)?;
        if let Err(e) = self.store.persistence().save_task(&task).await {
            self.tracker.unregister(task.id);
            return Err(e);
        }
        self.metrics.migrations_started.inc();
        self.metrics.migrations_active.inc();
        self.events.emit(MigrationEvent::StatusChanged {
            task: task.id,
            from,
            to: MigrationStatus::Copying,
            error: None,
        });
        info!(task = %task.id, span = %task.span, reason = %task.reason, generation = snapshot.generation, "Migration started");

        Ok(MigrationRun {
            rebalancer: self,
            task,
            active,
            placement,
            started: Instant::now(),
            closed: false,
        })
    }

    /// Get the receivers ready before the first page is copied.
    ///
    /// Writes that started before `active` was registered are not tracked,
    /// so they have to land on the source before it is scanned. Anything a
    /// receiver already holds in the span is left over from an earlier
    /// attempt and may have been deleted on the source since.
    async fn prepare(
        &self,
        task: &MigrationTask,
        receivers: &[ShardId],
        active: &ActiveMigration,
        placement: &Arc<Placement>,
    ) -> Result<()> {
        if !self.tracker.wait_for_earlier_writes(active, self.config.fence_timeout).await {
            return Err(Error::Internal(format!(
                "{} writes still in flight after {:?}",
                self.tracker.writes_in_flight(),
                self.config.fence_timeout
            )));
        }

        let bounds = placement.scan_bounds(&task.span);
        let mut cleared = 0;
        for &shard in receivers {
            let backend = self.registry.get(shard)?;
            backend_call(self.config.call_timeout, backend.acquire_range(&task.span)).await?;
            cleared += match &task.route {
                TaskRoute::Move { .. } => {
                    self.purge_where(&backend, &bounds, |key| placement.span_contains(&task.span, key))
                        .await?
                }
                TaskRoute::Reshard { target } => {
                    self.purge_where(&backend, &KeyRange::full(), |key| {
                        target.owner_of(key) == Some(shard) && placement.owner_of(key) != Some(shard)
                    })
                    .await?
                }
            };
        }
        if cleared > 0 {
            info!(task = %task.id, span = %task.span, cleared, "Cleared stale copies from an earlier attempt");
        }
        Ok(())
    }

    /// Drive a task from `Pending` to `Done` or `Failed`.
    pub async fn run_task(&self, task: MigrationTask) -> MigrationTask {
        let mut run = match self.begin(task.clone()).await {
            Ok(run) => run,
            Err(e) => {
                let mut task = task;
                let from = task.status;
                task.fail(e.to_string());
                self.metrics.migrations_failed.inc();
                if let Err(persist) = self.store.persistence().save_task(&task).await {
                    warn!(task = %task.id, error = %persist, "Failed to persist migration failure");
                }
                self.events.emit(MigrationEvent::StatusChanged {
                    task: task.id,
                    from,
                    to: MigrationStatus::Failed,
                    error: task.error.clone(),
                });
                warn!(task = %task.id, error = %e, "Migration could not start");
                return task;
            }
        };

        let outcome = async {
            run.copy().await?;
            run.verify().await?;
            run.cutover().await?;
            run.finish().await
        }
        .await;
        match outcome {
            Ok(task) => task,
            Err(_) => run.into_task(),
        }
    }

    /// Run queued tasks until the queue is empty, then settle shard states.
    ///
    /// At most `max_concurrent_migrations` tasks run at once and never two
    /// with overlapping spans. Failed tasks are retried up to `max_attempts`.
    /// Returns the tasks that reached a final state.
    pub async fn run_pending(&self) -> Result<Vec<MigrationTask>> {
        let _pass = self.pass_lock.lock().await;
        let mut finished = Vec::new();

        loop {
            let batch = self.next_batch();
            if batch.is_empty() {
                break;
            }
            debug!(tasks = batch.len(), "Running migration batch");
            let results = join_all(batch.into_iter().map(|task| self.run_task(task))).await;

            let mut retrying = false;
            for mut task in results {
                match task.status {
                    MigrationStatus::Done => finished.push(task),
                    MigrationStatus::Failed if task.is_retryable(self.config.max_attempts) => {
                        task.requeue()?;
                        self.store.persistence().save_task(&task).await?;
                        info!(task = %task.id, attempt = task.attempts + 1, "Retrying migration");
                        self.queue.lock().push_back(task);
                        retrying = true;
                    }
                    _ => {
                        if task.needs_intervention {
                            error!(task = %task.id, span = %task.span, "Migration needs manual intervention");
                        } else {
                            warn!(task = %task.id, attempts = task.attempts + 1, "Giving up on migration");
                            self.store.persistence().remove_task(task.id).await?;
                        }
                        self.record_history(task.clone());
                        finished.push(task);
                    }
                }
            }
            if retrying {
                tokio::time::sleep(self.config.retry_delay).await;
            }
        }

        self.settle_shards().await?;
        Ok(finished)
    }

    /// Take up to `max_concurrent_migrations` queued tasks with disjoint spans.
    fn next_batch(&self) -> Vec<MigrationTask> {
        let mut queue = self.queue.lock();
        let mut batch: Vec<MigrationTask> = Vec::new();
        let mut rest = VecDeque::with_capacity(queue.len());
        while let Some(task) = queue.pop_front() {
            let free = batch.len() < self.config.max_concurrent_migrations
                && !batch.iter().any(|t| t.span.overlaps(&task.span))
                && !self.tracker.overlaps(&task.span);
            if free {
                batch.push(task);
            } else {
                rest.push_back(task);
            }
        }
        *queue = rest;
        batch
    }

    fn record_history(&self, task: MigrationTask) {
        let mut history = self.history.lock();
        history.push_back(task);
        while history.len() > self.config.max_history {
            history.pop_front();
        }
    }

    /// Promote joined shards and forget drained ones.
    ///
    /// A `Joining` shard with no queued task sending it data becomes
    /// `Active`; a `Draining` shard that owns nothing is removed.
    pub async fn settle_shards(&self) -> Result<()> {
        let snapshot = self.store.get_snapshot().await?;
        let pending = self.pending();

        for shard in snapshot.shards_in(&[ShardState::Joining]) {
            if pending.iter().any(|t| t.targets(shard)) {
                continue;
            }
            self.set_state(shard, ShardState::Joining, ShardState::Active).await?;
        }

        for shard in snapshot.shards_in(&[ShardState::Draining]) {
            if snapshot.owns_anything(shard) || pending.iter().any(|t| t.drains(shard)) {
                continue;
            }
            let removed = self
                .store
                .update(|current| {
                    if current.owns_anything(shard) {
                        return Err(Error::InvalidMutation(format!("shard {} owns spans again", shard)));
                    }
                    Ok(TopologyMutation::RemoveShard { shard })
                })
                .await;
            match removed {
                Ok(topology) => {
                    self.registry.remove(shard);
                    info!(shard, generation = topology.generation, "Removed drained shard");
                }
                Err(Error::InvalidMutation(reason)) => {
                    debug!(shard, reason = %reason, "Drained shard not removable yet");
                }
                Err(Error::ShardNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Move a shard between states if it is still in `from`.
    async fn set_state(&self, shard: ShardId, from: ShardState, to: ShardState) -> Result<bool> {
        let result = self
            .store
            .update(|current| match current.state_of(shard) {
                Some(state) if state == from => Ok(TopologyMutation::SetShardState { shard, state: to }),
                Some(state) => Err(Error::InvalidMutation(format!("shard {} is {}", shard, state))),
                None => Err(Error::ShardNotFound(shard)),
            })
            .await;
        match result {
            Ok(topology) => {
                self.events.emit(MigrationEvent::ShardStateChanged { shard, from, to });
                info!(shard, %from, %to, generation = topology.generation, "Shard state changed");
                Ok(true)
            }
            Err(Error::InvalidMutation(_)) | Err(Error::ShardNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Health-check every shard, including the router's suspects.
    ///
    /// Unhealthy shards are marked `Down`; `Down` shards that answer healthy
    /// again are restored to `Active`. Returns the state changes made.
    pub async fn sweep_health(&self) -> Result<Vec<(ShardId, ShardState)>> {
        let suspects = self.candidates.drain();
        for (shard, suspicion) in &suspects {
            debug!(shard, failures = suspicion.failures, error = %suspicion.last_error, "Checking suspected shard");
        }
        let snapshot = self.store.get_snapshot().await?;
        let mut changes = Vec::new();

        for (&shard, entry) in &snapshot.shards {
            let healthy = match self.registry.get(shard) {
                Ok(backend) => matches!(
                    backend_call(self.config.call_timeout, backend.health_check()).await,
                    Ok(state) if state.is_serving()
                ),
                Err(_) => false,
            };
            match (healthy, entry.state) {
                (false, ShardState::Down) | (true, ShardState::Active | ShardState::Joining | ShardState::Draining) => {}
                (false, state) => {
                    if self.set_state(shard, state, ShardState::Down).await? {
                        self.metrics.shards_marked_down.inc();
                        warn!(shard, previous = %state, "Shard failed health check; marked down");
                        changes.push((shard, ShardState::Down));
                    }
                }
                (true, ShardState::Down) => {
                    if self.set_state(shard, ShardState::Down, ShardState::Active).await? {
                        info!(shard, "Shard healthy again; restored");
                        changes.push((shard, ShardState::Active));
                    }
                }
            }
        }
        Ok(changes)
    }

    /// Queue migrations relieving a shard whose load since the last check
    /// exceeds `skew_factor` times the mean. Returns the number queued.
    pub async fn detect_skew(&self) -> Result<usize> {
        let snapshot = self.store.get_snapshot().await?;
        let totals = self.current_loads(&snapshot);
        let window: ShardLoads = {
            let mut last = self.last_loads.lock();
            let window = totals
                .iter()
                .map(|(&s, &total)| (s, total.saturating_sub(last.get(&s).copied().unwrap_or(0))))
                .collect();
            *last = totals;
            window
        };

        let busy: Vec<Span> = self.pending().into_iter().map(|t| t.span).collect();
        let tasks: Vec<MigrationTask> = self
            .planner
            .plan_skew(&snapshot, &window, self.config.skew_factor)
            .await?
            .into_iter()
            .filter(|t| !self.tracker.overlaps(&t.span) && !busy.iter().any(|s| s.overlaps(&t.span)))
            .collect();
        let queued = tasks.len();
        self.submit_all(tasks).await?;
        Ok(queued)
    }

    /// One background tick.
    pub async fn tick(&self) -> Result<()> {
        self.sweep_health().await?;
        if self.config.auto_rebalance {
            self.detect_skew().await?;
        }
        self.run_pending().await?;
        Ok(())
    }

    /// Run [`tick`](Self::tick) every `tick_interval` until the handle is
    /// shut down.
    pub fn spawn(self: Arc<Self>) -> RebalancerHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        let period = self.config.tick_interval;
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!(?period, "Rebalancer started");
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = self.tick().await {
                            warn!(error = %e, "Rebalancer tick failed");
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Rebalancer shutting down");
                        break;
                    }
                }
            }
        });
        RebalancerHandle { shutdown_tx, task }
    }

    /// Reject the migrated span on its old owner(s) and delete their copies.
    /// Returns the number of entries removed.
    async fn collect(&self, task: &MigrationTask, placement: &Arc<Placement>) -> Result<u64> {
        let timeout = self.config.call_timeout;
        let mut removed = 0;
        match &task.route {
            TaskRoute::Move { source, .. } => {
                let backend = self.registry.get(*source)?;
                backend_call(
                    timeout,
                    backend.release_range(OwnershipFence::span(placement.clone(), task.span.clone())),
                )
                .await?;
                let bounds = placement.scan_bounds(&task.span);
                removed += self
                    .purge_where(&backend, &bounds, |key| placement.span_contains(&task.span, key))
                    .await?;
            }
            TaskRoute::Reshard { target } => {
                for shard in self.registry.shard_ids() {
                    let backend = self.registry.get(shard)?;
                    backend_call(
                        timeout,
                        backend.release_range(OwnershipFence::not_owned_by(placement.clone(), shard)),
                    )
                    .await?;
                    removed += self
                        .purge_where(&backend, &KeyRange::full(), |key| target.owner_of(key) != Some(shard))
                        .await?;
                }
            }
        }
        self.metrics.entries_collected.inc_by(removed);
        Ok(removed)
    }

    async fn purge_where(
        &self,
        backend: &Arc<dyn ShardBackend>,
        bounds: &KeyRange,
        doomed: impl Fn(&[u8]) -> bool,
    ) -> Result<u64> {
        let timeout = self.config.call_timeout;
        let mut removed = 0;
        let mut cursor: Option<Bytes> = None;
        loop {
            let page = backend_call(timeout, backend.scan_range(bounds, cursor.as_deref(), self.config.batch_size)).await?;
            for (key, _) in &page.entries {
                if doomed(&key[..]) {
                    backend_call(timeout, backend.purge(key)).await?;
                    removed += 1;
                }
            }
            match page.next {
                Some(next) => cursor = Some(next),
                None => return Ok(removed),
            }
        }
    }
}

impl std::fmt::Debug for Rebalancer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rebalancer")
            .field("pending", &self.queue.lock().len())
            .field("active", &self.tracker.len())
            .field("config", &self.config)
            .finish()
    }
}

/// Whether the task's ownership change is visible in `topology`.
fn cutover_applied(task: &MigrationTask, topology: &Topology) -> bool {
    match (&task.route, &topology.placement) {
        (TaskRoute::Move { dest, .. }, Some(placement)) => placement.owns_all(*dest, &task.span),
        (TaskRoute::Reshard { target }, Some(placement)) => placement == target,
        _ => false,
    }
}

/// Handle to the background loop started by [`Rebalancer::spawn`].
#[derive(Debug)]
pub struct RebalancerHandle {
    shutdown_tx: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl RebalancerHandle {
    /// Stop the loop after its current tick and wait for it.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
        if let Err(e) = self.task.await {
            warn!(error = %e, "Rebalancer task ended abnormally");
        }
    }
}

/// A migration in progress. See the module docs for the steps.
///
/// Dropping a run that has not finished or failed lifts its fence and
/// unregisters it, leaving the task as it was.
pub struct MigrationRun<'a> {
    rebalancer: &'a Rebalancer,
    task: MigrationTask,
    active: Arc<ActiveMigration>,
    /// Placement when the run began.
    placement: Arc<Placement>,
    started: Instant,
    closed: bool,
}

impl<'a> MigrationRun<'a> {
    pub fn task(&self) -> &MigrationTask {
        &self.task
    }

    pub fn id(&self) -> Uuid {
        self.task.id
    }

    /// Router-side tracking state of this run.
    pub fn active(&self) -> &Arc<ActiveMigration> {
        &self.active
    }

    pub fn into_task(self) -> MigrationTask {
        self.task.clone()
    }

    fn expect_status(&self, status: MigrationStatus) -> Result<()> {
        if self.closed || self.task.status != status {
            return Err(Error::Internal(format!(
                "migration {} is {}, expected {}",
                self.task.id, self.task.status, status
            )));
        }
        Ok(())
    }

    async fn set_status(&mut self, next: MigrationStatus) -> Result<()> {
        let from = self.task.status;
        self.task.transition(next)?;
        if next != MigrationStatus::Done {
            self.rebalancer.store.persistence().save_task(&self.task).await?;
        }
        self.rebalancer.events.emit(MigrationEvent::StatusChanged {
            task: self.task.id,
            from,
            to: next,
            error: None,
        });
        info!(task = %self.task.id, %from, to = %next, span = %self.task.span, "Migration status changed");
        Ok(())
    }

    /// Mark the task failed, release its tracking state and return the error
    /// to surface.
    async fn fail(&mut self, reason: String) -> Error {
        if self.closed {
            return self.task.to_error();
        }
        let from = self.task.status;
        self.task.fail(reason.clone());
        self.close();
        self.rebalancer.metrics.migrations_failed.inc();
        if let Err(e) = self.rebalancer.store.persistence().save_task(&self.task).await {
            warn!(task = %self.task.id, error = %e, "Failed to persist migration failure");
        }
        self.rebalancer.events.emit(MigrationEvent::StatusChanged {
            task: self.task.id,
            from,
            to: MigrationStatus::Failed,
            error: Some(reason.clone()),
        });
        warn!(
            task = %self.task.id,
            from = %from,
            needs_intervention = self.task.needs_intervention,
            error = %reason,
            "Migration failed"
        );
        self.task.to_error()
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.active.unfence();
            self.rebalancer.tracker.unregister(self.task.id);
            self.rebalancer.metrics.migrations_active.dec();
        }
    }

    fn backend(&self, shard: ShardId) -> Result<Arc<dyn ShardBackend>> {
        self.rebalancer.registry.get(shard)
    }

    fn target(&self) -> Option<&Placement> {
        match &self.task.route {
            TaskRoute::Reshard { target } => Some(target),
            TaskRoute::Move { .. } => None,
        }
    }

    /// Every shard taking part in the run.
    fn participants(&self) -> Vec<ShardId> {
        match &self.task.route {
            TaskRoute::Move { source, dest } => vec![*source, *dest],
            TaskRoute::Reshard { target } => {
                let mut shards = self.placement.shards();
                shards.extend(target.shards());
                shards.into_iter().collect()
            }
        }
    }

    /// Copy the span from the source to the destination.
    pub async fn copy(&mut self) -> Result<()> {
        self.expect_status(MigrationStatus::Copying)?;
        match self.copy_inner().await {
            Ok(()) => {
                debug!(
                    task = %self.task.id,
                    entries = self.task.progress.copied_entries,
                    bytes = self.task.progress.copied_bytes,
                    "Copy finished"
                );
                Ok(())
            }
            Err(e) => Err(self.fail(format!("copy failed: {}", e)).await),
        }
    }

    async fn copy_inner(&mut self) -> Result<()> {
        let rebalancer = self.rebalancer;
        let config = &rebalancer.config;
        let sources: Vec<ShardId> = match &self.task.route {
            TaskRoute::Move { source, .. } => vec![*source],
            TaskRoute::Reshard { .. } => self.placement.shards().into_iter().collect(),
        };
        let bounds = self.placement.scan_bounds(&self.task.span);

        for source in sources {
            let backend = self.backend(source)?;
            let mut cursor: Option<Bytes> = None;
            loop {
                let page = backend_call(
                    config.call_timeout,
                    backend.scan_range(&bounds, cursor.as_deref(), config.batch_size),
                )
                .await?;

                let mut entries = 0u64;
                let mut bytes = 0u64;
                for (key, value) in &page.entries {
                    let Some(dest) = self.copy_destination(source, key) else {
                        continue;
                    };
                    let dest_backend = self.backend(dest)?;
                    backend_call(config.call_timeout, dest_backend.put(key.clone(), value.clone(), None)).await?;
                    entries += 1;
                    bytes += (key.len() + value.len()) as u64;
                }
                self.task.progress.copied_entries += entries;
                self.task.progress.copied_bytes += bytes;
                self.rebalancer.metrics.entries_copied.inc_by(entries);
                self.rebalancer.metrics.bytes_copied.inc_by(bytes);
                self.rebalancer.events.emit(MigrationEvent::Progress {
                    task: self.task.id,
                    progress: self.task.progress.clone(),
                });

                match page.next {
                    Some(next) => cursor = Some(next),
                    None => break,
                }
                if !config.batch_delay.is_zero() {
                    tokio::time::sleep(config.batch_delay).await;
                }
            }
        }
        Ok(())
    }

    /// Where a key found on `source` has to be copied, if anywhere.
    fn copy_destination(&self, source: ShardId, key: &[u8]) -> Option<ShardId> {
        match &self.task.route {
            TaskRoute::Move { dest, .. } => self.placement.span_contains(&self.task.span, key).then_some(*dest),
            TaskRoute::Reshard { target } => {
                if self.placement.owner_of(key) != Some(source) {
                    return None;
                }
                target.owner_of(key).filter(|&owner| owner != source)
            }
        }
    }

    /// Catch up, fence, drain, replay and compare.
    pub async fn verify(&mut self) -> Result<()> {
        self.expect_status(MigrationStatus::Copying)?;
        if let Err(e) = self.set_status(MigrationStatus::Verifying).await {
            return Err(self.fail(format!("could not enter verification: {}", e)).await);
        }
        let limit = self.rebalancer.config.verify_timeout;
        match tokio::time::timeout(limit, self.verify_inner()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(self.fail(format!("verification failed: {}", e)).await),
            Err(_) => Err(self.fail(format!("verification timed out after {:?}", limit)).await),
        }
    }

    async fn verify_inner(&mut self) -> Result<()> {
        let config = self.rebalancer.config.clone();
        loop {
            self.check_health().await?;
            let dirty = self.active.take_dirty();
            let replayed = dirty.len();
            self.replay(&dirty).await?;
            self.task.progress.catchup_rounds += 1;
            self.rebalancer.events.emit(MigrationEvent::CatchUp {
                task: self.task.id,
                round: self.task.progress.catchup_rounds,
                replayed,
            });
            if replayed <= config.catchup_tolerance {
                break;
            }
            tokio::time::sleep(config.catchup_interval).await;
        }

        self.active.fence();
        if !self.active.wait_idle(config.fence_timeout).await {
            return Err(Error::Internal(format!(
                "{} writes still in flight after {:?}",
                self.active.in_flight(),
                config.fence_timeout
            )));
        }
        let last = self.active.take_dirty();
        self.replay(&last).await?;
        debug!(task = %self.task.id, replayed = last.len(), "Final replay under fence");

        if config.verify_full_compare {
            self.compare().await?;
        }
        Ok(())
    }

    async fn check_health(&self) -> Result<()> {
        let timeout = self.rebalancer.config.call_timeout;
        for shard in self.participants() {
            let backend = self.backend(shard)?;
            match backend_call(timeout, backend.health_check()).await {
                Ok(state) if state.is_serving() => {}
                Ok(state) => {
                    return Err(Error::ShardUnavailable {
                        shard,
                        reason: format!("health check reported {:?}", state),
                    })
                }
                Err(e) => {
                    return Err(Error::ShardUnavailable {
                        shard,
                        reason: e.to_string(),
                    })
                }
            }
        }
        Ok(())
    }

    /// Copy the current source value of each key to its destination.
    async fn replay(&mut self, keys: &[Bytes]) -> Result<()> {
        let timeout = self.rebalancer.config.call_timeout;
        let mut replayed = 0u64;
        for key in keys {
            let (from, to) = match &self.task.route {
                TaskRoute::Move { source, dest } => (*source, *dest),
                TaskRoute::Reshard { target } => {
                    match (self.placement.owner_of(key), target.owner_of(key)) {
                        (Some(from), Some(to)) if from != to => (from, to),
                        _ => continue,
                    }
                }
            };
            let value = backend_call(timeout, self.backend(from)?.get(key)).await?;
            let dest = self.backend(to)?;
            match value {
                Some(value) => backend_call(timeout, dest.put(key.clone(), value, None)).await?,
                None => backend_call(timeout, dest.delete(key, None)).await?,
            }
            replayed += 1;
        }
        self.task.progress.replayed_keys += replayed;
        self.rebalancer.metrics.keys_replayed.inc_by(replayed);
        Ok(())
    }

    /// Check every migrated entry is identical on its destination.
    async fn compare(&self) -> Result<()> {
        let rebalancer = self.rebalancer;
        let config = &rebalancer.config;
        let bounds = self.placement.scan_bounds(&self.task.span);
        let sources: Vec<ShardId> = match &self.task.route {
            TaskRoute::Move { source, .. } => vec![*source],
            TaskRoute::Reshard { .. } => self.placement.shards().into_iter().collect(),
        };

        let mut compared = 0u64;
        for source in sources {
            let backend = self.backend(source)?;
            let mut cursor: Option<Bytes> = None;
            loop {
                let page = backend_call(
                    config.call_timeout,
                    backend.scan_range(&bounds, cursor.as_deref(), config.batch_size),
                )
                .await?;
                for (key, value) in &page.entries {
                    let Some(dest) = self.copy_destination(source, key) else {
                        continue;
                    };
                    let copied = backend_call(config.call_timeout, self.backend(dest)?.get(key)).await?;
                    if copied.as_ref() != Some(value) {
                        return Err(Error::Internal(format!(
                            "shard {} disagrees with shard {} on key {:?}",
                            dest, source, key
                        )));
                    }
                    compared += 1;
                }
                match page.next {
                    Some(next) => cursor = Some(next),
                    None => break,
                }
            }
        }

        // A move must not leave extra keys behind on the destination either.
        if let TaskRoute::Move { dest, .. } = &self.task.route {
            let backend = self.backend(*dest)?;
            let mut on_dest = 0u64;
            let mut cursor: Option<Bytes> = None;
            loop {
                let page = backend_call(
                    config.call_timeout,
                    backend.scan_range(&bounds, cursor.as_deref(), config.batch_size),
                )
                .await?;
                on_dest += page
                    .entries
                    .iter()
                    .filter(|(key, _)| self.placement.span_contains(&self.task.span, key))
                    .count() as u64;
                match page.next {
                    Some(next) => cursor = Some(next),
                    None => break,
                }
            }
            if on_dest != compared {
                return Err(Error::Internal(format!(
                    "destination holds {} entries of {}, source {}",
                    on_dest, self.task.span, compared
                )));
            }
        }
        debug!(task = %self.task.id, compared, "Span verified");
        Ok(())
    }

    /// Publish the ownership change. Returns the cutover generation.
    pub async fn cutover(&mut self) -> Result<u64> {
        self.expect_status(MigrationStatus::Verifying)?;
        if let Err(e) = self.set_status(MigrationStatus::Cutover).await {
            return Err(self.fail(format!("could not enter cutover: {}", e)).await);
        }

        let span = self.task.span.clone();
        let route = self.task.route.clone();
        let begun = self.placement.clone();
        let result = self
            .rebalancer
            .store
            .update(|current| match &route {
                TaskRoute::Move { source, dest } => {
                    let owns = current
                        .placement
                        .as_ref()
                        .is_some_and(|p| p.owns_all(*source, &span));
                    if !owns {
                        return Err(Error::MigrationConflict(format!(
                            "shard {} no longer owns {} at generation {}",
                            source, span, current.generation
                        )));
                    }
                    Ok(TopologyMutation::TransferSpan {
                        span: span.clone(),
                        from: *source,
                        to: *dest,
                    })
                }
                TaskRoute::Reshard { target } => {
                    if current.placement.as_ref() != Some(&*begun) {
                        return Err(Error::MigrationConflict(format!(
                            "placement changed during reshard (generation {})",
                            current.generation
                        )));
                    }
                    Ok(TopologyMutation::ReplacePlacement {
                        placement: target.clone(),
                    })
                }
            })
            .await;

        match result {
            Ok(topology) => {
                self.task.cutover_generation = Some(topology.generation);
                info!(
                    task = %self.task.id,
                    span = %self.task.span,
                    generation = topology.generation,
                    "Cutover published"
                );
                Ok(topology.generation)
            }
            Err(e @ (Error::MigrationConflict(_) | Error::InvalidMutation(_))) => {
                Err(self.fail(format!("cutover rejected: {}", e)).await)
            }
            Err(e) => {
                // The write may or may not have landed.
                if let Ok(current) = self.rebalancer.store.get_snapshot().await {
                    if cutover_applied(&self.task, &current) {
                        warn!(task = %self.task.id, error = %e, "Cutover write reported an error but was applied");
                        self.task.cutover_generation = Some(current.generation);
                        return Ok(current.generation);
                    }
                }
                self.task.needs_intervention = true;
                Err(self.fail(format!("topology store write failed during cutover: {}", e)).await)
            }
        }
    }

    /// Clean up the old owner(s), lift the fence and mark the task done.
    pub async fn finish(&mut self) -> Result<MigrationTask> {
        self.expect_status(MigrationStatus::Cutover)?;
        if self.task.cutover_generation.is_none() {
            return Err(Error::Internal(format!(
                "migration {} has not been cut over",
                self.task.id
            )));
        }

        let fence_placement = match self.target() {
            Some(target) => Arc::new(target.clone()),
            None => self.placement.clone(),
        };
        match self.rebalancer.collect(&self.task, &fence_placement).await {
            Ok(removed) => self.task.progress.removed_entries = removed,
            Err(e) => {
                warn!(task = %self.task.id, error = %e, "Source cleanup incomplete");
                self.task.error = Some(format!("source cleanup incomplete: {}", e));
            }
        }

        self.close();
        self.set_status(MigrationStatus::Done).await?;
        if let Err(e) = self.rebalancer.store.persistence().remove_task(self.task.id).await {
            warn!(task = %self.task.id, error = %e, "Failed to remove finished migration record");
        }

        let elapsed = self.started.elapsed();
        self.rebalancer.metrics.migrations_completed.inc();
        self.rebalancer.metrics.migration_duration.observe(elapsed);
        info!(
            task = %self.task.id,
            span = %self.task.span,
            entries = self.task.progress.copied_entries,
            replayed = self.task.progress.replayed_keys,
            removed = self.task.progress.removed_entries,
            ?elapsed,
            "Migration done"
        );
        self.rebalancer.record_history(self.task.clone());
        Ok(self.task.clone())
    }
}

impl Drop for MigrationRun<'_> {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for MigrationRun<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationRun")
            .field("task", &self.task)
            .field("closed", &self.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryConnector;
    use crate::config::TopologyConfig;
    use crate::rebalancing::{ChannelEventSink, MigrationReason};
    use crate::topology::InMemoryPersistence;
    use crate::topology::TopologyPersistence;
    use crate::types::encode_u64_key;
    use std::time::Duration;

    struct Harness {
        persistence: Arc<InMemoryPersistence>,
        connector: Arc<InMemoryConnector>,
        store: Arc<TopologyStore>,
        registry: Arc<BackendRegistry>,
        metrics: Arc<CoordinatorMetrics>,
        rebalancer: Rebalancer,
    }

    fn fast_config() -> RebalanceConfig {
        RebalanceConfig::default()
            .with_batch_size(16)
            .with_batch_delay(Duration::ZERO)
            .with_retry_delay(Duration::from_millis(1))
            .with_verify_full_compare(true)
    }

    async fn harness(kind: StrategyKind, shards: usize, config: RebalanceConfig) -> Harness {
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
        let rebalancer = Rebalancer::new(
            config,
            store.clone(),
            registry.clone(),
            Arc::new(MigrationTracker::new()),
            Arc::new(DownCandidates::new()),
            metrics.clone(),
            Arc::new(crate::rebalancing::TracingEventSink),
        );
        Harness {
            persistence,
            connector,
            store,
            registry,
            metrics,
            rebalancer,
        }
    }

    impl Harness {
        fn keys(n: usize) -> Vec<Bytes> {
            (0..n).map(|i| Bytes::from(format!("key-{:03}", i))).collect()
        }

        fn address(&self, shard: ShardId) -> String {
            self.store.cached().shard(shard).unwrap().address.clone()
        }

        /// Write each key straight to its current owner.
        fn fill(&self, keys: &[Bytes]) {
            let topology = self.store.cached();
            let placement = topology.placement.as_ref().unwrap();
            for key in keys {
                let owner = placement.owner_of(key).unwrap();
                self.connector.backend(&self.address(owner)).insert(key.clone(), key.clone());
            }
        }

        /// Every key lives on its owner and nowhere else.
        fn assert_placed(&self, keys: &[Bytes]) {
            let topology = self.store.cached();
            let placement = topology.placement.as_ref().unwrap();
            for key in keys {
                let owner = placement.owner_of(key).unwrap();
                for &shard in topology.shards.keys() {
                    let held = self.connector.backend(&self.address(shard)).peek(key);
                    if shard == owner {
                        assert_eq!(held.as_ref(), Some(key), "{:?} missing on owner {}", key, owner);
                    } else {
                        assert_eq!(held, None, "{:?} left behind on {}", key, shard);
                    }
                }
            }
        }

        async fn add_shard(&self) -> ShardId {
            let topology = self
                .store
                .update(|t| {
                    Ok(TopologyMutation::AddShard {
                        id: t.next_shard_id,
                        address: format!("mem://{}", t.next_shard_id),
                    })
                })
                .await
                .unwrap();
            let id = topology.next_shard_id - 1;
            self.registry.connect(id, &format!("mem://{}", id)).await.unwrap();
            id
        }

        fn first_span(&self, shard: ShardId) -> Span {
            self.store.cached().placement.as_ref().unwrap().owned_spans(shard).remove(0)
        }
    }

    #[tokio::test]
    async fn test_join_moves_share_and_activates_shard() {
        let h = harness(StrategyKind::hash(), 2, fast_config()).await;
        let keys = Harness::keys(200);
        h.fill(&keys);
        let before = h.store.cached().generation;

        let shard = h.add_shard().await;
        let planned = h.rebalancer.plan_join(shard).await.unwrap();
        assert!(!planned.is_empty());
        let finished = h.rebalancer.run_pending().await.unwrap();

        assert!(finished.iter().all(|t| t.status == MigrationStatus::Done));
        let topology = h.store.cached();
        assert_eq!(topology.state_of(shard), Some(ShardState::Active));
        assert!(topology.generation > before);
        assert!(h.connector.backend(&h.address(shard)).len() > 0);
        h.assert_placed(&keys);
        assert_eq!(h.metrics.migrations_completed.get(), finished.len() as u64);
        assert_eq!(h.metrics.migrations_active.get(), 0);
        assert_eq!(h.persistence.task_count(), 0);
        assert!(h.rebalancer.tracker().is_empty());
    }

    #[tokio::test]
    async fn test_leave_drains_and_removes_shard() {
        let h = harness(StrategyKind::hash(), 3, fast_config()).await;
        let keys = Harness::keys(150);
        h.fill(&keys);

        h.store
            .update(|_| {
                Ok(TopologyMutation::SetShardState {
                    shard: 2,
                    state: ShardState::Draining,
                })
            })
            .await
            .unwrap();
        h.rebalancer.plan_leave(2).await.unwrap();
        h.rebalancer.run_pending().await.unwrap();

        let topology = h.store.cached();
        assert!(topology.shard(2).is_none());
        assert!(!h.registry.contains(2));
        assert!(h.connector.backend("mem://2").is_empty());
        h.assert_placed(&keys);
    }

    #[tokio::test]
    async fn test_modulo_join_reshards() {
        let h = harness(StrategyKind::Modulo, 2, fast_config()).await;
        let keys = Harness::keys(120);
        h.fill(&keys);

        let shard = h.add_shard().await;
        h.rebalancer.plan_join(shard).await.unwrap();
        let finished = h.rebalancer.run_pending().await.unwrap();

        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].status, MigrationStatus::Done);
        let topology = h.store.cached();
        assert!(matches!(&topology.placement, Some(Placement::Modulo { shards }) if shards.len() == 3));
        assert_eq!(topology.state_of(shard), Some(ShardState::Active));
        h.assert_placed(&keys);
    }

    #[tokio::test]
    async fn test_write_during_copy_is_replayed() {
        let h = harness(StrategyKind::hash(), 2, fast_config()).await;
        let keys = Harness::keys(100);
        h.fill(&keys);
        let span = h.first_span(0);
        let placement = h.store.cached().placement.clone().unwrap();
        let key = keys
            .iter()
            .find(|k| placement.span_contains(&span, k))
            .cloned()
            .unwrap();

        let mut run = h
            .rebalancer
            .begin(MigrationTask::moving(span.clone(), 0, 1, MigrationReason::Manual))
            .await
            .unwrap();
        run.copy().await.unwrap();

        // A routed write lands on the source after its page was copied.
        let source = h.registry.get(0).unwrap();
        let guard = h.rebalancer.tracker().begin_write(0, &key).unwrap();
        assert!(guard.is_tracked());
        source.put(key.clone(), Bytes::from("updated"), None).await.unwrap();
        drop(guard);

        run.verify().await.unwrap();
        run.cutover().await.unwrap();
        let task = run.finish().await.unwrap();

        assert!(task.progress.replayed_keys >= 1);
        assert_eq!(h.connector.backend("mem://1").peek(&key), Some(Bytes::from("updated")));
        assert_eq!(h.connector.backend("mem://0").peek(&key), None);
        assert!(h.store.cached().placement.as_ref().unwrap().owns_all(1, &span));
    }

    #[tokio::test]
    async fn test_failed_verification_keeps_ownership() {
        let h = harness(StrategyKind::hash(), 2, fast_config()).await;
        h.fill(&Harness::keys(50));
        let span = h.first_span(0);
        let generation = h.store.cached().generation;

        let mut run = h
            .rebalancer
            .begin(MigrationTask::moving(span.clone(), 0, 1, MigrationReason::Manual))
            .await
            .unwrap();
        run.copy().await.unwrap();
        h.connector.backend("mem://1").set_healthy(false);

        let err = run.verify().await.unwrap_err();
        assert!(matches!(err, Error::MigrationFailed { .. }));
        assert_eq!(run.task().status, MigrationStatus::Failed);
        assert!(run.cutover().await.is_err());
        drop(run);

        let topology = h.store.cached();
        assert_eq!(topology.generation, generation);
        assert!(topology.placement.as_ref().unwrap().owns_all(0, &span));
        assert!(h.rebalancer.tracker().is_empty());
        assert_eq!(h.metrics.migrations_failed.get(), 1);
    }

    #[tokio::test]
    async fn test_failed_task_is_retried_then_abandoned() {
        let h = harness(StrategyKind::hash(), 2, fast_config().with_max_attempts(2)).await;
        h.connector.backend("mem://1").set_available(false);
        let span = h.first_span(0);
        h.rebalancer
            .submit(MigrationTask::moving(span, 0, 1, MigrationReason::Manual))
            .await
            .unwrap();

        let finished = h.rebalancer.run_pending().await.unwrap();
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].status, MigrationStatus::Failed);
        assert_eq!(finished[0].attempts, 1);
        assert!(h.rebalancer.pending().is_empty());
        assert_eq!(h.rebalancer.history().len(), 1);
        assert_eq!(h.persistence.task_count(), 0);
    }

    fn range_100_200() -> Span {
        Span::Keys(KeyRange::new(encode_u64_key(100), encode_u64_key(200)))
    }

    async fn range_harness(config: RebalanceConfig) -> Harness {
        let kind = StrategyKind::Range {
            boundaries: vec![encode_u64_key(200)],
        };
        let h = harness(kind, 2, config).await;
        let keys: Vec<Bytes> = (0..300).map(|i| Bytes::from(encode_u64_key(i))).collect();
        h.fill(&keys);
        h
    }

    #[tokio::test]
    async fn test_retry_after_failed_verify_matches_source() {
        for full_compare in [true, false] {
            let h = range_harness(fast_config().with_verify_full_compare(full_compare)).await;
            let source = h.connector.backend("mem://0");
            let dest = h.connector.backend("mem://1");
            let span = range_100_200();

            let mut run = h
                .rebalancer
                .begin(MigrationTask::moving(span.clone(), 0, 1, MigrationReason::Manual))
                .await
                .unwrap();
            run.copy().await.unwrap();
            dest.set_healthy(false);
            assert!(run.verify().await.is_err());
            let mut task = run.into_task();
            assert_eq!(task.status, MigrationStatus::Failed);

            // The source changes while no migration tracks the span.
            let deleted = Bytes::from(encode_u64_key(150));
            let rewritten = Bytes::from(encode_u64_key(120));
            source.delete(&deleted, None).await.unwrap();
            source.put(rewritten.clone(), Bytes::from("rewritten"), None).await.unwrap();
            assert!(dest.peek(&deleted).is_some());

            dest.set_healthy(true);
            task.requeue().unwrap();
            let task = h.rebalancer.run_task(task).await;
            assert_eq!(task.status, MigrationStatus::Done, "compare={} error={:?}", full_compare, task.error);

            let placement = h.store.cached().placement.clone().unwrap();
            assert!(placement.owns_all(1, &span));
            assert_eq!(dest.peek(&deleted), None, "deleted key came back (compare={})", full_compare);
            assert_eq!(dest.peek(&rewritten), Some(Bytes::from("rewritten")));
            for i in 100..200u64 {
                let key = Bytes::from(encode_u64_key(i));
                if key != deleted && key != rewritten {
                    assert_eq!(dest.peek(&key), Some(key.clone()));
                }
                assert_eq!(source.peek(&key), None);
            }
            assert_eq!(dest.len(), 199);
        }
    }

    #[tokio::test]
    async fn test_recovered_copy_drops_stale_destination_entries() {
        let h = range_harness(fast_config()).await;
        let dest = h.connector.backend("mem://1");
        let deleted = Bytes::from(encode_u64_key(180));
        // Left behind by a copy that died before restart.
        for i in 100..200u64 {
            let key = Bytes::from(encode_u64_key(i));
            dest.insert(key.clone(), key);
        }
        h.connector.backend("mem://0").delete(&deleted, None).await.unwrap();

        let mut task = MigrationTask::moving(range_100_200(), 0, 1, MigrationReason::Manual);
        task.transition(MigrationStatus::Copying).unwrap();
        h.persistence.save_task(&task).await.unwrap();
        assert_eq!(h.rebalancer.recover().await.unwrap(), 1);

        let finished = h.rebalancer.run_pending().await.unwrap();
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].status, MigrationStatus::Done);
        assert_eq!(dest.peek(&deleted), None);
        assert_eq!(dest.len(), 199);
    }

    #[tokio::test]
    async fn test_begin_waits_for_write_started_before_it() {
        let h = range_harness(fast_config().with_verify_full_compare(false)).await;
        let key = Bytes::from(encode_u64_key(150));

        // Routed before the migration existed, lands on the source late.
        let write = h.rebalancer.tracker().begin_write(0, &key).unwrap();
        assert!(!write.is_tracked());

        let begin = h
            .rebalancer
            .begin(MigrationTask::moving(range_100_200(), 0, 1, MigrationReason::Manual));
        tokio::pin!(begin);
        assert!(tokio::time::timeout(Duration::from_millis(30), &mut begin).await.is_err());

        h.registry.get(0).unwrap().put(key.clone(), Bytes::from("late"), None).await.unwrap();
        drop(write);
        let mut run = begin.await.unwrap();
        run.copy().await.unwrap();
        run.verify().await.unwrap();
        run.cutover().await.unwrap();
        run.finish().await.unwrap();

        assert_eq!(h.connector.backend("mem://1").peek(&key), Some(Bytes::from("late")));
    }

    #[tokio::test]
    async fn test_begin_gives_up_on_stuck_write() {
        let h = range_harness(fast_config().with_fence_timeout(Duration::from_millis(20))).await;
        let _stuck = h
            .rebalancer
            .tracker()
            .begin_write(0, &Bytes::from(encode_u64_key(150)))
            .unwrap();

        let err = h
            .rebalancer
            .begin(MigrationTask::moving(range_100_200(), 0, 1, MigrationReason::Manual))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
        assert!(h.rebalancer.tracker().is_empty());
    }

    #[tokio::test]
    async fn test_events_follow_state_machine() {
        let (sink, mut rx) = ChannelEventSink::channel();
        let mut h = harness(StrategyKind::hash(), 2, fast_config()).await;
        h.rebalancer.events = Arc::new(sink);
        h.fill(&Harness::keys(20));
        let span = h.first_span(0);

        let task = h
            .rebalancer
            .run_task(MigrationTask::moving(span, 0, 1, MigrationReason::Manual))
            .await;
        assert_eq!(task.status, MigrationStatus::Done);

        let mut statuses = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let MigrationEvent::StatusChanged { to, .. } = event {
                statuses.push(to);
            }
        }
        assert_eq!(
            statuses,
            vec![
                MigrationStatus::Copying,
                MigrationStatus::Verifying,
                MigrationStatus::Cutover,
                MigrationStatus::Done,
            ]
        );
    }

    #[tokio::test]
    async fn test_begin_rejects_span_not_owned_by_source() {
        let h = harness(StrategyKind::hash(), 2, fast_config()).await;
        let span = h.first_span(1);
        let err = h
            .rebalancer
            .begin(MigrationTask::moving(span, 0, 1, MigrationReason::Manual))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MigrationConflict(_)));
        assert!(h.rebalancer.tracker().is_empty());
    }

    #[tokio::test]
    async fn test_recover_requeues_interrupted_copy() {
        let h = harness(StrategyKind::hash(), 2, fast_config()).await;
        let span = h.first_span(0);
        let mut task = MigrationTask::moving(span, 0, 1, MigrationReason::Manual);
        task.transition(MigrationStatus::Copying).unwrap();
        task.progress.copied_entries = 7;
        h.persistence.save_task(&task).await.unwrap();

        assert_eq!(h.rebalancer.recover().await.unwrap(), 1);
        let pending = h.rebalancer.pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].status, MigrationStatus::Pending);
        assert_eq!(pending[0].progress.copied_entries, 0);
    }

    #[tokio::test]
    async fn test_recover_finishes_applied_cutover() {
        let h = harness(StrategyKind::hash(), 2, fast_config()).await;
        let keys = Harness::keys(40);
        h.fill(&keys);
        let span = h.first_span(0);

        // Copy by hand and publish the transfer, as if the process died
        // right after the cutover write.
        let mut task = MigrationTask::moving(span.clone(), 0, 1, MigrationReason::Manual);
        for next in [MigrationStatus::Copying, MigrationStatus::Verifying, MigrationStatus::Cutover] {
            task.transition(next).unwrap();
        }
        let placement = h.store.cached().placement.clone().unwrap();
        let source = h.connector.backend("mem://0");
        for key in source.keys() {
            if placement.span_contains(&span, &key) {
                h.connector.backend("mem://1").insert(key.clone(), source.peek(&key).unwrap());
            }
        }
        h.store
            .update(|_| {
                Ok(TopologyMutation::TransferSpan {
                    span: span.clone(),
                    from: 0,
                    to: 1,
                })
            })
            .await
            .unwrap();
        h.persistence.save_task(&task).await.unwrap();

        assert_eq!(h.rebalancer.recover().await.unwrap(), 0);
        assert_eq!(h.rebalancer.history()[0].status, MigrationStatus::Done);
        assert_eq!(h.persistence.task_count(), 0);
        h.assert_placed(&keys);
    }

    #[tokio::test]
    async fn test_sweep_marks_down_and_restores() {
        let h = harness(StrategyKind::hash(), 2, fast_config()).await;
        h.connector.backend("mem://1").set_healthy(false);

        let changes = h.rebalancer.sweep_health().await.unwrap();
        assert_eq!(changes, vec![(1, ShardState::Down)]);
        assert_eq!(h.store.cached().state_of(1), Some(ShardState::Down));
        assert_eq!(h.metrics.shards_marked_down.get(), 1);
        assert!(h.rebalancer.sweep_health().await.unwrap().is_empty());

        h.connector.backend("mem://1").set_healthy(true);
        let changes = h.rebalancer.sweep_health().await.unwrap();
        assert_eq!(changes, vec![(1, ShardState::Active)]);
    }

    #[tokio::test]
    async fn test_detect_skew_queues_move_off_hot_shard() {
        let h = harness(StrategyKind::hash(), 2, fast_config().with_skew_factor(1.5)).await;
        for _ in 0..100 {
            h.metrics.record_shard_op(0, "get");
        }
        h.metrics.record_shard_op(1, "get");

        assert!(h.rebalancer.detect_skew().await.unwrap() > 0);
        let pending = h.rebalancer.pending();
        assert!(pending.iter().all(|t| t.source() == Some(0) && t.dest() == Some(1)));

        // The same counters give no new load in the next window.
        h.rebalancer.queue.lock().clear();
        assert_eq!(h.rebalancer.detect_skew().await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_loop_stops_on_shutdown() {
        let h = harness(
            StrategyKind::hash(),
            2,
            fast_config().with_tick_interval(Duration::from_millis(10)),
        )
        .await;
        let rebalancer = Arc::new(h.rebalancer);
        h.connector.backend("mem://1").set_healthy(false);

        let handle = rebalancer.clone().spawn();
        tokio::time::sleep(Duration::from_millis(25)).await;
        handle.shutdown().await;

        assert_eq!(h.store.cached().state_of(1), Some(ShardState::Down));
    }
}
