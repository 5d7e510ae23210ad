//! Epoch control loop.
//!
//! The driver advances one epoch at a time through
//! `Scheduling -> Polling -> Aggregating -> Committing` and persists a
//! versioned checkpoint after every transition, so a restarted process
//! resumes where the previous one stopped.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use slotshare_id::{CoordinatorId, EpochIndex};
use slotshare_schedule::{
    allocate, CoordinatorStake, DegradePolicy, ProportionalShrink, Schedule, ScheduleRequest,
};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::aggregator::EvaluationAggregator;
use crate::backoff::{retry, BackoffPolicy};
use crate::clients::{CoordinatorInfo, Ledger, PoolSource, StakeSource};
use crate::config::{Config, EpochConfig};
use crate::epoch::{Checkpoint, Epoch, EpochPhase};
use crate::error::DriverError;
use crate::model::PoolInfo;
use crate::poller::{ContributionPoller, PollEvent, PollTarget};
use crate::store::{ScheduleStore, StoreError, StoreResult};
use crate::weights::{CommitOutcome, WeightSetter};

const STORE_ATTEMPTS: u32 = 5;
const BLOCK_QUERY_ATTEMPTS: u32 = 3;

/// External collaborators of the driver.
pub struct DriverDeps {
    pub stakes: Arc<dyn StakeSource>,
    pub pools: Arc<dyn PoolSource>,
    pub ledger: Arc<dyn Ledger>,
    pub store: Arc<dyn ScheduleStore>,
}

/// Drives the epoch cycle.
pub struct EpochDriver {
    config: Config,
    stakes: Arc<dyn StakeSource>,
    ledger: Arc<dyn Ledger>,
    store: Arc<dyn ScheduleStore>,
    degrade: Box<dyn DegradePolicy>,
    aggregator: EvaluationAggregator,
    poller: ContributionPoller,
    weight_setter: WeightSetter,
    io_backoff: BackoffPolicy,
    cursors: BTreeMap<CoordinatorId, String>,
    pools: BTreeMap<CoordinatorId, PoolInfo>,
    checkpoint: Option<Checkpoint>,
    schedule: Option<Schedule>,
    resumed: bool,
}

enum Wake {
    Event(Option<PollEvent>),
    Deadline,
    Shutdown,
}

impl EpochDriver {
    /// Build a driver from persisted state.
    pub fn new(config: Config, deps: DriverDeps) -> Result<Self, DriverError> {
        let store = deps.store;

        let checkpoint = store.load_checkpoint()?;
        let horizon = checkpoint
            .map(|cp| {
                EpochIndex::new(
                    cp.epoch
                        .index
                        .value()
                        .saturating_sub(config.aggregator.dedup_retention_epochs),
                )
            })
            .unwrap_or(EpochIndex::GENESIS);

        let states = store.load_score_states()?;
        let processed = store.processed_since(horizon)?;
        let deferred = store.load_deferred()?;
        let cursors = store.load_cursors()?;
        let pools: BTreeMap<_, _> = store
            .list_pool_info()?
            .into_iter()
            .map(|p| (p.coordinator_id.clone(), p))
            .collect();

        info!(
            subjects = states.len(),
            processed = processed.len(),
            deferred = deferred.len(),
            cursors = cursors.len(),
            pools = pools.len(),
            "Restored driver state"
        );

        let aggregator =
            EvaluationAggregator::restore(config.aggregator.clone(), states, processed, deferred);

        let mut poller = ContributionPoller::new(deps.pools, config.poller.clone());
        poller.restore_health(pools.values());

        let weight_setter = WeightSetter::new(Arc::clone(&deps.ledger), config.weights.clone());

        let io_backoff = BackoffPolicy {
            base: config.epoch.block_time.min(Duration::from_millis(500)),
            ..BackoffPolicy::default()
        };

        Ok(Self {
            config,
            stakes: deps.stakes,
            ledger: deps.ledger,
            store,
            degrade: Box::new(ProportionalShrink),
            aggregator,
            poller,
            weight_setter,
            io_backoff,
            cursors,
            pools,
            checkpoint,
            schedule: None,
            resumed: false,
        })
    }

    /// Replace the policy applied when minimum guarantees are infeasible.
    pub fn with_degrade_policy(mut self, policy: Box<dyn DegradePolicy>) -> Self {
        self.degrade = policy;
        self
    }

    /// Current checkpoint, if the driver has started.
    pub fn checkpoint(&self) -> Option<Checkpoint> {
        self.checkpoint
    }

    /// Run until `shutdown` flips to true or a fatal error occurs.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), DriverError> {
        info!(
            epoch_length = self.config.epoch.length_blocks,
            capacity_units = self.config.epoch.capacity_units,
            strategy = %self.config.epoch.strategy,
            degrade_policy = self.degrade.name(),
            "Starting epoch driver"
        );

        loop {
            if stopping(&shutdown) {
                break;
            }

            match self.step(&mut shutdown).await {
                Ok(()) => {}
                Err(e) if e.is_fatal() => {
                    error!(error = %e, "Epoch driver failed");
                    return Err(e);
                }
                Err(e) => {
                    warn!(error = %e, "Epoch step failed, will retry");
                    let pause = self.config.epoch.block_time;
                    if sleep_or_shutdown(pause, &mut shutdown).await {
                        break;
                    }
                }
            }
        }

        info!("Epoch driver stopped");
        Ok(())
    }

    async fn step(&mut self, shutdown: &mut watch::Receiver<bool>) -> Result<(), DriverError> {
        if !self.resumed {
            self.resume().await?;
            self.resumed = true;
        }

        let Some(cp) = self.checkpoint else {
            return Ok(());
        };

        match cp.phase {
            EpochPhase::Scheduling => self.schedule_epoch(cp).await,
            EpochPhase::Polling => self.poll_epoch(cp, shutdown).await,
            EpochPhase::Aggregating => self.aggregate_epoch(cp).await,
            EpochPhase::Committing => self.commit_epoch(cp).await,
        }
    }

    /// Pick up the stored checkpoint, or start at the epoch containing the
    /// current block.
    async fn resume(&mut self) -> Result<(), DriverError> {
        let block = self.current_block().await?;

        match self.checkpoint {
            None => {
                let epoch = Epoch::containing(block, self.config.epoch.length_blocks);
                let cp = Checkpoint::fresh(epoch);
                self.store_op(|s| s.save_checkpoint(&cp)).await?;
                self.checkpoint = Some(cp);
                info!(epoch = %epoch.index, block, "Starting from a fresh checkpoint");
            }
            Some(cp) if cp.epoch.is_abandoned_at(block) => {
                let next = self.realign(cp.epoch, block);
                warn!(
                    epoch = %cp.epoch.index,
                    phase = %cp.phase,
                    block,
                    resume_epoch = %next.index,
                    "Checkpoint epoch is long over; skipping its commit"
                );
                self.transition(cp.begin(next)).await?;
            }
            Some(cp) => {
                info!(epoch = %cp.epoch.index, phase = %cp.phase, block, "Resuming from checkpoint");
            }
        }
        Ok(())
    }

    // =========================================================================
    // Scheduling
    // =========================================================================

    #[instrument(skip_all, fields(epoch = %cp.epoch.index))]
    async fn schedule_epoch(&mut self, cp: Checkpoint) -> Result<(), DriverError> {
        let block = self.current_block().await?;
        if block >= cp.epoch.end_block() {
            let next = self.realign(cp.epoch, block);
            warn!(block, next_epoch = %next.index, "Epoch elapsed before it was scheduled");
            return self.transition(cp.begin(next)).await;
        }

        let index = cp.epoch.index;
        let schedule = match self.store_op(|s| s.get_schedule(index)).await? {
            Some(schedule) => {
                debug!("Reusing persisted schedule");
                schedule
            }
            None => self.build_schedule(cp.epoch).await?,
        };

        self.release_stale(&schedule).await?;
        self.open_epoch(cp.epoch, schedule).await?;
        self.transition(cp.advance()).await
    }

    async fn build_schedule(&mut self, epoch: Epoch) -> Result<Schedule, DriverError> {
        let reported = self.stakes.fetch_stakes().await?;
        let stale = self.poller.stale();
        let eligible = eligible_coordinators(reported, &self.config.epoch, &stale);

        let request = ScheduleRequest {
            epoch: epoch.index,
            coordinators: eligible
                .iter()
                .map(|c| CoordinatorStake::new(c.coordinator_id.clone(), c.stake))
                .collect(),
            total_units: self.config.epoch.capacity_units,
            min_units: self.config.epoch.min_units,
            strategy: self.config.epoch.strategy,
        };

        let schedule = match allocate(&request) {
            Ok(schedule) => schedule,
            Err(e) if e.is_degradable() => {
                let schedule = self.degrade.degrade(&request)?;
                warn!(
                    error = %e,
                    policy = self.degrade.name(),
                    requested_min = request.min_units,
                    honored_min = schedule.min_units,
                    "Minimum guarantees infeasible; using degraded schedule"
                );
                schedule
            }
            Err(e) => return Err(e.into()),
        };

        let ttl = self.config.epoch.record_ttl();
        self.store_op(|s| s.put_schedule(&schedule, ttl)).await?;

        for info in &eligible {
            let health = self.poller.health(&info.coordinator_id);
            let pool = PoolInfo {
                coordinator_id: info.coordinator_id.clone(),
                endpoint: info.endpoint.clone(),
                last_seen: self
                    .pools
                    .get(&info.coordinator_id)
                    .map(|p| p.last_seen)
                    .unwrap_or_else(Utc::now),
                consecutive_failures: health.consecutive_failures,
                stale: health.stale,
            };
            self.put_pool(pool).await?;
        }

        info!(
            coordinators = schedule.allocations.len(),
            allocated = schedule.allocated_units(),
            strategy = %schedule.strategy,
            degraded = schedule.degraded,
            digest = %schedule.digest(),
            "Schedule persisted"
        );
        Ok(schedule)
    }

    /// A stale endpoint sits out one epoch, then gets a clean slate.
    ///
    /// Runs whether the schedule was just built or reused after a restart,
    /// so a crash after persisting the schedule cannot bench an endpoint
    /// for a second epoch.
    async fn release_stale(&mut self, schedule: &Schedule) -> Result<(), DriverError> {
        for id in self.poller.stale() {
            if schedule.units_for(&id).is_some() {
                continue;
            }
            self.poller.reset(&id);
            if let Some(mut pool) = self.pools.get(&id).cloned() {
                pool.consecutive_failures = 0;
                pool.stale = false;
                self.put_pool(pool).await?;
            }
            info!(coordinator_id = %id, "Stale endpoint excluded from this epoch");
        }
        Ok(())
    }

    /// Make `schedule` the active one and replay records held for `epoch`.
    async fn open_epoch(&mut self, epoch: Epoch, schedule: Schedule) -> Result<(), DriverError> {
        let report = self.aggregator.begin_epoch(epoch, &schedule);
        let batch = self.aggregator.to_batch(&report, None);
        if !batch.is_empty() {
            self.store_op(|s| s.apply_batch(&batch)).await?;
        }
        self.schedule = Some(schedule);
        Ok(())
    }

    /// The persisted schedule of `cp`'s epoch, loading it after a restart.
    /// Falls back to scheduling when the store no longer has it.
    async fn active_schedule(&mut self, cp: Checkpoint) -> Result<Option<Schedule>, DriverError> {
        if let Some(schedule) = &self.schedule {
            if schedule.epoch == cp.epoch.index {
                return Ok(Some(schedule.clone()));
            }
        }

        let index = cp.epoch.index;
        match self.store_op(|s| s.get_schedule(index)).await? {
            Some(schedule) => {
                self.open_epoch(cp.epoch, schedule.clone()).await?;
                Ok(Some(schedule))
            }
            None => {
                warn!(epoch = %index, phase = %cp.phase, "Schedule missing; rescheduling epoch");
                let back = Checkpoint {
                    phase: EpochPhase::Scheduling,
                    version: cp.version + 1,
                    ..cp
                };
                self.transition(back).await?;
                Ok(None)
            }
        }
    }

    // =========================================================================
    // Polling
    // =========================================================================

    async fn poll_epoch(
        &mut self,
        cp: Checkpoint,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), DriverError> {
        let Some(schedule) = self.active_schedule(cp).await? else {
            return Ok(());
        };

        let block = self.current_block().await?;
        if block >= cp.epoch.end_block() {
            if cp.is_drained() {
                info!(epoch = %cp.epoch.index, block, "Epoch ended");
                return self.transition(cp.advance()).await;
            }
            // Records produced in the last blocks of the epoch are only
            // visible now; collect them before freezing.
            debug!(epoch = %cp.epoch.index, block, "Running closing poll round");
            self.poll_round(cp, &schedule, block, shutdown).await?;
            if stopping(shutdown) {
                return Ok(());
            }
            return self.transition(cp.with_closing_poll()).await;
        }

        if block < cp.next_poll_block {
            let blocks = (cp.next_poll_block - block).min(self.config.poller.interval_blocks);
            let wait = self.blocks_to_duration(blocks);
            sleep_or_shutdown(wait, shutdown).await;
            return Ok(());
        }

        self.poll_round(cp, &schedule, block, shutdown).await?;

        let next = block.saturating_add(self.config.poller.interval_blocks);
        self.transition(cp.with_next_poll(next)).await
    }

    #[instrument(skip_all, fields(epoch = %cp.epoch.index, block = block))]
    async fn poll_round(
        &mut self,
        cp: Checkpoint,
        schedule: &Schedule,
        block: u64,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), DriverError> {
        let mut targets = Vec::new();
        for coordinator in schedule.coordinators() {
            match self.pools.get(coordinator) {
                Some(pool) => targets.push(PollTarget {
                    coordinator: coordinator.clone(),
                    endpoint: pool.endpoint.clone(),
                    cursor: self.cursors.get(coordinator).cloned(),
                }),
                None => warn!(coordinator_id = %coordinator, "No known endpoint for coordinator"),
            }
        }
        if targets.is_empty() {
            return Ok(());
        }

        let remaining = cp.epoch.end_block().saturating_sub(block);
        let deadline = tokio::time::sleep(
            self.blocks_to_duration(remaining)
                .saturating_add(self.config.poller.grace),
        );
        tokio::pin!(deadline);

        let mut round = self.poller.start_round(targets);
        loop {
            let wake = tokio::select! {
                event = round.next() => Wake::Event(event),
                _ = &mut deadline => Wake::Deadline,
                _ = shutdown.changed() => Wake::Shutdown,
            };

            match wake {
                Wake::Event(Some(event)) => self.handle_event(event).await?,
                Wake::Event(None) => break,
                Wake::Deadline => {
                    warn!("Poll round passed the epoch grace period; cancelling in-flight fetches");
                    round.abort();
                    break;
                }
                Wake::Shutdown => {
                    round.abort();
                    break;
                }
            }
        }
        Ok(())
    }

    /// Single consumption point for poll results.
    async fn handle_event(&mut self, event: PollEvent) -> Result<(), DriverError> {
        match event {
            PollEvent::Fetched {
                coordinator,
                page,
                attempts,
            } => {
                let fetched = page.records.len();
                let report = self.aggregator.ingest(&coordinator, page.records);
                let cursor = page.next_cursor.map(|c| (coordinator.clone(), c));
                let batch = self.aggregator.to_batch(&report, cursor.clone());
                if !batch.is_empty() {
                    self.store_op(|s| s.apply_batch(&batch)).await?;
                }
                if let Some((_, c)) = cursor {
                    self.cursors.insert(coordinator.clone(), c);
                }

                debug!(
                    coordinator_id = %coordinator,
                    attempts,
                    fetched,
                    applied = report.applied,
                    duplicates = report.duplicates,
                    late = report.late,
                    out_of_window = report.out_of_window,
                    rejected = report.rejected,
                    deferred = report.pending,
                    "Ingested contributions"
                );

                if self.poller.record_success(&coordinator) {
                    info!(coordinator_id = %coordinator, "Endpoint recovered");
                }
                if let Some(mut pool) = self.pools.get(&coordinator).cloned() {
                    pool.last_seen = Utc::now();
                    pool.consecutive_failures = 0;
                    pool.stale = false;
                    self.put_pool(pool).await?;
                }
            }
            PollEvent::Failed {
                coordinator,
                attempts,
                error,
            } => {
                warn!(coordinator_id = %coordinator, attempts, error = %error, "Poll failed");
                if self.poller.record_failure(&coordinator) {
                    warn!(
                        coordinator_id = %coordinator,
                        "Endpoint marked stale; it will sit out the next epoch"
                    );
                }
                let health = self.poller.health(&coordinator);
                if let Some(mut pool) = self.pools.get(&coordinator).cloned() {
                    pool.consecutive_failures = health.consecutive_failures;
                    pool.stale = health.stale;
                    self.put_pool(pool).await?;
                }
            }
        }
        Ok(())
    }

    // =========================================================================
    // Aggregating
    // =========================================================================

    #[instrument(skip_all, fields(epoch = %cp.epoch.index))]
    async fn aggregate_epoch(&mut self, cp: Checkpoint) -> Result<(), DriverError> {
        let Some(schedule) = self.active_schedule(cp).await? else {
            return Ok(());
        };

        let (snapshot, changed) = self.aggregator.freeze(cp.epoch, &schedule);
        self.store_op(|s| s.put_snapshot(&snapshot, &changed)).await?;

        let horizon = self.aggregator.prune_seen(cp.epoch.index);
        let pruned = self.store_op(|s| s.prune_processed(horizon)).await?;

        info!(
            pairs = snapshot.pairs.len(),
            providers = snapshot.providers.len(),
            decayed = changed.len(),
            pruned,
            "Scores frozen"
        );
        self.transition(cp.advance()).await
    }

    // =========================================================================
    // Committing
    // =========================================================================

    #[instrument(skip_all, fields(epoch = %cp.epoch.index))]
    async fn commit_epoch(&mut self, cp: Checkpoint) -> Result<(), DriverError> {
        let index = cp.epoch.index;

        if self.store_op(|s| s.get_weights(index)).await?.is_some() {
            info!("Weights already committed");
        } else {
            let Some(snapshot) = self.store_op(|s| s.get_snapshot(index)).await? else {
                warn!("Frozen snapshot missing; aggregating again");
                let back = Checkpoint {
                    phase: EpochPhase::Aggregating,
                    version: cp.version + 1,
                    ..cp
                };
                return self.transition(back).await;
            };

            match self.weight_setter.commit(&snapshot).await {
                CommitOutcome::Committed {
                    commit_id, vector, ..
                } => {
                    self.store_op(|s| s.put_weights(&vector, &commit_id)).await?;
                }
                CommitOutcome::Skipped(reason) => {
                    warn!(reason = ?reason, "Weight commit skipped for this epoch");
                }
            }
        }

        let block = self.current_block().await?;
        let next = self.realign(cp.epoch, block);
        if next.index > index.next() {
            warn!(
                block,
                next_epoch = %next.index,
                skipped = next.index.value() - index.next().value(),
                "Chain moved past the following epoch; realigning"
            );
        }

        let purged = self.store_op(|s| s.purge_expired()).await?;
        if purged > 0 {
            debug!(purged, "Purged expired schedule and pool rows");
        }

        self.schedule = None;
        self.transition(cp.begin(next)).await
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    /// The epoch after `after`, or the one containing `block` if the chain
    /// has already moved beyond it.
    fn realign(&self, after: Epoch, block: u64) -> Epoch {
        let containing = Epoch::containing(block, self.config.epoch.length_blocks);
        if containing.index > after.index.next() {
            containing
        } else {
            after.next()
        }
    }

    fn blocks_to_duration(&self, blocks: u64) -> Duration {
        self.config
            .epoch
            .block_time
            .saturating_mul(u32::try_from(blocks).unwrap_or(u32::MAX))
    }

    async fn transition(&mut self, next: Checkpoint) -> Result<(), DriverError> {
        self.store_op(|s| s.save_checkpoint(&next)).await?;
        let previous = self.checkpoint.replace(next);

        let moved = previous.is_none_or(|p| p.phase != next.phase || p.epoch != next.epoch);
        if moved {
            info!(
                epoch = %next.epoch.index,
                phase = %next.phase,
                version = next.version,
                "Epoch phase transition"
            );
        } else {
            debug!(next_poll_block = next.next_poll_block, "Poll checkpoint saved");
        }
        Ok(())
    }

    async fn put_pool(&mut self, pool: PoolInfo) -> Result<(), DriverError> {
        let ttl = self.config.epoch.record_ttl();
        self.store_op(|s| s.put_pool_info(&pool, ttl)).await?;
        self.pools.insert(pool.coordinator_id.clone(), pool);
        Ok(())
    }

    async fn current_block(&self) -> Result<u64, DriverError> {
        let ledger = self.ledger.as_ref();
        retry(&self.io_backoff, BLOCK_QUERY_ATTEMPTS, |_| true, move |_| {
            ledger.current_block()
        })
        .await
        .map(|(block, _)| block)
        .map_err(|e| e.last.into())
    }

    /// Run a store operation, retrying while the store reports busy.
    async fn store_op<T, F>(&self, op: F) -> Result<T, DriverError>
    where
        F: Fn(&dyn ScheduleStore) -> StoreResult<T>,
    {
        let store = self.store.as_ref();
        let op = &op;
        retry(
            &self.io_backoff,
            STORE_ATTEMPTS,
            StoreError::is_transient,
            move |_| std::future::ready(op(store)),
        )
        .await
        .map(|(value, _)| value)
        .map_err(|e| e.last.into())
    }
}

/// Coordinators that may enter the scheduler.
///
/// Drops repeated ids (first report wins), stakes below the configured
/// minimum, excluded ids and stale endpoints.
pub fn eligible_coordinators(
    reported: Vec<CoordinatorInfo>,
    config: &EpochConfig,
    stale: &BTreeSet<CoordinatorId>,
) -> Vec<CoordinatorInfo> {
    let mut seen = BTreeSet::new();
    let mut eligible = Vec::with_capacity(reported.len());

    for info in reported {
        if !seen.insert(info.coordinator_id.clone()) {
            warn!(coordinator_id = %info.coordinator_id, "Coordinator reported twice; keeping first");
            continue;
        }
        if info.stake < config.min_coordinator_stake {
            debug!(coordinator_id = %info.coordinator_id, stake = info.stake, "Stake below minimum");
            continue;
        }
        if config.excluded.contains(&info.coordinator_id) {
            debug!(coordinator_id = %info.coordinator_id, "Coordinator excluded by configuration");
            continue;
        }
        if stale.contains(&info.coordinator_id) {
            continue;
        }
        eligible.push(info);
    }
    eligible
}

fn stopping(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow() || shutdown.has_changed().is_err()
}

/// Sleep for `duration`. Returns true if shutdown was requested meanwhile.
async fn sleep_or_shutdown(duration: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
    }
}
