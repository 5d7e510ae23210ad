//! Evaluation aggregator.
//!
//! Turns contribution samples into exponentially smoothed scores per
//! (provider, coordinator) pair and freezes them at epoch boundaries.
//! The aggregator is the only writer of [`ScoreState`]; the driver feeds
//! it from a single consumer so it never needs a lock.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::str::FromStr;

use slotshare_id::{CoordinatorId, EpochIndex, RecordId};
use slotshare_schedule::{Schedule, SlotWindow};
use tracing::{debug, warn};

use crate::config::ConfigError;
use crate::epoch::Epoch;
use crate::model::{
    ContributionRecord, Dimension, FrozenSnapshot, PairScore, ScoreState, SubjectKey,
};
use crate::store::IngestBatch;

// =============================================================================
// Configuration
// =============================================================================

/// What happens to a subject's EMA in an epoch without contributions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InactivityPolicy {
    /// One extra EMA step with a zero sample.
    #[default]
    Decay,
    /// Leave the EMA unchanged.
    Freeze,
}

impl InactivityPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Decay => "decay",
            Self::Freeze => "freeze",
        }
    }
}

impl FromStr for InactivityPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "decay" => Ok(Self::Decay),
            "freeze" => Ok(Self::Freeze),
            other => Err(ConfigError::InvalidInactivityPolicy(other.to_string())),
        }
    }
}

/// Convex combination over [`Dimension::ALL`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DimensionWeights([f64; 4]);

impl DimensionWeights {
    /// Validate weights given in [`Dimension::ALL`] order.
    pub fn new(weights: [f64; 4]) -> Result<Self, ConfigError> {
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(ConfigError::InvalidDimensionWeights(format!(
                "weights must be finite and non-negative, got {weights:?}"
            )));
        }
        let sum: f64 = weights.iter().sum();
        if (sum - 1.0).abs() > 1e-6 {
            return Err(ConfigError::InvalidDimensionWeights(format!(
                "weights must sum to 1, got {sum}"
            )));
        }
        Ok(Self(weights))
    }

    pub fn equal() -> Self {
        Self([0.25; 4])
    }

    pub fn weight(&self, dimension: Dimension) -> f64 {
        self.0[dimension.index()]
    }

    /// Aggregate score of an EMA map. Unobserved dimensions count as zero.
    pub fn combine(&self, ema: &BTreeMap<Dimension, f64>) -> f64 {
        ema.iter().map(|(d, v)| self.weight(*d) * v).sum()
    }
}

impl Default for DimensionWeights {
    fn default() -> Self {
        Self::equal()
    }
}

/// Aggregator configuration.
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// EMA smoothing factor in (0, 1].
    pub alpha: f64,

    pub weights: DimensionWeights,

    pub inactivity: InactivityPolicy,

    /// Epochs a processed record id is remembered for deduplication.
    pub dedup_retention_epochs: u64,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            alpha: 0.3,
            weights: DimensionWeights::equal(),
            inactivity: InactivityPolicy::Decay,
            dedup_retention_epochs: 4,
        }
    }
}

/// One EMA step. The first observation seeds the average.
pub fn ema_step(previous: Option<f64>, sample: f64, alpha: f64) -> f64 {
    match previous {
        Some(old) => alpha * sample + (1.0 - alpha) * old,
        None => sample,
    }
}

// =============================================================================
// Ingest
// =============================================================================

/// Counters and side effects of one ingest call.
#[derive(Debug, Default)]
pub struct IngestReport {
    pub applied: usize,
    pub duplicates: usize,
    pub late: usize,
    pub out_of_window: usize,
    pub rejected: usize,

    /// Records held for a later epoch (including ones already held).
    pub pending: usize,

    touched: BTreeSet<SubjectKey>,
    processed: Vec<RecordId>,
    deferred: Vec<ContributionRecord>,
    released: Vec<RecordId>,
}

impl IngestReport {
    pub fn touched(&self) -> impl Iterator<Item = &SubjectKey> {
        self.touched.iter()
    }

    /// Number of records consumed for good.
    pub fn consumed(&self) -> usize {
        self.processed.len()
    }
}

struct ActiveEpoch {
    epoch: Epoch,
    windows: HashMap<CoordinatorId, SlotWindow>,
}

/// Smoothed score state of every subject.
pub struct EvaluationAggregator {
    config: AggregatorConfig,
    states: BTreeMap<SubjectKey, ScoreState>,
    seen: HashMap<RecordId, EpochIndex>,
    deferred: BTreeMap<RecordId, ContributionRecord>,
    current: Option<ActiveEpoch>,
}

impl EvaluationAggregator {
    pub fn new(config: AggregatorConfig) -> Self {
        Self {
            config,
            states: BTreeMap::new(),
            seen: HashMap::new(),
            deferred: BTreeMap::new(),
            current: None,
        }
    }

    /// Rebuild from persisted state.
    pub fn restore(
        config: AggregatorConfig,
        states: Vec<ScoreState>,
        processed: Vec<(RecordId, EpochIndex)>,
        deferred: Vec<ContributionRecord>,
    ) -> Self {
        let mut aggregator = Self::new(config);
        aggregator.states = states
            .into_iter()
            .map(|s| (s.subject.clone(), s))
            .collect();
        aggregator.seen = processed.into_iter().collect();
        aggregator.deferred = deferred
            .into_iter()
            .map(|r| (r.record_id.clone(), r))
            .collect();
        aggregator
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    pub fn state(&self, subject: &SubjectKey) -> Option<&ScoreState> {
        self.states.get(subject)
    }

    pub fn states(&self) -> impl Iterator<Item = &ScoreState> {
        self.states.values()
    }

    pub fn deferred_len(&self) -> usize {
        self.deferred.len()
    }

    pub fn current_epoch(&self) -> Option<Epoch> {
        self.current.as_ref().map(|a| a.epoch)
    }

    /// Open `epoch` for ingestion under `schedule` and replay any deferred
    /// records that now fall in range.
    pub fn begin_epoch(&mut self, epoch: Epoch, schedule: &Schedule) -> IngestReport {
        let windows = schedule
            .windows(epoch.start_block, epoch.length_blocks)
            .into_iter()
            .map(|w| (w.coordinator.clone(), w))
            .collect();
        self.current = Some(ActiveEpoch { epoch, windows });

        let mut report = IngestReport::default();
        let held = std::mem::take(&mut self.deferred);
        for record in held.into_values() {
            self.ingest_one(record, None, &mut report);
        }

        if report.consumed() > 0 {
            debug!(
                epoch = %epoch.index,
                replayed = report.consumed(),
                still_pending = report.pending,
                "Replayed deferred contributions"
            );
        }
        report
    }

    /// Apply a batch of records served by `source`'s endpoint, in order.
    ///
    /// A coordinator only vouches for its own records: anything attributed
    /// to another coordinator is dropped as out of window.
    pub fn ingest(&mut self, source: &CoordinatorId, records: Vec<ContributionRecord>) -> IngestReport {
        let mut report = IngestReport::default();
        for record in records {
            self.ingest_one(record, Some(source), &mut report);
        }
        report
    }

    /// `source` is `None` when replaying deferred records, which were
    /// checked against their endpoint on first delivery.
    fn ingest_one(
        &mut self,
        record: ContributionRecord,
        source: Option<&CoordinatorId>,
        report: &mut IngestReport,
    ) {
        let replay = source.is_none();
        if self.seen.contains_key(&record.record_id) {
            report.duplicates += 1;
            if replay {
                report.released.push(record.record_id);
            }
            return;
        }

        // Not remembered as seen: the id may belong to a genuine record the
        // named coordinator has yet to deliver.
        if let Some(source) = source.filter(|s| **s != record.coordinator_id) {
            report.out_of_window += 1;
            warn!(
                record_id = %record.record_id,
                source = %source,
                coordinator_id = %record.coordinator_id,
                "Contribution attributed to a coordinator other than its endpoint's"
            );
            return;
        }

        let active = self.current.as_ref().map(|a| {
            let in_window = a
                .windows
                .get(&record.coordinator_id)
                .is_some_and(|w| w.contains(record.block));
            (a.epoch, in_window)
        });

        let Some((epoch, in_window)) = active else {
            self.defer(record, report, replay);
            return;
        };

        if record.block >= epoch.end_block() {
            self.defer(record, report, replay);
            return;
        }

        // Everything past this point consumes the record for good.
        self.seen.insert(record.record_id.clone(), epoch.index);
        report.processed.push(record.record_id.clone());
        if replay {
            report.released.push(record.record_id.clone());
        }

        if record.block < epoch.start_block {
            report.late += 1;
            warn!(
                record_id = %record.record_id,
                block = record.block,
                epoch = %epoch.index,
                "Dropping contribution from a closed epoch"
            );
            return;
        }

        if record.dimension_samples.is_empty()
            || record.dimension_samples.values().any(|s| !s.is_finite())
        {
            report.rejected += 1;
            warn!(record_id = %record.record_id, "Rejecting contribution with invalid samples");
            return;
        }

        if !in_window {
            report.out_of_window += 1;
            warn!(
                record_id = %record.record_id,
                coordinator_id = %record.coordinator_id,
                block = record.block,
                "Contribution outside the coordinator's window"
            );
            return;
        }

        let subject = record.subject();
        let alpha = self.config.alpha;
        let state = self
            .states
            .entry(subject.clone())
            .or_insert_with(|| ScoreState::new(subject.clone(), epoch.index));

        for (dimension, sample) in &record.dimension_samples {
            let sample = sample.clamp(0.0, 1.0);
            let previous = state.ema.get(dimension).copied();
            state.ema.insert(*dimension, ema_step(previous, sample, alpha));
        }
        state.last_update_epoch = epoch.index;

        report.touched.insert(subject);
        report.applied += 1;
    }

    fn defer(&mut self, record: ContributionRecord, report: &mut IngestReport, replay: bool) {
        report.pending += 1;
        if self.deferred.contains_key(&record.record_id) {
            return;
        }
        if !replay {
            report.deferred.push(record.clone());
        }
        self.deferred.insert(record.record_id.clone(), record);
    }

    /// Collect what `report` changed into a batch for the store.
    pub fn to_batch(
        &self,
        report: &IngestReport,
        cursor: Option<(CoordinatorId, String)>,
    ) -> IngestBatch {
        IngestBatch {
            epoch: self
                .current_epoch()
                .map(|e| e.index)
                .unwrap_or(EpochIndex::GENESIS),
            states: report
                .touched
                .iter()
                .filter_map(|k| self.states.get(k).cloned())
                .collect(),
            processed: report.processed.clone(),
            deferred: report.deferred.clone(),
            released: report.released.clone(),
            cursor,
        }
    }

    /// Freeze the scores of `epoch`.
    ///
    /// Subjects without a contribution in `epoch` are decayed first when
    /// the inactivity policy asks for it; decay is applied at most once per
    /// epoch so freezing again after a restart yields the same snapshot.
    /// Returns the snapshot and the states freezing changed.
    pub fn freeze(&mut self, epoch: Epoch, schedule: &Schedule) -> (FrozenSnapshot, Vec<ScoreState>) {
        let mut changed = Vec::new();

        if self.config.inactivity == InactivityPolicy::Decay {
            let alpha = self.config.alpha;
            for state in self.states.values_mut() {
                let inactive = state.last_update_epoch < epoch.index;
                let pending = state.decayed_through.is_none_or(|d| d < epoch.index);
                if inactive && pending {
                    for value in state.ema.values_mut() {
                        *value = ema_step(Some(*value), 0.0, alpha);
                    }
                    state.decayed_through = Some(epoch.index);
                    changed.push(state.clone());
                }
            }
        }

        let mut pairs = Vec::new();
        let mut providers: BTreeMap<_, f64> = BTreeMap::new();
        for state in self.states.values() {
            if schedule.units_for(&state.subject.coordinator).is_none() {
                continue;
            }
            let aggregate = self.config.weights.combine(&state.ema);
            let share = schedule.share_of(&state.subject.coordinator);
            *providers.entry(state.subject.provider.clone()).or_default() += share * aggregate;
            pairs.push(PairScore {
                subject: state.subject.clone(),
                aggregate,
            });
        }

        debug!(
            epoch = %epoch.index,
            pairs = pairs.len(),
            providers = providers.len(),
            decayed = changed.len(),
            "Froze epoch scores"
        );

        let snapshot = FrozenSnapshot {
            epoch: epoch.index,
            pairs,
            providers,
        };
        (snapshot, changed)
    }

    /// Forget processed ids older than the retention horizon relative to
    /// `epoch`. Returns the oldest epoch still remembered.
    pub fn prune_seen(&mut self, epoch: EpochIndex) -> EpochIndex {
        let horizon = EpochIndex::new(
            epoch
                .value()
                .saturating_sub(self.config.dedup_retention_epochs),
        );
        self.seen.retain(|_, e| *e >= horizon);
        horizon
    }
}
