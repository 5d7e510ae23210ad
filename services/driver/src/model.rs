//! Domain types shared by the driver components.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use slotshare_id::{CoordinatorId, EpochIndex, ProviderId, RecordId};

// =============================================================================
// Dimensions
// =============================================================================

/// The fixed set of scored dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    Consistency,
    Memory,
    Creativity,
    #[serde(alias = "goal-driven")]
    GoalDriven,
}

impl Dimension {
    /// All dimensions in their canonical order.
    pub const ALL: [Dimension; 4] = [
        Dimension::Consistency,
        Dimension::Memory,
        Dimension::Creativity,
        Dimension::GoalDriven,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Consistency => "consistency",
            Self::Memory => "memory",
            Self::Creativity => "creativity",
            Self::GoalDriven => "goal_driven",
        }
    }

    /// Position in [`Dimension::ALL`].
    pub fn index(&self) -> usize {
        match self {
            Self::Consistency => 0,
            Self::Memory => 1,
            Self::Creativity => 2,
            Self::GoalDriven => 3,
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Contributions
// =============================================================================

/// One scored interaction reported by a coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContributionRecord {
    pub record_id: RecordId,
    pub capacity_provider_id: ProviderId,
    pub coordinator_id: CoordinatorId,

    /// Block height at which the contribution was produced.
    #[serde(alias = "timestamp")]
    pub block: u64,

    pub dimension_samples: BTreeMap<Dimension, f64>,
}

impl ContributionRecord {
    pub fn subject(&self) -> SubjectKey {
        SubjectKey {
            provider: self.capacity_provider_id.clone(),
            coordinator: self.coordinator_id.clone(),
        }
    }
}

// =============================================================================
// Score state
// =============================================================================

/// The scored subject: a provider as seen by one coordinator.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubjectKey {
    pub provider: ProviderId,
    pub coordinator: CoordinatorId,
}

impl fmt::Display for SubjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.provider, self.coordinator)
    }
}

/// Smoothed per-dimension scores of one subject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreState {
    pub subject: SubjectKey,

    /// EMA per dimension. A dimension is absent until first observed.
    pub ema: BTreeMap<Dimension, f64>,

    /// Last epoch in which a contribution was applied.
    pub last_update_epoch: EpochIndex,

    /// Last epoch whose inactivity decay has been applied.
    pub decayed_through: Option<EpochIndex>,
}

impl ScoreState {
    pub fn new(subject: SubjectKey, epoch: EpochIndex) -> Self {
        Self {
            subject,
            ema: BTreeMap::new(),
            last_update_epoch: epoch,
            decayed_through: None,
        }
    }
}

// =============================================================================
// Pool metadata
// =============================================================================

/// Last known state of a coordinator's reporting endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolInfo {
    pub coordinator_id: CoordinatorId,
    pub endpoint: String,
    pub last_seen: DateTime<Utc>,
    pub consecutive_failures: u32,
    pub stale: bool,
}

// =============================================================================
// Snapshots and weights
// =============================================================================

/// Aggregate score of one (provider, coordinator) pair at freeze time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairScore {
    pub subject: SubjectKey,
    pub aggregate: f64,
}

/// Scores frozen at an epoch boundary. Never modified once taken.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrozenSnapshot {
    pub epoch: EpochIndex,
    pub pairs: Vec<PairScore>,

    /// Pair aggregates collapsed per provider, weighted by each
    /// coordinator's share of the epoch's capacity.
    pub providers: BTreeMap<ProviderId, f64>,
}

impl FrozenSnapshot {
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

/// Normalized weights committed for one epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightVector {
    pub epoch: EpochIndex,
    pub weights: BTreeMap<ProviderId, f64>,
}

impl WeightVector {
    pub fn total(&self) -> f64 {
        self.weights.values().sum()
    }
}
