//! Persistence for schedules, pool metadata, score state and the epoch
//! checkpoint.
//!
//! The store is the single source of truth: a restarted driver rebuilds
//! everything it needs from here.

use std::collections::BTreeMap;
use std::time::Duration;

use slotshare_id::{CommitId, CoordinatorId, EpochIndex, RecordId};
use slotshare_schedule::Schedule;
use thiserror::Error;

use crate::epoch::Checkpoint;
use crate::model::{ContributionRecord, FrozenSnapshot, PoolInfo, ScoreState, WeightVector};

mod sqlite;

pub use sqlite::SqliteStore;

/// Errors from store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Another writer holds the database; safe to retry.
    #[error("store busy: {0}")]
    Busy(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("corrupt data: {0}")]
    Corrupt(String),

    #[error("conflicting write: {0}")]
    Conflict(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Busy(_))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;

        match &e {
            rusqlite::Error::SqliteFailure(err, _)
                if matches!(
                    err.code,
                    ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
                ) =>
            {
                Self::Busy(e.to_string())
            }
            rusqlite::Error::FromSqlConversionFailure(..)
            | rusqlite::Error::InvalidColumnType(..)
            | rusqlite::Error::IntegralValueOutOfRange(..) => Self::Corrupt(e.to_string()),
            _ => Self::Unavailable(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Corrupt(e.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Everything one poll result changes, written atomically so the cursor
/// never runs ahead of the score state it fed.
#[derive(Debug, Clone, Default)]
pub struct IngestBatch {
    pub epoch: EpochIndex,

    /// Score states touched by the batch.
    pub states: Vec<ScoreState>,

    /// Records consumed (applied or rejected) by the batch.
    pub processed: Vec<RecordId>,

    /// Records held back for a later epoch.
    pub deferred: Vec<ContributionRecord>,

    /// Previously deferred records the batch consumed.
    pub released: Vec<RecordId>,

    /// New cursor for a coordinator endpoint.
    pub cursor: Option<(CoordinatorId, String)>,
}

impl IngestBatch {
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
            && self.processed.is_empty()
            && self.deferred.is_empty()
            && self.released.is_empty()
            && self.cursor.is_none()
    }
}

/// Persistent storage used by the driver.
pub trait ScheduleStore: Send + Sync {
    /// Persist the schedule for its epoch. Re-putting an identical schedule
    /// is a no-op; a different one is a [`StoreError::Conflict`].
    fn put_schedule(&self, schedule: &Schedule, ttl: Duration) -> StoreResult<()>;

    fn get_schedule(&self, epoch: EpochIndex) -> StoreResult<Option<Schedule>>;

    fn put_pool_info(&self, info: &PoolInfo, ttl: Duration) -> StoreResult<()>;

    /// Unexpired pool metadata ordered by coordinator id.
    fn list_pool_info(&self) -> StoreResult<Vec<PoolInfo>>;

    fn load_score_states(&self) -> StoreResult<Vec<ScoreState>>;

    fn load_cursors(&self) -> StoreResult<BTreeMap<CoordinatorId, String>>;

    /// Processed record ids applied in `epoch` or later.
    fn processed_since(&self, epoch: EpochIndex) -> StoreResult<Vec<(RecordId, EpochIndex)>>;

    /// Forget processed ids applied before `epoch`.
    fn prune_processed(&self, before: EpochIndex) -> StoreResult<usize>;

    /// Deferred records ordered by block.
    fn load_deferred(&self) -> StoreResult<Vec<ContributionRecord>>;

    fn apply_batch(&self, batch: &IngestBatch) -> StoreResult<()>;

    /// Persist a frozen snapshot together with the states freezing changed.
    /// The first snapshot written for an epoch wins.
    fn put_snapshot(&self, snapshot: &FrozenSnapshot, states: &[ScoreState]) -> StoreResult<()>;

    fn get_snapshot(&self, epoch: EpochIndex) -> StoreResult<Option<FrozenSnapshot>>;

    fn put_weights(&self, weights: &WeightVector, commit_id: &CommitId) -> StoreResult<()>;

    fn get_weights(&self, epoch: EpochIndex) -> StoreResult<Option<WeightVector>>;

    fn load_checkpoint(&self) -> StoreResult<Option<Checkpoint>>;

    /// Compare-and-set on the version: succeeds only if the stored
    /// checkpoint is at `checkpoint.version - 1`, or absent for version 0.
    fn save_checkpoint(&self, checkpoint: &Checkpoint) -> StoreResult<()>;

    /// Remove TTL-expired schedules and pool metadata.
    fn purge_expired(&self) -> StoreResult<usize>;
}
