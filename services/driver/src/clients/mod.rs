//! External collaborators: the stake query, coordinator pool endpoints and
//! the ledger.
//!
//! Each is a trait so the control loop can be driven by fakes in tests;
//! [`http`] holds the `reqwest` implementations used in production.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use slotshare_id::{CommitId, CoordinatorId, EpochIndex, ProviderId};
use thiserror::Error;

use crate::model::ContributionRecord;

pub mod http;

pub use http::{HttpLedger, HttpPoolSource, HttpStakeSource};

/// Errors from external calls.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to build HTTP client: {0}")]
    Build(String),

    #[error("request to {url} failed: {message}")]
    Transport { url: String, message: String },

    #[error("{url} returned {status}: {body}")]
    Status {
        url: String,
        status: u16,
        body: String,
    },

    #[error("invalid response from {url}: {message}")]
    Decode { url: String, message: String },

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("pool endpoint of {coordinator} unreachable: {source}")]
    PoolUnreachable {
        coordinator: CoordinatorId,
        #[source]
        source: Box<ClientError>,
    },

    #[error("ledger rejected commit {commit_id}: {source}")]
    Ledger {
        commit_id: CommitId,
        #[source]
        source: Box<ClientError>,
    },
}

impl ClientError {
    /// Wrap an endpoint failure with the coordinator it belongs to.
    pub fn pool_unreachable(coordinator: CoordinatorId, source: ClientError) -> Self {
        Self::PoolUnreachable {
            coordinator,
            source: Box::new(source),
        }
    }

    /// Wrap a submission failure with its commit id.
    pub fn ledger(commit_id: CommitId, source: ClientError) -> Self {
        Self::Ledger {
            commit_id,
            source: Box::new(source),
        }
    }
}

// =============================================================================
// Stake query
// =============================================================================

/// A coordinator as reported by the network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorInfo {
    pub coordinator_id: CoordinatorId,

    /// Integer amount of the smallest stake unit.
    pub stake: u64,

    /// Base URL of the coordinator's contribution endpoint.
    pub endpoint: String,
}

/// Read-only view of current coordinator stakes.
#[async_trait]
pub trait StakeSource: Send + Sync {
    async fn fetch_stakes(&self) -> Result<Vec<CoordinatorInfo>, ClientError>;
}

// =============================================================================
// Pool endpoints
// =============================================================================

/// One page of records after a cursor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordPage {
    #[serde(default)]
    pub records: Vec<ContributionRecord>,

    /// Cursor to send on the next request; `None` keeps the current one.
    #[serde(default)]
    pub next_cursor: Option<String>,
}

/// Incremental fetch of contribution records from a coordinator.
#[async_trait]
pub trait PoolSource: Send + Sync {
    async fn fetch_records(
        &self,
        endpoint: &str,
        cursor: Option<&str>,
    ) -> Result<RecordPage, ClientError>;
}

// =============================================================================
// Ledger
// =============================================================================

/// One provider's share in a submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubjectWeight {
    pub subject_id: ProviderId,
    pub weight: f64,
}

/// Weight commit payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightSubmission {
    /// Reused across retries of the same commit.
    pub commit_id: CommitId,
    pub epoch: EpochIndex,
    pub weights: Vec<SubjectWeight>,
}

/// The external ledger weights are committed to.
#[async_trait]
pub trait Ledger: Send + Sync {
    async fn current_block(&self) -> Result<u64, ClientError>;

    async fn submit_weights(&self, submission: &WeightSubmission) -> Result<(), ClientError>;
}
