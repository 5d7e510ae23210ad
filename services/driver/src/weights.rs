//! Weight setter.
//!
//! Normalizes a frozen snapshot into a weight vector and commits it to the
//! ledger. A failed commit is retried with backoff inside the epoch; when
//! retries run out the epoch is skipped and the previous on-ledger weights
//! stay in force.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use slotshare_id::{CommitId, ProviderId};
use tracing::{info, instrument, warn};

use crate::backoff::{retry, BackoffPolicy};
use crate::clients::{ClientError, Ledger, SubjectWeight, WeightSubmission};
use crate::model::{FrozenSnapshot, WeightVector};

/// Weight setter configuration.
#[derive(Debug, Clone)]
pub struct WeightSetterConfig {
    /// Submission attempts per epoch.
    pub max_attempts: u32,

    pub backoff: BackoffPolicy,

    /// Bound on a single submission.
    pub submit_timeout: Duration,

    /// Weights below this are zeroed after normalization.
    pub min_weight: f64,
}

impl Default for WeightSetterConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: BackoffPolicy::default(),
            submit_timeout: Duration::from_secs(30),
            min_weight: 0.001,
        }
    }
}

/// Normalize scores into non-negative weights summing to 1.
///
/// Negative or non-finite scores count as zero. An all-zero input yields a
/// uniform vector. Weights below `min_weight` are then dropped and the rest
/// renormalized, unless that would drop everything.
pub fn normalize(
    scores: &BTreeMap<ProviderId, f64>,
    min_weight: f64,
) -> BTreeMap<ProviderId, f64> {
    if scores.is_empty() {
        return BTreeMap::new();
    }

    let clean = |s: f64| if s.is_finite() && s > 0.0 { s } else { 0.0 };
    let total: f64 = scores.values().map(|s| clean(*s)).sum();

    if total <= 0.0 {
        let uniform = 1.0 / scores.len() as f64;
        return scores.keys().map(|k| (k.clone(), uniform)).collect();
    }

    let weights: BTreeMap<_, _> = scores
        .iter()
        .map(|(k, s)| (k.clone(), clean(*s) / total))
        .collect();

    if min_weight <= 0.0 {
        return weights;
    }

    let kept: f64 = weights.values().filter(|w| **w >= min_weight).sum();
    if kept <= 0.0 {
        return weights;
    }

    weights
        .into_iter()
        .map(|(k, w)| (k, if w >= min_weight { w / kept } else { 0.0 }))
        .collect()
}

/// Why a commit was not made.
#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    /// The snapshot had no subjects.
    NoSubjects,

    /// Every attempt failed.
    Exhausted {
        commit_id: CommitId,
        attempts: u32,
        error: String,
    },
}

/// Result of one epoch's commit.
#[derive(Debug, Clone, PartialEq)]
pub enum CommitOutcome {
    Committed {
        commit_id: CommitId,
        vector: WeightVector,
        attempts: u32,
    },
    Skipped(SkipReason),
}

/// Commits weight vectors to the ledger.
pub struct WeightSetter {
    ledger: Arc<dyn Ledger>,
    config: WeightSetterConfig,
}

impl WeightSetter {
    pub fn new(ledger: Arc<dyn Ledger>, config: WeightSetterConfig) -> Self {
        Self { ledger, config }
    }

    /// The vector that would be committed for `snapshot`.
    pub fn weights_for(&self, snapshot: &FrozenSnapshot) -> WeightVector {
        WeightVector {
            epoch: snapshot.epoch,
            weights: normalize(&snapshot.providers, self.config.min_weight),
        }
    }

    /// Commit the snapshot. Never fails; an unsuccessful commit is reported
    /// as [`CommitOutcome::Skipped`].
    #[instrument(skip_all, fields(epoch = %snapshot.epoch))]
    pub async fn commit(&self, snapshot: &FrozenSnapshot) -> CommitOutcome {
        if snapshot.is_empty() {
            warn!("No scored subjects; skipping weight commit");
            return CommitOutcome::Skipped(SkipReason::NoSubjects);
        }

        let vector = self.weights_for(snapshot);
        let commit_id = CommitId::new();
        let submission = WeightSubmission {
            commit_id,
            epoch: vector.epoch,
            weights: vector
                .weights
                .iter()
                .map(|(subject_id, weight)| SubjectWeight {
                    subject_id: subject_id.clone(),
                    weight: *weight,
                })
                .collect(),
        };

        let ledger = self.ledger.as_ref();
        let submission = &submission;
        let timeout = self.config.submit_timeout;

        let result = retry(
            &self.config.backoff,
            self.config.max_attempts,
            |_| true,
            move |attempt| async move {
                match tokio::time::timeout(timeout, ledger.submit_weights(submission)).await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => {
                        warn!(attempt, commit_id = %commit_id, error = %e, "Weight commit attempt failed");
                        Err(ClientError::ledger(commit_id, e))
                    }
                    Err(_) => {
                        warn!(attempt, commit_id = %commit_id, "Weight commit attempt timed out");
                        Err(ClientError::ledger(commit_id, ClientError::Timeout(timeout)))
                    }
                }
            },
        )
        .await;

        match result {
            Ok(((), attempts)) => {
                info!(
                    commit_id = %commit_id,
                    subjects = vector.weights.len(),
                    attempts,
                    "Committed weights"
                );
                CommitOutcome::Committed {
                    commit_id,
                    vector,
                    attempts,
                }
            }
            Err(exhausted) => {
                warn!(
                    commit_id = %commit_id,
                    attempts = exhausted.attempts,
                    error = %exhausted.last,
                    "Weight commit failed; previous on-ledger weights remain in force"
                );
                CommitOutcome::Skipped(SkipReason::Exhausted {
                    commit_id,
                    attempts: exhausted.attempts,
                    error: exhausted.last.to_string(),
                })
            }
        }
    }
}
