//! Contribution poller.
//!
//! Each poll round spawns one task per coordinator endpoint, bounded by a
//! semaphore. Results are funneled through a single channel so the
//! aggregator has exactly one consumer. Per-endpoint health is tracked
//! here; the consumer reports outcomes back as it applies them.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use slotshare_id::CoordinatorId;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::debug;

use crate::backoff::{retry, BackoffPolicy};
use crate::clients::{ClientError, PoolSource, RecordPage};
use crate::model::PoolInfo;

/// Poller configuration.
#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Blocks between poll rounds.
    pub interval_blocks: u64,

    /// Endpoints fetched concurrently.
    pub max_concurrency: usize,

    /// Fetch attempts per endpoint per round.
    pub attempts: u32,

    pub backoff: BackoffPolicy,

    /// Consecutive failed rounds before an endpoint is marked stale.
    pub stale_after: u32,

    /// How long in-flight polls may outlive the epoch they belong to.
    pub grace: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval_blocks: 25,
            max_concurrency: 8,
            attempts: 3,
            backoff: BackoffPolicy {
                base: Duration::from_millis(200),
                max: Duration::from_secs(5),
                jitter: 0.25,
            },
            stale_after: 3,
            grace: Duration::from_secs(5),
        }
    }
}

/// An endpoint to fetch in a round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollTarget {
    pub coordinator: CoordinatorId,
    pub endpoint: String,
    pub cursor: Option<String>,
}

/// Outcome of one endpoint fetch.
#[derive(Debug)]
pub enum PollEvent {
    Fetched {
        coordinator: CoordinatorId,
        page: RecordPage,
        attempts: u32,
    },
    Failed {
        coordinator: CoordinatorId,
        attempts: u32,
        error: ClientError,
    },
}

/// Consecutive-failure bookkeeping for one endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EndpointHealth {
    pub consecutive_failures: u32,
    pub stale: bool,
}

/// Fans out endpoint fetches and tracks endpoint health.
pub struct ContributionPoller {
    source: Arc<dyn PoolSource>,
    config: PollerConfig,
    health: BTreeMap<CoordinatorId, EndpointHealth>,
}

impl ContributionPoller {
    pub fn new(source: Arc<dyn PoolSource>, config: PollerConfig) -> Self {
        Self {
            source,
            config,
            health: BTreeMap::new(),
        }
    }

    pub fn config(&self) -> &PollerConfig {
        &self.config
    }

    /// Seed health from persisted pool metadata.
    pub fn restore_health<'a>(&mut self, pools: impl IntoIterator<Item = &'a PoolInfo>) {
        for info in pools {
            self.health.insert(
                info.coordinator_id.clone(),
                EndpointHealth {
                    consecutive_failures: info.consecutive_failures,
                    stale: info.stale,
                },
            );
        }
    }

    pub fn health(&self, coordinator: &CoordinatorId) -> EndpointHealth {
        self.health.get(coordinator).copied().unwrap_or_default()
    }

    /// Endpoints currently marked stale.
    pub fn stale(&self) -> BTreeSet<CoordinatorId> {
        self.health
            .iter()
            .filter(|(_, h)| h.stale)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Record a successful fetch. Returns true if the endpoint was stale.
    pub fn record_success(&mut self, coordinator: &CoordinatorId) -> bool {
        let health = self.health.entry(coordinator.clone()).or_default();
        let was_stale = health.stale;
        *health = EndpointHealth::default();
        was_stale
    }

    /// Record a failed round. Returns true if this failure made the
    /// endpoint stale.
    pub fn record_failure(&mut self, coordinator: &CoordinatorId) -> bool {
        let stale_after = self.config.stale_after.max(1);
        let health = self.health.entry(coordinator.clone()).or_default();
        health.consecutive_failures = health.consecutive_failures.saturating_add(1);
        if !health.stale && health.consecutive_failures >= stale_after {
            health.stale = true;
            return true;
        }
        false
    }

    /// Clear an endpoint's history after it sat out an epoch.
    pub fn reset(&mut self, coordinator: &CoordinatorId) {
        self.health.remove(coordinator);
    }

    /// Spawn one fetch per target. Events arrive on the returned round in
    /// completion order; the round ends when every task has reported.
    pub fn start_round(&self, targets: Vec<PollTarget>) -> PollRound {
        let (tx, rx) = mpsc::channel(targets.len().max(1));
        let permits = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
        let mut tasks = JoinSet::new();

        debug!(endpoints = targets.len(), "Starting poll round");

        for target in targets {
            let tx = tx.clone();
            let source = Arc::clone(&self.source);
            let permits = Arc::clone(&permits);
            let backoff = self.config.backoff.clone();
            let attempts = self.config.attempts;

            tasks.spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return;
                };

                let source = source.as_ref();
                let endpoint = target.endpoint.as_str();
                let cursor = target.cursor.as_deref();
                let result = retry(&backoff, attempts, |_| true, move |_| {
                    source.fetch_records(endpoint, cursor)
                })
                .await;

                let event = match result {
                    Ok((page, attempts)) => PollEvent::Fetched {
                        coordinator: target.coordinator,
                        page,
                        attempts,
                    },
                    Err(exhausted) => PollEvent::Failed {
                        error: ClientError::pool_unreachable(
                            target.coordinator.clone(),
                            exhausted.last,
                        ),
                        coordinator: target.coordinator,
                        attempts: exhausted.attempts,
                    },
                };

                // The receiver is gone only when the round was abandoned.
                let _ = tx.send(event).await;
            });
        }

        PollRound { events: rx, tasks }
    }
}

/// An in-flight poll round. Dropping it cancels outstanding fetches.
pub struct PollRound {
    events: mpsc::Receiver<PollEvent>,
    tasks: JoinSet<()>,
}

impl PollRound {
    /// Next completed fetch, or `None` once every endpoint has reported.
    pub async fn next(&mut self) -> Option<PollEvent> {
        self.events.recv().await
    }

    /// Cancel every fetch still in flight.
    pub fn abort(&mut self) {
        self.tasks.abort_all();
        self.events.close();
    }
}
