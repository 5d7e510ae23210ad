//! End-to-end epoch cycles against in-memory collaborators.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use clap::Parser;
use slotshare_driver::backoff::BackoffPolicy;
use slotshare_driver::cli::{Cli, Command};
use slotshare_driver::clients::{
    ClientError, CoordinatorInfo, Ledger, PoolSource, RecordPage, StakeSource, WeightSubmission,
};
use slotshare_driver::epoch::{Checkpoint, Epoch, EpochPhase};
use slotshare_driver::model::{ContributionRecord, Dimension, PoolInfo};
use slotshare_driver::store::{ScheduleStore, SqliteStore};
use slotshare_driver::{Config, DriverDeps, DriverError, EpochDriver};
use slotshare_id::{EpochIndex, ProviderId};
use slotshare_schedule::{Allocation, Schedule, Strategy};
use tokio::sync::watch;
use tokio::task::JoinHandle;

// =============================================================================
// Fakes
// =============================================================================

struct FakeStakes(Vec<CoordinatorInfo>);

#[async_trait]
impl StakeSource for FakeStakes {
    async fn fetch_stakes(&self) -> Result<Vec<CoordinatorInfo>, ClientError> {
        Ok(self.0.clone())
    }
}

/// Serves `records` to the first request without a cursor, then empty
/// pages. Endpoints not listed always fail.
struct FakePool {
    records: BTreeMap<String, Vec<ContributionRecord>>,
}

#[async_trait]
impl PoolSource for FakePool {
    async fn fetch_records(
        &self,
        endpoint: &str,
        cursor: Option<&str>,
    ) -> Result<RecordPage, ClientError> {
        let Some(records) = self.records.get(endpoint) else {
            return Err(ClientError::Status {
                url: endpoint.to_string(),
                status: 503,
                body: "down".into(),
            });
        };
        match cursor {
            None => Ok(RecordPage {
                records: records.clone(),
                next_cursor: Some("end".into()),
            }),
            Some(_) => Ok(RecordPage::default()),
        }
    }
}

/// A chain that advances one block per height query.
struct FakeLedger {
    height: AtomicU64,
    submissions: Mutex<Vec<WeightSubmission>>,
}

impl FakeLedger {
    fn starting_at(height: u64) -> Arc<Self> {
        Arc::new(Self {
            height: AtomicU64::new(height),
            submissions: Mutex::new(Vec::new()),
        })
    }

    fn submissions(&self) -> Vec<WeightSubmission> {
        self.submissions.lock().unwrap().clone()
    }
}

#[async_trait]
impl Ledger for FakeLedger {
    async fn current_block(&self) -> Result<u64, ClientError> {
        Ok(self.height.fetch_add(1, Ordering::SeqCst))
    }

    async fn submit_weights(&self, submission: &WeightSubmission) -> Result<(), ClientError> {
        self.submissions.lock().unwrap().push(submission.clone());
        Ok(())
    }
}

/// A chain that produces one block per `block_time` of tokio time. Tests
/// using it run with a paused clock.
struct ClockLedger {
    origin: tokio::time::Instant,
    block_time: Duration,
    submissions: Mutex<Vec<WeightSubmission>>,
}

impl ClockLedger {
    fn new(block_time: Duration) -> Arc<Self> {
        Arc::new(Self {
            origin: tokio::time::Instant::now(),
            block_time,
            submissions: Mutex::new(Vec::new()),
        })
    }

    fn height(&self) -> u64 {
        (self.origin.elapsed().as_millis() / self.block_time.as_millis()) as u64
    }
}

#[async_trait]
impl Ledger for ClockLedger {
    async fn current_block(&self) -> Result<u64, ClientError> {
        Ok(self.height())
    }

    async fn submit_weights(&self, submission: &WeightSubmission) -> Result<(), ClientError> {
        self.submissions.lock().unwrap().push(submission.clone());
        Ok(())
    }
}

/// Publishes each record one block after the block it was produced in.
/// The cursor is the number of records already served.
struct PublishingPool {
    chain: Arc<ClockLedger>,
    records: Vec<ContributionRecord>,
}

#[async_trait]
impl PoolSource for PublishingPool {
    async fn fetch_records(
        &self,
        _endpoint: &str,
        cursor: Option<&str>,
    ) -> Result<RecordPage, ClientError> {
        let offset: usize = cursor.map_or(0, |c| c.parse().unwrap());
        let height = self.chain.height();
        let records: Vec<_> = self
            .records
            .iter()
            .skip(offset)
            .take_while(|r| r.block < height)
            .cloned()
            .collect();
        Ok(RecordPage {
            next_cursor: Some((offset + records.len()).to_string()),
            records,
        })
    }
}

/// Answers the first request, then stalls for an hour before serving a
/// page that would score `p-slow`.
struct StallingPool;

#[async_trait]
impl PoolSource for StallingPool {
    async fn fetch_records(
        &self,
        _endpoint: &str,
        cursor: Option<&str>,
    ) -> Result<RecordPage, ClientError> {
        if cursor.is_none() {
            return Ok(RecordPage {
                records: vec![record("r-1", "p1", "c1", 3, 0.8)],
                next_cursor: Some("1".into()),
            });
        }
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(RecordPage {
            records: vec![record("r-slow", "p-slow", "c1", 4, 1.0)],
            next_cursor: Some("2".into()),
        })
    }
}

// =============================================================================
// Harness
// =============================================================================

fn config(extra: &[&str]) -> Config {
    let argv = [
        "slotshare",
        "run",
        "--network",
        "http://unused",
        "--epoch-length",
        "20",
        "--poll-interval",
        "1",
        "--block-time-ms",
        "1000",
        "--stale-after",
        "2",
    ];
    let cli = Cli::try_parse_from(argv.iter().chain(extra).copied()).unwrap();
    let Command::Run(args) = cli.command;
    let mut config = Config::from_args(args).unwrap();

    let quick = BackoffPolicy {
        base: Duration::from_millis(1),
        max: Duration::from_millis(2),
        jitter: 0.0,
    };
    config.poller.attempts = 1;
    config.poller.backoff = quick.clone();
    config.weights.backoff = quick;
    config
}

fn coordinator(id: &str, stake: u64) -> CoordinatorInfo {
    CoordinatorInfo {
        coordinator_id: id.parse().unwrap(),
        stake,
        endpoint: format!("mem://{id}"),
    }
}

fn record(id: &str, provider: &str, coordinator: &str, block: u64, value: f64) -> ContributionRecord {
    ContributionRecord {
        record_id: id.parse().unwrap(),
        capacity_provider_id: provider.parse().unwrap(),
        coordinator_id: coordinator.parse().unwrap(),
        block,
        dimension_samples: Dimension::ALL.iter().map(|d| (*d, value)).collect(),
    }
}

struct Network {
    stakes: Arc<dyn StakeSource>,
    pools: Arc<dyn PoolSource>,
}

/// c1 (stake 3) serves records; c2 (stake 1) never answers.
///
/// In epoch 0 c1 owns blocks [0, 15) and c2 owns [15, 20).
fn network() -> Network {
    let stakes = FakeStakes(vec![coordinator("c1", 3), coordinator("c2", 1)]);
    let mut records = BTreeMap::new();
    records.insert(
        "mem://c1".to_string(),
        vec![
            record("r-1", "p1", "c1", 5, 0.8),
            // Inside c2's window, attributed to c1.
            record("r-2", "p2", "c1", 16, 0.9),
            // Belongs to epoch 1.
            record("r-3", "p3", "c1", 25, 0.5),
            // Redelivered.
            record("r-1", "p1", "c1", 5, 0.8),
        ],
    );
    Network {
        stakes: Arc::new(stakes),
        pools: Arc::new(FakePool { records }),
    }
}

/// c1 alone, owning every block of the epoch.
fn solo(pools: Arc<dyn PoolSource>) -> Network {
    Network {
        stakes: Arc::new(FakeStakes(vec![coordinator("c1", 1)])),
        pools,
    }
}

struct Running {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<Result<(), DriverError>>,
}

impl Running {
    async fn stop(self) {
        self.shutdown.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(10), self.handle)
            .await
            .expect("driver did not stop")
            .unwrap()
            .unwrap();
    }
}

fn start(
    config: Config,
    network: &Network,
    ledger: Arc<dyn Ledger>,
    store: &Arc<SqliteStore>,
) -> Running {
    let deps = DriverDeps {
        stakes: network.stakes.clone(),
        pools: network.pools.clone(),
        ledger,
        store: store.clone(),
    };
    let driver = EpochDriver::new(config, deps).unwrap();
    let (shutdown, rx) = watch::channel(false);
    Running {
        shutdown,
        handle: tokio::spawn(driver.run(rx)),
    }
}

async fn wait_for(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(20);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn provider(id: &str) -> ProviderId {
    id.parse().unwrap()
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn test_full_epoch_commits_and_excludes_stale_endpoint() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let ledger = FakeLedger::starting_at(0);
    let network = network();

    let running = start(config(&["--min-units", "1"]), &network, ledger.clone(), &store);
    wait_for("epoch 1 to open", || {
        store.get_schedule(EpochIndex::new(1)).unwrap().is_some()
            && store
                .load_score_states()
                .unwrap()
                .iter()
                .any(|s| s.subject.provider == provider("p3"))
    })
    .await;
    running.stop().await;

    let schedule = store.get_schedule(EpochIndex::GENESIS).unwrap().unwrap();
    assert_eq!(schedule.units_for(&"c1".parse().unwrap()), Some(15));
    assert_eq!(schedule.units_for(&"c2".parse().unwrap()), Some(5));

    // Only p1 scored in epoch 0: r-2 was out of window, r-3 was deferred.
    let submissions = ledger.submissions();
    assert!(!submissions.is_empty());
    assert_eq!(submissions[0].epoch, EpochIndex::GENESIS);
    assert_eq!(submissions[0].weights.len(), 1);
    assert_eq!(submissions[0].weights[0].subject_id, provider("p1"));
    assert!((submissions[0].weights[0].weight - 1.0).abs() < 1e-9);

    let committed = store.get_weights(EpochIndex::GENESIS).unwrap().unwrap();
    assert_eq!(committed.weights.len(), 1);

    let snapshot = store.get_snapshot(EpochIndex::GENESIS).unwrap().unwrap();
    assert!((snapshot.providers[&provider("p1")] - 0.6).abs() < 1e-9);

    // c2 went stale during epoch 0 and sits out epoch 1.
    let next = store.get_schedule(EpochIndex::new(1)).unwrap().unwrap();
    let scheduled: Vec<_> = next.coordinators().map(|c| c.to_string()).collect();
    assert_eq!(scheduled, vec!["c1"]);
    assert_eq!(next.allocated_units(), 20);

    let states = store.load_score_states().unwrap();
    assert!(states.iter().all(|s| s.subject.provider != provider("p2")));
    let p3 = states
        .iter()
        .find(|s| s.subject.provider == provider("p3"))
        .unwrap();
    assert_eq!(p3.last_update_epoch, EpochIndex::new(1));
    assert!(p3.ema[&Dimension::Memory] > 0.0);
}

#[tokio::test]
async fn test_restart_resumes_without_recommitting() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let ledger = FakeLedger::starting_at(0);
    let network = network();

    let first = start(config(&["--min-units", "1"]), &network, ledger.clone(), &store);
    wait_for("epoch 0 commit", || {
        store.get_weights(EpochIndex::GENESIS).unwrap().is_some()
    })
    .await;
    first.stop().await;

    let resumed_from = store.load_checkpoint().unwrap().unwrap();
    assert!(resumed_from.epoch.index >= EpochIndex::new(1));

    let second = start(config(&["--min-units", "1"]), &network, ledger.clone(), &store);
    wait_for("epoch 1 commit", || {
        store.get_weights(EpochIndex::new(1)).unwrap().is_some()
    })
    .await;
    second.stop().await;

    let submissions = ledger.submissions();
    let epochs: Vec<_> = submissions.iter().map(|s| s.epoch.value()).collect();
    assert_eq!(&epochs[..2], &[0, 1]);
    assert!(epochs.windows(2).all(|w| w[0] < w[1]));
    assert_ne!(submissions[0].commit_id, submissions[1].commit_id);

    let checkpoint = store.load_checkpoint().unwrap().unwrap();
    assert!(checkpoint.version > resumed_from.version);
}

#[tokio::test]
async fn test_abandoned_epoch_is_skipped_on_resume() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());

    // A previous run stopped while polling epoch 0.
    let fresh = Checkpoint::fresh(Epoch::containing(0, 20));
    store.save_checkpoint(&fresh).unwrap();
    store.save_checkpoint(&fresh.advance()).unwrap();

    // The chain is now at block 100, inside epoch 5.
    let ledger = FakeLedger::starting_at(100);
    let network = network();

    let running = start(config(&["--min-units", "1"]), &network, ledger.clone(), &store);
    wait_for("epoch 5 schedule", || {
        store.get_schedule(EpochIndex::new(5)).unwrap().is_some()
    })
    .await;
    running.stop().await;

    assert!(store.get_weights(EpochIndex::GENESIS).unwrap().is_none());
    assert!(ledger.submissions().iter().all(|s| s.epoch != EpochIndex::GENESIS));

    let checkpoint = store.load_checkpoint().unwrap().unwrap();
    assert!(checkpoint.epoch.index >= EpochIndex::new(5));
    assert_eq!(checkpoint.epoch.start_block % 20, 0);
}

#[tokio::test]
async fn test_infeasible_minimum_yields_degraded_schedule() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let ledger = FakeLedger::starting_at(0);
    let network = network();

    let config = config(&["--capacity-units", "8", "--min-units", "6"]);
    let running = start(config, &network, ledger.clone(), &store);
    wait_for("epoch 0 schedule", || {
        store.get_schedule(EpochIndex::GENESIS).unwrap().is_some()
    })
    .await;
    running.stop().await;

    let schedule = store.get_schedule(EpochIndex::GENESIS).unwrap().unwrap();
    assert!(schedule.degraded);
    assert!(schedule.min_units < 6);
    assert_eq!(schedule.allocated_units(), 8);

    let checkpoint = store.load_checkpoint().unwrap().unwrap();
    assert_ne!(checkpoint.phase, EpochPhase::Scheduling);
}

#[tokio::test]
async fn test_endpoint_cannot_score_for_another_coordinator() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let ledger = FakeLedger::starting_at(0);

    let mut records = BTreeMap::new();
    records.insert(
        "mem://c1".to_string(),
        vec![
            record("r-1", "p1", "c1", 5, 0.8),
            // Served by c1, claims c2 inside c2's window [15, 20).
            record("forged", "p-forged", "c2", 16, 1.0),
        ],
    );
    records.insert("mem://c2".to_string(), vec![]);
    let network = Network {
        stakes: Arc::new(FakeStakes(vec![coordinator("c1", 3), coordinator("c2", 1)])),
        pools: Arc::new(FakePool { records }),
    };

    let running = start(config(&["--min-units", "1"]), &network, ledger.clone(), &store);
    wait_for("epoch 0 commit", || {
        store.get_weights(EpochIndex::GENESIS).unwrap().is_some()
    })
    .await;
    running.stop().await;

    let snapshot = store.get_snapshot(EpochIndex::GENESIS).unwrap().unwrap();
    assert!(snapshot.providers.contains_key(&provider("p1")));
    assert!(!snapshot.providers.contains_key(&provider("p-forged")));
    assert!(store
        .load_score_states()
        .unwrap()
        .iter()
        .all(|s| s.subject.provider != provider("p-forged")));
}

#[tokio::test(start_paused = true)]
async fn test_records_from_last_blocks_are_scored_in_their_epoch() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let chain = ClockLedger::new(Duration::from_secs(1));
    let pool = PublishingPool {
        chain: chain.clone(),
        records: vec![
            record("r-early", "p-early", "c1", 2, 0.9),
            // Visible from block 20, after the last regular round at 15.
            record("r-last", "p-last", "c1", 19, 0.4),
        ],
    };
    let network = solo(Arc::new(pool));

    let mut config = config(&["--min-units", "1"]);
    config.poller.interval_blocks = 5;
    let running = start(config, &network, chain.clone(), &store);
    wait_for("epoch 0 commit", || {
        store.get_weights(EpochIndex::GENESIS).unwrap().is_some()
    })
    .await;
    running.stop().await;

    let snapshot = store.get_snapshot(EpochIndex::GENESIS).unwrap().unwrap();
    assert!((snapshot.providers[&provider("p-early")] - 0.9).abs() < 1e-9);
    assert!((snapshot.providers[&provider("p-last")] - 0.4).abs() < 1e-9);

    let weights = store.get_weights(EpochIndex::GENESIS).unwrap().unwrap();
    assert_eq!(weights.weights.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_stalled_fetch_is_cancelled_after_grace() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let chain = ClockLedger::new(Duration::from_secs(1));
    let network = solo(Arc::new(StallingPool));

    let mut config = config(&["--min-units", "1"]);
    config.poller.interval_blocks = 5;
    let running = start(config, &network, chain.clone(), &store);
    wait_for("epoch 0 commit", || {
        store.get_weights(EpochIndex::GENESIS).unwrap().is_some()
    })
    .await;

    // Epoch 0 ends at block 20 and the grace period is one block; the
    // stalled fetch would only have answered an hour in.
    let committed_at = chain.height();
    assert!(committed_at >= 20);
    assert!(committed_at < 30, "committed at block {committed_at}");
    running.stop().await;

    let snapshot = store.get_snapshot(EpochIndex::GENESIS).unwrap().unwrap();
    assert!(snapshot.providers.contains_key(&provider("p1")));
    assert!(!snapshot.providers.contains_key(&provider("p-slow")));
    assert!(store
        .load_score_states()
        .unwrap()
        .iter()
        .all(|s| s.subject.provider != provider("p-slow")));
}

#[tokio::test]
async fn test_reused_schedule_releases_stale_endpoint() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let ttl = Duration::from_secs(3600);

    // A previous run persisted epoch 0's schedule without the stale c2 and
    // stopped before clearing c2's stale mark.
    let schedule = Schedule {
        epoch: EpochIndex::GENESIS,
        strategy: Strategy::StakeWeighted,
        total_units: 20,
        min_units: 1,
        degraded: false,
        allocations: vec![Allocation {
            coordinator: "c1".parse().unwrap(),
            units: 20,
        }],
    };
    store.put_schedule(&schedule, ttl).unwrap();
    for (id, failures, stale) in [("c1", 0, false), ("c2", 2, true)] {
        let pool = PoolInfo {
            coordinator_id: id.parse().unwrap(),
            endpoint: format!("mem://{id}"),
            last_seen: Utc::now(),
            consecutive_failures: failures,
            stale,
        };
        store.put_pool_info(&pool, ttl).unwrap();
    }
    store
        .save_checkpoint(&Checkpoint::fresh(Epoch::containing(0, 20)))
        .unwrap();

    // c2 answers again.
    let mut records = BTreeMap::new();
    records.insert("mem://c1".to_string(), vec![]);
    records.insert("mem://c2".to_string(), vec![]);
    let network = Network {
        stakes: Arc::new(FakeStakes(vec![coordinator("c1", 3), coordinator("c2", 1)])),
        pools: Arc::new(FakePool { records }),
    };

    let ledger = FakeLedger::starting_at(0);
    let running = start(config(&["--min-units", "1"]), &network, ledger.clone(), &store);
    wait_for("epoch 1 schedule", || {
        store.get_schedule(EpochIndex::new(1)).unwrap().is_some()
    })
    .await;
    running.stop().await;

    let reused = store.get_schedule(EpochIndex::GENESIS).unwrap().unwrap();
    assert_eq!(reused, schedule);

    let next = store.get_schedule(EpochIndex::new(1)).unwrap().unwrap();
    let scheduled: Vec<_> = next.coordinators().map(|c| c.to_string()).collect();
    assert_eq!(scheduled, vec!["c1", "c2"]);

    let c2 = store
        .list_pool_info()
        .unwrap()
        .into_iter()
        .find(|p| p.coordinator_id.as_str() == "c2")
        .unwrap();
    assert!(!c2.stale);
}
