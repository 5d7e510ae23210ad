//! Command-line interface.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// slotshare - stake-weighted capacity scheduling and reward commits.
#[derive(Debug, Parser)]
#[command(name = "slotshare")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the epoch driver until interrupted.
    Run(RunArgs),
}

/// Options for `slotshare run`.
#[derive(Debug, Clone, Args)]
pub struct RunArgs {
    /// Base URL of the stake query and ledger API.
    #[arg(long, env = "SLOTSHARE_NETWORK")]
    pub network: String,

    /// Path of the SQLite state database.
    #[arg(long, env = "SLOTSHARE_DB_PATH", default_value = "slotshare.db")]
    pub db_path: PathBuf,

    /// Network tempo in blocks.
    #[arg(long, env = "SLOTSHARE_TEMPO", default_value_t = 360)]
    pub tempo: u64,

    /// Epoch length in blocks [default: 2 x tempo].
    #[arg(long, env = "SLOTSHARE_EPOCH_LENGTH")]
    pub epoch_length: Option<u64>,

    /// Capacity units per epoch [default: epoch length].
    #[arg(long, env = "SLOTSHARE_CAPACITY_UNITS")]
    pub capacity_units: Option<u64>,

    /// Minimum units guaranteed to every scheduled coordinator.
    #[arg(long, env = "SLOTSHARE_MIN_UNITS", default_value_t = 10)]
    pub min_units: u64,

    /// Allocation strategy (stake or equal).
    #[arg(long, env = "SLOTSHARE_STRATEGY", default_value = "stake")]
    pub strategy: String,

    /// Blocks between contribution polls.
    #[arg(long, env = "SLOTSHARE_POLL_INTERVAL", default_value_t = 25)]
    pub poll_interval: u64,

    /// Expected block time in milliseconds.
    #[arg(long, env = "SLOTSHARE_BLOCK_TIME_MS", default_value_t = 12_000)]
    pub block_time_ms: u64,

    /// EMA smoothing factor in (0, 1].
    #[arg(long, env = "SLOTSHARE_ALPHA", default_value_t = 0.3)]
    pub alpha: f64,

    /// Inactive-epoch policy (decay or freeze).
    #[arg(long, env = "SLOTSHARE_INACTIVITY", default_value = "decay")]
    pub inactivity: String,

    /// Four comma-separated dimension weights (consistency, memory,
    /// creativity, goal-driven) summing to 1.
    #[arg(
        long,
        env = "SLOTSHARE_DIMENSION_WEIGHTS",
        default_value = "0.25,0.25,0.25,0.25"
    )]
    pub dimension_weights: String,

    /// Coordinators with less stake are not scheduled.
    #[arg(long, env = "SLOTSHARE_MIN_COORDINATOR_STAKE", default_value_t = 0)]
    pub min_coordinator_stake: u64,

    /// Coordinator never to schedule (repeatable).
    #[arg(long = "exclude-coordinator", env = "SLOTSHARE_EXCLUDE_COORDINATORS", value_delimiter = ',')]
    pub exclude_coordinators: Vec<String>,

    /// Pool endpoints fetched concurrently.
    #[arg(long, env = "SLOTSHARE_MAX_POLL_CONCURRENCY", default_value_t = 8)]
    pub max_poll_concurrency: usize,

    /// Consecutive failed polls before an endpoint is marked stale.
    #[arg(long, env = "SLOTSHARE_STALE_AFTER", default_value_t = 3)]
    pub stale_after: u32,

    /// Weight commit attempts per epoch.
    #[arg(long, env = "SLOTSHARE_COMMIT_ATTEMPTS", default_value_t = 5)]
    pub commit_attempts: u32,

    /// Timeout of a single weight submission in seconds.
    #[arg(long, env = "SLOTSHARE_COMMIT_TIMEOUT_SECS", default_value_t = 30)]
    pub commit_timeout_secs: u64,

    /// Timeout of stake, pool and block queries in seconds.
    #[arg(long, env = "SLOTSHARE_REQUEST_TIMEOUT_SECS", default_value_t = 10)]
    pub request_timeout_secs: u64,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "SLOTSHARE_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> RunArgs {
        let cli = Cli::try_parse_from(["slotshare", "run"].iter().chain(args).copied()).unwrap();
        match cli.command {
            Command::Run(args) => args,
        }
    }

    #[test]
    fn test_defaults() {
        let args = parse(&["--network", "http://127.0.0.1:9944"]);
        assert_eq!(args.tempo, 360);
        assert_eq!(args.epoch_length, None);
        assert_eq!(args.min_units, 10);
        assert_eq!(args.poll_interval, 25);
        assert_eq!(args.strategy, "stake");
        assert_eq!(args.inactivity, "decay");
        assert!(args.exclude_coordinators.is_empty());
    }

    #[test]
    fn test_overrides() {
        let args = parse(&[
            "--network",
            "http://node",
            "--epoch-length",
            "100",
            "--min-units",
            "2",
            "--poll-interval",
            "5",
            "--exclude-coordinator",
            "c1",
            "--exclude-coordinator",
            "c2,c3",
            "--log-level",
            "debug",
        ]);
        assert_eq!(args.epoch_length, Some(100));
        assert_eq!(args.min_units, 2);
        assert_eq!(args.poll_interval, 5);
        assert_eq!(args.exclude_coordinators, vec!["c1", "c2", "c3"]);
        assert_eq!(args.log_level, "debug");
    }

    #[test]
    fn test_network_required() {
        assert!(Cli::try_parse_from(["slotshare", "run"]).is_err());
    }
}
