//! Validated driver configuration.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use slotshare_id::{CoordinatorId, IdError};
use slotshare_schedule::{Strategy, UnknownStrategy};
use thiserror::Error;

use crate::aggregator::{AggregatorConfig, DimensionWeights, InactivityPolicy};
use crate::backoff::BackoffPolicy;
use crate::cli::RunArgs;
use crate::poller::PollerConfig;
use crate::weights::WeightSetterConfig;

/// Errors detected before the driver starts.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    InvalidStrategy(#[from] UnknownStrategy),

    #[error("capacity units must be positive")]
    NonPositiveCapacity,

    #[error("epoch length must be positive")]
    InvalidEpochLength,

    #[error("poll interval must be positive")]
    InvalidPollInterval,

    #[error("block time must be positive")]
    InvalidBlockTime,

    #[error("alpha must be in (0, 1], got {0}")]
    InvalidAlpha(f64),

    #[error("invalid dimension weights: {0}")]
    InvalidDimensionWeights(String),

    #[error("unknown inactivity policy {0:?} (expected \"decay\" or \"freeze\")")]
    InvalidInactivityPolicy(String),

    #[error("invalid coordinator id {id:?}: {source}")]
    InvalidCoordinator {
        id: String,
        #[source]
        source: IdError,
    },

    #[error("invalid network url {0:?}")]
    InvalidUrl(String),

    #[error("{0} must be at least 1")]
    ZeroLimit(&'static str),
}

/// Epoch and scheduling parameters.
#[derive(Debug, Clone)]
pub struct EpochConfig {
    pub length_blocks: u64,
    pub capacity_units: u64,
    pub min_units: u64,
    pub strategy: Strategy,
    pub block_time: Duration,
    pub min_coordinator_stake: u64,
    pub excluded: BTreeSet<CoordinatorId>,
}

impl EpochConfig {
    /// Wall-clock length of an epoch at the expected block time.
    pub fn epoch_duration(&self) -> Duration {
        self.block_time
            .saturating_mul(u32::try_from(self.length_blocks).unwrap_or(u32::MAX))
    }

    /// Lifetime of schedules and pool metadata in the store.
    pub fn record_ttl(&self) -> Duration {
        self.epoch_duration().saturating_mul(2)
    }
}

/// Driver configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the stake query and ledger API.
    pub network_url: String,

    /// SQLite state database.
    pub db_path: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Timeout of stake, pool and block queries.
    pub request_timeout: Duration,

    pub epoch: EpochConfig,
    pub poller: PollerConfig,
    pub aggregator: AggregatorConfig,
    pub weights: WeightSetterConfig,
}

impl Config {
    /// Validate command-line arguments into a configuration.
    pub fn from_args(args: RunArgs) -> Result<Self, ConfigError> {
        let network_url = parse_network(&args.network)?;

        let length_blocks = args.epoch_length.unwrap_or(args.tempo.saturating_mul(2));
        if length_blocks == 0 {
            return Err(ConfigError::InvalidEpochLength);
        }

        let capacity_units = args.capacity_units.unwrap_or(length_blocks);
        if capacity_units == 0 {
            return Err(ConfigError::NonPositiveCapacity);
        }

        if args.poll_interval == 0 {
            return Err(ConfigError::InvalidPollInterval);
        }
        if args.block_time_ms == 0 {
            return Err(ConfigError::InvalidBlockTime);
        }
        if !(args.alpha > 0.0 && args.alpha <= 1.0) {
            return Err(ConfigError::InvalidAlpha(args.alpha));
        }
        if args.max_poll_concurrency == 0 {
            return Err(ConfigError::ZeroLimit("max poll concurrency"));
        }
        if args.stale_after == 0 {
            return Err(ConfigError::ZeroLimit("stale-after"));
        }
        if args.commit_attempts == 0 {
            return Err(ConfigError::ZeroLimit("commit attempts"));
        }

        let strategy: Strategy = args.strategy.parse()?;
        let inactivity: InactivityPolicy = args.inactivity.parse()?;
        let weights = parse_dimension_weights(&args.dimension_weights)?;

        let excluded = args
            .exclude_coordinators
            .iter()
            .map(|id| {
                let id = id.trim();
                CoordinatorId::parse(id).map_err(|source| ConfigError::InvalidCoordinator {
                    id: id.to_string(),
                    source,
                })
            })
            .collect::<Result<BTreeSet<_>, _>>()?;

        let block_time = Duration::from_millis(args.block_time_ms);

        Ok(Self {
            network_url,
            db_path: args.db_path,
            log_level: args.log_level,
            request_timeout: Duration::from_secs(args.request_timeout_secs.max(1)),
            epoch: EpochConfig {
                length_blocks,
                capacity_units,
                min_units: args.min_units,
                strategy,
                block_time,
                min_coordinator_stake: args.min_coordinator_stake,
                excluded,
            },
            poller: PollerConfig {
                interval_blocks: args.poll_interval,
                max_concurrency: args.max_poll_concurrency,
                stale_after: args.stale_after,
                grace: block_time,
                ..Default::default()
            },
            aggregator: AggregatorConfig {
                alpha: args.alpha,
                weights,
                inactivity,
                ..Default::default()
            },
            weights: WeightSetterConfig {
                max_attempts: args.commit_attempts,
                submit_timeout: Duration::from_secs(args.commit_timeout_secs.max(1)),
                backoff: BackoffPolicy::default(),
                ..Default::default()
            },
        })
    }
}

fn parse_network(raw: &str) -> Result<String, ConfigError> {
    let url = reqwest::Url::parse(raw.trim()).map_err(|_| ConfigError::InvalidUrl(raw.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ConfigError::InvalidUrl(raw.to_string()));
    }
    Ok(url.as_str().trim_end_matches('/').to_string())
}

fn parse_dimension_weights(raw: &str) -> Result<DimensionWeights, ConfigError> {
    let values = raw
        .split(',')
        .map(|v| v.trim().parse::<f64>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ConfigError::InvalidDimensionWeights(format!("{raw:?}: {e}")))?;

    let values: [f64; 4] = values.try_into().map_err(|v: Vec<f64>| {
        ConfigError::InvalidDimensionWeights(format!("expected 4 values, got {}", v.len()))
    })?;

    DimensionWeights::new(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::{Cli, Command};
    use clap::Parser;
    use rstest::rstest;

    fn args(extra: &[&str]) -> RunArgs {
        let argv = ["slotshare", "run", "--network", "http://node:9944/"];
        let cli = Cli::try_parse_from(argv.iter().chain(extra).copied()).unwrap();
        match cli.command {
            Command::Run(args) => args,
        }
    }

    #[test]
    fn test_defaults_derive_from_tempo() {
        let config = Config::from_args(args(&[])).unwrap();
        assert_eq!(config.network_url, "http://node:9944");
        assert_eq!(config.epoch.length_blocks, 720);
        assert_eq!(config.epoch.capacity_units, 720);
        assert_eq!(config.epoch.min_units, 10);
        assert_eq!(config.epoch.strategy, Strategy::StakeWeighted);
        assert_eq!(config.poller.interval_blocks, 25);
        assert_eq!(config.aggregator.inactivity, InactivityPolicy::Decay);
        assert_eq!(config.weights.max_attempts, 5);
        assert_eq!(config.epoch.epoch_duration(), Duration::from_secs(720 * 12));
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_args(args(&[
            "--tempo",
            "10",
            "--capacity-units",
            "100",
            "--strategy",
            "equal",
            "--inactivity",
            "freeze",
            "--dimension-weights",
            "0.4, 0.3, 0.2, 0.1",
            "--exclude-coordinator",
            "bad-actor",
        ]))
        .unwrap();
        assert_eq!(config.epoch.length_blocks, 20);
        assert_eq!(config.epoch.capacity_units, 100);
        assert_eq!(config.epoch.strategy, Strategy::Equal);
        assert_eq!(config.aggregator.inactivity, InactivityPolicy::Freeze);
        assert!(config
            .epoch
            .excluded
            .contains(&CoordinatorId::parse("bad-actor").unwrap()));
    }

    #[rstest]
    #[case(&["--strategy", "random"])]
    #[case(&["--capacity-units", "0"])]
    #[case(&["--epoch-length", "0"])]
    #[case(&["--alpha", "0"])]
    #[case(&["--alpha", "1.5"])]
    #[case(&["--dimension-weights", "0.5,0.5"])]
    #[case(&["--dimension-weights", "0.5,0.5,0.5,-0.5"])]
    #[case(&["--inactivity", "forget"])]
    #[case(&["--poll-interval", "0"])]
    #[case(&["--max-poll-concurrency", "0"])]
    fn test_invalid(#[case] extra: &[&str]) {
        assert!(Config::from_args(args(extra)).is_err());
    }

    #[test]
    fn test_invalid_strategy_error() {
        let err = Config::from_args(args(&["--strategy", "random"])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidStrategy(_)));
    }

    #[test]
    fn test_invalid_network() {
        let mut a = args(&[]);
        a.network = "not a url".into();
        assert!(matches!(
            Config::from_args(a).unwrap_err(),
            ConfigError::InvalidUrl(_)
        ));
    }
}
