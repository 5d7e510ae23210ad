//! Allocation strategy selector.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How capacity is divided among coordinators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Proportional to stake, with a per-coordinator minimum.
    StakeWeighted,

    /// Equal split; the remainder goes to the lowest ids.
    Equal,
}

impl Strategy {
    /// Canonical name used in logs, storage and digests.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StakeWeighted => "stake_weighted",
            Self::Equal => "equal",
        }
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a strategy name is not recognised.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown allocation strategy: {0:?} (expected \"stake\" or \"equal\")")]
pub struct UnknownStrategy(pub String);

impl FromStr for Strategy {
    type Err = UnknownStrategy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stake" | "stake_weighted" | "stake-weighted" => Ok(Self::StakeWeighted),
            "equal" => Ok(Self::Equal),
            other => Err(UnknownStrategy(other.to_string())),
        }
    }
}
