//! Typed ID definitions.

use crate::{define_id, define_key};

pub use crate::macros::MAX_KEY_LEN;

// =============================================================================
// External keys
// =============================================================================

define_key!(CoordinatorId);
define_key!(ProviderId);
define_key!(RecordId);

// =============================================================================
// Generated IDs
// =============================================================================

define_id!(CommitId, "cmt");

// =============================================================================
// Epochs
// =============================================================================

/// Monotonic epoch counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct EpochIndex(u64);

impl EpochIndex {
    /// The first epoch a fresh deployment starts in.
    pub const GENESIS: Self = Self(0);

    /// Creates an epoch index from a raw counter.
    #[must_use]
    pub const fn new(index: u64) -> Self {
        Self(index)
    }

    /// Returns the underlying counter.
    #[must_use]
    pub const fn value(&self) -> u64 {
        self.0
    }

    /// Returns the following epoch.
    #[must_use]
    pub const fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    /// Returns the preceding epoch, or `None` at genesis.
    #[must_use]
    pub fn prev(&self) -> Option<Self> {
        self.0.checked_sub(1).map(Self)
    }
}

impl std::fmt::Display for EpochIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for EpochIndex {
    fn from(index: u64) -> Self {
        Self(index)
    }
}

impl From<EpochIndex> for u64 {
    fn from(index: EpochIndex) -> Self {
        index.0
    }
}

impl serde::Serialize for EpochIndex {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_u64(self.0)
    }
}

impl<'de> serde::Deserialize<'de> for EpochIndex {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let index = u64::deserialize(deserializer)?;
        Ok(Self(index))
    }
}

// =============================================================================
// Tests
// =============================================================================
