//! Time-slice allocation primitives.
//!
//! This library partitions a fixed epoch of capacity units among
//! coordinators. Key concepts:
//!
//! - **Request**: a per-epoch value object carrying the stake snapshot,
//!   the total capacity and the minimum guarantee.
//! - **Strategy**: a closed set of allocation functions
//!   ([`Strategy::StakeWeighted`], [`Strategy::Equal`]).
//! - **Degraded schedule**: what a [`DegradePolicy`] produces when the
//!   minimum guarantees cannot all be honored.
//!
//! # Invariants
//!
//! - Allocation is a pure function: identical requests produce identical
//!   schedules, including tie-breaks.
//! - A successful or degraded schedule allocates exactly `total_units`
//!   whenever at least one coordinator is present.
//! - A non-degraded schedule gives every coordinator at least `min_units`.

mod allocate;
mod degrade;
mod schedule;
mod strategy;

use slotshare_id::CoordinatorId;
use thiserror::Error;

pub use allocate::{allocate, CoordinatorStake, ScheduleRequest};
pub use degrade::{DegradePolicy, ProportionalShrink};
pub use schedule::{Allocation, Schedule, ScheduleDigest, SlotWindow};
pub use strategy::{Strategy, UnknownStrategy};

/// Allocation errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AllocationError {
    /// Total capacity must be positive.
    #[error("total capacity must be positive")]
    InvalidCapacity,

    /// The same coordinator appears twice in the stake snapshot.
    #[error("coordinator {0} listed more than once")]
    DuplicateCoordinator(CoordinatorId),

    /// Minimum guarantees exceed the available capacity.
    #[error("minimum guarantees need {required} units but only {available} are available")]
    InsufficientCapacity { required: u64, available: u64 },
}

impl AllocationError {
    /// Returns true if the degraded policy can recover from this error.
    pub fn is_degradable(&self) -> bool {
        matches!(self, Self::InsufficientCapacity { .. })
    }
}
