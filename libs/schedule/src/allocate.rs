//! Allocation strategies.

use std::cmp::Reverse;
use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use slotshare_id::{CoordinatorId, EpochIndex};

use crate::schedule::{Allocation, Schedule};
use crate::strategy::Strategy;
use crate::AllocationError;

/// A coordinator and its stake for one epoch.
///
/// Stake is an integer amount of the smallest stake unit so that fair
/// shares are computed exactly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorStake {
    pub id: CoordinatorId,
    pub stake: u64,
}

impl CoordinatorStake {
    pub fn new(id: CoordinatorId, stake: u64) -> Self {
        Self { id, stake }
    }
}

/// Everything the scheduler needs to allocate one epoch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleRequest {
    pub epoch: EpochIndex,
    pub coordinators: Vec<CoordinatorStake>,
    pub total_units: u64,
    pub min_units: u64,
    pub strategy: Strategy,
}

/// Compute the schedule for an epoch.
///
/// Returns [`AllocationError::InsufficientCapacity`] when the minimum
/// guarantee cannot be met; callers decide whether to fall back to a
/// [`DegradePolicy`](crate::DegradePolicy).
pub fn allocate(request: &ScheduleRequest) -> Result<Schedule, AllocationError> {
    validate(request)?;
    allocate_with_min(request, request.min_units)
}

/// Reject requests no strategy can serve.
pub(crate) fn validate(request: &ScheduleRequest) -> Result<(), AllocationError> {
    if request.total_units == 0 {
        return Err(AllocationError::InvalidCapacity);
    }

    let mut seen = BTreeSet::new();
    for c in &request.coordinators {
        if !seen.insert(&c.id) {
            return Err(AllocationError::DuplicateCoordinator(c.id.clone()));
        }
    }
    Ok(())
}

/// Dispatch on the strategy with an explicit minimum.
pub(crate) fn allocate_with_min(
    request: &ScheduleRequest,
    min_units: u64,
) -> Result<Schedule, AllocationError> {
    if request.coordinators.is_empty() {
        return Ok(Schedule::empty(
            request.epoch,
            request.strategy,
            request.total_units,
            min_units,
        ));
    }

    match request.strategy {
        Strategy::StakeWeighted => stake_weighted(request, min_units),
        Strategy::Equal => equal(request, min_units),
    }
}

/// Coordinators in priority order: stake descending, then id ascending.
pub(crate) fn priority_order(coordinators: &[CoordinatorStake]) -> Vec<&CoordinatorStake> {
    let mut order: Vec<_> = coordinators.iter().collect();
    order.sort_by(|a, b| (Reverse(a.stake), &a.id).cmp(&(Reverse(b.stake), &b.id)));
    order
}

/// Fair shares in priority order, rounded down.
pub(crate) fn fair_shares(order: &[&CoordinatorStake], total_units: u64) -> Option<Vec<u64>> {
    let total_stake: u128 = order.iter().map(|c| u128::from(c.stake)).sum();
    if total_stake == 0 {
        return None;
    }

    let shares = order
        .iter()
        .map(|c| {
            // floor(N * stake / total) <= N, so the narrowing cannot truncate.
            (u128::from(total_units) * u128::from(c.stake) / total_stake) as u64
        })
        .collect();
    Some(shares)
}

/// Sum of `max(fair, min)` over all coordinators.
pub(crate) fn base_total(fair: &[u64], min_units: u64) -> u128 {
    fair.iter().map(|f| u128::from((*f).max(min_units))).sum()
}

fn stake_weighted(request: &ScheduleRequest, min_units: u64) -> Result<Schedule, AllocationError> {
    let order = priority_order(&request.coordinators);

    let Some(fair) = fair_shares(&order, request.total_units) else {
        // No stake anywhere: nothing to weight by.
        return equal(request, min_units);
    };

    let required = base_total(&fair, min_units);
    if required > u128::from(request.total_units) {
        return Err(AllocationError::InsufficientCapacity {
            required: u64::try_from(required).unwrap_or(u64::MAX),
            available: request.total_units,
        });
    }

    let mut allocations: Vec<Allocation> = order
        .iter()
        .zip(&fair)
        .map(|(c, f)| Allocation {
            coordinator: c.id.clone(),
            units: (*f).max(min_units),
        })
        .collect();

    // required <= total_units was checked above.
    let leftover = request.total_units - required as u64;
    if let Some(last) = allocations.last_mut() {
        last.units += leftover;
    }

    Ok(Schedule {
        epoch: request.epoch,
        strategy: Strategy::StakeWeighted,
        total_units: request.total_units,
        min_units,
        degraded: false,
        allocations,
    })
}

fn equal(request: &ScheduleRequest, min_units: u64) -> Result<Schedule, AllocationError> {
    let mut ids: Vec<&CoordinatorId> = request.coordinators.iter().map(|c| &c.id).collect();
    ids.sort();

    let count = ids.len() as u64;
    let base = request.total_units / count;
    let remainder = request.total_units % count;

    if base < min_units {
        return Err(AllocationError::InsufficientCapacity {
            required: min_units.saturating_mul(count),
            available: request.total_units,
        });
    }

    let allocations = ids
        .into_iter()
        .enumerate()
        .map(|(i, id)| Allocation {
            coordinator: id.clone(),
            units: base + u64::from((i as u64) < remainder),
        })
        .collect();

    Ok(Schedule {
        epoch: request.epoch,
        strategy: Strategy::Equal,
        total_units: request.total_units,
        min_units,
        degraded: false,
        allocations,
    })
}
