//! Fallback policies for infeasible minimum guarantees.

use crate::allocate::{allocate_with_min, base_total, fair_shares, priority_order, validate};
use crate::schedule::Schedule;
use crate::strategy::Strategy;
use crate::{AllocationError, ScheduleRequest};

/// Produces a schedule when the requested minimum cannot be honored.
///
/// Implementations must still allocate exactly `total_units` and must set
/// [`Schedule::degraded`] whenever the effective minimum is lower than the
/// requested one.
pub trait DegradePolicy: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Build a degraded schedule for `request`.
    fn degrade(&self, request: &ScheduleRequest) -> Result<Schedule, AllocationError>;
}

/// Shrinks every coordinator's minimum by the same factor until the
/// schedule fits.
///
/// All coordinators share one minimum, so a proportional shrink is the
/// largest reduced minimum `m' <= m` for which the strategy succeeds.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProportionalShrink;

impl DegradePolicy for ProportionalShrink {
    fn name(&self) -> &'static str {
        "proportional_shrink"
    }

    fn degrade(&self, request: &ScheduleRequest) -> Result<Schedule, AllocationError> {
        validate(request)?;

        let count = request.coordinators.len() as u64;
        if count == 0 {
            return allocate_with_min(request, request.min_units);
        }

        let equal_min = request.min_units.min(request.total_units / count);
        let feasible_min = match request.strategy {
            Strategy::StakeWeighted => {
                let order = priority_order(&request.coordinators);
                match fair_shares(&order, request.total_units) {
                    Some(fair) => {
                        largest_feasible_min(&fair, request.min_units, request.total_units)
                    }
                    None => equal_min,
                }
            }
            Strategy::Equal => equal_min,
        };

        let mut schedule = allocate_with_min(request, feasible_min)?;
        schedule.degraded = feasible_min < request.min_units;
        Ok(schedule)
    }
}

/// Largest `m' <= min_units` with `sum(max(fair, m')) <= total_units`.
///
/// The sum is monotone in `m'` and `m' = 0` is always feasible because fair
/// shares are rounded down.
fn largest_feasible_min(fair: &[u64], min_units: u64, total_units: u64) -> u64 {
    let total = u128::from(total_units);
    if base_total(fair, min_units) <= total {
        return min_units;
    }

    let (mut lo, mut hi) = (0u64, min_units);
    while hi - lo > 1 {
        let mid = lo + (hi - lo) / 2;
        if base_total(fair, mid) <= total {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    lo
}
