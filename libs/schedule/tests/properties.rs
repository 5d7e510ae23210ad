use proptest::prelude::*;
use slotshare_id::EpochIndex;
use slotshare_schedule::{
    allocate, AllocationError, CoordinatorStake, DegradePolicy, ProportionalShrink,
    ScheduleRequest, Strategy as AllocStrategy,
};

fn coordinators(stakes: Vec<u64>) -> Vec<CoordinatorStake> {
    stakes
        .into_iter()
        .enumerate()
        .map(|(i, stake)| CoordinatorStake::new(format!("coord-{i:03}").parse().unwrap(), stake))
        .collect()
}

fn request(stakes: Vec<u64>, total: u64, min: u64, strategy: AllocStrategy) -> ScheduleRequest {
    ScheduleRequest {
        epoch: EpochIndex::new(11),
        coordinators: coordinators(stakes),
        total_units: total,
        min_units: min,
        strategy,
    }
}

fn strategy() -> impl Strategy<Value = AllocStrategy> {
    prop_oneof![
        Just(AllocStrategy::StakeWeighted),
        Just(AllocStrategy::Equal),
    ]
}

proptest! {
    /// Property: a feasible schedule allocates exactly N units.
    #[test]
    fn prop_conservation(
        stakes in prop::collection::vec(0u64..1_000_000, 1..20),
        total in 1u64..100_000,
        min in 0u64..50,
        strat in strategy(),
    ) {
        let req = request(stakes, total, min, strat);
        match allocate(&req) {
            Ok(schedule) => {
                prop_assert_eq!(schedule.allocated_units(), total);
                prop_assert!(!schedule.degraded);
            }
            Err(e) => prop_assert!(e.is_degradable()),
        }
    }

    /// Property: identical requests produce identical schedules and digests.
    #[test]
    fn prop_deterministic(
        stakes in prop::collection::vec(0u64..1_000, 0..12),
        total in 1u64..10_000,
        min in 0u64..20,
        strat in strategy(),
    ) {
        let req = request(stakes, total, min, strat);
        let first = allocate(&req);
        let second = allocate(&req.clone());
        prop_assert_eq!(&first, &second);
        if let (Ok(a), Ok(b)) = (first, second) {
            prop_assert_eq!(a.digest(), b.digest());
        }
    }

    /// Property: the minimum is honored whenever count * m <= N for the equal
    /// strategy, and whenever the strategy reports success for stake weighting.
    #[test]
    fn prop_minimum_respected(
        stakes in prop::collection::vec(1u64..1_000, 1..10),
        total in 1u64..5_000,
        min in 0u64..100,
    ) {
        let count = stakes.len() as u64;
        let equal = request(stakes.clone(), total, min, AllocStrategy::Equal);
        if count * min <= total {
            let schedule = allocate(&equal).unwrap();
            prop_assert!(schedule.allocations.iter().all(|a| a.units >= min));
        }

        let weighted = request(stakes, total, min, AllocStrategy::StakeWeighted);
        if let Ok(schedule) = allocate(&weighted) {
            prop_assert!(schedule.allocations.iter().all(|a| a.units >= min));
        }
    }

    /// Property: equal split gives exactly N mod count coordinators one extra unit.
    #[test]
    fn prop_equal_remainder(count in 1usize..30, total in 1u64..10_000) {
        let req = request(vec![1; count], total, 0, AllocStrategy::Equal);
        let schedule = allocate(&req).unwrap();
        let base = total / count as u64;
        let extra = schedule.allocations.iter().filter(|a| a.units == base + 1).count() as u64;
        let plain = schedule.allocations.iter().filter(|a| a.units == base).count() as u64;
        prop_assert_eq!(extra, total % count as u64);
        prop_assert_eq!(extra + plain, count as u64);
    }

    /// Property: the degraded policy always conserves capacity.
    #[test]
    fn prop_degraded_conserves(
        stakes in prop::collection::vec(0u64..1_000, 1..15),
        total in 1u64..1_000,
        min in 0u64..500,
        strat in strategy(),
    ) {
        let req = request(stakes, total, min, strat);
        let schedule = ProportionalShrink.degrade(&req).unwrap();
        prop_assert_eq!(schedule.allocated_units(), total);
        prop_assert!(schedule.min_units <= min);
        prop_assert_eq!(schedule.degraded, allocate(&req).is_err());
        prop_assert!(schedule.allocations.iter().all(|a| a.units >= schedule.min_units));
    }
}

#[test]
fn scenario_a_proportional() {
    let req = request(vec![50, 30, 20], 100, 10, AllocStrategy::StakeWeighted);
    let schedule = allocate(&req).unwrap();
    let units: Vec<u64> = schedule.allocations.iter().map(|a| a.units).collect();
    assert_eq!(units, vec![50, 30, 20]);
}

#[test]
fn scenario_b_leftover_to_lowest_priority() {
    let req = request(vec![33, 33, 34], 10, 1, AllocStrategy::StakeWeighted);
    let schedule = allocate(&req).unwrap();
    let units: Vec<(String, u64)> = schedule
        .allocations
        .iter()
        .map(|a| (a.coordinator.to_string(), a.units))
        .collect();
    assert_eq!(
        units,
        vec![
            ("coord-002".to_string(), 3),
            ("coord-000".to_string(), 3),
            ("coord-001".to_string(), 4),
        ]
    );
    assert_eq!(schedule.allocated_units(), 10);
}

#[test]
fn scenario_c_degraded_minimums() {
    let req = request(vec![10, 10, 10], 100, 40, AllocStrategy::StakeWeighted);
    assert_eq!(
        allocate(&req).unwrap_err(),
        AllocationError::InsufficientCapacity {
            required: 120,
            available: 100
        }
    );

    let schedule = ProportionalShrink.degrade(&req).unwrap();
    assert!(schedule.degraded);
    assert_eq!(schedule.allocated_units(), 100);
}
