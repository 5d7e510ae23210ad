//! Schedules, digests and block windows.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use slotshare_id::{CoordinatorId, EpochIndex};

use crate::strategy::Strategy;

/// Units granted to one coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub coordinator: CoordinatorId,
    pub units: u64,
}

/// The allocation for one epoch.
///
/// Allocations are kept in priority order; the order is part of the
/// schedule's identity because block windows are laid out in it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    pub epoch: EpochIndex,

    /// Strategy that actually produced the allocation. A stake-weighted
    /// request over zero total stake reports [`Strategy::Equal`].
    pub strategy: Strategy,

    pub total_units: u64,

    /// Minimum actually honored; lower than requested when degraded.
    pub min_units: u64,

    pub degraded: bool,

    pub allocations: Vec<Allocation>,
}

impl Schedule {
    /// A schedule with no coordinators.
    pub fn empty(epoch: EpochIndex, strategy: Strategy, total_units: u64, min_units: u64) -> Self {
        Self {
            epoch,
            strategy,
            total_units,
            min_units,
            degraded: false,
            allocations: Vec::new(),
        }
    }

    /// Sum of allocated units.
    pub fn allocated_units(&self) -> u64 {
        self.allocations.iter().map(|a| a.units).sum()
    }

    /// Units allocated to `coordinator`, if it is scheduled.
    pub fn units_for(&self, coordinator: &CoordinatorId) -> Option<u64> {
        self.allocations
            .iter()
            .find(|a| &a.coordinator == coordinator)
            .map(|a| a.units)
    }

    /// Fraction of the epoch's capacity given to `coordinator`.
    pub fn share_of(&self, coordinator: &CoordinatorId) -> f64 {
        match self.units_for(coordinator) {
            Some(units) if self.total_units > 0 => units as f64 / self.total_units as f64,
            _ => 0.0,
        }
    }

    /// Iterate over scheduled coordinator ids in priority order.
    pub fn coordinators(&self) -> impl Iterator<Item = &CoordinatorId> {
        self.allocations.iter().map(|a| &a.coordinator)
    }

    /// Content digest of the schedule.
    ///
    /// Every field is fed to the hasher in a fixed order, so two schedules
    /// have the same digest exactly when they are equal.
    pub fn digest(&self) -> ScheduleDigest {
        let mut hasher = Sha256::new();
        hasher.update(self.epoch.value().to_be_bytes());
        hasher.update(self.strategy.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(self.total_units.to_be_bytes());
        hasher.update(self.min_units.to_be_bytes());
        hasher.update([u8::from(self.degraded)]);
        hasher.update((self.allocations.len() as u64).to_be_bytes());
        for a in &self.allocations {
            hasher.update((a.coordinator.as_str().len() as u64).to_be_bytes());
            hasher.update(a.coordinator.as_str().as_bytes());
            hasher.update(a.units.to_be_bytes());
        }
        ScheduleDigest(format!("sha256:{}", hex::encode(hasher.finalize())))
    }

    /// Lay the allocations out across `length_blocks` blocks starting at
    /// `start_block`, contiguously and in priority order.
    ///
    /// Unit boundaries are mapped to blocks proportionally and rounded
    /// down, so windows never overlap and, when every unit is allocated,
    /// the last window ends exactly at `start_block + length_blocks`.
    pub fn windows(&self, start_block: u64, length_blocks: u64) -> Vec<SlotWindow> {
        let mut windows = Vec::with_capacity(self.allocations.len());
        let mut offset = 0u64;
        for a in &self.allocations {
            let start = self.unit_to_block(offset, start_block, length_blocks);
            offset = offset.saturating_add(a.units);
            let end = self.unit_to_block(offset, start_block, length_blocks);
            windows.push(SlotWindow {
                coordinator: a.coordinator.clone(),
                start_block: start,
                end_block: end,
            });
        }
        windows
    }

    /// The window of a single coordinator.
    pub fn window_for(
        &self,
        coordinator: &CoordinatorId,
        start_block: u64,
        length_blocks: u64,
    ) -> Option<SlotWindow> {
        self.windows(start_block, length_blocks)
            .into_iter()
            .find(|w| &w.coordinator == coordinator)
    }

    fn unit_to_block(&self, unit: u64, start_block: u64, length_blocks: u64) -> u64 {
        if self.total_units == 0 {
            return start_block;
        }
        let scaled = u128::from(unit.min(self.total_units)) * u128::from(length_blocks)
            / u128::from(self.total_units);
        // scaled <= length_blocks
        start_block.saturating_add(scaled as u64)
    }
}

/// Half-open block range `[start_block, end_block)` owned by a coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotWindow {
    pub coordinator: CoordinatorId,
    pub start_block: u64,
    pub end_block: u64,
}

impl SlotWindow {
    pub fn contains(&self, block: u64) -> bool {
        block >= self.start_block && block < self.end_block
    }

    pub fn len(&self) -> u64 {
        self.end_block - self.start_block
    }

    pub fn is_empty(&self) -> bool {
        self.end_block == self.start_block
    }
}

/// Content digest of a schedule (`sha256:<hex>`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ScheduleDigest(String);

impl ScheduleDigest {
    /// Wrap a digest read back from storage.
    pub fn from_stored(s: String) -> Self {
        Self(s)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ScheduleDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schedule(units: &[(&str, u64)], total: u64) -> Schedule {
        Schedule {
            epoch: EpochIndex::new(3),
            strategy: Strategy::StakeWeighted,
            total_units: total,
            min_units: 0,
            degraded: false,
            allocations: units
                .iter()
                .map(|(id, u)| Allocation {
                    coordinator: id.parse().unwrap(),
                    units: *u,
                })
                .collect(),
        }
    }

    #[test]
    fn test_digest_deterministic() {
        let a = schedule(&[("a", 5), ("b", 5)], 10);
        let b = schedule(&[("a", 5), ("b", 5)], 10);
        assert_eq!(a.digest(), b.digest());
        assert!(a.digest().as_str().starts_with("sha256:"));
    }

    #[test]
    fn test_digest_sensitive_to_order_and_flags() {
        let a = schedule(&[("a", 5), ("b", 5)], 10);
        let swapped = schedule(&[("b", 5), ("a", 5)], 10);
        assert_ne!(a.digest(), swapped.digest());

        let mut degraded = a.clone();
        degraded.degraded = true;
        assert_ne!(a.digest(), degraded.digest());
    }

    #[test]
    fn test_digest_ids_are_length_prefixed() {
        let a = schedule(&[("ab", 1), ("c", 1)], 2);
        let b = schedule(&[("a", 1), ("bc", 1)], 2);
        assert_ne!(a.digest(), b.digest());
    }

    #[test]
    fn test_windows_cover_epoch() {
        let s = schedule(&[("a", 50), ("b", 30), ("c", 20)], 100);
        let windows = s.windows(1000, 720);
        assert_eq!(windows[0].start_block, 1000);
        assert_eq!(windows[0].end_block, 1360);
        assert_eq!(windows[1].start_block, 1360);
        assert_eq!(windows[1].end_block, 1576);
        assert_eq!(windows[2].end_block, 1720);
        assert!(windows[1].contains(1360));
        assert!(!windows[1].contains(1576));
    }

    #[test]
    fn test_zero_unit_window_is_empty() {
        let s = schedule(&[("a", 10), ("b", 0)], 10);
        let w = s.window_for(&"b".parse().unwrap(), 0, 10).unwrap();
        assert!(w.is_empty());
        assert!(!w.contains(10));
    }

    #[test]
    fn test_share_of() {
        let s = schedule(&[("a", 75), ("b", 25)], 100);
        assert!((s.share_of(&"a".parse().unwrap()) - 0.75).abs() < 1e-12);
        assert_eq!(s.share_of(&"zzz".parse().unwrap()), 0.0);
    }

    #[test]
    fn test_schedule_json_roundtrip() {
        let s = schedule(&[("a", 7), ("b", 3)], 10);
        let json = serde_json::to_string(&s).unwrap();
        assert!(json.contains("\"strategy\":\"stake_weighted\""));
        let back: Schedule = serde_json::from_str(&json).unwrap();
        assert_eq!(back, s);
    }
}
