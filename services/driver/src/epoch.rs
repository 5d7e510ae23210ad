//! Epoch state machine.

use serde::{Deserialize, Serialize};
use slotshare_id::EpochIndex;

/// A fixed range of blocks on the epoch grid.
///
/// Epoch `i` covers `[i * length_blocks, (i + 1) * length_blocks)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Epoch {
    pub index: EpochIndex,
    pub start_block: u64,
    pub length_blocks: u64,
}

impl Epoch {
    /// The epoch containing `block`.
    pub fn containing(block: u64, length_blocks: u64) -> Self {
        let length_blocks = length_blocks.max(1);
        let index = block / length_blocks;
        Self {
            index: EpochIndex::new(index),
            start_block: index * length_blocks,
            length_blocks,
        }
    }

    /// First block after the epoch.
    pub fn end_block(&self) -> u64 {
        self.start_block.saturating_add(self.length_blocks)
    }

    pub fn contains(&self, block: u64) -> bool {
        block >= self.start_block && block < self.end_block()
    }

    /// The epoch immediately after this one.
    pub fn next(&self) -> Self {
        Self {
            index: self.index.next(),
            start_block: self.end_block(),
            length_blocks: self.length_blocks,
        }
    }

    /// Whether `block` is more than one full epoch past this epoch's end.
    pub fn is_abandoned_at(&self, block: u64) -> bool {
        block >= self.end_block().saturating_add(self.length_blocks)
    }
}

/// Phase of the epoch cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EpochPhase {
    /// Fetch stakes, allocate and persist the schedule.
    Scheduling,
    /// Poll coordinator endpoints until the epoch ends.
    Polling,
    /// Freeze the aggregate scores.
    Aggregating,
    /// Commit weights, then advance to the next epoch.
    Committing,
}

impl EpochPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduling => "scheduling",
            Self::Polling => "polling",
            Self::Aggregating => "aggregating",
            Self::Committing => "committing",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "scheduling" => Some(Self::Scheduling),
            "polling" => Some(Self::Polling),
            "aggregating" => Some(Self::Aggregating),
            "committing" => Some(Self::Committing),
            _ => None,
        }
    }

    /// The phase that follows within the same epoch, or `None` after
    /// committing (the cycle restarts on the next epoch).
    pub fn successor(&self) -> Option<Self> {
        match self {
            Self::Scheduling => Some(Self::Polling),
            Self::Polling => Some(Self::Aggregating),
            Self::Aggregating => Some(Self::Committing),
            Self::Committing => None,
        }
    }
}

impl std::fmt::Display for EpochPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted position of the control loop.
///
/// `version` increases by one on every write; the store only accepts a
/// write whose previous version matches, so two drivers sharing a store
/// cannot interleave transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
    pub epoch: Epoch,
    pub phase: EpochPhase,
    pub next_poll_block: u64,
    pub version: u64,
}

impl Checkpoint {
    /// Starting point for a store with no checkpoint.
    pub fn fresh(epoch: Epoch) -> Self {
        Self {
            epoch,
            phase: EpochPhase::Scheduling,
            next_poll_block: epoch.start_block,
            version: 0,
        }
    }

    /// Move to the next phase of the same epoch.
    pub fn advance(&self) -> Self {
        match self.phase.successor() {
            Some(phase) => Self {
                phase,
                version: self.version + 1,
                ..*self
            },
            None => self.begin(self.epoch.next()),
        }
    }

    /// Start `epoch` from its first phase.
    pub fn begin(&self, epoch: Epoch) -> Self {
        Self {
            epoch,
            phase: EpochPhase::Scheduling,
            next_poll_block: epoch.start_block,
            version: self.version + 1,
        }
    }

    /// Same phase, new poll deadline. Regular rounds never schedule past
    /// the epoch's end block.
    pub fn with_next_poll(&self, block: u64) -> Self {
        Self {
            next_poll_block: block.min(self.epoch.end_block()),
            version: self.version + 1,
            ..*self
        }
    }

    /// Record that the round run after the epoch's last block has finished.
    pub fn with_closing_poll(&self) -> Self {
        Self {
            next_poll_block: self.epoch.end_block().saturating_add(1),
            version: self.version + 1,
            ..*self
        }
    }

    /// Whether the closing round of the epoch has run.
    pub fn is_drained(&self) -> bool {
        self.next_poll_block > self.epoch.end_block()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_epoch_grid() {
        let e = Epoch::containing(1500, 720);
        assert_eq!(e.index, EpochIndex::new(2));
        assert_eq!(e.start_block, 1440);
        assert_eq!(e.end_block(), 2160);
        assert!(e.contains(1440));
        assert!(!e.contains(2160));
        assert_eq!(e.next().start_block, 2160);
        assert_eq!(e.next().index, EpochIndex::new(3));
    }

    #[test]
    fn test_abandoned() {
        let e = Epoch::containing(0, 100);
        assert!(!e.is_abandoned_at(150));
        assert!(!e.is_abandoned_at(199));
        assert!(e.is_abandoned_at(200));
    }

    #[test]
    fn test_phase_cycle() {
        let e = Epoch::containing(0, 10);
        let mut cp = Checkpoint::fresh(e);
        let mut seen = vec![cp.phase];
        for _ in 0..4 {
            cp = cp.advance();
            seen.push(cp.phase);
        }
        assert_eq!(
            seen,
            vec![
                EpochPhase::Scheduling,
                EpochPhase::Polling,
                EpochPhase::Aggregating,
                EpochPhase::Committing,
                EpochPhase::Scheduling,
            ]
        );
        assert_eq!(cp.epoch.index, EpochIndex::new(1));
        assert_eq!(cp.version, 4);
        assert_eq!(cp.next_poll_block, 10);
    }

    #[test]
    fn test_closing_poll() {
        let cp = Checkpoint::fresh(Epoch::containing(0, 20)).advance();
        assert!(!cp.is_drained());

        // A regular round scheduled past the end stops at the end block,
        // so the closing round still runs.
        let late = cp.with_next_poll(23);
        assert_eq!(late.next_poll_block, 20);
        assert!(!late.is_drained());

        let closed = late.with_closing_poll();
        assert!(closed.is_drained());
        assert_eq!(closed.phase, EpochPhase::Polling);
        assert_eq!(closed.version, late.version + 1);

        let next = closed.advance().advance().advance();
        assert_eq!(next.epoch.index, EpochIndex::new(1));
        assert!(!next.is_drained());
    }

    #[test]
    fn test_phase_roundtrip() {
        for phase in [
            EpochPhase::Scheduling,
            EpochPhase::Polling,
            EpochPhase::Aggregating,
            EpochPhase::Committing,
        ] {
            assert_eq!(EpochPhase::parse(phase.as_str()), Some(phase));
        }
        assert_eq!(EpochPhase::parse("done"), None);
    }
}
