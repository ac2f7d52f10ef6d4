//! Turning observed block numbers into period boundaries.

use std::ops::RangeInclusive;

/// Tracks the last period boundary that was emitted.
///
/// Boundaries come out strictly increasing and without gaps: if observed blocks jump over whole periods, every
/// skipped period still gets its boundary, because a notary may have been sampled in one of them and its voting
/// window can still be open.
#[derive(Debug, Clone)]
pub struct PeriodScheduler {
    period_length: u64,
    last_emitted: Option<u64>,
}

impl PeriodScheduler {
    /// # Panics
    ///
    /// If `period_length` is zero. The configuration is validated before the scheduler is built.
    pub fn new(period_length: u64) -> Self {
        assert!(period_length > 0, "period length must be non-zero");
        PeriodScheduler {
            period_length,
            last_emitted: None,
        }
    }

    pub fn period_length(&self) -> u64 {
        self.period_length
    }

    pub fn period_of(&self, block_number: u64) -> u64 {
        block_number / self.period_length
    }

    /// The first block of `period`, saturating at [u64::MAX].
    pub fn period_start(&self, period: u64) -> u64 {
        period.saturating_mul(self.period_length)
    }

    pub fn last_emitted(&self) -> Option<u64> {
        self.last_emitted
    }

    /// Observes a block and returns the boundaries it crosses, oldest first. Returns `None` for a block from a period
    /// which has already been emitted (e.g. after a re-org or on resubscription).
    pub fn observe(&mut self, block_number: u64) -> Option<RangeInclusive<u64>> {
        let period = self.period_of(block_number);
        let first = match self.last_emitted {
            None => period,
            Some(last) if period > last => last + 1,
            Some(_) => return None,
        };
        self.last_emitted = Some(period);
        Some(first..=period)
    }
}
