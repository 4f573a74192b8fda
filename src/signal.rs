//! Countdown counters that gate fences.
//!
//! Every job in a batch is assigned to exactly one signal. The signal's
//! counter is frozen at submit to the number of jobs assigned to it, and
//! each completed job decrements it once. A fence referencing the signal
//! becomes passable when the counter reaches zero.

use std::sync::atomic::{AtomicU32, Ordering};

use crossbeam_utils::CachePadded;

/// Upper bound on signals per batch: the per-slot signal reference is a
/// `u8` and one value is reserved so the count fits.
pub(crate) const MAX_SIGNALS: usize = 255;

/// Index of a signal within its batch, in append order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SignalId(pub(crate) u8);

impl SignalId {
    /// Position of the signal in batch append order.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Countdown of outstanding jobs in one dependency layer.
///
/// Padded to its own cache line: completing jobs on one signal must not
/// invalidate fence checks against a neighboring one.
pub(crate) struct Signal {
    pending: CachePadded<AtomicU32>,
}

impl Signal {
    pub(crate) fn with_pending(jobs: u32) -> Self {
        Self {
            pending: CachePadded::new(AtomicU32::new(jobs)),
        }
    }

    /// One job assigned to this signal finished.
    ///
    /// Release pairs with the Acquire in [`Signal::is_satisfied`] so a
    /// passing fence observes everything the completed jobs wrote.
    pub(crate) fn complete_one(&self) {
        let prev = self.pending.fetch_sub(1, Ordering::Release);
        debug_assert!(prev > 0, "signal decremented below zero");
    }

    pub(crate) fn is_satisfied(&self) -> bool {
        self.pending.load(Ordering::Acquire) == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_down_to_satisfied() {
        let s = Signal::with_pending(2);
        assert!(!s.is_satisfied());
        s.complete_one();
        assert!(!s.is_satisfied());
        s.complete_one();
        assert!(s.is_satisfied());
    }

    #[test]
    fn test_zero_jobs_starts_satisfied() {
        let s = Signal::with_pending(0);
        assert!(s.is_satisfied());
    }

    #[test]
    fn test_signal_id_index() {
        assert_eq!(SignalId(3).index(), 3);
        assert_eq!(SignalId(0).index(), 0);
    }
}
