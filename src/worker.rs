//! Worker threads and their bounded batch queues.
//!
//! Every worker owns a ring of batch handles. The scheduler fans a
//! submitted batch out to every ring, and each worker independently claims
//! the highest-priority entry, pulls jobs from it until it blocks or
//! retires, and drops retired entries. There is no stealing; batches are
//! shared by construction, so an idle worker always has the same work
//! visible as a busy one.

use std::cell::UnsafeCell;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_utils::{Backoff, CachePadded};

use crate::batch::{ExecOutcome, Priority, TaskBatch};
use crate::stats::{LocalStats, WorkerMetricsCell};
use crate::PinningStrategy;

/// Capacity of each worker's batch ring. Submission spin-waits while a
/// ring is full, so this bounds scheduler-side memory, not throughput.
pub const MAX_QUEUED_BATCHES: usize = 32;

struct RingSlot(UnsafeCell<Option<TaskBatch>>);

// SAFETY: slot access follows the base/last ownership discipline described
// on `BatchRing`.
unsafe impl Sync for RingSlot {}

/// Bounded ring of batch handles with single-writer index discipline.
///
/// `last` advances only while the producer lock is held; `base` advances
/// only on the consumer side. Slots at positions `base..last` belong to
/// the consumer, the slot at `last` belongs to the producer holding the
/// lock, and everything else is vacant. Indices grow monotonically and
/// wrap modulo the capacity when used as positions.
///
/// Exactly one thread may act as consumer at a time. The role may move to
/// another thread only across a happens-before edge, which is how the
/// scheduler sweeps leftovers after joining the worker.
pub(crate) struct BatchRing {
    slots: Box<[RingSlot]>,
    base: CachePadded<AtomicUsize>,
    last: CachePadded<AtomicUsize>,
    write_lock: crate::spin::SpinMutex<()>,
}

impl BatchRing {
    pub(crate) fn new() -> Self {
        let slots = (0..MAX_QUEUED_BATCHES)
            .map(|_| RingSlot(UnsafeCell::new(None)))
            .collect();
        Self {
            slots,
            base: CachePadded::new(AtomicUsize::new(0)),
            last: CachePadded::new(AtomicUsize::new(0)),
            write_lock: crate::spin::SpinMutex::new(()),
        }
    }

    #[inline]
    fn base_index(&self) -> usize {
        self.base.load(Ordering::Acquire)
    }

    #[inline]
    fn last_index(&self) -> usize {
        self.last.load(Ordering::Acquire)
    }

    pub(crate) fn len(&self) -> usize {
        self.last_index().wrapping_sub(self.base_index())
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Producer side: appends a batch, spin-waiting while the ring is
    /// full. Refuses with the batch handed back once `stop` is observed,
    /// so shutdown cannot live-lock on a ring nobody will drain.
    pub(crate) fn push(&self, batch: TaskBatch, stop: &AtomicBool) -> Result<(), TaskBatch> {
        let _guard = self.write_lock.lock();
        let backoff = Backoff::new();
        loop {
            if stop.load(Ordering::Acquire) {
                return Err(batch);
            }
            let last = self.last.load(Ordering::Relaxed);
            if last.wrapping_sub(self.base_index()) < MAX_QUEUED_BATCHES {
                let slot = &self.slots[last % MAX_QUEUED_BATCHES];
                // SAFETY: `last` is outside the consumer range until the
                // store below publishes it, and the write lock keeps other
                // producers away from this slot.
                unsafe {
                    *slot.0.get() = Some(batch);
                }
                self.last.store(last.wrapping_add(1), Ordering::Release);
                return Ok(());
            }
            backoff.snooze();
        }
    }

    /// Consumer side: selection inputs for the entry at absolute index
    /// `at`, without cloning the handle.
    fn probe(&self, at: usize) -> (Priority, bool, usize) {
        let slot = &self.slots[at % MAX_QUEUED_BATCHES];
        // SAFETY: `at` is inside the consumer-owned range and only the
        // consumer thread mutates that range.
        match unsafe { (*slot.0.get()).as_ref() } {
            Some(batch) => (batch.priority(), batch.is_terminal(), batch.key()),
            None => {
                debug_assert!(false, "vacant slot inside the occupied range");
                (Priority::Low, true, 0)
            }
        }
    }

    /// Consumer side: clones the handle at absolute index `at`.
    fn peek(&self, at: usize) -> Option<TaskBatch> {
        let slot = &self.slots[at % MAX_QUEUED_BATCHES];
        // SAFETY: as for `probe`.
        unsafe { (*slot.0.get()).clone() }
    }

    /// Consumer side: removes the entry at absolute index `at` by swapping
    /// it down to the base and advancing the base. Entry order is not
    /// significant once selection is priority-driven.
    fn release_at(&self, at: usize) -> Option<TaskBatch> {
        let base = self.base.load(Ordering::Relaxed);
        let last = self.last_index();
        if at.wrapping_sub(base) >= last.wrapping_sub(base) {
            return None;
        }
        let bslot = self.slots[base % MAX_QUEUED_BATCHES].0.get();
        let aslot = self.slots[at % MAX_QUEUED_BATCHES].0.get();
        // SAFETY: both positions are inside the consumer-owned range.
        let taken = unsafe {
            if at != base {
                std::ptr::swap(bslot, aslot);
            }
            (*bslot).take()
        };
        debug_assert!(taken.is_some(), "vacant slot inside the occupied range");
        self.base.store(base.wrapping_add(1), Ordering::Release);
        taken
    }

    /// Consumer side: removes and returns the oldest entry.
    pub(crate) fn pop_base(&self) -> Option<TaskBatch> {
        let base = self.base.load(Ordering::Relaxed);
        if base == self.last_index() {
            return None;
        }
        self.release_at(base)
    }
}

/// State shared between a worker thread and the scheduler.
pub(crate) struct WorkerShared {
    pub(crate) ring: BatchRing,
    pub(crate) stop: AtomicBool,
    pub(crate) metrics: WorkerMetricsCell,
}

impl WorkerShared {
    pub(crate) fn new() -> Self {
        Self {
            ring: BatchRing::new(),
            stop: AtomicBool::new(false),
            metrics: WorkerMetricsCell::new(),
        }
    }
}

/// One OS thread of the pool, draining its private batch ring.
pub(crate) struct Worker {
    id: usize,
    shared: Arc<WorkerShared>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Spawns the worker thread. Surfaces the underlying spawn error so
    /// the scheduler can roll back an incomplete pool.
    pub(crate) fn spawn(id: usize, pinning: PinningStrategy) -> io::Result<Worker> {
        let shared = Arc::new(WorkerShared::new());
        let thread_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(format!("framejob-worker-{id}"))
            .spawn(move || {
                pin_current(id, pinning);
                tracing::debug!(worker = id, "worker started");
                run_loop(id, &thread_shared);
                tracing::debug!(worker = id, "worker stopped");
            })?;
        Ok(Worker {
            id,
            shared,
            handle: Some(handle),
        })
    }

    pub(crate) fn id(&self) -> usize {
        self.id
    }

    pub(crate) fn shared(&self) -> &Arc<WorkerShared> {
        &self.shared
    }

    /// Flags the thread to stop. It aborts and drops everything left on
    /// its ring on the way out.
    pub(crate) fn signal_stop(&self) {
        self.shared.stop.store(true, Ordering::Release);
    }

    /// Joins the thread. `Err` means the worker panicked.
    pub(crate) fn join(&mut self) -> thread::Result<()> {
        match self.handle.take() {
            Some(handle) => handle.join(),
            None => Ok(()),
        }
    }
}

/// Applies the configured pinning for worker `id`: its own logical core
/// under `Linear`, every other core under `AvoidSmt`. Out-of-range ids are
/// left to the OS scheduler.
fn pin_current(id: usize, pinning: PinningStrategy) {
    let index = match pinning {
        PinningStrategy::None => return,
        PinningStrategy::Linear => id,
        PinningStrategy::AvoidSmt => id * 2,
    };
    if let Some(core_ids) = core_affinity::get_core_ids() {
        if index < core_ids.len() {
            core_affinity::set_for_current(core_ids[index]);
        }
    }
}

/// Main worker loop.
///
/// A claim is one batch the worker is currently pulling jobs from, held
/// across iterations so consecutive jobs of the same batch skip
/// reselection. The claim is given up after two blocked attempts in a row
/// and the blocked batch is remembered, so selection can prefer a
/// different batch of equal priority next time around.
fn run_loop(id: usize, shared: &WorkerShared) {
    let mut claimed: Option<TaskBatch> = None;
    let mut local = LocalStats::new();
    let mut blocked_streak = 0u32;
    let mut last_blocked: Option<usize> = None;
    let mut idle = Backoff::new();

    loop {
        if shared.stop.load(Ordering::Acquire) {
            break;
        }

        if claimed.is_none() {
            sweep_terminal(&shared.ring);
            claimed = select(&shared.ring, last_blocked);
            if let Some(batch) = &claimed {
                batch.acquire_accessor();
                blocked_streak = 0;
            }
        }

        let Some(batch) = claimed.as_ref() else {
            shared.metrics.empty_polls.fetch_add(1, Ordering::Relaxed);
            idle.snooze();
            continue;
        };
        let key = batch.key();
        let outcome = batch.execute_next(&mut local);
        idle = Backoff::new();

        match outcome {
            ExecOutcome::Executed => {
                blocked_streak = 0;
                shared.metrics.jobs_executed.fetch_add(1, Ordering::Relaxed);
            }
            ExecOutcome::Blocked => {
                blocked_streak += 1;
                last_blocked = Some(key);
                if blocked_streak >= 2 {
                    // Two misses in a row: stop monopolizing the claim so
                    // another batch can be picked up.
                    if let Some(batch) = claimed.take() {
                        batch.merge_stats(&mut local);
                        batch.release_accessor();
                    }
                    blocked_streak = 0;
                    shared
                        .metrics
                        .blocked_releases
                        .fetch_add(1, Ordering::Relaxed);
                } else {
                    thread::yield_now();
                }
            }
            ExecOutcome::Retired => {
                if let Some(batch) = claimed.take() {
                    batch.merge_stats(&mut local);
                    remove_from_ring(&shared.ring, key);
                    shared.metrics.batches_retired.fetch_add(1, Ordering::Relaxed);
                    // Waiters may return the moment this drops to zero, so
                    // all bookkeeping happens before the release.
                    batch.release_accessor();
                    tracing::trace!(worker = id, batch = batch.display_label(), "batch retired");
                }
                blocked_streak = 0;
            }
        }
    }

    if let Some(batch) = claimed.take() {
        batch.merge_stats(&mut local);
        batch.release_accessor();
    }
    drain_on_stop(id, shared);
}

/// Drops ring entries that already reached a terminal state, so their
/// handles release promptly and selection never reconsiders them.
fn sweep_terminal(ring: &BatchRing) {
    loop {
        let base = ring.base_index();
        let last = ring.last_index();
        let mut removed = false;
        let mut at = base;
        while at != last {
            let (_, terminal, _) = ring.probe(at);
            if terminal {
                drop(ring.release_at(at));
                removed = true;
                // The swap moved an unvisited entry to the base; rescan.
                break;
            }
            at = at.wrapping_add(1);
        }
        if !removed {
            return;
        }
    }
}

/// Picks the next batch to claim. The highest priority wins; among equals
/// the batch that last blocked this worker is passed over when any
/// alternative exists. Taking the maximum first means a `VeryHigh` entry
/// is never deferred by that tie-break.
fn select(ring: &BatchRing, last_blocked: Option<usize>) -> Option<TaskBatch> {
    let base = ring.base_index();
    let last = ring.last_index();
    let mut best: Option<(usize, Priority, usize)> = None;
    let mut at = base;
    while at != last {
        let (priority, terminal, key) = ring.probe(at);
        if !terminal {
            let better = match &best {
                None => true,
                Some((_, best_priority, best_key)) => {
                    priority > *best_priority
                        || (priority == *best_priority
                            && Some(*best_key) == last_blocked
                            && Some(key) != last_blocked)
                }
            };
            if better {
                best = Some((at, priority, key));
            }
        }
        at = at.wrapping_add(1);
    }
    best.and_then(|(at, _, _)| ring.peek(at))
}

/// Drops the ring entry for `key`, if it is still present. Another sweep
/// may already have removed it after the batch turned terminal.
fn remove_from_ring(ring: &BatchRing, key: usize) {
    let base = ring.base_index();
    let last = ring.last_index();
    let mut at = base;
    while at != last {
        let (_, _, k) = ring.probe(at);
        if k == key {
            drop(ring.release_at(at));
            return;
        }
        at = at.wrapping_add(1);
    }
}

/// Stop path: abort and drop everything still queued so waiters observe a
/// terminal state instead of hanging on work nobody will run.
fn drain_on_stop(id: usize, shared: &WorkerShared) {
    let mut aborted = 0usize;
    while let Some(batch) = shared.ring.pop_base() {
        batch.abort();
        aborted += 1;
    }
    if aborted > 0 {
        tracing::debug!(worker = id, aborted, "aborted queued batches on stop");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Job;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn sealed_batch(hits: &Arc<AtomicUsize>, jobs: usize, priority: Priority) -> TaskBatch {
        let batch = TaskBatch::new();
        for _ in 0..jobs {
            let hits = Arc::clone(hits);
            batch
                .add_job(Job::new(move || {
                    hits.fetch_add(1, Ordering::SeqCst);
                }))
                .unwrap();
        }
        batch.seal(priority);
        batch
    }

    #[test]
    fn test_ring_push_and_pop() {
        let ring = BatchRing::new();
        let stop = AtomicBool::new(false);
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            ring.push(sealed_batch(&hits, 1, Priority::Normal), &stop)
                .unwrap();
        }
        assert_eq!(ring.len(), 3);
        assert!(ring.pop_base().is_some());
        assert_eq!(ring.len(), 2);
    }

    #[test]
    fn test_ring_refuses_when_stopped() {
        let ring = BatchRing::new();
        let stop = AtomicBool::new(true);
        let hits = Arc::new(AtomicUsize::new(0));
        let batch = sealed_batch(&hits, 1, Priority::Normal);
        assert!(ring.push(batch, &stop).is_err());
        assert!(ring.is_empty());
    }

    #[test]
    fn test_full_ring_waits_until_stop() {
        let ring = Arc::new(BatchRing::new());
        let stop = Arc::new(AtomicBool::new(false));
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..MAX_QUEUED_BATCHES {
            ring.push(sealed_batch(&hits, 1, Priority::Normal), &stop)
                .unwrap();
        }

        let flip = {
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                stop.store(true, Ordering::Release);
            })
        };
        // Full ring: the push spins until the stop flag flips, then hands
        // the batch back.
        let refused = ring.push(sealed_batch(&hits, 1, Priority::Normal), &stop);
        assert!(refused.is_err());
        flip.join().unwrap();
    }

    #[test]
    fn test_select_prefers_higher_priority() {
        let ring = BatchRing::new();
        let stop = AtomicBool::new(false);
        let hits = Arc::new(AtomicUsize::new(0));
        let low = sealed_batch(&hits, 1, Priority::Low);
        let high = sealed_batch(&hits, 1, Priority::High);
        ring.push(low.clone(), &stop).unwrap();
        ring.push(high.clone(), &stop).unwrap();

        let picked = select(&ring, None).unwrap();
        assert_eq!(picked.key(), high.key());
    }

    #[test]
    fn test_select_tie_break_avoids_last_blocked() {
        let ring = BatchRing::new();
        let stop = AtomicBool::new(false);
        let hits = Arc::new(AtomicUsize::new(0));
        let a = sealed_batch(&hits, 1, Priority::Normal);
        let b = sealed_batch(&hits, 1, Priority::Normal);
        ring.push(a.clone(), &stop).unwrap();
        ring.push(b.clone(), &stop).unwrap();

        assert_eq!(select(&ring, None).unwrap().key(), a.key());
        assert_eq!(select(&ring, Some(a.key())).unwrap().key(), b.key());
        assert_eq!(select(&ring, Some(b.key())).unwrap().key(), a.key());
    }

    #[test]
    fn test_select_never_defers_very_high() {
        let ring = BatchRing::new();
        let stop = AtomicBool::new(false);
        let hits = Arc::new(AtomicUsize::new(0));
        let urgent = sealed_batch(&hits, 1, Priority::VeryHigh);
        let normal = sealed_batch(&hits, 1, Priority::Normal);
        ring.push(urgent.clone(), &stop).unwrap();
        ring.push(normal.clone(), &stop).unwrap();

        // Even as the last-blocked batch, the VeryHigh entry wins.
        assert_eq!(select(&ring, Some(urgent.key())).unwrap().key(), urgent.key());
    }

    #[test]
    fn test_sweep_drops_terminal_entries() {
        let ring = BatchRing::new();
        let stop = AtomicBool::new(false);
        let hits = Arc::new(AtomicUsize::new(0));
        let live = sealed_batch(&hits, 1, Priority::Normal);
        let dead = sealed_batch(&hits, 1, Priority::Normal);
        dead.abort();
        ring.push(dead, &stop).unwrap();
        ring.push(live.clone(), &stop).unwrap();

        sweep_terminal(&ring);
        assert_eq!(ring.len(), 1);
        assert_eq!(select(&ring, None).unwrap().key(), live.key());
    }

    #[test]
    fn test_drain_aborts_queued_batches() {
        let shared = WorkerShared::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let a = sealed_batch(&hits, 2, Priority::Normal);
        let b = sealed_batch(&hits, 2, Priority::Normal);
        shared.ring.push(a.clone(), &shared.stop).unwrap();
        shared.ring.push(b.clone(), &shared.stop).unwrap();

        drain_on_stop(0, &shared);
        assert!(shared.ring.is_empty());
        assert!(!a.wait());
        assert!(!b.wait());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_worker_runs_batches_end_to_end() {
        let mut worker = Worker::spawn(0, PinningStrategy::None).unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let batch = sealed_batch(&hits, 5, Priority::Normal);
        worker
            .shared()
            .ring
            .push(batch.clone(), &worker.shared().stop)
            .unwrap();

        assert!(batch.wait());
        assert_eq!(hits.load(Ordering::SeqCst), 5);

        let snap = worker.shared().metrics.snapshot();
        assert_eq!(snap.jobs_executed, 5);
        assert_eq!(snap.batches_retired, 1);

        worker.signal_stop();
        worker.join().unwrap();
    }
}
