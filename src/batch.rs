//! Task batches: ordered jobs plus their signal and fence dependencies.
//!
//! A batch is built single-threaded, submitted once, then drained
//! cooperatively by every worker in the pool. All runtime coordination goes
//! through one spin lock around the slot sequence and its read cursor;
//! whichever worker takes the lock advances the cursor, releases the lock
//! and runs the job body outside of it. Fences hold the cursor until their
//! signal counts down to zero, giving in-batch ordering without any
//! per-job dependency tracking.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use crossbeam_utils::Backoff;
use serde::{Deserialize, Serialize};

use crate::clock;
use crate::error::{BatchError, SchedulerError};
use crate::job::Job;
use crate::scheduler::JobScheduler;
use crate::signal::{Signal, SignalId, MAX_SIGNALS};
use crate::spin::SpinMutex;
use crate::stats::{BatchStats, LocalStats, StatsCell};

/// Selection weight for a submitted batch. Workers always pick the
/// highest-priority batch on their queue.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum Priority {
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
    /// Never deferred by the anti-starvation tie-break in worker selection.
    VeryHigh = 3,
}

impl Priority {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Priority::Low,
            1 => Priority::Normal,
            2 => Priority::High,
            _ => Priority::VeryHigh,
        }
    }
}

/// Pacing contract for when a submitted batch must be retired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum LatencyClass {
    /// Not frame tracked; the submitter waits (or not) on its own schedule.
    #[default]
    Unlimited,
    /// Retired by the end of the next `step_frame` call.
    ThisFrame,
    /// Retired by the end of the second `step_frame` call from now.
    NextFrame,
}

/// Lifecycle of a batch.
///
/// `Building` accepts mutation, `Submitted` accepts execution, and the two
/// terminal states accept `reset`. The only transition back out of a
/// terminal state is `reset` to `Building`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BatchState {
    Building = 0,
    Submitted = 1,
    Completed = 2,
    Aborted = 3,
}

impl BatchState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => BatchState::Building,
            1 => BatchState::Submitted,
            2 => BatchState::Completed,
            _ => BatchState::Aborted,
        }
    }

    /// Completed or aborted. Terminal batches may be reset and dropped
    /// from worker queues.
    pub fn is_terminal(self) -> bool {
        matches!(self, BatchState::Completed | BatchState::Aborted)
    }
}

/// Outcome of one [`TaskBatch::execute_next`] attempt, driving the worker
/// loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExecOutcome {
    /// Ran one job body; more slots may remain.
    Executed,
    /// No progress: the read lock was contended or a fence is pending.
    Blocked,
    /// The cursor has passed every slot; drop this batch from local queues.
    Retired,
}

/// One entry in the batch's ordered slot sequence.
enum Slot {
    /// A runnable job and the signal it decrements on completion. The
    /// option is emptied when a worker takes the job.
    Work { job: Option<Job>, signal: u8 },
    /// Holds the cursor until the referenced signal is satisfied.
    Fence { signal: u8 },
}

/// Everything the read lock guards: the slot sequence, the cursor and the
/// build-time pending counts that freeze into `signals` at submit.
struct JobQueue {
    slots: Vec<Slot>,
    cursor: usize,
    /// Per-signal pending job counts while building. Kept after seal so
    /// signal introspection stays meaningful.
    pending: Vec<u32>,
    /// Live countdown counters, frozen from `pending` at seal. Shared so a
    /// worker can decrement after releasing the lock. Empty while building.
    signals: Arc<[Signal]>,
}

impl JobQueue {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            cursor: 0,
            pending: Vec::new(),
            signals: Vec::new().into(),
        }
    }

    /// True when appending a job must open a fresh signal: a fence on the
    /// current signal is the last slot, so new work behind it must not
    /// feed the very signal it waits on.
    fn tail_fences_current(&self) -> bool {
        match self.slots.last() {
            Some(Slot::Fence { signal }) => *signal as usize == self.pending.len() - 1,
            _ => false,
        }
    }

    fn open_signal(&mut self) -> usize {
        assert!(
            self.pending.len() < MAX_SIGNALS,
            "batch exceeds {} signals",
            MAX_SIGNALS
        );
        self.pending.push(0);
        self.pending.len() - 1
    }

    /// Appends a fence unless the signal has nothing pending, in which
    /// case it could never hold the cursor and is dropped.
    fn push_fence(&mut self, id: SignalId) -> bool {
        if self.pending[id.index()] == 0 {
            return false;
        }
        self.slots.push(Slot::Fence { signal: id.0 });
        true
    }
}

struct BatchInner {
    queue: SpinMutex<JobQueue>,
    state: AtomicU8,
    /// Workers currently holding an execution claim on this batch.
    accessors: AtomicU32,
    priority: AtomicU8,
    submitted_at_us: AtomicU64,
    stats: StatsCell,
    label: Option<String>,
}

/// Shared handle to a batch of jobs.
///
/// Cloning is cheap; the scheduler, the frame waiter lists and each worker
/// queue hold their own clone while the batch is in flight. All methods
/// take `&self`, so one handle can be stored and reused across frames.
#[derive(Clone)]
pub struct TaskBatch {
    inner: Arc<BatchInner>,
}

impl TaskBatch {
    /// Creates an empty batch in the `Building` state.
    pub fn new() -> Self {
        Self::with_label(None)
    }

    /// Creates an empty batch carrying a diagnostic label. The label shows
    /// up in the statistics dump when the batch retires.
    pub fn named(label: impl Into<String>) -> Self {
        Self::with_label(Some(label.into()))
    }

    fn with_label(label: Option<String>) -> Self {
        Self {
            inner: Arc::new(BatchInner {
                queue: SpinMutex::new(JobQueue::new()),
                state: AtomicU8::new(BatchState::Building as u8),
                accessors: AtomicU32::new(0),
                priority: AtomicU8::new(Priority::Normal as u8),
                submitted_at_us: AtomicU64::new(0),
                stats: StatsCell::new(),
                label,
            }),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> BatchState {
        BatchState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    /// Priority recorded at the last submit.
    pub fn priority(&self) -> Priority {
        Priority::from_u8(self.inner.priority.load(Ordering::Relaxed))
    }

    /// Diagnostic label, if the batch was created with one.
    pub fn label(&self) -> Option<&str> {
        self.inner.label.as_deref()
    }

    /// Number of job slots currently recorded.
    pub fn job_count(&self) -> usize {
        self.inner
            .queue
            .lock()
            .slots
            .iter()
            .filter(|s| matches!(s, Slot::Work { .. }))
            .count()
    }

    /// Number of signal layers currently recorded.
    pub fn signal_count(&self) -> usize {
        self.inner.queue.lock().pending.len()
    }

    /// Workers currently holding an execution claim.
    pub fn active_accessors(&self) -> u32 {
        self.inner.accessors.load(Ordering::Acquire)
    }

    /// Statistics for the current submission cycle.
    pub fn stats(&self) -> BatchStats {
        self.inner.stats.snapshot()
    }

    /// Appends one job to the current signal. See [`TaskBatch::add_jobs`].
    pub fn add_job(&self, job: Job) -> Result<(), BatchError> {
        self.add_jobs(std::iter::once(job))
    }

    /// Appends jobs in order; each one decrements the current signal when
    /// it completes.
    ///
    /// The first append opens signal 0. If the last slot is a fence on the
    /// current signal, a fresh signal is opened first so the new jobs do
    /// not feed the signal they would be gated behind.
    ///
    /// Requires the `Building` state. Fails only when growing the job
    /// storage fails.
    pub fn add_jobs<I>(&self, jobs: I) -> Result<(), BatchError>
    where
        I: IntoIterator<Item = Job>,
    {
        assert_eq!(
            self.state(),
            BatchState::Building,
            "add_jobs requires a building batch"
        );
        let mut q = self.inner.queue.lock();
        if q.pending.is_empty() || q.tail_fences_current() {
            q.open_signal();
        }
        let signal = (q.pending.len() - 1) as u8;
        let mut added = 0u32;
        for job in jobs {
            q.slots.try_reserve(1)?;
            q.slots.push(Slot::Work {
                job: Some(job),
                signal,
            });
            added += 1;
        }
        q.pending[signal as usize] += added;
        Ok(())
    }

    /// Opens a new signal layer. Jobs appended afterwards decrement it.
    ///
    /// Requires the `Building` state.
    pub fn add_signal(&self) -> SignalId {
        assert_eq!(
            self.state(),
            BatchState::Building,
            "add_signal requires a building batch"
        );
        let mut q = self.inner.queue.lock();
        SignalId(q.open_signal() as u8)
    }

    /// Fences the current signal. See [`TaskBatch::add_fence_for`].
    pub fn add_fence(&self) -> bool {
        assert_eq!(
            self.state(),
            BatchState::Building,
            "add_fence requires a building batch"
        );
        let mut q = self.inner.queue.lock();
        assert!(!q.pending.is_empty(), "add_fence requires a signal");
        let id = SignalId((q.pending.len() - 1) as u8);
        q.push_fence(id)
    }

    /// Inserts a fence gated on `signal`. Slots appended afterwards will
    /// not run until every job assigned to that signal has completed.
    ///
    /// Returns false without recording anything when the signal has no
    /// pending jobs; such a fence could never hold the cursor.
    ///
    /// Requires the `Building` state and a signal id from this batch.
    pub fn add_fence_for(&self, signal: SignalId) -> bool {
        assert_eq!(
            self.state(),
            BatchState::Building,
            "add_fence requires a building batch"
        );
        let mut q = self.inner.queue.lock();
        assert!(
            signal.index() < q.pending.len(),
            "fence references unknown signal {}",
            signal.index()
        );
        q.push_fence(signal)
    }

    /// Seals the batch for execution without handing it to a scheduler.
    /// `submit` is seal plus fan-out.
    pub(crate) fn seal(&self, priority: Priority) {
        assert_eq!(
            self.state(),
            BatchState::Building,
            "submit requires a building batch"
        );
        let mut q = self.inner.queue.lock();
        assert!(
            q.slots.iter().any(|s| matches!(s, Slot::Work { .. })),
            "submit requires at least one job"
        );
        if !matches!(q.slots.last(), Some(Slot::Fence { .. })) {
            // Close the last populated signal so retirement implies every
            // job has been picked up.
            if let Some(idx) = q.pending.iter().rposition(|&n| n > 0) {
                q.slots.push(Slot::Fence { signal: idx as u8 });
            }
        }
        q.cursor = 0;
        q.signals = q
            .pending
            .iter()
            .map(|&n| Signal::with_pending(n))
            .collect::<Vec<_>>()
            .into();
        drop(q);
        self.inner.priority.store(priority as u8, Ordering::Relaxed);
        self.inner
            .submitted_at_us
            .store(clock::now_us().max(1), Ordering::Relaxed);
        self.inner
            .state
            .store(BatchState::Submitted as u8, Ordering::Release);
    }

    /// Seals the batch and fans it out to every worker of `scheduler`.
    ///
    /// When the batch does not already end with a fence, one is appended
    /// automatically so completion implies all work was executed. With a
    /// zero-worker scheduler the batch runs to completion on the calling
    /// thread before this returns.
    ///
    /// Requires the `Building` state and at least one job.
    pub fn submit(
        &self,
        scheduler: &JobScheduler,
        priority: Priority,
        latency: LatencyClass,
    ) -> Result<(), SchedulerError> {
        self.seal(priority);
        scheduler.submit_batch(self, latency)
    }

    /// Blocks until the batch is terminal and every worker claim has been
    /// released. Returns true when the batch completed, false when it was
    /// aborted.
    ///
    /// Polls with a spin-then-yield backoff; this never sleeps in the
    /// kernel, so a waiter inside a frame loop is not at the mercy of a
    /// timeslice-sized wakeup.
    ///
    /// Requires a submitted batch.
    pub fn wait(&self) -> bool {
        assert_ne!(
            self.state(),
            BatchState::Building,
            "wait requires a submitted batch"
        );
        let backoff = Backoff::new();
        loop {
            let state = self.state();
            if state.is_terminal() && self.inner.accessors.load(Ordering::Acquire) == 0 {
                return state == BatchState::Completed;
            }
            backoff.snooze();
        }
    }

    /// Prevents any further job pickup, waits for active claims to drain,
    /// then marks the batch `Aborted`.
    ///
    /// Job bodies already running finish normally; slots the cursor has
    /// not reached never run. A batch that is already terminal is left
    /// untouched, so aborting a completed batch does not unsettle it.
    ///
    /// Requires a submitted batch.
    pub fn abort(&self) {
        assert_ne!(
            self.state(),
            BatchState::Building,
            "abort requires a submitted batch"
        );
        if self.state().is_terminal() {
            return;
        }
        {
            let mut q = self.inner.queue.lock();
            q.cursor = q.slots.len();
        }
        let backoff = Backoff::new();
        while self.inner.accessors.load(Ordering::Acquire) != 0 {
            backoff.snooze();
        }
        self.finish_wall();
        self.inner
            .state
            .store(BatchState::Aborted as u8, Ordering::Release);
    }

    /// Returns a terminal batch to `Building` for reuse.
    ///
    /// Spins until the scheduler, the workers and the frame lists have
    /// dropped their clones of this handle, so a stale queue entry can
    /// never observe the next cycle. Any other host-held clone must be
    /// dropped first or this will wait for it.
    ///
    /// Requires a terminal state.
    pub fn reset(&self) {
        assert!(
            self.state().is_terminal(),
            "reset requires a terminal batch"
        );
        let backoff = Backoff::new();
        while Arc::strong_count(&self.inner) > 1
            || self.inner.accessors.load(Ordering::Acquire) != 0
        {
            backoff.snooze();
        }
        {
            let mut q = self.inner.queue.lock();
            q.slots.clear();
            q.pending.clear();
            q.signals = Vec::new().into();
            q.cursor = 0;
        }
        self.inner.stats.clear();
        self.inner.submitted_at_us.store(0, Ordering::Relaxed);
        self.inner
            .state
            .store(BatchState::Building as u8, Ordering::Release);
    }

    /// Identity key for queue bookkeeping and selection tie-breaks.
    pub(crate) fn key(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }

    pub(crate) fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    pub(crate) fn acquire_accessor(&self) {
        self.inner.accessors.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn release_accessor(&self) {
        let prev = self.inner.accessors.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "accessor count underflow");
    }

    /// Label for logs and stats dumps.
    pub(crate) fn display_label(&self) -> &str {
        self.inner.label.as_deref().unwrap_or("batch")
    }

    /// Folds a worker's local counters into the batch and resets them.
    pub(crate) fn merge_stats(&self, local: &mut LocalStats) {
        if !local.is_empty() {
            self.inner.stats.merge(local);
        }
        *local = LocalStats::new();
    }

    /// Tries to advance the batch by one step on the calling thread.
    ///
    /// Takes the read lock without spinning; contention is a stall and
    /// comes back as `Blocked`. With the lock held, fences that are
    /// satisfied are stepped over in place. A pending fence releases the
    /// lock and reports `Blocked` without counting a stall. A work slot is
    /// taken, the cursor advanced and the lock released before the body
    /// runs, so other workers proceed past this slot while the body is
    /// executing. The job's signal is decremented after the body returns.
    pub(crate) fn execute_next(&self, local: &mut LocalStats) -> ExecOutcome {
        let Some(mut q) = self.inner.queue.try_lock() else {
            local.stalls += 1;
            return ExecOutcome::Blocked;
        };
        loop {
            if q.cursor == q.slots.len() {
                drop(q);
                return self.retire();
            }
            let at = q.cursor;
            match &mut q.slots[at] {
                Slot::Fence { signal } => {
                    let signal = *signal as usize;
                    if q.signals[signal].is_satisfied() {
                        q.cursor += 1;
                    } else {
                        return ExecOutcome::Blocked;
                    }
                }
                Slot::Work { job, signal } => {
                    let signal = *signal as usize;
                    let job = job.take();
                    q.cursor += 1;
                    let signals = Arc::clone(&q.signals);
                    drop(q);
                    let Some(job) = job else {
                        debug_assert!(false, "work slot consumed twice");
                        return ExecOutcome::Executed;
                    };
                    let started = clock::now_us();
                    job.run();
                    local.record_job(clock::now_us().saturating_sub(started));
                    signals[signal].complete_one();
                    return ExecOutcome::Executed;
                }
            }
        }
    }

    /// First observer of cursor-at-end seals the state and wall time. The
    /// compare-exchange keeps a late retirement from overwriting an abort.
    fn retire(&self) -> ExecOutcome {
        if self
            .inner
            .state
            .compare_exchange(
                BatchState::Submitted as u8,
                BatchState::Completed as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            self.finish_wall();
        }
        ExecOutcome::Retired
    }

    fn finish_wall(&self) {
        let submitted = self.inner.submitted_at_us.load(Ordering::Relaxed);
        if submitted != 0 {
            self.inner
                .stats
                .record_wall(clock::now_us().saturating_sub(submitted));
        }
    }
}

impl Default for TaskBatch {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TaskBatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskBatch")
            .field("label", &self.inner.label)
            .field("state", &self.state())
            .field("accessors", &self.active_accessors())
            .finish()
    }
}
