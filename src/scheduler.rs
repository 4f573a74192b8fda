//! Scheduler: pool lifecycle, batch fan-out and frame pacing.
//!
//! The scheduler owns a fixed set of workers and the frame waiter ring.
//! There is no process-global instance; the application constructs one at
//! startup, passes it by reference to whatever submits work, and shuts it
//! down explicitly or by drop on the way out.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use serde::{Deserialize, Serialize};

use crate::batch::{ExecOutcome, LatencyClass, TaskBatch};
use crate::error::SchedulerError;
use crate::spin::SpinMutex;
use crate::stats::{self, LocalStats, WorkerMetrics};
use crate::worker::Worker;
use crate::PinningStrategy;

/// Hard ceiling on pool size; larger requests are clamped.
pub const MAX_WORKERS: usize = 64;

/// Depth of the frame waiter ring. Two latency classes can be in flight
/// plus slack, so the slot being filled is never the one being drained.
const FRAME_SLOTS: usize = 4;

/// Pool construction parameters.
///
/// Serializable so a host can load it from its engine configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Worker threads to spawn; zero resolves to the logical core count.
    pub threads: usize,
    /// Core pinning applied as each worker starts.
    pub pinning: PinningStrategy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            threads: 0,
            pinning: PinningStrategy::None,
        }
    }
}

impl SchedulerConfig {
    /// Worker count after resolving the zero default and the hard cap.
    pub fn resolved_threads(&self) -> usize {
        let requested = if self.threads == 0 {
            num_cpus::get()
        } else {
            self.threads
        };
        requested.min(MAX_WORKERS)
    }
}

/// Owns the worker pool and the frame waiter lists.
///
/// # Example
///
/// ```
/// use framejob::{Job, JobScheduler, LatencyClass, Priority, TaskBatch};
///
/// let scheduler = JobScheduler::new().unwrap();
/// let batch = TaskBatch::new();
/// batch.add_job(Job::new(|| println!("hello from the pool"))).unwrap();
/// batch.submit(&scheduler, Priority::Normal, LatencyClass::Unlimited).unwrap();
/// assert!(batch.wait());
/// scheduler.shutdown().unwrap();
/// ```
pub struct JobScheduler {
    workers: Vec<Worker>,
    frame: AtomicUsize,
    waiters: [SpinMutex<Vec<TaskBatch>>; FRAME_SLOTS],
    config: SchedulerConfig,
}

impl JobScheduler {
    /// Pool with the default configuration: one worker per logical core,
    /// no pinning.
    pub fn new() -> Result<Self, SchedulerError> {
        Self::with_config(SchedulerConfig::default())
    }

    /// Spawns `config.resolved_threads()` workers.
    ///
    /// On a mid-spawn failure every already-started worker is stopped and
    /// joined before the error returns; there is never a partially
    /// populated pool. A host that cannot spawn threads at all can fall
    /// back to [`JobScheduler::synchronous`].
    ///
    /// # Example
    ///
    /// ```
    /// use framejob::{JobScheduler, PinningStrategy, SchedulerConfig};
    ///
    /// let scheduler = JobScheduler::with_config(SchedulerConfig {
    ///     threads: 2,
    ///     pinning: PinningStrategy::None,
    /// })
    /// .unwrap();
    /// assert_eq!(scheduler.thread_count(), 2);
    /// scheduler.shutdown().unwrap();
    /// ```
    pub fn with_config(config: SchedulerConfig) -> Result<Self, SchedulerError> {
        let target = config.resolved_threads();
        let mut workers: Vec<Worker> = Vec::with_capacity(target);
        for index in 0..target {
            match Worker::spawn(index, config.pinning) {
                Ok(worker) => workers.push(worker),
                Err(source) => {
                    for worker in &workers {
                        worker.signal_stop();
                    }
                    thread::yield_now();
                    for worker in workers.iter_mut().rev() {
                        let _ = worker.join();
                    }
                    tracing::error!(index, "worker spawn failed, pool rolled back");
                    return Err(SchedulerError::WorkerSpawn { index, source });
                }
            }
        }
        tracing::info!(threads = target, pinning = ?config.pinning, "scheduler started");
        Ok(Self {
            workers,
            frame: AtomicUsize::new(0),
            waiters: std::array::from_fn(|_| SpinMutex::new(Vec::new())),
            config,
        })
    }

    /// Zero-worker scheduler: every submission runs to completion on the
    /// calling thread before `submit` returns. Usable as a degraded mode
    /// on hosts where spawning threads is unavailable or undesirable.
    pub fn synchronous() -> Self {
        Self {
            workers: Vec::new(),
            frame: AtomicUsize::new(0),
            waiters: std::array::from_fn(|_| SpinMutex::new(Vec::new())),
            config: SchedulerConfig::default(),
        }
    }

    /// Number of live worker threads. Zero in synchronous mode.
    pub fn thread_count(&self) -> usize {
        self.workers.len()
    }

    /// Configuration the pool was built from.
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Lifetime counters per worker, indexed by worker id.
    pub fn worker_metrics(&self) -> Vec<WorkerMetrics> {
        self.workers
            .iter()
            .map(|w| w.shared().metrics.snapshot())
            .collect()
    }

    /// Fans a sealed batch out to every worker and registers it with the
    /// frame waiter list its latency class asks for.
    pub(crate) fn submit_batch(
        &self,
        batch: &TaskBatch,
        latency: LatencyClass,
    ) -> Result<(), SchedulerError> {
        if self.workers.is_empty() {
            self.enqueue_waiter(batch, latency);
            Self::run_inline(batch);
            return Ok(());
        }

        self.enqueue_waiter(batch, latency);
        for worker in &self.workers {
            let shared = worker.shared();
            if let Err(refused) = shared.ring.push(batch.clone(), &shared.stop) {
                drop(refused);
                // A stopping pool will never drain this batch; abort it so
                // the copies already accepted and any waiter settle.
                tracing::warn!(
                    batch = batch.display_label(),
                    worker = worker.id(),
                    "submission refused by stopping pool"
                );
                batch.abort();
                return Err(SchedulerError::ShuttingDown);
            }
        }
        Ok(())
    }

    fn enqueue_waiter(&self, batch: &TaskBatch, latency: LatencyClass) {
        let offset = match latency {
            LatencyClass::Unlimited => return,
            LatencyClass::ThisFrame => 1,
            LatencyClass::NextFrame => 2,
        };
        let frame = self.frame.load(Ordering::Acquire);
        let slot = (frame + offset) % FRAME_SLOTS;
        self.waiters[slot].lock().push(batch.clone());
    }

    /// Advances the frame counter and retires every batch whose pacing
    /// contract ends at the new boundary: `ThisFrame` submissions from the
    /// previous frame and `NextFrame` submissions from the one before.
    /// Blocks until each of them is terminal, dumps its statistics and
    /// drops the pacing reference.
    pub fn step_frame(&self) {
        let frame = self.frame.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
        let slot = frame % FRAME_SLOTS;
        let drained: Vec<TaskBatch> = std::mem::take(&mut *self.waiters[slot].lock());
        if drained.is_empty() {
            return;
        }
        tracing::debug!(frame, count = drained.len(), "draining frame waiters");
        for batch in drained {
            let completed = batch.wait();
            stats::emit(batch.display_label(), &batch.stats());
            if !completed {
                tracing::debug!(batch = batch.display_label(), "frame waiter was aborted");
            }
        }
    }

    /// Degenerate mode: drive the batch on this thread until it retires.
    fn run_inline(batch: &TaskBatch) {
        let mut local = LocalStats::new();
        loop {
            match batch.execute_next(&mut local) {
                ExecOutcome::Executed => {}
                ExecOutcome::Blocked => {
                    // In-order inline execution satisfies every fence
                    // before the cursor reaches it and nobody contends the
                    // lock, so this arm should not be reachable.
                    debug_assert!(false, "inline execution blocked");
                    thread::yield_now();
                }
                ExecOutcome::Retired => break,
            }
        }
        batch.merge_stats(&mut local);
    }

    /// Stops and joins every worker in reverse creation order, then drains
    /// the frame lists.
    ///
    /// Batches still queued when the stop lands are aborted, not run;
    /// their `wait()` returns false. A worker that panicked earlier (a job
    /// body unwound through it) is reported here as
    /// [`SchedulerError::WorkerPanicked`].
    pub fn shutdown(mut self) -> Result<(), SchedulerError> {
        self.shutdown_inner()
    }

    fn shutdown_inner(&mut self) -> Result<(), SchedulerError> {
        let mut workers = std::mem::take(&mut self.workers);
        let had_workers = !workers.is_empty();
        let mut panicked = 0usize;

        if had_workers {
            for worker in &workers {
                worker.signal_stop();
            }
            thread::yield_now();
            for worker in workers.iter_mut().rev() {
                if worker.join().is_err() {
                    panicked += 1;
                    tracing::error!(worker = worker.id(), "worker thread panicked");
                }
            }
            // A fan-out that raced the stop flag may have published entries
            // the worker never saw. The join above transfers the consumer
            // role here, so one final sweep settles them.
            for worker in &workers {
                while let Some(batch) = worker.shared().ring.pop_base() {
                    batch.abort();
                }
            }
        }

        for slot in &self.waiters {
            let drained: Vec<TaskBatch> = std::mem::take(&mut *slot.lock());
            for batch in drained {
                batch.wait();
                stats::emit(batch.display_label(), &batch.stats());
            }
        }

        if panicked > 0 {
            Err(SchedulerError::WorkerPanicked { count: panicked })
        } else {
            if had_workers {
                tracing::info!("scheduler stopped");
            }
            Ok(())
        }
    }
}

impl Drop for JobScheduler {
    fn drop(&mut self) {
        // Safety net for hosts that drop instead of calling `shutdown`.
        let _ = self.shutdown_inner();
    }
}

impl std::fmt::Debug for JobScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobScheduler")
            .field("threads", &self.workers.len())
            .field("frame", &self.frame.load(Ordering::Relaxed))
            .finish()
    }
}
