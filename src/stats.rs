//! Execution statistics and worker metrics.
//!
//! Workers accumulate per-claim numbers in plain fields and merge them into
//! the batch's atomic cell when the claim ends, keeping atomics off the
//! per-job path. Batch statistics describe one submission cycle and are
//! cleared by `reset`; worker metrics accumulate for the lifetime of the
//! pool.

use std::sync::atomic::{AtomicU64, Ordering};

/// Per-claim scratch. Not shared: lives on the worker's stack while it
/// holds a claim and is merged exactly once when the claim ends.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LocalStats {
    pub jobs: u64,
    pub job_time_us: u64,
    pub min_job_us: u64,
    pub max_job_us: u64,
    pub stalls: u64,
}

impl LocalStats {
    pub(crate) fn new() -> Self {
        Self {
            jobs: 0,
            job_time_us: 0,
            min_job_us: u64::MAX,
            max_job_us: 0,
            stalls: 0,
        }
    }

    pub(crate) fn record_job(&mut self, us: u64) {
        self.jobs += 1;
        self.job_time_us += us;
        self.min_job_us = self.min_job_us.min(us);
        self.max_job_us = self.max_job_us.max(us);
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.jobs == 0 && self.stalls == 0
    }
}

/// Atomic accumulation cell embedded in each batch.
pub(crate) struct StatsCell {
    jobs: AtomicU64,
    job_time_us: AtomicU64,
    min_job_us: AtomicU64,
    max_job_us: AtomicU64,
    stalls: AtomicU64,
    wall_us: AtomicU64,
}

impl StatsCell {
    pub(crate) fn new() -> Self {
        Self {
            jobs: AtomicU64::new(0),
            job_time_us: AtomicU64::new(0),
            min_job_us: AtomicU64::new(u64::MAX),
            max_job_us: AtomicU64::new(0),
            stalls: AtomicU64::new(0),
            wall_us: AtomicU64::new(0),
        }
    }

    pub(crate) fn merge(&self, local: &LocalStats) {
        if local.jobs > 0 {
            self.jobs.fetch_add(local.jobs, Ordering::Relaxed);
            self.job_time_us
                .fetch_add(local.job_time_us, Ordering::Relaxed);
            self.min_job_us.fetch_min(local.min_job_us, Ordering::Relaxed);
            self.max_job_us.fetch_max(local.max_job_us, Ordering::Relaxed);
        }
        if local.stalls > 0 {
            self.stalls.fetch_add(local.stalls, Ordering::Relaxed);
        }
    }

    /// Stamps submission-to-terminal wall time. The last writer wins, which
    /// is the aborter when an abort races a completion.
    pub(crate) fn record_wall(&self, us: u64) {
        self.wall_us.store(us, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> BatchStats {
        let jobs = self.jobs.load(Ordering::Relaxed);
        let min = self.min_job_us.load(Ordering::Relaxed);
        BatchStats {
            jobs_completed: jobs,
            total_job_us: self.job_time_us.load(Ordering::Relaxed),
            min_job_us: if jobs == 0 { 0 } else { min },
            max_job_us: self.max_job_us.load(Ordering::Relaxed),
            stall_count: self.stalls.load(Ordering::Relaxed),
            total_wall_us: self.wall_us.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn clear(&self) {
        self.jobs.store(0, Ordering::Relaxed);
        self.job_time_us.store(0, Ordering::Relaxed);
        self.min_job_us.store(u64::MAX, Ordering::Relaxed);
        self.max_job_us.store(0, Ordering::Relaxed);
        self.stalls.store(0, Ordering::Relaxed);
        self.wall_us.store(0, Ordering::Relaxed);
    }
}

/// Point-in-time statistics for one batch submission cycle.
///
/// Fences are not timed; only job bodies contribute to the duration
/// fields. Counters race benignly against in-flight workers, so a snapshot
/// taken before the batch is terminal may lag by the claims still open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BatchStats {
    /// Jobs whose bodies have finished.
    pub jobs_completed: u64,
    /// Sum of individual job body durations.
    pub total_job_us: u64,
    /// Shortest job body, zero until a job has finished.
    pub min_job_us: u64,
    /// Longest job body.
    pub max_job_us: u64,
    /// Read-lock acquisition failures observed by workers.
    pub stall_count: u64,
    /// Submission-to-terminal wall time, zero until terminal.
    pub total_wall_us: u64,
}

impl BatchStats {
    /// Mean job body duration in microseconds.
    pub fn avg_job_us(&self) -> u64 {
        if self.jobs_completed == 0 {
            0
        } else {
            self.total_job_us / self.jobs_completed
        }
    }
}

/// Lifetime counters for one worker thread.
#[derive(Debug)]
pub(crate) struct WorkerMetricsCell {
    /// Job bodies this worker has run.
    pub jobs_executed: AtomicU64,
    /// Batches this worker observed to the end of their cursor.
    pub batches_retired: AtomicU64,
    /// Claims given up after consecutive blocked attempts.
    pub blocked_releases: AtomicU64,
    /// Loop iterations that found the ring empty.
    pub empty_polls: AtomicU64,
}

impl WorkerMetricsCell {
    pub(crate) fn new() -> Self {
        Self {
            jobs_executed: AtomicU64::new(0),
            batches_retired: AtomicU64::new(0),
            blocked_releases: AtomicU64::new(0),
            empty_polls: AtomicU64::new(0),
        }
    }

    pub(crate) fn snapshot(&self) -> WorkerMetrics {
        WorkerMetrics {
            jobs_executed: self.jobs_executed.load(Ordering::Relaxed),
            batches_retired: self.batches_retired.load(Ordering::Relaxed),
            blocked_releases: self.blocked_releases.load(Ordering::Relaxed),
            empty_polls: self.empty_polls.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of one worker's lifetime counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct WorkerMetrics {
    pub jobs_executed: u64,
    pub batches_retired: u64,
    pub blocked_releases: u64,
    pub empty_polls: u64,
}

impl WorkerMetrics {
    /// Mean jobs executed per retired batch from this worker's view.
    pub fn jobs_per_batch(&self) -> f64 {
        if self.batches_retired == 0 {
            0.0
        } else {
            self.jobs_executed as f64 / self.batches_retired as f64
        }
    }
}

/// Diagnostic dump for one batch, routed through the logging sink.
pub(crate) fn emit(name: &str, stats: &BatchStats) {
    tracing::debug!(
        target: "framejob::stats",
        batch = name,
        jobs = stats.jobs_completed,
        total_job_us = stats.total_job_us,
        min_job_us = stats.min_job_us,
        max_job_us = stats.max_job_us,
        avg_job_us = stats.avg_job_us(),
        stalls = stats.stall_count,
        wall_us = stats.total_wall_us,
        "batch retired"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_stats_record() {
        let mut local = LocalStats::new();
        assert!(local.is_empty());
        local.record_job(10);
        local.record_job(30);
        assert_eq!(local.jobs, 2);
        assert_eq!(local.job_time_us, 40);
        assert_eq!(local.min_job_us, 10);
        assert_eq!(local.max_job_us, 30);
    }

    #[test]
    fn test_cell_merge_and_snapshot() {
        let cell = StatsCell::new();
        let mut a = LocalStats::new();
        a.record_job(5);
        a.record_job(15);
        a.stalls = 2;
        let mut b = LocalStats::new();
        b.record_job(1);
        cell.merge(&a);
        cell.merge(&b);

        let snap = cell.snapshot();
        assert_eq!(snap.jobs_completed, 3);
        assert_eq!(snap.total_job_us, 21);
        assert_eq!(snap.min_job_us, 1);
        assert_eq!(snap.max_job_us, 15);
        assert_eq!(snap.stall_count, 2);
        assert_eq!(snap.avg_job_us(), 7);
    }

    #[test]
    fn test_empty_snapshot_normalizes_min() {
        let cell = StatsCell::new();
        let snap = cell.snapshot();
        assert_eq!(snap.min_job_us, 0);
        assert_eq!(snap.jobs_completed, 0);
        assert_eq!(snap.avg_job_us(), 0);
    }

    #[test]
    fn test_clear_resets_cycle() {
        let cell = StatsCell::new();
        let mut local = LocalStats::new();
        local.record_job(100);
        cell.merge(&local);
        cell.record_wall(500);
        cell.clear();

        let snap = cell.snapshot();
        assert_eq!(snap, BatchStats::default());
    }

    #[test]
    fn test_worker_metrics_snapshot() {
        let cell = WorkerMetricsCell::new();
        cell.jobs_executed.fetch_add(6, Ordering::Relaxed);
        cell.batches_retired.fetch_add(2, Ordering::Relaxed);
        let snap = cell.snapshot();
        assert_eq!(snap.jobs_executed, 6);
        assert_eq!(snap.batches_retired, 2);
        assert!((snap.jobs_per_batch() - 3.0).abs() < f64::EPSILON);
    }
}
