//! # framejob - Frame-Paced Parallel Job Scheduler
//!
//! A batch-oriented job scheduler for frame-driven applications. Work is
//! described as batches: ordered jobs partitioned into signal layers, with
//! fences expressing "everything before this must finish first". A batch is
//! fanned out to every worker in a fixed thread pool, and the workers drain
//! it cooperatively through a shared read cursor.
//!
//! ## Architecture
//!
//! - **Jobs**: boxed closures, run exactly once by some worker
//! - **Batches**: ordered job sequences plus their signal/fence dependencies
//! - **Signals**: countdown counters gating fences within a batch
//! - **Workers**: OS threads, each with a bounded ring of batch handles
//! - **Frame pacing**: `ThisFrame`/`NextFrame` batches are retired at
//!   `step_frame` boundaries
//!
//! All waits are cooperative spin-then-yield polls; nothing on the hot path
//! blocks in the kernel, so scheduling latency stays decoupled from the OS
//! timeslice.
//!
//! ## Example
//!
//! ```no_run
//! use framejob::{Job, JobScheduler, LatencyClass, Priority, TaskBatch};
//!
//! let scheduler = JobScheduler::new().unwrap();
//!
//! let batch = TaskBatch::named("frame-setup");
//! batch.add_job(Job::new(|| println!("cull"))).unwrap();
//! batch.add_job(Job::new(|| println!("animate"))).unwrap();
//! batch.add_fence();
//! batch.add_job(Job::new(|| println!("build draw lists"))).unwrap();
//! batch.submit(&scheduler, Priority::High, LatencyClass::ThisFrame).unwrap();
//!
//! scheduler.step_frame(); // retires every ThisFrame batch
//! scheduler.shutdown().unwrap();
//! ```
//!
//! Job bodies are not sandboxed: a panicking job unwinds through its worker
//! thread and takes it down. `shutdown` reports how many workers were lost
//! that way.

pub mod batch;
pub mod clock;
pub mod error;
pub mod job;
pub mod scheduler;
pub mod signal;
pub mod spin;
pub mod stats;
pub mod worker;

use serde::{Deserialize, Serialize};

/// Strategy for pinning worker threads to CPU cores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PinningStrategy {
    /// No pinning (standard OS scheduling).
    #[default]
    None,
    /// Linear pinning (worker i -> logical processor i).
    Linear,
    /// Pin to even-numbered logical processors, avoiding SMT contention.
    AvoidSmt,
}

pub use batch::{BatchState, LatencyClass, Priority, TaskBatch};
pub use error::{BatchError, SchedulerError};
pub use job::Job;
pub use scheduler::{JobScheduler, SchedulerConfig, MAX_WORKERS};
pub use signal::SignalId;
pub use spin::{SpinMutex, SpinMutexGuard};
pub use stats::{BatchStats, WorkerMetrics};
pub use worker::MAX_QUEUED_BATCHES;
