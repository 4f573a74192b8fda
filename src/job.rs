//! Job definitions.
//!
//! A job is an opaque unit of work: a boxed closure executed exactly once
//! by whichever thread pulls it from its batch. Jobs carry no result
//! channel; completion is observable only through the signal a job
//! decrements and through batch statistics.

use std::fmt;

/// A single unit of work.
///
/// The closure must be `Send` because any worker thread may run it, and
/// `'static` because the batch that owns it can outlive the submitting
/// stack frame.
pub struct Job {
    work: Box<dyn FnOnce() + Send + 'static>,
}

impl Job {
    /// Wraps a closure as a job.
    pub fn new<F>(work: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            work: Box::new(work),
        }
    }

    /// Runs the job body, consuming the job.
    pub(crate) fn run(self) {
        (self.work)()
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Job")
    }
}

impl<F> From<F> for Job
where
    F: FnOnce() + Send + 'static,
{
    fn from(work: F) -> Self {
        Job::new(work)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_job_runs_once() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let job = Job::new(move || {
            h.fetch_add(1, Ordering::Relaxed);
        });
        job.run();
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_job_from_closure() {
        let job: Job = (|| {}).into();
        job.run();
    }
}
