//! Abort semantics and scheduler teardown.

use framejob::{BatchState, Job, JobScheduler, LatencyClass, Priority, SchedulerConfig, TaskBatch};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

fn pool(threads: usize) -> JobScheduler {
    init_logging();
    JobScheduler::with_config(SchedulerConfig {
        threads,
        ..Default::default()
    })
    .expect("worker spawn failed")
}

/// Routes scheduler logs through the test harness when RUST_LOG asks for
/// them. Safe to call from every test; only the first call installs.
fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Occupies the pool's single worker until the returned sender fires.
/// The entered receiver confirms the worker is inside the job.
fn occupy_worker(scheduler: &JobScheduler) -> (TaskBatch, mpsc::Sender<()>, mpsc::Receiver<()>) {
    let (gate_tx, gate_rx) = mpsc::channel::<()>();
    let (entered_tx, entered_rx) = mpsc::channel::<()>();
    let filler = TaskBatch::named("filler");
    filler
        .add_job(Job::new(move || {
            entered_tx.send(()).ok();
            gate_rx.recv().expect("gate dropped");
        }))
        .expect("add_job failed");
    filler
        .submit(scheduler, Priority::Normal, LatencyClass::Unlimited)
        .expect("submit failed");
    (filler, gate_tx, entered_rx)
}

#[test]
fn test_abort_skips_queued_batch() {
    let scheduler = pool(1);
    let (filler, gate, entered) = occupy_worker(&scheduler);
    entered.recv().expect("worker never started");

    let ran = Arc::new(AtomicUsize::new(0));
    let ran_clone = Arc::clone(&ran);
    let queued = TaskBatch::named("doomed");
    queued
        .add_job(Job::new(move || {
            ran_clone.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();
    queued
        .submit(&scheduler, Priority::Normal, LatencyClass::Unlimited)
        .unwrap();

    // The only worker is parked inside the filler job, so nothing has
    // touched the queued batch yet and abort returns immediately.
    queued.abort();
    assert_eq!(queued.state(), BatchState::Aborted);
    assert!(!queued.wait());
    assert_eq!(ran.load(Ordering::SeqCst), 0);

    gate.send(()).expect("worker exited early");
    assert!(filler.wait());
    scheduler.shutdown().unwrap();
    assert_eq!(ran.load(Ordering::SeqCst), 0);
}

#[test]
fn test_abort_waits_for_running_job() {
    let scheduler = pool(1);
    let after_jobs = Arc::new(AtomicUsize::new(0));

    let (gate_tx, gate_rx) = mpsc::channel::<()>();
    let (entered_tx, entered_rx) = mpsc::channel::<()>();
    let batch = TaskBatch::named("cancelled-mid-run");
    batch
        .add_job(Job::new(move || {
            entered_tx.send(()).ok();
            gate_rx.recv().expect("gate dropped");
        }))
        .unwrap();
    let after_clone = Arc::clone(&after_jobs);
    batch
        .add_job(Job::new(move || {
            after_clone.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();
    batch
        .submit(&scheduler, Priority::Normal, LatencyClass::Unlimited)
        .unwrap();
    entered_rx.recv().expect("worker never started");

    // abort() blocks until the in-flight job returns, so the gate has to
    // open from another thread.
    let releaser = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        gate_tx.send(()).expect("worker exited early");
    });

    batch.abort();
    releaser.join().expect("releaser panicked");

    assert_eq!(batch.state(), BatchState::Aborted);
    assert!(!batch.wait());
    assert_eq!(after_jobs.load(Ordering::SeqCst), 0);
    // The in-flight job ran to completion and was recorded before the
    // worker let go of the batch.
    assert_eq!(batch.stats().jobs_completed, 1);
    scheduler.shutdown().unwrap();
}

#[test]
fn test_shutdown_with_inflight_batches() {
    let scheduler = pool(2);
    let mut batches = Vec::new();

    for i in 0..10 {
        let batch = TaskBatch::named(format!("inflight-{i}"));
        batch
            .add_jobs((0..4).map(|_| {
                Job::new(|| {
                    thread::sleep(Duration::from_millis(1));
                })
            }))
            .unwrap();
        batch
            .submit(&scheduler, Priority::Normal, LatencyClass::Unlimited)
            .unwrap();
        batches.push(batch);
    }

    // Teardown races the workers mid-stream and must still terminate
    // every batch one way or the other.
    scheduler.shutdown().expect("worker panicked during shutdown");
    for batch in &batches {
        assert!(
            batch.state().is_terminal(),
            "batch left in {:?} after shutdown",
            batch.state()
        );
    }
}

#[test]
fn test_abort_then_reset_and_resubmit() {
    let scheduler = pool(1);

    let (gate_tx, gate_rx) = mpsc::channel::<()>();
    let (entered_tx, entered_rx) = mpsc::channel::<()>();
    let batch = TaskBatch::named("recycled");
    batch
        .add_job(Job::new(move || {
            entered_tx.send(()).ok();
            gate_rx.recv().expect("gate dropped");
        }))
        .unwrap();
    batch
        .submit(&scheduler, Priority::Normal, LatencyClass::Unlimited)
        .unwrap();
    entered_rx.recv().expect("worker never started");

    let releaser = thread::spawn(move || {
        thread::sleep(Duration::from_millis(10));
        gate_tx.send(()).expect("worker exited early");
    });
    batch.abort();
    releaser.join().expect("releaser panicked");
    assert_eq!(batch.state(), BatchState::Aborted);

    // A terminal batch can be stripped and rebuilt in place.
    batch.reset();
    assert_eq!(batch.state(), BatchState::Building);
    assert_eq!(batch.job_count(), 0);

    let reran = Arc::new(AtomicUsize::new(0));
    let reran_clone = Arc::clone(&reran);
    batch
        .add_job(Job::new(move || {
            reran_clone.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();
    batch
        .submit(&scheduler, Priority::High, LatencyClass::Unlimited)
        .unwrap();
    assert!(batch.wait());
    assert_eq!(reran.load(Ordering::SeqCst), 1);
    assert_eq!(batch.stats().jobs_completed, 1);
    scheduler.shutdown().unwrap();
}

#[test]
fn test_drop_without_shutdown_terminates_batches() {
    let scheduler = pool(2);
    let batch = TaskBatch::new();
    batch
        .add_jobs((0..8).map(|_| {
            Job::new(|| {
                thread::sleep(Duration::from_millis(1));
            })
        }))
        .unwrap();
    batch
        .submit(&scheduler, Priority::Normal, LatencyClass::Unlimited)
        .unwrap();

    drop(scheduler);
    assert!(batch.state().is_terminal());
}
