//! Unit tests for the shared periodic-job scheduler.
//!
//! Validates:
//! - the first run fires immediately and runs repeat on the interval
//! - failing and panicking runs never stop the loop
//! - a zero interval is rejected
//! - shutdown stops every loop, including one stuck in a long run

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use channel_supervisor::scheduler::Scheduler;
use channel_supervisor::{AppError, Result};
use tokio_util::sync::CancellationToken;

async fn bump(counter: Arc<AtomicUsize>) -> Result<()> {
    counter.fetch_add(1, Ordering::SeqCst);
    Ok(())
}

async fn bump_and_fail(counter: Arc<AtomicUsize>) -> Result<()> {
    counter.fetch_add(1, Ordering::SeqCst);
    Err(AppError::Job("always fails".into()))
}

async fn bump_and_panic(counter: Arc<AtomicUsize>) -> Result<()> {
    counter.fetch_add(1, Ordering::SeqCst);
    panic!("job exploded");
}

async fn bump_and_hang(counter: Arc<AtomicUsize>) -> Result<()> {
    counter.fetch_add(1, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_secs(60)).await;
    Ok(())
}

async fn wait_for_runs(counter: &AtomicUsize, at_least: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while counter.load(Ordering::SeqCst) < at_least {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("job should keep running");
}

#[tokio::test]
async fn job_runs_immediately_and_repeats() {
    let mut scheduler = Scheduler::new(CancellationToken::new());
    let runs = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&runs);

    scheduler
        .schedule("counter", Duration::from_millis(20), move || bump(Arc::clone(&counter)))
        .expect("schedule");

    wait_for_runs(&runs, 3).await;
    assert_eq!(scheduler.job_names(), vec!["counter"]);
    scheduler.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn failing_job_keeps_running() {
    let mut scheduler = Scheduler::new(CancellationToken::new());
    let runs = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&runs);

    scheduler
        .schedule("failing", Duration::from_millis(10), move || bump_and_fail(Arc::clone(&counter)))
        .expect("schedule");

    wait_for_runs(&runs, 3).await;
    scheduler.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn panicking_job_keeps_running_and_neighbours_are_unaffected() {
    let mut scheduler = Scheduler::new(CancellationToken::new());
    let panics = Arc::new(AtomicUsize::new(0));
    let healthy = Arc::new(AtomicUsize::new(0));

    let panic_counter = Arc::clone(&panics);
    scheduler
        .schedule("panicking", Duration::from_millis(10), move || bump_and_panic(Arc::clone(&panic_counter)))
        .expect("schedule");

    let healthy_counter = Arc::clone(&healthy);
    scheduler
        .schedule("healthy", Duration::from_millis(10), move || bump(Arc::clone(&healthy_counter)))
        .expect("schedule");

    wait_for_runs(&panics, 3).await;
    wait_for_runs(&healthy, 3).await;
    assert_eq!(scheduler.len(), 2);
    scheduler.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn zero_interval_is_rejected() {
    let mut scheduler = Scheduler::new(CancellationToken::new());

    let result = scheduler.schedule("bad", Duration::ZERO, || bump(Arc::new(AtomicUsize::new(0))));

    assert!(matches!(result, Err(AppError::Config(_))));
    assert!(scheduler.is_empty());
}

#[tokio::test]
async fn shutdown_interrupts_long_running_job() {
    let mut scheduler = Scheduler::new(CancellationToken::new());
    let started = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&started);

    scheduler
        .schedule("slow", Duration::from_millis(10), move || bump_and_hang(Arc::clone(&counter)))
        .expect("schedule");
    wait_for_runs(&started, 1).await;

    let begun = std::time::Instant::now();
    scheduler.shutdown(Duration::from_secs(5)).await;

    assert!(begun.elapsed() < Duration::from_secs(1));
    assert_eq!(started.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn parent_cancellation_stops_jobs() {
    let parent = CancellationToken::new();
    let mut scheduler = Scheduler::new(parent.child_token());
    let runs = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&runs);

    scheduler
        .schedule("counter", Duration::from_millis(10), move || bump(Arc::clone(&counter)))
        .expect("schedule");
    wait_for_runs(&runs, 1).await;

    parent.cancel();
    tokio::time::sleep(Duration::from_millis(30)).await;
    let after_cancel = runs.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(runs.load(Ordering::SeqCst), after_cancel);
    scheduler.shutdown(Duration::from_secs(1)).await;
}
