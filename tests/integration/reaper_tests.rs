//! Integration tests for boot-time cleanup.
//!
//! Validates:
//! - orphaned engine processes are terminated, stubborn ones killed
//! - tracked processes, our own pid, and unrelated processes are untouched
//! - stale locks are removed while live-owner locks are kept
//! - a lock owner pid reused by a non-engine process does not keep the lock
//! - singleton artifacts are removed only from stale profiles
//! - an exhausted time budget yields a partial report
//! - budgets too large for the clock are treated as unbounded

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use channel_supervisor::config::GlobalConfig;
use channel_supervisor::orchestrator::reaper::{Reaper, ReaperSettings};
use channel_supervisor::store::lock_repo::LockRepo;
use channel_supervisor::AppError;

use super::test_helpers::{test_config, FakeProcessTable};

fn reaper_for(config: &GlobalConfig, table: Arc<FakeProcessTable>) -> Reaper {
    let locks = LockRepo::new(&config.data_dir, "reaper-instance").expect("lock repo");
    Reaper::new(
        ReaperSettings::from_config(config).expect("settings"),
        table,
        locks,
    )
}

fn engine_cmdline(config: &GlobalConfig, id: &str) -> String {
    format!(
        "chromium --headless=new --user-data-dir={}",
        config.data_dir.join(format!("session-{id}")).display()
    )
}

#[tokio::test]
async fn orphans_are_terminated_and_stubborn_ones_killed() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = test_config(temp.path(), &[]);
    let table = FakeProcessTable::new();
    table.spawn(101, &engine_cmdline(&config, "a"), false);
    table.spawn(102, &engine_cmdline(&config, "b"), true);
    table.spawn(103, "/usr/bin/unrelated --serve", false);

    let report = reaper_for(&config, Arc::clone(&table)).reap(&[]).await;

    assert_eq!(report.processes_found, 2);
    assert_eq!(report.processes_terminated, 2);
    assert_eq!(report.processes_failed, 0);
    let mut terminated = table.terminated();
    terminated.sort_unstable();
    assert_eq!(terminated, vec![101, 102]);
    assert_eq!(table.killed(), vec![102]);
    assert!(!report.is_partial());
}

#[tokio::test]
async fn tracked_processes_are_never_touched() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = test_config(temp.path(), &[]);
    let table = FakeProcessTable::new();
    table.spawn(201, &engine_cmdline(&config, "a"), false);
    table.spawn(202, &engine_cmdline(&config, "b"), false);

    let report = reaper_for(&config, Arc::clone(&table)).reap(&[201]).await;

    assert_eq!(report.processes_found, 1);
    assert_eq!(table.terminated(), vec![202]);
}

#[tokio::test]
async fn configured_patterns_identify_engine_processes() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut config = test_config(temp.path(), &[]);
    config.reaper.process_patterns = vec![r"chrome.*--remote-debugging-port=92\d\d".into()];
    let table = FakeProcessTable::new();
    table.spawn(301, "chrome --remote-debugging-port=9223 --user-data-dir=/elsewhere", false);
    table.spawn(302, "chrome --remote-debugging-port=8000", false);

    let report = reaper_for(&config, Arc::clone(&table)).reap(&[]).await;

    assert_eq!(report.processes_found, 1);
    assert_eq!(table.terminated(), vec![301]);
}

#[tokio::test]
async fn stale_lock_is_removed_and_live_lock_kept() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = test_config(temp.path(), &[]);
    let previous = LockRepo::new(&config.data_dir, "previous-run").expect("lock repo");
    previous.claim("dead").expect("claim");
    previous.record_owner("dead", 401).expect("owner");
    previous.claim("alive").expect("claim");
    previous.record_owner("alive", 402).expect("owner");
    previous.claim("never-launched").expect("claim");

    let table = FakeProcessTable::new();
    table.spawn_hidden(402);

    let report = reaper_for(&config, Arc::clone(&table)).reap(&[]).await;

    assert_eq!(report.locks_found, 3);
    assert_eq!(report.locks_removed, 2);
    assert_eq!(report.locks_kept, 1);
    assert!(!previous.lock_path("dead").exists());
    assert!(!previous.lock_path("never-launched").exists());
    assert!(previous.lock_path("alive").exists());
}

#[tokio::test]
async fn unreadable_lock_is_treated_as_stale() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = test_config(temp.path(), &[]);
    let path = config.data_dir.join("garbled.lock");
    fs::write(&path, "not json").expect("write");

    let report = reaper_for(&config, FakeProcessTable::new()).reap(&[]).await;

    assert_eq!(report.locks_removed, 1);
    assert!(!path.exists());
}

#[tokio::test]
async fn orphan_holding_a_lock_is_reaped_together_with_its_lock() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = test_config(temp.path(), &[]);
    let previous = LockRepo::new(&config.data_dir, "previous-run").expect("lock repo");
    previous.claim("a").expect("claim");
    previous.record_owner("a", 501).expect("owner");

    let table = FakeProcessTable::new();
    table.spawn(501, &engine_cmdline(&config, "a"), false);

    let report = reaper_for(&config, Arc::clone(&table)).reap(&[]).await;

    assert_eq!(report.processes_terminated, 1);
    assert_eq!(report.locks_removed, 1);
    assert!(!previous.lock_path("a").exists());
}

#[tokio::test]
async fn singleton_artifacts_removed_only_from_stale_profiles() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = test_config(temp.path(), &[]);
    let previous = LockRepo::new(&config.data_dir, "previous-run").expect("lock repo");

    let stale = previous.profile_dir("stale");
    let live = previous.profile_dir("live");
    fs::create_dir_all(&stale).expect("mkdir");
    fs::create_dir_all(&live).expect("mkdir");
    for dir in [&stale, &live] {
        fs::write(dir.join("SingletonLock"), "host-1").expect("write");
        fs::write(dir.join("SingletonCookie"), "cookie").expect("write");
        fs::write(dir.join("Preferences"), "{}").expect("write");
    }
    previous.claim("live").expect("claim");
    previous.record_owner("live", 601).expect("owner");

    let table = FakeProcessTable::new();
    table.spawn_hidden(601);

    let report = reaper_for(&config, table).reap(&[]).await;

    assert_eq!(report.artifacts_removed, 2);
    assert!(!stale.join("SingletonLock").exists());
    assert!(!stale.join("SingletonCookie").exists());
    assert!(stale.join("Preferences").exists(), "profile data is kept");
    assert!(live.join("SingletonLock").exists());
    assert!(live.join("SingletonCookie").exists());
}

#[cfg(unix)]
#[tokio::test]
async fn dangling_singleton_symlink_is_removed() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = test_config(temp.path(), &[]);
    let profile = config.data_dir.join("session-old");
    fs::create_dir_all(&profile).expect("mkdir");
    let link = profile.join("SingletonLock");
    std::os::unix::fs::symlink("otherhost-12345", &link).expect("symlink");
    assert!(!link.exists(), "symlink target does not exist");

    let report = reaper_for(&config, FakeProcessTable::new()).reap(&[]).await;

    assert_eq!(report.artifacts_removed, 1);
    assert!(fs::symlink_metadata(&link).is_err());
}

#[tokio::test]
async fn zero_budget_returns_partial_report() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut config = test_config(temp.path(), &[]);
    config.reaper.time_budget_seconds = 0;
    let previous = LockRepo::new(&config.data_dir, "previous-run").expect("lock repo");
    previous.claim("a").expect("claim");

    let report = reaper_for(&config, FakeProcessTable::new()).reap(&[]).await;

    assert!(report.timed_out);
    assert!(report.is_partial());
    assert!(matches!(
        report.partial_error(),
        Some(AppError::ReapPartialFailure(_))
    ));
}

#[tokio::test]
async fn reaper_finishes_within_budget_when_grace_is_short() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = test_config(temp.path(), &[]);
    let table = FakeProcessTable::new();
    for pid in 700..710 {
        table.spawn(pid, &engine_cmdline(&config, "x"), true);
    }

    let started = std::time::Instant::now();
    let report = reaper_for(&config, Arc::clone(&table)).reap(&[]).await;

    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(report.processes_terminated, 10);
    assert_eq!(table.killed().len(), 10);
}

#[tokio::test]
async fn lock_owner_pid_reused_by_unrelated_process_is_stale() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = test_config(temp.path(), &[]);
    let previous = LockRepo::new(&config.data_dir, "previous-run").expect("lock repo");
    previous.claim("rebooted").expect("claim");
    previous.record_owner("rebooted", 801).expect("owner");
    previous.claim("running").expect("claim");
    previous.record_owner("running", 802).expect("owner");

    let table = FakeProcessTable::new();
    table.spawn(801, "/usr/sbin/sshd -D", false);
    // Tracked, so it is not reaped as an orphan.
    table.spawn(802, &engine_cmdline(&config, "running"), false);

    let report = reaper_for(&config, Arc::clone(&table)).reap(&[802]).await;

    assert_eq!(report.locks_removed, 1);
    assert_eq!(report.locks_kept, 1);
    assert!(!previous.lock_path("rebooted").exists());
    assert!(previous.lock_path("running").exists());
    assert!(table.terminated().is_empty(), "unrelated process left alone");
}

#[tokio::test]
async fn oversized_budgets_are_treated_as_unbounded() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut config = test_config(temp.path(), &[]);
    config.reaper.time_budget_seconds = u64::MAX;
    config.reaper.kill_grace_ms = u64::MAX;
    let previous = LockRepo::new(&config.data_dir, "previous-run").expect("lock repo");
    previous.claim("a").expect("claim");
    previous.record_owner("a", 901).expect("owner");
    let table = FakeProcessTable::new();
    table.spawn(901, &engine_cmdline(&config, "a"), false);

    let report = tokio::time::timeout(
        Duration::from_secs(5),
        reaper_for(&config, Arc::clone(&table)).reap(&[]),
    )
    .await
    .expect("reaper returns");

    assert!(!report.is_partial(), "{report:?}");
    assert_eq!(report.processes_terminated, 1);
    assert_eq!(report.locks_removed, 1);
}
