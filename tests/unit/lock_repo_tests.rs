//! Unit tests for session lock artifacts.

use std::fs;

use channel_supervisor::store::lock_repo::LockRepo;
use channel_supervisor::AppError;

fn repo(dir: &tempfile::TempDir, instance: &str) -> LockRepo {
    LockRepo::new(dir.path(), instance).expect("lock repo")
}

#[test]
fn claim_writes_record_for_this_instance() {
    let dir = tempfile::tempdir().expect("tempdir");
    let locks = repo(&dir, "me");

    let path = locks.claim("a").expect("claim");

    assert_eq!(path, dir.path().join("a.lock"));
    let record = locks.read(&path).expect("read");
    assert_eq!(record.session_id, "a");
    assert_eq!(record.instance_id, "me");
    assert!(record.pid.is_none());
}

#[test]
fn second_claim_conflicts() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mine = repo(&dir, "me");
    let theirs = repo(&dir, "them");
    theirs.claim("a").expect("claim");
    theirs.record_owner("a", 77).expect("owner");

    let err = mine.claim("a").expect_err("conflict");

    assert!(matches!(err, AppError::LockConflict(ref msg) if msg.contains("pid 77")));
}

#[test]
fn ensure_claimed_accepts_own_lock_and_refuses_foreign() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mine = repo(&dir, "me");
    let theirs = repo(&dir, "them");

    mine.ensure_claimed("a").expect("fresh claim");
    mine.ensure_claimed("a").expect("own lock is reused");

    theirs.claim("b").expect("claim");
    assert!(matches!(
        mine.ensure_claimed("b"),
        Err(AppError::LockConflict(_))
    ));
}

#[test]
fn ensure_claimed_refuses_unreadable_lock() {
    let dir = tempfile::tempdir().expect("tempdir");
    let locks = repo(&dir, "me");
    fs::write(locks.lock_path("a"), "garbage").expect("write");

    assert!(matches!(
        locks.ensure_claimed("a"),
        Err(AppError::LockConflict(_))
    ));
}

#[test]
fn record_owner_updates_pid_atomically() {
    let dir = tempfile::tempdir().expect("tempdir");
    let locks = repo(&dir, "me");
    let path = locks.claim("a").expect("claim");

    locks.record_owner("a", 1234).expect("owner");

    assert_eq!(locks.read(&path).expect("read").pid, Some(1234));
    assert!(!dir.path().join("a.lock.tmp").exists());
}

#[test]
fn record_owner_refuses_foreign_lock_and_missing_lock() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mine = repo(&dir, "me");
    let theirs = repo(&dir, "them");
    theirs.claim("a").expect("claim");

    assert!(matches!(
        mine.record_owner("a", 1),
        Err(AppError::LockConflict(_))
    ));
    assert!(matches!(
        mine.record_owner("missing", 1),
        Err(AppError::NotFound(_))
    ));
}

#[test]
fn release_is_idempotent_and_leaves_foreign_locks() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mine = repo(&dir, "me");
    let theirs = repo(&dir, "them");
    mine.claim("a").expect("claim");
    theirs.claim("b").expect("claim");

    mine.release("a").expect("release");
    mine.release("a").expect("second release is a no-op");
    mine.release("b").expect("foreign release is a no-op");

    assert!(!mine.lock_path("a").exists());
    assert!(theirs.lock_path("b").exists());
}

#[test]
fn scan_finds_locks_and_profiles() {
    let dir = tempfile::tempdir().expect("tempdir");
    let locks = repo(&dir, "me");
    locks.claim("a").expect("claim");
    locks.claim("b").expect("claim");
    fs::create_dir_all(locks.profile_dir("a")).expect("mkdir");
    fs::write(dir.path().join("session-not-a-dir"), "").expect("write");
    fs::write(dir.path().join("notes.txt"), "").expect("write");

    let mut ids: Vec<String> = locks
        .scan()
        .expect("scan")
        .iter()
        .filter_map(|p| LockRepo::session_id_of_lock(p))
        .collect();
    ids.sort();
    assert_eq!(ids, vec!["a", "b"]);

    let profiles: Vec<String> = locks
        .scan_profiles()
        .expect("profiles")
        .iter()
        .filter_map(|p| LockRepo::session_id_of_profile(p))
        .collect();
    assert_eq!(profiles, vec!["a"]);
}

#[test]
fn session_ids_are_parsed_from_paths() {
    let dir = tempfile::tempdir().expect("tempdir");
    let locks = repo(&dir, "me");

    assert_eq!(
        LockRepo::session_id_of_lock(&locks.lock_path("wa-1")).as_deref(),
        Some("wa-1")
    );
    assert_eq!(
        LockRepo::session_id_of_lock(&dir.path().join("wa-1.json")),
        None
    );
    assert_eq!(
        LockRepo::session_id_of_profile(&locks.profile_dir("wa-1")).as_deref(),
        Some("wa-1")
    );
}

#[test]
fn new_creates_missing_data_dir() {
    let dir = tempfile::tempdir().expect("tempdir");
    let nested = dir.path().join("a/b/c");

    let locks = LockRepo::new(&nested, "me").expect("lock repo");

    assert!(nested.is_dir());
    assert_eq!(locks.data_dir(), nested.as_path());
    assert_eq!(locks.instance_id(), "me");
}
