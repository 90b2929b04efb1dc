//! Boot-time cleanup of orphaned engine processes and stale locks.
//!
//! An unclean shutdown can leave behind engine processes still holding a
//! session profile, lock artifacts naming dead owners, and the engine's
//! own singleton files inside profile directories. The reaper clears all
//! three before any session is activated:
//!
//! 1. Engine processes not owned by a tracked handle receive SIGTERM, then
//!    SIGKILL once the grace period expires.
//! 2. Each `<data_dir>/*.lock` is kept if its recorded owner is alive and
//!    removed otherwise. An owner pid that shows up in the process listing
//!    with a non-engine command line was reused after a reboot and does
//!    not keep the lock.
//! 3. Singleton artifacts are removed from every profile whose lock is gone.
//!
//! Failures are logged and skipped. The whole run is bounded by a time
//! budget, after which a partial report is returned.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::GlobalConfig;
use crate::process_table::{ProcessEntry, ProcessTable};
use crate::store::lock_repo::LockRepo;
use crate::{AppError, Result};

/// Interval between liveness checks while waiting for terminated processes.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Stand-in for budgets too large to represent as an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Reaper tunables.
#[derive(Debug, Clone)]
pub struct ReaperSettings {
    /// Storage root; processes mentioning it are engine processes.
    pub data_dir: PathBuf,
    /// Additional command-line patterns identifying engine processes.
    pub patterns: Vec<Regex>,
    /// Engine singleton files removed from stale profiles.
    pub stale_artifacts: Vec<String>,
    /// Total time budget of a run.
    pub time_budget: Duration,
    /// Wait between SIGTERM and SIGKILL.
    pub kill_grace: Duration,
}

impl ReaperSettings {
    /// Derive settings from the global configuration.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if a process pattern does not compile.
    pub fn from_config(config: &GlobalConfig) -> Result<Self> {
        Ok(Self {
            data_dir: config.data_dir.clone(),
            patterns: config.reaper.compiled_patterns()?,
            stale_artifacts: config.reaper.stale_artifacts.clone(),
            time_budget: Duration::from_secs(config.reaper.time_budget_seconds),
            kill_grace: Duration::from_millis(config.reaper.kill_grace_ms),
        })
    }
}

/// Outcome of one reaper run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapReport {
    /// Orphaned engine processes found.
    pub processes_found: usize,
    /// Orphans confirmed stopped.
    pub processes_terminated: usize,
    /// Orphans that could not be stopped.
    pub processes_failed: usize,
    /// Lock artifacts found.
    pub locks_found: usize,
    /// Stale locks deleted.
    pub locks_removed: usize,
    /// Locks kept because their owner is alive.
    pub locks_kept: usize,
    /// Singleton artifacts deleted from stale profiles.
    pub artifacts_removed: usize,
    /// One message per item that could not be handled.
    pub failures: Vec<String>,
    /// Whether the time budget ran out before the run completed.
    pub timed_out: bool,
}

impl ReapReport {
    /// Whether some cleanup was skipped.
    #[must_use]
    pub fn is_partial(&self) -> bool {
        self.timed_out || !self.failures.is_empty()
    }

    /// The run's partial-failure error, if any.
    #[must_use]
    pub fn partial_error(&self) -> Option<AppError> {
        if !self.is_partial() {
            return None;
        }
        let mut reasons = self.failures.clone();
        if self.timed_out {
            reasons.push("time budget exhausted".into());
        }
        Some(AppError::ReapPartialFailure(reasons.join("; ")))
    }
}

/// Cleans up after a previous unclean shutdown. Never touches the session store.
pub struct Reaper {
    settings: ReaperSettings,
    table: Arc<dyn ProcessTable>,
    locks: LockRepo,
}

impl Reaper {
    /// Create a reaper over `locks`, using `table` for process access.
    #[must_use]
    pub fn new(settings: ReaperSettings, table: Arc<dyn ProcessTable>, locks: LockRepo) -> Self {
        Self {
            settings,
            table,
            locks,
        }
    }

    /// Run a full cleanup pass. Processes in `tracked` are never touched.
    pub async fn reap(&self, tracked: &[u32]) -> ReapReport {
        let deadline = deadline_after(self.settings.time_budget);
        let mut report = ReapReport::default();

        let listing = self.reap_processes(tracked, deadline, &mut report).await;
        let live = self.reap_locks(&listing, deadline, &mut report);
        self.reap_artifacts(&live, deadline, &mut report);

        if let Some(err) = report.partial_error() {
            warn!(
                processes_terminated = report.processes_terminated,
                locks_removed = report.locks_removed,
                %err,
                "reaper finished with failures"
            );
        } else {
            info!(
                processes_found = report.processes_found,
                processes_terminated = report.processes_terminated,
                locks_removed = report.locks_removed,
                locks_kept = report.locks_kept,
                artifacts_removed = report.artifacts_removed,
                "reaper finished"
            );
        }
        report
    }

    /// Returns the process listing, keyed by pid. Empty if listing failed.
    async fn reap_processes(
        &self,
        tracked: &[u32],
        deadline: Instant,
        report: &mut ReapReport,
    ) -> HashMap<u32, ProcessEntry> {
        let table = Arc::clone(&self.table);
        let listed = tokio::time::timeout_at(
            deadline,
            tokio::task::spawn_blocking(move || table.list()),
        )
        .await;

        let entries = match listed {
            Ok(Ok(entries)) => entries,
            Ok(Err(err)) => {
                report.failures.push(format!("process listing failed: {err}"));
                return HashMap::new();
            }
            Err(_) => {
                report.timed_out = true;
                return HashMap::new();
            }
        };

        let own_pid = std::process::id();
        let orphans: Vec<ProcessEntry> = entries
            .iter()
            .filter(|entry| entry.pid != own_pid && !tracked.contains(&entry.pid))
            .filter(|entry| self.is_engine_process(entry))
            .cloned()
            .collect();
        let listing: HashMap<u32, ProcessEntry> =
            entries.into_iter().map(|entry| (entry.pid, entry)).collect();
        report.processes_found = orphans.len();
        if orphans.is_empty() {
            return listing;
        }

        let mut pending = Vec::with_capacity(orphans.len());
        for orphan in &orphans {
            info!(pid = orphan.pid, name = %orphan.name, "terminating orphaned engine process");
            match self.table.terminate(orphan.pid) {
                Ok(()) => pending.push(orphan.pid),
                Err(err) => {
                    report.processes_failed += 1;
                    report.failures.push(format!("pid {}: {err}", orphan.pid));
                }
            }
        }

        let grace_end = deadline_after(self.settings.kill_grace).min(deadline);
        loop {
            pending.retain(|pid| {
                if self.table.is_alive(*pid) {
                    true
                } else {
                    report.processes_terminated += 1;
                    false
                }
            });
            if pending.is_empty() || Instant::now() >= grace_end {
                break;
            }
            tokio::time::sleep(EXIT_POLL_INTERVAL).await;
        }

        for pid in pending {
            if Instant::now() >= deadline {
                report.timed_out = true;
                report.processes_failed += 1;
                continue;
            }
            warn!(pid, "orphan survived grace period, killing");
            match self.table.kill(pid) {
                Ok(()) => report.processes_terminated += 1,
                Err(err) => {
                    report.processes_failed += 1;
                    report.failures.push(format!("pid {pid}: {err}"));
                }
            }
        }
        listing
    }

    /// Returns the session ids whose lock is held by a live owner.
    fn reap_locks(
        &self,
        listing: &HashMap<u32, ProcessEntry>,
        deadline: Instant,
        report: &mut ReapReport,
    ) -> HashSet<String> {
        let mut live = HashSet::new();
        let paths = match self.locks.scan() {
            Ok(paths) => paths,
            Err(err) => {
                report.failures.push(format!("lock scan failed: {err}"));
                return live;
            }
        };
        report.locks_found = paths.len();

        for path in paths {
            if Instant::now() >= deadline {
                report.timed_out = true;
                break;
            }
            let Some(session_id) = LockRepo::session_id_of_lock(&path) else {
                continue;
            };

            let owner = match self.locks.read(&path) {
                Ok(record) => record.pid,
                Err(err) => {
                    debug!(path = %path.display(), %err, "unreadable lock treated as stale");
                    None
                }
            };

            if let Some(pid) = owner.filter(|pid| self.owner_is_live(*pid, listing)) {
                info!(session_id, pid, "lock owner is alive, keeping lock");
                report.locks_kept += 1;
                live.insert(session_id);
                continue;
            }

            match fs::remove_file(&path) {
                Ok(()) => {
                    info!(session_id, owner = ?owner, "stale session lock removed");
                    report.locks_removed += 1;
                }
                Err(err) => {
                    report.failures.push(format!("{}: {err}", path.display()));
                    live.insert(session_id);
                }
            }
        }
        live
    }

    fn reap_artifacts(&self, live: &HashSet<String>, deadline: Instant, report: &mut ReapReport) {
        if self.settings.stale_artifacts.is_empty() {
            return;
        }
        let profiles = match self.locks.scan_profiles() {
            Ok(profiles) => profiles,
            Err(err) => {
                report.failures.push(format!("profile scan failed: {err}"));
                return;
            }
        };

        for profile in profiles {
            if Instant::now() >= deadline {
                report.timed_out = true;
                return;
            }
            let Some(session_id) = LockRepo::session_id_of_profile(&profile) else {
                continue;
            };
            if live.contains(&session_id) {
                continue;
            }
            for name in &self.settings.stale_artifacts {
                remove_artifact(&profile.join(name), report);
            }
        }
    }

    /// A lock owner counts as live if it is alive and, when the listing
    /// shows its command line, that command line is an engine's.
    fn owner_is_live(&self, pid: u32, listing: &HashMap<u32, ProcessEntry>) -> bool {
        if !self.table.is_alive(pid) {
            return false;
        }
        match listing.get(&pid) {
            Some(entry) if !self.is_engine_process(entry) => {
                info!(pid, name = %entry.name, "lock owner pid belongs to a non-engine process");
                false
            }
            _ => true,
        }
    }

    fn is_engine_process(&self, entry: &ProcessEntry) -> bool {
        let data_dir = self.settings.data_dir.to_string_lossy();
        (!data_dir.is_empty() && entry.cmdline.contains(data_dir.as_ref()))
            || self
                .settings
                .patterns
                .iter()
                .any(|pattern| pattern.is_match(&entry.cmdline))
    }
}

fn deadline_after(budget: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(budget).unwrap_or_else(|| now + FAR_FUTURE)
}

fn remove_artifact(path: &Path, report: &mut ReapReport) {
    // Singleton files are usually dangling symlinks; `exists()` would miss them.
    if fs::symlink_metadata(path).is_err() {
        return;
    }
    match fs::remove_file(path) {
        Ok(()) => {
            debug!(path = %path.display(), "stale engine artifact removed");
            report.artifacts_removed += 1;
        }
        Err(err) => report.failures.push(format!("{}: {err}", path.display())),
    }
}
