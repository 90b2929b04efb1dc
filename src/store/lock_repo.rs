//! Filesystem lock artifacts marking exclusive claims on session storage.
//!
//! A session's claim is the marker file `<data_dir>/<id>.lock`. Presence
//! means claimed. The body records which supervisor instance claimed it
//! and which engine process currently uses the storage, so the reaper can
//! tell a live owner from a crash leftover.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{AppError, Result};

/// Extension of lock artifact files.
const LOCK_EXTENSION: &str = "lock";

/// Prefix of per-session profile directories.
const PROFILE_PREFIX: &str = "session-";

/// Body of a lock artifact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct LockRecord {
    /// Session holding the claim.
    pub session_id: String,
    /// Supervisor instance that made the claim.
    pub instance_id: String,
    /// Engine process currently using the storage, once launched.
    pub pid: Option<u32>,
    /// When the claim was made.
    pub claimed_at: DateTime<Utc>,
}

/// Claims, updates, and releases session lock artifacts under `data_dir`.
#[derive(Debug, Clone)]
pub struct LockRepo {
    data_dir: PathBuf,
    instance_id: String,
}

impl LockRepo {
    /// Create a repository rooted at `data_dir`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if `data_dir` cannot be created.
    pub fn new(data_dir: impl Into<PathBuf>, instance_id: impl Into<String>) -> Result<Self> {
        let data_dir = data_dir.into();
        fs::create_dir_all(&data_dir).map_err(|err| {
            AppError::Io(format!("cannot create {}: {err}", data_dir.display()))
        })?;
        Ok(Self {
            data_dir,
            instance_id: instance_id.into(),
        })
    }

    /// Storage root.
    #[must_use]
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Identifier written into claims made by this repository.
    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Well-known lock path for a session.
    #[must_use]
    pub fn lock_path(&self, session_id: &str) -> PathBuf {
        self.data_dir
            .join(format!("{session_id}.{LOCK_EXTENSION}"))
    }

    /// Persistent profile directory for a session.
    #[must_use]
    pub fn profile_dir(&self, session_id: &str) -> PathBuf {
        self.data_dir.join(format!("{PROFILE_PREFIX}{session_id}"))
    }

    /// Claim the session's storage.
    ///
    /// # Errors
    ///
    /// Returns `AppError::LockConflict` if the lock artifact already exists,
    /// whoever holds it, or `AppError::Io` if it cannot be written.
    pub fn claim(&self, session_id: &str) -> Result<PathBuf> {
        let path = self.lock_path(session_id);
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path);

        let mut file = match file {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                let holder = self
                    .read(&path)
                    .ok()
                    .and_then(|record| record.pid)
                    .map_or_else(|| "unknown owner".to_owned(), |pid| format!("pid {pid}"));
                return Err(AppError::LockConflict(format!(
                    "{} is held by {holder}",
                    path.display()
                )));
            }
            Err(err) => {
                return Err(AppError::Io(format!(
                    "cannot create {}: {err}",
                    path.display()
                )))
            }
        };

        let record = LockRecord {
            session_id: session_id.to_owned(),
            instance_id: self.instance_id.clone(),
            pid: None,
            claimed_at: Utc::now(),
        };
        file.write_all(serde_json::to_string(&record)?.as_bytes())?;
        file.sync_all()?;

        info!(session_id, path = %path.display(), "session lock claimed");
        Ok(path)
    }

    /// Claim the session's storage unless this instance already holds it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::LockConflict` if the lock belongs to another
    /// instance or cannot be parsed, or `AppError::Io` on write failure.
    pub fn ensure_claimed(&self, session_id: &str) -> Result<PathBuf> {
        let path = self.lock_path(session_id);
        match self.read(&path) {
            Ok(record) if record.instance_id == self.instance_id => Ok(path),
            Ok(_) | Err(AppError::NotFound(_)) => self.claim(session_id),
            Err(err) => Err(AppError::LockConflict(format!(
                "{} is unreadable: {err}",
                path.display()
            ))),
        }
    }

    /// Record the engine process now using the session's storage.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the lock is missing, or
    /// `AppError::LockConflict` if another supervisor instance owns it.
    pub fn record_owner(&self, session_id: &str, pid: u32) -> Result<()> {
        let path = self.lock_path(session_id);
        let mut record = self.read(&path)?;
        if record.instance_id != self.instance_id {
            return Err(AppError::LockConflict(format!(
                "{} belongs to instance {}",
                path.display(),
                record.instance_id
            )));
        }

        record.pid = Some(pid);
        let staged = path.with_extension(format!("{LOCK_EXTENSION}.tmp"));
        fs::write(&staged, serde_json::to_string(&record)?)?;
        fs::rename(&staged, &path)?;

        debug!(session_id, pid, "session lock owner recorded");
        Ok(())
    }

    /// Release the session's claim. Releasing a missing lock, or one that
    /// belongs to another instance, is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the lock exists but cannot be removed.
    pub fn release(&self, session_id: &str) -> Result<()> {
        let path = self.lock_path(session_id);
        if let Ok(record) = self.read(&path) {
            if record.instance_id != self.instance_id {
                debug!(session_id, owner = %record.instance_id, "lock owned elsewhere, not released");
                return Ok(());
            }
        }
        match fs::remove_file(&path) {
            Ok(()) => {
                info!(session_id, "session lock released");
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(AppError::Io(format!(
                "cannot remove {}: {err}",
                path.display()
            ))),
        }
    }

    /// Read a lock artifact.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the file is missing, or `AppError::Io`
    /// if it cannot be read or parsed.
    pub fn read(&self, path: &Path) -> Result<LockRecord> {
        let raw = fs::read_to_string(path).map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                AppError::NotFound(format!("lock {}", path.display()))
            } else {
                AppError::Io(format!("cannot read {}: {err}", path.display()))
            }
        })?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Every lock artifact under `data_dir`, including those of sessions that
    /// are no longer configured.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the directory cannot be scanned.
    pub fn scan(&self) -> Result<Vec<PathBuf>> {
        self.glob(&format!("*.{LOCK_EXTENSION}"))
    }

    /// Every per-session profile directory under `data_dir`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the directory cannot be scanned.
    pub fn scan_profiles(&self) -> Result<Vec<PathBuf>> {
        Ok(self
            .glob(&format!("{PROFILE_PREFIX}*"))?
            .into_iter()
            .filter(|path| path.is_dir())
            .collect())
    }

    /// Session id encoded in a lock artifact's file name.
    #[must_use]
    pub fn session_id_of_lock(path: &Path) -> Option<String> {
        if path.extension().and_then(|ext| ext.to_str()) != Some(LOCK_EXTENSION) {
            return None;
        }
        path.file_stem()
            .and_then(|stem| stem.to_str())
            .map(str::to_owned)
    }

    /// Session id encoded in a profile directory's name.
    #[must_use]
    pub fn session_id_of_profile(path: &Path) -> Option<String> {
        path.file_name()
            .and_then(|name| name.to_str())
            .and_then(|name| name.strip_prefix(PROFILE_PREFIX))
            .map(str::to_owned)
    }

    fn glob(&self, pattern: &str) -> Result<Vec<PathBuf>> {
        let escaped = glob::Pattern::escape(&self.data_dir.to_string_lossy());
        let full = format!("{escaped}/{pattern}");
        let paths = glob::glob(&full)
            .map_err(|err| AppError::Io(format!("invalid scan pattern {full}: {err}")))?;

        let mut found = Vec::new();
        for entry in paths {
            match entry {
                Ok(path) => found.push(path),
                Err(err) => debug!(%err, "skipping unreadable path during scan"),
            }
        }
        Ok(found)
    }
}
