//! Session model and lifecycle helpers.

use std::fmt::{Display, Formatter};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::engine::ProcessHandle;
use crate::{AppError, Result};

/// Maximum length of a session identifier.
const MAX_ID_LEN: usize = 64;

/// Lifecycle state of one messaging channel's connection.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Process start requested, not yet confirmed live.
    Initializing,
    /// Last probe returned `Healthy`.
    Connected,
    /// One probe returned `Unresponsive`; one grace cycle before recovery.
    Degraded,
    /// Recovery in progress.
    Reconnecting,
    /// Probe returned `Crashed` or recovery failed; waiting for backoff or an operator.
    Crashed,
    /// Administratively deactivated. Terminal.
    Closed,
}

impl SessionState {
    /// Lower-case name used in logs and IPC payloads.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Connected => "connected",
            Self::Degraded => "degraded",
            Self::Reconnecting => "reconnecting",
            Self::Crashed => "crashed",
            Self::Closed => "closed",
        }
    }
}

impl Display for SessionState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Supervised lifecycle record for one messaging channel.
#[derive(Debug, Clone)]
pub struct Session {
    /// Stable identifier of the owning channel.
    pub id: String,
    /// Current lifecycle state.
    pub state: SessionState,
    /// Engine process owned by this session, if one is running.
    pub process: Option<ProcessHandle>,
    /// Time of the last successful liveness probe.
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    /// Consecutive recovery attempts since the last `Connected` state.
    pub retry_count: u32,
    /// Path of the session's exclusive storage claim.
    pub lock_path: PathBuf,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Time of the last state change; field-only updates leave it untouched.
    pub changed_at: DateTime<Utc>,
    /// Earliest time a `Crashed` session may be recovered. `None` while
    /// `Crashed` means automatic recovery is held for an operator.
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// Most recent launch or lock failure.
    pub last_error: Option<String>,
}

impl Session {
    /// Construct a new `Initializing` session.
    #[must_use]
    pub fn new(id: String, lock_path: PathBuf) -> Self {
        let now = Utc::now();
        Self {
            id,
            state: SessionState::Initializing,
            process: None,
            last_heartbeat_at: None,
            retry_count: 0,
            lock_path,
            created_at: now,
            changed_at: now,
            next_attempt_at: None,
            last_error: None,
        }
    }

    /// Determine whether a lifecycle transition is permitted.
    ///
    /// Self-transitions are allowed (they carry field-only updates) except
    /// out of `Closed`, which is terminal.
    #[must_use]
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::{Closed, Connected, Crashed, Degraded, Initializing, Reconnecting};

        if self.state == Closed {
            return false;
        }
        if self.state == next || next == Closed {
            return true;
        }
        matches!(
            (self.state, next),
            (Initializing, Connected | Crashed)
                | (Connected, Degraded | Reconnecting | Crashed)
                | (Degraded, Connected | Reconnecting | Crashed)
                | (Reconnecting, Connected | Crashed)
                | (Crashed, Reconnecting)
        )
    }

    /// OS process id of the owned engine process, if any.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().map(ProcessHandle::pid)
    }

    /// Whether a `Crashed` session is waiting for an operator.
    #[must_use]
    pub fn is_held(&self) -> bool {
        self.state == SessionState::Crashed && self.next_attempt_at.is_none()
    }

    /// Whether a `Crashed` session's backoff has elapsed at `now`.
    #[must_use]
    pub fn recovery_due(&self, now: DateTime<Utc>) -> bool {
        self.state == SessionState::Crashed && self.next_attempt_at.is_some_and(|at| at <= now)
    }
}

/// Validate a session identifier before it is used to build on-disk paths.
///
/// # Errors
///
/// Returns `AppError::Config` if the identifier is empty, too long, or contains
/// characters outside `[A-Za-z0-9_-]`.
pub fn validate_session_id(id: &str) -> Result<()> {
    if id.is_empty() || id.len() > MAX_ID_LEN {
        return Err(AppError::Config(format!(
            "session id must be 1..={MAX_ID_LEN} characters: '{id}'"
        )));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(AppError::Config(format!(
            "session id may only contain [A-Za-z0-9_-]: '{id}'"
        )));
    }
    Ok(())
}
