//! Error types shared across the supervisor.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all supervisor failure modes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// The automation engine failed to start. Retryable under the backoff policy.
    Launch(String),
    /// A liveness probe did not answer in time. Treated as `Unresponsive`.
    ProbeTimeout(String),
    /// Another live owner holds the session's lock artifact.
    LockConflict(String),
    /// The reaper could not clean up every orphan or stale lock.
    ReapPartialFailure(String),
    /// Requested state change is not an edge of the session state machine.
    InvalidTransition(String),
    /// A session with the same identifier is already registered.
    AlreadyExists(String),
    /// Requested entity does not exist.
    NotFound(String),
    /// A scheduled job run failed.
    Job(String),
    /// IPC communication failure.
    Ipc(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Launch(msg) => write!(f, "launch: {msg}"),
            Self::ProbeTimeout(msg) => write!(f, "probe timeout: {msg}"),
            Self::LockConflict(msg) => write!(f, "lock conflict: {msg}"),
            Self::ReapPartialFailure(msg) => write!(f, "reap partial failure: {msg}"),
            Self::InvalidTransition(msg) => write!(f, "invalid transition: {msg}"),
            Self::AlreadyExists(msg) => write!(f, "already exists: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::Job(msg) => write!(f, "job: {msg}"),
            Self::Ipc(msg) => write!(f, "ipc: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Io(format!("json: {err}"))
    }
}
