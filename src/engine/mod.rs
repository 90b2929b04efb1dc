//! Automation engine abstraction.
//!
//! The [`AutomationEngine`] trait is the only way the supervisor starts,
//! probes, and stops the browser processes that back messaging sessions.
//! Engine options (sandboxing flags, storage paths) are passed through
//! untouched; the supervisor never interprets them.

pub mod chromium;

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Child;
use tokio::sync::Mutex;

use crate::models::verdict::Verdict;
use crate::Result;

/// Boxed future returned by engine operations.
pub type EngineFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Everything an engine needs to start the process for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    /// Session the process is launched for.
    pub session_id: String,
    /// Per-session persistent profile directory.
    pub profile_dir: PathBuf,
    /// Shared cache directory.
    pub cache_dir: PathBuf,
    /// Local port the engine exposes its liveness endpoint on.
    pub debug_port: u16,
}

/// Reference to a running engine process.
///
/// A handle belongs to exactly one session record. Clones share the same
/// underlying child, so only the owning session's lifecycle code may pass
/// it to [`AutomationEngine::terminate`].
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pid: u32,
    endpoint: Option<String>,
    child: Option<Arc<Mutex<Child>>>,
}

impl ProcessHandle {
    /// Wrap a child process spawned by this supervisor.
    #[must_use]
    pub fn spawned(pid: u32, child: Child, endpoint: Option<String>) -> Self {
        Self {
            pid,
            endpoint,
            child: Some(Arc::new(Mutex::new(child))),
        }
    }

    /// Reference a process by id only (no child handle is held).
    #[must_use]
    pub fn external(pid: u32, endpoint: Option<String>) -> Self {
        Self {
            pid,
            endpoint,
            child: None,
        }
    }

    /// OS process id.
    #[must_use]
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Base URL of the process's liveness endpoint, if it exposes one.
    #[must_use]
    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }

    /// Child handle, when the process was spawned by this supervisor.
    #[must_use]
    pub fn child(&self) -> Option<&Arc<Mutex<Child>>> {
        self.child.as_ref()
    }
}

/// Start/probe/stop contract of the external automation engine.
pub trait AutomationEngine: Send + Sync {
    /// Start an engine process and wait until it is confirmed live.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Launch`](crate::AppError::Launch) if the process
    /// cannot be spawned or never signals readiness.
    fn launch<'a>(&'a self, spec: &'a LaunchSpec) -> EngineFuture<'a, Result<ProcessHandle>>;

    /// Query the process for liveness, answering within `timeout`.
    fn probe_liveness<'a>(
        &'a self,
        handle: &'a ProcessHandle,
        timeout: Duration,
    ) -> EngineFuture<'a, Verdict>;

    /// Stop the process and return once it is confirmed gone.
    fn terminate(&self, handle: ProcessHandle) -> EngineFuture<'_, ()>;
}
