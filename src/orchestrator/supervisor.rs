//! Session activation, recovery, and teardown.
//!
//! The supervisor is the only component that starts or stops engine
//! processes for registered sessions. It owns:
//! - the launch cap shared by activations and recoveries, and a separate
//!   probe cap so a slow launch never holds up health checks,
//! - the set of sessions with a recovery in flight, so each id has at
//!   most one,
//! - the task tracker that shutdown drains before stopping processes.
//!
//! Activation stays closed while the orchestrator runs the reaper; see
//! [`Supervisor::hold_activations`].

use std::collections::{HashMap, HashSet};
use std::fs;
use std::future::Future;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Semaphore, SemaphorePermit};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, info_span, warn, Instrument};

use super::recovery::RecoveryPolicy;
use crate::config::GlobalConfig;
use crate::engine::{AutomationEngine, LaunchSpec, ProcessHandle};
use crate::models::session::{validate_session_id, Session, SessionState};
use crate::store::lock_repo::LockRepo;
use crate::store::session_store::SessionStore;
use crate::{AppError, Result};

/// Tunables for a [`Supervisor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorOptions {
    /// Backoff applied after failed launches.
    pub policy: RecoveryPolicy,
    /// Maximum launches (activations plus recoveries) running at once,
    /// and separately, maximum probes running at once.
    pub max_concurrency: usize,
    /// Shared engine cache directory.
    pub cache_dir: PathBuf,
    /// First port handed to sessions without a fixed one.
    pub debug_port_base: u16,
    /// Ports pinned per session id.
    pub fixed_ports: HashMap<String, u16>,
}

impl SupervisorOptions {
    /// Derive options from the global configuration.
    #[must_use]
    pub fn from_config(config: &GlobalConfig) -> Self {
        Self {
            policy: RecoveryPolicy::from(&config.recovery),
            max_concurrency: config.monitor.max_concurrency,
            cache_dir: config.cache_dir(),
            debug_port_base: config.engine.debug_port_base,
            fixed_ports: config
                .sessions
                .iter()
                .filter_map(|s| s.debug_port.map(|port| (s.id.clone(), port)))
                .collect(),
        }
    }
}

/// Starts, recovers, and stops the engine processes behind sessions.
pub struct Supervisor {
    store: Arc<SessionStore>,
    locks: LockRepo,
    engine: Arc<dyn AutomationEngine>,
    policy: RecoveryPolicy,
    launch_limiter: Semaphore,
    probe_limiter: Semaphore,
    activations_open: AtomicBool,
    tracker: TaskTracker,
    cancel: CancellationToken,
    in_flight: Mutex<HashSet<String>>,
    cache_dir: PathBuf,
    debug_port_base: u16,
    ports: Mutex<HashMap<String, u16>>,
}

impl Supervisor {
    /// Build a supervisor. `cancel` stops new recoveries once fired.
    #[must_use]
    pub fn new(
        store: Arc<SessionStore>,
        locks: LockRepo,
        engine: Arc<dyn AutomationEngine>,
        options: SupervisorOptions,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            locks,
            engine,
            policy: options.policy,
            launch_limiter: Semaphore::new(options.max_concurrency.max(1)),
            probe_limiter: Semaphore::new(options.max_concurrency.max(1)),
            activations_open: AtomicBool::new(true),
            tracker: TaskTracker::new(),
            cancel,
            in_flight: Mutex::new(HashSet::new()),
            cache_dir: options.cache_dir,
            debug_port_base: options.debug_port_base,
            ports: Mutex::new(options.fixed_ports),
        })
    }

    /// Shared session registry.
    #[must_use]
    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    /// Lock artifact repository.
    #[must_use]
    pub fn locks(&self) -> &LockRepo {
        &self.locks
    }

    /// Backoff policy.
    #[must_use]
    pub fn policy(&self) -> &RecoveryPolicy {
        &self.policy
    }

    /// Shutdown token.
    #[must_use]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Acquire one launch slot.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Launch` if the limiter has been closed.
    pub async fn permit(&self) -> Result<SemaphorePermit<'_>> {
        self.launch_limiter
            .acquire()
            .await
            .map_err(|_| AppError::Launch("launch limiter closed".into()))
    }

    /// Acquire one probe slot. Probe slots are never held by launches.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Launch` if the limiter has been closed.
    pub async fn probe_permit(&self) -> Result<SemaphorePermit<'_>> {
        self.probe_limiter
            .acquire()
            .await
            .map_err(|_| AppError::Launch("probe limiter closed".into()))
    }

    /// Refuse [`activate`](Self::activate) until
    /// [`open_activations`](Self::open_activations) is called.
    pub fn hold_activations(&self) {
        self.activations_open.store(false, Ordering::SeqCst);
    }

    /// Accept activations again.
    pub fn open_activations(&self) {
        if !self.activations_open.swap(true, Ordering::SeqCst) {
            debug!("session activation opened");
        }
    }

    /// Run `task` on the tracker that [`shutdown`](Self::shutdown) drains.
    pub fn spawn_tracked<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tracker.spawn(task);
    }

    /// Whether a recovery task is currently running for `id`.
    #[must_use]
    pub fn is_recovering(&self, id: &str) -> bool {
        self.in_flight().contains(id)
    }

    /// Register `id` and bring its engine process up.
    ///
    /// A failed launch leaves the session `Crashed` with a backoff deadline
    /// so the health monitor retries it. A lock held by someone else leaves
    /// it `Crashed` and held until [`reset`](Self::reset).
    ///
    /// # Errors
    ///
    /// Returns `AppError::AlreadyExists` if `id` is registered,
    /// `AppError::LockConflict` if its storage is claimed elsewhere, or
    /// `AppError::Launch` if the engine fails to start.
    pub async fn activate(&self, id: &str) -> Result<Session> {
        validate_session_id(id)?;
        if self.cancel.is_cancelled() {
            return Err(AppError::Launch("supervisor is shutting down".into()));
        }
        if !self.activations_open.load(Ordering::SeqCst) {
            return Err(AppError::Launch(
                "supervisor is still starting up, activation not accepted yet".into(),
            ));
        }
        if self.is_recovering(id) {
            return Err(AppError::AlreadyExists(format!(
                "session {id} has a recovery in flight"
            )));
        }

        self.store.insert(id, self.locks.lock_path(id)).await?;
        let _permit = self.permit().await?;
        self.launch_and_connect(id).await
    }

    /// Replace the engine process of `id`.
    ///
    /// Moves the session to `Reconnecting`, confirms the old process is
    /// gone, then launches a new one.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidTransition` if the session is not in a
    /// recoverable state, or the launch error if the new process fails.
    pub async fn recover(&self, id: &str) -> Result<Session> {
        let _permit = self.permit().await?;
        if self.cancel.is_cancelled() {
            return Err(AppError::Launch("supervisor is shutting down".into()));
        }

        let mut previous = None;
        let session = self
            .store
            .transition_from(
                id,
                &[
                    SessionState::Connected,
                    SessionState::Degraded,
                    SessionState::Crashed,
                ],
                SessionState::Reconnecting,
                |s| {
                    s.retry_count = s.retry_count.saturating_add(1);
                    previous = s.process.take();
                },
            )
            .await?;
        info!(session_id = id, retry_count = session.retry_count, "recovery started");

        if let Some(handle) = previous {
            self.engine.terminate(handle).await;
        }
        self.launch_and_connect(id).await
    }

    /// Run [`recover`](Self::recover) for `id` as a tracked background task.
    ///
    /// Returns `false` without spawning when shutdown has begun or a
    /// recovery for `id` is already running.
    pub fn dispatch_recovery(self: &Arc<Self>, id: &str) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        if !self.in_flight().insert(id.to_owned()) {
            debug!(session_id = id, "recovery already in flight");
            return false;
        }

        let this = Arc::clone(self);
        let id = id.to_owned();
        let span = info_span!("recovery", session_id = %id);
        self.tracker.spawn(
            async move {
                if let Err(err) = this.recover(&id).await {
                    warn!(%err, "recovery failed");
                }
                this.in_flight().remove(&id);
            }
            .instrument(span),
        );
        true
    }

    /// Stop `id`'s process, release its lock, and drop it from the store.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown id or
    /// `AppError::InvalidTransition` if it is already closed.
    pub async fn deactivate(&self, id: &str) -> Result<()> {
        let mut previous = None;
        self.store
            .transition(id, SessionState::Closed, |s| {
                previous = s.process.take();
                s.next_attempt_at = None;
            })
            .await?;

        if let Some(handle) = previous {
            self.engine.terminate(handle).await;
        }
        if let Err(err) = self.locks.release(id) {
            warn!(session_id = id, %err, "failed to release session lock");
        }
        self.store.remove(id).await?;

        info!(session_id = id, "session deactivated");
        Ok(())
    }

    /// Make a `Crashed` session (held or cooling down) due for recovery now,
    /// and dispatch that recovery.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown id or
    /// `AppError::InvalidTransition` if the session is not `Crashed`.
    pub async fn reset(self: &Arc<Self>, id: &str) -> Result<Session> {
        let now = Utc::now();
        let session = self
            .store
            .transition_from(id, &[SessionState::Crashed], SessionState::Crashed, |s| {
                s.next_attempt_at = Some(now);
            })
            .await?;

        info!(session_id = id, retry_count = session.retry_count, "session reset by operator");
        self.dispatch_recovery(id);
        Ok(session)
    }

    /// Stop recoveries, wait up to `grace` for in-flight work, then
    /// deactivate every remaining session.
    pub async fn shutdown(&self, grace: Duration) {
        self.cancel.cancel();
        self.tracker.close();
        if tokio::time::timeout(grace, self.tracker.wait()).await.is_err() {
            warn!(
                in_flight = self.tracker.len(),
                "in-flight recoveries did not settle within grace period"
            );
        }

        for session in self.store.list().await {
            if session.state == SessionState::Closed {
                continue;
            }
            if let Err(err) = self.deactivate(&session.id).await {
                warn!(session_id = %session.id, %err, "failed to deactivate session during shutdown");
            }
        }
        info!("all sessions stopped");
    }

    async fn launch_and_connect(&self, id: &str) -> Result<Session> {
        let session = self.store.get(id).await?;
        if session.process.is_some() {
            return Err(AppError::InvalidTransition(format!(
                "session {id} still owns a process"
            )));
        }

        if let Err(err) = self.locks.ensure_claimed(id) {
            if matches!(err, AppError::LockConflict(_)) {
                self.hold(id, &err).await;
            } else {
                self.schedule_retry(id, &err).await;
            }
            return Err(err);
        }

        let result = self.launch_claimed(id).await;
        if result.is_err() {
            self.release_if_gone(id).await;
        }
        result
    }

    /// Launch for a session whose lock is already claimed.
    async fn launch_claimed(&self, id: &str) -> Result<Session> {
        // A deactivate may have run between the store read and the claim.
        match self.store.get(id).await {
            Ok(session) if session.state != SessionState::Closed => {}
            _ => {
                return Err(AppError::NotFound(format!(
                    "session {id} was deactivated during launch"
                )))
            }
        }

        let spec = match self.launch_spec(id) {
            Ok(spec) => spec,
            Err(err) => {
                self.schedule_retry(id, &err).await;
                return Err(err);
            }
        };

        match self.engine.launch(&spec).await {
            Ok(handle) => {
                if let Err(err) = self.locks.record_owner(id, handle.pid()) {
                    warn!(session_id = id, %err, "failed to record lock owner");
                }
                self.connect(id, handle).await
            }
            Err(err) => {
                self.schedule_retry(id, &err).await;
                Err(err)
            }
        }
    }

    /// Release the lock of `id` if the session was closed or removed while
    /// a launch held the claim.
    async fn release_if_gone(&self, id: &str) {
        let gone = match self.store.get(id).await {
            Ok(session) => session.state == SessionState::Closed,
            Err(_) => true,
        };
        if !gone {
            return;
        }
        if let Err(err) = self.locks.release(id) {
            warn!(session_id = id, %err, "failed to release lock of deactivated session");
        }
    }

    async fn connect(&self, id: &str, handle: ProcessHandle) -> Result<Session> {
        let now = Utc::now();
        let owned = handle.clone();
        let result = self
            .store
            .transition_from(
                id,
                &[SessionState::Initializing, SessionState::Reconnecting],
                SessionState::Connected,
                move |s| {
                    s.process = Some(owned);
                    s.retry_count = 0;
                    s.last_heartbeat_at = Some(now);
                    s.next_attempt_at = None;
                    s.last_error = None;
                },
            )
            .await;

        if let Err(err) = &result {
            warn!(session_id = id, pid = handle.pid(), %err, "session changed during launch, stopping new process");
            self.engine.terminate(handle).await;
        }
        result
    }

    async fn schedule_retry(&self, id: &str, err: &AppError) {
        let policy = self.policy;
        let message = err.to_string();
        let result = self
            .store
            .transition_from(
                id,
                &[SessionState::Initializing, SessionState::Reconnecting],
                SessionState::Crashed,
                |s| {
                    s.next_attempt_at = Some(policy.next_attempt_at(Utc::now(), s.retry_count));
                    s.last_error = Some(message);
                },
            )
            .await;

        match result {
            Ok(session) if policy.exhausted(session.retry_count) => warn!(
                session_id = id,
                retry_count = session.retry_count,
                cooldown_secs = policy.cooldown.as_secs(),
                %err,
                "retry budget exhausted, cooling down"
            ),
            Ok(session) => warn!(
                session_id = id,
                retry_count = session.retry_count,
                next_attempt_at = ?session.next_attempt_at,
                %err,
                "launch failed, retry scheduled"
            ),
            Err(transition_err) => {
                debug!(session_id = id, %transition_err, "session changed before failure was recorded");
            }
        }
    }

    async fn hold(&self, id: &str, err: &AppError) {
        let message = err.to_string();
        match self
            .store
            .transition_from(
                id,
                &[SessionState::Initializing, SessionState::Reconnecting],
                SessionState::Crashed,
                |s| {
                    s.next_attempt_at = None;
                    s.last_error = Some(message);
                },
            )
            .await
        {
            Ok(_) => warn!(session_id = id, %err, "session storage is claimed elsewhere, holding for operator"),
            Err(transition_err) => {
                debug!(session_id = id, %transition_err, "session changed before conflict was recorded");
            }
        }
    }

    fn launch_spec(&self, id: &str) -> Result<LaunchSpec> {
        let profile_dir = self.locks.profile_dir(id);
        fs::create_dir_all(&profile_dir).map_err(|err| {
            AppError::Io(format!("cannot create {}: {err}", profile_dir.display()))
        })?;
        fs::create_dir_all(&self.cache_dir).map_err(|err| {
            AppError::Io(format!("cannot create {}: {err}", self.cache_dir.display()))
        })?;

        Ok(LaunchSpec {
            session_id: id.to_owned(),
            profile_dir,
            cache_dir: self.cache_dir.clone(),
            debug_port: self.port_for(id),
        })
    }

    /// Launch parameters for the cache warm-up browser.
    ///
    /// The warm-up gets a throwaway profile under `data_dir`, recreated on
    /// every call, and shares the sessions' cache directory.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the profile or cache directory cannot be
    /// prepared.
    pub fn preload_spec(&self, label: &str, profile_name: &str) -> Result<LaunchSpec> {
        let profile_dir = self.locks.data_dir().join(profile_name);
        match fs::remove_dir_all(&profile_dir) {
            Ok(()) => debug!(path = %profile_dir.display(), "previous warm-up profile removed"),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => {
                return Err(AppError::Io(format!(
                    "cannot clear {}: {err}",
                    profile_dir.display()
                )))
            }
        }
        fs::create_dir_all(&profile_dir).map_err(|err| {
            AppError::Io(format!("cannot create {}: {err}", profile_dir.display()))
        })?;
        fs::create_dir_all(&self.cache_dir).map_err(|err| {
            AppError::Io(format!("cannot create {}: {err}", self.cache_dir.display()))
        })?;

        Ok(LaunchSpec {
            session_id: label.to_owned(),
            profile_dir,
            cache_dir: self.cache_dir.clone(),
            debug_port: self.port_for(label),
        })
    }

    /// Stable debugging port for `id`, allocated on first use.
    fn port_for(&self, id: &str) -> u16 {
        let mut ports = self.ports.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(port) = ports.get(id) {
            return *port;
        }
        let taken: HashSet<u16> = ports.values().copied().collect();
        let port = (self.debug_port_base..=u16::MAX)
            .find(|port| !taken.contains(port))
            .unwrap_or(self.debug_port_base);
        ports.insert(id.to_owned(), port);
        port
    }

    fn in_flight(&self) -> MutexGuard<'_, HashSet<String>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
