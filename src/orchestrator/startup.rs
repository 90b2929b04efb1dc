//! Startup sequencing.
//!
//! [`Orchestrator::start`] runs, strictly in order:
//! 1. the reaper,
//! 2. a settle delay so the engine can release resources held by reaped
//!    processes,
//! 3. activation of every enabled session (concurrent across ids, bounded
//!    by the supervisor's launch cap),
//! 4. a second delay,
//! 5. the health monitor plus the externally supplied periodic jobs.
//!
//! The supervisor refuses activation requests, including those arriving
//! over IPC, until phase 3 begins. The optional cache warm-up starts right
//! after the reaper and runs beside the later phases.
//!
//! Per-session failures never abort startup. A shutdown signal received
//! mid-sequence skips the remaining phases.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use super::health_monitor::HealthMonitor;
use super::preload::Preloader;
use super::probe::ConnectionProbe;
use super::reaper::{ReapReport, Reaper, ReaperSettings};
use super::supervisor::{Supervisor, SupervisorOptions};
use crate::config::GlobalConfig;
use crate::engine::AutomationEngine;
use crate::process_table::ProcessTable;
use crate::scheduler::Scheduler;
use crate::store::lock_repo::LockRepo;
use crate::store::session_store::SessionStore;
use crate::Result;

/// Everything needed to bring the supervisor up.
pub struct Orchestrator {
    supervisor: Arc<Supervisor>,
    reaper: Reaper,
    monitor: Arc<HealthMonitor>,
    preloader: Option<Preloader>,
    sessions: Vec<String>,
    settle_delay: Duration,
    jobs_delay: Duration,
    monitor_interval: Duration,
    shutdown_grace: Duration,
    cancel: CancellationToken,
}

impl Orchestrator {
    /// Wire the store, supervisor, reaper, and monitor from configuration.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the storage root cannot be prepared, or
    /// `AppError::Config` if the reaper patterns are invalid.
    pub fn from_config(
        config: &GlobalConfig,
        engine: Arc<dyn AutomationEngine>,
        table: Arc<dyn ProcessTable>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let instance_id = Uuid::new_v4().to_string();
        let locks = LockRepo::new(&config.data_dir, instance_id.clone())?;
        let store = Arc::new(SessionStore::new());

        let supervisor = Supervisor::new(
            store,
            locks.clone(),
            Arc::clone(&engine),
            SupervisorOptions::from_config(config),
            cancel.clone(),
        );
        supervisor.hold_activations();
        let preloader = Preloader::from_config(config, Arc::clone(&engine));
        let probe = ConnectionProbe::new(engine, config.engine.probe_timeout());
        let monitor = Arc::new(HealthMonitor::new(Arc::clone(&supervisor), probe));
        let reaper = Reaper::new(ReaperSettings::from_config(config)?, table, locks);

        info!(instance_id, data_dir = %config.data_dir.display(), "orchestrator ready");
        Ok(Self {
            supervisor,
            reaper,
            monitor,
            preloader,
            sessions: config.enabled_sessions(),
            settle_delay: Duration::from_millis(config.startup.settle_delay_ms),
            jobs_delay: Duration::from_millis(config.startup.jobs_delay_ms),
            monitor_interval: Duration::from_secs(config.monitor.interval_seconds),
            shutdown_grace: Duration::from_secs(config.shutdown.grace_seconds),
            cancel,
        })
    }

    /// Session supervisor, available before [`start`](Self::start). It
    /// refuses activations until the reaper has finished.
    #[must_use]
    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    /// Run the startup sequence. `register_jobs` adds external periodic
    /// jobs to the scheduler once sessions are up.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if a periodic job cannot be scheduled.
    pub async fn start<F>(self, register_jobs: F) -> Result<Running>
    where
        F: FnOnce(&mut Scheduler) -> Result<()>,
    {
        let span = info_span!("startup", sessions = self.sessions.len());
        self.run_sequence(register_jobs).instrument(span).await
    }

    async fn run_sequence<F>(mut self, register_jobs: F) -> Result<Running>
    where
        F: FnOnce(&mut Scheduler) -> Result<()>,
    {
        let tracked = self.supervisor.store().tracked_pids().await;
        let reap_report = self.reaper.reap(&tracked).await;
        if let Some(err) = reap_report.partial_error() {
            warn!(%err, "continuing startup after partial cleanup");
        }
        if let Some(preloader) = self.preloader.take() {
            if !self.cancel.is_cancelled() {
                preloader.spawn(&self.supervisor);
            }
        }

        let mut scheduler = Scheduler::new(self.cancel.child_token());
        if !self.pause("settle", self.settle_delay).await {
            return Ok(self.into_running(scheduler, reap_report));
        }

        self.supervisor.open_activations();
        self.activate_all().await;

        if !self.pause("jobs", self.jobs_delay).await {
            return Ok(self.into_running(scheduler, reap_report));
        }

        Arc::clone(&self.monitor).schedule(&mut scheduler, self.monitor_interval)?;
        register_jobs(&mut scheduler)?;
        info!(jobs = scheduler.len(), "startup complete");

        Ok(self.into_running(scheduler, reap_report))
    }

    async fn activate_all(&self) {
        let activations = self.sessions.iter().map(|id| async move {
            let result = self.supervisor.activate(id).await;
            (id, result)
        });

        let mut connected = 0_usize;
        for (id, result) in join_all(activations).await {
            match result {
                Ok(session) => {
                    connected += 1;
                    info!(session_id = %id, pid = ?session.pid(), "session activated");
                }
                Err(err) => warn!(session_id = %id, %err, "session activation failed"),
            }
        }
        info!(connected, total = self.sessions.len(), "session activation finished");
    }

    /// Sleep for `delay` unless shutdown fires first. Returns whether the
    /// full delay elapsed.
    async fn pause(&self, phase: &str, delay: Duration) -> bool {
        info!(phase, delay_ms = delay.as_millis(), "startup delay");
        tokio::select! {
            () = self.cancel.cancelled() => {
                info!(phase, "startup interrupted by shutdown");
                false
            }
            () = tokio::time::sleep(delay) => true,
        }
    }

    fn into_running(self, scheduler: Scheduler, reap_report: ReapReport) -> Running {
        Running {
            supervisor: self.supervisor,
            scheduler,
            reap_report,
            grace: self.shutdown_grace,
        }
    }
}

/// A started supervisor and its periodic jobs.
pub struct Running {
    supervisor: Arc<Supervisor>,
    scheduler: Scheduler,
    reap_report: ReapReport,
    grace: Duration,
}

impl Running {
    /// Session supervisor.
    #[must_use]
    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    /// Scheduler running the monitor and external jobs.
    #[must_use]
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Outcome of the boot-time cleanup.
    #[must_use]
    pub fn reap_report(&self) -> &ReapReport {
        &self.reap_report
    }

    /// Stop periodic jobs, drain recoveries, stop every engine process,
    /// and release every lock.
    pub async fn shutdown(self) {
        info!("shutting down supervisor");
        self.scheduler.shutdown(self.grace).await;
        self.supervisor.shutdown(self.grace).await;
    }
}
