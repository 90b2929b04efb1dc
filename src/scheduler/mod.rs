//! Shared periodic-job runner.
//!
//! Each job registered through [`Scheduler::schedule`] runs on its own
//! fixed cadence in a dedicated task. Job errors and panics are caught
//! and logged; they never stop the job's loop or the scheduler. Every
//! loop holds a clone of the scheduler's `CancellationToken`, and
//! [`Scheduler::shutdown`] awaits all of them.

pub mod command_job;

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures_util::FutureExt;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::{AppError, Result};

/// Handle of one scheduled job's loop.
struct ScheduledJob {
    name: String,
    handle: JoinHandle<()>,
}

/// Owner of every periodic task in the process.
pub struct Scheduler {
    cancel: CancellationToken,
    jobs: Vec<ScheduledJob>,
}

impl Scheduler {
    /// Create a scheduler whose jobs stop when `cancel` fires.
    #[must_use]
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            jobs: Vec::new(),
        }
    }

    /// Register `job` to run every `interval`, starting immediately.
    ///
    /// Runs of the same job never overlap; a run that outlasts the interval
    /// delays the next one instead of bunching up.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if `interval` is zero.
    pub fn schedule<F, Fut>(&mut self, name: &str, interval: Duration, job: F) -> Result<()>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        if interval.is_zero() {
            return Err(AppError::Config(format!(
                "job '{name}' interval must be greater than zero"
            )));
        }

        let cancel = self.cancel.clone();
        let job_name = name.to_owned();
        let handle = tokio::spawn(
            async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                let mut consecutive_failures: u32 = 0;

                loop {
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        _ = ticker.tick() => {}
                    }

                    let outcome = tokio::select! {
                        () = cancel.cancelled() => break,
                        outcome = AssertUnwindSafe(job()).catch_unwind() => outcome,
                    };

                    match outcome {
                        Ok(Ok(())) => {
                            if consecutive_failures > 0 {
                                info!(
                                    prev_failures = consecutive_failures,
                                    "scheduled job recovered"
                                );
                            }
                            consecutive_failures = 0;
                            debug!("scheduled job completed");
                        }
                        Ok(Err(err)) => {
                            consecutive_failures = consecutive_failures.saturating_add(1);
                            error!(%err, consecutive_failures, "scheduled job failed");
                        }
                        Err(_) => {
                            consecutive_failures = consecutive_failures.saturating_add(1);
                            error!(consecutive_failures, "scheduled job panicked");
                        }
                    }
                }

                info!("scheduled job shutting down");
            }
            .instrument(info_span!("scheduled_job", job = %job_name)),
        );

        info!(job = name, interval_ms = interval.as_millis(), "job scheduled");
        self.jobs.push(ScheduledJob {
            name: name.to_owned(),
            handle,
        });
        Ok(())
    }

    /// Names of registered jobs, in registration order.
    #[must_use]
    pub fn job_names(&self) -> Vec<&str> {
        self.jobs.iter().map(|job| job.name.as_str()).collect()
    }

    /// Number of registered jobs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    /// Whether no job is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Stop scheduling and wait up to `grace` for each job loop to exit.
    pub async fn shutdown(self, grace: Duration) {
        self.cancel.cancel();
        for job in self.jobs {
            match tokio::time::timeout(grace, job.handle).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(job = %job.name, %err, "scheduled job task failed"),
                Err(_) => warn!(job = %job.name, "scheduled job did not stop within grace period"),
            }
        }
    }
}
