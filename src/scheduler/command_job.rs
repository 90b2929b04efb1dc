//! Periodic job that runs an external command.
//!
//! Used for work owned by neighbouring systems, such as the ticketing
//! backend's close-inactive-tickets script. The child is spawned with
//! `kill_on_drop(true)` so a timed-out or cancelled run never leaks it.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, info};

use super::Scheduler;
use crate::config::JobConfig;
use crate::{AppError, Result};

/// External command executed on every scheduled run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandJob {
    name: String,
    program: String,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
    interval: Duration,
    timeout: Duration,
}

impl From<&JobConfig> for CommandJob {
    fn from(config: &JobConfig) -> Self {
        Self {
            name: config.name.clone(),
            program: config.command.clone(),
            args: config.args.clone(),
            working_dir: config.working_dir.clone(),
            interval: Duration::from_secs(config.interval_seconds),
            timeout: Duration::from_secs(config.timeout_seconds),
        }
    }
}

impl CommandJob {
    /// Job name used in logs.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Time between runs.
    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Run the command once and wait for it to finish.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Job` if the command cannot be spawned, exceeds its
    /// timeout, or exits unsuccessfully.
    pub async fn run(&self) -> Result<()> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        let child = cmd.spawn().map_err(|err| {
            AppError::Job(format!("{}: failed to spawn {}: {err}", self.name, self.program))
        })?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                AppError::Job(format!(
                    "{}: timed out after {}s",
                    self.name,
                    self.timeout.as_secs()
                ))
            })?
            .map_err(|err| AppError::Job(format!("{}: {err}", self.name)))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !stdout.trim().is_empty() {
            debug!(job = %self.name, output = %stdout.trim(), "job output");
        }

        if output.status.success() {
            info!(job = %self.name, "job run succeeded");
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(AppError::Job(format!(
                "{}: exited with {}: {}",
                self.name,
                output.status,
                stderr.trim()
            )))
        }
    }

    /// Register this job with `scheduler` at its configured interval.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the interval is zero.
    pub fn register(self, scheduler: &mut Scheduler) -> Result<()> {
        let name = self.name.clone();
        let interval = self.interval;
        let job = Arc::new(self);
        scheduler.schedule(&name, interval, move || {
            let job = Arc::clone(&job);
            async move { job.run().await }
        })
    }
}
