//! Chromium-family browser engine.
//!
//! Spawns one headless browser per session with:
//! - `kill_on_drop(true)` so a dropped handle never leaks a process.
//! - The session's profile and the shared cache passed as
//!   `--user-data-dir` / `--disk-cache-dir`.
//! - A remote-debugging port used as the liveness endpoint.
//!
//! A launch is confirmed once the browser prints its `DevTools listening on`
//! line to stderr within the startup timeout. Liveness is an HTTP GET of
//! `/json/version` on the debugging port.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{ChildStderr, Command};
use tracing::{debug, info, warn};

use super::{AutomationEngine, EngineFuture, LaunchSpec, ProcessHandle};
use crate::config::EngineConfig;
use crate::models::verdict::Verdict;
use crate::process_table;
use crate::{AppError, Result};

/// Stderr marker the browser prints once its debugging endpoint is up.
const READY_MARKER: &str = "DevTools listening on";

/// Environment variable carrying the session id into the browser process.
const SESSION_ENV: &str = "CHANNEL_SUPERVISOR_SESSION_ID";

/// Browser engine driven through its command line and debugging endpoint.
pub struct ChromiumEngine {
    config: EngineConfig,
    http: reqwest::Client,
}

impl ChromiumEngine {
    /// Build an engine from configuration.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the HTTP client cannot be constructed.
    pub fn new(config: EngineConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .no_proxy()
            .build()
            .map_err(|err| AppError::Config(format!("failed to build http client: {err}")))?;
        Ok(Self { config, http })
    }

    async fn spawn(&self, spec: &LaunchSpec) -> Result<ProcessHandle> {
        let mut cmd = Command::new(&self.config.binary);
        cmd.args(&self.config.args)
            .arg(format!("--user-data-dir={}", spec.profile_dir.display()))
            .arg(format!("--disk-cache-dir={}", spec.cache_dir.display()))
            .arg(format!("--remote-debugging-port={}", spec.debug_port))
            .env(SESSION_ENV, &spec.session_id)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|err| {
            AppError::Launch(format!("failed to spawn {}: {err}", self.config.binary))
        })?;

        let pid = child
            .id()
            .ok_or_else(|| AppError::Launch("engine exited immediately after spawn".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| AppError::Launch("failed to capture engine stderr".into()))?;
        let mut lines = BufReader::new(stderr).lines();

        let startup_timeout = self.config.startup_timeout();
        let failure = match tokio::time::timeout(startup_timeout, wait_for_ready(&mut lines)).await
        {
            Ok(Ok(true)) => None,
            Ok(Ok(false)) => Some("engine exited before ready signal".to_owned()),
            Ok(Err(err)) => Some(format!("failed to read engine stderr: {err}")),
            Err(_) => Some(format!(
                "startup timeout: no ready signal within {}s",
                startup_timeout.as_secs()
            )),
        };

        if let Some(reason) = failure {
            if let Err(err) = child.kill().await {
                warn!(session_id = %spec.session_id, pid, %err, "failed to kill engine after failed launch");
            }
            return Err(AppError::Launch(reason));
        }

        // Keep draining stderr so a chatty browser never blocks on a full pipe.
        let session_id = spec.session_id.clone();
        tokio::spawn(async move {
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(session_id, line, "engine stderr");
            }
        });

        info!(
            session_id = %spec.session_id,
            pid,
            debug_port = spec.debug_port,
            "engine process launched"
        );

        Ok(ProcessHandle::spawned(
            pid,
            child,
            Some(format!("http://127.0.0.1:{}", spec.debug_port)),
        ))
    }

    async fn probe(&self, handle: &ProcessHandle, timeout: Duration) -> Verdict {
        if let Some(child) = handle.child() {
            match child.lock().await.try_wait() {
                Ok(Some(status)) => {
                    debug!(pid = handle.pid(), ?status, "engine process has exited");
                    return Verdict::Crashed;
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(pid = handle.pid(), %err, "failed to poll engine process status");
                    return Verdict::Crashed;
                }
            }
        } else if !process_table::pid_alive(handle.pid()) {
            return Verdict::Crashed;
        }

        let Some(endpoint) = handle.endpoint() else {
            return Verdict::Healthy;
        };

        let url = format!("{endpoint}/json/version");
        match tokio::time::timeout(timeout, self.http.get(&url).send()).await {
            Ok(Ok(response)) if response.status().is_success() => Verdict::Healthy,
            Ok(Ok(response)) => {
                debug!(pid = handle.pid(), status = %response.status(), "liveness endpoint returned error");
                Verdict::Unresponsive
            }
            Ok(Err(err)) => {
                debug!(pid = handle.pid(), %err, "liveness request failed");
                Verdict::Unresponsive
            }
            Err(_) => Verdict::Unresponsive,
        }
    }

    async fn stop(&self, handle: ProcessHandle) {
        let pid = handle.pid();
        let Some(child) = handle.child() else {
            if let Err(err) = process_table::send_kill(pid) {
                warn!(pid, %err, "failed to kill external engine process");
            }
            return;
        };

        let mut process = child.lock().await;
        if let Ok(Some(status)) = process.try_wait() {
            debug!(pid, ?status, "engine process already exited");
            return;
        }

        if let Err(err) = process_table::send_terminate(pid) {
            warn!(pid, %err, "failed to signal engine process");
        }

        let grace = self.config.terminate_grace();
        match tokio::time::timeout(grace, process.wait()).await {
            Ok(Ok(status)) => info!(pid, ?status, "engine process exited"),
            Ok(Err(err)) => warn!(pid, %err, "error waiting for engine process"),
            Err(_) => {
                warn!(pid, "engine process did not exit within grace period, forcing kill");
                if let Err(err) = process.kill().await {
                    warn!(pid, %err, "failed to force-kill engine process");
                }
            }
        }
    }
}

impl AutomationEngine for ChromiumEngine {
    fn launch<'a>(&'a self, spec: &'a LaunchSpec) -> EngineFuture<'a, Result<ProcessHandle>> {
        Box::pin(self.spawn(spec))
    }

    fn probe_liveness<'a>(
        &'a self,
        handle: &'a ProcessHandle,
        timeout: Duration,
    ) -> EngineFuture<'a, Verdict> {
        Box::pin(self.probe(handle, timeout))
    }

    fn terminate(&self, handle: ProcessHandle) -> EngineFuture<'_, ()> {
        Box::pin(self.stop(handle))
    }
}

/// Read stderr until the ready marker appears. `Ok(false)` means EOF first.
async fn wait_for_ready(lines: &mut Lines<BufReader<ChildStderr>>) -> std::io::Result<bool> {
    while let Some(line) = lines.next_line().await? {
        if line.contains(READY_MARKER) {
            return Ok(true);
        }
        debug!(line, "engine stderr before ready");
    }
    Ok(false)
}
