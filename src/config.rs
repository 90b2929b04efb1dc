//! Global configuration parsing and validation.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;

use crate::models::session::validate_session_id;
use crate::{AppError, Result};

/// Automation engine launch and probe settings.
///
/// `args` are handed to the engine verbatim (sandboxing flags and the like).
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct EngineConfig {
    /// Browser binary to launch.
    #[serde(default = "default_engine_binary")]
    pub binary: String,
    /// Extra arguments passed through to the engine.
    #[serde(default = "default_engine_args")]
    pub args: Vec<String>,
    /// Time allowed for the engine to signal readiness after spawn.
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_seconds: u64,
    /// Liveness probe timeout.
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_seconds: u64,
    /// Grace period between SIGTERM and SIGKILL when stopping a process.
    #[serde(default = "default_terminate_grace")]
    pub terminate_grace_seconds: u64,
    /// First port handed out to sessions without an explicit `debug_port`.
    #[serde(default = "default_debug_port_base")]
    pub debug_port_base: u16,
    /// Launch a throwaway engine at startup to warm the shared cache.
    #[serde(default)]
    pub preload: bool,
    /// Time allowed for the warm-up engine to come up.
    #[serde(default = "default_preload_timeout")]
    pub preload_timeout_seconds: u64,
    /// How long the warm-up engine runs before it is stopped.
    #[serde(default = "default_preload_dwell")]
    pub preload_dwell_ms: u64,
}

fn default_engine_binary() -> String {
    "chromium".into()
}

fn default_engine_args() -> Vec<String> {
    [
        "--headless=new",
        "--no-sandbox",
        "--disable-setuid-sandbox",
        "--disable-dev-shm-usage",
        "--disable-gpu",
        "--disable-extensions",
        "--no-first-run",
    ]
    .into_iter()
    .map(str::to_owned)
    .collect()
}

fn default_startup_timeout() -> u64 {
    60
}

fn default_probe_timeout() -> u64 {
    5
}

fn default_terminate_grace() -> u64 {
    5
}

fn default_debug_port_base() -> u16 {
    9222
}

fn default_preload_timeout() -> u64 {
    60
}

fn default_preload_dwell() -> u64 {
    3000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            binary: default_engine_binary(),
            args: default_engine_args(),
            startup_timeout_seconds: default_startup_timeout(),
            probe_timeout_seconds: default_probe_timeout(),
            terminate_grace_seconds: default_terminate_grace(),
            debug_port_base: default_debug_port_base(),
            preload: false,
            preload_timeout_seconds: default_preload_timeout(),
            preload_dwell_ms: default_preload_dwell(),
        }
    }
}

impl EngineConfig {
    /// Readiness window after spawning a process.
    #[must_use]
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_seconds)
    }

    /// Liveness probe timeout.
    #[must_use]
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_seconds)
    }

    /// SIGTERM-to-SIGKILL grace period.
    #[must_use]
    pub fn terminate_grace(&self) -> Duration {
        Duration::from_secs(self.terminate_grace_seconds)
    }

    /// Readiness window of the warm-up engine.
    #[must_use]
    pub fn preload_timeout(&self) -> Duration {
        Duration::from_secs(self.preload_timeout_seconds)
    }

    /// Lifetime of the warm-up engine once it is ready.
    #[must_use]
    pub fn preload_dwell(&self) -> Duration {
        Duration::from_millis(self.preload_dwell_ms)
    }
}

/// Startup sequencing delays.
///
/// The defaults are the values measured against the browser engine's
/// resource-release latency; change them only with new measurements.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct StartupConfig {
    /// Pause between the reaper finishing and the first session activation.
    #[serde(default = "default_settle_delay")]
    pub settle_delay_ms: u64,
    /// Pause between session activation and starting periodic jobs.
    #[serde(default = "default_jobs_delay")]
    pub jobs_delay_ms: u64,
}

fn default_settle_delay() -> u64 {
    5000
}

fn default_jobs_delay() -> u64 {
    3000
}

impl Default for StartupConfig {
    fn default() -> Self {
        Self {
            settle_delay_ms: default_settle_delay(),
            jobs_delay_ms: default_jobs_delay(),
        }
    }
}

/// Health monitor cadence and concurrency.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct MonitorConfig {
    /// Seconds between health ticks.
    #[serde(default = "default_monitor_interval")]
    pub interval_seconds: u64,
    /// Maximum launches (activations plus recoveries) running at once.
    /// Probes have a cap of the same size of their own.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
}

fn default_monitor_interval() -> u64 {
    30
}

fn default_max_concurrency() -> usize {
    4
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_monitor_interval(),
            max_concurrency: default_max_concurrency(),
        }
    }
}

/// Recovery backoff policy.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct RecoveryConfig {
    /// Consecutive failed recoveries before switching to the cooldown.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay before the first retry; doubles on every further failure.
    #[serde(default = "default_base_backoff")]
    pub base_backoff_ms: u64,
    /// Upper bound for the exponential delay.
    #[serde(default = "default_max_backoff")]
    pub max_backoff_seconds: u64,
    /// Wait applied once the retry budget is exhausted.
    #[serde(default = "default_cooldown")]
    pub cooldown_seconds: u64,
}

fn default_max_retries() -> u32 {
    5
}

fn default_base_backoff() -> u64 {
    2000
}

fn default_max_backoff() -> u64 {
    120
}

fn default_cooldown() -> u64 {
    900
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_backoff_ms: default_base_backoff(),
            max_backoff_seconds: default_max_backoff(),
            cooldown_seconds: default_cooldown(),
        }
    }
}

/// Boot-time cleanup settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ReaperConfig {
    /// Total time the reaper may spend before returning a partial report.
    #[serde(default = "default_reap_budget")]
    pub time_budget_seconds: u64,
    /// Wait between SIGTERM and SIGKILL for orphaned processes.
    #[serde(default = "default_kill_grace")]
    pub kill_grace_ms: u64,
    /// Extra command-line regexes identifying engine processes. Processes
    /// whose command line mentions `data_dir` always match.
    #[serde(default)]
    pub process_patterns: Vec<String>,
    /// Engine-internal lock files removed from stale profile directories.
    #[serde(default = "default_stale_artifacts")]
    pub stale_artifacts: Vec<String>,
}

fn default_reap_budget() -> u64 {
    15
}

fn default_kill_grace() -> u64 {
    2000
}

fn default_stale_artifacts() -> Vec<String> {
    vec![
        "SingletonLock".into(),
        "SingletonCookie".into(),
        "SingletonSocket".into(),
    ]
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            time_budget_seconds: default_reap_budget(),
            kill_grace_ms: default_kill_grace(),
            process_patterns: Vec::new(),
            stale_artifacts: default_stale_artifacts(),
        }
    }
}

impl ReaperConfig {
    /// Compile `process_patterns`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if any pattern is not a valid regex.
    pub fn compiled_patterns(&self) -> Result<Vec<Regex>> {
        self.process_patterns
            .iter()
            .map(|pattern| {
                Regex::new(pattern).map_err(|err| {
                    AppError::Config(format!("invalid reaper pattern '{pattern}': {err}"))
                })
            })
            .collect()
    }
}

/// Graceful shutdown settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ShutdownConfig {
    /// Time allowed for in-flight work to settle before processes are stopped.
    #[serde(default = "default_shutdown_grace")]
    pub grace_seconds: u64,
}

fn default_shutdown_grace() -> u64 {
    10
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_seconds: default_shutdown_grace(),
        }
    }
}

/// One supervised messaging channel.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SessionConfig {
    /// Channel identifier; also names the lock and profile paths.
    pub id: String,
    /// Fixed liveness port; allocated from `debug_port_base` when absent.
    #[serde(default)]
    pub debug_port: Option<u16>,
    /// Whether the channel is activated at startup.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// External periodic job run through the shared scheduler.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct JobConfig {
    /// Job name used in logs.
    pub name: String,
    /// Program to execute.
    pub command: String,
    /// Program arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Seconds between runs.
    pub interval_seconds: u64,
    /// Maximum run time before the job is killed and counted as failed.
    #[serde(default = "default_job_timeout")]
    pub timeout_seconds: u64,
    /// Working directory for the program.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

fn default_job_timeout() -> u64 {
    300
}

fn default_ipc_name() -> String {
    "channel-supervisor".into()
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Storage root holding lock artifacts and per-session profiles.
    pub data_dir: PathBuf,
    /// Shared engine cache directory; `<data_dir>/cache` when absent.
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
    /// Named pipe / Unix socket identifier for the admin IPC server.
    #[serde(default = "default_ipc_name")]
    pub ipc_name: String,
    /// Shared secret required on admin IPC requests, when set.
    #[serde(default)]
    pub ipc_auth_token: Option<String>,
    /// Engine launch settings.
    #[serde(default)]
    pub engine: EngineConfig,
    /// Startup delays.
    #[serde(default)]
    pub startup: StartupConfig,
    /// Health monitor settings.
    #[serde(default)]
    pub monitor: MonitorConfig,
    /// Recovery backoff policy.
    #[serde(default)]
    pub recovery: RecoveryConfig,
    /// Boot-time cleanup settings.
    #[serde(default)]
    pub reaper: ReaperConfig,
    /// Graceful shutdown settings.
    #[serde(default)]
    pub shutdown: ShutdownConfig,
    /// Supervised channels.
    #[serde(default)]
    pub sessions: Vec<SessionConfig>,
    /// External periodic jobs.
    #[serde(default)]
    pub jobs: Vec<JobConfig>,
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string and normalize paths.
    ///
    /// Creates `data_dir` when it does not exist yet.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Effective cache directory.
    #[must_use]
    pub fn cache_dir(&self) -> PathBuf {
        self.cache_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("cache"))
    }

    /// Identifiers of channels activated at startup, in configuration order.
    #[must_use]
    pub fn enabled_sessions(&self) -> Vec<String> {
        self.sessions
            .iter()
            .filter(|s| s.enabled)
            .map(|s| s.id.clone())
            .collect()
    }

    fn validate(&mut self) -> Result<()> {
        if self.monitor.interval_seconds == 0 {
            return Err(AppError::Config(
                "monitor.interval_seconds must be greater than zero".into(),
            ));
        }

        if self.monitor.max_concurrency == 0 {
            return Err(AppError::Config(
                "monitor.max_concurrency must be greater than zero".into(),
            ));
        }

        if self.recovery.max_retries == 0 {
            return Err(AppError::Config(
                "recovery.max_retries must be greater than zero".into(),
            ));
        }

        if self.recovery.base_backoff_ms == 0 {
            return Err(AppError::Config(
                "recovery.base_backoff_ms must be greater than zero".into(),
            ));
        }

        let mut seen = HashSet::new();
        for session in &self.sessions {
            validate_session_id(&session.id)?;
            if !seen.insert(session.id.as_str()) {
                return Err(AppError::Config(format!(
                    "duplicate session id '{}'",
                    session.id
                )));
            }
        }

        let mut job_names = HashSet::new();
        for job in &self.jobs {
            if job.interval_seconds == 0 {
                return Err(AppError::Config(format!(
                    "job '{}' interval_seconds must be greater than zero",
                    job.name
                )));
            }
            if !job_names.insert(job.name.as_str()) {
                return Err(AppError::Config(format!("duplicate job name '{}'", job.name)));
            }
        }

        self.reaper.compiled_patterns()?;

        fs::create_dir_all(&self.data_dir)
            .map_err(|err| AppError::Config(format!("data_dir cannot be created: {err}")))?;
        self.data_dir = self
            .data_dir
            .canonicalize()
            .map_err(|err| AppError::Config(format!("data_dir invalid: {err}")))?;

        Ok(())
    }
}
