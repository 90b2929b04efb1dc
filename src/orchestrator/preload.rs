//! Shared cache warm-up.
//!
//! With `[engine] preload` set, startup launches one throwaway engine
//! against the shared cache directory, lets it run for a short dwell, and
//! stops it. Sessions activated afterwards find the cache populated. The
//! warm-up runs beside activation and never fails startup.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

use super::supervisor::Supervisor;
use crate::config::GlobalConfig;
use crate::engine::AutomationEngine;
use crate::{AppError, Result};

/// Label passed as the session id of the warm-up launch. It contains a
/// character that session ids may not, so it never collides with one.
pub const PRELOAD_LABEL: &str = "cache.preload";

/// Profile directory of the warm-up engine, relative to `data_dir`.
pub const PRELOAD_PROFILE: &str = "preload-profile";

/// One-off cache warm-up run.
pub struct Preloader {
    engine: Arc<dyn AutomationEngine>,
    timeout: Duration,
    dwell: Duration,
}

impl Preloader {
    /// Build a warm-up from `[engine]`, or `None` when `preload` is off.
    #[must_use]
    pub fn from_config(config: &GlobalConfig, engine: Arc<dyn AutomationEngine>) -> Option<Self> {
        config.engine.preload.then(|| Self {
            engine,
            timeout: config.engine.preload_timeout(),
            dwell: config.engine.preload_dwell(),
        })
    }

    /// Launch, dwell, terminate. Shutdown cuts the dwell short.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the profile cannot be prepared, or
    /// `AppError::Launch` if the engine fails or misses the timeout.
    pub async fn run(&self, supervisor: &Supervisor, cancel: &CancellationToken) -> Result<()> {
        let spec = supervisor.preload_spec(PRELOAD_LABEL, PRELOAD_PROFILE)?;
        let handle = match tokio::time::timeout(self.timeout, self.engine.launch(&spec)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(AppError::Launch(format!(
                    "cache warm-up not ready within {}s",
                    self.timeout.as_secs()
                )))
            }
        };
        info!(pid = handle.pid(), cache_dir = %spec.cache_dir.display(), "cache warm-up engine running");

        tokio::select! {
            () = cancel.cancelled() => info!("cache warm-up cut short by shutdown"),
            () = tokio::time::sleep(self.dwell) => {}
        }
        self.engine.terminate(handle).await;
        Ok(())
    }

    /// Start [`run`](Self::run) on the supervisor's task tracker. Failures
    /// are logged and dropped.
    pub fn spawn(self, supervisor: &Arc<Supervisor>) {
        let owner = Arc::clone(supervisor);
        let cancel = supervisor.cancel_token().clone();
        supervisor.spawn_tracked(
            async move {
                match self.run(&owner, &cancel).await {
                    Ok(()) => info!("cache warm-up finished"),
                    Err(err) => warn!(%err, "cache warm-up failed, sessions start with a cold cache"),
                }
            }
            .instrument(info_span!("preload")),
        );
    }
}
