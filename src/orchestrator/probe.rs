//! Connection probe for a single session.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::AutomationEngine;
use crate::models::session::Session;
use crate::models::verdict::Verdict;
use crate::AppError;

/// Asks the engine whether a session's process is alive, within a fixed timeout.
///
/// Probing never mutates the session; callers apply the verdict.
#[derive(Clone)]
pub struct ConnectionProbe {
    engine: Arc<dyn AutomationEngine>,
    timeout: Duration,
}

impl ConnectionProbe {
    /// Build a probe that gives each check at most `timeout`.
    #[must_use]
    pub fn new(engine: Arc<dyn AutomationEngine>, timeout: Duration) -> Self {
        Self { engine, timeout }
    }

    /// Configured per-probe timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Probe `session`. A session without a process handle is `Crashed`.
    pub async fn probe(&self, session: &Session) -> Verdict {
        let Some(handle) = session.process.as_ref() else {
            debug!(session_id = %session.id, "no process handle, treating as crashed");
            return Verdict::Crashed;
        };

        let verdict = match tokio::time::timeout(
            self.timeout,
            self.engine.probe_liveness(handle, self.timeout),
        )
        .await
        {
            Ok(verdict) => verdict,
            Err(_) => {
                let err = AppError::ProbeTimeout(format!(
                    "session {} did not answer within {}ms",
                    session.id,
                    self.timeout.as_millis()
                ));
                warn!(session_id = %session.id, %err, "probe timed out");
                Verdict::Unresponsive
            }
        };

        if verdict == Verdict::Healthy {
            debug!(session_id = %session.id, %verdict, "probe completed");
        } else {
            info!(session_id = %session.id, state = %session.state, %verdict, "probe completed");
        }
        verdict
    }
}
