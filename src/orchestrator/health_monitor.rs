//! Periodic health monitor.
//!
//! Every tick snapshots the session store, probes the `Connected` and
//! `Degraded` sessions in parallel (bounded by the supervisor's probe cap),
//! applies the resulting transitions, and hands unhealthy sessions to the
//! supervisor as independent recovery tasks. A failure in one session never
//! affects another session's transitions.
//!
//! Probes draw from their own permits, never from the launch cap, and a
//! probe that cannot get a permit within the probe timeout is skipped for
//! this tick. A recovery stuck in a slow launch therefore never delays the
//! probing of other sessions.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::future::join_all;
use tracing::{debug, info, warn};

use super::probe::ConnectionProbe;
use super::supervisor::Supervisor;
use crate::models::session::{Session, SessionState};
use crate::models::verdict::Verdict;
use crate::scheduler::Scheduler;
use crate::Result;

/// Job name under which the monitor is registered with the scheduler.
pub const JOB_NAME: &str = "health_monitor";

/// Counters describing one monitor tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    /// Sessions in the store when the tick started.
    pub sessions: usize,
    /// Sessions probed.
    pub probed: usize,
    /// Probes answering `Healthy`.
    pub healthy: usize,
    /// Probes answering `Unresponsive`.
    pub unresponsive: usize,
    /// Probes answering `Crashed`.
    pub crashed: usize,
    /// Recovery tasks started by this tick.
    pub recoveries_dispatched: usize,
    /// Sessions left alone (work in flight, backoff pending, held, or no
    /// probe slot free within the probe timeout).
    pub skipped: usize,
}

/// Walks the session store on a fixed cadence.
pub struct HealthMonitor {
    supervisor: Arc<Supervisor>,
    probe: ConnectionProbe,
}

impl HealthMonitor {
    /// Create a monitor driving `supervisor` with `probe`.
    #[must_use]
    pub fn new(supervisor: Arc<Supervisor>, probe: ConnectionProbe) -> Self {
        Self { supervisor, probe }
    }

    /// Run one health pass over every session.
    pub async fn tick(&self) -> TickSummary {
        let sessions = self.supervisor.store().list().await;
        let mut summary = TickSummary {
            sessions: sessions.len(),
            ..TickSummary::default()
        };
        if sessions.is_empty() {
            debug!("no sessions to monitor");
            return summary;
        }

        let now = Utc::now();
        let mut to_probe = Vec::new();
        for session in sessions {
            let recovering = self.supervisor.is_recovering(&session.id);
            match session.state {
                SessionState::Connected | SessionState::Degraded if !recovering => {
                    to_probe.push(session);
                }
                SessionState::Crashed if !recovering && session.recovery_due(now) => {
                    if self.supervisor.dispatch_recovery(&session.id) {
                        summary.recoveries_dispatched += 1;
                    } else {
                        summary.skipped += 1;
                    }
                }
                _ => summary.skipped += 1,
            }
        }

        let slot_wait = self.probe.timeout();
        let probes = to_probe.into_iter().map(|session| async move {
            let Ok(Ok(_permit)) =
                tokio::time::timeout(slot_wait, self.supervisor.probe_permit()).await
            else {
                debug!(session_id = %session.id, "no probe slot within timeout, skipping");
                return (session, None);
            };
            let verdict = self.probe.probe(&session).await;
            (session, Some(verdict))
        });

        for (session, verdict) in join_all(probes).await {
            let Some(verdict) = verdict else {
                summary.skipped += 1;
                continue;
            };
            summary.probed += 1;
            match verdict {
                Verdict::Healthy => summary.healthy += 1,
                Verdict::Unresponsive => summary.unresponsive += 1,
                Verdict::Crashed => summary.crashed += 1,
            }
            if self.apply(&session, verdict).await {
                summary.recoveries_dispatched += 1;
            }
        }

        debug!(?summary, "health tick completed");
        summary
    }

    /// Apply one verdict. Returns whether a recovery was dispatched.
    async fn apply(&self, session: &Session, verdict: Verdict) -> bool {
        let store = self.supervisor.store();
        let id = session.id.as_str();
        let observed = [session.state];

        let result = match (session.state, verdict) {
            (SessionState::Degraded, Verdict::Unresponsive) => {
                info!(session_id = id, %verdict, "session still unresponsive, recovering");
                return self.supervisor.dispatch_recovery(id);
            }
            (SessionState::Connected | SessionState::Degraded, Verdict::Healthy) => {
                let now = Utc::now();
                store
                    .transition_from(id, &observed, SessionState::Connected, |s| {
                        s.last_heartbeat_at = Some(now);
                    })
                    .await
            }
            (SessionState::Connected, Verdict::Unresponsive) => {
                store
                    .transition_from(id, &observed, SessionState::Degraded, |_| {})
                    .await
            }
            (SessionState::Connected | SessionState::Degraded, Verdict::Crashed) => {
                let policy = *self.supervisor.policy();
                store
                    .transition_from(id, &observed, SessionState::Crashed, |s| {
                        s.next_attempt_at = Some(policy.next_attempt_at(Utc::now(), s.retry_count));
                        s.last_error = Some("engine process is not running".into());
                    })
                    .await
            }
            _ => return false,
        };

        if let Err(err) = result {
            // The session moved on since the snapshot; the next tick sees it fresh.
            debug!(session_id = id, %verdict, %err, "verdict not applied");
        }
        false
    }

    /// Register the monitor with `scheduler`, ticking every `interval`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if `interval` is zero.
    pub fn schedule(self: Arc<Self>, scheduler: &mut Scheduler, interval: Duration) -> Result<()> {
        scheduler.schedule(JOB_NAME, interval, move || {
            let monitor = Arc::clone(&self);
            async move {
                let summary = monitor.tick().await;
                if summary.crashed > 0 || summary.unresponsive > 0 {
                    warn!(
                        crashed = summary.crashed,
                        unresponsive = summary.unresponsive,
                        recoveries = summary.recoveries_dispatched,
                        "unhealthy sessions detected"
                    );
                }
                Ok(())
            }
        })
    }
}
