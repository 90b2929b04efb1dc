//! In-memory registry of supervised sessions.
//!
//! Every session lives behind its own `tokio::sync::Mutex`, so transitions
//! for one id are strictly serialized while different ids never contend
//! beyond the brief map lookup. All field mutation goes through
//! [`SessionStore::transition`], which validates the state-machine edge
//! before applying the caller's change.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, info};

use crate::models::session::{Session, SessionState};
use crate::{AppError, Result};

/// Capacity of the transition event channel; slow subscribers lag, never block.
const EVENT_CAPACITY: usize = 256;

/// A transition applied by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionEvent {
    /// Session the transition applied to.
    pub session_id: String,
    /// State before the transition.
    pub from: SessionState,
    /// State after the transition.
    pub to: SessionState,
    /// Retry counter after the transition.
    pub retry_count: u32,
    /// When the transition was applied.
    pub at: DateTime<Utc>,
}

#[derive(Default)]
struct Entries {
    order: Vec<String>,
    by_id: HashMap<String, Arc<Mutex<Session>>>,
}

/// Registry of session records keyed by channel id, in insertion order.
pub struct SessionStore {
    entries: RwLock<Entries>,
    events: broadcast::Sender<TransitionEvent>,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore {
    /// Construct an empty store.
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            entries: RwLock::new(Entries::default()),
            events,
        }
    }

    /// Register a new `Initializing` session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::AlreadyExists` if `id` is already registered.
    pub async fn insert(&self, id: &str, lock_path: PathBuf) -> Result<Session> {
        let mut entries = self.entries.write().await;
        if entries.by_id.contains_key(id) {
            return Err(AppError::AlreadyExists(format!("session {id}")));
        }

        let session = Session::new(id.to_owned(), lock_path);
        entries.order.push(id.to_owned());
        entries
            .by_id
            .insert(id.to_owned(), Arc::new(Mutex::new(session.clone())));

        info!(session_id = id, state = %session.state, "session registered");
        Ok(session)
    }

    /// Apply a state transition plus a field mutation atomically.
    ///
    /// `mutate` runs under the session's lock after the edge has been
    /// validated; it cannot change `state`, which is set to `next` afterwards.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown id or
    /// `AppError::InvalidTransition` if the edge is not allowed.
    pub async fn transition<F>(&self, id: &str, next: SessionState, mutate: F) -> Result<Session>
    where
        F: FnOnce(&mut Session),
    {
        self.apply(id, None, next, mutate).await
    }

    /// Like [`transition`](Self::transition), but only if the session is
    /// currently in one of `expected`. Used when the caller's decision was
    /// based on a snapshot that may have gone stale.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown id or
    /// `AppError::InvalidTransition` if the current state is not expected or
    /// the edge is not allowed.
    pub async fn transition_from<F>(
        &self,
        id: &str,
        expected: &[SessionState],
        next: SessionState,
        mutate: F,
    ) -> Result<Session>
    where
        F: FnOnce(&mut Session),
    {
        self.apply(id, Some(expected), next, mutate).await
    }

    async fn apply<F>(
        &self,
        id: &str,
        expected: Option<&[SessionState]>,
        next: SessionState,
        mutate: F,
    ) -> Result<Session>
    where
        F: FnOnce(&mut Session),
    {
        let entry = self.entry(id).await?;
        let mut session = entry.lock().await;
        let from = session.state;

        if let Some(expected) = expected {
            if !expected.contains(&from) {
                return Err(AppError::InvalidTransition(format!(
                    "session {id} is {from}, expected one of {expected:?}"
                )));
            }
        }
        if !session.can_transition_to(next) {
            return Err(AppError::InvalidTransition(format!(
                "session {id}: {from} -> {next}"
            )));
        }

        mutate(&mut *session);
        session.state = next;
        let now = Utc::now();
        if from == next {
            debug!(session_id = id, state = %next, "session updated");
        } else {
            session.changed_at = now;
            info!(
                session_id = id,
                %from,
                to = %next,
                retry_count = session.retry_count,
                "session state changed"
            );
        }

        // No subscribers is fine.
        let _ = self.events.send(TransitionEvent {
            session_id: id.to_owned(),
            from,
            to: next,
            retry_count: session.retry_count,
            at: now,
        });

        Ok(session.clone())
    }

    /// Snapshot of one session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if `id` is not registered.
    pub async fn get(&self, id: &str) -> Result<Session> {
        let entry = self.entry(id).await?;
        let session = entry.lock().await;
        Ok(session.clone())
    }

    /// Snapshots of all sessions in insertion order.
    pub async fn list(&self) -> Vec<Session> {
        let handles: Vec<Arc<Mutex<Session>>> = {
            let entries = self.entries.read().await;
            entries
                .order
                .iter()
                .filter_map(|id| entries.by_id.get(id).cloned())
                .collect()
        };

        let mut sessions = Vec::with_capacity(handles.len());
        for handle in handles {
            sessions.push(handle.lock().await.clone());
        }
        sessions
    }

    /// Drop a `Closed` session from the registry.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown id or
    /// `AppError::InvalidTransition` if the session is not `Closed`.
    pub async fn remove(&self, id: &str) -> Result<()> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .by_id
            .get(id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("session {id}")))?;

        let state = entry.lock().await.state;
        if state != SessionState::Closed {
            return Err(AppError::InvalidTransition(format!(
                "session {id} must be closed before removal, is {state}"
            )));
        }

        entries.by_id.remove(id);
        entries.order.retain(|existing| existing != id);
        info!(session_id = id, "session removed");
        Ok(())
    }

    /// Process ids owned by registered sessions.
    pub async fn tracked_pids(&self) -> Vec<u32> {
        self.list()
            .await
            .iter()
            .filter_map(Session::pid)
            .collect()
    }

    /// Whether `id` is registered.
    pub async fn contains(&self, id: &str) -> bool {
        self.entries.read().await.by_id.contains_key(id)
    }

    /// Number of registered sessions.
    pub async fn len(&self) -> usize {
        self.entries.read().await.order.len()
    }

    /// Whether no session is registered.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Subscribe to every transition applied from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<TransitionEvent> {
        self.events.subscribe()
    }

    async fn entry(&self, id: &str) -> Result<Arc<Mutex<Session>>> {
        self.entries
            .read()
            .await
            .by_id
            .get(id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("session {id}")))
    }
}
