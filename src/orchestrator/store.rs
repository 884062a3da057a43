//! In-memory repository of user sessions.
//!
//! The map is the only globally shared structure in the orchestrator and is
//! guarded by a single reader/writer lock. Session contents are guarded by
//! each session's own lock, so the store lock is never held while a session
//! is being mutated.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::models::session::{UserSession, UserSessionSnapshot, UserSessionState};
use crate::{AppError, Result};

/// Thread-safe repository of [`UserSession`]s keyed by id.
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: RwLock<HashMap<String, Arc<UserSession>>>,
}

impl SessionStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Conflict` if a session with the same id exists.
    pub async fn create(&self, session: Arc<UserSession>) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(session.id()) {
            return Err(AppError::Conflict(format!(
                "session {} already exists",
                session.id()
            )));
        }
        sessions.insert(session.id().to_owned(), session);
        Ok(())
    }

    /// Look up a session handle by id.
    pub async fn get(&self, id: &str) -> Option<Arc<UserSession>> {
        self.sessions.read().await.get(id).cloned()
    }

    /// Snapshot every session, optionally keeping only those in `filter`
    /// state. Ordered by creation time, then id.
    pub async fn list(&self, filter: Option<UserSessionState>) -> Vec<UserSessionSnapshot> {
        // Release the map lock before touching any session lock.
        let handles: Vec<Arc<UserSession>> = self.sessions.read().await.values().cloned().collect();

        let mut snapshots = Vec::with_capacity(handles.len());
        for handle in handles {
            let snapshot = handle.snapshot().await;
            if filter.is_some_and(|state| snapshot.state != state) {
                continue;
            }
            snapshots.push(snapshot);
        }
        snapshots.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        snapshots
    }

    /// Remove a session. Returns whether anything was removed.
    pub async fn delete(&self, id: &str) -> bool {
        self.sessions.write().await.remove(id).is_some()
    }

    /// Number of stored sessions.
    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Handles of every stored session.
    pub(crate) async fn handles(&self) -> Vec<Arc<UserSession>> {
        self.sessions.read().await.values().cloned().collect()
    }
}
