//! Agent session entity and its snapshot form.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::driver::AgentClient;
use crate::models::lifecycle::{next_state, AgentState, LifecycleEvent, TransitionError};

/// One supervised worker process bound to a role.
///
/// Identity fields are immutable; everything that changes lives behind the
/// agent's own lock.
pub struct AgentSession {
    role: String,
    workspace: PathBuf,
    created_at: DateTime<Utc>,
    inner: Mutex<AgentInner>,
}

/// Mutable agent fields, guarded by [`AgentSession`]'s lock.
pub struct AgentInner {
    /// Current lifecycle state.
    pub state: AgentState,
    /// Client handle; `None` until spawn succeeds and after it is taken for close.
    pub client: Option<Arc<dyn AgentClient>>,
    /// Failure description; set only when `state` is `Failed`.
    pub error: Option<String>,
    /// Last activity timestamp.
    pub last_active: DateTime<Utc>,
}

impl AgentInner {
    /// Apply `event`, updating `state` only when the transition is legal.
    ///
    /// # Errors
    ///
    /// Returns the [`TransitionError`] from the state machine.
    pub fn apply(&mut self, event: LifecycleEvent) -> Result<AgentState, TransitionError> {
        let next = next_state(self.state, event)?;
        self.state = next;
        Ok(next)
    }
}

impl AgentSession {
    /// Create an agent in the `Spawning` state.
    #[must_use]
    pub fn new(role: String, workspace: PathBuf, now: DateTime<Utc>) -> Self {
        Self {
            role,
            workspace,
            created_at: now,
            inner: Mutex::new(AgentInner {
                state: AgentState::Spawning,
                client: None,
                error: None,
                last_active: now,
            }),
        }
    }

    /// Role this agent is registered under.
    #[must_use]
    pub fn role(&self) -> &str {
        &self.role
    }

    /// Workspace path handed to the spawned process.
    #[must_use]
    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    /// Creation timestamp.
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Acquire the agent's lock.
    pub async fn lock(&self) -> tokio::sync::MutexGuard<'_, AgentInner> {
        self.inner.lock().await
    }

    /// Owned copy of the agent's current state.
    pub async fn snapshot(&self) -> AgentSnapshot {
        let inner = self.inner.lock().await;
        self.snapshot_locked(&inner)
    }

    /// Build a snapshot from an already-held guard.
    #[must_use]
    pub fn snapshot_locked(&self, inner: &AgentInner) -> AgentSnapshot {
        AgentSnapshot {
            role: self.role.clone(),
            workspace: self.workspace.clone(),
            state: inner.state,
            error: inner.error.clone(),
            created_at: self.created_at,
            last_active: inner.last_active,
        }
    }
}

impl std::fmt::Debug for AgentSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentSession")
            .field("role", &self.role)
            .field("workspace", &self.workspace)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

/// Point-in-time copy of an [`AgentSession`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentSnapshot {
    /// Role within the parent session.
    pub role: String,
    /// Workspace path.
    pub workspace: PathBuf,
    /// Lifecycle state at snapshot time.
    pub state: AgentState,
    /// Recorded failure, if any.
    pub error: Option<String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last activity timestamp.
    pub last_active: DateTime<Utc>,
}
