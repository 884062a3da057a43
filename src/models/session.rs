//! User session entity and its snapshot form.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::connection::Connection;
use crate::models::agent::{AgentSession, AgentSnapshot};

/// Lifecycle status for a user session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum UserSessionState {
    /// Session accepts new agents and calls.
    Active,
    /// Session torn down; about to leave the store.
    Terminated,
}

impl UserSessionState {
    /// Determine whether a lifecycle transition is permitted.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!((self, next), (Self::Active, Self::Terminated))
    }
}

/// One client's workspace container.
pub struct UserSession {
    id: String,
    created_at: DateTime<Utc>,
    connection: Arc<dyn Connection>,
    inner: Mutex<UserSessionInner>,
    torn_down: CancellationToken,
}

/// Mutable session fields, guarded by [`UserSession`]'s lock.
pub struct UserSessionInner {
    /// Current lifecycle status.
    pub state: UserSessionState,
    /// Last activity timestamp.
    pub last_active: DateTime<Utc>,
    /// Agents keyed by role.
    pub agents: HashMap<String, Arc<AgentSession>>,
}

impl UserSession {
    /// Construct an `Active` session with no agents.
    #[must_use]
    pub fn new(id: String, connection: Arc<dyn Connection>, now: DateTime<Utc>) -> Self {
        Self {
            id,
            created_at: now,
            connection,
            inner: Mutex::new(UserSessionInner {
                state: UserSessionState::Active,
                last_active: now,
                agents: HashMap::new(),
            }),
            torn_down: CancellationToken::new(),
        }
    }

    /// Session identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Creation timestamp.
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Shared handle to the client's duplex channel. Owned by the transport.
    #[must_use]
    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.connection
    }

    /// Acquire the session's lock.
    pub async fn lock(&self) -> tokio::sync::MutexGuard<'_, UserSessionInner> {
        self.inner.lock().await
    }

    /// Latch for the caller that moved the session to `Terminated`.
    ///
    /// Dropping the guard releases every [`torn_down`](Self::torn_down)
    /// waiter, including when the teardown future itself is dropped.
    #[must_use]
    pub fn teardown_guard(&self) -> DropGuard {
        self.torn_down.clone().drop_guard()
    }

    /// Resolves once the teardown holding [`teardown_guard`](Self::teardown_guard)
    /// has finished.
    pub async fn torn_down(&self) {
        self.torn_down.cancelled().await;
    }

    /// Owned copy of the session and all of its agents, sorted by role.
    ///
    /// The agent handles are cloned out first so no agent lock is taken
    /// while the session lock is held longer than needed.
    pub async fn snapshot(&self) -> UserSessionSnapshot {
        let (state, last_active, agents) = {
            let inner = self.inner.lock().await;
            let agents: Vec<Arc<AgentSession>> = inner.agents.values().cloned().collect();
            (inner.state, inner.last_active, agents)
        };

        let mut snapshots = Vec::with_capacity(agents.len());
        for agent in agents {
            snapshots.push(agent.snapshot().await);
        }
        snapshots.sort_by(|a, b| a.role.cmp(&b.role));

        UserSessionSnapshot {
            id: self.id.clone(),
            state,
            created_at: self.created_at,
            last_active,
            agents: snapshots,
        }
    }
}

impl std::fmt::Debug for UserSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserSession")
            .field("id", &self.id)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

/// Point-in-time copy of a [`UserSession`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserSessionSnapshot {
    /// Session identifier.
    pub id: String,
    /// Lifecycle status at snapshot time.
    pub state: UserSessionState,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last activity timestamp.
    pub last_active: DateTime<Utc>,
    /// Agents, sorted by role.
    pub agents: Vec<AgentSnapshot>,
}
