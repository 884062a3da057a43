//! User session and agent lifecycle orchestration.
//!
//! The manager composes the store, the client factory, the cleaner, a clock,
//! and an id generator into the public lifecycle API.
//!
//! # Locking
//!
//! Every mutation takes only the target entity's own lock, session before
//! agent, for the shortest possible section. No lock is ever held across a
//! call into a collaborator (`new_client`, `close`, `send_message`,
//! `cleanup`), so a slow agent never stalls unrelated sessions.
//!
//! # Failure isolation
//!
//! An agent whose spawn fails is marked `Failed` with its error recorded and
//! stays queryable; the parent session and sibling agents are untouched.
//! Termination paths never fail because a collaborator did: close and
//! cleanup errors are logged and swallowed.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::acp::protocol::AgentMessage;
use crate::config::GlobalConfig;
use crate::connection::Connection;
use crate::driver::{AgentClient, ClientFactory};
use crate::models::agent::{AgentSession, AgentSnapshot};
use crate::models::lifecycle::{AgentState, LifecycleEvent};
use crate::models::session::{UserSession, UserSessionSnapshot, UserSessionState};
use crate::orchestrator::hooks::{
    Cleaner, Clock, IdGenerator, NoopCleaner, SystemClock, UuidGenerator,
};
use crate::orchestrator::store::SessionStore;
use crate::{AppError, Result};

/// Default per-agent bound during session teardown.
pub const DEFAULT_AGENT_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Builder for [`Manager`]. Only the client factory is required.
#[derive(Default)]
pub struct ManagerBuilder {
    store: Option<Arc<SessionStore>>,
    factory: Option<Arc<dyn ClientFactory>>,
    cleaner: Option<Arc<dyn Cleaner>>,
    clock: Option<Arc<dyn Clock>>,
    ids: Option<Arc<dyn IdGenerator>>,
    agent_close_timeout: Option<Duration>,
}

impl ManagerBuilder {
    /// Empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder pre-populated with timeouts from configuration.
    #[must_use]
    pub fn from_config(config: &GlobalConfig) -> Self {
        Self::new().agent_close_timeout(config.agent_close_timeout())
    }

    /// Set the client factory (required).
    #[must_use]
    pub fn client_factory(mut self, factory: Arc<dyn ClientFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Set the post-termination hook. Defaults to [`NoopCleaner`].
    #[must_use]
    pub fn cleaner(mut self, cleaner: Arc<dyn Cleaner>) -> Self {
        self.cleaner = Some(cleaner);
        self
    }

    /// Set the clock. Defaults to [`SystemClock`].
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Set the id generator. Defaults to [`UuidGenerator`].
    #[must_use]
    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    /// Use an existing store. Defaults to a fresh [`SessionStore`].
    #[must_use]
    pub fn store(mut self, store: Arc<SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the per-agent teardown bound.
    #[must_use]
    pub fn agent_close_timeout(mut self, timeout: Duration) -> Self {
        self.agent_close_timeout = Some(timeout);
        self
    }

    /// Build the manager.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if no client factory was supplied or the
    /// close timeout is zero.
    pub fn build(self) -> Result<Manager> {
        let factory = self
            .factory
            .ok_or_else(|| AppError::Config("manager requires a client factory".into()))?;

        let agent_close_timeout = self
            .agent_close_timeout
            .unwrap_or(DEFAULT_AGENT_CLOSE_TIMEOUT);
        if agent_close_timeout.is_zero() {
            return Err(AppError::Config(
                "agent close timeout must be greater than zero".into(),
            ));
        }

        Ok(Manager {
            store: self.store.unwrap_or_default(),
            factory,
            cleaner: self.cleaner.unwrap_or_else(|| Arc::new(NoopCleaner)),
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            ids: self.ids.unwrap_or_else(|| Arc::new(UuidGenerator)),
            agent_close_timeout,
        })
    }
}

/// Public lifecycle API over user sessions and their agents.
pub struct Manager {
    store: Arc<SessionStore>,
    factory: Arc<dyn ClientFactory>,
    cleaner: Arc<dyn Cleaner>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    agent_close_timeout: Duration,
}

impl Manager {
    /// Start building a manager.
    #[must_use]
    pub fn builder() -> ManagerBuilder {
        ManagerBuilder::new()
    }

    /// Per-agent teardown bound in effect.
    #[must_use]
    pub fn agent_close_timeout(&self) -> Duration {
        self.agent_close_timeout
    }

    /// Open a new, empty user session bound to `connection`.
    ///
    /// # Errors
    ///
    /// - `AppError::InvalidInput` if `connection` is `None`.
    /// - `AppError::Cancelled` if `cancel` already fired.
    /// - `AppError::Conflict` if the id generator repeats an id.
    pub async fn create_user_session(
        &self,
        cancel: &CancellationToken,
        connection: Option<Arc<dyn Connection>>,
    ) -> Result<UserSessionSnapshot> {
        let connection = connection
            .ok_or_else(|| AppError::InvalidInput("connection handle is required".into()))?;
        ensure_not_cancelled(cancel, "create_user_session")?;

        let session = Arc::new(UserSession::new(
            self.ids.next_id(),
            connection,
            self.clock.now(),
        ));
        self.store.create(Arc::clone(&session)).await?;

        info!(session_id = session.id(), "user session created");
        Ok(session.snapshot().await)
    }

    /// Register `role` in the session and start its agent in `workspace`.
    ///
    /// The agent is visible as `Spawning` before the factory is called and
    /// ends up `Active` or `Failed`.
    ///
    /// # Errors
    ///
    /// - `AppError::InvalidInput` for a blank role or workspace.
    /// - `AppError::NotFound` if the session does not exist.
    /// - `AppError::InvalidState` if the session is not active, or the agent
    ///   was removed while spawning.
    /// - `AppError::Conflict` if the role already exists.
    /// - `AppError::Spawn` if the workspace or client could not be created;
    ///   the agent is left `Failed`.
    /// - `AppError::Cancelled` if `cancel` fired; the agent is left `Failed`.
    pub async fn spawn_agent(
        &self,
        cancel: &CancellationToken,
        session_id: &str,
        role: &str,
        workspace: impl AsRef<Path>,
    ) -> Result<()> {
        let workspace = workspace.as_ref();
        if role.trim().is_empty() {
            return Err(AppError::InvalidInput("role must not be empty".into()));
        }
        if workspace.as_os_str().is_empty() {
            return Err(AppError::InvalidInput("workspace must not be empty".into()));
        }
        ensure_not_cancelled(cancel, "spawn_agent")?;

        let span = info_span!("spawn_agent", session_id, role);
        self.spawn_agent_inner(cancel, session_id, role, workspace)
            .instrument(span)
            .await
    }

    async fn spawn_agent_inner(
        &self,
        cancel: &CancellationToken,
        session_id: &str,
        role: &str,
        workspace: &Path,
    ) -> Result<()> {
        let session = self.require_session(session_id).await?;

        let agent = {
            let mut inner = session.lock().await;
            if inner.state != UserSessionState::Active {
                return Err(AppError::InvalidState(format!(
                    "session {session_id} is not active"
                )));
            }
            if inner.agents.contains_key(role) {
                return Err(AppError::Conflict(format!(
                    "agent {role} already exists in session {session_id}"
                )));
            }

            let now = self.clock.now();
            let agent = Arc::new(AgentSession::new(
                role.to_owned(),
                workspace.to_path_buf(),
                now,
            ));
            inner.agents.insert(role.to_owned(), Arc::clone(&agent));
            inner.last_active = now;
            agent
        };
        debug!(workspace = %workspace.display(), "agent registered as spawning");

        if let Err(err) = create_workspace(workspace).await {
            let message = format!(
                "failed to create workspace {}: {err}",
                workspace.display()
            );
            self.fail_agent(&agent, &message).await;
            return Err(AppError::Spawn(message));
        }

        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(AppError::Cancelled(format!("spawn of agent {role} cancelled"))),
            result = self.factory.new_client(workspace) => result,
        };

        match outcome {
            Ok(client) => self.activate_agent(&session, &agent, client).await,
            Err(err) => {
                self.fail_agent(&agent, &err.to_string()).await;
                match err {
                    AppError::Cancelled(_) | AppError::Spawn(_) => Err(err),
                    other => Err(AppError::Spawn(other.to_string())),
                }
            }
        }
    }

    /// Snapshot one agent.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the session or role is missing.
    pub async fn get_agent(
        &self,
        _cancel: &CancellationToken,
        session_id: &str,
        role: &str,
    ) -> Result<AgentSnapshot> {
        let agent = self.require_agent(session_id, role).await?;
        Ok(agent.snapshot().await)
    }

    /// Snapshot every agent in a session, sorted by role.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the session is missing.
    pub async fn list_agents(
        &self,
        _cancel: &CancellationToken,
        session_id: &str,
    ) -> Result<Vec<AgentSnapshot>> {
        let session = self.require_session(session_id).await?;
        Ok(session.snapshot().await.agents)
    }

    /// Snapshot one session, or `None` if it does not exist.
    pub async fn get_session(
        &self,
        _cancel: &CancellationToken,
        session_id: &str,
    ) -> Option<UserSessionSnapshot> {
        match self.store.get(session_id).await {
            Some(session) => Some(session.snapshot().await),
            None => None,
        }
    }

    /// Send `content` to the agent registered under `role` and return its
    /// reply.
    ///
    /// # Errors
    ///
    /// - `AppError::NotFound` if the session or role is missing.
    /// - `AppError::InvalidState` if the agent is not active.
    /// - Any error from the agent client, unchanged.
    pub async fn send_to_agent(
        &self,
        cancel: &CancellationToken,
        session_id: &str,
        role: &str,
        content: &str,
    ) -> Result<AgentMessage> {
        let agent = self.require_agent(session_id, role).await?;

        let client = {
            let inner = agent.lock().await;
            if inner.state != AgentState::Active {
                return Err(AppError::InvalidState(format!(
                    "agent {role} is {}",
                    inner.state
                )));
            }
            inner.client.clone()
        }
        .ok_or_else(|| AppError::InvalidState(format!("agent {role} has no client")))?;

        let reply = client.send_message(content, cancel).await?;

        let now = self.clock.now();
        agent.lock().await.last_active = now;
        if let Some(session) = self.store.get(session_id).await {
            session.lock().await.last_active = now;
        }
        Ok(reply)
    }

    /// Stop one agent. Missing sessions and roles count as already stopped.
    ///
    /// # Errors
    ///
    /// Never fails today; close errors are logged.
    pub async fn terminate_agent(
        &self,
        _cancel: &CancellationToken,
        session_id: &str,
        role: &str,
    ) -> Result<()> {
        let Some(session) = self.store.get(session_id).await else {
            debug!(session_id, role, "terminate_agent: session already gone");
            return Ok(());
        };

        let now = self.clock.now();
        let agent = {
            let mut inner = session.lock().await;
            let removed = inner.agents.remove(role);
            if removed.is_some() {
                inner.last_active = now;
            }
            removed
        };

        let Some(agent) = agent else {
            debug!(session_id, role, "terminate_agent: agent already gone");
            return Ok(());
        };

        if let Some(client) = retire_agent(&agent, now).await {
            if let Err(err) = client.close().await {
                warn!(session_id, role, %err, "agent close failed during termination");
            }
        }

        info!(session_id, role, "agent terminated");
        Ok(())
    }

    /// Tear down a session and all of its agents, then drop it from the
    /// store. A missing session is a no-op.
    ///
    /// Agents are closed concurrently, each under its own timeout; one that
    /// does not finish in time is abandoned and logged when it completes.
    /// A caller that finds a teardown already in progress waits for it, so
    /// on `Ok(())` the session is always gone from the store.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Cancelled` only if `cancel` fires while waiting on
    /// another caller's teardown. Close and cleanup errors are logged.
    pub async fn terminate_user_session(
        &self,
        cancel: &CancellationToken,
        session_id: &str,
    ) -> Result<()> {
        let span = info_span!("terminate_user_session", session_id);
        self.terminate_user_session_inner(cancel, session_id)
            .instrument(span)
            .await
    }

    async fn terminate_user_session_inner(
        &self,
        cancel: &CancellationToken,
        session_id: &str,
    ) -> Result<()> {
        let Some(session) = self.store.get(session_id).await else {
            debug!("session already gone");
            return Ok(());
        };

        let now = self.clock.now();
        let claimed = {
            let mut inner = session.lock().await;
            if inner.state.can_transition_to(UserSessionState::Terminated) {
                inner.state = UserSessionState::Terminated;
                inner.last_active = now;
                let agents: Vec<Arc<AgentSession>> =
                    inner.agents.drain().map(|(_, agent)| agent).collect();
                Some((agents, inner.last_active, session.teardown_guard()))
            } else {
                None
            }
        };

        let Some((agents, last_active, _teardown)) = claimed else {
            debug!("session already terminating; waiting for teardown");
            return tokio::select! {
                biased;
                () = cancel.cancelled() => Err(AppError::Cancelled(
                    "terminate_user_session cancelled waiting for teardown".into(),
                )),
                () = session.torn_down() => Ok(()),
            };
        };

        let mut agent_snapshots = Vec::with_capacity(agents.len());
        let mut closes = Vec::with_capacity(agents.len());
        for agent in &agents {
            if let Some(client) = retire_agent(agent, now).await {
                closes.push(close_with_deadline(
                    agent.role().to_owned(),
                    client,
                    self.agent_close_timeout,
                ));
            }
            agent_snapshots.push(agent.snapshot().await);
        }
        join_all(closes).await;
        agent_snapshots.sort_by(|a, b| a.role.cmp(&b.role));

        let snapshot = UserSessionSnapshot {
            id: session.id().to_owned(),
            state: UserSessionState::Terminated,
            created_at: session.created_at(),
            last_active,
            agents: agent_snapshots,
        };
        if let Err(err) = self.cleaner.cleanup(cancel, &snapshot).await {
            warn!(%err, "session cleanup failed");
        }

        self.store.delete(session_id).await;
        info!(agents = agents.len(), "user session terminated");
        Ok(())
    }

    /// Refresh the session's last-activity timestamp.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the session is missing.
    pub async fn record_heartbeat(
        &self,
        _cancel: &CancellationToken,
        session_id: &str,
    ) -> Result<()> {
        let session = self.require_session(session_id).await?;
        session.lock().await.last_active = self.clock.now();
        Ok(())
    }

    /// Snapshot sessions, optionally filtered by state.
    pub async fn list(
        &self,
        _cancel: &CancellationToken,
        filter: Option<UserSessionState>,
    ) -> Vec<UserSessionSnapshot> {
        self.store.list(filter).await
    }

    /// Number of live sessions.
    pub async fn count(&self, _cancel: &CancellationToken) -> usize {
        self.store.count().await
    }

    /// Terminate every session concurrently. Used when the host exits.
    pub async fn shutdown(&self, cancel: &CancellationToken) {
        let sessions = self.store.handles().await;
        info!(sessions = sessions.len(), "shutting down all user sessions");

        let teardowns = sessions.iter().map(|session| async move {
            if let Err(err) = self.terminate_user_session(cancel, session.id()).await {
                warn!(session_id = session.id(), %err, "session teardown failed during shutdown");
            }
        });
        join_all(teardowns).await;
    }

    async fn require_session(&self, session_id: &str) -> Result<Arc<UserSession>> {
        self.store
            .get(session_id)
            .await
            .ok_or_else(|| AppError::NotFound(format!("session {session_id} not found")))
    }

    async fn require_agent(&self, session_id: &str, role: &str) -> Result<Arc<AgentSession>> {
        let session = self.require_session(session_id).await?;
        let agent = session.lock().await.agents.get(role).cloned();
        agent.ok_or_else(|| {
            AppError::NotFound(format!("agent {role} not found in session {session_id}"))
        })
    }

    async fn activate_agent(
        &self,
        session: &UserSession,
        agent: &Arc<AgentSession>,
        client: Arc<dyn AgentClient>,
    ) -> Result<()> {
        let rejected = {
            let mut inner = session.lock().await;
            let registered = inner.state == UserSessionState::Active
                && inner
                    .agents
                    .get(agent.role())
                    .is_some_and(|current| Arc::ptr_eq(current, agent));

            if registered {
                let now = self.clock.now();
                let mut state = agent.lock().await;
                match state.apply(LifecycleEvent::Activate) {
                    Ok(_) => {
                        state.client = Some(Arc::clone(&client));
                        state.last_active = now;
                        inner.last_active = now;
                        None
                    }
                    Err(err) => Some(AppError::from(err)),
                }
            } else {
                Some(AppError::InvalidState(format!(
                    "agent {} was terminated while spawning",
                    agent.role()
                )))
            }
        };

        if let Some(err) = rejected {
            warn!(%err, "discarding freshly spawned client");
            if let Err(close_err) = client.close().await {
                warn!(%close_err, "failed to close discarded client");
            }
            return Err(err);
        }

        info!("agent active");
        Ok(())
    }

    async fn fail_agent(&self, agent: &AgentSession, message: &str) {
        let mut state = agent.lock().await;
        match state.apply(LifecycleEvent::Fail) {
            Ok(_) => {
                state.error = Some(message.to_owned());
                state.last_active = self.clock.now();
                warn!(error = message, "agent spawn failed");
            }
            Err(err) => debug!(%err, error = message, "spawn failure on agent that already moved on"),
        }
    }
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("store", &self.store)
            .field("agent_close_timeout", &self.agent_close_timeout)
            .finish_non_exhaustive()
    }
}

/// Take the client out of `agent` and apply `Terminate`.
///
/// Agents that are `Failed` or still `Spawning` keep their state; the
/// client is taken regardless so close runs at most once.
async fn retire_agent(
    agent: &AgentSession,
    now: chrono::DateTime<chrono::Utc>,
) -> Option<Arc<dyn AgentClient>> {
    let mut state = agent.lock().await;
    let client = state.client.take();
    if let Err(err) = state.apply(LifecycleEvent::Terminate) {
        debug!(role = agent.role(), %err, "agent keeps its state on removal");
    }
    state.last_active = now;
    client
}

/// Close `client` in its own task and wait at most `timeout` for it.
///
/// A close that overruns is detached, not cancelled; its eventual outcome
/// is logged.
async fn close_with_deadline(role: String, client: Arc<dyn AgentClient>, timeout: Duration) {
    let mut handle = tokio::spawn(async move { client.close().await });

    match tokio::time::timeout(timeout, &mut handle).await {
        Ok(Ok(Ok(()))) => debug!(role = %role, "agent closed"),
        Ok(Ok(Err(err))) => warn!(role = %role, %err, "agent close failed"),
        Ok(Err(err)) => warn!(role = %role, %err, "agent close task failed"),
        Err(_) => {
            warn!(role = %role, ?timeout, "agent close timed out; abandoning");
            tokio::spawn(
                async move {
                    match handle.await {
                        Ok(Ok(())) => info!("abandoned agent close completed late"),
                        Ok(Err(err)) => warn!(%err, "abandoned agent close failed late"),
                        Err(err) => warn!(%err, "abandoned agent close task failed"),
                    }
                }
                .instrument(info_span!("late_close", role = %role)),
            );
        }
    }
}

/// Create `path` (and parents) if missing; owner rwx, group rx on unix.
async fn create_workspace(path: &Path) -> std::io::Result<()> {
    let mut builder = tokio::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    builder.mode(0o750);
    builder.create(path).await
}

fn ensure_not_cancelled(cancel: &CancellationToken, operation: &str) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(AppError::Cancelled(format!("{operation} cancelled")));
    }
    Ok(())
}
