//! Agent lifecycle state machine.
//!
//! Transitions are pure: no locking, no I/O. Callers hold the owning
//! entity's lock while applying the result.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

/// Lifecycle state of a single agent session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    /// Registered; the client factory has not returned yet.
    Spawning,
    /// Client is running and accepting calls.
    Active,
    /// Spawn failed; kept for diagnosis.
    Failed,
    /// Explicitly removed.
    Terminated,
}

impl AgentState {
    /// Whether no further transition is possible from this state.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Terminated)
    }

    /// Lowercase wire name of the state.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Spawning => "spawning",
            Self::Active => "active",
            Self::Failed => "failed",
            Self::Terminated => "terminated",
        }
    }
}

impl Display for AgentState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events that drive agent state transitions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleEvent {
    /// Client factory returned a working client.
    Activate,
    /// Client factory (or workspace setup) failed.
    Fail,
    /// Agent removed by an explicit stop or a parent teardown.
    Terminate,
}

impl LifecycleEvent {
    /// Lowercase wire name of the event.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Activate => "activate",
            Self::Fail => "fail",
            Self::Terminate => "terminate",
        }
    }
}

impl Display for LifecycleEvent {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rejected transition, naming the state, the attempted event, and why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionError {
    /// State the agent was in when the event arrived.
    pub from: AgentState,
    /// Event that was rejected.
    pub event: LifecycleEvent,
    /// Human-readable reason.
    pub reason: &'static str,
}

impl Display for TransitionError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "cannot apply '{}' to agent in state '{}': {}",
            self.event, self.from, self.reason
        )
    }
}

impl std::error::Error for TransitionError {}

/// Compute the state that follows `current` when `event` is applied.
///
/// # Errors
///
/// Returns [`TransitionError`] when `current` is terminal or the pair has no
/// defined transition. The caller's state is left unchanged.
pub fn next_state(
    current: AgentState,
    event: LifecycleEvent,
) -> std::result::Result<AgentState, TransitionError> {
    match (current, event) {
        (AgentState::Spawning, LifecycleEvent::Activate) => Ok(AgentState::Active),
        (AgentState::Spawning, LifecycleEvent::Fail) => Ok(AgentState::Failed),
        (AgentState::Active, LifecycleEvent::Terminate) => Ok(AgentState::Terminated),
        (AgentState::Failed | AgentState::Terminated, _) => Err(TransitionError {
            from: current,
            event,
            reason: "state is terminal",
        }),
        (AgentState::Spawning, LifecycleEvent::Terminate) => Err(TransitionError {
            from: current,
            event,
            reason: "spawn has not completed",
        }),
        (AgentState::Active, LifecycleEvent::Activate | LifecycleEvent::Fail) => {
            Err(TransitionError {
                from: current,
                event,
                reason: "agent is already running",
            })
        }
    }
}
