//! Error types shared across the application.

use std::fmt::{Display, Formatter};

use crate::acp::protocol::RpcError;
use crate::models::lifecycle::TransitionError;

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure, or a manager built
    /// without a required collaborator.
    Config(String),
    /// Caller supplied an unusable argument (missing connection, blank role).
    InvalidInput(String),
    /// Requested session or agent does not exist.
    NotFound(String),
    /// Operation is not permitted in the entity's current state.
    InvalidState(String),
    /// Entity with the same identity already exists.
    Conflict(String),
    /// Agent lifecycle transition rejected by the state machine.
    Transition(TransitionError),
    /// Agent process or client failed to start.
    Spawn(String),
    /// ACP protocol violation (id mismatch, oversized line, poisoned stream).
    Acp(String),
    /// Response line could not be decoded; `raw` keeps the original bytes.
    MalformedResponse {
        /// Decoder error description.
        reason: String,
        /// The offending line exactly as received.
        raw: String,
    },
    /// Agent answered with a structured error envelope.
    Remote(RpcError),
    /// Agent process exited or closed its output before responding.
    ProcessExited(String),
    /// Client was closed; no further calls are accepted.
    ClientClosed,
    /// Caller cancelled the operation.
    Cancelled(String),
    /// File-system or process I/O failure.
    Io(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::InvalidState(msg) => write!(f, "invalid state: {msg}"),
            Self::Conflict(msg) => write!(f, "conflict: {msg}"),
            Self::Transition(err) => write!(f, "transition: {err}"),
            Self::Spawn(msg) => write!(f, "spawn: {msg}"),
            Self::Acp(msg) => write!(f, "acp: {msg}"),
            Self::MalformedResponse { reason, raw } => {
                write!(f, "malformed response: {reason} (raw: {raw})")
            }
            Self::Remote(err) => write!(f, "remote: {err}"),
            Self::ProcessExited(msg) => write!(f, "process exited: {msg}"),
            Self::ClientClosed => write!(f, "client is closed"),
            Self::Cancelled(msg) => write!(f, "cancelled: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<TransitionError> for AppError {
    fn from(err: TransitionError) -> Self {
        Self::Transition(err)
    }
}
