//! Protocol-agnostic agent client abstraction.
//!
//! The orchestrator never talks to a process directly. It asks a
//! [`ClientFactory`] for an [`AgentClient`] per workspace and only ever
//! calls the two trait methods, so tests can substitute in-memory clients
//! without spawning anything.

pub mod acp_driver;

use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::acp::client::AcpClient;
use crate::acp::protocol::AgentMessage;
use crate::Result;

/// Boxed future returned by the capability traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A running agent that accepts serialized calls.
pub trait AgentClient: Send + Sync {
    /// Send user content and wait for the reply.
    ///
    /// # Errors
    ///
    /// Implementation-defined; see [`AcpClient::send_message`].
    fn send_message<'a>(
        &'a self,
        content: &'a str,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<AgentMessage>>;

    /// Shut the agent down. Must be idempotent.
    ///
    /// # Errors
    ///
    /// Implementation-defined; see [`AcpClient::close`].
    fn close(&self) -> BoxFuture<'_, Result<()>>;
}

/// Produces a working client for a workspace.
pub trait ClientFactory: Send + Sync {
    /// Start an agent for `workspace`.
    ///
    /// # Errors
    ///
    /// Any error means the agent did not start; the orchestrator records it
    /// on the agent and marks it failed.
    fn new_client<'a>(&'a self, workspace: &'a Path) -> BoxFuture<'a, Result<Arc<dyn AgentClient>>>;
}

impl AgentClient for AcpClient {
    fn send_message<'a>(
        &'a self,
        content: &'a str,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<AgentMessage>> {
        Box::pin(AcpClient::send_message(self, content, cancel))
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(AcpClient::close(self))
    }
}
