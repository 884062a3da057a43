//! Duplex channel back to the interactive client.
//!
//! The transport layer owns the concrete connection and its framing; the
//! lifecycle core only keeps a shared handle on each user session and never
//! closes it during teardown.

use serde_json::Value;

use crate::driver::BoxFuture;
use crate::Result;

/// Opaque duplex channel supplied by the transport.
pub trait Connection: Send + Sync {
    /// Send a value to the client.
    ///
    /// # Errors
    ///
    /// Transport-defined; the core does not interpret them.
    fn send(&self, value: Value) -> BoxFuture<'_, Result<()>>;

    /// Receive the next raw frame from the client.
    ///
    /// # Errors
    ///
    /// Transport-defined; the core does not interpret them.
    fn receive(&self) -> BoxFuture<'_, Result<Vec<u8>>>;

    /// Close the channel.
    ///
    /// # Errors
    ///
    /// Transport-defined; the core does not interpret them.
    fn close(&self) -> BoxFuture<'_, Result<()>>;
}
