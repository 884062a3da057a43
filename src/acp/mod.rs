//! Agent Client Protocol (ACP) client over a child process's stdio.
//!
//! Requests and responses are newline-delimited JSON. Calls on one client
//! are strictly serialized: at most one request is in flight, and the next
//! caller waits until the previous response has been read.
//!
//! - `codec`: bounded newline framing that skips oversized lines.
//! - `protocol`: request/response envelopes and the reply payload.
//! - `spawner`: process spawning with environment isolation.
//! - `diagnostics`: stderr drain into tracing.
//! - `client`: the serialized call/response client itself.

pub mod client;
pub mod codec;
pub mod diagnostics;
pub mod protocol;
pub mod spawner;
