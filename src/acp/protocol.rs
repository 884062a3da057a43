//! Wire types for the client ↔ agent call/response protocol.
//!
//! Every call is one newline-terminated JSON object:
//!
//! ```json
//! {"id":1,"method":"message/send","params":{"content":"hello"}}
//! ```
//!
//! and every answer is one line carrying the same `id` and either a
//! `result` or an `error`:
//!
//! ```json
//! {"id":1,"result":{"content":"hi"}}
//! {"id":1,"error":{"code":-32601,"message":"method not found"}}
//! ```

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{AppError, Result};

/// The one method this client issues.
pub const SEND_MESSAGE_METHOD: &str = "message/send";

/// Outbound request envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcRequest {
    /// Correlation identifier, unique per client.
    pub id: u64,
    /// Method name.
    pub method: String,
    /// Method parameters.
    pub params: Value,
}

impl RpcRequest {
    /// Build a [`SEND_MESSAGE_METHOD`] request carrying user content.
    #[must_use]
    pub fn send_message(id: u64, content: &str) -> Self {
        Self {
            id,
            method: SEND_MESSAGE_METHOD.to_owned(),
            params: serde_json::json!({ "content": content }),
        }
    }
}

/// Inbound response envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcResponse {
    /// Correlation identifier echoed from the request.
    pub id: u64,
    /// Successful payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Failure payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

/// Structured error returned by the agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcError {
    /// Numeric error code.
    pub code: i64,
    /// Human-readable message.
    pub message: String,
    /// Optional extra detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Display for RpcError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "code {}: {}", self.code, self.message)
    }
}

/// Agent reply content: plain text or an arbitrary JSON structure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum MessageContent {
    /// Plain text reply.
    Text(String),
    /// Structured reply (tool output, blocks, etc.).
    Structured(Value),
}

impl MessageContent {
    /// Text body, if this is a plain text reply.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Structured(_) => None,
        }
    }
}

/// Decoded `result` payload of a [`SEND_MESSAGE_METHOD`] call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentMessage {
    /// Reply content.
    pub content: MessageContent,
    /// Optional metadata the agent attached.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// Decode one response line for the call identified by `expected_id`.
///
/// The line arrives as raw bytes straight from the framing layer, so UTF-8
/// is checked here along with the envelope.
///
/// # Errors
///
/// - [`AppError::MalformedResponse`] if the line is not valid UTF-8, is not
///   a response envelope, carries neither `result` nor `error`, or `result`
///   is not an [`AgentMessage`]. The original line is kept in `raw`, with
///   invalid byte sequences replaced by U+FFFD.
/// - [`AppError::Acp`] if the response `id` does not match `expected_id`.
/// - [`AppError::Remote`] if the agent returned an `error` envelope.
pub fn parse_response(line: impl AsRef<[u8]>, expected_id: u64) -> Result<AgentMessage> {
    let bytes = line.as_ref();
    let line = std::str::from_utf8(bytes).map_err(|e| AppError::MalformedResponse {
        reason: format!("invalid utf-8: {e}"),
        raw: String::from_utf8_lossy(bytes).into_owned(),
    })?;

    let response: RpcResponse =
        serde_json::from_str(line).map_err(|e| AppError::MalformedResponse {
            reason: format!("invalid response envelope: {e}"),
            raw: line.to_owned(),
        })?;

    if response.id != expected_id {
        return Err(AppError::Acp(format!(
            "response id mismatch: expected {expected_id}, got {}",
            response.id
        )));
    }

    if let Some(err) = response.error {
        return Err(AppError::Remote(err));
    }

    let Some(result) = response.result else {
        return Err(AppError::MalformedResponse {
            reason: "response has neither result nor error".into(),
            raw: line.to_owned(),
        });
    };

    serde_json::from_value(result).map_err(|e| AppError::MalformedResponse {
        reason: format!("invalid agent message: {e}"),
        raw: line.to_owned(),
    })
}
