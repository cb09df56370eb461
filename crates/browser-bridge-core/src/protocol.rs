//! Wire envelopes exchanged with the browser agent.
//!
//! Inbound command shapes are normalized here, at ingress, so nothing past
//! this module ever sees the legacy/direct distinction.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::error::CallError;

/// Envelope type of the legacy command shape.
pub const LEGACY_COMMAND_TYPE: &str = "CallToolRequest";
/// Envelope type of an agent result.
pub const TOOL_RESULT_TYPE: &str = "ToolResult";
/// Envelope type of an agent capability report.
pub const CAPABILITIES_TYPE: &str = "capabilities";

/// Correlation token linking a command to its result.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    /// Generate a fresh, unique id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for RequestId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// First frame sent by an agent, as far as the handshake cares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthFrame {
    /// A JSON object with a string `token` field.
    Token(String),
    /// Anything else: not JSON, not an object, or no string token.
    Malformed,
}

impl AuthFrame {
    /// Classify the first text frame of a connection.
    #[must_use]
    pub fn parse(text: &str) -> Self {
        match serde_json::from_str::<Value>(text) {
            Ok(Value::Object(fields)) => match fields.get("token") {
                Some(Value::String(token)) => Self::Token(token.clone()),
                _ => Self::Malformed,
            },
            _ => Self::Malformed,
        }
    }
}

/// Which envelope shape the bridge emits for commands.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandFormat {
    /// `{type: "CallToolRequest", id, payload: {name, arguments}}`
    #[default]
    Legacy,
    /// `{type: <toolName>, id, payload: <arguments>}`
    Direct,
}

/// Canonical command sent to the agent.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentCommand {
    pub id: RequestId,
    pub name: String,
    pub arguments: Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    id: RequestId,
    #[serde(default)]
    payload: Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct LegacyPayload {
    name: String,
    #[serde(default)]
    arguments: Value,
}

/// Command envelope decoding error.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("Invalid command envelope: {0}")]
    Invalid(#[from] serde_json::Error),
}

impl AgentCommand {
    /// Encode in the requested envelope shape.
    ///
    /// # Errors
    /// Returns error if the arguments cannot be serialized.
    pub fn encode(&self, format: CommandFormat) -> Result<String, serde_json::Error> {
        let envelope = match format {
            CommandFormat::Legacy => RawEnvelope {
                kind: LEGACY_COMMAND_TYPE.to_string(),
                id: self.id.clone(),
                payload: serde_json::to_value(LegacyPayload {
                    name: self.name.clone(),
                    arguments: self.arguments.clone(),
                })?,
            },
            CommandFormat::Direct => RawEnvelope {
                kind: self.name.clone(),
                id: self.id.clone(),
                payload: self.arguments.clone(),
            },
        };
        serde_json::to_string(&envelope)
    }

    /// Decode either accepted envelope shape into the canonical command.
    ///
    /// This is the agent side of the codec; the bridge only encodes
    /// commands, and in-process test agents use this to read them.
    ///
    /// # Errors
    /// Returns error if the text is not a command envelope.
    pub fn decode(text: &str) -> Result<Self, EnvelopeError> {
        let raw: RawEnvelope = serde_json::from_str(text)?;
        if raw.kind == LEGACY_COMMAND_TYPE {
            let payload: LegacyPayload = serde_json::from_value(raw.payload)?;
            Ok(Self {
                id: raw.id,
                name: payload.name,
                arguments: payload.arguments,
            })
        } else {
            Ok(Self {
                id: raw.id,
                name: raw.kind,
                arguments: raw.payload,
            })
        }
    }
}

/// Self-description an agent may report after authenticating.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentCapabilities {
    #[serde(default)]
    pub extension: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub features: Vec<String>,
}

/// Message from the agent after authentication.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum AgentMessage {
    /// Result of a previously sent command.
    #[serde(rename = "ToolResult")]
    ToolResult {
        #[serde(rename = "requestId")]
        request_id: RequestId,
        #[serde(default)]
        result: Value,
    },
    /// Capability report.
    #[serde(rename = "capabilities")]
    Capabilities { data: AgentCapabilities },
}

/// Inbound message decoding error.
#[derive(Debug, Error)]
pub enum InboundError {
    #[error("Malformed agent message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("Unknown agent message type: {0}")]
    UnknownType(String),
}

impl AgentMessage {
    /// Parse a text frame received from the agent.
    ///
    /// # Errors
    /// Returns error for malformed JSON or an unrecognised `type`.
    pub fn parse(text: &str) -> Result<Self, InboundError> {
        let value: Value = serde_json::from_str(text)?;
        let kind = value.get("type").and_then(Value::as_str).map(str::to_owned);
        match kind.as_deref() {
            Some(TOOL_RESULT_TYPE | CAPABILITIES_TYPE) => Ok(serde_json::from_value(value)?),
            Some(other) => Err(InboundError::UnknownType(other.to_string())),
            None => Err(InboundError::UnknownType("<missing>".to_string())),
        }
    }
}

/// Encode a result envelope, as an agent would.
///
/// Agent side of the codec, used by test agents driving a real socket.
///
/// # Errors
/// Returns error if the result cannot be serialized.
pub fn encode_tool_result(request_id: &RequestId, result: &Value) -> Result<String, serde_json::Error> {
    let mut fields = Map::new();
    fields.insert("type".into(), Value::String(TOOL_RESULT_TYPE.into()));
    fields.insert("requestId".into(), serde_json::to_value(request_id)?);
    fields.insert("result".into(), result.clone());
    serde_json::to_string(&Value::Object(fields))
}

/// Split an agent result into success payload or tool failure.
///
/// An object whose `error` field is a string is a failure report.
pub fn result_outcome(result: Value) -> Result<Value, CallError> {
    match result.get("error") {
        Some(Value::String(message)) => Err(CallError::Tool(message.clone())),
        _ => Ok(result),
    }
}
