//! Error taxonomy shared by every layer of the bridge.

use std::{fmt, time::Duration};

use thiserror::Error;

use crate::protocol::RequestId;

/// Why a connection stopped serving its in-flight requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossReason {
    /// A newer agent authenticated and took over.
    Superseded,
    /// The agent socket closed.
    Closed,
    /// The bridge itself is shutting down.
    ShuttingDown,
}

impl fmt::Display for LossReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Superseded => "connection superseded",
            Self::Closed => "connection closed",
            Self::ShuttingDown => "shutting down",
        })
    }
}

/// Failure of a single correlated round trip to the agent.
#[derive(Debug, Clone, Error)]
pub enum CallError {
    #[error("No authenticated browser agent connection")]
    NoConnection,
    #[error("Connection lost: {0}")]
    ConnectionLost(LossReason),
    #[error("No response from the browser agent within {0:?}")]
    Timeout(Duration),
    #[error("{0}")]
    Tool(String),
    #[error("Request id already in flight: {0}")]
    DuplicateRequest(RequestId),
    #[error("Failed to encode command: {0}")]
    Encode(String),
}

impl CallError {
    /// Whether the failure came from the action itself rather than the plumbing.
    #[must_use]
    pub const fn is_tool_failure(&self) -> bool {
        matches!(self, Self::Tool(_))
    }
}

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Authentication token required. Set via --token or BROWSER_MCP_AUTH_TOKEN.")]
    MissingToken,
    #[error("Token must be 64 characters or less (got {0}).")]
    TokenTooLong(usize),
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
}
