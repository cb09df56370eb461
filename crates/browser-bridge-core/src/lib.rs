//! Core of the browser bridge.
//!
//! This crate provides the fundamental building blocks:
//! - `Context` - Owns the single live agent connection
//! - `PendingTable` - In-flight requests, settled exactly once
//! - Wire envelopes exchanged with the agent
//! - `ToolRegistry` - Name to descriptor/handler lookup
//! - `BridgeConfig` and the error taxonomy

pub mod config;
pub mod context;
pub mod error;
pub mod pending;
pub mod protocol;
pub mod tools;

pub use config::{AuthToken, BridgeConfig};
pub use context::{AuthState, Connection, ConnectionId, Context, Outbound};
pub use error::{CallError, ConfigError, LossReason};
pub use pending::{CallOutcome, PendingReply, PendingTable};
pub use protocol::{AgentCapabilities, AgentCommand, AgentMessage, CommandFormat, RequestId};
pub use tools::{Capability, LocalHandler, Tool, ToolDescriptor, ToolRegistry};
