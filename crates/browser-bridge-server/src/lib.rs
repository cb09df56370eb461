//! Caller-facing side of the browser bridge.
//!
//! Provides:
//! - `Dispatcher` - Resolves tool calls, local or through the agent
//! - The built-in browser tool catalog
//! - MCP over newline-delimited JSON-RPC (stdio)

pub mod catalog;
pub mod dispatcher;
pub mod mcp;
pub mod stdio;

pub use dispatcher::{DispatchError, Dispatcher, ErrorKind};
pub use mcp::{CallToolResult, McpServer, ServerInfo};
