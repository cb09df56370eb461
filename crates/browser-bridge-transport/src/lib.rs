//! Agent-facing transport for the browser bridge.
//!
//! Provides:
//! - Connection guard (auth handshake, single live connection)
//! - WebSocket listener
//! - Port eviction before binding

pub mod guard;
pub mod port;
pub mod websocket;

pub use guard::{AuthOutcome, ConnectionGuard};
pub use websocket::{AgentListener, ListenerError, create_ws_router};
