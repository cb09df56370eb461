//! The live agent connection and the requests riding on it.

use std::{
    fmt,
    sync::{
        Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::Instant,
};

use tokio::sync::mpsc;

use crate::{
    error::{CallError, LossReason},
    pending::{CallOutcome, PendingReply, PendingTable},
    protocol::{AgentCapabilities, AgentCommand, CommandFormat, RequestId},
};

/// Close code sent to a connection replaced by a newer one.
pub const CLOSE_SUPERSEDED: u16 = 1000;
/// Close code sent to the live connection when the bridge shuts down.
pub const CLOSE_GOING_AWAY: u16 = 1001;

/// Identity of one accepted socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Frame queued for the socket writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Close { code: u16, reason: String },
}

/// Handle to an authenticated agent socket.
///
/// The socket itself stays with its transport task; the bridge only holds
/// the sending half of the writer queue.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    created_at: Instant,
    outbound: mpsc::UnboundedSender<Outbound>,
}

impl Connection {
    /// Create a connection handle and the queue its writer drains.
    #[must_use]
    pub fn open() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let connection = Self {
            id: ConnectionId::next(),
            created_at: Instant::now(),
            outbound,
        };
        (connection, rx)
    }

    #[must_use]
    pub const fn id(&self) -> ConnectionId {
        self.id
    }

    #[must_use]
    pub const fn created_at(&self) -> Instant {
        self.created_at
    }

    fn close(&self, code: u16, reason: &str) {
        // The writer may already be gone; nothing left to tell it then.
        let _ = self.outbound.send(Outbound::Close {
            code,
            reason: reason.to_string(),
        });
    }
}

/// Authentication state derived from the live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Unauthenticated,
    Authenticated,
}

#[derive(Default)]
struct State {
    live: Option<Connection>,
    pending: PendingTable,
    capabilities: Option<AgentCapabilities>,
}

/// Owner of the single live agent connection and the pending-request table.
///
/// All mutations go through one mutex, so installing, detaching, sending
/// and delivering are atomic with respect to each other.
pub struct Context {
    state: Mutex<State>,
    format: CommandFormat,
}

impl Default for Context {
    fn default() -> Self {
        Self::new(CommandFormat::default())
    }
}

impl Context {
    /// Create a context that emits commands in `format`.
    #[must_use]
    pub fn new(format: CommandFormat) -> Self {
        Self {
            state: Mutex::new(State::default()),
            format,
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// True iff a live, authenticated connection exists.
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.state().live.is_some()
    }

    #[must_use]
    pub fn auth_state(&self) -> AuthState {
        if self.is_authenticated() {
            AuthState::Authenticated
        } else {
            AuthState::Unauthenticated
        }
    }

    /// Id of the live connection, if any.
    #[must_use]
    pub fn live_connection(&self) -> Option<ConnectionId> {
        self.state().live.as_ref().map(Connection::id)
    }

    /// Install a freshly authenticated connection.
    ///
    /// Any previous connection is closed and its requests fail as
    /// superseded before the new one becomes visible.
    pub fn install(&self, connection: Connection) -> ConnectionId {
        let id = connection.id();
        let mut state = self.state();
        if let Some(previous) = state.live.take() {
            assert_ne!(previous.id(), id, "connection installed twice");
            let failed = state
                .pending
                .fail_connection(previous.id(), LossReason::Superseded);
            previous.close(CLOSE_SUPERSEDED, "Superseded by a newer connection");
            state.capabilities = None;
            tracing::info!(
                previous = %previous.id(),
                age_ms = previous.created_at().elapsed().as_millis(),
                failed,
                "Closed superseded agent connection"
            );
        }
        state.live = Some(connection);
        tracing::info!(connection = %id, "Agent authenticated");
        id
    }

    /// Forget `connection` after its socket closed.
    ///
    /// A no-op unless it is still the live connection, so a superseded
    /// socket closing late cannot unauthenticate its replacement.
    pub fn detach(&self, connection: ConnectionId) -> bool {
        let mut state = self.state();
        if state.live.as_ref().map(Connection::id) != Some(connection) {
            return false;
        }
        state.live = None;
        state.capabilities = None;
        let failed = state.pending.fail_connection(connection, LossReason::Closed);
        tracing::info!(%connection, failed, "Agent connection closed");
        true
    }

    /// Transmit `command` to the agent and register it as pending.
    ///
    /// # Errors
    /// Returns `NoConnection` when no agent is authenticated, or if the
    /// command id is already in flight.
    pub fn send(&self, command: &AgentCommand) -> Result<PendingReply, CallError> {
        let text = command
            .encode(self.format)
            .map_err(|e| CallError::Encode(e.to_string()))?;

        let mut state = self.state();
        let Some(connection_id) = state.live.as_ref().map(Connection::id) else {
            return Err(CallError::NoConnection);
        };
        // Registered before transmitting so a fast reply always finds it.
        let reply = state.pending.register(command.id.clone(), connection_id)?;
        let sent = state
            .live
            .as_ref()
            .is_some_and(|live| live.outbound.send(Outbound::Text(text)).is_ok());
        if !sent {
            state.pending.discard(&command.id);
            return Err(CallError::NoConnection);
        }
        tracing::debug!(request_id = %command.id, tool = %command.name, connection = %connection_id, "Sent command");
        Ok(reply)
    }

    /// Settle the request `request_id`.
    ///
    /// Unknown or already settled ids are a logged no-op.
    pub fn deliver(&self, request_id: &RequestId, outcome: CallOutcome) -> bool {
        let settled = self.state().pending.settle(request_id, outcome);
        if !settled {
            tracing::warn!(%request_id, "Protocol anomaly: result for unknown or settled request");
        }
        settled
    }

    /// Give up on `request_id` without settling it.
    pub fn forget(&self, request_id: &RequestId) -> bool {
        self.state().pending.discard(request_id)
    }

    /// Close the live connection and fail every outstanding request.
    pub fn close(&self) {
        let mut state = self.state();
        let failed = state.pending.fail_all(LossReason::ShuttingDown);
        if let Some(live) = state.live.take() {
            live.close(CLOSE_GOING_AWAY, "Bridge shutting down");
        }
        state.capabilities = None;
        tracing::info!(failed, "Context closed");
    }

    /// Record the live agent's capability report.
    pub fn set_capabilities(&self, connection: ConnectionId, capabilities: AgentCapabilities) {
        let mut state = self.state();
        if state.live.as_ref().map(Connection::id) == Some(connection) {
            tracing::info!(
                extension = %capabilities.extension,
                version = %capabilities.version,
                features = ?capabilities.features,
                "Agent reported capabilities"
            );
            state.capabilities = Some(capabilities);
        }
    }

    #[must_use]
    pub fn capabilities(&self) -> Option<AgentCapabilities> {
        self.state().capabilities.clone()
    }

    /// Number of requests awaiting a result.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.state().pending.len()
    }
}
