//! Authentication handshake and lifecycle of one agent socket.

use std::{str::Utf8Error, sync::Arc, time::Duration};

use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket};
use browser_bridge_core::{
    AuthToken, Connection, ConnectionId, Context, Outbound,
    protocol::{AgentMessage, AuthFrame, InboundError, result_outcome},
};
use futures::{SinkExt, Stream, StreamExt};

/// No auth message arrived within the window.
pub const CLOSE_AUTH_TIMEOUT: u16 = 4001;
/// The presented token does not match.
pub const CLOSE_INVALID_TOKEN: u16 = 4002;
/// The first message was not an auth envelope.
pub const CLOSE_MALFORMED_AUTH: u16 = 4003;

/// Result of the handshake on a new socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    Accepted,
    InvalidToken,
    Malformed,
    TimedOut,
    /// The peer went away before sending anything.
    Disconnected,
}

impl AuthOutcome {
    /// Close code and reason for a rejected socket.
    #[must_use]
    pub const fn close_frame(self) -> Option<(u16, &'static str)> {
        match self {
            Self::Accepted | Self::Disconnected => None,
            Self::TimedOut => Some((CLOSE_AUTH_TIMEOUT, "Authentication required")),
            Self::InvalidToken => Some((CLOSE_INVALID_TOKEN, "Invalid authentication token")),
            Self::Malformed => Some((CLOSE_MALFORMED_AUTH, "Malformed authentication message")),
        }
    }
}

/// Gatekeeper between accepted sockets and the [`Context`].
pub struct ConnectionGuard {
    context: Arc<Context>,
    token: AuthToken,
    auth_window: Duration,
}

impl ConnectionGuard {
    #[must_use]
    pub const fn new(context: Arc<Context>, token: AuthToken, auth_window: Duration) -> Self {
        Self {
            context,
            token,
            auth_window,
        }
    }

    #[must_use]
    pub const fn context(&self) -> &Arc<Context> {
        &self.context
    }

    /// Judge a first message.
    #[must_use]
    pub fn check(&self, first_message: &str) -> AuthOutcome {
        match AuthFrame::parse(first_message) {
            AuthFrame::Token(token) if self.token.matches(&token) => AuthOutcome::Accepted,
            AuthFrame::Token(_) => AuthOutcome::InvalidToken,
            AuthFrame::Malformed => AuthOutcome::Malformed,
        }
    }

    /// Wait for the first message and judge it, bounded by the auth window.
    pub async fn authenticate<S>(&self, stream: &mut S) -> AuthOutcome
    where
        S: Stream<Item = Result<Message, axum::Error>> + Unpin,
    {
        match tokio::time::timeout(self.auth_window, first_text(stream)).await {
            Err(_) => AuthOutcome::TimedOut,
            Ok(None) => AuthOutcome::Disconnected,
            Ok(Some(Ok(text))) => self.check(&text),
            Ok(Some(Err(e))) => {
                tracing::warn!("Non-UTF-8 first frame: {e}");
                AuthOutcome::Malformed
            }
        }
    }

    /// Drive one socket from handshake to close.
    pub async fn run(self: Arc<Self>, socket: WebSocket) {
        let (mut sink, mut stream) = socket.split();

        let outcome = self.authenticate(&mut stream).await;
        if outcome != AuthOutcome::Accepted {
            if let Some((code, reason)) = outcome.close_frame() {
                tracing::warn!(code, reason, "Rejected agent connection");
                let _ = sink
                    .send(Message::Close(Some(CloseFrame {
                        code,
                        reason: Utf8Bytes::from_static(reason),
                    })))
                    .await;
            }
            return;
        }

        let (connection, mut outbound) = Connection::open();
        let id = self.context.install(connection);

        let mut send_task = tokio::spawn(async move {
            while let Some(frame) = outbound.recv().await {
                match frame {
                    Outbound::Text(text) => {
                        if sink.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    Outbound::Close { code, reason } => {
                        let _ = sink
                            .send(Message::Close(Some(CloseFrame {
                                code,
                                reason: reason.into(),
                            })))
                            .await;
                        break;
                    }
                }
            }
        });

        loop {
            tokio::select! {
                _ = &mut send_task => break,
                msg = stream.next() => match msg {
                    Some(Ok(Message::Text(text))) => self.handle_text(id, text.as_str()),
                    Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                        Ok(text) => self.handle_text(id, text),
                        Err(_) => tracing::warn!(connection = %id, "Dropping non-UTF-8 binary frame"),
                    },
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::error!(connection = %id, "WebSocket error: {e}");
                        break;
                    }
                },
            }
        }

        self.context.detach(id);
        send_task.abort();
    }

    /// Route one post-authentication message.
    pub fn handle_text(&self, connection: ConnectionId, text: &str) {
        match AgentMessage::parse(text) {
            Ok(AgentMessage::ToolResult { request_id, result }) => {
                self.context.deliver(&request_id, result_outcome(result));
            }
            Ok(AgentMessage::Capabilities { data }) => {
                self.context.set_capabilities(connection, data);
            }
            Err(InboundError::UnknownType(kind)) => {
                tracing::warn!(%connection, %kind, "Ignoring unknown agent message");
            }
            Err(e) => tracing::warn!(%connection, "Dropping agent message: {e}"),
        }
    }
}

/// First data frame as text; `None` if the peer closes first.
async fn first_text<S>(stream: &mut S) -> Option<Result<String, Utf8Error>>
where
    S: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => return Some(Ok(text.to_string())),
            Ok(Message::Binary(data)) => return Some(std::str::from_utf8(&data).map(str::to_owned)),
            Ok(Message::Ping(_) | Message::Pong(_)) => {}
            Ok(Message::Close(_)) | Err(_) => return None,
        }
    }
    None
}
