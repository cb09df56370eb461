//! Agent-facing WebSocket listener.

use std::{future::Future, io, net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    Router,
    extract::{State, WebSocketUpgrade},
    response::IntoResponse,
};
use thiserror::Error;
use tokio::net::TcpListener;

use crate::{
    guard::ConnectionGuard,
    port::{self, PortError},
};

/// How long to wait for an evicted process to release the port.
const EVICT_WAIT: Duration = Duration::from_secs(5);

/// Startup failure of the listener.
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("Failed to free port {port}: {source}")]
    Evict {
        port: u16,
        #[source]
        source: PortError,
    },
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}

/// WebSocket upgrade handler; every accepted socket goes to the guard.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(guard): State<Arc<ConnectionGuard>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| guard.run(socket))
}

/// Router accepting agent sockets on any path.
#[must_use]
pub fn create_ws_router(guard: Arc<ConnectionGuard>) -> Router {
    Router::new().fallback(ws_handler).with_state(guard)
}

/// Bound listener handing connections to a [`ConnectionGuard`].
pub struct AgentListener {
    listener: TcpListener,
    guard: Arc<ConnectionGuard>,
}

impl AgentListener {
    /// Bind `addr`, first evicting any process holding it when `evict` is set.
    ///
    /// # Errors
    /// Returns error if the port cannot be freed or bound.
    pub async fn bind(
        addr: SocketAddr,
        evict: bool,
        guard: Arc<ConnectionGuard>,
    ) -> Result<Self, ListenerError> {
        if evict {
            port::free_port(addr, EVICT_WAIT)
                .await
                .map_err(|source| ListenerError::Evict {
                    port: addr.port(),
                    source,
                })?;
        }
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ListenerError::Bind { addr, source })?;
        Ok(Self { listener, guard })
    }

    /// Address actually bound (useful with port 0).
    ///
    /// # Errors
    /// Returns error if the socket has no local address.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept agent connections until `shutdown` resolves.
    ///
    /// # Errors
    /// Returns error if the server fails.
    pub async fn serve<F>(self, shutdown: F) -> io::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if let Ok(addr) = self.listener.local_addr() {
            tracing::info!("Waiting for browser agent on ws://{addr}");
        }
        axum::serve(self.listener, create_ws_router(self.guard))
            .with_graceful_shutdown(shutdown)
            .await
    }
}
