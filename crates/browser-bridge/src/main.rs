//! MCP server that forwards browser tool calls to an extension over WebSocket.
//!
//! Run with: browser-bridge --token <token>
//!
//! The MCP client talks to this process over stdin/stdout; the browser
//! extension connects to ws://127.0.0.1:9009 and authenticates with the
//! same token.

mod cli;

use std::sync::Arc;

use anyhow::Context as _;
use browser_bridge_core::{BridgeConfig, Context};
use browser_bridge_server::{Dispatcher, McpServer, ServerInfo, catalog, stdio};
use browser_bridge_transport::{AgentListener, ConnectionGuard};
use clap::Parser;
use tokio::sync::oneshot;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::cli::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout carries the protocol, so logs go to stderr.
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = Cli::parse().into_config()?;
    run(config).await
}

async fn run(config: BridgeConfig) -> anyhow::Result<()> {
    let context = Arc::new(Context::new(config.command_format));
    let registry = Arc::new(catalog::browser_tools().context("Failed to build tool catalog")?);

    let guard = Arc::new(ConnectionGuard::new(
        Arc::clone(&context),
        config.token.clone(),
        config.auth_window,
    ));
    let listener = AgentListener::bind(config.listen_addr(), config.evict_existing, guard)
        .await
        .context("Failed to start agent listener")?;

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let listener_task = tokio::spawn(listener.serve(async move {
        let _ = shutdown_rx.await;
    }));

    let server = Arc::new(McpServer::new(
        Dispatcher::new(Arc::clone(&context), registry, config.call_timeout),
        ServerInfo {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        },
    ));
    tracing::info!(call_timeout = ?config.call_timeout, "MCP server ready on stdio");

    let pending = stdio::serve(server, tokio::io::stdin(), tokio::io::stdout()).await;

    // The client is gone or unreadable; wind down within the grace period.
    let shutdown = async {
        context.close();
        let _ = shutdown_tx.send(());
        pending.finish().await;
        match listener_task.await {
            Ok(Err(e)) => tracing::warn!("Agent listener failed: {e}"),
            Err(e) => tracing::warn!("Agent listener task failed: {e}"),
            Ok(Ok(())) => {}
        }
    };
    if tokio::time::timeout(config.shutdown_grace, shutdown).await.is_err() {
        tracing::warn!("Shutdown grace period elapsed, exiting");
    }
    Ok(())
}
