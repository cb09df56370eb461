//! Resolves tool calls and runs them locally or through the agent.

use std::{sync::Arc, time::Duration};

use browser_bridge_core::{
    AgentCommand, Context, RequestId, ToolDescriptor, ToolRegistry, error::CallError,
};
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

/// Coarse class of a failed call, reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The call itself was invalid.
    Protocol,
    /// The action ran and failed.
    ToolExecution,
    /// The agent went away mid-flight.
    ConnectionLost,
    /// The agent did not answer in time.
    Timeout,
}

/// Dispatch error.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Not authenticated. Please connect with a valid token.")]
    NotAuthenticated,
    #[error("Tool \"{0}\" not found")]
    UnknownTool(String),
    #[error("Invalid arguments for {tool}: {reason}")]
    InvalidArguments { tool: String, reason: String },
    #[error(transparent)]
    Call(#[from] CallError),
}

impl DispatchError {
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::NotAuthenticated | Self::UnknownTool(_) | Self::InvalidArguments { .. } => {
                ErrorKind::Protocol
            }
            Self::Call(call) => match call {
                CallError::Tool(_) => ErrorKind::ToolExecution,
                // Lost between the auth check and the send.
                CallError::NoConnection | CallError::ConnectionLost(_) => ErrorKind::ConnectionLost,
                CallError::Timeout(_) => ErrorKind::Timeout,
                CallError::DuplicateRequest(_) | CallError::Encode(_) => ErrorKind::Protocol,
            },
        }
    }
}

/// Entry point for named tool calls.
///
/// Calls are independent: each remote call is correlated only by its own
/// id, so completion order follows the agent, not the callers.
pub struct Dispatcher {
    context: Arc<Context>,
    registry: Arc<ToolRegistry>,
    call_timeout: Duration,
}

impl Dispatcher {
    #[must_use]
    pub const fn new(context: Arc<Context>, registry: Arc<ToolRegistry>, call_timeout: Duration) -> Self {
        Self {
            context,
            registry,
            call_timeout,
        }
    }

    #[must_use]
    pub const fn context(&self) -> &Arc<Context> {
        &self.context
    }

    /// Registered tools, in registration order.
    ///
    /// # Errors
    /// Returns `NotAuthenticated` when no agent is connected.
    pub fn list_tools(&self) -> Result<Vec<ToolDescriptor>, DispatchError> {
        if !self.context.is_authenticated() {
            return Err(DispatchError::NotAuthenticated);
        }
        Ok(self.registry.descriptors().cloned().collect())
    }

    /// Run tool `name` with `arguments`.
    ///
    /// # Errors
    /// Returns a protocol error for unauthenticated or invalid calls, and
    /// the call failure otherwise.
    pub async fn call(&self, name: &str, arguments: Value) -> Result<Value, DispatchError> {
        if !self.context.is_authenticated() {
            return Err(DispatchError::NotAuthenticated);
        }
        let tool = self
            .registry
            .get(name)
            .ok_or_else(|| DispatchError::UnknownTool(name.to_string()))?;

        let arguments = match arguments {
            Value::Null => Value::Object(Map::new()),
            Value::Object(_) => arguments,
            _ => {
                return Err(DispatchError::InvalidArguments {
                    tool: name.to_string(),
                    reason: "arguments must be an object".to_string(),
                });
            }
        };
        let missing = tool.descriptor().missing_required(&arguments);
        if !missing.is_empty() {
            return Err(DispatchError::InvalidArguments {
                tool: name.to_string(),
                reason: format!("missing {}", missing.join(", ")),
            });
        }

        if let Some(handler) = tool.handler() {
            tracing::debug!(tool = name, "Running local tool");
            return Ok(handler.call(arguments).await?);
        }
        Ok(self.call_remote(name, arguments).await?)
    }

    async fn call_remote(&self, name: &str, arguments: Value) -> Result<Value, CallError> {
        let command = AgentCommand {
            id: RequestId::new(),
            name: name.to_string(),
            arguments,
        };
        let reply = self.context.send(&command)?;
        let _entry = PendingEntry {
            context: &self.context,
            id: &command.id,
        };

        match tokio::time::timeout(self.call_timeout, reply).await {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::warn!(request_id = %command.id, tool = name, "Tool call timed out");
                Err(CallError::Timeout(self.call_timeout))
            }
        }
    }
}

/// Removes a request from the pending table when its caller stops waiting.
///
/// Covers timeouts and callers that drop the call future; after settlement
/// the entry is already gone and this is a no-op.
struct PendingEntry<'a> {
    context: &'a Context,
    id: &'a RequestId,
}

impl Drop for PendingEntry<'_> {
    fn drop(&mut self) {
        if self.context.forget(self.id) {
            tracing::debug!(request_id = %self.id, "Dropped unsettled request");
        }
    }
}

#[cfg(test)]
mod tests {
    use browser_bridge_core::{Connection, LossReason, Outbound, Tool};
    use futures::future::join_all;
    use serde_json::json;
    use tokio::{sync::mpsc, task::JoinHandle};

    use super::*;
    use crate::catalog;

    fn dispatcher(ctx: &Arc<Context>, timeout: Duration) -> Dispatcher {
        Dispatcher::new(
            Arc::clone(ctx),
            Arc::new(catalog::browser_tools().unwrap()),
            timeout,
        )
    }

    fn connect(ctx: &Context) -> mpsc::UnboundedReceiver<Outbound> {
        let (connection, rx) = Connection::open();
        ctx.install(connection);
        rx
    }

    /// Agent that waits for `batch` commands, then answers them newest first.
    fn spawn_reversing_agent(
        ctx: Arc<Context>,
        mut rx: mpsc::UnboundedReceiver<Outbound>,
        batch: usize,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut received = Vec::new();
            while received.len() < batch {
                let Some(Outbound::Text(text)) = rx.recv().await else {
                    return;
                };
                received.push(AgentCommand::decode(&text).unwrap());
            }
            for command in received.into_iter().rev() {
                ctx.deliver(&command.id, Ok(json!({"echo": command.arguments})));
            }
        })
    }

    #[tokio::test]
    async fn test_call_before_authentication_is_rejected() {
        let ctx = Arc::new(Context::default());
        let dispatcher = dispatcher(&ctx, Duration::from_secs(30));

        let err = dispatcher
            .call("browser_navigate", json!({"url": "https://example.com"}))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::NotAuthenticated));
        assert_eq!(err.kind(), ErrorKind::Protocol);
        assert!(matches!(dispatcher.list_tools(), Err(DispatchError::NotAuthenticated)));
    }

    #[tokio::test]
    async fn test_unknown_tool_makes_no_round_trip() {
        let ctx = Arc::new(Context::default());
        let mut rx = connect(&ctx);
        let dispatcher = dispatcher(&ctx, Duration::from_secs(30));

        let err = dispatcher.call("browser_teleport", json!({})).await.unwrap_err();
        assert_eq!(err.to_string(), "Tool \"browser_teleport\" not found");
        assert_eq!(err.kind(), ErrorKind::Protocol);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_invalid_arguments_are_protocol_errors() {
        let ctx = Arc::new(Context::default());
        let mut rx = connect(&ctx);
        let dispatcher = dispatcher(&ctx, Duration::from_secs(30));

        let err = dispatcher.call("browser_navigate", json!({})).await.unwrap_err();
        assert!(matches!(err, DispatchError::InvalidArguments { ref reason, .. } if reason == "missing url"));
        let err = dispatcher.call("browser_navigate", json!("https://example.com")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_navigate_result_returned_unchanged() {
        let ctx = Arc::new(Context::default());
        let mut rx = connect(&ctx);
        let dispatcher = dispatcher(&ctx, Duration::from_secs(30));

        let agent_ctx = Arc::clone(&ctx);
        let agent = tokio::spawn(async move {
            let Some(Outbound::Text(text)) = rx.recv().await else {
                panic!("expected command");
            };
            let command = AgentCommand::decode(&text).unwrap();
            assert_eq!(command.name, "browser_navigate");
            assert_eq!(command.arguments, json!({"url": "https://example.com"}));
            agent_ctx.deliver(
                &command.id,
                Ok(json!({"status": "navigated", "url": "https://example.com"})),
            );
        });

        let result = dispatcher
            .call("browser_navigate", json!({"url": "https://example.com"}))
            .await
            .unwrap();
        assert_eq!(result, json!({"status": "navigated", "url": "https://example.com"}));
        agent.await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_calls_each_resolved_once_out_of_order() {
        const CALLS: usize = 16;
        let ctx = Arc::new(Context::default());
        let rx = connect(&ctx);
        let dispatcher = dispatcher(&ctx, Duration::from_secs(30));
        let agent = spawn_reversing_agent(Arc::clone(&ctx), rx, CALLS);

        let calls = (0..CALLS).map(|i| {
            let dispatcher = &dispatcher;
            async move {
                let url = format!("https://example.com/{i}");
                let result = dispatcher
                    .call("browser_navigate", json!({"url": url}))
                    .await
                    .unwrap();
                (url, result)
            }
        });
        for (url, result) in join_all(calls).await {
            assert_eq!(result, json!({"echo": {"url": url}}));
        }
        agent.await.unwrap();
        assert_eq!(ctx.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_agent_error_is_tool_execution_error() {
        let ctx = Arc::new(Context::default());
        let mut rx = connect(&ctx);
        let dispatcher = dispatcher(&ctx, Duration::from_secs(30));

        let agent_ctx = Arc::clone(&ctx);
        tokio::spawn(async move {
            if let Some(Outbound::Text(text)) = rx.recv().await {
                let command = AgentCommand::decode(&text).unwrap();
                let outcome = browser_bridge_core::protocol::result_outcome(
                    json!({"error": "Element not found"}),
                );
                agent_ctx.deliver(&command.id, outcome);
            }
        });

        let err = dispatcher
            .call("browser_click", json!({"element": "Buy", "ref": "#buy"}))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ToolExecution);
        assert_eq!(err.to_string(), "Element not found");
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_discards_pending_and_late_result_is_noop() {
        let ctx = Arc::new(Context::default());
        let mut rx = connect(&ctx);
        let dispatcher = dispatcher(&ctx, Duration::from_secs(10));

        let err = dispatcher.call("browser_snapshot", json!({})).await.unwrap_err();
        assert!(matches!(err, DispatchError::Call(CallError::Timeout(d)) if d == Duration::from_secs(10)));
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(ctx.pending_count(), 0);

        let Some(Outbound::Text(text)) = rx.recv().await else {
            panic!("expected command");
        };
        let late = AgentCommand::decode(&text).unwrap();
        assert!(!ctx.deliver(&late.id, Ok(json!({"snapshot": "<body/>"}))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_calls_leave_no_pending_entries() {
        let ctx = Arc::new(Context::default());
        let _rx = connect(&ctx);
        let dispatcher = dispatcher(&ctx, Duration::from_secs(30));

        for _ in 0..3 {
            let call = dispatcher.call("browser_snapshot", json!({}));
            assert!(tokio::time::timeout(Duration::from_millis(10), call).await.is_err());
        }
        assert_eq!(ctx.pending_count(), 0);
        assert!(ctx.is_authenticated());
    }

    #[tokio::test]
    async fn test_connection_loss_is_distinct_from_timeout() {
        let ctx = Arc::new(Context::default());
        let mut rx = connect(&ctx);
        let dispatcher = dispatcher(&ctx, Duration::from_secs(30));

        let closer = Arc::clone(&ctx);
        tokio::spawn(async move {
            let _ = rx.recv().await;
            closer.close();
        });

        let err = dispatcher.call("browser_go_back", Value::Null).await.unwrap_err();
        assert!(matches!(
            err,
            DispatchError::Call(CallError::ConnectionLost(LossReason::ShuttingDown))
        ));
        assert_eq!(err.kind(), ErrorKind::ConnectionLost);
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_tool_runs_without_round_trip() {
        let ctx = Arc::new(Context::default());
        let mut rx = connect(&ctx);
        let dispatcher = dispatcher(&ctx, Duration::from_secs(30));

        let result = dispatcher.call("browser_wait", json!({"time": 2})).await.unwrap();
        assert_eq!(result, json!({"status": "waited", "time": 2}));
        assert!(rx.try_recv().is_err());

        let err = dispatcher.call("browser_wait", json!({"time": -1})).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ToolExecution);
    }

    #[tokio::test]
    async fn test_custom_registry() {
        let ctx = Arc::new(Context::default());
        let _rx = connect(&ctx);
        let mut registry = ToolRegistry::new();
        registry
            .register(Tool::remote("only_tool", "Single", json!({"type": "object"})))
            .unwrap();
        let dispatcher = Dispatcher::new(Arc::clone(&ctx), Arc::new(registry), Duration::from_secs(1));

        let names: Vec<_> = dispatcher.list_tools().unwrap().into_iter().map(|d| d.name).collect();
        assert_eq!(names, ["only_tool"]);
    }
}
