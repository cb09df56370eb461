//! Caller-facing MCP protocol (JSON-RPC 2.0).

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::dispatcher::{DispatchError, Dispatcher};

/// Protocol revision announced when the client does not ask for one.
pub const PROTOCOL_VERSION: &str = "2024-11-05";
/// URI of the agent capability resource.
pub const CAPABILITIES_URI: &str = "browser://agent/capabilities";

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;

/// Incoming JSON-RPC message. Without an `id` it is a notification.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcRequest {
    #[serde(default)]
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// JSON-RPC error object.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
}

/// Outgoing JSON-RPC response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: &'static str,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    #[must_use]
    pub const fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: Some(result),
            error: None,
        }
    }

    #[must_use]
    pub fn failure(id: Value, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
            }),
        }
    }
}

/// One content item of a tool result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Content {
    Text {
        text: String,
    },
    Image {
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
}

/// Result of `tools/call`, also used as the fail-closed payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallToolResult {
    pub content: Vec<Content>,
    pub is_error: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub structured_content: Option<Value>,
    #[serde(rename = "_meta", skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

impl CallToolResult {
    /// Wrap an agent payload. The payload itself is carried unchanged.
    #[must_use]
    pub fn success(payload: Value) -> Self {
        let mut content = Vec::new();
        if let Some((mime_type, data)) = payload
            .get("image")
            .and_then(Value::as_str)
            .and_then(parse_data_url)
        {
            content.push(Content::Image {
                data: data.to_string(),
                mime_type: mime_type.to_string(),
            });
        } else {
            let text = match &payload {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            };
            content.push(Content::Text { text });
        }
        Self {
            content,
            is_error: false,
            structured_content: payload.is_object().then_some(payload),
            meta: None,
        }
    }

    #[must_use]
    pub fn error(err: &DispatchError) -> Self {
        Self {
            content: vec![Content::Text {
                text: err.to_string(),
            }],
            is_error: true,
            structured_content: None,
            meta: Some(json!({"errorKind": err.kind()})),
        }
    }

    fn into_value(self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Split `data:<mime>;base64,<data>`.
fn parse_data_url(url: &str) -> Option<(&str, &str)> {
    let rest = url.strip_prefix("data:")?;
    let (header, data) = rest.split_once(',')?;
    let mime_type = header.strip_suffix(";base64")?;
    Some((mime_type, data))
}

#[derive(Debug, Deserialize)]
struct CallToolParams {
    name: String,
    #[serde(default)]
    arguments: Value,
}

#[derive(Debug, Deserialize)]
struct ReadResourceParams {
    uri: String,
}

/// Server identity reported by `initialize`.
#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
}

/// JSON-RPC front end over the [`Dispatcher`].
pub struct McpServer {
    dispatcher: Dispatcher,
    info: ServerInfo,
}

impl McpServer {
    #[must_use]
    pub const fn new(dispatcher: Dispatcher, info: ServerInfo) -> Self {
        Self { dispatcher, info }
    }

    /// Handle one raw line; `None` for notifications.
    pub async fn handle_line(&self, line: &str) -> Option<JsonRpcResponse> {
        let value: Value = match serde_json::from_str(line) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!("Unparseable request: {e}");
                return Some(JsonRpcResponse::failure(Value::Null, PARSE_ERROR, format!("Parse error: {e}")));
            }
        };
        let id = value.get("id").cloned().unwrap_or(Value::Null);
        match serde_json::from_value::<JsonRpcRequest>(value) {
            Ok(request) => self.handle(request).await,
            Err(e) => Some(JsonRpcResponse::failure(id, INVALID_REQUEST, format!("Invalid request: {e}"))),
        }
    }

    /// Handle one request; `None` for notifications.
    pub async fn handle(&self, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
        let Some(id) = request.id else {
            tracing::debug!(method = %request.method, "Notification");
            return None;
        };
        tracing::debug!(method = %request.method, %id, "Request");
        let response = match self.dispatch(&request.method, request.params).await {
            Ok(result) => JsonRpcResponse::success(id, result),
            Err((code, message)) => JsonRpcResponse::failure(id, code, message),
        };
        Some(response)
    }

    async fn dispatch(&self, method: &str, params: Value) -> Result<Value, (i64, String)> {
        match method {
            "initialize" => Ok(self.initialize(&params)),
            "ping" => Ok(json!({})),
            "tools/list" => Ok(match self.dispatcher.list_tools() {
                Ok(tools) => json!({"tools": tools}),
                Err(e) => CallToolResult::error(&e).into_value(),
            }),
            "tools/call" => {
                let params: CallToolParams = serde_json::from_value(params)
                    .map_err(|e| (INVALID_PARAMS, format!("Invalid params: {e}")))?;
                let result = match self.dispatcher.call(&params.name, params.arguments).await {
                    Ok(payload) => CallToolResult::success(payload),
                    Err(e) => {
                        tracing::info!(tool = %params.name, kind = ?e.kind(), "Tool call failed: {e}");
                        CallToolResult::error(&e)
                    }
                };
                Ok(result.into_value())
            }
            "resources/list" => Ok(self.list_resources()),
            "resources/read" => {
                let params: ReadResourceParams = serde_json::from_value(params)
                    .map_err(|e| (INVALID_PARAMS, format!("Invalid params: {e}")))?;
                Ok(self.read_resource(&params.uri))
            }
            other => Err((METHOD_NOT_FOUND, format!("Method not found: {other}"))),
        }
    }

    fn initialize(&self, params: &Value) -> Value {
        let version = params
            .get("protocolVersion")
            .and_then(Value::as_str)
            .unwrap_or(PROTOCOL_VERSION);
        json!({
            "protocolVersion": version,
            "capabilities": {"tools": {}, "resources": {}},
            "serverInfo": {"name": self.info.name, "version": self.info.version},
        })
    }

    fn not_authenticated() -> Value {
        CallToolResult::error(&DispatchError::NotAuthenticated).into_value()
    }

    fn list_resources(&self) -> Value {
        let context = self.dispatcher.context();
        if !context.is_authenticated() {
            return Self::not_authenticated();
        }
        let resources: Vec<Value> = context
            .capabilities()
            .map(|_| {
                json!({
                    "uri": CAPABILITIES_URI,
                    "name": "Browser agent capabilities",
                    "mimeType": "application/json",
                })
            })
            .into_iter()
            .collect();
        json!({"resources": resources})
    }

    fn read_resource(&self, uri: &str) -> Value {
        let context = self.dispatcher.context();
        if !context.is_authenticated() {
            return Self::not_authenticated();
        }
        let contents: Vec<Value> = match context.capabilities() {
            Some(capabilities) if uri == CAPABILITIES_URI => vec![json!({
                "uri": CAPABILITIES_URI,
                "mimeType": "application/json",
                "text": serde_json::to_string(&capabilities).unwrap_or_default(),
            })],
            _ => Vec::new(),
        };
        json!({"contents": contents})
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use browser_bridge_core::{AgentCapabilities, AgentCommand, Connection, Context, Outbound};
    use tokio::sync::mpsc;

    use super::*;
    use crate::catalog;

    fn server(ctx: &Arc<Context>) -> McpServer {
        let dispatcher = Dispatcher::new(
            Arc::clone(ctx),
            Arc::new(catalog::browser_tools().unwrap()),
            Duration::from_secs(30),
        );
        McpServer::new(
            dispatcher,
            ServerInfo {
                name: "browser-bridge".into(),
                version: "0.1.0".into(),
            },
        )
    }

    fn connect(ctx: &Context) -> mpsc::UnboundedReceiver<Outbound> {
        let (connection, rx) = Connection::open();
        ctx.install(connection);
        rx
    }

    async fn result_of(server: &McpServer, line: &str) -> Value {
        let response = server.handle_line(line).await.unwrap();
        assert!(response.error.is_none(), "unexpected error: {:?}", response.error);
        response.result.unwrap()
    }

    #[tokio::test]
    async fn test_initialize_and_ping() {
        let ctx = Arc::new(Context::default());
        let server = server(&ctx);

        let result = result_of(&server, r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{}}"#).await;
        assert_eq!(result["protocolVersion"], PROTOCOL_VERSION);
        assert_eq!(result["serverInfo"]["name"], "browser-bridge");
        assert!(result["capabilities"]["tools"].is_object());

        assert_eq!(result_of(&server, r#"{"jsonrpc":"2.0","id":2,"method":"ping"}"#).await, json!({}));
        assert!(
            server
                .handle_line(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#)
                .await
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_fails_closed_before_authentication() {
        let ctx = Arc::new(Context::default());
        let server = server(&ctx);

        for line in [
            r#"{"jsonrpc":"2.0","id":1,"method":"tools/list"}"#,
            r#"{"jsonrpc":"2.0","id":2,"method":"tools/call","params":{"name":"browser_snapshot"}}"#,
            r#"{"jsonrpc":"2.0","id":3,"method":"resources/list"}"#,
            r#"{"jsonrpc":"2.0","id":4,"method":"resources/read","params":{"uri":"browser://agent/capabilities"}}"#,
        ] {
            let result = result_of(&server, line).await;
            assert_eq!(result["isError"], true);
            assert_eq!(
                result["content"][0]["text"],
                "Not authenticated. Please connect with a valid token."
            );
            assert_eq!(result["_meta"]["errorKind"], "protocol");
        }
    }

    #[tokio::test]
    async fn test_tools_list_after_authentication() {
        let ctx = Arc::new(Context::default());
        let _rx = connect(&ctx);
        let server = server(&ctx);

        let result = result_of(&server, r#"{"jsonrpc":"2.0","id":"a","method":"tools/list"}"#).await;
        let tools = result["tools"].as_array().unwrap();
        assert_eq!(tools.len(), 13);
        assert_eq!(tools[0]["name"], "browser_navigate");
        assert_eq!(tools[0]["inputSchema"]["required"], json!(["url"]));
    }

    #[tokio::test]
    async fn test_tools_call_round_trip() {
        let ctx = Arc::new(Context::default());
        let mut rx = connect(&ctx);
        let server = server(&ctx);

        let agent_ctx = Arc::clone(&ctx);
        tokio::spawn(async move {
            if let Some(Outbound::Text(text)) = rx.recv().await {
                let command = AgentCommand::decode(&text).unwrap();
                agent_ctx.deliver(
                    &command.id,
                    Ok(json!({"status": "navigated", "url": "https://example.com"})),
                );
            }
        });

        let result = result_of(
            &server,
            r#"{"jsonrpc":"2.0","id":7,"method":"tools/call","params":{"name":"browser_navigate","arguments":{"url":"https://example.com"}}}"#,
        )
        .await;
        assert_eq!(result["isError"], false);
        assert_eq!(
            result["structuredContent"],
            json!({"status": "navigated", "url": "https://example.com"})
        );
        let text: Value = serde_json::from_str(result["content"][0]["text"].as_str().unwrap()).unwrap();
        assert_eq!(text["status"], "navigated");
    }

    #[tokio::test]
    async fn test_unknown_tool_is_error_result_not_rpc_error() {
        let ctx = Arc::new(Context::default());
        let _rx = connect(&ctx);
        let server = server(&ctx);

        let result = result_of(
            &server,
            r#"{"jsonrpc":"2.0","id":8,"method":"tools/call","params":{"name":"browser_teleport","arguments":{}}}"#,
        )
        .await;
        assert_eq!(result["isError"], true);
        assert_eq!(result["content"][0]["text"], "Tool \"browser_teleport\" not found");
        assert_eq!(result["_meta"]["errorKind"], "protocol");
    }

    #[tokio::test]
    async fn test_json_rpc_errors() {
        let ctx = Arc::new(Context::default());
        let server = server(&ctx);

        let response = server.handle_line("{nope").await.unwrap();
        assert_eq!(response.error.unwrap().code, PARSE_ERROR);
        assert_eq!(response.id, Value::Null);

        let response = server
            .handle_line(r#"{"jsonrpc":"2.0","id":3,"method":"sampling/createMessage"}"#)
            .await
            .unwrap();
        assert_eq!(response.error.unwrap().code, METHOD_NOT_FOUND);
        assert_eq!(response.id, json!(3));

        let response = server
            .handle_line(r#"{"jsonrpc":"2.0","id":4,"method":"tools/call","params":{"arguments":{}}}"#)
            .await
            .unwrap();
        assert_eq!(response.error.unwrap().code, INVALID_PARAMS);
    }

    #[tokio::test]
    async fn test_capabilities_resource() {
        let ctx = Arc::new(Context::default());
        let _rx = connect(&ctx);
        let server = server(&ctx);

        let listed = result_of(&server, r#"{"jsonrpc":"2.0","id":1,"method":"resources/list"}"#).await;
        assert_eq!(listed["resources"], json!([]));

        let live = ctx.live_connection().unwrap();
        ctx.set_capabilities(
            live,
            AgentCapabilities {
                extension: "browser-mcp".into(),
                version: "1.4.0".into(),
                features: vec!["token-auth".into()],
            },
        );
        let listed = result_of(&server, r#"{"jsonrpc":"2.0","id":2,"method":"resources/list"}"#).await;
        assert_eq!(listed["resources"][0]["uri"], CAPABILITIES_URI);

        let read = result_of(
            &server,
            r#"{"jsonrpc":"2.0","id":3,"method":"resources/read","params":{"uri":"browser://agent/capabilities"}}"#,
        )
        .await;
        let text: Value = serde_json::from_str(read["contents"][0]["text"].as_str().unwrap()).unwrap();
        assert_eq!(text["version"], "1.4.0");

        let missing = result_of(
            &server,
            r#"{"jsonrpc":"2.0","id":4,"method":"resources/read","params":{"uri":"browser://nothing"}}"#,
        )
        .await;
        assert_eq!(missing, json!({"contents": []}));
    }

    #[test]
    fn test_screenshot_payload_becomes_image() {
        let result = CallToolResult::success(json!({"image": "data:image/png;base64,iVBORw0KGgo="}));
        assert_eq!(
            result.content,
            [Content::Image {
                data: "iVBORw0KGgo=".into(),
                mime_type: "image/png".into()
            }]
        );
        assert!(!result.is_error);

        let plain = CallToolResult::success(json!("done"));
        assert_eq!(plain.content, [Content::Text { text: "done".into() }]);
        assert!(plain.structured_content.is_none());
    }
}
