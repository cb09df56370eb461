//! Built-in browser tools.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use browser_bridge_core::{
    LocalHandler, Tool, ToolRegistry, error::CallError, tools::RegistryError,
};
use serde_json::{Value, json};

/// Upper bound for `browser_wait`, in seconds.
pub const MAX_WAIT_SECS: f64 = 300.0;

fn object_schema(properties: Value, required: &[&str]) -> Value {
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
        "additionalProperties": false,
    })
}

fn element_properties() -> Value {
    json!({
        "element": {
            "type": "string",
            "description": "Human-readable element description used to obtain permission to interact with the element"
        },
        "ref": {
            "type": "string",
            "description": "Exact target element reference from the page snapshot"
        }
    })
}

fn with_element(extra: Value) -> Value {
    let mut properties = element_properties();
    if let (Some(base), Value::Object(extra)) = (properties.as_object_mut(), extra) {
        base.extend(extra);
    }
    properties
}

/// Sleeps inside the bridge; the browser is not involved.
struct WaitHandler;

#[async_trait]
impl LocalHandler for WaitHandler {
    async fn call(&self, arguments: Value) -> Result<Value, CallError> {
        let time = arguments.get("time").cloned().unwrap_or(Value::Null);
        let secs = time
            .as_f64()
            .filter(|secs| (0.0..=MAX_WAIT_SECS).contains(secs))
            .ok_or_else(|| {
                CallError::Tool(format!("time must be a number between 0 and {MAX_WAIT_SECS} seconds"))
            })?;
        tokio::time::sleep(Duration::from_secs_f64(secs)).await;
        Ok(json!({"status": "waited", "time": time}))
    }
}

/// The registry shipped with the bridge.
///
/// # Errors
/// Returns error if two tools share a name.
pub fn browser_tools() -> Result<ToolRegistry, RegistryError> {
    let mut registry = ToolRegistry::new();
    let no_arguments = || object_schema(json!({}), &[]);

    registry.register(Tool::remote(
        "browser_navigate",
        "Navigate to a URL",
        object_schema(
            json!({"url": {"type": "string", "description": "The URL to navigate to"}}),
            &["url"],
        ),
    ))?;
    registry.register(Tool::remote(
        "browser_go_back",
        "Go back to the previous page",
        no_arguments(),
    ))?;
    registry.register(Tool::remote(
        "browser_go_forward",
        "Go forward to the next page",
        no_arguments(),
    ))?;
    registry.register(Tool::remote(
        "browser_snapshot",
        "Capture accessibility snapshot of the current page. Use this for getting references to elements to interact with.",
        no_arguments(),
    ))?;
    registry.register(Tool::remote(
        "browser_click",
        "Perform click on a web page",
        object_schema(element_properties(), &["element", "ref"]),
    ))?;
    registry.register(Tool::remote(
        "browser_hover",
        "Hover over element on page",
        object_schema(element_properties(), &["element", "ref"]),
    ))?;
    registry.register(Tool::remote(
        "browser_type",
        "Type text into editable element",
        object_schema(
            with_element(json!({
                "text": {"type": "string", "description": "Text to type into the element"},
                "submit": {"type": "boolean", "description": "Whether to submit entered text (press Enter after)"}
            })),
            &["element", "ref", "text"],
        ),
    ))?;
    registry.register(Tool::remote(
        "browser_select_option",
        "Select an option in a dropdown",
        object_schema(
            with_element(json!({
                "values": {
                    "type": "array",
                    "items": {"type": "string"},
                    "description": "Array of values to select in the dropdown. This can be a single value or multiple values."
                }
            })),
            &["element", "ref", "values"],
        ),
    ))?;
    registry.register(Tool::remote(
        "browser_drag",
        "Perform drag and drop between two elements",
        object_schema(
            json!({
                "startElement": {"type": "string", "description": "Human-readable source element description"},
                "startRef": {"type": "string", "description": "Exact source element reference from the page snapshot"},
                "endElement": {"type": "string", "description": "Human-readable target element description"},
                "endRef": {"type": "string", "description": "Exact target element reference from the page snapshot"}
            }),
            &["startElement", "startRef", "endElement", "endRef"],
        ),
    ))?;
    registry.register(Tool::remote(
        "browser_press_key",
        "Press a key on the keyboard",
        object_schema(
            json!({"key": {"type": "string", "description": "Name of the key to press or a character to generate, such as `ArrowLeft` or `a`"}}),
            &["key"],
        ),
    ))?;
    registry.register(Tool::local(
        "browser_wait",
        "Wait for a specified time in seconds",
        object_schema(
            json!({"time": {"type": "number", "description": "The time to wait in seconds", "minimum": 0, "maximum": MAX_WAIT_SECS}}),
            &["time"],
        ),
        Arc::new(WaitHandler),
    ))?;
    registry.register(Tool::remote(
        "browser_get_console_logs",
        "Get the console logs from the browser",
        no_arguments(),
    ))?;
    registry.register(Tool::remote(
        "browser_screenshot",
        "Take a screenshot of the current page",
        no_arguments(),
    ))?;

    Ok(registry)
}
