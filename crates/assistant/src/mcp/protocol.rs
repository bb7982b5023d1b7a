//! JSON-RPC 2.0 framing and the MCP payloads the client uses.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::errors::McpError;
use crate::models::tool::DiscoveredTool;

pub const PROTOCOL_VERSION: &str = "2025-03-26";
pub const JSONRPC_VERSION: &str = "2.0";

pub const METHOD_NOT_FOUND: i64 = -32601;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
        }
    }

    pub fn initialized() -> Self {
        Self::new("notifications/initialized", None)
    }

    pub fn cancelled(request_id: u64, reason: &str) -> Self {
        Self::new(
            "notifications/cancelled",
            Some(json!({"requestId": request_id, "reason": reason})),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Any frame a server may send, before it is classified
#[derive(Debug, Deserialize)]
struct RawMessage {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<Value>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<JsonRpcError>,
}

#[derive(Debug)]
pub enum Incoming {
    /// Answer to one of our requests
    Response {
        id: u64,
        outcome: Result<Value, McpError>,
    },
    /// A request from the server, such as `ping`
    Request {
        id: Value,
        method: String,
        params: Option<Value>,
    },
    Notification {
        method: String,
        params: Option<Value>,
    },
}

impl Incoming {
    pub fn parse(text: &str) -> Result<Self, McpError> {
        let raw: RawMessage = serde_json::from_str(text)?;
        match (raw.method, raw.id) {
            (Some(method), Some(id)) => Ok(Incoming::Request {
                id,
                method,
                params: raw.params,
            }),
            (Some(method), None) => Ok(Incoming::Notification {
                method,
                params: raw.params,
            }),
            (None, Some(id)) => {
                let id = id
                    .as_u64()
                    .ok_or_else(|| McpError::Protocol(format!("unexpected response id {}", id)))?;
                let outcome = match raw.error {
                    Some(error) => Err(McpError::Rpc {
                        code: error.code,
                        message: error.message,
                    }),
                    None => Ok(raw.result.unwrap_or(Value::Null)),
                };
                Ok(Incoming::Response { id, outcome })
            }
            (None, None) => Err(McpError::Protocol(
                "message has neither a method nor an id".to_string(),
            )),
        }
    }
}

/// Reply to a server-originated request
pub fn response_frame(id: &Value, result: Result<Value, JsonRpcError>) -> Value {
    match result {
        Ok(result) => json!({"jsonrpc": JSONRPC_VERSION, "id": id, "result": result}),
        Err(error) => json!({"jsonrpc": JSONRPC_VERSION, "id": id, "error": error}),
    }
}

/// Answer the server requests a tool client is expected to handle
pub fn answer_server_request(method: &str) -> Result<Value, JsonRpcError> {
    match method {
        "ping" => Ok(json!({})),
        other => Err(JsonRpcError {
            code: METHOD_NOT_FOUND,
            message: format!("method not supported by client: {}", other),
            data: None,
        }),
    }
}

pub fn initialize_params() -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
        }
    })
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListToolsResult {
    #[serde(default)]
    pub tools: Vec<DiscoveredTool>,
    #[serde(default)]
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentItem {
    Text {
        text: String,
    },
    #[serde(rename_all = "camelCase")]
    Image {
        #[serde(default)]
        mime_type: String,
    },
    Resource {
        resource: Value,
    },
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallToolResult {
    #[serde(default)]
    pub content: Vec<ContentItem>,
    #[serde(default)]
    pub is_error: bool,
}

impl CallToolResult {
    /// Flatten the content items into the text handed back to the model
    pub fn text(&self) -> String {
        let parts: Vec<String> = self
            .content
            .iter()
            .filter_map(|item| match item {
                ContentItem::Text { text } => Some(text.clone()),
                ContentItem::Image { mime_type } => Some(format!("[image: {}]", mime_type)),
                ContentItem::Resource { resource } => resource
                    .get("text")
                    .or_else(|| resource.get("uri"))
                    .and_then(|v| v.as_str())
                    .map(String::from),
                ContentItem::Unsupported => None,
            })
            .collect();

        if parts.is_empty() {
            "Tool executed successfully (no output)".to_string()
        } else {
            parts.join("\n")
        }
    }
}
