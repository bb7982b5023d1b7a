use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Value};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

use super::protocol::PROTOCOL_VERSION;

/// Answers MCP JSON-RPC over plain JSON HTTP responses
struct McpResponder {
    tools: Arc<Mutex<Value>>,
}

impl Respond for McpResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let Ok(body) = serde_json::from_slice::<Value>(&request.body) else {
            return ResponseTemplate::new(400);
        };
        let Some(id) = body.get("id").cloned() else {
            return ResponseTemplate::new(202);
        };
        let result = match body["method"].as_str() {
            Some("initialize") => json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {"tools": {}},
                "serverInfo": {"name": "mock", "version": "0.1.0"}
            }),
            Some("tools/list") => json!({"tools": self.tools.lock().clone()}),
            Some("tools/call") => {
                let params = &body["params"];
                json!({
                    "content": [{
                        "type": "text",
                        "text": format!("{} called with {}", params["name"].as_str().unwrap_or(""), params["arguments"])
                    }]
                })
            }
            _ => {
                return ResponseTemplate::new(200).set_body_json(json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": {"code": -32601, "message": "method not found"}
                }))
            }
        };
        ResponseTemplate::new(200)
            .insert_header("mcp-session-id", "mock-session")
            .set_body_json(json!({"jsonrpc": "2.0", "id": id, "result": result}))
    }
}

/// An HTTP tool server whose tool list can be changed between discoveries
pub struct MockMcpServer {
    pub server: MockServer,
    tools: Arc<Mutex<Value>>,
}

impl MockMcpServer {
    pub async fn start(tools: Value) -> Self {
        let server = MockServer::start().await;
        let tools = Arc::new(Mutex::new(tools));
        Mock::given(method("POST"))
            .and(path("/mcp"))
            .respond_with(McpResponder {
                tools: tools.clone(),
            })
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/mcp"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Self { server, tools }
    }

    pub fn url(&self) -> String {
        format!("{}/mcp", self.server.uri())
    }

    /// How many requests the server has seen so far
    pub async fn request_count(&self) -> usize {
        self.server
            .received_requests()
            .await
            .map(|requests| requests.len())
            .unwrap_or_default()
    }

    pub fn set_tools(&self, tools: Value) {
        *self.tools.lock() = tools;
    }
}
