use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, info};

use super::protocol::{
    initialize_params, CallToolResult, JsonRpcNotification, JsonRpcRequest, ListToolsResult,
};
use crate::errors::McpError;
use crate::models::tool::DiscoveredTool;

/// Moves JSON-RPC messages to and from one tool server
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a request and wait for the matching response
    async fn request(&self, request: JsonRpcRequest) -> Result<Value, McpError>;

    async fn notify(&self, notification: JsonRpcNotification) -> Result<(), McpError>;

    /// False once the underlying process or session is known to be gone
    fn is_alive(&self) -> bool;

    /// Release the process or session. Safe to call more than once.
    async fn close(&self);
}

/// Sends `notifications/cancelled` if the request it guards is dropped before completing
struct CancelOnDrop {
    transport: Arc<dyn Transport>,
    id: u64,
    armed: bool,
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if !self.armed || !self.transport.is_alive() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let transport = self.transport.clone();
        let id = self.id;
        runtime.spawn(async move {
            debug!(request_id = id, "cancelling abandoned request");
            let _ = transport
                .notify(JsonRpcNotification::cancelled(id, "client abandoned the request"))
                .await;
        });
    }
}

/// An initialized MCP session over some transport
pub struct McpClient {
    server: String,
    transport: Arc<dyn Transport>,
    next_id: AtomicU64,
    timeout: Duration,
}

impl std::fmt::Debug for McpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpClient")
            .field("server", &self.server)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl McpClient {
    /// Perform the initialize handshake. The transport is closed if it fails.
    pub async fn connect(
        server: &str,
        transport: Arc<dyn Transport>,
        timeout: Duration,
    ) -> Result<Self, McpError> {
        let client = Self {
            server: server.to_string(),
            transport,
            next_id: AtomicU64::new(1),
            timeout,
        };

        let handshake = async {
            let result = client.request("initialize", Some(initialize_params())).await?;
            client
                .transport
                .notify(JsonRpcNotification::initialized())
                .await?;
            Ok::<Value, McpError>(result)
        };

        match handshake.await {
            Ok(result) => {
                info!(
                    server,
                    protocol = %result["protocolVersion"].as_str().unwrap_or("unknown"),
                    peer = %result["serverInfo"]["name"].as_str().unwrap_or("unknown"),
                    "tool server initialized"
                );
                Ok(client)
            }
            Err(err) => {
                client.transport.close().await;
                Err(match err {
                    McpError::Connection(_) | McpError::Auth(_) => err,
                    other => McpError::Connection(format!("handshake failed: {}", other)),
                })
            }
        }
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, McpError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut guard = CancelOnDrop {
            transport: self.transport.clone(),
            id,
            armed: true,
        };

        let request = JsonRpcRequest::new(id, method, params);
        let outcome = tokio::time::timeout(self.timeout, self.transport.request(request)).await;
        match outcome {
            Ok(result) => {
                guard.armed = false;
                result
            }
            // The guard stays armed so the server hears about the timeout
            Err(_) => Err(McpError::Timeout(self.timeout)),
        }
    }

    /// Fetch every tool the server offers, following pagination cursors
    pub async fn list_tools(&self) -> Result<Vec<DiscoveredTool>, McpError> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let params = cursor.as_ref().map(|c| json!({"cursor": c}));
            let page: ListToolsResult =
                serde_json::from_value(self.request("tools/list", params).await?)?;
            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) if !next.is_empty() && cursor.as_deref() != Some(next.as_str()) => {
                    cursor = Some(next)
                }
                _ => break,
            }
        }
        Ok(tools)
    }

    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<CallToolResult, McpError> {
        let arguments = if arguments.is_null() { json!({}) } else { arguments };
        let result = self
            .request("tools/call", Some(json!({"name": name, "arguments": arguments})))
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    pub fn is_alive(&self) -> bool {
        self.transport.is_alive()
    }

    pub async fn close(&self) {
        self.transport.close().await;
    }
}
