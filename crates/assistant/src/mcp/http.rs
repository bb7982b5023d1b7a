use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde_json::Value;
use tracing::{debug, info};

use super::client::Transport;
use super::oauth::TokenManager;
use super::protocol::{
    answer_server_request, response_frame, Incoming, JsonRpcNotification, JsonRpcRequest,
};
use crate::errors::McpError;

const SESSION_HEADER: &str = "mcp-session-id";
const ACCEPT_BOTH: &str = "application/json, text/event-stream";

/// A tool server reached over streamable HTTP. Each JSON-RPC request is its own POST,
/// so concurrent calls share the client's connection pool and one session id.
pub struct HttpTransport {
    server: String,
    client: Client,
    url: String,
    headers: HeaderMap,
    session_id: Mutex<Option<String>>,
    tokens: Option<TokenManager>,
    closed: AtomicBool,
}

fn header_map(headers: &BTreeMap<String, String>) -> Result<HeaderMap, McpError> {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| McpError::Connection(format!("invalid header name '{}': {}", name, e)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| McpError::Connection(format!("invalid value for header {}: {}", name, e)))?;
        map.insert(name, value);
    }
    Ok(map)
}

impl HttpTransport {
    pub fn new(
        server: &str,
        client: Client,
        url: &str,
        headers: &BTreeMap<String, String>,
        tokens: Option<TokenManager>,
    ) -> Result<Self, McpError> {
        Ok(Self {
            server: server.to_string(),
            client,
            url: url.to_string(),
            headers: header_map(headers)?,
            session_id: Mutex::new(None),
            tokens,
            closed: AtomicBool::new(false),
        })
    }

    async fn authorize(&self, request: RequestBuilder) -> Result<RequestBuilder, McpError> {
        let mut request = request.headers(self.headers.clone());
        let session = self.session_id.lock().clone();
        if let Some(session) = session {
            request = request.header(SESSION_HEADER, session);
        }
        if let Some(tokens) = &self.tokens {
            request = request.bearer_auth(tokens.get_valid_token().await?);
        }
        Ok(request)
    }

    /// POST one frame, retrying once with a fresh token if the server rejects ours
    async fn post(&self, body: &Value) -> Result<Response, McpError> {
        let mut retried = false;
        loop {
            let had_session = self.session_id.lock().is_some();
            let request = self
                .authorize(self.client.post(&self.url).header(ACCEPT, ACCEPT_BOTH))
                .await?
                .json(body);
            let response = request.send().await?;

            if let Some(session) = response
                .headers()
                .get(SESSION_HEADER)
                .and_then(|v| v.to_str().ok())
            {
                *self.session_id.lock() = Some(session.to_string());
            }

            let status = response.status();
            match status {
                StatusCode::UNAUTHORIZED if !retried && self.tokens.is_some() => {
                    debug!(server = %self.server, "token rejected, refreshing");
                    if let Some(tokens) = &self.tokens {
                        tokens.invalidate().await;
                    }
                    retried = true;
                }
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                    return Err(McpError::Auth(format!("tool server answered {}", status)));
                }
                StatusCode::NOT_FOUND if had_session => {
                    // The server forgot our session; a new connection must initialize again
                    self.closed.store(true, Ordering::SeqCst);
                    return Err(McpError::Disconnected);
                }
                status if !status.is_success() => {
                    let text = response.text().await.unwrap_or_default();
                    return Err(McpError::Transport(format!("HTTP {}: {}", status, text)));
                }
                _ => return Ok(response),
            }
        }
    }

    async fn read_event_stream(&self, response: Response, request_id: u64) -> Result<Value, McpError> {
        let mut events = response.bytes_stream().eventsource();
        while let Some(event) = events.next().await {
            let event = event.map_err(|e| McpError::Transport(e.to_string()))?;
            if event.data.trim().is_empty() {
                continue;
            }
            match Incoming::parse(&event.data) {
                Ok(Incoming::Response { id, outcome }) if id == request_id => return outcome,
                Ok(Incoming::Request { id, method, .. }) => {
                    let frame = response_frame(&id, answer_server_request(&method));
                    if let Err(e) = self.post(&frame).await {
                        debug!(server = %self.server, "failed to answer {}: {}", method, e);
                    }
                }
                Ok(other) => debug!(server = %self.server, "ignoring stream message: {:?}", other),
                Err(e) => debug!(server = %self.server, "ignoring unparsable event: {}", e),
            }
        }
        Err(McpError::Transport(
            "event stream ended before the response arrived".to_string(),
        ))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn request(&self, request: JsonRpcRequest) -> Result<Value, McpError> {
        if !self.is_alive() {
            return Err(McpError::Disconnected);
        }
        let response = self.post(&serde_json::to_value(&request)?).await?;

        let is_stream = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.starts_with("text/event-stream"))
            .unwrap_or(false);
        if is_stream {
            return self.read_event_stream(response, request.id).await;
        }

        let text = response.text().await?;
        match Incoming::parse(&text)? {
            Incoming::Response { id, outcome } if id == request.id => outcome,
            _ => Err(McpError::Protocol(format!(
                "expected the response to request {}",
                request.id
            ))),
        }
    }

    async fn notify(&self, notification: JsonRpcNotification) -> Result<(), McpError> {
        if !self.is_alive() {
            return Err(McpError::Disconnected);
        }
        self.post(&serde_json::to_value(&notification)?).await?;
        Ok(())
    }

    fn is_alive(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.session_id.lock().is_none() {
            return;
        }
        let ended = async {
            let request = self.authorize(self.client.delete(&self.url)).await?;
            request.send().await?;
            Ok::<(), McpError>(())
        };
        if let Err(e) = ended.await {
            debug!(server = %self.server, "failed to end session: {}", e);
        }
        self.session_id.lock().take();
        info!(server = %self.server, "tool server session closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn transport(server: &MockServer, tokens: Option<TokenManager>) -> HttpTransport {
        let mut headers = BTreeMap::new();
        headers.insert("x-team".to_string(), "tools".to_string());
        HttpTransport::new(
            "remote",
            Client::new(),
            &format!("{}/mcp", server.uri()),
            &headers,
            tokens,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_json_response_and_session_tracking() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/mcp"))
            .and(header(SESSION_HEADER, "s-1"))
            .and(header("x-team", "tools"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0", "id": 2, "result": {"tools": []}
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/mcp"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header(SESSION_HEADER, "s-1")
                    .set_body_json(json!({
                        "jsonrpc": "2.0", "id": 1, "result": {"protocolVersion": "2025-03-26"}
                    })),
            )
            .up_to_n_times(1)
            .mount(&server)
            .await;

        let transport = transport(&server, None);
        let init = transport
            .request(JsonRpcRequest::new(1, "initialize", None))
            .await
            .unwrap();
        assert_eq!(init["protocolVersion"], "2025-03-26");

        let tools = transport
            .request(JsonRpcRequest::new(2, "tools/list", None))
            .await
            .unwrap();
        assert_eq!(tools, json!({"tools": []}));
    }

    #[tokio::test]
    async fn test_event_stream_response() {
        let server = MockServer::start().await;
        let body = concat!(
            "event: message\n",
            "data: {\"jsonrpc\":\"2.0\",\"method\":\"notifications/progress\"}\n\n",
            "event: message\n",
            "data: {\"jsonrpc\":\"2.0\",\"id\":7,\"result\":{\"content\":[]}}\n\n",
        );
        Mock::given(method("POST"))
            .and(path("/mcp"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&server)
            .await;

        let result = transport(&server, None)
            .request(JsonRpcRequest::new(7, "tools/call", None))
            .await
            .unwrap();
        assert_eq!(result, json!({"content": []}));
    }

    #[tokio::test]
    async fn test_rejected_token_is_refreshed_once() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "tok", "expires_in": 3600
            })))
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/mcp"))
            .respond_with(ResponseTemplate::new(401))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/mcp"))
            .and(header("authorization", "Bearer tok"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0", "id": 1, "result": {}
            })))
            .mount(&server)
            .await;

        let tokens = TokenManager::new(
            Client::new(),
            &server.uri(),
            Some(format!("{}/token", server.uri())),
            "id",
            "secret",
        )
        .unwrap();
        let result = transport(&server, Some(tokens))
            .request(JsonRpcRequest::new(1, "initialize", None))
            .await;
        assert_eq!(result.unwrap(), json!({}));
    }

    #[tokio::test]
    async fn test_expired_session_disconnects() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/mcp"))
            .and(header(SESSION_HEADER, "gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let transport = transport(&server, None);
        *transport.session_id.lock() = Some("gone".to_string());

        let err = transport
            .request(JsonRpcRequest::new(3, "tools/list", None))
            .await
            .unwrap_err();
        assert_eq!(err, McpError::Disconnected);
        assert!(!transport.is_alive());
    }

    #[tokio::test]
    async fn test_close_ends_session() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/mcp"))
            .and(header(SESSION_HEADER, "s-9"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let transport = transport(&server, None);
        *transport.session_id.lock() = Some("s-9".to_string());
        transport.close().await;
        transport.close().await;

        assert!(!transport.is_alive());
        assert!(matches!(
            transport.notify(JsonRpcNotification::initialized()).await,
            Err(McpError::Disconnected)
        ));
    }
}
