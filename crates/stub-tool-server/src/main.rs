//! A small MCP tool server speaking line-delimited JSON-RPC over stdio.
//!
//! Used to exercise the assistant's stdio transport end to end: it answers the
//! handshake, lists a fixed set of tools and can be asked to crash or stall.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

const DEFAULT_PROTOCOL_VERSION: &str = "2025-03-26";

#[derive(Debug, Deserialize)]
struct Frame {
    #[serde(default)]
    id: Option<Value>,
    method: Option<String>,
    #[serde(default)]
    params: Value,
}

#[derive(Default)]
struct State {
    in_flight: Mutex<HashMap<String, AbortHandle>>,
    cancelled: AtomicUsize,
    sleeping: AtomicUsize,
}

/// Counts a `slow` call as sleeping until it finishes or is aborted
struct Sleeping<'a>(&'a AtomicUsize);

impl<'a> Sleeping<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for Sleeping<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn tools() -> Value {
    json!([
        {
            "name": "get_weather",
            "description": "Current weather for a city",
            "inputSchema": {
                "type": "object",
                "properties": {"city": {"type": "string"}},
                "required": ["city"]
            }
        },
        {
            "name": "echo",
            "description": "Repeat the given text",
            "inputSchema": {
                "type": "object",
                "properties": {"text": {"type": "string"}}
            }
        },
        {
            "name": "slow",
            "description": "Wait for the given number of milliseconds",
            "inputSchema": {
                "type": "object",
                "properties": {"ms": {"type": "integer"}}
            }
        },
        {
            "name": "whoami",
            "description": "Report the server's process id"
        },
        {
            "name": "stats",
            "description": "Cancellations received and slow calls still running"
        },
        {
            "name": "crash",
            "description": "Exit immediately without answering"
        }
    ])
}

fn text_result(text: impl Into<String>, is_error: bool) -> Value {
    json!({
        "content": [{"type": "text", "text": text.into()}],
        "isError": is_error
    })
}

async fn call_tool(state: &State, params: &Value) -> Value {
    let name = params["name"].as_str().unwrap_or_default();
    let arguments = &params["arguments"];
    match name {
        "get_weather" => match arguments["city"].as_str() {
            Some(_) => text_result(json!({"tempC": 18}).to_string(), false),
            None => text_result("city is required", true),
        },
        "echo" => text_result(arguments["text"].as_str().unwrap_or_default(), false),
        "slow" => {
            let ms = arguments["ms"].as_u64().unwrap_or(1000);
            let _sleeping = Sleeping::enter(&state.sleeping);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            text_result(format!("waited {}ms", ms), false)
        }
        "whoami" => text_result(std::process::id().to_string(), false),
        "stats" => text_result(
            json!({
                "cancelled": state.cancelled.load(Ordering::SeqCst),
                "sleeping": state.sleeping.load(Ordering::SeqCst)
            })
            .to_string(),
            false,
        ),
        "crash" => {
            info!("crashing on request");
            std::process::exit(1);
        }
        other => text_result(format!("unknown tool: {}", other), true),
    }
}

async fn handle(state: &State, method: &str, params: &Value) -> Result<Value, (i64, String)> {
    match method {
        "initialize" => Ok(json!({
            "protocolVersion": params["protocolVersion"]
                .as_str()
                .unwrap_or(DEFAULT_PROTOCOL_VERSION),
            "capabilities": {"tools": {}},
            "serverInfo": {"name": env!("CARGO_PKG_NAME"), "version": env!("CARGO_PKG_VERSION")}
        })),
        "ping" => Ok(json!({})),
        "tools/list" => Ok(json!({"tools": tools()})),
        "tools/call" => Ok(call_tool(state, params).await),
        other => Err((-32601, format!("Method not found: {}", other))),
    }
}

fn response(id: Value, outcome: Result<Value, (i64, String)>) -> Value {
    match outcome {
        Ok(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
        Err((code, message)) => json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {"code": code, "message": message}
        }),
    }
}

fn dispatch(frame: Frame, out: mpsc::UnboundedSender<String>, state: Arc<State>) {
    let Some(method) = frame.method else {
        // Responses to requests we never send
        return;
    };

    let Some(id) = frame.id else {
        if method == "notifications/cancelled" {
            let key = frame.params["requestId"].to_string();
            let handle = state
                .in_flight
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&key);
            if let Some(handle) = handle {
                debug!(request = %key, "cancelling request");
                handle.abort();
                state.cancelled.fetch_add(1, Ordering::SeqCst);
            }
        }
        return;
    };

    let key = id.to_string();
    // Held across the spawn so the task cannot finish before it is registered
    let mut in_flight = state.in_flight.lock().unwrap_or_else(|e| e.into_inner());
    let task_state = state.clone();
    let task_key = key.clone();
    let task = tokio::spawn(async move {
        let outcome = handle(&task_state, &method, &frame.params).await;
        task_state
            .in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&task_key);
        let _ = out.send(response(id, outcome).to_string());
    });
    in_flight.insert(key, task.abort_handle());
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    // stdout carries the protocol, logs go to stderr
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = rx.recv().await {
            stdout.write_all(line.as_bytes()).await?;
            stdout.write_all(b"\n").await?;
            stdout.flush().await?;
        }
        Ok::<_, std::io::Error>(())
    });

    info!(pid = std::process::id(), "stub tool server ready");
    let state: Arc<State> = Arc::default();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Frame>(&line) {
            Ok(frame) => dispatch(frame, tx.clone(), state.clone()),
            Err(e) => {
                let _ = tx.send(response(Value::Null, Err((-32700, format!("Parse error: {}", e)))).to_string());
            }
        }
    }

    info!("input closed, exiting");
    drop(tx);
    // Let in-flight answers drain before the writer stops
    tokio::time::timeout(Duration::from_secs(1), writer).await.ok();
    Ok(())
}
