use std::collections::{BTreeMap, HashMap};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use kill_tree::{blocking::kill_tree_with_config, Config};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::client::Transport;
use super::protocol::{
    answer_server_request, response_frame, Incoming, JsonRpcNotification, JsonRpcRequest,
};
use crate::errors::McpError;

type PendingMap = HashMap<u64, oneshot::Sender<Result<Value, McpError>>>;

/// State shared between the transport handle and its stdout reader task
struct Shared {
    server: String,
    stdin: tokio::sync::Mutex<ChildStdin>,
    pending: Mutex<PendingMap>,
    alive: AtomicBool,
}

impl Shared {
    async fn write_line(&self, line: String) -> Result<(), McpError> {
        let mut stdin = self.stdin.lock().await;
        let written = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            stdin.flush().await
        };
        written.await.map_err(|e| {
            warn!(server = %self.server, "write to tool server failed: {}", e);
            self.mark_dead();
            McpError::Disconnected
        })
    }

    /// Flag the connection as gone and fail every request still waiting
    fn mark_dead(&self) {
        let mut pending = self.pending.lock();
        self.alive.store(false, Ordering::SeqCst);
        for (_, waiter) in pending.drain() {
            let _ = waiter.send(Err(McpError::Disconnected));
        }
    }
}

/// Removes a pending entry when the waiting request goes away, whatever the reason
struct PendingSlot<'a> {
    pending: &'a Mutex<PendingMap>,
    id: u64,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.id);
    }
}

/// A tool server running as a child process, speaking line-delimited JSON-RPC
pub struct StdioTransport {
    shared: Arc<Shared>,
    child: tokio::sync::Mutex<Option<Child>>,
    pid: Option<u32>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl StdioTransport {
    pub fn spawn(
        server: &str,
        command: &str,
        args: &[String],
        env: &BTreeMap<String, String>,
    ) -> Result<Self, McpError> {
        info!(server, command, ?args, "starting tool server process");

        let mut child = Command::new(command)
            .args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| McpError::Connection(format!("failed to spawn '{}': {}", command, e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::Connection("failed to capture stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::Connection("failed to capture stdout".to_string()))?;

        if let Some(stderr) = child.stderr.take() {
            let server = server.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(server = %server, "stderr: {}", line);
                }
            });
        }

        let shared = Arc::new(Shared {
            server: server.to_string(),
            stdin: tokio::sync::Mutex::new(stdin),
            pending: Mutex::new(HashMap::new()),
            alive: AtomicBool::new(true),
        });
        let reader = tokio::spawn(read_loop(shared.clone(), stdout));

        Ok(Self {
            shared,
            pid: child.id(),
            child: tokio::sync::Mutex::new(Some(child)),
            reader: Mutex::new(Some(reader)),
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    #[cfg(test)]
    fn pending_requests(&self) -> usize {
        self.shared.pending.lock().len()
    }
}

async fn read_loop(shared: Arc<Shared>, stdout: ChildStdout) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                warn!(server = %shared.server, "tool server closed its output");
                break;
            }
            Err(e) => {
                warn!(server = %shared.server, "failed to read from tool server: {}", e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        match Incoming::parse(&line) {
            Ok(Incoming::Response { id, outcome }) => {
                if let Some(waiter) = shared.pending.lock().remove(&id) {
                    let _ = waiter.send(outcome);
                } else {
                    debug!(server = %shared.server, id, "response for a request nobody awaits");
                }
            }
            Ok(Incoming::Request { id, method, .. }) => {
                let frame = response_frame(&id, answer_server_request(&method));
                if shared.write_line(frame.to_string()).await.is_err() {
                    break;
                }
            }
            Ok(Incoming::Notification { method, .. }) => {
                debug!(server = %shared.server, method = %method, "notification from tool server");
            }
            Err(e) => {
                debug!(server = %shared.server, "ignoring unparsable line: {}", e);
            }
        }
    }
    shared.mark_dead();
}

#[async_trait]
impl Transport for StdioTransport {
    async fn request(&self, request: JsonRpcRequest) -> Result<Value, McpError> {
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.shared.pending.lock();
            // Checked under the lock so a concurrent crash cannot strand this entry
            if !self.shared.alive.load(Ordering::SeqCst) {
                return Err(McpError::Disconnected);
            }
            pending.insert(request.id, tx);
        }
        let _slot = PendingSlot {
            pending: &self.shared.pending,
            id: request.id,
        };

        self.shared.write_line(serde_json::to_string(&request)?).await?;
        rx.await.unwrap_or(Err(McpError::Disconnected))
    }

    async fn notify(&self, notification: JsonRpcNotification) -> Result<(), McpError> {
        if !self.is_alive() {
            return Err(McpError::Disconnected);
        }
        self.shared
            .write_line(serde_json::to_string(&notification)?)
            .await
    }

    fn is_alive(&self) -> bool {
        self.shared.alive.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.shared.mark_dead();
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }

        let Some(mut child) = self.child.lock().await.take() else {
            return;
        };

        // Tool servers launched through wrappers (npx, uv, sh) leave grandchildren behind
        if let Some(pid) = self.pid {
            let killed = tokio::task::spawn_blocking(move || {
                let config = Config {
                    signal: "SIGKILL".to_string(),
                    ..Default::default()
                };
                kill_tree_with_config(pid, &config)
            })
            .await;
            match killed {
                Ok(Ok(outputs)) => {
                    debug!(server = %self.shared.server, pid, killed = outputs.len(), "killed process tree")
                }
                Ok(Err(e)) => debug!(server = %self.shared.server, pid, "kill_tree failed: {}", e),
                Err(e) => debug!(server = %self.shared.server, pid, "kill_tree task failed: {}", e),
            }
        }

        let _ = child.kill().await;
        info!(server = %self.shared.server, "tool server process stopped");
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;

    fn shell(server: &str, script: &str) -> StdioTransport {
        StdioTransport::spawn(
            server,
            "sh",
            &["-c".to_string(), script.to_string()],
            &BTreeMap::new(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_dropped_request_leaves_no_pending_entry() {
        // Reads requests and never answers
        let transport = shell("silent", "cat > /dev/null");

        let abandoned = tokio::time::timeout(
            Duration::from_millis(100),
            transport.request(JsonRpcRequest::new(7, "tools/call", None)),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(transport.pending_requests(), 0);
        assert!(transport.is_alive());

        transport.close().await;
        assert!(!transport.is_alive());
    }

    #[tokio::test]
    async fn test_exit_fails_waiting_requests() {
        let transport = shell("short-lived", "read line; exit 0");

        let result = transport
            .request(JsonRpcRequest::new(1, "tools/list", None))
            .await;
        assert_eq!(result, Err(McpError::Disconnected));
        assert_eq!(transport.pending_requests(), 0);
        assert!(!transport.is_alive());
        assert_eq!(
            transport.notify(JsonRpcNotification::initialized()).await,
            Err(McpError::Disconnected)
        );
    }
}
