use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use reqwest::Client;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::client::{McpClient, Transport};
use super::http::HttpTransport;
use super::oauth::TokenManager;
use super::protocol::CallToolResult;
use super::stdio::StdioTransport;
use crate::errors::{McpError, ServiceError, ValidationError};
use crate::models::server::{
    RemoteToolServer, ServerInfo, ServerRegistration, ServerStatus, TransportConfig,
};
use crate::models::tool::DiscoveredTool;
use crate::storage::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct McpSettings {
    /// Upper bound for every JSON-RPC request, the handshake included
    pub request_timeout: Duration,
    /// How long `unregister` waits for a connection to shut down
    pub teardown_timeout: Duration,
}

impl Default for McpSettings {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(60),
            teardown_timeout: Duration::from_secs(5),
        }
    }
}

struct ServerEntry {
    server: RemoteToolServer,
    /// Held while connecting, so one server never has two live connections
    connection: Mutex<Option<Arc<McpClient>>>,
    status: parking_lot::Mutex<(ServerStatus, Option<String>)>,
    /// Set once the server is unregistered; no connection may be opened afterwards
    removed: AtomicBool,
}

impl ServerEntry {
    fn new(server: RemoteToolServer) -> Arc<Self> {
        Arc::new(Self {
            server,
            connection: Mutex::new(None),
            status: parking_lot::Mutex::new((ServerStatus::Disconnected, None)),
            removed: AtomicBool::new(false),
        })
    }

    fn set_status(&self, status: ServerStatus, error: Option<String>) {
        *self.status.lock() = (status, error);
    }

    fn info(&self) -> ServerInfo {
        let (status, last_error) = self.status.lock().clone();
        ServerInfo {
            server: self.server.redacted(),
            status,
            last_error,
        }
    }

    /// Close whatever connection is held
    async fn teardown(&self) {
        let client = self.connection.lock().await.take();
        if let Some(client) = client {
            client.close().await;
        }
    }
}

/// Owns the connections to every registered remote tool server, keyed by server name
pub struct McpManager {
    servers: RwLock<HashMap<String, Arc<ServerEntry>>>,
    store: Arc<dyn Store>,
    settings: McpSettings,
    http: Client,
}

impl McpManager {
    pub fn new(store: Arc<dyn Store>, settings: McpSettings) -> Self {
        Self {
            servers: RwLock::new(HashMap::new()),
            store,
            settings,
            http: Client::new(),
        }
    }

    /// Load the persisted server rows. No connection is opened.
    pub async fn restore(&self) -> anyhow::Result<usize> {
        let rows = self.store.load_servers()?;
        let mut servers = self.servers.write().await;
        servers.clear();
        for server in rows {
            servers.insert(server.name.clone(), ServerEntry::new(server));
        }
        Ok(servers.len())
    }

    /// Write the server rows on the blocking pool. The caller keeps the map locked so
    /// writes land in the order they were decided.
    async fn persist(
        &self,
        servers: &HashMap<String, Arc<ServerEntry>>,
        extra: Option<&RemoteToolServer>,
        skip: Option<&str>,
    ) -> anyhow::Result<()> {
        let mut rows: Vec<RemoteToolServer> = servers
            .values()
            .filter(|e| Some(e.server.name.as_str()) != skip)
            .map(|e| e.server.clone())
            .chain(extra.cloned())
            .collect();
        rows.sort_by(|a, b| a.name.cmp(&b.name));
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.save_servers(&rows))
            .await
            .map_err(|e| anyhow::anyhow!("server store write did not finish: {}", e))?
    }

    /// Validate and record a new server. Nothing is stored if validation fails.
    pub async fn register(
        &self,
        registration: ServerRegistration,
    ) -> Result<RemoteToolServer, ServiceError> {
        let server = registration.validate()?;

        let mut servers = self.servers.write().await;
        if servers.contains_key(&server.name) {
            return Err(ValidationError::DuplicateServer(server.name).into());
        }
        self.persist(&servers, Some(&server), None).await?;
        servers.insert(server.name.clone(), ServerEntry::new(server.clone()));

        info!(server = %server.name, transport = server.transport_name(), "registered tool server");
        Ok(server.redacted())
    }

    /// Remove a server and tear its connection down. Returns false if it was not registered.
    ///
    /// Teardown runs in its own task; the call returns once it finishes or the teardown
    /// timeout passes, whichever comes first.
    pub async fn unregister(&self, name: &str) -> Result<bool, ServiceError> {
        let entry = {
            let mut servers = self.servers.write().await;
            if !servers.contains_key(name) {
                return Ok(false);
            }
            self.persist(&servers, None, Some(name)).await?;
            servers.remove(name)
        };
        let Some(entry) = entry else {
            return Ok(false);
        };

        info!(server = name, "unregistered tool server");
        entry.removed.store(true, Ordering::SeqCst);
        let teardown = tokio::spawn(async move { entry.teardown().await });
        if tokio::time::timeout(self.settings.teardown_timeout, teardown)
            .await
            .is_err()
        {
            warn!(server = name, "teardown still running after {:?}", self.settings.teardown_timeout);
        }
        Ok(true)
    }

    /// Every registered server with its status, secrets masked, ordered by name
    pub async fn list_servers(&self) -> Vec<ServerInfo> {
        let servers = self.servers.read().await;
        let mut infos: Vec<ServerInfo> = servers.values().map(|e| e.info()).collect();
        infos.sort_by(|a, b| a.server.name.cmp(&b.server.name));
        infos
    }

    pub async fn server_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.servers.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.servers.read().await.contains_key(name)
    }

    async fn entry(&self, name: &str) -> Result<Arc<ServerEntry>, McpError> {
        self.servers
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| McpError::ServerNotFound(name.to_string()))
    }

    async fn open(&self, server: &RemoteToolServer) -> Result<Arc<McpClient>, McpError> {
        let transport: Arc<dyn Transport> = match &server.transport {
            TransportConfig::Stdio { command, args, env } => {
                Arc::new(StdioTransport::spawn(&server.name, command, args, env)?)
            }
            TransportConfig::Http {
                url,
                headers,
                client_id,
                client_secret,
                token_url,
            } => {
                let tokens = match (client_id, client_secret) {
                    (Some(id), Some(secret)) => Some(TokenManager::new(
                        self.http.clone(),
                        url,
                        token_url.clone(),
                        id,
                        secret,
                    )?),
                    _ => None,
                };
                Arc::new(HttpTransport::new(
                    &server.name,
                    self.http.clone(),
                    url,
                    headers,
                    tokens,
                )?)
            }
        };
        let client =
            McpClient::connect(&server.name, transport, self.settings.request_timeout).await?;
        Ok(Arc::new(client))
    }

    /// The live connection for `entry`, opening a fresh one if there is none or the
    /// previous one died
    async fn connection(&self, entry: &ServerEntry) -> Result<Arc<McpClient>, McpError> {
        let mut slot = entry.connection.lock().await;
        // A caller that looked the entry up before it was unregistered
        if entry.removed.load(Ordering::SeqCst) {
            return Err(McpError::ServerNotFound(entry.server.name.clone()));
        }
        if let Some(client) = slot.as_ref() {
            if client.is_alive() {
                return Ok(client.clone());
            }
            debug!(server = %entry.server.name, "connection lost, reconnecting");
        }
        if let Some(stale) = slot.take() {
            stale.close().await;
        }

        match self.open(&entry.server).await {
            Ok(client) => {
                entry.set_status(ServerStatus::Connected, None);
                *slot = Some(client.clone());
                Ok(client)
            }
            Err(e) => {
                warn!(server = %entry.server.name, "failed to connect: {}", e);
                entry.set_status(ServerStatus::Unreachable, Some(e.to_string()));
                Err(e)
            }
        }
    }

    /// Record a failed call. Connection-class failures drop the connection so the
    /// next use starts over.
    async fn record_failure(&self, entry: &ServerEntry, client: &Arc<McpClient>, error: &McpError) {
        if !error.is_connection_failure() {
            return;
        }
        warn!(server = %entry.server.name, "tool server unreachable: {}", error);
        entry.set_status(ServerStatus::Unreachable, Some(error.to_string()));

        let mut slot = entry.connection.lock().await;
        if slot.as_ref().is_some_and(|c| Arc::ptr_eq(c, client)) {
            slot.take();
            drop(slot);
            client.close().await;
        }
    }

    /// Ask the server for its current tool list
    pub async fn discover_tools(&self, name: &str) -> Result<Vec<DiscoveredTool>, McpError> {
        let entry = self.entry(name).await?;
        let client = self.connection(&entry).await?;
        match client.list_tools().await {
            Ok(tools) => {
                info!(server = name, count = tools.len(), "discovered tools");
                Ok(tools)
            }
            Err(e) => {
                self.record_failure(&entry, &client, &e).await;
                Err(e)
            }
        }
    }

    /// Call `tool` on `server`. Concurrent calls share the server's single connection.
    pub async fn invoke(
        &self,
        server: &str,
        tool: &str,
        arguments: Value,
    ) -> Result<CallToolResult, McpError> {
        let entry = self.entry(server).await?;
        let client = self.connection(&entry).await?;
        debug!(server, tool, "invoking remote tool");
        match client.call_tool(tool, arguments).await {
            Ok(result) => Ok(result),
            Err(e) => {
                self.record_failure(&entry, &client, &e).await;
                Err(e)
            }
        }
    }

    /// Close every connection, each bounded by the teardown timeout
    pub async fn shutdown_all(&self) {
        let entries: Vec<Arc<ServerEntry>> = self.servers.read().await.values().cloned().collect();
        let timeout = self.settings.teardown_timeout;
        join_all(entries.into_iter().map(|entry| async move {
            if tokio::time::timeout(timeout, entry.teardown()).await.is_err() {
                warn!(server = %entry.server.name, "teardown timed out during shutdown");
            }
            entry.set_status(ServerStatus::Disconnected, None);
        }))
        .await;
    }
}
