//! The operations offered to the outer layers, wiring the orchestrator, the tool
//! registry and the server manager together.

use std::sync::Arc;

use futures::future::join_all;
use futures::stream::BoxStream;
use tracing::{info, warn};

use crate::agent::{Agent, AgentConfig, StreamEvent};
use crate::builtin::default_tools;
use crate::errors::ServiceError;
use crate::mcp::{McpManager, McpSettings};
use crate::models::message::Message;
use crate::models::server::{RemoteToolServer, ServerInfo, ServerRegistration};
use crate::models::tool::{Tool, ToolId, ToolUpdate};
use crate::providers::base::Provider;
use crate::registry::ToolRegistry;
use crate::storage::Store;

pub struct Assistant {
    agent: Agent,
    registry: Arc<ToolRegistry>,
    servers: Arc<McpManager>,
}

impl Assistant {
    pub fn new(
        provider: Arc<dyn Provider>,
        store: Arc<dyn Store>,
        config: AgentConfig,
        settings: McpSettings,
    ) -> Self {
        let registry = Arc::new(ToolRegistry::new(store.clone()));
        let servers = Arc::new(McpManager::new(store, settings));
        let agent = Agent::new(provider, registry.clone(), servers.clone(), config);
        Self {
            agent,
            registry,
            servers,
        }
    }

    /// Load persisted rows and seed the built-in tools. Does not contact any server.
    pub async fn start(&self) -> Result<(), ServiceError> {
        let tools = self.registry.restore().await?;
        let servers = self.servers.restore().await?;
        self.registry.seed_builtins(default_tools()).await?;
        info!(tools, servers, "restored assistant state");
        Ok(())
    }

    /// Start a chat turn
    pub fn chat(&self, message: &str, history: Vec<Message>) -> BoxStream<'static, StreamEvent> {
        self.agent.reply(history, message)
    }

    pub fn list_tools(&self) -> Vec<Tool> {
        self.registry.list()
    }

    pub async fn update_tool(&self, id: ToolId, update: ToolUpdate) -> Result<Tool, ServiceError> {
        Ok(self.registry.update(id, update).await?)
    }

    pub async fn list_servers(&self) -> Vec<ServerInfo> {
        self.servers.list_servers().await
    }

    /// Register a server and discover its tools right away. A server that cannot be
    /// reached stays registered and is reported as unreachable.
    pub async fn register_server(
        &self,
        registration: ServerRegistration,
    ) -> Result<RemoteToolServer, ServiceError> {
        let server = self.servers.register(registration).await?;
        self.sync_server(&server.name).await?;
        Ok(server)
    }

    /// Remove a server together with every tool it contributed
    pub async fn delete_server(&self, name: &str) -> Result<(), ServiceError> {
        if !self.servers.unregister(name).await? {
            return Err(ServiceError::NotFound(format!("tool server '{}'", name)));
        }
        let removed = self.registry.remove_server(name).await?;
        info!(server = name, removed, "deleted tool server");
        Ok(())
    }

    /// Rediscover the tools of every registered server, concurrently
    pub async fn sync_tools(&self) -> Result<Vec<Tool>, ServiceError> {
        let names = self.servers.server_names().await;

        // Tools left behind by servers that are no longer registered
        for orphan in self.registry.remote_servers() {
            if !names.contains(&orphan) {
                self.registry.remove_server(&orphan).await?;
            }
        }

        let outcomes = join_all(names.iter().map(|name| self.sync_server(name))).await;
        outcomes.into_iter().collect::<Result<Vec<()>, _>>()?;
        Ok(self.registry.list())
    }

    /// Discovery failures keep the server's previous tools
    async fn sync_server(&self, name: &str) -> Result<(), ServiceError> {
        let discovered = match self.servers.discover_tools(name).await {
            Ok(discovered) => discovered,
            Err(e) => {
                warn!(server = name, "tool discovery failed, keeping existing tools: {}", e);
                return Ok(());
            }
        };
        // Deleted while discovery was running
        if !self.servers.contains(name).await {
            return Ok(());
        }
        let tools = self.registry.upsert_from_discovery(name, &discovered).await?;
        info!(server = name, tools = tools.len(), "synced tools");
        Ok(())
    }

    /// Tear down every tool-server connection
    pub async fn shutdown(&self) {
        self.servers.shutdown_all().await;
    }
}
