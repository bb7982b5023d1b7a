//! The tool catalog shared by every turn.
//!
//! The catalog is an immutable value behind an `Arc`. Readers clone the `Arc` and keep a
//! consistent view for as long as they like; writers build a modified copy, persist it
//! and then swap it in. Writers queue on an async mutex and the file write runs on the
//! blocking pool, so the catalog lock is only ever held for the swap itself.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::anyhow;
use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::Mutex;

use crate::builtin::BuiltinTool;
use crate::errors::RegistryError;
use crate::models::tool::{
    DiscoveredTool, Tool, ToolId, ToolSource, ToolSpec, ToolTable, ToolUpdate,
};
use crate::providers::utils::sanitize_function_name;
use crate::storage::Store;

const NO_DESCRIPTION: &str = "No description provided";

#[derive(Clone, Default)]
struct Catalog {
    tools: Vec<Tool>,
    /// High-water mark of issued ids; only ever grows
    last_id: ToolId,
    handlers: HashMap<String, Arc<dyn BuiltinTool>>,
}

impl Catalog {
    fn next_id(&mut self) -> ToolId {
        self.last_id += 1;
        self.last_id
    }

    fn find_mut(&mut self, id: ToolId) -> Result<&mut Tool, RegistryError> {
        self.tools
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }
}

/// Where a resolved tool call should be sent
#[derive(Clone)]
pub enum ToolTarget {
    BuiltIn(Arc<dyn BuiltinTool>),
    Remote { server: String, tool: String },
}

impl std::fmt::Debug for ToolTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ToolTarget::BuiltIn(tool) => write!(f, "BuiltIn({})", tool.name()),
            ToolTarget::Remote { server, tool } => write!(f, "Remote({}/{})", server, tool),
        }
    }
}

/// A frozen view of the catalog, taken when a turn starts
#[derive(Clone)]
pub struct ToolSnapshot(Arc<Catalog>);

impl ToolSnapshot {
    pub fn enabled(&self) -> impl Iterator<Item = &Tool> {
        self.0.tools.iter().filter(|t| t.enabled)
    }

    pub fn specs(&self) -> Vec<ToolSpec> {
        self.enabled().map(Tool::spec).collect()
    }

    /// Find an enabled tool by the name the model was given
    pub fn resolve(&self, name: &str) -> Option<(Tool, ToolTarget)> {
        let tool = self.enabled().find(|t| t.name == name)?;
        let target = match tool.source {
            ToolSource::BuiltIn => ToolTarget::BuiltIn(self.0.handlers.get(&tool.name)?.clone()),
            ToolSource::Remote => ToolTarget::Remote {
                server: tool.remote_server_name.clone()?,
                tool: tool
                    .remote_tool_name
                    .clone()
                    .unwrap_or_else(|| tool.name.clone()),
            },
        };
        Some((tool.clone(), target))
    }
}

pub struct ToolRegistry {
    catalog: RwLock<Arc<Catalog>>,
    /// Serializes writers from copy to swap
    writer: Mutex<()>,
    store: Arc<dyn Store>,
}

impl ToolRegistry {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            catalog: RwLock::new(Arc::new(Catalog::default())),
            writer: Mutex::new(()),
            store,
        }
    }

    /// Apply `change` to a copy of the catalog, persist it, then publish it.
    /// Nothing is published if either step fails.
    async fn mutate<T, F>(&self, change: F) -> Result<T, RegistryError>
    where
        F: FnOnce(&mut Catalog) -> Result<T, RegistryError>,
    {
        let _writer = self.writer.lock().await;
        let mut next = Catalog::clone(&self.catalog.read());
        let output = change(&mut next)?;

        let table = ToolTable {
            last_id: next.last_id,
            tools: next.tools.clone(),
        };
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.save_tools(&table))
            .await
            .map_err(|e| anyhow!("tool store write did not finish: {}", e))??;

        *self.catalog.write() = Arc::new(next);
        Ok(output)
    }

    /// Replace the in-memory rows with whatever the store holds
    pub async fn restore(&self) -> Result<usize, RegistryError> {
        let _writer = self.writer.lock().await;
        let store = self.store.clone();
        let mut table = tokio::task::spawn_blocking(move || store.load_tools())
            .await
            .map_err(|e| anyhow!("tool store read did not finish: {}", e))??;
        table.tools.sort_by_key(|t| t.id);
        let count = table.tools.len();
        // Rows written before the mark was stored still count
        let last_id = table
            .tools
            .iter()
            .map(|t| t.id)
            .fold(table.last_id, ToolId::max);

        let mut guard = self.catalog.write();
        let handlers = guard.handlers.clone();
        *guard = Arc::new(Catalog {
            tools: table.tools,
            last_id,
            handlers,
        });
        Ok(count)
    }

    /// Make sure every built-in tool has a row and a handler. Rows that already exist
    /// keep their enabled flag and custom context.
    pub async fn seed_builtins(
        &self,
        builtins: Vec<Arc<dyn BuiltinTool>>,
    ) -> Result<(), RegistryError> {
        self.mutate(|catalog| {
            let now = Utc::now();
            for builtin in builtins {
                let name = builtin.name().to_string();
                let existing = catalog
                    .tools
                    .iter_mut()
                    .find(|t| t.name == name && t.source == ToolSource::BuiltIn);
                match existing {
                    Some(tool) => {
                        tool.description = builtin.description().to_string();
                        tool.default_context = builtin.default_context().to_string();
                        tool.schema = builtin.input_schema();
                    }
                    None => {
                        // A remote tool squatting on a built-in name gives it up
                        if let Some(remote) = catalog.tools.iter_mut().find(|t| t.name == name) {
                            let server = remote.remote_server_name.clone().unwrap_or_default();
                            remote.name = qualified_name(&server, &name);
                        }
                        let id = catalog.next_id();
                        catalog.tools.push(Tool {
                            id,
                            name: name.clone(),
                            description: builtin.description().to_string(),
                            default_context: builtin.default_context().to_string(),
                            custom_context: None,
                            enabled: true,
                            source: ToolSource::BuiltIn,
                            remote_server_name: None,
                            remote_tool_name: None,
                            schema: builtin.input_schema(),
                            created_at: now,
                            updated_at: now,
                        });
                    }
                }
                catalog.handlers.insert(name, builtin);
            }
            Ok(())
        })
        .await
    }

    pub fn snapshot(&self) -> ToolSnapshot {
        ToolSnapshot(self.catalog.read().clone())
    }

    /// All tools ordered by id
    pub fn list(&self) -> Vec<Tool> {
        self.catalog.read().tools.clone()
    }

    pub fn get(&self, id: ToolId) -> Result<Tool, RegistryError> {
        self.catalog
            .read()
            .tools
            .iter()
            .find(|t| t.id == id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    /// Look a tool up by name, enabled or not
    pub fn resolve(&self, name: &str) -> Result<Tool, RegistryError> {
        self.catalog
            .read()
            .tools
            .iter()
            .find(|t| t.name == name)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    pub async fn set_enabled(&self, id: ToolId, enabled: bool) -> Result<Tool, RegistryError> {
        self.update(
            id,
            ToolUpdate {
                enabled: Some(enabled),
                custom_context: None,
            },
        )
        .await
    }

    /// Set the context override. An empty string clears it.
    pub async fn set_custom_context(&self, id: ToolId, text: &str) -> Result<Tool, RegistryError> {
        self.update(
            id,
            ToolUpdate {
                enabled: None,
                custom_context: Some(text.to_string()),
            },
        )
        .await
    }

    /// Apply both parts of an update in one step
    pub async fn update(&self, id: ToolId, update: ToolUpdate) -> Result<Tool, RegistryError> {
        self.mutate(|catalog| {
            let tool = catalog.find_mut(id)?;
            if let Some(enabled) = update.enabled {
                tool.enabled = enabled;
            }
            if let Some(text) = update.custom_context {
                tool.custom_context = if text.trim().is_empty() {
                    None
                } else {
                    Some(text)
                };
            }
            tool.updated_at = Utc::now();
            Ok(tool.clone())
        })
        .await
    }

    /// Reconcile the tools of `server` with what it just reported.
    ///
    /// Tools still reported keep their id, name, enabled flag and custom context; new ones
    /// are added enabled; ones no longer reported are removed. Returns the server's tools.
    pub async fn upsert_from_discovery(
        &self,
        server: &str,
        discovered: &[DiscoveredTool],
    ) -> Result<Vec<Tool>, RegistryError> {
        self.mutate(|catalog| {
            let now = Utc::now();
            let owned_by_server =
                |t: &Tool| t.remote_server_name.as_deref() == Some(server);

            let (mut existing, others): (Vec<Tool>, Vec<Tool>) =
                catalog.tools.drain(..).partition(|t| owned_by_server(t));
            let mut taken: HashSet<String> = others.iter().map(|t| t.name.clone()).collect();
            let mut kept = Vec::new();
            let mut fresh = Vec::new();
            let mut seen = HashSet::new();

            for descriptor in discovered {
                if !seen.insert(descriptor.name.as_str()) {
                    continue;
                }
                let description = descriptor
                    .description
                    .clone()
                    .filter(|d| !d.trim().is_empty())
                    .unwrap_or_else(|| NO_DESCRIPTION.to_string());
                let position = existing
                    .iter()
                    .position(|t| t.remote_tool_name.as_deref() == Some(descriptor.name.as_str()));

                match position {
                    Some(position) => {
                        let mut tool = existing.swap_remove(position);
                        if tool.description != description || tool.schema != descriptor.input_schema
                        {
                            tool.description = description;
                            tool.schema = descriptor.input_schema.clone();
                            tool.updated_at = now;
                        }
                        taken.insert(tool.name.clone());
                        kept.push(tool);
                    }
                    None => fresh.push((descriptor, description)),
                }
            }

            let removed = existing.len();
            for (descriptor, description) in fresh {
                let name = unique_name(server, &descriptor.name, &taken);
                taken.insert(name.clone());
                kept.push(Tool {
                    id: catalog.next_id(),
                    name,
                    description,
                    default_context: format!(
                        "You are using the {} tool from {} MCP server.",
                        descriptor.name, server
                    ),
                    custom_context: None,
                    enabled: true,
                    source: ToolSource::Remote,
                    remote_server_name: Some(server.to_string()),
                    remote_tool_name: Some(descriptor.name.clone()),
                    schema: descriptor.input_schema.clone(),
                    created_at: now,
                    updated_at: now,
                });
            }

            tracing::debug!(server, total = kept.len(), removed, "reconciled discovered tools");

            let mut result = kept.clone();
            result.sort_by_key(|t| t.id);
            catalog.tools = others;
            catalog.tools.extend(kept);
            catalog.tools.sort_by_key(|t| t.id);
            Ok(result)
        })
        .await
    }

    /// Delete every tool that belongs to `server`; returns how many were removed
    pub async fn remove_server(&self, server: &str) -> Result<usize, RegistryError> {
        self.mutate(|catalog| {
            let before = catalog.tools.len();
            catalog
                .tools
                .retain(|t| t.remote_server_name.as_deref() != Some(server));
            Ok(before - catalog.tools.len())
        })
        .await
    }

    /// Names of every server that currently owns at least one tool
    pub fn remote_servers(&self) -> HashSet<String> {
        self.catalog
            .read()
            .tools
            .iter()
            .filter_map(|t| t.remote_server_name.clone())
            .collect()
    }
}

fn qualified_name(server: &str, tool: &str) -> String {
    format!(
        "{}__{}",
        sanitize_function_name(server),
        sanitize_function_name(tool)
    )
}

/// The plain tool name when it is free, otherwise one qualified by the server
fn unique_name(server: &str, tool: &str, taken: &HashSet<String>) -> String {
    let plain = sanitize_function_name(tool);
    if !taken.contains(&plain) {
        return plain;
    }
    let qualified = qualified_name(server, tool);
    if !taken.contains(&qualified) {
        return qualified;
    }
    (2..)
        .map(|n| format!("{}_{}", qualified, n))
        .find(|candidate| !taken.contains(candidate))
        .unwrap_or(qualified)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin::default_tools;
    use crate::storage::{JsonFileStore, MemoryStore};
    use serde_json::json;
    use tempfile::tempdir;

    async fn registry() -> ToolRegistry {
        let registry = ToolRegistry::new(Arc::new(MemoryStore::new()));
        registry.seed_builtins(default_tools()).await.unwrap();
        registry
    }

    fn discovered(name: &str) -> DiscoveredTool {
        DiscoveredTool {
            name: name.to_string(),
            description: Some(format!("{} tool", name)),
            input_schema: json!({"type": "object"}),
        }
    }

    #[tokio::test]
    async fn test_seed_is_stable_and_keeps_user_edits() {
        let registry = registry().await;
        let calculator = registry.resolve("calculator").unwrap();
        registry.set_enabled(calculator.id, false).await.unwrap();
        registry
            .set_custom_context(calculator.id, "Show every step.")
            .await
            .unwrap();

        registry.seed_builtins(default_tools()).await.unwrap();

        let tools = registry.list();
        assert_eq!(tools.len(), 4);
        let calculator = registry.resolve("calculator").unwrap();
        assert!(!calculator.enabled);
        assert_eq!(calculator.effective_context(), "Show every step.");
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let registry = registry().await;
        let tools = vec![discovered("get_weather"), discovered("get_forecast")];

        let first = registry.upsert_from_discovery("weather-mcp", &tools).await.unwrap();
        let second = registry.upsert_from_discovery("weather-mcp", &tools).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(registry.list().len(), 6);
        let weather = registry.resolve("get_weather").unwrap();
        assert_eq!(weather.description, "get_weather tool");
        assert_eq!(
            weather.default_context,
            "You are using the get_weather tool from weather-mcp MCP server."
        );
    }

    #[tokio::test]
    async fn test_upsert_diffs_by_name_and_keeps_edits() {
        let registry = registry().await;
        registry
            .upsert_from_discovery("weather-mcp", &[discovered("get_weather"), discovered("old")])
            .await
            .unwrap();
        let weather = registry.resolve("get_weather").unwrap();
        registry.set_enabled(weather.id, false).await.unwrap();

        let tools = registry
            .upsert_from_discovery(
                "weather-mcp",
                &[
                    DiscoveredTool {
                        name: "get_weather".into(),
                        description: None,
                        input_schema: json!({"type": "object", "required": ["city"]}),
                    },
                    discovered("new"),
                ],
            )
            .await
            .unwrap();

        let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["get_weather", "new"]);
        let weather = registry.resolve("get_weather").unwrap();
        assert_eq!(weather.id, tools[0].id);
        assert!(!weather.enabled);
        assert_eq!(weather.description, NO_DESCRIPTION);
        assert!(registry.resolve("old").is_err());
    }

    #[tokio::test]
    async fn test_name_collisions_are_qualified() {
        let registry = registry().await;
        registry
            .upsert_from_discovery("alpha", &[discovered("lookup")])
            .await
            .unwrap();
        let tools = registry
            .upsert_from_discovery("beta", &[discovered("lookup"), discovered("calculator")])
            .await
            .unwrap();

        let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["beta__lookup", "beta__calculator"]);
        assert_eq!(tools[1].remote_tool_name.as_deref(), Some("calculator"));

        let snapshot = registry.snapshot();
        match snapshot.resolve("beta__lookup") {
            Some((_, ToolTarget::Remote { server, tool })) => {
                assert_eq!(server, "beta");
                assert_eq!(tool, "lookup");
            }
            other => panic!("unexpected resolution {:?}", other.map(|(_, t)| t)),
        }
    }

    #[tokio::test]
    async fn test_remove_server_only_touches_its_tools() {
        let registry = registry().await;
        registry
            .upsert_from_discovery("alpha", &[discovered("a1"), discovered("a2")])
            .await
            .unwrap();
        registry
            .upsert_from_discovery("beta", &[discovered("b1")])
            .await
            .unwrap();

        assert_eq!(registry.remove_server("alpha").await.unwrap(), 2);
        assert_eq!(registry.remove_server("alpha").await.unwrap(), 0);

        let names: HashSet<String> = registry.list().into_iter().map(|t| t.name).collect();
        assert!(names.contains("b1"));
        assert!(names.contains("calculator"));
        assert!(!names.contains("a1"));
    }

    #[tokio::test]
    async fn test_snapshot_is_isolated_from_later_edits() {
        let registry = registry().await;
        let snapshot = registry.snapshot();
        let calculator = registry.resolve("calculator").unwrap();
        registry.set_enabled(calculator.id, false).await.unwrap();

        assert!(matches!(
            snapshot.resolve("calculator"),
            Some((_, ToolTarget::BuiltIn(_)))
        ));
        assert!(registry.snapshot().resolve("calculator").is_none());
        assert_eq!(snapshot.specs().len(), 4);
    }

    #[tokio::test]
    async fn test_update_unknown_id() {
        let registry = registry().await;
        assert!(matches!(
            registry.set_enabled(999, true).await,
            Err(RegistryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_ids_of_deleted_tools_are_not_reissued() {
        let registry = registry().await;
        let alpha = registry
            .upsert_from_discovery("alpha", &[discovered("a1"), discovered("a2")])
            .await
            .unwrap();
        let highest = alpha.iter().map(|t| t.id).max().unwrap();
        registry.remove_server("alpha").await.unwrap();

        let beta = registry
            .upsert_from_discovery("beta", &[discovered("b1")])
            .await
            .unwrap();
        assert_eq!(beta[0].id, highest + 1);

        // Dropping the newest tool must not free its id either
        registry
            .upsert_from_discovery("beta", &[discovered("b2")])
            .await
            .unwrap();
        let b2 = registry.resolve("b2").unwrap();
        assert_eq!(b2.id, highest + 2);
    }

    #[tokio::test]
    async fn test_id_counter_survives_restart() {
        let dir = tempdir().unwrap();
        let removed = {
            let registry = ToolRegistry::new(Arc::new(JsonFileStore::new(dir.path()).unwrap()));
            registry.seed_builtins(default_tools()).await.unwrap();
            let tools = registry
                .upsert_from_discovery("alpha", &[discovered("a1")])
                .await
                .unwrap();
            registry.remove_server("alpha").await.unwrap();
            tools[0].id
        };

        let registry = ToolRegistry::new(Arc::new(JsonFileStore::new(dir.path()).unwrap()));
        assert_eq!(registry.restore().await.unwrap(), 4);
        registry.seed_builtins(default_tools()).await.unwrap();
        assert_eq!(registry.list().len(), 4);

        let tools = registry
            .upsert_from_discovery("beta", &[discovered("b1")])
            .await
            .unwrap();
        assert!(tools[0].id > removed);
    }

    #[tokio::test]
    async fn test_restore_accounts_for_rows_without_a_mark() {
        let store = Arc::new(MemoryStore::new());
        let mut row = registry().await.resolve("calculator").unwrap();
        row.id = 41;
        store
            .save_tools(&ToolTable {
                last_id: 0,
                tools: vec![row],
            })
            .unwrap();

        let registry = ToolRegistry::new(store);
        registry.restore().await.unwrap();
        let tools = registry
            .upsert_from_discovery("alpha", &[discovered("a1")])
            .await
            .unwrap();
        assert_eq!(tools[0].id, 42);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writers_do_not_lose_updates() {
        let registry = Arc::new(registry().await);
        let writers: Vec<_> = ["alpha", "beta", "gamma", "delta"]
            .into_iter()
            .map(|server| {
                let registry = registry.clone();
                tokio::spawn(async move {
                    registry
                        .upsert_from_discovery(server, &[discovered(&format!("{}_tool", server))])
                        .await
                })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap().unwrap();
        }

        let tools = registry.list();
        assert_eq!(tools.len(), 8);
        let ids: HashSet<ToolId> = tools.iter().map(|t| t.id).collect();
        assert_eq!(ids.len(), 8);
    }

    struct FailingStore;

    impl Store for FailingStore {
        fn load_tools(&self) -> anyhow::Result<ToolTable> {
            Ok(ToolTable::default())
        }
        fn save_tools(&self, _table: &ToolTable) -> anyhow::Result<()> {
            Err(anyhow!("disk full"))
        }
        fn load_servers(&self) -> anyhow::Result<Vec<crate::models::server::RemoteToolServer>> {
            Ok(vec![])
        }
        fn save_servers(
            &self,
            _servers: &[crate::models::server::RemoteToolServer],
        ) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_failed_write_publishes_nothing() {
        let registry = ToolRegistry::new(Arc::new(FailingStore));
        assert!(matches!(
            registry.seed_builtins(default_tools()).await,
            Err(RegistryError::Storage(_))
        ));
        assert!(registry.list().is_empty());
    }
}
