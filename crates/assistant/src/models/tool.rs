use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub type ToolId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ToolSource {
    BuiltIn,
    Remote,
}

/// A catalog entry: metadata for a tool the model may be offered
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tool {
    pub id: ToolId,
    pub name: String,
    pub description: String,
    pub default_context: String,
    #[serde(default)]
    pub custom_context: Option<String>,
    pub enabled: bool,
    pub source: ToolSource,
    #[serde(default)]
    pub remote_server_name: Option<String>,
    /// Name the remote server knows the tool by; the catalog name may be qualified
    #[serde(default)]
    pub remote_tool_name: Option<String>,
    #[serde(default)]
    pub schema: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The persisted tool rows together with the highest id ever handed out
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolTable {
    /// Ids of deleted tools are never issued again
    #[serde(default)]
    pub last_id: ToolId,
    #[serde(default)]
    pub tools: Vec<Tool>,
}

impl Tool {
    /// The instruction text handed to the model while the tool is enabled
    pub fn effective_context(&self) -> &str {
        match self.custom_context.as_deref() {
            Some(custom) if !custom.is_empty() => custom,
            _ => &self.default_context,
        }
    }

    pub fn is_remote(&self) -> bool {
        self.source == ToolSource::Remote
    }

    pub fn spec(&self) -> ToolSpec {
        ToolSpec::new(&self.name, &self.description, self.schema.clone())
    }
}

/// A tool as it is described to a model provider
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolSpec {
    /// The name of the tool
    pub name: String,
    /// A description of what the tool does
    pub description: String,
    /// JSON schema of the arguments the tool accepts
    pub input_schema: Value,
}

impl ToolSpec {
    pub fn new<N, D>(name: N, description: D, input_schema: Value) -> Self
    where
        N: Into<String>,
        D: Into<String>,
    {
        ToolSpec {
            name: name.into(),
            description: description.into(),
            input_schema,
        }
    }
}

/// A tool descriptor returned by a remote tool server's discovery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredTool {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "empty_object_schema")]
    pub input_schema: Value,
}

pub fn empty_object_schema() -> Value {
    serde_json::json!({"type": "object", "properties": {}})
}

/// Partial update of a catalog entry from the service boundary
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolUpdate {
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub custom_context: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tool(custom: Option<&str>) -> Tool {
        Tool {
            id: 1,
            name: "calculator".into(),
            description: "math".into(),
            default_context: "default".into(),
            custom_context: custom.map(String::from),
            enabled: true,
            source: ToolSource::BuiltIn,
            remote_server_name: None,
            remote_tool_name: None,
            schema: json!({}),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_effective_context_prefers_custom() {
        assert_eq!(tool(Some("custom")).effective_context(), "custom");
        assert_eq!(tool(Some("")).effective_context(), "default");
        assert_eq!(tool(None).effective_context(), "default");
    }

    #[test]
    fn test_source_serializes_kebab_case() {
        let value = serde_json::to_value(tool(None)).unwrap();
        assert_eq!(value["source"], "built-in");
        assert_eq!(value["defaultContext"], "default");
    }

    #[test]
    fn test_discovered_tool_defaults_schema() {
        let discovered: DiscoveredTool = serde_json::from_value(json!({"name": "ping"})).unwrap();
        assert_eq!(discovered.input_schema["type"], "object");
        assert!(discovered.description.is_none());
    }
}
