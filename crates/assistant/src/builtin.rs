//! Tools implemented and executed in-process.

mod calculator;
mod demos;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::errors::{ToolError, ToolResult};

pub use calculator::Calculator;
pub use demos::{CodeExecutor, FileAnalyzer, WebSearch};

/// A tool whose handler lives in this process. Seeded into the registry at startup.
#[async_trait]
pub trait BuiltinTool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// Instruction text given to the model while the tool is enabled
    fn default_context(&self) -> &str;

    /// JSON schema for the arguments object
    fn input_schema(&self) -> Value;

    async fn call(&self, arguments: Value) -> ToolResult<String>;
}

/// The fixed set of tools every assistant starts with
pub fn default_tools() -> Vec<Arc<dyn BuiltinTool>> {
    vec![
        Arc::new(WebSearch),
        Arc::new(Calculator),
        Arc::new(CodeExecutor),
        Arc::new(FileAnalyzer),
    ]
}

/// Fetch a required string argument
pub(crate) fn string_arg<'a>(arguments: &'a Value, key: &str) -> ToolResult<&'a str> {
    arguments
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| ToolError::InvalidParameters(format!("missing string parameter '{}'", key)))
}

pub(crate) fn single_string_schema(key: &str, description: &str) -> Value {
    serde_json::json!({
        "type": "object",
        "required": [key],
        "properties": {
            key: {"type": "string", "description": description}
        }
    })
}
