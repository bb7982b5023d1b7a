//! Tools that only describe what they would do. They keep the built-in catalog
//! complete without reaching out to search engines, sandboxes or the file system.

use async_trait::async_trait;
use serde_json::Value;

use super::{single_string_schema, string_arg, BuiltinTool};
use crate::errors::ToolResult;

pub struct WebSearch;

#[async_trait]
impl BuiltinTool for WebSearch {
    fn name(&self) -> &str {
        "web_search"
    }

    fn description(&self) -> &str {
        "Search the web for current information"
    }

    fn default_context(&self) -> &str {
        "You are searching the web to find current information. Provide accurate, up-to-date results based on the search query."
    }

    fn input_schema(&self) -> Value {
        single_string_schema("query", "The search query string")
    }

    async fn call(&self, arguments: Value) -> ToolResult<String> {
        let query = string_arg(&arguments, "query")?;
        Ok(format!(
            "Search results for '{}': This is a demonstration. A deployment with a search API configured would return live results here.",
            query
        ))
    }
}

pub struct CodeExecutor;

#[async_trait]
impl BuiltinTool for CodeExecutor {
    fn name(&self) -> &str {
        "code_executor"
    }

    fn description(&self) -> &str {
        "Execute Python code safely"
    }

    fn default_context(&self) -> &str {
        "You are executing Python code. Ensure the code is safe and provide the output of the execution."
    }

    fn input_schema(&self) -> Value {
        single_string_schema("code", "Python code to execute")
    }

    async fn call(&self, arguments: Value) -> ToolResult<String> {
        let code = string_arg(&arguments, "code")?;
        Ok(format!(
            "Code execution (demonstration mode):\n\nCode:\n{}\n\nNote: code execution is disabled. It would run in a sandboxed container in production.",
            code
        ))
    }
}

pub struct FileAnalyzer;

#[async_trait]
impl BuiltinTool for FileAnalyzer {
    fn name(&self) -> &str {
        "file_analyzer"
    }

    fn description(&self) -> &str {
        "Analyze and summarize file contents"
    }

    fn default_context(&self) -> &str {
        "You are analyzing a file. Provide a comprehensive summary and key insights from the content."
    }

    fn input_schema(&self) -> Value {
        single_string_schema("filename", "The name of the file to analyze")
    }

    async fn call(&self, arguments: Value) -> ToolResult<String> {
        let filename = string_arg(&arguments, "filename")?;
        Ok(format!(
            "File analysis for '{}': This is a demonstration. No file content was read.",
            filename
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin::default_tools;
    use crate::errors::ToolError;
    use serde_json::json;

    #[tokio::test]
    async fn test_demo_tools_echo_their_input() {
        let result = WebSearch.call(json!({"query": "rust"})).await.unwrap();
        assert!(result.starts_with("Search results for 'rust'"));

        let result = CodeExecutor.call(json!({"code": "print(1)"})).await.unwrap();
        assert!(result.contains("print(1)"));

        let err = FileAnalyzer.call(json!({"name": "x"})).await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidParameters(_)));
    }

    #[test]
    fn test_default_tools_are_unique_and_described() {
        let tools = default_tools();
        let mut names: Vec<&str> = tools.iter().map(|t| t.name()).collect();
        names.sort();
        assert_eq!(
            names,
            vec!["calculator", "code_executor", "file_analyzer", "web_search"]
        );
        for tool in &tools {
            assert_eq!(tool.input_schema()["type"], "object");
            assert!(!tool.default_context().is_empty());
        }
    }
}
