use std::collections::HashSet;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::role::Role;
use crate::errors::ValidationError;

/// A tool invocation requested by the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    pub call_id: String,
    pub tool_name: String,
    #[serde(default)]
    pub arguments: Value,
}

impl ToolCall {
    pub fn new<I: Into<String>, N: Into<String>>(call_id: I, tool_name: N, arguments: Value) -> Self {
        Self {
            call_id: call_id.into(),
            tool_name: tool_name.into(),
            arguments,
        }
    }
}

/// A message to or from an LLM
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub role: Role,
    #[serde(default = "now")]
    pub created: i64,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

fn now() -> i64 {
    Utc::now().timestamp()
}

impl Message {
    fn new(role: Role) -> Self {
        Message {
            role,
            created: now(),
            content: String::new(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    /// Create a new user message with the current timestamp
    pub fn user() -> Self {
        Self::new(Role::User)
    }

    /// Create a new assistant message with the current timestamp
    pub fn assistant() -> Self {
        Self::new(Role::Assistant)
    }

    pub fn system() -> Self {
        Self::new(Role::System)
    }

    /// Create a tool-role message carrying the result of `call_id`
    pub fn tool_result<I: Into<String>, S: Into<String>>(call_id: I, result: S) -> Self {
        Message {
            tool_call_id: Some(call_id.into()),
            ..Self::new(Role::Tool)
        }
        .with_text(result.into())
    }

    /// Append text content to the message
    pub fn with_text<S: AsRef<str>>(mut self, text: S) -> Self {
        self.content.push_str(text.as_ref());
        self
    }

    /// Add a tool request to the message
    pub fn with_tool_call(mut self, tool_call: ToolCall) -> Self {
        self.tool_calls.push(tool_call);
        self
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// Check that every tool-role message answers a tool call emitted earlier in the history
pub fn validate_history(messages: &[Message]) -> Result<(), ValidationError> {
    let mut issued: HashSet<&str> = HashSet::new();
    for (index, message) in messages.iter().enumerate() {
        match message.role {
            Role::Assistant => {
                issued.extend(message.tool_calls.iter().map(|call| call.call_id.as_str()));
            }
            Role::Tool => {
                let call_id = message.tool_call_id.as_deref().ok_or_else(|| {
                    ValidationError::InvalidHistory(format!(
                        "tool message at position {} has no toolCallId",
                        index
                    ))
                })?;
                if !issued.contains(call_id) {
                    return Err(ValidationError::InvalidHistory(format!(
                        "tool message at position {} answers unknown call '{}'",
                        index, call_id
                    )));
                }
            }
            Role::User | Role::System => {}
        }
    }
    Ok(())
}
