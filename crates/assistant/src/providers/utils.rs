use std::collections::{BTreeMap, HashSet};

use reqwest::{Response, StatusCode};
use serde_json::{json, Value};

use crate::errors::{ProviderError, ProviderErrorKind};
use crate::models::message::{Message, ToolCall};
use crate::models::role::Role;
use crate::models::tool::ToolSpec;

/// Map an HTTP status from a vendor endpoint onto the provider error taxonomy
pub fn classify_status(status: StatusCode) -> ProviderErrorKind {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ProviderErrorKind::Authentication,
        StatusCode::TOO_MANY_REQUESTS => ProviderErrorKind::RateLimited,
        status if status.is_server_error() => ProviderErrorKind::Server,
        _ => ProviderErrorKind::BadRequest,
    }
}

/// Pass a successful response through, otherwise turn the status and body into a ProviderError
pub async fn check_response(response: Response) -> Result<Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let detail = serde_json::from_str::<Value>(&body)
        .ok()
        .and_then(|value| error_message(&value))
        .unwrap_or(body);

    Err(ProviderError::new(
        classify_status(status),
        format!("{}: {}", status, detail),
    ))
}

/// Pull a human readable message out of the error payloads vendors send
pub fn error_message(value: &Value) -> Option<String> {
    let error = value.get("error")?;
    error
        .get("message")
        .and_then(|m| m.as_str())
        .or_else(|| error.as_str())
        .map(String::from)
        .or_else(|| Some(error.to_string()))
}

/// A stream that ends without the vendor's completion marker was cut off
pub fn ensure_completed(completed: bool) -> Result<(), ProviderError> {
    if completed {
        Ok(())
    } else {
        Err(ProviderError::new(
            ProviderErrorKind::Network,
            "stream closed before the completion finished",
        ))
    }
}

pub fn sanitize_function_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

pub fn is_valid_function_name(name: &str) -> bool {
    !name.is_empty() && sanitize_function_name(name) == name
}

/// Parse the accumulated argument text of a tool call. Empty text means no arguments.
pub fn parse_tool_arguments(call_id: &str, raw: &str) -> Result<Value, ProviderError> {
    if raw.trim().is_empty() {
        return Ok(json!({}));
    }
    serde_json::from_str(raw).map_err(|e| {
        ProviderError::malformed(format!(
            "could not interpret tool use parameters for id {}: {}",
            call_id, e
        ))
    })
}

/// Convert internal Message format to OpenAI's API message specification
pub fn messages_to_openai_spec(messages: &[Message]) -> Vec<Value> {
    messages
        .iter()
        .map(|message| match message.role {
            Role::Tool => json!({
                "role": "tool",
                "tool_call_id": message.tool_call_id,
                "content": message.content,
            }),
            Role::Assistant if message.has_tool_calls() => {
                let tool_calls: Vec<Value> = message
                    .tool_calls
                    .iter()
                    .map(|call| {
                        json!({
                            "id": call.call_id,
                            "type": "function",
                            "function": {
                                "name": sanitize_function_name(&call.tool_name),
                                "arguments": call.arguments.to_string(),
                            }
                        })
                    })
                    .collect();
                let content = if message.content.is_empty() {
                    Value::Null
                } else {
                    json!(message.content)
                };
                json!({
                    "role": "assistant",
                    "content": content,
                    "tool_calls": tool_calls,
                })
            }
            role => json!({
                "role": role,
                "content": message.content,
            }),
        })
        .collect()
}

/// Convert tool specs to OpenAI's API tool specification
pub fn tools_to_openai_spec(tools: &[ToolSpec]) -> Result<Vec<Value>, ProviderError> {
    let mut tool_names = HashSet::new();
    let mut result = Vec::new();

    for tool in tools {
        if !tool_names.insert(&tool.name) {
            return Err(ProviderError::new(
                ProviderErrorKind::BadRequest,
                format!("duplicate tool name: {}", tool.name),
            ));
        }

        result.push(json!({
            "type": "function",
            "function": {
                "name": tool.name,
                "description": tool.description,
                "parameters": tool.input_schema,
            }
        }));
    }

    Ok(result)
}

#[derive(Debug, Default)]
struct PartialToolCall {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

/// Collects tool-call fragments streamed across several chunks, keyed by their index.
///
/// The first fragment of a call carries its id and function name, later ones only
/// carry pieces of the argument JSON.
#[derive(Debug, Default)]
pub struct StreamToolAccumulator {
    calls: BTreeMap<u64, PartialToolCall>,
}

impl StreamToolAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge the `tool_calls` array of one OpenAI-style delta
    pub fn process_chunk(&mut self, fragments: &[Value]) {
        for (position, fragment) in fragments.iter().enumerate() {
            let index = fragment
                .get("index")
                .and_then(|i| i.as_u64())
                .unwrap_or(position as u64);
            let entry = self.calls.entry(index).or_default();

            if let Some(id) = fragment.get("id").and_then(|v| v.as_str()) {
                entry.id = Some(id.to_string());
            }
            if let Some(function) = fragment.get("function") {
                if let Some(name) = function.get("name").and_then(|v| v.as_str()) {
                    entry.name = Some(name.to_string());
                }
                if let Some(args) = function.get("arguments").and_then(|v| v.as_str()) {
                    entry.arguments.push_str(args);
                }
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Turn the fragments into complete tool calls in index order.
    /// A call missing its id or name, or with unparsable arguments, is an error.
    pub fn finish(self) -> Result<Vec<ToolCall>, ProviderError> {
        self.calls
            .into_iter()
            .map(|(index, partial)| {
                let id = partial.id.ok_or_else(|| {
                    ProviderError::malformed(format!("tool call #{} has no id", index))
                })?;
                let name = partial.name.ok_or_else(|| {
                    ProviderError::malformed(format!("tool call {} has no function name", id))
                })?;
                let arguments = parse_tool_arguments(&id, &partial.arguments)?;
                Ok(ToolCall::new(id, name, arguments))
            })
            .collect()
    }
}
