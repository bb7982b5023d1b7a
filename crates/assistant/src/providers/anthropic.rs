use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::Client;
use serde_json::{json, Value};

use super::base::{Provider, ProviderEvent, ProviderStream};
use super::configs::AnthropicProviderConfig;
use super::utils::{check_response, ensure_completed, parse_tool_arguments, sanitize_function_name};
use crate::errors::{ProviderError, ProviderErrorKind};
use crate::models::message::{Message, ToolCall};
use crate::models::role::Role;
use crate::models::tool::ToolSpec;

const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    client: Client,
    config: AnthropicProviderConfig,
}

/// Append content blocks for `role`, merging into the previous message when the
/// role repeats. The messages API requires user and assistant turns to alternate.
fn push_blocks(out: &mut Vec<Value>, role: &str, blocks: Vec<Value>) {
    if blocks.is_empty() {
        return;
    }
    if let Some(last) = out.last_mut() {
        if last["role"] == role {
            if let Some(content) = last["content"].as_array_mut() {
                content.extend(blocks);
                return;
            }
        }
    }
    out.push(json!({"role": role, "content": blocks}));
}

impl AnthropicProvider {
    pub fn new(config: AnthropicProviderConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self { client, config })
    }

    /// Convert the conversation into the messages API shape. System messages found in
    /// the history are folded into the top-level system text that is returned alongside.
    fn messages_to_anthropic_spec(system: &str, messages: &[Message]) -> (String, Vec<Value>) {
        let mut system_text = system.to_string();
        let mut anthropic_messages = Vec::new();

        for message in messages {
            match message.role {
                Role::System => {
                    if !message.content.is_empty() {
                        system_text.push_str("\n\n");
                        system_text.push_str(&message.content);
                    }
                }
                Role::User => {
                    let blocks = if message.content.is_empty() {
                        vec![]
                    } else {
                        vec![json!({"type": "text", "text": message.content})]
                    };
                    push_blocks(&mut anthropic_messages, "user", blocks);
                }
                Role::Assistant => {
                    let mut blocks = Vec::new();
                    if !message.content.is_empty() {
                        blocks.push(json!({"type": "text", "text": message.content}));
                    }
                    for call in &message.tool_calls {
                        blocks.push(json!({
                            "type": "tool_use",
                            "id": call.call_id,
                            "name": sanitize_function_name(&call.tool_name),
                            "input": call.arguments,
                        }));
                    }
                    push_blocks(&mut anthropic_messages, "assistant", blocks);
                }
                Role::Tool => {
                    let block = json!({
                        "type": "tool_result",
                        "tool_use_id": message.tool_call_id,
                        "content": message.content,
                    });
                    push_blocks(&mut anthropic_messages, "user", vec![block]);
                }
            }
        }

        (system_text, anthropic_messages)
    }

    fn tools_to_anthropic_spec(tools: &[ToolSpec]) -> Vec<Value> {
        tools
            .iter()
            .map(|tool| {
                json!({
                    "name": tool.name,
                    "description": tool.description,
                    "input_schema": tool.input_schema,
                })
            })
            .collect()
    }
}

fn stream_error(error: &Value) -> ProviderError {
    let kind = match error["type"].as_str() {
        Some("authentication_error") | Some("permission_error") => {
            ProviderErrorKind::Authentication
        }
        Some("rate_limit_error") => ProviderErrorKind::RateLimited,
        Some("invalid_request_error") => ProviderErrorKind::BadRequest,
        _ => ProviderErrorKind::Server,
    };
    let message = error["message"].as_str().unwrap_or("unknown error");
    ProviderError::new(kind, message)
}

fn parse_event(data: &str) -> Result<Value, ProviderError> {
    let value: Value = serde_json::from_str(data)
        .map_err(|e| ProviderError::malformed(format!("invalid stream event: {}", e)))?;
    if value["type"] == "error" {
        return Err(stream_error(&value["error"]));
    }
    Ok(value)
}

#[derive(Debug, Default)]
struct ToolUseBlock {
    id: String,
    name: String,
    input: String,
}

impl ToolUseBlock {
    fn into_call(self) -> Result<ToolCall, ProviderError> {
        let arguments = parse_tool_arguments(&self.id, &self.input)?;
        Ok(ToolCall::new(self.id, self.name, arguments))
    }
}

fn message_events(response: reqwest::Response) -> ProviderStream {
    Box::pin(async_stream::try_stream! {
        let mut events = response.bytes_stream().eventsource();
        let mut open_tools: HashMap<u64, ToolUseBlock> = HashMap::new();
        let mut completed = false;

        while let Some(event) = events.next().await {
            let event = event
                .map_err(|e| ProviderError::new(ProviderErrorKind::Network, e.to_string()))?;
            if event.data.trim().is_empty() {
                continue;
            }
            let value = parse_event(&event.data)?;
            let index = value["index"].as_u64().unwrap_or_default();

            match value["type"].as_str().unwrap_or_default() {
                "content_block_start" => {
                    let block = &value["content_block"];
                    if block["type"] == "tool_use" {
                        open_tools.insert(index, ToolUseBlock {
                            id: block["id"].as_str().unwrap_or_default().to_string(),
                            name: block["name"].as_str().unwrap_or_default().to_string(),
                            input: String::new(),
                        });
                    } else if let Some(text) = block["text"].as_str() {
                        if !text.is_empty() {
                            yield ProviderEvent::TokenDelta(text.to_string());
                        }
                    }
                }
                "content_block_delta" => {
                    let delta = &value["delta"];
                    match delta["type"].as_str() {
                        Some("text_delta") => {
                            if let Some(text) = delta["text"].as_str() {
                                yield ProviderEvent::TokenDelta(text.to_string());
                            }
                        }
                        Some("input_json_delta") => {
                            if let Some(block) = open_tools.get_mut(&index) {
                                block.input.push_str(delta["partial_json"].as_str().unwrap_or_default());
                            }
                        }
                        _ => {}
                    }
                }
                "content_block_stop" => {
                    if let Some(block) = open_tools.remove(&index) {
                        yield ProviderEvent::ToolCallRequested(block.into_call()?);
                    }
                }
                "message_stop" => {
                    completed = true;
                    break;
                }
                _ => {}
            }
        }

        ensure_completed(completed && open_tools.is_empty())?;
        yield ProviderEvent::Finished;
    })
}

#[async_trait]
impl Provider for AnthropicProvider {
    async fn stream_completion(
        &self,
        system: &str,
        messages: &[Message],
        tools: &[ToolSpec],
    ) -> Result<ProviderStream, ProviderError> {
        let (system_text, anthropic_messages) = Self::messages_to_anthropic_spec(system, messages);

        let mut payload = json!({
            "model": self.config.model,
            "system": system_text,
            "messages": anthropic_messages,
            "max_tokens": self.config.max_tokens,
            "stream": true,
        });
        if !tools.is_empty() {
            payload["tools"] = json!(Self::tools_to_anthropic_spec(tools));
        }
        if let Some(temp) = self.config.temperature {
            payload["temperature"] = json!(temp);
        }

        let url = format!("{}/v1/messages", self.config.host.trim_end_matches('/'));
        tracing::debug!(model = %self.config.model, tools = tools.len(), "anthropic completion request");

        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&payload)
            .send()
            .await?;
        let response = check_response(response).await?;

        Ok(message_events(response))
    }
}
