use super::base::{Provider, ProviderEvent, ProviderStream};
use super::configs::OllamaProviderConfig;
use super::utils::{check_response, ensure_completed, error_message, tools_to_openai_spec};
use crate::errors::{ProviderError, ProviderErrorKind};
use crate::models::message::{Message, ToolCall};
use crate::models::role::Role;
use crate::models::tool::ToolSpec;
use anyhow::Result;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;

pub struct OllamaProvider {
    client: Client,
    config: OllamaProviderConfig,
}

impl OllamaProvider {
    pub fn new(config: OllamaProviderConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self { client, config })
    }

    /// Ollama takes tool-call arguments as objects rather than JSON text
    fn messages_to_ollama_spec(system: &str, messages: &[Message]) -> Vec<Value> {
        let mut spec = vec![json!({"role": "system", "content": system})];
        spec.extend(messages.iter().map(|message| match message.role {
            Role::Assistant if message.has_tool_calls() => json!({
                "role": "assistant",
                "content": message.content,
                "tool_calls": message
                    .tool_calls
                    .iter()
                    .map(|call| json!({
                        "function": {"name": call.tool_name, "arguments": call.arguments}
                    }))
                    .collect::<Vec<_>>(),
            }),
            role => json!({"role": role, "content": message.content}),
        }));
        spec
    }
}

/// Decode one line of the NDJSON body into events; returns whether it was the final line
fn decode_line(line: &str, events: &mut Vec<ProviderEvent>) -> Result<bool, ProviderError> {
    let chunk: Value = serde_json::from_str(line)
        .map_err(|e| ProviderError::malformed(format!("invalid stream line: {}", e)))?;
    if let Some(message) = error_message(&chunk) {
        return Err(ProviderError::new(ProviderErrorKind::Server, message));
    }

    let message = &chunk["message"];
    if let Some(text) = message["content"].as_str() {
        if !text.is_empty() {
            events.push(ProviderEvent::TokenDelta(text.to_string()));
        }
    }
    if let Some(calls) = message["tool_calls"].as_array() {
        for call in calls {
            let function = &call["function"];
            let name = function["name"].as_str().ok_or_else(|| {
                ProviderError::malformed("tool call without a function name")
            })?;
            let arguments = match &function["arguments"] {
                Value::Null => json!({}),
                Value::String(raw) => serde_json::from_str(raw).map_err(|e| {
                    ProviderError::malformed(format!("invalid arguments for {}: {}", name, e))
                })?,
                object @ Value::Object(_) => object.clone(),
                other => {
                    return Err(ProviderError::malformed(format!(
                        "unexpected arguments for {}: {}",
                        name, other
                    )))
                }
            };
            // Ollama does not assign call ids
            let call_id = format!("call_{}", uuid::Uuid::new_v4().simple());
            events.push(ProviderEvent::ToolCallRequested(ToolCall::new(
                call_id, name, arguments,
            )));
        }
    }

    Ok(chunk["done"].as_bool().unwrap_or(false))
}

fn chat_events(response: reqwest::Response) -> ProviderStream {
    Box::pin(async_stream::try_stream! {
        let mut body = response.bytes_stream();
        let mut buffer: Vec<u8> = Vec::new();
        let mut completed = false;

        'read: while let Some(bytes) = body.next().await {
            let bytes = bytes
                .map_err(|e| ProviderError::new(ProviderErrorKind::Network, e.to_string()))?;
            buffer.extend_from_slice(&bytes);

            while let Some(newline) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=newline).collect();
                let line = String::from_utf8_lossy(&line);
                if line.trim().is_empty() {
                    continue;
                }
                let mut events = Vec::new();
                let done = decode_line(line.trim(), &mut events)?;
                for event in events {
                    yield event;
                }
                if done {
                    completed = true;
                    break 'read;
                }
            }
        }

        // A final line without a trailing newline
        if !completed && !buffer.is_empty() {
            let line = String::from_utf8_lossy(&buffer).trim().to_string();
            if !line.is_empty() {
                let mut events = Vec::new();
                completed = decode_line(&line, &mut events)?;
                for event in events {
                    yield event;
                }
            }
        }

        ensure_completed(completed)?;
        yield ProviderEvent::Finished;
    })
}

#[async_trait]
impl Provider for OllamaProvider {
    async fn stream_completion(
        &self,
        system: &str,
        messages: &[Message],
        tools: &[ToolSpec],
    ) -> Result<ProviderStream, ProviderError> {
        let mut payload = json!({
            "model": self.config.model,
            "messages": Self::messages_to_ollama_spec(system, messages),
            "stream": true,
        });
        if !tools.is_empty() {
            payload["tools"] = json!(tools_to_openai_spec(tools)?);
        }

        let mut options = serde_json::Map::new();
        if let Some(temp) = self.config.temperature {
            options.insert("temperature".to_string(), json!(temp));
        }
        if let Some(tokens) = self.config.max_tokens {
            options.insert("num_predict".to_string(), json!(tokens));
        }
        if !options.is_empty() {
            payload["options"] = Value::Object(options);
        }

        let url = format!("{}/api/chat", self.config.host.trim_end_matches('/'));
        tracing::debug!(model = %self.config.model, tools = tools.len(), "ollama chat request");

        let response = self.client.post(&url).json(&payload).send().await?;
        let response = check_response(response).await?;

        Ok(chat_events(response))
    }
}
