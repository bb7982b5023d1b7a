use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::Client;
use serde_json::{json, Value};

use super::base::{Provider, ProviderEvent, ProviderStream};
use super::configs::OpenAiProviderConfig;
use super::utils::{
    check_response, ensure_completed, error_message, messages_to_openai_spec, tools_to_openai_spec,
    StreamToolAccumulator,
};
use crate::errors::{ProviderError, ProviderErrorKind};
use crate::models::message::Message;
use crate::models::tool::ToolSpec;

pub struct OpenAiProvider {
    client: Client,
    config: OpenAiProviderConfig,
}

impl OpenAiProvider {
    pub fn new(config: OpenAiProviderConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self { client, config })
    }

    fn build_payload(
        &self,
        system: &str,
        messages: &[Message],
        tools: &[ToolSpec],
    ) -> Result<Value, ProviderError> {
        let mut messages_array = vec![json!({"role": "system", "content": system})];
        messages_array.extend(messages_to_openai_spec(messages));

        let mut payload = json!({
            "model": self.config.model,
            "messages": messages_array,
            "stream": true,
        });

        if !tools.is_empty() {
            payload["tools"] = json!(tools_to_openai_spec(tools)?);
        }
        if let Some(temp) = self.config.temperature {
            payload["temperature"] = json!(temp);
        }
        if let Some(tokens) = self.config.max_tokens {
            payload["max_tokens"] = json!(tokens);
        }
        Ok(payload)
    }
}

/// In-band error objects some compatible servers send in place of a chunk
fn check_chunk(chunk: &Value) -> Result<(), ProviderError> {
    match error_message(chunk) {
        Some(message) => Err(ProviderError::new(ProviderErrorKind::Server, message)),
        None => Ok(()),
    }
}

/// Turn the chat-completions SSE body into provider events.
///
/// Text deltas are yielded as they arrive, tool-call fragments are held until the
/// stream completes.
fn completion_events(response: reqwest::Response) -> ProviderStream {
    Box::pin(async_stream::try_stream! {
        let mut events = response.bytes_stream().eventsource();
        let mut tool_calls = StreamToolAccumulator::new();
        let mut completed = false;

        while let Some(event) = events.next().await {
            let event = event
                .map_err(|e| ProviderError::new(ProviderErrorKind::Network, e.to_string()))?;
            let data = event.data.trim();
            if data == "[DONE]" {
                completed = true;
                break;
            }
            if data.is_empty() {
                continue;
            }

            let chunk: Value = serde_json::from_str(data)
                .map_err(|e| ProviderError::malformed(format!("invalid stream chunk: {}", e)))?;
            check_chunk(&chunk)?;

            let Some(choice) = chunk.get("choices").and_then(|c| c.get(0)) else {
                continue;
            };
            if let Some(text) = choice["delta"]["content"].as_str() {
                if !text.is_empty() {
                    yield ProviderEvent::TokenDelta(text.to_string());
                }
            }
            if let Some(fragments) = choice["delta"]["tool_calls"].as_array() {
                tool_calls.process_chunk(fragments);
            }
            if choice["finish_reason"].is_string() {
                completed = true;
            }
        }

        ensure_completed(completed)?;

        for call in tool_calls.finish()? {
            yield ProviderEvent::ToolCallRequested(call);
        }
        yield ProviderEvent::Finished;
    })
}

#[async_trait]
impl Provider for OpenAiProvider {
    async fn stream_completion(
        &self,
        system: &str,
        messages: &[Message],
        tools: &[ToolSpec],
    ) -> Result<ProviderStream, ProviderError> {
        let payload = self.build_payload(system, messages, tools)?;
        let url = format!(
            "{}/v1/chat/completions",
            self.config.host.trim_end_matches('/')
        );
        tracing::debug!(model = %self.config.model, tools = tools.len(), "openai completion request");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&payload)
            .send()
            .await?;
        let response = check_response(response).await?;

        Ok(completion_events(response))
    }
}
