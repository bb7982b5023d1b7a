use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::errors::ProviderError;
use crate::models::message::{Message, ToolCall};
use crate::models::tool::ToolSpec;

/// Uniform event emitted by every provider while a completion streams in
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    /// A piece of assistant text, forwarded to the caller as soon as it arrives
    TokenDelta(String),
    /// A fully assembled tool call; arguments are always a complete JSON value
    ToolCallRequested(ToolCall),
    Finished,
}

/// Lazy, single-use sequence of provider events. Failures arrive as `Err` items.
pub type ProviderStream = BoxStream<'static, Result<ProviderEvent, ProviderError>>;

/// Base trait for AI providers (OpenAI, Anthropic, etc)
#[async_trait]
pub trait Provider: Send + Sync {
    /// Start a streaming completion for the conversation, offering `tools` to the model.
    ///
    /// Errors returned here happen before any event was produced (connection refused,
    /// rejected credentials, ...). Errors in the middle of a stream end the stream.
    async fn stream_completion(
        &self,
        system: &str,
        messages: &[Message],
        tools: &[ToolSpec],
    ) -> Result<ProviderStream, ProviderError>;
}
