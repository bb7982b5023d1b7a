//! These models represent the objects passed around by the assistant
//!
//! There are several different related formats we need to interact with:
//! - chat history sent from the presentation layer to the assistant
//! - the outbound `data:` frames streamed back to the presentation layer
//! - openai, anthropic and ollama messages/tools, sent from the assistant to the LLM
//! - MCP requests, sent from the assistant to remote tool servers
//!
//! We always immediately convert those data models into the internal structs using
//! to/from helpers, so the internal models are not an exact match to any of these formats.
pub mod message;
pub mod role;
pub mod server;
pub mod tool;
