//! Remote tool servers speaking the Model Context Protocol.

pub mod client;
pub mod http;
mod manager;
pub mod oauth;
pub mod protocol;
pub mod stdio;

#[cfg(test)]
pub mod mock;

pub use client::{McpClient, Transport};
pub use manager::{McpManager, McpSettings};
pub use protocol::CallToolResult;
