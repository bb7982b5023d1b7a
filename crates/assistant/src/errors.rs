use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum_macros::Display;
use thiserror::Error;

/// Malformed input rejected before anything is applied
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("invalid {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("a server named '{0}' is already registered")]
    DuplicateServer(String),

    #[error("invalid conversation history: {0}")]
    InvalidHistory(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    Network,
    Authentication,
    RateLimited,
    Server,
    BadRequest,
    MalformedResponse,
}

/// Failure reported by an LLM vendor endpoint, always fatal to the current turn
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind} error: {message}")]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub message: String,
}

impl ProviderError {
    pub fn new<S: Into<String>>(kind: ProviderErrorKind, message: S) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn malformed<S: Into<String>>(message: S) -> Self {
        Self::new(ProviderErrorKind::MalformedResponse, message)
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        let kind = match err.status() {
            Some(status) => super::providers::utils::classify_status(status),
            None => ProviderErrorKind::Network,
        };
        ProviderError::new(kind, err.to_string())
    }
}

/// Errors talking to a remote tool server. Connection-class variants come out of
/// discovery and handshakes; everything else surfaces from a single invocation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum McpError {
    #[error("tool server not found: {0}")]
    ServerNotFound(String),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("tool server returned error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("tool unavailable: server disconnected")]
    Disconnected,

    #[error("authentication failed: {0}")]
    Auth(String),
}

impl McpError {
    /// Whether the failure means the connection itself is unusable
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            McpError::Connection(_) | McpError::Disconnected | McpError::Auth(_)
        )
    }
}

impl From<serde_json::Error> for McpError {
    fn from(err: serde_json::Error) -> Self {
        McpError::Protocol(err.to_string())
    }
}

impl From<std::io::Error> for McpError {
    fn from(err: std::io::Error) -> Self {
        McpError::Transport(err.to_string())
    }
}

impl From<reqwest::Error> for McpError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() {
            McpError::Connection(err.to_string())
        } else {
            McpError::Transport(err.to_string())
        }
    }
}

/// Failure of a single built-in tool call. Fed back to the model, never fatal.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ToolError {
    #[error("tool not found: {0}")]
    ToolNotFound(String),

    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("tool execution failed: {0}")]
    ExecutionError(String),
}

pub type ToolResult<T> = Result<T, ToolError>;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("tool not found: {0}")]
    NotFound(String),

    #[error("failed to persist tools: {0}")]
    Storage(#[from] anyhow::Error),
}

/// Reasons a chat turn ends in the errored state
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChatError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("tool-loop limit exceeded after {0} tool rounds")]
    ToolLoopLimitExceeded(usize),

    #[error(transparent)]
    InvalidHistory(#[from] ValidationError),

    #[error("failed to build system prompt: {0}")]
    Prompt(String),
}

/// Errors returned at the service boundary
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl From<RegistryError> for ServiceError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound(what) => ServiceError::NotFound(what),
            RegistryError::Storage(err) => ServiceError::Storage(err),
        }
    }
}
