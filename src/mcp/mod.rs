//! MCP 网关：外部工具服务器（JSON-RPC 2.0 over stdio / TCP）

pub mod client;
pub mod gateway;

use thiserror::Error;

use crate::core::{ErrorKind, ObservationError, RegistryError};

pub use client::{McpEndpoint, McpSession, RemoteTool};
pub use gateway::McpGateway;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum McpError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("remote error: {0}")]
    Remote(String),

    #[error("mcp request timed out after {limit_ms}ms")]
    TimedOut { limit_ms: u64 },

    #[error("unknown mcp server: {0}")]
    UnknownServer(String),

    #[error("mcp config: {0}")]
    Config(String),

    #[error(transparent)]
    Registry(RegistryError),
}

impl McpError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            McpError::Transport(_) | McpError::Protocol(_) => ErrorKind::TransportError,
            McpError::Remote(_) => ErrorKind::RemoteError,
            McpError::TimedOut { .. } => ErrorKind::TimedOut,
            McpError::UnknownServer(_) => ErrorKind::HandlerFailed,
            McpError::Config(_) => ErrorKind::Config,
            McpError::Registry(e) => e.kind(),
        }
    }
}

impl From<McpError> for ObservationError {
    fn from(e: McpError) -> Self {
        match e {
            McpError::Transport(message) | McpError::Protocol(message) => {
                ObservationError::TransportError { message }
            }
            McpError::Remote(message) => ObservationError::RemoteError { message },
            McpError::TimedOut { limit_ms } => ObservationError::TimedOut { limit_ms },
            other => ObservationError::handler(other.to_string()),
        }
    }
}
