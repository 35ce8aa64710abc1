//! Error types for mcpcheck operations

use std::time::Duration;

use crate::mcp::JsonRpcError;

/// Result type for mcpcheck operations
pub type Result<T> = std::result::Result<T, McpCheckError>;

/// Error types for the recording proxy and its downstream connections
#[derive(Debug, thiserror::Error)]
pub enum McpCheckError {
    /// Downstream server unreachable or handshake failed
    #[error("Failed to connect to downstream server '{server}': {message}{}", stderr_suffix(.stderr))]
    Connection {
        server: String,
        message: String,
        /// Tail of the subprocess stderr, when the downstream is a subprocess
        stderr: Option<String>,
    },

    /// Downstream sent something that is not valid MCP
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Established connection failed while in use
    #[error("Transport error: {0}")]
    Transport(String),

    /// Downstream did not answer in time
    #[error("Request '{method}' timed out after {timeout:?}")]
    RequestTimeout { method: String, timeout: Duration },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// In-flight requests did not drain within the grace period
    #[error("Shutdown did not complete within {0:?}")]
    ShutdownTimeout(Duration),

    /// A cancellable wait was cancelled
    #[error("Operation cancelled")]
    Cancelled,

    /// Persisted call history is invalid
    #[error("History error: {0}")]
    History(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl McpCheckError {
    /// Build a connection error for `server`
    pub fn connection(
        server: impl Into<String>,
        message: impl Into<String>,
        stderr: Option<String>,
    ) -> Self {
        McpCheckError::Connection {
            server: server.into(),
            message: message.into(),
            stderr,
        }
    }

    /// Whether this error aborts proxy construction for a task
    pub fn is_fatal(&self) -> bool {
        matches!(self, McpCheckError::Connection { .. })
    }
}

fn stderr_suffix(stderr: &Option<String>) -> String {
    match stderr {
        Some(text) if !text.trim().is_empty() => format!("\n--- server stderr ---\n{}", text.trim_end()),
        _ => String::new(),
    }
}

impl From<String> for McpCheckError {
    fn from(s: String) -> Self {
        McpCheckError::Other(s)
    }
}

impl From<&str> for McpCheckError {
    fn from(s: &str) -> Self {
        McpCheckError::Other(s.to_string())
    }
}

impl From<anyhow::Error> for McpCheckError {
    fn from(err: anyhow::Error) -> Self {
        McpCheckError::Other(err.to_string())
    }
}

impl From<figment::Error> for McpCheckError {
    fn from(err: figment::Error) -> Self {
        McpCheckError::Configuration(err.to_string())
    }
}

/// Failure of a single forwarded invocation
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    /// The downstream answered with a JSON-RPC error; passed through verbatim
    #[error("{}", .0.message)]
    Rpc(JsonRpcError),

    /// The request never got an answer
    #[error(transparent)]
    Transport(#[from] McpCheckError),
}

impl CallError {
    /// The JSON-RPC error to hand back to the external caller
    pub fn to_rpc_error(&self) -> JsonRpcError {
        match self {
            CallError::Rpc(err) => err.clone(),
            CallError::Transport(err) => JsonRpcError::internal_error(err.to_string()),
        }
    }
}
