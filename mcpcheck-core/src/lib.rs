//! # mcpcheck - Recording MCP proxies and behavioral assertions for agents
//!
//! mcpcheck answers one question about an agent run: did the agent use its
//! MCP servers the way it was supposed to?
//!
//! - **Recording proxies** sit between the agent and each real MCP server,
//!   republish the server's tools, resources and prompts, forward every
//!   invocation unchanged, and append it to an ordered call history.
//! - **Assertions** are declarative rules (tools used or not used, call
//!   counts, call order, duplicate calls) checked against that history.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use mcpcheck_core::prelude::*;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = McpConfig::load("mcp.yaml")?;
//!     let manager = ServerManager::start(&config).await?;
//!     manager.wait_ready(&CancellationToken::new()).await?;
//!
//!     // point the agent at manager.agent_config() and let it run
//!
//!     let history = manager.shutdown().await?;
//!     let spec = AssertionSpec::from_file("assertions.yaml")?;
//!     let verdict = Verdict::from(evaluate(&history, &spec));
//!     println!("{}", verdict.summary());
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`mcp`]: JSON-RPC types, downstream transports and the MCP client
//! - [`history`]: call records and the shared recorder
//! - [`proxy`]: the recording proxy server and the per-run manager
//! - [`assertions`]: assertion documents and the evaluation engine

pub mod assertions;
pub mod config;
pub mod error;
pub mod history;
pub mod mcp;
pub mod proxy;

pub use error::{McpCheckError, Result};

/// Current library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Re-export commonly used types
pub mod prelude {
    pub use crate::assertions::{
        AssertionResult, AssertionSpec, CompositeAssertionResult, Matcher, NameMatcher,
        OrderItem, Verdict, evaluate,
    };
    pub use crate::config::{McpConfig, ProxySettings, ServerConfig, TransportConfig, TransportKind};
    pub use crate::error::{CallError, McpCheckError, Result};
    pub use crate::history::{CallHistory, CallKind, CallOutcome, CallRecord, CallStart, Recorder};
    pub use crate::mcp::{DownstreamClient, Transport};
    pub use crate::proxy::{ProxyServer, Readiness, ServerManager};
}
