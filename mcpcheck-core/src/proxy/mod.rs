//! Recording proxies
//!
//! A [`ProxyServer`] sits between an agent and one downstream MCP server.
//! [`ServerManager`] runs one per configured server for a task run.
//!
//! # Example
//!
//! ```rust,no_run
//! use mcpcheck_core::config::McpConfig;
//! use mcpcheck_core::proxy::ServerManager;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> mcpcheck_core::Result<()> {
//! let config = McpConfig::load("mcp.yaml")?;
//! let manager = ServerManager::start(&config).await?;
//! manager.wait_ready(&CancellationToken::new()).await?;
//!
//! for (server, url) in manager.endpoints() {
//!     println!("{server}: {url}");
//! }
//!
//! // ... run the agent against the endpoints ...
//!
//! let history = manager.shutdown().await?;
//! println!("{} calls recorded", history.len());
//! # Ok(())
//! # }
//! ```

mod manager;
mod readiness;
mod server;

pub use manager::ServerManager;
pub use readiness::Readiness;
pub use server::{InFlightCall, ProxyServer};
