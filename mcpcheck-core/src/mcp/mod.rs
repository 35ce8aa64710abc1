//! Model Context Protocol (MCP) client side
//!
//! The proxy talks to each downstream server as an ordinary MCP client:
//! JSON-RPC 2.0 over either a subprocess pipe or a streamable-HTTP session.
//!
//! # Protocol Overview
//!
//! The methods the proxy relies on:
//! - `initialize` / `notifications/initialized` - Connection setup
//! - `tools/list` / `tools/call`
//! - `resources/list` / `resources/templates/list` / `resources/read`
//! - `prompts/list` / `prompts/get`
//!
//! Listing methods are paginated with an opaque `cursor` / `nextCursor` pair.
//!
//! # References
//!
//! - [MCP Specification](https://modelcontextprotocol.io/specification)

mod client;
mod protocol;
mod transport;

pub use client::{DownstreamClient, drain};
pub use protocol::*;
pub use transport::{HttpTransport, MemoryTransport, StdioTransport, Transport};
