//! Downstream MCP client

use super::protocol::{
    InitializeParams, InitializeResult, JsonRpcRequest, McpPrompt, McpResource,
    McpResourceTemplate, McpTool, methods,
};
use super::transport::{HttpTransport, StdioTransport, Transport};
use crate::config::{ServerConfig, TransportConfig};
use crate::error::{CallError, McpCheckError, Result};
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Connection to one downstream server
///
/// Request ids are allocated here, so any number of external sessions can
/// share the same downstream connection.
pub struct DownstreamClient {
    server_name: String,
    transport: Arc<dyn Transport>,
    next_id: AtomicI64,
    request_timeout: Duration,
    info: InitializeResult,
}

impl std::fmt::Debug for DownstreamClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownstreamClient")
            .field("server_name", &self.server_name)
            .field("server_info", &self.info.server_info)
            .finish()
    }
}

impl DownstreamClient {
    /// Connect to the server described by `config` and complete the handshake
    ///
    /// # Errors
    ///
    /// Any failure to start, reach or initialize the server is reported as
    /// [`McpCheckError::Connection`], with subprocess stderr attached.
    pub async fn connect(name: &str, config: &ServerConfig, request_timeout: Duration) -> Result<Self> {
        let transport: Arc<dyn Transport> = match &config.transport {
            TransportConfig::Subprocess { command, args, env } => {
                let transport = StdioTransport::spawn(command, args, env).map_err(|e| {
                    McpCheckError::connection(name, format!("failed to start '{}': {}", command, e), None)
                })?;
                Arc::new(transport)
            }
            TransportConfig::Http { url, headers } => Arc::new(HttpTransport::new(url, headers)?),
        };

        Self::with_transport(name, transport, request_timeout).await
    }

    /// Complete the handshake over an existing transport
    pub async fn with_transport(
        name: &str,
        transport: Arc<dyn Transport>,
        request_timeout: Duration,
    ) -> Result<Self> {
        let info = match initialize(transport.as_ref(), request_timeout).await {
            Ok(info) => info,
            Err(message) => {
                if let Err(e) = transport.close().await {
                    debug!(server = name, "Close after failed handshake: {}", e);
                }
                return Err(McpCheckError::connection(name, message, transport.diagnostics()));
            }
        };

        info!(
            server = name,
            downstream = %info.server_info.name,
            version = %info.server_info.version,
            "Connected to downstream server"
        );

        Ok(Self {
            server_name: name.to_string(),
            transport,
            next_id: AtomicI64::new(1),
            request_timeout,
            info,
        })
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// What the downstream reported during initialize
    pub fn info(&self) -> &InitializeResult {
        &self.info
    }

    /// Send one request and wait for its outcome
    ///
    /// A JSON-RPC error from the downstream comes back as
    /// [`CallError::Rpc`] untouched.
    pub async fn call(&self, method: &str, params: Option<Value>) -> std::result::Result<Value, CallError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = JsonRpcRequest::new(id, method).with_optional_params(params);

        let response = tokio::time::timeout(self.request_timeout, self.transport.request(request))
            .await
            .map_err(|_| McpCheckError::RequestTimeout {
                method: method.to_string(),
                timeout: self.request_timeout,
            })??;

        response.into_result().map_err(CallError::Rpc)
    }

    /// Lazily walk a paginated listing
    ///
    /// Each descriptor is yielded on its own, so a malformed entry surfaces as
    /// one `Err` without hiding its neighbours. A failed page ends the stream.
    /// Calling this again restarts from the first page.
    pub fn paginate<T>(&self, method: &'static str, key: &'static str) -> BoxStream<'_, Result<T>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        struct Pages {
            cursor: Option<String>,
            seen: HashSet<String>,
            done: bool,
        }

        let start = Pages {
            cursor: None,
            seen: HashSet::new(),
            done: false,
        };

        stream::unfold(start, move |mut pages| async move {
            if pages.done {
                return None;
            }

            let params = pages.cursor.as_ref().map(|c| json!({ "cursor": c }));
            let items = match self.call(method, params).await {
                Ok(mut value) => {
                    pages.cursor = match value.get("nextCursor").and_then(Value::as_str) {
                        Some("") | None => None,
                        Some(c) if pages.seen.insert(c.to_string()) => Some(c.to_string()),
                        Some(c) => {
                            warn!(server = %self.server_name, method, cursor = c, "Cursor seen before, stopping");
                            None
                        }
                    };
                    pages.done = pages.cursor.is_none();
                    match value.get_mut(key).map(Value::take) {
                        Some(Value::Array(entries)) => entries
                            .into_iter()
                            .map(|entry| serde_json::from_value::<T>(entry).map_err(McpCheckError::from))
                            .collect(),
                        _ => vec![Err(McpCheckError::Protocol(format!(
                            "{} result has no '{}' array",
                            method, key
                        )))],
                    }
                }
                Err(e) => {
                    pages.done = true;
                    vec![Err(listing_error(method, e))]
                }
            };

            Some((stream::iter(items), pages))
        })
        .flatten()
        .boxed()
    }

    pub fn tools(&self) -> BoxStream<'_, Result<McpTool>> {
        self.paginate(methods::TOOLS_LIST, "tools")
    }

    pub fn resources(&self) -> BoxStream<'_, Result<McpResource>> {
        self.paginate(methods::RESOURCES_LIST, "resources")
    }

    pub fn resource_templates(&self) -> BoxStream<'_, Result<McpResourceTemplate>> {
        self.paginate(methods::RESOURCE_TEMPLATES_LIST, "resourceTemplates")
    }

    pub fn prompts(&self) -> BoxStream<'_, Result<McpPrompt>> {
        self.paginate(methods::PROMPTS_LIST, "prompts")
    }

    /// Close the downstream connection
    pub async fn close(&self) -> Result<()> {
        info!(server = %self.server_name, "Closing downstream connection");
        self.transport.close().await
    }
}

async fn initialize(transport: &dyn Transport, timeout: Duration) -> std::result::Result<InitializeResult, String> {
    let params = serde_json::to_value(InitializeParams::for_proxy()).map_err(|e| e.to_string())?;
    let request = JsonRpcRequest::new(0i64, methods::INITIALIZE).with_params(params);

    let response = match tokio::time::timeout(timeout, transport.request(request)).await {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => return Err(e.to_string()),
        Err(_) => return Err(format!("initialize timed out after {:?}", timeout)),
    };

    let result = response
        .into_result()
        .map_err(|e| format!("initialize rejected: {}", e))?;
    let info: InitializeResult =
        serde_json::from_value(result).map_err(|e| format!("invalid initialize result: {}", e))?;

    transport
        .notify(JsonRpcRequest::notification(methods::INITIALIZED))
        .await
        .map_err(|e| e.to_string())?;

    Ok(info)
}

fn listing_error(method: &str, err: CallError) -> McpCheckError {
    match err {
        CallError::Rpc(rpc) => McpCheckError::Protocol(format!("{} failed: {}", method, rpc)),
        CallError::Transport(e) => e,
    }
}

/// Drain a descriptor stream, skipping entries that failed
///
/// Returns `None` when nothing could be enumerated at all, which callers
/// treat as the category being absent.
pub async fn drain<T>(mut entries: BoxStream<'_, Result<T>>, server: &str, category: &str) -> Option<Vec<T>> {
    let mut items = Vec::new();
    let mut failures = 0usize;

    while let Some(entry) = entries.next().await {
        match entry {
            Ok(item) => items.push(item),
            Err(e) => {
                failures += 1;
                warn!(server, category, "Skipping {} entry: {}", category, e);
            }
        }
    }

    if items.is_empty() && failures > 0 {
        None
    } else {
        Some(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::{JsonRpcError, MemoryTransport};
    use serde_json::json;

    fn init_result() -> Value {
        json!({
            "protocolVersion": "2025-03-26",
            "capabilities": {"tools": {}},
            "serverInfo": {"name": "fake", "version": "1.2.3"}
        })
    }

    #[tokio::test]
    async fn test_handshake_sends_initialized() {
        let transport = Arc::new(MemoryTransport::new(|req| match req.method.as_str() {
            "initialize" => Some(Ok(init_result())),
            _ => None,
        }));

        let client = DownstreamClient::with_transport("fake", transport.clone(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(client.info().server_info.version, "1.2.3");

        let sent = transport.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].method, "initialize");
        assert_eq!(sent[1].method, "notifications/initialized");
        assert!(sent[1].is_notification());
    }

    #[tokio::test]
    async fn test_failed_handshake_is_connection_error_with_diagnostics() {
        let transport = Arc::new(
            MemoryTransport::new(|_| Some(Err(JsonRpcError::internal_error("boom"))))
                .with_diagnostics("missing credentials"),
        );

        let err = DownstreamClient::with_transport("kube", transport, Duration::from_secs(1))
            .await
            .unwrap_err();
        match err {
            McpCheckError::Connection { server, stderr, .. } => {
                assert_eq!(server, "kube");
                assert_eq!(stderr.as_deref(), Some("missing credentials"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_times_out() {
        let transport = Arc::new(
            MemoryTransport::new(|req| match req.method.as_str() {
                "initialize" => Some(Ok(init_result())),
                _ => Some(Ok(json!({}))),
            })
            .with_latency(Duration::from_secs(10)),
        );

        let client = DownstreamClient::with_transport("slow", transport, Duration::from_secs(60))
            .await
            .unwrap();
        let client = DownstreamClient {
            request_timeout: Duration::from_secs(1),
            ..client
        };

        let err = client.call("tools/call", None).await.unwrap_err();
        assert!(matches!(
            err,
            CallError::Transport(McpCheckError::RequestTimeout { .. })
        ));
    }

    #[tokio::test]
    async fn test_pagination_follows_cursor_and_skips_bad_entries() {
        let transport = Arc::new(MemoryTransport::new(|req| match req.method.as_str() {
            "initialize" => Some(Ok(init_result())),
            "tools/list" => {
                let cursor = req
                    .params
                    .as_ref()
                    .and_then(|p| p.get("cursor"))
                    .and_then(Value::as_str);
                match cursor {
                    None => Some(Ok(json!({
                        "tools": [{"name": "a"}, {"description": "no name"}],
                        "nextCursor": "page-2"
                    }))),
                    Some("page-2") => Some(Ok(json!({"tools": [{"name": "b"}]}))),
                    Some(_) => None,
                }
            }
            _ => None,
        }));

        let client = DownstreamClient::with_transport("fs", transport, Duration::from_secs(1))
            .await
            .unwrap();

        let tools = drain(client.tools(), "fs", "tools").await.unwrap();
        let names: Vec<_> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);

        // restartable
        let again = drain(client.tools(), "fs", "tools").await.unwrap();
        assert_eq!(again.len(), 2);
    }

    #[tokio::test]
    async fn test_pagination_stops_on_cursor_cycle() {
        let transport = Arc::new(MemoryTransport::new(|req| match req.method.as_str() {
            "initialize" => Some(Ok(init_result())),
            "prompts/list" => {
                let cursor = req
                    .params
                    .as_ref()
                    .and_then(|p| p.get("cursor"))
                    .and_then(Value::as_str);
                let (name, next) = match cursor {
                    None => ("first", "A"),
                    Some("A") => ("second", "B"),
                    _ => ("third", "A"),
                };
                Some(Ok(json!({"prompts": [{"name": name}], "nextCursor": next})))
            }
            _ => None,
        }));

        let client = DownstreamClient::with_transport("loop", transport.clone(), Duration::from_secs(1))
            .await
            .unwrap();

        let prompts = tokio::time::timeout(Duration::from_secs(5), drain(client.prompts(), "loop", "prompts"))
            .await
            .unwrap()
            .unwrap();
        let names: Vec<_> = prompts.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["first", "second", "third"]);

        let pages = transport.sent().iter().filter(|r| r.method == "prompts/list").count();
        assert_eq!(pages, 3);
    }

    #[tokio::test]
    async fn test_failed_listing_means_absent() {
        let transport = Arc::new(MemoryTransport::new(|req| match req.method.as_str() {
            "initialize" => Some(Ok(init_result())),
            "resources/list" => Some(Ok(json!({"resources": []}))),
            _ => None,
        }));

        let client = DownstreamClient::with_transport("fs", transport, Duration::from_secs(1))
            .await
            .unwrap();

        assert!(drain(client.prompts(), "fs", "prompts").await.is_none());
        assert_eq!(drain(client.resources(), "fs", "resources").await, Some(vec![]));
    }

    #[tokio::test]
    async fn test_request_ids_are_unique() {
        let transport = Arc::new(MemoryTransport::new(|req| match req.method.as_str() {
            "initialize" => Some(Ok(init_result())),
            _ => Some(Ok(json!({}))),
        }));

        let client = Arc::new(
            DownstreamClient::with_transport("fs", transport.clone(), Duration::from_secs(1))
                .await
                .unwrap(),
        );

        let mut handles = Vec::new();
        for _ in 0..16 {
            let client = client.clone();
            handles.push(tokio::spawn(async move { client.call("ping", None).await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let mut ids: Vec<_> = transport
            .sent()
            .into_iter()
            .filter(|r| r.method == "ping")
            .filter_map(|r| r.id)
            .collect();
        let total = ids.len();
        ids.sort_by_key(|id| id.to_string());
        ids.dedup();
        assert_eq!(ids.len(), total);
        assert_eq!(total, 16);
    }
}
