//! Recording proxy for one downstream server
//!
//! The proxy republishes the downstream's tools, resources, resource
//! templates and prompts on a local streamable-HTTP endpoint. Invocations are
//! forwarded unchanged, timed, and appended to the shared [`Recorder`];
//! whatever the downstream answers goes back to the caller as-is.

use crate::config::{ProxySettings, ServerConfig};
use crate::error::{McpCheckError, Result};
use crate::history::{CallKind, CallOutcome, CallStart, Recorder};
use crate::mcp::{
    DownstreamClient, InitializeResult, JsonRpcError, JsonRpcRequest, JsonRpcResponse, McpPrompt,
    McpResource, McpResourceTemplate, McpTool, PromptGetParams, PromptsCapability,
    ResourceReadParams, ResourcesCapability, RequestId, SESSION_ID_HEADER, ServerCapabilities,
    ToolCallParams, ToolsCapability, drain, error_codes, methods,
};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use futures::future::join_all;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::readiness::Readiness;

/// What the downstream offered at startup; `None` means the category is absent
#[derive(Debug, Default)]
struct Catalog {
    tools: Option<Vec<McpTool>>,
    resources: Option<Vec<McpResource>>,
    resource_templates: Option<Vec<McpResourceTemplate>>,
    prompts: Option<Vec<McpPrompt>>,
}

impl Catalog {
    async fn discover(client: &DownstreamClient) -> Self {
        let server = client.server_name();
        let catalog = Self {
            tools: drain(client.tools(), server, "tools").await,
            resources: drain(client.resources(), server, "resources").await,
            resource_templates: drain(client.resource_templates(), server, "resource templates").await,
            prompts: drain(client.prompts(), server, "prompts").await,
        };

        info!(
            server,
            tools = catalog.tools.as_ref().map(Vec::len),
            resources = catalog.resources.as_ref().map(Vec::len),
            resource_templates = catalog.resource_templates.as_ref().map(Vec::len),
            prompts = catalog.prompts.as_ref().map(Vec::len),
            "Discovered downstream capabilities"
        );
        catalog
    }
}

/// A call currently being forwarded
#[derive(Debug, Clone)]
pub struct InFlightCall {
    pub method: String,
    pub name: String,
    pub started: Instant,
}

/// Calls in flight on one proxy
#[derive(Debug, Default)]
struct InFlight {
    next_id: AtomicU64,
    calls: Mutex<HashMap<u64, InFlightCall>>,
    drained: Notify,
}

impl InFlight {
    fn enter(&self, method: &str, name: &str) -> InFlightGuard<'_> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).insert(
            id,
            InFlightCall {
                method: method.to_string(),
                name: name.to_string(),
                started: Instant::now(),
            },
        );
        InFlightGuard { owner: self, id }
    }

    /// Resolves once no call is in flight
    async fn wait_drained(&self) {
        loop {
            let drained = self.drained.notified();
            if self.calls.lock().unwrap_or_else(PoisonError::into_inner).is_empty() {
                return;
            }
            drained.await;
        }
    }

    fn snapshot(&self) -> Vec<InFlightCall> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }
}

struct InFlightGuard<'a> {
    owner: &'a InFlight,
    id: u64,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let mut calls = self.owner.calls.lock().unwrap_or_else(PoisonError::into_inner);
        calls.remove(&self.id);
        if calls.is_empty() {
            self.owner.drained.notify_waiters();
        }
    }
}

/// Recording proxy in front of one downstream server
pub struct ProxyServer {
    name: String,
    config: ServerConfig,
    settings: ProxySettings,
    client: Arc<DownstreamClient>,
    recorder: Recorder,
    catalog: Catalog,
    readiness: Readiness,
    in_flight: InFlight,
    /// Fired once the grace period is over; forwarding stops and nothing
    /// more is recorded
    closed: CancellationToken,
    sessions: Mutex<HashSet<String>>,
    local_addr: OnceLock<SocketAddr>,
}

impl std::fmt::Debug for ProxyServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyServer")
            .field("name", &self.name)
            .field("local_addr", &self.local_addr.get())
            .field("ready", &self.readiness.is_ready())
            .finish()
    }
}

impl ProxyServer {
    /// Connect to the downstream server and discover what it offers
    ///
    /// # Errors
    ///
    /// A downstream that cannot be reached or initialized is fatal. Failing
    /// to enumerate a capability category is not: that category is left out.
    pub async fn connect(
        name: impl Into<String>,
        config: ServerConfig,
        settings: ProxySettings,
        recorder: Recorder,
    ) -> Result<Self> {
        let name = name.into();
        let client = DownstreamClient::connect(&name, &config, settings.request_timeout).await?;
        Ok(Self::with_client(config, settings, recorder, Arc::new(client)).await)
    }

    /// Build a proxy around an already connected client
    pub async fn with_client(
        config: ServerConfig,
        settings: ProxySettings,
        recorder: Recorder,
        client: Arc<DownstreamClient>,
    ) -> Self {
        let catalog = Catalog::discover(&client).await;
        Self {
            name: client.server_name().to_string(),
            config,
            settings,
            client,
            recorder,
            catalog,
            readiness: Readiness::new(),
            in_flight: InFlight::default(),
            closed: CancellationToken::new(),
            sessions: Mutex::new(HashSet::new()),
            local_addr: OnceLock::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn readiness(&self) -> &Readiness {
        &self.readiness
    }

    /// Wait until the listener is bound, or until `cancel` fires
    pub async fn wait_ready(&self, cancel: &CancellationToken) -> Result<()> {
        self.readiness.wait_ready(cancel).await
    }

    /// Bound address, once listening
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    /// Endpoint URL agents should use, once listening
    pub fn url(&self) -> Option<String> {
        self.local_addr()
            .map(|addr| format!("http://{}{}", addr, self.settings.path))
    }

    /// Calls being forwarded right now
    pub fn in_flight(&self) -> Vec<InFlightCall> {
        self.in_flight.snapshot()
    }

    /// Names of the tools agents are allowed to call
    ///
    /// With all tools enabled the downstream is asked again, so tools it
    /// added since startup are included. Otherwise the static allow-list is
    /// returned as configured.
    pub async fn allowed_tools(&self) -> Result<Vec<String>> {
        if !self.config.enable_all_tools {
            return Ok(self.config.static_allow_list.clone());
        }

        drain(self.client.tools(), &self.name, "tools")
            .await
            .map(|tools| tools.into_iter().map(|tool| tool.name).collect())
            .ok_or_else(|| {
                McpCheckError::Protocol(format!("Could not enumerate tools of '{}'", self.name))
            })
    }

    fn tool_visible(&self, name: &str) -> bool {
        self.config.enable_all_tools || self.config.static_allow_list.iter().any(|t| t == name)
    }

    /// Handle one JSON-RPC message; notifications produce no response
    pub async fn handle_request(&self, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
        let Some(id) = request.id.clone() else {
            debug!(server = %self.name, method = %request.method, "Notification");
            return None;
        };

        let outcome = match request.method.as_str() {
            methods::INITIALIZE => self.initialize_result(),
            methods::PING => Ok(json!({})),
            methods::TOOLS_LIST => self.list_tools(),
            methods::TOOLS_CALL => self.call_tool(request.params).await,
            methods::RESOURCES_LIST => listing(&self.catalog.resources, "resources"),
            methods::RESOURCE_TEMPLATES_LIST => {
                listing(&self.catalog.resource_templates, "resourceTemplates")
            }
            methods::RESOURCES_READ => self.read_resource(request.params).await,
            methods::PROMPTS_LIST => listing(&self.catalog.prompts, "prompts"),
            methods::PROMPTS_GET => self.get_prompt(request.params).await,
            _ => Err(JsonRpcError::method_not_found()),
        };

        Some(match outcome {
            Ok(result) => JsonRpcResponse::success(id, result),
            Err(error) => JsonRpcResponse::error(id, error),
        })
    }

    fn initialize_result(&self) -> std::result::Result<Value, JsonRpcError> {
        let downstream = self.client.info();
        let result = InitializeResult {
            protocol_version: downstream.protocol_version.clone(),
            capabilities: ServerCapabilities {
                tools: self.catalog.tools.as_ref().map(|_| ToolsCapability::default()),
                resources: (self.catalog.resources.is_some() || self.catalog.resource_templates.is_some())
                    .then(ResourcesCapability::default),
                prompts: self.catalog.prompts.as_ref().map(|_| PromptsCapability::default()),
            },
            server_info: downstream.server_info.clone(),
            instructions: downstream.instructions.clone(),
        };
        serde_json::to_value(result).map_err(|e| JsonRpcError::internal_error(e.to_string()))
    }

    fn list_tools(&self) -> std::result::Result<Value, JsonRpcError> {
        let tools = self.catalog.tools.as_ref().ok_or_else(|| unavailable("tools"))?;
        let visible: Vec<&McpTool> = tools.iter().filter(|tool| self.tool_visible(&tool.name)).collect();
        Ok(json!({ "tools": visible }))
    }

    async fn call_tool(&self, params: Option<Value>) -> std::result::Result<Value, JsonRpcError> {
        if self.catalog.tools.is_none() {
            return Err(unavailable("tools"));
        }
        let (call, raw): (ToolCallParams, Value) = parse_params(params)?;
        if !self.tool_visible(&call.name) {
            return Err(JsonRpcError::invalid_params(format!(
                "Tool '{}' is not allowed on '{}'",
                call.name, self.name
            )));
        }

        let arguments = call.arguments.unwrap_or_else(|| json!({}));
        self.forward(CallKind::Tool, methods::TOOLS_CALL, call.name, arguments, raw)
            .await
    }

    async fn read_resource(&self, params: Option<Value>) -> std::result::Result<Value, JsonRpcError> {
        if self.catalog.resources.is_none() && self.catalog.resource_templates.is_none() {
            return Err(unavailable("resources"));
        }
        let (read, raw): (ResourceReadParams, Value) = parse_params(params)?;
        self.forward(CallKind::Resource, methods::RESOURCES_READ, read.uri, json!({}), raw)
            .await
    }

    async fn get_prompt(&self, params: Option<Value>) -> std::result::Result<Value, JsonRpcError> {
        if self.catalog.prompts.is_none() {
            return Err(unavailable("prompts"));
        }
        let (get, raw): (PromptGetParams, Value) = parse_params(params)?;
        let arguments = get.arguments.unwrap_or_else(|| json!({}));
        self.forward(CallKind::Prompt, methods::PROMPTS_GET, get.name, arguments, raw)
            .await
    }

    /// Forward one invocation and record its outcome
    async fn forward(
        &self,
        kind: CallKind,
        method: &str,
        name: String,
        arguments: Value,
        params: Value,
    ) -> std::result::Result<Value, JsonRpcError> {
        let _in_flight = self.in_flight.enter(method, &name);
        if self.closed.is_cancelled() {
            return Err(shut_down());
        }
        let start = CallStart::now();

        let outcome = tokio::select! {
            biased;
            outcome = self.client.call(method, Some(params)) => outcome.map_err(|e| e.to_rpc_error()),
            _ = self.closed.cancelled() => {
                warn!(server = %self.name, %kind, name = %name, "Call cut off by shutdown");
                Err(shut_down())
            }
        };

        let sequence = self.recorder.record(
            kind,
            self.name.as_str(),
            name.as_str(),
            arguments,
            CallOutcome::from(outcome.clone()),
            start,
        );
        debug!(
            server = %self.name,
            %kind,
            name = %name,
            sequence,
            failed = outcome.is_err(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Forwarded call"
        );

        outcome
    }

    /// Serve until `cancel` fires, then drain within the grace period
    ///
    /// Readiness is signalled once the listener is bound. Calls still running
    /// when the grace period ends are cut off and recorded as failed; once
    /// this returns the proxy records nothing more. The downstream connection
    /// is closed on the way out either way.
    ///
    /// # Errors
    ///
    /// Returns [`McpCheckError::ShutdownTimeout`] when in-flight calls do not
    /// finish within `shutdown_grace`.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let result = self.serve(&cancel).await;

        self.closed.cancel();
        self.in_flight.wait_drained().await;

        if let Err(e) = self.client.close().await {
            warn!(server = %self.name, "Failed to close downstream connection: {}", e);
        }
        result
    }

    async fn serve(self: &Arc<Self>, cancel: &CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(self.settings.bind_addr()).await?;
        let addr = listener.local_addr()?;
        let _ = self.local_addr.set(addr);

        info!(server = %self.name, url = %format!("http://{}{}", addr, self.settings.path), "Proxy listening");
        self.readiness.mark_ready();

        let router = Router::new()
            .route(
                &self.settings.path,
                post(post_message).get(open_stream).delete(end_session),
            )
            .with_state(Arc::clone(self));

        let serve = axum::serve(listener, router)
            .with_graceful_shutdown(cancel.clone().cancelled_owned())
            .into_future();
        tokio::pin!(serve);

        tokio::select! {
            result = &mut serve => Ok(result?),
            _ = cancel.cancelled() => {
                info!(server = %self.name, "Shutting down proxy");
                let grace = self.settings.shutdown_grace;
                match tokio::time::timeout(grace, &mut serve).await {
                    Ok(result) => {
                        info!(server = %self.name, "Proxy stopped");
                        Ok(result?)
                    }
                    Err(_) => {
                        let pending = self.in_flight.snapshot();
                        warn!(
                            server = %self.name,
                            in_flight = pending.len(),
                            calls = ?pending.iter().map(|c| format!("{} {}", c.method, c.name)).collect::<Vec<_>>(),
                            "Grace period elapsed, closing connections"
                        );
                        Err(McpCheckError::ShutdownTimeout(grace))
                    }
                }
            }
        }
    }

    fn open_session(&self) -> String {
        let session = uuid::Uuid::new_v4().to_string();
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session.clone());
        session
    }

    fn session_known(&self, session: &str) -> bool {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(session)
    }

    fn close_session(&self, session: &str) -> bool {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(session)
    }

    async fn dispatch_value(&self, message: Value) -> Option<JsonRpcResponse> {
        match serde_json::from_value::<JsonRpcRequest>(message.clone()) {
            Ok(request) => self.handle_request(request).await,
            Err(e) => {
                let id = message
                    .get("id")
                    .cloned()
                    .and_then(|id| serde_json::from_value::<RequestId>(id).ok())
                    .unwrap_or_default();
                debug!(server = %self.name, "Invalid request: {}", e);
                Some(JsonRpcResponse::error(id, JsonRpcError::invalid_request()))
            }
        }
    }
}

fn shut_down() -> JsonRpcError {
    JsonRpcError::internal_error("Proxy shut down before the downstream answered")
}

fn unavailable(category: &str) -> JsonRpcError {
    JsonRpcError::new(
        error_codes::CAPABILITY_UNAVAILABLE,
        format!("Server does not offer {}", category),
    )
}

fn listing<T: serde::Serialize>(
    entries: &Option<Vec<T>>,
    key: &str,
) -> std::result::Result<Value, JsonRpcError> {
    let entries = entries.as_ref().ok_or_else(|| unavailable(key))?;
    let mut result = serde_json::Map::new();
    result.insert(
        key.to_string(),
        serde_json::to_value(entries).map_err(|e| JsonRpcError::internal_error(e.to_string()))?,
    );
    Ok(Value::Object(result))
}

/// Decode typed params while keeping the raw value for forwarding
fn parse_params<T: DeserializeOwned>(params: Option<Value>) -> std::result::Result<(T, Value), JsonRpcError> {
    let raw = params.ok_or_else(|| JsonRpcError::invalid_params("Missing params"))?;
    let typed = serde_json::from_value(raw.clone())
        .map_err(|e| JsonRpcError::invalid_params(format!("Invalid params: {}", e)))?;
    Ok((typed, raw))
}

fn session_header(headers: &HeaderMap) -> Option<&str> {
    headers.get(SESSION_ID_HEADER).and_then(|v| v.to_str().ok())
}

async fn post_message(State(proxy): State<Arc<ProxyServer>>, headers: HeaderMap, body: Bytes) -> Response {
    let response = handle_post(&proxy, &headers, body).await;
    if proxy.closed.is_cancelled() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    response
}

async fn handle_post(proxy: &ProxyServer, headers: &HeaderMap, body: Bytes) -> Response {
    if let Some(session) = session_header(headers) {
        if !proxy.session_known(session) {
            return StatusCode::NOT_FOUND.into_response();
        }
    }

    let message: Value = match serde_json::from_slice(&body) {
        Ok(message) => message,
        Err(_) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(JsonRpcResponse::error(RequestId::Null, JsonRpcError::parse_error())),
            )
                .into_response();
        }
    };

    match message {
        Value::Array(batch) => {
            if batch.is_empty() {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(JsonRpcResponse::error(RequestId::Null, JsonRpcError::invalid_request())),
                )
                    .into_response();
            }

            let responses: Vec<JsonRpcResponse> =
                join_all(batch.into_iter().map(|message| proxy.dispatch_value(message)))
                    .await
                    .into_iter()
                    .flatten()
                    .collect();
            if responses.is_empty() {
                StatusCode::ACCEPTED.into_response()
            } else {
                Json(responses).into_response()
            }
        }
        message => {
            let is_initialize = message.get("method").and_then(Value::as_str) == Some(methods::INITIALIZE);
            let Some(response) = proxy.dispatch_value(message).await else {
                return StatusCode::ACCEPTED.into_response();
            };

            let mut reply = Json(&response).into_response();
            if is_initialize && response.error.is_none() {
                let session = proxy.open_session();
                if let Ok(value) = HeaderValue::from_str(&session) {
                    reply.headers_mut().insert(SESSION_ID_HEADER, value);
                }
            }
            reply
        }
    }
}

/// No server-initiated stream is offered
async fn open_stream() -> Response {
    (
        StatusCode::METHOD_NOT_ALLOWED,
        [(header::ALLOW, HeaderValue::from_static("POST, DELETE"))],
    )
        .into_response()
}

async fn end_session(State(proxy): State<Arc<ProxyServer>>, headers: HeaderMap) -> StatusCode {
    match session_header(&headers) {
        Some(session) if proxy.close_session(session) => StatusCode::OK,
        Some(_) => StatusCode::NOT_FOUND,
        None => StatusCode::BAD_REQUEST,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::MemoryTransport;
    use serde_json::json;
    use std::time::Duration;

    fn downstream(with_prompts: bool) -> Arc<MemoryTransport> {
        Arc::new(kube_server(with_prompts))
    }

    fn kube_server(with_prompts: bool) -> MemoryTransport {
        MemoryTransport::new(move |req| match req.method.as_str() {
            "initialize" => Some(Ok(json!({
                "protocolVersion": "2025-03-26",
                "capabilities": {"tools": {}, "resources": {}},
                "serverInfo": {"name": "kube-mcp", "version": "0.9.0"},
                "instructions": "read only"
            }))),
            "tools/list" => Some(Ok(json!({"tools": [
                {"name": "pods_list", "inputSchema": {"type": "object"}},
                {"name": "pods_delete", "inputSchema": {"type": "object"}, "annotations": {"destructiveHint": true}}
            ]}))),
            "tools/call" => {
                let name = req.params.as_ref().and_then(|p| p.get("name")).and_then(Value::as_str);
                match name {
                    Some("pods_list") => Some(Ok(json!({"content": [{"type": "text", "text": "pod-a"}]}))),
                    _ => Some(Err(JsonRpcError::new(-32602, "Unknown tool"))),
                }
            }
            "resources/list" => Some(Ok(json!({"resources": [{"uri": "k8s://ns/default", "name": "default"}]}))),
            "resources/templates/list" => Some(Ok(json!({"resourceTemplates": []}))),
            "resources/read" => Some(Ok(json!({"contents": [{"uri": "k8s://ns/default", "text": "{}"}]}))),
            "prompts/list" if with_prompts => Some(Ok(json!({"prompts": [{"name": "triage"}]}))),
            _ => None,
        })
    }

    /// Every downstream answer takes ten seconds
    async fn slow_proxy(recorder: Recorder) -> Arc<ProxyServer> {
        let transport = Arc::new(kube_server(false).with_latency(Duration::from_secs(10)));
        let client = DownstreamClient::with_transport("kubernetes", transport, Duration::from_secs(60))
            .await
            .unwrap();
        Arc::new(
            ProxyServer::with_client(
                ServerConfig::subprocess("kube", vec![]),
                ProxySettings::default(),
                recorder,
                Arc::new(client),
            )
            .await,
        )
    }

    async fn proxy(config: ServerConfig, transport: Arc<MemoryTransport>, recorder: Recorder) -> ProxyServer {
        let client = DownstreamClient::with_transport("kubernetes", transport, Duration::from_secs(1))
            .await
            .unwrap();
        ProxyServer::with_client(config, ProxySettings::default(), recorder, Arc::new(client)).await
    }

    fn request(id: i64, method: &str, params: Value) -> JsonRpcRequest {
        JsonRpcRequest::new(id, method).with_params(params)
    }

    #[tokio::test]
    async fn test_tool_call_forwarded_and_recorded() {
        let recorder = Recorder::new();
        let transport = downstream(false);
        let proxy = proxy(ServerConfig::subprocess("kube", vec![]), transport.clone(), recorder.clone()).await;

        let params = json!({"name": "pods_list", "arguments": {"namespace": "default"}});
        let response = proxy
            .handle_request(request(7, "tools/call", params.clone()))
            .await
            .unwrap();
        assert_eq!(response.id, RequestId::Number(7));
        assert_eq!(response.result.unwrap()["content"][0]["text"], "pod-a");

        let forwarded = transport.sent().into_iter().find(|r| r.method == "tools/call").unwrap();
        assert_eq!(forwarded.params, Some(params));

        let history = recorder.snapshot();
        assert_eq!(history.len(), 1);
        let record = &history.records()[0];
        assert_eq!(record.kind, CallKind::Tool);
        assert_eq!(record.server_name, "kubernetes");
        assert_eq!(record.name, "pods_list");
        assert_eq!(record.arguments, json!({"namespace": "default"}));
        assert!(!record.outcome.is_error());
    }

    #[tokio::test]
    async fn test_downstream_error_passes_through_and_is_recorded() {
        let recorder = Recorder::new();
        let proxy = proxy(ServerConfig::subprocess("kube", vec![]), downstream(false), recorder.clone()).await;

        let response = proxy
            .handle_request(request(1, "tools/call", json!({"name": "pods_delete"})))
            .await
            .unwrap();
        let error = response.error.unwrap();
        assert_eq!(error.code, -32602);
        assert_eq!(error.message, "Unknown tool");

        let history = recorder.snapshot();
        assert_eq!(history.len(), 1);
        assert_eq!(
            history.records()[0].outcome,
            CallOutcome::Error(JsonRpcError::new(-32602, "Unknown tool"))
        );
        assert_eq!(history.records()[0].arguments, json!({}));
    }

    #[tokio::test]
    async fn test_static_allow_list_hides_and_blocks() {
        let recorder = Recorder::new();
        let transport = downstream(false);
        let config = ServerConfig::subprocess("kube", vec![]).with_allow_list(["pods_list"]);
        let proxy = proxy(config, transport.clone(), recorder.clone()).await;

        let listed = proxy.handle_request(request(1, "tools/list", json!({}))).await.unwrap();
        let tools = listed.result.unwrap()["tools"].as_array().unwrap().clone();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0]["name"], "pods_list");

        let blocked = proxy
            .handle_request(request(2, "tools/call", json!({"name": "pods_delete"})))
            .await
            .unwrap();
        assert_eq!(blocked.error.unwrap().code, error_codes::INVALID_PARAMS);
        assert!(recorder.is_empty());
        assert!(!transport.sent().iter().any(|r| r.method == "tools/call"));

        assert_eq!(proxy.allowed_tools().await.unwrap(), vec!["pods_list".to_string()]);
    }

    #[tokio::test]
    async fn test_allowed_tools_re_enumerates() {
        let proxy = proxy(ServerConfig::subprocess("kube", vec![]), downstream(false), Recorder::new()).await;
        let before = proxy.allowed_tools().await.unwrap();
        assert_eq!(before, vec!["pods_list".to_string(), "pods_delete".to_string()]);
    }

    #[tokio::test]
    async fn test_republished_tools_keep_unknown_fields() {
        let proxy = proxy(ServerConfig::subprocess("kube", vec![]), downstream(false), Recorder::new()).await;
        let listed = proxy.handle_request(request(1, "tools/list", json!({}))).await.unwrap();
        let tools = listed.result.unwrap();
        assert_eq!(tools["tools"][1]["annotations"]["destructiveHint"], true);
        assert_eq!(tools["tools"][0]["inputSchema"], json!({"type": "object"}));
    }

    #[tokio::test]
    async fn test_absent_category() {
        let recorder = Recorder::new();
        let proxy = proxy(ServerConfig::subprocess("kube", vec![]), downstream(false), recorder.clone()).await;

        let listed = proxy.handle_request(request(1, "prompts/list", json!({}))).await.unwrap();
        assert_eq!(listed.error.unwrap().code, error_codes::CAPABILITY_UNAVAILABLE);

        let got = proxy
            .handle_request(request(2, "prompts/get", json!({"name": "triage"})))
            .await
            .unwrap();
        assert_eq!(got.error.unwrap().code, error_codes::CAPABILITY_UNAVAILABLE);
        assert!(recorder.is_empty());

        let init = proxy.handle_request(request(3, "initialize", json!({}))).await.unwrap();
        let init = init.result.unwrap();
        assert!(init["capabilities"].get("prompts").is_none());
        assert!(init["capabilities"].get("tools").is_some());
        assert_eq!(init["serverInfo"]["name"], "kube-mcp");
        assert_eq!(init["instructions"], "read only");
    }

    #[tokio::test]
    async fn test_resource_read_and_prompt_get_recorded() {
        let recorder = Recorder::new();
        let proxy = proxy(ServerConfig::subprocess("kube", vec![]), downstream(true), recorder.clone()).await;

        proxy
            .handle_request(request(1, "resources/read", json!({"uri": "k8s://ns/default"})))
            .await
            .unwrap();
        let prompt = proxy
            .handle_request(request(2, "prompts/get", json!({"name": "triage", "arguments": {"pod": "a"}})))
            .await
            .unwrap();
        // downstream has no prompts/get handler
        assert_eq!(prompt.error.unwrap().code, error_codes::METHOD_NOT_FOUND);

        let history = recorder.snapshot();
        assert_eq!(history.len(), 2);
        assert_eq!(history.records()[0].kind, CallKind::Resource);
        assert_eq!(history.records()[0].name, "k8s://ns/default");
        assert_eq!(history.records()[1].kind, CallKind::Prompt);
        assert_eq!(history.records()[1].arguments, json!({"pod": "a"}));
        assert!(history.records()[1].outcome.is_error());
    }

    #[tokio::test]
    async fn test_notifications_and_unknown_methods() {
        let proxy = proxy(ServerConfig::subprocess("kube", vec![]), downstream(false), Recorder::new()).await;

        assert!(proxy
            .handle_request(JsonRpcRequest::notification("notifications/initialized"))
            .await
            .is_none());

        let unknown = proxy.handle_request(request(1, "sampling/createMessage", json!({}))).await.unwrap();
        assert_eq!(unknown.error.unwrap().code, error_codes::METHOD_NOT_FOUND);

        let bad = proxy.handle_request(request(2, "tools/call", json!({"arguments": {}}))).await.unwrap();
        assert_eq!(bad.error.unwrap().code, error_codes::INVALID_PARAMS);

        let ping = proxy.handle_request(JsonRpcRequest::new(3i64, "ping")).await.unwrap();
        assert_eq!(ping.result, Some(json!({})));
    }

    #[tokio::test(start_paused = true)]
    async fn test_closing_cuts_off_in_flight_call() {
        let recorder = Recorder::new();
        let proxy = slow_proxy(recorder.clone()).await;

        let call = tokio::spawn({
            let proxy = Arc::clone(&proxy);
            async move {
                proxy
                    .handle_request(request(1, "tools/call", json!({"name": "pods_list"})))
                    .await
            }
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(proxy.in_flight().len(), 1);

        proxy.closed.cancel();
        proxy.in_flight.wait_drained().await;
        assert!(proxy.in_flight().is_empty());

        let response = call.await.unwrap().unwrap();
        assert_eq!(response.error.unwrap().code, error_codes::INTERNAL_ERROR);
        let history = recorder.snapshot();
        assert_eq!(history.len(), 1);
        assert!(history.records()[0].outcome.is_error());

        // calls arriving after the cut-off are refused and never recorded
        let late = proxy
            .handle_request(request(2, "tools/call", json!({"name": "pods_list"})))
            .await
            .unwrap();
        assert_eq!(late.error.unwrap().code, error_codes::INTERNAL_ERROR);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(recorder.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_entries_run_concurrently() {
        let recorder = Recorder::new();
        let proxy = slow_proxy(recorder.clone()).await;

        let batch = json!([
            {"jsonrpc": "2.0", "id": 1, "method": "tools/call", "params": {"name": "pods_list"}},
            {"jsonrpc": "2.0", "id": 2, "method": "tools/call", "params": {"name": "pods_list", "arguments": {"a": 1}}},
            {"jsonrpc": "2.0", "method": "notifications/initialized"},
            {"jsonrpc": "2.0", "id": 3, "method": "resources/read", "params": {"uri": "k8s://ns/default"}}
        ]);

        let started = tokio::time::Instant::now();
        let response = handle_post(&proxy, &HeaderMap::new(), Bytes::from(batch.to_string())).await;
        assert!(started.elapsed() < Duration::from_secs(15));
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let responses: Vec<JsonRpcResponse> = serde_json::from_slice(&body).unwrap();
        let ids: Vec<_> = responses.iter().map(|r| r.id.clone()).collect();
        assert_eq!(ids, vec![RequestId::Number(1), RequestId::Number(2), RequestId::Number(3)]);
        assert_eq!(recorder.len(), 3);
    }
}
