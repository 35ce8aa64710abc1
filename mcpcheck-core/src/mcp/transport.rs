//! MCP Transport Implementations
//!
//! Transports carry JSON-RPC traffic to a downstream server. The proxy only
//! ever plays the client role on these, so the trait is request-shaped.

use super::protocol::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, RequestId, SESSION_ID_HEADER};
use crate::error::{McpCheckError, Result};
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Lines of subprocess stderr kept for diagnostics
const STDERR_TAIL_LINES: usize = 64;

/// How long `close` waits for the subprocess to exit after being killed
const CHILD_EXIT_WAIT: Duration = Duration::from_secs(2);

/// Transport trait for talking to a downstream MCP server
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a request and wait for the response carrying the same id
    async fn request(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse>;

    /// Send a notification; no response is expected
    async fn notify(&self, notification: JsonRpcRequest) -> Result<()>;

    /// Tear the connection down
    async fn close(&self) -> Result<()>;

    /// Diagnostic output captured from the peer (subprocess stderr)
    fn diagnostics(&self) -> Option<String> {
        None
    }
}

type PendingMap = Arc<Mutex<HashMap<RequestId, oneshot::Sender<JsonRpcResponse>>>>;

/// Bounded tail of a subprocess's stderr
#[derive(Debug, Default)]
struct StderrTail {
    lines: Mutex<VecDeque<String>>,
}

impl StderrTail {
    fn push(&self, line: String) {
        let mut lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        if lines.len() == STDERR_TAIL_LINES {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    fn snapshot(&self) -> Option<String> {
        let lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        if lines.is_empty() {
            None
        } else {
            Some(lines.iter().map(String::as_str).collect::<Vec<_>>().join("\n"))
        }
    }
}

/// Removes a pending entry if the waiting caller goes away first
struct PendingSlot {
    pending: PendingMap,
    id: RequestId,
}

impl Drop for PendingSlot {
    fn drop(&mut self) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

/// Subprocess transport
///
/// Messages are newline-delimited JSON on the child's stdin/stdout. Stderr is
/// drained continuously and the last lines are kept for connection-failure
/// reports.
pub struct StdioTransport {
    command: String,
    stdin: Arc<tokio::sync::Mutex<ChildStdin>>,
    child: tokio::sync::Mutex<Child>,
    pending: PendingMap,
    stderr: Arc<StderrTail>,
    closed: Arc<AtomicBool>,
    reader: JoinHandle<()>,
    stderr_reader: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for StdioTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StdioTransport")
            .field("command", &self.command)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl StdioTransport {
    /// Spawn `command` and start routing its output
    pub fn spawn(command: &str, args: &[String], env: &BTreeMap<String, String>) -> Result<Self> {
        let mut child = Command::new(command)
            .args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpCheckError::Transport("child stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpCheckError::Transport("child stdout unavailable".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| McpCheckError::Transport("child stderr unavailable".to_string()))?;

        let stdin = Arc::new(tokio::sync::Mutex::new(stdin));
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let tail = Arc::new(StderrTail::default());
        let closed = Arc::new(AtomicBool::new(false));

        let reader = tokio::spawn(read_stdout(
            command.to_string(),
            stdout,
            Arc::clone(&stdin),
            Arc::clone(&pending),
            Arc::clone(&closed),
        ));

        let stderr_tail = Arc::clone(&tail);
        let stderr_command = command.to_string();
        let stderr_reader = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                trace!(command = %stderr_command, "stderr: {}", line);
                stderr_tail.push(line);
            }
        });

        Ok(Self {
            command: command.to_string(),
            stdin,
            child: tokio::sync::Mutex::new(child),
            pending,
            stderr: tail,
            closed,
            reader,
            stderr_reader: Mutex::new(Some(stderr_reader)),
        })
    }

    async fn write(&self, message: &JsonRpcRequest) -> Result<()> {
        write_line(&self.stdin, &serde_json::to_value(message)?).await
    }

    fn closed_error(&self) -> McpCheckError {
        McpCheckError::Transport(format!("'{}' closed its stdout", self.command))
    }
}

async fn write_line(stdin: &tokio::sync::Mutex<ChildStdin>, message: &Value) -> Result<()> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');

    let mut stdin = stdin.lock().await;
    stdin
        .write_all(line.as_bytes())
        .await
        .map_err(|e| McpCheckError::Transport(format!("Failed to write to child stdin: {}", e)))?;
    stdin
        .flush()
        .await
        .map_err(|e| McpCheckError::Transport(format!("Failed to flush child stdin: {}", e)))?;
    Ok(())
}

/// Route child stdout: responses go to their waiting caller, server-initiated
/// requests get answered here.
async fn read_stdout(
    command: String,
    stdout: tokio::process::ChildStdout,
    stdin: Arc<tokio::sync::Mutex<ChildStdin>>,
    pending: PendingMap,
    closed: Arc<AtomicBool>,
) {
    let mut lines = BufReader::new(stdout).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!(command = %command, "Failed to read child stdout: {}", e);
                break;
            }
        };

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let value: Value = match serde_json::from_str(trimmed) {
            Ok(value) => value,
            Err(e) => {
                warn!(command = %command, "Skipping non-JSON line from server: {}", e);
                continue;
            }
        };

        if let Some(method) = value.get("method").and_then(Value::as_str) {
            // ids on server-initiated messages mean the server wants an answer
            if let Some(id) = value.get("id") {
                let id: RequestId = serde_json::from_value(id.clone()).unwrap_or_default();
                let reply = if method == "ping" {
                    JsonRpcResponse::success(id, Value::Object(Default::default()))
                } else {
                    JsonRpcResponse::error(id, JsonRpcError::method_not_found())
                };
                match serde_json::to_value(&reply) {
                    Ok(reply) => {
                        if let Err(e) = write_line(&stdin, &reply).await {
                            warn!(command = %command, "Failed to answer server request: {}", e);
                        }
                    }
                    Err(e) => warn!(command = %command, "Failed to encode reply: {}", e),
                }
            } else {
                debug!(command = %command, method, "Server notification");
            }
            continue;
        }

        match serde_json::from_value::<JsonRpcResponse>(value) {
            Ok(response) => {
                let waiter = pending
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&response.id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(response);
                    }
                    None => debug!(command = %command, id = %response.id, "Response for unknown request"),
                }
            }
            Err(e) => warn!(command = %command, "Malformed response from server: {}", e),
        }
    }

    closed.store(true, Ordering::SeqCst);
    // dropping the senders fails every caller still waiting
    pending.lock().unwrap_or_else(PoisonError::into_inner).clear();
}

#[async_trait]
impl Transport for StdioTransport {
    async fn request(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse> {
        let id = request
            .id
            .clone()
            .ok_or_else(|| McpCheckError::Protocol("request without id".to_string()))?;

        if self.closed.load(Ordering::SeqCst) {
            return Err(self.closed_error());
        }

        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), tx);
        let _slot = PendingSlot {
            pending: Arc::clone(&self.pending),
            id,
        };
        // the reader marks `closed` before clearing `pending`, so an entry
        // inserted after the clear is caught here
        if self.closed.load(Ordering::SeqCst) {
            return Err(self.closed_error());
        }

        self.write(&request).await?;
        rx.await.map_err(|_| self.closed_error())
    }

    async fn notify(&self, notification: JsonRpcRequest) -> Result<()> {
        self.write(&notification).await
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);

        let mut child = self.child.lock().await;
        if let Ok(None) = child.try_wait() {
            if let Err(e) = child.start_kill() {
                warn!(command = %self.command, "Failed to kill server process: {}", e);
            }
        }
        if tokio::time::timeout(CHILD_EXIT_WAIT, child.wait()).await.is_err() {
            warn!(command = %self.command, "Server process did not exit in time");
        }
        drop(child);

        self.reader.abort();
        let stderr_reader = self
            .stderr_reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = stderr_reader {
            // let the tail catch up with whatever the process printed last
            let _ = tokio::time::timeout(CHILD_EXIT_WAIT, handle).await;
        }
        Ok(())
    }

    fn diagnostics(&self) -> Option<String> {
        self.stderr.snapshot()
    }
}

/// Streamable-HTTP transport
///
/// Each message is a POST; responses arrive either as a JSON body or as an
/// event stream. The session id handed out by the server is echoed back.
#[derive(Debug)]
pub struct HttpTransport {
    client: reqwest::Client,
    url: reqwest::Url,
    headers: HeaderMap,
    session_id: Mutex<Option<String>>,
}

impl HttpTransport {
    /// Create a transport for `url`, sending `headers` on every request
    pub fn new(url: &str, headers: &BTreeMap<String, String>) -> Result<Self> {
        let url = reqwest::Url::parse(url)
            .map_err(|e| McpCheckError::Configuration(format!("Invalid server URL '{}': {}", url, e)))?;

        let mut header_map = HeaderMap::new();
        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                McpCheckError::Configuration(format!("Invalid header name '{}': {}", name, e))
            })?;
            let value = HeaderValue::from_str(value).map_err(|e| {
                McpCheckError::Configuration(format!("Invalid value for header '{}': {}", name, e))
            })?;
            header_map.insert(name, value);
        }

        Ok(Self {
            client: reqwest::Client::new(),
            url,
            headers: header_map,
            session_id: Mutex::new(None),
        })
    }

    /// Session id assigned by the server, if any
    pub fn session_id(&self) -> Option<String> {
        self.session_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn post(&self, message: &JsonRpcRequest) -> Result<reqwest::Response> {
        let mut builder = self
            .client
            .post(self.url.clone())
            .headers(self.headers.clone())
            .header(ACCEPT, "application/json, text/event-stream")
            .json(message);
        if let Some(session) = self.session_id() {
            builder = builder.header(SESSION_ID_HEADER, session);
        }

        let response = builder.send().await?;

        if let Some(session) = response
            .headers()
            .get(SESSION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            *self.session_id.lock().unwrap_or_else(PoisonError::into_inner) = Some(session.to_string());
        }

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(McpCheckError::Transport(format!(
                "'{}' answered {} to {}: {}",
                self.url, status, message.method, body
            )));
        }

        Ok(response)
    }
}

async fn read_event_stream(response: reqwest::Response, id: &RequestId) -> Result<JsonRpcResponse> {
    let mut events = response.bytes_stream().eventsource();

    while let Some(event) = events.next().await {
        let event = event.map_err(|e| McpCheckError::Transport(format!("Event stream error: {}", e)))?;
        if event.data.trim().is_empty() {
            continue;
        }

        let value: Value = match serde_json::from_str(&event.data) {
            Ok(value) => value,
            Err(e) => {
                warn!("Skipping non-JSON event: {}", e);
                continue;
            }
        };
        if value.get("method").is_some() {
            debug!("Ignoring server message on response stream");
            continue;
        }

        let response: JsonRpcResponse = serde_json::from_value(value)?;
        if &response.id == id {
            return Ok(response);
        }
    }

    Err(McpCheckError::Transport(format!(
        "Event stream ended before the response to request {} arrived",
        id
    )))
}

#[async_trait]
impl Transport for HttpTransport {
    async fn request(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse> {
        let id = request
            .id
            .clone()
            .ok_or_else(|| McpCheckError::Protocol("request without id".to_string()))?;

        let response = self.post(&request).await?;
        let is_stream = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("text/event-stream"));

        if is_stream {
            read_event_stream(response, &id).await
        } else {
            let body = response.bytes().await?;
            serde_json::from_slice(&body).map_err(|e| {
                McpCheckError::Protocol(format!("Invalid response to {}: {}", request.method, e))
            })
        }
    }

    async fn notify(&self, notification: JsonRpcRequest) -> Result<()> {
        self.post(&notification).await.map(|_| ())
    }

    async fn close(&self) -> Result<()> {
        let Some(session) = self.session_id() else {
            return Ok(());
        };

        let result = self
            .client
            .delete(self.url.clone())
            .headers(self.headers.clone())
            .header(SESSION_ID_HEADER, session)
            .send()
            .await;
        if let Err(e) = result {
            debug!("Session termination failed: {}", e);
        }
        Ok(())
    }
}

type Handler = dyn Fn(&JsonRpcRequest) -> Option<std::result::Result<Value, JsonRpcError>> + Send + Sync;

/// In-memory transport for testing
///
/// A handler answers each request; returning `None` produces
/// "method not found".
pub struct MemoryTransport {
    handler: Box<Handler>,
    sent: Mutex<Vec<JsonRpcRequest>>,
    latency: Option<Duration>,
    diagnostics: Option<String>,
}

impl MemoryTransport {
    /// Create a new memory transport
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&JsonRpcRequest) -> Option<std::result::Result<Value, JsonRpcError>> + Send + Sync + 'static,
    {
        Self {
            handler: Box::new(handler),
            sent: Mutex::new(Vec::new()),
            latency: None,
            diagnostics: None,
        }
    }

    /// Delay every response
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Pretend the peer printed `text` on stderr
    pub fn with_diagnostics(mut self, text: impl Into<String>) -> Self {
        self.diagnostics = Some(text.into());
        self
    }

    /// Everything sent so far, requests and notifications
    pub fn sent(&self) -> Vec<JsonRpcRequest> {
        self.sent.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn request(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let id = request.id.clone().unwrap_or_default();
        let response = match (self.handler)(&request) {
            Some(Ok(result)) => JsonRpcResponse::success(id, result),
            Some(Err(error)) => JsonRpcResponse::error(id, error),
            None => JsonRpcResponse::error(id, JsonRpcError::method_not_found()),
        };
        Ok(response)
    }

    async fn notify(&self, notification: JsonRpcRequest) -> Result<()> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(notification);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    fn diagnostics(&self) -> Option<String> {
        self.diagnostics.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_memory_transport() {
        let transport = MemoryTransport::new(|req| match req.method.as_str() {
            "tools/list" => Some(Ok(json!({"tools": []}))),
            _ => None,
        });

        let response = transport
            .request(JsonRpcRequest::new(1i64, "tools/list"))
            .await
            .unwrap();
        assert_eq!(response.id, RequestId::Number(1));
        assert_eq!(response.result, Some(json!({"tools": []})));

        let response = transport
            .request(JsonRpcRequest::new(2i64, "nope"))
            .await
            .unwrap();
        assert_eq!(response.error.unwrap().code, -32601);

        assert_eq!(transport.sent().len(), 2);
    }

    #[test]
    fn test_stderr_tail_is_bounded() {
        let tail = StderrTail::default();
        assert!(tail.snapshot().is_none());
        for i in 0..(STDERR_TAIL_LINES + 10) {
            tail.push(format!("line {}", i));
        }
        let text = tail.snapshot().unwrap();
        assert_eq!(text.lines().count(), STDERR_TAIL_LINES);
        assert!(text.starts_with("line 10"));
    }

    #[test]
    fn test_http_transport_rejects_bad_url() {
        let err = HttpTransport::new("not a url", &BTreeMap::new()).unwrap_err();
        assert!(matches!(err, McpCheckError::Configuration(_)));
    }

    #[test]
    fn test_http_transport_rejects_bad_header() {
        let mut headers = BTreeMap::new();
        headers.insert("bad header".to_string(), "x".to_string());
        let err = HttpTransport::new("http://127.0.0.1:1/mcp", &headers).unwrap_err();
        assert!(matches!(err, McpCheckError::Configuration(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stdio_transport_round_trip() {
        // `cat` echoes the request back; a request echoed back is not a
        // response, so use a tiny shell responder instead.
        let script = r#"while IFS= read -r line; do
            id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
            printf '{"jsonrpc":"2.0","id":%s,"result":{"ok":true}}\n' "$id"
        done"#;
        let transport = StdioTransport::spawn(
            "sh",
            &["-c".to_string(), script.to_string()],
            &BTreeMap::new(),
        )
        .unwrap();

        let response = transport
            .request(JsonRpcRequest::new(41i64, "ping"))
            .await
            .unwrap();
        assert_eq!(response.id, RequestId::Number(41));
        assert_eq!(response.result, Some(json!({"ok": true})));

        transport.close().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stdio_transport_fails_pending_when_process_exits() {
        let transport = StdioTransport::spawn(
            "sh",
            &["-c".to_string(), "echo 'fatal: no config' >&2; exit 3".to_string()],
            &BTreeMap::new(),
        )
        .unwrap();

        let result = transport.request(JsonRpcRequest::new(1i64, "initialize")).await;
        assert!(result.is_err());

        transport.close().await.unwrap();
        assert_eq!(transport.diagnostics().as_deref(), Some("fatal: no config"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stdio_requests_racing_process_exit_fail_fast() {
        let transport = StdioTransport::spawn(
            "sh",
            &["-c".to_string(), "read -r line; exit 0".to_string()],
            &BTreeMap::new(),
        )
        .unwrap();

        let requests = (0..20i64).map(|id| {
            let transport = &transport;
            async move {
                if id % 2 == 1 {
                    tokio::time::sleep(Duration::from_millis(id as u64)).await;
                }
                tokio::time::timeout(
                    Duration::from_secs(5),
                    transport.request(JsonRpcRequest::new(id, "tools/list")),
                )
                .await
            }
        });

        for outcome in futures::future::join_all(requests).await {
            let result = outcome.expect("request hung after the process exited");
            assert!(result.is_err());
        }

        transport.close().await.unwrap();
    }
}
