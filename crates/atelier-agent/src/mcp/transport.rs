//! MCP transports: stdio subprocess, HTTP POST, and SSE.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::oneshot;

use crate::error::AgentError;
use crate::mcp::protocol::{
    JsonRpcNotification, JsonRpcRequest, initialize_params,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[async_trait]
pub trait McpTransport: Send + Sync {
    async fn connect(&mut self) -> Result<(), AgentError>;

    async fn request(&mut self, method: &str, params: Value) -> Result<Value, AgentError>;

    async fn close(&mut self);
}

fn transport_err(transport: &str, reason: impl std::fmt::Display) -> AgentError {
    AgentError::McpServerFailed {
        transport: transport.to_string(),
        reason: reason.to_string(),
    }
}

/// Pull the `result` out of a JSON-RPC response, surfacing `error`.
fn unwrap_response(transport: &str, response: Value) -> Result<Value, AgentError> {
    if let Some(error) = response.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error");
        return Err(transport_err(transport, message));
    }
    Ok(response.get("result").cloned().unwrap_or(Value::Null))
}

// ── stdio ─────────────────────────────────────────────────────────────────

/// Spawns the configured command and speaks line-delimited JSON-RPC over its
/// stdin/stdout, completing the initialize handshake on connect.
pub struct StdioTransport {
    argv: Vec<String>,
    env: Vec<(String, String)>,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    stdout: Option<BufReader<ChildStdout>>,
    request_id: u64,
    init_done: bool,
}

impl StdioTransport {
    pub fn from_config(config: &Value) -> Self {
        let command = config
            .get("command")
            .and_then(Value::as_str)
            .unwrap_or("npx")
            .to_string();
        let args: Vec<String> = config
            .get("args")
            .and_then(Value::as_array)
            .map(|arr| {
                arr.iter()
                    .map(|v| match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        let env: Vec<(String, String)> = config
            .get("env")
            .and_then(Value::as_object)
            .map(|map| {
                map.iter()
                    .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                    .collect()
            })
            .unwrap_or_default();
        let mut argv = vec![command];
        argv.extend(args);
        Self {
            argv,
            env,
            child: None,
            stdin: None,
            stdout: None,
            request_id: 0,
            init_done: false,
        }
    }

    fn next_id(&mut self) -> u64 {
        self.request_id += 1;
        self.request_id
    }

    async fn send_request(&mut self, method: &str, params: Value) -> Result<Value, AgentError> {
        let id = self.next_id();
        let request = JsonRpcRequest::new(id, method, params);
        let line = format!("{}\n", serde_json::to_string(&request)?);

        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| transport_err("stdio", "not connected"))?;
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| transport_err("stdio", e))?;
        stdin.flush().await.map_err(|e| transport_err("stdio", e))?;

        let stdout = self
            .stdout
            .as_mut()
            .ok_or_else(|| transport_err("stdio", "not connected"))?;
        let read_response = async {
            let mut buf = String::new();
            loop {
                buf.clear();
                let n = stdout
                    .read_line(&mut buf)
                    .await
                    .map_err(|e| transport_err("stdio", e))?;
                if n == 0 {
                    return Err(transport_err("stdio", "server closed its stdout"));
                }
                let Ok(response) = serde_json::from_str::<Value>(buf.trim()) else {
                    continue;
                };
                // Server-initiated notifications are interleaved with
                // responses; skip anything that is not our reply.
                if response.get("id").and_then(Value::as_u64) == Some(id) {
                    return unwrap_response("stdio", response);
                }
            }
        };
        tokio::time::timeout(REQUEST_TIMEOUT, read_response)
            .await
            .map_err(|_| transport_err("stdio", "request timed out"))?
    }

    async fn send_notification(&mut self, method: &str) -> Result<(), AgentError> {
        let line = format!(
            "{}\n",
            serde_json::to_string(&JsonRpcNotification::new(method))?
        );
        if let Some(stdin) = self.stdin.as_mut() {
            stdin
                .write_all(line.as_bytes())
                .await
                .map_err(|e| transport_err("stdio", e))?;
            stdin.flush().await.map_err(|e| transport_err("stdio", e))?;
        }
        Ok(())
    }
}

#[async_trait]
impl McpTransport for StdioTransport {
    async fn connect(&mut self) -> Result<(), AgentError> {
        if self.init_done && self.child.is_some() {
            return Ok(());
        }
        let mut cmd = Command::new(&self.argv[0]);
        cmd.args(&self.argv[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        let mut child = cmd.spawn().map_err(|e| transport_err("stdio", e))?;
        self.stdin = child.stdin.take();
        self.stdout = child.stdout.take().map(BufReader::new);
        self.child = Some(child);

        match self.send_request("initialize", initialize_params()).await {
            Ok(_) => {
                self.send_notification("notifications/initialized").await?;
                self.init_done = true;
                Ok(())
            }
            Err(err) => {
                self.close().await;
                Err(err)
            }
        }
    }

    async fn request(&mut self, method: &str, params: Value) -> Result<Value, AgentError> {
        if !self.init_done {
            self.connect().await?;
        }
        self.send_request(method, params).await
    }

    async fn close(&mut self) {
        self.stdin = None;
        self.stdout = None;
        if let Some(mut child) = self.child.take() {
            let _ = child.start_kill();
            let _ = tokio::time::timeout(Duration::from_secs(2), child.wait()).await;
        }
        self.init_done = false;
    }
}

// ── HTTP ──────────────────────────────────────────────────────────────────

/// Plain request/response JSON-RPC over HTTP POST.
pub struct HttpTransport {
    url: String,
    headers: Vec<(String, String)>,
    client: reqwest::Client,
    request_id: u64,
    init_done: bool,
}

impl HttpTransport {
    pub fn from_config(config: &Value) -> Self {
        let url = config
            .get("url")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let headers = config
            .get("headers")
            .and_then(Value::as_object)
            .map(|map| {
                map.iter()
                    .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                    .collect()
            })
            .unwrap_or_default();
        Self {
            url,
            headers,
            client: reqwest::Client::new(),
            request_id: 0,
            init_done: false,
        }
    }

    async fn post(&mut self, method: &str, params: Value) -> Result<Value, AgentError> {
        self.request_id += 1;
        let request = JsonRpcRequest::new(self.request_id, method, params);
        let mut builder = self.client.post(&self.url).json(&request);
        for (key, value) in &self.headers {
            builder = builder.header(key, value);
        }
        let response = builder
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|e| transport_err("http", e))?;
        if !response.status().is_success() {
            return Err(transport_err(
                "http",
                format!("status {}", response.status().as_u16()),
            ));
        }
        let body: Value = response.json().await.map_err(|e| transport_err("http", e))?;
        unwrap_response("http", body)
    }
}

#[async_trait]
impl McpTransport for HttpTransport {
    async fn connect(&mut self) -> Result<(), AgentError> {
        if self.url.is_empty() {
            return Err(transport_err("http", "missing url"));
        }
        if self.init_done {
            return Ok(());
        }
        self.post("initialize", initialize_params()).await?;
        // initialized is a notification; servers tolerate it as a POST
        // without an id by contract, but sending it as a regular request id
        // breaks some implementations, so it is fired and forgotten.
        let note = JsonRpcNotification::new("notifications/initialized");
        let mut builder = self.client.post(&self.url).json(&note);
        for (key, value) in &self.headers {
            builder = builder.header(key, value);
        }
        let _ = builder.timeout(REQUEST_TIMEOUT).send().await;
        self.init_done = true;
        Ok(())
    }

    async fn request(&mut self, method: &str, params: Value) -> Result<Value, AgentError> {
        if !self.init_done {
            self.connect().await?;
        }
        self.post(method, params).await
    }

    async fn close(&mut self) {
        self.init_done = false;
    }
}

// ── SSE ───────────────────────────────────────────────────────────────────

/// SSE transport: a long-lived GET stream delivers responses; requests are
/// POSTed to the endpoint the server announces in its first `endpoint`
/// event. Responses are matched to callers by JSON-RPC id.
pub struct SseTransport {
    url: String,
    headers: Vec<(String, String)>,
    client: reqwest::Client,
    endpoint: Arc<Mutex<Option<String>>>,
    pending: Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>>,
    reader: Option<tokio::task::JoinHandle<()>>,
    request_id: u64,
    init_done: bool,
}

impl SseTransport {
    pub fn from_config(config: &Value) -> Self {
        let url = config
            .get("url")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let headers = config
            .get("headers")
            .and_then(Value::as_object)
            .map(|map| {
                map.iter()
                    .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                    .collect()
            })
            .unwrap_or_default();
        Self {
            url,
            headers,
            client: reqwest::Client::new(),
            endpoint: Arc::new(Mutex::new(None)),
            pending: Arc::new(Mutex::new(HashMap::new())),
            reader: None,
            request_id: 0,
            init_done: false,
        }
    }

    async fn open_stream(&mut self) -> Result<(), AgentError> {
        let mut builder = self.client.get(&self.url);
        for (key, value) in &self.headers {
            builder = builder.header(key, value);
        }
        let response = builder.send().await.map_err(|e| transport_err("sse", e))?;
        if !response.status().is_success() {
            return Err(transport_err(
                "sse",
                format!("status {}", response.status().as_u16()),
            ));
        }

        let endpoint = self.endpoint.clone();
        let pending = self.pending.clone();
        let base_url = self.url.clone();
        self.reader = Some(tokio::spawn(async move {
            let mut events = response.bytes_stream().eventsource();
            while let Some(event) = events.next().await {
                let Ok(event) = event else { break };
                match event.event.as_str() {
                    "endpoint" => {
                        let raw = event.data.trim().to_string();
                        let full = if raw.starts_with("http") {
                            raw
                        } else {
                            join_endpoint(&base_url, &raw)
                        };
                        *endpoint.lock() = Some(full);
                    }
                    _ => {
                        let Ok(message) = serde_json::from_str::<Value>(&event.data) else {
                            continue;
                        };
                        if let Some(id) = message.get("id").and_then(Value::as_u64) {
                            if let Some(tx) = pending.lock().remove(&id) {
                                let _ = tx.send(message);
                            }
                        }
                    }
                }
            }
        }));

        // Wait briefly for the endpoint announcement.
        for _ in 0..50 {
            if self.endpoint.lock().is_some() {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        Err(transport_err("sse", "no endpoint event received"))
    }

    async fn send(&mut self, method: &str, params: Value) -> Result<Value, AgentError> {
        self.request_id += 1;
        let id = self.request_id;
        let request = JsonRpcRequest::new(id, method, params);

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        let endpoint = self
            .endpoint
            .lock()
            .clone()
            .ok_or_else(|| transport_err("sse", "not connected"))?;
        let mut builder = self.client.post(&endpoint).json(&request);
        for (key, value) in &self.headers {
            builder = builder.header(key, value);
        }
        let post = builder.timeout(REQUEST_TIMEOUT).send().await;
        if let Err(err) = post {
            self.pending.lock().remove(&id);
            return Err(transport_err("sse", err));
        }

        let response = tokio::time::timeout(REQUEST_TIMEOUT, rx)
            .await
            .map_err(|_| {
                self.pending.lock().remove(&id);
                transport_err("sse", "request timed out")
            })?
            .map_err(|_| transport_err("sse", "stream closed"))?;
        unwrap_response("sse", response)
    }
}

fn join_endpoint(base_url: &str, path: &str) -> String {
    match base_url.find("://").and_then(|scheme_end| {
        base_url[scheme_end + 3..]
            .find('/')
            .map(|host_end| &base_url[..scheme_end + 3 + host_end])
    }) {
        Some(origin) => format!("{}{}", origin, path),
        None => format!("{}{}", base_url.trim_end_matches('/'), path),
    }
}

#[async_trait]
impl McpTransport for SseTransport {
    async fn connect(&mut self) -> Result<(), AgentError> {
        if self.url.is_empty() {
            return Err(transport_err("sse", "missing url"));
        }
        if self.init_done {
            return Ok(());
        }
        self.open_stream().await?;
        self.send("initialize", initialize_params()).await?;
        self.init_done = true;
        Ok(())
    }

    async fn request(&mut self, method: &str, params: Value) -> Result<Value, AgentError> {
        if !self.init_done {
            self.connect().await?;
        }
        self.send(method, params).await
    }

    async fn close(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        *self.endpoint.lock() = None;
        self.pending.lock().clear();
        self.init_done = false;
    }
}

/// Build a transport from a server row's transport name and config JSON.
pub fn build_transport(transport: &str, config: &Value) -> Result<Box<dyn McpTransport>, AgentError> {
    match transport.trim().to_lowercase().as_str() {
        "stdio" => Ok(Box::new(StdioTransport::from_config(config))),
        "http" => Ok(Box::new(HttpTransport::from_config(config))),
        "sse" => Ok(Box::new(SseTransport::from_config(config))),
        other => Err(AgentError::Validation(format!(
            "Unsupported MCP transport: {}",
            other
        ))),
    }
}
