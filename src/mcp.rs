//! Remote tool servers over the Model Context Protocol.
//!
//! The agent only sees [`RemoteToolClient`]: list a server's tools, call one by name.
//! [`McpClientPool`] implements it over one [`McpClient`] per configured server.
//!
//! # Transport Types
//! - **Stdio**: launch the server as a subprocess, newline-delimited JSON-RPC on stdin/stdout
//! - **HTTP**: POST each JSON-RPC request to the server URL
//!
//! # Example
//! ```rust,ignore
//! use toolweave::mcp::{McpClient, McpClientPool, StdioTransport};
//!
//! let transport = StdioTransport::new("npx", &["-y", "@modelcontextprotocol/server-filesystem", "."])?;
//! let mut pool = McpClientPool::new();
//! pool.insert("files", McpClient::new(transport));
//! let tools = pool.list_tools("files").await?;
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::McpServerConfig;
use crate::error::{AgentError, Result};

const PROTOCOL_VERSION: &str = "2024-11-05";

// ─────────────────────────────────────────────────────────────────────────────
// Protocol types
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    /// Ids are assigned by the transport.
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: 0,
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    #[serde(default)]
    pub id: u64,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

/// A tool advertised by a server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "inputSchema", default)]
    pub input_schema: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListToolsResult {
    pub tools: Vec<McpToolDefinition>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ContentItem {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image")]
    Image {
        data: String,
        #[serde(rename = "mimeType", default)]
        mime_type: Option<String>,
    },
    #[serde(rename = "resource")]
    Resource { resource: Value },
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallToolResult {
    pub content: Vec<ContentItem>,
    #[serde(rename = "isError", default)]
    pub is_error: bool,
}

impl CallToolResult {
    fn text(&self) -> String {
        self.content
            .iter()
            .map(|item| match item {
                ContentItem::Text { text } => text.clone(),
                ContentItem::Image { .. } => "[image]".to_string(),
                ContentItem::Resource { resource } => format!("[resource: {resource}]"),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// The opaque artifact handed back to the agent.
    ///
    /// A single text item that holds JSON is decoded; other text is kept as a string.
    /// Images ride along under `images`.
    pub fn into_artifact(self) -> Value {
        let images: Vec<Value> = self
            .content
            .iter()
            .filter_map(|item| match item {
                ContentItem::Image { data, mime_type } => Some(json!({
                    "type": "image",
                    "data": data,
                    "mimeType": mime_type.clone().unwrap_or_else(|| "image/png".to_string()),
                })),
                _ => None,
            })
            .collect();

        let text = self.text();
        let content = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));
        if images.is_empty() {
            content
        } else {
            json!({ "content": content, "images": images })
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ServerCapabilities {
    #[serde(default)]
    pub tools: Option<Value>,
    #[serde(default)]
    pub resources: Option<Value>,
    #[serde(default)]
    pub prompts: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InitializeResult {
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    #[serde(default)]
    pub capabilities: ServerCapabilities,
    #[serde(rename = "serverInfo")]
    pub server_info: ServerInfo,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Transports
// ─────────────────────────────────────────────────────────────────────────────

#[async_trait]
pub trait McpTransport: Send + Sync {
    /// Send a JSON-RPC request and wait for its response.
    async fn send(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse>;

    /// Send a notification. No response is read.
    async fn notify(&self, request: JsonRpcRequest) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
    request_id: AtomicU64,
}

impl HttpTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            request_id: AtomicU64::new(1),
        }
    }

    /// Extra headers (e.g. authentication) sent with every request.
    pub fn with_headers(url: impl Into<String>, headers: &HashMap<String, String>) -> Result<Self> {
        let mut header_map = reqwest::header::HeaderMap::new();
        for (key, value) in headers {
            let name = reqwest::header::HeaderName::try_from(key.as_str())
                .map_err(|e| AgentError::configuration(format!("invalid header `{key}`: {e}")))?;
            let value = reqwest::header::HeaderValue::try_from(value.as_str())
                .map_err(|e| AgentError::configuration(format!("invalid value for `{key}`: {e}")))?;
            header_map.insert(name, value);
        }

        let client = reqwest::Client::builder()
            .default_headers(header_map)
            .build()
            .map_err(|e| AgentError::Mcp(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            url: url.into(),
            request_id: AtomicU64::new(1),
        })
    }

    async fn post(&self, request: &JsonRpcRequest) -> Result<reqwest::Response> {
        self.client
            .post(&self.url)
            .json(request)
            .send()
            .await
            .map_err(|e| AgentError::Mcp(format!("HTTP request failed: {e}")))
    }
}

#[async_trait]
impl McpTransport for HttpTransport {
    async fn send(&self, mut request: JsonRpcRequest) -> Result<JsonRpcResponse> {
        request.id = self.request_id.fetch_add(1, Ordering::SeqCst);
        self.post(&request)
            .await?
            .json()
            .await
            .map_err(|e| AgentError::Mcp(format!("failed to parse response: {e}")))
    }

    async fn notify(&self, request: JsonRpcRequest) -> Result<()> {
        self.post(&request).await.map(|_| ())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

pub struct StdioTransport {
    child: Mutex<Option<Child>>,
    stdin: Mutex<Option<ChildStdin>>,
    stdout: Mutex<Option<BufReader<ChildStdout>>>,
    request_id: AtomicU64,
}

impl StdioTransport {
    /// Launch the server process. Must be called inside a tokio runtime.
    pub fn new(command: &str, args: &[&str]) -> Result<Self> {
        Self::with_env(command, args, &HashMap::new())
    }

    pub fn with_env(command: &str, args: &[&str], env: &HashMap<String, String>) -> Result<Self> {
        let mut child = Command::new(command)
            .args(args)
            .envs(env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AgentError::Mcp(format!("failed to spawn MCP server `{command}`: {e}")))?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take().map(BufReader::new);

        Ok(Self {
            child: Mutex::new(Some(child)),
            stdin: Mutex::new(stdin),
            stdout: Mutex::new(stdout),
            request_id: AtomicU64::new(1),
        })
    }

    async fn write_line(&self, request: &JsonRpcRequest) -> Result<()> {
        let mut line = serde_json::to_string(request)?;
        line.push('\n');

        let mut stdin_guard = self.stdin.lock().await;
        let stdin = stdin_guard
            .as_mut()
            .ok_or_else(|| AgentError::Mcp("MCP server stdin not available".into()))?;
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| AgentError::Mcp(format!("failed to write to MCP server: {e}")))?;
        stdin
            .flush()
            .await
            .map_err(|e| AgentError::Mcp(format!("failed to flush: {e}")))
    }
}

#[async_trait]
impl McpTransport for StdioTransport {
    async fn send(&self, mut request: JsonRpcRequest) -> Result<JsonRpcResponse> {
        request.id = self.request_id.fetch_add(1, Ordering::SeqCst);
        self.write_line(&request).await?;

        let mut stdout_guard = self.stdout.lock().await;
        let stdout = stdout_guard
            .as_mut()
            .ok_or_else(|| AgentError::Mcp("MCP server stdout not available".into()))?;
        let mut line = String::new();
        let read = stdout
            .read_line(&mut line)
            .await
            .map_err(|e| AgentError::Mcp(format!("failed to read from MCP server: {e}")))?;
        if read == 0 {
            return Err(AgentError::Mcp("MCP server closed its stdout".into()));
        }
        serde_json::from_str(&line)
            .map_err(|e| AgentError::Mcp(format!("failed to parse response: {e}")))
    }

    async fn notify(&self, request: JsonRpcRequest) -> Result<()> {
        self.write_line(&request).await
    }

    async fn close(&self) -> Result<()> {
        if let Some(child) = self.child.lock().await.as_mut() {
            child
                .kill()
                .await
                .map_err(|e| AgentError::Mcp(format!("failed to kill MCP server: {e}")))?;
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Client
// ─────────────────────────────────────────────────────────────────────────────

pub struct McpClient {
    transport: Box<dyn McpTransport>,
    server_info: Option<ServerInfo>,
    capabilities: Option<ServerCapabilities>,
}

impl McpClient {
    pub fn new<T: McpTransport + 'static>(transport: T) -> Self {
        Self {
            transport: Box::new(transport),
            server_info: None,
            capabilities: None,
        }
    }

    /// Handshake with the server. Later calls are no-ops.
    pub async fn initialize(&mut self) -> Result<&ServerInfo> {
        if self.server_info.is_none() {
            let request = JsonRpcRequest::new(
                "initialize",
                Some(json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": {
                        "name": env!("CARGO_PKG_NAME"),
                        "version": env!("CARGO_PKG_VERSION")
                    }
                })),
            );
            let result: InitializeResult = self.request(request, "initialize").await?;
            info!(server = %result.server_info.name, "connected to MCP server");
            self.capabilities = Some(result.capabilities);
            self.server_info = Some(result.server_info);

            self.transport
                .notify(JsonRpcRequest::new("notifications/initialized", None))
                .await?;
        }

        self.server_info
            .as_ref()
            .ok_or_else(|| AgentError::Mcp("server info not available".into()))
    }

    pub async fn list_tools(&mut self) -> Result<Vec<McpToolDefinition>> {
        self.initialize().await?;
        let result: ListToolsResult = self
            .request(JsonRpcRequest::new("tools/list", None), "tools/list")
            .await?;
        Ok(result.tools)
    }

    pub async fn call_tool(&mut self, name: &str, arguments: Value) -> Result<CallToolResult> {
        self.initialize().await?;
        let request = JsonRpcRequest::new(
            "tools/call",
            Some(json!({ "name": name, "arguments": arguments })),
        );
        self.request(request, "tools/call").await
    }

    async fn request<R: serde::de::DeserializeOwned>(
        &self,
        request: JsonRpcRequest,
        method: &str,
    ) -> Result<R> {
        let response = self.transport.send(request).await?;
        if let Some(error) = response.error {
            return Err(AgentError::Mcp(format!(
                "{method} failed ({}): {}",
                error.code, error.message
            )));
        }
        serde_json::from_value(response.result.unwrap_or_default())
            .map_err(|e| AgentError::Mcp(format!("failed to parse {method} result: {e}")))
    }

    pub async fn close(&self) -> Result<()> {
        self.transport.close().await
    }

    pub fn server_info(&self) -> Option<&ServerInfo> {
        self.server_info.as_ref()
    }

    pub fn capabilities(&self) -> Option<&ServerCapabilities> {
        self.capabilities.as_ref()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Remote tool client
// ─────────────────────────────────────────────────────────────────────────────

/// Remote tool servers addressed by id.
#[async_trait]
pub trait RemoteToolClient: Send + Sync {
    async fn list_tools(&self, server_id: &str) -> Result<Vec<McpToolDefinition>>;

    async fn call(&self, server_id: &str, tool_name: &str, arguments: Value) -> Result<Value>;
}

/// One MCP client per server id.
#[derive(Default, Clone)]
pub struct McpClientPool {
    clients: HashMap<String, Arc<Mutex<McpClient>>>,
}

impl McpClientPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build transports for every configured server. Stdio servers are spawned
    /// immediately, so this must run inside a tokio runtime.
    pub fn from_configs(servers: &[McpServerConfig]) -> Result<Self> {
        let mut pool = Self::new();
        for server in servers {
            let client = match (&server.url, &server.command) {
                (Some(url), None) => {
                    McpClient::new(HttpTransport::with_headers(url.as_str(), &server.headers)?)
                }
                (None, Some(command)) => {
                    let args: Vec<&str> = server.args.iter().map(String::as_str).collect();
                    McpClient::new(StdioTransport::with_env(command, &args, &server.env)?)
                }
                _ => {
                    return Err(AgentError::configuration(format!(
                        "MCP server `{}` needs exactly one of `url` or `command`",
                        server.id
                    )))
                }
            };
            pool.insert(server.id.clone(), client);
        }
        Ok(pool)
    }

    pub fn insert(&mut self, server_id: impl Into<String>, client: McpClient) {
        self.clients
            .insert(server_id.into(), Arc::new(Mutex::new(client)));
    }

    pub fn server_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.clients.keys().cloned().collect();
        ids.sort();
        ids
    }

    fn client(&self, server_id: &str) -> Result<&Arc<Mutex<McpClient>>> {
        self.clients
            .get(server_id)
            .ok_or_else(|| AgentError::Mcp(format!("no MCP server registered as `{server_id}`")))
    }

    pub async fn close(&self) -> Result<()> {
        for client in self.clients.values() {
            client.lock().await.close().await?;
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteToolClient for McpClientPool {
    async fn list_tools(&self, server_id: &str) -> Result<Vec<McpToolDefinition>> {
        let tools = self.client(server_id)?.lock().await.list_tools().await?;
        debug!(server = server_id, count = tools.len(), "listed remote tools");
        Ok(tools)
    }

    async fn call(&self, server_id: &str, tool_name: &str, arguments: Value) -> Result<Value> {
        let result = self
            .client(server_id)?
            .lock()
            .await
            .call_tool(tool_name, arguments)
            .await?;
        if result.is_error {
            return Err(AgentError::Mcp(format!(
                "remote tool `{tool_name}` on `{server_id}` failed: {}",
                result.text()
            )));
        }
        Ok(result.into_artifact())
    }
}
