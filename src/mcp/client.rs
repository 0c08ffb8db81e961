//! MCP 会话：换行分隔的 JSON-RPC 2.0，传输为 stdio（子进程）或 TCP
//!
//! 连接惰性建立：首次请求时打开连接并完成 `initialize` → `notifications/initialized` 握手。
//! 读写出错、对端关闭或请求超时时丢弃连接，下一次请求重新连接。

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::timeout;

use crate::config::McpServerEntry;
use crate::mcp::McpError;

const PROTOCOL_VERSION: &str = "2024-11-05";

#[derive(Debug, Clone, PartialEq)]
pub enum McpEndpoint {
    Stdio {
        program: String,
        args: Vec<String>,
        env: HashMap<String, String>,
    },
    Tcp {
        address: String,
    },
}

impl McpEndpoint {
    pub fn from_entry(entry: &McpServerEntry) -> Result<Self, McpError> {
        match entry.transport.as_str() {
            "stdio" => {
                let program = entry.program.clone().ok_or_else(|| {
                    McpError::Config(format!("server '{}' needs `program` for stdio", entry.id))
                })?;
                Ok(McpEndpoint::Stdio {
                    program,
                    args: entry.args.clone(),
                    env: entry.env.clone(),
                })
            }
            "tcp" => {
                let address = entry.address.clone().ok_or_else(|| {
                    McpError::Config(format!("server '{}' needs `address` for tcp", entry.id))
                })?;
                Ok(McpEndpoint::Tcp { address })
            }
            other => Err(McpError::Config(format!(
                "server '{}': unsupported transport '{other}'",
                entry.id
            ))),
        }
    }
}

/// tools/list 返回的远程工具描述
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteTool {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, alias = "inputSchema")]
    pub input_schema: Value,
}

#[derive(Debug, Deserialize)]
struct ToolListResponse {
    #[serde(default)]
    tools: Vec<RemoteTool>,
}

#[derive(Debug, Deserialize)]
struct ToolCallResponse {
    #[serde(default)]
    content: Vec<Value>,
    #[serde(default, rename = "isError")]
    is_error: bool,
    #[serde(default, rename = "structuredContent")]
    structured_content: Option<Value>,
}

struct Connection {
    reader: BufReader<Box<dyn AsyncRead + Send + Unpin>>,
    writer: Box<dyn AsyncWrite + Send + Unpin>,
    // stdio 传输持有子进程，drop 时结束
    child: Option<Child>,
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(child) = self.child.as_mut() {
            let _ = child.start_kill();
        }
    }
}

impl Connection {
    async fn open(endpoint: &McpEndpoint) -> Result<Self, McpError> {
        match endpoint {
            McpEndpoint::Stdio { program, args, env } => {
                let mut command = Command::new(program);
                command
                    .args(args)
                    .envs(env)
                    .stdin(Stdio::piped())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::null())
                    .kill_on_drop(true);
                let mut child = command
                    .spawn()
                    .map_err(|e| McpError::Transport(format!("spawning {program}: {e}")))?;
                let stdin = child
                    .stdin
                    .take()
                    .ok_or_else(|| McpError::Transport("failed to capture stdin".to_string()))?;
                let stdout = child
                    .stdout
                    .take()
                    .ok_or_else(|| McpError::Transport("failed to capture stdout".to_string()))?;
                Ok(Self {
                    reader: BufReader::new(Box::new(stdout)),
                    writer: Box::new(stdin),
                    child: Some(child),
                })
            }
            McpEndpoint::Tcp { address } => {
                let stream = TcpStream::connect(address)
                    .await
                    .map_err(|e| McpError::Transport(format!("connecting {address}: {e}")))?;
                let (read, write) = stream.into_split();
                Ok(Self {
                    reader: BufReader::new(Box::new(read)),
                    writer: Box::new(write),
                    child: None,
                })
            }
        }
    }

    async fn send(&mut self, body: &Value) -> Result<(), McpError> {
        let mut line = serde_json::to_vec(body)
            .map_err(|e| McpError::Protocol(format!("encoding request: {e}")))?;
        line.push(b'\n');
        self.writer
            .write_all(&line)
            .await
            .map_err(|e| McpError::Transport(format!("writing request: {e}")))?;
        self.writer
            .flush()
            .await
            .map_err(|e| McpError::Transport(format!("flushing request: {e}")))
    }

    /// 读到与 request_id 匹配的响应为止；通知与无法解析的行被忽略
    async fn read_response(&mut self, request_id: u64) -> Result<Value, McpError> {
        loop {
            let mut line = String::new();
            let read = self
                .reader
                .read_line(&mut line)
                .await
                .map_err(|e| McpError::Transport(format!("reading response: {e}")))?;
            if read == 0 {
                return Err(McpError::Transport("server closed the connection".to_string()));
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<Value>(trimmed) {
                Ok(value) if matches_request(&value, request_id) => return Ok(value),
                Ok(_) => continue,
                Err(e) => {
                    tracing::debug!(error = %e, "skipping non-JSON line from MCP server");
                }
            }
        }
    }
}

fn matches_request(payload: &Value, request_id: u64) -> bool {
    match payload.get("id") {
        Some(Value::Number(num)) => num.as_u64() == Some(request_id),
        Some(Value::String(text)) => text.parse::<u64>().map_or(false, |id| id == request_id),
        _ => false,
    }
}

fn extract_result(payload: Value, server_id: &str) -> Result<Value, McpError> {
    if let Some(error) = payload.get("error") {
        let message = error
            .get("message")
            .and_then(|m| m.as_str())
            .map(String::from)
            .unwrap_or_else(|| error.to_string());
        return Err(McpError::Remote(format!("{server_id}: {message}")));
    }
    Ok(payload.get("result").cloned().unwrap_or(Value::Null))
}

/// 与一个 MCP 服务器的会话；同一时刻只有一个在途请求
pub struct McpSession {
    id: String,
    endpoint: McpEndpoint,
    request_timeout: Duration,
    request_id: AtomicU64,
    conn: Mutex<Option<Connection>>,
}

impl McpSession {
    pub fn new(id: impl Into<String>, endpoint: McpEndpoint, request_timeout: Duration) -> Self {
        Self {
            id: id.into(),
            endpoint,
            request_timeout,
            request_id: AtomicU64::new(1),
            conn: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn endpoint(&self) -> &McpEndpoint {
        &self.endpoint
    }

    pub async fn is_connected(&self) -> bool {
        self.conn.lock().await.is_some()
    }

    fn next_id(&self) -> u64 {
        self.request_id.fetch_add(1, Ordering::SeqCst)
    }

    /// 打开连接并完成握手
    async fn handshake(&self) -> Result<Connection, McpError> {
        let mut conn = Connection::open(&self.endpoint).await?;
        let id = self.next_id();
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": "initialize",
            "params": {
                "protocolVersion": PROTOCOL_VERSION,
                "clientInfo": { "name": "hive", "version": env!("CARGO_PKG_VERSION") },
                "capabilities": {}
            }
        });
        conn.send(&body).await?;
        let response = timeout(self.request_timeout, conn.read_response(id))
            .await
            .map_err(|_| McpError::TimedOut {
                limit_ms: self.request_timeout.as_millis() as u64,
            })??;
        extract_result(response, &self.id)?;
        conn.send(&json!({ "jsonrpc": "2.0", "method": "notifications/initialized" }))
            .await?;
        tracing::info!(server = %self.id, "mcp session initialised");
        Ok(conn)
    }

    /// 确保连接可用（connect 语义）
    pub async fn connect(&self) -> Result<(), McpError> {
        let mut guard = self.conn.lock().await;
        if guard.is_none() {
            *guard = Some(self.handshake().await?);
        }
        Ok(())
    }

    async fn request(
        &self,
        method: &str,
        params: Value,
        limit: Duration,
    ) -> Result<Value, McpError> {
        let mut guard = self.conn.lock().await;
        if guard.is_none() {
            *guard = Some(self.handshake().await?);
        }
        let conn = guard
            .as_mut()
            .ok_or_else(|| McpError::Transport(format!("no connection to {}", self.id)))?;

        let id = self.next_id();
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params
        });
        let outcome = match conn.send(&body).await {
            Ok(()) => match timeout(limit, conn.read_response(id)).await {
                Ok(result) => result,
                Err(_) => Err(McpError::TimedOut {
                    limit_ms: limit.as_millis() as u64,
                }),
            },
            Err(e) => Err(e),
        };
        match outcome {
            Ok(payload) => extract_result(payload, &self.id),
            Err(e) => {
                tracing::warn!(server = %self.id, method, error = %e, "mcp connection dropped");
                guard.take();
                Err(e)
            }
        }
    }

    pub async fn list_tools(&self) -> Result<Vec<RemoteTool>, McpError> {
        let result = self
            .request("tools/list", json!({}), self.request_timeout)
            .await?;
        let response: ToolListResponse = serde_json::from_value(result)
            .map_err(|e| McpError::Protocol(format!("invalid tools/list response: {e}")))?;
        Ok(response.tools)
    }

    /// 调用远程工具；`isError: true` 视为 RemoteError
    pub async fn call_tool(
        &self,
        name: &str,
        args: Value,
        limit: Option<Duration>,
    ) -> Result<Value, McpError> {
        let params = json!({ "name": name, "arguments": args });
        let result = self
            .request("tools/call", params, limit.unwrap_or(self.request_timeout))
            .await?;
        let response: ToolCallResponse = serde_json::from_value(result)
            .map_err(|e| McpError::Protocol(format!("invalid tools/call response: {e}")))?;
        if response.is_error {
            return Err(McpError::Remote(content_text(&response.content)));
        }
        if let Some(structured) = response.structured_content {
            return Ok(structured);
        }
        Ok(content_value(response.content))
    }
}

fn content_text(content: &[Value]) -> String {
    content
        .iter()
        .filter_map(|c| c.get("text").and_then(|t| t.as_str()))
        .collect::<Vec<_>>()
        .join("\n")
}

/// 单个 text 内容若是 JSON 则解析，否则原样返回字符串；多段内容保留数组
fn content_value(content: Vec<Value>) -> Value {
    if let [single] = content.as_slice() {
        if let Some(text) = single.get("text").and_then(|t| t.as_str()) {
            return serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()));
        }
    }
    Value::Array(content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matches_request_number_or_string() {
        assert!(matches_request(&json!({"id": 7}), 7));
        assert!(matches_request(&json!({"id": "7"}), 7));
        assert!(!matches_request(&json!({"method": "notifications/x"}), 7));
    }

    #[test]
    fn test_extract_result_and_error() {
        assert_eq!(
            extract_result(json!({"id": 1, "result": {"ok": true}}), "s").unwrap(),
            json!({"ok": true})
        );
        let err = extract_result(json!({"id": 1, "error": {"code": -32601, "message": "no"}}), "s")
            .unwrap_err();
        assert_eq!(err, McpError::Remote("s: no".to_string()));
    }

    #[test]
    fn test_content_value() {
        assert_eq!(
            content_value(vec![json!({"type": "text", "text": "{\"n\": 1}"})]),
            json!({"n": 1})
        );
        assert_eq!(
            content_value(vec![json!({"type": "text", "text": "plain"})]),
            json!("plain")
        );
    }

    #[test]
    fn test_endpoint_from_entry() {
        let mut entry = McpServerEntry {
            id: "s".to_string(),
            transport: "tcp".to_string(),
            address: Some("127.0.0.1:9".to_string()),
            ..McpServerEntry::default()
        };
        assert_eq!(
            McpEndpoint::from_entry(&entry).unwrap(),
            McpEndpoint::Tcp {
                address: "127.0.0.1:9".to_string()
            }
        );
        entry.transport = "stdio".to_string();
        assert!(matches!(
            McpEndpoint::from_entry(&entry),
            Err(McpError::Config(_))
        ));
    }
}
