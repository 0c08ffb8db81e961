//! MCP 网关集成测试：TCP 假服务器，远程工具并入注册表，传输中断后重连重试

mod common;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use common::{build, call_observation, finished, finishing_planner, planner};
use hive::config::{AppConfig, McpServerEntry};
use hive::core::{ErrorKind, RunState};
use hive::react::{Decision, ToolCallRequest};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

/// 按行 JSON-RPC 的假 MCP 服务器；前 `drop_calls` 次 tools/call 直接断开连接
async fn fake_mcp_server(drop_calls: usize, calls: Arc<AtomicUsize>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((socket, _)) = listener.accept().await else {
                return;
            };
            let calls = calls.clone();
            tokio::spawn(async move {
                let (read, mut write) = socket.into_split();
                let mut lines = BufReader::new(read).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let request: Value = serde_json::from_str(&line).unwrap();
                    let Some(id) = request.get("id").cloned() else {
                        continue;
                    };
                    let result = match request["method"].as_str() {
                        Some("initialize") => json!({
                            "protocolVersion": "2024-11-05",
                            "capabilities": { "tools": {} },
                            "serverInfo": { "name": "fake", "version": "0.0.1" }
                        }),
                        Some("tools/list") => json!({
                            "tools": [{
                                "name": "lookup",
                                "description": "Look up a term",
                                "inputSchema": {
                                    "type": "object",
                                    "properties": { "q": { "type": "string" } },
                                    "required": ["q"]
                                }
                            }]
                        }),
                        Some("tools/call") => {
                            if calls.fetch_add(1, Ordering::SeqCst) < drop_calls {
                                return;
                            }
                            let q = request["params"]["arguments"]["q"].clone();
                            json!({
                                "content": [{ "type": "text", "text": json!({ "q": q, "hits": 3 }).to_string() }]
                            })
                        }
                        _ => json!({}),
                    };
                    let reply = json!({ "jsonrpc": "2.0", "id": id, "result": result });
                    let line = format!("{reply}\n");
                    if write.write_all(line.as_bytes()).await.is_err() {
                        return;
                    }
                }
            });
        }
    });
    addr
}

fn config_with_server(addr: SocketAddr) -> AppConfig {
    let mut config = AppConfig::default();
    config.mcp.retry_backoff_ms = 20;
    config.mcp.servers = vec![McpServerEntry {
        id: "search".to_string(),
        transport: "tcp".to_string(),
        address: Some(addr.to_string()),
        timeout_ms: 5_000,
        ..McpServerEntry::default()
    }];
    config
}

fn lookup_planner() -> Arc<dyn hive::react::Planner> {
    planner(|ctx| {
        if ctx.steps.is_empty() {
            return Decision::act(vec![
                ToolCallRequest::new("search.lookup", json!({ "q": "ferrite" })).store_as("hits"),
            ]);
        }
        Decision::finish(serde_json::to_value(call_observation(ctx, 0, 0)).unwrap())
    })
}

#[tokio::test]
async fn test_transport_error_is_retried_once() {
    let calls = Arc::new(AtomicUsize::new(0));
    let addr = fake_mcp_server(1, calls.clone()).await;
    let dir = tempfile::TempDir::new().unwrap();
    let supervisor = build(config_with_server(addr), dir.path(), lookup_planner(), finishing_planner()).await;

    let tool = supervisor
        .tools()
        .into_iter()
        .find(|t| t.name == "search.lookup")
        .unwrap();
    assert_eq!(tool.handler, "mcp");

    let run_id = supervisor.start(json!("look up"), None, "mcp").await.unwrap();
    let status = finished(&supervisor, &run_id).await;

    assert_eq!(status.state, RunState::Succeeded);
    let observation = status.result.unwrap();
    assert_eq!(observation["result"], "ok");
    assert_eq!(observation["value"], json!({ "q": "ferrite", "hits": 3 }));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_persistent_transport_failure_becomes_observation() {
    let calls = Arc::new(AtomicUsize::new(0));
    let addr = fake_mcp_server(usize::MAX, calls.clone()).await;
    let dir = tempfile::TempDir::new().unwrap();
    let supervisor = build(config_with_server(addr), dir.path(), lookup_planner(), finishing_planner()).await;

    let run_id = supervisor.start(json!("look up"), None, "mcp").await.unwrap();
    let status = finished(&supervisor, &run_id).await;

    assert_eq!(status.state, RunState::Succeeded);
    let observation = status.result.unwrap();
    assert_eq!(observation["result"], "failed");
    assert_eq!(observation["error"]["status"], json!(ErrorKind::TransportError));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}
