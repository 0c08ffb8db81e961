//! 宿主命令通道：按行读取 JSON 命令，按行写出 JSON 回复
//!
//! 命令形如 `{"cmd":"start","intent":..,"agent":"reasoning","project":"p","id":1}`；
//! 可选的 `id` 原样带回，命令并发处理（wait 不阻塞后续命令）。
//! 成功回复 `{"ok":true,...}`，失败回复 `{"ok":false,"kind":..,"message":..}`。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::core::ids::RunId;
use crate::core::shutdown::{drain, ShutdownManager, ShutdownReason};
use crate::core::{Supervisor, SupervisorError};
use crate::react::AgentKind;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum HostCommand {
    Start {
        intent: Value,
        #[serde(default)]
        agent: Option<AgentKind>,
        project: String,
    },
    Cancel {
        run_id: RunId,
    },
    Status {
        run_id: RunId,
    },
    Wait {
        run_id: RunId,
    },
    Tools {
        #[serde(default)]
        capability: Option<String>,
    },
    Attach {
        project: String,
        root: PathBuf,
    },
    Shutdown,
}

/// 解析一行命令；失败时仍尽量带回 id
pub fn parse_command(line: &str) -> Result<(Option<Value>, HostCommand), (Option<Value>, String)> {
    let mut value: Value = serde_json::from_str(line).map_err(|e| (None, format!("invalid JSON: {e}")))?;
    let id = value.as_object_mut().and_then(|o| o.remove("id"));
    match serde_json::from_value(value) {
        Ok(command) => Ok((id, command)),
        Err(e) => Err((id, format!("invalid command: {e}"))),
    }
}

fn reply(id: Option<Value>, body: Map<String, Value>) -> String {
    let mut body = body;
    if let Some(id) = id {
        body.insert("id".to_string(), id);
    }
    Value::Object(body).to_string()
}

fn ok_line(id: Option<Value>, fields: Value) -> String {
    let mut body = Map::new();
    body.insert("ok".to_string(), Value::Bool(true));
    if let Value::Object(fields) = fields {
        body.extend(fields);
    }
    reply(id, body)
}

fn error_line(id: Option<Value>, kind: &str, message: String) -> String {
    let mut body = Map::new();
    body.insert("ok".to_string(), Value::Bool(false));
    body.insert("kind".to_string(), Value::String(kind.to_string()));
    body.insert("message".to_string(), Value::String(message));
    reply(id, body)
}

async fn handle(supervisor: &Supervisor, command: HostCommand) -> Result<Value, SupervisorError> {
    match command {
        HostCommand::Start {
            intent,
            agent,
            project,
        } => {
            let run_id = supervisor.start(intent, agent, &project).await?;
            Ok(json!({ "run_id": run_id }))
        }
        HostCommand::Cancel { run_id } => {
            supervisor.cancel(&run_id)?;
            Ok(json!({}))
        }
        HostCommand::Status { run_id } => Ok(json!({ "status": supervisor.status(&run_id).await? })),
        HostCommand::Wait { run_id } => Ok(json!({ "status": supervisor.wait(&run_id).await? })),
        HostCommand::Tools { capability } => {
            let tools: Vec<_> = supervisor
                .tools()
                .into_iter()
                .filter(|t| capability.as_ref().map_or(true, |c| t.capabilities.contains(c)))
                .collect();
            Ok(json!({ "tools": tools }))
        }
        HostCommand::Attach { project, root } => {
            let project = supervisor.attach_project(&project, root).await?;
            Ok(json!({ "project": project }))
        }
        HostCommand::Shutdown => Ok(json!({})),
    }
}

/// 服务直到 EOF、shutdown 命令或关闭信号；退出前停止全部运行
pub async fn serve<R, W>(
    reader: R,
    writer: W,
    supervisor: Supervisor,
    shutdown: Arc<ShutdownManager>,
    drain_timeout: Duration,
) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let writer_task = tokio::spawn(async move {
        let mut writer = writer;
        while let Some(line) = rx.recv().await {
            writer.write_all(line.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await?;
        }
        Ok::<_, std::io::Error>(())
    });

    let mut lines = reader.lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("reading host command")?,
            _ = shutdown.wait_for_shutdown() => break,
        };
        let Some(line) = line else {
            tracing::info!("host channel closed");
            shutdown.shutdown(ShutdownReason::HostRequest);
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let (id, command) = match parse_command(line) {
            Ok(parsed) => parsed,
            Err((id, message)) => {
                let _ = tx.send(error_line(id, "InvalidCommand", message));
                continue;
            }
        };
        tracing::debug!(command = ?command, "host command");

        if command == HostCommand::Shutdown {
            let remaining = drain(&supervisor, drain_timeout).await;
            let _ = tx.send(ok_line(id, json!({ "remaining": remaining })));
            shutdown.shutdown(ShutdownReason::HostRequest);
            break;
        }

        let supervisor = supervisor.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let line = match handle(&supervisor, command).await {
                Ok(fields) => ok_line(id, fields),
                Err(e) => error_line(id, e.kind().as_str(), e.to_string()),
            };
            let _ = tx.send(line);
        });
    }

    drain(&supervisor, drain_timeout).await;
    drop(tx);
    match tokio::time::timeout(drain_timeout, writer_task).await {
        Ok(joined) => joined.context("host writer task")?.context("writing host reply")?,
        Err(_) => tracing::warn!("pending host replies dropped at exit"),
    }
    Ok(())
}
