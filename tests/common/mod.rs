//! 集成测试公共设施：脚本化 Planner、Supervisor 装配、本地 HTTP / MCP 假服务

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hive::config::AppConfig;
use hive::core::{checkpoint_key, RunId, RunStatus};
use hive::memory::{MemoryStore, SqliteMemoryStore};
use hive::react::{AgentKind, Decision, Observation, PlanningContext, Planner};
use hive::{Supervisor, SupervisorBuilder};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// 由闭包驱动的确定性 Planner：按上下文（通常是 ctx.step 与已有步骤）给出决策
pub struct FnPlanner<F>(pub F);

#[async_trait]
impl<F> Planner for FnPlanner<F>
where
    F: Fn(&PlanningContext<'_>) -> Decision + Send + Sync,
{
    async fn plan(&self, ctx: &PlanningContext<'_>) -> Result<Decision, String> {
        Ok((self.0)(ctx))
    }
}

pub fn planner<F>(f: F) -> Arc<dyn Planner>
where
    F: Fn(&PlanningContext<'_>) -> Decision + Send + Sync + 'static,
{
    Arc::new(FnPlanner(f))
}

/// 立即以任务本身作为结果结束
pub fn finishing_planner() -> Arc<dyn Planner> {
    planner(|ctx| Decision::finish(ctx.task.clone()))
}

pub async fn build(
    config: AppConfig,
    root: &Path,
    reasoning: Arc<dyn Planner>,
    coding: Arc<dyn Planner>,
) -> Supervisor {
    SupervisorBuilder::new(config)
        .with_storage_root(root)
        .with_planner(AgentKind::Reasoning, reasoning)
        .with_planner(AgentKind::Coding, coding)
        .build()
        .await
        .unwrap()
}

/// 等待运行结束（最多 30 秒）
pub async fn finished(supervisor: &Supervisor, run_id: &RunId) -> RunStatus {
    tokio::time::timeout(Duration::from_secs(30), supervisor.wait(run_id))
        .await
        .expect("run did not finish in time")
        .unwrap()
}

/// 打开项目记忆库，并等到该运行的终态检查点落盘
pub async fn settled_store(root: &Path, project: &str, run_id: &RunId) -> SqliteMemoryStore {
    let store = SqliteMemoryStore::open(root.join(project).join(".hive").join("memory.db")).unwrap();
    for _ in 0..250 {
        let terminal = store
            .read(&checkpoint_key(run_id))
            .unwrap()
            .and_then(|r| serde_json::from_value::<RunStatus>(r.value).ok())
            .is_some_and(|s| s.state.is_terminal());
        if terminal {
            return store;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("checkpoint for {run_id} never reached a terminal state");
}

/// 第 step 步第 call 个调用的观察结果
pub fn call_observation<'a>(ctx: &'a PlanningContext<'_>, step: usize, call: usize) -> &'a Observation {
    &ctx.steps[step].calls[call].observation
}

/// 轮询直到条件成立（最多 10 秒）
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached in time");
}

/// 对任何路径都返回同一个纯文本正文的最小 HTTP 服务
pub async fn serve_document(body: String) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let body = body.clone();
            tokio::spawn(async move {
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                }
                let head = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    body.len()
                );
                let _ = socket.write_all(head.as_bytes()).await;
                let _ = socket.write_all(body.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });
    addr
}

/// 取 JSON 对象字段，缺失时为 Null
pub fn field<'a>(value: &'a Value, key: &str) -> &'a Value {
    value.get(key).unwrap_or(&Value::Null)
}
