//! Orchestration Supervisor：运行的启动、取消、查询与等待
//!
//! 每个项目同一时间至多一个活跃的顶层运行（子运行不计，受委派深度约束）。
//! 每个顶层运行持有一个注册表租约，运行结束时由回收任务释放。
//! 项目首次打开时，崩溃遗留的非终态检查点被标记为 Failed(Interrupted)。

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;

use crate::core::ids::RunId;
use crate::core::state::{checkpoint_key, RunFailure, RunState, RunStatus};
use crate::core::stop::{StopReason, StopSignal};
use crate::core::{ErrorKind, MemoryError, RunError, SupervisorError};
use crate::memory::{HistoryEntry, HistoryEvent, Project, ProjectMemory};
use crate::react::{AgentKind, AgentRuntime, RunEvent, RunLimits, RunRequest};
use crate::tools::{RegistryLease, ToolInfo, ToolRegistry};

#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// 未 attach 的项目位于 `<storage_root>/<project_id>`
    pub storage_root: PathBuf,
    pub limits: RunLimits,
}

#[derive(Clone)]
struct OpenProject {
    project: Project,
    memory: ProjectMemory,
}

struct ActiveRun {
    run_id: RunId,
    _lease: RegistryLease,
}

struct SupervisorInner {
    runtime: AgentRuntime,
    registry: Arc<ToolRegistry>,
    options: SupervisorOptions,
    roots: Mutex<HashMap<String, PathBuf>>,
    projects: AsyncMutex<HashMap<String, OpenProject>>,
    active: Mutex<HashMap<String, ActiveRun>>,
}

#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<SupervisorInner>,
}

impl Supervisor {
    pub fn new(runtime: AgentRuntime, registry: Arc<ToolRegistry>, options: SupervisorOptions) -> Self {
        Self {
            inner: Arc::new(SupervisorInner {
                runtime,
                registry,
                options,
                roots: Mutex::new(HashMap::new()),
                projects: AsyncMutex::new(HashMap::new()),
                active: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn runtime(&self) -> &AgentRuntime {
        &self.inner.runtime
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<RunEvent> {
        self.inner.runtime.subscribe()
    }

    /// 注册表中的全部工具
    pub fn tools(&self) -> Vec<ToolInfo> {
        self.inner.registry.list(None)
    }

    /// 为项目指定根目录并立即打开
    pub async fn attach_project(&self, id: &str, root: impl Into<PathBuf>) -> Result<Project, SupervisorError> {
        if !Project::is_valid_id(id) {
            return Err(SupervisorError::UnknownProject(id.to_string()));
        }
        let root = root.into();
        {
            let projects = self.inner.projects.lock().await;
            if let Some(open) = projects.get(id) {
                if open.project.root != root {
                    tracing::warn!(project = %id, root = %open.project.root.display(), "project already open at another root");
                }
                return Ok(open.project.clone());
            }
        }
        self.inner
            .roots
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(id.to_string(), root);
        Ok(self.open(id).await?.project)
    }

    /// 启动顶层运行；被拒绝时不创建运行
    pub async fn start(
        &self,
        intent: Value,
        agent: Option<AgentKind>,
        project_id: &str,
    ) -> Result<RunId, SupervisorError> {
        let agent = agent.unwrap_or(AgentKind::Reasoning);
        let open = self.open(project_id).await?;

        let run_id = RunId::new();
        let handle = {
            let mut active = self.inner.active.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(current) = active.get(project_id) {
                let live = self
                    .inner
                    .runtime
                    .board()
                    .get(&current.run_id)
                    .is_some_and(|s| !s.state.is_terminal());
                if live {
                    return Err(SupervisorError::RunAlreadyActive {
                        project: project_id.to_string(),
                        run_id: current.run_id,
                    });
                }
            }
            let lease = self.inner.registry.lease();
            let request = RunRequest {
                run_id,
                parent: None,
                agent,
                depth: 0,
                task: intent,
                project: open.project.clone(),
                memory: open.memory.clone(),
            };
            let handle = self
                .inner
                .runtime
                .spawn(request, self.inner.options.limits, StopSignal::new());
            active.insert(
                project_id.to_string(),
                ActiveRun {
                    run_id,
                    _lease: lease,
                },
            );
            handle
        };
        tracing::info!(run = %run_id, project = %project_id, agent = %agent, "run accepted");

        let inner = self.inner.clone();
        let project = project_id.to_string();
        tokio::spawn(async move {
            let outcome = handle.await;
            let mut active = inner.active.lock().unwrap_or_else(|p| p.into_inner());
            if active.get(&project).is_some_and(|a| a.run_id == run_id) {
                active.remove(&project);
            }
            if let Err(e) = outcome {
                tracing::error!(run = %run_id, error = %e, "run driver task failed");
            }
        });
        Ok(run_id)
    }

    /// 取消运行（含子运行）；已结束的运行不受影响
    pub fn cancel(&self, run_id: &RunId) -> Result<(), SupervisorError> {
        let board = self.inner.runtime.board();
        if let Some(stop) = board.stop_signal(run_id) {
            tracing::info!(run = %run_id, "cancel requested");
            stop.stop(StopReason::User);
            return Ok(());
        }
        if board.get(run_id).is_some() {
            return Ok(());
        }
        Err(SupervisorError::UnknownRun(*run_id))
    }

    /// 最新状态；不在面板中的运行回退到已打开项目中的检查点
    pub async fn status(&self, run_id: &RunId) -> Result<RunStatus, SupervisorError> {
        if let Some(status) = self.inner.runtime.board().get(run_id) {
            return Ok(status);
        }
        let projects: Vec<OpenProject> = self.inner.projects.lock().await.values().cloned().collect();
        for open in projects {
            if let Some(record) = open.memory.read(&checkpoint_key(run_id)).await? {
                let status: RunStatus =
                    serde_json::from_value(record.value).map_err(MemoryError::from)?;
                return Ok(status);
            }
        }
        Err(SupervisorError::UnknownRun(*run_id))
    }

    /// 等待运行进入终态
    pub async fn wait(&self, run_id: &RunId) -> Result<RunStatus, SupervisorError> {
        let Some(mut rx) = self.inner.runtime.board().subscribe(run_id) else {
            return self.status(run_id).await;
        };
        let waited = rx.wait_for(|s| s.state.is_terminal()).await.map(|s| s.clone());
        let status = match waited {
            Ok(status) => status,
            Err(_) => rx.borrow().clone(),
        };
        Ok(status)
    }

    /// 停止所有活跃的顶层运行并等待其结束；返回超时仍未结束的运行
    pub async fn shutdown(&self, timeout: Duration) -> Vec<RunId> {
        let board = self.inner.runtime.board();
        let live = board.live_top_level();
        for run_id in &live {
            if let Some(stop) = board.stop_signal(run_id) {
                stop.stop(StopReason::Shutdown);
            }
        }
        let waits = live.iter().map(|run_id| self.wait(run_id));
        if tokio::time::timeout(timeout, futures_util::future::join_all(waits))
            .await
            .is_err()
        {
            tracing::warn!(timeout_ms = timeout.as_millis() as u64, "runs still active after shutdown timeout");
        }
        let remaining: Vec<RunId> = live
            .into_iter()
            .filter(|id| board.get(id).is_some_and(|s| !s.state.is_terminal()))
            .collect();
        tracing::info!(remaining = remaining.len(), "supervisor shut down");
        remaining
    }

    async fn open(&self, id: &str) -> Result<OpenProject, SupervisorError> {
        if !Project::is_valid_id(id) {
            return Err(SupervisorError::UnknownProject(id.to_string()));
        }
        let mut projects = self.inner.projects.lock().await;
        if let Some(open) = projects.get(id) {
            return Ok(open.clone());
        }
        let root = self
            .inner
            .roots
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(id)
            .cloned()
            .unwrap_or_else(|| self.inner.options.storage_root.join(id));

        let project_id = id.to_string();
        let (project, memory) = tokio::task::spawn_blocking(move || {
            let project = Project::open_or_create(&project_id, root)?;
            let memory = project.open_memory()?;
            Ok::<_, MemoryError>((project, memory))
        })
        .await
        .map_err(|e| MemoryError::Persistence(format!("project open task failed: {e}")))??;

        let interrupted = close_interrupted(&memory).await?;
        if interrupted > 0 {
            tracing::warn!(project = %id, runs = interrupted, "closed runs interrupted by a previous shutdown");
        }
        let open = OpenProject { project, memory };
        projects.insert(id.to_string(), open.clone());
        Ok(open)
    }
}

/// 把非终态检查点改写为 Failed(Interrupted)，返回处理的运行数
async fn close_interrupted(memory: &ProjectMemory) -> Result<usize, MemoryError> {
    let snapshot = memory.snapshot().await?;
    let mut closed = 0;
    for (key, record) in snapshot.with_prefix("run/") {
        if !key.ends_with("/checkpoint") {
            continue;
        }
        let Ok(mut status) = serde_json::from_value::<RunStatus>(record.value.clone()) else {
            continue;
        };
        if status.state.is_terminal() {
            continue;
        }
        status.state = RunState::Failed;
        status.error = Some(RunFailure {
            kind: ErrorKind::Interrupted,
            message: RunError::Interrupted.to_string(),
            step: status.last_step,
        });
        status.updated_at_ms = chrono::Utc::now().timestamp_millis();
        memory
            .write(key, serde_json::to_value(&status)?, Some(record.revision), None)
            .await?;
        memory
            .append_history(HistoryEntry::new(
                Some(status.run_id),
                HistoryEvent::Note {
                    label: "run_interrupted".to_string(),
                    payload: serde_json::json!({ "previous_step": status.last_step }),
                },
            ))
            .await?;
        closed += 1;
    }
    Ok(closed)
}
