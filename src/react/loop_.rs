//! Agent Runtime 主循环
//!
//! Idle → Planning → (Acting | Delegating) → Observing → Planning … → Succeeded | Failed | Cancelled。
//! 每个运行由一个 tokio 任务驱动（状态面板的唯一写者）；委派时子运行在自己的任务上执行，父运行 await 其结束。
//! 停止信号记录原因：预算耗尽 → Failed(RunBudgetExceeded)，其余 → Cancelled。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::{FutureExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::core::ids::{CallId, RunId};
use crate::core::state::{checkpoint_key, RunFailure, RunState, RunStatus, StatusBoard};
use crate::core::stop::{StopReason, StopSignal};
use crate::core::task_scheduler::plan_waves;
use crate::core::{ErrorKind, MemoryError, ObservationError, RecoveryAction, RecoveryEngine, RunError};
use crate::memory::{HistoryEntry, HistoryEvent, MemorySnapshot, Project, ProjectMemory};
use crate::react::events::RunEvent;
use crate::react::memory::{
    CallRecord, DelegationRecord, MemoryWriteRecord, Observation, RunContext, StepRecord,
};
use crate::react::planner::{Decision, MemoryWriteRequest, PlanningContext, ToolCallRequest};
use crate::react::profile::{AgentKind, AgentProfile};
use crate::tools::{ToolCall, ToolContext, ToolDispatcher, ToolInfo};

/// 启动一个运行所需的全部输入
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub run_id: RunId,
    pub parent: Option<RunId>,
    pub agent: AgentKind,
    pub depth: usize,
    pub task: Value,
    pub project: Project,
    pub memory: ProjectMemory,
}

/// Supervisor 下发的运行策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunLimits {
    pub max_turns: usize,
    /// 墙钟预算；None 表示不限
    pub budget: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    Succeeded { result: Value },
    Failed { error: RunFailure },
    Cancelled,
}

impl RunOutcome {
    pub fn state(&self) -> RunState {
        match self {
            RunOutcome::Succeeded { .. } => RunState::Succeeded,
            RunOutcome::Failed { .. } => RunState::Failed,
            RunOutcome::Cancelled => RunState::Cancelled,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    pub max_inflight_calls: usize,
    pub max_delegation_depth: usize,
    pub event_capacity: usize,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            max_inflight_calls: 4,
            max_delegation_depth: 3,
            event_capacity: 256,
        }
    }
}

struct RuntimeInner {
    dispatcher: Arc<ToolDispatcher>,
    profiles: HashMap<AgentKind, AgentProfile>,
    board: Arc<StatusBoard>,
    events: broadcast::Sender<RunEvent>,
    recovery: RecoveryEngine,
    options: RuntimeOptions,
}

#[derive(Clone)]
pub struct AgentRuntime {
    inner: Arc<RuntimeInner>,
}

impl AgentRuntime {
    pub fn new(
        dispatcher: Arc<ToolDispatcher>,
        profiles: Vec<AgentProfile>,
        board: Arc<StatusBoard>,
        recovery: RecoveryEngine,
        options: RuntimeOptions,
    ) -> Self {
        let (events, _) = broadcast::channel(options.event_capacity.max(1));
        Self {
            inner: Arc::new(RuntimeInner {
                dispatcher,
                profiles: profiles.into_iter().map(|p| (p.kind, p)).collect(),
                board,
                events,
                recovery,
                options,
            }),
        }
    }

    pub fn board(&self) -> &Arc<StatusBoard> {
        &self.inner.board
    }

    pub fn dispatcher(&self) -> &Arc<ToolDispatcher> {
        &self.inner.dispatcher
    }

    pub fn profile(&self, kind: AgentKind) -> Option<&AgentProfile> {
        self.inner.profiles.get(&kind)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.inner.events.subscribe()
    }

    /// 注册到状态面板后在新任务上驱动运行；返回的句柄在运行进入终态时完成
    pub fn spawn(&self, request: RunRequest, limits: RunLimits, stop: StopSignal) -> JoinHandle<RunOutcome> {
        let deadline = limits.budget.map(|b| Instant::now() + b);
        self.spawn_with_deadline(request, limits, deadline, stop)
    }

    fn spawn_with_deadline(
        &self,
        request: RunRequest,
        limits: RunLimits,
        deadline: Option<Instant>,
        stop: StopSignal,
    ) -> JoinHandle<RunOutcome> {
        self.inner.board.register(
            RunStatus::new(
                request.run_id,
                request.parent,
                &request.project.id,
                request.agent,
                request.depth,
                request.task.clone(),
            ),
            stop.clone(),
        );

        let done = CancellationToken::new();
        if let Some(deadline) = deadline {
            let timer = stop.clone();
            let done = done.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => timer.stop(StopReason::Budget),
                    _ = timer.stopped() => {}
                    _ = done.cancelled() => {}
                }
            });
        }

        let driver = RunDriver {
            runtime: self.clone(),
            req: request,
            limits,
            deadline,
            stop,
            state: RunState::Idle,
            ctx: RunContext::default(),
            turns: 0,
            step: 0,
            latest: None,
        };
        tokio::spawn(async move {
            let _done = done.drop_guard();
            driver.drive().await
        })
    }

    fn visible_tools(&self, profile: &AgentProfile) -> Vec<ToolInfo> {
        self.inner
            .dispatcher
            .registry()
            .list(None)
            .into_iter()
            .filter(|t| match &profile.capabilities {
                Some(allowed) => t.capabilities.iter().all(|c| allowed.contains(c)),
                None => true,
            })
            .collect()
    }

    fn emit(&self, event: RunEvent) {
        let _ = self.inner.events.send(event);
    }
}

/// 结束主循环的原因
enum Halt {
    Stopped,
    Failed(RunError),
}

impl From<RunError> for Halt {
    fn from(e: RunError) -> Self {
        Halt::Failed(e)
    }
}

impl From<MemoryError> for Halt {
    fn from(e: MemoryError) -> Self {
        Halt::Failed(e.into())
    }
}

/// 单个运行的驱动状态
struct RunDriver {
    runtime: AgentRuntime,
    req: RunRequest,
    limits: RunLimits,
    deadline: Option<Instant>,
    stop: StopSignal,
    state: RunState,
    ctx: RunContext,
    turns: usize,
    /// 当前（或将要执行的）步骤序号
    step: usize,
    /// 最近一次写入面板的状态；面板条目被淘汰后检查点仍以它为准
    latest: Option<RunStatus>,
}

impl RunDriver {
    /// 装箱：委派经由 spawn 递归回到这里
    fn drive(mut self) -> BoxFuture<'static, RunOutcome> {
        async move {
            tracing::info!(
                run = %self.req.run_id,
                agent = %self.req.agent,
                depth = self.req.depth,
                parent = ?self.req.parent.map(|p| p.to_string()),
                "run started"
            );
            match self.execute().await {
                Ok(result) => self.succeed(result).await,
                Err(Halt::Stopped) => self.stopped().await,
                Err(Halt::Failed(err)) => self.fail(err).await,
            }
        }
        .boxed()
    }

    async fn execute(&mut self) -> Result<Value, Halt> {
        let profile = self
            .runtime
            .profile(self.req.agent)
            .cloned()
            .ok_or_else(|| RunError::Planner(format!("no profile for agent '{}'", self.req.agent)))?;

        let snapshot = if self.req.parent.is_none() {
            self.req.memory.snapshot().await?
        } else {
            MemorySnapshot::default()
        };
        self.ctx = RunContext::new(snapshot);
        self.transition(RunState::Planning)?;
        self.checkpoint().await?;

        loop {
            self.step = self.ctx.next_index();
            if self.stop.is_stopped() {
                return Err(Halt::Stopped);
            }
            if self.turns >= self.limits.max_turns {
                return Err(RunError::TurnLimitExceeded {
                    limit: self.limits.max_turns,
                }
                .into());
            }
            self.turns += 1;

            let decision = self.plan(&profile).await?;
            let mut step = StepRecord::new(self.step, self.ctx.snapshot());
            match decision {
                Decision::Finish { result } => return Ok(result),
                Decision::GiveUp { reason } => return Err(RunError::GaveUp(reason).into()),
                Decision::Act {
                    calls,
                    memory_writes,
                } => {
                    self.transition(RunState::Acting)?;
                    step.calls = self.act(&profile, calls).await;
                    self.transition(RunState::Observing)?;
                    self.observe(&mut step, memory_writes).await?;
                }
                Decision::Delegate { target, task } => {
                    self.transition(RunState::Delegating)?;
                    step.delegation = Some(self.delegate(target, task).await);
                    self.transition(RunState::Observing)?;
                }
            }
            self.record_step(step).await?;
            self.transition(RunState::Planning)?;
        }
    }

    async fn plan(&self, profile: &AgentProfile) -> Result<Decision, Halt> {
        let tools = self.runtime.visible_tools(profile);
        let ctx = PlanningContext {
            run_id: self.req.run_id,
            parent: self.req.parent,
            agent: self.req.agent,
            depth: self.req.depth,
            step: self.step,
            task: &self.req.task,
            snapshot: self.ctx.snapshot(),
            steps: self.ctx.steps(),
            tools: &tools,
        };
        tokio::select! {
            decision = profile.planner.plan(&ctx) => {
                decision.map_err(|e| Halt::Failed(RunError::Planner(e)))
            }
            _ = self.stop.stopped() => Err(Halt::Stopped),
        }
    }

    /// 按依赖分波执行；波内并发，受 max_inflight_calls 限制
    async fn act(&self, profile: &AgentProfile, calls: Vec<ToolCallRequest>) -> Vec<CallRecord> {
        let labels: Vec<Option<String>> = calls.iter().map(|c| c.label.clone()).collect();
        let deps: Vec<Vec<String>> = calls.iter().map(|c| c.depends_on.clone()).collect();
        let plan = plan_waves(&labels, &deps);

        let mut results: Vec<Option<Observation>> = vec![None; calls.len()];
        for (i, reason) in plan.rejected {
            results[i] = Some(Observation::failed(ObservationError::InvalidPlan { reason }));
        }
        let by_label: HashMap<&str, usize> = labels
            .iter()
            .enumerate()
            .filter_map(|(i, l)| l.as_deref().map(|l| (l, i)))
            .collect();

        let inflight = self.runtime.inner.options.max_inflight_calls.max(1);
        for wave in &plan.waves {
            let mut ready = Vec::with_capacity(wave.len());
            for &i in wave {
                let failed_dep = calls[i].depends_on.iter().find(|dep| {
                    by_label
                        .get(dep.as_str())
                        .and_then(|&j| results[j].as_ref())
                        .map_or(true, |o| !o.is_ok())
                });
                match failed_dep {
                    Some(dep) => {
                        results[i] = Some(Observation::failed(ObservationError::DependencyFailed {
                            dependency: dep.clone(),
                        }))
                    }
                    None => ready.push(i),
                }
            }

            let done: Vec<(usize, Observation)> = futures_util::stream::iter(ready)
                .map(|i| {
                    let request = &calls[i];
                    async move { (i, self.invoke(profile, i, request).await) }
                })
                .buffer_unordered(inflight)
                .collect()
                .await;
            for (i, observation) in done {
                results[i] = Some(observation);
            }
        }

        calls
            .into_iter()
            .zip(results)
            .enumerate()
            .map(|(i, (call, result))| CallRecord {
                call_id: CallId::new(&self.req.run_id, self.step, i),
                label: call.label,
                tool: call.tool,
                args: call.args,
                store_as: call.store_as,
                stored_revision: None,
                observation: result.unwrap_or_else(|| {
                    Observation::failed(ObservationError::InvalidPlan {
                        reason: "call was not scheduled".to_string(),
                    })
                }),
            })
            .collect()
    }

    async fn invoke(&self, profile: &AgentProfile, index: usize, request: &ToolCallRequest) -> Observation {
        let run_id = self.req.run_id;
        let call = ToolCall {
            call_id: CallId::new(&run_id, self.step, index),
            tool: request.tool.clone(),
            args: request.args.clone(),
        };
        self.runtime.emit(RunEvent::ToolCall {
            run_id,
            call_id: call.call_id.clone(),
            tool: call.tool.clone(),
        });
        let ctx = ToolContext {
            run_id,
            call_id: call.call_id.clone(),
            memory: self.req.memory.clone(),
            scratch_dir: self.req.project.scratch_dir(&run_id),
            cancel: self.stop.token(),
        };
        let observation: Observation = self
            .runtime
            .inner
            .dispatcher
            .dispatch(&call, &ctx, profile.capabilities.as_deref())
            .await
            .into();
        self.runtime.emit(RunEvent::Observation {
            run_id,
            call_id: call.call_id,
            ok: observation.is_ok(),
            kind: observation.error().map(|e| e.kind()),
        });
        observation
    }

    /// 折叠结果：store_as 写穿到项目记忆，再执行显式写入；持久化失败终止运行
    async fn observe(&mut self, step: &mut StepRecord, writes: Vec<MemoryWriteRequest>) -> Result<(), Halt> {
        let origin = Some(self.req.run_id);

        for call in step.calls.iter() {
            if let Some(err) = call.observation.error() {
                if self.runtime.inner.recovery.for_observation(err, u32::MAX) == RecoveryAction::FailRun {
                    return Err(RunError::Persistence(err.to_string()).into());
                }
            }
        }

        for call in step.calls.iter_mut() {
            let (Some(key), Observation::Ok { value }) = (call.store_as.as_ref(), &call.observation) else {
                continue;
            };
            let revision = self.req.memory.write(key, value.clone(), None, origin).await?;
            self.ctx.fold(key, value.clone(), revision);
            call.stored_revision = Some(revision);
        }

        for write in writes {
            let key = write.key.clone();
            let observation = match self
                .req
                .memory
                .write(&key, write.value.clone(), write.expected_revision, origin)
                .await
            {
                Ok(revision) => {
                    self.ctx.fold(&key, write.value, revision);
                    Observation::ok(json!({ "key": key, "revision": revision }))
                }
                Err(e @ MemoryError::Conflict { .. }) => Observation::failed(e.into()),
                Err(e) => return Err(e.into()),
            };
            step.memory_writes.push(MemoryWriteRecord {
                key: write.key,
                expected_revision: write.expected_revision,
                observation,
            });
        }
        Ok(())
    }

    async fn delegate(&self, target: AgentKind, task: Value) -> DelegationRecord {
        let limit = self.runtime.inner.options.max_delegation_depth;
        let depth = self.req.depth + 1;
        let mut record = DelegationRecord {
            target,
            child_run: None,
            task: task.clone(),
            observation: Observation::ok(Value::Null),
        };

        if target == self.req.agent || self.runtime.profile(target).is_none() {
            record.observation = Observation::failed(ObservationError::InvalidDelegationTarget {
                target: target.to_string(),
            });
            return record;
        }
        if depth > limit {
            tracing::warn!(run = %self.req.run_id, depth, limit, "delegation depth exceeded");
            record.observation =
                Observation::failed(ObservationError::DelegationDepthExceeded { depth, limit });
            return record;
        }

        let child_id = RunId::new();
        record.child_run = Some(child_id);
        let request = RunRequest {
            run_id: child_id,
            parent: Some(self.req.run_id),
            agent: target,
            depth,
            task,
            project: self.req.project.clone(),
            memory: self.req.memory.clone(),
        };
        let limits = RunLimits {
            max_turns: self.limits.max_turns,
            budget: self
                .deadline
                .map(|d| d.saturating_duration_since(Instant::now())),
        };
        self.runtime.emit(RunEvent::Delegated {
            run_id: self.req.run_id,
            child_run: child_id,
            target,
        });
        let handle = self
            .runtime
            .spawn_with_deadline(request, limits, self.deadline, self.stop.child());
        let outcome = handle.await.unwrap_or_else(|e| RunOutcome::Failed {
            error: RunFailure {
                kind: ErrorKind::HandlerFailed,
                message: format!("child run task failed: {e}"),
                step: None,
            },
        });

        record.observation = match outcome {
            RunOutcome::Succeeded { result } => Observation::ok(json!({
                "child_run": child_id,
                "agent": target,
                "result": result,
            })),
            RunOutcome::Failed { error } => Observation::failed(ObservationError::DelegationFailed {
                child_run: child_id.to_string(),
                kind: error.kind,
                message: error.message,
            }),
            RunOutcome::Cancelled => Observation::failed(ObservationError::Cancelled),
        };
        record
    }

    /// 追加 step 历史、更新状态面板并写检查点
    async fn record_step(&mut self, mut step: StepRecord) -> Result<(), Halt> {
        step.finished_at_ms = chrono::Utc::now().timestamp_millis();
        let value = serde_json::to_value(&step).map_err(MemoryError::from)?;
        self.req
            .memory
            .append_history(HistoryEntry::new(
                Some(self.req.run_id),
                HistoryEvent::Step { step: value.clone() },
            ))
            .await?;
        let index = step.index;
        self.ctx.push_step(step);
        self.latest = self.runtime.inner.board.update(&self.req.run_id, |s| {
            s.steps = index + 1;
            s.last_step = Some(index);
            s.last_observation = Some(value);
        });
        self.checkpoint().await
    }

    async fn checkpoint(&self) -> Result<(), Halt> {
        let Some(status) = self.latest.as_ref() else {
            return Ok(());
        };
        let value = serde_json::to_value(status).map_err(MemoryError::from)?;
        self.req
            .memory
            .write(&checkpoint_key(&self.req.run_id), value, None, Some(self.req.run_id))
            .await?;
        Ok(())
    }

    fn transition(&mut self, next: RunState) -> Result<(), RunError> {
        self.transition_with(next, |_| {})
    }

    /// 状态与附带字段在同一次面板更新中生效
    fn transition_with(&mut self, next: RunState, f: impl FnOnce(&mut RunStatus)) -> Result<(), RunError> {
        let from = self.state;
        self.state.transition(next)?;
        self.latest = self.runtime.inner.board.update(&self.req.run_id, |s| {
            f(s);
            s.state = next;
        });
        tracing::info!(run = %self.req.run_id, agent = %self.req.agent, %from, to = %next, "run transition");
        self.runtime.emit(RunEvent::StateChanged {
            run_id: self.req.run_id,
            from,
            to: next,
        });
        Ok(())
    }

    async fn succeed(mut self, result: Value) -> RunOutcome {
        let stored = result.clone();
        if let Err(err) = self.transition_with(RunState::Succeeded, |s| s.result = Some(stored)) {
            return self.fail(err).await;
        }
        self.finalize().await;
        RunOutcome::Succeeded { result }
    }

    async fn fail(mut self, err: RunError) -> RunOutcome {
        let failure = RunFailure::from_error(&err, Some(self.step));
        let recorded = failure.clone();
        if let Err(e) = self.transition_with(RunState::Failed, |s| s.error = Some(recorded)) {
            tracing::error!(run = %self.req.run_id, error = %e, "failed run could not be closed");
        }
        tracing::warn!(
            run = %self.req.run_id,
            kind = %failure.kind,
            step = self.step,
            message = %failure.message,
            "run failed"
        );
        self.finalize().await;
        RunOutcome::Failed { error: failure }
    }

    async fn stopped(mut self) -> RunOutcome {
        if self.stop.reason() == Some(StopReason::Budget) {
            let secs = self.limits.budget.map(|b| b.as_secs()).unwrap_or(0);
            return self.fail(RunError::BudgetExceeded { secs }).await;
        }
        if let Err(e) = self.transition(RunState::Cancelled) {
            tracing::error!(run = %self.req.run_id, error = %e, "cancelled run could not be closed");
        }
        self.finalize().await;
        RunOutcome::Cancelled
    }

    /// 终态检查点尽力写入；失败只记日志
    async fn finalize(&self) {
        if let Err(Halt::Failed(e)) = self.checkpoint().await {
            tracing::error!(run = %self.req.run_id, error = %e, "final checkpoint not persisted");
        }
        self.runtime.emit(RunEvent::Finished {
            run_id: self.req.run_id,
            state: self.state,
        });
        tracing::info!(run = %self.req.run_id, state = %self.state, steps = self.ctx.steps().len(), "run finished");
    }
}
