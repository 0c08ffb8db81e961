//! 运行状态机与状态面板
//!
//! RunState 只允许合法迁移，终态之后的任何修改都是 TerminalRunMutation。
//! StatusBoard 为每个运行保存最新的 RunStatus（watch 通道，驱动任务是唯一写者），
//! 同时保存活跃运行的停止信号，供 cancel 向下级联。
//! 已结束的运行只保留最近 retention 条，更早的由检查点回答。

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Mutex, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;

use crate::core::ids::RunId;
use crate::core::stop::StopSignal;
use crate::core::{ErrorKind, RunError};
use crate::react::AgentKind;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Planning,
    Acting,
    Observing,
    Delegating,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunState::Succeeded | RunState::Failed | RunState::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunState::Idle => "idle",
            RunState::Planning => "planning",
            RunState::Acting => "acting",
            RunState::Observing => "observing",
            RunState::Delegating => "delegating",
            RunState::Succeeded => "succeeded",
            RunState::Failed => "failed",
            RunState::Cancelled => "cancelled",
        }
    }

    /// 任何非终态都可以进入 Failed / Cancelled
    pub fn can_transition(self, next: RunState) -> bool {
        use RunState::*;
        if self.is_terminal() {
            return false;
        }
        if matches!(next, Failed | Cancelled) {
            return true;
        }
        matches!(
            (self, next),
            (Idle, Planning)
                | (Planning, Acting)
                | (Planning, Delegating)
                | (Planning, Succeeded)
                | (Acting, Observing)
                | (Delegating, Observing)
                | (Observing, Planning)
        )
    }

    pub fn transition(&mut self, next: RunState) -> Result<(), RunError> {
        if self.is_terminal() {
            return Err(RunError::TerminalRunMutation {
                state: self.as_str().to_string(),
            });
        }
        if !self.can_transition(next) {
            return Err(RunError::InvalidTransition {
                from: self.as_str().to_string(),
                to: next.as_str().to_string(),
            });
        }
        *self = next;
        Ok(())
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 运行检查点在项目记忆中的键
pub fn checkpoint_key(run_id: &RunId) -> String {
    format!("run/{run_id}/checkpoint")
}

/// 使运行失败的第一个不可恢复错误，附带发生的步骤序号
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunFailure {
    pub kind: ErrorKind,
    pub message: String,
    pub step: Option<usize>,
}

impl RunFailure {
    pub fn from_error(err: &RunError, step: Option<usize>) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
            step,
        }
    }
}

/// status 查询的结果；也是每步检查点的内容
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStatus {
    pub run_id: RunId,
    pub parent: Option<RunId>,
    pub project: String,
    pub agent: AgentKind,
    pub depth: usize,
    pub state: RunState,
    /// 已完成的步骤数
    pub steps: usize,
    pub last_step: Option<usize>,
    pub last_observation: Option<Value>,
    pub error: Option<RunFailure>,
    pub result: Option<Value>,
    pub task: Value,
    pub updated_at_ms: i64,
}

impl RunStatus {
    pub fn new(
        run_id: RunId,
        parent: Option<RunId>,
        project: &str,
        agent: AgentKind,
        depth: usize,
        task: Value,
    ) -> Self {
        Self {
            run_id,
            parent,
            project: project.to_string(),
            agent,
            depth,
            state: RunState::Idle,
            steps: 0,
            last_step: None,
            last_observation: None,
            error: None,
            result: None,
            task,
            updated_at_ms: chrono::Utc::now().timestamp_millis(),
        }
    }
}

struct BoardEntry {
    status: watch::Sender<RunStatus>,
    stop: Option<StopSignal>,
}

const DEFAULT_RETENTION: usize = 256;

/// 所有运行（含子运行）的最新状态
pub struct StatusBoard {
    entries: RwLock<HashMap<RunId, BoardEntry>>,
    /// 已结束运行，按结束先后
    finished: Mutex<VecDeque<RunId>>,
    retention: usize,
}

impl Default for StatusBoard {
    fn default() -> Self {
        Self::with_retention(DEFAULT_RETENTION)
    }
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retention(retention: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            finished: Mutex::new(VecDeque::new()),
            retention,
        }
    }

    pub fn register(&self, status: RunStatus, stop: StopSignal) {
        let run_id = status.run_id;
        let (tx, _) = watch::channel(status);
        self.entries
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(
                run_id,
                BoardEntry {
                    status: tx,
                    stop: Some(stop),
                },
            );
    }

    /// 由驱动任务调用，返回更新后的状态；终态后释放停止信号，并淘汰超出保留数的旧终态条目
    pub fn update(&self, run_id: &RunId, f: impl FnOnce(&mut RunStatus)) -> Option<RunStatus> {
        let mut entries = self.entries.write().unwrap_or_else(|p| p.into_inner());
        let entry = entries.get_mut(run_id)?;
        entry.status.send_modify(|status| {
            f(status);
            status.updated_at_ms = chrono::Utc::now().timestamp_millis();
        });
        let updated = entry.status.borrow().clone();
        let newly_finished = updated.state.is_terminal() && entry.stop.take().is_some();
        if !newly_finished {
            return Some(updated);
        }

        let mut finished = self.finished.lock().unwrap_or_else(|p| p.into_inner());
        finished.push_back(*run_id);
        while finished.len() > self.retention {
            if let Some(evicted) = finished.pop_front() {
                entries.remove(&evicted);
            }
        }
        Some(updated)
    }

    pub fn get(&self, run_id: &RunId) -> Option<RunStatus> {
        self.entries
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(run_id)
            .map(|e| e.status.borrow().clone())
    }

    pub fn subscribe(&self, run_id: &RunId) -> Option<watch::Receiver<RunStatus>> {
        self.entries
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(run_id)
            .map(|e| e.status.subscribe())
    }

    pub fn stop_signal(&self, run_id: &RunId) -> Option<StopSignal> {
        self.entries
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(run_id)
            .and_then(|e| e.stop.clone())
    }

    /// 所有未结束的顶层运行
    pub fn live_top_level(&self) -> Vec<RunId> {
        self.entries
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .filter(|(_, e)| {
                let s = e.status.borrow();
                s.parent.is_none() && !s.state.is_terminal()
            })
            .map(|(id, _)| *id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_legal_path() {
        let mut s = RunState::Idle;
        for next in [
            RunState::Planning,
            RunState::Acting,
            RunState::Observing,
            RunState::Planning,
            RunState::Delegating,
            RunState::Observing,
            RunState::Planning,
            RunState::Succeeded,
        ] {
            s.transition(next).unwrap();
        }
        assert!(s.is_terminal());
    }

    #[test]
    fn test_terminal_is_final() {
        let mut s = RunState::Cancelled;
        let err = s.transition(RunState::Planning).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TerminalRunMutation);
        assert!(s.transition(RunState::Failed).is_err());
        assert_eq!(s, RunState::Cancelled);
    }

    #[test]
    fn test_illegal_transition() {
        let mut s = RunState::Idle;
        assert!(matches!(
            s.transition(RunState::Acting),
            Err(RunError::InvalidTransition { .. })
        ));
        assert_eq!(s, RunState::Idle);
        assert!(s.transition(RunState::Cancelled).is_ok());
    }

    #[tokio::test]
    async fn test_board_update_and_subscribe() {
        let board = StatusBoard::new();
        let run = RunId::new();
        board.register(
            RunStatus::new(run, None, "p", AgentKind::Reasoning, 0, Value::Null),
            StopSignal::new(),
        );
        let mut rx = board.subscribe(&run).unwrap();
        assert_eq!(board.live_top_level(), vec![run]);
        board.update(&run, |s| s.state = RunState::Succeeded);
        let done = rx.wait_for(|s| s.state.is_terminal()).await.unwrap().clone();
        assert_eq!(done.state, RunState::Succeeded);
        assert!(board.stop_signal(&run).is_none());
        assert!(board.live_top_level().is_empty());
    }

    #[test]
    fn test_oldest_finished_runs_are_evicted() {
        let board = StatusBoard::with_retention(2);
        let runs: Vec<RunId> = (0..3).map(|_| RunId::new()).collect();
        for run in &runs {
            board.register(
                RunStatus::new(*run, None, "p", AgentKind::Coding, 0, json!("x".repeat(10_000))),
                StopSignal::new(),
            );
        }
        let live = RunId::new();
        board.register(
            RunStatus::new(live, None, "p", AgentKind::Coding, 0, Value::Null),
            StopSignal::new(),
        );

        for run in &runs {
            let closed = board.update(run, |s| s.state = RunState::Cancelled).unwrap();
            assert_eq!(closed.state, RunState::Cancelled);
            // 重复的终态更新不会重复计数
            board.update(run, |_| {});
        }
        assert!(board.get(&runs[0]).is_none());
        assert_eq!(board.get(&runs[1]).unwrap().state, RunState::Cancelled);
        assert_eq!(board.get(&runs[2]).unwrap().state, RunState::Cancelled);
        // 未结束的运行不受淘汰影响
        assert_eq!(board.live_top_level(), vec![live]);
        assert!(board.stop_signal(&live).is_some());
    }
}
