//! 运行过程事件：广播给需要流式展示的宿主（无订阅者时直接丢弃）

use serde::Serialize;

use crate::core::ids::{CallId, RunId};
use crate::core::state::RunState;
use crate::core::ErrorKind;
use crate::react::AgentKind;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    StateChanged {
        run_id: RunId,
        from: RunState,
        to: RunState,
    },
    /// 调用已发出
    ToolCall {
        run_id: RunId,
        call_id: CallId,
        tool: String,
    },
    /// 调用结果（失败时带错误种类）
    Observation {
        run_id: RunId,
        call_id: CallId,
        ok: bool,
        kind: Option<ErrorKind>,
    },
    Delegated {
        run_id: RunId,
        child_run: RunId,
        target: AgentKind,
    },
    Finished {
        run_id: RunId,
        state: RunState,
    },
}

impl RunEvent {
    pub fn run_id(&self) -> RunId {
        match self {
            RunEvent::StateChanged { run_id, .. }
            | RunEvent::ToolCall { run_id, .. }
            | RunEvent::Observation { run_id, .. }
            | RunEvent::Delegated { run_id, .. }
            | RunEvent::Finished { run_id, .. } => *run_id,
        }
    }
}
