//! 运行工作记忆：当前快照与步骤历史
//!
//! 快照只通过观察结果折叠改变；每个步骤记录上下文快照摘要、发出的调用、显式写入与委派。

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::ids::{CallId, RunId};
use crate::core::ObservationError;
use crate::memory::{MemorySnapshot, Versioned};
use crate::react::AgentKind;

/// 一次调用或写入的结果，恰好交付一次
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Observation {
    Ok { value: Value },
    Failed { error: ObservationError },
}

impl Observation {
    pub fn ok(value: Value) -> Self {
        Observation::Ok { value }
    }

    pub fn failed(error: ObservationError) -> Self {
        Observation::Failed { error }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Observation::Ok { .. })
    }

    pub fn value(&self) -> Option<&Value> {
        match self {
            Observation::Ok { value } => Some(value),
            Observation::Failed { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&ObservationError> {
        match self {
            Observation::Ok { .. } => None,
            Observation::Failed { error } => Some(error),
        }
    }
}

impl From<Result<Value, ObservationError>> for Observation {
    fn from(r: Result<Value, ObservationError>) -> Self {
        match r {
            Ok(value) => Observation::ok(value),
            Err(error) => Observation::failed(error),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRecord {
    pub call_id: CallId,
    pub label: Option<String>,
    pub tool: String,
    pub args: Value,
    pub store_as: Option<String>,
    /// store_as 写入后的 revision
    pub stored_revision: Option<u64>,
    pub observation: Observation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryWriteRecord {
    pub key: String,
    pub expected_revision: Option<u64>,
    pub observation: Observation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelegationRecord {
    pub target: AgentKind,
    pub child_run: Option<RunId>,
    pub task: Value,
    pub observation: Observation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub index: usize,
    /// 规划时所见快照的摘要
    pub snapshot_digest: String,
    pub started_at_ms: i64,
    pub finished_at_ms: i64,
    #[serde(default)]
    pub calls: Vec<CallRecord>,
    #[serde(default)]
    pub memory_writes: Vec<MemoryWriteRecord>,
    #[serde(default)]
    pub delegation: Option<DelegationRecord>,
}

impl StepRecord {
    pub fn new(index: usize, snapshot: &MemorySnapshot) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            index,
            snapshot_digest: snapshot.digest(),
            started_at_ms: now,
            finished_at_ms: now,
            calls: Vec::new(),
            memory_writes: Vec::new(),
            delegation: None,
        }
    }

    pub fn observations(&self) -> impl Iterator<Item = &Observation> {
        self.calls
            .iter()
            .map(|c| &c.observation)
            .chain(self.memory_writes.iter().map(|w| &w.observation))
            .chain(self.delegation.iter().map(|d| &d.observation))
    }

    pub fn failures(&self) -> usize {
        self.observations().filter(|o| !o.is_ok()).count()
    }
}

/// 一次运行的规划上下文
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    snapshot: MemorySnapshot,
    steps: Vec<StepRecord>,
}

impl RunContext {
    pub fn new(snapshot: MemorySnapshot) -> Self {
        Self {
            snapshot,
            steps: Vec::new(),
        }
    }

    pub fn snapshot(&self) -> &MemorySnapshot {
        &self.snapshot
    }

    pub fn steps(&self) -> &[StepRecord] {
        &self.steps
    }

    pub fn next_index(&self) -> usize {
        self.steps.len()
    }

    /// 把一次已提交的写入并入快照
    pub fn fold(&mut self, key: &str, value: Value, revision: u64) {
        self.snapshot = self.snapshot.with(key, Versioned { value, revision });
    }

    pub fn push_step(&mut self, step: StepRecord) {
        self.steps.push(step);
    }

    pub fn last_step(&self) -> Option<&StepRecord> {
        self.steps.last()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fold_changes_digest() {
        let mut ctx = RunContext::default();
        let before = ctx.snapshot().digest();
        ctx.fold("doc:1", json!({"text": "x"}), 1);
        assert_ne!(ctx.snapshot().digest(), before);
        assert_eq!(ctx.snapshot().read("doc:1"), Some(&json!({"text": "x"})));
        assert_eq!(ctx.snapshot().revision("doc:1"), 1);
    }

    #[test]
    fn test_observation_wire_shape() {
        let failed = Observation::failed(ObservationError::TimedOut { limit_ms: 2000 });
        let v = serde_json::to_value(&failed).unwrap();
        assert_eq!(v["result"], "failed");
        assert_eq!(v["error"]["status"], "TimedOut");
        assert_eq!(v["error"]["limit_ms"], 2000);
        let back: Observation = serde_json::from_value(v).unwrap();
        assert_eq!(back, failed);
    }

    #[test]
    fn test_step_failures_counted() {
        let mut step = StepRecord::new(0, &MemorySnapshot::default());
        step.memory_writes.push(MemoryWriteRecord {
            key: "k".into(),
            expected_revision: Some(3),
            observation: Observation::failed(ObservationError::ConflictError {
                key: "k".into(),
                expected: 3,
                actual: 4,
            }),
        });
        step.delegation = Some(DelegationRecord {
            target: AgentKind::Coding,
            child_run: None,
            task: json!({}),
            observation: Observation::ok(json!(1)),
        });
        assert_eq!(step.failures(), 1);
        assert_eq!(step.observations().count(), 2);
    }
}
