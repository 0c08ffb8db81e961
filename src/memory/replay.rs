//! 历史回放：由历史日志重建记忆快照与运行步骤
//!
//! 只有 Write 事件影响快照；按 seq 顺序应用，与存储最终状态逐键一致（含 revision）。

use std::collections::BTreeMap;

use serde_json::Value;

use crate::core::ids::RunId;
use crate::memory::store::{HistoryEvent, HistoryRecord, MemorySnapshot, Versioned};

/// 按 seq 顺序应用所有 Write 事件，得到快照
pub fn replay_snapshot(records: &[HistoryRecord]) -> MemorySnapshot {
    let mut ordered: Vec<&HistoryRecord> = records.iter().collect();
    ordered.sort_by_key(|r| r.seq);
    let mut map = BTreeMap::new();
    for record in ordered {
        if let HistoryEvent::Write {
            key,
            value,
            revision,
        } = &record.entry.event
        {
            map.insert(
                key.clone(),
                Versioned {
                    value: value.clone(),
                    revision: *revision,
                },
            );
        }
    }
    MemorySnapshot::new(map)
}

/// 取出某次运行持久化的步骤记录（JSON），按 seq 顺序
pub fn replay_steps(records: &[HistoryRecord], run: &RunId) -> Vec<Value> {
    let mut steps: Vec<(u64, Value)> = records
        .iter()
        .filter(|r| r.entry.run_id.as_ref() == Some(run))
        .filter_map(|r| match &r.entry.event {
            HistoryEvent::Step { step } => Some((r.seq, step.clone())),
            _ => None,
        })
        .collect();
    steps.sort_by_key(|(seq, _)| *seq);
    steps.into_iter().map(|(_, s)| s).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::store::{HistoryEntry, InMemoryStore, MemoryStore};
    use serde_json::json;

    #[test]
    fn test_replay_matches_store_snapshot() {
        let store = InMemoryStore::new();
        let run = RunId::new();
        store.write("a", json!(1), None, Some(run)).unwrap();
        store.write("b", json!({"x": 1}), None, None).unwrap();
        store.write("a", json!(3), Some(1), Some(run)).unwrap();
        let _ = store.write("a", json!(9), Some(1), Some(run));
        store
            .append_history(HistoryEntry::new(
                Some(run),
                HistoryEvent::Step {
                    step: json!({"index": 0}),
                },
            ))
            .unwrap();

        let history = store.history(None).unwrap();
        assert_eq!(replay_snapshot(&history), store.snapshot().unwrap());
        assert_eq!(replay_steps(&history, &run), vec![json!({"index": 0})]);
    }
}
