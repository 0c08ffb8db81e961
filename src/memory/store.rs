//! 项目记忆存储抽象
//!
//! 键 → 带版本的 JSON 值；每次写入同时追加到不可变历史日志（时间戳 + 运行 ID）。
//! 写入支持乐观并发：调用方可带 expected revision，不匹配时返回 Conflict。
//! 同步 trait；异步调用方通过 ProjectMemory（spawn_blocking）访问。

use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::ids::RunId;
use crate::core::MemoryError;

/// 带版本号的值；revision 从 1 开始，每次写入该键加 1
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Versioned {
    pub value: Value,
    pub revision: u64,
}

/// 历史日志中的事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HistoryEvent {
    /// 一次已提交的键写入
    Write {
        key: String,
        value: Value,
        revision: u64,
    },
    /// 一个已完成的运行步骤（StepRecord 的 JSON）
    Step { step: Value },
    /// 运行生命周期或其它审计记录
    Note { label: String, payload: Value },
}

/// 追加到历史日志的条目
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timestamp_ms: i64,
    pub run_id: Option<RunId>,
    pub event: HistoryEvent,
}

impl HistoryEntry {
    pub fn new(run_id: Option<RunId>, event: HistoryEvent) -> Self {
        Self {
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            run_id,
            event,
        }
    }
}

/// 已持久化的历史条目（seq 为全局追加序号）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub seq: u64,
    #[serde(flatten)]
    pub entry: HistoryEntry,
}

/// 所有当前键值的不可变视图
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemorySnapshot {
    records: Arc<BTreeMap<String, Versioned>>,
}

impl MemorySnapshot {
    pub fn new(records: BTreeMap<String, Versioned>) -> Self {
        Self {
            records: Arc::new(records),
        }
    }

    pub fn read(&self, key: &str) -> Option<&Value> {
        self.records.get(key).map(|v| &v.value)
    }

    pub fn get(&self, key: &str) -> Option<&Versioned> {
        self.records.get(key)
    }

    pub fn revision(&self, key: &str) -> u64 {
        self.records.get(key).map(|v| v.revision).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Versioned)> {
        self.records.iter()
    }

    pub fn with_prefix<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = (&'a String, &'a Versioned)> {
        self.records
            .range(prefix.to_string()..)
            .take_while(move |(k, _)| k.starts_with(prefix))
    }

    /// 返回加入/覆盖一个键后的新快照（不影响原快照）
    pub fn with(&self, key: impl Into<String>, value: Versioned) -> Self {
        let mut records = (*self.records).clone();
        records.insert(key.into(), value);
        Self::new(records)
    }

    /// 键与版本号的摘要，作为步骤的「上下文快照引用」
    pub fn digest(&self) -> String {
        let mut hasher = DefaultHasher::new();
        for (key, v) in self.records.iter() {
            key.hash(&mut hasher);
            v.revision.hash(&mut hasher);
        }
        format!("{:016x}", hasher.finish())
    }

    pub fn into_map(self) -> BTreeMap<String, Versioned> {
        Arc::try_unwrap(self.records).unwrap_or_else(|shared| (*shared).clone())
    }
}

/// 项目记忆存储接口
pub trait MemoryStore: Send + Sync {
    fn read(&self, key: &str) -> Result<Option<Versioned>, MemoryError>;

    /// 写入并返回新 revision；expected 为 Some(rev) 时要求当前 revision 等于 rev（0 表示键不存在）
    fn write(
        &self,
        key: &str,
        value: Value,
        expected: Option<u64>,
        origin: Option<RunId>,
    ) -> Result<u64, MemoryError>;

    /// 追加历史条目，返回其 seq
    fn append_history(&self, entry: HistoryEntry) -> Result<u64, MemoryError>;

    fn snapshot(&self) -> Result<MemorySnapshot, MemoryError>;

    /// 按 seq 升序返回历史；run 为 Some 时只返回该运行的条目
    fn history(&self, run: Option<&RunId>) -> Result<Vec<HistoryRecord>, MemoryError>;
}

/// 进程内存储（不持久化），用于测试与一次性会话
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: Mutex<InMemoryState>,
}

#[derive(Debug, Default)]
struct InMemoryState {
    records: BTreeMap<String, Versioned>,
    history: Vec<HistoryRecord>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, InMemoryState>, MemoryError> {
        self.state
            .lock()
            .map_err(|_| MemoryError::Persistence("memory store lock poisoned".to_string()))
    }
}

impl InMemoryState {
    fn push(&mut self, entry: HistoryEntry) -> u64 {
        let seq = self.history.len() as u64 + 1;
        self.history.push(HistoryRecord { seq, entry });
        seq
    }
}

impl MemoryStore for InMemoryStore {
    fn read(&self, key: &str) -> Result<Option<Versioned>, MemoryError> {
        Ok(self.lock()?.records.get(key).cloned())
    }

    fn write(
        &self,
        key: &str,
        value: Value,
        expected: Option<u64>,
        origin: Option<RunId>,
    ) -> Result<u64, MemoryError> {
        let mut state = self.lock()?;
        let actual = state.records.get(key).map(|v| v.revision).unwrap_or(0);
        if let Some(expected) = expected {
            if expected != actual {
                return Err(MemoryError::Conflict {
                    key: key.to_string(),
                    expected,
                    actual,
                });
            }
        }
        let revision = actual + 1;
        state.records.insert(
            key.to_string(),
            Versioned {
                value: value.clone(),
                revision,
            },
        );
        state.push(HistoryEntry::new(
            origin,
            HistoryEvent::Write {
                key: key.to_string(),
                value,
                revision,
            },
        ));
        Ok(revision)
    }

    fn append_history(&self, entry: HistoryEntry) -> Result<u64, MemoryError> {
        Ok(self.lock()?.push(entry))
    }

    fn snapshot(&self) -> Result<MemorySnapshot, MemoryError> {
        Ok(MemorySnapshot::new(self.lock()?.records.clone()))
    }

    fn history(&self, run: Option<&RunId>) -> Result<Vec<HistoryRecord>, MemoryError> {
        let state = self.lock()?;
        Ok(state
            .history
            .iter()
            .filter(|r| run.map_or(true, |id| r.entry.run_id.as_ref() == Some(id)))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_write_bumps_revision_and_logs_history() {
        let store = InMemoryStore::new();
        assert_eq!(store.write("a", json!(1), None, None).unwrap(), 1);
        assert_eq!(store.write("a", json!(2), None, None).unwrap(), 2);
        assert_eq!(store.read("a").unwrap().unwrap().value, json!(2));
        assert_eq!(store.history(None).unwrap().len(), 2);
    }

    #[test]
    fn test_stale_expected_revision_conflicts() {
        let store = InMemoryStore::new();
        store.write("k", json!("v1"), Some(0), None).unwrap();
        let err = store.write("k", json!("v2"), Some(0), None).unwrap_err();
        assert!(matches!(err, MemoryError::Conflict { actual: 1, .. }));
        assert_eq!(store.read("k").unwrap().unwrap().value, json!("v1"));
    }

    #[test]
    fn test_snapshot_prefix_and_digest() {
        let store = InMemoryStore::new();
        store.write("doc:1", json!("a"), None, None).unwrap();
        store.write("doc:2", json!("b"), None, None).unwrap();
        store.write("note", json!("c"), None, None).unwrap();
        let snap = store.snapshot().unwrap();
        assert_eq!(snap.with_prefix("doc:").count(), 2);

        let before = snap.digest();
        store.write("note", json!("d"), None, None).unwrap();
        assert_ne!(before, store.snapshot().unwrap().digest());
    }
}
