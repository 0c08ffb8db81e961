//! SQLite 记忆存储
//!
//! WAL + synchronous=FULL：事务提交返回即已落盘；键写入与其历史条目在同一事务内提交，
//! 任何一步失败都回滚，旧值保持不变。

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

use crate::core::ids::RunId;
use crate::core::MemoryError;
use crate::memory::store::{
    HistoryEntry, HistoryEvent, HistoryRecord, MemorySnapshot, MemoryStore, Versioned,
};

const SCHEMA: &str = "
PRAGMA synchronous = FULL;
CREATE TABLE IF NOT EXISTS records (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    revision INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS history (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    ts INTEGER NOT NULL,
    run_id TEXT,
    event TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS history_run ON history(run_id);
";

/// 单文件 SQLite 存储；rusqlite::Connection 非 Sync，用 Mutex 串行化访问
pub struct SqliteMemoryStore {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl std::fmt::Debug for SqliteMemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteMemoryStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl SqliteMemoryStore {
    /// 打开（或创建）数据库文件；父目录不存在时自动创建
    pub fn open(path: impl AsRef<Path>) -> Result<Self, MemoryError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&path)?;
        let mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        tracing::debug!(path = %path.display(), journal = %mode, "memory store opened");
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, MemoryError> {
        self.conn
            .lock()
            .map_err(|_| MemoryError::Persistence("sqlite connection lock poisoned".to_string()))
    }
}

fn insert_history(conn: &Connection, entry: &HistoryEntry) -> Result<u64, MemoryError> {
    let event = serde_json::to_string(&entry.event)?;
    conn.execute(
        "INSERT INTO history (ts, run_id, event) VALUES (?1, ?2, ?3)",
        params![
            entry.timestamp_ms,
            entry.run_id.map(|id| id.to_string()),
            event
        ],
    )?;
    Ok(conn.last_insert_rowid() as u64)
}

impl MemoryStore for SqliteMemoryStore {
    fn read(&self, key: &str) -> Result<Option<Versioned>, MemoryError> {
        let conn = self.conn()?;
        let row: Option<(String, i64)> = conn
            .query_row(
                "SELECT value, revision FROM records WHERE key = ?1",
                params![key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        row.map(|(value, revision)| {
            Ok(Versioned {
                value: serde_json::from_str(&value)?,
                revision: revision as u64,
            })
        })
        .transpose()
    }

    fn write(
        &self,
        key: &str,
        value: Value,
        expected: Option<u64>,
        origin: Option<RunId>,
    ) -> Result<u64, MemoryError> {
        let encoded = serde_json::to_string(&value)?;
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let actual: u64 = tx
            .query_row(
                "SELECT revision FROM records WHERE key = ?1",
                params![key],
                |row| row.get::<_, i64>(0),
            )
            .optional()?
            .map(|r| r as u64)
            .unwrap_or(0);
        if let Some(expected) = expected {
            if expected != actual {
                // tx 在此处 drop 即回滚
                return Err(MemoryError::Conflict {
                    key: key.to_string(),
                    expected,
                    actual,
                });
            }
        }
        let revision = actual + 1;
        let entry = HistoryEntry::new(
            origin,
            HistoryEvent::Write {
                key: key.to_string(),
                value,
                revision,
            },
        );
        tx.execute(
            "INSERT INTO records (key, value, revision, updated_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value,
                 revision = excluded.revision, updated_at = excluded.updated_at",
            params![key, encoded, revision as i64, entry.timestamp_ms],
        )?;
        insert_history(&tx, &entry)?;
        tx.commit()?;
        Ok(revision)
    }

    fn append_history(&self, entry: HistoryEntry) -> Result<u64, MemoryError> {
        let conn = self.conn()?;
        insert_history(&conn, &entry)
    }

    fn snapshot(&self) -> Result<MemorySnapshot, MemoryError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT key, value, revision FROM records")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;
        let mut records = std::collections::BTreeMap::new();
        for row in rows {
            let (key, value, revision) = row?;
            records.insert(
                key,
                Versioned {
                    value: serde_json::from_str(&value)?,
                    revision: revision as u64,
                },
            );
        }
        Ok(MemorySnapshot::new(records))
    }

    fn history(&self, run: Option<&RunId>) -> Result<Vec<HistoryRecord>, MemoryError> {
        let conn = self.conn()?;
        let run = run.map(|id| id.to_string());
        let mut stmt = conn.prepare(
            "SELECT seq, ts, run_id, event FROM history
             WHERE ?1 IS NULL OR run_id = ?1 ORDER BY seq",
        )?;
        let rows = stmt.query_map(params![run], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (seq, ts, run_id, event) = row?;
            let run_id = run_id
                .map(|s| s.parse::<RunId>())
                .transpose()
                .map_err(|e| MemoryError::Persistence(format!("bad run id in history: {e}")))?;
            out.push(HistoryRecord {
                seq: seq as u64,
                entry: HistoryEntry {
                    timestamp_ms: ts,
                    run_id,
                    event: serde_json::from_str(&event)?,
                },
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_values_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("memory.db");
        {
            let store = SqliteMemoryStore::open(&path).unwrap();
            store.write("doc:EP1", json!({"title": "x"}), None, None).unwrap();
            store.write("doc:EP1", json!({"title": "y"}), Some(1), None).unwrap();
        }
        let store = SqliteMemoryStore::open(&path).unwrap();
        let v = store.read("doc:EP1").unwrap().unwrap();
        assert_eq!(v.revision, 2);
        assert_eq!(v.value, json!({"title": "y"}));
        assert_eq!(store.history(None).unwrap().len(), 2);
    }

    #[test]
    fn test_conflict_leaves_prior_value() {
        let dir = TempDir::new().unwrap();
        let store = SqliteMemoryStore::open(dir.path().join("m.db")).unwrap();
        store.write("k", json!(1), None, None).unwrap();
        store.write("k", json!(2), None, None).unwrap();

        let err = store.write("k", json!(3), Some(1), None).unwrap_err();
        assert_eq!(
            err,
            MemoryError::Conflict {
                key: "k".to_string(),
                expected: 1,
                actual: 2
            }
        );
        assert_eq!(store.read("k").unwrap().unwrap().value, json!(2));
        // 冲突的写入不进入历史
        assert_eq!(store.history(None).unwrap().len(), 2);
    }

    #[test]
    fn test_history_filters_by_run() {
        let dir = TempDir::new().unwrap();
        let store = SqliteMemoryStore::open(dir.path().join("m.db")).unwrap();
        let a = RunId::new();
        let b = RunId::new();
        store.write("x", json!(1), None, Some(a)).unwrap();
        store.write("y", json!(2), None, Some(b)).unwrap();
        store
            .append_history(HistoryEntry::new(
                Some(a),
                HistoryEvent::Note {
                    label: "started".into(),
                    payload: json!({}),
                },
            ))
            .unwrap();

        let only_a = store.history(Some(&a)).unwrap();
        assert_eq!(only_a.len(), 2);
        assert!(only_a.iter().all(|r| r.entry.run_id == Some(a)));
        assert!(only_a[0].seq < only_a[1].seq);
    }

    #[test]
    fn test_last_writer_wins_sequence() {
        let dir = TempDir::new().unwrap();
        let store = SqliteMemoryStore::open(dir.path().join("m.db")).unwrap();
        for i in 0..20 {
            let rev = store.write("counter", json!(i), None, None).unwrap();
            assert_eq!(rev, i + 1);
            assert_eq!(store.read("counter").unwrap().unwrap().value, json!(i));
        }
    }
}
