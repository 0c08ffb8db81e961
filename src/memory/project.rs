//! 项目：标识、存储根目录、创建时间，以及异步访问记忆存储的 ProjectMemory
//!
//! 目录布局（项目根下）：
//! - `.hive/project.json`：项目清单
//! - `.hive/memory.db`：键值记录与历史日志
//! - `.hive/runs/<run_id>/scratch/`：沙箱作业的产物目录

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::ids::RunId;
use crate::core::MemoryError;
use crate::memory::sqlite::SqliteMemoryStore;
use crate::memory::store::{HistoryEntry, HistoryRecord, MemorySnapshot, MemoryStore, Versioned};

const STATE_DIR: &str = ".hive";
const MANIFEST: &str = "project.json";

/// 项目清单；首次使用某路径时创建，之后只读
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub root: PathBuf,
    pub created_at: i64,
}

impl Project {
    /// 打开已有项目或在 root 下创建新项目
    pub fn open_or_create(id: &str, root: impl AsRef<Path>) -> Result<Self, MemoryError> {
        let root = root.as_ref().to_path_buf();
        let state_dir = root.join(STATE_DIR);
        std::fs::create_dir_all(&state_dir)?;
        let manifest = state_dir.join(MANIFEST);
        if manifest.exists() {
            let data = std::fs::read_to_string(&manifest)?;
            let mut project: Project = serde_json::from_str(&data)?;
            project.root = root;
            return Ok(project);
        }
        let project = Project {
            id: id.to_string(),
            root,
            created_at: chrono::Utc::now().timestamp_millis(),
        };
        let tmp = state_dir.join(format!("{MANIFEST}.tmp"));
        let file = std::fs::File::create(&tmp)?;
        serde_json::to_writer_pretty(&file, &project)?;
        file.sync_all()?;
        std::fs::rename(&tmp, &manifest)?;
        tracing::info!(project = %id, root = %project.root.display(), "project created");
        Ok(project)
    }

    /// 项目 ID 只允许字母数字与 `_ - .`，且不能以 `.` 开头（用作目录名）
    pub fn is_valid_id(id: &str) -> bool {
        !id.is_empty()
            && !id.starts_with('.')
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join(STATE_DIR)
    }

    pub fn db_path(&self) -> PathBuf {
        self.state_dir().join("memory.db")
    }

    pub fn scratch_dir(&self, run: &RunId) -> PathBuf {
        self.state_dir().join("runs").join(run.to_string()).join("scratch")
    }

    /// 打开该项目的 SQLite 记忆存储
    pub fn open_memory(&self) -> Result<ProjectMemory, MemoryError> {
        let store = SqliteMemoryStore::open(self.db_path())?;
        Ok(ProjectMemory::new(Arc::new(store)))
    }
}

/// 记忆存储的异步句柄：同步存储调用放到 blocking 线程池执行
#[derive(Clone)]
pub struct ProjectMemory {
    store: Arc<dyn MemoryStore>,
}

impl std::fmt::Debug for ProjectMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectMemory").finish_non_exhaustive()
    }
}

async fn blocking<T, F>(f: F) -> Result<T, MemoryError>
where
    F: FnOnce() -> Result<T, MemoryError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| MemoryError::Persistence(format!("store task failed: {e}")))?
}

impl ProjectMemory {
    pub fn new(store: Arc<dyn MemoryStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn MemoryStore> {
        &self.store
    }

    pub async fn read(&self, key: &str) -> Result<Option<Versioned>, MemoryError> {
        let store = self.store.clone();
        let key = key.to_string();
        blocking(move || store.read(&key)).await
    }

    pub async fn write(
        &self,
        key: &str,
        value: Value,
        expected: Option<u64>,
        origin: Option<RunId>,
    ) -> Result<u64, MemoryError> {
        let store = self.store.clone();
        let key = key.to_string();
        let result = blocking(move || store.write(&key, value, expected, origin)).await;
        if let Err(MemoryError::Persistence(e)) = &result {
            tracing::error!(error = %e, "memory write not persisted");
        }
        result
    }

    pub async fn append_history(&self, entry: HistoryEntry) -> Result<u64, MemoryError> {
        let store = self.store.clone();
        blocking(move || store.append_history(entry)).await
    }

    pub async fn snapshot(&self) -> Result<MemorySnapshot, MemoryError> {
        let store = self.store.clone();
        blocking(move || store.snapshot()).await
    }

    pub async fn history(&self, run: Option<RunId>) -> Result<Vec<HistoryRecord>, MemoryError> {
        let store = self.store.clone();
        blocking(move || store.history(run.as_ref())).await
    }
}
