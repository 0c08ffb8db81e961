//! 项目记忆：版本化键值 + 追加式历史日志、SQLite 持久化、历史回放

pub mod project;
pub mod replay;
pub mod sqlite;
pub mod store;

pub use project::{Project, ProjectMemory};
pub use replay::{replay_snapshot, replay_steps};
pub use sqlite::SqliteMemoryStore;
pub use store::{
    HistoryEntry, HistoryEvent, HistoryRecord, InMemoryStore, MemorySnapshot, MemoryStore,
    Versioned,
};
