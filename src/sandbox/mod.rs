//! 沙箱执行：资源受限、进程组隔离的脚本作业
//!
//! 沙箱是资源与崩溃隔离边界，不是对抗恶意代码的安全边界。

pub mod executor;
pub mod job;
pub mod limits;

use thiserror::Error;

use crate::core::{ErrorKind, MemoryError, ObservationError};

pub use executor::{ArtifactRecord, JobContext, SandboxExecutor, SandboxReport};
pub use job::{validate_artifact_path, SandboxJob, ScriptSource};
pub use limits::{LimitedBuffer, OutputBudget, ResourceLimits};

/// 沙箱作业的失败结果
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SandboxError {
    #[error("job exceeded wall-clock limit of {limit_ms}ms")]
    TimedOut { limit_ms: u64 },

    #[error("job exceeded {resource} limit ({limit})")]
    ResourceExceeded { resource: String, limit: u64 },

    #[error("sandbox violation at '{path}': {reason}")]
    Violation { path: String, reason: String },

    #[error("job cancelled")]
    Cancelled,

    #[error("no interpreter configured for language '{0}'")]
    UnknownLanguage(String),

    #[error("failed to start job: {0}")]
    Spawn(String),

    #[error("sandbox io: {0}")]
    Io(String),

    #[error(transparent)]
    Persistence(#[from] MemoryError),
}

impl SandboxError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SandboxError::TimedOut { .. } => ErrorKind::TimedOut,
            SandboxError::ResourceExceeded { .. } => ErrorKind::ResourceExceeded,
            SandboxError::Violation { .. } => ErrorKind::SandboxViolation,
            SandboxError::Cancelled => ErrorKind::Cancelled,
            SandboxError::UnknownLanguage(_) | SandboxError::Spawn(_) | SandboxError::Io(_) => {
                ErrorKind::HandlerFailed
            }
            SandboxError::Persistence(e) => e.kind(),
        }
    }
}

impl From<SandboxError> for ObservationError {
    fn from(e: SandboxError) -> Self {
        match e {
            SandboxError::TimedOut { limit_ms } => ObservationError::TimedOut { limit_ms },
            SandboxError::ResourceExceeded { resource, limit } => {
                ObservationError::ResourceExceeded { resource, limit }
            }
            SandboxError::Violation { path, reason } => {
                ObservationError::SandboxViolation { path, reason }
            }
            SandboxError::Cancelled => ObservationError::Cancelled,
            SandboxError::Persistence(e) => e.into(),
            other => ObservationError::handler(other.to_string()),
        }
    }
}
