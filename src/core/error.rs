//! 错误分类与恢复动作
//!
//! 每一层有自己的 thiserror 枚举（记忆、注册表、观察失败、运行、监管），
//! 统一映射到 ErrorKind；ErrorKind 的字符串形式出现在观察结果与 status 中。
//! RecoveryEngine 根据错误给出 RecoveryAction（重试 / 作为观察上报 / 终止运行）。

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::ids::RunId;

/// 稳定的错误种类名，序列化为 PascalCase（如 "TimedOut"）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    PersistenceFailure,
    ConflictError,
    DuplicateTool,
    RegistryLocked,
    SchemaValidationError,
    TimedOut,
    ResourceExceeded,
    SandboxViolation,
    Cancelled,
    TransportError,
    DelegationDepthExceeded,
    RunAlreadyActive,
    UnknownTool,
    CapabilityDenied,
    InvalidPlan,
    DependencyFailed,
    RemoteError,
    HandlerFailed,
    InvalidOutput,
    InvalidDelegationTarget,
    TurnLimitExceeded,
    RunBudgetExceeded,
    PlannerFailed,
    TerminalRunMutation,
    Interrupted,
    UnknownRun,
    UnknownProject,
    Config,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::PersistenceFailure => "PersistenceFailure",
            ErrorKind::ConflictError => "ConflictError",
            ErrorKind::DuplicateTool => "DuplicateTool",
            ErrorKind::RegistryLocked => "RegistryLocked",
            ErrorKind::SchemaValidationError => "SchemaValidationError",
            ErrorKind::TimedOut => "TimedOut",
            ErrorKind::ResourceExceeded => "ResourceExceeded",
            ErrorKind::SandboxViolation => "SandboxViolation",
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::TransportError => "TransportError",
            ErrorKind::DelegationDepthExceeded => "DelegationDepthExceeded",
            ErrorKind::RunAlreadyActive => "RunAlreadyActive",
            ErrorKind::UnknownTool => "UnknownTool",
            ErrorKind::CapabilityDenied => "CapabilityDenied",
            ErrorKind::InvalidPlan => "InvalidPlan",
            ErrorKind::DependencyFailed => "DependencyFailed",
            ErrorKind::RemoteError => "RemoteError",
            ErrorKind::HandlerFailed => "HandlerFailed",
            ErrorKind::InvalidOutput => "InvalidOutput",
            ErrorKind::InvalidDelegationTarget => "InvalidDelegationTarget",
            ErrorKind::TurnLimitExceeded => "TurnLimitExceeded",
            ErrorKind::RunBudgetExceeded => "RunBudgetExceeded",
            ErrorKind::PlannerFailed => "PlannerFailed",
            ErrorKind::TerminalRunMutation => "TerminalRunMutation",
            ErrorKind::Interrupted => "Interrupted",
            ErrorKind::UnknownRun => "UnknownRun",
            ErrorKind::UnknownProject => "UnknownProject",
            ErrorKind::Config => "Config",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 记忆存储错误：持久化失败（不可恢复）与乐观并发冲突（调用方重读后重试）
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    #[error("persistence failure: {0}")]
    Persistence(String),

    #[error("revision conflict on '{key}': expected {expected}, found {actual}")]
    Conflict {
        key: String,
        expected: u64,
        actual: u64,
    },
}

impl MemoryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MemoryError::Persistence(_) => ErrorKind::PersistenceFailure,
            MemoryError::Conflict { .. } => ErrorKind::ConflictError,
        }
    }
}

impl From<rusqlite::Error> for MemoryError {
    fn from(e: rusqlite::Error) -> Self {
        MemoryError::Persistence(e.to_string())
    }
}

impl From<serde_json::Error> for MemoryError {
    fn from(e: serde_json::Error) -> Self {
        MemoryError::Persistence(format!("encoding: {e}"))
    }
}

impl From<std::io::Error> for MemoryError {
    fn from(e: std::io::Error) -> Self {
        MemoryError::Persistence(e.to_string())
    }
}

/// 工具注册表错误（配置错误，启动期致命）
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("duplicate tool: {0}")]
    DuplicateTool(String),

    #[error("registry is locked while runs are active (tried to register '{0}')")]
    RegistryLocked(String),

    #[error("invalid schema for tool '{name}': {reason}")]
    InvalidSchema { name: String, reason: String },
}

impl RegistryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RegistryError::DuplicateTool(_) => ErrorKind::DuplicateTool,
            RegistryError::RegistryLocked(_) => ErrorKind::RegistryLocked,
            RegistryError::InvalidSchema { .. } => ErrorKind::Config,
        }
    }
}

/// 作为观察结果交还给智能体的失败（工具调用、沙箱、委派、显式记忆写入）
///
/// 序列化形如 `{"status": "TimedOut", "limit_ms": 2000}`，供下一轮 Planning 处理。
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum ObservationError {
    #[error("unknown tool: {tool}")]
    UnknownTool { tool: String },

    #[error("tool '{tool}' requires capability '{capability}' which this agent does not hold")]
    CapabilityDenied { tool: String, capability: String },

    #[error("arguments failed schema validation: {}", errors.join("; "))]
    SchemaValidationError { errors: Vec<String> },

    #[error("tool output failed schema validation: {}", errors.join("; "))]
    InvalidOutput { errors: Vec<String> },

    #[error("timed out after {limit_ms}ms")]
    TimedOut { limit_ms: u64 },

    #[error("resource limit exceeded: {resource} (limit {limit})")]
    ResourceExceeded { resource: String, limit: u64 },

    #[error("sandbox violation at '{path}': {reason}")]
    SandboxViolation { path: String, reason: String },

    #[error("cancelled")]
    Cancelled,

    #[error("transport error: {message}")]
    TransportError { message: String },

    #[error("remote tool error: {message}")]
    RemoteError { message: String },

    #[error("handler failed: {message}")]
    HandlerFailed { message: String },

    #[error("dependency '{dependency}' did not succeed")]
    DependencyFailed { dependency: String },

    #[error("invalid plan: {reason}")]
    InvalidPlan { reason: String },

    #[error("revision conflict on '{key}': expected {expected}, found {actual}")]
    ConflictError {
        key: String,
        expected: u64,
        actual: u64,
    },

    #[error("persistence failure: {message}")]
    PersistenceFailure { message: String },

    #[error("delegation depth {depth} exceeds limit {limit}")]
    DelegationDepthExceeded { depth: usize, limit: usize },

    #[error("cannot delegate to '{target}'")]
    InvalidDelegationTarget { target: String },

    #[error("delegated run {child_run} ended with {kind}: {message}")]
    DelegationFailed {
        child_run: String,
        kind: ErrorKind,
        message: String,
    },
}

impl ObservationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ObservationError::UnknownTool { .. } => ErrorKind::UnknownTool,
            ObservationError::CapabilityDenied { .. } => ErrorKind::CapabilityDenied,
            ObservationError::SchemaValidationError { .. } => ErrorKind::SchemaValidationError,
            ObservationError::InvalidOutput { .. } => ErrorKind::InvalidOutput,
            ObservationError::TimedOut { .. } => ErrorKind::TimedOut,
            ObservationError::ResourceExceeded { .. } => ErrorKind::ResourceExceeded,
            ObservationError::SandboxViolation { .. } => ErrorKind::SandboxViolation,
            ObservationError::Cancelled => ErrorKind::Cancelled,
            ObservationError::TransportError { .. } => ErrorKind::TransportError,
            ObservationError::RemoteError { .. } => ErrorKind::RemoteError,
            ObservationError::HandlerFailed { .. } => ErrorKind::HandlerFailed,
            ObservationError::DependencyFailed { .. } => ErrorKind::DependencyFailed,
            ObservationError::InvalidPlan { .. } => ErrorKind::InvalidPlan,
            ObservationError::ConflictError { .. } => ErrorKind::ConflictError,
            ObservationError::PersistenceFailure { .. } => ErrorKind::PersistenceFailure,
            ObservationError::DelegationDepthExceeded { .. } => {
                ErrorKind::DelegationDepthExceeded
            }
            ObservationError::InvalidDelegationTarget { .. } => {
                ErrorKind::InvalidDelegationTarget
            }
            ObservationError::DelegationFailed { kind, .. } => *kind,
        }
    }

    pub fn handler(message: impl Into<String>) -> Self {
        ObservationError::HandlerFailed {
            message: message.into(),
        }
    }
}

impl From<MemoryError> for ObservationError {
    fn from(e: MemoryError) -> Self {
        match e {
            MemoryError::Persistence(message) => ObservationError::PersistenceFailure { message },
            MemoryError::Conflict {
                key,
                expected,
                actual,
            } => ObservationError::ConflictError {
                key,
                expected,
                actual,
            },
        }
    }
}

/// 使运行进入 Failed 的不可恢复错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RunError {
    #[error("persistence failure: {0}")]
    Persistence(String),

    #[error("planner failed: {0}")]
    Planner(String),

    #[error("run is already terminal ({state}); mutation rejected")]
    TerminalRunMutation { state: String },

    #[error("illegal run transition {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("turn limit {limit} reached")]
    TurnLimitExceeded { limit: usize },

    #[error("run budget of {secs}s exhausted")]
    BudgetExceeded { secs: u64 },

    #[error("run was interrupted by a previous shutdown")]
    Interrupted,

    #[error("agent gave up: {0}")]
    GaveUp(String),
}

impl RunError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RunError::Persistence(_) => ErrorKind::PersistenceFailure,
            RunError::Planner(_) | RunError::GaveUp(_) => ErrorKind::PlannerFailed,
            RunError::TerminalRunMutation { .. } | RunError::InvalidTransition { .. } => {
                ErrorKind::TerminalRunMutation
            }
            RunError::TurnLimitExceeded { .. } => ErrorKind::TurnLimitExceeded,
            RunError::BudgetExceeded { .. } => ErrorKind::RunBudgetExceeded,
            RunError::Interrupted => ErrorKind::Interrupted,
        }
    }
}

impl From<MemoryError> for RunError {
    fn from(e: MemoryError) -> Self {
        RunError::Persistence(e.to_string())
    }
}

/// Supervisor 边界上的错误（被拒绝的请求不会创建运行）
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SupervisorError {
    #[error("project '{project}' already has active run {run_id}")]
    RunAlreadyActive { project: String, run_id: RunId },

    #[error("unknown run: {0}")]
    UnknownRun(RunId),

    #[error("unknown project: {0}")]
    UnknownProject(String),

    #[error(transparent)]
    Memory(#[from] MemoryError),
}

impl SupervisorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SupervisorError::RunAlreadyActive { .. } => ErrorKind::RunAlreadyActive,
            SupervisorError::UnknownRun(_) => ErrorKind::UnknownRun,
            SupervisorError::UnknownProject(_) => ErrorKind::UnknownProject,
            SupervisorError::Memory(e) => e.kind(),
        }
    }
}

/// 恢复引擎根据错误类型给出的建议动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// 等待后重试一次（传输错误）
    RetryAfter(Duration),
    /// 作为失败观察交给智能体下一轮规划
    Surface,
    /// 终止当前运行（进入 Failed）
    FailRun,
}
