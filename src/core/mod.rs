//! 核心编排层：标识符、错误与恢复、运行状态机、停止信号、步内调度、Supervisor 与装配

pub mod builder;
pub mod error;
pub mod ids;
pub mod recovery;
pub mod shutdown;
pub mod state;
pub mod stop;
pub mod supervisor;
pub mod task_scheduler;

pub use builder::SupervisorBuilder;
pub use error::{
    ErrorKind, MemoryError, ObservationError, RecoveryAction, RegistryError, RunError,
    SupervisorError,
};
pub use ids::{CallId, JobId, RunId};
pub use recovery::RecoveryEngine;
pub use shutdown::{ShutdownManager, ShutdownReason};
pub use state::{checkpoint_key, RunFailure, RunState, RunStatus, StatusBoard};
pub use stop::{StopReason, StopSignal};
pub use supervisor::{Supervisor, SupervisorOptions};
pub use task_scheduler::{plan_waves, WavePlan};
