//! 错误恢复引擎
//!
//! 根据失败类型返回 RecoveryAction：Dispatcher 据此决定是否重试传输错误，
//! Agent Runtime 据此区分「作为观察交还智能体」与「终止运行」。

use std::time::Duration;

use crate::core::{ErrorKind, ObservationError, RecoveryAction};

/// 语义化错误恢复：将错误映射为可执行动作（重试 / 上报观察 / 终止）
#[derive(Debug, Clone)]
pub struct RecoveryEngine {
    transport_backoff: Duration,
    max_transport_retries: u32,
}

impl Default for RecoveryEngine {
    fn default() -> Self {
        Self::new(Duration::from_millis(250))
    }
}

impl RecoveryEngine {
    pub fn new(transport_backoff: Duration) -> Self {
        Self {
            transport_backoff,
            max_transport_retries: 1,
        }
    }

    /// 工具调用失败；attempt 为已重试次数
    pub fn for_observation(&self, err: &ObservationError, attempt: u32) -> RecoveryAction {
        match err.kind() {
            ErrorKind::TransportError if attempt < self.max_transport_retries => {
                RecoveryAction::RetryAfter(self.transport_backoff)
            }
            ErrorKind::PersistenceFailure => RecoveryAction::FailRun,
            _ => RecoveryAction::Surface,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_retried_once() {
        let engine = RecoveryEngine::new(Duration::from_millis(10));
        let err = ObservationError::TransportError {
            message: "connection reset".to_string(),
        };
        assert_eq!(
            engine.for_observation(&err, 0),
            RecoveryAction::RetryAfter(Duration::from_millis(10))
        );
        assert_eq!(engine.for_observation(&err, 1), RecoveryAction::Surface);
    }

    #[test]
    fn test_tool_failures_are_surfaced() {
        let engine = RecoveryEngine::default();
        let err = ObservationError::TimedOut { limit_ms: 2000 };
        assert_eq!(engine.for_observation(&err, 0), RecoveryAction::Surface);
        let err = ObservationError::SchemaValidationError {
            errors: vec!["id: required".to_string()],
        };
        assert_eq!(engine.for_observation(&err, 0), RecoveryAction::Surface);
    }

    #[test]
    fn test_persistence_failure_fails_run() {
        let engine = RecoveryEngine::default();
        let err = ObservationError::PersistenceFailure {
            message: "disk full".to_string(),
        };
        assert_eq!(engine.for_observation(&err, 0), RecoveryAction::FailRun);
    }
}
