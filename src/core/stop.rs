//! 运行停止信号
//!
//! 持有 CancellationToken 与首个停止原因；子运行拿到 child()，
//! 父运行被取消时子 token 随之取消，子运行未记录原因时沿用父运行的原因。
//! 子运行自身的预算超时不会影响父运行。

use std::sync::{Arc, OnceLock};

use tokio_util::sync::CancellationToken;

/// 停止原因（以最先记录的为准）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// 宿主发起的 cancel
    User,
    /// 运行墙钟预算耗尽
    Budget,
    /// 进程关闭
    Shutdown,
}

#[derive(Debug, Clone)]
pub struct StopSignal {
    token: CancellationToken,
    reason: Arc<OnceLock<StopReason>>,
    parent: Option<Box<StopSignal>>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            reason: Arc::new(OnceLock::new()),
            parent: None,
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// 记录原因后取消；重复调用只取消，不覆盖原因
    pub fn stop(&self, reason: StopReason) {
        let _ = self.reason.set(reason);
        self.token.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    /// 本运行记录的原因，没有时取最近一个记录了原因的祖先
    pub fn reason(&self) -> Option<StopReason> {
        self.reason
            .get()
            .copied()
            .or_else(|| self.parent.as_ref().and_then(|p| p.reason()))
    }

    /// 子运行使用的信号：共享取消，原因单独记录
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            reason: Arc::new(OnceLock::new()),
            parent: Some(Box::new(self.clone())),
        }
    }

    pub async fn stopped(&self) {
        self.token.cancelled().await;
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_reason_wins() {
        let stop = StopSignal::new();
        stop.stop(StopReason::Budget);
        stop.stop(StopReason::User);
        assert!(stop.is_stopped());
        assert_eq!(stop.reason(), Some(StopReason::Budget));
    }

    #[test]
    fn test_child_cascades_down_only() {
        let parent = StopSignal::new();
        let child = parent.child();
        child.stop(StopReason::Budget);
        assert!(!parent.is_stopped());

        let other = parent.child();
        parent.stop(StopReason::User);
        assert!(other.is_stopped());
        assert_eq!(other.reason(), Some(StopReason::User));
        assert_eq!(child.reason(), Some(StopReason::Budget));
    }

    #[test]
    fn test_grandchild_inherits_budget_reason() {
        let root = StopSignal::new();
        let grandchild = root.child().child();
        assert_eq!(grandchild.reason(), None);
        root.stop(StopReason::Budget);
        assert!(grandchild.is_stopped());
        assert_eq!(grandchild.reason(), Some(StopReason::Budget));
    }
}
