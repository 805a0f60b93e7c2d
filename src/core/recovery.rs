//! 错误恢复引擎
//!
//! 根据 AgentError 类型返回 TurnRecovery，供主动循环决定是退避、跳过还是终止；
//! 按需路径另取一条面向用户的致歉文本，保证调用方总能拿到回复。

use std::time::Duration;

use crate::core::{AgentError, TurnRecovery};

/// 回合边界的语义化恢复：把错误映射为下一次调度间隔
#[derive(Debug, Clone)]
pub struct RecoveryEngine {
    default_interval: Duration,
    failure_backoff: Duration,
}

impl RecoveryEngine {
    pub fn new(default_interval: Duration, failure_backoff: Duration) -> Self {
        Self {
            default_interval,
            failure_backoff,
        }
    }

    pub fn handle(&self, err: &AgentError) -> TurnRecovery {
        match err {
            AgentError::TransientIo(_) => TurnRecovery::Backoff(self.failure_backoff),
            AgentError::ResourceExhausted(_) => TurnRecovery::Backoff(self.failure_backoff),
            AgentError::BackendRejected(_) => TurnRecovery::Skip(self.default_interval),
            AgentError::InvalidDecision(_) => TurnRecovery::Skip(self.default_interval),
            AgentError::Cancelled | AgentError::Fatal(_) => TurnRecovery::Abort,
        }
    }

    /// 按需请求失败时回给调用方的文本
    pub fn apology(&self, err: &AgentError) -> String {
        match err {
            AgentError::BackendRejected(_) => {
                "Sorry, I can't help with that one right now.".to_string()
            }
            AgentError::Cancelled => "Sorry, I'm shutting down.".to_string(),
            _ => "Sorry, I had trouble processing your request.".to_string(),
        }
    }

    pub fn default_interval(&self) -> Duration {
        self.default_interval
    }

    pub fn failure_backoff(&self) -> Duration {
        self.failure_backoff
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> RecoveryEngine {
        RecoveryEngine::new(Duration::from_secs(45), Duration::from_secs(90))
    }

    #[test]
    fn test_recovery_transient_backs_off() {
        let action = engine().handle(&AgentError::TransientIo("timeout".into()));
        assert_eq!(action, TurnRecovery::Backoff(Duration::from_secs(90)));
    }

    #[test]
    fn test_recovery_rejected_skips_with_default() {
        let action = engine().handle(&AgentError::BackendRejected("blocked".into()));
        assert_eq!(action, TurnRecovery::Skip(Duration::from_secs(45)));
    }

    #[test]
    fn test_recovery_invalid_decision_skips() {
        let action = engine().handle(&AgentError::InvalidDecision("fly".into()));
        assert_eq!(action, TurnRecovery::Skip(Duration::from_secs(45)));
    }

    #[test]
    fn test_recovery_cancelled_aborts() {
        assert_eq!(engine().handle(&AgentError::Cancelled), TurnRecovery::Abort);
    }

    #[test]
    fn test_apology_is_never_empty() {
        let e = engine();
        for err in [
            AgentError::TransientIo("x".into()),
            AgentError::BackendRejected("x".into()),
            AgentError::Cancelled,
        ] {
            assert!(!e.apology(&err).is_empty());
        }
    }
}
