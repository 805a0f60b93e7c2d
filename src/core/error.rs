//! 编排错误类型与回合恢复动作
//!
//! 与 RecoveryEngine 配合：每个回合（主动 tick / 按需请求 / 严重告警）在边界处把 AgentError
//! 映射为 TurnRecovery，错误永远不会越过编排器的回合边界。

use std::time::Duration;

use thiserror::Error;

use crate::actuator::ActuatorError;
use crate::memory::MemoryError;

/// 编排过程中可能出现的错误
#[derive(Error, Debug)]
pub enum AgentError {
    /// 网络 / 超时类错误，按客户端策略重试，不会让循环崩溃
    #[error("Transient I/O error: {0}")]
    TransientIo(String),

    /// 推理后端拒绝或拦截了请求
    #[error("Backend rejected request: {0}")]
    BackendRejected(String),

    /// 未知动作或参数非法
    #[error("Invalid decision: {0}")]
    InvalidDecision(String),

    /// 速率限制；正常路径下只会造成有界等待，不会作为错误抛给调用方
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// 仅在启动阶段出现（如情景库无法打开）
    #[error("Fatal: {0}")]
    Fatal(String),

    /// 回合进行中观察到关闭信号
    #[error("Cancelled")]
    Cancelled,
}

impl From<ActuatorError> for AgentError {
    fn from(e: ActuatorError) -> Self {
        match e {
            ActuatorError::Rejected(msg) => AgentError::InvalidDecision(msg),
            ActuatorError::NotFound(msg) => AgentError::TransientIo(format!("not found: {msg}")),
            other => AgentError::TransientIo(other.to_string()),
        }
    }
}

impl From<MemoryError> for AgentError {
    fn from(e: MemoryError) -> Self {
        AgentError::TransientIo(e.to_string())
    }
}

/// 恢复引擎给出的回合级处理动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnRecovery {
    /// 推理/网络失败：记录后以退避间隔等待下一次
    Backoff(Duration),
    /// 跳过本回合，按默认间隔继续
    Skip(Duration),
    /// 正在关闭，结束循环
    Abort,
}
