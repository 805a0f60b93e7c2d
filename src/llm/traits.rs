//! LLM 客户端抽象
//!
//! 所有后端（OpenAI 兼容 / Mock / 脚本化）实现 LlmClient；错误区分「网络/超时」与「后端拒绝」，
//! 推理客户端据此选择退避还是跳过。

use async_trait::async_trait;
use thiserror::Error;

use crate::memory::Message;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LlmError {
    /// 网络、5xx、响应解析失败
    #[error("LLM transport error: {0}")]
    Transport(String),

    /// 内容过滤、安全拦截、鉴权失败等
    #[error("LLM rejected request: {0}")]
    Rejected(String),
}

/// LLM 客户端 trait：单次非流式完成
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError>;

    /// 获取累计 token 使用统计：(prompt_tokens, completion_tokens, total_tokens)
    /// 默认返回 (0, 0, 0)，具体实现可覆盖
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}

/// 嵌入提供方：供语义索引使用
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError>;
}
