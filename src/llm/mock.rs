//! Mock / 脚本化 LLM 客户端（用于测试与无 API Key 的本地运行）
//!
//! MockLlmClient 回显最后一条 User 消息为纯文本（没有决策，主动循环因此只观察等待）；
//! ScriptedLlmClient 按顺序吐出预置的回复，可模拟延迟、失败，并记录每次收到的消息。

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::llm::{EmbeddingProvider, LlmClient, LlmError};
use crate::memory::{Message, Role};

/// Mock 客户端：回显用户最后一条消息
#[derive(Debug, Default)]
pub struct MockLlmClient;

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or("(no input)");
        let last_line = last_user.lines().last().unwrap_or_default();
        Ok(format!("Echo from Mock: {}", last_line))
    }
}

/// 预置回复的客户端；队列耗尽后返回 fallback
pub struct ScriptedLlmClient {
    replies: Mutex<VecDeque<Result<String, LlmError>>>,
    fallback: String,
    latency: Duration,
    seen: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedLlmClient {
    pub fn new() -> Self {
        Self {
            replies: Mutex::new(VecDeque::new()),
            fallback: String::new(),
            latency: Duration::ZERO,
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// 队列为空时的默认回复
    pub fn with_fallback(mut self, reply: impl Into<String>) -> Self {
        self.fallback = reply.into();
        self
    }

    pub fn push_reply(&self, reply: impl Into<String>) {
        self.replies
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push_back(Ok(reply.into()));
    }

    pub fn push_error(&self, err: LlmError) {
        self.replies
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push_back(Err(err));
    }

    pub fn call_count(&self) -> usize {
        self.seen.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    /// 每次调用收到的消息列表
    pub fn requests(&self) -> Vec<Vec<Message>> {
        self.seen.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

impl Default for ScriptedLlmClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        self.seen
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(messages.to_vec());
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let next = self
            .replies
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pop_front();
        next.unwrap_or_else(|| Ok(self.fallback.clone()))
    }
}

/// 按字母频次生成的确定性向量，只用于测试语义检索
#[derive(Debug, Default)]
pub struct BagOfLettersEmbedder;

#[async_trait]
impl EmbeddingProvider for BagOfLettersEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError> {
        let mut v = vec![0.0f32; 26];
        for c in text.to_lowercase().chars() {
            if c.is_ascii_lowercase() {
                v[(c as u8 - b'a') as usize] += 1.0;
            }
        }
        Ok(v)
    }
}
