//! 推理客户端（主动 / 按需各一个实例）
//!
//! 每个实例持有独立的 RateLimiter，两条路径互不饿死。admit() 与 decide() 分开：编排器在拿模式锁
//! 之前完成准入，限流等待期间不占着化身。decide() 外包一层超时，挂住的后端走和网络错误相同的失败路径。

use std::sync::Arc;
use std::time::Duration;

use crate::brain::{parse_reasoning_output, ReasoningOutput};
use crate::core::{AgentError, RateLimiter};
use crate::llm::{LlmClient, LlmError};
use crate::memory::Message;
use crate::observability::Metrics;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReasoningRole {
    Proactive,
    Reactive,
}

impl ReasoningRole {
    pub fn as_str(self) -> &'static str {
        match self {
            ReasoningRole::Proactive => "proactive",
            ReasoningRole::Reactive => "reactive",
        }
    }
}

/// 一次推理请求：若干提示词片段（上下文、记忆、情绪、告警…）+ 对话历史 + 本轮输入
#[derive(Clone, Debug, Default)]
pub struct ReasoningRequest {
    pub sections: Vec<String>,
    pub history: Vec<Message>,
    pub prompt: String,
}

impl ReasoningRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn section(mut self, section: impl Into<String>) -> Self {
        let s = section.into();
        if !s.trim().is_empty() {
            self.sections.push(s);
        }
        self
    }

    pub fn history(mut self, history: Vec<Message>) -> Self {
        self.history = history;
        self
    }
}

pub struct ReasoningClient {
    role: ReasoningRole,
    llm: Arc<dyn LlmClient>,
    limiter: Arc<RateLimiter>,
    timeout: Duration,
    system_prompt: String,
    /// 可用动作说明（名称、描述、参数 schema）
    tools_section: String,
    metrics: Arc<Metrics>,
}

impl ReasoningClient {
    pub fn new(
        role: ReasoningRole,
        llm: Arc<dyn LlmClient>,
        limiter: Arc<RateLimiter>,
        timeout: Duration,
    ) -> Self {
        Self {
            role,
            llm,
            limiter,
            timeout,
            system_prompt: String::new(),
            tools_section: String::new(),
            metrics: Arc::new(Metrics::new()),
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_tools_section(mut self, tools: impl Into<String>) -> Self {
        self.tools_section = tools.into();
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn role(&self) -> ReasoningRole {
        self.role
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// 限流准入；可能挂起直到窗口有预算，从不报错
    pub async fn admit(&self) {
        self.limiter.acquire().await;
    }

    pub fn build_messages(&self, request: &ReasoningRequest) -> Vec<Message> {
        let mut system = self.system_prompt.clone();
        if !self.tools_section.is_empty() {
            system.push_str("\n\n## Available actions\n");
            system.push_str(&self.tools_section);
        }
        for section in &request.sections {
            system.push_str("\n\n");
            system.push_str(section.trim_end());
        }

        let mut messages = Vec::with_capacity(request.history.len() + 2);
        messages.push(Message::system(system));
        messages.extend(request.history.iter().cloned());
        messages.push(Message::user(request.prompt.clone()));
        messages
    }

    /// 调用后端并解析决策；调用方须已通过 admit()
    pub async fn decide(&self, request: &ReasoningRequest) -> Result<ReasoningOutput, AgentError> {
        let messages = self.build_messages(request);
        Metrics::incr(&self.metrics.reasoning_calls);

        let result = match tokio::time::timeout(self.timeout, self.llm.complete(&messages)).await {
            Ok(Ok(raw)) => parse_reasoning_output(&raw),
            Ok(Err(LlmError::Rejected(msg))) => Err(AgentError::BackendRejected(msg)),
            Ok(Err(LlmError::Transport(msg))) => Err(AgentError::TransientIo(msg)),
            Err(_) => Err(AgentError::TransientIo(format!(
                "{} reasoning timed out after {}s",
                self.role.as_str(),
                self.timeout.as_secs()
            ))),
        };

        match &result {
            Ok(out) => tracing::debug!(
                role = self.role.as_str(),
                decisions = out.decisions.len(),
                has_text = out.text.is_some(),
                "reasoning completed"
            ),
            Err(e) => {
                Metrics::incr(&self.metrics.reasoning_failures);
                tracing::warn!(role = self.role.as_str(), "reasoning failed: {}", e);
            }
        }
        result
    }

    pub fn token_usage(&self) -> (u64, u64, u64) {
        self.llm.token_usage()
    }
}
