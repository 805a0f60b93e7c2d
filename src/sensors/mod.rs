//! 传感器接口：上下文来源、系统告警、输入清洗
//!
//! 具体的窗口/剪贴板/截图采集在本 crate 之外，这里只定义编排器消费的形状。

pub mod sanitize;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::Context;

pub use sanitize::{sanitize_input, MAX_INPUT_CHARS};

/// 告警严重级别
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    /// UI 通知前缀
    pub fn badge(self) -> &'static str {
        match self {
            Severity::Info => "ℹ️ INFO",
            Severity::Warning => "⚠️ WARNING",
            Severity::Critical => "🚨 CRITICAL",
        }
    }
}

/// 系统告警事件
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AlertEvent {
    pub severity: Severity,
    pub source: String,
    pub message: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub details: Value,
}

impl AlertEvent {
    pub fn new(severity: Severity, source: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity,
            source: source.into(),
            message: message.into(),
            timestamp: Utc::now(),
            details: Value::Null,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    pub fn is_critical(&self) -> bool {
        self.severity == Severity::Critical
    }

    /// 没有走推理路径时展示给用户的通知文本
    pub fn notification(&self) -> String {
        format!("{}: {}", self.severity.badge(), self.message)
    }
}

/// 拉取式上下文来源（由上下文轮询任务定期调用）
#[async_trait]
pub trait ContextSource: Send + Sync {
    /// 返回当前上下文；暂时拿不到时返回 None
    async fn poll(&self) -> Option<Context>;

    fn name(&self) -> &str {
        "context"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alert_deserializes_with_defaults() {
        let alert: AlertEvent = serde_json::from_str(
            r#"{"severity":"critical","source":"battery","message":"Battery at 3%"}"#,
        )
        .unwrap();
        assert!(alert.is_critical());
        assert!(alert.details.is_null());
        assert_eq!(alert.notification(), "🚨 CRITICAL: Battery at 3%");
    }
}
