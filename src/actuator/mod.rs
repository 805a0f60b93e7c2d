//! 化身控制面客户端
//!
//! 外部控制面（渲染桌面宠物的引擎）只提供裸 HTTP 接口；ResilientActuatorClient 在其上补齐
//! 连接复用、指数退避 + 抖动、实例列表短 TTL 缓存与 404 重新定位。ActuatorTransport 是
//! 传输层接缝，生产用 reqwest，测试用脚本化实现。

pub mod client;
pub mod mock;
pub mod transport;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;

pub use client::{ActuatorSettings, ResilientActuatorClient};
pub use mock::{MockActuator, ScriptedReply};
pub use transport::{ActuatorTransport, HttpTransport, Method, TransportResponse};

/// 控制面错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ActuatorError {
    /// 连接失败、超时、5xx；计入退避
    #[error("actuator I/O error: {0}")]
    TransientIo(String),

    /// 实例不存在（可能已被重建为新 id）
    #[error("actuator instance not found: {0}")]
    NotFound(String),

    /// 控制面拒绝（如行为名非法）
    #[error("actuator rejected request: {0}")]
    Rejected(String),

    /// 退避中，快速失败
    #[error("actuator unavailable, retry in {retry_in_ms}ms")]
    Unavailable { retry_in_ms: u64 },

    #[error("actuator client closed")]
    Closed,
}

/// 控制面上的一个化身实例
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActuatorInstance {
    #[serde(deserialize_with = "id_as_string")]
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub active_behavior: Option<String>,
    #[serde(default)]
    pub anchor: Option<Anchor>,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Anchor {
    pub x: f64,
    pub y: f64,
}

/// 控制面的 id 有时是数字有时是字符串，统一成字符串
fn id_as_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "unexpected instance id: {other}"
        ))),
    }
}

/// 默认行为词表（控制面没有声明时使用）
pub const FALLBACK_BEHAVIORS: &[&str] = &["Stand", "Walk", "Run", "Sit", "Fall", "Dash"];

/// 会生成额外实例的行为，永远不暴露给推理后端
const EXCLUDED_BEHAVIOR_KEYWORDS: &[&str] = &["multiply", "spawn", "split"];

/// 由配置与实例列表合并出行为词表：去重保序，过滤会复制实例的行为
pub fn build_vocabulary<'a>(
    configured: &'a [String],
    observed: impl IntoIterator<Item = &'a str>,
) -> Vec<String> {
    let base: Vec<&str> = if configured.is_empty() {
        FALLBACK_BEHAVIORS.to_vec()
    } else {
        configured.iter().map(String::as_str).collect()
    };

    let mut out: Vec<String> = Vec::new();
    for name in base.into_iter().chain(observed) {
        let name = name.trim();
        if name.is_empty() {
            continue;
        }
        let lower = name.to_lowercase();
        if EXCLUDED_BEHAVIOR_KEYWORDS.iter().any(|k| lower.contains(k)) {
            continue;
        }
        if !out.iter().any(|n| n == name) {
            out.push(name.to_string());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_id_accepts_number() {
        let inst: ActuatorInstance =
            serde_json::from_str(r#"{"id": 7, "active_behavior": "Sit"}"#).unwrap();
        assert_eq!(inst.id, "7");
        assert_eq!(inst.active_behavior.as_deref(), Some("Sit"));
    }

    #[test]
    fn test_vocabulary_fallback_and_filter() {
        let vocab = build_vocabulary(&[], ["Sit", "Multiply", "ClimbWall", "SplitIntoTwo"]);
        assert_eq!(
            vocab,
            vec!["Stand", "Walk", "Run", "Sit", "Fall", "Dash", "ClimbWall"]
        );
    }

    #[test]
    fn test_vocabulary_prefers_configured_list() {
        let configured = vec!["Sleep".to_string(), "Dance".to_string(), "Sleep".to_string()];
        let vocab = build_vocabulary(&configured, std::iter::empty());
        assert_eq!(vocab, vec!["Sleep", "Dance"]);
    }
}
