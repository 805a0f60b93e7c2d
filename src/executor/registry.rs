//! 动作注册表
//!
//! 所有动作实现 ActionHandler（name / description / parameters_schema / effect / handle），
//! 启动时通过显式 register 调用注册一次，之后只读；未注册的动作名在执行前就被拒绝。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::core::{AgentError, Context};

/// 动作的外部可见副作用类别；每个动作至多一类
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EffectCategory {
    None,
    Actuator,
    Memory,
    Ui,
}

/// 执行动作时可见的环境
#[derive(Clone, Copy, Debug)]
pub struct ActionContext<'a> {
    pub context: Option<&'a Context>,
    /// 无可见动作时的默认轮询间隔
    pub default_interval: Duration,
    /// 有可见动作后的下一次检查间隔
    pub reaction_interval: Duration,
}

/// 动作处理器：参数校验 / 钳制在 handle 内完成，返回下一次轮询间隔
///
/// 处理器运行在编排器的独占区内，不得再去获取模式锁。
#[async_trait]
pub trait ActionHandler: Send + Sync {
    /// 动作名（对应 JSON 中的 "tool" 字段）
    fn name(&self) -> &str;

    /// 动作描述（供推理后端理解用途）
    fn description(&self) -> &str;

    /// 参数 JSON Schema
    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    fn effect(&self) -> EffectCategory;

    async fn handle(
        &self,
        args: &Map<String, Value>,
        ctx: ActionContext<'_>,
    ) -> Result<Duration, AgentError>;
}

/// 动作注册表：按名称存储，另存注册顺序用于稳定输出 schema
#[derive(Default)]
pub struct ActionRegistry {
    handlers: HashMap<String, Arc<dyn ActionHandler>>,
    order: Vec<String>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: impl ActionHandler + 'static) {
        let name = handler.name().to_string();
        if self.handlers.insert(name.clone(), Arc::new(handler)).is_some() {
            tracing::warn!(action = %name, "action handler replaced");
        } else {
            self.order.push(name);
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ActionHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.order.clone()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// 动作说明 JSON（名称、描述、参数 schema），拼入系统提示词
    pub fn to_schema_json(&self) -> String {
        let actions: Vec<Value> = self
            .order
            .iter()
            .filter_map(|name| self.handlers.get(name))
            .map(|h| {
                serde_json::json!({
                    "name": h.name(),
                    "description": h.description(),
                    "parameters": h.parameters_schema()
                })
            })
            .collect();
        serde_json::to_string_pretty(&actions).unwrap_or_else(|_| "[]".to_string())
    }
}
