//! 内置动作
//!
//! set_behavior / push_message 作用于化身，show_dialogue / check_actuator_status 作用于 UI，
//! save_episodic_memory 写情景库，observe_and_wait 没有外部副作用。

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::actuator::ResilientActuatorClient;
use crate::core::{AffectState, AgentError};
use crate::executor::{ActionContext, ActionHandler, EffectCategory};
use crate::memory::MemoryStore;
use crate::sensors::sanitize_input;
use crate::ui::{bubble_text, UiSink};

pub type SharedAffect = Arc<Mutex<AffectState>>;

const MAX_DIALOGUE_CHARS: usize = 500;

fn with_affect(affect: &SharedAffect, f: impl FnOnce(&mut AffectState)) {
    let mut guard = affect.lock().unwrap_or_else(|p| p.into_inner());
    f(&mut guard);
}

fn str_arg<'a>(args: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .find_map(|k| args.get(*k))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// 数字参数，字符串形式的数字也接受；缺失或非法时取默认值，再钳制到区间
fn clamped_secs(args: &Map<String, Value>, key: &str, default: u64, min: u64, max: u64) -> u64 {
    let raw = match args.get(key) {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    let secs = raw
        .filter(|v| v.is_finite())
        .map(|v| v.round().max(0.0) as u64)
        .unwrap_or(default);
    secs.clamp(min, max)
}

/// 切换化身行为；行为名必须在启动时确定的词表内
pub struct SetBehaviorHandler {
    actuator: Arc<ResilientActuatorClient>,
    vocabulary: Vec<String>,
    affect: SharedAffect,
}

impl SetBehaviorHandler {
    pub fn new(
        actuator: Arc<ResilientActuatorClient>,
        vocabulary: Vec<String>,
        affect: SharedAffect,
    ) -> Self {
        Self {
            actuator,
            vocabulary,
            affect,
        }
    }

    /// 大小写不敏感地匹配词表，返回规范名
    fn resolve(&self, name: &str) -> Option<&str> {
        self.vocabulary
            .iter()
            .find(|v| v.eq_ignore_ascii_case(name))
            .map(String::as_str)
    }
}

#[async_trait]
impl ActionHandler for SetBehaviorHandler {
    fn name(&self) -> &str {
        "set_behavior"
    }

    fn description(&self) -> &str {
        "Change what the mascot is doing on screen (walk, sit, sleep...)."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "behavior_name": { "type": "string", "enum": self.vocabulary }
            },
            "required": ["behavior_name"]
        })
    }

    fn effect(&self) -> EffectCategory {
        EffectCategory::Actuator
    }

    async fn handle(
        &self,
        args: &Map<String, Value>,
        ctx: ActionContext<'_>,
    ) -> Result<Duration, AgentError> {
        let requested = str_arg(args, &["behavior_name", "behavior"])
            .ok_or_else(|| AgentError::InvalidDecision("missing behavior_name".to_string()))?;
        let behavior = self
            .resolve(requested)
            .ok_or_else(|| AgentError::InvalidDecision(format!("unknown behavior: {requested}")))?;

        self.actuator.set_behavior(behavior).await?;
        with_affect(&self.affect, |a| a.on_behavior(behavior));
        tracing::info!(behavior, "behavior changed");
        Ok(ctx.reaction_interval)
    }
}

/// 只观察不行动，等待指定秒数（1..=300）
pub struct ObserveAndWaitHandler {
    affect: SharedAffect,
}

impl ObserveAndWaitHandler {
    pub fn new(affect: SharedAffect) -> Self {
        Self { affect }
    }
}

#[async_trait]
impl ActionHandler for ObserveAndWaitHandler {
    fn name(&self) -> &str {
        "observe_and_wait"
    }

    fn description(&self) -> &str {
        "Do nothing visible and check again after duration_seconds."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "duration_seconds": { "type": "integer", "minimum": 1, "maximum": 300 }
            },
            "required": []
        })
    }

    fn effect(&self) -> EffectCategory {
        EffectCategory::None
    }

    async fn handle(
        &self,
        args: &Map<String, Value>,
        ctx: ActionContext<'_>,
    ) -> Result<Duration, AgentError> {
        let secs = clamped_secs(args, "duration_seconds", ctx.default_interval.as_secs(), 1, 300);
        with_affect(&self.affect, |a| a.on_observe_only(secs as f64));
        Ok(Duration::from_secs(secs))
    }
}

/// 说一句话并显示气泡
pub struct ShowDialogueHandler {
    ui: Arc<dyn UiSink>,
    affect: SharedAffect,
}

impl ShowDialogueHandler {
    pub fn new(ui: Arc<dyn UiSink>, affect: SharedAffect) -> Self {
        Self { ui, affect }
    }
}

#[async_trait]
impl ActionHandler for ShowDialogueHandler {
    fn name(&self) -> &str {
        "show_dialogue"
    }

    fn description(&self) -> &str {
        "Say something short to the user in a speech bubble."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "text": { "type": "string" },
                "duration_seconds": { "type": "integer", "minimum": 1, "maximum": 60 }
            },
            "required": ["text"]
        })
    }

    fn effect(&self) -> EffectCategory {
        EffectCategory::Ui
    }

    async fn handle(
        &self,
        args: &Map<String, Value>,
        ctx: ActionContext<'_>,
    ) -> Result<Duration, AgentError> {
        let text = str_arg(args, &["text"])
            .map(|t| sanitize_input(t, MAX_DIALOGUE_CHARS))
            .ok_or_else(|| AgentError::InvalidDecision("missing dialogue text".to_string()))?;
        let duration = clamped_secs(args, "duration_seconds", 6, 1, 60);

        self.ui.speak(&text);
        self.ui.show_bubble(&bubble_text(&text));
        with_affect(&self.affect, |a| a.on_dialogue());
        tracing::debug!(duration, "dialogue shown");
        Ok(ctx.reaction_interval)
    }
}

/// 把一条事实写进情景记忆，附带当前上下文
pub struct SaveEpisodicMemoryHandler {
    memory: Arc<MemoryStore>,
}

impl SaveEpisodicMemoryHandler {
    pub fn new(memory: Arc<MemoryStore>) -> Self {
        Self { memory }
    }
}

/// 字符串形式的 metadata 先按 JSON 解析，失败则包成 {"note": ...}
fn normalize_metadata(raw: Option<&Value>) -> Map<String, Value> {
    match raw {
        Some(Value::Object(map)) => map.clone(),
        Some(Value::String(s)) => match serde_json::from_str::<Value>(s) {
            Ok(Value::Object(map)) => map,
            _ => {
                let mut map = Map::new();
                map.insert("note".to_string(), Value::String(s.clone()));
                map
            }
        },
        Some(Value::Null) | None => Map::new(),
        Some(other) => {
            let mut map = Map::new();
            map.insert("note".to_string(), other.clone());
            map
        }
    }
}

#[async_trait]
impl ActionHandler for SaveEpisodicMemoryHandler {
    fn name(&self) -> &str {
        "save_episodic_memory"
    }

    fn description(&self) -> &str {
        "Remember a fact about the user for later conversations."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "fact": { "type": "string" },
                "metadata": { "type": "object" }
            },
            "required": ["fact"]
        })
    }

    fn effect(&self) -> EffectCategory {
        EffectCategory::Memory
    }

    async fn handle(
        &self,
        args: &Map<String, Value>,
        ctx: ActionContext<'_>,
    ) -> Result<Duration, AgentError> {
        let fact = str_arg(args, &["fact"])
            .ok_or_else(|| AgentError::InvalidDecision("missing fact".to_string()))?;
        let mut metadata = normalize_metadata(args.get("metadata"));
        if let Some(c) = ctx.context {
            metadata.insert(
                "context".to_string(),
                json!({ "application": c.application, "window_title": c.window_title }),
            );
        }
        self.memory
            .remember("fact", fact, Value::Object(metadata))
            .await?;
        Ok(ctx.reaction_interval)
    }
}

/// 查询化身状态并在气泡里报告
pub struct CheckActuatorStatusHandler {
    actuator: Arc<ResilientActuatorClient>,
    ui: Arc<dyn UiSink>,
}

impl CheckActuatorStatusHandler {
    pub fn new(actuator: Arc<ResilientActuatorClient>, ui: Arc<dyn UiSink>) -> Self {
        Self { actuator, ui }
    }
}

#[async_trait]
impl ActionHandler for CheckActuatorStatusHandler {
    fn name(&self) -> &str {
        "check_actuator_status"
    }

    fn description(&self) -> &str {
        "Check what the mascot is currently doing and tell the user."
    }

    fn effect(&self) -> EffectCategory {
        EffectCategory::Ui
    }

    async fn handle(
        &self,
        _args: &Map<String, Value>,
        ctx: ActionContext<'_>,
    ) -> Result<Duration, AgentError> {
        let report = match self.actuator.query_status().await {
            Ok(Some(behavior)) => format!("I'm currently doing: {behavior}"),
            Ok(None) => "I can't find myself on the screen right now.".to_string(),
            Err(e) => {
                tracing::debug!("status query failed: {}", e);
                "I can't feel my body right now, the mascot engine is not answering.".to_string()
            }
        };
        self.ui.show_bubble(&report);
        Ok(ctx.reaction_interval)
    }
}

/// 在化身头顶显示一条短消息（走控制面，不走 UI）
pub struct PushMessageHandler {
    actuator: Arc<ResilientActuatorClient>,
}

impl PushMessageHandler {
    pub fn new(actuator: Arc<ResilientActuatorClient>) -> Self {
        Self { actuator }
    }
}

#[async_trait]
impl ActionHandler for PushMessageHandler {
    fn name(&self) -> &str {
        "push_message"
    }

    fn description(&self) -> &str {
        "Show a short transient message right above the mascot."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "text": { "type": "string" },
                "duration_seconds": { "type": "integer", "minimum": 1, "maximum": 60 }
            },
            "required": ["text"]
        })
    }

    fn effect(&self) -> EffectCategory {
        EffectCategory::Actuator
    }

    async fn handle(
        &self,
        args: &Map<String, Value>,
        ctx: ActionContext<'_>,
    ) -> Result<Duration, AgentError> {
        let text = str_arg(args, &["text"])
            .map(|t| sanitize_input(t, MAX_DIALOGUE_CHARS))
            .ok_or_else(|| AgentError::InvalidDecision("missing message text".to_string()))?;
        let duration = clamped_secs(args, "duration_seconds", 6, 1, 60);
        self.actuator.push_message(&text, duration).await?;
        Ok(ctx.reaction_interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamped_secs() {
        let args: Map<String, Value> =
            serde_json::from_value(json!({"a": 1000, "b": "0", "c": "x", "d": 12.6})).unwrap();
        assert_eq!(clamped_secs(&args, "a", 45, 1, 300), 300);
        assert_eq!(clamped_secs(&args, "b", 45, 1, 300), 1);
        assert_eq!(clamped_secs(&args, "c", 45, 1, 300), 45);
        assert_eq!(clamped_secs(&args, "d", 45, 1, 300), 13);
        assert_eq!(clamped_secs(&args, "missing", 6, 1, 60), 6);
    }

    #[test]
    fn test_normalize_metadata() {
        assert_eq!(
            normalize_metadata(Some(&json!("{\"mood\": \"happy\"}")))["mood"],
            "happy"
        );
        assert_eq!(normalize_metadata(Some(&json!("just a note")))["note"], "just a note");
        assert!(normalize_metadata(None).is_empty());
    }
}
