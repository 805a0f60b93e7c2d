//! 决策执行器
//!
//! 持有 ActionRegistry，execute(decision) 在注册表中查找动作并分发；未注册的动作直接拒绝，
//! 不产生任何副作用。每次调用输出结构化审计日志（JSON），返回值是下一次轮询间隔。
//! 错误在这里被吸收：非法决策回到默认间隔，其它失败用较短的反应间隔重新检查。

pub mod handlers;
pub mod registry;

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Map, Value};

use crate::brain::Decision;
use crate::core::{AgentError, Context};
use crate::memory::{EntryKind, MemoryStore};
use crate::observability::Metrics;

pub use handlers::{
    CheckActuatorStatusHandler, ObserveAndWaitHandler, PushMessageHandler,
    SaveEpisodicMemoryHandler, SetBehaviorHandler, SharedAffect, ShowDialogueHandler,
};
pub use registry::{ActionContext, ActionHandler, ActionRegistry, EffectCategory};

pub struct DecisionExecutor {
    registry: ActionRegistry,
    memory: Arc<MemoryStore>,
    default_interval: Duration,
    reaction_interval: Duration,
    metrics: Arc<Metrics>,
}

impl DecisionExecutor {
    pub fn new(
        registry: ActionRegistry,
        memory: Arc<MemoryStore>,
        default_interval: Duration,
        reaction_interval: Duration,
    ) -> Self {
        Self {
            registry,
            memory,
            default_interval,
            reaction_interval,
            metrics: Arc::new(Metrics::new()),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn registry(&self) -> &ActionRegistry {
        &self.registry
    }

    pub fn default_interval(&self) -> Duration {
        self.default_interval
    }

    pub fn reaction_interval(&self) -> Duration {
        self.reaction_interval
    }

    /// 执行一条决策并返回下一次轮询间隔；从不返回错误
    ///
    /// 调用方须持有模式锁，保证同一时刻只有一条决策在作用于化身。
    pub async fn execute(&self, decision: Decision, context: Option<&Context>) -> Duration {
        let start = Instant::now();
        let preview = args_preview(&decision.arguments);

        let Some(handler) = self.registry.get(&decision.action) else {
            tracing::warn!(action = %decision.action, "unknown action rejected");
            Metrics::incr(&self.metrics.decisions_failed);
            emit_audit(&decision.action, false, "unknown_action", None, start, &preview);
            return self.default_interval;
        };

        self.memory.record(
            EntryKind::Action,
            json!({
                "action": decision.action,
                "args": Value::Object(decision.arguments.clone()),
                "rationale": decision.rationale,
            }),
        );

        let ctx = ActionContext {
            context,
            default_interval: self.default_interval,
            reaction_interval: self.reaction_interval,
        };
        let result = handler.handle(&decision.arguments, ctx).await;
        let effect = handler.effect();

        match result {
            Ok(interval) => {
                Metrics::incr(&self.metrics.decisions_executed);
                emit_audit(&decision.action, true, "ok", Some(effect), start, &preview);
                interval
            }
            Err(e) => {
                Metrics::incr(&self.metrics.decisions_failed);
                let outcome = match &e {
                    AgentError::InvalidDecision(_) => "invalid",
                    _ => "error",
                };
                emit_audit(&decision.action, false, outcome, Some(effect), start, &preview);
                tracing::warn!(action = %decision.action, "action failed: {}", e);
                match e {
                    AgentError::InvalidDecision(_) => self.default_interval,
                    _ => self.reaction_interval,
                }
            }
        }
    }
}

fn emit_audit(
    action: &str,
    ok: bool,
    outcome: &str,
    effect: Option<EffectCategory>,
    start: Instant,
    args_preview: &str,
) {
    let audit = json!({
        "event": "decision_audit",
        "action": action,
        "ok": ok,
        "outcome": outcome,
        "effect": effect,
        "duration_ms": start.elapsed().as_millis() as u64,
        "args_preview": args_preview,
    });
    tracing::info!(audit = %audit.to_string(), "decision");
}

fn args_preview(args: &Map<String, Value>) -> String {
    let s = Value::Object(args.clone()).to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::actuator::{
        ActuatorSettings, Method, MockActuator, ResilientActuatorClient, ScriptedReply,
    };
    use crate::core::AffectState;
    use crate::memory::SqliteEpisodicStore;
    use crate::ui::{RecordingUiSink, UiEvent};

    struct Fixture {
        executor: DecisionExecutor,
        mock: Arc<MockActuator>,
        ui: Arc<RecordingUiSink>,
        memory: Arc<MemoryStore>,
    }

    fn fixture() -> Fixture {
        let mock = Arc::new(MockActuator::with_instance("1"));
        let actuator = Arc::new(ResilientActuatorClient::new(
            mock.clone(),
            ActuatorSettings::default(),
        ));
        let ui = Arc::new(RecordingUiSink::default());
        let memory = Arc::new(MemoryStore::new(
            20,
            SqliteEpisodicStore::open_in_memory().unwrap(),
        ));
        let affect: SharedAffect = Arc::new(Mutex::new(AffectState::default()));

        let mut registry = ActionRegistry::new();
        registry.register(SetBehaviorHandler::new(
            actuator.clone(),
            vec!["Walk".into(), "Sit".into(), "Sleep".into()],
            affect.clone(),
        ));
        registry.register(ObserveAndWaitHandler::new(affect.clone()));
        registry.register(ShowDialogueHandler::new(ui.clone(), affect));
        registry.register(SaveEpisodicMemoryHandler::new(memory.clone()));
        registry.register(CheckActuatorStatusHandler::new(actuator.clone(), ui.clone()));
        registry.register(PushMessageHandler::new(actuator));

        let executor = DecisionExecutor::new(
            registry,
            memory.clone(),
            Duration::from_secs(45),
            Duration::from_secs(10),
        );
        Fixture {
            executor,
            mock,
            ui,
            memory,
        }
    }

    #[tokio::test]
    async fn test_unknown_action_has_no_side_effects() {
        let f = fixture();
        let next = f
            .executor
            .execute(Decision::new("launch_rockets"), None)
            .await;
        assert_eq!(next, Duration::from_secs(45));
        assert!(f.mock.calls().is_empty());
        assert_eq!(f.memory.working_len(), 0);
        assert!(f.ui.events().is_empty());
    }

    #[tokio::test]
    async fn test_set_behavior_validates_vocabulary_case_insensitively() {
        let f = fixture();
        let next = f
            .executor
            .execute(Decision::new("set_behavior").arg("behavior_name", json!("sleep")), None)
            .await;
        assert_eq!(next, Duration::from_secs(10));
        assert_eq!(f.mock.active_behavior("1").as_deref(), Some("Sleep"));

        let before = f.mock.mutation_count();
        let next = f
            .executor
            .execute(Decision::new("set_behavior").arg("behavior_name", json!("Fly")), None)
            .await;
        assert_eq!(next, Duration::from_secs(45));
        assert_eq!(f.mock.mutation_count(), before);
    }

    #[tokio::test]
    async fn test_observe_and_wait_clamps_duration() {
        let f = fixture();
        let long = f
            .executor
            .execute(Decision::new("observe_and_wait").arg("duration_seconds", json!(9999)), None)
            .await;
        assert_eq!(long, Duration::from_secs(300));
        let default = f.executor.execute(Decision::new("observe_and_wait"), None).await;
        assert_eq!(default, Duration::from_secs(45));
        assert!(f.mock.calls().is_empty());
    }

    #[tokio::test]
    async fn test_show_dialogue_speaks_and_shows_bubble() {
        let f = fixture();
        f.executor
            .execute(Decision::new("show_dialogue").arg("text", json!("Hi there")), None)
            .await;
        let events = f.ui.events();
        assert_eq!(events[0], UiEvent::Speak("Hi there".into()));
        assert_eq!(events[1], UiEvent::Bubble("Hi there".into()));
        assert_eq!(f.mock.mutation_count(), 0);
    }

    #[tokio::test]
    async fn test_save_episodic_memory_attaches_context() {
        let f = fixture();
        let ctx = Context::new("editor", "notes.md");
        f.executor
            .execute(
                Decision::new("save_episodic_memory")
                    .arg("fact", json!("user likes tea"))
                    .arg("metadata", json!("{\"source\": \"chat\"}")),
                Some(&ctx),
            )
            .await;
        let found = f.memory.recall("tea", 5).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].metadata["source"], "chat");
        assert_eq!(found[0].metadata["context"]["application"], "editor");
    }

    #[tokio::test(start_paused = true)]
    async fn test_actuator_failure_returns_reaction_interval() {
        let f = fixture();
        f.mock
            .push_reply_for(Method::Get, ScriptedReply::ConnectionError);
        let next = f
            .executor
            .execute(Decision::new("set_behavior").arg("behavior_name", json!("Walk")), None)
            .await;
        assert_eq!(next, Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_known_action_is_recorded_before_dispatch() {
        let f = fixture();
        f.executor
            .execute(Decision::new("observe_and_wait").arg("duration_seconds", json!(5)), None)
            .await;
        let actions = f.memory.recent_actions(5);
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].payload["action"], "observe_and_wait");
    }
}
