//! 编排器构建器：统一的初始化逻辑
//!
//! 守护进程与测试共用同一套组装流程；各个外部依赖（LLM、控制面传输、UI、上下文来源）都可以替换。
//! 启动阶段唯一的致命错误是情景库无法打开。

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::actuator::{
    build_vocabulary, ActuatorSettings, ActuatorTransport, HttpTransport, ResilientActuatorClient,
};
use crate::brain::{load_system_prompt, ReasoningClient, ReasoningRole};
use crate::config::{load_config, AppConfig};
use crate::core::{
    AffectState, AgentError, EventBus, Orchestrator, OrchestratorParts, OrchestratorSettings,
    RateLimiter,
};
use crate::executor::{
    ActionRegistry, CheckActuatorStatusHandler, DecisionExecutor, ObserveAndWaitHandler,
    PushMessageHandler, SaveEpisodicMemoryHandler, SetBehaviorHandler, SharedAffect,
    ShowDialogueHandler,
};
use crate::llm::{create_embedder_from_config, create_llm_from_config, EmbeddingProvider, LlmClient};
use crate::memory::{MemoryStore, SemanticIndex, SqliteEpisodicStore};
use crate::observability::Metrics;
use crate::sensors::ContextSource;
use crate::ui::{LogUiSink, UiSink};

pub struct OrchestratorBuilder {
    config: AppConfig,
    proactive_llm: Option<Arc<dyn LlmClient>>,
    reactive_llm: Option<Arc<dyn LlmClient>>,
    transport: Option<Arc<dyn ActuatorTransport>>,
    ui: Option<Arc<dyn UiSink>>,
    episodic: Option<SqliteEpisodicStore>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    context_source: Option<Arc<dyn ContextSource>>,
}

impl OrchestratorBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            proactive_llm: None,
            reactive_llm: None,
            transport: None,
            ui: None,
            episodic: None,
            embedder: None,
            context_source: None,
        }
    }

    /// 两个推理角色共用同一个后端
    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.proactive_llm = Some(llm.clone());
        self.reactive_llm = Some(llm);
        self
    }

    pub fn with_proactive_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.proactive_llm = Some(llm);
        self
    }

    pub fn with_reactive_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.reactive_llm = Some(llm);
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn ActuatorTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_ui(mut self, ui: Arc<dyn UiSink>) -> Self {
        self.ui = Some(ui);
        self
    }

    /// 使用已打开的情景库（测试中传入内存库）
    pub fn with_episodic_store(mut self, store: SqliteEpisodicStore) -> Self {
        self.episodic = Some(store);
        self
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn with_context_source(mut self, source: Arc<dyn ContextSource>) -> Self {
        self.context_source = Some(source);
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    fn build_llm(&self, role: ReasoningRole) -> Arc<dyn LlmClient> {
        let (explicit, model) = match role {
            ReasoningRole::Proactive => (&self.proactive_llm, &self.config.llm.proactive_model),
            ReasoningRole::Reactive => (&self.reactive_llm, &self.config.llm.reactive_model),
        };
        explicit
            .clone()
            .unwrap_or_else(|| create_llm_from_config(&self.config, model.as_deref()))
    }

    fn build_actuator(&self) -> Result<Arc<ResilientActuatorClient>, AgentError> {
        let transport: Arc<dyn ActuatorTransport> = match &self.transport {
            Some(t) => t.clone(),
            None => Arc::new(
                HttpTransport::new(
                    &self.config.actuator.base_url,
                    Duration::from_millis(self.config.actuator.request_timeout_ms),
                )
                .map_err(|e| AgentError::Fatal(format!("actuator transport: {e}")))?,
            ),
        };
        Ok(Arc::new(ResilientActuatorClient::new(
            transport,
            ActuatorSettings::from(&self.config.actuator),
        )))
    }

    fn build_memory(&mut self) -> Result<Arc<MemoryStore>, AgentError> {
        let cfg = &self.config.memory;
        let mut store = match self.episodic.take() {
            Some(episodic) => MemoryStore::new(cfg.working_capacity, episodic),
            None => MemoryStore::open(cfg, &self.config.db_path())
                .map_err(|e| AgentError::Fatal(format!("cannot open episodic store: {e}")))?,
        };
        if cfg.semantic_index {
            let embedder = self.embedder.clone().or_else(|| {
                create_embedder_from_config(
                    self.config.llm.base_url.as_deref(),
                    &self.config.llm.embedding_model,
                )
            });
            match embedder {
                Some(e) => {
                    store = store.with_semantic_index(SemanticIndex::new(e, cfg.semantic_max_entries))
                }
                None => tracing::warn!("semantic index enabled but no embedder available"),
            }
        }
        Ok(Arc::new(store))
    }

    /// 行为词表：配置 + 控制面上实例当前的行为；控制面不可达时只用配置
    async fn fetch_vocabulary(&self, actuator: &ResilientActuatorClient) -> Vec<String> {
        let observed: Vec<String> = match actuator.list_instances(true).await {
            Ok(instances) => instances
                .into_iter()
                .filter_map(|i| i.active_behavior)
                .collect(),
            Err(e) => {
                tracing::warn!("actuator not reachable at startup: {}", e);
                Vec::new()
            }
        };
        let vocabulary =
            build_vocabulary(&self.config.actuator.behaviors, observed.iter().map(String::as_str));
        tracing::info!(behaviors = vocabulary.len(), "behavior vocabulary loaded");
        vocabulary
    }

    /// 构建动作注册表（显式注册全部内置动作）
    pub fn build_registry(
        actuator: Arc<ResilientActuatorClient>,
        memory: Arc<MemoryStore>,
        ui: Arc<dyn UiSink>,
        affect: SharedAffect,
        vocabulary: Vec<String>,
    ) -> ActionRegistry {
        let mut registry = ActionRegistry::new();
        registry.register(SetBehaviorHandler::new(
            actuator.clone(),
            vocabulary,
            affect.clone(),
        ));
        registry.register(ObserveAndWaitHandler::new(affect.clone()));
        registry.register(ShowDialogueHandler::new(ui.clone(), affect));
        registry.register(SaveEpisodicMemoryHandler::new(memory));
        registry.register(CheckActuatorStatusHandler::new(actuator.clone(), ui));
        registry.register(PushMessageHandler::new(actuator));
        registry
    }

    fn build_reasoning_client(
        &self,
        role: ReasoningRole,
        tools_section: &str,
        metrics: &Arc<Metrics>,
    ) -> ReasoningClient {
        let window = match role {
            ReasoningRole::Proactive => self.config.rate_limit.proactive,
            ReasoningRole::Reactive => self.config.rate_limit.reactive,
        };
        ReasoningClient::new(
            role,
            self.build_llm(role),
            Arc::new(RateLimiter::new(window.max_calls, window.window())),
            Duration::from_secs(self.config.llm.timeouts.request),
        )
        .with_system_prompt(load_system_prompt(role))
        .with_tools_section(tools_section)
        .with_metrics(metrics.clone())
    }

    /// 组装编排器（未启动后台任务，调用方随后调用 start）
    pub async fn build(mut self) -> Result<Arc<Orchestrator>, AgentError> {
        let settings = OrchestratorSettings::from(&self.config);
        let metrics = Arc::new(Metrics::new());
        let memory = self.build_memory()?;
        let actuator = self.build_actuator()?;
        let ui: Arc<dyn UiSink> = self.ui.clone().unwrap_or_else(|| Arc::new(LogUiSink));
        let affect: SharedAffect = Arc::new(Mutex::new(AffectState::new()));

        let vocabulary = self.fetch_vocabulary(&actuator).await;
        let registry = Self::build_registry(
            actuator.clone(),
            memory.clone(),
            ui.clone(),
            affect.clone(),
            vocabulary,
        );
        let tools_section = registry.to_schema_json();
        let proactive = self.build_reasoning_client(ReasoningRole::Proactive, &tools_section, &metrics);
        let reactive = self.build_reasoning_client(ReasoningRole::Reactive, &tools_section, &metrics);
        let executor = DecisionExecutor::new(
            registry,
            memory.clone(),
            settings.proactive_interval,
            settings.reaction_interval,
        )
        .with_metrics(metrics.clone());

        let parts = OrchestratorParts {
            proactive,
            reactive,
            executor,
            memory,
            actuator,
            ui,
            bus: Arc::new(EventBus::new()),
            affect,
            metrics,
            context_source: self.context_source.take(),
        };
        Ok(Orchestrator::new(parts, settings))
    }
}

/// 加载配置；失败时记录警告并使用默认值
pub fn load_config_or_default(config_path: Option<PathBuf>) -> AppConfig {
    load_config(config_path).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    })
}

/// 便捷函数：从配置文件创建编排器
pub async fn create_orchestrator(
    config_path: Option<PathBuf>,
) -> Result<Arc<Orchestrator>, AgentError> {
    OrchestratorBuilder::new(load_config_or_default(config_path))
        .build()
        .await
}
