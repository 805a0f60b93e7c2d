//! 双模式编排器
//!
//! 负责：模式状态机（Proactive ⇄ Reactive）、主动循环、按需请求队列、严重告警拦截、
//! 后台任务（记忆清理、上下文轮询）以及有界的优雅关闭。
//!
//! 唯一的硬性互斥约束：同一时刻最多一个回合（主动 tick / 按需请求 / 严重告警）在作用于化身。
//! 三条路径都先在各自的 RateLimiter 上完成准入，再获取同一把 tokio Mutex（FIFO 公平）；
//! 等锁与等准入都可被关闭信号打断。回合内的错误在回合边界被 RecoveryEngine 吸收。

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use futures_util::future::join_all;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, Mutex, MutexGuard, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::actuator::ResilientActuatorClient;
use crate::brain::{Decision, ReasoningClient, ReasoningOutput, ReasoningRequest};
use crate::config::AppConfig;
use crate::core::event_bus::{Event, EventBus, EventKind, SubscriptionId};
use crate::core::shutdown::{
    ActuatorCleanup, MemoryStoreCleanup, ShutdownCoordinator, ShutdownManager, ShutdownReason,
};
use crate::core::{
    AgentError, Context, KeyedRateLimiter, LatestContext, Mode, Phase, PhaseCell, RecoveryEngine,
    TurnRecovery,
};
use crate::executor::{DecisionExecutor, SharedAffect};
use crate::memory::{ConversationMemory, EntryKind, MemoryStore};
use crate::observability::Metrics;
use crate::sensors::{sanitize_input, AlertEvent, ContextSource, MAX_INPUT_CHARS};
use crate::ui::{bubble_text, UiSink};

/// 对话历史保留的轮数（只在一次按需会话内有效）
const CONVERSATION_TURNS: usize = 10;
const WORKING_MEMORY_IN_PROMPT: usize = 10;
const RECALL_LIMIT: usize = 3;
const RECENT_ACTIONS_IN_PROMPT: usize = 5;
const DROPPED_TEXT_CHARS: usize = 2000;

/// 编排参数（由配置转换）
#[derive(Clone, Debug)]
pub struct OrchestratorSettings {
    pub proactive_interval: Duration,
    pub reaction_interval: Duration,
    pub failure_backoff: Duration,
    pub idle_grace: Duration,
    pub reactive_queue_warn_depth: usize,
    pub shutdown_timeout: Duration,
    /// None 表示不轮询 ContextSource
    pub context_poll_interval: Option<Duration>,
    pub cleanup_interval: Duration,
    pub retention_days: i64,
    pub alert_max_calls: usize,
    pub alert_window: Duration,
}

impl From<&AppConfig> for OrchestratorSettings {
    fn from(cfg: &AppConfig) -> Self {
        let o = &cfg.orchestrator;
        Self {
            proactive_interval: Duration::from_secs(o.proactive_interval_secs.max(1)),
            reaction_interval: Duration::from_secs(o.reaction_interval_secs.max(1)),
            failure_backoff: Duration::from_secs(o.failure_backoff_secs.clamp(1, 300)),
            idle_grace: Duration::from_millis(o.idle_grace_ms),
            reactive_queue_warn_depth: o.reactive_queue_warn_depth,
            shutdown_timeout: Duration::from_secs(o.shutdown_timeout_secs),
            context_poll_interval: (o.context_poll_interval_secs > 0)
                .then(|| Duration::from_secs(o.context_poll_interval_secs)),
            cleanup_interval: Duration::from_secs(cfg.memory.cleanup_interval_secs.max(1)),
            retention_days: cfg.memory.retention_days,
            alert_max_calls: cfg.rate_limit.alert.max_calls,
            alert_window: cfg.rate_limit.alert.window(),
        }
    }
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

/// 构建编排器所需的全部组件
pub struct OrchestratorParts {
    pub proactive: ReasoningClient,
    pub reactive: ReasoningClient,
    pub executor: DecisionExecutor,
    pub memory: Arc<MemoryStore>,
    pub actuator: Arc<ResilientActuatorClient>,
    pub ui: Arc<dyn UiSink>,
    pub bus: Arc<EventBus>,
    pub affect: SharedAffect,
    pub metrics: Arc<Metrics>,
    pub context_source: Option<Arc<dyn ContextSource>>,
}

/// 模式锁保护的状态
#[derive(Debug)]
struct ModeState {
    mode: Mode,
    /// 按需会话开始时置位；回到主动模式后的第一次 tick 跳过并清除
    skip_next_tick: bool,
}

struct ReactiveRequest {
    prompt: String,
    reply: oneshot::Sender<String>,
}

pub struct Orchestrator {
    settings: OrchestratorSettings,
    mode: Mutex<ModeState>,
    phase: PhaseCell,
    latest: LatestContext,
    proactive: ReasoningClient,
    reactive: ReasoningClient,
    executor: DecisionExecutor,
    recovery: RecoveryEngine,
    memory: Arc<MemoryStore>,
    actuator: Arc<ResilientActuatorClient>,
    ui: Arc<dyn UiSink>,
    bus: Arc<EventBus>,
    affect: SharedAffect,
    metrics: Arc<Metrics>,
    context_source: Option<Arc<dyn ContextSource>>,
    conversation: StdMutex<ConversationMemory>,
    alert_throttle: KeyedRateLimiter,
    reactive_tx: mpsc::UnboundedSender<ReactiveRequest>,
    reactive_rx: StdMutex<Option<mpsc::UnboundedReceiver<ReactiveRequest>>>,
    alert_tx: mpsc::UnboundedSender<AlertEvent>,
    alert_rx: StdMutex<Option<mpsc::UnboundedReceiver<AlertEvent>>>,
    queue_depth: AtomicUsize,
    wake: Notify,
    shutdown: Arc<ShutdownManager>,
    token: CancellationToken,
    cleanup: ShutdownCoordinator,
    stopping: AtomicBool,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
    subscriptions: StdMutex<Vec<SubscriptionId>>,
    started_at: Instant,
}

impl Orchestrator {
    pub fn new(parts: OrchestratorParts, settings: OrchestratorSettings) -> Arc<Self> {
        let shutdown = Arc::new(ShutdownManager::new());
        let mut cleanup = ShutdownCoordinator::new().with_timeout(settings.shutdown_timeout);
        cleanup.register(MemoryStoreCleanup::new(parts.memory.clone()));
        cleanup.register(ActuatorCleanup::new(parts.actuator.clone()));

        let (reactive_tx, reactive_rx) = mpsc::unbounded_channel();
        let (alert_tx, alert_rx) = mpsc::unbounded_channel();

        Arc::new(Self {
            recovery: RecoveryEngine::new(settings.proactive_interval, settings.failure_backoff),
            alert_throttle: KeyedRateLimiter::new(settings.alert_max_calls, settings.alert_window),
            mode: Mutex::new(ModeState {
                mode: Mode::Proactive,
                skip_next_tick: false,
            }),
            phase: PhaseCell::new(Phase::Starting),
            latest: LatestContext::new(),
            proactive: parts.proactive,
            reactive: parts.reactive,
            executor: parts.executor,
            memory: parts.memory,
            actuator: parts.actuator,
            ui: parts.ui,
            bus: parts.bus,
            affect: parts.affect,
            metrics: parts.metrics,
            context_source: parts.context_source,
            conversation: StdMutex::new(ConversationMemory::new(CONVERSATION_TURNS)),
            reactive_tx,
            reactive_rx: StdMutex::new(Some(reactive_rx)),
            alert_tx,
            alert_rx: StdMutex::new(Some(alert_rx)),
            queue_depth: AtomicUsize::new(0),
            wake: Notify::new(),
            token: shutdown.token(),
            shutdown,
            cleanup,
            stopping: AtomicBool::new(false),
            tasks: StdMutex::new(Vec::new()),
            subscriptions: StdMutex::new(Vec::new()),
            started_at: Instant::now(),
            settings,
        })
    }

    /// 启动后台任务并进入 Proactive；重复调用是空操作
    pub fn start(self: &Arc<Self>) {
        let (Some(reactive_rx), Some(alert_rx)) = (
            lock(&self.reactive_rx).take(),
            lock(&self.alert_rx).take(),
        ) else {
            tracing::debug!("orchestrator already started");
            return;
        };

        self.subscribe_bus();

        let mut tasks = vec![
            tokio::spawn(Arc::clone(self).reactive_worker(reactive_rx)),
            tokio::spawn(Arc::clone(self).alert_worker(alert_rx)),
            tokio::spawn(Arc::clone(self).proactive_loop()),
            tokio::spawn(Arc::clone(self).cleanup_loop()),
        ];
        if let (Some(source), Some(every)) =
            (self.context_source.clone(), self.settings.context_poll_interval)
        {
            tasks.push(tokio::spawn(Arc::clone(self).context_poll_loop(source, every)));
        }
        lock(&self.tasks).extend(tasks);

        if self.phase.get() == Phase::Starting {
            self.phase.set(Phase::Proactive);
        }
        tracing::info!("Orchestrator started in proactive mode");
    }

    pub fn mode(&self) -> Option<Mode> {
        self.phase.get().mode()
    }

    pub fn phase(&self) -> Phase {
        self.phase.get()
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn shutdown_manager(&self) -> &Arc<ShutdownManager> {
        &self.shutdown
    }

    pub fn latest_context(&self) -> Option<Context> {
        self.latest.snapshot()
    }

    pub fn reactive_queue_depth(&self) -> usize {
        self.queue_depth.load(Ordering::SeqCst)
    }

    // ------------------------------------------------------------------
    // 上下文与传感器输入

    /// 合并一条上下文；时间戳早于当前值的更新被丢弃，返回是否接受
    pub fn update_context(&self, ctx: Context) -> bool {
        let Some(version) = self.latest.update(ctx.clone()) else {
            tracing::debug!(timestamp = %ctx.timestamp, "stale context discarded");
            return false;
        };
        self.memory.record(
            EntryKind::Observation,
            json!({
                "application": ctx.application,
                "window_title": ctx.window_title,
                "tags": Value::Object(ctx.tags.clone()),
            }),
        );
        Metrics::incr(&self.metrics.context_updates);
        tracing::debug!(version, app = %ctx.application, "context updated");
        self.bus.publish(&Event::ContextChanged(ctx));
        self.wake.notify_one();
        true
    }

    /// 文件拖放：写入工作记忆、合并进上下文标签并提前唤醒主动循环
    pub fn handle_file_drop(&self, path: Option<String>, text: Option<String>) {
        let text = text.map(|t| sanitize_input(&t, DROPPED_TEXT_CHARS));
        let payload = json!({ "path": path, "text": text });
        self.memory.record(EntryKind::FileDrop, payload.clone());
        self.latest.merge_tag("dropped_file", payload);
        tracing::info!(path = ?path, "file dropped");
        self.wake.notify_one();
    }

    fn subscribe_bus(self: &Arc<Self>) {
        let mut ids = Vec::new();

        let ui = self.ui.clone();
        let alert_tx = self.alert_tx.clone();
        ids.push(self.bus.subscribe(EventKind::Alert, move |event| {
            if let Event::Alert(alert) = event {
                if alert.is_critical() {
                    alert_tx
                        .send(alert.clone())
                        .map_err(|_| anyhow::anyhow!("alert worker stopped"))?;
                } else {
                    ui.show_bubble(&alert.notification());
                }
            }
            Ok(())
        }));

        let weak: Weak<Self> = Arc::downgrade(self);
        ids.push(self.bus.subscribe(EventKind::FileDropped, move |event| {
            if let (Event::FileDropped { path, text }, Some(this)) = (event, weak.upgrade()) {
                this.handle_file_drop(path.clone(), text.clone());
            }
            Ok(())
        }));

        let weak: Weak<Self> = Arc::downgrade(self);
        ids.push(self.bus.subscribe(EventKind::PatternDetected, move |event| {
            if let (Event::PatternDetected { pattern, details }, Some(this)) =
                (event, weak.upgrade())
            {
                this.memory.record(
                    EntryKind::Observation,
                    json!({ "pattern": pattern, "details": details }),
                );
                this.wake.notify_one();
            }
            Ok(())
        }));

        lock(&self.subscriptions).extend(ids);
    }

    // ------------------------------------------------------------------
    // 主动路径

    /// 主动回合；返回下一次轮询间隔，从不失败
    pub async fn tick(&self) -> Duration {
        match self.try_tick().await {
            Ok(next) => next,
            Err(e) => match self.recovery.handle(&e) {
                TurnRecovery::Backoff(next) => {
                    tracing::warn!(next_secs = next.as_secs(), "proactive tick failed: {}", e);
                    next
                }
                TurnRecovery::Skip(next) => {
                    tracing::info!("proactive tick skipped: {}", e);
                    next
                }
                TurnRecovery::Abort => {
                    tracing::debug!("proactive tick aborted: {}", e);
                    self.settings.proactive_interval
                }
            },
        }
    }

    async fn try_tick(&self) -> Result<Duration, AgentError> {
        let default = self.settings.proactive_interval;
        if self.phase.get() == Phase::Reactive {
            return Ok(default);
        }

        // 先在锁内确认本回合确实要调用后端，再去占用限流预算
        if skip_tick(&mut *self.lock_mode().await?) {
            return Ok(default);
        }
        self.admit(&self.proactive).await?;
        let mut state = self.lock_mode().await?;
        // 等待准入期间可能插入了一次按需会话
        if skip_tick(&mut state) {
            return Ok(default);
        }

        let ctx = self.latest.snapshot();
        let mood = {
            let mut affect = lock(&*self.affect);
            affect.natural_decay();
            affect.snapshot()
        };
        let request = ReasoningRequest::new("Decide what to do next.")
            .section(ctx.as_ref().map(Context::to_prompt_section).unwrap_or_default())
            .section(self.memory.working_prompt_section(WORKING_MEMORY_IN_PROMPT))
            .section(mood.to_prompt_section())
            .section(self.recall_section(ctx.as_ref()).await)
            .section(self.recent_actions_section());

        let output = self.decide(&self.proactive, &request).await?;
        let decisions = if output.decisions.is_empty() {
            vec![Decision::new("observe_and_wait")
                .arg("duration_seconds", json!(default.as_secs()))]
        } else {
            output.decisions
        };
        let next = self.execute_decisions(decisions, ctx.as_ref()).await;
        drop(state);
        Ok(next)
    }

    async fn proactive_loop(self: Arc<Self>) {
        let mut interval = self.settings.proactive_interval;
        loop {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(interval) => {}
            }
            if self.token.is_cancelled() {
                break;
            }
            interval = self.tick().await;
        }
        tracing::debug!("proactive loop stopped");
    }

    // ------------------------------------------------------------------
    // 按需路径

    /// 提交一条按需请求并等待回复；请求按 FIFO 顺序处理，总会得到一段回复文本
    pub async fn enter_reactive(&self, prompt: &str) -> String {
        if self.stopping.load(Ordering::SeqCst) {
            return self.recovery.apology(&AgentError::Cancelled);
        }
        let (reply, rx) = oneshot::channel();
        let depth = self.queue_depth.fetch_add(1, Ordering::SeqCst) + 1;
        if depth > self.settings.reactive_queue_warn_depth {
            tracing::warn!(depth, "reactive queue is getting deep");
        }
        let request = ReactiveRequest {
            prompt: prompt.to_string(),
            reply,
        };
        if self.reactive_tx.send(request).is_err() {
            self.queue_depth.fetch_sub(1, Ordering::SeqCst);
            return self.recovery.apology(&AgentError::Cancelled);
        }
        rx.await
            .unwrap_or_else(|_| self.recovery.apology(&AgentError::Cancelled))
    }

    async fn reactive_worker(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<ReactiveRequest>) {
        'outer: loop {
            let request = tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                r = rx.recv() => match r {
                    Some(r) => r,
                    None => break,
                },
            };
            self.process_reactive(request).await;

            // 空闲宽限期内到达的请求继续留在 Reactive
            loop {
                tokio::select! {
                    biased;
                    _ = self.token.cancelled() => break 'outer,
                    r = rx.recv() => match r {
                        Some(r) => self.process_reactive(r).await,
                        None => break 'outer,
                    },
                    _ = tokio::time::sleep(self.settings.idle_grace) => {
                        self.return_to_proactive().await;
                        break;
                    }
                }
            }
        }
        tracing::debug!("reactive worker stopped");
    }

    async fn process_reactive(&self, request: ReactiveRequest) {
        let ReactiveRequest { prompt, reply } = request;
        self.queue_depth.fetch_sub(1, Ordering::SeqCst);
        Metrics::incr(&self.metrics.reactive_requests);

        let answer = match self.reactive_turn(&prompt).await {
            Ok(answer) => answer,
            Err(e) => {
                tracing::warn!("reactive request failed: {}", e);
                self.recovery.apology(&e)
            }
        };
        self.ui.speak(&answer);
        self.ui.show_bubble(&bubble_text(&answer));
        if reply.send(answer).is_err() {
            tracing::debug!("reactive caller went away before the reply");
        }
    }

    async fn reactive_turn(&self, raw_prompt: &str) -> Result<String, AgentError> {
        let prompt = sanitize_input(raw_prompt, MAX_INPUT_CHARS);
        if prompt.is_empty() {
            return Err(AgentError::InvalidDecision("empty prompt".to_string()));
        }

        self.admit(&self.reactive).await?;
        let mut state = self.lock_mode().await?;
        if state.mode == Mode::Proactive {
            state.skip_next_tick = true;
            self.switch_mode(&mut state, Mode::Reactive);
        }

        self.ui.show_typing(true);
        let ctx = self.latest.snapshot();
        let history = lock(&self.conversation).messages().to_vec();
        let mood = lock(&*self.affect).snapshot();
        let request = ReasoningRequest::new(prompt.clone())
            .section(ctx.as_ref().map(Context::to_prompt_section).unwrap_or_default())
            .section(mood.to_prompt_section())
            .section(self.recall_section_for(&prompt).await)
            .history(history);
        let result = self.decide(&self.reactive, &request).await;
        self.ui.show_typing(false);
        let ReasoningOutput { decisions, text } = result?;

        let actions: Vec<String> = decisions.iter().map(|d| d.action.clone()).collect();
        self.execute_decisions(decisions, ctx.as_ref()).await;
        drop(state);

        let answer = match text {
            Some(text) => text,
            None if !actions.is_empty() => format!("Done: {}.", actions.join(", ")),
            None => "Hmm, I'm not sure what to say to that.".to_string(),
        };
        lock(&self.conversation).push_turn(prompt.clone(), answer.clone());
        self.memory.record(
            EntryKind::Dialogue,
            json!({ "user": prompt, "assistant": answer }),
        );
        Ok(answer)
    }

    async fn return_to_proactive(&self) {
        let Ok(mut state) = self.lock_mode().await else {
            return;
        };
        if state.mode == Mode::Reactive {
            self.switch_mode(&mut state, Mode::Proactive);
            lock(&self.conversation).clear();
        }
    }

    // ------------------------------------------------------------------
    // 告警路径

    /// 处理一条严重告警；按来源节流，返回是否经过了推理路径
    pub async fn handle_critical_alert(&self, alert: AlertEvent) -> bool {
        if !self.alert_throttle.try_acquire(&alert.source).await {
            Metrics::incr(&self.metrics.alerts_throttled);
            tracing::debug!(source = %alert.source, "critical alert throttled");
            self.ui.show_bubble(&alert.notification());
            return false;
        }
        Metrics::incr(&self.metrics.alerts_handled);
        match self.alert_turn(&alert).await {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(source = %alert.source, "failed to handle critical alert: {}", e);
                self.ui.show_bubble(&alert.notification());
                false
            }
        }
    }

    async fn alert_turn(&self, alert: &AlertEvent) -> Result<(), AgentError> {
        self.admit(&self.proactive).await?;
        let _state = self.lock_mode().await?;

        let alert_info = json!({
            "source": alert.source,
            "message": alert.message,
            "details": alert.details,
        });
        let ctx = self
            .latest
            .snapshot()
            .unwrap_or_else(|| Context::new("", ""))
            .with_tag("system_alert", alert_info.clone());
        self.memory.record(EntryKind::Alert, alert_info);

        let mood = lock(&*self.affect).snapshot();
        let request = ReasoningRequest::new(format!(
            "A critical system alert needs attention: {}",
            alert.message
        ))
        .section(ctx.to_prompt_section())
        .section(self.memory.working_prompt_section(WORKING_MEMORY_IN_PROMPT))
        .section(mood.to_prompt_section())
        .section(self.recall_section(Some(&ctx)).await);

        let output = self.decide(&self.proactive, &request).await?;
        if output.decisions.is_empty() {
            self.ui.show_bubble(&alert.notification());
        } else {
            self.execute_decisions(output.decisions, Some(&ctx)).await;
        }
        Ok(())
    }

    async fn alert_worker(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<AlertEvent>) {
        loop {
            let alert = tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                a = rx.recv() => match a {
                    Some(a) => a,
                    None => break,
                },
            };
            self.handle_critical_alert(alert).await;
        }
        tracing::debug!("alert worker stopped");
    }

    // ------------------------------------------------------------------
    // 后台任务

    async fn cleanup_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.settings.cleanup_interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match self.memory.cleanup(self.settings.retention_days).await {
                Ok(removed) => tracing::debug!(
                    removed,
                    retention_days = self.settings.retention_days,
                    "episodic retention sweep"
                ),
                Err(e) => tracing::warn!("memory cleanup failed: {}", e),
            }
        }
    }

    async fn context_poll_loop(self: Arc<Self>, source: Arc<dyn ContextSource>, every: Duration) {
        let mut ticker = tokio::time::interval(every);
        loop {
            let polled = tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                ctx = async {
                    ticker.tick().await;
                    source.poll().await
                } => ctx,
            };
            let Some(ctx) = polled else {
                continue;
            };
            // 只有应用或窗口变化才算新上下文
            let changed = self.latest.snapshot().map_or(true, |prev| {
                prev.application != ctx.application || prev.window_title != ctx.window_title
            });
            if changed {
                self.update_context(ctx);
            }
        }
        tracing::debug!(source = source.name(), "context poller stopped");
    }

    // ------------------------------------------------------------------
    // 健康检查与关闭

    pub fn health(&self) -> Value {
        let phase = self.phase.get();
        let episodic = match self.memory.episode_count() {
            Ok(n) => json!(n),
            Err(_) => Value::Null,
        };
        json!({
            "status": if phase == Phase::ShuttingDown { "shutting_down" } else { "ok" },
            "mode": phase.mode(),
            "phase": phase,
            "actuator_available": self.actuator.is_available(),
            "backoff_remaining_ms": self
                .actuator
                .backoff_remaining()
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
            "working_entries": self.memory.working_len(),
            "episodic_records": episodic,
            "reactive_queue_depth": self.reactive_queue_depth(),
            "uptime_seconds": self.started_at.elapsed().as_secs(),
            "metrics": self.metrics.snapshot(),
            "token_usage": {
                "proactive": token_usage_json(&self.proactive),
                "reactive": token_usage_json(&self.reactive),
            },
        })
    }

    /// 关闭：取消后台任务，有界等待后中止残留任务，再释放记忆库与控制面客户端
    ///
    /// 只有第一次调用执行清理并返回 true。
    pub async fn shutdown(&self) -> bool {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return false;
        }
        tracing::info!("Orchestrator shutting down...");
        self.phase.set(Phase::ShuttingDown);
        self.shutdown.shutdown(ShutdownReason::UserInitiated);
        self.wake.notify_waiters();

        for id in lock(&self.subscriptions).drain(..) {
            self.bus.unsubscribe(id);
        }

        let handles: Vec<JoinHandle<()>> = lock(&self.tasks).drain(..).collect();
        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
        if tokio::time::timeout(self.settings.shutdown_timeout, join_all(handles))
            .await
            .is_err()
        {
            tracing::warn!(
                "background tasks did not stop within {}s, aborting",
                self.settings.shutdown_timeout.as_secs()
            );
            for handle in aborts {
                handle.abort();
            }
        }

        self.cleanup.run_cleanup().await
    }

    // ------------------------------------------------------------------
    // 内部工具

    async fn lock_mode(&self) -> Result<MutexGuard<'_, ModeState>, AgentError> {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(AgentError::Cancelled),
            guard = self.mode.lock() => Ok(guard),
        }
    }

    async fn admit(&self, client: &ReasoningClient) -> Result<(), AgentError> {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(AgentError::Cancelled),
            _ = client.admit() => Ok(()),
        }
    }

    async fn decide(
        &self,
        client: &ReasoningClient,
        request: &ReasoningRequest,
    ) -> Result<ReasoningOutput, AgentError> {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(AgentError::Cancelled),
            out = client.decide(request) => out,
        }
    }

    /// 调用方须持有模式锁
    fn switch_mode(&self, state: &mut ModeState, mode: Mode) {
        if state.mode == mode {
            return;
        }
        state.mode = mode;
        if self.phase.get() != Phase::ShuttingDown {
            self.phase.set(mode.into());
        }
        tracing::info!(mode = ?mode, "agent mode switched");
        self.bus.publish(&Event::ModeSwitched { mode });
    }

    /// 调用方须持有模式锁；返回最后一条决策给出的间隔
    async fn execute_decisions(&self, decisions: Vec<Decision>, ctx: Option<&Context>) -> Duration {
        let mut next = self.settings.proactive_interval;
        for decision in decisions {
            self.bus.publish(&Event::DecisionMade {
                action: decision.action.clone(),
            });
            next = self.executor.execute(decision, ctx).await;
        }
        next
    }

    async fn recall_section(&self, ctx: Option<&Context>) -> String {
        match ctx {
            Some(ctx) => self.recall_section_for(&ctx.recall_query()).await,
            None => String::new(),
        }
    }

    async fn recall_section_for(&self, query: &str) -> String {
        if query.trim().is_empty() {
            return String::new();
        }
        match self.memory.recall(query, RECALL_LIMIT).await {
            Ok(records) if !records.is_empty() => {
                let mut s = String::from("## Relevant memories\n");
                for r in records {
                    s.push_str(&format!("- {}\n", r.fact));
                }
                s
            }
            Ok(_) => String::new(),
            Err(e) => {
                tracing::warn!("episodic recall failed: {}", e);
                String::new()
            }
        }
    }

    fn recent_actions_section(&self) -> String {
        let actions = self.memory.recent_actions(RECENT_ACTIONS_IN_PROMPT);
        if actions.is_empty() {
            return String::new();
        }
        let mut s = String::from("## Recent actions\n");
        for entry in actions {
            s.push_str(&format!(
                "- {} {}\n",
                entry.payload["action"].as_str().unwrap_or("?"),
                entry.payload["args"]
            ));
        }
        s
    }
}

/// Reactive 中或按需会话刚结束时跳过本次 tick；后者清除标记
fn skip_tick(state: &mut ModeState) -> bool {
    if state.mode == Mode::Reactive {
        return true;
    }
    if state.skip_next_tick {
        state.skip_next_tick = false;
        tracing::debug!("first tick after reactive session skipped");
        return true;
    }
    false
}

fn token_usage_json(client: &ReasoningClient) -> Value {
    let (prompt, completion, total) = client.token_usage();
    json!({ "prompt": prompt, "completion": completion, "total": total })
}

fn lock<T>(m: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuator::{ActuatorSettings, MockActuator};
    use crate::brain::ReasoningRole;
    use crate::core::{AffectState, RateLimiter};
    use crate::executor::{ActionRegistry, ObserveAndWaitHandler, SetBehaviorHandler};
    use crate::llm::ScriptedLlmClient;
    use crate::memory::SqliteEpisodicStore;
    use crate::ui::RecordingUiSink;

    fn orchestrator(llm: Arc<ScriptedLlmClient>) -> (Arc<Orchestrator>, Arc<MockActuator>) {
        let mock = Arc::new(MockActuator::with_instance("1"));
        let actuator = Arc::new(ResilientActuatorClient::new(
            mock.clone(),
            ActuatorSettings::default(),
        ));
        let memory = Arc::new(MemoryStore::new(
            20,
            SqliteEpisodicStore::open_in_memory().unwrap(),
        ));
        let affect: SharedAffect = Arc::new(StdMutex::new(AffectState::new()));
        let mut registry = ActionRegistry::new();
        registry.register(SetBehaviorHandler::new(
            actuator.clone(),
            vec!["Walk".into(), "Sit".into()],
            affect.clone(),
        ));
        registry.register(ObserveAndWaitHandler::new(affect.clone()));
        let settings = OrchestratorSettings::default();
        let executor = DecisionExecutor::new(
            registry,
            memory.clone(),
            settings.proactive_interval,
            settings.reaction_interval,
        );
        let client = |role| {
            ReasoningClient::new(
                role,
                llm.clone(),
                Arc::new(RateLimiter::new(60, Duration::from_secs(60))),
                Duration::from_secs(30),
            )
        };
        let parts = OrchestratorParts {
            proactive: client(ReasoningRole::Proactive),
            reactive: client(ReasoningRole::Reactive),
            executor,
            memory,
            actuator,
            ui: Arc::new(RecordingUiSink::new()),
            bus: Arc::new(EventBus::new()),
            affect,
            metrics: Arc::new(Metrics::new()),
            context_source: None,
        };
        (Orchestrator::new(parts, settings), mock)
    }

    #[tokio::test]
    async fn test_tick_executes_decision() {
        let llm = Arc::new(ScriptedLlmClient::new());
        llm.push_reply(r#"{"tool": "set_behavior", "args": {"behavior_name": "Walk"}}"#);
        let (orch, mock) = orchestrator(llm);
        let next = orch.tick().await;
        assert_eq!(next, Duration::from_secs(10));
        assert_eq!(mock.active_behavior("1").as_deref(), Some("Walk"));
    }

    #[tokio::test]
    async fn test_tick_without_decision_observes() {
        let llm = Arc::new(ScriptedLlmClient::new());
        llm.push_reply("nothing to do");
        let (orch, mock) = orchestrator(llm);
        assert_eq!(orch.tick().await, Duration::from_secs(45));
        assert_eq!(mock.mutation_count(), 0);
    }

    #[tokio::test]
    async fn test_tick_backs_off_on_backend_failure() {
        let llm = Arc::new(ScriptedLlmClient::new());
        llm.push_error(crate::llm::LlmError::Transport("connection reset".into()));
        let (orch, _) = orchestrator(llm);
        assert_eq!(orch.tick().await, Duration::from_secs(90));
    }

    #[tokio::test]
    async fn test_stale_context_is_discarded() {
        let (orch, _) = orchestrator(Arc::new(ScriptedLlmClient::new()));
        let now = chrono::Utc::now();
        assert!(orch.update_context(Context::new("editor", "a").at(now)));
        assert!(!orch.update_context(
            Context::new("browser", "b").at(now - chrono::Duration::seconds(5))
        ));
        assert_eq!(orch.latest_context().unwrap().application, "editor");
        assert_eq!(orch.metrics().snapshot().context_updates, 1);
    }

    #[tokio::test]
    async fn test_health_reports_mode_and_queue() {
        let (orch, _) = orchestrator(Arc::new(ScriptedLlmClient::new()));
        orch.start();
        let health = orch.health();
        assert_eq!(health["status"], "ok");
        assert_eq!(health["mode"], "proactive");
        assert_eq!(health["reactive_queue_depth"], 0);
        assert_eq!(health["token_usage"]["proactive"]["total"], 0);
        assert!(orch.shutdown().await);
        assert_eq!(orch.health()["status"], "shutting_down");
    }

    #[tokio::test]
    async fn test_skipped_tick_spends_no_rate_limit_budget() {
        let llm = Arc::new(ScriptedLlmClient::new());
        let (orch, _) = orchestrator(llm.clone());

        orch.mode.lock().await.skip_next_tick = true;
        assert_eq!(orch.tick().await, Duration::from_secs(45));
        orch.mode.lock().await.mode = Mode::Reactive;
        assert_eq!(orch.tick().await, Duration::from_secs(45));
        assert_eq!(orch.proactive.limiter().in_window().await, 0);
        assert_eq!(llm.call_count(), 0);

        orch.mode.lock().await.mode = Mode::Proactive;
        orch.tick().await;
        assert_eq!(orch.proactive.limiter().in_window().await, 1);
        assert_eq!(llm.call_count(), 1);
    }
}
