//! 弹性控制面客户端
//!
//! - 实例列表带短 TTL 缓存，任何变更调用后主动失效
//! - 连接失败按 `min(base * 2^failures, cap)` 退避并加不超过 10% 的抖动；成功一次即清零
//! - 退避期间所有调用快速失败（Unavailable），不阻塞调用方
//! - 幂等读取遇到 404 时强制刷新缓存后重试一次；变更调用不静默重试，
//!   只有 set_behavior 在 404 时重新定位实例并改投一次

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use serde_json::{json, Value};
use tokio::time::Instant;

use crate::actuator::{
    ActuatorError, ActuatorInstance, ActuatorTransport, Method, TransportResponse,
};
use crate::config::ActuatorSection;

/// 客户端参数（由 [actuator] 配置段转换）
#[derive(Clone, Debug)]
pub struct ActuatorSettings {
    pub cache_ttl: Duration,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    /// 错误日志的最小间隔，避免控制面掉线时刷屏
    pub error_log_interval: Duration,
}

impl Default for ActuatorSettings {
    fn default() -> Self {
        Self::from(&ActuatorSection::default())
    }
}

impl From<&ActuatorSection> for ActuatorSettings {
    fn from(cfg: &ActuatorSection) -> Self {
        Self {
            cache_ttl: Duration::from_millis(cfg.cache_ttl_ms),
            backoff_initial: Duration::from_millis(cfg.backoff_initial_ms),
            backoff_max: Duration::from_millis(cfg.backoff_max_ms),
            error_log_interval: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, Default)]
struct ClientState {
    cache: Option<(Instant, Vec<ActuatorInstance>)>,
    failures: u32,
    /// 本轮退避的确定部分（不含抖动）
    backoff_base: Duration,
    backoff_until: Option<Instant>,
    last_error_log: Option<Instant>,
}

pub struct ResilientActuatorClient {
    transport: Arc<dyn ActuatorTransport>,
    settings: ActuatorSettings,
    state: Mutex<ClientState>,
    closed: AtomicBool,
}

impl ResilientActuatorClient {
    pub fn new(transport: Arc<dyn ActuatorTransport>, settings: ActuatorSettings) -> Self {
        Self {
            transport,
            settings,
            state: Mutex::new(ClientState::default()),
            closed: AtomicBool::new(false),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ClientState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// 列出实例；force 为 false 时优先使用未过期的缓存
    pub async fn list_instances(&self, force: bool) -> Result<Vec<ActuatorInstance>, ActuatorError> {
        self.ensure_open()?;
        if !force {
            let state = self.state();
            if let Some((at, instances)) = &state.cache {
                if at.elapsed() < self.settings.cache_ttl {
                    return Ok(instances.clone());
                }
            }
        }

        let resp = self.request(Method::Get, "/mascots", None).await?;
        let instances = parse_instances(&resp.body);
        self.state().cache = Some((Instant::now(), instances.clone()));
        Ok(instances)
    }

    /// 第一个实例作为主化身
    pub async fn primary_instance(&self) -> Result<Option<ActuatorInstance>, ActuatorError> {
        Ok(self.list_instances(false).await?.into_iter().next())
    }

    /// 切换主化身的行为；404 时重新定位实例并改投一次，最多多发一次 GET
    pub async fn set_behavior(&self, behavior: &str) -> Result<(), ActuatorError> {
        let instance = self
            .primary_instance()
            .await?
            .ok_or_else(|| ActuatorError::NotFound("no active instance".to_string()))?;
        let body = json!({ "behavior": behavior });

        let first = self
            .request(Method::Put, &format!("/mascots/{}", instance.id), Some(body.clone()))
            .await;
        let result = match first {
            Err(ActuatorError::NotFound(_)) => {
                tracing::debug!(id = %instance.id, "instance gone, re-resolving");
                self.invalidate();
                let retarget = self
                    .list_instances(true)
                    .await?
                    .into_iter()
                    .next()
                    .ok_or_else(|| ActuatorError::NotFound("no active instance".to_string()))?;
                self.request(Method::Put, &format!("/mascots/{}", retarget.id), Some(body))
                    .await
                    .map(|_| ())
            }
            other => other.map(|_| ()),
        };
        self.invalidate();
        result
    }

    /// 主化身当前行为
    pub async fn query_status(&self) -> Result<Option<String>, ActuatorError> {
        let Some(instance) = self.primary_instance().await? else {
            return Ok(None);
        };
        let resp = match self
            .request(Method::Get, &format!("/mascots/{}", instance.id), None)
            .await
        {
            Err(ActuatorError::NotFound(_)) => {
                self.invalidate();
                let Some(fresh) = self.list_instances(true).await?.into_iter().next() else {
                    return Ok(None);
                };
                self.request(Method::Get, &format!("/mascots/{}", fresh.id), None)
                    .await?
            }
            other => other?,
        };
        Ok(resp
            .body
            .get("active_behavior")
            .and_then(Value::as_str)
            .map(String::from))
    }

    /// 在化身上方显示一条短消息
    pub async fn push_message(&self, text: &str, duration_secs: u64) -> Result<(), ActuatorError> {
        let instance = self
            .primary_instance()
            .await?
            .ok_or_else(|| ActuatorError::NotFound("no active instance".to_string()))?;
        let result = self
            .request(
                Method::Post,
                &format!("/mascots/{}/message", instance.id),
                Some(json!({ "text": text, "duration": duration_secs })),
            )
            .await
            .map(|_| ());
        self.invalidate();
        result
    }

    pub fn invalidate(&self) {
        self.state().cache = None;
    }

    /// 退避剩余时间；不在退避中为 None
    pub fn backoff_remaining(&self) -> Option<Duration> {
        let state = self.state();
        state
            .backoff_until
            .map(|until| until.saturating_duration_since(Instant::now()))
            .filter(|d| !d.is_zero())
    }

    /// 当前退避的确定部分（不含抖动）；无失败时为零
    pub fn current_backoff(&self) -> Duration {
        self.state().backoff_base
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.state().failures
    }

    pub fn is_available(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.backoff_remaining().is_none()
    }

    /// 关闭客户端；只有第一次调用返回 true
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.invalidate();
        self.transport.close();
        tracing::info!("actuator client closed");
        true
    }

    fn ensure_open(&self) -> Result<(), ActuatorError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(ActuatorError::Closed)
        } else {
            Ok(())
        }
    }

    /// 单次请求：退避检查 → 发送 → 按状态码分类并更新退避状态
    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<TransportResponse, ActuatorError> {
        self.ensure_open()?;
        if let Some(remaining) = self.backoff_remaining() {
            return Err(ActuatorError::Unavailable {
                retry_in_ms: remaining.as_millis() as u64,
            });
        }

        match self.transport.send(method, path, body).await {
            Err(e) => {
                self.record_failure(&e);
                Err(e)
            }
            Ok(resp) if resp.status >= 500 => {
                let err = ActuatorError::TransientIo(format!("HTTP {} on {}", resp.status, path));
                self.record_failure(&err);
                Err(err)
            }
            Ok(resp) => {
                // 控制面有应答即视为连通
                self.record_success();
                match resp.status {
                    200..=299 => Ok(resp),
                    404 => Err(ActuatorError::NotFound(path.to_string())),
                    status => Err(ActuatorError::Rejected(format!(
                        "HTTP {}: {}",
                        status,
                        error_message(&resp.body)
                    ))),
                }
            }
        }
    }

    fn record_success(&self) {
        let mut state = self.state();
        if state.failures > 0 {
            tracing::info!(failures = state.failures, "actuator reachable again");
        }
        state.failures = 0;
        state.backoff_base = Duration::ZERO;
        state.backoff_until = None;
    }

    fn record_failure(&self, err: &ActuatorError) {
        let mut state = self.state();
        let exp = state.failures.min(16);
        let base = self
            .settings
            .backoff_initial
            .saturating_mul(1u32 << exp)
            .min(self.settings.backoff_max);
        let jitter = base.mul_f64(rand::thread_rng().gen_range(0.0..=0.1));
        state.failures += 1;
        state.backoff_base = base;
        state.backoff_until = Some(Instant::now() + base + jitter);

        let now = Instant::now();
        let should_log = state
            .last_error_log
            .map(|t| now.duration_since(t) >= self.settings.error_log_interval)
            .unwrap_or(true);
        if should_log {
            state.last_error_log = Some(now);
            tracing::warn!(
                failures = state.failures,
                backoff_ms = (base + jitter).as_millis() as u64,
                "actuator request failed: {}",
                err
            );
        } else {
            tracing::debug!(failures = state.failures, "actuator request failed: {}", err);
        }
    }
}

/// 兼容 `{"mascots": [...]}` 与裸数组两种列表格式
fn parse_instances(body: &Value) -> Vec<ActuatorInstance> {
    let list = body.get("mascots").unwrap_or(body);
    list.as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|v| serde_json::from_value(v.clone()).ok())
                .collect()
        })
        .unwrap_or_default()
}

fn error_message(body: &Value) -> String {
    body.get("error")
        .or_else(|| body.get("message"))
        .and_then(Value::as_str)
        .map(String::from)
        .unwrap_or_else(|| body.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuator::mock::{MockActuator, ScriptedReply};

    fn client(mock: &Arc<MockActuator>) -> ResilientActuatorClient {
        ResilientActuatorClient::new(mock.clone(), ActuatorSettings::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_listing_is_cached_within_ttl() {
        let mock = Arc::new(MockActuator::with_instance("1"));
        let c = client(&mock);
        c.list_instances(false).await.unwrap();
        c.list_instances(false).await.unwrap();
        assert_eq!(mock.count(Method::Get, "/mascots"), 1);

        tokio::time::advance(Duration::from_secs(3)).await;
        c.list_instances(false).await.unwrap();
        assert_eq!(mock.count(Method::Get, "/mascots"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_is_monotonic_until_cap_and_resets() {
        let mock = Arc::new(MockActuator::with_instance("1"));
        let c = client(&mock);
        let mut last = Duration::ZERO;
        for _ in 0..6 {
            mock.push_reply(ScriptedReply::ConnectionError);
            // 等过上一轮退避再发请求
            if let Some(rem) = c.backoff_remaining() {
                tokio::time::advance(rem).await;
            }
            let err = c.list_instances(true).await.unwrap_err();
            assert!(matches!(err, ActuatorError::TransientIo(_)));

            let base = c.current_backoff();
            assert!(base >= last, "backoff decreased: {:?} < {:?}", base, last);
            assert!(base <= Duration::from_secs(12));
            let remaining = c.backoff_remaining().unwrap();
            assert!(remaining >= base && remaining <= base.mul_f64(1.1));
            last = base;
        }
        assert_eq!(last, Duration::from_secs(12));

        tokio::time::advance(c.backoff_remaining().unwrap()).await;
        c.list_instances(true).await.unwrap();
        assert_eq!(c.consecutive_failures(), 0);
        assert_eq!(c.current_backoff(), Duration::ZERO);

        mock.push_reply(ScriptedReply::ConnectionError);
        c.list_instances(true).await.unwrap_err();
        assert_eq!(c.current_backoff(), Duration::from_millis(1500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fail_fast_while_backed_off() {
        let mock = Arc::new(MockActuator::with_instance("1"));
        let c = client(&mock);
        mock.push_reply(ScriptedReply::Status(503));
        c.list_instances(true).await.unwrap_err();
        let before = mock.calls().len();

        let err = c.set_behavior("Sit").await.unwrap_err();
        assert!(matches!(err, ActuatorError::Unavailable { .. }));
        assert_eq!(mock.calls().len(), before);
        assert!(!c.is_available());
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_behavior_404_retargets_with_single_get() {
        let mock = Arc::new(MockActuator::with_instance("1"));
        let c = client(&mock);
        c.list_instances(false).await.unwrap();
        mock.recreate_instance("1", "2");

        c.set_behavior("Sit").await.unwrap();
        assert_eq!(mock.count(Method::Get, "/mascots"), 2);
        assert_eq!(mock.count(Method::Put, "/mascots/"), 2);
        assert_eq!(mock.active_behavior("2").as_deref(), Some("Sit"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_behavior_404_surfaces_when_still_failing() {
        let mock = Arc::new(MockActuator::with_instance("1"));
        let c = client(&mock);
        c.list_instances(false).await.unwrap();
        mock.push_reply_for(Method::Put, ScriptedReply::Status(404));
        mock.push_reply_for(Method::Put, ScriptedReply::Status(404));

        let err = c.set_behavior("Sit").await.unwrap_err();
        assert!(matches!(err, ActuatorError::NotFound(_)));
        // 初次列表 + 404 之后恰好一次
        assert_eq!(mock.count(Method::Get, "/mascots"), 2);
        assert_eq!(mock.count(Method::Put, "/mascots/"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_does_not_count_as_failure() {
        let mock = Arc::new(MockActuator::with_instance("1"));
        let c = client(&mock);
        mock.push_reply_for(Method::Put, ScriptedReply::Status(400));
        let err = c.set_behavior("NoSuchMove").await.unwrap_err();
        assert!(matches!(err, ActuatorError::Rejected(_)));
        assert_eq!(c.consecutive_failures(), 0);
        assert!(c.is_available());
    }

    #[tokio::test]
    async fn test_query_status_reads_active_behavior() {
        let mock = Arc::new(MockActuator::with_instance("1"));
        let c = client(&mock);
        c.set_behavior("Walk").await.unwrap();
        assert_eq!(c.query_status().await.unwrap().as_deref(), Some("Walk"));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let mock = Arc::new(MockActuator::with_instance("1"));
        let c = client(&mock);
        assert!(c.close());
        assert!(!c.close());
        assert_eq!(c.list_instances(true).await.unwrap_err(), ActuatorError::Closed);
    }
}
