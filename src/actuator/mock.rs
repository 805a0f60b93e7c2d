//! 内存中的控制面（用于测试与无引擎本地运行）
//!
//! 模拟 `/mascots` 系列接口；可预置下一次响应（状态码或连接失败），记录全部调用，
//! 并统计同时在途的请求数，用来验证「同一时刻最多一个化身调用」。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::actuator::{ActuatorError, ActuatorInstance, ActuatorTransport, Method, TransportResponse};

#[derive(Clone, Debug)]
pub enum ScriptedReply {
    Status(u16),
    ConnectionError,
}

#[derive(Default)]
struct MockState {
    instances: Vec<ActuatorInstance>,
    calls: Vec<(Method, String)>,
    scripted: VecDeque<(Option<Method>, ScriptedReply)>,
}

#[derive(Default)]
pub struct MockActuator {
    state: Mutex<MockState>,
    latency: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockActuator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_instance(id: &str) -> Self {
        let mock = Self::default();
        mock.add_instance(id);
        mock
    }

    /// 每个请求模拟的耗时
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn add_instance(&self, id: &str) {
        self.state().instances.push(ActuatorInstance {
            id: id.to_string(),
            name: Some("mascot".to_string()),
            active_behavior: Some("Stand".to_string()),
            anchor: None,
        });
    }

    /// 模拟实例被引擎重建为新 id
    pub fn recreate_instance(&self, old_id: &str, new_id: &str) {
        let mut state = self.state();
        if let Some(inst) = state.instances.iter_mut().find(|i| i.id == old_id) {
            inst.id = new_id.to_string();
        }
    }

    /// 预置下一次任意请求的响应
    pub fn push_reply(&self, reply: ScriptedReply) {
        self.state().scripted.push_back((None, reply));
    }

    /// 预置下一次指定方法请求的响应
    pub fn push_reply_for(&self, method: Method, reply: ScriptedReply) {
        self.state().scripted.push_back((Some(method), reply));
    }

    pub fn calls(&self) -> Vec<(Method, String)> {
        self.state().calls.clone()
    }

    /// 指定方法且路径以 prefix 开头的调用次数
    pub fn count(&self, method: Method, prefix: &str) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|(m, p)| *m == method && p.starts_with(prefix))
            .count()
    }

    /// 变更类调用（PUT / POST）次数
    pub fn mutation_count(&self) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|(m, _)| *m != Method::Get)
            .count()
    }

    pub fn active_behavior(&self, id: &str) -> Option<String> {
        self.state()
            .instances
            .iter()
            .find(|i| i.id == id)
            .and_then(|i| i.active_behavior.clone())
    }

    /// 观察到的最大并发在途请求数
    pub fn max_concurrent(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn route(&self, method: Method, path: &str, body: Option<Value>) -> TransportResponse {
        let mut state = self.state();
        let segments: Vec<&str> = path.trim_start_matches('/').split('/').collect();
        let not_found = TransportResponse {
            status: 404,
            body: json!({ "error": "not found" }),
        };
        match (method, segments.as_slice()) {
            (Method::Get, ["mascots"]) => TransportResponse {
                status: 200,
                body: json!({ "mascots": state.instances }),
            },
            (Method::Get, ["mascots", id]) => match state.instances.iter().find(|i| i.id == *id) {
                Some(inst) => TransportResponse {
                    status: 200,
                    body: json!(inst),
                },
                None => not_found,
            },
            (Method::Put, ["mascots", id]) => {
                let behavior = body
                    .as_ref()
                    .and_then(|b| b.get("behavior"))
                    .and_then(Value::as_str)
                    .map(String::from);
                match (state.instances.iter_mut().find(|i| i.id == *id), behavior) {
                    (Some(inst), Some(b)) => {
                        inst.active_behavior = Some(b);
                        TransportResponse {
                            status: 200,
                            body: Value::Null,
                        }
                    }
                    (Some(_), None) => TransportResponse {
                        status: 400,
                        body: json!({ "error": "missing behavior" }),
                    },
                    (None, _) => not_found,
                }
            }
            (Method::Post, ["mascots", id, "message"]) => {
                if state.instances.iter().any(|i| i.id == *id) {
                    TransportResponse {
                        status: 200,
                        body: Value::Null,
                    }
                } else {
                    not_found
                }
            }
            _ => not_found,
        }
    }

    fn take_scripted(&self, method: Method) -> Option<ScriptedReply> {
        let mut state = self.state();
        let pos = state
            .scripted
            .iter()
            .position(|(m, _)| m.map_or(true, |m| m == method))?;
        state.scripted.remove(pos).map(|(_, r)| r)
    }
}

#[async_trait]
impl ActuatorTransport for MockActuator {
    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<TransportResponse, ActuatorError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.state().calls.push((method, path.to_string()));

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let result = match self.take_scripted(method) {
            Some(ScriptedReply::ConnectionError) => {
                Err(ActuatorError::TransientIo("connection refused".to_string()))
            }
            Some(ScriptedReply::Status(status)) => {
                let mut resp = self.route(method, path, body);
                if resp.status != status {
                    resp = TransportResponse {
                        status,
                        body: json!({ "error": format!("scripted {status}") }),
                    };
                }
                Ok(resp)
            }
            None => Ok(self.route(method, path, body)),
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}
