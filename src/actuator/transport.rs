//! 控制面传输层：reqwest 实现（连接池 + 单次超时）

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::actuator::ActuatorError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Method {
    Get,
    Put,
    Post,
}

/// 控制面给出的原始响应；分类（404 / 4xx / 5xx）由客户端负责
#[derive(Clone, Debug)]
pub struct TransportResponse {
    pub status: u16,
    pub body: Value,
}

/// 传输层只在连接失败 / 超时时返回 Err（ActuatorError::TransientIo）
#[async_trait]
pub trait ActuatorTransport: Send + Sync {
    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<TransportResponse, ActuatorError>;

    /// 释放连接池等资源
    fn close(&self) {}
}

/// 基于 reqwest 的传输：Client 内部维护 keep-alive 连接池；close 后置空，连接池随之释放
pub struct HttpTransport {
    client: Mutex<Option<reqwest::Client>>,
    base_url: String,
}

impl HttpTransport {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ActuatorError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .pool_idle_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(4)
            .build()
            .map_err(|e| ActuatorError::TransientIo(e.to_string()))?;
        Ok(Self {
            client: Mutex::new(Some(client)),
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl ActuatorTransport for HttpTransport {
    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<TransportResponse, ActuatorError> {
        let client = self
            .client
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
            .ok_or(ActuatorError::Closed)?;
        let url = format!("{}{}", self.base_url, path);
        let mut req = match method {
            Method::Get => client.get(&url),
            Method::Put => client.put(&url),
            Method::Post => client.post(&url),
        };
        if let Some(body) = body {
            req = req.json(&body);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| ActuatorError::TransientIo(e.to_string()))?;
        let status = resp.status().as_u16();
        let text = resp
            .text()
            .await
            .map_err(|e| ActuatorError::TransientIo(e.to_string()))?;
        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };
        Ok(TransportResponse { status, body })
    }

    fn close(&self) {
        if self
            .client
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
            .is_some()
        {
            tracing::debug!(base_url = %self.base_url, "http connection pool released");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_after_close_is_rejected() {
        let transport =
            HttpTransport::new("http://127.0.0.1:9/api/", Duration::from_millis(200)).unwrap();
        assert_eq!(transport.base_url, "http://127.0.0.1:9/api");
        transport.close();
        transport.close();
        let err = transport.send(Method::Get, "/mascots", None).await.unwrap_err();
        assert_eq!(err, ActuatorError::Closed);
    }
}
