//! 按需请求通道：行协议 TCP 服务
//!
//! 每个连接一个请求：读第一行，回一行 JSON 后关闭连接。
//!
//! - `HEALTH` → 健康检查 JSON
//! - `{"prompt": "..."}` → `{"response": "..."}`
//! - `{"context": {...}}` → `{"ok": true, "accepted": bool}`（过期上下文不被接受）
//! - `{"alert": {...}}` / `{"file_dropped": {...}}` → `{"ok": true}`
//! - 其它非空行视为纯文本 prompt
//!
//! 端口被占用时依次尝试后续端口。

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::ServerSection;
use crate::core::{Context, Event, Orchestrator};
use crate::sensors::AlertEvent;

/// 单个请求行的上限（字节）
const MAX_REQUEST_BYTES: u64 = 64 * 1024;
const READ_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("no free port in {host}:{first}..+{attempts}")]
    NoFreePort { host: String, first: u16, attempts: u16 },
}

#[derive(Debug, Default, Deserialize)]
struct FileDrop {
    #[serde(default, alias = "file_path")]
    path: Option<String>,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RequestBody {
    #[serde(default)]
    prompt: Option<String>,
    #[serde(default)]
    context: Option<Context>,
    #[serde(default)]
    alert: Option<AlertEvent>,
    #[serde(default)]
    file_dropped: Option<FileDrop>,
}

/// 绑定监听地址；AddrInUse 时尝试下一个端口，最多 attempts 次
pub async fn bind_with_fallback(cfg: &ServerSection) -> Result<TcpListener, ServerError> {
    let attempts = cfg.port_attempts.max(1);
    for offset in 0..attempts {
        let Some(port) = cfg.port.checked_add(offset) else {
            break;
        };
        let addr = format!("{}:{}", cfg.host, port);
        match TcpListener::bind(&addr).await {
            Ok(listener) => {
                if offset > 0 {
                    tracing::warn!(port, requested = cfg.port, "configured port busy, using fallback");
                }
                return Ok(listener);
            }
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                tracing::debug!(port, "port in use");
                continue;
            }
            Err(source) => return Err(ServerError::Bind { addr, source }),
        }
    }
    Err(ServerError::NoFreePort {
        host: cfg.host.clone(),
        first: cfg.port,
        attempts,
    })
}

pub struct InvocationServer {
    orchestrator: Arc<Orchestrator>,
    config: ServerSection,
}

impl InvocationServer {
    pub fn new(orchestrator: Arc<Orchestrator>, config: ServerSection) -> Self {
        Self {
            orchestrator,
            config,
        }
    }

    /// 绑定并在后台接受连接，返回实际监听地址
    pub async fn start(
        self,
        token: CancellationToken,
    ) -> Result<(SocketAddr, JoinHandle<()>), ServerError> {
        let listener = bind_with_fallback(&self.config).await?;
        let addr = listener.local_addr().map_err(|source| ServerError::Bind {
            addr: format!("{}:{}", self.config.host, self.config.port),
            source,
        })?;
        tracing::info!("Invocation server listening on {}", addr);
        let handle = tokio::spawn(serve(listener, self.orchestrator, token));
        Ok((addr, handle))
    }
}

async fn serve(listener: TcpListener, orchestrator: Arc<Orchestrator>, token: CancellationToken) {
    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let orchestrator = Arc::clone(&orchestrator);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, &orchestrator).await {
                            tracing::debug!(%peer, "connection error: {}", e);
                        }
                    });
                }
                Err(e) => tracing::warn!("accept failed: {}", e),
            },
        }
    }
    tracing::info!("Invocation server stopped");
}

async fn handle_connection(mut stream: TcpStream, orchestrator: &Orchestrator) -> std::io::Result<()> {
    let request_id = uuid::Uuid::new_v4();
    let (reader, mut writer) = stream.split();
    let mut reader = BufReader::new(reader.take(MAX_REQUEST_BYTES));
    let mut line = String::new();

    let response = match tokio::time::timeout(READ_TIMEOUT, reader.read_line(&mut line)).await {
        Ok(Ok(_)) => {
            tracing::debug!(%request_id, bytes = line.len(), "request received");
            dispatch(orchestrator, &line).await
        }
        Ok(Err(e)) => json!({ "error": format!("read failed: {e}") }),
        Err(_) => json!({ "error": "request timed out" }),
    };

    let mut out = response.to_string();
    out.push('\n');
    writer.write_all(out.as_bytes()).await?;
    writer.flush().await?;
    writer.shutdown().await?;
    tracing::debug!(%request_id, "response sent");
    Ok(())
}

/// 处理一行请求并返回响应 JSON
pub async fn dispatch(orchestrator: &Orchestrator, line: &str) -> Value {
    let line = line.trim();
    if line.is_empty() {
        return json!({ "error": "empty request" });
    }
    if line.eq_ignore_ascii_case("HEALTH") {
        return orchestrator.health();
    }
    if !line.starts_with('{') {
        return json!({ "response": orchestrator.enter_reactive(line).await });
    }

    let body: RequestBody = match serde_json::from_str(line) {
        Ok(b) => b,
        Err(e) => return json!({ "error": format!("invalid request: {e}") }),
    };
    if let Some(prompt) = body.prompt {
        return json!({ "response": orchestrator.enter_reactive(&prompt).await });
    }
    if let Some(ctx) = body.context {
        let accepted = orchestrator.update_context(ctx);
        return json!({ "ok": true, "accepted": accepted });
    }
    if let Some(alert) = body.alert {
        orchestrator.event_bus().publish(&Event::Alert(alert));
        return json!({ "ok": true });
    }
    if let Some(drop) = body.file_dropped {
        if drop.path.is_none() && drop.text.is_none() {
            return json!({ "error": "file_dropped needs path or text" });
        }
        orchestrator.event_bus().publish(&Event::FileDropped {
            path: drop.path,
            text: drop.text,
        });
        return json!({ "ok": true });
    }
    json!({ "error": "unknown request" })
}

/// 客户端：发送一行请求并读取一行响应（mascot-ask 使用）
pub async fn send_request(addr: &str, request: &str) -> std::io::Result<Value> {
    let mut stream = TcpStream::connect(addr).await?;
    let mut line = request.replace('\n', " ");
    line.push('\n');
    stream.write_all(line.as_bytes()).await?;
    stream.flush().await?;

    let mut reader = BufReader::new(stream);
    let mut response = String::new();
    reader.read_line(&mut response).await?;
    serde_json::from_str(response.trim())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_port_fallback_skips_busy_port() {
        let busy = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = busy.local_addr().unwrap().port();
        let cfg = ServerSection {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port,
            port_attempts: 5,
        };
        let listener = bind_with_fallback(&cfg).await.unwrap();
        assert_ne!(listener.local_addr().unwrap().port(), port);
    }

    #[tokio::test]
    async fn test_single_attempt_reports_no_free_port() {
        let busy = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let cfg = ServerSection {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port: busy.local_addr().unwrap().port(),
            port_attempts: 1,
        };
        assert!(matches!(
            bind_with_fallback(&cfg).await,
            Err(ServerError::NoFreePort { .. })
        ));
    }
}
