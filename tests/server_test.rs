//! 按需请求服务集成测试：真实 TCP 连接上的行协议

use std::sync::Arc;

use mascot::actuator::MockActuator;
use mascot::config::{AppConfig, ServerSection};
use mascot::core::{Orchestrator, OrchestratorBuilder};
use mascot::llm::ScriptedLlmClient;
use mascot::memory::SqliteEpisodicStore;
use mascot::server::{send_request, InvocationServer};
use serde_json::json;

async fn serve(llm: Arc<ScriptedLlmClient>) -> (Arc<Orchestrator>, String) {
    let mut cfg = AppConfig::default();
    cfg.orchestrator.proactive_interval_secs = 3600;
    let orch = OrchestratorBuilder::new(cfg)
        .with_llm(llm)
        .with_transport(Arc::new(MockActuator::with_instance("1")))
        .with_episodic_store(SqliteEpisodicStore::open_in_memory().unwrap())
        .build()
        .await
        .unwrap();
    orch.start();

    let server_cfg = ServerSection {
        enabled: true,
        host: "127.0.0.1".to_string(),
        port: 0,
        port_attempts: 1,
    };
    let token = orch.shutdown_manager().token();
    let (addr, _handle) = InvocationServer::new(orch.clone(), server_cfg)
        .start(token)
        .await
        .unwrap();
    (orch, addr.to_string())
}

#[tokio::test]
async fn test_health_over_tcp() {
    let (orch, addr) = serve(Arc::new(ScriptedLlmClient::new())).await;
    let health = send_request(&addr, "HEALTH").await.unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["mode"], "proactive");
    assert_eq!(health["actuator_available"], true);
    assert!(health["metrics"].is_object());
    orch.shutdown().await;
}

#[tokio::test]
async fn test_prompt_over_tcp() {
    let llm = Arc::new(ScriptedLlmClient::new().with_fallback("Nice to see you!"));
    let (orch, addr) = serve(llm.clone()).await;

    let reply = send_request(&addr, &json!({ "prompt": "hi there" }).to_string())
        .await
        .unwrap();
    assert_eq!(reply["response"], "Nice to see you!");

    // 非 JSON 行按纯文本 prompt 处理
    let reply = send_request(&addr, "how are you").await.unwrap();
    assert_eq!(reply["response"], "Nice to see you!");
    assert_eq!(llm.call_count(), 2);
    orch.shutdown().await;
}

#[tokio::test]
async fn test_context_and_sensor_lines() {
    let (orch, addr) = serve(Arc::new(ScriptedLlmClient::new())).await;

    let reply = send_request(
        &addr,
        &json!({ "context": { "application": "editor", "window_title": "main.rs" } }).to_string(),
    )
    .await
    .unwrap();
    assert_eq!(reply, json!({ "ok": true, "accepted": true }));
    assert_eq!(orch.latest_context().unwrap().window_title, "main.rs");

    let reply = send_request(
        &addr,
        &json!({ "file_dropped": { "file_path": "/tmp/notes.txt", "text": "groceries" } })
            .to_string(),
    )
    .await
    .unwrap();
    assert_eq!(reply["ok"], true);
    let tags = orch.latest_context().unwrap().tags;
    assert_eq!(tags["dropped_file"]["path"], "/tmp/notes.txt");

    let reply = send_request(&addr, r#"{"file_dropped": {}}"#).await.unwrap();
    assert!(reply["error"].is_string());
    let reply = send_request(&addr, r#"{"what": 1}"#).await.unwrap();
    assert_eq!(reply["error"], "unknown request");
    orch.shutdown().await;
}

#[tokio::test]
async fn test_server_stops_with_orchestrator() {
    let (orch, addr) = serve(Arc::new(ScriptedLlmClient::new())).await;
    orch.shutdown().await;
    tokio::task::yield_now().await;
    // 关闭后要么拒绝连接，要么不再回复
    let result = tokio::time::timeout(
        std::time::Duration::from_secs(2),
        send_request(&addr, "HEALTH"),
    )
    .await;
    assert!(!matches!(result, Ok(Ok(v)) if v["status"] == "ok"));
}
