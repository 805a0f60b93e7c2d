//! Mascot 守护进程
//!
//! 入口：初始化日志、加载配置、构建编排器，启动按需请求服务，直到收到 Ctrl+C / SIGTERM。

use std::path::PathBuf;

use anyhow::Context;
use mascot::core::{load_config_or_default, run_with_graceful_shutdown, OrchestratorBuilder};
use mascot::observability;
use mascot::server::InvocationServer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = load_config_or_default(config_path);
    let server_cfg = config.server.clone();

    let orchestrator = OrchestratorBuilder::new(config)
        .build()
        .await
        .context("Failed to start orchestrator")?;
    orchestrator.start();

    let manager = orchestrator.shutdown_manager().clone();
    let server = if server_cfg.enabled {
        let (addr, handle) = InvocationServer::new(orchestrator.clone(), server_cfg)
            .start(manager.token())
            .await
            .context("Failed to start invocation server")?;
        tracing::info!("Ready: send prompts with `mascot-ask --addr {}`", addr);
        Some(handle)
    } else {
        None
    };

    run_with_graceful_shutdown(manager.clone(), manager.wait_for_shutdown(), move || async move {
        orchestrator.shutdown().await;
        if let Some(handle) = server {
            let _ = handle.await;
        }
    })
    .await;

    tracing::info!("Mascot stopped");
    Ok(())
}
