//! 优雅关闭
//!
//! 统一的关闭信号监听和清理逻辑：
//! - 情景库连接在退出时关闭
//! - 控制面客户端关闭（之后的调用一律返回 Closed）
//! - 后台任务观察到取消信号后有界退出
//!
//! 清理只执行一次，重复调用是空操作。

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::actuator::ResilientActuatorClient;
use crate::memory::MemoryStore;

/// 关闭信号管理器
#[derive(Clone)]
pub struct ShutdownManager {
    shutdown_token: CancellationToken,
}

/// 关闭原因
#[derive(Debug, Clone, PartialEq)]
pub enum ShutdownReason {
    /// Ctrl+C 或调用方主动关闭
    UserInitiated,
    /// SIGTERM
    Signal,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self {
            shutdown_token: CancellationToken::new(),
        }
    }

    /// 关闭 token（后台任务在 select! 中等待它）
    pub fn token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// 触发关闭；只有第一次调用记录原因
    pub fn shutdown(&self, reason: ShutdownReason) {
        if !self.shutdown_token.is_cancelled() {
            tracing::info!(reason = ?reason, "shutdown requested");
        }
        self.shutdown_token.cancel();
    }

    pub async fn wait_for_shutdown(&self) {
        self.shutdown_token.cancelled().await;
    }

    /// 安装系统信号处理器 (Ctrl+C, SIGTERM)
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
                manager.shutdown(ShutdownReason::UserInitiated);
            }
        });

        #[cfg(unix)]
        {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    tracing::info!("Received SIGTERM, initiating graceful shutdown...");
                    manager.shutdown(ShutdownReason::Signal);
                }
            });
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

/// 关闭时需要执行的清理任务
#[async_trait::async_trait]
pub trait ShutdownCleanup: Send + Sync {
    async fn cleanup(&self) -> anyhow::Result<()>;

    /// 清理任务名称（用于日志）
    fn name(&self) -> &'static str;
}

/// 关闭协调器：按注册顺序执行清理任务，每个任务有独立超时
pub struct ShutdownCoordinator {
    cleanup_tasks: Vec<Arc<dyn ShutdownCleanup>>,
    timeout: Duration,
    ran: AtomicBool,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            cleanup_tasks: Vec::new(),
            timeout: Duration::from_secs(5),
            ran: AtomicBool::new(false),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn register<T: ShutdownCleanup + 'static>(&mut self, task: T) {
        self.cleanup_tasks.push(Arc::new(task));
    }

    /// 执行所有清理任务；只有第一次调用真正执行并返回 true
    pub async fn run_cleanup(&self) -> bool {
        if self.ran.swap(true, Ordering::SeqCst) {
            tracing::debug!("cleanup already ran, skipping");
            return false;
        }
        tracing::info!("Running {} cleanup tasks...", self.cleanup_tasks.len());

        for task in &self.cleanup_tasks {
            let name = task.name();
            match tokio::time::timeout(self.timeout, task.cleanup()).await {
                Ok(Ok(())) => {
                    tracing::info!("Cleanup task '{}' completed successfully", name);
                }
                Ok(Err(e)) => {
                    tracing::warn!("Cleanup task '{}' failed: {}", name, e);
                }
                Err(_) => {
                    tracing::warn!(
                        "Cleanup task '{}' timed out after {}s",
                        name,
                        self.timeout.as_secs()
                    );
                }
            }
        }

        tracing::info!("All cleanup tasks finished");
        true
    }

}

/// 关闭情景库
pub struct MemoryStoreCleanup {
    store: Arc<MemoryStore>,
}

impl MemoryStoreCleanup {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self { store }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for MemoryStoreCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        self.store.close()?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "MemoryStore"
    }
}

/// 关闭控制面客户端
pub struct ActuatorCleanup {
    client: Arc<ResilientActuatorClient>,
}

impl ActuatorCleanup {
    pub fn new(client: Arc<ResilientActuatorClient>) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for ActuatorCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        self.client.close();
        Ok(())
    }

    fn name(&self) -> &'static str {
        "Actuator"
    }
}

/// 运行主应用直到收到关闭信号，然后执行清理
pub async fn run_with_graceful_shutdown<F, Fut>(
    shutdown_manager: Arc<ShutdownManager>,
    app: F,
    cleanup: impl FnOnce() -> Fut,
) where
    F: Future<Output = ()>,
    Fut: Future<Output = ()>,
{
    shutdown_manager.install_signal_handlers();

    tokio::select! {
        _ = app => {
            tracing::info!("Application finished normally");
        }
        _ = shutdown_manager.wait_for_shutdown() => {
            tracing::info!("Shutdown signal received");
        }
    }

    cleanup().await;
}
