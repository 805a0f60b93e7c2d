//! 可观测性：tracing 初始化与运行计数器
//!
//! Metrics 是一组原子计数，健康检查里原样输出。

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// 日志：默认 info，可通过 RUST_LOG 覆盖
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init();
}

#[derive(Debug, Default)]
pub struct Metrics {
    pub reasoning_calls: AtomicU64,
    pub reasoning_failures: AtomicU64,
    pub decisions_executed: AtomicU64,
    pub decisions_failed: AtomicU64,
    pub context_updates: AtomicU64,
    pub reactive_requests: AtomicU64,
    pub alerts_handled: AtomicU64,
    pub alerts_throttled: AtomicU64,
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub reasoning_calls: u64,
    pub reasoning_failures: u64,
    pub decisions_executed: u64,
    pub decisions_failed: u64,
    pub context_updates: u64,
    pub reactive_requests: u64,
    pub alerts_handled: u64,
    pub alerts_throttled: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            reasoning_calls: self.reasoning_calls.load(Ordering::Relaxed),
            reasoning_failures: self.reasoning_failures.load(Ordering::Relaxed),
            decisions_executed: self.decisions_executed.load(Ordering::Relaxed),
            decisions_failed: self.decisions_failed.load(Ordering::Relaxed),
            context_updates: self.context_updates.load(Ordering::Relaxed),
            reactive_requests: self.reactive_requests.load(Ordering::Relaxed),
            alerts_handled: self.alerts_handled.load(Ordering::Relaxed),
            alerts_throttled: self.alerts_throttled.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_increments() {
        let m = Metrics::new();
        Metrics::incr(&m.reasoning_calls);
        Metrics::incr(&m.reasoning_calls);
        Metrics::incr(&m.alerts_throttled);
        let s = m.snapshot();
        assert_eq!(s.reasoning_calls, 2);
        assert_eq!(s.alerts_throttled, 1);
        assert_eq!(s.decisions_executed, 0);
    }
}
