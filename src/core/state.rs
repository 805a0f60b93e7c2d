//! 状态定义：运行模式、生命周期阶段、上下文快照与 LatestContext
//!
//! Mode 只有 Proactive / Reactive 两种，切换由编排器的模式锁保护；Phase 是带启动与关闭的完整
//! 生命周期，用原子量镜像出来供健康检查与快速路径无锁读取。

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// 当前驱动化身的模式
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Proactive,
    Reactive,
}

/// 生命周期：Starting → Proactive ⇄ Reactive → ShuttingDown
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Starting,
    Proactive,
    Reactive,
    ShuttingDown,
}

impl Phase {
    pub fn mode(self) -> Option<Mode> {
        match self {
            Phase::Proactive => Some(Mode::Proactive),
            Phase::Reactive => Some(Mode::Reactive),
            _ => None,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Phase::Starting => 0,
            Phase::Proactive => 1,
            Phase::Reactive => 2,
            Phase::ShuttingDown => 3,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => Phase::Proactive,
            2 => Phase::Reactive,
            3 => Phase::ShuttingDown,
            _ => Phase::Starting,
        }
    }
}

impl From<Mode> for Phase {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Proactive => Phase::Proactive,
            Mode::Reactive => Phase::Reactive,
        }
    }
}

/// Phase 的无锁镜像；只在持有模式锁时写入
#[derive(Debug)]
pub struct PhaseCell(AtomicU8);

impl PhaseCell {
    pub fn new(phase: Phase) -> Self {
        Self(AtomicU8::new(phase.as_u8()))
    }

    pub fn get(&self) -> Phase {
        Phase::from_u8(self.0.load(Ordering::SeqCst))
    }

    pub fn set(&self, phase: Phase) {
        self.0.store(phase.as_u8(), Ordering::SeqCst);
    }
}

/// 传感器产出的上下文快照（窗口标题已在上游做过隐私过滤）
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Context {
    #[serde(default)]
    pub application: String,
    #[serde(default)]
    pub window_title: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub tags: Map<String, Value>,
}

impl Context {
    pub fn new(application: impl Into<String>, window_title: impl Into<String>) -> Self {
        Self {
            application: application.into(),
            window_title: window_title.into(),
            timestamp: Utc::now(),
            tags: Map::new(),
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: Value) -> Self {
        self.tags.insert(key.into(), value);
        self
    }

    /// 用于情景记忆检索的查询串（标题 + 应用名）
    pub fn recall_query(&self) -> String {
        format!("{} {}", self.window_title, self.application)
            .trim()
            .to_string()
    }

    /// 拼入提示词的上下文片段
    pub fn to_prompt_section(&self) -> String {
        let mut s = String::from("## Current Context\n");
        if !self.application.is_empty() {
            s.push_str(&format!("- Application: {}\n", self.application));
        }
        if !self.window_title.is_empty() {
            s.push_str(&format!("- Window: {}\n", self.window_title));
        }
        s.push_str(&format!("- Time: {}\n", self.timestamp.to_rfc3339()));
        for (k, v) in &self.tags {
            s.push_str(&format!("- {}: {}\n", k, v));
        }
        s
    }
}

#[derive(Debug, Default)]
struct Versioned {
    context: Option<Context>,
    version: u64,
}

/// 最新上下文：按时间戳单调的后写者胜；时间戳更早的更新被丢弃
#[derive(Debug, Default)]
pub struct LatestContext {
    inner: RwLock<Versioned>,
}

impl LatestContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// 接受则返回新版本号；时间戳早于当前值时返回 None
    pub fn update(&self, ctx: Context) -> Option<u64> {
        let mut guard = self.inner.write().unwrap_or_else(|p| p.into_inner());
        if let Some(current) = &guard.context {
            if ctx.timestamp < current.timestamp {
                tracing::debug!(
                    incoming = %ctx.timestamp,
                    current = %current.timestamp,
                    "discarding out-of-order context update"
                );
                return None;
            }
        }
        guard.context = Some(ctx);
        guard.version += 1;
        Some(guard.version)
    }

    /// 在当前上下文上合并一个标签；时间戳保持不变，不影响之后到达的传感器快照
    pub fn merge_tag(&self, key: &str, value: Value) -> Context {
        let mut guard = self.inner.write().unwrap_or_else(|p| p.into_inner());
        let mut ctx = guard.context.clone().unwrap_or_else(|| Context::new("", ""));
        ctx.tags.insert(key.to_string(), value);
        guard.context = Some(ctx.clone());
        guard.version += 1;
        ctx
    }

    pub fn snapshot(&self) -> Option<Context> {
        self.inner
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .context
            .clone()
    }

    pub fn version(&self) -> u64 {
        self.inner.read().unwrap_or_else(|p| p.into_inner()).version
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_latest_context_rejects_older_timestamp() {
        let latest = LatestContext::new();
        let now = Utc::now();
        assert_eq!(latest.update(Context::new("editor", "a.rs").at(now)), Some(1));
        assert_eq!(
            latest.update(Context::new("browser", "old").at(now - Duration::seconds(5))),
            None
        );
        assert_eq!(latest.snapshot().unwrap().application, "editor");
        assert_eq!(latest.version(), 1);
    }

    #[test]
    fn test_latest_context_accepts_equal_or_newer() {
        let latest = LatestContext::new();
        let now = Utc::now();
        latest.update(Context::new("a", "").at(now));
        assert_eq!(latest.update(Context::new("b", "").at(now)), Some(2));
        assert_eq!(
            latest.update(Context::new("c", "").at(now + Duration::seconds(1))),
            Some(3)
        );
        assert_eq!(latest.snapshot().unwrap().application, "c");
    }

    #[test]
    fn test_merge_tag_keeps_existing_fields() {
        let latest = LatestContext::new();
        latest.update(Context::new("editor", "notes.md"));
        let merged = latest.merge_tag("dropped_file", Value::String("report.pdf".into()));
        assert_eq!(merged.application, "editor");
        assert_eq!(merged.tags["dropped_file"], "report.pdf");
        assert_eq!(latest.version(), 2);
    }

    #[test]
    fn test_merge_tag_does_not_reject_pending_snapshot() {
        let latest = LatestContext::new();
        let now = Utc::now();
        latest.update(Context::new("editor", "notes.md").at(now - Duration::seconds(10)));
        let merged = latest.merge_tag("dropped_file", Value::String("report.pdf".into()));
        assert_eq!(merged.timestamp, now - Duration::seconds(10));

        // 拖放之前采集、之后送达的快照仍然被接受
        let late = Context::new("browser", "docs").at(now - Duration::seconds(5));
        assert_eq!(latest.update(late), Some(3));
        assert_eq!(latest.snapshot().unwrap().application, "browser");
    }

    #[test]
    fn test_phase_cell_roundtrip() {
        let cell = PhaseCell::new(Phase::Starting);
        assert_eq!(cell.get().mode(), None);
        cell.set(Phase::Reactive);
        assert_eq!(cell.get().mode(), Some(Mode::Reactive));
    }

    #[test]
    fn test_recall_query_uses_title_and_app() {
        let ctx = Context::new("Firefox", "Rust docs");
        assert_eq!(ctx.recall_query(), "Rust docs Firefox");
    }
}
