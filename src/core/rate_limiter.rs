//! 滑动窗口限流
//!
//! RateLimiter 对推理后端调用做准入控制：窗口内最多 max_calls 次，超出时挂起等待而不是报错。
//! 主动与按需两个推理客户端各持有独立实例，互不饿死。KeyedRateLimiter 按 key（告警来源）
//! 懒创建窗口，只做非阻塞的 try_acquire，用于严重告警节流。来源来自外部输入，
//! 窗口已空的 key 在插入新 key 时被回收，表的大小跟随窗口内活跃来源数。

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

/// 滑动窗口限流器；窗口状态在锁内原子地淘汰与记录，睡眠时不持锁
#[derive(Debug)]
pub struct RateLimiter {
    max_calls: usize,
    window: Duration,
    calls: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(max_calls: usize, window: Duration) -> Self {
        Self {
            max_calls: max_calls.max(1),
            window,
            calls: Mutex::new(VecDeque::new()),
        }
    }

    /// 挂起直到可以在窗口预算内放行本次调用
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut calls = self.calls.lock().await;
                let now = Instant::now();
                self.evict(&mut calls, now);
                if calls.len() < self.max_calls {
                    calls.push_back(now);
                    return;
                }
                calls
                    .front()
                    .map(|oldest| (*oldest + self.window).saturating_duration_since(now))
                    .unwrap_or_default()
            };
            tracing::debug!(
                wait_ms = wait.as_millis() as u64,
                max_calls = self.max_calls,
                "rate limit reached, waiting for window"
            );
            tokio::time::sleep(wait).await;
        }
    }

    /// 非阻塞准入：有预算则记录并返回 true，否则立即返回 false
    pub async fn try_acquire(&self) -> bool {
        let mut calls = self.calls.lock().await;
        let now = Instant::now();
        self.evict(&mut calls, now);
        if calls.len() < self.max_calls {
            calls.push_back(now);
            true
        } else {
            false
        }
    }

    /// 当前窗口内已记录的调用数
    pub async fn in_window(&self) -> usize {
        let mut calls = self.calls.lock().await;
        self.evict(&mut calls, Instant::now());
        calls.len()
    }

    pub fn max_calls(&self) -> usize {
        self.max_calls
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// 窗口内没有记录（正被其它任务持锁时视为忙）
    fn is_idle(&self, now: Instant) -> bool {
        match self.calls.try_lock() {
            Ok(calls) => calls
                .back()
                .map_or(true, |last| now.saturating_duration_since(*last) >= self.window),
            Err(_) => false,
        }
    }

    fn evict(&self, calls: &mut VecDeque<Instant>, now: Instant) {
        while let Some(front) = calls.front() {
            if now.saturating_duration_since(*front) >= self.window {
                calls.pop_front();
            } else {
                break;
            }
        }
    }
}

/// 回收空闲 key 的最小表大小
const MIN_PRUNE_AT: usize = 64;

#[derive(Debug)]
struct KeyedState {
    limiters: HashMap<String, Arc<RateLimiter>>,
    /// 表达到该大小时回收一次，回收后按剩余数量翻倍
    prune_at: usize,
    last_prune: Instant,
}

/// 按 key 分窗口的限流器（每个告警来源一个窗口）
#[derive(Debug)]
pub struct KeyedRateLimiter {
    max_calls: usize,
    window: Duration,
    state: StdMutex<KeyedState>,
}

impl KeyedRateLimiter {
    pub fn new(max_calls: usize, window: Duration) -> Self {
        Self {
            max_calls,
            window,
            state: StdMutex::new(KeyedState {
                limiters: HashMap::new(),
                prune_at: MIN_PRUNE_AT,
                last_prune: Instant::now(),
            }),
        }
    }

    fn limiter_for(&self, key: &str) -> Arc<RateLimiter> {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(limiter) = state.limiters.get(key) {
            return limiter.clone();
        }

        let now = Instant::now();
        if state.limiters.len() >= state.prune_at
            || now.saturating_duration_since(state.last_prune) >= self.window
        {
            let before = state.limiters.len();
            state
                .limiters
                .retain(|_, l| Arc::strong_count(l) > 1 || !l.is_idle(now));
            state.prune_at = (state.limiters.len() * 2).max(MIN_PRUNE_AT);
            state.last_prune = now;
            tracing::debug!(
                removed = before - state.limiters.len(),
                kept = state.limiters.len(),
                "idle rate-limit keys pruned"
            );
        }

        let limiter = Arc::new(RateLimiter::new(self.max_calls, self.window));
        state.limiters.insert(key.to_string(), limiter.clone());
        limiter
    }

    pub async fn try_acquire(&self, key: &str) -> bool {
        self.limiter_for(key).try_acquire().await
    }

    /// 当前保留的 key 数
    pub fn len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .limiters
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_fourth_call_waits_until_window_expires() {
        let limiter = RateLimiter::new(3, Duration::from_secs(10));
        let start = Instant::now();
        for i in 0..4u64 {
            tokio::time::sleep_until(start + Duration::from_secs(i)).await;
            limiter.acquire().await;
            if i < 3 {
                assert_eq!(start.elapsed(), Duration::from_secs(i));
            }
        }
        assert!(start.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_never_exceed_budget() {
        let limiter = Arc::new(RateLimiter::new(3, Duration::from_secs(10)));
        let stamps = Arc::new(StdMutex::new(Vec::new()));
        let mut handles = Vec::new();
        for _ in 0..10 {
            let limiter = limiter.clone();
            let stamps = stamps.clone();
            handles.push(tokio::spawn(async move {
                limiter.acquire().await;
                stamps.lock().unwrap().push(Instant::now());
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let stamps = stamps.lock().unwrap().clone();
        assert_eq!(stamps.len(), 10);
        for s in &stamps {
            let in_window = stamps
                .iter()
                .filter(|t| **t >= *s && t.duration_since(*s) < Duration::from_secs(10))
                .count();
            assert!(in_window <= 3, "window starting at {:?} admitted {}", s, in_window);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_try_acquire_does_not_block() {
        let limiter = RateLimiter::new(1, Duration::from_secs(300));
        assert!(limiter.try_acquire().await);
        assert!(!limiter.try_acquire().await);
        tokio::time::advance(Duration::from_secs(300)).await;
        assert!(limiter.try_acquire().await);
        assert_eq!(limiter.in_window().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keyed_limiter_isolates_sources() {
        let keyed = KeyedRateLimiter::new(1, Duration::from_secs(300));
        assert!(keyed.try_acquire("battery").await);
        assert!(!keyed.try_acquire("battery").await);
        assert!(keyed.try_acquire("disk").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keyed_limiter_forgets_idle_sources() {
        let keyed = KeyedRateLimiter::new(1, Duration::from_secs(300));
        for i in 0..10_000 {
            assert!(keyed.try_acquire(&format!("source-{i}")).await);
        }
        assert!(keyed.len() <= 10_000);

        tokio::time::advance(Duration::from_secs(3600)).await;
        assert!(keyed.try_acquire("late").await);
        assert_eq!(keyed.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keyed_limiter_keeps_sources_inside_window() {
        let keyed = KeyedRateLimiter::new(1, Duration::from_secs(300));
        for i in 0..200 {
            keyed.try_acquire(&format!("source-{i}")).await;
        }
        // 仍在窗口内的来源不能因为回收而重新获得预算
        assert!(!keyed.try_acquire("source-0").await);
        assert_eq!(keyed.len(), 200);
    }
}
