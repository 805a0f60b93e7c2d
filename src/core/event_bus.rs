//! 进程内事件总线
//!
//! 传感器（上下文、告警、文件拖放）通过总线与编排器解耦。订阅者按注册顺序同步调用；
//! 任一订阅者返回错误或 panic 都只记录日志，不会传给发布者，也不影响后续订阅者。

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde_json::Value;

use crate::core::{Context, Mode};
use crate::sensors::AlertEvent;

/// 总线事件
#[derive(Clone, Debug)]
pub enum Event {
    ContextChanged(Context),
    Alert(AlertEvent),
    FileDropped {
        path: Option<String>,
        text: Option<String>,
    },
    PatternDetected {
        pattern: String,
        details: Value,
    },
    DecisionMade {
        action: String,
    },
    ModeSwitched {
        mode: Mode,
    },
}

/// 事件类别（订阅粒度）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    ContextChanged,
    Alert,
    FileDropped,
    PatternDetected,
    DecisionMade,
    ModeSwitched,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::ContextChanged(_) => EventKind::ContextChanged,
            Event::Alert(_) => EventKind::Alert,
            Event::FileDropped { .. } => EventKind::FileDropped,
            Event::PatternDetected { .. } => EventKind::PatternDetected,
            Event::DecisionMade { .. } => EventKind::DecisionMade,
            Event::ModeSwitched { .. } => EventKind::ModeSwitched,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

pub type EventHandler = Arc<dyn Fn(&Event) -> anyhow::Result<()> + Send + Sync>;

struct Subscriber {
    id: SubscriptionId,
    kind: EventKind,
    handler: EventHandler,
}

#[derive(Default)]
pub struct EventBus {
    subscribers: RwLock<Vec<Subscriber>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .push(Subscriber {
                id,
                kind,
                handler: Arc::new(handler),
            });
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = self.subscribers.write().unwrap_or_else(|p| p.into_inner());
        let before = subs.len();
        subs.retain(|s| s.id != id);
        subs.len() != before
    }

    pub fn clear(&self) {
        self.subscribers
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .clear();
    }

    /// 同步投递给该类别的全部订阅者，返回成功处理的订阅者数
    pub fn publish(&self, event: &Event) -> usize {
        let kind = event.kind();
        // 先拷出处理器再调用，订阅者内部可以再订阅/退订而不会死锁
        let handlers: Vec<(SubscriptionId, EventHandler)> = self
            .subscribers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .filter(|s| s.kind == kind)
            .map(|s| (s.id, s.handler.clone()))
            .collect();

        let mut delivered = 0;
        for (id, handler) in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => {
                    tracing::warn!(subscriber = id.0, kind = ?kind, "event subscriber failed: {}", e);
                }
                Err(_) => {
                    tracing::error!(subscriber = id.0, kind = ?kind, "event subscriber panicked");
                }
            }
        }
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn file_drop() -> Event {
        Event::FileDropped {
            path: Some("/tmp/a.txt".into()),
            text: None,
        }
    }

    #[test]
    fn test_subscribers_called_in_registration_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = order.clone();
            bus.subscribe(EventKind::FileDropped, move |_| {
                order.lock().unwrap().push(i);
                Ok(())
            });
        }
        assert_eq!(bus.publish(&file_drop()), 3);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_failing_and_panicking_subscribers_are_isolated() {
        let bus = EventBus::new();
        let reached = Arc::new(Mutex::new(false));
        bus.subscribe(EventKind::FileDropped, |_| anyhow::bail!("boom"));
        bus.subscribe(EventKind::FileDropped, |_| panic!("subscriber bug"));
        let r = reached.clone();
        bus.subscribe(EventKind::FileDropped, move |_| {
            *r.lock().unwrap() = true;
            Ok(())
        });

        assert_eq!(bus.publish(&file_drop()), 1);
        assert!(*reached.lock().unwrap());
    }

    #[test]
    fn test_only_matching_kind_is_delivered() {
        let bus = EventBus::new();
        let hits = Arc::new(Mutex::new(0));
        let h = hits.clone();
        bus.subscribe(EventKind::Alert, move |_| {
            *h.lock().unwrap() += 1;
            Ok(())
        });
        bus.publish(&file_drop());
        assert_eq!(*hits.lock().unwrap(), 0);
    }

    #[test]
    fn test_unsubscribe() {
        let bus = EventBus::new();
        let id = bus.subscribe(EventKind::FileDropped, |_| Ok(()));
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        assert_eq!(bus.publish(&file_drop()), 0);
    }
}
