//! UI 接口：说话、气泡、输入中提示
//!
//! 渲染在本 crate 之外。UiSink 调用都是即发即忘，不能阻塞编排器：ChannelUiSink 写入无界通道
//! 交给外部渲染进程消费，LogUiSink 只打日志（守护进程无 UI 时使用）。

use std::sync::Mutex;

use tokio::sync::mpsc;

/// 发往 UI 的一条指令
#[derive(Clone, Debug, PartialEq)]
pub enum UiEvent {
    Speak(String),
    Bubble(String),
    Typing(bool),
}

pub trait UiSink: Send + Sync {
    fn speak(&self, text: &str);
    fn show_bubble(&self, text: &str);
    fn show_typing(&self, on: bool);
}

/// 通道实现：接收端关闭后静默丢弃
pub struct ChannelUiSink {
    tx: mpsc::UnboundedSender<UiEvent>,
}

impl ChannelUiSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<UiEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, event: UiEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("ui receiver dropped");
        }
    }
}

impl UiSink for ChannelUiSink {
    fn speak(&self, text: &str) {
        self.send(UiEvent::Speak(text.to_string()));
    }

    fn show_bubble(&self, text: &str) {
        self.send(UiEvent::Bubble(text.to_string()));
    }

    fn show_typing(&self, on: bool) {
        self.send(UiEvent::Typing(on));
    }
}

#[derive(Debug, Default)]
pub struct LogUiSink;

impl UiSink for LogUiSink {
    fn speak(&self, text: &str) {
        tracing::info!(target: "ui", "speak: {}", text);
    }

    fn show_bubble(&self, text: &str) {
        tracing::info!(target: "ui", "bubble: {}", text);
    }

    fn show_typing(&self, on: bool) {
        tracing::debug!(target: "ui", "typing: {}", on);
    }
}

/// 记录全部事件，便于断言
#[derive(Debug, Default)]
pub struct RecordingUiSink {
    events: Mutex<Vec<UiEvent>>,
}

impl RecordingUiSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<UiEvent> {
        self.events.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn push(&self, event: UiEvent) {
        self.events
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(event);
    }
}

impl UiSink for RecordingUiSink {
    fn speak(&self, text: &str) {
        self.push(UiEvent::Speak(text.to_string()));
    }

    fn show_bubble(&self, text: &str) {
        self.push(UiEvent::Bubble(text.to_string()));
    }

    fn show_typing(&self, on: bool) {
        self.push(UiEvent::Typing(on));
    }
}

/// 长回答只在气泡里放前 15 个词
pub fn bubble_text(answer: &str) -> String {
    let words: Vec<&str> = answer.split_whitespace().collect();
    if words.len() > 30 {
        format!("{}...", words[..15].join(" "))
    } else {
        answer.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_sink_delivers_in_order() {
        let (sink, mut rx) = ChannelUiSink::new();
        sink.show_typing(true);
        sink.speak("hi");
        assert_eq!(rx.try_recv().unwrap(), UiEvent::Typing(true));
        assert_eq!(rx.try_recv().unwrap(), UiEvent::Speak("hi".into()));
    }

    #[test]
    fn test_channel_sink_survives_dropped_receiver() {
        let (sink, rx) = ChannelUiSink::new();
        drop(rx);
        sink.speak("nobody listens");
    }

    #[test]
    fn test_bubble_text_truncates_long_answers() {
        let long = vec!["word"; 40].join(" ");
        let bubble = bubble_text(&long);
        assert_eq!(bubble.split_whitespace().count(), 15);
        assert!(bubble.ends_with("..."));
        assert_eq!(bubble_text("short answer"), "short answer");
    }
}
