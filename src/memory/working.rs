//! 工作记忆：最近观察 / 动作 / 告警的有界 FIFO
//!
//! 容量固定（默认 20），溢出时淘汰最旧的一条；从不落盘。每次推理时取最近若干条拼入提示词。

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Observation,
    Action,
    Alert,
    Dialogue,
    FileDrop,
}

#[derive(Clone, Debug, Serialize)]
pub struct WorkingMemoryEntry {
    pub kind: EntryKind,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct WorkingMemory {
    entries: VecDeque<WorkingMemoryEntry>,
    capacity: usize,
}

impl WorkingMemory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, kind: EntryKind, payload: Value) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(WorkingMemoryEntry {
            kind,
            payload,
            timestamp: Utc::now(),
        });
    }

    /// 最近 n 条，按时间从旧到新
    pub fn recent(&self, n: usize) -> Vec<WorkingMemoryEntry> {
        let skip = self.entries.len().saturating_sub(n);
        self.entries.iter().skip(skip).cloned().collect()
    }

    /// 最近 n 条指定类别
    pub fn recent_of(&self, kind: EntryKind, n: usize) -> Vec<WorkingMemoryEntry> {
        let mut out: Vec<WorkingMemoryEntry> = self
            .entries
            .iter()
            .rev()
            .filter(|e| e.kind == kind)
            .take(n)
            .cloned()
            .collect();
        out.reverse();
        out
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// 构建供推理使用的提示词片段
    pub fn to_prompt_section(&self, n: usize) -> String {
        let recent = self.recent(n);
        if recent.is_empty() {
            return String::new();
        }
        let mut s = String::from("## Recent Memory\n");
        for e in recent {
            s.push_str(&format!(
                "- [{}] {:?}: {}\n",
                e.timestamp.format("%H:%M:%S"),
                e.kind,
                e.payload
            ));
        }
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_evicts_oldest_at_capacity() {
        let mut wm = WorkingMemory::new(3);
        for i in 0..5 {
            wm.push(EntryKind::Observation, json!(i));
        }
        assert_eq!(wm.len(), 3);
        let payloads: Vec<Value> = wm.recent(10).into_iter().map(|e| e.payload).collect();
        assert_eq!(payloads, vec![json!(2), json!(3), json!(4)]);
    }

    #[test]
    fn test_recent_of_filters_kind() {
        let mut wm = WorkingMemory::new(10);
        wm.push(EntryKind::Observation, json!("o1"));
        wm.push(EntryKind::Action, json!("a1"));
        wm.push(EntryKind::Action, json!("a2"));
        wm.push(EntryKind::Observation, json!("o2"));
        let actions = wm.recent_of(EntryKind::Action, 5);
        assert_eq!(actions.len(), 2);
        assert_eq!(actions[1].payload, json!("a2"));
    }

    #[test]
    fn test_prompt_section_empty_when_no_entries() {
        assert!(WorkingMemory::new(5).to_prompt_section(5).is_empty());
    }
}
