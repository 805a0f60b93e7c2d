//! 语义索引（可选）：情景记录的内存向量索引，按余弦相似度检索
//!
//! 只索引记录 id 与向量，正文仍以 SQLite 为准；超出上限时淘汰最旧条目。

use std::sync::{Arc, RwLock};

use crate::llm::EmbeddingProvider;

pub struct SemanticIndex {
    embedder: Arc<dyn EmbeddingProvider>,
    /// (record_id, embedding)
    entries: RwLock<Vec<(i64, Vec<f32>)>>,
    max_entries: usize,
}

impl SemanticIndex {
    pub fn new(embedder: Arc<dyn EmbeddingProvider>, max_entries: usize) -> Self {
        Self {
            embedder,
            entries: RwLock::new(Vec::new()),
            max_entries: max_entries.max(1),
        }
    }

    /// 计算文本向量；失败或为空时返回 None
    pub async fn embed(&self, text: &str) -> Option<Vec<f32>> {
        match self.embedder.embed(text).await {
            Ok(v) if !v.is_empty() => Some(v),
            Ok(_) => None,
            Err(e) => {
                tracing::debug!("embedding failed: {}", e);
                None
            }
        }
    }

    pub fn insert(&self, id: i64, embedding: Vec<f32>) {
        let mut entries = self.entries.write().unwrap_or_else(|p| p.into_inner());
        entries.push((id, embedding));
        if entries.len() > self.max_entries {
            let excess = entries.len() - self.max_entries;
            entries.drain(0..excess);
        }
    }

    /// 批量载入已有向量（从旧到新），超出上限的按插入规则淘汰
    pub fn load(&self, rows: Vec<(i64, Vec<f32>)>) {
        for (id, embedding) in rows {
            self.insert(id, embedding);
        }
    }

    pub fn remove(&self, ids: &[i64]) {
        if ids.is_empty() {
            return;
        }
        let mut entries = self.entries.write().unwrap_or_else(|p| p.into_inner());
        entries.retain(|(id, _)| !ids.contains(id));
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    /// 返回 (record_id, score)，按分数从高到低，只保留正分
    pub async fn search(&self, query: &str, k: usize) -> Vec<(i64, f32)> {
        let Some(q) = self.embed(query).await else {
            return Vec::new();
        };
        let entries = self.entries.read().unwrap_or_else(|p| p.into_inner());
        let mut scored: Vec<(i64, f32)> = entries
            .iter()
            .map(|(id, emb)| (*id, cosine_similarity(&q, emb)))
            .filter(|(_, score)| *score > 0.0)
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        scored
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}
