//! MemoryStore：工作记忆 + 情景库 + 可选语义索引的统一入口
//!
//! 编排器只持有 MemoryStore 的引用，从不直接改动记录。写入统一经由决策执行器或后台清理，
//! 读取可以并发。SQLite 调用放到 spawn_blocking 里，不占用运行时工作线程。close 只生效一次。

use std::sync::{Arc, Mutex};

use serde_json::Value;

use crate::config::MemorySection;
use crate::memory::{
    EntryKind, EpisodicRecord, MemoryError, SemanticIndex, SqliteEpisodicStore, WorkingMemory,
    WorkingMemoryEntry,
};

pub struct MemoryStore {
    working: Mutex<WorkingMemory>,
    episodic: Arc<SqliteEpisodicStore>,
    semantic: Option<SemanticIndex>,
}

impl MemoryStore {
    pub fn new(working_capacity: usize, episodic: SqliteEpisodicStore) -> Self {
        Self {
            working: Mutex::new(WorkingMemory::new(working_capacity)),
            episodic: Arc::new(episodic),
            semantic: None,
        }
    }

    /// 打开磁盘上的情景库；失败属于启动期致命错误，由调用方决定是否中止
    pub fn open(cfg: &MemorySection, db_path: &std::path::Path) -> Result<Self, MemoryError> {
        let episodic = SqliteEpisodicStore::open(db_path)?;
        tracing::info!(path = %db_path.display(), "episodic store opened");
        Ok(Self::new(cfg.working_capacity, episodic))
    }

    /// 挂上语义索引，并用库里已有的向量重建它
    pub fn with_semantic_index(mut self, index: SemanticIndex) -> Self {
        match self.episodic.embeddings(index.max_entries()) {
            Ok(rows) => {
                let loaded = rows.len();
                index.load(rows);
                tracing::info!(loaded, "semantic index rebuilt from episodic store");
            }
            Err(e) => tracing::warn!("cannot load stored embeddings: {}", e),
        }
        self.semantic = Some(index);
        self
    }

    /// 在阻塞线程池上访问情景库
    async fn blocking<T, F>(&self, f: F) -> Result<T, MemoryError>
    where
        F: FnOnce(&SqliteEpisodicStore) -> Result<T, MemoryError> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(&self.episodic);
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|e| MemoryError::Blocking(e.to_string()))?
    }

    fn working(&self) -> std::sync::MutexGuard<'_, WorkingMemory> {
        self.working.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn record(&self, kind: EntryKind, payload: Value) {
        self.working().push(kind, payload);
    }

    pub fn recent(&self, n: usize) -> Vec<WorkingMemoryEntry> {
        self.working().recent(n)
    }

    pub fn recent_actions(&self, n: usize) -> Vec<WorkingMemoryEntry> {
        self.working().recent_of(EntryKind::Action, n)
    }

    pub fn working_len(&self) -> usize {
        self.working().len()
    }

    pub fn working_prompt_section(&self, n: usize) -> String {
        self.working().to_prompt_section(n)
    }

    /// 写入一条情景记录（启用语义索引时同时索引）
    pub async fn remember(
        &self,
        kind: &str,
        fact: &str,
        metadata: Value,
    ) -> Result<i64, MemoryError> {
        let embedding = match &self.semantic {
            Some(index) => index.embed(fact).await,
            None => None,
        };
        let (kind_owned, fact_owned, stored) =
            (kind.to_string(), fact.to_string(), embedding.clone());
        let id = self
            .blocking(move |db| db.insert(&kind_owned, &fact_owned, &metadata, stored.as_deref()))
            .await?;
        if let (Some(index), Some(v)) = (&self.semantic, embedding) {
            index.insert(id, v);
        }
        tracing::debug!(id, kind, "episodic memory saved");
        Ok(id)
    }

    /// 检索：语义索引命中优先，不足时用关键词检索补齐
    pub async fn recall(&self, query: &str, limit: usize) -> Result<Vec<EpisodicRecord>, MemoryError> {
        let semantic_ids: Vec<i64> = match &self.semantic {
            Some(index) => index
                .search(query, limit)
                .await
                .into_iter()
                .map(|(id, _score)| id)
                .collect(),
            None => Vec::new(),
        };
        let query = query.to_string();
        self.blocking(move |db| {
            let mut out: Vec<EpisodicRecord> = Vec::new();
            for id in semantic_ids {
                if let Some(record) = db.get(id)? {
                    out.push(record);
                }
            }
            if out.len() < limit {
                for record in db.search(&query, limit)? {
                    if out.len() >= limit {
                        break;
                    }
                    if !out.iter().any(|r| r.id == record.id) {
                        out.push(record);
                    }
                }
            }
            Ok(out)
        })
        .await
    }

    /// 保留期清理；被删除的记录同时移出语义索引，返回删除条数
    pub async fn cleanup(&self, retention_days: i64) -> Result<usize, MemoryError> {
        let removed = self.blocking(move |db| db.cleanup(retention_days)).await?;
        if let Some(index) = &self.semantic {
            index.remove(&removed);
        }
        Ok(removed.len())
    }

    pub fn episode_count(&self) -> Result<usize, MemoryError> {
        self.episodic.count()
    }

    /// 关闭情景库；只有第一次调用返回 true
    pub fn close(&self) -> Result<bool, MemoryError> {
        let closed = self.episodic.close()?;
        if closed {
            tracing::info!("memory store closed");
        }
        Ok(closed)
    }
}
