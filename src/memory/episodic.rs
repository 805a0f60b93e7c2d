//! 情景记忆：SQLite 持久化
//!
//! 表 episodes(id, timestamp, kind, fact, metadata, embedding)。检索按 `\w+` 且长度大于 2 的
//! 词在最近 200 条里打分；查询为空时返回最近记录。保留策略按时间清理。
//! 连接在 close 之后置空，后续调用一律返回 MemoryError::Closed。

use std::path::Path;
use std::sync::{Mutex, OnceLock};

use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use serde_json::Value;

use crate::memory::MemoryError;

/// 检索时扫描的最近记录数
const SEARCH_WINDOW: usize = 200;

#[derive(Clone, Debug, Serialize)]
pub struct EpisodicRecord {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub kind: String,
    pub fact: String,
    pub metadata: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

pub struct SqliteEpisodicStore {
    conn: Mutex<Option<Connection>>,
}

static WORD_RE: OnceLock<Regex> = OnceLock::new();

/// 检索用词：小写、长度大于 2
pub fn query_tokens(query: &str) -> Vec<String> {
    let re = WORD_RE.get_or_init(|| Regex::new(r"\w+").unwrap());
    let mut tokens: Vec<String> = re
        .find_iter(&query.to_lowercase())
        .map(|m| m.as_str().to_string())
        .filter(|t| t.chars().count() > 2)
        .collect();
    tokens.dedup();
    tokens
}

impl SqliteEpisodicStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, MemoryError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, MemoryError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, MemoryError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS episodes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                kind TEXT NOT NULL,
                fact TEXT NOT NULL,
                metadata TEXT,
                embedding TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_episodes_timestamp ON episodes(timestamp);",
        )?;
        Ok(Self {
            conn: Mutex::new(Some(conn)),
        })
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, MemoryError>,
    ) -> Result<T, MemoryError> {
        let guard = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        match guard.as_ref() {
            Some(conn) => f(conn),
            None => Err(MemoryError::Closed),
        }
    }

    pub fn insert(
        &self,
        kind: &str,
        fact: &str,
        metadata: &Value,
        embedding: Option<&[f32]>,
    ) -> Result<i64, MemoryError> {
        self.insert_at(Utc::now(), kind, fact, metadata, embedding)
    }

    pub fn insert_at(
        &self,
        timestamp: DateTime<Utc>,
        kind: &str,
        fact: &str,
        metadata: &Value,
        embedding: Option<&[f32]>,
    ) -> Result<i64, MemoryError> {
        let metadata = serde_json::to_string(metadata)?;
        let embedding = embedding.map(serde_json::to_string).transpose()?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO episodes (timestamp, kind, fact, metadata, embedding)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![timestamp, kind, fact, metadata, embedding],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn get(&self, id: i64) -> Result<Option<EpisodicRecord>, MemoryError> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT id, timestamp, kind, fact, metadata, embedding FROM episodes WHERE id = ?1",
                    params![id],
                    row_to_record,
                )
                .optional()?)
        })
    }

    /// 最近 limit 条，从新到旧
    pub fn recent(&self, limit: usize) -> Result<Vec<EpisodicRecord>, MemoryError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, timestamp, kind, fact, metadata, embedding FROM episodes
                 ORDER BY id DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit as i64], row_to_record)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    /// 关键词检索：命中词数高者优先，同分按时间从新到旧
    pub fn search(&self, query: &str, limit: usize) -> Result<Vec<EpisodicRecord>, MemoryError> {
        let tokens = query_tokens(query);
        if tokens.is_empty() {
            return self.recent(limit);
        }
        let candidates = self.recent(SEARCH_WINDOW)?;
        let mut scored: Vec<(usize, EpisodicRecord)> = candidates
            .into_iter()
            .filter_map(|r| {
                let haystack = format!("{} {}", r.fact, r.metadata).to_lowercase();
                let score = tokens.iter().filter(|t| haystack.contains(t.as_str())).count();
                (score > 0).then_some((score, r))
            })
            .collect();
        // 稳定排序，同分保持从新到旧
        scored.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(scored.into_iter().take(limit).map(|(_, r)| r).collect())
    }

    /// 带向量的最近 limit 条 (id, embedding)，从旧到新；用于启动时重建语义索引
    pub fn embeddings(&self, limit: usize) -> Result<Vec<(i64, Vec<f32>)>, MemoryError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, embedding FROM episodes WHERE embedding IS NOT NULL
                 ORDER BY id DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit as i64], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })?;
            let mut out = Vec::new();
            for row in rows {
                let (id, raw) = row?;
                match serde_json::from_str::<Vec<f32>>(&raw) {
                    Ok(v) if !v.is_empty() => out.push((id, v)),
                    _ => tracing::debug!(id, "skipping unreadable embedding"),
                }
            }
            out.reverse();
            Ok(out)
        })
    }

    /// 删除早于 retention_days 的记录，返回被删除的 id
    pub fn cleanup(&self, retention_days: i64) -> Result<Vec<i64>, MemoryError> {
        let cutoff = Utc::now() - Duration::days(retention_days);
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT id FROM episodes WHERE timestamp < ?1")?;
            let ids = stmt
                .query_map(params![cutoff], |row| row.get::<_, i64>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            if !ids.is_empty() {
                conn.execute("DELETE FROM episodes WHERE timestamp < ?1", params![cutoff])?;
            }
            Ok(ids)
        })
    }

    pub fn count(&self) -> Result<usize, MemoryError> {
        self.with_conn(|conn| {
            let n: i64 = conn.query_row("SELECT COUNT(*) FROM episodes", [], |r| r.get(0))?;
            Ok(n as usize)
        })
    }

    /// 关闭连接；只有第一次调用返回 true
    pub fn close(&self) -> Result<bool, MemoryError> {
        let mut guard = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        match guard.take() {
            Some(conn) => {
                conn.close().map_err(|(_, e)| MemoryError::Sqlite(e))?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<EpisodicRecord> {
    let metadata: Option<String> = row.get(4)?;
    let embedding: Option<String> = row.get(5)?;
    Ok(EpisodicRecord {
        id: row.get(0)?,
        timestamp: row.get(1)?,
        kind: row.get(2)?,
        fact: row.get(3)?,
        metadata: metadata
            .and_then(|m| serde_json::from_str(&m).ok())
            .unwrap_or(Value::Null),
        embedding: embedding.and_then(|e| serde_json::from_str(&e).ok()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_insert_and_search_by_keyword() {
        let store = SqliteEpisodicStore::open_in_memory().unwrap();
        store
            .insert("fact", "User likes Rust and tokio", &json!({}), None)
            .unwrap();
        store
            .insert("fact", "User drinks coffee at 9am", &json!({"note": "morning"}), None)
            .unwrap();

        let hits = store.search("writing rust code", 5).unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].fact.contains("Rust"));

        let hits = store.search("morning", 5).unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].fact.contains("coffee"));
    }

    #[test]
    fn test_empty_query_returns_recent() {
        let store = SqliteEpisodicStore::open_in_memory().unwrap();
        for i in 0..5 {
            store.insert("fact", &format!("fact {i}"), &json!({}), None).unwrap();
        }
        let recent = store.search("a b", 2).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].fact, "fact 4");
    }

    #[test]
    fn test_cleanup_only_removes_old_records() {
        let store = SqliteEpisodicStore::open_in_memory().unwrap();
        let old = Utc::now() - Duration::days(40);
        store.insert_at(old, "fact", "ancient", &json!({}), None).unwrap();
        store.insert("fact", "fresh", &json!({}), None).unwrap();

        let old_id = store.recent(10).unwrap()[1].id;
        assert_eq!(store.cleanup(30).unwrap(), vec![old_id]);
        assert_eq!(store.count().unwrap(), 1);
        assert_eq!(store.recent(10).unwrap()[0].fact, "fresh");
    }

    #[test]
    fn test_embedding_roundtrips_through_sqlite() {
        let store = SqliteEpisodicStore::open_in_memory().unwrap();
        let id = store
            .insert("fact", "vector", &json!({}), Some(&[0.5f32, 0.25][..]))
            .unwrap();
        store.insert("fact", "plain", &json!({}), None).unwrap();
        let record = store.get(id).unwrap().unwrap();
        assert_eq!(record.embedding, Some(vec![0.5, 0.25]));
        assert_eq!(store.embeddings(10).unwrap(), vec![(id, vec![0.5, 0.25])]);
    }

    #[test]
    fn test_persists_across_reopen_and_close_is_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("memory.db");
        {
            let store = SqliteEpisodicStore::open(&path).unwrap();
            store.insert("fact", "kept", &json!({}), None).unwrap();
            assert!(store.close().unwrap());
            assert!(!store.close().unwrap());
            assert!(matches!(store.count(), Err(MemoryError::Closed)));
        }
        let store = SqliteEpisodicStore::open(&path).unwrap();
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn test_query_tokens_drops_short_words() {
        assert_eq!(query_tokens("I am on VS Code"), vec!["code".to_string()]);
    }
}
