//! 记忆层：按需对话历史、工作记忆（有界 FIFO）、情景记忆（SQLite）、语义索引（可选）

pub mod conversation;
pub mod episodic;
pub mod semantic;
pub mod store;
pub mod working;

use thiserror::Error;

pub use conversation::{ConversationMemory, Message, Role};
pub use episodic::{EpisodicRecord, SqliteEpisodicStore};
pub use semantic::{cosine_similarity, SemanticIndex};
pub use store::MemoryStore;
pub use working::{EntryKind, WorkingMemory, WorkingMemoryEntry};

#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("blocking task failed: {0}")]
    Blocking(String),

    #[error("memory store closed")]
    Closed,
}
