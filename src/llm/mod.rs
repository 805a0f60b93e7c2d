//! LLM 层：客户端抽象与实现（OpenAI 兼容 / Mock / 脚本化）

pub mod embedding;
pub mod mock;
pub mod openai;
pub mod traits;

use std::sync::Arc;

use crate::config::AppConfig;

pub use embedding::{create_embedder_from_config, OpenAiEmbedder};
pub use mock::{BagOfLettersEmbedder, MockLlmClient, ScriptedLlmClient};
pub use openai::{OpenAiClient, TokenUsage};
pub use traits::{EmbeddingProvider, LlmClient, LlmError};

/// 根据配置与环境变量为指定模型创建 LLM 后端（OpenAI 兼容 / Mock）
pub fn create_llm_from_config(cfg: &AppConfig, model: Option<&str>) -> Arc<dyn LlmClient> {
    let provider = cfg.llm.provider.to_lowercase();
    let model = model.unwrap_or(&cfg.llm.model);
    match openai::api_key_from_env() {
        Some(key) if provider != "mock" => {
            tracing::info!("Using OpenAI-compatible LLM ({})", model);
            Arc::new(OpenAiClient::new(cfg.llm.base_url.as_deref(), model, Some(&key)))
        }
        _ => {
            tracing::warn!("No API key set or provider is mock, using Mock LLM");
            Arc::new(MockLlmClient)
        }
    }
}
