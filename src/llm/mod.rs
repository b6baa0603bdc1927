//! LLM 层：客户端抽象与实现（OpenAI 兼容 / Mock）与结构化输出解析

pub mod mock;
pub mod openai;
pub mod structured;
pub mod traits;

use std::sync::Arc;

pub use mock::MockLlmClient;
pub use openai::{OpenAiClient, TokenUsage};
pub use structured::{request_structured, schema_hint, ParseStrategy, StructuredParser};
pub use traits::{LlmClient, Message, Role};

use crate::config::AppConfig;

/// 根据配置与环境变量选择 LLM 后端（OpenAI 兼容 / Mock）
pub fn create_llm_from_config(cfg: &AppConfig) -> Arc<dyn LlmClient> {
    let provider = cfg.llm.provider.to_lowercase();
    if provider != "mock" && std::env::var("OPENAI_API_KEY").is_ok() {
        tracing::info!("Using OpenAI-compatible LLM ({})", cfg.llm.model);
        Arc::new(OpenAiClient::new(
            cfg.llm.base_url.as_deref(),
            &cfg.llm.model,
            None,
        ))
    } else {
        tracing::warn!("No API key set or provider is mock, using Mock LLM");
        Arc::new(MockLlmClient::new())
    }
}
