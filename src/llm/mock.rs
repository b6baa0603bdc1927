//! Mock LLM 客户端（用于测试，无需 API）
//!
//! 按顺序返回预设的回复；回复用完后重复最后一条。同时记录收到的最后一条 User 消息，
//! 便于测试断言重试时是否换上了更严格的指令。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::{LlmClient, Message, Role};

/// 脚本化的 Mock 客户端
#[derive(Debug, Default)]
pub struct MockLlmClient {
    responses: Mutex<VecDeque<Result<String, String>>>,
    last: Mutex<Option<Result<String, String>>>,
    prompts: Mutex<Vec<String>>,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// 依次返回给定的回复
    pub fn scripted<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let queue = responses.into_iter().map(|s| Ok(s.into())).collect();
        Self {
            responses: Mutex::new(queue),
            ..Self::default()
        }
    }

    /// 追加一个失败回复
    pub fn push_error(&self, message: impl Into<String>) {
        if let Ok(mut q) = self.responses.lock() {
            q.push_back(Err(message.into()));
        }
    }

    /// 收到过的 User 消息（按调用顺序）
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, String> {
        let last_user = messages
            .iter()
            .rev()
            .find(|m| matches!(m.role, Role::User))
            .map(|m| m.content.clone())
            .unwrap_or_default();
        if let Ok(mut p) = self.prompts.lock() {
            p.push(last_user);
        }

        let next = self.responses.lock().ok().and_then(|mut q| q.pop_front());
        match next {
            Some(r) => {
                if let Ok(mut last) = self.last.lock() {
                    *last = Some(r.clone());
                }
                r
            }
            None => self
                .last
                .lock()
                .ok()
                .and_then(|l| l.clone())
                .unwrap_or_else(|| Ok("{}".to_string())),
        }
    }
}
