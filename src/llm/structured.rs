//! 结构化输出解析：按顺序尝试一组具名策略
//!
//! Oracle 并不保证输出合法 JSON，所以解析是一条显式的回退链：
//! `direct_json → fenced_json → fenced_any → brace_span → balanced_object → trailing_comma_repair`。
//! 全部失败返回 `ParseError`（列出尝试过的策略）；调用层以更严格的指令重问一次，
//! 仍失败则视为一次失败调用，交给重试包装器整体重试。

use std::sync::Arc;

use regex::Regex;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use crate::core::{
    AttemptFailure, EvolutionError, ParseError, PartialProgress, RetryExecutor,
    STRICT_STRUCTURE_INSTRUCTION,
};
use crate::llm::{LlmClient, Message};

/// 单次调用内的解析尝试上限：原始提示一次 + 严格提示一次
pub const MAX_PARSE_ATTEMPTS: usize = 2;

/// 候选片段提取策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStrategy {
    /// 整段文本即 JSON
    DirectJson,
    /// ```json ... ``` 代码块
    FencedJson,
    /// 任意 ``` ... ``` 代码块
    FencedAny,
    /// 第一个 `{` 到最后一个 `}`
    BraceSpan,
    /// 第一个括号配平的对象（跳过字符串内的括号）
    BalancedObject,
    /// 去掉 `}` / `]` 前的多余逗号
    TrailingCommaRepair,
}

impl ParseStrategy {
    pub const DEFAULT_CHAIN: [ParseStrategy; 6] = [
        ParseStrategy::DirectJson,
        ParseStrategy::FencedJson,
        ParseStrategy::FencedAny,
        ParseStrategy::BraceSpan,
        ParseStrategy::BalancedObject,
        ParseStrategy::TrailingCommaRepair,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ParseStrategy::DirectJson => "direct_json",
            ParseStrategy::FencedJson => "fenced_json",
            ParseStrategy::FencedAny => "fenced_any",
            ParseStrategy::BraceSpan => "brace_span",
            ParseStrategy::BalancedObject => "balanced_object",
            ParseStrategy::TrailingCommaRepair => "trailing_comma_repair",
        }
    }

    /// 从原始文本中提取候选 JSON 片段
    pub fn extract(&self, text: &str) -> Option<String> {
        let trimmed = text.trim();
        match self {
            ParseStrategy::DirectJson => (!trimmed.is_empty()).then(|| trimmed.to_string()),
            ParseStrategy::FencedJson => fenced_block(trimmed, "```json"),
            ParseStrategy::FencedAny => fenced_block(trimmed, "```"),
            ParseStrategy::BraceSpan => {
                let start = trimmed.find('{')?;
                let end = trimmed.rfind('}')?;
                (end > start).then(|| trimmed[start..=end].to_string())
            }
            ParseStrategy::BalancedObject => balanced_object(trimmed),
            ParseStrategy::TrailingCommaRepair => {
                let start = trimmed.find('{')?;
                let end = trimmed.rfind('}')?;
                if end <= start {
                    return None;
                }
                let re = Regex::new(r",\s*([}\]])").ok()?;
                Some(re.replace_all(&trimmed[start..=end], "$1").into_owned())
            }
        }
    }
}

fn fenced_block(text: &str, fence: &str) -> Option<String> {
    let start = text.find(fence)?;
    let rest = &text[start + fence.len()..];
    // 跳过 ``` 后同一行的语言标记
    let rest = match rest.find('\n') {
        Some(nl) if fence == "```" => &rest[nl + 1..],
        _ => rest,
    };
    let end = rest.find("```")?;
    let body = rest[..end].trim();
    (!body.is_empty()).then(|| body.to_string())
}

fn balanced_object(text: &str) -> Option<String> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(text[start..start + offset + 1].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

/// 多策略解析器
#[derive(Debug, Clone)]
pub struct StructuredParser {
    chain: Vec<ParseStrategy>,
}

impl Default for StructuredParser {
    fn default() -> Self {
        Self {
            chain: ParseStrategy::DEFAULT_CHAIN.to_vec(),
        }
    }
}

impl StructuredParser {
    pub fn with_chain(chain: Vec<ParseStrategy>) -> Self {
        Self { chain }
    }

    pub fn strategies(&self) -> &[ParseStrategy] {
        &self.chain
    }

    /// 依次尝试每个策略，返回第一个能反序列化为 T 的结果
    pub fn parse<T: DeserializeOwned>(&self, text: &str) -> Result<T, ParseError> {
        let mut tried = Vec::with_capacity(self.chain.len());
        let mut last_error = String::from("empty response");

        for strategy in &self.chain {
            tried.push(strategy.name().to_string());
            let Some(candidate) = strategy.extract(text) else {
                tracing::debug!("parse strategy {} found no candidate", strategy.name());
                continue;
            };
            match serde_json::from_str::<T>(&candidate) {
                Ok(v) => return Ok(v),
                Err(e) => {
                    tracing::debug!("parse strategy {} failed: {}", strategy.name(), e);
                    last_error = e.to_string();
                }
            }
        }

        Err(ParseError { tried, last_error })
    }
}

/// 为目标类型生成 JSON Schema 提示，附在提示词末尾
pub fn schema_hint<T: JsonSchema>() -> String {
    let schema = schemars::schema_for!(T);
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}

/// 解析成功的结构化值（外层重试包装器要求实现 PartialProgress）
#[derive(Debug, Clone)]
pub struct Structured<T>(pub T);

impl<T> PartialProgress for Structured<T> {}

/// 向 LLM 请求结构化结果：解析失败时在同一次调用内以严格指令重问一次，
/// 仍失败则作为 StructuredOutput 错误交给重试包装器。
pub async fn request_structured<T>(
    llm: &Arc<dyn LlmClient>,
    retry: &RetryExecutor,
    cancel: &CancellationToken,
    label: &str,
    messages: Vec<Message>,
) -> Result<T, EvolutionError>
where
    T: DeserializeOwned + Send + 'static,
{
    let parser = StructuredParser::default();
    let outcome = retry
        .execute(label, cancel, |ctx| {
            let llm = llm.clone();
            let parser = parser.clone();
            let messages = messages.clone();
            async move {
                let mut last: Option<ParseError> = None;
                let first_strict = usize::from(ctx.strict);
                for parse_attempt in first_strict..MAX_PARSE_ATTEMPTS {
                    let mut msgs = messages.clone();
                    if parse_attempt > 0 {
                        msgs.push(Message::user(STRICT_STRUCTURE_INSTRUCTION));
                    }
                    let raw = llm
                        .complete(&msgs)
                        .await
                        .map_err(|e| AttemptFailure::from(EvolutionError::transient("llm", e)))?;
                    match parser.parse::<T>(&raw) {
                        Ok(v) => return Ok(Structured(v)),
                        Err(e) => {
                            tracing::warn!(
                                "structured output unparseable (attempt {}): {}",
                                parse_attempt + 1,
                                e
                            );
                            last = Some(e);
                        }
                    }
                }
                Err(AttemptFailure::from(EvolutionError::StructuredOutput(
                    last.unwrap_or(ParseError {
                        tried: Vec::new(),
                        last_error: "no parse attempt".into(),
                    }),
                )))
            }
        })
        .await?;
    Ok(outcome.value.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::RetryPolicy;
    use crate::llm::MockLlmClient;
    use serde::Deserialize;
    use std::time::Duration;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Gaps {
        gaps: Vec<String>,
    }

    #[test]
    fn test_direct_json() {
        let parser = StructuredParser::default();
        let v: Gaps = parser.parse(r#"{"gaps": ["a"]}"#).unwrap();
        assert_eq!(v.gaps, vec!["a"]);
    }

    #[test]
    fn test_fenced_json_with_prose() {
        let parser = StructuredParser::default();
        let text = "Here is the analysis:\n```json\n{\"gaps\": [\"b\"]}\n```\nThanks";
        let v: Gaps = parser.parse(text).unwrap();
        assert_eq!(v.gaps, vec!["b"]);
    }

    #[test]
    fn test_balanced_object_ignores_braces_in_strings() {
        let text = r#"prefix {"gaps": ["use {theme} here"]} suffix } trailing"#;
        let candidate = ParseStrategy::BalancedObject.extract(text).unwrap();
        assert_eq!(candidate, r#"{"gaps": ["use {theme} here"]}"#);
        let v: Gaps = StructuredParser::default().parse(text).unwrap();
        assert_eq!(v.gaps, vec!["use {theme} here"]);
    }

    #[test]
    fn test_trailing_comma_repair() {
        let v: Gaps = StructuredParser::default()
            .parse(r#"{"gaps": ["x", "y",],}"#)
            .unwrap();
        assert_eq!(v.gaps, vec!["x", "y"]);
    }

    #[test]
    fn test_all_strategies_fail_lists_tried() {
        let err = StructuredParser::default()
            .parse::<Gaps>("no structure here at all")
            .unwrap_err();
        assert_eq!(err.tried.len(), ParseStrategy::DEFAULT_CHAIN.len());
        assert_eq!(err.tried[0], "direct_json");
    }

    #[tokio::test]
    async fn test_request_structured_reprompts_strictly() {
        let mock = Arc::new(MockLlmClient::scripted([
            "I think the gaps are many.",
            r#"{"gaps": ["clarity"]}"#,
        ]));
        let llm: Arc<dyn LlmClient> = mock.clone();
        let retry = RetryExecutor::new(
            RetryPolicy::default()
                .with_max_retries(1)
                .with_base_delay(Duration::from_millis(1)),
        );
        let token = CancellationToken::new();

        let v: Gaps = request_structured(&llm, &retry, &token, "reflection", vec![Message::user("analyse")])
            .await
            .unwrap();
        assert_eq!(v.gaps, vec!["clarity"]);
        let prompts = mock.prompts();
        assert_eq!(prompts.len(), 2);
        assert_eq!(prompts[1], STRICT_STRUCTURE_INSTRUCTION);
    }

    #[tokio::test]
    async fn test_request_structured_gives_up_after_ceiling() {
        let mock = Arc::new(MockLlmClient::scripted(["nope"]));
        let llm: Arc<dyn LlmClient> = mock.clone();
        let retry = RetryExecutor::new(
            RetryPolicy::default()
                .with_max_retries(2)
                .with_base_delay(Duration::from_millis(1)),
        );
        let token = CancellationToken::new();

        let err = request_structured::<Gaps>(&llm, &retry, &token, "reflection", vec![Message::user("x")])
            .await
            .unwrap_err();
        assert!(matches!(err, EvolutionError::StructuredOutput(_)));
        // 第一轮：原始 + 严格；第二轮从严格开始：1 次
        assert_eq!(mock.prompts().len(), 3);
    }
}
