//! 重试 / 部分进展包装器
//!
//! 所有外部调用（生成、评分、结构化解析）统一经过 `RetryExecutor::execute`：
//! - 每次尝试可带超时；成功即返回
//! - 失败但携带「有用数据」且允许部分结果时，记为候选部分结果
//! - 否则等待 `base_delay × 2^attempt`（指数模式）后重试，最后一次失败后不再等待
//! - 重试耗尽后返回最佳部分结果（partial = true）或最终错误
//!
//! 组件内部的重试对控制器不可见，只有耗尽后的失败才会向上传播。

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::core::EvolutionError;

/// 视为「有用数据」的字段名：部分结果中只要任一字段非空即可保留
pub const USEFUL_DATA_MARKERS: &[&str] = &[
    "evaluation_data",
    "improvements",
    "tools_discovered",
    "prompts_evolved",
    "analysis",
    "recommendations",
    "phases",
];

/// 可被判定为「部分有用」的结果
pub trait PartialProgress {
    /// 失败的尝试里是否仍有值得保留的数据
    fn has_useful_data(&self) -> bool {
        false
    }
}

impl PartialProgress for serde_json::Value {
    fn has_useful_data(&self) -> bool {
        let Some(obj) = self.as_object() else {
            return false;
        };
        USEFUL_DATA_MARKERS.iter().any(|key| match obj.get(*key) {
            None | Some(serde_json::Value::Null) => false,
            Some(serde_json::Value::Array(a)) => !a.is_empty(),
            Some(serde_json::Value::Object(o)) => !o.is_empty(),
            Some(serde_json::Value::String(s)) => !s.trim().is_empty(),
            Some(_) => true,
        })
    }
}

impl PartialProgress for String {}

/// 重试策略
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// 总尝试次数（至少 1）
    pub max_retries: u32,
    pub base_delay: Duration,
    pub exponential: bool,
    pub allow_partial: bool,
    /// 单次尝试超时；None 表示不限
    pub call_timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(2),
            exponential: true,
            allow_partial: true,
            call_timeout: Some(Duration::from_secs(120)),
        }
    }
}

impl RetryPolicy {
    /// 第 attempt 次（0 起）失败后的等待时长
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if self.exponential {
            self.base_delay.saturating_mul(2u32.saturating_pow(attempt))
        } else {
            self.base_delay
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    pub fn without_partial(mut self) -> Self {
        self.allow_partial = false;
        self
    }
}

/// 传给每次尝试的上下文
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptContext {
    /// 0 起的尝试序号
    pub attempt: u32,
    /// 上一次失败是否为结构化输出错误（调用方应改用更严格的指令）
    pub strict: bool,
}

/// 单次尝试的失败：错误本身，以及可能保留的部分数据
#[derive(Debug)]
pub struct AttemptFailure<T> {
    pub error: EvolutionError,
    pub partial: Option<T>,
}

impl<T> AttemptFailure<T> {
    pub fn with_partial(error: EvolutionError, partial: T) -> Self {
        Self {
            error,
            partial: Some(partial),
        }
    }
}

impl<T> From<EvolutionError> for AttemptFailure<T> {
    fn from(error: EvolutionError) -> Self {
        Self {
            error,
            partial: None,
        }
    }
}

/// 包装器的返回值
#[derive(Debug, Clone)]
pub struct RetryOutcome<T> {
    pub value: T,
    /// 是否为重试耗尽后保留的部分结果
    pub partial: bool,
    /// 实际发生的重试次数（首次尝试不计）
    pub retry_count: u32,
    pub last_error: Option<String>,
}

/// 统一的重试执行器
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// 执行 op，按策略重试。不可重试的错误（取消、致命错误等）立即返回。
    pub async fn execute<T, F, Fut>(
        &self,
        label: &str,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<RetryOutcome<T>, EvolutionError>
    where
        T: PartialProgress,
        F: FnMut(AttemptContext) -> Fut,
        Fut: Future<Output = Result<T, AttemptFailure<T>>>,
    {
        let attempts = self.policy.max_retries.max(1);
        let mut best_partial: Option<T> = None;
        let mut last_error: Option<EvolutionError> = None;
        let mut strict = false;

        for attempt in 0..attempts {
            if cancel.is_cancelled() {
                return Err(EvolutionError::Cancelled);
            }

            let ctx = AttemptContext { attempt, strict };
            let result = match self.policy.call_timeout {
                Some(limit) => tokio::select! {
                    _ = cancel.cancelled() => return Err(EvolutionError::Cancelled),
                    r = tokio::time::timeout(limit, op(ctx)) => match r {
                        Ok(inner) => inner,
                        Err(_) => Err(AttemptFailure::from(EvolutionError::transient(
                            label,
                            format!("timed out after {}s", limit.as_secs_f64()),
                        ))),
                    },
                },
                None => tokio::select! {
                    _ = cancel.cancelled() => return Err(EvolutionError::Cancelled),
                    r = op(ctx) => r,
                },
            };

            match result {
                Ok(value) => {
                    if attempt > 0 {
                        tracing::info!("{} succeeded after {} retries", label, attempt);
                    }
                    return Ok(RetryOutcome {
                        value,
                        partial: false,
                        retry_count: attempt,
                        last_error: last_error.map(|e| e.to_string()),
                    });
                }
                Err(failure) => {
                    if self.policy.allow_partial {
                        if let Some(p) = failure.partial {
                            if p.has_useful_data() {
                                tracing::debug!("{}: keeping partial result from attempt {}", label, attempt + 1);
                                best_partial = Some(p);
                            }
                        }
                    }

                    if !failure.error.is_retryable() {
                        tracing::warn!("{}: non-retryable failure: {}", label, failure.error);
                        return Err(failure.error);
                    }

                    strict = matches!(failure.error, EvolutionError::StructuredOutput(_));
                    let is_last = attempt + 1 >= attempts;
                    if is_last {
                        tracing::warn!(
                            "{}: attempt {}/{} failed: {}",
                            label,
                            attempt + 1,
                            attempts,
                            failure.error
                        );
                    } else {
                        let delay = self.policy.delay_for(attempt);
                        tracing::warn!(
                            "{}: attempt {}/{} failed: {}; retrying in {:?}",
                            label,
                            attempt + 1,
                            attempts,
                            failure.error,
                            delay
                        );
                        tokio::select! {
                            _ = cancel.cancelled() => return Err(EvolutionError::Cancelled),
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                    last_error = Some(failure.error);
                }
            }
        }

        let retry_count = attempts - 1;
        match (best_partial, last_error) {
            (Some(value), err) => {
                tracing::warn!("{}: retries exhausted, returning partial result", label);
                Ok(RetryOutcome {
                    value,
                    partial: true,
                    retry_count,
                    last_error: err.map(|e| e.to_string()),
                })
            }
            (None, Some(err)) => Err(err),
            (None, None) => Err(EvolutionError::transient(label, "no attempt was made")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_policy(max: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries: max,
            base_delay: Duration::from_millis(1),
            exponential: true,
            allow_partial: true,
            call_timeout: Some(Duration::from_secs(5)),
        }
    }

    #[test]
    fn test_delay_doubles_per_attempt() {
        let policy = RetryPolicy::default().with_base_delay(Duration::from_millis(100));
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));

        let flat = RetryPolicy {
            exponential: false,
            ..policy
        };
        assert_eq!(flat.delay_for(3), Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let executor = RetryExecutor::new(fast_policy(3));
        let calls = Arc::new(AtomicU32::new(0));
        let token = CancellationToken::new();

        let c = calls.clone();
        let out = executor
            .execute("gen", &token, move |_ctx| {
                let c = c.clone();
                async move {
                    let n = c.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        Err(EvolutionError::transient("gen", "flaky").into())
                    } else {
                        Ok("artifact".to_string())
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(out.value, "artifact");
        assert!(!out.partial);
        assert_eq!(out.retry_count, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausted_returns_partial_with_useful_data() {
        let executor = RetryExecutor::new(fast_policy(2));
        let token = CancellationToken::new();

        let out = executor
            .execute("analysis", &token, |_ctx| async {
                Err(AttemptFailure::with_partial(
                    EvolutionError::transient("analysis", "truncated"),
                    serde_json::json!({"analysis": "half done", "other": 1}),
                ))
            })
            .await
            .unwrap();

        assert!(out.partial);
        assert_eq!(out.retry_count, 1);
        assert!(out.last_error.unwrap().contains("truncated"));
    }

    #[tokio::test]
    async fn test_partial_without_markers_is_discarded() {
        let executor = RetryExecutor::new(fast_policy(2));
        let token = CancellationToken::new();

        let err = executor
            .execute("analysis", &token, |_ctx| async {
                Err(AttemptFailure::with_partial(
                    EvolutionError::transient("analysis", "bad"),
                    serde_json::json!({"unrelated": "x", "improvements": []}),
                ))
            })
            .await
            .unwrap_err();

        assert!(matches!(err, EvolutionError::TransientOracle { .. }));
    }

    #[tokio::test]
    async fn test_non_retryable_error_stops_immediately() {
        let executor = RetryExecutor::new(fast_policy(5));
        let calls = Arc::new(AtomicU32::new(0));
        let token = CancellationToken::new();

        let c = calls.clone();
        let err = executor
            .execute::<String, _, _>("gen", &token, move |_ctx| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(EvolutionError::fatal(1, "no baseline").into())
                }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, EvolutionError::FatalIteration { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_structured_failure_marks_next_attempt_strict() {
        let executor = RetryExecutor::new(fast_policy(2));
        let token = CancellationToken::new();

        let out = executor
            .execute("parse", &token, |ctx| async move {
                if ctx.strict {
                    Ok("parsed".to_string())
                } else {
                    Err(EvolutionError::StructuredOutput(crate::core::ParseError {
                        tried: vec!["direct_json".into()],
                        last_error: "eof".into(),
                    })
                    .into())
                }
            })
            .await
            .unwrap();

        assert_eq!(out.value, "parsed");
        assert_eq!(out.retry_count, 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_attempt() {
        let executor = RetryExecutor::new(fast_policy(3));
        let token = CancellationToken::new();
        token.cancel();

        let err = executor
            .execute("gen", &token, |_ctx| async { Ok("never".to_string()) })
            .await
            .unwrap_err();
        assert!(matches!(err, EvolutionError::Cancelled));
    }

    #[tokio::test]
    async fn test_attempt_timeout_is_transient() {
        let policy = RetryPolicy {
            call_timeout: Some(Duration::from_millis(10)),
            ..fast_policy(1)
        };
        let executor = RetryExecutor::new(policy);
        let token = CancellationToken::new();

        let err = executor
            .execute("score", &token, |_ctx| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok("late".to_string())
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }
}
