//! 进化引擎错误类型与恢复动作
//!
//! 与 RecoveryEngine 配合：根据 EvolutionError 决定 Retry / RetryWithPrompt / LogAndContinue / Abort。
//! 校验告警（ValidationWarning）不是错误，作为值随变异结果与迭代记录一起传递。

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 进化运行过程中可能出现的错误
#[derive(Error, Debug)]
pub enum EvolutionError {
    /// 外部 Oracle 的瞬时失败（超时、限流、网络），由重试包装器重试
    #[error("Transient oracle error ({oracle}): {message}")]
    TransientOracle { oracle: String, message: String },

    /// Oracle 响应无法解析为结构化结果
    #[error("Structured output error: {0}")]
    StructuredOutput(#[from] ParseError),

    /// 本轮无法继续（零产物 / 零有效评分 / 无法建立基线），终止整次运行
    #[error("Fatal iteration error at iteration {iteration}: {reason}")]
    FatalIteration { iteration: u32, reason: String },

    /// 健康告警累计超过阈值
    #[error("Health degradation: {0}")]
    HealthDegradation(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Mutation error: {0}")]
    Mutation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EvolutionError {
    pub fn transient(oracle: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TransientOracle {
            oracle: oracle.into(),
            message: message.into(),
        }
    }

    pub fn fatal(iteration: u32, reason: impl Into<String>) -> Self {
        Self::FatalIteration {
            iteration,
            reason: reason.into(),
        }
    }

    /// 是否值得重试（只有瞬时错误与结构化输出错误）
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EvolutionError::TransientOracle { .. } | EvolutionError::StructuredOutput(_)
        )
    }
}

/// 结构化输出解析失败：记录每个尝试过的策略名
#[derive(Error, Debug, Clone, PartialEq)]
#[error("no parse strategy succeeded (tried: {}): {last_error}", tried.join(", "))]
pub struct ParseError {
    pub tried: Vec<String>,
    pub last_error: String,
}

/// 变异校验告警：新产物缺失关键受保护元素
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationWarning {
    pub artifact_version: u32,
    pub missing: Vec<String>,
    pub message: String,
}

impl std::fmt::Display for ValidationWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "artifact v{} is missing protected elements [{}]: {}",
            self.artifact_version,
            self.missing.join(", "),
            self.message
        )
    }
}

/// 恢复引擎根据错误类型给出的建议动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// 原样重试（瞬时错误）
    Retry,
    /// 以更严格的指令重试（结构化输出错误）
    RetryWithPrompt(String),
    /// 记录后继续（单个用例失败、局部告警）
    LogAndContinue,
    /// 终止整次运行
    Abort,
}
