//! 错误恢复引擎
//!
//! 根据 EvolutionError 类型返回 RecoveryAction，供控制器与重试包装器决定是重试、换更严格的提示、记录继续还是终止。

use crate::core::{EvolutionError, RecoveryAction};

/// 要求 Oracle 只输出可解析结构的严格指令
pub const STRICT_STRUCTURE_INSTRUCTION: &str = "CRITICAL: Your previous response could not be parsed. \
Respond with ONLY a single valid JSON object. No markdown fences, no commentary, \
no text before or after the JSON.";

/// 语义化错误恢复：将错误映射为可执行动作
#[derive(Debug, Default)]
pub struct RecoveryEngine;

impl RecoveryEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn handle(&self, err: &EvolutionError) -> RecoveryAction {
        match err {
            EvolutionError::TransientOracle { .. } => RecoveryAction::Retry,
            EvolutionError::StructuredOutput(e) => RecoveryAction::RetryWithPrompt(format!(
                "{STRICT_STRUCTURE_INSTRUCTION} (parse failure: {})",
                e.last_error
            )),
            EvolutionError::Mutation(_) | EvolutionError::NotFound(_) => {
                RecoveryAction::LogAndContinue
            }
            EvolutionError::FatalIteration { .. }
            | EvolutionError::HealthDegradation(_)
            | EvolutionError::Cancelled
            | EvolutionError::Config(_) => RecoveryAction::Abort,
            EvolutionError::Io(_) | EvolutionError::Serialization(_) => RecoveryAction::Abort,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ParseError;

    #[test]
    fn test_recovery_transient_retries() {
        let engine = RecoveryEngine::new();
        let err = EvolutionError::transient("scoring", "timeout");
        assert_eq!(engine.handle(&err), RecoveryAction::Retry);
    }

    #[test]
    fn test_recovery_structured_output_uses_strict_prompt() {
        let engine = RecoveryEngine::new();
        let err = EvolutionError::StructuredOutput(ParseError {
            tried: vec!["direct_json".into()],
            last_error: "expected value".into(),
        });
        match engine.handle(&err) {
            RecoveryAction::RetryWithPrompt(msg) => {
                assert!(msg.contains("ONLY a single valid JSON object"));
                assert!(msg.contains("expected value"));
            }
            other => panic!("Expected RetryWithPrompt, got {:?}", other),
        }
    }

    #[test]
    fn test_recovery_fatal_aborts() {
        let engine = RecoveryEngine::new();
        let err = EvolutionError::fatal(2, "zero scored results");
        assert_eq!(engine.handle(&err), RecoveryAction::Abort);
        assert_eq!(engine.handle(&EvolutionError::Cancelled), RecoveryAction::Abort);
    }

    #[test]
    fn test_recovery_mutation_logs_and_continues() {
        let engine = RecoveryEngine::new();
        let err = EvolutionError::Mutation("overlapping operation".into());
        assert_eq!(engine.handle(&err), RecoveryAction::LogAndContinue);
    }
}
