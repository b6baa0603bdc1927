//! 控制器状态：迭代阶段与终止状态
//!
//! `INIT → GENERATE → SCORE → ANALYZE → DESIGN → IMPLEMENT → ATTRIBUTE → DECIDE`，
//! DECIDE 之后回到 GENERATE 或进入 `COMPLETE(reason)` / `FAILED(reason)`。

use serde::{Deserialize, Serialize};

/// 单轮迭代内的阶段
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvolutionPhase {
    Init,
    Generate,
    Score,
    Analyze,
    Design,
    Implement,
    Attribute,
    Decide,
}

impl EvolutionPhase {
    /// 迭代内的下一个阶段；DECIDE 之后由停止判定决定，返回 None
    pub fn next(self) -> Option<EvolutionPhase> {
        use EvolutionPhase::*;
        match self {
            Init => Some(Generate),
            Generate => Some(Score),
            Score => Some(Analyze),
            Analyze => Some(Design),
            Design => Some(Implement),
            Implement => Some(Attribute),
            Attribute => Some(Decide),
            Decide => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EvolutionPhase::Init => "INIT",
            EvolutionPhase::Generate => "GENERATE",
            EvolutionPhase::Score => "SCORE",
            EvolutionPhase::Analyze => "ANALYZE",
            EvolutionPhase::Design => "DESIGN",
            EvolutionPhase::Implement => "IMPLEMENT",
            EvolutionPhase::Attribute => "ATTRIBUTE",
            EvolutionPhase::Decide => "DECIDE",
        }
    }
}

impl std::fmt::Display for EvolutionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 正常完成的原因
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionReason {
    Perfection,
    Degrading,
    MaxIterations,
    DiminishingReturns,
    /// 多次要求后仍找不到任何差距
    OptimumReached,
}

impl CompletionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompletionReason::Perfection => "perfection",
            CompletionReason::Degrading => "degrading",
            CompletionReason::MaxIterations => "max_iterations",
            CompletionReason::DiminishingReturns => "diminishing_returns",
            CompletionReason::OptimumReached => "optimum reached",
        }
    }
}

/// 失败原因
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "detail")]
pub enum FailureReason {
    /// 所有用例生成失败
    Generation(String),
    /// 零个有效评分
    Scoring(String),
    /// 健康告警累计超限
    Health(String),
    Cancelled,
    /// 其他致命错误（IO、配置等）
    Fatal(String),
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::Generation(_) => "generation",
            FailureReason::Scoring(_) => "scoring",
            FailureReason::Health(_) => "health",
            FailureReason::Cancelled => "cancelled",
            FailureReason::Fatal(_) => "fatal",
        }
    }

    pub fn detail(&self) -> Option<&str> {
        match self {
            FailureReason::Generation(d)
            | FailureReason::Scoring(d)
            | FailureReason::Health(d)
            | FailureReason::Fatal(d) => Some(d.as_str()),
            FailureReason::Cancelled => None,
        }
    }
}

/// 终止状态
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "reason")]
pub enum TerminalState {
    Complete(CompletionReason),
    Failed(FailureReason),
}

impl TerminalState {
    pub fn is_complete(&self) -> bool {
        matches!(self, TerminalState::Complete(_))
    }
}

impl std::fmt::Display for TerminalState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TerminalState::Complete(r) => write!(f, "COMPLETE({})", r.as_str()),
            TerminalState::Failed(r) => match r.detail() {
                Some(d) => write!(f, "FAILED({}: {})", r.as_str(), d),
                None => write!(f, "FAILED({})", r.as_str()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_order_ends_at_decide() {
        let mut phase = EvolutionPhase::Init;
        let mut seen = vec![phase];
        while let Some(next) = phase.next() {
            seen.push(next);
            phase = next;
        }
        assert_eq!(seen.len(), 8);
        assert_eq!(seen.last(), Some(&EvolutionPhase::Decide));
    }

    #[test]
    fn test_terminal_display() {
        let done = TerminalState::Complete(CompletionReason::Perfection);
        assert_eq!(done.to_string(), "COMPLETE(perfection)");
        let failed = TerminalState::Failed(FailureReason::Health("3 warnings".into()));
        assert_eq!(failed.to_string(), "FAILED(health: 3 warnings)");
    }
}
