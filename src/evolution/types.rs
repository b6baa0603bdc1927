use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::core::ValidationWarning;
use crate::mutation::MutationPlan;
use crate::oracle::{GeneratedArtifact, ImplementationReport, ToolSpec};

/// 某轮迭代的评分快照：各维度在全部用例上的平均分
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationSnapshot {
    pub iteration: u32,
    pub scores: BTreeMap<String, f64>,
    /// 参与平均的有效评分数
    pub scored_cases: usize,
    /// 评分失败或无有效维度的用例
    pub failed_cases: Vec<String>,
}

impl EvaluationSnapshot {
    /// 各维度的平均值；无维度时为 0
    pub fn aggregate(&self) -> f64 {
        if self.scores.is_empty() {
            return 0.0;
        }
        self.scores.values().sum::<f64>() / self.scores.len() as f64
    }

    pub fn get(&self, dimension: &str) -> Option<f64> {
        self.scores.get(dimension).copied()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SolutionRoute {
    Prompt,
    Tool,
    Both,
}

impl SolutionRoute {
    pub fn needs_prompt(&self) -> bool {
        matches!(self, SolutionRoute::Prompt | SolutionRoute::Both)
    }

    pub fn needs_tool(&self) -> bool {
        matches!(self, SolutionRoute::Tool | SolutionRoute::Both)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Priority {
    /// < 4.0 高，4.0–4.5 中，其余低
    pub fn from_score(score: f64) -> Self {
        if score < 4.0 {
            Priority::High
        } else if score < 4.5 {
            Priority::Medium
        } else {
            Priority::Low
        }
    }
}

/// 检测到的质量差距；创建后不再修改
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Gap {
    pub id: String,
    pub description: String,
    pub dimension: String,
    pub current_score: f64,
    pub target_score: f64,
    pub route: SolutionRoute,
    pub priority: Priority,
    pub rationale: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImprovementType {
    TextMutation,
    CapabilityCreation,
    CapabilityModification,
    ParameterTuning,
}

impl ImprovementType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImprovementType::TextMutation => "prompt_evolution",
            ImprovementType::CapabilityCreation => "tool_creation",
            ImprovementType::CapabilityModification => "tool_modification",
            ImprovementType::ParameterTuning => "parameter_tuning",
        }
    }
}

impl std::fmt::Display for ImprovementType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 改进的实现载荷
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ImprovementPayload {
    Mutations {
        plan: MutationPlan,
        /// 应用后的产物版本；严格模式丢弃时为 None
        resulting_version: Option<u32>,
    },
    Capability {
        spec: ToolSpec,
        report: Option<ImplementationReport>,
    },
    Parameters {
        values: BTreeMap<String, f64>,
    },
}

/// 由前后两个快照推导出的分数变化
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreDelta {
    pub dimension: String,
    pub before: f64,
    pub after: f64,
    pub delta: f64,
    /// before > 0 时为 delta / before × 100，否则 0
    pub percentage: f64,
}

impl ScoreDelta {
    pub fn new(dimension: impl Into<String>, before: f64, after: f64) -> Self {
        let delta = after - before;
        let percentage = if before > 0.0 { delta / before * 100.0 } else { 0.0 };
        Self {
            dimension: dimension.into(),
            before,
            after,
            delta,
            percentage,
        }
    }
}

/// 改进的归因结果；只写入一次
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImprovementOutcome {
    pub before_iteration: u32,
    pub after_iteration: u32,
    pub deltas: Vec<ScoreDelta>,
    pub success: bool,
    pub failure_reason: Option<String>,
    pub attributed_at: DateTime<Utc>,
}

impl ImprovementOutcome {
    pub fn mean_delta(&self) -> f64 {
        if self.deltas.is_empty() {
            return 0.0;
        }
        self.deltas.iter().map(|d| d.delta).sum::<f64>() / self.deltas.len() as f64
    }
}

/// 已登记的改进
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Improvement {
    pub id: String,
    pub iteration: u32,
    pub improvement_type: ImprovementType,
    pub name: String,
    pub target_gap: String,
    pub target_dimensions: Vec<String>,
    pub expected_effect: String,
    pub payload: ImprovementPayload,
    pub parents: Vec<String>,
    pub children: Vec<String>,
    pub outcome: Option<ImprovementOutcome>,
    pub registered_at: DateTime<Utc>,
}

/// 改进设计器的输出：待实现的变更
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "route", rename_all = "snake_case")]
pub enum ChangeSpec {
    TextMutation {
        gap_id: String,
        dimension: String,
        name: String,
        plan: MutationPlan,
        /// 选用的增强类型名
        enhancements: Vec<String>,
        rationale: String,
    },
    Capability {
        gap_id: String,
        spec: ToolSpec,
    },
}

impl ChangeSpec {
    pub fn gap_id(&self) -> &str {
        match self {
            ChangeSpec::TextMutation { gap_id, .. } | ChangeSpec::Capability { gap_id, .. } => gap_id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            ChangeSpec::TextMutation { name, .. } => name,
            ChangeSpec::Capability { spec, .. } => &spec.name,
        }
    }
}

/// 相邻两轮快照的对比
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IterationComparison {
    pub previous_iteration: u32,
    pub current_iteration: u32,
    pub aggregate_delta: f64,
    pub deltas: Vec<ScoreDelta>,
    pub improved: Vec<String>,
    pub regressed: Vec<String>,
}

/// 差距的成因判断
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootCause {
    pub gap_id: String,
    pub dimension: String,
    pub cause: String,
    /// 之前的快照里同一维度也低于阈值
    pub recurring: bool,
}

/// 一轮迭代的完整记录；ATTRIBUTE 之后关闭，不再修改
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    pub iteration: u32,
    /// 本轮生成所用的指令版本
    pub artifact_version: u32,
    pub temperature: f64,
    pub creativity: String,
    pub generated: Vec<GeneratedArtifact>,
    pub generation_failures: Vec<String>,
    pub snapshot: Option<EvaluationSnapshot>,
    pub gaps: Vec<Gap>,
    pub comparison: Option<IterationComparison>,
    pub root_causes: Vec<RootCause>,
    pub changes: Vec<ChangeSpec>,
    /// 改进设计时登记册给出的提醒
    pub registry_warnings: Vec<String>,
    /// 本轮登记的改进 id
    pub improvements: Vec<String>,
    /// 本轮归因的改进 id（上一轮登记的）
    pub attributed: Vec<String>,
    pub validation_warnings: Vec<ValidationWarning>,
    pub health_warnings: Vec<String>,
    /// 总分提升达到 improvement_threshold
    pub improved: bool,
    pub closed: bool,
}

impl IterationRecord {
    pub fn aggregate(&self) -> Option<f64> {
        self.snapshot.as_ref().map(|s| s.aggregate())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_score_delta_percentage() {
        let d = ScoreDelta::new("coherence", 4.0, 4.5);
        assert!((d.delta - 0.5).abs() < 1e-9);
        assert!((d.percentage - 12.5).abs() < 1e-9);
        let zero = ScoreDelta::new("coherence", 0.0, 1.0);
        assert_eq!(zero.percentage, 0.0);
    }

    #[test]
    fn test_priority_tiers() {
        assert_eq!(Priority::from_score(3.9), Priority::High);
        assert_eq!(Priority::from_score(4.0), Priority::Medium);
        assert_eq!(Priority::from_score(4.5), Priority::Low);
    }

    #[test]
    fn test_snapshot_aggregate() {
        let snap = EvaluationSnapshot {
            iteration: 1,
            scores: [("a".to_string(), 3.0), ("b".to_string(), 4.0)].into_iter().collect(),
            scored_cases: 2,
            failed_cases: vec![],
        };
        assert!((snap.aggregate() - 3.5).abs() < 1e-9);
    }
}
