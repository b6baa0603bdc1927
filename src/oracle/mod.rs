//! 外部协作方接口：生成 Oracle、评分 Oracle、能力实现方
//!
//! 核心只知道它们可能很慢、可能失败；超时、重试与退避都由 `core::retry` 统一负责。

pub mod http;
pub mod simulated;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::{EvolutionError, PartialProgress};

pub use http::{HttpGenerationOracle, HttpImplementer, HttpScoringOracle};
pub use simulated::{
    KeywordScoringOracle, ScriptedScoringOracle, SimulatedGenerationOracle, SimulatedImplementer,
};

/// 测试用例：一次生成 + 一次评分
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCase {
    pub id: String,
    pub input: String,
    /// 部分维度需要的参考上下文（如原文）
    pub reference: Option<String>,
}

impl TestCase {
    pub fn new(id: impl Into<String>, input: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            input: input.into(),
            reference: None,
        }
    }

    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }
}

/// 生成 Oracle 产出的一个产物
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedArtifact {
    pub case_id: String,
    pub content: String,
    /// 生成时所用的指令版本
    pub instruction_version: u32,
}

/// 单个维度的评分；缺失 / 出错与 0 分可区分
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum DimensionScore {
    Scored(f64),
    /// 该维度需要参考上下文但未提供
    Missing,
    Errored(String),
}

impl DimensionScore {
    pub fn value(&self) -> Option<f64> {
        match self {
            DimensionScore::Scored(v) => Some(*v),
            _ => None,
        }
    }
}

/// 评分 Oracle 对一个产物给出的分数表
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreCard {
    pub dimensions: BTreeMap<String, DimensionScore>,
}

impl ScoreCard {
    pub fn from_scores<I, S>(scores: I) -> Self
    where
        I: IntoIterator<Item = (S, f64)>,
        S: Into<String>,
    {
        Self {
            dimensions: scores
                .into_iter()
                .map(|(k, v)| (k.into(), DimensionScore::Scored(v)))
                .collect(),
        }
    }

    /// 只含有效分数的维度
    pub fn scored(&self) -> impl Iterator<Item = (&str, f64)> {
        self.dimensions
            .iter()
            .filter_map(|(k, v)| v.value().map(|s| (k.as_str(), s)))
    }

    /// 至少有一个有效分数
    pub fn is_usable(&self) -> bool {
        self.scored().next().is_some()
    }
}

impl PartialProgress for ScoreCard {
    fn has_useful_data(&self) -> bool {
        self.is_usable()
    }
}

/// 能力路线的规格说明
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub target_gap: String,
    pub target_dimensions: Vec<String>,
    /// 预计提升（分）
    pub expected_improvement: f64,
    pub implementation_notes: String,
    /// 修改已部署能力时为 Some
    pub modifies: Option<String>,
}

/// 实现方的报告
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImplementationReport {
    pub success: bool,
    pub deployed: bool,
    pub test_pass_rate: f64,
    pub measured_latency_ms: f64,
    pub error: Option<String>,
}

impl PartialProgress for ImplementationReport {}

/// 生成 Oracle
#[async_trait]
pub trait GenerationOracle: Send + Sync {
    async fn generate(&self, instruction: &str, case: &TestCase) -> Result<String, EvolutionError>;
}

/// 评分 Oracle
#[async_trait]
pub trait ScoringOracle: Send + Sync {
    async fn score(&self, artifact: &str, reference: Option<&str>) -> Result<ScoreCard, EvolutionError>;
}

/// 能力实现方（黑盒：给出是否通过与测量数据）
#[async_trait]
pub trait Implementer: Send + Sync {
    async fn implement(&self, spec: &ToolSpec) -> Result<ImplementationReport, EvolutionError>;
}
