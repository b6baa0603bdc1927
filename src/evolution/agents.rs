//! 阶段代理：Reflection / Improvement / Implementation
//!
//! 每个代理能处理的请求是封闭的：请求类型实现 `AgentRequest` 并声明自己的动作，
//! 代理对每种请求实现 `Process<Req>`，返回类型化的结果。向代理发送它不支持的请求无法通过编译。

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::core::EvolutionError;
use crate::evolution::analyzer::{derive_signals, dimension_trend, AnalysisRequest, GapAnalyzer};
use crate::evolution::attribution::AttributionTracker;
use crate::evolution::executor::{ImplementationStage, ImplementationSummary};
use crate::evolution::planner::{DesignContext, DesignOutcome, ImprovementDesigner};
use crate::evolution::registry::PatternRegistry;
use crate::evolution::types::{
    ChangeSpec, EvaluationSnapshot, Gap, IterationComparison, RootCause, ScoreDelta,
};
use crate::mutation::{ArtifactLineage, InstructionArtifact, ValidationReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReflectionAction {
    AnalyzeEvaluations,
    CompareIterations,
    IdentifyRootCauses,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImprovementAction {
    DesignImprovements,
    PrioritizeImprovements,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImplementationAction {
    ImplementImprovements,
    TestImplementation,
}

/// 代理动作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "agent", content = "action", rename_all = "snake_case")]
pub enum AgentAction {
    Reflection(ReflectionAction),
    Improvement(ImprovementAction),
    Implementation(ImplementationAction),
}

impl AgentAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentAction::Reflection(ReflectionAction::AnalyzeEvaluations) => "reflection/analyze_evaluations",
            AgentAction::Reflection(ReflectionAction::CompareIterations) => "reflection/compare_iterations",
            AgentAction::Reflection(ReflectionAction::IdentifyRootCauses) => "reflection/identify_root_causes",
            AgentAction::Improvement(ImprovementAction::DesignImprovements) => "improvement/design_improvements",
            AgentAction::Improvement(ImprovementAction::PrioritizeImprovements) => {
                "improvement/prioritize_improvements"
            }
            AgentAction::Implementation(ImplementationAction::ImplementImprovements) => {
                "implementation/implement_improvements"
            }
            AgentAction::Implementation(ImplementationAction::TestImplementation) => {
                "implementation/test_implementation"
            }
        }
    }
}

impl std::fmt::Display for AgentAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 代理请求：声明自己对应的动作
pub trait AgentRequest {
    const ACTION: AgentAction;
}

/// 代理处理请求的统一契约
#[allow(async_fn_in_trait)]
pub trait Process<Req: AgentRequest> {
    type Output;

    async fn process(&mut self, request: Req) -> Result<Self::Output, EvolutionError>;
}

// ---------------------------------------------------------------------------
// Reflection
// ---------------------------------------------------------------------------

/// 分析评分，找出差距；找不到时按「看得更仔细」重试
pub struct AnalyzeEvaluations<'a> {
    pub iteration: u32,
    pub snapshot: EvaluationSnapshot,
    pub history: Vec<EvaluationSnapshot>,
    pub cancel: &'a CancellationToken,
}

impl AgentRequest for AnalyzeEvaluations<'_> {
    const ACTION: AgentAction = AgentAction::Reflection(ReflectionAction::AnalyzeEvaluations);
}

pub struct CompareIterations<'a> {
    pub previous: &'a EvaluationSnapshot,
    pub current: &'a EvaluationSnapshot,
}

impl AgentRequest for CompareIterations<'_> {
    const ACTION: AgentAction = AgentAction::Reflection(ReflectionAction::CompareIterations);
}

pub struct IdentifyRootCauses<'a> {
    pub gaps: &'a [Gap],
    pub snapshot: &'a EvaluationSnapshot,
    pub history: &'a [EvaluationSnapshot],
}

impl AgentRequest for IdentifyRootCauses<'_> {
    const ACTION: AgentAction = AgentAction::Reflection(ReflectionAction::IdentifyRootCauses);
}

/// 反思代理
pub struct ReflectionAgent {
    analyzer: Arc<dyn GapAnalyzer>,
    /// 首次分析之外的重试次数
    analysis_retries: u32,
    threshold: f64,
}

impl ReflectionAgent {
    pub fn new(analyzer: Arc<dyn GapAnalyzer>, analysis_retries: u32, threshold: f64) -> Self {
        Self {
            analyzer,
            analysis_retries,
            threshold,
        }
    }
}

impl Process<AnalyzeEvaluations<'_>> for ReflectionAgent {
    type Output = Vec<Gap>;

    async fn process(&mut self, request: AnalyzeEvaluations<'_>) -> Result<Vec<Gap>, EvolutionError> {
        let mut analysis = AnalysisRequest {
            iteration: request.iteration,
            snapshot: request.snapshot,
            history: request.history,
            attempt: 0,
        };
        loop {
            if request.cancel.is_cancelled() {
                return Err(EvolutionError::Cancelled);
            }
            let gaps = self.analyzer.analyze(&analysis, request.cancel).await?;
            if !gaps.is_empty() {
                tracing::info!(
                    "Iteration {}: {} gaps identified (attempt {})",
                    analysis.iteration,
                    gaps.len(),
                    analysis.attempt + 1
                );
                return Ok(gaps);
            }
            if analysis.attempt >= self.analysis_retries {
                tracing::info!(
                    "Iteration {}: no gaps after {} attempts",
                    analysis.iteration,
                    analysis.attempt + 1
                );
                return Ok(gaps);
            }
            analysis.attempt += 1;
            tracing::info!("No gaps found, re-analyzing with a closer look (attempt {})", analysis.attempt + 1);
        }
    }
}

impl Process<CompareIterations<'_>> for ReflectionAgent {
    type Output = IterationComparison;

    async fn process(&mut self, request: CompareIterations<'_>) -> Result<IterationComparison, EvolutionError> {
        let (previous, current) = (request.previous, request.current);
        let mut comparison = IterationComparison {
            previous_iteration: previous.iteration,
            current_iteration: current.iteration,
            aggregate_delta: current.aggregate() - previous.aggregate(),
            ..Default::default()
        };
        for (dim, after) in &current.scores {
            let Some(before) = previous.get(dim) else {
                continue;
            };
            let delta = ScoreDelta::new(dim.clone(), before, *after);
            if delta.delta > 0.0 {
                comparison.improved.push(dim.clone());
            } else if delta.delta < 0.0 {
                comparison.regressed.push(dim.clone());
            }
            comparison.deltas.push(delta);
        }
        Ok(comparison)
    }
}

impl Process<IdentifyRootCauses<'_>> for ReflectionAgent {
    type Output = Vec<RootCause>;

    async fn process(&mut self, request: IdentifyRootCauses<'_>) -> Result<Vec<RootCause>, EvolutionError> {
        let causes = request
            .gaps
            .iter()
            .map(|gap| {
                let recurring = request
                    .history
                    .iter()
                    .rev()
                    .take(2)
                    .any(|s| s.get(&gap.dimension).is_some_and(|v| v < self.threshold));
                let trend = dimension_trend(request.history, request.snapshot, &gap.dimension);
                let signals = derive_signals(&gap.dimension, gap.current_score, self.threshold, trend);
                let mut cause = signals.describe();
                if let Some(t) = trend {
                    if t.slope < 0.0 {
                        cause.push_str(&format!("; declining ({:+.2}/iteration)", t.slope));
                    }
                }
                RootCause {
                    gap_id: gap.id.clone(),
                    dimension: gap.dimension.clone(),
                    cause,
                    recurring,
                }
            })
            .collect();
        Ok(causes)
    }
}

// ---------------------------------------------------------------------------
// Improvement
// ---------------------------------------------------------------------------

pub struct PrioritizeImprovements<'a> {
    pub gaps: Vec<Gap>,
    pub root_causes: &'a [RootCause],
}

impl AgentRequest for PrioritizeImprovements<'_> {
    const ACTION: AgentAction = AgentAction::Improvement(ImprovementAction::PrioritizeImprovements);
}

pub struct DesignImprovements<'a> {
    pub iteration: u32,
    pub gaps: &'a [Gap],
    pub artifact: &'a InstructionArtifact,
    pub registry: Option<&'a PatternRegistry>,
    pub deployed_capabilities: &'a [String],
}

impl AgentRequest for DesignImprovements<'_> {
    const ACTION: AgentAction = AgentAction::Improvement(ImprovementAction::DesignImprovements);
}

/// 改进代理
pub struct ImprovementAgent {
    designer: ImprovementDesigner,
}

impl ImprovementAgent {
    pub fn new(designer: ImprovementDesigner) -> Self {
        Self { designer }
    }

    pub fn designer(&self) -> &ImprovementDesigner {
        &self.designer
    }
}

impl Process<PrioritizeImprovements<'_>> for ImprovementAgent {
    type Output = Vec<Gap>;

    /// 优先级高者在前；同级时反复出现的差距在前，再按当前分数升序
    async fn process(&mut self, request: PrioritizeImprovements<'_>) -> Result<Vec<Gap>, EvolutionError> {
        let recurring = |gap: &Gap| {
            request
                .root_causes
                .iter()
                .any(|c| c.gap_id == gap.id && c.recurring)
        };
        let mut gaps = request.gaps;
        gaps.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(recurring(b).cmp(&recurring(a)))
                .then(a.current_score.total_cmp(&b.current_score))
        });
        Ok(gaps)
    }
}

impl Process<DesignImprovements<'_>> for ImprovementAgent {
    type Output = DesignOutcome;

    async fn process(&mut self, request: DesignImprovements<'_>) -> Result<DesignOutcome, EvolutionError> {
        let step = self.designer.scheduler().step(request.iteration);
        let ctx = DesignContext {
            iteration: request.iteration,
            step: &step,
            artifact: request.artifact,
            registry: request.registry,
            deployed_capabilities: request.deployed_capabilities,
        };
        Ok(self.designer.design(request.gaps, &ctx))
    }
}

// ---------------------------------------------------------------------------
// Implementation
// ---------------------------------------------------------------------------

pub struct ImplementImprovements<'a> {
    pub iteration: u32,
    pub changes: &'a [ChangeSpec],
    pub lineage: &'a mut ArtifactLineage,
    pub tracker: &'a RwLock<AttributionTracker>,
    pub deployed: &'a mut BTreeMap<String, String>,
    pub cancel: &'a CancellationToken,
}

impl AgentRequest for ImplementImprovements<'_> {
    const ACTION: AgentAction = AgentAction::Implementation(ImplementationAction::ImplementImprovements);
}

/// 复核某个版本：关键占位符与 v0 基线元素是否都在
pub struct TestImplementation<'a> {
    pub lineage: &'a ArtifactLineage,
    pub version: u32,
}

impl AgentRequest for TestImplementation<'_> {
    const ACTION: AgentAction = AgentAction::Implementation(ImplementationAction::TestImplementation);
}

/// 实现代理
pub struct ImplementationAgent {
    stage: ImplementationStage,
}

impl ImplementationAgent {
    pub fn new(stage: ImplementationStage) -> Self {
        Self { stage }
    }
}

impl Process<ImplementImprovements<'_>> for ImplementationAgent {
    type Output = ImplementationSummary;

    async fn process(&mut self, request: ImplementImprovements<'_>) -> Result<ImplementationSummary, EvolutionError> {
        self.stage
            .implement(
                request.iteration,
                request.changes,
                request.lineage,
                request.tracker,
                request.deployed,
                request.cancel,
            )
            .await
    }
}

impl Process<TestImplementation<'_>> for ImplementationAgent {
    type Output = ValidationReport;

    async fn process(&mut self, request: TestImplementation<'_>) -> Result<ValidationReport, EvolutionError> {
        let artifact = request
            .lineage
            .get(request.version)
            .ok_or_else(|| EvolutionError::NotFound(format!("artifact v{}", request.version)))?;
        let report = self.stage.engine().validate(&artifact.text, Some(request.lineage));
        if !report.is_clean() {
            tracing::warn!(
                "artifact v{} is missing protected elements: {}",
                request.version,
                report.all_missing().join(", ")
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evolution::analyzer::{AnalyzerSettings, RubricGapAnalyzer};
    use crate::evolution::types::{Priority, SolutionRoute};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn snapshot(iteration: u32, scores: &[(&str, f64)]) -> EvaluationSnapshot {
        EvaluationSnapshot {
            iteration,
            scores: scores.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
            scored_cases: 1,
            failed_cases: vec![],
        }
    }

    fn gap(id: &str, dimension: &str, score: f64, priority: Priority) -> Gap {
        Gap {
            id: id.into(),
            description: String::new(),
            dimension: dimension.into(),
            current_score: score,
            target_score: 4.8,
            route: SolutionRoute::Prompt,
            priority,
            rationale: String::new(),
        }
    }

    /// 前 n 次返回空列表的分析器
    struct Reluctant {
        empty_for: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl GapAnalyzer for Reluctant {
        async fn analyze(&self, request: &AnalysisRequest, _: &CancellationToken) -> Result<Vec<Gap>, EvolutionError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            assert_eq!(request.attempt, n);
            if n < self.empty_for {
                return Ok(vec![]);
            }
            Ok(vec![gap("g", "content_accuracy", 4.0, Priority::Medium)])
        }
    }

    #[test]
    fn test_actions_are_closed_per_agent() {
        assert_eq!(
            AnalyzeEvaluations::ACTION,
            AgentAction::Reflection(ReflectionAction::AnalyzeEvaluations)
        );
        assert_eq!(
            TestImplementation::ACTION.to_string(),
            "implementation/test_implementation"
        );
    }

    #[tokio::test]
    async fn test_analysis_retries_until_gaps() {
        let analyzer = Arc::new(Reluctant {
            empty_for: 2,
            calls: AtomicU32::new(0),
        });
        let mut agent = ReflectionAgent::new(analyzer.clone(), 3, 4.5);
        let token = CancellationToken::new();
        let gaps = agent
            .process(AnalyzeEvaluations {
                iteration: 1,
                snapshot: snapshot(1, &[("content_accuracy", 4.0)]),
                history: vec![],
                cancel: &token,
            })
            .await
            .unwrap();
        assert_eq!(gaps.len(), 1);
        assert_eq!(analyzer.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_analysis_gives_up_after_budget() {
        let analyzer = Arc::new(Reluctant {
            empty_for: 10,
            calls: AtomicU32::new(0),
        });
        let mut agent = ReflectionAgent::new(analyzer.clone(), 3, 4.5);
        let token = CancellationToken::new();
        let gaps = agent
            .process(AnalyzeEvaluations {
                iteration: 1,
                snapshot: snapshot(1, &[("content_accuracy", 5.0)]),
                history: vec![],
                cancel: &token,
            })
            .await
            .unwrap();
        assert!(gaps.is_empty());
        assert_eq!(analyzer.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_compare_and_root_causes() {
        let mut agent = ReflectionAgent::new(
            Arc::new(RubricGapAnalyzer::new(AnalyzerSettings::default())),
            3,
            4.5,
        );
        let history = vec![
            snapshot(1, &[("content_accuracy", 3.8), ("visual_design", 4.0)]),
            snapshot(2, &[("content_accuracy", 3.6), ("visual_design", 4.6)]),
        ];
        let current = snapshot(3, &[("content_accuracy", 3.4), ("visual_design", 4.8)]);

        let cmp = agent
            .process(CompareIterations {
                previous: &history[1],
                current: &current,
            })
            .await
            .unwrap();
        assert_eq!(cmp.improved, vec!["visual_design".to_string()]);
        assert_eq!(cmp.regressed, vec!["content_accuracy".to_string()]);

        let gaps = vec![gap("g1", "content_accuracy", 3.4, Priority::High)];
        let causes = agent
            .process(IdentifyRootCauses {
                gaps: &gaps,
                snapshot: &current,
                history: &history,
            })
            .await
            .unwrap();
        assert!(causes[0].recurring);
        assert!(causes[0].cause.contains("declining"));
    }

    #[tokio::test]
    async fn test_prioritize_puts_recurring_first_within_priority() {
        let engine = crate::mutation::MutationEngine::new(crate::mutation::Strictness::Lenient, vec![]).unwrap();
        let designer = ImprovementDesigner::new(
            engine,
            crate::evolution::scheduler::AdaptiveScheduler::new(Default::default(), 5),
            3,
            false,
            None,
        );
        let mut agent = ImprovementAgent::new(designer);
        let gaps = vec![
            gap("low", "a", 4.6, Priority::Low),
            gap("fresh", "b", 3.0, Priority::High),
            gap("again", "c", 3.5, Priority::High),
        ];
        let causes = vec![RootCause {
            gap_id: "again".into(),
            dimension: "c".into(),
            cause: String::new(),
            recurring: true,
        }];
        let ordered = agent
            .process(PrioritizeImprovements {
                gaps,
                root_causes: &causes,
            })
            .await
            .unwrap();
        let ids: Vec<&str> = ordered.iter().map(|g| g.id.as_str()).collect();
        assert_eq!(ids, vec!["again", "fresh", "low"]);
    }
}
