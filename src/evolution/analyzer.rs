//! 差距分析：评分快照 + 历史 → 排序并分好路线的差距列表
//!
//! 约定：
//! - 低于阈值（默认 4.5/5.0）的维度必须出现
//! - 即使全部高分，也至少给出最低的 `min_gaps` 个维度（已满分的维度除外）
//! - 路线由确定性规则决定：提示信号与能力信号计数比较，平局归于 prompt
//!
//! `RubricGapAnalyzer` 纯规则实现；`LlmGapAnalyzer` 让 LLM 补充描述与信号，再与规则结果合并。

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::config::EvolutionSection;
use crate::core::{EvolutionError, RetryExecutor};
use crate::evolution::types::{EvaluationSnapshot, Gap, Priority, SolutionRoute};
use crate::llm::{request_structured, schema_hint, LlmClient, Message};

/// 线性趋势
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Trend {
    pub slope: f64,
    pub r_squared: f64,
}

/// 最小二乘拟合；少于 3 个点时返回 None
pub fn linear_trend(points: &[(f64, f64)]) -> Option<Trend> {
    if points.len() < 3 {
        return None;
    }
    let n = points.len() as f64;
    let mean_x = points.iter().map(|p| p.0).sum::<f64>() / n;
    let mean_y = points.iter().map(|p| p.1).sum::<f64>() / n;
    let sxx: f64 = points.iter().map(|p| (p.0 - mean_x).powi(2)).sum();
    let sxy: f64 = points.iter().map(|p| (p.0 - mean_x) * (p.1 - mean_y)).sum();
    let syy: f64 = points.iter().map(|p| (p.1 - mean_y).powi(2)).sum();
    if sxx == 0.0 {
        return None;
    }
    let slope = sxy / sxx;
    // 常数序列：拟合完美
    let r_squared = if syy == 0.0 { 1.0 } else { (sxy * sxy) / (sxx * syy) };
    Some(Trend { slope, r_squared })
}

/// 某维度在历史 + 当前快照中的趋势
pub fn dimension_trend(history: &[EvaluationSnapshot], current: &EvaluationSnapshot, dimension: &str) -> Option<Trend> {
    let points: Vec<(f64, f64)> = history
        .iter()
        .chain(std::iter::once(current))
        .filter_map(|s| s.get(dimension).map(|v| (s.iteration as f64, v)))
        .collect();
    linear_trend(&points)
}

/// 路线判定信号
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct RouteSignals {
    pub better_instructions: bool,
    pub format_changes: bool,
    pub additional_constraints: bool,
    pub data_processing: bool,
    pub external_resources: bool,
    pub validation_checking: bool,
}

impl RouteSignals {
    pub fn prompt_count(&self) -> usize {
        [self.better_instructions, self.format_changes, self.additional_constraints]
            .iter()
            .filter(|b| **b)
            .count()
    }

    pub fn capability_count(&self) -> usize {
        [self.data_processing, self.external_resources, self.validation_checking]
            .iter()
            .filter(|b| **b)
            .count()
    }

    /// 无能力信号 → prompt；无提示信号 → tool；能力信号更多 → both；其余（含平局）→ prompt
    pub fn route(&self) -> SolutionRoute {
        let p = self.prompt_count();
        let c = self.capability_count();
        if c == 0 {
            SolutionRoute::Prompt
        } else if p == 0 {
            SolutionRoute::Tool
        } else if c > p {
            SolutionRoute::Both
        } else {
            SolutionRoute::Prompt
        }
    }

    pub fn describe(&self) -> String {
        let mut prompt = Vec::new();
        let mut capability = Vec::new();
        if self.better_instructions {
            prompt.push("better_instructions");
        }
        if self.format_changes {
            prompt.push("format_changes");
        }
        if self.additional_constraints {
            prompt.push("additional_constraints");
        }
        if self.data_processing {
            capability.push("data_processing");
        }
        if self.external_resources {
            capability.push("external_resources");
        }
        if self.validation_checking {
            capability.push("validation_checking");
        }
        format!(
            "{} prompt signal(s) [{}] vs {} capability signal(s) [{}]",
            prompt.len(),
            prompt.join(", "),
            capability.len(),
            capability.join(", ")
        )
    }
}

fn has_any(dimension: &str, words: &[&str]) -> bool {
    words.iter().any(|w| dimension.contains(w))
}

/// 由维度名与趋势推导信号
pub fn derive_signals(dimension: &str, score: f64, threshold: f64, trend: Option<Trend>) -> RouteSignals {
    let d = dimension.to_lowercase();
    let visual_only = has_any(&d, &["visual", "image", "layout", "design"]);
    RouteSignals {
        better_instructions: !visual_only,
        format_changes: has_any(&d, &["coherence", "structure", "format", "consistency", "flow", "layout", "design"]),
        additional_constraints: has_any(&d, &["accura", "complete", "fact", "credib", "relevance"]),
        data_processing: has_any(&d, &["visual", "image", "chart", "data", "layout"]),
        external_resources: has_any(&d, &["credib", "citation", "source", "reference"]),
        // 已有足够历史却仍在原地或下降，说明光改指令不够
        validation_checking: trend.is_some_and(|t| t.slope <= 0.0) && score < threshold - 0.5,
    }
}

/// 一次分析请求
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub iteration: u32,
    pub snapshot: EvaluationSnapshot,
    /// 之前各轮的快照（按迭代升序）
    pub history: Vec<EvaluationSnapshot>,
    /// 第几次重试（0 为首次）；> 0 时要求分析器看得更仔细
    pub attempt: u32,
}

impl AnalysisRequest {
    pub fn look_harder(&self) -> bool {
        self.attempt > 0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnalyzerSettings {
    pub threshold: f64,
    pub min_gaps: usize,
    pub max_score: f64,
}

impl Default for AnalyzerSettings {
    fn default() -> Self {
        Self {
            threshold: 4.5,
            min_gaps: 3,
            max_score: 5.0,
        }
    }
}

impl From<&EvolutionSection> for AnalyzerSettings {
    fn from(section: &EvolutionSection) -> Self {
        Self {
            threshold: section.gap_threshold,
            min_gaps: section.min_gaps,
            max_score: section.max_score,
        }
    }
}

impl AnalyzerSettings {
    /// 目标分：按 5 分制落在 4.8–5.0
    fn target_for(&self, current: f64) -> f64 {
        let scale = self.max_score / 5.0;
        (current + 0.5 * scale).clamp(4.8 * scale, self.max_score)
    }

    fn priority_for(&self, current: f64) -> Priority {
        Priority::from_score(current * 5.0 / self.max_score)
    }
}

/// 差距分析器
#[async_trait]
pub trait GapAnalyzer: Send + Sync {
    async fn analyze(&self, request: &AnalysisRequest, cancel: &CancellationToken) -> Result<Vec<Gap>, EvolutionError>;
}

/// 纯规则分析器
#[derive(Debug, Clone, Default)]
pub struct RubricGapAnalyzer {
    settings: AnalyzerSettings,
}

impl RubricGapAnalyzer {
    pub fn new(settings: AnalyzerSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &AnalyzerSettings {
        &self.settings
    }

    pub fn build_gap(&self, request: &AnalysisRequest, index: usize, dimension: &str, current: f64) -> Gap {
        let trend = dimension_trend(&request.history, &request.snapshot, dimension);
        let signals = derive_signals(dimension, current, self.settings.threshold, trend);
        let trend_note = trend
            .map(|t| format!(", trend {:+.2}/iter (R² {:.2})", t.slope, t.r_squared))
            .unwrap_or_default();
        let below = current < self.settings.threshold;
        Gap {
            id: format!("gap_{:03}_{:02}", request.iteration, index + 1),
            description: format!(
                "{} at {:.2}/{:.1}{}{}",
                dimension,
                current,
                self.settings.max_score,
                if below { " is below threshold" } else { " is among the lowest dimensions" },
                trend_note
            ),
            dimension: dimension.to_string(),
            current_score: current,
            target_score: self.settings.target_for(current),
            route: signals.route(),
            priority: self.settings.priority_for(current),
            rationale: signals.describe(),
        }
    }

    /// 阈值以下全部入选，不足 min_gaps 时补上最低的未满分维度
    pub fn rubric_gaps(&self, request: &AnalysisRequest) -> Vec<Gap> {
        let mut dims: Vec<(&String, f64)> = request
            .snapshot
            .scores
            .iter()
            .map(|(k, v)| (k, *v))
            .filter(|(_, v)| *v < self.settings.max_score)
            .collect();
        dims.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(b.0)));

        let below = dims.iter().filter(|(_, v)| *v < self.settings.threshold).count();
        let take = below.max(self.settings.min_gaps).min(dims.len());
        dims.iter()
            .take(take)
            .enumerate()
            .map(|(i, (dim, score))| self.build_gap(request, i, dim, *score))
            .collect()
    }
}

#[async_trait]
impl GapAnalyzer for RubricGapAnalyzer {
    async fn analyze(&self, request: &AnalysisRequest, cancel: &CancellationToken) -> Result<Vec<Gap>, EvolutionError> {
        if cancel.is_cancelled() {
            return Err(EvolutionError::Cancelled);
        }
        let gaps = self.rubric_gaps(request);
        tracing::debug!("Rubric analysis found {} gaps (attempt {})", gaps.len(), request.attempt);
        Ok(gaps)
    }
}

/// LLM 返回的单个差距
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct LlmGap {
    pub dimension: String,
    pub description: String,
    #[serde(default)]
    pub target_score: Option<f64>,
    #[serde(default)]
    pub solution_reasoning: RouteSignals,
    #[serde(default)]
    pub rationale: String,
}

/// LLM 的分析结果
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct LlmGapReport {
    #[serde(default)]
    pub identified_gaps: Vec<LlmGap>,
}

/// LLM 辅助分析器：LLM 提供描述与信号，规则保证阈值与最少数量
pub struct LlmGapAnalyzer {
    llm: Arc<dyn LlmClient>,
    retry: RetryExecutor,
    rubric: RubricGapAnalyzer,
}

impl LlmGapAnalyzer {
    pub fn new(llm: Arc<dyn LlmClient>, retry: RetryExecutor, settings: AnalyzerSettings) -> Self {
        Self {
            llm,
            retry,
            rubric: RubricGapAnalyzer::new(settings),
        }
    }

    fn build_prompt(&self, request: &AnalysisRequest) -> Vec<Message> {
        let s = &self.rubric.settings;
        let scores = serde_json::to_string_pretty(&request.snapshot.scores).unwrap_or_default();
        let history: Vec<_> = request
            .history
            .iter()
            .map(|h| (h.iteration, h.aggregate()))
            .collect();
        let mut prompt = format!(
            "Analyze evaluation scores for iteration {}.\n\nSCORES (max {:.1}):\n{}\n\nAGGREGATE HISTORY (iteration, score): {:?}\n\n\
             Any dimension below {:.1} is a gap. Identify at least {} gaps even if scores look good. \
             Target scores should be ambitious. For each gap fill solution_reasoning with booleans.\n\n\
             Respond with ONLY a JSON object matching this schema:\n{}",
            request.iteration,
            s.max_score,
            scores,
            history,
            s.threshold,
            s.min_gaps,
            schema_hint::<LlmGapReport>()
        );
        if request.look_harder() {
            prompt.push_str(
                "\n\nThe previous analysis found no gaps. Look harder: there is ALWAYS room to improve. \
                 Never return an empty identified_gaps array.",
            );
        }
        vec![
            Message::system("You are a quality analyst for an instruction-evolution system."),
            Message::user(prompt),
        ]
    }
}

#[async_trait]
impl GapAnalyzer for LlmGapAnalyzer {
    async fn analyze(&self, request: &AnalysisRequest, cancel: &CancellationToken) -> Result<Vec<Gap>, EvolutionError> {
        let mut gaps = self.rubric.rubric_gaps(request);
        let report: LlmGapReport = match request_structured(
            &self.llm,
            &self.retry,
            cancel,
            "gap_analysis",
            self.build_prompt(request),
        )
        .await
        {
            Ok(r) => r,
            Err(EvolutionError::Cancelled) => return Err(EvolutionError::Cancelled),
            Err(e) => {
                tracing::warn!("LLM gap analysis failed, using rubric only: {}", e);
                return Ok(gaps);
            }
        };

        let settings = self.rubric.settings();
        let mut covered: BTreeSet<String> = BTreeSet::new();
        for llm_gap in report.identified_gaps {
            // 只接受快照里真实存在的维度
            let Some(current) = request.snapshot.get(&llm_gap.dimension) else {
                tracing::debug!("Ignoring LLM gap for unknown dimension {}", llm_gap.dimension);
                continue;
            };
            if !covered.insert(llm_gap.dimension.clone()) {
                continue;
            }
            let route = llm_gap.solution_reasoning.route();
            let target = llm_gap
                .target_score
                .map(|t| t.clamp(current, settings.max_score))
                .unwrap_or_else(|| settings.target_for(current));
            match gaps.iter_mut().find(|g| g.dimension == llm_gap.dimension) {
                Some(g) => {
                    g.description = llm_gap.description;
                    g.route = route;
                    g.target_score = target;
                    g.rationale = format!("{}; {}", llm_gap.solution_reasoning.describe(), llm_gap.rationale);
                }
                None => {
                    let index = gaps.len();
                    let mut g = self.rubric.build_gap(request, index, &llm_gap.dimension, current);
                    g.description = llm_gap.description;
                    g.route = route;
                    g.target_score = target;
                    gaps.push(g);
                }
            }
        }
        gaps.sort_by(|a, b| a.current_score.total_cmp(&b.current_score));
        Ok(gaps)
    }
}
