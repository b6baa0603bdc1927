//! 确定性的模拟 Oracle：无外部服务时驱动程序与测试使用
//!
//! - SimulatedGenerationOracle：把用例输入代入指令占位符，可按用例 / 次数注入失败
//! - KeywordScoringOracle：按指令中出现的质量线索给各维度打分（指令越明确分越高）
//! - ScriptedScoringOracle：按轮次返回预设分数，用于精确控制停止判定
//! - SimulatedImplementer：返回固定的实现报告

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use crate::core::EvolutionError;
use crate::oracle::{
    DimensionScore, GenerationOracle, ImplementationReport, Implementer, ScoreCard, ScoringOracle,
    TestCase, ToolSpec,
};

/// 模拟生成 Oracle
#[derive(Debug, Default)]
pub struct SimulatedGenerationOracle {
    fail_cases: HashSet<String>,
    fail_all: bool,
    /// 前 N 次调用以瞬时错误失败
    transient_failures: usize,
    calls: AtomicUsize,
}

impl SimulatedGenerationOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_cases<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fail_cases = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn failing_all(mut self) -> Self {
        self.fail_all = true;
        self
    }

    pub fn with_transient_failures(mut self, n: usize) -> Self {
        self.transient_failures = n;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GenerationOracle for SimulatedGenerationOracle {
    async fn generate(&self, instruction: &str, case: &TestCase) -> Result<String, EvolutionError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n < self.transient_failures {
            return Err(EvolutionError::transient("generation", "simulated rate limit"));
        }
        if self.fail_all || self.fail_cases.contains(&case.id) {
            return Err(EvolutionError::transient(
                "generation",
                format!("simulated failure for case {}", case.id),
            ));
        }
        let body = instruction
            .replace("{theme}", &case.input)
            .replace("{purpose}", "presentation")
            .replace("{blog_content}", case.reference.as_deref().unwrap_or(&case.input));
        Ok(format!("# {}\n\n{}", case.input, body))
    }
}

/// 维度线索表：(维度, 线索词)
pub const DIMENSION_CUES: &[(&str, &[&str])] = &[
    ("content_accuracy", &["accura", "source", "verify", "exact", "fact"]),
    ("information_completeness", &["complete", "cover", "comprehensive", "include", "key point"]),
    ("slide_coherence", &["flow", "transition", "logical", "structure", "order"]),
    ("visual_design", &["visual", "layout", "contrast", "spacing", "hierarchy"]),
    ("overall_quality", &["quality", "clear", "concise", "must", "validate"]),
];

/// 按线索打分的评分 Oracle
#[derive(Debug, Clone)]
pub struct KeywordScoringOracle {
    base: f64,
    step: f64,
    max_score: f64,
    /// 需要参考上下文的维度；未提供时记为 Missing
    requires_reference: HashSet<String>,
}

impl Default for KeywordScoringOracle {
    fn default() -> Self {
        Self {
            base: 2.8,
            step: 0.35,
            max_score: 5.0,
            requires_reference: HashSet::new(),
        }
    }
}

impl KeywordScoringOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requiring_reference<I, S>(mut self, dims: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.requires_reference = dims.into_iter().map(Into::into).collect();
        self
    }

    fn score_dimension(&self, text: &str, cues: &[&str]) -> f64 {
        let hits = cues.iter().filter(|c| text.contains(*c)).count() as f64;
        // 过度限制（大量 never）拉低内容类分数
        let nevers = text.matches("never").count();
        let penalty = if nevers > 2 { 0.3 * (nevers - 2) as f64 } else { 0.0 };
        let raw = self.base + self.step * hits - penalty;
        (raw.clamp(0.0, self.max_score) * 100.0).round() / 100.0
    }
}

#[async_trait]
impl ScoringOracle for KeywordScoringOracle {
    async fn score(&self, artifact: &str, reference: Option<&str>) -> Result<ScoreCard, EvolutionError> {
        let lower = artifact.to_lowercase();
        let mut dimensions = BTreeMap::new();
        for (dim, cues) in DIMENSION_CUES {
            let score = if reference.is_none() && self.requires_reference.contains(*dim) {
                DimensionScore::Missing
            } else {
                DimensionScore::Scored(self.score_dimension(&lower, cues))
            };
            dimensions.insert(dim.to_string(), score);
        }
        Ok(ScoreCard { dimensions })
    }
}

/// 按轮次返回预设分数的评分 Oracle
#[derive(Debug)]
pub struct ScriptedScoringOracle {
    rounds: Vec<BTreeMap<String, f64>>,
    cases_per_round: usize,
    failing_rounds: HashSet<usize>,
    calls: AtomicUsize,
}

impl ScriptedScoringOracle {
    /// 每轮的所有维度都取同一个分数
    pub fn uniform(aggregates: &[f64], dimensions: &[&str], cases_per_round: usize) -> Self {
        let rounds = aggregates
            .iter()
            .map(|score| dimensions.iter().map(|d| (d.to_string(), *score)).collect())
            .collect();
        Self::new(rounds, cases_per_round)
    }

    pub fn new(rounds: Vec<BTreeMap<String, f64>>, cases_per_round: usize) -> Self {
        Self {
            rounds,
            cases_per_round: cases_per_round.max(1),
            failing_rounds: HashSet::new(),
            calls: AtomicUsize::new(0),
        }
    }

    /// 指定轮次（0 起）的所有评分调用失败
    pub fn failing_round(mut self, round: usize) -> Self {
        self.failing_rounds.insert(round);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ScoringOracle for ScriptedScoringOracle {
    async fn score(&self, _artifact: &str, _reference: Option<&str>) -> Result<ScoreCard, EvolutionError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        let round = n / self.cases_per_round;
        if self.failing_rounds.contains(&round) {
            return Err(EvolutionError::transient("scoring", format!("scripted failure in round {round}")));
        }
        let Some(scores) = self.rounds.get(round).or_else(|| self.rounds.last()) else {
            return Err(EvolutionError::transient("scoring", "no scripted rounds"));
        };
        Ok(ScoreCard::from_scores(scores.iter().map(|(k, v)| (k.clone(), *v))))
    }
}

/// 返回固定报告的能力实现方
#[derive(Debug, Clone)]
pub struct SimulatedImplementer {
    pass_rate: f64,
    latency_ms: f64,
    calls: std::sync::Arc<AtomicUsize>,
}

impl Default for SimulatedImplementer {
    fn default() -> Self {
        Self {
            pass_rate: 0.9,
            latency_ms: 12.0,
            calls: Default::default(),
        }
    }
}

impl SimulatedImplementer {
    pub fn new(pass_rate: f64, latency_ms: f64) -> Self {
        Self {
            pass_rate,
            latency_ms,
            calls: Default::default(),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Implementer for SimulatedImplementer {
    async fn implement(&self, spec: &ToolSpec) -> Result<ImplementationReport, EvolutionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let success = self.pass_rate > 0.0;
        Ok(ImplementationReport {
            success,
            deployed: success,
            test_pass_rate: self.pass_rate,
            measured_latency_ms: self.latency_ms,
            error: (!success).then(|| format!("{} failed all tests", spec.name)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_generation_substitutes_placeholders() {
        let oracle = SimulatedGenerationOracle::new();
        let out = oracle
            .generate("Slides on {theme}", &TestCase::new("c1", "rust"))
            .await
            .unwrap();
        assert!(out.contains("Slides on rust"));
    }

    #[tokio::test]
    async fn test_generation_injected_failures() {
        let oracle = SimulatedGenerationOracle::new()
            .with_transient_failures(1)
            .failing_cases(["bad"]);
        let case = TestCase::new("ok", "x");
        assert!(oracle.generate("i", &case).await.is_err());
        assert!(oracle.generate("i", &case).await.is_ok());
        assert!(oracle.generate("i", &TestCase::new("bad", "x")).await.is_err());
        assert_eq!(oracle.calls(), 3);
    }

    #[tokio::test]
    async fn test_keyword_scores_rise_with_cues() {
        let oracle = KeywordScoringOracle::new();
        let plain = oracle.score("make slides", None).await.unwrap();
        let rich = oracle
            .score("make slides; verify every fact against the source, keep a logical flow", None)
            .await
            .unwrap();
        let get = |c: &ScoreCard, d: &str| c.dimensions[d].value().unwrap();
        assert!(get(&rich, "content_accuracy") > get(&plain, "content_accuracy"));
        assert!(get(&rich, "slide_coherence") > get(&plain, "slide_coherence"));
    }

    #[tokio::test]
    async fn test_keyword_missing_reference_dimension() {
        let oracle = KeywordScoringOracle::new().requiring_reference(["content_accuracy"]);
        let card = oracle.score("text", None).await.unwrap();
        assert_eq!(card.dimensions["content_accuracy"], DimensionScore::Missing);
        let card = oracle.score("text", Some("ref")).await.unwrap();
        assert!(card.dimensions["content_accuracy"].value().is_some());
    }

    #[tokio::test]
    async fn test_scripted_rounds_advance_per_case_count() {
        let oracle = ScriptedScoringOracle::uniform(&[3.0, 4.0], &["a"], 2);
        let s = |c: ScoreCard| c.dimensions["a"].value().unwrap();
        assert_eq!(s(oracle.score("", None).await.unwrap()), 3.0);
        assert_eq!(s(oracle.score("", None).await.unwrap()), 3.0);
        assert_eq!(s(oracle.score("", None).await.unwrap()), 4.0);
        assert_eq!(s(oracle.score("", None).await.unwrap()), 4.0);
        // 超出脚本后重复最后一轮
        assert_eq!(s(oracle.score("", None).await.unwrap()), 4.0);
    }
}
