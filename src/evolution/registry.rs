//! 模式登记册：跨运行持久化成功 / 失败的变异模式与教训
//!
//! - `patterns.json`：结构化状态，启动时读取（可关闭以重新开始学习，此时本次运行不回写）
//! - `PATTERNS_REGISTRY.md`：只追加的人类可读文档，每次结果与每次运行摘要追加在末尾
//!
//! 只做加法：模式计数与平均值只会被新的数据点折叠更新，不会删除。

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::core::EvolutionError;

pub const PATTERNS_FILE: &str = "patterns.json";
pub const REGISTRY_DOC: &str = "PATTERNS_REGISTRY.md";

/// 部分匹配的关键字重叠阈值
pub const PARTIAL_MATCH_OVERLAP: f64 = 0.6;
/// 文档 Accepted 段落收录的最小提升
pub const ACCEPTED_SECTION_MIN: f64 = 0.1;
/// 文档 Failed 段落收录的最小退化
pub const FAILED_SECTION_MIN: f64 = 0.2;

const MAX_EXAMPLES: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternOutcome {
    Successful,
    Failed,
}

/// 一类反复出现的变异
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternRecord {
    pub name: String,
    pub description: String,
    /// 该模式描述的是成功还是失败的做法
    pub outcome: PatternOutcome,
    #[serde(default)]
    pub success_count: u32,
    #[serde(default)]
    pub failure_count: u32,
    /// 所有落入该模式的数据点的平均分差
    pub average_impact: f64,
    pub examples: Vec<String>,
    pub lesson: String,
    #[serde(default)]
    pub applies_to: Vec<String>,
}

impl PatternRecord {
    pub fn occurrences(&self) -> u32 {
        self.success_count + self.failure_count
    }

    pub fn success_rate(&self) -> f64 {
        match self.occurrences() {
            0 => 0.0,
            n => self.success_count as f64 / n as f64,
        }
    }

    pub fn failure_rate(&self) -> f64 {
        match self.occurrences() {
            0 => 0.0,
            n => self.failure_count as f64 / n as f64,
        }
    }

    /// 与模式自身方向一致的比率
    pub fn rate(&self) -> f64 {
        match self.outcome {
            PatternOutcome::Successful => self.success_rate(),
            PatternOutcome::Failed => self.failure_rate(),
        }
    }

    fn fold(&mut self, success: bool, delta: f64) {
        if success {
            self.success_count += 1;
        } else {
            self.failure_count += 1;
        }
        let n = self.occurrences() as f64;
        self.average_impact = (self.average_impact * (n - 1.0) + delta) / n;
    }
}

/// 一次已测量结果的变更
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedChange {
    pub name: String,
    pub iteration: u32,
    pub changes: Vec<String>,
    pub delta: f64,
    pub pattern: String,
    pub lesson: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistryStats {
    pub total_tested: u32,
    pub successful: u32,
    pub failed: u32,
    pub success_rate: f64,
    pub avg_improvement_successful: f64,
    pub avg_degradation_failed: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentBest {
    pub iteration: u32,
    pub artifact_version: u32,
    pub score: f64,
    pub improvement: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistryData {
    pub patterns: BTreeMap<String, PatternRecord>,
    pub accepted: Vec<RecordedChange>,
    pub failed: Vec<RecordedChange>,
    pub stats: RegistryStats,
    pub current_best: Option<CurrentBest>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExactMatch {
    pub source: String,
    pub change: String,
    pub delta: f64,
    pub lesson: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PartialMatch {
    pub source: String,
    pub proposed: String,
    pub previous: String,
    pub similarity: f64,
    pub delta: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PatternWarning {
    pub pattern: String,
    pub change: String,
    pub warning: String,
    pub failure_rate: f64,
}

/// checkSimilar 的结果
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SimilarityReport {
    pub exact_matches: Vec<ExactMatch>,
    pub partial_matches: Vec<PartialMatch>,
    pub pattern_warnings: Vec<PatternWarning>,
}

impl SimilarityReport {
    pub fn is_clear(&self) -> bool {
        self.exact_matches.is_empty() && self.partial_matches.is_empty() && self.pattern_warnings.is_empty()
    }

    /// 与已知失败完全相同
    pub fn repeats_failure(&self) -> bool {
        !self.exact_matches.is_empty()
    }
}

fn tokenize_lower(s: &str) -> HashSet<String> {
    s.split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase())
        .filter(|w| w.len() > 1)
        .collect()
}

/// 相对于提议变更关键字的重叠比例
fn keyword_overlap(proposed: &str, previous: &str) -> f64 {
    let a = tokenize_lower(proposed);
    let b = tokenize_lower(previous);
    a.intersection(&b).count() as f64 / a.len().max(1) as f64
}

fn same_change(a: &str, b: &str) -> bool {
    a.trim().eq_ignore_ascii_case(b.trim())
}

fn contains_any(changes: &[String], words: &[&str]) -> bool {
    changes.iter().any(|c| {
        let lower = c.to_lowercase();
        words.iter().any(|w| lower.contains(w))
    })
}

const RESTRICTIVE_WORDS: &[&str] = &["restrict", "never", "must", "only"];
const VAGUE_WORDS: &[&str] = &["better", "improve", "enhance", "vague"];

/// 失败变更归类
pub fn classify_failure(changes: &[String]) -> &'static str {
    if contains_any(changes, &["restrict", "never", "must"]) {
        "over_restriction"
    } else if contains_any(changes, &["better", "improve"]) {
        "vague_instructions"
    } else {
        "general_failure"
    }
}

/// 成功变更归类
pub fn classify_success(changes: &[String]) -> &'static str {
    if contains_any(changes, &["source", "exact", "verbatim"]) {
        "source_adherence"
    } else if contains_any(changes, &["structure", "section", "format", "flow", "order"]) {
        "structure_clarity"
    } else {
        "general_improvement"
    }
}

/// 由退化幅度与变更措辞推导教训
pub fn derive_lesson(changes: &[String], delta: f64) -> String {
    let mut lesson = if delta <= -0.5 {
        "Severe degradation - avoid this type of change entirely".to_string()
    } else if delta <= -0.2 {
        "Moderate degradation - approach needs refinement".to_string()
    } else {
        "Minor degradation - changes too conservative or off-target".to_string()
    };
    if contains_any(changes, RESTRICTIVE_WORDS) {
        lesson.push_str(". Over-restriction likely caused issues");
    }
    if contains_any(changes, VAGUE_WORDS) {
        lesson.push_str(". Instructions too vague to be effective");
    }
    lesson
}

fn pattern_description(name: &str) -> &'static str {
    match name {
        "source_adherence" => "Adding explicit instructions to follow source material exactly",
        "structure_clarity" => "Clarifying the expected structure and ordering of the output",
        "general_improvement" => "Other changes that raised scores",
        "over_restriction" => "Too many constraints that limit model creativity",
        "vague_instructions" => "Generic wording that gives the model nothing concrete to act on",
        _ => "Other changes that lowered scores",
    }
}

fn seeded_patterns() -> BTreeMap<String, PatternRecord> {
    let mut patterns = BTreeMap::new();
    patterns.insert(
        "source_adherence".to_string(),
        PatternRecord {
            name: "source_adherence".into(),
            description: pattern_description("source_adherence").into(),
            outcome: PatternOutcome::Successful,
            success_count: 3,
            failure_count: 1,
            average_impact: 0.8,
            examples: vec![
                "You MUST use only information from the source material".into(),
                "Do not add any information not explicitly stated in the source".into(),
            ],
            lesson: "Explicit grounding in the source improves accuracy".into(),
            applies_to: vec!["accuracy".into(), "completeness".into()],
        },
    );
    patterns.insert(
        "over_restriction".to_string(),
        PatternRecord {
            name: "over_restriction".into(),
            description: pattern_description("over_restriction").into(),
            outcome: PatternOutcome::Failed,
            success_count: 1,
            failure_count: 4,
            average_impact: -0.6,
            examples: vec!["NEVER use any words not in the source".into()],
            lesson: "Balance accuracy requirements with creative freedom".into(),
            applies_to: Vec::new(),
        },
    );
    patterns
}

/// 模式登记册
#[derive(Debug, Clone)]
pub struct PatternRegistry {
    dir: Option<PathBuf>,
    /// false 时 patterns.json 保持原样，本次运行的学习只留在内存与文档里
    writes_state: bool,
    data: RegistryData,
    /// 尚未追加到文档的条目
    pending_entries: Vec<String>,
}

impl PatternRegistry {
    /// 不落盘的全新登记册（含种子模式）
    pub fn in_memory() -> Self {
        Self {
            dir: None,
            writes_state: false,
            data: RegistryData {
                patterns: seeded_patterns(),
                ..Default::default()
            },
            pending_entries: Vec::new(),
        }
    }

    /// 打开 dir 下的登记册；use_persisted = false 时忽略已有状态重新开始，且不覆盖它
    pub async fn open(dir: impl Into<PathBuf>, use_persisted: bool) -> Result<Self, EvolutionError> {
        let dir = dir.into();
        let path = dir.join(PATTERNS_FILE);
        let data = if use_persisted && fs::try_exists(&path).await? {
            let raw = fs::read_to_string(&path).await?;
            let data: RegistryData = serde_json::from_str(&raw)?;
            tracing::info!(
                "Loaded pattern registry: {} patterns, {} tested changes",
                data.patterns.len(),
                data.stats.total_tested
            );
            data
        } else {
            if !use_persisted {
                tracing::info!("Persisted registry disabled, starting pattern learning fresh");
            }
            RegistryData {
                patterns: seeded_patterns(),
                ..Default::default()
            }
        };
        Ok(Self {
            dir: Some(dir),
            writes_state: use_persisted,
            data,
            pending_entries: Vec::new(),
        })
    }

    pub fn data(&self) -> &RegistryData {
        &self.data
    }

    pub fn pattern(&self, name: &str) -> Option<&PatternRecord> {
        self.data.patterns.get(name)
    }

    /// 成功模式，按成功率降序
    pub fn successful_patterns(&self) -> Vec<&PatternRecord> {
        self.sorted_patterns(PatternOutcome::Successful)
    }

    /// 失败模式，按失败率降序
    pub fn failed_patterns(&self) -> Vec<&PatternRecord> {
        self.sorted_patterns(PatternOutcome::Failed)
    }

    fn sorted_patterns(&self, outcome: PatternOutcome) -> Vec<&PatternRecord> {
        let mut list: Vec<&PatternRecord> = self
            .data
            .patterns
            .values()
            .filter(|p| p.outcome == outcome)
            .collect();
        list.sort_by(|a, b| b.rate().total_cmp(&a.rate()));
        list
    }

    /// 提议的变更是否与已知失败相同 / 相似，或落入已知失败模式
    pub fn check_similar(&self, proposed: &[String]) -> SimilarityReport {
        let mut report = SimilarityReport::default();

        for change in proposed {
            for failed in &self.data.failed {
                for previous in &failed.changes {
                    if same_change(change, previous) {
                        report.exact_matches.push(ExactMatch {
                            source: failed.name.clone(),
                            change: change.clone(),
                            delta: failed.delta,
                            lesson: failed.lesson.clone().unwrap_or_default(),
                        });
                        continue;
                    }
                    let similarity = keyword_overlap(change, previous);
                    if similarity >= PARTIAL_MATCH_OVERLAP {
                        report.partial_matches.push(PartialMatch {
                            source: failed.name.clone(),
                            proposed: change.clone(),
                            previous: previous.clone(),
                            similarity,
                            delta: failed.delta,
                        });
                    }
                }
            }

            let already_matched = report.exact_matches.iter().any(|m| &m.change == change);
            for pattern in self.data.patterns.values().filter(|p| p.outcome == PatternOutcome::Failed) {
                if already_matched {
                    break;
                }
                for example in &pattern.examples {
                    if same_change(change, example) {
                        report.exact_matches.push(ExactMatch {
                            source: pattern.name.clone(),
                            change: change.clone(),
                            delta: pattern.average_impact,
                            lesson: pattern.lesson.clone(),
                        });
                    }
                }
            }

            let class = classify_failure(std::slice::from_ref(change));
            if let Some(pattern) = self.data.patterns.get(class) {
                if pattern.outcome == PatternOutcome::Failed && class != "general_failure" {
                    report.pattern_warnings.push(PatternWarning {
                        pattern: pattern.name.clone(),
                        change: change.clone(),
                        warning: pattern.lesson.clone(),
                        failure_rate: pattern.failure_rate(),
                    });
                }
            }
        }

        report
    }

    /// 把一次测量结果折叠进对应模式与统计，返回模式名
    ///
    /// 结果计入按结果方向归类的模式；措辞同时命中另一方向的已有模式时，
    /// 该模式也记一次反例（例如失败的"照搬原文"变更会拉低 source_adherence 的成功率）。
    pub fn record_outcome(&mut self, name: &str, iteration: u32, changes: &[String], delta: f64) -> String {
        let success = delta > 0.0;
        let (pattern_name, outcome, opposite) = if success {
            (classify_success(changes), PatternOutcome::Successful, classify_failure(changes))
        } else {
            (classify_failure(changes), PatternOutcome::Failed, classify_success(changes))
        };
        let lesson = (!success).then(|| derive_lesson(changes, delta));

        let pattern = self
            .data
            .patterns
            .entry(pattern_name.to_string())
            .or_insert_with(|| PatternRecord {
                name: pattern_name.to_string(),
                description: pattern_description(pattern_name).to_string(),
                outcome,
                success_count: 0,
                failure_count: 0,
                average_impact: 0.0,
                examples: Vec::new(),
                lesson: lesson.clone().unwrap_or_else(|| "Keep applying this kind of change".into()),
                applies_to: Vec::new(),
            });
        pattern.fold(success, delta);
        for example in changes.iter().take(2) {
            if !pattern.examples.iter().any(|e| same_change(e, example)) && pattern.examples.len() < MAX_EXAMPLES {
                pattern.examples.push(example.clone());
            }
        }
        if !matches!(opposite, "general_improvement" | "general_failure") {
            if let Some(counter) = self.data.patterns.get_mut(opposite) {
                counter.fold(success, delta);
            }
        }

        let record = RecordedChange {
            name: name.to_string(),
            iteration,
            changes: changes.to_vec(),
            delta,
            pattern: pattern_name.to_string(),
            lesson: lesson.clone(),
            recorded_at: Utc::now(),
        };

        let stats = &mut self.data.stats;
        if success {
            stats.successful += 1;
            let c = stats.successful as f64;
            stats.avg_improvement_successful = (stats.avg_improvement_successful * (c - 1.0) + delta) / c;
        } else {
            stats.failed += 1;
            let c = stats.failed as f64;
            stats.avg_degradation_failed = (stats.avg_degradation_failed * (c - 1.0) + delta) / c;
        }
        stats.total_tested = stats.successful + stats.failed;
        stats.success_rate = stats.successful as f64 / stats.total_tested as f64;

        tracing::info!(
            "Registry: {} {} ({:+.3}) → pattern {}",
            if success { "accepted" } else { "failed" },
            name,
            delta,
            pattern_name
        );
        let entry = format_entry(&record, success);
        if success {
            self.data.accepted.push(record);
        } else {
            self.data.failed.push(record);
        }
        if self.dir.is_some() {
            self.pending_entries.push(entry);
        }
        pattern_name.to_string()
    }

    /// 记录目前最好的一版
    pub fn update_best(&mut self, iteration: u32, artifact_version: u32, score: f64, baseline: f64) {
        let better = self.data.current_best.as_ref().map_or(true, |b| score > b.score);
        if better {
            self.data.current_best = Some(CurrentBest {
                iteration,
                artifact_version,
                score,
                improvement: score - baseline,
            });
        }
    }

    /// 渲染完整摘要（Current Best / Accepted / Failed / Patterns / Statistics）
    pub fn render_summary(&self) -> String {
        let mut lines = Vec::new();
        lines.push("## Current Best".to_string());
        match &self.data.current_best {
            Some(b) => {
                lines.push(format!("path: artifact_v{}.txt", b.artifact_version));
                lines.push(format!("iteration: {}", b.iteration));
                lines.push(format!("score: {:.2}", b.score));
                lines.push(format!("improvement: {:+.2}", b.improvement));
            }
            None => lines.push("path: artifact_v0.txt (baseline)".to_string()),
        }

        lines.push(String::new());
        lines.push(format!("## Accepted (>{ACCEPTED_SECTION_MIN} improvement)"));
        let accepted: Vec<_> = self
            .data
            .accepted
            .iter()
            .filter(|c| c.delta > ACCEPTED_SECTION_MIN)
            .collect();
        if accepted.is_empty() {
            lines.push("*No accepted changes yet*".to_string());
        }
        for c in accepted {
            lines.push(format!("{}: {:+.2} | {}", c.name, c.delta, first_change(c)));
        }

        lines.push(String::new());
        lines.push(format!("## Failed (>{FAILED_SECTION_MIN} degradation)"));
        let failed: Vec<_> = self
            .data
            .failed
            .iter()
            .filter(|c| c.delta < -FAILED_SECTION_MIN)
            .collect();
        if failed.is_empty() {
            lines.push("*No failed changes yet*".to_string());
        }
        for c in failed {
            lines.push(format!(
                "{}: {:+.2} | {} | {}",
                c.name,
                c.delta,
                first_change(c),
                c.lesson.as_deref().unwrap_or("")
            ));
        }

        lines.push(String::new());
        lines.push("## Patterns".to_string());
        for p in self.data.patterns.values() {
            let kind = match p.outcome {
                PatternOutcome::Successful => "success",
                PatternOutcome::Failed => "failure",
            };
            lines.push(format!(
                "- **{}** ({}, {} ok / {} failed, rate {:.2}, avg impact {:+.2}): {}",
                p.name,
                kind,
                p.success_count,
                p.failure_count,
                p.rate(),
                p.average_impact,
                p.lesson
            ));
        }

        let s = &self.data.stats;
        lines.push(String::new());
        lines.push("## Statistics".to_string());
        lines.push(format!("total_tested: {}", s.total_tested));
        lines.push(format!("successful: {}", s.successful));
        lines.push(format!("failed: {}", s.failed));
        lines.push(format!("success_rate: {:.2}", s.success_rate));
        lines.push(format!("avg_improvement_successful: {:+.3}", s.avg_improvement_successful));
        lines.push(format!("avg_degradation_failed: {:+.3}", s.avg_degradation_failed));
        lines.join("\n")
    }

    /// 追加待写的文档条目，并写 patterns.json（每个阶段结束时调用）
    pub async fn persist_state(&mut self) -> Result<(), EvolutionError> {
        let Some(dir) = self.dir.clone() else {
            return Ok(());
        };
        fs::create_dir_all(&dir).await?;
        if !self.pending_entries.is_empty() {
            let doc = dir.join(REGISTRY_DOC);
            ensure_header(&doc).await?;
            append(&doc, &self.pending_entries.concat()).await?;
            self.pending_entries.clear();
        }
        if self.writes_state {
            let json = serde_json::to_string_pretty(&self.data)?;
            fs::write(dir.join(PATTERNS_FILE), json).await?;
        }
        Ok(())
    }

    /// persist_state，并把本次运行的摘要追加到文档末尾
    pub async fn save(&mut self) -> Result<(), EvolutionError> {
        self.persist_state().await?;
        let Some(dir) = &self.dir else {
            return Ok(());
        };
        let doc = dir.join(REGISTRY_DOC);
        ensure_header(&doc).await?;
        let block = format!(
            "\n# Run summary {}\n\n{}\n\n---\n",
            Utc::now().format("%Y-%m-%d %H:%M"),
            self.render_summary()
        );
        append(&doc, &block).await?;
        Ok(())
    }
}

fn first_change(c: &RecordedChange) -> &str {
    c.changes.first().map(String::as_str).unwrap_or("unknown")
}

fn format_entry(record: &RecordedChange, success: bool) -> String {
    let tag = if success { "accepted" } else { "failed" };
    let mut block = format!(
        "\n## {} [{}] {}\n\n- **Iteration**: {}\n- **Delta**: {:+.3}\n- **Pattern**: {}\n",
        record.recorded_at.format("%Y-%m-%d %H:%M"),
        tag,
        record.name,
        record.iteration,
        record.delta,
        record.pattern
    );
    for change in &record.changes {
        block.push_str(&format!("- **Change**: {}\n", change.trim().replace('\n', " ")));
    }
    if let Some(lesson) = &record.lesson {
        block.push_str(&format!("- **Lesson**: {}\n", lesson));
    }
    block
}

/// 首次创建时写入标题
async fn ensure_header(path: &Path) -> std::io::Result<()> {
    if fs::try_exists(path).await? {
        return Ok(());
    }
    if let Some(p) = path.parent() {
        fs::create_dir_all(p).await?;
    }
    fs::write(
        path,
        "# Patterns Registry\n\n*Long-term memory for instruction evolution: entries appended below.*\n\n---\n",
    )
    .await
}

async fn append(path: &Path, block: &str) -> std::io::Result<()> {
    let mut file = fs::OpenOptions::new().create(true).append(true).open(path).await?;
    file.write_all(block.as_bytes()).await?;
    file.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn changes(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_fresh_registry_is_seeded() {
        let registry = PatternRegistry::in_memory();
        assert_eq!(registry.successful_patterns()[0].name, "source_adherence");
        let failed = registry.pattern("over_restriction").unwrap();
        assert_eq!(failed.examples, vec!["NEVER use any words not in the source"]);
        assert_eq!(failed.lesson, "Balance accuracy requirements with creative freedom");
    }

    #[test]
    fn test_exact_match_returns_recorded_lesson() {
        let mut registry = PatternRegistry::in_memory();
        registry.record_outcome("001_prompt_evolution_x", 1, &changes(&["never use word X"]), -0.4);
        let report = registry.check_similar(&changes(&["never use word X"]));
        assert_eq!(report.exact_matches.len(), 1);
        let m = &report.exact_matches[0];
        assert_eq!(m.source, "001_prompt_evolution_x");
        assert!(m.lesson.starts_with("Moderate degradation"));
        assert!(m.lesson.contains("Over-restriction"));
        assert!(report.repeats_failure());
    }

    #[test]
    fn test_partial_match_by_keyword_overlap() {
        let mut registry = PatternRegistry::in_memory();
        registry.record_outcome("a", 1, &changes(&["keep every slide under five bullets"]), -0.3);
        let report = registry.check_similar(&changes(&["keep every slide under six bullets"]));
        assert!(report.exact_matches.is_empty());
        assert_eq!(report.partial_matches.len(), 1);
        assert!(report.partial_matches[0].similarity >= PARTIAL_MATCH_OVERLAP);

        let unrelated = registry.check_similar(&changes(&["add a summary slide"]));
        assert!(unrelated.partial_matches.is_empty());
    }

    #[test]
    fn test_pattern_warning_for_restrictive_change() {
        let registry = PatternRegistry::in_memory();
        let report = registry.check_similar(&changes(&["You must never paraphrase"]));
        assert_eq!(report.pattern_warnings.len(), 1);
        assert_eq!(report.pattern_warnings[0].pattern, "over_restriction");
    }

    #[test]
    fn test_record_outcome_moving_average_and_stats() {
        let mut registry = PatternRegistry::in_memory();
        registry.record_outcome("a", 1, &changes(&["You MUST restrict output"]), -0.6);
        let p = registry.pattern("over_restriction").unwrap();
        assert_eq!((p.success_count, p.failure_count), (1, 5));
        assert!((p.failure_rate() - 5.0 / 6.0).abs() < 1e-9);
        assert!((p.average_impact + 0.6).abs() < 1e-9);

        let name = registry.record_outcome("b", 2, &changes(&["Follow the source exactly"]), 0.3);
        assert_eq!(name, "source_adherence");
        let s = &registry.data().stats;
        assert_eq!(s.total_tested, 2);
        assert!((s.success_rate - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_lesson_tiers() {
        assert!(derive_lesson(&changes(&["x"]), -0.7).starts_with("Severe"));
        assert!(derive_lesson(&changes(&["x"]), -0.3).starts_with("Moderate"));
        assert!(derive_lesson(&changes(&["make it better"]), -0.1).ends_with("too vague to be effective"));
    }

    #[test]
    fn test_classification() {
        assert_eq!(classify_failure(&changes(&["never do x"])), "over_restriction");
        assert_eq!(classify_failure(&changes(&["be better"])), "vague_instructions");
        assert_eq!(classify_failure(&changes(&["x"])), "general_failure");
        assert_eq!(classify_success(&changes(&["clear section order"])), "structure_clarity");
    }

    #[test]
    fn test_rates_follow_counts_in_both_directions() {
        let mut registry = PatternRegistry::in_memory();
        let before = registry.pattern("source_adherence").unwrap().success_rate();
        assert!((before - 0.75).abs() < 1e-9);

        // 失败的"照搬原文"变更：计入 over_restriction，同时是 source_adherence 的反例
        registry.record_outcome("a", 1, &changes(&["Never stray from the source"]), -0.3);
        let adherence = registry.pattern("source_adherence").unwrap();
        assert_eq!((adherence.success_count, adherence.failure_count), (3, 2));
        assert!((adherence.success_rate() - 0.6).abs() < 1e-9);

        // 成功的限制性措辞拉低 over_restriction 的失败率
        registry.record_outcome("b", 2, &changes(&["You must keep the source order"]), 0.4);
        let restriction = registry.pattern("over_restriction").unwrap();
        assert_eq!((restriction.success_count, restriction.failure_count), (2, 5));
        assert!(restriction.failure_rate() < 0.8);

        let general = registry.record_outcome("c", 3, &changes(&["add a closing slide"]), 0.2);
        let p = registry.pattern(&general).unwrap();
        assert_eq!((p.success_count, p.failure_count), (1, 0));
        assert!((p.rate() - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_persist_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = PatternRegistry::open(dir.path(), true).await.unwrap();
        registry.record_outcome("a", 1, &changes(&["never use word X"]), -0.4);
        registry.update_best(1, 1, 4.2, 3.8);
        registry.save().await.unwrap();

        let doc = std::fs::read_to_string(dir.path().join(REGISTRY_DOC)).unwrap();
        assert!(doc.starts_with("# Patterns Registry"));
        assert!(doc.contains("[failed] a"));
        assert!(doc.contains("## Current Best"));
        assert!(doc.contains("## Statistics"));

        let reloaded = PatternRegistry::open(dir.path(), true).await.unwrap();
        assert_eq!(reloaded.data().failed.len(), 1);
        assert!(reloaded.check_similar(&changes(&["never use word X"])).repeats_failure());

        let fresh = PatternRegistry::open(dir.path(), false).await.unwrap();
        assert!(fresh.data().failed.is_empty());
    }

    #[tokio::test]
    async fn test_fresh_start_keeps_persisted_history() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = PatternRegistry::open(dir.path(), true).await.unwrap();
        registry.record_outcome("a", 1, &changes(&["never use word X"]), -0.4);
        registry.save().await.unwrap();

        let mut fresh = PatternRegistry::open(dir.path(), false).await.unwrap();
        fresh.record_outcome("b", 1, &changes(&["add a summary slide"]), 0.3);
        fresh.persist_state().await.unwrap();
        fresh.save().await.unwrap();

        let reloaded = PatternRegistry::open(dir.path(), true).await.unwrap();
        assert_eq!(reloaded.data().failed.len(), 1);
        assert!(reloaded.data().accepted.is_empty());
        assert_eq!(reloaded.data().stats.total_tested, 1);

        // 文档仍然只追加
        let doc = std::fs::read_to_string(dir.path().join(REGISTRY_DOC)).unwrap();
        assert!(doc.contains("[failed] a"));
        assert!(doc.contains("[accepted] b"));
    }

    #[tokio::test]
    async fn test_entries_reach_document_on_persist() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = PatternRegistry::open(dir.path(), true).await.unwrap();
        registry.record_outcome("a", 1, &changes(&["be better"]), -0.1);
        assert!(!dir.path().join(REGISTRY_DOC).exists());

        registry.persist_state().await.unwrap();
        registry.persist_state().await.unwrap();
        let doc = std::fs::read_to_string(dir.path().join(REGISTRY_DOC)).unwrap();
        assert_eq!(doc.matches("[failed] a").count(), 1);
    }
}
