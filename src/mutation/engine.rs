//! 变异引擎：在可编辑区内应用变异并校验结构完整性
//!
//! - reconstruct：拒绝任何与受保护元素相交的操作、彼此重叠的操作（按位置先到先得），
//!   其余按位置倒序应用，保证前面的偏移不失效
//! - validate：新文本中的占位符必须覆盖调用方给出的关键子集；缺失时产生 ValidationWarning，
//!   宽松模式下新版本照常保留，严格模式下丢弃该版本

use serde::{Deserialize, Serialize};

use crate::core::{EvolutionError, ValidationWarning};
use crate::mutation::{ArtifactLineage, ArtifactParser, MutationOperation, MutationPlan, ParsedArtifact};

/// 校验严格度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strictness {
    /// 记录告警后继续使用新版本
    #[default]
    Lenient,
    /// 缺失关键元素时丢弃新版本
    Strict,
}

impl std::str::FromStr for Strictness {
    type Err = EvolutionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "lenient" | "log_and_continue" => Ok(Strictness::Lenient),
            "strict" => Ok(Strictness::Strict),
            other => Err(EvolutionError::Config(format!("unknown validation level: {other}"))),
        }
    }
}

/// 被拒绝的操作及原因
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedMutation {
    pub index: usize,
    pub operation: MutationOperation,
    pub reason: String,
}

/// reconstruct 的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconstruction {
    pub text: String,
    /// 实际应用的操作（原列表中的序号）
    pub applied: Vec<usize>,
    pub rejected: Vec<RejectedMutation>,
    /// 原文的全部受保护元素在新文本中仍然存在
    pub structurally_valid: bool,
}

impl Reconstruction {
    pub fn changed(&self) -> bool {
        !self.applied.is_empty()
    }
}

/// validate 的结果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub missing_critical: Vec<String>,
    pub missing_baseline: Vec<String>,
}

impl ValidationReport {
    pub fn is_clean(&self) -> bool {
        self.missing_critical.is_empty() && self.missing_baseline.is_empty()
    }

    pub fn all_missing(&self) -> Vec<String> {
        let mut all = self.missing_critical.clone();
        for m in &self.missing_baseline {
            if !all.contains(m) {
                all.push(m.clone());
            }
        }
        all
    }
}

/// 一次 evolve 的结果
#[derive(Debug, Clone)]
pub struct EvolveOutcome {
    pub reconstruction: Reconstruction,
    /// 新版本号；未应用任何操作或被严格模式丢弃时为 None
    pub new_version: Option<u32>,
    pub warning: Option<ValidationWarning>,
}

/// 一个已定位的编辑：[start, end) 替换为 content
#[derive(Debug, Clone)]
struct Edit {
    index: usize,
    start: usize,
    end: usize,
    content: String,
}

/// 文本变异引擎
#[derive(Debug, Clone)]
pub struct MutationEngine {
    parser: ArtifactParser,
    strictness: Strictness,
    critical: Vec<String>,
}

impl MutationEngine {
    pub fn new(strictness: Strictness, critical: Vec<String>) -> Result<Self, EvolutionError> {
        let parser = ArtifactParser::new().map_err(|e| EvolutionError::Config(e.to_string()))?;
        Ok(Self {
            parser,
            strictness,
            critical,
        })
    }

    pub fn strictness(&self) -> Strictness {
        self.strictness
    }

    pub fn critical(&self) -> &[String] {
        &self.critical
    }

    pub fn parse(&self, text: &str) -> ParsedArtifact {
        self.parser.parse(text)
    }

    /// 在 parsed 上应用操作；空操作列表原样返回
    pub fn reconstruct(&self, parsed: &ParsedArtifact, operations: &[MutationOperation]) -> Reconstruction {
        let mut rejected = Vec::new();
        let mut edits: Vec<Edit> = Vec::new();

        for (index, op) in operations.iter().enumerate() {
            match self.locate(parsed, index, op) {
                Ok(mut located) => edits.append(&mut located),
                Err(reason) => {
                    tracing::debug!("mutation {} rejected: {}", index, reason);
                    rejected.push(RejectedMutation {
                        index,
                        operation: op.clone(),
                        reason,
                    });
                }
            }
        }

        // 按位置排序；与之前已接受的编辑重叠的整条操作被拒绝
        edits.sort_by_key(|e| (e.start, e.end, e.index));
        let mut accepted: Vec<Edit> = Vec::new();
        let mut dropped_ops: Vec<usize> = Vec::new();
        for edit in edits {
            if dropped_ops.contains(&edit.index) {
                continue;
            }
            let clash = accepted
                .iter()
                .any(|a| a.index != edit.index && overlaps(a, &edit));
            if clash {
                dropped_ops.push(edit.index);
            } else {
                accepted.push(edit);
            }
        }
        if !dropped_ops.is_empty() {
            accepted.retain(|e| !dropped_ops.contains(&e.index));
            for index in &dropped_ops {
                rejected.push(RejectedMutation {
                    index: *index,
                    operation: operations[*index].clone(),
                    reason: "overlaps an earlier mutation".to_string(),
                });
            }
        }

        // 倒序应用；同一插入点按操作顺序保持
        let mut text = parsed.text.clone();
        accepted.sort_by_key(|e| (e.start, e.end, e.index));
        for edit in accepted.iter().rev() {
            text.replace_range(edit.start..edit.end, &edit.content);
        }

        let mut applied: Vec<usize> = accepted.iter().map(|e| e.index).collect();
        applied.sort_unstable();
        applied.dedup();
        rejected.sort_by_key(|r| r.index);

        let structurally_valid = self.preserves_protected(parsed, &text);
        Reconstruction {
            text,
            applied,
            rejected,
            structurally_valid,
        }
    }

    /// 关键占位符与 v0 基线元素校验
    pub fn validate(&self, text: &str, lineage: Option<&ArtifactLineage>) -> ValidationReport {
        let placeholders = self.parser.parse(text).placeholders();
        let missing_critical = self
            .critical
            .iter()
            .filter(|c| !placeholders.contains(c) && !text.contains(c.as_str()))
            .cloned()
            .collect();
        let missing_baseline = lineage
            .map(|l| l.missing_from_baseline(text))
            .unwrap_or_default();
        ValidationReport {
            missing_critical,
            missing_baseline,
        }
    }

    /// 在版本链的当前版本上执行 plan，按严格度决定是否追加新版本
    pub fn evolve(
        &self,
        lineage: &mut ArtifactLineage,
        plan: &MutationPlan,
        change_ids: Vec<String>,
    ) -> Result<EvolveOutcome, EvolutionError> {
        let current = lineage.current();
        if plan.base_version != current.version {
            return Err(EvolutionError::Mutation(format!(
                "plan targets v{} but current artifact is v{}",
                plan.base_version, current.version
            )));
        }

        let parsed = self.parse(&current.text);
        let reconstruction = self.reconstruct(&parsed, &plan.operations);
        if !reconstruction.changed() {
            return Ok(EvolveOutcome {
                reconstruction,
                new_version: None,
                warning: None,
            });
        }

        let report = self.validate(&reconstruction.text, Some(lineage));
        let next_version = current.version + 1;
        let warning = (!report.is_clean()).then(|| ValidationWarning {
            artifact_version: next_version,
            missing: report.all_missing(),
            message: match self.strictness {
                Strictness::Lenient => "kept evolved artifact despite missing elements".to_string(),
                Strictness::Strict => "discarded evolved artifact".to_string(),
            },
        });
        if let Some(w) = &warning {
            tracing::warn!("Validation warning: {}", w);
        }

        let new_version = match (&warning, self.strictness) {
            (Some(_), Strictness::Strict) => None,
            _ => Some(lineage.push(reconstruction.text.clone(), change_ids)),
        };

        Ok(EvolveOutcome {
            reconstruction,
            new_version,
            warning,
        })
    }

    fn locate(&self, parsed: &ParsedArtifact, index: usize, op: &MutationOperation) -> Result<Vec<Edit>, String> {
        let text = &parsed.text;
        match op {
            MutationOperation::ReplaceSpan { start, end, content, .. } => {
                let (start, end) = (*start, *end);
                if start > end || end > text.len() {
                    return Err(format!("span [{start}..{end}) out of bounds"));
                }
                if !text.is_char_boundary(start) || !text.is_char_boundary(end) {
                    return Err(format!("span [{start}..{end}) splits a character"));
                }
                if let Some(p) = parsed.intersects_protected(start, end) {
                    return Err(format!("span [{start}..{end}) touches protected element {}", p.text));
                }
                // 空区间等同插入，可以落在可编辑区边界上
                if start < end && parsed.zone_containing(start, end).is_none() {
                    return Err(format!("span [{start}..{end}) is not inside an editable zone"));
                }
                Ok(vec![Edit {
                    index,
                    start,
                    end,
                    content: content.clone(),
                }])
            }
            MutationOperation::InsertContent { position, content, .. } => {
                let pos = *position;
                if pos > text.len() || !text.is_char_boundary(pos) {
                    return Err(format!("insert position {pos} is not a valid offset"));
                }
                if let Some(p) = parsed.intersects_protected(pos, pos) {
                    return Err(format!("insert position {pos} is inside protected element {}", p.text));
                }
                Ok(vec![Edit {
                    index,
                    start: pos,
                    end: pos,
                    content: content.clone(),
                }])
            }
            MutationOperation::FindReplace { search, replacement, .. } => {
                if search.is_empty() {
                    return Err("empty search text".to_string());
                }
                let mut edits = Vec::new();
                let mut outside = 0;
                for (start, matched) in text.match_indices(search.as_str()) {
                    let end = start + matched.len();
                    if let Some(p) = parsed.intersects_protected(start, end) {
                        return Err(format!("search text \"{search}\" overlaps protected element {}", p.text));
                    }
                    // 只替换完整落在单个可编辑区内的出现
                    if parsed.zone_containing(start, end).is_none() {
                        outside += 1;
                        continue;
                    }
                    edits.push(Edit {
                        index,
                        start,
                        end,
                        content: replacement.clone(),
                    });
                }
                if edits.is_empty() {
                    return Err(match outside {
                        0 => format!("search text \"{search}\" not found"),
                        n => format!("search text \"{search}\" only occurs outside editable zones ({n}x)"),
                    });
                }
                Ok(edits)
            }
        }
    }

    fn preserves_protected(&self, parsed: &ParsedArtifact, new_text: &str) -> bool {
        let texts = parsed.protected_texts();
        let mut seen: Vec<&String> = Vec::new();
        texts.iter().all(|t| {
            if seen.contains(&t) {
                return true;
            }
            seen.push(t);
            let required = texts.iter().filter(|x| *x == t).count();
            new_text.matches(t.as_str()).count() >= required
        })
    }
}

fn overlaps(a: &Edit, b: &Edit) -> bool {
    let a_insert = a.start == a.end;
    let b_insert = b.start == b.end;
    match (a_insert, b_insert) {
        // 同一位置的两次插入可以共存
        (true, true) => false,
        (true, false) => b.start < a.start && a.start < b.end,
        (false, true) => a.start < b.start && b.start < a.end,
        (false, false) => !(a.end <= b.start || a.start >= b.end),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ARTIFACT: &str = "Create slides about {theme} for {purpose}.\n## Requirements:\nYou should keep it short.\nSource: {blog_content}";

    fn engine() -> MutationEngine {
        MutationEngine::new(
            Strictness::Lenient,
            vec!["{blog_content}".into(), "{purpose}".into(), "{theme}".into()],
        )
        .unwrap()
    }

    #[test]
    fn test_empty_operations_return_original() {
        let engine = engine();
        let parsed = engine.parse(ARTIFACT);
        let out = engine.reconstruct(&parsed, &[]);
        assert_eq!(out.text, ARTIFACT);
        assert!(out.structurally_valid);
        assert!(!out.changed());
    }

    #[test]
    fn test_find_replace_in_editable_zone() {
        let engine = engine();
        let parsed = engine.parse(ARTIFACT);
        let ops = vec![MutationOperation::find_replace("should", "MUST", "stronger")];
        let out = engine.reconstruct(&parsed, &ops);
        assert!(out.text.contains("You MUST keep it short."));
        assert_eq!(out.applied, vec![0]);
        assert!(out.structurally_valid);
    }

    #[test]
    fn test_find_replace_overlapping_placeholder_is_rejected() {
        let engine = engine();
        let parsed = engine.parse(ARTIFACT);
        let ops = vec![MutationOperation::find_replace(
            "about {theme}",
            "about anything",
            "broaden",
        )];
        let out = engine.reconstruct(&parsed, &ops);
        assert_eq!(out.text, ARTIFACT);
        assert!(!out.text.contains("about anything"));
        assert_eq!(out.rejected.len(), 1);
        assert!(out.rejected[0].reason.contains("{theme}"));
    }

    #[test]
    fn test_replace_span_touching_marker_is_rejected() {
        let engine = engine();
        let parsed = engine.parse(ARTIFACT);
        let marker = ARTIFACT.find("## Requirements:").unwrap();
        let ops = vec![MutationOperation::replace_span(marker - 2, marker + 3, "x", "bad")];
        let out = engine.reconstruct(&parsed, &ops);
        assert_eq!(out.text, ARTIFACT);
        assert_eq!(out.rejected.len(), 1);
    }

    #[test]
    fn test_whitespace_between_protected_elements_is_not_editable() {
        let engine = engine();
        let text = "Intro {a}   {b} outro";
        let parsed = engine.parse(text);
        assert!(parsed.zone_containing(9, 12).is_none());

        let ops = vec![
            MutationOperation::find_replace("   ", " INJECTED ", "fill gap"),
            MutationOperation::replace_span(9, 12, " INJECTED ", "fill gap"),
        ];
        let out = engine.reconstruct(&parsed, &ops);
        assert_eq!(out.text, text);
        assert!(out.applied.is_empty());
        assert_eq!(out.rejected.len(), 2);

        // 插入可以贴着可编辑区边界
        let out = engine.reconstruct(&parsed, &[MutationOperation::insert(9, " and", "join")]);
        assert_eq!(out.text, "Intro {a} and   {b} outro");
    }

    #[test]
    fn test_find_replace_skips_occurrences_outside_zones() {
        let engine = engine();
        let text = "keep  it {a}  {b} keep  going";
        let parsed = engine.parse(text);
        let out = engine.reconstruct(&parsed, &[MutationOperation::find_replace("  ", " ", "tidy")]);
        assert_eq!(out.text, "keep it {a}  {b} keep going");
        assert_eq!(out.applied, vec![0]);
    }

    #[test]
    fn test_insert_and_replace_apply_in_reverse_order() {
        let engine = engine();
        let text = "Alpha beta gamma";
        let parsed = engine.parse(text);
        let ops = vec![
            MutationOperation::insert(0, "NOTE ", "prefix"),
            MutationOperation::replace_span(6, 10, "BETA", "caps"),
            MutationOperation::insert(text.len(), " end", "suffix"),
        ];
        let out = engine.reconstruct(&parsed, &ops);
        assert_eq!(out.text, "NOTE Alpha BETA gamma end");
        assert_eq!(out.applied, vec![0, 1, 2]);
    }

    #[test]
    fn test_overlapping_operations_first_by_position_wins() {
        let engine = engine();
        let parsed = engine.parse("one two three");
        let ops = vec![
            MutationOperation::replace_span(4, 13, "2 3", "later"),
            MutationOperation::replace_span(0, 7, "1 2", "earlier"),
        ];
        let out = engine.reconstruct(&parsed, &ops);
        assert_eq!(out.text, "1 2 three");
        assert_eq!(out.applied, vec![1]);
        assert_eq!(out.rejected[0].index, 0);
    }

    #[test]
    fn test_validate_reports_missing_critical() {
        let engine = engine();
        let report = engine.validate("slides about {theme}", None);
        assert_eq!(report.missing_critical, vec!["{blog_content}", "{purpose}"]);
    }

    #[test]
    fn test_evolve_lenient_keeps_version_with_warning() {
        let engine = MutationEngine::new(Strictness::Lenient, vec!["{missing}".into()]).unwrap();
        let mut lineage = ArtifactLineage::new("Write {theme} well", vec!["{theme}".into()]);
        let plan = MutationPlan {
            base_version: 0,
            operations: vec![MutationOperation::find_replace("well", "very well", "emphasis")],
        };
        let out = engine.evolve(&mut lineage, &plan, vec!["id".into()]).unwrap();
        assert_eq!(out.new_version, Some(1));
        let warning = out.warning.unwrap();
        assert_eq!(warning.missing, vec!["{missing}"]);
        assert_eq!(lineage.current().text, "Write {theme} very well");
    }

    #[test]
    fn test_evolve_strict_discards_version() {
        let engine = MutationEngine::new(Strictness::Strict, vec!["{missing}".into()]).unwrap();
        let mut lineage = ArtifactLineage::new("Write {theme} well", vec!["{theme}".into()]);
        let plan = MutationPlan {
            base_version: 0,
            operations: vec![MutationOperation::find_replace("well", "better", "x")],
        };
        let out = engine.evolve(&mut lineage, &plan, vec![]).unwrap();
        assert!(out.new_version.is_none());
        assert!(out.warning.is_some());
        assert_eq!(lineage.current().version, 0);
    }

    #[test]
    fn test_evolve_rejects_stale_plan() {
        let engine = engine();
        let mut lineage = ArtifactLineage::new("text", vec![]);
        let plan = MutationPlan {
            base_version: 3,
            operations: vec![],
        };
        assert!(matches!(
            engine.evolve(&mut lineage, &plan, vec![]),
            Err(EvolutionError::Mutation(_))
        ));
    }

    #[test]
    fn test_strictness_from_str() {
        assert_eq!("strict".parse::<Strictness>().unwrap(), Strictness::Strict);
        assert_eq!("Lenient".parse::<Strictness>().unwrap(), Strictness::Lenient);
        assert!("loose".parse::<Strictness>().is_err());
    }

    proptest::proptest! {
        #[test]
        fn prop_empty_plan_is_identity(text in "[a-zA-Z0-9 {}#:.<>/_\n]{0,200}") {
            let engine = engine();
            let parsed = engine.parse(&text);
            let out = engine.reconstruct(&parsed, &[]);
            proptest::prop_assert_eq!(out.text, text);
        }
    }
}
