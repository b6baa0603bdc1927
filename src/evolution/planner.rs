//! 改进设计：把差距转成结构化的变更说明
//!
//! 提示路线：按本轮调色板挑选增强类型，在当前产物的可编辑区内生成具体的变异操作，
//! 先查模式登记册，与已知失败完全相同的变更直接跳过。
//! 能力路线：生成 ToolSpec 交给外部实现方；仅提示模式下跳过。

use std::collections::HashSet;

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;

use crate::evolution::registry::PatternRegistry;
use crate::evolution::scheduler::{AdaptiveScheduler, EnhancementKind, Intensity, ScheduleStep};
use crate::evolution::types::{ChangeSpec, Gap};
use crate::mutation::{InstructionArtifact, MutationEngine, MutationOperation, MutationPlan, ParsedArtifact};
use crate::oracle::ToolSpec;

/// 维度所属的关注方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FocusArea {
    Accuracy,
    Content,
    Visual,
    Overall,
}

impl FocusArea {
    pub fn from_dimension(dimension: &str) -> Self {
        let d = dimension.to_lowercase();
        let any = |words: &[&str]| words.iter().any(|w| d.contains(w));
        if any(&["accura", "fact", "source", "credib", "citation"]) {
            FocusArea::Accuracy
        } else if any(&["complete", "coverage", "content", "information", "coherence"]) {
            FocusArea::Content
        } else if any(&["visual", "design", "layout", "image", "consistency"]) {
            FocusArea::Visual
        } else {
            FocusArea::Overall
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FocusArea::Accuracy => "accuracy",
            FocusArea::Content => "content",
            FocusArea::Visual => "visual",
            FocusArea::Overall => "overall",
        }
    }

    pub fn items(&self) -> &'static [&'static str] {
        match self {
            FocusArea::Accuracy => &[
                "source adherence",
                "fact verification",
                "citation requirements",
                "creative addition prevention",
                "reference validation",
            ],
            FocusArea::Content => &[
                "coverage completeness",
                "detail extraction",
                "example inclusion",
                "supporting evidence",
                "systematic processing",
            ],
            FocusArea::Visual => &[
                "design consistency",
                "hierarchy clarity",
                "readability optimization",
                "visual balance",
                "formatting precision",
            ],
            FocusArea::Overall => &[
                "quality assurance",
                "systematic improvement",
                "multi-dimensional optimization",
                "coherence enhancement",
                "excellence targeting",
            ],
        }
    }

    fn replacements(&self) -> &'static [(&'static str, &'static str)] {
        match self {
            FocusArea::Accuracy => &[
                (" generate ", " generate with strict source adherence "),
                (" include ", " include ONLY from source material "),
                (" create ", " create based exclusively on provided content "),
                (" should ", " MUST "),
            ],
            FocusArea::Content => &[
                (" key points ", " ALL key points with supporting details "),
                (" important ", " essential and comprehensive "),
                (" include ", " systematically include "),
                (" cover ", " exhaustively cover "),
            ],
            FocusArea::Visual | FocusArea::Overall => &[
                (" good ", " excellent "),
                (" appropriate ", " optimal "),
                (" should ", " must "),
                (" try ", " ensure "),
            ],
        }
    }

    fn capability_suffix(&self) -> &'static str {
        match self {
            FocusArea::Accuracy => "citation_verifier",
            FocusArea::Content => "coverage_checker",
            FocusArea::Visual => "layout_optimizer",
            FocusArea::Overall => "quality_validator",
        }
    }
}

const EMPHASIS: &[(&str, &str)] = &[(" should ", " MUST "), (" try to ", " ensure you "), (" consider ", " make sure to ")];
const STRENGTHENING: &[(&str, &str)] = &[
    (" if possible", " in every case"),
    (" where appropriate", " consistently"),
    (" avoid ", " strictly avoid "),
];
const PRECISION: &[(&str, &str)] = &[
    (" approximately ", " exactly "),
    (" generally ", " specifically "),
    (" often ", " consistently "),
    (" usually ", " always "),
    (" might ", " will "),
    (" could ", " should "),
    (" may ", " must "),
];
const EMPHASIS_ADJUST: &[(&str, &str)] = &[(" good ", " excellent "), (" appropriate ", " optimal "), (" try ", " ensure ")];

/// 被跳过的差距或变更
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedChange {
    pub gap_id: String,
    pub reason: String,
}

/// 一轮设计的结果
#[derive(Debug, Clone, Default, Serialize)]
pub struct DesignOutcome {
    pub changes: Vec<ChangeSpec>,
    pub skipped: Vec<SkippedChange>,
    pub registry_warnings: Vec<String>,
}

/// 设计时的上下文
pub struct DesignContext<'a> {
    pub iteration: u32,
    pub step: &'a ScheduleStep,
    pub artifact: &'a InstructionArtifact,
    pub registry: Option<&'a PatternRegistry>,
    /// 已部署的能力名
    pub deployed_capabilities: &'a [String],
}

/// 改进设计器
pub struct ImprovementDesigner {
    engine: MutationEngine,
    scheduler: AdaptiveScheduler,
    max_enhancements: usize,
    prompt_only: bool,
    rng: Option<StdRng>,
}

impl ImprovementDesigner {
    pub fn new(
        engine: MutationEngine,
        scheduler: AdaptiveScheduler,
        max_enhancements: usize,
        prompt_only: bool,
        seed: Option<u64>,
    ) -> Self {
        Self {
            engine,
            scheduler,
            max_enhancements: max_enhancements.max(1),
            prompt_only,
            rng: seed.map(StdRng::seed_from_u64),
        }
    }

    pub fn scheduler(&self) -> &AdaptiveScheduler {
        &self.scheduler
    }

    pub fn design(&mut self, gaps: &[Gap], ctx: &DesignContext<'_>) -> DesignOutcome {
        let parsed = self.engine.parse(&ctx.artifact.text);
        let mut outcome = DesignOutcome::default();
        let mut used: HashSet<String> = HashSet::new();

        for gap in gaps {
            if gap.route.needs_prompt() {
                match self.design_text(gap, ctx, &parsed, &mut used, &mut outcome.registry_warnings) {
                    Ok(change) => outcome.changes.push(change),
                    Err(reason) => {
                        tracing::debug!("No text mutation for {}: {}", gap.id, reason);
                        outcome.skipped.push(SkippedChange {
                            gap_id: gap.id.clone(),
                            reason,
                        });
                    }
                }
            }
            if gap.route.needs_tool() {
                if self.prompt_only {
                    outcome.skipped.push(SkippedChange {
                        gap_id: gap.id.clone(),
                        reason: "capability route disabled (prompt-only mode)".into(),
                    });
                } else {
                    outcome.changes.push(ChangeSpec::Capability {
                        gap_id: gap.id.clone(),
                        spec: self.design_capability(gap, ctx.deployed_capabilities),
                    });
                }
            }
        }

        tracing::info!(
            "Iteration {}: designed {} changes for {} gaps ({} skipped, creativity {})",
            ctx.iteration,
            outcome.changes.len(),
            gaps.len(),
            outcome.skipped.len(),
            ctx.step.creativity.as_str()
        );
        outcome
    }

    fn design_text(
        &mut self,
        gap: &Gap,
        ctx: &DesignContext<'_>,
        parsed: &ParsedArtifact,
        used: &mut HashSet<String>,
        warnings: &mut Vec<String>,
    ) -> Result<ChangeSpec, String> {
        if parsed.zones.is_empty() {
            return Err("artifact has no editable zones".into());
        }
        let focus = FocusArea::from_dimension(&gap.dimension);
        let kinds = self
            .scheduler
            .select_kinds(ctx.step, self.max_enhancements, self.rng.as_mut());

        let mut plan = MutationPlan::new(ctx.artifact.version);
        let mut enhancements = Vec::new();
        for kind in kinds {
            let Some(op) = generate(kind, gap, focus, ctx.step.intensity, parsed) else {
                continue;
            };
            let key = change_key(&op);
            if !used.insert(key.clone()) {
                continue;
            }
            if let Some(registry) = ctx.registry {
                let report = registry.check_similar(std::slice::from_ref(&key));
                if let Some(m) = report.exact_matches.first() {
                    tracing::info!("Skipping {} for {}: repeats known failure ({})", kind.as_str(), gap.id, m.lesson);
                    continue;
                }
                for w in &report.pattern_warnings {
                    warnings.push(format!("{}: {} ({})", gap.id, w.pattern, w.warning));
                }
                for p in &report.partial_matches {
                    warnings.push(format!(
                        "{}: similar to failed change \"{}\" ({:.0}% overlap)",
                        gap.id,
                        p.previous,
                        p.similarity * 100.0
                    ));
                }
            }
            plan.push(op);
            enhancements.push(kind.as_str().to_string());
        }

        if plan.is_empty() {
            return Err(format!(
                "no applicable {} enhancement in the current artifact",
                ctx.step.creativity.as_str()
            ));
        }
        Ok(ChangeSpec::TextMutation {
            gap_id: gap.id.clone(),
            dimension: gap.dimension.clone(),
            name: format!("{}_{}", gap.dimension, enhancements[0]),
            plan,
            enhancements,
            rationale: format!(
                "{} ({} → {:.2}, {} intensity, focus {})",
                gap.description,
                format_score(gap.current_score),
                gap.target_score,
                ctx.step.intensity.as_str(),
                focus.as_str()
            ),
        })
    }

    fn design_capability(&self, gap: &Gap, deployed: &[String]) -> ToolSpec {
        let focus = FocusArea::from_dimension(&gap.dimension);
        let name = format!("{}_{}", gap.dimension, focus.capability_suffix());
        let modifies = deployed.iter().find(|d| **d == name).cloned();
        ToolSpec {
            description: format!(
                "{} capability addressing: {}",
                focus.capability_suffix().replace('_', " "),
                gap.description
            ),
            target_gap: gap.id.clone(),
            target_dimensions: vec![gap.dimension.clone()],
            expected_improvement: ((gap.target_score - gap.current_score) / 2.0).max(0.0),
            implementation_notes: format!("Focus on {}. {}", focus.items().join(", "), gap.rationale),
            modifies,
            name,
        }
    }
}

fn format_score(score: f64) -> String {
    format!("{:.2}", score)
}

/// 登记册里用于比较的变更文本
pub fn change_key(op: &MutationOperation) -> String {
    match op {
        MutationOperation::FindReplace { search, replacement, .. } => {
            format!("{} -> {}", search.trim(), replacement.trim())
        }
        _ => op.new_text().trim().to_string(),
    }
}

/// 插入点：文本末尾（不会落在任何受保护元素内部）
fn insertion_point(parsed: &ParsedArtifact) -> Option<usize> {
    (!parsed.zones.is_empty()).then_some(parsed.text.len())
}

fn insert_op(parsed: &ParsedArtifact, content: String, why: String) -> Option<MutationOperation> {
    if parsed.text.contains(content.trim()) {
        return None;
    }
    let pos = insertion_point(parsed)?;
    Some(MutationOperation::insert(pos, content, why))
}

/// 表中第一个只出现在可编辑区内、且替换后不会重复叠加的词组
fn replace_op(parsed: &ParsedArtifact, table: &[(&str, &str)], why: String) -> Option<MutationOperation> {
    for (find, replace) in table {
        if parsed.text.contains(replace) {
            continue;
        }
        let mut hits = parsed.text.match_indices(find).peekable();
        if hits.peek().is_none() {
            continue;
        }
        let all_editable = hits.all(|(start, m)| {
            let end = start + m.len();
            parsed.zones.iter().any(|z| z.start <= start && end <= z.end)
        });
        if all_editable {
            return Some(MutationOperation::find_replace(*find, *replace, why));
        }
    }
    None
}

fn upper(dimension: &str) -> String {
    dimension.replace('_', " ").to_uppercase()
}

fn title(dimension: &str) -> String {
    let spaced = dimension.replace('_', " ");
    let mut chars = spaced.chars();
    match chars.next() {
        Some(c) => c.to_uppercase().collect::<String>() + chars.as_str(),
        None => spaced,
    }
}

/// 按增强类型生成一个变异操作；当前产物中无处可改时返回 None
pub fn generate(
    kind: EnhancementKind,
    gap: &Gap,
    focus: FocusArea,
    intensity: Intensity,
    parsed: &ParsedArtifact,
) -> Option<MutationOperation> {
    let dim = gap.dimension.as_str();
    let why = format!("{} for {} gap ({:.2})", kind.as_str(), dim, gap.current_score);
    match kind {
        EnhancementKind::StructuralAddition => {
            let body = match focus {
                FocusArea::Accuracy => [
                    "## Source Verification Protocol",
                    "1. Every factual claim must reference the source explicitly",
                    "2. Mark any inference or interpretation with [INFERRED]",
                    "3. Flag uncertainty with confidence levels: [HIGH|MEDIUM|LOW]",
                    "4. Self-audit: list any unsupported claims at the end",
                ]
                .join("\n"),
                FocusArea::Content => [
                    "## Coverage Checklist",
                    "- All main concepts from the source included",
                    "- Supporting examples and data preserved",
                    "- Key relationships between ideas mapped",
                    "- Completeness verification: re-read the source after generation",
                ]
                .join("\n"),
                FocusArea::Visual => [
                    "## Visual Consistency Rules",
                    "- One clear visual hierarchy per slide",
                    "- Consistent spacing, contrast and typography",
                    "- No more than one focal element per layout",
                ]
                .join("\n"),
                FocusArea::Overall => [
                    "## Quality Requirements",
                    "- Systematic approach to every section",
                    "- Multi-pass quality verification",
                    "- Consistency checks across all elements",
                ]
                .join("\n"),
            };
            insert_op(parsed, format!("\n\n{} ({})", body, title(dim)), why)
        }
        EnhancementKind::ProtocolInsertion => insert_op(
            parsed,
            format!(
                "\n\n## {} Verification Steps\n1. Draft the output\n2. Check it against: {}\n3. Revise anything that fails a check",
                title(dim),
                focus.items().join(", ")
            ),
            why,
        ),
        EnhancementKind::ConstraintAmplification => {
            let text = match intensity {
                Intensity::Aggressive => format!(
                    "\n\n{} REQUIREMENT: this is non-negotiable and must be verified before output.",
                    upper(dim)
                ),
                Intensity::Moderate => format!("\n\n{} requirements must be carefully verified.", title(dim)),
                Intensity::Conservative => format!("\n\nPay special attention to {} requirements.", dim.replace('_', " ")),
            };
            insert_op(parsed, text, why)
        }
        EnhancementKind::InstructionExpansion => insert_op(
            parsed,
            format!(
                "\n\nFor {}, explicitly address each of: {}.",
                dim.replace('_', " "),
                focus.items().join(", ")
            ),
            why,
        ),
        EnhancementKind::ValidationInjection => {
            let text = match intensity {
                Intensity::Aggressive => format!(
                    "\n\n## Mandatory {} Validation\nBefore finalizing output, verify each {} criterion and fix any that fail.",
                    title(dim),
                    dim.replace('_', " ")
                ),
                Intensity::Moderate => format!(
                    "\n\n## {} Validation\nVerify that {} requirements are met before output.",
                    title(dim),
                    dim.replace('_', " ")
                ),
                Intensity::Conservative => format!("\n\nReview {} quality before completion.", dim.replace('_', " ")),
            };
            insert_op(parsed, text, why)
        }
        EnhancementKind::TargetedReplacement => replace_op(parsed, focus.replacements(), why),
        EnhancementKind::EmphasisModification => replace_op(parsed, EMPHASIS, why),
        EnhancementKind::ConstraintStrengthening => replace_op(parsed, STRENGTHENING, why),
        EnhancementKind::InstructionClarification => insert_op(
            parsed,
            format!(
                "\n\nClarification: {} is judged on {}. Address each one explicitly.",
                dim.replace('_', " "),
                focus.items()[..2].join(" and ")
            ),
            why,
        ),
        EnhancementKind::FormatImprovement => insert_op(
            parsed,
            format!(
                "\n\nFormat every section that affects {} with a clear heading followed by concise bullet points.",
                dim.replace('_', " ")
            ),
            why,
        ),
        EnhancementKind::PrecisionTuning => replace_op(parsed, PRECISION, why),
        EnhancementKind::EmphasisAdjustment => replace_op(parsed, EMPHASIS_ADJUST, why),
        EnhancementKind::ConstraintRefinement => insert_op(
            parsed,
            format!("\n\nKeep {} requirements specific and measurable.", dim.replace('_', " ")),
            why,
        ),
        EnhancementKind::ClarityImprovement => insert_op(
            parsed,
            format!("\n\nKeep wording about {} simple and unambiguous.", dim.replace('_', " ")),
            why,
        ),
        EnhancementKind::FormattingPolish => replace_op(parsed, &[("\n\n\n", "\n\n")], why),
    }
}
