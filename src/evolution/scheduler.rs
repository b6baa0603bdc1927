//! 自适应调度器：迭代进度 → 温度 → 创造力等级 → 增强类型调色板
//!
//! 默认的 adaptive 三段式：探索（0.9→0.7）、平衡（0.7→0.4）、利用（0.4→0.15）。
//! 其余命名调度只是两端点之间的线性插值，接口不变。

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::core::EvolutionError;

/// 温度调度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Schedule {
    #[default]
    Adaptive,
    Aggressive,
    Conservative,
    Linear,
}

impl Schedule {
    pub fn as_str(&self) -> &'static str {
        match self {
            Schedule::Adaptive => "adaptive",
            Schedule::Aggressive => "aggressive",
            Schedule::Conservative => "conservative",
            Schedule::Linear => "linear",
        }
    }

    /// progress ∈ [0, 1] 对应的温度
    pub fn temperature(&self, progress: f64) -> f64 {
        let p = progress.clamp(0.0, 1.0);
        match self {
            Schedule::Adaptive => {
                if p < 0.3 {
                    0.9 - (p / 0.3) * 0.2
                } else if p < 0.7 {
                    0.7 - ((p - 0.3) / 0.4) * 0.3
                } else {
                    0.4 - ((p - 0.7) / 0.3) * 0.25
                }
            }
            Schedule::Aggressive => lerp(0.95, 0.70, p),
            Schedule::Conservative => lerp(0.6, 0.2, p),
            Schedule::Linear => lerp(0.8, 0.2, p),
        }
    }
}

impl std::str::FromStr for Schedule {
    type Err = EvolutionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "adaptive" => Ok(Schedule::Adaptive),
            "aggressive" => Ok(Schedule::Aggressive),
            "conservative" => Ok(Schedule::Conservative),
            "linear" => Ok(Schedule::Linear),
            other => Err(EvolutionError::Config(format!("unknown schedule: {other}"))),
        }
    }
}

fn lerp(start: f64, end: f64, t: f64) -> f64 {
    start + (end - start) * t
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreativityLevel {
    High,
    Medium,
    Low,
}

impl CreativityLevel {
    /// > 0.7 高，0.4–0.7 中，< 0.4 低
    pub fn from_temperature(temperature: f64) -> Self {
        if temperature > 0.7 {
            CreativityLevel::High
        } else if temperature >= 0.4 {
            CreativityLevel::Medium
        } else {
            CreativityLevel::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CreativityLevel::High => "high",
            CreativityLevel::Medium => "medium",
            CreativityLevel::Low => "low",
        }
    }

    pub fn intensity(&self) -> Intensity {
        match self {
            CreativityLevel::High => Intensity::Aggressive,
            CreativityLevel::Medium => Intensity::Moderate,
            CreativityLevel::Low => Intensity::Conservative,
        }
    }

    pub fn palette(&self) -> &'static [EnhancementKind] {
        use EnhancementKind::*;
        match self {
            CreativityLevel::High => &[
                StructuralAddition,
                ProtocolInsertion,
                ConstraintAmplification,
                InstructionExpansion,
                ValidationInjection,
            ],
            CreativityLevel::Medium => &[
                TargetedReplacement,
                EmphasisModification,
                ConstraintStrengthening,
                InstructionClarification,
                FormatImprovement,
            ],
            CreativityLevel::Low => &[
                PrecisionTuning,
                EmphasisAdjustment,
                ConstraintRefinement,
                ClarityImprovement,
                FormattingPolish,
            ],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intensity {
    Aggressive,
    Moderate,
    Conservative,
}

impl Intensity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Intensity::Aggressive => "aggressive",
            Intensity::Moderate => "moderate",
            Intensity::Conservative => "conservative",
        }
    }
}

/// 增强类型；每个等级的调色板各含五种
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnhancementKind {
    StructuralAddition,
    ProtocolInsertion,
    ConstraintAmplification,
    InstructionExpansion,
    ValidationInjection,
    TargetedReplacement,
    EmphasisModification,
    ConstraintStrengthening,
    InstructionClarification,
    FormatImprovement,
    PrecisionTuning,
    EmphasisAdjustment,
    ConstraintRefinement,
    ClarityImprovement,
    FormattingPolish,
}

impl EnhancementKind {
    pub fn as_str(&self) -> &'static str {
        use EnhancementKind::*;
        match self {
            StructuralAddition => "structural_addition",
            ProtocolInsertion => "protocol_insertion",
            ConstraintAmplification => "constraint_amplification",
            InstructionExpansion => "instruction_expansion",
            ValidationInjection => "validation_injection",
            TargetedReplacement => "targeted_replacement",
            EmphasisModification => "emphasis_modification",
            ConstraintStrengthening => "constraint_strengthening",
            InstructionClarification => "instruction_clarification",
            FormatImprovement => "format_improvement",
            PrecisionTuning => "precision_tuning",
            EmphasisAdjustment => "emphasis_adjustment",
            ConstraintRefinement => "constraint_refinement",
            ClarityImprovement => "clarity_improvement",
            FormattingPolish => "formatting_polish",
        }
    }

    /// 改写已有措辞（find-replace）而非追加新内容
    pub fn rewrites_existing(&self) -> bool {
        use EnhancementKind::*;
        matches!(
            self,
            TargetedReplacement
                | EmphasisModification
                | ConstraintStrengthening
                | PrecisionTuning
                | EmphasisAdjustment
                | ConstraintRefinement
        )
    }
}

/// 某一轮的调度结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScheduleStep {
    pub iteration: u32,
    pub progress: f64,
    pub temperature: f64,
    pub creativity: CreativityLevel,
    pub intensity: Intensity,
    pub palette: &'static [EnhancementKind],
}

/// 自适应调度器
#[derive(Debug, Clone)]
pub struct AdaptiveScheduler {
    schedule: Schedule,
    max_iterations: u32,
}

impl AdaptiveScheduler {
    pub fn new(schedule: Schedule, max_iterations: u32) -> Self {
        Self {
            schedule,
            max_iterations: max_iterations.max(1),
        }
    }

    pub fn schedule(&self) -> Schedule {
        self.schedule
    }

    /// progress = clamp((iteration-1) / max(maxIterations-1, 1), 0, 1)
    pub fn progress(&self, iteration: u32) -> f64 {
        let denom = self.max_iterations.saturating_sub(1).max(1) as f64;
        (iteration.saturating_sub(1) as f64 / denom).clamp(0.0, 1.0)
    }

    pub fn temperature(&self, iteration: u32) -> f64 {
        self.schedule.temperature(self.progress(iteration))
    }

    pub fn step(&self, iteration: u32) -> ScheduleStep {
        let progress = self.progress(iteration);
        let temperature = self.schedule.temperature(progress);
        let creativity = CreativityLevel::from_temperature(temperature);
        ScheduleStep {
            iteration,
            progress,
            temperature,
            creativity,
            intensity: creativity.intensity(),
            palette: creativity.palette(),
        }
    }

    /// 本轮尝试的增强类型：有随机源时按种子抽样，否则按调色板顺序取前 limit 个
    pub fn select_kinds(&self, step: &ScheduleStep, limit: usize, rng: Option<&mut StdRng>) -> Vec<EnhancementKind> {
        let limit = limit.min(step.palette.len());
        match rng {
            Some(rng) => step
                .palette
                .choose_multiple(rng, limit)
                .copied()
                .collect(),
            None => step.palette[..limit].to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::SeedableRng;

    #[test]
    fn test_adaptive_phase_boundaries() {
        let s = Schedule::Adaptive;
        assert!((s.temperature(0.0) - 0.9).abs() < 1e-9);
        assert!((s.temperature(0.3) - 0.7).abs() < 1e-9);
        assert!((s.temperature(0.7) - 0.4).abs() < 1e-9);
        assert!((s.temperature(1.0) - 0.15).abs() < 1e-9);
    }

    #[test]
    fn test_progress_single_iteration_run() {
        let scheduler = AdaptiveScheduler::new(Schedule::Adaptive, 1);
        assert_eq!(scheduler.progress(1), 0.0);
        assert_eq!(scheduler.progress(5), 1.0);
    }

    #[test]
    fn test_creativity_buckets_and_palettes() {
        let scheduler = AdaptiveScheduler::new(Schedule::Adaptive, 5);
        let first = scheduler.step(1);
        assert_eq!(first.creativity, CreativityLevel::High);
        assert_eq!(first.intensity, Intensity::Aggressive);
        assert_eq!(first.palette[0], EnhancementKind::StructuralAddition);

        let last = scheduler.step(5);
        assert_eq!(last.creativity, CreativityLevel::Low);
        assert_eq!(last.palette[0], EnhancementKind::PrecisionTuning);
    }

    #[test]
    fn test_named_schedules_interpolate() {
        assert!((Schedule::Aggressive.temperature(0.0) - 0.95).abs() < 1e-9);
        assert!((Schedule::Conservative.temperature(1.0) - 0.2).abs() < 1e-9);
        assert!((Schedule::Linear.temperature(0.5) - 0.5).abs() < 1e-9);
        assert!("linear".parse::<Schedule>().is_ok());
        assert!("chaotic".parse::<Schedule>().is_err());
    }

    #[test]
    fn test_select_kinds_seeded_is_reproducible() {
        let scheduler = AdaptiveScheduler::new(Schedule::Adaptive, 5);
        let step = scheduler.step(3);
        let a = scheduler.select_kinds(&step, 3, Some(&mut StdRng::seed_from_u64(7)));
        let b = scheduler.select_kinds(&step, 3, Some(&mut StdRng::seed_from_u64(7)));
        assert_eq!(a, b);
        assert_eq!(a.len(), 3);
        assert!(a.iter().all(|k| step.palette.contains(k)));

        let ordered = scheduler.select_kinds(&step, 3, None);
        assert_eq!(ordered, step.palette[..3].to_vec());
    }

    proptest! {
        #[test]
        fn prop_temperature_never_increases(max in 1u32..40, i in 1u32..40, j in 1u32..40) {
            let scheduler = AdaptiveScheduler::new(Schedule::Adaptive, max);
            let (lo, hi) = if i <= j { (i, j) } else { (j, i) };
            prop_assert!(scheduler.temperature(lo) >= scheduler.temperature(hi) - 1e-12);
        }

        #[test]
        fn prop_temperature_stays_in_range(max in 1u32..40, i in 0u32..60) {
            let t = AdaptiveScheduler::new(Schedule::Adaptive, max).temperature(i);
            prop_assert!((0.15 - 1e-9..=0.9 + 1e-9).contains(&t));
        }
    }
}
