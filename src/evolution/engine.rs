//! DECIDE 阶段：停止判定与健康检查
//!
//! 停止判定按固定优先级：完美 → 持续退化 → 达到迭代上限 → 收益递减（可选）。
//! 健康检查在判定之后进行，累计告警达到上限时以 FAILED(health) 终止。

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::config::{EvolutionSection, HealthSection};
use crate::core::CompletionReason;

/// 退化判定所需的连续下降轮数
pub const DEGRADATION_STREAK: usize = 3;
/// 收益递减判定所需的连续小幅变化数
pub const DIMINISHING_STREAK: usize = 3;

/// 停止判定
#[derive(Debug, Clone, PartialEq)]
pub struct StopPolicy {
    pub max_iterations: u32,
    pub max_score: f64,
    /// 完美阈值 = perfection_ratio × max_score，需连续两轮达到
    pub perfection_ratio: f64,
    pub diminishing_returns: bool,
    pub diminishing_threshold: f64,
    /// 单轮总分提升达到此值才算「有效提升」
    pub improvement_threshold: f64,
}

impl Default for StopPolicy {
    fn default() -> Self {
        Self::from(&EvolutionSection::default())
    }
}

impl From<&EvolutionSection> for StopPolicy {
    fn from(section: &EvolutionSection) -> Self {
        Self {
            max_iterations: section.max_iterations.max(1),
            max_score: section.max_score,
            perfection_ratio: section.perfection_ratio,
            diminishing_returns: section.diminishing_returns,
            diminishing_threshold: section.diminishing_threshold,
            improvement_threshold: section.improvement_threshold,
        }
    }
}

impl StopPolicy {
    /// aggregates：截至本轮（含）各轮的总分，按迭代升序
    pub fn decide(&self, iteration: u32, aggregates: &[f64]) -> Option<CompletionReason> {
        if self.is_perfect(aggregates) {
            return Some(CompletionReason::Perfection);
        }
        if self.is_degrading(aggregates) {
            return Some(CompletionReason::Degrading);
        }
        if iteration >= self.max_iterations {
            return Some(CompletionReason::MaxIterations);
        }
        if self.diminishing_returns && self.diminishing_streak(aggregates) >= DIMINISHING_STREAK {
            return Some(CompletionReason::DiminishingReturns);
        }
        None
    }

    pub fn perfection_threshold(&self) -> f64 {
        self.perfection_ratio * self.max_score
    }

    pub fn is_perfect(&self, aggregates: &[f64]) -> bool {
        let threshold = self.perfection_threshold() - 1e-9;
        aggregates.len() >= 2 && aggregates[aggregates.len() - 2..].iter().all(|a| *a >= threshold)
    }

    /// 最近 3 轮每一轮都低于它的前一轮
    pub fn is_degrading(&self, aggregates: &[f64]) -> bool {
        if aggregates.len() < DEGRADATION_STREAK + 1 {
            return false;
        }
        aggregates[aggregates.len() - DEGRADATION_STREAK - 1..]
            .windows(2)
            .all(|w| w[1] < w[0])
    }

    /// 末尾连续多少个相邻差值的绝对值低于阈值
    pub fn diminishing_streak(&self, aggregates: &[f64]) -> usize {
        aggregates
            .windows(2)
            .rev()
            .take_while(|w| (w[1] - w[0]).abs() < self.diminishing_threshold)
            .count()
    }

    /// 最近一轮相对上一轮的提升是否达到 improvement_threshold
    pub fn improved(&self, aggregates: &[f64]) -> bool {
        match aggregates {
            [.., before, after] => after - before >= self.improvement_threshold,
            _ => false,
        }
    }
}

/// 健康检查阈值
#[derive(Debug, Clone, PartialEq)]
pub struct HealthSettings {
    pub max_failure_ratio: f64,
    pub stagnation_iterations: usize,
    pub max_warnings: usize,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self::from(&HealthSection::default())
    }
}

impl From<&HealthSection> for HealthSettings {
    fn from(section: &HealthSection) -> Self {
        Self {
            max_failure_ratio: section.max_failure_ratio,
            stagnation_iterations: section.stagnation_iterations.max(2),
            max_warnings: section.max_warnings.max(1),
        }
    }
}

/// 一轮迭代的 Oracle 调用统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallStats {
    pub generation_calls: usize,
    pub generation_failures: usize,
    pub scoring_calls: usize,
    pub scoring_failures: usize,
}

/// 健康检查的累计状态（写入检查点）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthState {
    pub total_calls: usize,
    pub failed_calls: usize,
    /// 每轮出现的差距维度与当轮总分
    pub gap_history: Vec<(BTreeSet<String>, f64)>,
    pub warnings: Vec<String>,
}

/// 健康监视器
#[derive(Debug, Clone)]
pub struct HealthMonitor {
    settings: HealthSettings,
    state: HealthState,
}

impl HealthMonitor {
    pub fn new(settings: HealthSettings) -> Self {
        Self {
            settings,
            state: HealthState::default(),
        }
    }

    pub fn restore(settings: HealthSettings, state: HealthState) -> Self {
        Self { settings, state }
    }

    pub fn state(&self) -> &HealthState {
        &self.state
    }

    pub fn warnings(&self) -> &[String] {
        &self.state.warnings
    }

    /// 累计 Oracle 调用失败率
    pub fn failure_ratio(&self) -> f64 {
        if self.state.total_calls == 0 {
            return 0.0;
        }
        self.state.failed_calls as f64 / self.state.total_calls as f64
    }

    /// 记录一轮的情况，返回本轮新增的告警
    pub fn observe(
        &mut self,
        iteration: u32,
        stats: CallStats,
        gap_dimensions: BTreeSet<String>,
        aggregate: f64,
    ) -> Vec<String> {
        let mut new_warnings = Vec::new();

        self.state.total_calls += stats.generation_calls + stats.scoring_calls;
        self.state.failed_calls += stats.generation_failures + stats.scoring_failures;
        let ratio = self.failure_ratio();
        if ratio > self.settings.max_failure_ratio {
            new_warnings.push(format!(
                "iteration {}: {:.0}% of oracle calls failed so far (limit {:.0}%)",
                iteration,
                ratio * 100.0,
                self.settings.max_failure_ratio * 100.0
            ));
        }

        self.state.gap_history.push((gap_dimensions, aggregate));
        let window = self.settings.stagnation_iterations;
        let history = &self.state.gap_history;
        if !history[history.len() - 1].0.is_empty() && history.len() >= window {
            let recent = &history[history.len() - window..];
            let same_gaps = recent.windows(2).all(|w| w[0].0 == w[1].0);
            let net = recent[window - 1].1 - recent[0].1;
            if same_gaps && net <= 0.0 {
                new_warnings.push(format!(
                    "iteration {}: gaps [{}] recurred for {} iterations with no net improvement",
                    iteration,
                    recent[0].0.iter().cloned().collect::<Vec<_>>().join(", "),
                    window
                ));
            }
        }

        for w in &new_warnings {
            tracing::warn!("Health warning: {}", w);
        }
        self.state.warnings.extend(new_warnings.iter().cloned());
        new_warnings
    }

    /// 累计告警是否达到上限
    pub fn is_degraded(&self) -> bool {
        self.state.warnings.len() >= self.settings.max_warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> StopPolicy {
        StopPolicy {
            max_iterations: 10,
            max_score: 5.0,
            perfection_ratio: 0.98,
            diminishing_returns: true,
            diminishing_threshold: 0.05,
            improvement_threshold: 0.1,
        }
    }

    fn dims(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_perfection_needs_two_rounds() {
        let p = policy();
        assert_eq!(p.decide(2, &[4.9, 4.96]), Some(CompletionReason::Perfection));
        assert_eq!(p.decide(1, &[4.96]), None);
        assert_eq!(p.decide(3, &[4.96, 4.5, 4.96]), None);
    }

    #[test]
    fn test_degradation_needs_three_declines() {
        let p = policy();
        assert!(!p.is_degrading(&[3.0, 3.2, 3.1, 2.9]));
        assert_eq!(p.decide(4, &[3.0, 3.2, 3.1, 2.9]), None);
        assert_eq!(p.diminishing_streak(&[3.0, 3.2, 3.1, 2.9]), 0);
        assert_eq!(p.decide(4, &[3.5, 3.3, 3.1, 2.9]), Some(CompletionReason::Degrading));
    }

    #[test]
    fn test_priority_order() {
        let mut p = policy();
        p.max_iterations = 4;
        // 退化优先于迭代上限
        assert_eq!(p.decide(4, &[3.5, 3.3, 3.1, 2.9]), Some(CompletionReason::Degrading));
        assert_eq!(p.decide(4, &[3.0, 3.5, 3.6, 3.9]), Some(CompletionReason::MaxIterations));
    }

    #[test]
    fn test_diminishing_returns_only_when_enabled() {
        let mut p = policy();
        let flat = [3.0, 3.5, 3.52, 3.53, 3.55];
        assert_eq!(p.decide(5, &flat), Some(CompletionReason::DiminishingReturns));
        p.diminishing_returns = false;
        assert_eq!(p.decide(5, &flat), None);
    }

    #[test]
    fn test_improved_uses_threshold() {
        let p = policy();
        assert!(p.improved(&[3.0, 3.1]));
        assert!(!p.improved(&[3.0, 3.05]));
        assert!(!p.improved(&[3.0]));
    }

    #[test]
    fn test_failure_ratio_warning() {
        let mut monitor = HealthMonitor::new(HealthSettings::default());
        let stats = CallStats {
            generation_calls: 4,
            generation_failures: 3,
            scoring_calls: 1,
            scoring_failures: 0,
        };
        let warnings = monitor.observe(1, stats, dims(&["a"]), 3.0);
        assert_eq!(warnings.len(), 1);
        assert!(!monitor.is_degraded());
    }

    #[test]
    fn test_stagnation_accumulates_to_degraded() {
        let mut monitor = HealthMonitor::new(HealthSettings::default());
        let ok = CallStats {
            generation_calls: 2,
            scoring_calls: 2,
            ..CallStats::default()
        };
        for i in 1..=2 {
            assert!(monitor.observe(i, ok, dims(&["a", "b"]), 3.0).is_empty());
        }
        for i in 3..=5 {
            assert_eq!(monitor.observe(i, ok, dims(&["a", "b"]), 3.0).len(), 1);
        }
        assert!(monitor.is_degraded());
    }

    #[test]
    fn test_changing_gaps_do_not_stagnate() {
        let mut monitor = HealthMonitor::new(HealthSettings::default());
        let ok = CallStats::default();
        monitor.observe(1, ok, dims(&["a"]), 3.0);
        monitor.observe(2, ok, dims(&["b"]), 3.0);
        assert!(monitor.observe(3, ok, dims(&["a"]), 3.0).is_empty());
    }
}
