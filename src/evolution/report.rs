//! 运行报告与洞察
//!
//! 运行结束时（无论 COMPLETE 还是 FAILED）都生成结构化报告：终止原因、逐轮分数、
//! 各维度的线性趋势、最佳迭代、改进归因汇总与登记册统计。

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::{TerminalState, ValidationWarning};
use crate::evolution::analyzer::linear_trend;
use crate::evolution::attribution::TrackingReport;
use crate::evolution::registry::RegistryStats;
use crate::evolution::types::{EvaluationSnapshot, IterationRecord};

/// 斜率绝对值低于此值视为持平
const FLAT_SLOPE: f64 = 0.02;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    Improving,
    Declining,
    Flat,
}

/// 单个维度的洞察
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimensionInsight {
    pub dimension: String,
    pub first: f64,
    pub last: f64,
    pub change: f64,
    /// 至少 3 个点时才有
    pub slope: Option<f64>,
    pub r_squared: Option<f64>,
    pub direction: Option<TrendDirection>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Insights {
    pub best_iteration: Option<u32>,
    pub best_score: Option<f64>,
    /// 首轮到末轮的总分变化
    pub total_improvement: f64,
    /// 总分提升达到 improvement_threshold 的迭代
    pub improved_iterations: Vec<u32>,
    pub dimensions: Vec<DimensionInsight>,
}

/// 从快照序列推导洞察
pub fn derive_insights(snapshots: &[EvaluationSnapshot], improvement_threshold: f64) -> Insights {
    if snapshots.is_empty() {
        return Insights::default();
    }
    let aggregates: Vec<(u32, f64)> = snapshots.iter().map(|s| (s.iteration, s.aggregate())).collect();
    let best = aggregates
        .iter()
        .copied()
        .max_by(|a, b| a.1.total_cmp(&b.1).then(b.0.cmp(&a.0)));
    let improved_iterations = aggregates
        .windows(2)
        .filter(|w| w[1].1 - w[0].1 >= improvement_threshold)
        .map(|w| w[1].0)
        .collect();

    let mut series: BTreeMap<&str, Vec<(f64, f64)>> = BTreeMap::new();
    for s in snapshots {
        for (dim, v) in &s.scores {
            series.entry(dim.as_str()).or_default().push((s.iteration as f64, *v));
        }
    }
    let dimensions = series
        .into_iter()
        .map(|(dim, points)| {
            let first = points[0].1;
            let last = points[points.len() - 1].1;
            let trend = linear_trend(&points);
            DimensionInsight {
                dimension: dim.to_string(),
                first,
                last,
                change: last - first,
                slope: trend.map(|t| t.slope),
                r_squared: trend.map(|t| t.r_squared),
                direction: trend.map(|t| {
                    if t.slope > FLAT_SLOPE {
                        TrendDirection::Improving
                    } else if t.slope < -FLAT_SLOPE {
                        TrendDirection::Declining
                    } else {
                        TrendDirection::Flat
                    }
                }),
            }
        })
        .collect();

    Insights {
        best_iteration: best.map(|b| b.0),
        best_score: best.map(|b| b.1),
        total_improvement: aggregates[aggregates.len() - 1].1 - aggregates[0].1,
        improved_iterations,
        dimensions,
    }
}

/// 逐轮摘要
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationSummary {
    pub iteration: u32,
    pub artifact_version: u32,
    pub aggregate: Option<f64>,
    pub gaps: usize,
    pub improvements: usize,
    pub generation_failures: usize,
}

impl From<&IterationRecord> for IterationSummary {
    fn from(r: &IterationRecord) -> Self {
        Self {
            iteration: r.iteration,
            artifact_version: r.artifact_version,
            aggregate: r.aggregate(),
            gaps: r.gaps.len(),
            improvements: r.improvements.len(),
            generation_failures: r.generation_failures.len(),
        }
    }
}

/// 运行结束报告
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub terminal: TerminalState,
    pub iterations_completed: u32,
    pub final_artifact_version: u32,
    pub iterations: Vec<IterationSummary>,
    pub insights: Insights,
    pub tracking: TrackingReport,
    pub registry: RegistryStats,
    pub health_warnings: Vec<String>,
    pub validation_warnings: Vec<ValidationWarning>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// evolution_results.json 的内容
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResults {
    pub report: RunReport,
    pub records: Vec<IterationRecord>,
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Evolution run {}", self.run_id)?;
        writeln!(f, "  Result: {}", self.terminal)?;
        writeln!(
            f,
            "  Iterations: {} (final artifact v{})",
            self.iterations_completed, self.final_artifact_version
        )?;
        for it in &self.iterations {
            match it.aggregate {
                Some(a) => writeln!(
                    f,
                    "    #{:<3} v{:<3} score {:.3}  gaps {}  improvements {}",
                    it.iteration, it.artifact_version, a, it.gaps, it.improvements
                )?,
                None => writeln!(f, "    #{:<3} v{:<3} (not scored)", it.iteration, it.artifact_version)?,
            }
        }
        if let (Some(i), Some(s)) = (self.insights.best_iteration, self.insights.best_score) {
            writeln!(f, "  Best: iteration {} ({:.3})", i, s)?;
        }
        writeln!(f, "  Total improvement: {:+.3}", self.insights.total_improvement)?;
        for d in &self.insights.dimensions {
            match (d.slope, d.r_squared) {
                (Some(slope), Some(r2)) => writeln!(
                    f,
                    "    {:<28} {:.2} → {:.2}  slope {:+.3} (R² {:.2})",
                    d.dimension, d.first, d.last, slope, r2
                )?,
                _ => writeln!(f, "    {:<28} {:.2} → {:.2}", d.dimension, d.first, d.last)?,
            }
        }
        let s = &self.tracking.summary;
        writeln!(
            f,
            "  Improvements: {} total, {} successful, {} failed, {} pending ({:.1}% success)",
            s.total_improvements, s.successful, s.failed, s.pending, s.success_rate
        )?;
        for top in &self.tracking.top_improvements {
            writeln!(f, "    {} {:+.3}", top.id, top.mean_delta)?;
        }
        writeln!(
            f,
            "  Registry: {} tested, {} successful, {} failed",
            self.registry.total_tested, self.registry.successful, self.registry.failed
        )?;
        if !self.health_warnings.is_empty() {
            writeln!(f, "  Health warnings:")?;
            for w in &self.health_warnings {
                writeln!(f, "    - {}", w)?;
            }
        }
        if !self.validation_warnings.is_empty() {
            writeln!(f, "  Validation warnings: {}", self.validation_warnings.len())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(iteration: u32, accuracy: f64, visual: f64) -> EvaluationSnapshot {
        EvaluationSnapshot {
            iteration,
            scores: BTreeMap::from([
                ("content_accuracy".to_string(), accuracy),
                ("visual_design".to_string(), visual),
            ]),
            scored_cases: 1,
            failed_cases: vec![],
        }
    }

    #[test]
    fn test_insights_trends_and_best() {
        let snapshots = vec![snap(1, 3.0, 4.0), snap(2, 3.5, 4.0), snap(3, 4.0, 4.02)];
        let insights = derive_insights(&snapshots, 0.1);
        assert_eq!(insights.best_iteration, Some(3));
        assert!((insights.total_improvement - 0.51).abs() < 1e-9);
        assert_eq!(insights.improved_iterations, vec![2, 3]);

        let accuracy = &insights.dimensions[0];
        assert_eq!(accuracy.dimension, "content_accuracy");
        assert!((accuracy.slope.unwrap() - 0.5).abs() < 1e-9);
        assert!((accuracy.r_squared.unwrap() - 1.0).abs() < 1e-9);
        assert_eq!(accuracy.direction, Some(TrendDirection::Improving));
        assert_eq!(insights.dimensions[1].direction, Some(TrendDirection::Flat));
    }

    #[test]
    fn test_short_history_has_no_trend() {
        let insights = derive_insights(&[snap(1, 3.0, 3.0), snap(2, 3.2, 3.0)], 0.1);
        assert!(insights.dimensions.iter().all(|d| d.slope.is_none()));
        assert_eq!(insights.best_iteration, Some(2));
        assert!(derive_insights(&[], 0.1).best_iteration.is_none());
    }

    #[test]
    fn test_best_prefers_earliest_on_tie() {
        let insights = derive_insights(&[snap(1, 4.0, 4.0), snap(2, 4.0, 4.0)], 0.1);
        assert_eq!(insights.best_iteration, Some(1));
    }
}
