//! 归因追踪：登记每个改进，记录每轮评分快照，把下一轮的分数变化归因回具体改进
//!
//! 每个改进的结果只写入一次；重复归因返回已存结果而不改变它。
//! 写操作由控制器通过单写锁串行化，读者可以并发。

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::EvolutionError;
use crate::evolution::types::{
    EvaluationSnapshot, Improvement, ImprovementOutcome, ImprovementPayload, ImprovementType, ScoreDelta,
};

pub const TRACKING_FILE: &str = "improvement_tracking.json";

/// 目标维度都不在快照中时使用的伪维度
pub const AGGREGATE_DIMENSION: &str = "aggregate";

/// 登记参数
#[derive(Debug, Clone)]
pub struct Registration {
    pub iteration: u32,
    pub improvement_type: ImprovementType,
    pub name: String,
    pub target_gap: String,
    /// 为空时按类型取默认维度
    pub target_dimensions: Vec<String>,
    pub expected_effect: String,
    pub payload: ImprovementPayload,
    pub parents: Vec<String>,
}

/// 类型相关的默认归因维度
pub fn default_dimensions(improvement_type: ImprovementType, name: &str) -> Vec<String> {
    let name = name.to_lowercase();
    let dims: &[&str] = match improvement_type {
        ImprovementType::TextMutation => &["content_accuracy", "information_completeness", "slide_coherence"],
        ImprovementType::CapabilityCreation | ImprovementType::CapabilityModification => {
            if name.contains("citation") {
                &["content_accuracy", "source_credibility"]
            } else if name.contains("layout") || name.contains("visual") {
                &["visual_design", "slide_consistency"]
            } else {
                &["overall_quality"]
            }
        }
        ImprovementType::ParameterTuning => &["overall_quality"],
    };
    dims.iter().map(|d| d.to_string()).collect()
}

/// attribute 的结果
#[derive(Debug, Clone, PartialEq)]
pub struct Attribution {
    pub outcome: ImprovementOutcome,
    /// 本次调用写入了结果；false 表示早已归因过
    pub newly_set: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub improvement_type: ImprovementType,
    pub success: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphEdge {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DependencyGraph {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackingSummary {
    pub total_improvements: usize,
    pub successful: usize,
    pub failed: usize,
    pub pending: usize,
    /// 百分比
    pub success_rate: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImpactSummary {
    pub total_score_delta: f64,
    pub average_delta_per_improvement: f64,
    pub dimension_impacts: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopImprovement {
    pub id: String,
    pub name: String,
    pub mean_delta: f64,
}

/// 改进报告
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackingReport {
    pub iteration: Option<u32>,
    pub summary: TrackingSummary,
    pub impact: ImpactSummary,
    pub dependency_graph: DependencyGraph,
    pub top_improvements: Vec<TopImprovement>,
}

#[derive(Debug, Serialize, Deserialize)]
struct TrackingFile {
    improvements: Vec<Improvement>,
    iteration_scores: BTreeMap<u32, EvaluationSnapshot>,
    timeline: Vec<String>,
    generated_at: DateTime<Utc>,
}

/// 归因追踪器
#[derive(Debug, Clone, Default)]
pub struct AttributionTracker {
    improvements: HashMap<String, Improvement>,
    timeline: Vec<String>,
    snapshots: BTreeMap<u32, EvaluationSnapshot>,
}

impl AttributionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记改进，返回 `{iteration:03}_{type}_{name}` 形式的 id（重名时追加序号）
    pub fn register(&mut self, reg: Registration) -> String {
        let slug: String = reg
            .name
            .trim()
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
            .collect();
        let base = format!("{:03}_{}_{}", reg.iteration, reg.improvement_type.as_str(), slug);
        let mut id = base.clone();
        let mut n = 2;
        while self.improvements.contains_key(&id) {
            id = format!("{base}_{n}");
            n += 1;
        }

        let target_dimensions = if reg.target_dimensions.is_empty() {
            default_dimensions(reg.improvement_type, &reg.name)
        } else {
            reg.target_dimensions
        };

        for parent in &reg.parents {
            match self.improvements.get_mut(parent) {
                Some(p) => p.children.push(id.clone()),
                None => tracing::warn!("Unknown parent improvement {} for {}", parent, id),
            }
        }

        tracing::info!("Registered improvement: {} (ID: {})", reg.name, id);
        self.improvements.insert(
            id.clone(),
            Improvement {
                id: id.clone(),
                iteration: reg.iteration,
                improvement_type: reg.improvement_type,
                name: reg.name,
                target_gap: reg.target_gap,
                target_dimensions,
                expected_effect: reg.expected_effect,
                payload: reg.payload,
                parents: reg.parents,
                children: Vec::new(),
                outcome: None,
                registered_at: Utc::now(),
            },
        );
        self.timeline.push(id.clone());
        id
    }

    /// 实现完成后补充载荷；已有结果的改进不可再改
    pub fn update_payload(&mut self, id: &str, payload: ImprovementPayload) -> Result<(), EvolutionError> {
        let imp = self
            .improvements
            .get_mut(id)
            .ok_or_else(|| EvolutionError::NotFound(format!("improvement {id}")))?;
        if imp.outcome.is_some() {
            return Err(EvolutionError::Mutation(format!("improvement {id} is already attributed")));
        }
        imp.payload = payload;
        Ok(())
    }

    pub fn record_snapshot(&mut self, snapshot: EvaluationSnapshot) {
        tracing::info!(
            "Recorded scores for iteration {} (aggregate {:.3})",
            snapshot.iteration,
            snapshot.aggregate()
        );
        self.snapshots.insert(snapshot.iteration, snapshot);
    }

    pub fn snapshot(&self, iteration: u32) -> Option<&EvaluationSnapshot> {
        self.snapshots.get(&iteration)
    }

    pub fn snapshots(&self) -> impl Iterator<Item = &EvaluationSnapshot> {
        self.snapshots.values()
    }

    pub fn get(&self, id: &str) -> Option<&Improvement> {
        self.improvements.get(id)
    }

    /// 按登记顺序
    pub fn improvements(&self) -> impl Iterator<Item = &Improvement> {
        self.timeline.iter().filter_map(|id| self.improvements.get(id))
    }

    /// 尚未归因的改进 id
    pub fn pending(&self) -> Vec<String> {
        self.improvements()
            .filter(|i| i.outcome.is_none())
            .map(|i| i.id.clone())
            .collect()
    }

    /// 用 snapshot(iteration-1) 与 snapshot(iteration) 计算改进的分数变化。
    ///
    /// 任一快照缺失时返回 Ok(None) 且不写入结果。
    pub fn attribute(&mut self, id: &str, iteration: u32) -> Result<Option<Attribution>, EvolutionError> {
        let imp = self
            .improvements
            .get(id)
            .ok_or_else(|| EvolutionError::NotFound(format!("improvement {id}")))?;

        if let Some(outcome) = &imp.outcome {
            tracing::debug!("Improvement {} already attributed, keeping stored outcome", id);
            return Ok(Some(Attribution {
                outcome: outcome.clone(),
                newly_set: false,
            }));
        }

        let (Some(before), Some(after)) = (
            iteration.checked_sub(1).and_then(|i| self.snapshots.get(&i)),
            self.snapshots.get(&iteration),
        ) else {
            tracing::warn!(
                "Missing scores for attribution (iter {} -> {})",
                iteration.saturating_sub(1),
                iteration
            );
            return Ok(None);
        };

        let mut deltas: Vec<ScoreDelta> = imp
            .target_dimensions
            .iter()
            .filter_map(|dim| match (before.get(dim), after.get(dim)) {
                (Some(b), Some(a)) => Some(ScoreDelta::new(dim.clone(), b, a)),
                _ => None,
            })
            .collect();
        if deltas.is_empty() {
            deltas.push(ScoreDelta::new(AGGREGATE_DIMENSION, before.aggregate(), after.aggregate()));
        }

        let mean = deltas.iter().map(|d| d.delta).sum::<f64>() / deltas.len() as f64;
        let success = mean > 0.0;
        let outcome = ImprovementOutcome {
            before_iteration: before.iteration,
            after_iteration: after.iteration,
            deltas,
            success,
            failure_reason: (!success).then(|| format!("Negative impact: avg delta {:.2}", mean)),
            attributed_at: Utc::now(),
        };

        if let Some(imp) = self.improvements.get_mut(id) {
            imp.outcome = Some(outcome.clone());
        }
        tracing::info!(
            "Attributed {}: avg delta {:+.3} ({})",
            id,
            mean,
            if success { "success" } else { "no gain" }
        );
        Ok(Some(Attribution {
            outcome,
            newly_set: true,
        }))
    }

    /// 改进报告；iteration 为 None 时覆盖全部
    pub fn report(&self, iteration: Option<u32>) -> TrackingReport {
        let selected: Vec<&Improvement> = self
            .improvements()
            .filter(|i| iteration.map_or(true, |it| i.iteration == it))
            .collect();

        let successful = selected
            .iter()
            .filter(|i| i.outcome.as_ref().is_some_and(|o| o.success))
            .count();
        let failed = selected
            .iter()
            .filter(|i| i.outcome.as_ref().is_some_and(|o| !o.success))
            .count();
        let total = selected.len();

        let mut total_delta = 0.0;
        let mut per_dim: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        for imp in &selected {
            if let Some(outcome) = &imp.outcome {
                for d in &outcome.deltas {
                    total_delta += d.delta;
                    per_dim.entry(d.dimension.clone()).or_default().push(d.delta);
                }
            }
        }
        let dimension_impacts = per_dim
            .into_iter()
            .map(|(k, v)| {
                let avg = v.iter().sum::<f64>() / v.len() as f64;
                (k, avg)
            })
            .collect();

        let mut top: Vec<TopImprovement> = selected
            .iter()
            .filter_map(|i| {
                let o = i.outcome.as_ref().filter(|o| o.success)?;
                Some(TopImprovement {
                    id: i.id.clone(),
                    name: i.name.clone(),
                    mean_delta: o.mean_delta(),
                })
            })
            .collect();
        top.sort_by(|a, b| b.mean_delta.total_cmp(&a.mean_delta));
        top.truncate(5);

        TrackingReport {
            iteration,
            summary: TrackingSummary {
                total_improvements: total,
                successful,
                failed,
                pending: total - successful - failed,
                success_rate: if total > 0 {
                    successful as f64 / total as f64 * 100.0
                } else {
                    0.0
                },
            },
            impact: ImpactSummary {
                total_score_delta: total_delta,
                average_delta_per_improvement: if total > 0 { total_delta / total as f64 } else { 0.0 },
                dimension_impacts,
            },
            dependency_graph: build_graph(&selected),
            top_improvements: top,
        }
    }

    pub async fn save(&self, path: &Path) -> Result<(), EvolutionError> {
        let file = TrackingFile {
            improvements: self.improvements().cloned().collect(),
            iteration_scores: self.snapshots.clone(),
            timeline: self.timeline.clone(),
            generated_at: Utc::now(),
        };
        let json = serde_json::to_string_pretty(&file)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, json).await?;
        Ok(())
    }

    pub async fn load(path: &Path) -> Result<Self, EvolutionError> {
        let raw = tokio::fs::read_to_string(path).await?;
        let file: TrackingFile = serde_json::from_str(&raw)?;
        let improvements: HashMap<String, Improvement> =
            file.improvements.into_iter().map(|i| (i.id.clone(), i)).collect();
        let timeline = file
            .timeline
            .into_iter()
            .filter(|id| improvements.contains_key(id))
            .collect();
        tracing::info!("Loaded {} existing improvements", improvements.len());
        Ok(Self {
            improvements,
            timeline,
            snapshots: file.iteration_scores,
        })
    }
}

fn build_graph(selected: &[&Improvement]) -> DependencyGraph {
    let ids: std::collections::HashSet<&str> = selected.iter().map(|i| i.id.as_str()).collect();
    let mut graph = DependencyGraph::default();
    for imp in selected {
        graph.nodes.push(GraphNode {
            id: imp.id.clone(),
            name: imp.name.clone(),
            improvement_type: imp.improvement_type,
            success: imp.outcome.as_ref().map(|o| o.success),
        });
        for parent in &imp.parents {
            if ids.contains(parent.as_str()) {
                graph.edges.push(GraphEdge {
                    from: parent.clone(),
                    to: imp.id.clone(),
                });
            }
        }
    }
    graph
}
