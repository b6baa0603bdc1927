//! IMPLEMENT 阶段：把变更说明落地
//!
//! 提示路线的所有变更合并成一个基于当前版本的计划，先试算一次，只登记真正生效的变更，
//! 再调用 `MutationEngine::evolve` 产生 v+1。能力路线交给外部实现方，按报告决定是否部署。

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::core::{AttemptFailure, EvolutionError, RetryExecutor, ValidationWarning};
use crate::evolution::attribution::{AttributionTracker, Registration};
use crate::evolution::types::{ChangeSpec, ImprovementPayload, ImprovementType};
use crate::mutation::{ArtifactLineage, MutationEngine, MutationPlan, Strictness};
use crate::oracle::{ImplementationReport, Implementer, ToolSpec};

/// 部署所需的最低测试通过率
pub const DEPLOY_MIN_PASS_RATE: f64 = 0.8;
/// 部署允许的最大实测延迟（毫秒）
pub const DEPLOY_MAX_LATENCY_MS: f64 = 50.0;

/// 实现方报告是否满足部署条件；报告自身的 deployed = false 优先
pub fn should_deploy(report: &ImplementationReport) -> bool {
    report.success
        && report.deployed
        && report.test_pass_rate >= DEPLOY_MIN_PASS_RATE
        && report.measured_latency_ms < DEPLOY_MAX_LATENCY_MS
}

/// 被拒绝的变更及原因
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedChange {
    pub name: String,
    pub gap_id: String,
    pub reason: String,
}

/// IMPLEMENT 阶段的结果
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImplementationSummary {
    /// 本轮登记的改进 id
    pub improvement_ids: Vec<String>,
    /// 产生的新指令版本
    pub new_version: Option<u32>,
    pub applied_operations: usize,
    pub rejected: Vec<RejectedChange>,
    pub validation_warning: Option<ValidationWarning>,
    /// 本轮部署的能力名
    pub deployed: Vec<String>,
}

impl ImplementationSummary {
    pub fn is_empty(&self) -> bool {
        self.improvement_ids.is_empty()
    }
}

/// 实现阶段
pub struct ImplementationStage {
    engine: MutationEngine,
    implementer: Option<Arc<dyn Implementer>>,
    retry: RetryExecutor,
}

impl ImplementationStage {
    pub fn new(engine: MutationEngine, implementer: Option<Arc<dyn Implementer>>, retry: RetryExecutor) -> Self {
        Self {
            engine,
            implementer,
            retry,
        }
    }

    pub fn engine(&self) -> &MutationEngine {
        &self.engine
    }

    /// 落地本轮的全部变更。
    ///
    /// `deployed` 记录已部署能力名 → 创建它的改进 id，修改已有能力时作为父改进。
    pub async fn implement(
        &self,
        iteration: u32,
        changes: &[ChangeSpec],
        lineage: &mut ArtifactLineage,
        tracker: &RwLock<AttributionTracker>,
        deployed: &mut BTreeMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<ImplementationSummary, EvolutionError> {
        let mut summary = ImplementationSummary::default();
        self.apply_text(iteration, changes, lineage, tracker, &mut summary).await?;

        for change in changes {
            let ChangeSpec::Capability { gap_id, spec } = change else {
                continue;
            };
            if cancel.is_cancelled() {
                return Err(EvolutionError::Cancelled);
            }
            self.apply_capability(iteration, gap_id, spec, tracker, deployed, cancel, &mut summary)
                .await?;
        }

        tracing::info!(
            "Iteration {}: {} improvements registered, {} rejected, artifact now v{}",
            iteration,
            summary.improvement_ids.len(),
            summary.rejected.len(),
            lineage.current().version
        );
        Ok(summary)
    }

    async fn apply_text(
        &self,
        iteration: u32,
        changes: &[ChangeSpec],
        lineage: &mut ArtifactLineage,
        tracker: &RwLock<AttributionTracker>,
        summary: &mut ImplementationSummary,
    ) -> Result<(), EvolutionError> {
        let base_version = lineage.current().version;
        let parsed = self.engine.parse(&lineage.current().text);

        // 合并计划：记录每个操作属于哪个变更
        let mut combined = MutationPlan::new(base_version);
        let mut owners: Vec<usize> = Vec::new();
        for (ci, change) in changes.iter().enumerate() {
            if let ChangeSpec::TextMutation { plan, .. } = change {
                for op in &plan.operations {
                    combined.push(op.clone());
                    owners.push(ci);
                }
            }
        }
        if combined.is_empty() {
            return Ok(());
        }

        // 试算：只保留至少有一个操作生效的变更
        let trial = self.engine.reconstruct(&parsed, &combined.operations);
        let mut effective: BTreeMap<usize, MutationPlan> = BTreeMap::new();
        for &index in &trial.applied {
            effective
                .entry(owners[index])
                .or_insert_with(|| MutationPlan::new(base_version))
                .push(combined.operations[index].clone());
        }
        for rejected in &trial.rejected {
            let change = &changes[owners[rejected.index]];
            tracing::debug!("Mutation for {} rejected: {}", change.name(), rejected.reason);
            if !effective.contains_key(&owners[rejected.index]) {
                summary.rejected.push(RejectedChange {
                    name: change.name().to_string(),
                    gap_id: change.gap_id().to_string(),
                    reason: rejected.reason.clone(),
                });
            }
        }
        summary.rejected.dedup_by(|a, b| a.name == b.name && a.gap_id == b.gap_id);
        if effective.is_empty() || !trial.changed() {
            return Ok(());
        }

        let report = self.engine.validate(&trial.text, Some(lineage));
        if !report.is_clean() && self.engine.strictness() == Strictness::Strict {
            let warning = ValidationWarning {
                artifact_version: base_version + 1,
                missing: report.all_missing(),
                message: "discarded evolved artifact".to_string(),
            };
            tracing::warn!("Validation warning: {}", warning);
            for ci in effective.keys() {
                summary.rejected.push(RejectedChange {
                    name: changes[*ci].name().to_string(),
                    gap_id: changes[*ci].gap_id().to_string(),
                    reason: warning.to_string(),
                });
            }
            summary.validation_warning = Some(warning);
            return Ok(());
        }

        // 新版本建立在当前版本的改进之上
        let parents = lineage.current().change_ids.clone();
        let mut final_plan = MutationPlan::new(base_version);
        let mut ids = Vec::new();
        {
            let mut tracker = tracker.write().await;
            for (ci, plan) in &effective {
                let ChangeSpec::TextMutation {
                    gap_id,
                    dimension,
                    name,
                    enhancements,
                    rationale,
                    ..
                } = &changes[*ci]
                else {
                    continue;
                };
                let parents = parents
                    .iter()
                    .filter(|p| tracker.get(p).is_some())
                    .cloned()
                    .collect();
                let id = tracker.register(Registration {
                    iteration,
                    improvement_type: ImprovementType::TextMutation,
                    name: name.clone(),
                    target_gap: gap_id.clone(),
                    target_dimensions: vec![dimension.clone()],
                    expected_effect: format!("{} via {}", rationale, enhancements.join(", ")),
                    payload: ImprovementPayload::Mutations {
                        plan: plan.clone(),
                        resulting_version: None,
                    },
                    parents,
                });
                for op in &plan.operations {
                    final_plan.push(op.clone());
                }
                ids.push((id, plan.clone()));
            }
        }

        let outcome = self.engine.evolve(
            lineage,
            &final_plan,
            ids.iter().map(|(id, _)| id.clone()).collect(),
        )?;
        summary.applied_operations = outcome.reconstruction.applied.len();
        summary.new_version = outcome.new_version;
        summary.validation_warning = outcome.warning;

        let mut tracker = tracker.write().await;
        for (id, plan) in ids {
            tracker.update_payload(
                &id,
                ImprovementPayload::Mutations {
                    plan,
                    resulting_version: outcome.new_version,
                },
            )?;
            summary.improvement_ids.push(id);
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn apply_capability(
        &self,
        iteration: u32,
        gap_id: &str,
        spec: &ToolSpec,
        tracker: &RwLock<AttributionTracker>,
        deployed: &mut BTreeMap<String, String>,
        cancel: &CancellationToken,
        summary: &mut ImplementationSummary,
    ) -> Result<(), EvolutionError> {
        let Some(implementer) = &self.implementer else {
            summary.rejected.push(RejectedChange {
                name: spec.name.clone(),
                gap_id: gap_id.to_string(),
                reason: "no implementer configured".into(),
            });
            return Ok(());
        };

        let result = self
            .retry
            .execute("implementer", cancel, |_ctx| {
                let implementer = implementer.clone();
                let spec = spec.clone();
                async move { implementer.implement(&spec).await.map_err(AttemptFailure::from) }
            })
            .await;
        let report = match result {
            Ok(outcome) => outcome.value,
            Err(EvolutionError::Cancelled) => return Err(EvolutionError::Cancelled),
            Err(e) => {
                tracing::warn!("Capability {} could not be implemented: {}", spec.name, e);
                summary.rejected.push(RejectedChange {
                    name: spec.name.clone(),
                    gap_id: gap_id.to_string(),
                    reason: e.to_string(),
                });
                return Ok(());
            }
        };

        if !should_deploy(&report) {
            let reason = report.error.clone().unwrap_or_else(|| {
                format!(
                    "not deployed (pass rate {:.0}%, latency {:.1}ms)",
                    report.test_pass_rate * 100.0,
                    report.measured_latency_ms
                )
            });
            tracing::info!("Capability {} rejected: {}", spec.name, reason);
            summary.rejected.push(RejectedChange {
                name: spec.name.clone(),
                gap_id: gap_id.to_string(),
                reason,
            });
            return Ok(());
        }

        let (improvement_type, parents) = match spec.modifies.as_ref().and_then(|m| deployed.get(m)) {
            Some(parent) => (ImprovementType::CapabilityModification, vec![parent.clone()]),
            None => (ImprovementType::CapabilityCreation, Vec::new()),
        };
        let id = tracker.write().await.register(Registration {
            iteration,
            improvement_type,
            name: spec.name.clone(),
            target_gap: gap_id.to_string(),
            target_dimensions: spec.target_dimensions.clone(),
            expected_effect: format!("+{:.2} expected", spec.expected_improvement),
            payload: ImprovementPayload::Capability {
                spec: spec.clone(),
                report: Some(report),
            },
            parents,
        });
        tracing::info!("Deployed capability {} ({})", spec.name, id);
        deployed.insert(spec.name.clone(), id.clone());
        summary.deployed.push(spec.name.clone());
        summary.improvement_ids.push(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::RetryPolicy;
    use crate::mutation::MutationOperation;
    use crate::oracle::SimulatedImplementer;
    use std::time::Duration;

    const TEXT: &str = "Write slides about {theme}. Keep it short.";

    fn stage(strictness: Strictness, implementer: Option<Arc<dyn Implementer>>) -> ImplementationStage {
        let engine = MutationEngine::new(strictness, vec!["{theme}".into()]).unwrap();
        let retry = RetryExecutor::new(RetryPolicy::default().with_max_retries(1).with_base_delay(Duration::ZERO));
        ImplementationStage::new(engine, implementer, retry)
    }

    fn text_change(name: &str, ops: Vec<MutationOperation>) -> ChangeSpec {
        let mut plan = MutationPlan::new(0);
        for op in ops {
            plan.push(op);
        }
        ChangeSpec::TextMutation {
            gap_id: format!("gap_{name}"),
            dimension: "content_accuracy".into(),
            name: name.into(),
            plan,
            enhancements: vec!["precision_tuning".into()],
            rationale: "weak".into(),
        }
    }

    fn capability(name: &str, modifies: Option<&str>) -> ChangeSpec {
        ChangeSpec::Capability {
            gap_id: format!("gap_{name}"),
            spec: ToolSpec {
                name: name.into(),
                description: "d".into(),
                target_gap: format!("gap_{name}"),
                target_dimensions: vec!["visual_design".into()],
                expected_improvement: 0.3,
                implementation_notes: String::new(),
                modifies: modifies.map(String::from),
            },
        }
    }

    #[test]
    fn test_deploy_thresholds() {
        let mut report = ImplementationReport {
            success: true,
            deployed: true,
            test_pass_rate: 0.8,
            measured_latency_ms: 49.9,
            error: None,
        };
        assert!(should_deploy(&report));
        report.measured_latency_ms = 50.0;
        assert!(!should_deploy(&report));
        report.measured_latency_ms = 10.0;
        report.deployed = false;
        assert!(!should_deploy(&report));
    }

    #[tokio::test]
    async fn test_only_effective_changes_are_registered() {
        let stage = stage(Strictness::Lenient, None);
        let mut lineage = ArtifactLineage::new(TEXT, vec!["{theme}".into()]);
        let tracker = RwLock::new(AttributionTracker::new());
        let changes = vec![
            text_change("shorten", vec![MutationOperation::find_replace("short", "concise", "tighter")]),
            text_change("touch_theme", vec![MutationOperation::find_replace("{theme}", "rust", "bad")]),
        ];
        let summary = stage
            .implement(1, &changes, &mut lineage, &tracker, &mut BTreeMap::new(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.improvement_ids.len(), 1);
        assert_eq!(summary.new_version, Some(1));
        assert_eq!(summary.rejected.len(), 1);
        assert_eq!(summary.rejected[0].name, "touch_theme");
        assert!(lineage.current().text.contains("concise"));
        assert!(lineage.current().text.contains("{theme}"));

        let tracker = tracker.read().await;
        let imp = tracker.get(&summary.improvement_ids[0]).unwrap();
        assert_eq!(imp.target_dimensions, vec!["content_accuracy".to_string()]);
        assert!(matches!(
            imp.payload,
            ImprovementPayload::Mutations { resulting_version: Some(1), .. }
        ));
        assert_eq!(lineage.current().change_ids, summary.improvement_ids);
    }

    #[tokio::test]
    async fn test_strict_mode_discards_without_registering() {
        let tracker = RwLock::new(AttributionTracker::new());
        let mut lineage = ArtifactLineage::new("Write slides.", vec![]);
        let strict = ImplementationStage::new(
            MutationEngine::new(Strictness::Strict, vec!["{theme}".into()]).unwrap(),
            None,
            RetryExecutor::default(),
        );
        let changes = vec![text_change(
            "rewrite",
            vec![MutationOperation::find_replace("slides", "decks", "wording")],
        )];
        let summary = strict
            .implement(1, &changes, &mut lineage, &tracker, &mut BTreeMap::new(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary.new_version, None);
        assert!(summary.validation_warning.is_some());
        assert!(summary.improvement_ids.is_empty());
        assert_eq!(lineage.current().version, 0);
    }

    #[tokio::test]
    async fn test_capability_deploy_and_modify() {
        let stage = stage(Strictness::Lenient, Some(Arc::new(SimulatedImplementer::new(0.9, 12.0))));
        let mut lineage = ArtifactLineage::new(TEXT, vec![]);
        let tracker = RwLock::new(AttributionTracker::new());
        let mut deployed = BTreeMap::new();
        let token = CancellationToken::new();

        let first = stage
            .implement(1, &[capability("layout_optimizer", None)], &mut lineage, &tracker, &mut deployed, &token)
            .await
            .unwrap();
        assert_eq!(first.deployed, vec!["layout_optimizer".to_string()]);
        let created = deployed["layout_optimizer"].clone();

        let second = stage
            .implement(
                2,
                &[capability("layout_optimizer", Some("layout_optimizer"))],
                &mut lineage,
                &tracker,
                &mut deployed,
                &token,
            )
            .await
            .unwrap();
        let tracker = tracker.read().await;
        let modified = tracker.get(&second.improvement_ids[0]).unwrap();
        assert_eq!(modified.improvement_type, ImprovementType::CapabilityModification);
        assert_eq!(modified.parents, vec![created.clone()]);
        assert_eq!(tracker.get(&created).unwrap().children, vec![modified.id.clone()]);
    }

    #[tokio::test]
    async fn test_slow_capability_is_rejected() {
        let stage = stage(Strictness::Lenient, Some(Arc::new(SimulatedImplementer::new(0.95, 120.0))));
        let mut lineage = ArtifactLineage::new(TEXT, vec![]);
        let tracker = RwLock::new(AttributionTracker::new());
        let summary = stage
            .implement(
                1,
                &[capability("quality_validator", None)],
                &mut lineage,
                &tracker,
                &mut BTreeMap::new(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(summary.improvement_ids.is_empty());
        assert_eq!(summary.rejected.len(), 1);
        assert!(summary.rejected[0].reason.contains("latency"));
    }
}
