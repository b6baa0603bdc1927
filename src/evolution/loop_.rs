//! 进化控制器：INIT → GENERATE → SCORE → ANALYZE → DESIGN → IMPLEMENT → ATTRIBUTE → DECIDE
//!
//! 迭代之间严格串行（第 n+1 轮依赖第 n 轮完整归因后的结果）；GENERATE / SCORE 在工作池中按用例并行。
//! 每个阶段结束写检查点，阶段之间检查取消信号。追踪器与登记册由单写锁保护，锁不会跨越 Oracle 调用。

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::config::{AppConfig, EvolutionSection};
use crate::core::{
    AttemptFailure, CompletionReason, EvolutionError, EvolutionPhase, FailureReason, RecoveryAction,
    RecoveryEngine, RetryExecutor, RetryPolicy, TerminalState, ValidationWarning, WorkerPool,
};
use crate::evolution::agents::{
    AnalyzeEvaluations, CompareIterations, DesignImprovements, IdentifyRootCauses, ImplementImprovements,
    ImplementationAgent, ImprovementAgent, PrioritizeImprovements, Process, ReflectionAgent,
    TestImplementation,
};
use crate::evolution::analyzer::GapAnalyzer;
use crate::evolution::attribution::{AttributionTracker, TRACKING_FILE};
use crate::evolution::engine::{CallStats, HealthMonitor, HealthSettings, StopPolicy};
use crate::evolution::executor::ImplementationStage;
use crate::evolution::persistence::{ArtifactMeta, CaseScore, Checkpoint, RunStore};
use crate::evolution::planner::{change_key, ImprovementDesigner};
use crate::evolution::registry::PatternRegistry;
use crate::evolution::report::{derive_insights, IterationSummary, RunReport, RunResults};
use crate::evolution::scheduler::{AdaptiveScheduler, Schedule};
use crate::evolution::types::{EvaluationSnapshot, ImprovementPayload, IterationRecord};
use crate::mutation::{ArtifactLineage, MutationEngine, Strictness};
use crate::oracle::{GeneratedArtifact, GenerationOracle, Implementer, ScoreCard, ScoringOracle, TestCase};

/// 控制器配置
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub output_dir: PathBuf,
    /// 从 checkpoint.json 继续；否则清掉旧的检查点与版本文本
    pub resume: bool,
    pub evolution: EvolutionSection,
    pub retry: RetryPolicy,
    pub health: HealthSettings,
    pub max_workers: usize,
}

impl From<&AppConfig> for ControllerConfig {
    fn from(cfg: &AppConfig) -> Self {
        Self {
            output_dir: cfg.app.output_dir.clone(),
            resume: false,
            evolution: cfg.evolution.clone(),
            retry: RetryPolicy::from(&cfg.retry),
            health: HealthSettings::from(&cfg.health),
            max_workers: cfg.concurrency.max_workers,
        }
    }
}

/// 外部协作方
pub struct Collaborators {
    pub generator: Arc<dyn GenerationOracle>,
    pub scorer: Arc<dyn ScoringOracle>,
    /// None 时能力路线的变更一律拒绝
    pub implementer: Option<Arc<dyn Implementer>>,
    pub analyzer: Arc<dyn GapAnalyzer>,
}

/// 阶段的结果
enum PhaseOutcome {
    Continue,
    Stop(TerminalState),
}

/// 从哪里开始
enum Start {
    At(u32, EvolutionPhase),
    /// 检查点显示运行早已终止
    Finished(TerminalState),
}

/// 进化控制器
pub struct EvolutionController {
    config: ControllerConfig,
    run_id: String,
    generator: Arc<dyn GenerationOracle>,
    scorer: Arc<dyn ScoringOracle>,
    test_cases: Vec<TestCase>,
    store: RunStore,
    pool: WorkerPool,
    retry: RetryExecutor,
    recovery: RecoveryEngine,
    stop: StopPolicy,
    health: HealthMonitor,
    tracker: Arc<RwLock<AttributionTracker>>,
    registry: Arc<RwLock<PatternRegistry>>,
    reflection: ReflectionAgent,
    improvement: ImprovementAgent,
    implementation: ImplementationAgent,
    cancel: CancellationToken,
    lineage: ArtifactLineage,
    records: Vec<IterationRecord>,
    /// 已部署能力名 → 改进 id
    deployed: BTreeMap<String, String>,
    call_stats: CallStats,
    started_at: DateTime<Utc>,
}

impl EvolutionController {
    pub async fn new(
        config: ControllerConfig,
        collaborators: Collaborators,
        test_cases: Vec<TestCase>,
        initial_artifact: impl Into<String>,
        cancel: CancellationToken,
    ) -> Result<Self, EvolutionError> {
        if test_cases.is_empty() {
            return Err(EvolutionError::Config("at least one test case is required".into()));
        }
        let evo = &config.evolution;
        let strictness: Strictness = evo.validation.parse()?;
        let schedule: Schedule = evo.schedule.parse()?;
        let engine = MutationEngine::new(strictness, evo.critical_placeholders.clone())?;
        let store = RunStore::open(config.output_dir.clone()).await?;
        let registry = PatternRegistry::open(config.output_dir.clone(), evo.use_registry).await?;
        let retry = RetryExecutor::new(config.retry.clone());

        let designer = ImprovementDesigner::new(
            engine.clone(),
            AdaptiveScheduler::new(schedule, evo.max_iterations),
            evo.max_enhancements,
            evo.prompt_only,
            evo.seed,
        );
        let stage = ImplementationStage::new(engine.clone(), collaborators.implementer, retry.clone());

        let initial = initial_artifact.into();
        let baseline = engine.parse(&initial).protected_texts();

        Ok(Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            generator: collaborators.generator,
            scorer: collaborators.scorer,
            test_cases,
            store,
            pool: WorkerPool::new(config.max_workers),
            retry,
            recovery: RecoveryEngine::new(),
            stop: StopPolicy::from(evo),
            health: HealthMonitor::new(config.health.clone()),
            tracker: Arc::new(RwLock::new(AttributionTracker::new())),
            registry: Arc::new(RwLock::new(registry)),
            reflection: ReflectionAgent::new(collaborators.analyzer, evo.analysis_retries, evo.gap_threshold),
            improvement: ImprovementAgent::new(designer),
            implementation: ImplementationAgent::new(stage),
            cancel,
            lineage: ArtifactLineage::new(initial, baseline),
            records: Vec::new(),
            deployed: BTreeMap::new(),
            call_stats: CallStats::default(),
            started_at: Utc::now(),
            config,
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn lineage(&self) -> &ArtifactLineage {
        &self.lineage
    }

    pub fn tracker(&self) -> Arc<RwLock<AttributionTracker>> {
        self.tracker.clone()
    }

    pub fn registry(&self) -> Arc<RwLock<PatternRegistry>> {
        self.registry.clone()
    }

    /// 运行直到终止；返回结束报告。只有结果无法落盘时才返回 Err。
    pub async fn run(mut self) -> Result<RunReport, EvolutionError> {
        let (mut iteration, mut phase) = match self.init().await? {
            Start::At(i, p) => (i, p),
            Start::Finished(terminal) => {
                tracing::info!("Run {} already finished: {}", self.run_id, terminal);
                return Ok(self.build_report(terminal).await);
            }
        };

        let terminal = loop {
            if self.cancel.is_cancelled() {
                tracing::warn!("Iteration {}: cancellation requested before {}", iteration, phase);
                break TerminalState::Failed(FailureReason::Cancelled);
            }
            tracing::info!("Iteration {}: {}", iteration, phase);

            let result = match phase {
                EvolutionPhase::Init => Ok(PhaseOutcome::Continue),
                EvolutionPhase::Generate => self.generate(iteration).await,
                EvolutionPhase::Score => self.score(iteration).await,
                EvolutionPhase::Analyze => self.analyze(iteration).await,
                EvolutionPhase::Design => self.design(iteration).await,
                EvolutionPhase::Implement => self.implement(iteration).await,
                EvolutionPhase::Attribute => self.attribute(iteration).await,
                EvolutionPhase::Decide => self.decide(iteration).await,
            };
            let outcome = match result {
                Ok(outcome) => outcome,
                Err(e) => match self.recover(iteration, phase, e) {
                    Some(terminal) => break terminal,
                    None => PhaseOutcome::Continue,
                },
            };
            if let PhaseOutcome::Stop(terminal) = outcome {
                break terminal;
            }

            self.checkpoint(iteration, phase, None).await?;
            match phase.next() {
                Some(next) => phase = next,
                None => {
                    iteration += 1;
                    phase = EvolutionPhase::Generate;
                }
            }
        };

        self.finish(iteration, phase, terminal).await
    }

    fn recover(&self, iteration: u32, phase: EvolutionPhase, error: EvolutionError) -> Option<TerminalState> {
        match self.recovery.handle(&error) {
            RecoveryAction::LogAndContinue => {
                tracing::warn!("Iteration {}: {} failed, continuing: {}", iteration, phase, error);
                None
            }
            _ => {
                tracing::error!("Iteration {}: {} aborted the run: {}", iteration, phase, error);
                Some(TerminalState::Failed(match error {
                    EvolutionError::Cancelled => FailureReason::Cancelled,
                    EvolutionError::HealthDegradation(detail) => FailureReason::Health(detail),
                    other => FailureReason::Fatal(other.to_string()),
                }))
            }
        }
    }

    // -----------------------------------------------------------------------
    // INIT / resume
    // -----------------------------------------------------------------------

    async fn init(&mut self) -> Result<Start, EvolutionError> {
        tracing::info!("Run {}: {}", self.run_id, EvolutionPhase::Init);
        if self.config.resume {
            if let Some(checkpoint) = self.store.load_checkpoint().await? {
                return self.restore(checkpoint).await;
            }
            tracing::info!("No checkpoint in {}, starting fresh", self.store.dir().display());
        } else {
            self.store.reset().await?;
        }

        tracing::info!(
            "Baseline v0: {} protected elements, {} test cases",
            self.lineage.baseline_protected().len(),
            self.test_cases.len()
        );
        self.checkpoint(0, EvolutionPhase::Init, None).await?;
        Ok(Start::At(1, EvolutionPhase::Generate))
    }

    async fn restore(&mut self, checkpoint: Checkpoint) -> Result<Start, EvolutionError> {
        self.lineage = self.store.restore_lineage(&checkpoint).await?;
        let tracking = self.store.dir().join(TRACKING_FILE);
        if tokio::fs::try_exists(&tracking).await? {
            *self.tracker.write().await = AttributionTracker::load(&tracking).await?;
        }
        self.run_id = checkpoint.run_id;
        self.records = checkpoint.records;
        self.deployed = checkpoint.deployed;
        self.health = HealthMonitor::restore(self.config.health.clone(), checkpoint.health);
        self.call_stats = checkpoint.call_stats;
        self.started_at = checkpoint.started_at;
        tracing::info!(
            "Resuming run {}: iteration {} after {} (artifact v{}, {} iterations recorded)",
            self.run_id,
            checkpoint.iteration,
            checkpoint.phase,
            self.lineage.current().version,
            self.records.len()
        );

        if let Some(terminal) = checkpoint.terminal {
            return Ok(Start::Finished(terminal));
        }
        Ok(match checkpoint.phase {
            EvolutionPhase::Init => Start::At(1, EvolutionPhase::Generate),
            phase => match phase.next() {
                Some(next) => Start::At(checkpoint.iteration, next),
                None => Start::At(checkpoint.iteration + 1, EvolutionPhase::Generate),
            },
        })
    }

    // -----------------------------------------------------------------------
    // GENERATE
    // -----------------------------------------------------------------------

    async fn generate(&mut self, iteration: u32) -> Result<PhaseOutcome, EvolutionError> {
        let artifact = self.lineage.current().clone();
        let step = self.improvement.designer().scheduler().step(iteration);
        self.records.retain(|r| r.iteration != iteration);
        self.records.push(IterationRecord {
            iteration,
            artifact_version: artifact.version,
            temperature: step.temperature,
            creativity: step.creativity.as_str().to_string(),
            ..Default::default()
        });
        self.call_stats = CallStats::default();

        let generator = self.generator.clone();
        let retry = self.retry.clone();
        let cancel = self.cancel.clone();
        let instruction = Arc::new(artifact.text.clone());
        let results = self
            .pool
            .fan_out(self.test_cases.clone(), &self.cancel, move |_, case: TestCase| {
                let generator = generator.clone();
                let retry = retry.clone();
                let cancel = cancel.clone();
                let instruction = instruction.clone();
                async move {
                    let label = format!("generation[{}]", case.id);
                    retry
                        .execute(&label, &cancel, |_| {
                            let generator = generator.clone();
                            let instruction = instruction.clone();
                            let case = case.clone();
                            async move {
                                generator
                                    .generate(&instruction, &case)
                                    .await
                                    .map_err(AttemptFailure::from)
                            }
                        })
                        .await
                        .map(|outcome| outcome.value)
                }
            })
            .await;
        if self.cancel.is_cancelled() {
            return Err(EvolutionError::Cancelled);
        }

        let total = results.len();
        let mut generated = Vec::new();
        let mut failures = Vec::new();
        for task in results {
            let case_id = self.test_cases[task.index].id.clone();
            match task.result {
                Ok(content) => generated.push(GeneratedArtifact {
                    case_id,
                    content,
                    instruction_version: artifact.version,
                }),
                Err(e) => {
                    tracing::warn!("Iteration {}: generation failed for case {}: {}", iteration, case_id, e);
                    failures.push(case_id);
                }
            }
        }
        self.call_stats.generation_calls = total;
        self.call_stats.generation_failures = failures.len();
        tracing::info!(
            "Iteration {}: generated {}/{} artifacts with v{}",
            iteration,
            generated.len(),
            total,
            artifact.version
        );

        if !generated.is_empty() {
            self.store.write_generated(iteration, &generated).await?;
        }
        let empty = generated.is_empty();
        let record = record_mut(&mut self.records, iteration)?;
        record.generated = generated;
        record.generation_failures = failures;
        if empty {
            return Ok(PhaseOutcome::Stop(TerminalState::Failed(FailureReason::Generation(format!(
                "all {} test cases failed to generate",
                total
            )))));
        }
        Ok(PhaseOutcome::Continue)
    }

    // -----------------------------------------------------------------------
    // SCORE
    // -----------------------------------------------------------------------

    async fn score(&mut self, iteration: u32) -> Result<PhaseOutcome, EvolutionError> {
        let references: HashMap<&str, Option<String>> = self
            .test_cases
            .iter()
            .map(|c| (c.id.as_str(), c.reference.clone()))
            .collect();
        let inputs: Vec<(GeneratedArtifact, Option<String>)> = record_ref(&self.records, iteration)?
            .generated
            .iter()
            .map(|g| {
                let reference = references.get(g.case_id.as_str()).cloned().flatten();
                (g.clone(), reference)
            })
            .collect();
        let case_ids: Vec<String> = inputs.iter().map(|(g, _)| g.case_id.clone()).collect();

        let scorer = self.scorer.clone();
        let retry = self.retry.clone();
        let cancel = self.cancel.clone();
        let results = self
            .pool
            .fan_out(
                inputs,
                &self.cancel,
                move |_, (artifact, reference): (GeneratedArtifact, Option<String>)| {
                    let scorer = scorer.clone();
                    let retry = retry.clone();
                    let cancel = cancel.clone();
                    async move {
                        let label = format!("scoring[{}]", artifact.case_id);
                        retry
                            .execute(&label, &cancel, |_| {
                                let scorer = scorer.clone();
                                let content = artifact.content.clone();
                                let reference = reference.clone();
                                async move {
                                    scorer
                                        .score(&content, reference.as_deref())
                                        .await
                                        .map_err(AttemptFailure::from)
                                }
                            })
                            .await
                            .map(|outcome| {
                                if outcome.partial {
                                    tracing::warn!("{}: using partial score card", label);
                                }
                                outcome.value
                            })
                    }
                },
            )
            .await;
        if self.cancel.is_cancelled() {
            return Err(EvolutionError::Cancelled);
        }

        let total = results.len();
        let mut sums: BTreeMap<String, (f64, usize)> = BTreeMap::new();
        let mut cases = Vec::with_capacity(total);
        let mut failed = Vec::new();
        for task in results {
            let case_id = case_ids[task.index].clone();
            match task.result {
                Ok(card) if card.is_usable() => {
                    accumulate(&mut sums, &card);
                    cases.push(CaseScore {
                        case_id,
                        card: Some(card),
                        error: None,
                    });
                }
                Ok(card) => {
                    tracing::warn!("Iteration {}: no usable scores for case {}", iteration, case_id);
                    failed.push(case_id.clone());
                    cases.push(CaseScore {
                        case_id,
                        card: Some(card),
                        error: Some("no usable dimension scores".into()),
                    });
                }
                Err(e) => {
                    tracing::warn!("Iteration {}: scoring failed for case {}: {}", iteration, case_id, e);
                    failed.push(case_id.clone());
                    cases.push(CaseScore {
                        case_id,
                        card: None,
                        error: Some(e.to_string()),
                    });
                }
            }
        }
        self.call_stats.scoring_calls = total;
        self.call_stats.scoring_failures = failed.len();

        let scored_cases = total - failed.len();
        if scored_cases == 0 {
            return Ok(PhaseOutcome::Stop(TerminalState::Failed(FailureReason::Scoring(format!(
                "zero valid scores from {} artifacts",
                total
            )))));
        }

        let snapshot = EvaluationSnapshot {
            iteration,
            scores: sums
                .into_iter()
                .map(|(dim, (sum, n))| (dim, sum / n as f64))
                .collect(),
            scored_cases,
            failed_cases: failed,
        };
        tracing::info!(
            "Iteration {}: aggregate {:.3} over {} dimensions ({} of {} artifacts scored)",
            iteration,
            snapshot.aggregate(),
            snapshot.scores.len(),
            scored_cases,
            total
        );
        self.tracker.write().await.record_snapshot(snapshot.clone());
        self.store.write_scores(iteration, &snapshot, &cases).await?;
        record_mut(&mut self.records, iteration)?.snapshot = Some(snapshot);
        Ok(PhaseOutcome::Continue)
    }

    // -----------------------------------------------------------------------
    // ANALYZE
    // -----------------------------------------------------------------------

    async fn analyze(&mut self, iteration: u32) -> Result<PhaseOutcome, EvolutionError> {
        let snapshot = record_ref(&self.records, iteration)?
            .snapshot
            .clone()
            .ok_or_else(|| EvolutionError::NotFound(format!("scores for iteration {}", iteration)))?;
        let history: Vec<EvaluationSnapshot> = self
            .records
            .iter()
            .filter(|r| r.iteration < iteration)
            .filter_map(|r| r.snapshot.clone())
            .collect();

        let gaps = self
            .reflection
            .process(AnalyzeEvaluations {
                iteration,
                snapshot: snapshot.clone(),
                history: history.clone(),
                cancel: &self.cancel,
            })
            .await?;
        if gaps.is_empty() {
            // 上一轮的改进仍然可以归因
            let attributed = self.attribute_previous(iteration).await?;
            record_mut(&mut self.records, iteration)?.attributed = attributed;
            return Ok(PhaseOutcome::Stop(TerminalState::Complete(CompletionReason::OptimumReached)));
        }

        let comparison = match history.last() {
            Some(previous) => Some(
                self.reflection
                    .process(CompareIterations {
                        previous,
                        current: &snapshot,
                    })
                    .await?,
            ),
            None => None,
        };
        if let Some(c) = &comparison {
            tracing::info!(
                "Iteration {} vs {}: {:+.3} (improved [{}], regressed [{}])",
                c.current_iteration,
                c.previous_iteration,
                c.aggregate_delta,
                c.improved.join(", "),
                c.regressed.join(", ")
            );
        }
        let root_causes = self
            .reflection
            .process(IdentifyRootCauses {
                gaps: &gaps,
                snapshot: &snapshot,
                history: &history,
            })
            .await?;

        let record = record_mut(&mut self.records, iteration)?;
        record.gaps = gaps;
        record.comparison = comparison;
        record.root_causes = root_causes;
        Ok(PhaseOutcome::Continue)
    }

    // -----------------------------------------------------------------------
    // DESIGN
    // -----------------------------------------------------------------------

    async fn design(&mut self, iteration: u32) -> Result<PhaseOutcome, EvolutionError> {
        let record = record_ref(&self.records, iteration)?;
        let gaps = record.gaps.clone();
        let root_causes = record.root_causes.clone();

        let ordered = self
            .improvement
            .process(PrioritizeImprovements {
                gaps,
                root_causes: &root_causes,
            })
            .await?;
        let deployed: Vec<String> = self.deployed.keys().cloned().collect();
        let outcome = {
            let registry = self.registry.read().await;
            self.improvement
                .process(DesignImprovements {
                    iteration,
                    gaps: &ordered,
                    artifact: self.lineage.current(),
                    registry: Some(&*registry),
                    deployed_capabilities: &deployed,
                })
                .await?
        };
        for warning in &outcome.registry_warnings {
            tracing::warn!("Iteration {}: registry warning: {}", iteration, warning);
        }
        for skipped in &outcome.skipped {
            tracing::info!("Iteration {}: skipped {}: {}", iteration, skipped.gap_id, skipped.reason);
        }

        let record = record_mut(&mut self.records, iteration)?;
        record.gaps = ordered;
        record.changes = outcome.changes;
        record.registry_warnings = outcome.registry_warnings;
        Ok(PhaseOutcome::Continue)
    }

    // -----------------------------------------------------------------------
    // IMPLEMENT
    // -----------------------------------------------------------------------

    async fn implement(&mut self, iteration: u32) -> Result<PhaseOutcome, EvolutionError> {
        let changes = record_ref(&self.records, iteration)?.changes.clone();
        if changes.is_empty() {
            tracing::info!("Iteration {}: nothing to implement", iteration);
            return Ok(PhaseOutcome::Continue);
        }

        let summary = self
            .implementation
            .process(ImplementImprovements {
                iteration,
                changes: &changes,
                lineage: &mut self.lineage,
                tracker: &self.tracker,
                deployed: &mut self.deployed,
                cancel: &self.cancel,
            })
            .await?;
        for rejected in &summary.rejected {
            tracing::warn!(
                "Iteration {}: change {} for {} rejected: {}",
                iteration,
                rejected.name,
                rejected.gap_id,
                rejected.reason
            );
        }

        let mut warnings: Vec<ValidationWarning> = summary.validation_warning.iter().cloned().collect();
        if let Some(version) = summary.new_version {
            let report = self
                .implementation
                .process(TestImplementation {
                    lineage: &self.lineage,
                    version,
                })
                .await?;
            if !report.is_clean() && warnings.is_empty() {
                warnings.push(ValidationWarning {
                    artifact_version: version,
                    missing: report.all_missing(),
                    message: "evolved artifact failed the post-implementation check".into(),
                });
            }
        }

        let record = record_mut(&mut self.records, iteration)?;
        record.improvements = summary.improvement_ids;
        record.validation_warnings = warnings;
        Ok(PhaseOutcome::Continue)
    }

    // -----------------------------------------------------------------------
    // ATTRIBUTE
    // -----------------------------------------------------------------------

    async fn attribute(&mut self, iteration: u32) -> Result<PhaseOutcome, EvolutionError> {
        let attributed = self.attribute_previous(iteration).await?;

        let baseline = self.records.first().and_then(|r| r.aggregate());
        let record = record_mut(&mut self.records, iteration)?;
        record.attributed = attributed;
        if let Some(score) = record.aggregate() {
            self.registry.write().await.update_best(
                iteration,
                record.artifact_version,
                score,
                baseline.unwrap_or(score),
            );
        }
        Ok(PhaseOutcome::Continue)
    }

    /// 把上一轮登记的改进归因到本轮分数，并把首次得到的结果写入登记册
    async fn attribute_previous(&self, iteration: u32) -> Result<Vec<String>, EvolutionError> {
        let Some(previous) = iteration.checked_sub(1).filter(|p| *p > 0) else {
            return Ok(Vec::new());
        };

        let mut attributed = Vec::new();
        let mut measured = Vec::new();
        {
            let mut tracker = self.tracker.write().await;
            let ids: Vec<String> = tracker
                .pending()
                .into_iter()
                .filter(|id| tracker.get(id).is_some_and(|i| i.iteration == previous))
                .collect();
            for id in ids {
                let Some(attribution) = tracker.attribute(&id, iteration)? else {
                    continue;
                };
                if attribution.newly_set {
                    if let Some(imp) = tracker.get(&id) {
                        measured.push((
                            imp.name.clone(),
                            registry_changes(&imp.payload),
                            attribution.outcome.mean_delta(),
                        ));
                    }
                }
                attributed.push(id);
            }
        }

        if !measured.is_empty() {
            let mut registry = self.registry.write().await;
            for (name, changes, delta) in measured {
                registry.record_outcome(&name, iteration, &changes, delta);
            }
        }
        tracing::info!(
            "Iteration {}: attributed {} improvements from iteration {}",
            iteration,
            attributed.len(),
            previous
        );
        Ok(attributed)
    }

    // -----------------------------------------------------------------------
    // DECIDE
    // -----------------------------------------------------------------------

    async fn decide(&mut self, iteration: u32) -> Result<PhaseOutcome, EvolutionError> {
        let aggregates: Vec<f64> = self
            .records
            .iter()
            .filter(|r| r.iteration <= iteration)
            .filter_map(|r| r.aggregate())
            .collect();
        let improved = self.stop.improved(&aggregates);
        let decision = self.stop.decide(iteration, &aggregates);

        let record = record_ref(&self.records, iteration)?;
        let gap_dimensions: BTreeSet<String> = record.gaps.iter().map(|g| g.dimension.clone()).collect();
        let aggregate = record.aggregate().unwrap_or(0.0);
        let new_warnings = self.health.observe(iteration, self.call_stats, gap_dimensions, aggregate);

        let record = record_mut(&mut self.records, iteration)?;
        record.improved = improved;
        record.health_warnings = new_warnings;
        record.closed = true;

        if let Some(reason) = decision {
            if reason == CompletionReason::Degrading {
                self.rollback_to_best();
            }
            tracing::info!("Iteration {}: stopping ({})", iteration, reason.as_str());
            return Ok(PhaseOutcome::Stop(TerminalState::Complete(reason)));
        }
        if self.health.is_degraded() {
            let detail = format!(
                "{} warnings: {}",
                self.health.warnings().len(),
                self.health.warnings().join("; ")
            );
            return Ok(PhaseOutcome::Stop(TerminalState::Failed(FailureReason::Health(detail))));
        }

        tracing::info!(
            "Iteration {} closed: aggregate {:.3}{}",
            iteration,
            aggregate,
            if improved { " (improved)" } else { "" }
        );
        Ok(PhaseOutcome::Continue)
    }

    /// 持续退化时回到得分最高那一轮所用的版本（以新版本的形式，不删历史）
    fn rollback_to_best(&mut self) {
        let best = self
            .records
            .iter()
            .filter_map(|r| r.aggregate().map(|a| (r.iteration, r.artifact_version, a)))
            .fold(None, |best: Option<(u32, u32, f64)>, c| match best {
                Some(b) if b.2 >= c.2 => Some(b),
                _ => Some(c),
            });
        let Some((iteration, version, score)) = best else {
            return;
        };
        let same_text = self
            .lineage
            .get(version)
            .is_some_and(|a| a.text == self.lineage.current().text);
        if same_text {
            return;
        }
        if let Some(new_version) = self.lineage.rollback_to(version) {
            tracing::warn!(
                "Scores degrading: restored v{} from iteration {} ({:.3}) as v{}",
                version,
                iteration,
                score,
                new_version
            );
        }
    }

    // -----------------------------------------------------------------------
    // 持久化与报告
    // -----------------------------------------------------------------------

    async fn checkpoint(
        &self,
        iteration: u32,
        phase: EvolutionPhase,
        terminal: Option<TerminalState>,
    ) -> Result<(), EvolutionError> {
        self.store.write_artifacts(&self.lineage).await?;
        self.tracker.read().await.save(&self.store.dir().join(TRACKING_FILE)).await?;
        self.registry.write().await.persist_state().await?;
        let checkpoint = Checkpoint {
            run_id: self.run_id.clone(),
            iteration,
            phase,
            artifacts: self.lineage.versions().iter().map(ArtifactMeta::from).collect(),
            baseline_protected: self.lineage.baseline_protected().to_vec(),
            records: self.records.clone(),
            deployed: self.deployed.clone(),
            health: self.health.state().clone(),
            call_stats: self.call_stats,
            terminal,
            started_at: self.started_at,
            saved_at: Utc::now(),
        };
        self.store.save_checkpoint(&checkpoint).await
    }

    async fn finish(
        mut self,
        iteration: u32,
        phase: EvolutionPhase,
        terminal: TerminalState,
    ) -> Result<RunReport, EvolutionError> {
        if terminal == TerminalState::Failed(FailureReason::Cancelled) {
            // 检查点停留在最后完成的阶段，可用 --resume 继续
            tracing::warn!("Run {} cancelled during iteration {}", self.run_id, iteration);
            self.store.write_artifacts(&self.lineage).await?;
            self.tracker.read().await.save(&self.store.dir().join(TRACKING_FILE)).await?;
        } else {
            if let Some(record) = self.records.last_mut() {
                record.closed = true;
            }
            self.checkpoint(iteration, phase, Some(terminal.clone())).await?;
        }
        self.registry.write().await.save().await?;

        let report = self.build_report(terminal).await;
        self.store
            .write_results(&RunResults {
                report: report.clone(),
                records: self.records.clone(),
            })
            .await?;
        tracing::info!(
            "Run {} finished: {} after {} iterations (artifact v{})",
            self.run_id,
            report.terminal,
            report.iterations_completed,
            report.final_artifact_version
        );
        Ok(report)
    }

    async fn build_report(&self, terminal: TerminalState) -> RunReport {
        let snapshots: Vec<EvaluationSnapshot> = self.records.iter().filter_map(|r| r.snapshot.clone()).collect();
        RunReport {
            run_id: self.run_id.clone(),
            terminal,
            iterations_completed: self.records.iter().filter(|r| r.closed).count() as u32,
            final_artifact_version: self.lineage.current().version,
            iterations: self.records.iter().map(IterationSummary::from).collect(),
            insights: derive_insights(&snapshots, self.stop.improvement_threshold),
            tracking: self.tracker.read().await.report(None),
            registry: self.registry.read().await.data().stats.clone(),
            health_warnings: self.health.warnings().to_vec(),
            validation_warnings: self
                .records
                .iter()
                .flat_map(|r| r.validation_warnings.iter().cloned())
                .collect(),
            started_at: self.started_at,
            finished_at: Utc::now(),
        }
    }
}

fn record_ref(records: &[IterationRecord], iteration: u32) -> Result<&IterationRecord, EvolutionError> {
    records
        .iter()
        .rev()
        .find(|r| r.iteration == iteration)
        .ok_or_else(|| EvolutionError::NotFound(format!("record for iteration {}", iteration)))
}

fn record_mut(records: &mut [IterationRecord], iteration: u32) -> Result<&mut IterationRecord, EvolutionError> {
    records
        .iter_mut()
        .rev()
        .find(|r| r.iteration == iteration)
        .ok_or_else(|| EvolutionError::NotFound(format!("record for iteration {}", iteration)))
}

fn accumulate(sums: &mut BTreeMap<String, (f64, usize)>, card: &ScoreCard) {
    for (dim, value) in card.scored() {
        let entry = sums.entry(dim.to_string()).or_insert((0.0, 0));
        entry.0 += value;
        entry.1 += 1;
    }
}

/// 登记册里代表一个改进的变更文本
fn registry_changes(payload: &ImprovementPayload) -> Vec<String> {
    match payload {
        ImprovementPayload::Mutations { plan, .. } => plan.operations.iter().map(change_key).collect(),
        ImprovementPayload::Capability { spec, .. } => {
            vec![format!("capability {}: {}", spec.name, spec.description)]
        }
        ImprovementPayload::Parameters { values } => values.iter().map(|(k, v)| format!("{} = {}", k, v)).collect(),
    }
}
