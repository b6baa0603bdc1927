//! 进化控制器端到端测试（模拟 / 脚本化 Oracle）

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use evolver::config::EvolutionSection;
use evolver::core::{CompletionReason, EvolutionError, FailureReason, RetryPolicy, TerminalState};
use evolver::evolution::persistence::{CHECKPOINT_FILE, RESULTS_FILE};
use evolver::evolution::{
    AnalyzerSettings, Collaborators, ControllerConfig, EvolutionController, HealthSettings, PatternRegistry,
    RubricGapAnalyzer,
};
use evolver::oracle::{
    GenerationOracle, KeywordScoringOracle, ScoringOracle, ScriptedScoringOracle, SimulatedGenerationOracle,
    SimulatedImplementer, TestCase,
};

const ARTIFACT: &str = "Create slides about {theme} for {purpose}.\n\n## Source\n{blog_content}\n\n## Requirements:\n- Try to cover the main points.\n- You might add a summary slide.\n";
const DIMS: &[&str] = &["content_accuracy", "structure", "visual_design"];
const PLACEHOLDERS: &[&str] = &["{theme}", "{purpose}", "{blog_content}"];

fn cases() -> Vec<TestCase> {
    vec![
        TestCase::new("case_1", "Rust ownership"),
        TestCase::new("case_2", "Async runtimes"),
    ]
}

fn config(dir: &Path, max_iterations: u32) -> ControllerConfig {
    let evolution = EvolutionSection {
        max_iterations,
        prompt_only: true,
        seed: Some(7),
        ..Default::default()
    };
    ControllerConfig {
        output_dir: dir.to_path_buf(),
        resume: false,
        evolution,
        retry: RetryPolicy::default()
            .with_max_retries(1)
            .with_base_delay(Duration::ZERO),
        health: HealthSettings::default(),
        max_workers: 2,
    }
}

fn collaborators(generator: Arc<dyn GenerationOracle>, scorer: Arc<dyn ScoringOracle>) -> Collaborators {
    Collaborators {
        generator,
        scorer,
        implementer: None,
        analyzer: Arc::new(RubricGapAnalyzer::new(AnalyzerSettings::from(&EvolutionSection::default()))),
    }
}

fn scripted(aggregates: &[f64]) -> Arc<ScriptedScoringOracle> {
    Arc::new(ScriptedScoringOracle::uniform(aggregates, DIMS, cases().len()))
}

async fn run(cfg: ControllerConfig, collaborators: Collaborators) -> evolver::RunReport {
    EvolutionController::new(cfg, collaborators, cases(), ARTIFACT, CancellationToken::new())
        .await
        .unwrap()
        .run()
        .await
        .unwrap()
}

#[tokio::test]
async fn test_two_near_perfect_rounds_complete_with_perfection() {
    let dir = tempfile::tempdir().unwrap();
    let report = run(
        config(dir.path(), 10),
        collaborators(Arc::new(SimulatedGenerationOracle::new()), scripted(&[4.9, 4.96])),
    )
    .await;

    assert_eq!(report.terminal, TerminalState::Complete(CompletionReason::Perfection));
    assert_eq!(report.iterations_completed, 2);
    assert_eq!(report.insights.best_iteration, Some(2));
    assert!(dir.path().join(RESULTS_FILE).exists());
    assert!(dir.path().join(CHECKPOINT_FILE).exists());
}

#[tokio::test]
async fn test_max_iterations_stops_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let report = run(
        config(dir.path(), 3),
        collaborators(Arc::new(SimulatedGenerationOracle::new()), scripted(&[3.0, 3.2, 3.1])),
    )
    .await;

    assert_eq!(report.terminal, TerminalState::Complete(CompletionReason::MaxIterations));
    assert_eq!(report.iterations_completed, 3);
    let iterations: Vec<u32> = report.iterations.iter().map(|i| i.iteration).collect();
    assert_eq!(iterations, vec![1, 2, 3]);
}

#[tokio::test]
async fn test_degrading_scores_restore_the_best_artifact() {
    let dir = tempfile::tempdir().unwrap();
    let report = run(
        config(dir.path(), 10),
        collaborators(
            Arc::new(SimulatedGenerationOracle::new()),
            scripted(&[4.0, 3.8, 3.6, 3.4]),
        ),
    )
    .await;

    assert_eq!(report.terminal, TerminalState::Complete(CompletionReason::Degrading));
    assert_eq!(report.iterations_completed, 4);
    assert_eq!(report.insights.best_iteration, Some(1));

    // 最佳一轮用的是基线 v0
    let final_text = std::fs::read_to_string(
        dir.path()
            .join(format!("artifact_v{}.txt", report.final_artifact_version)),
    )
    .unwrap();
    assert_eq!(final_text, ARTIFACT);
}

#[tokio::test]
async fn test_all_generation_failures_fail_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let scorer = scripted(&[4.0]);
    let report = run(
        config(dir.path(), 5),
        collaborators(Arc::new(SimulatedGenerationOracle::new().failing_all()), scorer.clone()),
    )
    .await;

    assert!(matches!(
        report.terminal,
        TerminalState::Failed(FailureReason::Generation(_))
    ));
    assert_eq!(scorer.calls(), 0);
}

#[tokio::test]
async fn test_partial_generation_failures_continue() {
    let dir = tempfile::tempdir().unwrap();
    let report = run(
        config(dir.path(), 1),
        collaborators(
            Arc::new(SimulatedGenerationOracle::new().failing_cases(["case_2"])),
            scripted(&[3.5]),
        ),
    )
    .await;

    assert_eq!(report.terminal, TerminalState::Complete(CompletionReason::MaxIterations));
    assert_eq!(report.iterations[0].generation_failures, 1);
}

#[tokio::test]
async fn test_zero_valid_scores_fail_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let scorer = Arc::new(ScriptedScoringOracle::uniform(&[4.0], DIMS, cases().len()).failing_round(0));
    let report = run(
        config(dir.path(), 5),
        collaborators(Arc::new(SimulatedGenerationOracle::new()), scorer),
    )
    .await;

    assert!(matches!(report.terminal, TerminalState::Failed(FailureReason::Scoring(_))));
}

#[tokio::test]
async fn test_stagnation_fails_the_run_on_health() {
    let dir = tempfile::tempdir().unwrap();
    let report = run(
        config(dir.path(), 10),
        collaborators(Arc::new(SimulatedGenerationOracle::new()), scripted(&[3.0])),
    )
    .await;

    assert!(matches!(report.terminal, TerminalState::Failed(FailureReason::Health(_))));
    assert_eq!(report.iterations_completed, 5);
    assert_eq!(report.health_warnings.len(), 3);
}

#[tokio::test]
async fn test_cancelled_before_start_then_resumed() {
    let dir = tempfile::tempdir().unwrap();
    let cancel = CancellationToken::new();
    cancel.cancel();
    let cancelled = EvolutionController::new(
        config(dir.path(), 2),
        collaborators(Arc::new(SimulatedGenerationOracle::new()), scripted(&[3.0, 3.5])),
        cases(),
        ARTIFACT,
        cancel,
    )
    .await
    .unwrap()
    .run()
    .await
    .unwrap();
    assert_eq!(cancelled.terminal, TerminalState::Failed(FailureReason::Cancelled));
    assert_eq!(cancelled.iterations_completed, 0);

    let mut cfg = config(dir.path(), 2);
    cfg.resume = true;
    let resumed = run(
        cfg,
        collaborators(Arc::new(SimulatedGenerationOracle::new()), scripted(&[3.0, 3.5])),
    )
    .await;
    assert_eq!(resumed.run_id, cancelled.run_id);
    assert_eq!(resumed.terminal, TerminalState::Complete(CompletionReason::MaxIterations));
    assert_eq!(resumed.iterations_completed, 2);
}

/// 第 cancel_at 次调用时触发取消
struct CancellingGenerator {
    inner: SimulatedGenerationOracle,
    cancel_at: usize,
    calls: AtomicUsize,
    token: CancellationToken,
}

#[async_trait]
impl GenerationOracle for CancellingGenerator {
    async fn generate(&self, instruction: &str, case: &TestCase) -> Result<String, EvolutionError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) + 1 == self.cancel_at {
            self.token.cancel();
        }
        self.inner.generate(instruction, case).await
    }
}

#[tokio::test]
async fn test_cancel_mid_run_resumes_from_last_phase() {
    let dir = tempfile::tempdir().unwrap();
    let token = CancellationToken::new();
    let generator = Arc::new(CancellingGenerator {
        inner: SimulatedGenerationOracle::new(),
        // 第二轮的第一次生成
        cancel_at: cases().len() + 1,
        calls: AtomicUsize::new(0),
        token: token.clone(),
    });
    let cancelled = EvolutionController::new(
        config(dir.path(), 3),
        collaborators(generator, scripted(&[3.0])),
        cases(),
        ARTIFACT,
        token,
    )
    .await
    .unwrap()
    .run()
    .await
    .unwrap();
    assert_eq!(cancelled.terminal, TerminalState::Failed(FailureReason::Cancelled));

    let mut cfg = config(dir.path(), 3);
    cfg.resume = true;
    let scorer = scripted(&[3.0]);
    let resumed = run(
        cfg,
        collaborators(Arc::new(SimulatedGenerationOracle::new()), scorer.clone()),
    )
    .await;

    assert_eq!(resumed.run_id, cancelled.run_id);
    assert_eq!(resumed.terminal, TerminalState::Complete(CompletionReason::MaxIterations));
    let iterations: Vec<u32> = resumed.iterations.iter().map(|i| i.iteration).collect();
    assert_eq!(iterations, vec![1, 2, 3]);
    // 只重跑了第 2、3 轮
    assert_eq!(scorer.calls(), 2 * cases().len());
}

#[tokio::test]
async fn test_resuming_a_finished_run_returns_its_report() {
    let dir = tempfile::tempdir().unwrap();
    let first = run(
        config(dir.path(), 10),
        collaborators(Arc::new(SimulatedGenerationOracle::new()), scripted(&[4.9, 4.96])),
    )
    .await;

    let mut cfg = config(dir.path(), 10);
    cfg.resume = true;
    let scorer = scripted(&[1.0]);
    let again = run(
        cfg,
        collaborators(Arc::new(SimulatedGenerationOracle::new()), scorer.clone()),
    )
    .await;

    assert_eq!(again.run_id, first.run_id);
    assert_eq!(again.terminal, first.terminal);
    assert_eq!(again.iterations_completed, 2);
    assert_eq!(scorer.calls(), 0);
}

#[tokio::test]
async fn test_fresh_run_replaces_previous_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let first = run(
        config(dir.path(), 10),
        collaborators(Arc::new(SimulatedGenerationOracle::new()), scripted(&[4.9, 4.96])),
    )
    .await;
    let second = run(
        config(dir.path(), 1),
        collaborators(Arc::new(SimulatedGenerationOracle::new()), scripted(&[3.0])),
    )
    .await;

    assert_ne!(second.run_id, first.run_id);
    assert_eq!(second.iterations_completed, 1);
}

#[tokio::test]
async fn test_every_version_keeps_protected_placeholders() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path(), 3);
    cfg.evolution.prompt_only = false;
    let mut collab = collaborators(
        Arc::new(SimulatedGenerationOracle::new()),
        Arc::new(KeywordScoringOracle::new()),
    );
    collab.implementer = Some(Arc::new(SimulatedImplementer::default()));
    let report = run(cfg, collab).await;
    assert!(report.terminal.is_complete());

    let mut versions = 0;
    for entry in std::fs::read_dir(dir.path()).unwrap() {
        let path = entry.unwrap().path();
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        if name.starts_with("artifact_v") && name.ends_with(".txt") {
            let text = std::fs::read_to_string(&path).unwrap();
            for placeholder in PLACEHOLDERS {
                assert!(text.contains(placeholder), "{} lost {}", name, placeholder);
            }
            versions += 1;
        }
    }
    assert_eq!(versions as u32, report.final_artifact_version + 1);
}

#[tokio::test]
async fn test_failed_change_is_flagged_after_reload() {
    let dir = tempfile::tempdir().unwrap();
    let change = "NEVER use any words not in the source".to_string();
    {
        let mut registry = PatternRegistry::open(dir.path(), true).await.unwrap();
        registry.record_outcome("strict_source_only", 2, &[change.clone()], -0.4);
        registry.save().await.unwrap();
    }

    let registry = PatternRegistry::open(dir.path(), true).await.unwrap();
    let report = registry.check_similar(&[change.clone()]);
    assert_eq!(report.exact_matches.len(), 1);
    assert_eq!(report.exact_matches[0].source, "strict_source_only");
    assert!(!report.pattern_warnings.is_empty());

    // 不使用已持久化状态时只剩种子模式
    let fresh = PatternRegistry::open(dir.path(), false).await.unwrap();
    assert_eq!(fresh.data().stats.total_tested, 0);
    let seeded = fresh.check_similar(&[change]);
    assert_eq!(seeded.exact_matches.len(), 1);
    assert_eq!(seeded.exact_matches[0].source, "over_restriction");
}
