//! Evolver 驱动程序
//!
//! 入口：初始化日志、加载配置、装配 Oracle 与分析器，运行进化控制器并打印结束报告。
//! 未配置 Oracle 端点时使用模拟 Oracle（可离线演示完整流程）。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use evolver::config::{load_config, AppConfig};
use evolver::core::{RetryExecutor, ShutdownManager};
use evolver::evolution::{
    AnalyzerSettings, Collaborators, ControllerConfig, EvolutionController, GapAnalyzer, LlmGapAnalyzer,
    RubricGapAnalyzer,
};
use evolver::llm::create_llm_from_config;
use evolver::observability;
use evolver::oracle::{
    GenerationOracle, HttpGenerationOracle, HttpImplementer, HttpScoringOracle, Implementer,
    KeywordScoringOracle, ScoringOracle, SimulatedGenerationOracle, SimulatedImplementer, TestCase,
};

const DEFAULT_ARTIFACT: &str = "\
Create a slide deck about {theme} for a {purpose} audience.

## Source
{blog_content}

## Requirements:
- Try to cover the main points of the source.
- You might add a summary slide at the end.
";

const DEFAULT_CASES: &[&str] = &[
    "Rust ownership explained",
    "Scaling a job queue",
    "Quarterly product review",
];

#[derive(Parser, Debug)]
#[command(name = "evolver")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Iteratively evolve an instruction artifact against scoring oracles", long_about = None)]
struct Cli {
    /// Maximum number of iterations
    #[arg(long, env = "EVOLVER_MAX_ITERATIONS")]
    max_iterations: Option<u32>,

    /// Minimum aggregate improvement that counts as progress
    #[arg(long)]
    threshold: Option<f64>,

    /// Only evolve the instruction text (never call the implementer)
    #[arg(long)]
    prompt_only: bool,

    /// Fixed seed for enhancement sampling
    #[arg(long)]
    seed: Option<u64>,

    /// Ignore the persisted pattern registry and learn from scratch
    #[arg(long)]
    no_registry: bool,

    /// Resume from the checkpoint in the output directory
    #[arg(long)]
    resume: bool,

    /// Initial instruction artifact (text file)
    #[arg(long)]
    initial_artifact: Option<PathBuf>,

    /// Output directory for versions, results and the registry
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Extra TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();
    let cli = Cli::parse();

    let mut cfg = load_config(cli.config.clone()).context("Failed to load config")?;
    apply_overrides(&mut cfg, &cli);

    let initial = match &cli.initial_artifact {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read initial artifact {}", path.display()))?,
        None => DEFAULT_ARTIFACT.to_string(),
    };
    let test_cases = test_cases(&cfg);
    let collaborators = collaborators(&cfg);

    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.install_signal_handlers();

    let mut controller_cfg = ControllerConfig::from(&cfg);
    controller_cfg.resume = cli.resume;
    let controller = EvolutionController::new(controller_cfg, collaborators, test_cases, initial, shutdown.token())
        .await
        .context("Failed to create evolution controller")?;
    tracing::info!(
        "Run {} writing to {}",
        controller.run_id(),
        cfg.app.output_dir.display()
    );

    let report = controller.run().await.context("Evolution run failed")?;
    println!("{}", report);
    if !report.terminal.is_complete() {
        std::process::exit(1);
    }
    Ok(())
}

fn apply_overrides(cfg: &mut AppConfig, cli: &Cli) {
    if let Some(n) = cli.max_iterations {
        cfg.evolution.max_iterations = n;
    }
    if let Some(t) = cli.threshold {
        cfg.evolution.improvement_threshold = t;
    }
    if cli.prompt_only {
        cfg.evolution.prompt_only = true;
    }
    if cli.seed.is_some() {
        cfg.evolution.seed = cli.seed;
    }
    if cli.no_registry {
        cfg.evolution.use_registry = false;
    }
    if let Some(dir) = &cli.output_dir {
        cfg.app.output_dir = dir.clone();
    }
}

fn test_cases(cfg: &AppConfig) -> Vec<TestCase> {
    let inputs: Vec<&str> = if cfg.oracle.test_cases.is_empty() {
        DEFAULT_CASES.to_vec()
    } else {
        cfg.oracle.test_cases.iter().map(String::as_str).collect()
    };
    inputs
        .into_iter()
        .enumerate()
        .map(|(i, input)| TestCase::new(format!("case_{}", i + 1), input))
        .collect()
}

fn collaborators(cfg: &AppConfig) -> Collaborators {
    let generator: Arc<dyn GenerationOracle> = match &cfg.oracle.generation_url {
        Some(url) => Arc::new(HttpGenerationOracle::new(url.clone())),
        None => {
            tracing::info!("No generation oracle configured, using the simulated one");
            Arc::new(SimulatedGenerationOracle::new())
        }
    };
    let scorer: Arc<dyn ScoringOracle> = match &cfg.oracle.scoring_url {
        Some(url) => Arc::new(HttpScoringOracle::new(url.clone())),
        None => {
            tracing::info!("No scoring oracle configured, using keyword scoring");
            Arc::new(KeywordScoringOracle::new())
        }
    };
    let implementer: Option<Arc<dyn Implementer>> = if cfg.evolution.prompt_only {
        None
    } else {
        let implementer: Arc<dyn Implementer> = match &cfg.oracle.implementer_url {
            Some(url) => Arc::new(HttpImplementer::new(url.clone())),
            None => Arc::new(SimulatedImplementer::default()),
        };
        Some(implementer)
    };

    let settings = AnalyzerSettings::from(&cfg.evolution);
    let analyzer: Arc<dyn GapAnalyzer> = if cfg.evolution.llm_analysis {
        let llm = create_llm_from_config(cfg);
        Arc::new(LlmGapAnalyzer::new(
            llm,
            RetryExecutor::new((&cfg.retry).into()),
            settings,
        ))
    } else {
        Arc::new(RubricGapAnalyzer::new(settings))
    };

    Collaborators {
        generator,
        scorer,
        implementer,
        analyzer,
    }
}
