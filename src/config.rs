//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `EVOLVER__*` 覆盖（双下划线表示嵌套，如 `EVOLVER__EVOLUTION__MAX_ITERATIONS=8`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::core::RetryPolicy;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub evolution: EvolutionSection,
    pub retry: RetrySection,
    pub concurrency: ConcurrencySection,
    pub health: HealthSection,
    pub oracle: OracleSection,
}

/// [app] 段：运行输出目录
#[derive(Debug, Clone, Deserialize)]
pub struct AppSection {
    pub name: Option<String>,
    /// 产物版本、结果文件、登记册文档所在目录
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            output_dir: default_output_dir(),
        }
    }
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("evolution_runs")
}

/// [evolution] 段：迭代上限、停止判定、差距阈值、校验严格度
#[derive(Debug, Clone, Deserialize)]
pub struct EvolutionSection {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// 迭代间总分提升低于此值时计入「收益递减」
    #[serde(default = "default_improvement_threshold")]
    pub improvement_threshold: f64,
    /// 只走 prompt 路线（不调用能力实现方）
    #[serde(default)]
    pub prompt_only: bool,
    /// 固定随机种子（增强类型采样）
    #[serde(default)]
    pub seed: Option<u64>,
    /// 是否加载已持久化的模式登记册；false 时从头学习
    #[serde(default = "default_true")]
    pub use_registry: bool,
    /// adaptive / aggressive / conservative / linear
    #[serde(default = "default_schedule")]
    pub schedule: String,
    #[serde(default = "default_max_score")]
    pub max_score: f64,
    #[serde(default = "default_perfection_ratio")]
    pub perfection_ratio: f64,
    #[serde(default)]
    pub diminishing_returns: bool,
    #[serde(default = "default_diminishing_threshold")]
    pub diminishing_threshold: f64,
    #[serde(default = "default_gap_threshold")]
    pub gap_threshold: f64,
    #[serde(default = "default_min_gaps")]
    pub min_gaps: usize,
    #[serde(default = "default_analysis_retries")]
    pub analysis_retries: u32,
    /// 生成 Oracle 依赖的关键占位符；新版本缺失时记录 ValidationWarning
    #[serde(default = "default_critical_placeholders")]
    pub critical_placeholders: Vec<String>,
    /// lenient（记录并继续）/ strict（丢弃缺失关键元素的版本）
    #[serde(default = "default_validation")]
    pub validation: String,
    /// 每个差距最多尝试的增强类型数
    #[serde(default = "default_max_enhancements")]
    pub max_enhancements: usize,
    /// 是否用 LLM 做差距分析（否则使用确定性规则）
    #[serde(default)]
    pub llm_analysis: bool,
}

impl Default for EvolutionSection {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            improvement_threshold: default_improvement_threshold(),
            prompt_only: false,
            seed: None,
            use_registry: true,
            schedule: default_schedule(),
            max_score: default_max_score(),
            perfection_ratio: default_perfection_ratio(),
            diminishing_returns: false,
            diminishing_threshold: default_diminishing_threshold(),
            gap_threshold: default_gap_threshold(),
            min_gaps: default_min_gaps(),
            analysis_retries: default_analysis_retries(),
            critical_placeholders: default_critical_placeholders(),
            validation: default_validation(),
            max_enhancements: default_max_enhancements(),
            llm_analysis: false,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_max_iterations() -> u32 {
    5
}

fn default_improvement_threshold() -> f64 {
    0.1
}

fn default_schedule() -> String {
    "adaptive".to_string()
}

fn default_max_score() -> f64 {
    5.0
}

fn default_perfection_ratio() -> f64 {
    0.98
}

fn default_diminishing_threshold() -> f64 {
    0.05
}

fn default_gap_threshold() -> f64 {
    4.5
}

fn default_min_gaps() -> usize {
    3
}

fn default_analysis_retries() -> u32 {
    3
}

fn default_critical_placeholders() -> Vec<String> {
    vec!["{blog_content}".into(), "{purpose}".into(), "{theme}".into()]
}

fn default_validation() -> String {
    "lenient".to_string()
}

fn default_max_enhancements() -> usize {
    3
}

/// [retry] 段：所有外部调用共用的重试策略
#[derive(Debug, Clone, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_true")]
    pub exponential: bool,
    #[serde(default = "default_true")]
    pub allow_partial: bool,
    /// 单次 Oracle 调用超时（秒）；0 表示不限
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            exponential: true,
            allow_partial: true,
            call_timeout_secs: default_call_timeout_secs(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    2000
}

fn default_call_timeout_secs() -> u64 {
    120
}

impl From<&RetrySection> for RetryPolicy {
    fn from(section: &RetrySection) -> Self {
        Self {
            max_retries: section.max_retries,
            base_delay: Duration::from_millis(section.base_delay_ms),
            exponential: section.exponential,
            allow_partial: section.allow_partial,
            call_timeout: (section.call_timeout_secs > 0)
                .then(|| Duration::from_secs(section.call_timeout_secs)),
        }
    }
}

/// [concurrency] 段：GENERATE / SCORE 的并发上限
#[derive(Debug, Clone, Deserialize)]
pub struct ConcurrencySection {
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
}

impl Default for ConcurrencySection {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
        }
    }
}

fn default_max_workers() -> usize {
    4
}

/// [health] 段：健康检查阈值
#[derive(Debug, Clone, Deserialize)]
pub struct HealthSection {
    /// Oracle 调用失败率超过此值时产生告警
    #[serde(default = "default_max_failure_ratio")]
    pub max_failure_ratio: f64,
    /// 同一组差距连续出现且无净提升的迭代数
    #[serde(default = "default_stagnation_iterations")]
    pub stagnation_iterations: usize,
    /// 累计告警达到此数时以 FAILED(health) 终止
    #[serde(default = "default_max_warnings")]
    pub max_warnings: usize,
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            max_failure_ratio: default_max_failure_ratio(),
            stagnation_iterations: default_stagnation_iterations(),
            max_warnings: default_max_warnings(),
        }
    }
}

fn default_max_failure_ratio() -> f64 {
    0.5
}

fn default_stagnation_iterations() -> usize {
    3
}

fn default_max_warnings() -> usize {
    3
}

/// [llm] 段：LLM 差距分析使用的后端
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// openai / mock
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: None,
        }
    }
}

fn default_provider() -> String {
    "openai".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

/// [oracle] 段：外部 Oracle 的 HTTP 端点；未配置时驱动程序使用模拟 Oracle
#[derive(Debug, Clone, Deserialize, Default)]
pub struct OracleSection {
    pub generation_url: Option<String>,
    pub scoring_url: Option<String>,
    pub implementer_url: Option<String>,
    /// 测试用例输入（每个用例一次生成 + 一次评分）
    #[serde(default)]
    pub test_cases: Vec<String>,
}

/// 从 config 目录加载配置，环境变量 EVOLVER__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 EVOLVER__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("EVOLVER")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
