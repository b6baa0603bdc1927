//! 进化编排：控制器、分析、设计、实现、归因与持久化

pub mod agents;
pub mod analyzer;
pub mod attribution;
pub mod engine;
pub mod executor;
pub mod loop_;
pub mod persistence;
pub mod planner;
pub mod registry;
pub mod report;
pub mod scheduler;
pub mod types;

pub use agents::{AgentAction, ImplementationAgent, ImprovementAgent, Process, ReflectionAgent};
pub use analyzer::{AnalyzerSettings, GapAnalyzer, LlmGapAnalyzer, RubricGapAnalyzer};
pub use attribution::{AttributionTracker, TrackingReport};
pub use engine::{CallStats, HealthMonitor, HealthSettings, StopPolicy};
pub use executor::ImplementationStage;
pub use loop_::{Collaborators, ControllerConfig, EvolutionController};
pub use persistence::{Checkpoint, RunStore};
pub use planner::ImprovementDesigner;
pub use registry::{PatternRegistry, RegistryStats};
pub use report::{RunReport, RunResults};
pub use scheduler::{AdaptiveScheduler, Schedule};
pub use types::{
    ChangeSpec, EvaluationSnapshot, Gap, Improvement, ImprovementPayload, ImprovementType, IterationRecord,
    Priority,
};
