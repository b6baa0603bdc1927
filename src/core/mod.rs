//! 核心层：错误与恢复、重试包装器、有界工作池、取消信号、控制器状态

pub mod error;
pub mod recovery;
pub mod retry;
pub mod shutdown;
pub mod state;
pub mod worker_pool;

pub use error::{EvolutionError, ParseError, RecoveryAction, ValidationWarning};
pub use recovery::{RecoveryEngine, STRICT_STRUCTURE_INSTRUCTION};
pub use retry::{
    AttemptContext, AttemptFailure, PartialProgress, RetryExecutor, RetryOutcome, RetryPolicy,
    USEFUL_DATA_MARKERS,
};
pub use shutdown::{ShutdownManager, ShutdownReason};
pub use state::{CompletionReason, EvolutionPhase, FailureReason, TerminalState};
pub use worker_pool::{TaskResult, WorkerPool};
