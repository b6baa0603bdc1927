//! Evolver - 指令产物的自动进化引擎
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误与恢复、重试包装器、工作池、取消信号、控制器状态
//! - **evolution**: 进化控制器与各阶段（分析、设计、实现、归因、持久化）
//! - **llm**: LLM 客户端抽象（OpenAI 兼容 / Mock）与结构化输出
//! - **mutation**: 指令文本的解析、受保护元素与变异引擎
//! - **observability**: 日志订阅器
//! - **oracle**: 生成 / 评分 / 实现 Oracle 的接口、HTTP 适配器与模拟实现

pub mod config;
pub mod core;
pub mod evolution;
pub mod llm;
pub mod mutation;
pub mod observability;
pub mod oracle;

pub use evolution::{Collaborators, ControllerConfig, EvolutionController, RunReport};
