//! 可观测性：日志订阅器
//!
//! 默认 info，可通过 RUST_LOG 覆盖（如 `RUST_LOG=evolver=debug`）。

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// 安装全局 tracing 订阅器；重复调用时静默忽略
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init();
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_init_twice_does_not_panic() {
        super::init();
        super::init();
        tracing::info!("observability initialised");
    }
}
