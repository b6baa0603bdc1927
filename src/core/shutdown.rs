//! 协作式取消与优雅关闭
//!
//! 控制器在每个阶段之间、工作池在每个任务边界检查同一个 CancellationToken；
//! 进行中的 Oracle 调用通过重试包装器里的 `select!` 响应同一信号。

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// 关闭信号管理器
#[derive(Clone)]
pub struct ShutdownManager {
    shutdown_token: CancellationToken,
    reason_tx: broadcast::Sender<ShutdownReason>,
}

/// 关闭原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl+C
    UserInitiated,
    /// SIGTERM 信号
    Signal,
    /// 运行在外部被要求停止（如测试或嵌入方）
    Requested(String),
}

impl ShutdownManager {
    pub fn new() -> Self {
        let (reason_tx, _) = broadcast::channel(1);
        Self {
            shutdown_token: CancellationToken::new(),
            reason_tx,
        }
    }

    /// 获取取消 token（传给控制器与工作池）
    pub fn token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    pub fn shutdown(&self, reason: ShutdownReason) {
        let _ = self.reason_tx.send(reason);
        self.shutdown_token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown_token.is_cancelled()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownReason> {
        self.reason_tx.subscribe()
    }

    pub async fn wait_for_shutdown(&self) {
        self.shutdown_token.cancelled().await;
    }

    /// 安装系统信号处理器 (Ctrl+C, SIGTERM)
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                tracing::info!("Received Ctrl+C, cancelling evolution run after the current phase...");
                manager.shutdown(ShutdownReason::UserInitiated);
            }
        });

        #[cfg(unix)]
        {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    tracing::info!("Received SIGTERM, cancelling evolution run...");
                    manager.shutdown(ShutdownReason::Signal);
                }
            });
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shutdown_cancels_token_and_broadcasts_reason() {
        let manager = ShutdownManager::new();
        let token = manager.token();
        let mut rx = manager.subscribe();

        assert!(!manager.is_shutdown());
        manager.shutdown(ShutdownReason::Requested("test".into()));

        assert!(token.is_cancelled());
        assert_eq!(rx.recv().await.unwrap(), ShutdownReason::Requested("test".into()));
        manager.wait_for_shutdown().await;
    }
}
