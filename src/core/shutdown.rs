//! 优雅关闭
//!
//! Ctrl+C / SIGTERM 取消同一个 CancellationToken；清理循环与 HTTP 服务都监听它。

use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

/// 关闭信号管理器；只记录第一次关闭的原因
pub struct ShutdownManager {
    shutdown_token: CancellationToken,
    reason: Mutex<Option<ShutdownReason>>,
}

/// 关闭原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl+C
    UserInitiated,
    /// SIGTERM
    Signal,
    /// 启动后出现的不可恢复错误（如监听中断）
    FatalError(String),
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self {
            shutdown_token: CancellationToken::new(),
            reason: Mutex::new(None),
        }
    }

    /// 关闭 token（交给后台任务）
    pub fn token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    pub fn shutdown(&self, reason: ShutdownReason) {
        tracing::info!(?reason, "shutdown requested");
        if let Ok(mut slot) = self.reason.lock() {
            slot.get_or_insert(reason);
        }
        self.shutdown_token.cancel();
    }

    /// 关闭原因；尚未关闭时为 None
    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason.lock().ok().and_then(|slot| slot.clone())
    }

    pub async fn wait_for_shutdown(&self) {
        self.shutdown_token.cancelled().await;
    }

    /// 安装系统信号处理器 (Ctrl+C, SIGTERM)
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                tracing::info!("Received Ctrl+C, shutting down");
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
                    tracing::info!("Received SIGTERM, shutting down");
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
    async fn test_shutdown_cancels_token_and_keeps_first_reason() {
        let manager = ShutdownManager::new();
        let token = manager.token();
        assert_eq!(manager.reason(), None);

        manager.shutdown(ShutdownReason::Signal);
        manager.shutdown(ShutdownReason::FatalError("listener closed".into()));

        assert!(token.is_cancelled());
        manager.wait_for_shutdown().await;
        assert_eq!(manager.reason(), Some(ShutdownReason::Signal));
    }
}
