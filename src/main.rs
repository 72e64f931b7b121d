//! Toolhook 服务入口
//!
//! 加载配置 → 装配组件 → 启动清理循环 → 提供 HTTP 服务，Ctrl+C / SIGTERM 时优雅退出。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use toolhook::config::load_config;
use toolhook::core::{ShutdownManager, ShutdownReason};
use toolhook::{observability, server, BridgeBuilder};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    // 可选：第一个参数为额外的配置文件
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let cfg = load_config(config_path).context("Failed to load configuration")?;
    let bind = cfg.server.bind.clone();

    let bridge = Arc::new(
        BridgeBuilder::new(cfg)
            .build()
            .context("Failed to assemble bridge components")?,
    );

    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.install_signal_handlers();

    let sweeper = bridge.sweeper();
    let sweeper_task = tokio::spawn(sweeper.run(shutdown.token()));

    let app = server::create_router(Arc::clone(&bridge));
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("Failed to bind {}", bind))?;
    tracing::info!("Toolhook listening on http://{}", bind);

    let manager = Arc::clone(&shutdown);
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move { manager.wait_for_shutdown().await })
        .await;
    // 服务异常退出时也要停掉清理循环
    if let Err(e) = &served {
        shutdown.shutdown(ShutdownReason::FatalError(e.to_string()));
    }

    let _ = sweeper_task.await;
    tracing::info!(reason = ?shutdown.reason(), "Toolhook stopped");
    let pending = bridge.store.len().await;
    if pending > 0 {
        tracing::warn!(pending, "exiting with pending tool calls; they are not persisted");
    }

    served.context("HTTP server failed")?;
    Ok(())
}
