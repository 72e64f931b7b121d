//! 过期清理：定时驱逐陈旧的挂起调用
//!
//! 两档阈值：超过 max_age 的记录一律驱逐；超过 failed_max_age 的 failed 记录驱逐并归档。
//! 与请求无关，按固定间隔运行，直到关闭 token 被取消。

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::correlation::CorrelationProtocol;
use crate::store::{PendingCallStore, SweepPolicy, SweepReport};

pub struct CleanupSweeper {
    store: Arc<PendingCallStore>,
    correlation: Option<Arc<CorrelationProtocol>>,
    policy: SweepPolicy,
    interval: Duration,
}

impl CleanupSweeper {
    pub fn new(store: Arc<PendingCallStore>, policy: SweepPolicy, interval: Duration) -> Self {
        Self {
            store,
            correlation: None,
            policy,
            interval,
        }
    }

    /// 同时清理关联协议里过期的输出缓冲
    pub fn with_correlation(mut self, correlation: Arc<CorrelationProtocol>) -> Self {
        self.correlation = Some(correlation);
        self
    }

    /// 执行一次扫描
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> SweepReport {
        let report = self.store.sweep(now, self.policy).await;
        for call in &report.evicted {
            tracing::warn!(
                call_id = %call.id,
                thread_id = %call.thread_id,
                run_id = %call.run_id,
                agent_id = %call.agent_id,
                status = %call.status,
                "evicted stale pending call"
            );
        }
        for call in &report.archived {
            tracing::info!(
                call_id = %call.id,
                agent_id = %call.agent_id,
                error = call.last_error.as_deref().unwrap_or(""),
                "archived failed call"
            );
        }

        let dropped_buffers = match &self.correlation {
            Some(correlation) => correlation.prune(now - self.policy.max_age).await,
            None => 0,
        };

        if report.total() > 0 || dropped_buffers > 0 {
            tracing::info!(
                evicted = report.evicted.len(),
                archived = report.archived.len(),
                dropped_buffers,
                "cleanup sweep finished"
            );
        }
        report
    }

    /// 按间隔循环扫描，token 取消后退出
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // interval 的第一次 tick 立即完成
        ticker.tick().await;

        tracing::info!(interval_secs = self.interval.as_secs(), "cleanup sweeper started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("cleanup sweeper stopped");
                    break;
                }
                _ = ticker.tick() => {
                    self.sweep_once(Utc::now()).await;
                }
            }
        }
    }
}
