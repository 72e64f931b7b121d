//! 内存挂起调用存储
//!
//! 进程级生命周期，不跨重启。所有变更在同一把写锁内完成：
//! 关联时的「校验 + 删除」与清理扫描互斥，不会出现「已处理」与「过期驱逐」的丢失更新。
//! 方法内不做外部 I/O，调用方也不应持有返回值以外的锁跨越 await。

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::pending::{CallStatus, PendingCall};
use super::stats::PendingStats;

/// 清理阈值
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepPolicy {
    /// 超过此年龄的记录无论状态一律驱逐
    pub max_age: chrono::Duration,
    /// 超过此年龄的 failed 记录驱逐并归档
    pub failed_max_age: chrono::Duration,
}

impl Default for SweepPolicy {
    fn default() -> Self {
        Self {
            max_age: chrono::Duration::hours(1),
            failed_max_age: chrono::Duration::minutes(10),
        }
    }
}

/// 一次扫描的结果
#[derive(Debug, Default, Clone)]
pub struct SweepReport {
    /// 超过绝对年龄被驱逐
    pub evicted: Vec<PendingCall>,
    /// failed 且超过短阈值，已移入归档
    pub archived: Vec<PendingCall>,
}

impl SweepReport {
    pub fn total(&self) -> usize {
        self.evicted.len() + self.archived.len()
    }
}

/// 按 id 取出并校验归属的结果
#[derive(Debug, Clone, PartialEq)]
pub enum TakeOutcome {
    /// 匹配，已标记 processed 并删除
    Taken(PendingCall),
    NotFound,
    /// thread/run 不一致，存储未改动
    Mismatch(PendingCall),
}

struct StoreInner {
    calls: HashMap<String, PendingCall>,
    archive: VecDeque<PendingCall>,
}

/// 挂起调用关联表
pub struct PendingCallStore {
    inner: RwLock<StoreInner>,
    archive_capacity: usize,
}

impl PendingCallStore {
    pub fn new(archive_capacity: usize) -> Self {
        Self {
            inner: RwLock::new(StoreInner {
                calls: HashMap::new(),
                archive: VecDeque::new(),
            }),
            archive_capacity,
        }
    }

    /// 插入或覆盖；返回被覆盖的旧记录（后写入者生效）
    pub async fn put(&self, call: PendingCall) -> Option<PendingCall> {
        let mut inner = self.inner.write().await;
        inner.calls.insert(call.id.clone(), call)
    }

    pub async fn get(&self, id: &str) -> Option<PendingCall> {
        self.inner.read().await.calls.get(id).cloned()
    }

    pub async fn delete(&self, id: &str) -> bool {
        self.inner.write().await.calls.remove(id).is_some()
    }

    /// 快照（顺序无意义）
    pub async fn list_all(&self) -> Vec<PendingCall> {
        self.inner.read().await.calls.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.calls.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// 在写锁内修改单条记录；不存在时返回 None
    pub async fn update<F, R>(&self, id: &str, f: F) -> Option<R>
    where
        F: FnOnce(&mut PendingCall) -> R,
    {
        let mut inner = self.inner.write().await;
        inner.calls.get_mut(id).map(f)
    }

    /// 校验 thread/run 后原子地标记 processed 并删除
    pub async fn take_matching(&self, id: &str, thread_id: &str, run_id: &str) -> TakeOutcome {
        let mut inner = self.inner.write().await;
        let stored = match inner.calls.get(id) {
            None => return TakeOutcome::NotFound,
            Some(call) => call.clone(),
        };
        if !stored.belongs_to(thread_id, run_id) {
            return TakeOutcome::Mismatch(stored);
        }
        inner.calls.remove(id);
        let mut call = stored;
        call.status = CallStatus::Processed;
        TakeOutcome::Taken(call)
    }

    /// 某个 Run 下仍为 pending 的调用数
    pub async fn pending_for_run(&self, thread_id: &str, run_id: &str) -> usize {
        self.inner
            .read()
            .await
            .calls
            .values()
            .filter(|c| c.status == CallStatus::Pending && c.belongs_to(thread_id, run_id))
            .count()
    }

    /// 某个 Run 下尚未关联的调用数（含 failed，等待运维重投）
    pub async fn outstanding_for_run(&self, thread_id: &str, run_id: &str) -> usize {
        self.inner
            .read()
            .await
            .calls
            .values()
            .filter(|c| c.belongs_to(thread_id, run_id))
            .count()
    }

    /// 删除所有满足谓词的记录并返回它们
    pub async fn remove_where<P>(&self, mut predicate: P) -> Vec<PendingCall>
    where
        P: FnMut(&PendingCall) -> bool,
    {
        let mut inner = self.inner.write().await;
        let expired: Vec<String> = inner
            .calls
            .values()
            .filter(|c| predicate(c))
            .map(|c| c.id.clone())
            .collect();
        expired
            .iter()
            .filter_map(|id| inner.calls.remove(id))
            .collect()
    }

    /// 按年龄与状态清理；与 retry_count 无关
    pub async fn sweep(&self, now: DateTime<Utc>, policy: SweepPolicy) -> SweepReport {
        let mut inner = self.inner.write().await;
        let mut report = SweepReport::default();

        let candidates: Vec<(String, bool)> = inner
            .calls
            .values()
            .filter_map(|c| {
                let age = c.age(now);
                if age > policy.max_age {
                    Some((c.id.clone(), false))
                } else if c.status == CallStatus::Failed && age > policy.failed_max_age {
                    Some((c.id.clone(), true))
                } else {
                    None
                }
            })
            .collect();

        for (id, archive) in candidates {
            let Some(call) = inner.calls.remove(&id) else { continue };
            if archive {
                report.archived.push(call.clone());
                inner.archive.push_back(call);
            } else {
                report.evicted.push(call);
            }
        }

        while inner.archive.len() > self.archive_capacity {
            inner.archive.pop_front();
        }

        report
    }

    /// 已归档的 failed 记录（旧的在前）
    pub async fn archived(&self) -> Vec<PendingCall> {
        self.inner.read().await.archive.iter().cloned().collect()
    }

    pub async fn stats(&self, now: DateTime<Utc>) -> PendingStats {
        let inner = self.inner.read().await;
        PendingStats::collect(inner.calls.values(), inner.archive.len(), now)
    }
}

impl Default for PendingCallStore {
    fn default() -> Self {
        Self::new(200)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Duration;
    use serde_json::json;

    use super::*;

    fn call(id: &str) -> PendingCall {
        PendingCall::new(id, "thread_1", "run_1", "sales", "lookup", json!({"sku": "A-1"}))
    }

    #[tokio::test]
    async fn test_put_overwrites_same_id() {
        let store = PendingCallStore::default();
        assert!(store.put(call("call_1")).await.is_none());

        let mut later = call("call_1");
        later.function_name = "lookup_v2".into();
        let previous = store.put(later).await;

        assert_eq!(previous.map(|c| c.function_name), Some("lookup".to_string()));
        assert_eq!(store.len().await, 1);
        assert_eq!(store.get("call_1").await.unwrap().function_name, "lookup_v2");
    }

    #[tokio::test]
    async fn test_delete_reports_presence() {
        let store = PendingCallStore::default();
        store.put(call("call_1")).await;
        assert!(store.delete("call_1").await);
        assert!(!store.delete("call_1").await);
        assert!(store.get("call_1").await.is_none());
    }

    #[tokio::test]
    async fn test_take_mismatch_leaves_store_unchanged() {
        let store = PendingCallStore::default();
        store.put(call("call_1")).await;
        let before = store.list_all().await;

        let outcome = store.take_matching("call_1", "thread_1", "run_other").await;
        assert!(matches!(outcome, TakeOutcome::Mismatch(_)));
        let outcome = store.take_matching("call_1", "thread_other", "run_1").await;
        assert!(matches!(outcome, TakeOutcome::Mismatch(_)));

        assert_eq!(store.list_all().await, before);
    }

    #[tokio::test]
    async fn test_concurrent_take_succeeds_once() {
        let store = Arc::new(PendingCallStore::default());
        store.put(call("call_1")).await;

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                tokio::spawn(async move { store.take_matching("call_1", "thread_1", "run_1").await })
            })
            .collect();

        let mut taken = 0;
        let mut not_found = 0;
        for handle in handles {
            match handle.await.unwrap() {
                TakeOutcome::Taken(c) => {
                    assert_eq!(c.status, CallStatus::Processed);
                    taken += 1;
                }
                TakeOutcome::NotFound => not_found += 1,
                TakeOutcome::Mismatch(_) => panic!("unexpected mismatch"),
            }
        }
        assert_eq!(taken, 1);
        assert_eq!(not_found, 7);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_sweep_thresholds() {
        let store = PendingCallStore::default();
        let now = Utc::now();
        let policy = SweepPolicy::default();

        store
            .put(call("young_pending").with_created_at(now - Duration::minutes(30)))
            .await;
        let mut failed = call("old_failed").with_created_at(now - Duration::minutes(20));
        failed.status = CallStatus::Failed;
        store.put(failed).await;
        let mut exhausted = call("exhausted_pending").with_created_at(now - Duration::minutes(50));
        exhausted.retry_count = 99;
        store.put(exhausted).await;
        store
            .put(call("ancient_pending").with_created_at(now - Duration::hours(2)))
            .await;

        let report = store.sweep(now, policy).await;

        let evicted: Vec<_> = report.evicted.iter().map(|c| c.id.as_str()).collect();
        let archived: Vec<_> = report.archived.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(evicted, vec!["ancient_pending"]);
        assert_eq!(archived, vec!["old_failed"]);
        assert!(store.get("young_pending").await.is_some());
        assert!(store.get("exhausted_pending").await.is_some());
        assert_eq!(store.archived().await.len(), 1);
    }

    #[tokio::test]
    async fn test_young_failed_entry_survives() {
        let store = PendingCallStore::default();
        let now = Utc::now();
        let mut failed = call("fresh_failed").with_created_at(now - Duration::minutes(2));
        failed.status = CallStatus::Failed;
        store.put(failed).await;

        let report = store.sweep(now, SweepPolicy::default()).await;
        assert_eq!(report.total(), 0);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_archive_is_bounded() {
        let store = PendingCallStore::new(2);
        let now = Utc::now();
        for i in 0..3 {
            let mut failed = call(&format!("failed_{}", i)).with_created_at(now - Duration::minutes(15));
            failed.status = CallStatus::Failed;
            store.put(failed).await;
        }
        store.sweep(now, SweepPolicy::default()).await;
        assert_eq!(store.archived().await.len(), 2);
    }

    #[tokio::test]
    async fn test_pending_for_run_ignores_failed_and_other_runs() {
        let store = PendingCallStore::default();
        store.put(call("a")).await;
        let mut failed = call("b");
        failed.status = CallStatus::Failed;
        store.put(failed).await;
        store
            .put(PendingCall::new("c", "thread_1", "run_2", "sales", "lookup", json!({})))
            .await;

        assert_eq!(store.pending_for_run("thread_1", "run_1").await, 1);
        assert_eq!(store.pending_for_run("thread_1", "run_2").await, 1);
        assert_eq!(store.outstanding_for_run("thread_1", "run_1").await, 2);
    }

    #[tokio::test]
    async fn test_remove_where_returns_removed() {
        let store = PendingCallStore::default();
        store.put(call("a")).await;
        store.put(call("b")).await;
        let removed = store.remove_where(|c| c.id == "a").await;
        assert_eq!(removed.len(), 1);
        assert_eq!(store.len().await, 1);
    }
}
