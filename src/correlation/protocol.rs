//! 关联协议：入站结果 → 校验 → 匹配挂起记录 → 累积到 Run 的输出批次
//!
//! Provider 只接受一个暂停 Run 的全部工具输出一起提交，所以这里按 (thread, run) 缓冲已关联的输出，
//! 该 Run 在存储里没有未关联的调用时才报告 Ready。取出记录与更新缓冲在同一把锁内完成，
//! 兄弟调用的结果并发到达时只会有一个拿到完整批次。

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;

use super::normalize::{normalize_output, ToolResult};
use crate::agents::AgentDirectory;
use crate::core::BridgeError;
use crate::provider::ToolOutput;
use crate::store::{PendingCallStore, TakeOutcome};

/// 关联到的 agent（挂起记录丢失时为空）
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRef {
    pub id: String,
    pub name: String,
}

/// Run 是否可以恢复
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Resumption {
    /// 该 Run 的全部输出已到齐
    Ready { outputs: Vec<ToolOutput> },
    /// 仍有兄弟调用未回传
    Awaiting { remaining: usize },
}

/// 一次关联的结果
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CorrelatedOutcome {
    pub id: String,
    pub output: String,
    pub thread_id: String,
    pub run_id: String,
    pub agent: Option<AgentRef>,
    /// false 表示降级模式：没有找到挂起记录，未经校验
    pub verified: bool,
    pub processed_at: DateTime<Utc>,
    pub resumption: Resumption,
}

#[derive(Debug, Default)]
struct RunBuffer {
    outputs: Vec<ToolOutput>,
    updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct ProtocolState {
    buffers: HashMap<(String, String), RunBuffer>,
    /// 近期已关联的调用 id → 关联时间，用于拒绝重复结果
    recently_correlated: HashMap<String, DateTime<Utc>>,
}

pub struct CorrelationProtocol {
    store: Arc<PendingCallStore>,
    agents: Arc<AgentDirectory>,
    max_output_chars: usize,
    state: Mutex<ProtocolState>,
}

impl CorrelationProtocol {
    pub fn new(store: Arc<PendingCallStore>, agents: Arc<AgentDirectory>, max_output_chars: usize) -> Self {
        Self {
            store,
            agents,
            max_output_chars,
            state: Mutex::new(ProtocolState::default()),
        }
    }

    /// 关联一个入站结果
    pub async fn correlate(&self, raw: &serde_json::Value) -> Result<CorrelatedOutcome, BridgeError> {
        let result = ToolResult::from_value(raw)?;
        let output = normalize_output(&result.output, self.max_output_chars)?;
        let now = Utc::now();

        let mut state = self.state.lock().await;
        if state.recently_correlated.contains_key(&result.id) {
            tracing::warn!(call_id = %result.id, "duplicate tool result rejected");
            return Err(BridgeError::AlreadyCorrelated(result.id));
        }

        let (agent, verified) = match self
            .store
            .take_matching(&result.id, &result.thread_id, &result.run_id)
            .await
        {
            TakeOutcome::Taken(call) => {
                let agent = self.agents.get(&call.agent_id).map(|a| AgentRef {
                    id: a.id.clone(),
                    name: a.name.clone(),
                });
                tracing::info!(
                    call_id = %call.id,
                    thread_id = %call.thread_id,
                    run_id = %call.run_id,
                    agent_id = %call.agent_id,
                    "tool result correlated"
                );
                (agent, true)
            }
            TakeOutcome::Mismatch(stored) => {
                let err = BridgeError::Correlation {
                    call_id: stored.id.clone(),
                    expected_thread: stored.thread_id.clone(),
                    expected_run: stored.run_id.clone(),
                    got_thread: result.thread_id.clone(),
                    got_run: result.run_id.clone(),
                };
                tracing::error!(
                    call_id = %stored.id,
                    agent_id = %stored.agent_id,
                    error = %err,
                    "tool result does not belong to the stored run; rejected"
                );
                return Err(err);
            }
            TakeOutcome::NotFound => {
                tracing::warn!(
                    call_id = %result.id,
                    thread_id = %result.thread_id,
                    run_id = %result.run_id,
                    "no pending call for tool result; processing in degraded mode"
                );
                (None, false)
            }
        };

        state.recently_correlated.insert(result.id.clone(), now);

        let key = (result.thread_id.clone(), result.run_id.clone());
        let buffer = state.buffers.entry(key.clone()).or_default();
        buffer.outputs.retain(|o| o.tool_call_id != result.id);
        buffer.outputs.push(ToolOutput {
            tool_call_id: result.id.clone(),
            output: output.clone(),
        });
        buffer.updated_at = Some(now);

        let remaining = self
            .store
            .outstanding_for_run(&result.thread_id, &result.run_id)
            .await;
        let resumption = if remaining == 0 {
            let outputs = state
                .buffers
                .remove(&key)
                .map(|b| b.outputs)
                .unwrap_or_default();
            Resumption::Ready { outputs }
        } else {
            tracing::debug!(
                thread_id = %result.thread_id,
                run_id = %result.run_id,
                remaining,
                "buffering tool output until sibling calls report back"
            );
            Resumption::Awaiting { remaining }
        };

        Ok(CorrelatedOutcome {
            id: result.id,
            output,
            thread_id: result.thread_id,
            run_id: result.run_id,
            agent,
            verified,
            processed_at: now,
            resumption,
        })
    }

    /// 提交失败时把批次放回缓冲；这些调用的结果可以重新回传以再次触发提交
    pub async fn restore(&self, thread_id: &str, run_id: &str, outputs: Vec<ToolOutput>) {
        let mut state = self.state.lock().await;
        for output in &outputs {
            state.recently_correlated.remove(&output.tool_call_id);
        }
        let buffer = state
            .buffers
            .entry((thread_id.to_string(), run_id.to_string()))
            .or_default();
        for output in outputs {
            if !buffer.outputs.iter().any(|o| o.tool_call_id == output.tool_call_id) {
                buffer.outputs.push(output);
            }
        }
        buffer.updated_at = Some(Utc::now());
    }

    /// 某个 Run 已缓冲的输出数
    pub async fn buffered(&self, thread_id: &str, run_id: &str) -> usize {
        self.state
            .lock()
            .await
            .buffers
            .get(&(thread_id.to_string(), run_id.to_string()))
            .map(|b| b.outputs.len())
            .unwrap_or(0)
    }

    /// 丢弃早于 cutoff 的缓冲与重复检测记录，返回丢弃的缓冲数
    pub async fn prune(&self, cutoff: DateTime<Utc>) -> usize {
        let mut state = self.state.lock().await;
        state.recently_correlated.retain(|_, at| *at >= cutoff);
        let before = state.buffers.len();
        state
            .buffers
            .retain(|_, b| b.updated_at.map(|at| at >= cutoff).unwrap_or(false));
        before - state.buffers.len()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::agents::AgentProfile;
    use crate::store::PendingCall;

    fn protocol(store: &Arc<PendingCallStore>) -> CorrelationProtocol {
        let agents = AgentDirectory::new([
            AgentProfile::new("sales", "asst_sales", Some("https://hooks.internal/sales")).with_name("Sales Rep"),
        ]);
        CorrelationProtocol::new(Arc::clone(store), Arc::new(agents), 100_000)
    }

    fn pending(id: &str) -> PendingCall {
        PendingCall::new(id, "thread_1", "run_1", "sales", "lookup", json!({}))
    }

    fn result(id: &str, thread: &str, run: &str) -> serde_json::Value {
        json!({"id": id, "output": {"rows": 3}, "threadId": thread, "runId": run})
    }

    #[tokio::test]
    async fn test_match_removes_entry_and_is_ready() {
        let store = Arc::new(PendingCallStore::default());
        store.put(pending("call_1")).await;
        let protocol = protocol(&store);

        let outcome = protocol.correlate(&result("call_1", "thread_1", "run_1")).await.unwrap();
        assert!(outcome.verified);
        assert_eq!(outcome.agent.as_ref().map(|a| a.name.as_str()), Some("Sales Rep"));
        assert_eq!(outcome.output, "{\n  \"rows\": 3\n}");
        match outcome.resumption {
            Resumption::Ready { outputs } => {
                assert_eq!(outputs.len(), 1);
                assert_eq!(outputs[0].tool_call_id, "call_1");
            }
            other => panic!("Expected Ready, got {:?}", other),
        }
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_mismatch_rejected_without_mutation() {
        let store = Arc::new(PendingCallStore::default());
        store.put(pending("call_1")).await;
        let protocol = protocol(&store);
        let before = store.list_all().await;

        for (thread, run) in [("thread_2", "run_1"), ("thread_1", "run_9"), ("thread_1 ", " run_1")] {
            let err = protocol.correlate(&result("call_1", thread, run)).await.unwrap_err();
            assert!(matches!(err, BridgeError::Correlation { .. }));
        }
        assert_eq!(store.list_all().await, before);
        assert_eq!(protocol.buffered("thread_2", "run_1").await, 0);
    }

    #[tokio::test]
    async fn test_concurrent_correlate_only_one_wins() {
        let store = Arc::new(PendingCallStore::default());
        store.put(pending("call_1")).await;
        let protocol = protocol(&store);
        let payload = result("call_1", "thread_1", "run_1");

        let (a, b) = tokio::join!(protocol.correlate(&payload), protocol.correlate(&payload));
        let wins = [&a, &b].iter().filter(|r| r.is_ok()).count();
        assert_eq!(wins, 1);
        let loser = if a.is_err() { a } else { b };
        assert!(matches!(loser, Err(BridgeError::AlreadyCorrelated(_))));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_missing_entry_runs_in_degraded_mode() {
        let store = Arc::new(PendingCallStore::default());
        let protocol = protocol(&store);

        let outcome = protocol.correlate(&result("call_x", "thread_1", "run_1")).await.unwrap();
        assert!(!outcome.verified);
        assert!(outcome.agent.is_none());
        assert!(matches!(outcome.resumption, Resumption::Ready { .. }));
    }

    #[tokio::test]
    async fn test_siblings_are_buffered_until_complete() {
        let store = Arc::new(PendingCallStore::default());
        store.put(pending("call_a")).await;
        store.put(pending("call_b")).await;
        let protocol = protocol(&store);

        let first = protocol.correlate(&result("call_a", "thread_1", "run_1")).await.unwrap();
        assert_eq!(first.resumption, Resumption::Awaiting { remaining: 1 });
        assert_eq!(protocol.buffered("thread_1", "run_1").await, 1);

        let second = protocol.correlate(&result("call_b", "thread_1", "run_1")).await.unwrap();
        let Resumption::Ready { outputs } = second.resumption else {
            panic!("Expected Ready");
        };
        let mut ids: Vec<_> = outputs.iter().map(|o| o.tool_call_id.as_str()).collect();
        ids.sort();
        assert_eq!(ids, vec!["call_a", "call_b"]);
        assert_eq!(protocol.buffered("thread_1", "run_1").await, 0);
    }

    #[tokio::test]
    async fn test_invalid_payload_does_not_touch_store() {
        let store = Arc::new(PendingCallStore::default());
        store.put(pending("call_1")).await;
        let protocol = protocol(&store);

        let err = protocol
            .correlate(&json!({"id": "call_1", "output": "  ", "threadId": "thread_1", "runId": "run_1"}))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Processing(_)));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_restore_and_prune() {
        let store = Arc::new(PendingCallStore::default());
        let protocol = protocol(&store);
        let output = ToolOutput {
            tool_call_id: "call_1".into(),
            output: "done".into(),
        };
        protocol.restore("thread_1", "run_1", vec![output.clone(), output]).await;
        assert_eq!(protocol.buffered("thread_1", "run_1").await, 1);

        // 放回后允许执行端重新回传同一结果
        let again = protocol.correlate(&result("call_1", "thread_1", "run_1")).await.unwrap();
        let Resumption::Ready { outputs } = again.resumption else {
            panic!("Expected Ready");
        };
        assert_eq!(outputs.len(), 1);
        protocol.restore("thread_1", "run_1", outputs).await;

        let dropped = protocol.prune(Utc::now() + chrono::Duration::seconds(1)).await;
        assert_eq!(dropped, 1);
        assert_eq!(protocol.buffered("thread_1", "run_1").await, 0);
    }
}
