//! 派发引擎
//!
//! 对 Run 请求的每个工具调用：先写入挂起记录（pending），再带指数退避投递到 agent 的外部端点。
//! 每个调用独立成败，结果以数据返回；只有 agent 无法解析 / 端点不可用时整体失败（且不改存储）。
//! 每次尝试输出结构化审计日志（JSON）。

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::Serialize;
use serde_json::json;

use super::backoff::{RetryPolicy, Sleeper, TokioSleeper};
use super::transport::{DeliveryTransport, TransportError, TransportResponse};
use crate::agents::AgentDirectory;
use crate::core::{BridgeError, ErrorKind};
use crate::provider::ToolCallRequest;
use crate::store::{CallStatus, PendingCall, PendingCallStore};

/// 投递给外部执行端的 JSON 载荷
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryPayload {
    pub id: String,
    pub function_name: String,
    pub arguments: serde_json::Value,
    pub thread_id: String,
    pub run_id: String,
    pub agent_id: String,
    pub timestamp: DateTime<Utc>,
}

impl DeliveryPayload {
    pub fn from_call(call: &PendingCall, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: call.id.clone(),
            function_name: call.function_name.clone(),
            arguments: call.arguments.clone(),
            thread_id: call.thread_id.clone(),
            run_id: call.run_id.clone(),
            agent_id: call.agent_id.clone(),
            timestamp,
        }
    }

    /// 带外元数据（传输层头），执行端可回显或用于幂等
    pub fn headers(&self, attempt: u32, max_attempts: u32) -> Vec<(String, String)> {
        vec![
            ("X-Tool-Call-Id".to_string(), self.id.clone()),
            ("X-Thread-Id".to_string(), self.thread_id.clone()),
            ("X-Run-Id".to_string(), self.run_id.clone()),
            ("X-Agent-Id".to_string(), self.agent_id.clone()),
            ("X-Attempt".to_string(), attempt.to_string()),
            ("X-Max-Attempts".to_string(), max_attempts.to_string()),
        ]
    }
}

/// 单次尝试的结局
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    Success(TransportResponse),
    Retryable(String),
    Terminal(String),
}

/// 一次投递尝试（不持久化，只用于日志与流程判断）
#[derive(Debug, Clone)]
pub struct DeliveryAttempt {
    pub attempt: u32,
    pub endpoint: String,
    /// 失败且可重试时，下一次之前的等待
    pub delay: Option<Duration>,
    pub outcome: AttemptOutcome,
}

/// 单个工具调用的派发结果
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum DeliveryResult {
    Sent {
        call_id: String,
        attempts: u32,
        http_status: u16,
        response: serde_json::Value,
    },
    Error {
        call_id: String,
        attempts: u32,
        kind: ErrorKind,
        reason: String,
    },
}

impl DeliveryResult {
    pub fn call_id(&self) -> &str {
        match self {
            DeliveryResult::Sent { call_id, .. } | DeliveryResult::Error { call_id, .. } => call_id,
        }
    }

    pub fn is_sent(&self) -> bool {
        matches!(self, DeliveryResult::Sent { .. })
    }

    pub fn attempts(&self) -> u32 {
        match self {
            DeliveryResult::Sent { attempts, .. } | DeliveryResult::Error { attempts, .. } => *attempts,
        }
    }
}

/// 端点健康探测结果
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeReport {
    pub agent_id: String,
    pub endpoint: String,
    pub reachable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// 派发引擎：显式构造、依赖注入
pub struct DispatchEngine {
    store: Arc<PendingCallStore>,
    agents: Arc<AgentDirectory>,
    transport: Arc<dyn DeliveryTransport>,
    sleeper: Arc<dyn Sleeper>,
    policy: RetryPolicy,
    timeout: Duration,
}

impl DispatchEngine {
    pub fn new(
        store: Arc<PendingCallStore>,
        agents: Arc<AgentDirectory>,
        transport: Arc<dyn DeliveryTransport>,
        policy: RetryPolicy,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            agents,
            transport,
            sleeper: Arc::new(TokioSleeper),
            policy: policy.normalized(),
            timeout,
        }
    }

    /// 替换等待实现（测试用 RecordingSleeper）
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// 派发一批工具调用；各调用并发、互不影响
    pub async fn dispatch(
        &self,
        tool_calls: &[ToolCallRequest],
        thread_id: &str,
        run_id: &str,
        agent_id: &str,
    ) -> Result<Vec<DeliveryResult>, BridgeError> {
        let agent = self.agents.resolve(agent_id)?;
        let endpoint = agent.require_endpoint()?.to_string();

        tracing::info!(
            thread_id,
            run_id,
            agent_id,
            calls = tool_calls.len(),
            "dispatching tool calls"
        );

        // 整批先落 pending 记录，再并发投递
        let mut calls = Vec::with_capacity(tool_calls.len());
        for request in tool_calls {
            let call = PendingCall::new(
                &request.id,
                thread_id,
                run_id,
                agent_id,
                &request.function_name,
                request.arguments.clone(),
            );
            if let Some(previous) = self.store.put(call.clone()).await {
                tracing::warn!(
                    call_id = %previous.id,
                    previous_run = %previous.run_id,
                    "pending call id reused; overwriting earlier entry"
                );
            }
            calls.push(call);
        }

        let endpoint = endpoint.as_str();
        let deliveries = calls.iter().map(|call| self.send_with_retry(call, endpoint));
        Ok(join_all(deliveries).await)
    }

    /// 重新投递一条 failed 记录，重置重试预算
    ///
    /// 状态检查与重置在同一次写锁内完成，并发重投只有一个生效。
    pub async fn redeliver(&self, call_id: &str) -> Result<DeliveryResult, BridgeError> {
        let not_found = || BridgeError::Validation(vec![format!("No pending call with id '{}'", call_id)]);
        let snapshot = self.store.get(call_id).await.ok_or_else(not_found)?;
        let agent = self.agents.resolve(&snapshot.agent_id)?;
        let endpoint = agent.require_endpoint()?.to_string();

        let reset = self
            .store
            .update(call_id, |c| {
                if c.status != CallStatus::Failed {
                    return Err(c.status);
                }
                c.status = CallStatus::Pending;
                c.retry_count = 0;
                c.last_error = None;
                Ok(c.clone())
            })
            .await
            .ok_or_else(not_found)?
            .map_err(|status| {
                BridgeError::Validation(vec![format!(
                    "Call '{}' is {}; only failed calls can be redelivered",
                    call_id, status
                )])
            })?;

        tracing::info!(call_id, agent_id = %reset.agent_id, "redelivering failed call");
        Ok(self.send_with_retry(&reset, &endpoint).await)
    }

    /// 探测 agent 端点：发送合成载荷，报告可达性与延迟；不触碰存储
    pub async fn probe(&self, agent_id: &str) -> Result<ProbeReport, BridgeError> {
        let agent = self.agents.resolve(agent_id)?;
        let endpoint = agent.require_endpoint()?.to_string();
        let payload = json!({
            "type": "health_check",
            "agentId": agent_id,
            "probeId": uuid::Uuid::new_v4().to_string(),
            "timestamp": Utc::now(),
        });
        let headers = vec![("X-Health-Check".to_string(), "true".to_string())];

        let start = Instant::now();
        let result = self.deliver_once(&endpoint, &payload, &headers).await;
        let latency_ms = start.elapsed().as_millis() as u64;

        let report = match result {
            Ok(response) => ProbeReport {
                agent_id: agent_id.to_string(),
                endpoint,
                reachable: !response.is_failure(),
                http_status: Some(response.status),
                latency_ms,
                error: None,
            },
            Err(e) => ProbeReport {
                agent_id: agent_id.to_string(),
                endpoint,
                reachable: false,
                http_status: None,
                latency_ms,
                error: Some(e.to_string()),
            },
        };
        Ok(report)
    }

    /// 投递一条记录，失败按策略退避重试；耗尽后标记 failed（不删除）
    async fn send_with_retry(&self, call: &PendingCall, endpoint: &str) -> DeliveryResult {
        let payload = DeliveryPayload::from_call(call, Utc::now());
        let body = match serde_json::to_value(&payload) {
            Ok(v) => v,
            Err(e) => {
                return self
                    .mark_failed(call, 0, format!("Payload could not be serialized: {}", e))
                    .await
            }
        };

        let mut attempt = 1_u32;
        loop {
            let headers = payload.headers(attempt, self.policy.max_attempts);
            let start = Instant::now();
            let result = self.deliver_once(endpoint, &body, &headers).await;
            let duration_ms = start.elapsed().as_millis() as u64;

            let delivery = self.classify(attempt, endpoint, result);
            let audit = json!({
                "event": "delivery_audit",
                "call_id": call.id,
                "agent_id": call.agent_id,
                "attempt": delivery.attempt,
                "max_attempts": self.policy.max_attempts,
                "outcome": match &delivery.outcome {
                    AttemptOutcome::Success(_) => "ok",
                    AttemptOutcome::Retryable(_) => "retry",
                    AttemptOutcome::Terminal(_) => "failed",
                },
                "duration_ms": duration_ms,
            });
            tracing::info!(audit = %audit.to_string(), "delivery");

            match delivery.outcome {
                AttemptOutcome::Success(response) => {
                    return DeliveryResult::Sent {
                        call_id: call.id.clone(),
                        attempts: attempt,
                        http_status: response.status,
                        response: response.body,
                    };
                }
                AttemptOutcome::Terminal(reason) => {
                    return self.mark_failed(call, attempt, reason).await;
                }
                AttemptOutcome::Retryable(reason) => {
                    let delay = delivery.delay.unwrap_or_default();
                    let still_pending = self
                        .store
                        .update(&call.id, |c| {
                            c.retry_count = attempt;
                            c.last_error = Some(reason.clone());
                        })
                        .await
                        .is_some();
                    if !still_pending {
                        return abandoned(call, attempt, reason);
                    }
                    tracing::warn!(
                        call_id = %call.id,
                        attempt,
                        max_attempts = self.policy.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %reason,
                        "retrying tool call delivery"
                    );
                    self.sleeper.sleep(delay).await;
                    // 结果可能在退避期间到达
                    if !self.is_still_pending(call).await {
                        return abandoned(call, attempt, reason);
                    }
                    attempt += 1;
                }
            }
        }
    }

    async fn is_still_pending(&self, call: &PendingCall) -> bool {
        self.store
            .get(&call.id)
            .await
            .map(|c| c.run_id == call.run_id && c.status == CallStatus::Pending)
            .unwrap_or(false)
    }

    fn classify(
        &self,
        attempt: u32,
        endpoint: &str,
        result: Result<TransportResponse, TransportError>,
    ) -> DeliveryAttempt {
        let failure = match result {
            Ok(response) if !response.is_failure() => {
                return DeliveryAttempt {
                    attempt,
                    endpoint: endpoint.to_string(),
                    delay: None,
                    outcome: AttemptOutcome::Success(response),
                };
            }
            Ok(response) => format!("Endpoint responded with HTTP {}", response.status),
            Err(e) => e.to_string(),
        };

        if self.policy.has_attempts_left(attempt) {
            DeliveryAttempt {
                attempt,
                endpoint: endpoint.to_string(),
                delay: Some(self.policy.delay_for_attempt(attempt)),
                outcome: AttemptOutcome::Retryable(failure),
            }
        } else {
            DeliveryAttempt {
                attempt,
                endpoint: endpoint.to_string(),
                delay: None,
                outcome: AttemptOutcome::Terminal(failure),
            }
        }
    }

    async fn deliver_once(
        &self,
        endpoint: &str,
        payload: &serde_json::Value,
        headers: &[(String, String)],
    ) -> Result<TransportResponse, TransportError> {
        match tokio::time::timeout(
            self.timeout,
            self.transport.deliver(endpoint, payload, headers, self.timeout),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(self.timeout.as_millis() as u64)),
        }
    }

    async fn mark_failed(&self, call: &PendingCall, attempts: u32, reason: String) -> DeliveryResult {
        self.store
            .update(&call.id, |c| {
                c.status = CallStatus::Failed;
                c.last_error = Some(reason.clone());
            })
            .await;
        let err = BridgeError::Delivery {
            call_id: call.id.clone(),
            attempts,
            reason,
        };
        tracing::error!(
            call_id = %call.id,
            thread_id = %call.thread_id,
            run_id = %call.run_id,
            agent_id = %call.agent_id,
            error = %err,
            "tool call delivery exhausted"
        );
        DeliveryResult::Error {
            call_id: call.id.clone(),
            attempts,
            kind: err.kind(),
            reason: err.to_string(),
        }
    }
}

/// 记录已离开存储（被关联或被清理），停止重试
fn abandoned(call: &PendingCall, attempts: u32, reason: String) -> DeliveryResult {
    tracing::debug!(call_id = %call.id, attempts, "call left the store during delivery; abandoning retries");
    DeliveryResult::Error {
        call_id: call.id.clone(),
        attempts,
        kind: ErrorKind::Delivery,
        reason: format!("{}; call no longer pending, retries abandoned", reason),
    }
}
