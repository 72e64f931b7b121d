//! Run 生命周期编排
//!
//! 每个回合：确认 thread 空闲 → 追加消息 → 启动 Run → 轮询 → 按结果分支（完成 / 需要工具）。
//! 需要工具时交给派发引擎后本次调用即结束；结果回传并关联后由 `resume` 提交输出、再次轮询并重复同样的分支。
//! 每个 Provider 步骤都经过 ProviderRetry；「thread 已有活动 Run」不重试、直接上报。

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use super::turn::{TurnOutcome, TurnPhase, TurnRequest};
use crate::agents::AgentDirectory;
use crate::core::{BridgeError, ErrorContext, ErrorReport};
use crate::correlation::{CorrelatedOutcome, CorrelationProtocol, Resumption};
use crate::dispatch::{DispatchEngine, Sleeper, TokioSleeper};
use crate::provider::{
    ConversationProvider, ProviderError, ProviderRetry, ProviderStep, RunSnapshot, RunStatus,
};
use crate::store::PendingCallStore;

/// 轮询参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(1000),
            timeout: Duration::from_secs(60),
        }
    }
}

impl PollSettings {
    /// 轮询次数上限；与墙钟截止时间同时生效
    fn max_polls(&self) -> u64 {
        let interval_ms = self.interval.as_millis().max(1);
        let polls = self.timeout.as_millis().div_ceil(interval_ms);
        u64::try_from(polls).unwrap_or(u64::MAX).max(1)
    }
}

/// 本进程内正在处理回合的 thread
#[derive(Debug, Default)]
struct ThreadClaims {
    threads: Mutex<HashSet<String>>,
}

impl ThreadClaims {
    /// 同一 thread 同时只发放一个占用；已被占用时返回 None
    fn try_claim(&self, thread_id: &str) -> Option<ThreadClaim<'_>> {
        let mut threads = self.threads.lock().unwrap_or_else(|e| e.into_inner());
        if !threads.insert(thread_id.to_string()) {
            return None;
        }
        Some(ThreadClaim {
            claims: self,
            thread_id: thread_id.to_string(),
        })
    }
}

/// 回合结束（含提前返回）时释放
struct ThreadClaim<'a> {
    claims: &'a ThreadClaims,
    thread_id: String,
}

impl Drop for ThreadClaim<'_> {
    fn drop(&mut self) {
        self.claims
            .threads
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.thread_id);
    }
}

/// 回合编排器
pub struct Orchestrator {
    provider: Arc<dyn ConversationProvider>,
    retry: ProviderRetry,
    dispatch: Arc<DispatchEngine>,
    correlation: Arc<CorrelationProtocol>,
    store: Arc<PendingCallStore>,
    agents: Arc<AgentDirectory>,
    poll: PollSettings,
    sleeper: Arc<dyn Sleeper>,
    claims: ThreadClaims,
}

impl Orchestrator {
    pub fn new(
        provider: Arc<dyn ConversationProvider>,
        dispatch: Arc<DispatchEngine>,
        correlation: Arc<CorrelationProtocol>,
        store: Arc<PendingCallStore>,
        agents: Arc<AgentDirectory>,
    ) -> Self {
        Self {
            provider,
            retry: ProviderRetry::default(),
            dispatch,
            correlation,
            store,
            agents,
            poll: PollSettings::default(),
            sleeper: Arc::new(TokioSleeper),
            claims: ThreadClaims::default(),
        }
    }

    pub fn with_retry(mut self, retry: ProviderRetry) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_poll(mut self, poll: PollSettings) -> Self {
        self.poll = poll;
        self
    }

    /// 轮询间隔的等待实现（测试中替换为 RecordingSleeper）
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn dispatch(&self) -> &Arc<DispatchEngine> {
        &self.dispatch
    }

    pub fn store(&self) -> &Arc<PendingCallStore> {
        &self.store
    }

    pub fn agents(&self) -> &Arc<AgentDirectory> {
        &self.agents
    }

    /// 处理一个用户回合
    pub async fn handle_turn(&self, request: TurnRequest) -> Result<TurnOutcome, ErrorReport> {
        let mut ctx = ErrorContext::new().with_agent(&request.agent_id);
        if let Some(thread_id) = &request.thread_id {
            ctx = ctx.with_thread(thread_id);
        }

        request.validate().map_err(|e| e.report(ctx.clone()))?;
        let assistant_id = self
            .agents
            .resolve(&request.agent_id)
            .map_err(|e| e.report(ctx.clone()))?
            .assistant_id
            .clone();

        let p = self.provider.as_ref();
        // 同一 thread 上另一个回合尚未结束：不查询也不改动 Provider
        let _claim = match &request.thread_id {
            Some(thread_id) => Some(
                self.claims
                    .try_claim(thread_id)
                    .ok_or_else(|| turn_in_flight(thread_id).report(ctx.clone()))?,
            ),
            None => None,
        };
        let thread_id = match &request.thread_id {
            Some(thread_id) => {
                if let Some(busy) = self.check_busy(thread_id).await.map_err(|e| e.report(ctx.clone()))? {
                    return Ok(busy);
                }
                thread_id.clone()
            }
            None => {
                phase(TurnPhase::NoThread, None, None);
                self.retry
                    .run(ProviderStep::CreateThread, move || p.create_thread())
                    .await
                    .map_err(|e| BridgeError::from(e).report(ctx.clone()))?
            }
        };
        let ctx = ctx.with_thread(&thread_id);
        phase(TurnPhase::ThreadReady, Some(&thread_id), None);

        let t = thread_id.as_str();
        let message = request.message.as_str();
        self.retry
            .run(ProviderStep::AppendMessage, move || p.append_message(t, message))
            .await
            .map_err(|e| BridgeError::from(e).report(ctx.clone()))?;
        phase(TurnPhase::MessageAppended, Some(t), None);

        let a = assistant_id.as_str();
        let run = self
            .retry
            .run(ProviderStep::StartRun, move || p.start_run(t, a))
            .await
            .map_err(|e| BridgeError::from(e).report(ctx.clone()))?;
        let ctx = ctx.with_run(&run.id);
        phase(TurnPhase::RunStarted, Some(t), Some(&run.id));

        let run = self.poll_run(run).await.map_err(|e| e.report(ctx.clone()))?;
        self.settle(run, Some(&request.agent_id))
            .await
            .map_err(|e| e.report(ctx))
    }

    /// 关联一个入站工具结果并推进对应 Run
    pub async fn submit_tool_result(&self, raw: &serde_json::Value) -> Result<TurnOutcome, ErrorReport> {
        let ctx = context_from_raw(raw);
        let outcome = self
            .correlation
            .correlate(raw)
            .await
            .map_err(|e| e.report(ctx))?;
        self.resume(outcome).await
    }

    /// 批次到齐后提交输出，轮询到下一个终态 / 暂停态并再次分支
    pub async fn resume(&self, outcome: CorrelatedOutcome) -> Result<TurnOutcome, ErrorReport> {
        let agent_id = outcome
            .agent
            .as_ref()
            .map(|a| a.id.clone())
            .or_else(|| self.agents.default_agent().map(|a| a.id.clone()));
        let mut ctx = ErrorContext::new()
            .with_thread(&outcome.thread_id)
            .with_run(&outcome.run_id)
            .with_call(&outcome.id);
        if let Some(agent_id) = &agent_id {
            ctx = ctx.with_agent(agent_id);
        }

        let outputs = match outcome.resumption {
            Resumption::Awaiting { remaining } => {
                phase(
                    TurnPhase::AwaitingAsyncResults,
                    Some(&outcome.thread_id),
                    Some(&outcome.run_id),
                );
                return Ok(TurnOutcome::AwaitingToolResults {
                    thread_id: outcome.thread_id,
                    run_id: outcome.run_id,
                    remaining,
                });
            }
            Resumption::Ready { outputs } => outputs,
        };

        phase(TurnPhase::Resuming, Some(&outcome.thread_id), Some(&outcome.run_id));
        let p = self.provider.as_ref();
        let (t, r, batch) = (
            outcome.thread_id.as_str(),
            outcome.run_id.as_str(),
            outputs.as_slice(),
        );
        let run = match self
            .retry
            .run(ProviderStep::SubmitToolOutputs, move || p.submit_tool_outputs(t, r, batch))
            .await
        {
            Ok(run) => run,
            Err(e) => {
                tracing::error!(thread_id = t, run_id = r, error = %e, "submitting tool outputs failed; batch kept for retry");
                self.correlation.restore(t, r, outputs.clone()).await;
                return Err(BridgeError::from(e).report(ctx));
            }
        };

        let run = self.poll_run(run).await.map_err(|e| e.report(ctx.clone()))?;
        self.settle(run, agent_id.as_deref())
            .await
            .map_err(|e| e.report(ctx))
    }

    /// thread 上有未结束的 Run 时返回 Busy
    async fn check_busy(&self, thread_id: &str) -> Result<Option<TurnOutcome>, BridgeError> {
        let p = self.provider.as_ref();
        let current = self
            .retry
            .run(ProviderStep::CurrentRun, move || p.current_run(thread_id))
            .await?;
        let Some(run) = current.filter(|r| r.status.is_active()) else {
            return Ok(None);
        };
        let pending_calls = if run.status == RunStatus::RequiresAction {
            self.store.pending_for_run(thread_id, &run.id).await
        } else {
            0
        };
        phase(TurnPhase::Busy, Some(thread_id), Some(&run.id));
        tracing::info!(thread_id, run_id = %run.id, status = %run.status, pending_calls, "thread is busy; turn refused");
        Ok(Some(TurnOutcome::Busy {
            thread_id: thread_id.to_string(),
            run_id: run.id,
            run_status: run.status,
            pending_calls,
        }))
    }

    /// 轮询直到离开 queued / in_progress / cancelling，或超时（→ unknown）
    async fn poll_run(&self, run: RunSnapshot) -> Result<RunSnapshot, BridgeError> {
        phase(TurnPhase::Polling, Some(&run.thread_id), Some(&run.id));
        let deadline = Instant::now() + self.poll.timeout;
        let max_polls = self.poll.max_polls();
        let mut polls = 0_u64;
        let mut current = run;

        while current.status.is_running() {
            if polls >= max_polls || Instant::now() >= deadline {
                tracing::warn!(
                    thread_id = %current.thread_id,
                    run_id = %current.id,
                    last_status = %current.status,
                    polls,
                    "run did not settle before poll timeout"
                );
                current.status = RunStatus::Unknown;
                return Ok(current);
            }
            self.sleeper.sleep(self.poll.interval).await;
            polls += 1;

            let p = self.provider.as_ref();
            let (thread_id, run_id) = (current.thread_id.clone(), current.id.clone());
            let (t, r) = (thread_id.as_str(), run_id.as_str());
            current = self
                .retry
                .run(ProviderStep::RetrieveRun, move || p.retrieve_run(t, r))
                .await?;
        }
        Ok(current)
    }

    /// 按 Run 状态分支
    async fn settle(&self, run: RunSnapshot, agent_id: Option<&str>) -> Result<TurnOutcome, BridgeError> {
        let p = self.provider.as_ref();
        match run.status {
            RunStatus::Completed => {
                let t = run.thread_id.as_str();
                let message = self
                    .retry
                    .run(ProviderStep::LatestMessage, move || p.latest_message(t))
                    .await?;
                phase(TurnPhase::Completed, Some(&run.thread_id), Some(&run.id));
                Ok(TurnOutcome::Completed {
                    thread_id: run.thread_id,
                    run_id: run.id,
                    message,
                })
            }
            RunStatus::RequiresAction => {
                phase(TurnPhase::RequiresToolExecution, Some(&run.thread_id), Some(&run.id));
                self.dispatch_tools(run, agent_id).await
            }
            status => {
                phase(TurnPhase::Failed, Some(&run.thread_id), Some(&run.id));
                tracing::warn!(
                    thread_id = %run.thread_id,
                    run_id = %run.id,
                    %status,
                    error = run.last_error.as_deref().unwrap_or(""),
                    "run ended without a reply"
                );
                Ok(TurnOutcome::Failed {
                    thread_id: run.thread_id,
                    run_id: run.id,
                    run_status: status,
                    detail: run.last_error,
                })
            }
        }
    }

    /// 派发工具调用；agent 没有可用端点时不派发，但仍把工具调用交给调用方
    async fn dispatch_tools(&self, run: RunSnapshot, agent_id: Option<&str>) -> Result<TurnOutcome, BridgeError> {
        let mut ctx = ErrorContext::new().with_thread(&run.thread_id).with_run(&run.id);
        let ready = match agent_id {
            None => Err(BridgeError::Configuration(
                "No agent context for this run; set default_agent to resume runs whose pending calls were lost"
                    .to_string(),
            )),
            Some(agent_id) => {
                ctx = ctx.with_agent(agent_id);
                self.agents
                    .resolve(agent_id)
                    .and_then(|agent| agent.require_endpoint().map(|_| agent_id))
            }
        };

        let dispatched = match ready {
            Ok(agent_id) => {
                phase(TurnPhase::Dispatching, Some(&run.thread_id), Some(&run.id));
                self.dispatch
                    .dispatch(&run.tool_calls, &run.thread_id, &run.id, agent_id)
                    .await
            }
            Err(e) => Err(e),
        };

        let (dispatch_results, configuration_error) = match dispatched {
            Ok(results) => (results, None),
            Err(e) => {
                tracing::error!(
                    thread_id = %run.thread_id,
                    run_id = %run.id,
                    error = %e,
                    tool_calls = run.tool_calls.len(),
                    "tool calls not dispatched"
                );
                (Vec::new(), Some(e.report(ctx)))
            }
        };

        phase(TurnPhase::AwaitingAsyncResults, Some(&run.thread_id), Some(&run.id));
        Ok(TurnOutcome::RequiresAction {
            thread_id: run.thread_id,
            run_id: run.id,
            tool_calls: run.tool_calls,
            dispatch_results,
            configuration_error,
        })
    }
}

fn turn_in_flight(thread_id: &str) -> BridgeError {
    tracing::info!(thread_id, "another turn is in flight on this thread; turn refused");
    BridgeError::Provider(ProviderError::RunActive {
        thread_id: thread_id.to_string(),
        detail: format!(
            "Thread {} already has a turn in progress. Wait for it to settle before sending another message.",
            thread_id
        ),
    })
}

fn phase(phase: TurnPhase, thread_id: Option<&str>, run_id: Option<&str>) {
    tracing::debug!(
        %phase,
        thread_id = thread_id.unwrap_or(""),
        run_id = run_id.unwrap_or(""),
        "turn phase"
    );
}

/// 从未校验的载荷里尽量取出关联上下文
fn context_from_raw(raw: &serde_json::Value) -> ErrorContext {
    let field = |name: &str| raw.get(name).and_then(|v| v.as_str()).map(String::from);
    ErrorContext {
        thread_id: field("threadId"),
        run_id: field("runId"),
        call_id: field("id"),
        agent_id: None,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::agents::AgentProfile;
    use crate::core::ErrorKind;
    use crate::dispatch::{MockTransport, RecordingSleeper, RetryPolicy};
    use crate::provider::{MockProvider, ScriptedStep, ToolCallRequest};

    struct Harness {
        provider: Arc<MockProvider>,
        transport: Arc<MockTransport>,
        store: Arc<PendingCallStore>,
        orchestrator: Orchestrator,
    }

    fn harness(provider: MockProvider) -> Harness {
        let provider = Arc::new(provider);
        let transport = Arc::new(MockTransport::new());
        let store = Arc::new(PendingCallStore::default());
        let sleeper = Arc::new(RecordingSleeper::new());
        let agents = Arc::new(
            AgentDirectory::new([
                AgentProfile::new("sales", "asst_sales", Some("https://hooks.internal/sales")),
                AgentProfile::new("draft", "asst_draft", Some("https://your-n8n-host/webhook")),
            ])
            .with_default("sales"),
        );
        let dispatch = Arc::new(
            DispatchEngine::new(
                Arc::clone(&store),
                Arc::clone(&agents),
                transport.clone(),
                RetryPolicy::default(),
                Duration::from_secs(5),
            )
            .with_sleeper(sleeper.clone()),
        );
        let correlation = Arc::new(CorrelationProtocol::new(Arc::clone(&store), Arc::clone(&agents), 100_000));
        let orchestrator = Orchestrator::new(
            provider.clone(),
            dispatch,
            correlation,
            Arc::clone(&store),
            agents,
        )
        .with_retry(ProviderRetry::default().with_sleeper(sleeper.clone()))
        .with_poll(PollSettings {
            interval: Duration::from_millis(10),
            timeout: Duration::from_millis(50),
        })
        .with_sleeper(sleeper);
        Harness {
            provider,
            transport,
            store,
            orchestrator,
        }
    }

    fn tool_call(id: &str) -> ToolCallRequest {
        ToolCallRequest {
            id: id.to_string(),
            function_name: "lookup_customer".to_string(),
            arguments: json!({"email": "a@b.c"}),
        }
    }

    #[tokio::test]
    async fn test_completed_turn_returns_reply() {
        let h = harness(MockProvider::with_script([ScriptedStep::Complete("pong".into())]));
        let outcome = h
            .orchestrator
            .handle_turn(TurnRequest::new("ping", "sales"))
            .await
            .unwrap();
        match outcome {
            TurnOutcome::Completed { message, .. } => assert_eq!(message, "pong"),
            other => panic!("Expected Completed, got {:?}", other),
        }
        assert_eq!(h.provider.threads_created(), 1);
        assert!(h.store.is_empty().await);
    }

    #[tokio::test]
    async fn test_busy_thread_is_refused_without_mutation() {
        let h = harness(MockProvider::new());
        let mut run = RunSnapshot::new("run_busy", "thread_busy", RunStatus::RequiresAction);
        run.tool_calls = vec![tool_call("call_1")];
        h.provider.seed_run(run);
        h.store
            .put(crate::store::PendingCall::new(
                "call_1",
                "thread_busy",
                "run_busy",
                "sales",
                "lookup_customer",
                json!({}),
            ))
            .await;

        let outcome = h
            .orchestrator
            .handle_turn(TurnRequest::new("hello again", "sales").on_thread("thread_busy"))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            TurnOutcome::Busy {
                thread_id: "thread_busy".into(),
                run_id: "run_busy".into(),
                run_status: RunStatus::RequiresAction,
                pending_calls: 1,
            }
        );
        assert!(h.provider.appended_messages().is_empty());
        assert!(h.provider.started_runs().is_empty());
    }

    #[tokio::test]
    async fn test_turn_in_flight_on_same_thread_is_refused() {
        let h = harness(MockProvider::with_script([ScriptedStep::Complete("later".into())]));
        let held = h.orchestrator.claims.try_claim("thread_7").unwrap();
        assert!(h.orchestrator.claims.try_claim("thread_7").is_none());

        let report = h
            .orchestrator
            .handle_turn(TurnRequest::new("second message", "sales").on_thread("thread_7"))
            .await
            .unwrap_err();
        assert_eq!(report.kind, ErrorKind::RunActive);
        assert_eq!(report.context.thread_id.as_deref(), Some("thread_7"));
        assert!(h.provider.appended_messages().is_empty());
        assert!(h.provider.started_runs().is_empty());

        drop(held);
        let outcome = h
            .orchestrator
            .handle_turn(TurnRequest::new("second message", "sales").on_thread("thread_7"))
            .await
            .unwrap();
        assert!(matches!(outcome, TurnOutcome::Completed { .. }));
        assert_eq!(h.provider.appended_messages().len(), 1);
        // 回合结束后占用已释放
        assert!(h.orchestrator.claims.try_claim("thread_7").is_some());
    }

    #[tokio::test]
    async fn test_placeholder_endpoint_surfaces_tool_calls() {
        let h = harness(MockProvider::with_script([ScriptedStep::RequireTools(vec![tool_call("call_1")])]));
        let outcome = h
            .orchestrator
            .handle_turn(TurnRequest::new("draft a reply", "draft"))
            .await
            .unwrap();
        match outcome {
            TurnOutcome::RequiresAction {
                tool_calls,
                dispatch_results,
                configuration_error,
                ..
            } => {
                assert_eq!(tool_calls.len(), 1);
                assert!(dispatch_results.is_empty());
                assert_eq!(configuration_error.map(|r| r.kind), Some(ErrorKind::Configuration));
            }
            other => panic!("Expected RequiresAction, got {:?}", other),
        }
        assert!(h.store.is_empty().await);
        assert!(h.transport.deliveries().is_empty());
    }

    #[tokio::test]
    async fn test_run_active_is_surfaced_immediately() {
        let provider = MockProvider::new();
        provider.reject_start_with_run_active();
        let h = harness(provider);
        let report = h
            .orchestrator
            .handle_turn(TurnRequest::new("ping", "sales"))
            .await
            .unwrap_err();
        assert_eq!(report.kind, ErrorKind::RunActive);
        assert!(report.context.thread_id.is_some());
        assert_eq!(h.provider.started_runs().len(), 0);
    }

    #[tokio::test]
    async fn test_transient_provider_errors_are_retried() {
        let provider = MockProvider::with_script([ScriptedStep::Complete("ok".into())]);
        provider.fail_next(2);
        let h = harness(provider);
        let outcome = h
            .orchestrator
            .handle_turn(TurnRequest::new("ping", "sales"))
            .await
            .unwrap();
        assert!(matches!(outcome, TurnOutcome::Completed { .. }));
    }

    #[tokio::test]
    async fn test_stalled_run_reports_unknown() {
        let h = harness(MockProvider::with_script([ScriptedStep::Stall]));
        let outcome = h
            .orchestrator
            .handle_turn(TurnRequest::new("ping", "sales"))
            .await
            .unwrap();
        match outcome {
            TurnOutcome::Failed { run_status, .. } => assert_eq!(run_status, RunStatus::Unknown),
            other => panic!("Expected Failed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_agent_is_configuration_error() {
        let h = harness(MockProvider::new());
        let report = h
            .orchestrator
            .handle_turn(TurnRequest::new("ping", "ghost"))
            .await
            .unwrap_err();
        assert_eq!(report.kind, ErrorKind::Configuration);
        assert_eq!(h.provider.threads_created(), 0);
    }

    #[tokio::test]
    async fn test_failed_submission_keeps_batch() {
        let h = harness(MockProvider::with_script([ScriptedStep::RequireTools(vec![tool_call("call_1")])]));
        let outcome = h
            .orchestrator
            .handle_turn(TurnRequest::new("look it up", "sales"))
            .await
            .unwrap();
        let (thread_id, run_id) = (outcome.thread_id().to_string(), outcome.run_id().to_string());

        h.provider.fail_next(10);
        let report = h
            .orchestrator
            .submit_tool_result(&json!({"id": "call_1", "output": "found", "threadId": thread_id, "runId": run_id}))
            .await
            .unwrap_err();
        assert_eq!(report.kind, ErrorKind::Provider);
        assert_eq!(report.context.call_id.as_deref(), Some("call_1"));
        assert_eq!(h.orchestrator.correlation.buffered(&thread_id, &run_id).await, 1);
    }
}
