//! Mock Provider（用于测试，无需 API）
//!
//! 按脚本推进 Run：每次 start_run / submit_tool_outputs 取下一个 ScriptedStep 作为该 Run 的下一状态。
//! 同时记录每次调用，便于断言「忙碌时没有追加消息 / 没有启动 Run」。

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::provider::{
    ConversationProvider, ProviderError, RunSnapshot, RunStatus, ToolCallRequest, ToolOutput,
};

/// Run 被启动或恢复后进入的状态
#[derive(Debug, Clone)]
pub enum ScriptedStep {
    /// 完成，并产出一条 assistant 回复
    Complete(String),
    /// 暂停，请求执行这些工具调用
    RequireTools(Vec<ToolCallRequest>),
    /// 以终态失败结束
    Fail(String),
    /// 一直停留在 in_progress（用于轮询超时）
    Stall,
}

#[derive(Default)]
struct MockState {
    next_id: u64,
    script: VecDeque<ScriptedStep>,
    runs: HashMap<String, RunSnapshot>,
    latest_run_by_thread: HashMap<String, String>,
    replies: HashMap<String, String>,
    messages: Vec<(String, String)>,
    started_runs: Vec<(String, String)>,
    submitted: Vec<(String, String, Vec<ToolOutput>)>,
    threads_created: usize,
    transient_failures: usize,
    run_active_on_start: bool,
}

/// 脚本化 Provider
#[derive(Default)]
pub struct MockProvider {
    state: Mutex<MockState>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(steps: impl IntoIterator<Item = ScriptedStep>) -> Self {
        let provider = Self::new();
        for step in steps {
            provider.push_step(step);
        }
        provider
    }

    pub fn push_step(&self, step: ScriptedStep) {
        self.lock().script.push_back(step);
    }

    /// 让接下来 n 次调用（任意方法）返回瞬时传输错误
    pub fn fail_next(&self, n: usize) {
        self.lock().transient_failures = n;
    }

    /// start_run 时报告「已有活动 Run」
    pub fn reject_start_with_run_active(&self) {
        self.lock().run_active_on_start = true;
    }

    /// 预置一个已有 Run 的 thread（忙碌检测）
    pub fn seed_run(&self, snapshot: RunSnapshot) {
        let mut state = self.lock();
        state
            .latest_run_by_thread
            .insert(snapshot.thread_id.clone(), snapshot.id.clone());
        state.runs.insert(snapshot.id.clone(), snapshot);
    }

    pub fn threads_created(&self) -> usize {
        self.lock().threads_created
    }

    pub fn appended_messages(&self) -> Vec<(String, String)> {
        self.lock().messages.clone()
    }

    pub fn started_runs(&self) -> Vec<(String, String)> {
        self.lock().started_runs.clone()
    }

    pub fn submitted_outputs(&self) -> Vec<(String, String, Vec<ToolOutput>)> {
        self.lock().submitted.clone()
    }

    pub fn run(&self, run_id: &str) -> Option<RunSnapshot> {
        self.lock().runs.get(run_id).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn take_transient(state: &mut MockState) -> Result<(), ProviderError> {
        if state.transient_failures > 0 {
            state.transient_failures -= 1;
            return Err(ProviderError::Transport("simulated connection reset".into()));
        }
        Ok(())
    }

    fn advance(state: &mut MockState, thread_id: &str, run_id: &str) -> RunSnapshot {
        let step = state.script.pop_front().unwrap_or(ScriptedStep::Complete(String::new()));
        let mut snapshot = RunSnapshot::new(run_id, thread_id, RunStatus::Completed);
        match step {
            ScriptedStep::Complete(reply) => {
                state.replies.insert(thread_id.to_string(), reply);
            }
            ScriptedStep::RequireTools(calls) => {
                snapshot.status = RunStatus::RequiresAction;
                snapshot.tool_calls = calls;
            }
            ScriptedStep::Fail(reason) => {
                snapshot.status = RunStatus::Failed;
                snapshot.last_error = Some(reason);
            }
            ScriptedStep::Stall => {
                snapshot.status = RunStatus::InProgress;
            }
        }
        state.runs.insert(run_id.to_string(), snapshot.clone());
        snapshot
    }
}

#[async_trait]
impl ConversationProvider for MockProvider {
    async fn create_thread(&self) -> Result<String, ProviderError> {
        let mut state = self.lock();
        Self::take_transient(&mut state)?;
        state.next_id += 1;
        state.threads_created += 1;
        Ok(format!("thread_{}", state.next_id))
    }

    async fn append_message(&self, thread_id: &str, content: &str) -> Result<(), ProviderError> {
        let mut state = self.lock();
        Self::take_transient(&mut state)?;
        state.messages.push((thread_id.to_string(), content.to_string()));
        Ok(())
    }

    async fn start_run(&self, thread_id: &str, assistant_id: &str) -> Result<RunSnapshot, ProviderError> {
        let mut state = self.lock();
        Self::take_transient(&mut state)?;
        if state.run_active_on_start {
            return Err(ProviderError::RunActive {
                thread_id: thread_id.to_string(),
                detail: format!("Thread {} already has an active run", thread_id),
            });
        }
        state.next_id += 1;
        let run_id = format!("run_{}", state.next_id);
        state
            .started_runs
            .push((thread_id.to_string(), assistant_id.to_string()));
        state
            .latest_run_by_thread
            .insert(thread_id.to_string(), run_id.clone());
        // 启动后先是 queued，retrieve_run 时才看到脚本状态
        let queued = RunSnapshot::new(&run_id, thread_id, RunStatus::Queued);
        Self::advance(&mut state, thread_id, &run_id);
        Ok(queued)
    }

    async fn retrieve_run(&self, thread_id: &str, run_id: &str) -> Result<RunSnapshot, ProviderError> {
        let mut state = self.lock();
        Self::take_transient(&mut state)?;
        state
            .runs
            .get(run_id)
            .filter(|r| r.thread_id == thread_id)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(format!("run {}", run_id)))
    }

    async fn current_run(&self, thread_id: &str) -> Result<Option<RunSnapshot>, ProviderError> {
        let mut state = self.lock();
        Self::take_transient(&mut state)?;
        Ok(state
            .latest_run_by_thread
            .get(thread_id)
            .and_then(|run_id| state.runs.get(run_id))
            .cloned())
    }

    async fn latest_message(&self, thread_id: &str) -> Result<String, ProviderError> {
        let mut state = self.lock();
        Self::take_transient(&mut state)?;
        Ok(state.replies.get(thread_id).cloned().unwrap_or_default())
    }

    async fn submit_tool_outputs(
        &self,
        thread_id: &str,
        run_id: &str,
        outputs: &[ToolOutput],
    ) -> Result<RunSnapshot, ProviderError> {
        let mut state = self.lock();
        Self::take_transient(&mut state)?;
        let Some(run) = state.runs.get(run_id) else {
            return Err(ProviderError::NotFound(format!("run {}", run_id)));
        };
        if run.status != RunStatus::RequiresAction {
            return Err(ProviderError::HttpStatus {
                status: 400,
                body: format!("Run {} is not waiting for tool outputs", run_id),
            });
        }
        state
            .submitted
            .push((thread_id.to_string(), run_id.to_string(), outputs.to_vec()));
        Ok(Self::advance(&mut state, thread_id, run_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_script_drives_run_states() {
        let provider = MockProvider::with_script([
            ScriptedStep::RequireTools(vec![ToolCallRequest {
                id: "call_1".into(),
                function_name: "lookup".into(),
                arguments: serde_json::json!({"q": "x"}),
            }]),
            ScriptedStep::Complete("done".into()),
        ]);

        let thread = provider.create_thread().await.unwrap();
        let run = provider.start_run(&thread, "asst_1").await.unwrap();
        assert_eq!(run.status, RunStatus::Queued);

        let paused = provider.retrieve_run(&thread, &run.id).await.unwrap();
        assert_eq!(paused.status, RunStatus::RequiresAction);
        assert_eq!(paused.tool_calls.len(), 1);

        let outputs = vec![ToolOutput { tool_call_id: "call_1".into(), output: "ok".into() }];
        let resumed = provider.submit_tool_outputs(&thread, &run.id, &outputs).await.unwrap();
        assert_eq!(resumed.status, RunStatus::Completed);
        assert_eq!(provider.latest_message(&thread).await.unwrap(), "done");
    }

    #[tokio::test]
    async fn test_transient_failures_are_consumed() {
        let provider = MockProvider::new();
        provider.fail_next(1);
        assert!(provider.create_thread().await.is_err());
        assert!(provider.create_thread().await.is_ok());
    }
}
