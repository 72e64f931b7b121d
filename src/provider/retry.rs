//! Provider 分步重试
//!
//! 每个 Provider 调用（建 thread、追加消息、启动 Run、轮询、取消息、提交输出）都包一层小预算重试：
//! 单步超时视为瞬时错误；RunActive / NotFound / Decode / Rejected 不重试，立即上抛。

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::dispatch::backoff::{RetryPolicy, Sleeper, TokioSleeper};
use crate::provider::ProviderError;

/// 步骤名（用于日志）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderStep {
    CreateThread,
    AppendMessage,
    StartRun,
    RetrieveRun,
    CurrentRun,
    LatestMessage,
    SubmitToolOutputs,
}

impl std::fmt::Display for ProviderStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProviderStep::CreateThread => "create_thread",
            ProviderStep::AppendMessage => "append_message",
            ProviderStep::StartRun => "start_run",
            ProviderStep::RetrieveRun => "retrieve_run",
            ProviderStep::CurrentRun => "current_run",
            ProviderStep::LatestMessage => "latest_message",
            ProviderStep::SubmitToolOutputs => "submit_tool_outputs",
        };
        write!(f, "{}", s)
    }
}

/// 分步重试器：预算小于投递重试
#[derive(Clone)]
pub struct ProviderRetry {
    policy: RetryPolicy,
    step_timeout: Duration,
    sleeper: Arc<dyn Sleeper>,
}

impl Default for ProviderRetry {
    fn default() -> Self {
        Self::new(
            RetryPolicy::new(3, Duration::from_millis(500), Duration::from_millis(4000)),
            Duration::from_secs(45),
        )
    }
}

impl ProviderRetry {
    pub fn new(policy: RetryPolicy, step_timeout: Duration) -> Self {
        Self {
            policy: policy.normalized(),
            step_timeout,
            sleeper: Arc::new(TokioSleeper),
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// 执行一步；op 每次尝试重新构造 future
    pub async fn run<T, F, Fut>(&self, step: ProviderStep, mut op: F) -> Result<T, ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut attempt = 1_u32;
        loop {
            let result = match tokio::time::timeout(self.step_timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(ProviderError::Timeout(self.step_timeout.as_secs())),
            };

            match result {
                Ok(value) => return Ok(value),
                Err(error) => {
                    if !error.is_retryable() || !self.policy.has_attempts_left(attempt) {
                        if !error.is_retryable() {
                            tracing::debug!(%step, error = %error, "provider step failed with non-retryable error");
                        }
                        return Err(error);
                    }
                    let delay = self.policy.delay_for_attempt(attempt);
                    tracing::warn!(
                        %step,
                        attempt,
                        max_attempts = self.policy.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "retrying provider step after transient failure"
                    );
                    attempt += 1;
                    self.sleeper.sleep(delay).await;
                }
            }
        }
    }
}
