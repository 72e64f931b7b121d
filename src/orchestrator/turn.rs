//! 一次对话回合的输入、阶段与结果

use serde::{Deserialize, Serialize};

use crate::core::{BridgeError, ErrorReport};
use crate::dispatch::DeliveryResult;
use crate::provider::{RunStatus, ToolCallRequest};

/// 用户消息的最大字符数
pub const MAX_MESSAGE_CHARS: usize = 4000;

/// 开始 / 继续一个回合
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnRequest {
    pub message: String,
    pub agent_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
}

impl TurnRequest {
    pub fn new(message: impl Into<String>, agent_id: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            agent_id: agent_id.into(),
            thread_id: None,
        }
    }

    pub fn on_thread(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }

    pub fn validate(&self) -> Result<(), BridgeError> {
        let mut errors = Vec::new();
        let chars = self.message.chars().count();
        if self.message.trim().is_empty() {
            errors.push("message must not be empty".to_string());
        } else if chars > MAX_MESSAGE_CHARS {
            errors.push(format!(
                "message must be at most {} characters, got {}",
                MAX_MESSAGE_CHARS, chars
            ));
        }
        if self.agent_id.trim().is_empty() {
            errors.push("agentId must not be empty".to_string());
        }
        if matches!(&self.thread_id, Some(t) if t.trim().is_empty()) {
            errors.push("threadId must not be empty when provided".to_string());
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(BridgeError::Validation(errors))
        }
    }
}

/// 回合状态机的阶段（日志用）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnPhase {
    NoThread,
    ThreadReady,
    MessageAppended,
    RunStarted,
    Polling,
    Completed,
    RequiresToolExecution,
    Dispatching,
    AwaitingAsyncResults,
    Resuming,
    Busy,
    Failed,
}

impl std::fmt::Display for TurnPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TurnPhase::NoThread => "no_thread",
            TurnPhase::ThreadReady => "thread_ready",
            TurnPhase::MessageAppended => "message_appended",
            TurnPhase::RunStarted => "run_started",
            TurnPhase::Polling => "polling",
            TurnPhase::Completed => "completed",
            TurnPhase::RequiresToolExecution => "requires_tool_execution",
            TurnPhase::Dispatching => "dispatching",
            TurnPhase::AwaitingAsyncResults => "awaiting_async_results",
            TurnPhase::Resuming => "resuming",
            TurnPhase::Busy => "busy",
            TurnPhase::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// 回合结束时对调用方的回答
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum TurnOutcome {
    Completed {
        thread_id: String,
        run_id: String,
        message: String,
    },
    /// Run 暂停等待工具；已派发（或因配置问题未派发）
    RequiresAction {
        thread_id: String,
        run_id: String,
        tool_calls: Vec<ToolCallRequest>,
        dispatch_results: Vec<DeliveryResult>,
        #[serde(skip_serializing_if = "Option::is_none")]
        configuration_error: Option<ErrorReport>,
    },
    /// thread 上已有未结束的 Run，本回合被拒绝
    Busy {
        thread_id: String,
        run_id: String,
        run_status: RunStatus,
        pending_calls: usize,
    },
    /// 已关联的结果在等兄弟调用
    AwaitingToolResults {
        thread_id: String,
        run_id: String,
        remaining: usize,
    },
    /// Run 以失败类终态结束，或轮询超时（unknown）
    Failed {
        thread_id: String,
        run_id: String,
        run_status: RunStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
}

impl TurnOutcome {
    pub fn thread_id(&self) -> &str {
        match self {
            TurnOutcome::Completed { thread_id, .. }
            | TurnOutcome::RequiresAction { thread_id, .. }
            | TurnOutcome::Busy { thread_id, .. }
            | TurnOutcome::AwaitingToolResults { thread_id, .. }
            | TurnOutcome::Failed { thread_id, .. } => thread_id,
        }
    }

    pub fn run_id(&self) -> &str {
        match self {
            TurnOutcome::Completed { run_id, .. }
            | TurnOutcome::RequiresAction { run_id, .. }
            | TurnOutcome::Busy { run_id, .. }
            | TurnOutcome::AwaitingToolResults { run_id, .. }
            | TurnOutcome::Failed { run_id, .. } => run_id,
        }
    }

    pub fn is_busy(&self) -> bool {
        matches!(self, TurnOutcome::Busy { .. })
    }
}
