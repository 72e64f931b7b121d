//! 对话 Provider 抽象
//!
//! 桥接核心只依赖这组能力：建 thread、追加消息、启动 Run、查询 Run、取最新回复、提交工具输出。
//! 具体实现（OpenAI Assistants / Mock）各自处理传输细节，错误统一为 ProviderError。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Provider 调用错误；is_retryable 区分瞬时错误与不可重试错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("Provider transport error: {0}")]
    Transport(String),

    #[error("Provider request timed out after {0}s")]
    Timeout(u64),

    #[error("Provider returned HTTP {status}: {body}")]
    HttpStatus { status: u16, body: String },

    /// thread 上已有活动 Run，重试没有意义，需要调用方等待或处理挂起的工具调用
    #[error("{detail}")]
    RunActive { thread_id: String, detail: String },

    #[error("Provider response could not be decoded: {0}")]
    Decode(String),

    #[error("Provider resource not found: {0}")]
    NotFound(String),

    /// 请求本身被拒（参数、assistant 配置等），重试没有意义
    #[error("Provider rejected the request: {0}")]
    Rejected(String),
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::Transport(_) | ProviderError::Timeout(_) => true,
            ProviderError::HttpStatus { status, .. } => *status == 429 || *status >= 500,
            ProviderError::RunActive { .. }
            | ProviderError::Decode(_)
            | ProviderError::NotFound(_)
            | ProviderError::Rejected(_) => false,
        }
    }
}

/// Run 状态（由 Provider 持有，这里只读）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    InProgress,
    RequiresAction,
    Cancelling,
    Completed,
    Failed,
    Cancelled,
    Expired,
    Incomplete,
    /// 轮询耗尽仍未到达终态或暂停态
    Unknown,
}

impl RunStatus {
    pub fn parse(s: &str) -> Self {
        match s {
            "queued" => RunStatus::Queued,
            "in_progress" => RunStatus::InProgress,
            "requires_action" => RunStatus::RequiresAction,
            "cancelling" => RunStatus::Cancelling,
            "completed" => RunStatus::Completed,
            "failed" => RunStatus::Failed,
            "cancelled" => RunStatus::Cancelled,
            "expired" => RunStatus::Expired,
            "incomplete" => RunStatus::Incomplete,
            _ => RunStatus::Unknown,
        }
    }

    /// 仍在计算中（轮询应继续）
    pub fn is_running(&self) -> bool {
        matches!(self, RunStatus::Queued | RunStatus::InProgress | RunStatus::Cancelling)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed
                | RunStatus::Failed
                | RunStatus::Cancelled
                | RunStatus::Expired
                | RunStatus::Incomplete
        )
    }

    /// 占用 thread 的状态：运行中或等待工具输出
    pub fn is_active(&self) -> bool {
        self.is_running() || *self == RunStatus::RequiresAction
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Queued => "queued",
            RunStatus::InProgress => "in_progress",
            RunStatus::RequiresAction => "requires_action",
            RunStatus::Cancelling => "cancelling",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
            RunStatus::Expired => "expired",
            RunStatus::Incomplete => "incomplete",
            RunStatus::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

/// Run 暂停时请求执行的单个工具调用
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallRequest {
    pub id: String,
    pub function_name: String,
    pub arguments: serde_json::Value,
}

/// Run 的一次状态快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSnapshot {
    pub id: String,
    pub thread_id: String,
    pub status: RunStatus,
    /// 仅 requires_action 时非空
    #[serde(default)]
    pub tool_calls: Vec<ToolCallRequest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl RunSnapshot {
    pub fn new(id: impl Into<String>, thread_id: impl Into<String>, status: RunStatus) -> Self {
        Self {
            id: id.into(),
            thread_id: thread_id.into(),
            status,
            tool_calls: Vec::new(),
            last_error: None,
        }
    }
}

/// 提交给 Provider 的单条工具输出
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolOutput {
    pub tool_call_id: String,
    pub output: String,
}

/// 对话 Provider：所有方法都是一次外部 I/O，可能失败
#[async_trait]
pub trait ConversationProvider: Send + Sync {
    async fn create_thread(&self) -> Result<String, ProviderError>;

    async fn append_message(&self, thread_id: &str, content: &str) -> Result<(), ProviderError>;

    /// 以指定 assistant 配置启动 Run
    async fn start_run(&self, thread_id: &str, assistant_id: &str) -> Result<RunSnapshot, ProviderError>;

    async fn retrieve_run(&self, thread_id: &str, run_id: &str) -> Result<RunSnapshot, ProviderError>;

    /// thread 上最近一次 Run（没有则 None），用于忙碌检测
    async fn current_run(&self, thread_id: &str) -> Result<Option<RunSnapshot>, ProviderError>;

    /// thread 上最新一条 assistant 消息文本
    async fn latest_message(&self, thread_id: &str) -> Result<String, ProviderError>;

    async fn submit_tool_outputs(
        &self,
        thread_id: &str,
        run_id: &str,
        outputs: &[ToolOutput],
    ) -> Result<RunSnapshot, ProviderError>;
}
