//! 桥接层错误分类与对外错误报告
//!
//! BridgeError 覆盖配置、校验、关联、投递、Provider、输出处理六类；
//! 对外（HTTP / 调用方）统一转为 ErrorReport：机器可区分的 kind + 人类可读 detail + 关联上下文。

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::provider::ProviderError;

/// 桥接过程中可能出现的错误
#[derive(Error, Debug)]
pub enum BridgeError {
    /// agent 无法解析或投递端点不可用（占位符）
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// 入站载荷不合法；收集全部问题而非只报第一个
    #[error("Validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    /// thread/run 与挂起记录不一致，可能是误投或重放
    #[error(
        "Correlation mismatch for call {call_id}: expected thread {expected_thread} / run {expected_run}, got thread {got_thread} / run {got_run}"
    )]
    Correlation {
        call_id: String,
        expected_thread: String,
        expected_run: String,
        got_thread: String,
        got_run: String,
    },

    /// 同一调用的结果重复到达（已被关联并恢复过）
    #[error("Result for call {0} was already correlated")]
    AlreadyCorrelated(String),

    #[error("Delivery of call {call_id} failed after {attempts} attempt(s): {reason}")]
    Delivery {
        call_id: String,
        attempts: u32,
        reason: String,
    },

    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// 输出归一化后为空等不可用情况
    #[error("Processing error: {0}")]
    Processing(String),
}

impl BridgeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BridgeError::Configuration(_) => ErrorKind::Configuration,
            BridgeError::Validation(_) => ErrorKind::Validation,
            BridgeError::Correlation { .. } | BridgeError::AlreadyCorrelated(_) => ErrorKind::Correlation,
            BridgeError::Delivery { .. } => ErrorKind::Delivery,
            BridgeError::Provider(ProviderError::RunActive { .. }) => ErrorKind::RunActive,
            BridgeError::Provider(_) => ErrorKind::Provider,
            BridgeError::Processing(_) => ErrorKind::Processing,
        }
    }

    /// 附带上下文转为对外报告
    pub fn report(&self, context: ErrorContext) -> ErrorReport {
        ErrorReport {
            kind: self.kind(),
            detail: self.to_string(),
            context,
        }
    }
}

/// 对外可见的错误类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    Validation,
    Correlation,
    Delivery,
    Provider,
    /// Provider 报告 thread 上已有活动 Run（不重试）
    RunActive,
    Processing,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::Validation => "validation",
            ErrorKind::Correlation => "correlation",
            ErrorKind::Delivery => "delivery",
            ErrorKind::Provider => "provider",
            ErrorKind::RunActive => "run_active",
            ErrorKind::Processing => "processing",
        };
        write!(f, "{}", s)
    }
}

/// 失败点可获得的关联标识
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_thread(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }

    pub fn with_run(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub fn with_call(mut self, call_id: impl Into<String>) -> Self {
        self.call_id = Some(call_id.into());
        self
    }

    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }
}

/// 结构化错误报告（HTTP 响应体 / 编排器结果中的错误项）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub detail: String,
    pub context: ErrorContext,
}

impl std::fmt::Display for ErrorReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.kind, self.detail)
    }
}

impl std::error::Error for ErrorReport {}
