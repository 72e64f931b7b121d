//! 挂起工具调用记录

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 挂起调用状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    /// 已创建，投递中或等待结果
    Pending,
    /// 投递重试耗尽，保留供运维查看 / 重投
    Failed,
    /// 结果已被接受，随即从存储删除
    Processed,
}

impl std::fmt::Display for CallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallStatus::Pending => write!(f, "pending"),
            CallStatus::Failed => write!(f, "failed"),
            CallStatus::Processed => write!(f, "processed"),
        }
    }
}

/// 一条尚未拿到结果的工具调用
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingCall {
    /// Provider 分配的 tool call id（主键）
    pub id: String,
    pub thread_id: String,
    pub run_id: String,
    /// 负责执行此调用的外部端点所属 agent
    pub agent_id: String,
    pub function_name: String,
    pub arguments: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub retry_count: u32,
    pub status: CallStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl PendingCall {
    pub fn new(
        id: impl Into<String>,
        thread_id: impl Into<String>,
        run_id: impl Into<String>,
        agent_id: impl Into<String>,
        function_name: impl Into<String>,
        arguments: serde_json::Value,
    ) -> Self {
        Self {
            id: id.into(),
            thread_id: thread_id.into(),
            run_id: run_id.into(),
            agent_id: agent_id.into(),
            function_name: function_name.into(),
            arguments,
            created_at: Utc::now(),
            retry_count: 0,
            status: CallStatus::Pending,
            last_error: None,
        }
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now.signed_duration_since(self.created_at)
    }

    pub fn belongs_to(&self, thread_id: &str, run_id: &str) -> bool {
        self.thread_id == thread_id && self.run_id == run_id
    }
}
