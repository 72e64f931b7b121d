//! OpenAI Assistants（v2）Provider
//!
//! 通过 async_openai 的 threads / messages / runs 接口驱动 Run；base_url 可配置，兼容代理与自建网关。
//! 库返回的类型化 RunObject 在这里转为 RunSnapshot，错误统一映射为 ProviderError。

use std::time::Duration;

use async_openai::config::OpenAIConfig;
use async_openai::error::{ApiError, OpenAIError};
use async_openai::types::assistants::{
    CreateMessageRequestArgs, CreateRunRequestArgs, CreateThreadRequest, MessageContent, MessageRole,
    RunObject, RunStatus as AssistantRunStatus, SubmitToolOutputsRunRequest, ToolsOutputs,
};
use async_openai::Client;
use async_openai::traits::RequestOptionsBuilder;
use async_trait::async_trait;
use serde_json::Value;

use crate::provider::{
    ConversationProvider, ProviderError, RunSnapshot, RunStatus, ToolCallRequest, ToolOutput,
};

/// 列表接口只取最新一条
const LATEST_FIRST: [(&str, &str); 2] = [("limit", "1"), ("order", "desc")];

/// Assistants API 客户端：持有 async_openai Client 与单次请求超时
pub struct OpenAiAssistantsProvider {
    client: Client<OpenAIConfig>,
    has_api_key: bool,
    timeout: Duration,
}

impl OpenAiAssistantsProvider {
    pub fn new(base_url: Option<&str>, api_key: Option<&str>, timeout_secs: u64) -> Self {
        let api_key = api_key
            .map(String::from)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_default();
        let has_api_key = !api_key.trim().is_empty();

        let config = match base_url {
            Some(url) => OpenAIConfig::new()
                .with_api_base(url.trim_end_matches('/'))
                .with_api_key(api_key),
            None => OpenAIConfig::new().with_api_key(api_key),
        };

        let timeout = Duration::from_secs(timeout_secs.max(1));
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();

        Self {
            client: Client::with_config(config).with_http_client(http),
            has_api_key,
            timeout,
        }
    }

    /// 配置或环境变量里找到了 API key
    pub fn has_api_key(&self) -> bool {
        self.has_api_key
    }

    fn classify(&self, err: OpenAIError, thread_id: &str) -> ProviderError {
        match err {
            OpenAIError::ApiError(api) => classify_api_error(api, thread_id),
            OpenAIError::Reqwest(e) if e.is_timeout() => ProviderError::Timeout(self.timeout.as_secs()),
            OpenAIError::Reqwest(e) => ProviderError::Transport(e.to_string()),
            e @ OpenAIError::JSONDeserialize(..) => ProviderError::Decode(e.to_string()),
            OpenAIError::InvalidArgument(message) => ProviderError::Rejected(message),
            other => ProviderError::Transport(other.to_string()),
        }
    }
}

/// API 错误分类；「已有活动 Run」单独成类，服务端错误与限流按瞬时错误处理
fn classify_api_error(api: ApiError, thread_id: &str) -> ProviderError {
    let lowered = api.message.to_lowercase();
    if lowered.contains("already has an active run") {
        return ProviderError::RunActive {
            thread_id: thread_id.to_string(),
            detail: format!(
                "{} Wait for the current run to finish or deliver its pending tool results first.",
                api.message
            ),
        };
    }
    if api.r#type.as_deref() == Some("server_error") || api.code.as_deref() == Some("rate_limit_exceeded") {
        return ProviderError::Transport(api.message);
    }
    if lowered.starts_with("no ") && lowered.contains("found") {
        return ProviderError::NotFound(api.message);
    }
    ProviderError::Rejected(api.message)
}

fn map_status(status: &AssistantRunStatus) -> RunStatus {
    #[allow(unreachable_patterns)]
    match status {
        AssistantRunStatus::Queued => RunStatus::Queued,
        AssistantRunStatus::InProgress => RunStatus::InProgress,
        AssistantRunStatus::RequiresAction => RunStatus::RequiresAction,
        AssistantRunStatus::Cancelling => RunStatus::Cancelling,
        AssistantRunStatus::Cancelled => RunStatus::Cancelled,
        AssistantRunStatus::Failed => RunStatus::Failed,
        AssistantRunStatus::Completed => RunStatus::Completed,
        AssistantRunStatus::Incomplete => RunStatus::Incomplete,
        AssistantRunStatus::Expired => RunStatus::Expired,
        _ => RunStatus::Unknown,
    }
}

/// 模型偶尔给出非 JSON 参数，保留原文
fn parse_arguments(raw: String) -> Value {
    serde_json::from_str(&raw).unwrap_or(Value::String(raw))
}

fn describe_last_error(code: Option<String>, message: String) -> String {
    match code {
        Some(code) if !message.is_empty() => format!("{}: {}", code, message),
        Some(code) => code,
        None if !message.is_empty() => message,
        None => "unknown error".to_string(),
    }
}

fn snapshot(run: RunObject) -> RunSnapshot {
    let tool_calls = run
        .required_action
        .map(|action| {
            action
                .submit_tool_outputs
                .tool_calls
                .into_iter()
                .map(|call| ToolCallRequest {
                    id: call.id,
                    function_name: call.function.name,
                    arguments: parse_arguments(call.function.arguments),
                })
                .collect()
        })
        .unwrap_or_default();
    let last_error = run.last_error.map(|e| {
        // 错误码是 snake_case 枚举，取其线上形式
        let code = serde_json::to_value(&e.code)
            .ok()
            .and_then(|v| v.as_str().map(String::from));
        describe_last_error(code, e.message)
    });
    RunSnapshot {
        status: map_status(&run.status),
        id: run.id,
        thread_id: run.thread_id,
        tool_calls,
        last_error,
    }
}

/// 取 message 中全部 text 片段
fn message_text(content: &[MessageContent]) -> String {
    content
        .iter()
        .filter_map(|part| match part {
            MessageContent::Text(text) => Some(text.text.value.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[async_trait]
impl ConversationProvider for OpenAiAssistantsProvider {
    async fn create_thread(&self) -> Result<String, ProviderError> {
        let thread = self
            .client
            .threads()
            .create(CreateThreadRequest::default())
            .await
            .map_err(|e| self.classify(e, ""))?;
        Ok(thread.id)
    }

    async fn append_message(&self, thread_id: &str, content: &str) -> Result<(), ProviderError> {
        let request = CreateMessageRequestArgs::default()
            .role(MessageRole::User)
            .content(content.to_string())
            .build()
            .map_err(|e| self.classify(e, thread_id))?;
        self.client
            .threads()
            .messages(thread_id)
            .create(request)
            .await
            .map_err(|e| self.classify(e, thread_id))?;
        Ok(())
    }

    async fn start_run(&self, thread_id: &str, assistant_id: &str) -> Result<RunSnapshot, ProviderError> {
        let request = CreateRunRequestArgs::default()
            .assistant_id(assistant_id)
            .build()
            .map_err(|e| self.classify(e, thread_id))?;
        let run = self
            .client
            .threads()
            .runs(thread_id)
            .create(request)
            .await
            .map_err(|e| self.classify(e, thread_id))?;
        Ok(snapshot(run))
    }

    async fn retrieve_run(&self, thread_id: &str, run_id: &str) -> Result<RunSnapshot, ProviderError> {
        let run = self
            .client
            .threads()
            .runs(thread_id)
            .retrieve(run_id)
            .await
            .map_err(|e| self.classify(e, thread_id))?;
        Ok(snapshot(run))
    }

    async fn current_run(&self, thread_id: &str) -> Result<Option<RunSnapshot>, ProviderError> {
        let runs = self
            .client
            .threads()
            .runs(thread_id)
            .query(&LATEST_FIRST)
            .map_err(|e| self.classify(e, thread_id))?
            .list()
            .await
            .map_err(|e| self.classify(e, thread_id))?;
        Ok(runs.data.into_iter().next().map(snapshot))
    }

    async fn latest_message(&self, thread_id: &str) -> Result<String, ProviderError> {
        let messages = self
            .client
            .threads()
            .messages(thread_id)
            .query(&LATEST_FIRST)
            .map_err(|e| self.classify(e, thread_id))?
            .list()
            .await
            .map_err(|e| self.classify(e, thread_id))?;
        messages
            .data
            .first()
            .map(|m| message_text(&m.content))
            .ok_or_else(|| ProviderError::NotFound(format!("no messages on thread {}", thread_id)))
    }

    async fn submit_tool_outputs(
        &self,
        thread_id: &str,
        run_id: &str,
        outputs: &[ToolOutput],
    ) -> Result<RunSnapshot, ProviderError> {
        let request = SubmitToolOutputsRunRequest {
            tool_outputs: outputs
                .iter()
                .map(|o| ToolsOutputs {
                    tool_call_id: Some(o.tool_call_id.clone()),
                    output: Some(o.output.clone()),
                })
                .collect(),
            stream: None,
        };
        let run = self
            .client
            .threads()
            .runs(thread_id)
            .submit_tool_outputs(run_id, request)
            .await
            .map_err(|e| self.classify(e, thread_id))?;
        Ok(snapshot(run))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(message: &str, r#type: Option<&str>, code: Option<&str>) -> ApiError {
        ApiError {
            message: message.to_string(),
            r#type: r#type.map(String::from),
            param: None,
            code: code.map(String::from),
        }
    }

    #[test]
    fn test_active_run_error_is_classified() {
        let err = classify_api_error(
            api_error("Thread thread_1 already has an active run run_9.", Some("invalid_request_error"), None),
            "thread_1",
        );
        match err {
            ProviderError::RunActive { thread_id, detail } => {
                assert_eq!(thread_id, "thread_1");
                assert!(detail.contains("run_9"));
            }
            other => panic!("Expected RunActive, got {:?}", other),
        }
    }

    #[test]
    fn test_api_error_classes() {
        let missing = classify_api_error(api_error("No thread found with id 'thread_x'.", None, None), "thread_x");
        assert!(matches!(missing, ProviderError::NotFound(_)));

        let server = classify_api_error(api_error("The server had an error", Some("server_error"), None), "t");
        assert!(server.is_retryable());

        let limited = classify_api_error(api_error("Slow down", None, Some("rate_limit_exceeded")), "t");
        assert!(limited.is_retryable());

        let rejected = classify_api_error(api_error("Invalid assistant id", Some("invalid_request_error"), None), "t");
        assert!(matches!(rejected, ProviderError::Rejected(_)));
        assert!(!rejected.is_retryable());
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(map_status(&AssistantRunStatus::RequiresAction), RunStatus::RequiresAction);
        assert_eq!(map_status(&AssistantRunStatus::InProgress), RunStatus::InProgress);
        assert_eq!(map_status(&AssistantRunStatus::Expired), RunStatus::Expired);
    }

    #[test]
    fn test_arguments_and_last_error() {
        assert_eq!(parse_arguments("{\"sku\":\"A-1\"}".into())["sku"], "A-1");
        assert_eq!(parse_arguments("not json".into()), Value::String("not json".into()));

        assert_eq!(
            describe_last_error(Some("rate_limit_exceeded".into()), "slow down".into()),
            "rate_limit_exceeded: slow down"
        );
        assert_eq!(describe_last_error(None, String::new()), "unknown error");
    }

    #[test]
    fn test_api_key_detection() {
        let provider = OpenAiAssistantsProvider::new(Some("http://localhost:9"), Some("sk-test"), 5);
        assert!(provider.has_api_key());
        let provider = OpenAiAssistantsProvider::new(None, Some("  "), 5);
        assert!(!provider.has_api_key());
    }
}
