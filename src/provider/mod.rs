//! 对话 Provider 层：抽象接口、OpenAI Assistants 实现、分步重试与测试用 Mock

pub mod mock;
pub mod openai;
pub mod retry;
pub mod traits;

pub use mock::{MockProvider, ScriptedStep};
pub use openai::OpenAiAssistantsProvider;
pub use retry::{ProviderRetry, ProviderStep};
pub use traits::{
    ConversationProvider, ProviderError, RunSnapshot, RunStatus, ToolCallRequest, ToolOutput,
};
