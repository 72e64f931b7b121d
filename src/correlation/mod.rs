//! 关联与恢复：入站工具结果的校验、归一化、匹配与批次累积

mod normalize;
mod protocol;

pub use normalize::{normalize_output, ToolResult, TRUNCATION_MARKER};
pub use protocol::{AgentRef, CorrelatedOutcome, CorrelationProtocol, Resumption};
