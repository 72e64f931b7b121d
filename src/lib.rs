//! Toolhook - 异步工具调用桥
//!
//! 对话 Run 暂停请求工具时，把每个工具调用派发到外部执行端；结果异步回传后关联到原 Run 并恢复。
//!
//! 模块划分：
//! - **agents**: agent 目录（assistant id + 投递端点）
//! - **bridge**: 从配置装配全部组件
//! - **cleanup**: 挂起调用的定时过期清理
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类、对外错误报告、优雅关闭
//! - **correlation**: 入站结果校验、归一化、关联与批次累积
//! - **dispatch**: 指数退避、投递通道、派发引擎
//! - **observability**: tracing 初始化
//! - **orchestrator**: Run 生命周期状态机
//! - **provider**: 对话 Provider 抽象、OpenAI Assistants 实现、分步重试
//! - **server**: axum HTTP 入口（feature `server`）
//! - **store**: 内存挂起调用存储与统计

pub mod agents;
pub mod bridge;
pub mod cleanup;
pub mod config;
pub mod core;
pub mod correlation;
pub mod dispatch;
pub mod observability;
pub mod orchestrator;
pub mod provider;
#[cfg(feature = "server")]
pub mod server;
pub mod store;

pub use bridge::{Bridge, BridgeBuilder};
pub use core::{BridgeError, ErrorKind, ErrorReport};
pub use orchestrator::{Orchestrator, TurnOutcome, TurnRequest};
