//! 核心：错误分类与优雅关闭

pub mod error;
pub mod shutdown;

pub use error::{BridgeError, ErrorContext, ErrorKind, ErrorReport};
pub use shutdown::{ShutdownManager, ShutdownReason};
