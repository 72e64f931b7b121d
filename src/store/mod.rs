//! 挂起调用存储：记录、内存关联表、统计

mod memory;
mod pending;
mod stats;

pub use memory::{PendingCallStore, SweepPolicy, SweepReport, TakeOutcome};
pub use pending::{CallStatus, PendingCall};
pub use stats::{AgeBuckets, PendingStats};
