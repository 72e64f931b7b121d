//! 回合编排：Run 生命周期状态机

mod lifecycle;
mod turn;

pub use lifecycle::{Orchestrator, PollSettings};
pub use turn::{TurnOutcome, TurnPhase, TurnRequest, MAX_MESSAGE_CHARS};
