//! switchboard-coop - Multi-agent cooperation sessions
//!
//! This crate provides:
//! - Cooperation manager owning per-session state and the round counter
//! - Sequential, orchestrated, parallel and adaptive turn-taking strategies
//! - Session store trait with an in-memory implementation
//! - Session summaries, transcript formatting and message content parsing

pub mod error;
pub mod manager;
pub mod store;
pub mod strategies;
pub mod summary;

pub use error::{CoopResult, CooperationError};
pub use manager::{CooperationManager, RoundOutcome};
pub use store::{InMemorySessionStore, SessionStore};
pub use strategies::{
    Adaptive, CooperationStrategy, Orchestrated, Parallel, PlannedMessage, Sequential, StartPlan,
    StrategyRegistry, round_robin,
};
pub use summary::{
    CodeBlock, ParsedContent, SessionSummary, ToolCall, format_message, parse_message_content,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crate_exports() {
        let _ = std::mem::size_of::<CooperationManager>();
        let _ = std::mem::size_of::<StrategyRegistry>();
        let _ = std::mem::size_of::<InMemorySessionStore>();
        let _ = std::mem::size_of::<SessionSummary>();
    }
}
