//! switchboard-core - Routing layer for cooperating agents
//!
//! This crate provides:
//! - Message, agent and session data model
//! - Agent directory and message sink traits, with an in-memory directory
//! - Communication matrix describing which roles may address each other
//! - Ordered routing rule store and the message router
//! - Per-session event hub for message and state notifications

pub mod directory;
pub mod events;
pub mod matrix;
pub mod router;
pub mod rules;
pub mod session;
pub mod types;

// Re-export main types for convenience
pub use directory::{AgentDirectory, InMemoryDirectory, MessageSink};
pub use events::{EventHub, SessionEvent, Subscription};
pub use matrix::{CommunicationMatrix, default_matrix};
pub use router::{MessageRouter, RouteOutcome, RoutedMessage};
pub use rules::{MessageTransform, PrefixContent, RoutingRule, RulePatch, RuleStore, default_rules};
pub use session::{SessionCooperationState, SessionStatus, StrategyKind};
pub use types::{AgentInfo, AgentMessage, AgentRole, MessageMetadata, MessagePriority, MessageType};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crate_exports() {
        let _ = std::mem::size_of::<MessageRouter>();
        let _ = std::mem::size_of::<RuleStore>();
        let _ = std::mem::size_of::<EventHub>();
        let _ = std::mem::size_of::<InMemoryDirectory>();
        let _ = std::mem::size_of::<AgentMessage>();
        let _ = std::mem::size_of::<SessionCooperationState>();
    }
}
