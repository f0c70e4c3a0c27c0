//! Shared types for switchboard-core

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Role an agent plays inside a cooperation session
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum AgentRole {
    User,
    Assistant,
    Orchestrator,
    Executor,
    Planner,
    Critic,
    Researcher,
    Coder,
    Tester,
    Reviewer,
    #[serde(other)]
    Custom,
}

impl AgentRole {
    /// Every role, in declaration order
    pub const ALL: [AgentRole; 11] = [
        Self::User,
        Self::Assistant,
        Self::Orchestrator,
        Self::Executor,
        Self::Planner,
        Self::Critic,
        Self::Researcher,
        Self::Coder,
        Self::Tester,
        Self::Reviewer,
        Self::Custom,
    ];

    /// Parse a role from a string (e.g., from config). Unknown names map to `Custom`.
    pub fn from_string(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "user" => Self::User,
            "assistant" => Self::Assistant,
            "orchestrator" => Self::Orchestrator,
            "executor" => Self::Executor,
            "planner" => Self::Planner,
            "critic" => Self::Critic,
            "researcher" => Self::Researcher,
            "coder" => Self::Coder,
            "tester" => Self::Tester,
            "reviewer" => Self::Reviewer,
            _ => Self::Custom,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Orchestrator => "orchestrator",
            Self::Executor => "executor",
            Self::Planner => "planner",
            Self::Critic => "critic",
            Self::Researcher => "researcher",
            Self::Coder => "coder",
            Self::Tester => "tester",
            Self::Reviewer => "reviewer",
            Self::Custom => "custom",
        }
    }
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of payload an agent message carries
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    #[default]
    Text,
    Code,
    ToolCall,
    ToolResult,
    Error,
}

impl MessageType {
    /// Parse a message type, falling back to `Text` for anything unrecognized
    pub fn from_string(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "code" => Self::Code,
            "tool_call" => Self::ToolCall,
            "tool_result" => Self::ToolResult,
            "error" => Self::Error,
            _ => Self::Text,
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Code => write!(f, "code"),
            Self::ToolCall => write!(f, "tool_call"),
            Self::ToolResult => write!(f, "tool_result"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Delivery tier of a routing rule and of the queue bucket a message lands in.
///
/// Ordering follows urgency: `High > Normal > Low`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum MessagePriority {
    Low,
    #[default]
    Normal,
    High,
}

impl MessagePriority {
    /// Sort key for rule evaluation order (high first)
    pub fn rank(&self) -> u8 {
        match self {
            Self::High => 0,
            Self::Normal => 1,
            Self::Low => 2,
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "high" => Self::High,
            "low" => Self::Low,
            _ => Self::Normal,
        }
    }
}

impl std::fmt::Display for MessagePriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::High => write!(f, "high"),
            Self::Normal => write!(f, "normal"),
            Self::Low => write!(f, "low"),
        }
    }
}

/// Identity and liveness of an agent as reported by the directory
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentInfo {
    pub id: String,
    pub name: String,
    pub role: AgentRole,
    #[serde(default = "default_online")]
    pub online: bool,
}

fn default_online() -> bool {
    true
}

impl AgentInfo {
    pub fn new(id: impl Into<String>, name: impl Into<String>, role: AgentRole) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            role,
            online: true,
        }
    }
}

/// Tags attached to a message while it is routed
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MessageMetadata {
    #[serde(default)]
    pub forwarded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_receiver_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub applied_rule_ids: Vec<String>,
    #[serde(default, flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// A message exchanged between two agents
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentMessage {
    pub id: String,
    pub sender_id: String,
    pub receiver_id: String,
    #[serde(rename = "type", default)]
    pub message_type: MessageType,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MessageMetadata>,
}

impl AgentMessage {
    /// Create a fresh message with a new id and the current timestamp
    pub fn new(
        sender_id: impl Into<String>,
        receiver_id: impl Into<String>,
        content: impl Into<String>,
        message_type: MessageType,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            sender_id: sender_id.into(),
            receiver_id: receiver_id.into(),
            message_type,
            content: content.into(),
            created_at: Utc::now(),
            metadata: None,
        }
    }

    /// Whether this message was produced by a forwarding rule
    pub fn is_forwarded(&self) -> bool {
        self.metadata.as_ref().is_some_and(|m| m.forwarded)
    }

    /// Mutable access to the metadata, creating it on first use
    pub fn metadata_mut(&mut self) -> &mut MessageMetadata {
        self.metadata.get_or_insert_with(MessageMetadata::default)
    }
}
