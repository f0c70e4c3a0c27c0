//! Per-session cooperation state shared by the manager, the event hub and stores

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{AgentInfo, AgentMessage, AgentRole};

/// Lifecycle status of a cooperation session
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    #[default]
    Idle,
    Active,
    Paused,
    Completed,
    Error,
}

impl SessionStatus {
    /// Completed and errored sessions accept no further transitions except `end`
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Active => write!(f, "active"),
            Self::Paused => write!(f, "paused"),
            Self::Completed => write!(f, "completed"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Turn-taking policy of a session
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    #[default]
    Sequential,
    Orchestrated,
    Parallel,
    Adaptive,
}

impl StrategyKind {
    pub const ALL: [StrategyKind; 4] = [
        Self::Sequential,
        Self::Orchestrated,
        Self::Parallel,
        Self::Adaptive,
    ];
}

impl std::str::FromStr for StrategyKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "sequential" => Ok(Self::Sequential),
            "orchestrated" => Ok(Self::Orchestrated),
            "parallel" => Ok(Self::Parallel),
            "adaptive" => Ok(Self::Adaptive),
            other => Err(anyhow!(
                "Unknown cooperation strategy '{}' (expected sequential, orchestrated, parallel or adaptive)",
                other
            )),
        }
    }
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sequential => write!(f, "sequential"),
            Self::Orchestrated => write!(f, "orchestrated"),
            Self::Parallel => write!(f, "parallel"),
            Self::Adaptive => write!(f, "adaptive"),
        }
    }
}

/// Snapshot of a cooperation session
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionCooperationState {
    pub session_id: String,
    /// Fixed set of agents taking part, in turn order
    pub agents: Vec<AgentInfo>,
    pub active_agent_id: Option<String>,
    pub status: SessionStatus,
    /// Append-only message log
    pub messages: Vec<AgentMessage>,
    pub current_round: u32,
    pub max_rounds: u32,
    pub strategy: Option<StrategyKind>,
    pub error: Option<String>,
    /// Non-fatal remarks, e.g. a strategy fallback
    #[serde(default)]
    pub notes: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SessionCooperationState {
    pub fn new(session_id: impl Into<String>, agents: Vec<AgentInfo>, max_rounds: u32) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            agents,
            active_agent_id: None,
            status: SessionStatus::Idle,
            messages: Vec::new(),
            current_round: 0,
            max_rounds,
            strategy: None,
            error: None,
            notes: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn has_agent(&self, agent_id: &str) -> bool {
        self.agents.iter().any(|a| a.id == agent_id)
    }

    pub fn agent(&self, agent_id: &str) -> Option<&AgentInfo> {
        self.agents.iter().find(|a| a.id == agent_id)
    }

    /// First agent of the session holding `role`
    pub fn first_with_role(&self, role: AgentRole) -> Option<&AgentInfo> {
        self.agents.iter().find(|a| a.role == role)
    }

    /// Put the session into the error state with a readable reason
    pub fn fail(&mut self, reason: impl Into<String>) {
        self.status = SessionStatus::Error;
        self.error = Some(reason.into());
        self.touch();
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
