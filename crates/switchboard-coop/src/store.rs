//! Session persistence interface

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use switchboard_core::{AgentMessage, SessionCooperationState};
use tokio::sync::RwLock;
use tracing::debug;

/// Durable storage for session logs and state snapshots
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Append one message to a session's log
    async fn append(&self, session_id: &str, message: &AgentMessage) -> Result<()>;

    /// Load the last saved state, if any
    async fn load_state(&self, session_id: &str) -> Result<Option<SessionCooperationState>>;

    /// Save a state snapshot, replacing the previous one
    async fn save_state(&self, session_id: &str, state: &SessionCooperationState) -> Result<()>;
}

#[derive(Default)]
struct StoredSession {
    state: Option<SessionCooperationState>,
    log: Vec<AgentMessage>,
}

/// Process-local store, mainly for tests and the CLI
#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<String, StoredSession>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages appended for a session, in order
    pub async fn log(&self, session_id: &str) -> Vec<AgentMessage> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map(|s| s.log.clone())
            .unwrap_or_default()
    }

    pub async fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn append(&self, session_id: &str, message: &AgentMessage) -> Result<()> {
        self.sessions
            .write()
            .await
            .entry(session_id.to_string())
            .or_default()
            .log
            .push(message.clone());
        Ok(())
    }

    async fn load_state(&self, session_id: &str) -> Result<Option<SessionCooperationState>> {
        Ok(self
            .sessions
            .read()
            .await
            .get(session_id)
            .and_then(|s| s.state.clone()))
    }

    async fn save_state(&self, session_id: &str, state: &SessionCooperationState) -> Result<()> {
        debug!("SessionStore: saved state of '{}' ({})", session_id, state.status);
        self.sessions
            .write()
            .await
            .entry(session_id.to_string())
            .or_default()
            .state = Some(state.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchboard_core::{MessageType, SessionStatus};

    #[tokio::test]
    async fn test_append_and_log() {
        let store = InMemorySessionStore::new();
        store
            .append("s1", &AgentMessage::new("u", "a", "one", MessageType::Text))
            .await
            .unwrap();
        store
            .append("s1", &AgentMessage::new("a", "u", "two", MessageType::Text))
            .await
            .unwrap();
        let log: Vec<String> = store.log("s1").await.into_iter().map(|m| m.content).collect();
        assert_eq!(log, vec!["one", "two"]);
        assert!(store.log("s2").await.is_empty());
    }

    #[tokio::test]
    async fn test_save_and_load_state() {
        let store = InMemorySessionStore::new();
        assert!(store.load_state("s1").await.unwrap().is_none());

        let mut state = SessionCooperationState::new("s1", vec![], 4);
        state.status = SessionStatus::Paused;
        store.save_state("s1", &state).await.unwrap();

        let loaded = store.load_state("s1").await.unwrap().unwrap();
        assert_eq!(loaded, state);
        assert_eq!(store.session_ids().await, vec!["s1".to_string()]);
    }
}
