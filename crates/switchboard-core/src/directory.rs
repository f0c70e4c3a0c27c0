//! Agent directory, resolving agent ids and roles to live recipients

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::types::{AgentInfo, AgentMessage, AgentRole};

/// Message intake of a receiving agent
#[async_trait]
pub trait MessageSink: Send + Sync {
    /// Hand a message to the agent. An error means the agent refused or failed intake.
    async fn deliver(&self, message: &AgentMessage) -> Result<()>;
}

/// Read-only view of the agents known to the host application
#[async_trait]
pub trait AgentDirectory: Send + Sync {
    /// Look up an agent's role and liveness
    async fn resolve(&self, agent_id: &str) -> Option<AgentInfo>;

    /// All agents holding `role`, in registration order
    async fn by_role(&self, role: AgentRole) -> Vec<AgentInfo>;

    /// The intake of an agent, if it has one
    async fn sink(&self, agent_id: &str) -> Option<Arc<dyn MessageSink>>;
}

struct DirectoryEntry {
    info: AgentInfo,
    sink: Arc<dyn MessageSink>,
}

/// In-process directory backed by a map of registered agents
pub struct InMemoryDirectory {
    entries: RwLock<HashMap<String, DirectoryEntry>>,
    order: RwLock<Vec<String>>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            order: RwLock::new(Vec::new()),
        }
    }

    /// Register an agent with its intake. Re-registering an id replaces it in place.
    pub async fn register(&self, info: AgentInfo, sink: Arc<dyn MessageSink>) {
        info!("Directory: registered agent '{}' ({}, role {})", info.id, info.name, info.role);
        let id = info.id.clone();
        let replaced = self
            .entries
            .write()
            .await
            .insert(id.clone(), DirectoryEntry { info, sink })
            .is_some();
        if !replaced {
            self.order.write().await.push(id);
        }
    }

    /// Remove an agent. Returns false if it was not registered.
    pub async fn remove(&self, agent_id: &str) -> bool {
        let removed = self.entries.write().await.remove(agent_id).is_some();
        if removed {
            self.order.write().await.retain(|id| id != agent_id);
            info!("Directory: removed agent '{}'", agent_id);
        } else {
            warn!("Directory: cannot remove unknown agent '{}'", agent_id);
        }
        removed
    }

    /// Mark an agent as reachable or not. Returns false for unknown agents.
    pub async fn set_online(&self, agent_id: &str, online: bool) -> bool {
        match self.entries.write().await.get_mut(agent_id) {
            Some(entry) => {
                entry.info.online = online;
                debug!("Directory: agent '{}' online={}", agent_id, online);
                true
            }
            None => false,
        }
    }

    /// All registered agents, in registration order
    pub async fn list(&self) -> Vec<AgentInfo> {
        let entries = self.entries.read().await;
        self.order
            .read()
            .await
            .iter()
            .filter_map(|id| entries.get(id).map(|e| e.info.clone()))
            .collect()
    }

    /// Number of registered agents
    pub async fn count(&self) -> usize {
        self.entries.read().await.len()
    }
}

impl Default for InMemoryDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentDirectory for InMemoryDirectory {
    async fn resolve(&self, agent_id: &str) -> Option<AgentInfo> {
        self.entries.read().await.get(agent_id).map(|e| e.info.clone())
    }

    async fn by_role(&self, role: AgentRole) -> Vec<AgentInfo> {
        self.list()
            .await
            .into_iter()
            .filter(|info| info.role == role)
            .collect()
    }

    async fn sink(&self, agent_id: &str) -> Option<Arc<dyn MessageSink>> {
        self.entries.read().await.get(agent_id).map(|e| e.sink.clone())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Sink that records every message it receives
    #[derive(Default)]
    pub struct RecordingSink {
        pub received: Mutex<Vec<AgentMessage>>,
    }

    #[async_trait]
    impl MessageSink for RecordingSink {
        async fn deliver(&self, message: &AgentMessage) -> Result<()> {
            self.received.lock().unwrap().push(message.clone());
            Ok(())
        }
    }

    pub async fn directory_with(agents: &[(&str, AgentRole)]) -> InMemoryDirectory {
        let dir = InMemoryDirectory::new();
        for (id, role) in agents {
            dir.register(
                AgentInfo::new(*id, id.to_uppercase(), *role),
                Arc::new(RecordingSink::default()),
            )
            .await;
        }
        dir
    }

    #[tokio::test]
    async fn test_register_and_resolve() {
        let dir = directory_with(&[("u", AgentRole::User), ("a", AgentRole::Assistant)]).await;
        assert_eq!(dir.count().await, 2);
        let info = dir.resolve("a").await.unwrap();
        assert_eq!(info.role, AgentRole::Assistant);
        assert!(info.online);
        assert!(dir.resolve("missing").await.is_none());
        assert!(dir.sink("u").await.is_some());
    }

    #[tokio::test]
    async fn test_by_role_keeps_registration_order() {
        let dir = directory_with(&[
            ("c2", AgentRole::Coder),
            ("u", AgentRole::User),
            ("c1", AgentRole::Coder),
            ("c3", AgentRole::Coder),
        ])
        .await;
        let ids: Vec<String> = dir
            .by_role(AgentRole::Coder)
            .await
            .into_iter()
            .map(|a| a.id)
            .collect();
        assert_eq!(ids, vec!["c2", "c1", "c3"]);
        assert!(dir.by_role(AgentRole::Tester).await.is_empty());
    }

    #[tokio::test]
    async fn test_reregister_replaces_in_place() {
        let dir = directory_with(&[("x", AgentRole::Coder), ("y", AgentRole::Tester)]).await;
        dir.register(
            AgentInfo::new("x", "X2", AgentRole::Reviewer),
            Arc::new(RecordingSink::default()),
        )
        .await;
        let list = dir.list().await;
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].id, "x");
        assert_eq!(list[0].role, AgentRole::Reviewer);
    }

    #[tokio::test]
    async fn test_remove_and_online_flag() {
        let dir = directory_with(&[("x", AgentRole::Coder)]).await;
        assert!(dir.set_online("x", false).await);
        assert!(!dir.resolve("x").await.unwrap().online);
        assert!(!dir.set_online("nobody", true).await);

        assert!(dir.remove("x").await);
        assert!(!dir.remove("x").await);
        assert_eq!(dir.count().await, 0);
        assert!(dir.list().await.is_empty());
    }
}
