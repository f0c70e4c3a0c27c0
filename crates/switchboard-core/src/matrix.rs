//! Which agent roles may address each other directly

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::types::AgentRole;

/// Static compatibility table between agent roles.
///
/// A pair may communicate when either role is universal, or when either
/// side lists the other in its allow-list. Pairs the table does not mention
/// cannot communicate.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CommunicationMatrix {
    #[serde(default)]
    universal: HashSet<AgentRole>,
    #[serde(default)]
    allowed: HashMap<AgentRole, HashSet<AgentRole>>,
}

impl CommunicationMatrix {
    /// A matrix that allows nothing
    pub fn empty() -> Self {
        Self::default()
    }

    /// A matrix that allows every pair
    pub fn permissive() -> Self {
        Self {
            universal: AgentRole::ALL.into_iter().collect(),
            allowed: HashMap::new(),
        }
    }

    /// Mark a role as able to talk to anyone
    pub fn with_universal(mut self, role: AgentRole) -> Self {
        self.universal.insert(role);
        self
    }

    /// Allow `role` to address each of `peers`
    pub fn allow(mut self, role: AgentRole, peers: &[AgentRole]) -> Self {
        self.allowed.entry(role).or_default().extend(peers.iter().copied());
        self
    }

    pub fn can_communicate(&self, from: AgentRole, to: AgentRole) -> bool {
        if self.universal.contains(&from) || self.universal.contains(&to) {
            return true;
        }
        let lists = |a: AgentRole, b: AgentRole| {
            self.allowed.get(&a).is_some_and(|peers| peers.contains(&b))
        };
        lists(from, to) || lists(to, from)
    }

    pub fn universal_roles(&self) -> impl Iterator<Item = &AgentRole> {
        self.universal.iter()
    }

    pub fn allowed_peers(&self, role: AgentRole) -> Vec<AgentRole> {
        let mut peers: Vec<AgentRole> = self
            .allowed
            .get(&role)
            .map(|p| p.iter().copied().collect())
            .unwrap_or_default();
        peers.sort_by_key(|r| r.as_str());
        peers
    }
}

/// The stock role table: user, orchestrator, assistant and critic talk to
/// everyone; specialist roles only to their working partners.
pub fn default_matrix() -> CommunicationMatrix {
    use AgentRole::*;
    CommunicationMatrix::empty()
        .with_universal(User)
        .with_universal(Orchestrator)
        .with_universal(Assistant)
        .with_universal(Critic)
        .allow(Executor, &[Planner, Critic, Orchestrator])
        .allow(Planner, &[Executor, Researcher, Orchestrator, Critic])
        .allow(Researcher, &[Planner, Orchestrator, Assistant])
        .allow(Coder, &[Planner, Tester, Orchestrator, Critic])
        .allow(Tester, &[Coder, Orchestrator, Critic])
}

#[cfg(test)]
mod tests {
    use super::*;
    use AgentRole::*;

    #[test]
    fn test_universal_roles_talk_to_anyone() {
        let m = default_matrix();
        for role in AgentRole::ALL {
            assert!(m.can_communicate(User, role));
            assert!(m.can_communicate(role, Orchestrator));
        }
    }

    #[test]
    fn test_allow_list_is_symmetric() {
        let m = default_matrix();
        assert!(m.can_communicate(Coder, Tester));
        assert!(m.can_communicate(Tester, Coder));
        assert!(m.can_communicate(Executor, Planner));
    }

    #[test]
    fn test_unlisted_pairs_are_rejected() {
        let m = default_matrix();
        assert!(!m.can_communicate(Coder, Researcher));
        assert!(!m.can_communicate(Tester, Executor));
        assert!(!m.can_communicate(Reviewer, Custom));
        assert!(!m.can_communicate(Reviewer, Reviewer));
    }

    #[test]
    fn test_empty_and_permissive() {
        assert!(!CommunicationMatrix::empty().can_communicate(User, Assistant));
        assert!(CommunicationMatrix::permissive().can_communicate(Reviewer, Custom));
    }

    #[test]
    fn test_allowed_peers_sorted() {
        let m = default_matrix();
        assert_eq!(m.allowed_peers(Tester), vec![Coder, Critic, Orchestrator]);
        assert!(m.allowed_peers(Reviewer).is_empty());
    }
}
