//! Turn-taking strategies
//!
//! A strategy only decides. It inspects the session state and returns a
//! [`StartPlan`] or the next agent to activate; the manager applies the
//! result while holding the session lock.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Result, bail};
use switchboard_core::{AgentInfo, AgentRole, MessageType, SessionCooperationState, StrategyKind};

/// Number of trailing log entries the adaptive strategy looks at
const ADAPTIVE_WINDOW: usize = 5;

/// A message a strategy wants sent when the session starts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedMessage {
    pub sender_id: String,
    pub receiver_id: String,
    pub content: String,
}

impl PlannedMessage {
    fn new(sender: &AgentInfo, receiver: &AgentInfo, content: impl Into<String>) -> Self {
        Self {
            sender_id: sender.id.clone(),
            receiver_id: receiver.id.clone(),
            content: content.into(),
        }
    }
}

/// What starting a session under a strategy amounts to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartPlan {
    /// Strategy the session ends up running (differs on fallback)
    pub strategy: StrategyKind,
    pub sends: Vec<PlannedMessage>,
    /// Route `sends` concurrently instead of one after another
    pub concurrent: bool,
    pub active_agent_id: Option<String>,
    /// Non-fatal remark recorded on the session
    pub note: Option<String>,
}

impl StartPlan {
    fn new(strategy: StrategyKind) -> Self {
        Self {
            strategy,
            sends: Vec::new(),
            concurrent: false,
            active_agent_id: None,
            note: None,
        }
    }
}

/// A turn-taking policy
pub trait CooperationStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    /// Plan the start of a session. An error means the session lacks an
    /// agent the strategy needs; the message becomes the session error.
    fn initialize(
        &self,
        state: &SessionCooperationState,
        initial_message: &str,
    ) -> Result<StartPlan>;

    /// Agent to activate after a round, `None` to leave activation alone
    fn select_next(&self, state: &SessionCooperationState) -> Option<String>;
}

/// Next agent after the active one in session order, wrapping around
pub fn round_robin(state: &SessionCooperationState) -> Option<String> {
    let first = state.agents.first()?;
    let Some(active) = &state.active_agent_id else {
        return Some(first.id.clone());
    };
    let next = match state.agents.iter().position(|a| &a.id == active) {
        Some(index) => (index + 1) % state.agents.len(),
        None => 0,
    };
    Some(state.agents[next].id.clone())
}

fn require<'a>(state: &'a SessionCooperationState, role: AgentRole) -> Option<&'a AgentInfo> {
    state.first_with_role(role)
}

/// User talks to one assistant; turns rotate through the agent list
pub struct Sequential;

impl CooperationStrategy for Sequential {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Sequential
    }

    fn initialize(
        &self,
        state: &SessionCooperationState,
        initial_message: &str,
    ) -> Result<StartPlan> {
        if state.agents.is_empty() {
            bail!("session has no agents");
        }
        let (Some(user), Some(assistant)) = (
            require(state, AgentRole::User),
            require(state, AgentRole::Assistant),
        ) else {
            bail!("sequential cooperation needs a user and an assistant agent");
        };

        let mut plan = StartPlan::new(StrategyKind::Sequential);
        if !initial_message.is_empty() {
            plan.sends.push(PlannedMessage::new(user, assistant, initial_message));
        }
        plan.active_agent_id = Some(assistant.id.clone());
        Ok(plan)
    }

    fn select_next(&self, state: &SessionCooperationState) -> Option<String> {
        round_robin(state)
    }
}

/// An orchestrator receives the task and directs everyone else
pub struct Orchestrated;

impl CooperationStrategy for Orchestrated {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Orchestrated
    }

    fn initialize(
        &self,
        state: &SessionCooperationState,
        initial_message: &str,
    ) -> Result<StartPlan> {
        let (Some(user), Some(orchestrator)) = (
            require(state, AgentRole::User),
            require(state, AgentRole::Orchestrator),
        ) else {
            bail!("orchestrated cooperation needs a user and an orchestrator agent");
        };

        let mut plan = StartPlan::new(StrategyKind::Orchestrated);
        if !initial_message.is_empty() {
            plan.sends.push(PlannedMessage::new(user, orchestrator, initial_message));
        }
        plan.active_agent_id = Some(orchestrator.id.clone());
        Ok(plan)
    }

    // The orchestrator picks the next speaker itself
    fn select_next(&self, _state: &SessionCooperationState) -> Option<String> {
        None
    }
}

/// Every non-user agent gets the task at once; nobody owns the turn
pub struct Parallel;

impl CooperationStrategy for Parallel {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Parallel
    }

    fn initialize(
        &self,
        state: &SessionCooperationState,
        initial_message: &str,
    ) -> Result<StartPlan> {
        if state.agents.is_empty() {
            bail!("session has no agents");
        }
        let Some(user) = require(state, AgentRole::User) else {
            bail!("parallel cooperation needs a user agent");
        };
        let workers: Vec<&AgentInfo> = state
            .agents
            .iter()
            .filter(|a| a.role != AgentRole::User)
            .collect();
        if workers.is_empty() {
            bail!("parallel cooperation needs at least one non-user agent");
        }

        let mut plan = StartPlan::new(StrategyKind::Parallel);
        plan.concurrent = true;
        if !initial_message.is_empty() {
            plan.sends = workers
                .into_iter()
                .map(|worker| PlannedMessage::new(user, worker, initial_message))
                .collect();
        }
        Ok(plan)
    }

    fn select_next(&self, _state: &SessionCooperationState) -> Option<String> {
        None
    }
}

/// An orchestrator analyses the task first; later turns follow mentions
pub struct Adaptive;

impl Adaptive {
    fn mentioned(state: &SessionCooperationState) -> Option<String> {
        let start = state.messages.len().saturating_sub(ADAPTIVE_WINDOW);
        let latest = state.messages[start..]
            .iter()
            .rev()
            .find(|m| m.message_type == MessageType::Text)?;
        let content = latest.content.to_lowercase();

        state
            .agents
            .iter()
            .find(|agent| {
                let name = agent.name.to_lowercase();
                content.contains(agent.role.as_str())
                    || (!name.is_empty() && content.contains(&name))
            })
            .map(|agent| agent.id.clone())
    }
}

impl CooperationStrategy for Adaptive {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Adaptive
    }

    fn initialize(
        &self,
        state: &SessionCooperationState,
        initial_message: &str,
    ) -> Result<StartPlan> {
        let (Some(user), Some(orchestrator)) = (
            require(state, AgentRole::User),
            require(state, AgentRole::Orchestrator),
        ) else {
            let mut plan = Sequential.initialize(state, initial_message)?;
            plan.note = Some(
                "adaptive cooperation needs a user and an orchestrator agent, fell back to sequential"
                    .to_string(),
            );
            return Ok(plan);
        };

        let mut plan = StartPlan::new(StrategyKind::Adaptive);
        if !initial_message.is_empty() {
            plan.sends.push(PlannedMessage::new(
                user,
                orchestrator,
                format!(
                    "[adaptive] Please analyze the following task and determine the best cooperation strategy:\n\n{}",
                    initial_message
                ),
            ));
        }
        plan.active_agent_id = Some(orchestrator.id.clone());
        Ok(plan)
    }

    fn select_next(&self, state: &SessionCooperationState) -> Option<String> {
        Self::mentioned(state).or_else(|| round_robin(state))
    }
}

/// Strategies available to the manager, keyed by kind
#[derive(Clone)]
pub struct StrategyRegistry {
    strategies: HashMap<StrategyKind, Arc<dyn CooperationStrategy>>,
}

impl StrategyRegistry {
    /// A registry without any strategy
    pub fn empty() -> Self {
        Self {
            strategies: HashMap::new(),
        }
    }

    /// Register a strategy under its kind, replacing any previous one
    pub fn register(&mut self, strategy: Arc<dyn CooperationStrategy>) {
        self.strategies.insert(strategy.kind(), strategy);
    }

    pub fn get(&self, kind: StrategyKind) -> Option<Arc<dyn CooperationStrategy>> {
        self.strategies.get(&kind).cloned()
    }

    pub fn kinds(&self) -> Vec<StrategyKind> {
        StrategyKind::ALL
            .into_iter()
            .filter(|k| self.strategies.contains_key(k))
            .collect()
    }
}

impl Default for StrategyRegistry {
    /// All four built-in strategies
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(Sequential));
        registry.register(Arc::new(Orchestrated));
        registry.register(Arc::new(Parallel));
        registry.register(Arc::new(Adaptive));
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchboard_core::AgentMessage;

    fn state(agents: &[(&str, &str, AgentRole)]) -> SessionCooperationState {
        let agents = agents
            .iter()
            .map(|(id, name, role)| AgentInfo::new(*id, *name, *role))
            .collect();
        SessionCooperationState::new("s1", agents, 10)
    }

    #[test]
    fn test_sequential_plan() {
        let s = state(&[("u", "Una", AgentRole::User), ("a", "Abe", AgentRole::Assistant)]);
        let plan = Sequential.initialize(&s, "hello").unwrap();
        assert_eq!(plan.sends, vec![PlannedMessage {
            sender_id: "u".into(),
            receiver_id: "a".into(),
            content: "hello".into(),
        }]);
        assert_eq!(plan.active_agent_id.as_deref(), Some("a"));
        assert!(!plan.concurrent);
    }

    #[test]
    fn test_empty_initial_message_sends_nothing() {
        let s = state(&[("u", "Una", AgentRole::User), ("a", "Abe", AgentRole::Assistant)]);
        let plan = Sequential.initialize(&s, "").unwrap();
        assert!(plan.sends.is_empty());
        assert_eq!(plan.active_agent_id.as_deref(), Some("a"));
    }

    #[test]
    fn test_missing_roles_are_errors() {
        let only_user = state(&[("u", "Una", AgentRole::User)]);
        assert!(Sequential.initialize(&only_user, "x").is_err());
        assert!(Orchestrated.initialize(&only_user, "x").is_err());
        assert!(Parallel.initialize(&only_user, "x").is_err());
        assert!(Sequential.initialize(&state(&[]), "x").is_err());
    }

    #[test]
    fn test_parallel_targets_all_non_users() {
        let s = state(&[
            ("c", "Cy", AgentRole::Coder),
            ("u", "Una", AgentRole::User),
            ("t", "Tia", AgentRole::Tester),
        ]);
        let plan = Parallel.initialize(&s, "go").unwrap();
        let receivers: Vec<&str> = plan.sends.iter().map(|m| m.receiver_id.as_str()).collect();
        assert_eq!(receivers, vec!["c", "t"]);
        assert!(plan.concurrent);
        assert!(plan.active_agent_id.is_none());
    }

    #[test]
    fn test_adaptive_with_orchestrator() {
        let s = state(&[("u", "Una", AgentRole::User), ("o", "Oz", AgentRole::Orchestrator)]);
        let plan = Adaptive.initialize(&s, "plan a trip").unwrap();
        assert_eq!(plan.strategy, StrategyKind::Adaptive);
        assert_eq!(plan.sends[0].receiver_id, "o");
        assert!(plan.sends[0].content.starts_with("[adaptive]"));
        assert!(plan.sends[0].content.ends_with("plan a trip"));
        assert_eq!(plan.active_agent_id.as_deref(), Some("o"));
    }

    #[test]
    fn test_adaptive_falls_back_to_sequential() {
        let s = state(&[("u", "Una", AgentRole::User), ("a", "Abe", AgentRole::Assistant)]);
        let adaptive = Adaptive.initialize(&s, "hello").unwrap();
        let sequential = Sequential.initialize(&s, "hello").unwrap();
        assert_eq!(adaptive.strategy, StrategyKind::Sequential);
        assert_eq!(adaptive.sends, sequential.sends);
        assert_eq!(adaptive.active_agent_id, sequential.active_agent_id);
        assert!(adaptive.note.is_some());
    }

    #[test]
    fn test_round_robin_wraps() {
        let mut s = state(&[
            ("u", "Una", AgentRole::User),
            ("a", "Abe", AgentRole::Assistant),
            ("c", "Cy", AgentRole::Coder),
        ]);
        assert_eq!(round_robin(&s).as_deref(), Some("u"));
        s.active_agent_id = Some("c".into());
        assert_eq!(round_robin(&s).as_deref(), Some("u"));
        s.active_agent_id = Some("gone".into());
        assert_eq!(round_robin(&s).as_deref(), Some("u"));
        assert!(round_robin(&state(&[])).is_none());
    }

    #[test]
    fn test_adaptive_follows_mentions() {
        let mut s = state(&[
            ("u", "Una", AgentRole::User),
            ("o", "Oz", AgentRole::Orchestrator),
            ("c", "Cy", AgentRole::Coder),
            ("t", "Tia", AgentRole::Tester),
        ]);
        s.active_agent_id = Some("o".into());
        s.messages.push(AgentMessage::new("o", "u", "The CODER should start", MessageType::Text));
        assert_eq!(Adaptive.select_next(&s).as_deref(), Some("c"));

        s.messages.push(AgentMessage::new("o", "u", "hand it to tia", MessageType::Text));
        assert_eq!(Adaptive.select_next(&s).as_deref(), Some("t"));

        // Non-text entries are skipped when looking for the latest mention
        s.messages.push(AgentMessage::new("c", "o", "fn main() {}", MessageType::Code));
        assert_eq!(Adaptive.select_next(&s).as_deref(), Some("t"));

        s.messages.push(AgentMessage::new("o", "u", "nothing relevant", MessageType::Text));
        assert_eq!(Adaptive.select_next(&s).as_deref(), Some("c"));
    }

    #[test]
    fn test_orchestrated_and_parallel_do_not_select() {
        let s = state(&[("u", "Una", AgentRole::User), ("o", "Oz", AgentRole::Orchestrator)]);
        assert!(Orchestrated.select_next(&s).is_none());
        assert!(Parallel.select_next(&s).is_none());
    }

    #[test]
    fn test_registry() {
        let registry = StrategyRegistry::default();
        assert_eq!(registry.kinds(), StrategyKind::ALL.to_vec());
        assert_eq!(registry.get(StrategyKind::Parallel).unwrap().kind(), StrategyKind::Parallel);
        assert!(StrategyRegistry::empty().get(StrategyKind::Sequential).is_none());
    }
}
