//! Cooperation manager — owns session state and drives turn-taking
//!
//! Each session sits behind its own mutex. Messages sent on behalf of a
//! session are logged, routed and queued for delivery; every state change is
//! published on the event hub.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::join_all;
use switchboard_core::{
    AgentInfo, AgentMessage, EventHub, MessageRouter, MessageType, RouteOutcome,
    SessionCooperationState, SessionStatus, StrategyKind, Subscription,
};
use switchboard_scheduler::{DeliveryScheduler, Envelope};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::{CoopResult, CooperationError};
use crate::store::SessionStore;
use crate::strategies::{PlannedMessage, StrategyRegistry};

type SessionHandle = Arc<Mutex<SessionCooperationState>>;

/// Result of asking a session to advance one round
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoundOutcome {
    /// The round counter moved forward
    Advanced {
        round: u32,
        active_agent_id: Option<String>,
    },
    /// The round limit was passed and the session is now completed
    Completed { rounds: u32 },
    /// The session is not active, nothing changed
    Skipped { status: SessionStatus },
}

pub struct CooperationManager {
    sessions: RwLock<HashMap<String, SessionHandle>>,
    router: Arc<MessageRouter>,
    scheduler: Arc<DeliveryScheduler>,
    events: Arc<EventHub>,
    strategies: StrategyRegistry,
    store: Option<Arc<dyn SessionStore>>,
}

impl CooperationManager {
    pub fn new(
        router: Arc<MessageRouter>,
        scheduler: Arc<DeliveryScheduler>,
        events: Arc<EventHub>,
    ) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            router,
            scheduler,
            events,
            strategies: StrategyRegistry::default(),
            store: None,
        }
    }

    /// Persist logs and state snapshots through `store`
    pub fn with_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Replace the built-in strategies
    pub fn with_strategies(mut self, strategies: StrategyRegistry) -> Self {
        self.strategies = strategies;
        self
    }

    pub fn events(&self) -> &Arc<EventHub> {
        &self.events
    }

    pub fn scheduler(&self) -> &Arc<DeliveryScheduler> {
        &self.scheduler
    }

    /// Create an idle session at round 0
    pub async fn create_session(
        &self,
        session_id: &str,
        agents: Vec<AgentInfo>,
        max_rounds: u32,
    ) -> CoopResult<SessionCooperationState> {
        let state = SessionCooperationState::new(session_id, agents, max_rounds);
        {
            let mut sessions = self.sessions.write().await;
            if sessions.contains_key(session_id) {
                return Err(CooperationError::DuplicateSession {
                    session_id: session_id.to_string(),
                });
            }
            sessions.insert(session_id.to_string(), Arc::new(Mutex::new(state.clone())));
        }
        info!(
            "CooperationManager: created session '{}' with {} agents (max {} rounds)",
            session_id,
            state.agents.len(),
            max_rounds
        );
        self.save(&state).await;
        self.events.publish_state(&state).await;
        Ok(state)
    }

    /// Snapshot of a session's state
    pub async fn session_state(&self, session_id: &str) -> Option<SessionCooperationState> {
        let handle = self.sessions.read().await.get(session_id).cloned()?;
        let state = handle.lock().await;
        Some(state.clone())
    }

    pub async fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Log, route and queue a message. Returns the original message even if
    /// routing intercepts it.
    pub async fn send_message(
        &self,
        session_id: &str,
        sender_id: &str,
        receiver_id: &str,
        content: &str,
        message_type: MessageType,
    ) -> CoopResult<AgentMessage> {
        let handle = self.handle(session_id).await?;
        let mut state = handle.lock().await;
        let message = AgentMessage::new(sender_id, receiver_id, content, message_type);
        self.record(&mut state, &message).await;
        let outcome = self.router.route(message.clone()).await;
        self.enqueue(session_id, outcome).await;
        self.events.publish_state(&state).await;
        Ok(message)
    }

    /// Start a session under `strategy`.
    ///
    /// Returns false when the session is not idle, or when the strategy
    /// cannot run with the session's agents (the session is then in the
    /// error state with a readable reason).
    pub async fn start_cooperation(
        &self,
        session_id: &str,
        strategy: StrategyKind,
        initial_message: &str,
    ) -> CoopResult<bool> {
        let handle = self.handle(session_id).await?;
        let mut state = handle.lock().await;

        if state.status != SessionStatus::Idle {
            debug!(
                "CooperationManager: session '{}' is {}, not starting",
                session_id, state.status
            );
            return Ok(false);
        }

        let plan = match self.strategies.get(strategy) {
            Some(s) => s.initialize(&state, initial_message),
            None => Err(anyhow::anyhow!("no {} strategy is registered", strategy)),
        };
        let plan = match plan {
            Ok(plan) => plan,
            Err(e) => {
                warn!("CooperationManager: cannot start session '{}': {}", session_id, e);
                state.strategy = Some(strategy);
                state.fail(e.to_string());
                self.save(&state).await;
                self.events.publish_state(&state).await;
                return Ok(false);
            }
        };

        state.status = SessionStatus::Active;
        state.strategy = Some(plan.strategy);
        state.current_round = 0;
        state.error = None;
        if let Some(note) = plan.note {
            warn!("CooperationManager: session '{}': {}", session_id, note);
            state.notes.push(note);
        }

        if plan.concurrent {
            self.send_concurrently(&mut state, plan.sends).await;
        } else {
            for planned in plan.sends {
                let message = planned_message(planned);
                self.record(&mut state, &message).await;
                let outcome = self.router.route(message).await;
                self.enqueue(session_id, outcome).await;
            }
        }

        state.active_agent_id = plan.active_agent_id;
        state.touch();
        info!(
            "CooperationManager: session '{}' started ({}, active: {})",
            session_id,
            plan.strategy,
            state.active_agent_id.as_deref().unwrap_or("none")
        );
        self.save(&state).await;
        self.events.publish_state(&state).await;
        Ok(true)
    }

    /// Give the turn to a member of the session
    pub async fn set_active_agent(&self, session_id: &str, agent_id: &str) -> CoopResult<()> {
        let handle = self.handle(session_id).await?;
        let mut state = handle.lock().await;
        if !state.has_agent(agent_id) {
            return Err(CooperationError::AgentNotInSession {
                session_id: session_id.to_string(),
                agent_id: agent_id.to_string(),
            });
        }
        state.active_agent_id = Some(agent_id.to_string());
        state.touch();
        debug!("CooperationManager: session '{}' active agent -> '{}'", session_id, agent_id);
        self.events.publish_state(&state).await;
        Ok(())
    }

    /// Active -> paused. Already queued messages still drain.
    pub async fn pause_cooperation(&self, session_id: &str) -> CoopResult<bool> {
        self.transition(session_id, SessionStatus::Active, SessionStatus::Paused)
            .await
    }

    /// Paused -> active. Any other state is a no-op returning false.
    pub async fn resume_cooperation(&self, session_id: &str) -> CoopResult<bool> {
        self.transition(session_id, SessionStatus::Paused, SessionStatus::Active)
            .await
    }

    /// Force the session to completed, whatever its state
    pub async fn end_cooperation(&self, session_id: &str) -> CoopResult<bool> {
        let handle = self.handle(session_id).await?;
        let mut state = handle.lock().await;
        complete(&mut state);
        info!("CooperationManager: session '{}' ended", session_id);
        self.save(&state).await;
        self.events.publish_state(&state).await;
        Ok(true)
    }

    /// Advance an active session by one round
    pub async fn next_round(&self, session_id: &str) -> CoopResult<RoundOutcome> {
        let handle = self.handle(session_id).await?;
        let mut state = handle.lock().await;

        if state.status != SessionStatus::Active {
            return Ok(RoundOutcome::Skipped {
                status: state.status,
            });
        }

        let round = state.current_round + 1;
        if round > state.max_rounds {
            complete(&mut state);
            info!(
                "CooperationManager: session '{}' completed after {} rounds",
                session_id, state.current_round
            );
            self.save(&state).await;
            self.events.publish_state(&state).await;
            return Ok(RoundOutcome::Completed {
                rounds: state.current_round,
            });
        }

        state.current_round = round;
        let kind = state.strategy.unwrap_or_default();
        if let Some(next) = self.strategies.get(kind).and_then(|s| s.select_next(&state)) {
            state.active_agent_id = Some(next);
        }
        state.touch();
        debug!(
            "CooperationManager: session '{}' round {}/{} (active: {})",
            session_id,
            round,
            state.max_rounds,
            state.active_agent_id.as_deref().unwrap_or("none")
        );
        self.events.publish_state(&state).await;
        Ok(RoundOutcome::Advanced {
            round,
            active_agent_id: state.active_agent_id.clone(),
        })
    }

    /// Save the final state and forget the session
    pub async fn close_session(&self, session_id: &str) -> CoopResult<SessionCooperationState> {
        let handle = self
            .sessions
            .write()
            .await
            .remove(session_id)
            .ok_or_else(|| CooperationError::not_found(session_id))?;
        let state = handle.lock().await.clone();
        self.save(&state).await;
        self.events.remove_session(session_id).await;
        info!("CooperationManager: closed session '{}'", session_id);
        Ok(state)
    }

    /// Bring a previously saved session back. Returns `None` when there is no
    /// store or it holds nothing for `session_id`.
    pub async fn restore_session(
        &self,
        session_id: &str,
    ) -> CoopResult<Option<SessionCooperationState>> {
        if self.sessions.read().await.contains_key(session_id) {
            return Err(CooperationError::DuplicateSession {
                session_id: session_id.to_string(),
            });
        }
        let Some(store) = &self.store else {
            return Ok(None);
        };
        let state = match store.load_state(session_id).await {
            Ok(Some(state)) => state,
            Ok(None) => return Ok(None),
            Err(e) => {
                warn!("CooperationManager: failed to load session '{}': {:#}", session_id, e);
                return Ok(None);
            }
        };

        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(session_id) {
            return Err(CooperationError::DuplicateSession {
                session_id: session_id.to_string(),
            });
        }
        sessions.insert(session_id.to_string(), Arc::new(Mutex::new(state.clone())));
        info!(
            "CooperationManager: restored session '{}' ({}, {} messages)",
            session_id,
            state.status,
            state.messages.len()
        );
        Ok(Some(state))
    }

    /// Callback for every message delivered in a session
    pub async fn on_message<F>(&self, session_id: &str, callback: F) -> Subscription
    where
        F: Fn(AgentMessage) + Send + Sync + 'static,
    {
        self.events.on_message(session_id, callback).await
    }

    /// Callback for every state change of a session
    pub async fn on_state_change<F>(&self, session_id: &str, callback: F) -> Subscription
    where
        F: Fn(Arc<SessionCooperationState>) + Send + Sync + 'static,
    {
        self.events.on_state_change(session_id, callback).await
    }

    async fn handle(&self, session_id: &str) -> CoopResult<SessionHandle> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| CooperationError::not_found(session_id))
    }

    async fn transition(
        &self,
        session_id: &str,
        from: SessionStatus,
        to: SessionStatus,
    ) -> CoopResult<bool> {
        let handle = self.handle(session_id).await?;
        let mut state = handle.lock().await;
        if state.status != from {
            debug!(
                "CooperationManager: session '{}' is {}, cannot move to {}",
                session_id, state.status, to
            );
            return Ok(false);
        }
        state.status = to;
        state.touch();
        info!("CooperationManager: session '{}' {} -> {}", session_id, from, to);
        self.save(&state).await;
        self.events.publish_state(&state).await;
        Ok(true)
    }

    /// Append to the in-memory log and the store
    async fn record(&self, state: &mut SessionCooperationState, message: &AgentMessage) {
        state.messages.push(message.clone());
        state.touch();
        if let Some(store) = &self.store
            && let Err(e) = store.append(&state.session_id, message).await
        {
            warn!(
                "CooperationManager: failed to persist message {} of '{}': {:#}",
                message.id, state.session_id, e
            );
        }
    }

    /// Log every message in plan order, then route them all at once
    async fn send_concurrently(
        &self,
        state: &mut SessionCooperationState,
        sends: Vec<PlannedMessage>,
    ) {
        let messages: Vec<AgentMessage> = sends.into_iter().map(planned_message).collect();
        for message in &messages {
            self.record(state, message).await;
        }
        let outcomes = join_all(messages.into_iter().map(|m| self.router.route(m))).await;
        for outcome in outcomes {
            self.enqueue(&state.session_id, outcome).await;
        }
    }

    async fn enqueue(&self, session_id: &str, outcome: RouteOutcome) {
        for routed in outcome.messages {
            let envelope = Envelope::from_routed(Some(session_id), routed);
            if !self.scheduler.enqueue(envelope).await {
                debug!("CooperationManager: duplicate delivery in '{}' skipped", session_id);
            }
        }
    }

    async fn save(&self, state: &SessionCooperationState) {
        if let Some(store) = &self.store
            && let Err(e) = store.save_state(&state.session_id, state).await
        {
            warn!(
                "CooperationManager: failed to save session '{}': {:#}",
                state.session_id, e
            );
        }
    }
}

fn planned_message(planned: PlannedMessage) -> AgentMessage {
    AgentMessage::new(planned.sender_id, planned.receiver_id, planned.content, MessageType::Text)
}

fn complete(state: &mut SessionCooperationState) {
    state.status = SessionStatus::Completed;
    state.active_agent_id = None;
    state.touch();
}
