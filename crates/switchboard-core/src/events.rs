//! Per-session broadcast of message arrivals and state changes
//!
//! Each session gets its own broadcast channel; every event is also sent to a
//! global firehose. Callback-style observers get a [`Subscription`] that stops
//! the forwarding task when dropped.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::session::SessionCooperationState;
use crate::types::AgentMessage;

/// Something observers of a session may care about
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A message was delivered to its receiver
    Message {
        session_id: String,
        message: AgentMessage,
    },
    /// The cooperation state of the session changed
    StateChanged {
        session_id: String,
        state: Arc<SessionCooperationState>,
    },
}

impl SessionEvent {
    pub fn session_id(&self) -> &str {
        match self {
            Self::Message { session_id, .. } | Self::StateChanged { session_id, .. } => session_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Message { .. } => "message",
            Self::StateChanged { .. } => "state",
        }
    }
}

/// Handle for a callback registered on the hub. Dropping it unsubscribes.
pub struct Subscription {
    token: CancellationToken,
}

impl Subscription {
    fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Stop receiving callbacks
    pub fn unsubscribe(self) {
        self.token.cancel();
    }

    pub fn is_active(&self) -> bool {
        !self.token.is_cancelled()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Broadcast hub for session events
pub struct EventHub {
    capacity: usize,
    sessions: RwLock<HashMap<String, broadcast::Sender<SessionEvent>>>,
    firehose: broadcast::Sender<SessionEvent>,
}

impl EventHub {
    /// Create a hub whose channels each buffer `capacity` events
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (firehose, _) = broadcast::channel(capacity);
        Self {
            capacity,
            sessions: RwLock::new(HashMap::new()),
            firehose,
        }
    }

    /// Receive every event of one session
    pub async fn subscribe(&self, session_id: &str) -> broadcast::Receiver<SessionEvent> {
        if let Some(tx) = self.sessions.read().await.get(session_id) {
            return tx.subscribe();
        }
        let mut sessions = self.sessions.write().await;
        sessions
            .entry(session_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Receive every event of every session
    pub fn subscribe_all(&self) -> broadcast::Receiver<SessionEvent> {
        self.firehose.subscribe()
    }

    /// Broadcast an event to the session's subscribers and the firehose
    pub async fn publish(&self, event: SessionEvent) {
        if let Some(tx) = self.sessions.read().await.get(event.session_id())
            && tx.receiver_count() > 0
        {
            debug!(
                "EventHub: '{}' event for session '{}' to {} receivers",
                event.kind(),
                event.session_id(),
                tx.receiver_count()
            );
            // No receivers left is fine
            let _ = tx.send(event.clone());
        }
        if self.firehose.receiver_count() > 0 {
            let _ = self.firehose.send(event);
        }
    }

    pub async fn publish_message(&self, session_id: &str, message: &AgentMessage) {
        self.publish(SessionEvent::Message {
            session_id: session_id.to_string(),
            message: message.clone(),
        })
        .await;
    }

    pub async fn publish_state(&self, state: &SessionCooperationState) {
        self.publish(SessionEvent::StateChanged {
            session_id: state.session_id.clone(),
            state: Arc::new(state.clone()),
        })
        .await;
    }

    /// Invoke `callback` for every message delivered in a session
    pub async fn on_message<F>(&self, session_id: &str, callback: F) -> Subscription
    where
        F: Fn(AgentMessage) + Send + Sync + 'static,
    {
        self.on_event(session_id, move |event| {
            if let SessionEvent::Message { message, .. } = event {
                callback(message);
            }
        })
        .await
    }

    /// Invoke `callback` for every state change of a session
    pub async fn on_state_change<F>(&self, session_id: &str, callback: F) -> Subscription
    where
        F: Fn(Arc<SessionCooperationState>) + Send + Sync + 'static,
    {
        self.on_event(session_id, move |event| {
            if let SessionEvent::StateChanged { state, .. } = event {
                callback(state);
            }
        })
        .await
    }

    async fn on_event<F>(&self, session_id: &str, handler: F) -> Subscription
    where
        F: Fn(SessionEvent) + Send + Sync + 'static,
    {
        let mut rx = self.subscribe(session_id).await;
        let subscription = Subscription::new();
        let token = subscription.token.clone();
        let session = session_id.to_string();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    received = rx.recv() => match received {
                        Ok(event) => handler(event),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(
                                "EventHub: subscriber of '{}' lagged, skipped {} events",
                                session, skipped
                            );
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            debug!("EventHub: subscriber of '{}' stopped", session);
        });

        subscription
    }

    /// Drop a session's channel; its subscribers see the channel close
    pub async fn remove_session(&self, session_id: &str) -> bool {
        self.sessions.write().await.remove(session_id).is_some()
    }

    /// Number of receivers currently attached to a session
    pub async fn subscriber_count(&self, session_id: &str) -> usize {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MessageType;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn msg(content: &str) -> AgentMessage {
        AgentMessage::new("u", "a", content, MessageType::Text)
    }

    #[tokio::test]
    async fn test_session_and_firehose_receive() {
        let hub = EventHub::new(16);
        let mut rx = hub.subscribe("s1").await;
        let mut all = hub.subscribe_all();

        hub.publish_message("s1", &msg("hello")).await;

        match rx.recv().await.unwrap() {
            SessionEvent::Message { message, .. } => assert_eq!(message.content, "hello"),
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(all.recv().await.unwrap().session_id(), "s1");
    }

    #[tokio::test]
    async fn test_sessions_are_isolated() {
        let hub = EventHub::new(16);
        let mut rx = hub.subscribe("s1").await;
        let _other = hub.subscribe("s2").await;
        hub.publish_message("s2", &msg("elsewhere")).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let hub = EventHub::new(16);
        hub.publish_message("nobody", &msg("x")).await;
        assert_eq!(hub.subscriber_count("nobody").await, 0);
        assert_eq!(hub.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_on_message_callback() {
        let hub = EventHub::new(16);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = hub
            .on_message("s1", move |m| {
                let _ = tx.send(m.content);
            })
            .await;

        let state = SessionCooperationState::new("s1", vec![], 3);
        hub.publish_state(&state).await;
        hub.publish_message("s1", &msg("ping")).await;

        let got = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(got.as_deref(), Some("ping"));
    }

    #[tokio::test]
    async fn test_on_state_change_callback() {
        let hub = EventHub::new(16);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = hub
            .on_state_change("s1", move |state| {
                let _ = tx.send(state.max_rounds);
            })
            .await;

        hub.publish_state(&SessionCooperationState::new("s1", vec![], 7)).await;
        let got = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(got, Some(7));
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_callbacks() {
        let hub = EventHub::new(16);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sub = hub
            .on_message("s1", move |m| {
                let _ = tx.send(m.content);
            })
            .await;
        assert!(sub.is_active());
        sub.unsubscribe();

        hub.publish_message("s1", &msg("late")).await;
        let got = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        // Either the sender was dropped with the task, or nothing arrived
        assert!(matches!(got, Ok(None) | Err(_)));
    }

    #[tokio::test]
    async fn test_remove_session_closes_channel() {
        let hub = EventHub::new(16);
        let mut rx = hub.subscribe("s1").await;
        assert!(hub.remove_session("s1").await);
        assert!(!hub.remove_session("s1").await);
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
    }
}
