//! Three-tier FIFO queue of routed messages

use std::collections::VecDeque;

use serde::Serialize;
use switchboard_core::{AgentMessage, MessagePriority, RoutedMessage};

/// A message waiting for delivery
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Session whose observers are notified on delivery
    pub session_id: Option<String>,
    pub message: AgentMessage,
    pub priority: MessagePriority,
}

impl Envelope {
    pub fn new(message: AgentMessage, priority: MessagePriority) -> Self {
        Self {
            session_id: None,
            message,
            priority,
        }
    }

    pub fn for_session(
        session_id: impl Into<String>,
        message: AgentMessage,
        priority: MessagePriority,
    ) -> Self {
        Self {
            session_id: Some(session_id.into()),
            message,
            priority,
        }
    }

    /// Wrap a router result, optionally attaching it to a session
    pub fn from_routed(session_id: Option<&str>, routed: RoutedMessage) -> Self {
        Self {
            session_id: session_id.map(str::to_string),
            message: routed.message,
            priority: routed.priority,
        }
    }

    /// Dedupe key: one delivery per message per receiver
    pub fn delivery_key(&self) -> (String, String) {
        (self.message.id.clone(), self.message.receiver_id.clone())
    }
}

/// Number of queued envelopes per bucket
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueDepth {
    pub high: usize,
    pub normal: usize,
    pub low: usize,
}

impl QueueDepth {
    pub fn total(&self) -> usize {
        self.high + self.normal + self.low
    }
}

#[derive(Debug, Default)]
pub struct PriorityQueue {
    high: VecDeque<Envelope>,
    normal: VecDeque<Envelope>,
    low: VecDeque<Envelope>,
}

impl PriorityQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn bucket(&mut self, priority: MessagePriority) -> &mut VecDeque<Envelope> {
        match priority {
            MessagePriority::High => &mut self.high,
            MessagePriority::Normal => &mut self.normal,
            MessagePriority::Low => &mut self.low,
        }
    }

    /// Append to the back of the envelope's bucket
    pub fn push(&mut self, envelope: Envelope) {
        self.bucket(envelope.priority).push_back(envelope);
    }

    /// Put an envelope back at the head of its bucket
    pub fn push_front(&mut self, envelope: Envelope) {
        self.bucket(envelope.priority).push_front(envelope);
    }

    /// Take the envelopes one tick delivers, in delivery order: every high,
    /// then one normal, then one low if high and normal are now both empty.
    pub fn next_batch(&mut self) -> Vec<Envelope> {
        let mut batch: Vec<Envelope> = self.high.drain(..).collect();
        if let Some(envelope) = self.normal.pop_front() {
            batch.push(envelope);
        }
        if self.high.is_empty()
            && self.normal.is_empty()
            && let Some(envelope) = self.low.pop_front()
        {
            batch.push(envelope);
        }
        batch
    }

    pub fn depth(&self) -> QueueDepth {
        QueueDepth {
            high: self.high.len(),
            normal: self.normal.len(),
            low: self.low.len(),
        }
    }

    pub fn len(&self) -> usize {
        self.depth().total()
    }

    pub fn is_empty(&self) -> bool {
        self.high.is_empty() && self.normal.is_empty() && self.low.is_empty()
    }

    /// Drop everything queued. Returns the number of envelopes discarded.
    pub fn clear(&mut self) -> usize {
        let n = self.len();
        self.high.clear();
        self.normal.clear();
        self.low.clear();
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchboard_core::MessageType;

    fn env(content: &str, priority: MessagePriority) -> Envelope {
        Envelope::new(AgentMessage::new("s", "r", content, MessageType::Text), priority)
    }

    fn contents(batch: &[Envelope]) -> Vec<&str> {
        batch.iter().map(|e| e.message.content.as_str()).collect()
    }

    #[test]
    fn test_batch_drains_high_then_one_normal() {
        let mut q = PriorityQueue::new();
        q.push(env("n1", MessagePriority::Normal));
        q.push(env("h1", MessagePriority::High));
        q.push(env("l1", MessagePriority::Low));
        q.push(env("n2", MessagePriority::Normal));
        q.push(env("h2", MessagePriority::High));

        assert_eq!(contents(&q.next_batch()), vec!["h1", "h2", "n1"]);
        // normal emptied by this batch, so low gets its turn
        assert_eq!(contents(&q.next_batch()), vec!["n2", "l1"]);
        assert!(q.next_batch().is_empty());
    }

    #[test]
    fn test_low_waits_for_normal() {
        let mut q = PriorityQueue::new();
        for i in 0..3 {
            q.push(env(&format!("n{}", i), MessagePriority::Normal));
        }
        q.push(env("l", MessagePriority::Low));

        assert_eq!(contents(&q.next_batch()), vec!["n0"]);
        assert_eq!(contents(&q.next_batch()), vec!["n1"]);
        assert_eq!(contents(&q.next_batch()), vec!["n2", "l"]);
    }

    #[test]
    fn test_low_only_when_idle() {
        let mut q = PriorityQueue::new();
        q.push(env("l1", MessagePriority::Low));
        q.push(env("l2", MessagePriority::Low));
        assert_eq!(contents(&q.next_batch()), vec!["l1"]);
        assert_eq!(contents(&q.next_batch()), vec!["l2"]);
    }

    #[test]
    fn test_push_front_and_depth() {
        let mut q = PriorityQueue::new();
        q.push(env("n1", MessagePriority::Normal));
        q.push_front(env("n0", MessagePriority::Normal));
        q.push(env("h", MessagePriority::High));
        assert_eq!(
            q.depth(),
            QueueDepth {
                high: 1,
                normal: 2,
                low: 0
            }
        );
        assert_eq!(contents(&q.next_batch()), vec!["h", "n0"]);
        assert_eq!(q.clear(), 1);
        assert!(q.is_empty());
    }

    #[test]
    fn test_delivery_key() {
        let e = env("x", MessagePriority::Normal);
        assert_eq!(e.delivery_key(), (e.message.id.clone(), "r".to_string()));
        let s = Envelope::for_session("s1", e.message.clone(), MessagePriority::High);
        assert_eq!(s.session_id.as_deref(), Some("s1"));
    }
}
