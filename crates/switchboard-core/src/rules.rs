//! Routing rules and the ordered rule store

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::types::{AgentMessage, AgentRole, MessagePriority, MessageType};

/// Rewrites a forwarded message before it is queued
pub trait MessageTransform: Send + Sync {
    fn apply(&self, message: AgentMessage) -> AgentMessage;
}

impl<F> MessageTransform for F
where
    F: Fn(AgentMessage) -> AgentMessage + Send + Sync,
{
    fn apply(&self, message: AgentMessage) -> AgentMessage {
        self(message)
    }
}

/// Prepends a fixed string to the message content
#[derive(Debug, Clone)]
pub struct PrefixContent(pub String);

impl MessageTransform for PrefixContent {
    fn apply(&self, mut message: AgentMessage) -> AgentMessage {
        message.content = format!("{}{}", self.0, message.content);
        message
    }
}

fn default_enabled() -> bool {
    true
}

/// A predicate + effect pair applied to every routed message
#[derive(Clone, Serialize, Deserialize)]
pub struct RoutingRule {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: MessagePriority,
    #[serde(default)]
    pub sender_role: Option<AgentRole>,
    #[serde(default)]
    pub receiver_role: Option<AgentRole>,
    #[serde(default)]
    pub message_type: Option<MessageType>,
    /// Matches when any keyword is a case-insensitive substring of the content
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub forward_target_role: Option<AgentRole>,
    /// Takes precedence over `forward_target_role`
    #[serde(default)]
    pub forward_target_id: Option<String>,
    #[serde(default)]
    pub intercept_original: bool,
    #[serde(skip)]
    pub transform: Option<Arc<dyn MessageTransform>>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl std::fmt::Debug for RoutingRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutingRule")
            .field("id", &self.id)
            .field("description", &self.description)
            .field("priority", &self.priority)
            .field("sender_role", &self.sender_role)
            .field("receiver_role", &self.receiver_role)
            .field("message_type", &self.message_type)
            .field("keywords", &self.keywords)
            .field("enabled", &self.enabled)
            .field("forward_target_role", &self.forward_target_role)
            .field("forward_target_id", &self.forward_target_id)
            .field("intercept_original", &self.intercept_original)
            .field("transform", &self.transform.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

impl RoutingRule {
    /// An enabled, normal-priority rule that matches everything and does nothing
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            description: description.into(),
            priority: MessagePriority::Normal,
            sender_role: None,
            receiver_role: None,
            message_type: None,
            keywords: Vec::new(),
            enabled: true,
            forward_target_role: None,
            forward_target_id: None,
            intercept_original: false,
            transform: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_priority(mut self, priority: MessagePriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn from_role(mut self, role: AgentRole) -> Self {
        self.sender_role = Some(role);
        self
    }

    pub fn to_role(mut self, role: AgentRole) -> Self {
        self.receiver_role = Some(role);
        self
    }

    pub fn of_type(mut self, message_type: MessageType) -> Self {
        self.message_type = Some(message_type);
        self
    }

    pub fn with_keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keywords = keywords.into_iter().map(Into::into).collect();
        self
    }

    pub fn forward_to_role(mut self, role: AgentRole) -> Self {
        self.forward_target_role = Some(role);
        self
    }

    pub fn forward_to_id(mut self, agent_id: impl Into<String>) -> Self {
        self.forward_target_id = Some(agent_id.into());
        self
    }

    pub fn intercepting(mut self) -> Self {
        self.intercept_original = true;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn with_transform(mut self, transform: impl MessageTransform + 'static) -> Self {
        self.transform = Some(Arc::new(transform));
        self
    }

    /// Whether this rule produces forwarded copies
    pub fn forwards(&self) -> bool {
        self.forward_target_id.is_some() || self.forward_target_role.is_some()
    }

    /// Evaluate the content predicates of this rule. Role predicates are
    /// checked against the already-resolved roles of sender and receiver.
    pub fn matches(
        &self,
        message: &AgentMessage,
        sender_role: Option<AgentRole>,
        receiver_role: Option<AgentRole>,
    ) -> bool {
        if let Some(required) = self.sender_role
            && sender_role != Some(required)
        {
            return false;
        }
        if let Some(required) = self.receiver_role
            && receiver_role != Some(required)
        {
            return false;
        }
        if let Some(required) = self.message_type
            && message.message_type != required
        {
            return false;
        }
        if !self.keywords.is_empty() {
            let content = message.content.to_lowercase();
            if !self
                .keywords
                .iter()
                .any(|k| content.contains(&k.to_lowercase()))
            {
                return false;
            }
        }
        true
    }
}

/// Partial update for a stored rule. `None` leaves a field untouched; the
/// nested options clear a filter when set to `Some(None)`.
#[derive(Default, Clone)]
pub struct RulePatch {
    pub description: Option<String>,
    pub priority: Option<MessagePriority>,
    pub sender_role: Option<Option<AgentRole>>,
    pub receiver_role: Option<Option<AgentRole>>,
    pub message_type: Option<Option<MessageType>>,
    pub keywords: Option<Vec<String>>,
    pub enabled: Option<bool>,
    pub forward_target_role: Option<Option<AgentRole>>,
    pub forward_target_id: Option<Option<String>>,
    pub intercept_original: Option<bool>,
    pub transform: Option<Option<Arc<dyn MessageTransform>>>,
}

impl RulePatch {
    fn apply_to(self, rule: &mut RoutingRule) {
        if let Some(v) = self.description {
            rule.description = v;
        }
        if let Some(v) = self.priority {
            rule.priority = v;
        }
        if let Some(v) = self.sender_role {
            rule.sender_role = v;
        }
        if let Some(v) = self.receiver_role {
            rule.receiver_role = v;
        }
        if let Some(v) = self.message_type {
            rule.message_type = v;
        }
        if let Some(v) = self.keywords {
            rule.keywords = v;
        }
        if let Some(v) = self.enabled {
            rule.enabled = v;
        }
        if let Some(v) = self.forward_target_role {
            rule.forward_target_role = v;
        }
        if let Some(v) = self.forward_target_id {
            rule.forward_target_id = v;
        }
        if let Some(v) = self.intercept_original {
            rule.intercept_original = v;
        }
        if let Some(v) = self.transform {
            rule.transform = v;
        }
    }
}

/// Ordered set of routing rules.
///
/// The list is replaced wholesale on every mutation, so readers holding a
/// snapshot never observe a half-sorted list.
pub struct RuleStore {
    rules: RwLock<Arc<Vec<RoutingRule>>>,
}

impl RuleStore {
    pub fn new() -> Self {
        Self {
            rules: RwLock::new(Arc::new(Vec::new())),
        }
    }

    /// A store seeded with the stock rules: user traffic is copied to the
    /// orchestrator, and errors are copied to both orchestrator and user.
    pub async fn with_default_rules() -> Self {
        let store = Self::new();
        for rule in default_rules() {
            store.add_rule(rule).await;
        }
        store
    }

    /// Insert a rule, assigning an id when it has none. Returns the id.
    pub async fn add_rule(&self, mut rule: RoutingRule) -> String {
        if rule.id.is_empty() {
            rule.id = uuid::Uuid::new_v4().to_string();
        }
        let id = rule.id.clone();
        info!(
            "RuleStore: added rule '{}' ({}, priority {})",
            id, rule.description, rule.priority
        );

        let mut guard = self.rules.write().await;
        let mut next = (**guard).clone();
        next.push(rule);
        sort_rules(&mut next);
        *guard = Arc::new(next);
        id
    }

    /// Merge `patch` into the rule with `id`. Returns false if unknown.
    pub async fn update_rule(&self, id: &str, patch: RulePatch) -> bool {
        let mut guard = self.rules.write().await;
        let Some(index) = guard.iter().position(|r| r.id == id) else {
            debug!("RuleStore: update of unknown rule '{}'", id);
            return false;
        };
        let mut next = (**guard).clone();
        patch.apply_to(&mut next[index]);
        sort_rules(&mut next);
        *guard = Arc::new(next);
        debug!("RuleStore: updated rule '{}'", id);
        true
    }

    /// Toggle a rule on or off. Returns false if unknown.
    pub async fn set_enabled(&self, id: &str, enabled: bool) -> bool {
        self.update_rule(
            id,
            RulePatch {
                enabled: Some(enabled),
                ..Default::default()
            },
        )
        .await
    }

    /// Remove a rule. Returns false if unknown.
    pub async fn delete_rule(&self, id: &str) -> bool {
        let mut guard = self.rules.write().await;
        if !guard.iter().any(|r| r.id == id) {
            debug!("RuleStore: delete of unknown rule '{}'", id);
            return false;
        }
        let next: Vec<RoutingRule> = guard.iter().filter(|r| r.id != id).cloned().collect();
        *guard = Arc::new(next);
        info!("RuleStore: deleted rule '{}'", id);
        true
    }

    /// Copy of the rules in evaluation order
    pub async fn rules(&self) -> Vec<RoutingRule> {
        self.rules.read().await.as_ref().clone()
    }

    /// Cheap shared view of the current rule list
    pub async fn snapshot(&self) -> Arc<Vec<RoutingRule>> {
        self.rules.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.rules.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rules.read().await.is_empty()
    }
}

impl Default for RuleStore {
    fn default() -> Self {
        Self::new()
    }
}

// `sort_by_key` is stable, so rules of equal priority keep insertion order.
fn sort_rules(rules: &mut [RoutingRule]) {
    rules.sort_by_key(|r| r.priority.rank());
}

/// Stock rules installed by [`RuleStore::with_default_rules`]
pub fn default_rules() -> Vec<RoutingRule> {
    vec![
        RoutingRule::new("Copy user messages to the orchestrator")
            .with_priority(MessagePriority::High)
            .from_role(AgentRole::User)
            .forward_to_role(AgentRole::Orchestrator),
        RoutingRule::new("Copy error messages to the orchestrator")
            .with_priority(MessagePriority::High)
            .of_type(MessageType::Error)
            .forward_to_role(AgentRole::Orchestrator),
        RoutingRule::new("Copy error messages to the user")
            .with_priority(MessagePriority::High)
            .of_type(MessageType::Error)
            .forward_to_role(AgentRole::User),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(content: &str) -> AgentMessage {
        AgentMessage::new("s", "r", content, MessageType::Text)
    }

    #[tokio::test]
    async fn test_add_assigns_id() {
        let store = RuleStore::new();
        let id = store.add_rule(RoutingRule::new("anything")).await;
        assert!(!id.is_empty());
        let kept = store.add_rule(RoutingRule::new("named").with_id("fixed")).await;
        assert_eq!(kept, "fixed");
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn test_priority_order_is_stable() {
        let store = RuleStore::new();
        store
            .add_rule(
                RoutingRule::new("low")
                    .with_id("l")
                    .with_priority(MessagePriority::Low),
            )
            .await;
        store
            .add_rule(
                RoutingRule::new("high 1")
                    .with_id("h1")
                    .with_priority(MessagePriority::High),
            )
            .await;
        store
            .add_rule(
                RoutingRule::new("normal")
                    .with_id("n")
                    .with_priority(MessagePriority::Normal),
            )
            .await;
        store
            .add_rule(
                RoutingRule::new("high 2")
                    .with_id("h2")
                    .with_priority(MessagePriority::High),
            )
            .await;

        let ids: Vec<String> = store.rules().await.into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["h1", "h2", "n", "l"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writers_keep_order() {
        const WRITERS: usize = 8;
        const PER_WRITER: usize = 12;
        let tiers = [MessagePriority::High, MessagePriority::Normal, MessagePriority::Low];
        let store = Arc::new(RuleStore::new());

        let mut handles = Vec::new();
        for w in 0..WRITERS {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..PER_WRITER {
                    let rule = RoutingRule::new(format!("writer {} rule {}", w, i))
                        .with_id(format!("{}-{}", w, i))
                        .with_priority(tiers[(w + i) % 3]);
                    store.add_rule(rule).await;
                    if i % 3 == 2 {
                        assert!(store.delete_rule(&format!("{}-{}", w, i - 1)).await);
                    }
                    tokio::task::yield_now().await;
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let rules = store.rules().await;
        assert_eq!(rules.len(), WRITERS * PER_WRITER * 2 / 3);
        assert!(rules.windows(2).all(|w| w[0].priority.rank() <= w[1].priority.rank()));

        // Within a tier, each writer's rules appear in the order it added them
        for tier in tiers {
            for w in 0..WRITERS {
                let seqs: Vec<usize> = rules
                    .iter()
                    .filter(|r| r.priority == tier)
                    .filter_map(|r| {
                        let (writer, seq) = r.id.split_once('-')?;
                        if writer.parse::<usize>().ok()? != w {
                            return None;
                        }
                        seq.parse().ok()
                    })
                    .collect();
                assert!(seqs.windows(2).all(|pair| pair[0] < pair[1]), "{:?}", seqs);
                assert!(seqs.iter().all(|i| i % 3 != 1));
            }
        }
    }

    #[tokio::test]
    async fn test_update_resorts_and_merges() {
        let store = RuleStore::new();
        store.add_rule(RoutingRule::new("a").with_id("a")).await;
        store.add_rule(RoutingRule::new("b").with_id("b")).await;

        let patch = RulePatch {
            priority: Some(MessagePriority::High),
            keywords: Some(vec!["deploy".to_string()]),
            ..Default::default()
        };
        assert!(store.update_rule("b", patch).await);

        let rules = store.rules().await;
        assert_eq!(rules[0].id, "b");
        assert_eq!(rules[0].description, "b");
        assert_eq!(rules[0].keywords, vec!["deploy".to_string()]);
        assert!(!store.update_rule("zzz", RulePatch::default()).await);
    }

    #[tokio::test]
    async fn test_patch_can_clear_filter() {
        let store = RuleStore::new();
        store.add_rule(RoutingRule::new("a").with_id("a").from_role(AgentRole::User)).await;
        let patch = RulePatch {
            sender_role: Some(None),
            ..Default::default()
        };
        assert!(store.update_rule("a", patch).await);
        assert!(store.rules().await[0].sender_role.is_none());
    }

    #[tokio::test]
    async fn test_delete_and_toggle() {
        let store = RuleStore::new();
        store.add_rule(RoutingRule::new("a").with_id("a")).await;
        assert!(store.set_enabled("a", false).await);
        assert!(!store.rules().await[0].enabled);
        assert!(store.delete_rule("a").await);
        assert!(!store.delete_rule("a").await);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_rules_returns_defensive_copy() {
        let store = RuleStore::new();
        store.add_rule(RoutingRule::new("a").with_id("a")).await;
        let mut copy = store.rules().await;
        copy.clear();
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_snapshot_survives_mutation() {
        let store = RuleStore::new();
        store.add_rule(RoutingRule::new("a").with_id("a")).await;
        let snapshot = store.snapshot().await;
        store.delete_rule("a").await;
        assert_eq!(snapshot.len(), 1);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_default_rules() {
        let store = RuleStore::with_default_rules().await;
        let rules = store.rules().await;
        assert_eq!(rules.len(), 3);
        assert!(rules.iter().all(|r| r.priority == MessagePriority::High && r.forwards()));
        assert_eq!(rules[0].sender_role, Some(AgentRole::User));
    }

    #[test]
    fn test_keyword_match_is_case_insensitive_any() {
        let rule = RoutingRule::new("kw").with_keywords(["Deploy", "rollback"]);
        assert!(rule.matches(&text("please DEPLOY now"), None, None));
        assert!(rule.matches(&text("Rollback!"), None, None));
        assert!(!rule.matches(&text("nothing to see"), None, None));
    }

    #[test]
    fn test_role_and_type_filters() {
        let rule = RoutingRule::new("f")
            .from_role(AgentRole::User)
            .to_role(AgentRole::Assistant)
            .of_type(MessageType::Text);
        let msg = text("hi");
        assert!(rule.matches(&msg, Some(AgentRole::User), Some(AgentRole::Assistant)));
        assert!(!rule.matches(&msg, Some(AgentRole::Coder), Some(AgentRole::Assistant)));
        assert!(!rule.matches(&msg, None, Some(AgentRole::Assistant)));
        let code = AgentMessage::new("s", "r", "x", MessageType::Code);
        assert!(!rule.matches(&code, Some(AgentRole::User), Some(AgentRole::Assistant)));
    }

    #[test]
    fn test_prefix_transform_and_closure() {
        let prefix = PrefixContent("[fwd] ".to_string());
        assert_eq!(prefix.apply(text("hi")).content, "[fwd] hi");

        let upper = |mut m: AgentMessage| {
            m.content = m.content.to_uppercase();
            m
        };
        let rule = RoutingRule::new("t").with_transform(upper);
        let out = rule.transform.as_ref().unwrap().apply(text("hi"));
        assert_eq!(out.content, "HI");
    }

    #[test]
    fn test_rule_from_json_defaults() {
        let rule: RoutingRule = serde_json::from_str(
            r#"{"description": "to testers", "forward_target_role": "tester", "priority": "low"}"#,
        )
        .unwrap();
        assert!(rule.enabled);
        assert!(!rule.intercept_original);
        assert_eq!(rule.priority, MessagePriority::Low);
        assert_eq!(rule.forward_target_role, Some(AgentRole::Tester));
        assert!(rule.id.is_empty());
    }
}
