//! Message routing: applies routing rules to an inbound message
//!
//! Every enabled rule that matches contributes its effects: interception of
//! the original (sticky once set) and forwarded copies to an explicit agent
//! or to every agent holding a role. Forwards the communication matrix does
//! not permit are dropped with a warning.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};

use crate::directory::AgentDirectory;
use crate::matrix::CommunicationMatrix;
use crate::rules::{RoutingRule, RuleStore};
use crate::types::{AgentInfo, AgentMessage, AgentRole, MessagePriority};

/// A message ready to be queued, tagged with its delivery bucket
#[derive(Debug, Clone, PartialEq)]
pub struct RoutedMessage {
    pub message: AgentMessage,
    pub priority: MessagePriority,
}

/// Result of routing one message
#[derive(Debug, Clone, Default)]
pub struct RouteOutcome {
    /// Original (unless intercepted) followed by forwarded copies
    pub messages: Vec<RoutedMessage>,
    /// Whether any matching rule suppressed the original delivery
    pub intercepted: bool,
    /// Ids of every rule that matched the original, in evaluation order
    pub applied_rule_ids: Vec<String>,
}

impl RouteOutcome {
    /// The original message, if it survived routing
    pub fn original(&self) -> Option<&RoutedMessage> {
        self.messages.iter().find(|m| !m.message.is_forwarded())
    }

    pub fn forwarded(&self) -> impl Iterator<Item = &RoutedMessage> {
        self.messages.iter().filter(|m| m.message.is_forwarded())
    }
}

/// A forwarded copy awaiting its tags and transform
struct PendingForward<'a> {
    copy: AgentMessage,
    rule: &'a RoutingRule,
    target_role: AgentRole,
}

pub struct MessageRouter {
    rules: Arc<RuleStore>,
    directory: Arc<dyn AgentDirectory>,
    matrix: Arc<CommunicationMatrix>,
}

impl MessageRouter {
    pub fn new(
        rules: Arc<RuleStore>,
        directory: Arc<dyn AgentDirectory>,
        matrix: Arc<CommunicationMatrix>,
    ) -> Self {
        Self {
            rules,
            directory,
            matrix,
        }
    }

    pub fn rules(&self) -> &Arc<RuleStore> {
        &self.rules
    }

    pub fn directory(&self) -> &Arc<dyn AgentDirectory> {
        &self.directory
    }

    pub fn matrix(&self) -> &CommunicationMatrix {
        &self.matrix
    }

    /// Route a message against the current rule snapshot
    pub async fn route(&self, message: AgentMessage) -> RouteOutcome {
        let rules = self.rules.snapshot().await;
        let sender_role = self.role_of(&message.sender_id).await;
        let receiver_role = self.role_of(&message.receiver_id).await;

        let mut intercepted = false;
        let mut original_priority: Option<MessagePriority> = None;
        let mut applied_rule_ids = Vec::new();
        let mut forwards: Vec<PendingForward> = Vec::new();

        for rule in rules.iter().filter(|r| r.enabled) {
            if !rule.matches(&message, sender_role, receiver_role) {
                continue;
            }
            debug!(
                "Router: rule '{}' matched message {} ({} -> {})",
                rule.id, message.id, message.sender_id, message.receiver_id
            );
            applied_rule_ids.push(rule.id.clone());
            original_priority = original_priority.max(Some(rule.priority));

            if rule.intercept_original {
                intercepted = true;
            }
            if rule.forwards() {
                for target in self.forward_targets(rule).await {
                    if let Some(copy) = self.forward_copy(rule, &message, sender_role, &target) {
                        forwards.push(PendingForward {
                            copy,
                            rule,
                            target_role: target.role,
                        });
                    }
                }
            }
        }

        // The original receiver already gets the message unless it was intercepted
        if !intercepted {
            forwards.retain(|f| {
                let keep = f.copy.receiver_id != message.receiver_id;
                if !keep {
                    debug!(
                        "Router: rule '{}' skips a copy of {} to its own receiver '{}'",
                        f.rule.id, message.id, message.receiver_id
                    );
                }
                keep
            });
        }

        let mut messages = Vec::with_capacity(forwards.len() + 1);
        if intercepted {
            debug!("Router: original message {} intercepted", message.id);
        } else {
            messages.push(RoutedMessage {
                message,
                priority: original_priority.unwrap_or_default(),
            });
        }

        for PendingForward {
            mut copy,
            rule,
            target_role,
        } in forwards
        {
            copy.metadata_mut().applied_rule_ids = applied_rule_ids.clone();
            let copy = match &rule.transform {
                Some(transform) => transform.apply(copy),
                None => copy,
            };
            let priority = self
                .priority_of_forward(&rules, &copy, sender_role, target_role)
                .max(rule.priority);
            messages.push(RoutedMessage {
                message: copy,
                priority,
            });
        }

        RouteOutcome {
            messages,
            intercepted,
            applied_rule_ids,
        }
    }

    async fn role_of(&self, agent_id: &str) -> Option<AgentRole> {
        self.directory.resolve(agent_id).await.map(|a| a.role)
    }

    async fn forward_targets(&self, rule: &RoutingRule) -> Vec<AgentInfo> {
        if let Some(id) = &rule.forward_target_id {
            return match self.directory.resolve(id).await {
                Some(agent) => vec![agent],
                None => {
                    warn!("Router: rule '{}' forwards to unknown agent '{}'", rule.id, id);
                    Vec::new()
                }
            };
        }
        match rule.forward_target_role {
            Some(role) => self.directory.by_role(role).await,
            None => Vec::new(),
        }
    }

    fn forward_copy(
        &self,
        rule: &RoutingRule,
        message: &AgentMessage,
        sender_role: Option<AgentRole>,
        target: &AgentInfo,
    ) -> Option<AgentMessage> {
        let allowed =
            sender_role.is_some_and(|from| self.matrix.can_communicate(from, target.role));
        if !allowed {
            warn!(
                "Router: rule '{}' cannot forward {} from '{}' to '{}' ({}): roles may not communicate",
                rule.id, message.id, message.sender_id, target.id, target.role
            );
            return None;
        }

        let mut copy = message.clone();
        copy.id = uuid::Uuid::new_v4().to_string();
        copy.created_at = Utc::now();
        copy.receiver_id = target.id.clone();
        let meta = copy.metadata_mut();
        meta.forwarded = true;
        meta.original_receiver_id = Some(message.receiver_id.clone());
        debug!(
            "Router: rule '{}' forwarded {} to '{}' as {}",
            rule.id, message.id, target.id, copy.id
        );
        Some(copy)
    }

    /// Highest priority among enabled rules matching a forwarded copy
    fn priority_of_forward(
        &self,
        rules: &[RoutingRule],
        copy: &AgentMessage,
        sender_role: Option<AgentRole>,
        target_role: AgentRole,
    ) -> MessagePriority {
        rules
            .iter()
            .filter(|r| r.enabled && r.matches(copy, sender_role, Some(target_role)))
            .map(|r| r.priority)
            .max()
            .unwrap_or_default()
    }
}
