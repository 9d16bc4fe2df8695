//! Permission engine (C5): pure rule evaluation against the store, with no
//! bus or network dependency, so it stays unit-testable in isolation (§9
//! "keeps the permission engine unit-testable without any network").

use std::sync::Arc;

use chat_core::{AuthContext, ChatError, ChatResult, ConversationType, MessagingRule, RateLimitWindow};
use chat_store::Store;
use time::{Duration, OffsetDateTime, Time};
use uuid::Uuid;

/// Outcome of [`PermissionEngine::can_send_message`] (§4.5).
#[derive(Debug, Clone)]
pub struct Decision {
    pub allowed: bool,
    pub matched_rule: Option<MessagingRule>,
    pub requires_approval: bool,
    pub reason: String,
}

impl Decision {
    fn allow(reason: impl Into<String>) -> Self {
        Decision {
            allowed: true,
            matched_rule: None,
            requires_approval: false,
            reason: reason.into(),
        }
    }

    fn allow_by_rule(rule: MessagingRule, reason: impl Into<String>) -> Self {
        Decision {
            allowed: true,
            matched_rule: Some(rule),
            requires_approval: false,
            reason: reason.into(),
        }
    }

    fn deny(reason: impl Into<String>) -> Self {
        Decision {
            allowed: false,
            matched_rule: None,
            requires_approval: false,
            reason: reason.into(),
        }
    }

    fn deny_by_rule(rule: MessagingRule, requires_approval: bool, reason: impl Into<String>) -> Self {
        Decision {
            allowed: false,
            matched_rule: Some(rule),
            requires_approval,
            reason: reason.into(),
        }
    }
}

#[derive(Clone)]
pub struct PermissionEngine {
    store: Arc<dyn Store>,
    rate_limit_window: RateLimitWindow,
}

impl PermissionEngine {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            rate_limit_window: RateLimitWindow::default(),
        }
    }

    pub fn with_rate_limit_window(store: Arc<dyn Store>, rate_limit_window: RateLimitWindow) -> Self {
        Self {
            store,
            rate_limit_window,
        }
    }

    /// Evaluates §4.5 step-by-step; the first conclusive outcome wins.
    pub async fn can_send_message(&self, sender: &AuthContext, recipient: &AuthContext) -> ChatResult<Decision> {
        if sender.user_id == recipient.user_id {
            return Ok(Decision::allow("self"));
        }

        if self
            .store
            .is_blocked_either_direction(&sender.user_id, &recipient.user_id)
            .await?
        {
            return Ok(Decision::deny("blocked"));
        }

        if sender.tenant_id.is_some() && sender.tenant_id == recipient.tenant_id {
            return Ok(Decision::allow("same tenant"));
        }

        if self.store.accepted_between(&sender.user_id, &recipient.user_id).await? {
            return Ok(Decision::allow("approved contact"));
        }

        let now = OffsetDateTime::now_utc();
        for rule in self.store.active_rules_by_priority().await? {
            if !matches_rule(&rule, sender, recipient) {
                continue;
            }

            if rule.require_approval {
                let pending = self
                    .store
                    .pending_request(&sender.user_id, &recipient.user_id, now)
                    .await?;
                let reason = if pending.is_some() { "pending" } else { "request-required" };
                return Ok(Decision::deny_by_rule(rule, true, reason));
            }

            if let Some(limit) = rule.max_messages_per_day {
                let conversation = self
                    .store
                    .find_direct_conversation(&sender.user_id, &recipient.user_id)
                    .await?;
                let since = match self.rate_limit_window {
                    RateLimitWindow::Rolling24h => now - Duration::hours(24),
                    RateLimitWindow::UtcDay => midnight_utc(now),
                };
                let sent_today = match conversation {
                    Some(conv) => {
                        self.store
                            .count_messages_since(conv.id, &sender.user_id, since)
                            .await?
                    }
                    None => 0,
                };
                if sent_today >= limit as i64 {
                    return Ok(Decision::deny_by_rule(rule, false, "rate-limit"));
                }
                return Ok(Decision::allow_by_rule(rule, "rule matched"));
            }

            return Ok(Decision::allow_by_rule(rule, "rule matched"));
        }

        Ok(Decision::deny("no rule"))
    }

    /// `SUPPORT` is always allowed; `DIRECT` delegates to
    /// [`Self::can_send_message`] against the sole other participant;
    /// `GROUP` requires every other participant to pass, returning the
    /// first denial with the offending user id folded into the reason.
    pub async fn can_create_conversation(
        &self,
        creator: &AuthContext,
        conv_type: ConversationType,
        others: &[AuthContext],
    ) -> ChatResult<Decision> {
        match conv_type {
            ConversationType::Support => Ok(Decision::allow("support conversations are always allowed")),
            ConversationType::Direct => {
                let other = others
                    .first()
                    .ok_or_else(|| ChatError::validation("direct conversation requires exactly one other participant", vec!["participantIds".into()]))?;
                self.can_send_message(creator, other).await
            }
            ConversationType::Group | ConversationType::Announcement => {
                for other in others {
                    let decision = self.can_send_message(creator, other).await?;
                    if !decision.allowed {
                        return Ok(Decision {
                            reason: format!("{} ({})", decision.reason, other.user_id),
                            ..decision
                        });
                    }
                }
                Ok(Decision::allow("all participants permitted"))
            }
        }
    }

    pub async fn is_participant(&self, user_id: &str, conversation_id: Uuid) -> ChatResult<bool> {
        Ok(self.store.get_participant(conversation_id, user_id).await?.is_some())
    }

    pub async fn is_conversation_admin(&self, user_id: &str, conversation_id: Uuid) -> ChatResult<bool> {
        Ok(self
            .store
            .get_participant(conversation_id, user_id)
            .await?
            .map(|p| p.role.is_admin_or_owner())
            .unwrap_or(false))
    }
}

fn matches_rule(rule: &MessagingRule, sender: &AuthContext, recipient: &AuthContext) -> bool {
    let source_ok = match rule.source_scope {
        chat_core::RuleScope::Tenant => {
            sender.tenant_id.is_some() && has_role(&sender.tenant_role, &rule.source_roles)
        }
        chat_core::RuleScope::Platform => {
            has_role(&sender.tenant_role, &rule.source_roles) || has_role(&sender.platform_role, &rule.source_roles)
        }
    };
    if !source_ok {
        return false;
    }

    match rule.target_scope {
        chat_core::RuleScope::Tenant => {
            sender.tenant_id.is_some()
                && sender.tenant_id == recipient.tenant_id
                && has_role(&recipient.tenant_role, &rule.target_roles)
        }
        chat_core::RuleScope::Platform => {
            has_role(&recipient.tenant_role, &rule.target_roles) || has_role(&recipient.platform_role, &rule.target_roles)
        }
    }
}

fn has_role(role: &Option<String>, allowed: &[String]) -> bool {
    role.as_deref().is_some_and(|r| allowed.iter().any(|a| a == r))
}

fn midnight_utc(now: OffsetDateTime) -> OffsetDateTime {
    now.replace_time(Time::MIDNIGHT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chat_store::{InMemoryStore, NewBlock, NewContactRequest};

    fn party(user_id: &str, tenant_id: Option<&str>, tenant_role: Option<&str>, platform_role: Option<&str>) -> AuthContext {
        AuthContext {
            user_id: user_id.to_string(),
            tenant_id: tenant_id.map(str::to_string),
            tenant_role: tenant_role.map(str::to_string),
            platform_role: platform_role.map(str::to_string),
            email: None,
            display_name: None,
        }
    }

    async fn engine_with_defaults() -> PermissionEngine {
        let store = InMemoryStore::new();
        store.seed_default_rules_if_empty().await.unwrap();
        PermissionEngine::new(Arc::new(store))
    }

    #[tokio::test]
    async fn same_tenant_is_allowed_without_a_rule() {
        let engine = engine_with_defaults().await;
        let sender = party("u1", Some("acme"), Some("member"), None);
        let recipient = party("u2", Some("acme"), Some("member"), None);
        let decision = engine.can_send_message(&sender, &recipient).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.reason, "same tenant");
    }

    #[tokio::test]
    async fn blocked_short_circuits_before_rules() {
        let store = InMemoryStore::new();
        store.seed_default_rules_if_empty().await.unwrap();
        store
            .create_block(
                NewBlock {
                    user_id: "u2".into(),
                    blocked_user_id: "u1".into(),
                    reason: None,
                },
                OffsetDateTime::now_utc(),
            )
            .await
            .unwrap();
        let engine = PermissionEngine::new(Arc::new(store));
        let sender = party("u1", Some("acme"), Some("member"), None);
        let recipient = party("u2", Some("other"), Some("member"), None);
        let decision = engine.can_send_message(&sender, &recipient).await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.reason, "blocked");
    }

    #[tokio::test]
    async fn cross_org_rule_requires_approval_then_honors_pending_request() {
        let engine = engine_with_defaults().await;
        let sender = party("u1", Some("acme"), None, Some("owner"));
        let recipient = party("u2", Some("other"), None, Some("admin"));

        let decision = engine.can_send_message(&sender, &recipient).await.unwrap();
        assert!(!decision.allowed);
        assert!(decision.requires_approval);
        assert_eq!(decision.reason, "request-required");
        assert_eq!(decision.matched_rule.unwrap().id, "cross-org-managers");

        engine
            .store
            .create_contact_request(
                NewContactRequest {
                    from_user_id: "u1".into(),
                    from_tenant_id: Some("acme".into()),
                    to_user_id: "u2".into(),
                    to_tenant_id: Some("other".into()),
                    rule_id: "cross-org-managers".into(),
                    message: None,
                    expires_at: OffsetDateTime::now_utc() + time::Duration::days(7),
                },
                OffsetDateTime::now_utc(),
            )
            .await
            .unwrap();

        let decision = engine.can_send_message(&sender, &recipient).await.unwrap();
        assert_eq!(decision.reason, "pending");
    }

    #[tokio::test]
    async fn no_matching_rule_is_denied() {
        let engine = engine_with_defaults().await;
        let sender = party("u1", None, None, None);
        let recipient = party("u2", None, None, None);
        let decision = engine.can_send_message(&sender, &recipient).await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.reason, "no rule");
    }
}
