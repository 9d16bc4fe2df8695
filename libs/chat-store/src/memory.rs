//! In-memory [`Store`]: used by unit/integration tests and local dev
//! without a running Postgres, matching the workspace's own
//! `InMemoryBusClient`/`InMemoryIdemStore` pattern for testability without
//! network (§1.4).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chat_core::{
    AuthContext, BlockedUser, ContactRequest, ContactRequestStatus, Conversation, ConversationType,
    Message, MessagingRule, Participant, ParticipantRole, RuleScope, UserCache,
};
use time::OffsetDateTime;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::model::{NewBlock, NewContactRequest, NewConversation, NewMessage, NewParticipant};
use crate::Store;

#[derive(Default)]
struct Inner {
    conversations: HashMap<Uuid, Conversation>,
    participants: HashMap<(Uuid, String), Participant>,
    messages: HashMap<Uuid, Message>,
    user_cache: HashMap<String, UserCache>,
    rules: Vec<MessagingRule>,
    contact_requests: HashMap<Uuid, ContactRequest>,
    blocks: Vec<BlockedUser>,
    directory: HashMap<String, AuthContext>,
}

#[derive(Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test/dev helper: seed the read-only user cache the external sync
    /// would otherwise populate.
    pub async fn put_user_cache(&self, user: UserCache) {
        self.inner.write().await.user_cache.insert(user.id.clone(), user);
    }
}

fn participants_of(inner: &Inner, conversation_id: Uuid) -> Vec<Participant> {
    inner
        .participants
        .values()
        .filter(|p| p.conversation_id == conversation_id)
        .cloned()
        .collect()
}

#[async_trait]
impl Store for InMemoryStore {
    async fn get_user_cache(&self, user_id: &str) -> StoreResult<Option<UserCache>> {
        Ok(self.inner.read().await.user_cache.get(user_id).cloned())
    }

    async fn upsert_directory_entry(&self, ctx: &AuthContext) -> StoreResult<()> {
        self.inner.write().await.directory.insert(ctx.user_id.clone(), ctx.clone());
        Ok(())
    }

    async fn get_directory_entry(&self, user_id: &str) -> StoreResult<Option<AuthContext>> {
        Ok(self.inner.read().await.directory.get(user_id).cloned())
    }

    async fn create_conversation(
        &self,
        conv: NewConversation,
        participants: Vec<NewParticipant>,
    ) -> StoreResult<Conversation> {
        let mut inner = self.inner.write().await;
        let now = OffsetDateTime::now_utc();

        if conv.conv_type == ConversationType::Direct {
            if let [a, b] = &participants[..] {
                let existing = inner.conversations.values().find(|c| {
                    c.conv_type == ConversationType::Direct
                        && participants_of(&inner, c.id)
                            .iter()
                            .map(|p| p.user_id.clone())
                            .collect::<std::collections::HashSet<_>>()
                            == [a.user_id.clone(), b.user_id.clone()]
                                .into_iter()
                                .collect::<std::collections::HashSet<_>>()
                });
                if let Some(existing) = existing {
                    return Ok(existing.clone());
                }
            }
        }

        let id = Uuid::new_v4();
        let conversation = Conversation {
            id,
            conv_type: conv.conv_type,
            name: conv.name,
            description: conv.description,
            avatar_url: conv.avatar_url,
            created_at: now,
            updated_at: now,
        };
        inner.conversations.insert(id, conversation.clone());
        for p in participants {
            let participant = Participant {
                conversation_id: id,
                user_id: p.user_id.clone(),
                tenant_id: p.tenant_id,
                role: p.role,
                joined_at: now,
                last_read_at: None,
            };
            inner
                .participants
                .insert((id, p.user_id), participant);
        }
        Ok(conversation)
    }

    async fn get_conversation(&self, id: Uuid) -> StoreResult<Option<Conversation>> {
        Ok(self.inner.read().await.conversations.get(&id).cloned())
    }

    async fn find_direct_conversation(&self, a: &str, b: &str) -> StoreResult<Option<Conversation>> {
        let inner = self.inner.read().await;
        let want: std::collections::HashSet<_> = [a.to_string(), b.to_string()].into_iter().collect();
        Ok(inner
            .conversations
            .values()
            .find(|c| {
                c.conv_type == ConversationType::Direct
                    && participants_of(&inner, c.id)
                        .iter()
                        .map(|p| p.user_id.clone())
                        .collect::<std::collections::HashSet<_>>()
                        == want
            })
            .cloned())
    }

    async fn touch_conversation(&self, id: Uuid, at: OffsetDateTime) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let conv = inner
            .conversations
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("conversation {id}")))?;
        conv.updated_at = at;
        Ok(())
    }

    async fn conversations_for_user(
        &self,
        user_id: &str,
        limit: u32,
        cursor: Option<OffsetDateTime>,
    ) -> StoreResult<Vec<Conversation>> {
        let inner = self.inner.read().await;
        let mut ids: Vec<Uuid> = inner
            .participants
            .values()
            .filter(|p| p.user_id == user_id)
            .map(|p| p.conversation_id)
            .collect();
        ids.sort();
        ids.dedup();
        let mut convs: Vec<Conversation> = ids
            .into_iter()
            .filter_map(|id| inner.conversations.get(&id).cloned())
            .filter(|c| cursor.is_none_or(|cur| c.updated_at < cur))
            .collect();
        convs.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        convs.truncate(limit as usize);
        Ok(convs)
    }

    async fn add_participant(&self, p: NewParticipant, joined_at: OffsetDateTime) -> StoreResult<Participant> {
        let mut inner = self.inner.write().await;
        let key = (p.conversation_id, p.user_id.clone());
        if inner.participants.contains_key(&key) {
            return Err(StoreError::Conflict(format!(
                "participant {} already in conversation {}",
                p.user_id, p.conversation_id
            )));
        }
        let participant = Participant {
            conversation_id: p.conversation_id,
            user_id: p.user_id,
            tenant_id: p.tenant_id,
            role: p.role,
            joined_at,
            last_read_at: None,
        };
        inner.participants.insert(key, participant.clone());
        Ok(participant)
    }

    async fn get_participant(&self, conversation_id: Uuid, user_id: &str) -> StoreResult<Option<Participant>> {
        Ok(self
            .inner
            .read()
            .await
            .participants
            .get(&(conversation_id, user_id.to_string()))
            .cloned())
    }

    async fn participants_for_conversation(&self, conversation_id: Uuid) -> StoreResult<Vec<Participant>> {
        Ok(participants_of(&*self.inner.read().await, conversation_id))
    }

    async fn participants_for_user(&self, user_id: &str) -> StoreResult<Vec<Participant>> {
        Ok(self
            .inner
            .read()
            .await
            .participants
            .values()
            .filter(|p| p.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn set_last_read_at(&self, conversation_id: Uuid, user_id: &str, at: OffsetDateTime) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let participant = inner
            .participants
            .get_mut(&(conversation_id, user_id.to_string()))
            .ok_or_else(|| StoreError::NotFound(format!("participant {user_id} in {conversation_id}")))?;
        // Idempotent: never move the watermark backwards (P7).
        if participant.last_read_at.is_none_or(|prev| prev < at) {
            participant.last_read_at = Some(at);
        }
        Ok(())
    }

    async fn insert_message(&self, msg: NewMessage, created_at: OffsetDateTime) -> StoreResult<Message> {
        let mut inner = self.inner.write().await;
        let id = Uuid::new_v4();
        let message = Message {
            id,
            conversation_id: msg.conversation_id,
            sender_id: msg.sender_id,
            content: msg.content,
            msg_type: msg.msg_type,
            attachment_url: msg.attachment_url,
            attachment_type: msg.attachment_type,
            attachment_name: msg.attachment_name,
            reply_to_id: msg.reply_to_id,
            created_at,
            edited_at: None,
            deleted_at: None,
        };
        inner.messages.insert(id, message.clone());
        Ok(message)
    }

    async fn get_message(&self, conversation_id: Uuid, message_id: Uuid) -> StoreResult<Option<Message>> {
        Ok(self
            .inner
            .read()
            .await
            .messages
            .get(&message_id)
            .filter(|m| m.conversation_id == conversation_id)
            .cloned())
    }

    async fn messages_in(
        &self,
        conversation_id: Uuid,
        limit: u32,
        cursor: Option<OffsetDateTime>,
    ) -> StoreResult<Vec<Message>> {
        let inner = self.inner.read().await;
        let mut msgs: Vec<Message> = inner
            .messages
            .values()
            .filter(|m| m.conversation_id == conversation_id && !m.is_deleted())
            .filter(|m| cursor.is_none_or(|cur| m.created_at < cur))
            .cloned()
            .collect();
        msgs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        msgs.truncate(limit as usize);
        Ok(msgs)
    }

    async fn last_message(&self, conversation_id: Uuid) -> StoreResult<Option<Message>> {
        Ok(self
            .inner
            .read()
            .await
            .messages
            .values()
            .filter(|m| m.conversation_id == conversation_id && !m.is_deleted())
            .max_by_key(|m| m.created_at)
            .cloned())
    }

    async fn count_unread(
        &self,
        conversation_id: Uuid,
        user_id: &str,
        since_read_at: Option<OffsetDateTime>,
    ) -> StoreResult<i64> {
        let inner = self.inner.read().await;
        let count = inner
            .messages
            .values()
            .filter(|m| {
                m.conversation_id == conversation_id
                    && !m.is_deleted()
                    && m.sender_id != user_id
                    && since_read_at.is_none_or(|since| m.created_at > since)
            })
            .count();
        Ok(count as i64)
    }

    async fn count_messages_since(
        &self,
        conversation_id: Uuid,
        sender_id: &str,
        since: OffsetDateTime,
    ) -> StoreResult<i64> {
        let inner = self.inner.read().await;
        let count = inner
            .messages
            .values()
            .filter(|m| {
                m.conversation_id == conversation_id
                    && m.sender_id == sender_id
                    && !m.is_deleted()
                    && m.created_at >= since
            })
            .count();
        Ok(count as i64)
    }

    async fn active_rules_by_priority(&self) -> StoreResult<Vec<MessagingRule>> {
        let inner = self.inner.read().await;
        let mut rules: Vec<MessagingRule> = inner.rules.iter().filter(|r| r.is_active).cloned().collect();
        rules.sort_by(|a, b| b.priority.cmp(&a.priority));
        Ok(rules)
    }

    async fn seed_default_rules_if_empty(&self) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        if !inner.rules.is_empty() {
            return Ok(());
        }
        inner.rules = default_rules();
        Ok(())
    }

    async fn create_contact_request(
        &self,
        req: NewContactRequest,
        now: OffsetDateTime,
    ) -> StoreResult<ContactRequest> {
        let mut inner = self.inner.write().await;
        let already_pending = inner.contact_requests.values().any(|r| {
            r.from_user_id == req.from_user_id
                && r.to_user_id == req.to_user_id
                && r.effective_status(now) == ContactRequestStatus::Pending
        });
        if already_pending {
            return Err(StoreError::Conflict(format!(
                "pending contact request already exists from {} to {}",
                req.from_user_id, req.to_user_id
            )));
        }
        let id = Uuid::new_v4();
        let request = ContactRequest {
            id,
            from_user_id: req.from_user_id,
            from_tenant_id: req.from_tenant_id,
            to_user_id: req.to_user_id,
            to_tenant_id: req.to_tenant_id,
            rule_id: req.rule_id,
            message: req.message,
            status: ContactRequestStatus::Pending,
            created_at: now,
            responded_at: None,
            expires_at: req.expires_at,
        };
        inner.contact_requests.insert(id, request.clone());
        Ok(request)
    }

    async fn get_contact_request(&self, id: Uuid) -> StoreResult<Option<ContactRequest>> {
        Ok(self.inner.read().await.contact_requests.get(&id).cloned())
    }

    async fn pending_request(
        &self,
        from: &str,
        to: &str,
        now: OffsetDateTime,
    ) -> StoreResult<Option<ContactRequest>> {
        Ok(self
            .inner
            .read()
            .await
            .contact_requests
            .values()
            .find(|r| r.from_user_id == from && r.to_user_id == to && r.effective_status(now) == ContactRequestStatus::Pending)
            .cloned())
    }

    async fn accepted_between(&self, a: &str, b: &str) -> StoreResult<bool> {
        Ok(self.inner.read().await.contact_requests.values().any(|r| {
            r.status == ContactRequestStatus::Accepted
                && ((r.from_user_id == a && r.to_user_id == b) || (r.from_user_id == b && r.to_user_id == a))
        }))
    }

    async fn requests_received(&self, user_id: &str, now: OffsetDateTime) -> StoreResult<Vec<ContactRequest>> {
        let mut requests: Vec<ContactRequest> = self
            .inner
            .read()
            .await
            .contact_requests
            .values()
            .filter(|r| r.to_user_id == user_id)
            .map(|r| {
                let mut r = r.clone();
                r.status = r.effective_status(now);
                r
            })
            .collect();
        requests.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(requests)
    }

    async fn requests_sent(&self, user_id: &str, now: OffsetDateTime) -> StoreResult<Vec<ContactRequest>> {
        let mut requests: Vec<ContactRequest> = self
            .inner
            .read()
            .await
            .contact_requests
            .values()
            .filter(|r| r.from_user_id == user_id)
            .map(|r| {
                let mut r = r.clone();
                r.status = r.effective_status(now);
                r
            })
            .collect();
        requests.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(requests)
    }

    async fn respond_to_request(&self, id: Uuid, accept: bool, at: OffsetDateTime) -> StoreResult<ContactRequest> {
        let mut inner = self.inner.write().await;
        let request = inner
            .contact_requests
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("contact request {id}")))?;
        request.status = if accept {
            ContactRequestStatus::Accepted
        } else {
            ContactRequestStatus::Declined
        };
        request.responded_at = Some(at);
        Ok(request.clone())
    }

    async fn create_block(&self, block: NewBlock, at: OffsetDateTime) -> StoreResult<BlockedUser> {
        let mut inner = self.inner.write().await;
        if block.user_id == block.blocked_user_id {
            return Err(StoreError::Conflict("cannot block yourself".into()));
        }
        if inner
            .blocks
            .iter()
            .any(|b| b.user_id == block.user_id && b.blocked_user_id == block.blocked_user_id)
        {
            return Err(StoreError::Conflict(format!(
                "{} already blocked {}",
                block.user_id, block.blocked_user_id
            )));
        }
        let row = BlockedUser {
            user_id: block.user_id,
            blocked_user_id: block.blocked_user_id,
            reason: block.reason,
            created_at: at,
        };
        inner.blocks.push(row.clone());
        Ok(row)
    }

    async fn remove_block(&self, user_id: &str, blocked_user_id: &str) -> StoreResult<bool> {
        let mut inner = self.inner.write().await;
        let before = inner.blocks.len();
        inner
            .blocks
            .retain(|b| !(b.user_id == user_id && b.blocked_user_id == blocked_user_id));
        Ok(inner.blocks.len() != before)
    }

    async fn is_blocked_either_direction(&self, a: &str, b: &str) -> StoreResult<bool> {
        Ok(self.inner.read().await.blocks.iter().any(|block| {
            (block.user_id == a && block.blocked_user_id == b)
                || (block.user_id == b && block.blocked_user_id == a)
        }))
    }

    async fn blocks_for_user(&self, user_id: &str) -> StoreResult<Vec<BlockedUser>> {
        Ok(self
            .inner
            .read()
            .await
            .blocks
            .iter()
            .filter(|b| b.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}

/// Default rule set seeded when the rule table is empty (§6.4).
pub(crate) fn default_rules() -> Vec<MessagingRule> {
    vec![
        MessagingRule {
            id: "team-internal".into(),
            name: "Team internal".into(),
            source_scope: RuleScope::Tenant,
            source_roles: role_list(&["owner", "admin", "member"]),
            target_scope: RuleScope::Tenant,
            target_roles: role_list(&["owner", "admin", "member"]),
            require_approval: false,
            max_messages_per_day: None,
            is_active: true,
            priority: 100,
        },
        MessagingRule {
            id: "support-channel".into(),
            name: "Support channel".into(),
            source_scope: RuleScope::Platform,
            source_roles: role_list(&["owner", "admin", "member"]),
            target_scope: RuleScope::Platform,
            target_roles: role_list(&["platform_support"]),
            require_approval: false,
            max_messages_per_day: None,
            is_active: true,
            priority: 90,
        },
        MessagingRule {
            id: "platform-announcements".into(),
            name: "Platform announcements".into(),
            source_scope: RuleScope::Platform,
            source_roles: role_list(&["platform_admin"]),
            target_scope: RuleScope::Platform,
            target_roles: role_list(&["owner", "admin", "member"]),
            require_approval: false,
            max_messages_per_day: None,
            is_active: true,
            priority: 80,
        },
        MessagingRule {
            id: "cross-org-managers".into(),
            name: "Cross-org managers".into(),
            source_scope: RuleScope::Platform,
            source_roles: role_list(&["owner", "admin"]),
            target_scope: RuleScope::Platform,
            target_roles: role_list(&["owner", "admin"]),
            require_approval: true,
            max_messages_per_day: Some(10),
            is_active: true,
            priority: 50,
        },
    ]
}

fn role_list(roles: &[&str]) -> Vec<String> {
    roles.iter().map(|r| r.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NewParticipant;

    fn participant(conversation_id: Uuid, user_id: &str, role: ParticipantRole) -> NewParticipant {
        NewParticipant {
            conversation_id,
            user_id: user_id.to_string(),
            tenant_id: None,
            role,
        }
    }

    #[tokio::test]
    async fn direct_conversation_is_idempotent() {
        let store = InMemoryStore::new();
        let conv = store
            .create_conversation(
                NewConversation {
                    conv_type: ConversationType::Direct,
                    name: None,
                    description: None,
                    avatar_url: None,
                },
                vec![
                    participant(Uuid::nil(), "u1", ParticipantRole::Owner),
                    participant(Uuid::nil(), "u2", ParticipantRole::Member),
                ],
            )
            .await
            .unwrap();

        let again = store
            .create_conversation(
                NewConversation {
                    conv_type: ConversationType::Direct,
                    name: None,
                    description: None,
                    avatar_url: None,
                },
                vec![
                    participant(Uuid::nil(), "u2", ParticipantRole::Owner),
                    participant(Uuid::nil(), "u1", ParticipantRole::Member),
                ],
            )
            .await
            .unwrap();

        assert_eq!(conv.id, again.id);
    }

    #[tokio::test]
    async fn unread_excludes_own_and_deleted() {
        let store = InMemoryStore::new();
        let conv = store
            .create_conversation(
                NewConversation {
                    conv_type: ConversationType::Direct,
                    name: None,
                    description: None,
                    avatar_url: None,
                },
                vec![
                    participant(Uuid::nil(), "u1", ParticipantRole::Owner),
                    participant(Uuid::nil(), "u2", ParticipantRole::Member),
                ],
            )
            .await
            .unwrap();

        for _ in 0..3 {
            store
                .insert_message(
                    NewMessage {
                        conversation_id: conv.id,
                        sender_id: "u2".into(),
                        content: "hi".into(),
                        msg_type: chat_core::MessageType::Text,
                        attachment_url: None,
                        attachment_type: None,
                        attachment_name: None,
                        reply_to_id: None,
                    },
                    OffsetDateTime::now_utc(),
                )
                .await
                .unwrap();
        }
        store
            .insert_message(
                NewMessage {
                    conversation_id: conv.id,
                    sender_id: "u1".into(),
                    content: "mine".into(),
                    msg_type: chat_core::MessageType::Text,
                    attachment_url: None,
                    attachment_type: None,
                    attachment_name: None,
                    reply_to_id: None,
                },
                OffsetDateTime::now_utc(),
            )
            .await
            .unwrap();

        let unread = store.count_unread(conv.id, "u1", None).await.unwrap();
        assert_eq!(unread, 3);
    }
}
