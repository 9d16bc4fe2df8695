//! Conversation/message service (C6): creation, send, pagination, unread
//! counts and read watermarks, composed from [`chat_store::Store`] and
//! [`chat_permissions::PermissionEngine`] (§4.6). Pure with respect to the
//! bus — C7 is the only crate that publishes a send onward (§9 "Cross-node
//! fanout ... business services never touch the bus").

use std::sync::Arc;

use chat_core::{
    AuthContext, ChatError, ChatResult, Conversation, ConversationType, EnrichedMessage, Extra,
    Message, MessageType, PageMeta, Participant, MAX_MESSAGE_CONTENT_LEN,
};
use chat_permissions::PermissionEngine;
use chat_store::{NewConversation, NewMessage, NewParticipant, Store};
use time::OffsetDateTime;
use tracing::instrument;
use uuid::Uuid;

const MAX_PAGE_SIZE: u32 = 100;
const MAX_GROUP_PARTICIPANTS: usize = 50;

/// Input to [`ConversationService::create_conversation`] (§6.1 POST `/conversations`).
#[derive(Debug, Clone)]
pub struct CreateConversationInput {
    pub conv_type: ConversationType,
    pub name: Option<String>,
    pub description: Option<String>,
    pub participant_ids: Vec<String>,
}

/// Input to [`ConversationService::send_message`] (§6.1 POST `/conversations/:cid/messages`).
#[derive(Debug, Clone, Default)]
pub struct SendMessageInput {
    pub content: String,
    pub msg_type: Option<MessageType>,
    pub reply_to_id: Option<Uuid>,
    pub attachment_url: Option<String>,
    pub attachment_type: Option<String>,
    pub attachment_name: Option<String>,
}

/// A conversation enriched for a specific viewer: participants (presence is
/// merged in by the caller, which owns the bus), last message and unread
/// count (§4.6 `GetConversations`).
#[derive(Debug, Clone)]
pub struct ConversationView {
    pub conversation: Conversation,
    pub participants: Vec<Participant>,
    pub last_message: Option<Message>,
    pub unread_count: i64,
}

#[derive(Clone)]
pub struct ConversationService {
    store: Arc<dyn Store>,
    permissions: PermissionEngine,
}

impl ConversationService {
    pub fn new(store: Arc<dyn Store>, permissions: PermissionEngine) -> Self {
        Self { store, permissions }
    }

    /// §4.6 `CreateConversation`. Idempotent for `DIRECT`: a second call for
    /// the same pair returns the existing conversation rather than erroring.
    /// `ANNOUNCEMENT` stays rejected — reserved, no create-path (§9).
    #[instrument(skip(self, creator), fields(user_id = %creator.user_id))]
    pub async fn create_conversation(
        &self,
        creator: &AuthContext,
        input: CreateConversationInput,
    ) -> ChatResult<ConversationView> {
        if input.conv_type == ConversationType::Announcement {
            return Err(ChatError::validation(
                "ANNOUNCEMENT conversations cannot be created through this endpoint",
                vec!["type".into()],
            ));
        }
        if input.participant_ids.is_empty() {
            return Err(ChatError::validation(
                "participantIds must contain at least one user",
                vec!["participantIds".into()],
            ));
        }
        if input.participant_ids.len() > MAX_GROUP_PARTICIPANTS {
            return Err(ChatError::validation(
                format!("participantIds must contain at most {MAX_GROUP_PARTICIPANTS} users"),
                vec!["participantIds".into()],
            ));
        }
        if input.conv_type == ConversationType::Direct && input.participant_ids.len() != 1 {
            return Err(ChatError::validation(
                "DIRECT conversations require exactly one other participant",
                vec!["participantIds".into()],
            ));
        }

        let mut others = Vec::with_capacity(input.participant_ids.len());
        for id in &input.participant_ids {
            others.push(lookup_recipient(self.store.as_ref(), id).await?);
        }

        let decision = self
            .permissions
            .can_create_conversation(creator, input.conv_type, &others)
            .await?;
        if !decision.allowed {
            let target_hint = if input.conv_type == ConversationType::Direct {
                input.participant_ids.first().cloned().unwrap_or_default()
            } else {
                String::new()
            };
            return Err(permission_denial(decision, target_hint));
        }

        if input.conv_type == ConversationType::Direct {
            if let Some(existing) = self
                .store
                .find_direct_conversation(&creator.user_id, &input.participant_ids[0])
                .await?
            {
                return self.view_of(existing, &creator.user_id).await;
            }
        }

        let new_conv = NewConversation {
            conv_type: input.conv_type,
            name: input.name,
            description: input.description,
            avatar_url: None,
        };
        let mut participants = vec![NewParticipant {
            conversation_id: Uuid::nil(), // filled in by the store on create
            user_id: creator.user_id.clone(),
            tenant_id: creator.tenant_id.clone(),
            role: chat_core::ParticipantRole::Owner,
        }];
        for (id, other) in input.participant_ids.iter().zip(&others) {
            participants.push(NewParticipant {
                conversation_id: Uuid::nil(),
                user_id: id.clone(),
                tenant_id: other.tenant_id.clone(),
                role: chat_core::ParticipantRole::Member,
            });
        }

        let conversation = match self.store.create_conversation(new_conv.clone(), participants.clone()).await {
            Ok(conv) => conv,
            Err(err) if matches!(err, chat_store::StoreError::Conflict(_)) && input.conv_type == ConversationType::Direct => {
                // §5/§9: a concurrent create won the race; read and return the winner
                // rather than surfacing CONFLICT, per the "retries once" directive.
                self.store
                    .find_direct_conversation(&creator.user_id, &input.participant_ids[0])
                    .await?
                    .ok_or(err)?
            }
            Err(err) => return Err(err.into()),
        };

        self.view_of(conversation, &creator.user_id).await
    }

    /// §4.6 `SendMessage`. Requires participancy; persists the message,
    /// advances `conversation.updatedAt`, and sets the sender's own
    /// `lastReadAt` (§9 "Sender-sets-own-read-at").
    #[instrument(skip(self, sender, input), fields(user_id = %sender.user_id, %conversation_id))]
    pub async fn send_message(
        &self,
        sender: &AuthContext,
        conversation_id: Uuid,
        input: SendMessageInput,
    ) -> ChatResult<EnrichedMessage> {
        if input.content.is_empty() || input.content.chars().count() > MAX_MESSAGE_CONTENT_LEN {
            return Err(ChatError::validation(
                format!("content must be 1..{MAX_MESSAGE_CONTENT_LEN} characters"),
                vec!["content".into()],
            ));
        }
        if !self.permissions.is_participant(&sender.user_id, conversation_id).await? {
            return Err(ChatError::not_participant());
        }
        if let Some(reply_to_id) = input.reply_to_id {
            let original = self
                .store
                .get_message(conversation_id, reply_to_id)
                .await?
                .ok_or_else(|| ChatError::validation("replyToId does not exist in this conversation", vec!["replyToId".into()]))?;
            if original.conversation_id != conversation_id {
                return Err(ChatError::validation("replyToId must be in the same conversation", vec!["replyToId".into()]));
            }
        }

        let now = OffsetDateTime::now_utc();
        let new_message = NewMessage {
            conversation_id,
            sender_id: sender.user_id.clone(),
            content: input.content,
            msg_type: input.msg_type.unwrap_or(MessageType::Text),
            attachment_url: input.attachment_url,
            attachment_type: input.attachment_type,
            attachment_name: input.attachment_name,
            reply_to_id: input.reply_to_id,
        };

        let message = self.store.insert_message(new_message, now).await?;
        self.store.touch_conversation(conversation_id, now).await?;
        self.store.set_last_read_at(conversation_id, &sender.user_id, now).await?;

        let sender_cache = self
            .store
            .get_user_cache(&sender.user_id)
            .await?
            .unwrap_or_else(|| fallback_user_cache(sender));

        Ok(EnrichedMessage {
            message,
            sender: sender_cache,
        })
    }

    /// §4.6 `GetConversations`. Newest `updatedAt` first, cursor-on-`updatedAt`.
    #[instrument(skip(self), fields(%user_id))]
    pub async fn get_conversations(
        &self,
        user_id: &str,
        limit: u32,
        cursor: Option<OffsetDateTime>,
    ) -> ChatResult<(Vec<ConversationView>, PageMeta, i64)> {
        let limit = limit.clamp(1, MAX_PAGE_SIZE);
        let rows = self
            .store
            .conversations_for_user(user_id, limit + 1, cursor)
            .await?;
        let has_more = rows.len() > limit as usize;
        let mut rows = rows;
        rows.truncate(limit as usize);

        let next_cursor = rows.last().map(|c| to_cursor(c.updated_at));
        let mut views = Vec::with_capacity(rows.len());
        for conv in rows {
            views.push(self.view_of(conv, user_id).await?);
        }
        let total_unread = self.get_unread_count(user_id).await?;

        Ok((
            views,
            PageMeta {
                has_more,
                next_cursor,
            },
            total_unread,
        ))
    }

    /// §9 "`GetConversation(:id)` correctness": probes participancy directly
    /// rather than fetching a bounded page and filtering client-side.
    #[instrument(skip(self), fields(%user_id, %conversation_id))]
    pub async fn get_conversation(&self, user_id: &str, conversation_id: Uuid) -> ChatResult<ConversationView> {
        if !self.permissions.is_participant(user_id, conversation_id).await? {
            return Err(ChatError::not_found("conversation"));
        }
        let conversation = self
            .store
            .get_conversation(conversation_id)
            .await?
            .ok_or_else(|| ChatError::not_found("conversation"))?;
        self.view_of(conversation, user_id).await
    }

    /// §4.6 `GetMessages`. Participant gate; newest first; tombstones excluded.
    #[instrument(skip(self), fields(%user_id, %conversation_id))]
    pub async fn get_messages(
        &self,
        user_id: &str,
        conversation_id: Uuid,
        limit: u32,
        cursor: Option<OffsetDateTime>,
    ) -> ChatResult<(Vec<EnrichedMessage>, PageMeta)> {
        if !self.permissions.is_participant(user_id, conversation_id).await? {
            return Err(ChatError::not_participant());
        }
        let limit = limit.clamp(1, MAX_PAGE_SIZE);
        let rows = self.store.messages_in(conversation_id, limit + 1, cursor).await?;
        let has_more = rows.len() > limit as usize;
        let mut rows = rows;
        rows.truncate(limit as usize);
        let next_cursor = rows.last().map(|m| to_cursor(m.created_at));

        let mut enriched = Vec::with_capacity(rows.len());
        for message in rows {
            let sender = self
                .store
                .get_user_cache(&message.sender_id)
                .await?
                .unwrap_or_else(|| UserCacheFallback::for_sender(&message.sender_id));
            enriched.push(EnrichedMessage { message, sender });
        }

        Ok((
            enriched,
            PageMeta {
                has_more,
                next_cursor,
            },
        ))
    }

    pub async fn get_message(&self, user_id: &str, conversation_id: Uuid, message_id: Uuid) -> ChatResult<EnrichedMessage> {
        if !self.permissions.is_participant(user_id, conversation_id).await? {
            return Err(ChatError::not_participant());
        }
        let message = self
            .store
            .get_message(conversation_id, message_id)
            .await?
            .filter(|m| !m.is_deleted())
            .ok_or_else(|| ChatError::not_found("message"))?;
        let sender = self
            .store
            .get_user_cache(&message.sender_id)
            .await?
            .unwrap_or_else(|| UserCacheFallback::for_sender(&message.sender_id));
        Ok(EnrichedMessage { message, sender })
    }

    /// §4.6 `MarkAsRead`: idempotent, never moves the watermark backwards
    /// (enforced in the store, P7).
    #[instrument(skip(self), fields(%user_id, %conversation_id))]
    pub async fn mark_as_read(&self, user_id: &str, conversation_id: Uuid) -> ChatResult<()> {
        if !self.permissions.is_participant(user_id, conversation_id).await? {
            return Err(ChatError::not_participant());
        }
        self.store
            .set_last_read_at(conversation_id, user_id, OffsetDateTime::now_utc())
            .await?;
        Ok(())
    }

    /// §4.6 `GetUnreadCount`: sum over every conversation the user participates in.
    pub async fn get_unread_count(&self, user_id: &str) -> ChatResult<i64> {
        let mut total = 0i64;
        for p in self.store.participants_for_user(user_id).await? {
            total += self.store.count_unread(p.conversation_id, user_id, p.last_read_at).await?;
        }
        Ok(total)
    }

    /// §4.6 `GetParticipants`. Presence enrichment is the caller's job (C7
    /// owns the bus); this returns the bare store rows.
    pub async fn get_participants(&self, user_id: &str, conversation_id: Uuid) -> ChatResult<Vec<Participant>> {
        if !self.permissions.is_participant(user_id, conversation_id).await? {
            return Err(ChatError::not_found("conversation"));
        }
        Ok(self.store.participants_for_conversation(conversation_id).await?)
    }

    async fn view_of(&self, conversation: Conversation, user_id: &str) -> ChatResult<ConversationView> {
        let participants = self.store.participants_for_conversation(conversation.id).await?;
        let last_message = self.store.last_message(conversation.id).await?;
        let last_read_at = participants
            .iter()
            .find(|p| p.user_id == user_id)
            .and_then(|p| p.last_read_at);
        let unread_count = self.store.count_unread(conversation.id, user_id, last_read_at).await?;
        Ok(ConversationView {
            conversation,
            participants,
            last_message,
            unread_count,
        })
    }
}

/// Looks up a prospective message recipient's identity from the user cache.
/// The user cache (§3) carries no tenant/role claims — those live with the
/// external identity provider, which this service has no standing lookup
/// for beyond the caller's own handshake-time `AuthContext`. Conservative by
/// construction: rules requiring tenant/platform roles simply won't match a
/// recipient built this way, and `CanSendMessage` denies rather than guesses.
pub async fn lookup_recipient(store: &dyn Store, user_id: &str) -> ChatResult<AuthContext> {
    if let Some(ctx) = store.get_directory_entry(user_id).await? {
        return Ok(ctx);
    }
    let cache = store.get_user_cache(user_id).await?;
    Ok(AuthContext {
        user_id: user_id.to_string(),
        tenant_id: None,
        tenant_role: None,
        platform_role: None,
        email: cache.as_ref().and_then(|c| c.email.clone()),
        display_name: cache.map(|c| c.display_name()),
    })
}

fn permission_denial(decision: chat_permissions::Decision, target_user_id: String) -> ChatError {
    if decision.requires_approval {
        ChatError::ContactRequestRequired {
            reason: decision.reason,
            target_user_id,
        }
    } else {
        ChatError::Forbidden { reason: decision.reason }
    }
}

fn fallback_user_cache(ctx: &AuthContext) -> chat_core::UserCache {
    chat_core::UserCache {
        id: ctx.user_id.clone(),
        email: ctx.email.clone(),
        first_name: None,
        last_name: None,
        avatar_url: None,
    }
}

struct UserCacheFallback;
impl UserCacheFallback {
    /// §4.6 edge case: a missing user-cache row falls back to the literal
    /// `"Unknown"` display name (or the email, if present — here, absent).
    fn for_sender(sender_id: &str) -> chat_core::UserCache {
        chat_core::UserCache {
            id: sender_id.to_string(),
            email: None,
            first_name: None,
            last_name: None,
            avatar_url: None,
        }
    }
}

fn to_cursor(at: OffsetDateTime) -> String {
    at.format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_default()
}

/// Extra payload fields (attachment metadata, etc.) a request body may carry
/// beyond the typed [`SendMessageInput`] fields — kept for forward
/// compatibility with the request surface's schema.
pub type RequestExtra = Extra;

#[cfg(test)]
mod tests {
    use super::*;
    use chat_permissions::PermissionEngine;
    use chat_store::InMemoryStore;

    fn ctx(user_id: &str, tenant_id: Option<&str>) -> AuthContext {
        AuthContext {
            user_id: user_id.to_string(),
            tenant_id: tenant_id.map(str::to_string),
            tenant_role: tenant_id.map(|_| "member".to_string()),
            platform_role: None,
            email: None,
            display_name: None,
        }
    }

    async fn service() -> (ConversationService, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        store.seed_default_rules_if_empty().await.unwrap();
        let permissions = PermissionEngine::new(store.clone());
        (ConversationService::new(store.clone(), permissions), store)
    }

    #[tokio::test]
    async fn direct_creation_is_idempotent() {
        let (svc, store) = service().await;
        store.upsert_directory_entry(&ctx("u2", Some("t1"))).await.unwrap();
        let creator = ctx("u1", Some("t1"));
        let input = CreateConversationInput {
            conv_type: ConversationType::Direct,
            name: None,
            description: None,
            participant_ids: vec!["u2".into()],
        };
        let first = svc.create_conversation(&creator, input.clone()).await.unwrap();
        let second = svc.create_conversation(&creator, input).await.unwrap();
        assert_eq!(first.conversation.id, second.conversation.id);
        assert_eq!(first.participants.len(), 2);
        let owner = first.participants.iter().find(|p| p.user_id == "u1").unwrap();
        assert_eq!(owner.role, chat_core::ParticipantRole::Owner);
    }

    #[tokio::test]
    async fn announcement_creation_is_rejected() {
        let (svc, _store) = service().await;
        let creator = ctx("u1", Some("t1"));
        let input = CreateConversationInput {
            conv_type: ConversationType::Announcement,
            name: None,
            description: None,
            participant_ids: vec!["u2".into()],
        };
        let err = svc.create_conversation(&creator, input).await.unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn send_requires_participancy() {
        let (svc, _store) = service().await;
        let outsider = ctx("u3", Some("t1"));
        let err = svc
            .send_message(
                &outsider,
                Uuid::new_v4(),
                SendMessageInput {
                    content: "hi".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "FORBIDDEN");
    }

    #[tokio::test]
    async fn unread_math_matches_scenario_5() {
        let (svc, store) = service().await;
        let u1 = ctx("u1", Some("t1"));
        let u2 = ctx("u2", Some("t1"));
        store.upsert_directory_entry(&u2).await.unwrap();
        let conv = svc
            .create_conversation(
                &u1,
                CreateConversationInput {
                    conv_type: ConversationType::Direct,
                    name: None,
                    description: None,
                    participant_ids: vec!["u2".into()],
                },
            )
            .await
            .unwrap();

        for _ in 0..3 {
            svc.send_message(
                &u2,
                conv.conversation.id,
                SendMessageInput {
                    content: "hi".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        }
        assert_eq!(svc.get_unread_count("u1").await.unwrap(), 3);

        svc.mark_as_read("u1", conv.conversation.id).await.unwrap();
        assert_eq!(svc.get_unread_count("u1").await.unwrap(), 0);

        svc.send_message(
            &u2,
            conv.conversation.id,
            SendMessageInput {
                content: "again".into(),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(svc.get_unread_count("u1").await.unwrap(), 1);

        svc.send_message(
            &u1,
            conv.conversation.id,
            SendMessageInput {
                content: "from u1".into(),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(svc.get_unread_count("u1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn content_length_is_validated() {
        let (svc, store) = service().await;
        let u1 = ctx("u1", Some("t1"));
        store.upsert_directory_entry(&ctx("u2", Some("t1"))).await.unwrap();
        let conv = svc
            .create_conversation(
                &u1,
                CreateConversationInput {
                    conv_type: ConversationType::Direct,
                    name: None,
                    description: None,
                    participant_ids: vec!["u2".into()],
                },
            )
            .await
            .unwrap();
        let err = svc
            .send_message(
                &u1,
                conv.conversation.id,
                SendMessageInput {
                    content: "".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }
}
