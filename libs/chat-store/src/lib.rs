//! Store gateway (C2): the only crate that issues queries against the
//! durable store. Every other business crate (C5, C6) talks to a `dyn
//! Store`, never to SQL directly.

pub mod error;
pub mod memory;
pub mod model;
pub mod postgres;

pub use error::{StoreError, StoreResult, classify_sqlx_error};
pub use memory::InMemoryStore;
pub use model::{NewBlock, NewContactRequest, NewConversation, NewMessage, NewParticipant, Page};
pub use postgres::PostgresStore;

use async_trait::async_trait;
use chat_core::{AuthContext, BlockedUser, ContactRequest, Conversation, Message, MessagingRule, Participant, UserCache};
use time::OffsetDateTime;
use uuid::Uuid;

#[async_trait]
pub trait Store: Send + Sync {
    // --- user cache (§3 "Never authoritative for auth") ---
    async fn get_user_cache(&self, user_id: &str) -> StoreResult<Option<UserCache>>;

    /// Supplemental: the last `AuthContext` a user authenticated with,
    /// cached so the permission engine can evaluate tenant/role-scoped
    /// rules against a user who is a message *recipient* rather than the
    /// currently connected session (C7 upserts this at `CONNECTED` entry,
    /// §4.7). Not authoritative for auth — a stale or absent entry only
    /// ever makes a rule fail to match, never grants access it shouldn't.
    async fn upsert_directory_entry(&self, ctx: &AuthContext) -> StoreResult<()>;
    async fn get_directory_entry(&self, user_id: &str) -> StoreResult<Option<AuthContext>>;

    // --- conversations ---
    async fn create_conversation(
        &self,
        conv: NewConversation,
        participants: Vec<NewParticipant>,
    ) -> StoreResult<Conversation>;
    async fn get_conversation(&self, id: Uuid) -> StoreResult<Option<Conversation>>;
    /// The unique `DIRECT` conversation between `a` and `b`, if any (§4.2, P1).
    async fn find_direct_conversation(&self, a: &str, b: &str) -> StoreResult<Option<Conversation>>;
    async fn touch_conversation(&self, id: Uuid, at: OffsetDateTime) -> StoreResult<()>;
    /// Up to `limit` conversations `user_id` participates in, newest
    /// `updatedAt` first, paged on the `updatedAt` cursor (§4.2).
    async fn conversations_for_user(
        &self,
        user_id: &str,
        limit: u32,
        cursor: Option<OffsetDateTime>,
    ) -> StoreResult<Vec<Conversation>>;

    // --- participants ---
    async fn add_participant(&self, p: NewParticipant, joined_at: OffsetDateTime) -> StoreResult<Participant>;
    async fn get_participant(&self, conversation_id: Uuid, user_id: &str) -> StoreResult<Option<Participant>>;
    async fn participants_for_conversation(&self, conversation_id: Uuid) -> StoreResult<Vec<Participant>>;
    /// Every conversation `user_id` is a participant of — used at connect
    /// time to join per-conversation topics (§4.7 step 4).
    async fn participants_for_user(&self, user_id: &str) -> StoreResult<Vec<Participant>>;
    async fn set_last_read_at(&self, conversation_id: Uuid, user_id: &str, at: OffsetDateTime) -> StoreResult<()>;

    // --- messages ---
    async fn insert_message(&self, msg: NewMessage, created_at: OffsetDateTime) -> StoreResult<Message>;
    async fn get_message(&self, conversation_id: Uuid, message_id: Uuid) -> StoreResult<Option<Message>>;
    /// Newest first, excluding tombstones (§4.2).
    async fn messages_in(
        &self,
        conversation_id: Uuid,
        limit: u32,
        cursor: Option<OffsetDateTime>,
    ) -> StoreResult<Vec<Message>>;
    async fn last_message(&self, conversation_id: Uuid) -> StoreResult<Option<Message>>;
    /// Messages with `senderId != userId`, not deleted, after `since_read_at`
    /// (or all such messages when `since_read_at` is `None`) (§4.2, P2).
    async fn count_unread(
        &self,
        conversation_id: Uuid,
        user_id: &str,
        since_read_at: Option<OffsetDateTime>,
    ) -> StoreResult<i64>;
    /// Messages `sender_id` sent in `conversation_id` at or after `since`,
    /// for the per-rule `maxMessagesPerDay` check (§4.5).
    async fn count_messages_since(
        &self,
        conversation_id: Uuid,
        sender_id: &str,
        since: OffsetDateTime,
    ) -> StoreResult<i64>;

    // --- messaging rules (§4.5, §6.4) ---
    async fn active_rules_by_priority(&self) -> StoreResult<Vec<MessagingRule>>;
    /// Seeds the default rule table (§6.4) the first time it is read empty.
    async fn seed_default_rules_if_empty(&self) -> StoreResult<()>;

    // --- contact requests ---
    async fn create_contact_request(&self, req: NewContactRequest, now: OffsetDateTime) -> StoreResult<ContactRequest>;
    async fn get_contact_request(&self, id: Uuid) -> StoreResult<Option<ContactRequest>>;
    /// An unexpired `PENDING` request `from -> to`, if any (§4.5 step 5).
    async fn pending_request(&self, from: &str, to: &str, now: OffsetDateTime) -> StoreResult<Option<ContactRequest>>;
    /// Whether an `ACCEPTED` request exists between the two, either direction (§4.5 step 4).
    async fn accepted_between(&self, a: &str, b: &str) -> StoreResult<bool>;
    async fn requests_received(&self, user_id: &str, now: OffsetDateTime) -> StoreResult<Vec<ContactRequest>>;
    async fn requests_sent(&self, user_id: &str, now: OffsetDateTime) -> StoreResult<Vec<ContactRequest>>;
    async fn respond_to_request(&self, id: Uuid, accept: bool, at: OffsetDateTime) -> StoreResult<ContactRequest>;

    // --- blocks ---
    async fn create_block(&self, block: NewBlock, at: OffsetDateTime) -> StoreResult<BlockedUser>;
    async fn remove_block(&self, user_id: &str, blocked_user_id: &str) -> StoreResult<bool>;
    async fn is_blocked_either_direction(&self, a: &str, b: &str) -> StoreResult<bool>;
    async fn blocks_for_user(&self, user_id: &str) -> StoreResult<Vec<BlockedUser>>;

    // --- health probe (§7 SERVICE_UNAVAILABLE on /health/detailed) ---
    async fn ping(&self) -> StoreResult<()>;
}
