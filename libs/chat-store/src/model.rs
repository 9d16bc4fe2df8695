//! Inputs for the creation operations the trait exposes. Server-assigned
//! fields (`id`, `createdAt`, ...) are deliberately absent from these —
//! the backend assigns them.

use chat_core::{ConversationType, MessageType, ParticipantRole};
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct NewConversation {
    pub conv_type: ConversationType,
    pub name: Option<String>,
    pub description: Option<String>,
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewParticipant {
    pub conversation_id: Uuid,
    pub user_id: String,
    pub tenant_id: Option<String>,
    pub role: ParticipantRole,
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub conversation_id: Uuid,
    pub sender_id: String,
    pub content: String,
    pub msg_type: MessageType,
    pub attachment_url: Option<String>,
    pub attachment_type: Option<String>,
    pub attachment_name: Option<String>,
    pub reply_to_id: Option<Uuid>,
}

#[derive(Debug, Clone)]
pub struct NewContactRequest {
    pub from_user_id: String,
    pub from_tenant_id: Option<String>,
    pub to_user_id: String,
    pub to_tenant_id: Option<String>,
    pub rule_id: String,
    pub message: Option<String>,
    pub expires_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct NewBlock {
    pub user_id: String,
    pub blocked_user_id: String,
    pub reason: Option<String>,
}

/// A page of results plus whether the caller should request another (§4.2
/// "returns `limit + 1` semantics for has-more"): the store is asked for
/// `limit + 1` rows and trims/flags here so every caller gets the same
/// has-more computation instead of re-deriving it.
pub struct Page<T> {
    pub items: Vec<T>,
    pub has_more: bool,
}

impl<T> Page<T> {
    pub fn from_overfetch(mut rows: Vec<T>, limit: u32) -> Self {
        let has_more = rows.len() > limit as usize;
        rows.truncate(limit as usize);
        Self {
            items: rows,
            has_more,
        }
    }
}
