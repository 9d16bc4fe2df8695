use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use time::OffsetDateTime;
use uuid::Uuid;

/// Read-only denormalized view of a user, populated by an external sync.
/// Never authoritative for authentication or authorization.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct UserCache {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

impl UserCache {
    /// Best-effort display name, falling back to email, then the literal "Unknown".
    pub fn display_name(&self) -> String {
        match (&self.first_name, &self.last_name) {
            (Some(first), Some(last)) => format!("{first} {last}"),
            (Some(first), None) => first.clone(),
            (None, Some(last)) => last.clone(),
            (None, None) => self
                .email
                .clone()
                .unwrap_or_else(|| "Unknown".to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConversationType {
    Direct,
    Group,
    Support,
    Announcement,
}

impl ConversationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationType::Direct => "DIRECT",
            ConversationType::Group => "GROUP",
            ConversationType::Support => "SUPPORT",
            ConversationType::Announcement => "ANNOUNCEMENT",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub conv_type: ConversationType,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum ParticipantRole {
    Owner,
    Admin,
    Member,
}

impl ParticipantRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParticipantRole::Owner => "OWNER",
            ParticipantRole::Admin => "ADMIN",
            ParticipantRole::Member => "MEMBER",
        }
    }

    pub fn is_admin_or_owner(&self) -> bool {
        matches!(self, ParticipantRole::Owner | ParticipantRole::Admin)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub conversation_id: Uuid,
    pub user_id: String,
    #[serde(default)]
    pub tenant_id: Option<String>,
    pub role: ParticipantRole,
    #[serde(with = "time::serde::rfc3339")]
    pub joined_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_read_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageType {
    Text,
    System,
    Attachment,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Text => "TEXT",
            MessageType::System => "SYSTEM",
            MessageType::Attachment => "ATTACHMENT",
        }
    }
}

pub const MAX_MESSAGE_CONTENT_LEN: usize = 10_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: String,
    pub content: String,
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    #[serde(default)]
    pub attachment_url: Option<String>,
    #[serde(default)]
    pub attachment_type: Option<String>,
    #[serde(default)]
    pub attachment_name: Option<String>,
    #[serde(default)]
    pub reply_to_id: Option<Uuid>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub edited_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub deleted_at: Option<OffsetDateTime>,
}

impl Message {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// An enriched message returned to clients, carrying a sender snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichedMessage {
    #[serde(flatten)]
    pub message: Message,
    pub sender: UserCache,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum RuleScope {
    Tenant,
    Platform,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagingRule {
    pub id: String,
    pub name: String,
    pub source_scope: RuleScope,
    pub source_roles: Vec<String>,
    pub target_scope: RuleScope,
    pub target_roles: Vec<String>,
    pub require_approval: bool,
    #[serde(default)]
    pub max_messages_per_day: Option<u32>,
    pub is_active: bool,
    pub priority: i32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum ContactRequestStatus {
    Pending,
    Accepted,
    Declined,
    Expired,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactRequest {
    pub id: Uuid,
    pub from_user_id: String,
    #[serde(default)]
    pub from_tenant_id: Option<String>,
    pub to_user_id: String,
    #[serde(default)]
    pub to_tenant_id: Option<String>,
    pub rule_id: String,
    #[serde(default)]
    pub message: Option<String>,
    pub status: ContactRequestStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub responded_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
}

impl ContactRequest {
    /// Default TTL for a newly created contact request: seven days.
    pub const DEFAULT_TTL_SECONDS: i64 = 7 * 24 * 3600;

    /// `PENDING` requests past `expires_at` read back as `EXPIRED` (§3).
    pub fn effective_status(&self, now: OffsetDateTime) -> ContactRequestStatus {
        if self.status == ContactRequestStatus::Pending && self.expires_at <= now {
            ContactRequestStatus::Expired
        } else {
            self.status
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockedUser {
    pub user_id: String,
    pub blocked_user_id: String,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Identity asserted by the external identity provider at verification time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AuthContext {
    pub user_id: String,
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub tenant_role: Option<String>,
    #[serde(default)]
    pub platform_role: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
}

/// Opaque cursor carried in pagination responses; always an RFC3339 timestamp string.
pub type Cursor = String;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PageMeta {
    pub has_more: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<Cursor>,
}

/// Extra JSON fields carried by requests (attachment metadata, etc.).
pub type Extra = BTreeMap<String, serde_json::Value>;

/// `maxMessagesPerDay` window semantics (§9 Open Question). Rolling 24h is
/// the recommended default; UTC calendar day is offered for operators who
/// want the source's original "local midnight" behavior without the
/// timezone fragility — pinned to UTC instead of server-local time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RateLimitWindow {
    #[default]
    Rolling24h,
    UtcDay,
}
