//! Client<->server duplex transport event payloads (§6.2, §4.7).

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{Extra, MessageType};

/// Inbound frames a `CONNECTED` session accepts; anything else is ignored with a warning.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    #[serde(rename = "message:send")]
    MessageSend {
        #[serde(rename = "conversationId")]
        conversation_id: Uuid,
        content: String,
        #[serde(default)]
        #[serde(rename = "type")]
        msg_type: Option<MessageType>,
        #[serde(default, rename = "replyToId")]
        reply_to_id: Option<Uuid>,
        #[serde(default, rename = "attachmentUrl")]
        attachment_url: Option<String>,
        #[serde(default, rename = "attachmentType")]
        attachment_type: Option<String>,
        #[serde(default, rename = "attachmentName")]
        attachment_name: Option<String>,
    },
    #[serde(rename = "typing:start")]
    TypingStart {
        #[serde(rename = "conversationId")]
        conversation_id: Uuid,
    },
    #[serde(rename = "typing:stop")]
    TypingStop {
        #[serde(rename = "conversationId")]
        conversation_id: Uuid,
    },
    #[serde(rename = "messages:read")]
    MessagesRead {
        #[serde(rename = "conversationId")]
        conversation_id: Uuid,
    },
    #[serde(rename = "conversation:join")]
    ConversationJoin {
        #[serde(rename = "conversationId")]
        conversation_id: Uuid,
    },
    #[serde(rename = "conversation:leave")]
    ConversationLeave {
        #[serde(rename = "conversationId")]
        conversation_id: Uuid,
    },
    #[serde(rename = "presence:get")]
    PresenceGet,
}

/// Outbound frames the session manager may emit to one or more connections.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    #[serde(rename = "message:new")]
    MessageNew { message: serde_json::Value },
    #[serde(rename = "message:sent")]
    MessageSent {
        #[serde(rename = "messageId")]
        message_id: Uuid,
        #[serde(rename = "conversationId")]
        conversation_id: Uuid,
        timestamp: String,
    },
    #[serde(rename = "message:error")]
    MessageError {
        error: String,
        #[serde(rename = "conversationId")]
        conversation_id: Uuid,
    },
    #[serde(rename = "typing:update")]
    TypingUpdate {
        #[serde(rename = "userId")]
        user_id: String,
        #[serde(rename = "conversationId")]
        conversation_id: Uuid,
        #[serde(rename = "isTyping")]
        is_typing: bool,
    },
    #[serde(rename = "messages:read")]
    MessagesRead {
        #[serde(rename = "userId")]
        user_id: String,
        #[serde(rename = "conversationId")]
        conversation_id: Uuid,
        #[serde(rename = "readAt")]
        read_at: String,
    },
    #[serde(rename = "presence:online")]
    PresenceOnline {
        #[serde(rename = "userId")]
        user_id: String,
        #[serde(rename = "tenantId", skip_serializing_if = "Option::is_none")]
        tenant_id: Option<String>,
    },
    #[serde(rename = "presence:offline")]
    PresenceOffline {
        #[serde(rename = "userId")]
        user_id: String,
        #[serde(rename = "tenantId", skip_serializing_if = "Option::is_none")]
        tenant_id: Option<String>,
    },
    #[serde(rename = "presence:list")]
    PresenceList {
        #[serde(rename = "tenantId", skip_serializing_if = "Option::is_none")]
        tenant_id: Option<String>,
        #[serde(rename = "onlineUsers")]
        online_users: Vec<String>,
    },
    #[serde(rename = "conversation:joined")]
    ConversationJoined {
        #[serde(rename = "conversationId")]
        conversation_id: Uuid,
    },
    #[serde(rename = "conversation:left")]
    ConversationLeft {
        #[serde(rename = "conversationId")]
        conversation_id: Uuid,
    },
    #[serde(rename = "conversation:error")]
    ConversationError {
        error: String,
        #[serde(rename = "conversationId")]
        conversation_id: Uuid,
    },
}

/// Extra per-event metadata a handshake or frame may carry; kept open-ended
/// so the transport layer can pass through fields the core doesn't interpret.
pub type EventMetadata = Extra;
