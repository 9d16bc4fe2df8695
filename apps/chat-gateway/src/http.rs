//! Request surface (C8, §4.8, §6.1): thin adaptors over C5/C6. No business
//! logic lives here — every handler validates shape only, delegates to a
//! service, and translates the result into the `{success, data|error, meta?}`
//! envelope.

use axum::Router;
use axum::extract::{Path, Query, State};
use axum::routing::{delete, get, post};
use chat_core::topics::user_topic;
use chat_core::{ChatError, ChatResult, ConversationType};
use chat_service::{CreateConversationInput, SendMessageInput};
use chat_store::{NewBlock, NewContactRequest};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use uuid::Uuid;

use crate::auth::Authenticated;
use crate::errors::{ApiResult, Envelope, ok, ok_with_meta};
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/health/detailed", get(health_detailed))
        .route("/ready", get(health))
        .route("/live", get(health))
        .route("/api/v1/conversations", get(list_conversations).post(create_conversation))
        .route("/api/v1/conversations/{id}", get(get_conversation))
        .route("/api/v1/conversations/{id}/participants", get(get_participants))
        .route("/api/v1/conversations/{id}/read", post(mark_read))
        .route(
            "/api/v1/conversations/{cid}/messages",
            get(list_messages).post(send_message),
        )
        .route("/api/v1/conversations/{cid}/messages/{mid}", get(get_message))
        .route("/api/v1/messages/unread", get(unread_count))
        .route("/api/v1/contacts/requests", get(requests_received).post(create_request))
        .route("/api/v1/contacts/requests/sent", get(requests_sent))
        .route("/api/v1/contacts/requests/{id}/respond", post(respond_request))
        .route("/api/v1/contacts/block", post(block_user))
        .route("/api/v1/contacts/block/{userId}", delete(unblock_user))
        .route("/api/v1/contacts/blocked", get(blocked_users))
        .route("/api/v1/contacts/can-message/{userId}", get(can_message))
}

#[derive(Serialize)]
struct HealthStatus {
    status: &'static str,
}

async fn health() -> axum::Json<Envelope<HealthStatus>> {
    axum::Json(ok(HealthStatus { status: "ok" }))
}

#[derive(Serialize)]
struct DetailedHealthStatus {
    status: &'static str,
    store: &'static str,
    bus: &'static str,
}

/// §2 supplemental: actually probes the store and bus rather than always
/// reporting healthy.
async fn health_detailed(State(state): State<AppState>) -> ApiResult<axum::Json<Envelope<DetailedHealthStatus>>> {
    let store_ok = state.store.ping().await.is_ok();
    let bus_ok = state.bus.set_members("health:probe").await.is_ok();
    if !store_ok || !bus_ok {
        return Err(
            ChatError::ServiceUnavailable {
                message: "one or more dependencies are unreachable".into(),
            }
            .into(),
        );
    }
    Ok(axum::Json(ok(DetailedHealthStatus {
        status: "ok",
        store: "ok",
        bus: "ok",
    })))
}

#[derive(Deserialize)]
struct PageQuery {
    #[serde(default)]
    limit: Option<u32>,
    #[serde(default)]
    cursor: Option<String>,
}

fn parse_cursor(cursor: Option<String>) -> ChatResult<Option<OffsetDateTime>> {
    cursor
        .map(|c| {
            OffsetDateTime::parse(&c, &Rfc3339)
                .map_err(|_| ChatError::validation("cursor must be an RFC3339 timestamp", vec!["cursor".into()]))
        })
        .transpose()
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ConversationsMeta {
    total_unread: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    next_cursor: Option<String>,
    has_more: bool,
}

async fn list_conversations(
    State(state): State<AppState>,
    Authenticated(ctx): Authenticated,
    Query(query): Query<PageQuery>,
) -> ApiResult<axum::Json<Envelope<Vec<chat_core::Conversation>>>> {
    let cursor = parse_cursor(query.cursor)?;
    let limit = query.limit.unwrap_or(50);
    let (views, page, total_unread) = state
        .conversations
        .get_conversations(&ctx.user_id, limit, cursor)
        .await?;
    let data = views.into_iter().map(|v| v.conversation).collect();
    let meta = serde_json::to_value(ConversationsMeta {
        total_unread,
        next_cursor: page.next_cursor,
        has_more: page.has_more,
    })
    .unwrap_or_default();
    Ok(axum::Json(ok_with_meta(data, meta)))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateConversationBody {
    #[serde(rename = "type")]
    conv_type: ConversationType,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    participant_ids: Vec<String>,
}

async fn create_conversation(
    State(state): State<AppState>,
    Authenticated(ctx): Authenticated,
    axum::Json(body): axum::Json<CreateConversationBody>,
) -> ApiResult<(axum::http::StatusCode, axum::Json<Envelope<chat_core::Conversation>>)> {
    let view = state
        .conversations
        .create_conversation(
            &ctx,
            CreateConversationInput {
                conv_type: body.conv_type,
                name: body.name,
                description: body.description,
                participant_ids: body.participant_ids,
            },
        )
        .await?;
    Ok((axum::http::StatusCode::CREATED, axum::Json(ok(view.conversation))))
}

async fn get_conversation(
    State(state): State<AppState>,
    Authenticated(ctx): Authenticated,
    Path(id): Path<Uuid>,
) -> ApiResult<axum::Json<Envelope<chat_core::Conversation>>> {
    let view = state.conversations.get_conversation(&ctx.user_id, id).await?;
    Ok(axum::Json(ok(view.conversation)))
}

async fn get_participants(
    State(state): State<AppState>,
    Authenticated(ctx): Authenticated,
    Path(id): Path<Uuid>,
) -> ApiResult<axum::Json<Envelope<Vec<chat_core::Participant>>>> {
    let participants = state.conversations.get_participants(&ctx.user_id, id).await?;
    Ok(axum::Json(ok(participants)))
}

#[derive(Serialize)]
struct Marked {
    marked: bool,
}

async fn mark_read(
    State(state): State<AppState>,
    Authenticated(ctx): Authenticated,
    Path(id): Path<Uuid>,
) -> ApiResult<axum::Json<Envelope<Marked>>> {
    state.conversations.mark_as_read(&ctx.user_id, id).await?;
    Ok(axum::Json(ok(Marked { marked: true })))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MessagesMeta {
    has_more: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    next_cursor: Option<String>,
}

async fn list_messages(
    State(state): State<AppState>,
    Authenticated(ctx): Authenticated,
    Path(cid): Path<Uuid>,
    Query(query): Query<PageQuery>,
) -> ApiResult<axum::Json<Envelope<Vec<chat_core::Message>>>> {
    let cursor = parse_cursor(query.cursor)?;
    let limit = query.limit.unwrap_or(50);
    let (messages, page) = state.conversations.get_messages(&ctx.user_id, cid, limit, cursor).await?;
    let data = messages.into_iter().map(|m| m.message).collect();
    let meta = serde_json::to_value(MessagesMeta {
        has_more: page.has_more,
        next_cursor: page.next_cursor,
    })
    .unwrap_or_default();
    Ok(axum::Json(ok_with_meta(data, meta)))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendMessageBody {
    content: String,
    #[serde(default, rename = "type")]
    msg_type: Option<chat_core::MessageType>,
    #[serde(default)]
    reply_to_id: Option<Uuid>,
    #[serde(default)]
    attachment_url: Option<String>,
    #[serde(default)]
    attachment_type: Option<String>,
    #[serde(default)]
    attachment_name: Option<String>,
}

async fn send_message(
    State(state): State<AppState>,
    Authenticated(ctx): Authenticated,
    Path(cid): Path<Uuid>,
    axum::Json(body): axum::Json<SendMessageBody>,
) -> ApiResult<(axum::http::StatusCode, axum::Json<Envelope<chat_core::Message>>)> {
    let enriched = state
        .conversations
        .send_message(
            &ctx,
            cid,
            SendMessageInput {
                content: body.content,
                msg_type: body.msg_type,
                reply_to_id: body.reply_to_id,
                attachment_url: body.attachment_url,
                attachment_type: body.attachment_type,
                attachment_name: body.attachment_name,
            },
        )
        .await?;

    // Doubled-up fan-out (§4.7/§9): publish to the conversation topic AND to
    // each non-sender participant's own `user:{id}` topic, matching
    // `ws.rs::handle_message_send` so REST-originated sends are just as
    // reliable under partial subscription as WS-originated ones.
    if let Ok(bytes) = serde_json::to_vec(&chat_core::ServerEvent::MessageNew {
        message: serde_json::to_value(&enriched.message).unwrap_or_default(),
    }) {
        let conv_topic = chat_core::topics::conversation_topic(&cid.to_string());
        state.bus.publish(&conv_topic, bytes.clone()).await.ok();

        if let Ok(participants) = state.store.participants_for_conversation(cid).await {
            for p in participants {
                if p.user_id != ctx.user_id {
                    state.bus.publish(&user_topic(&p.user_id), bytes.clone()).await.ok();
                }
            }
        }
    }

    Ok((axum::http::StatusCode::CREATED, axum::Json(ok(enriched.message))))
}

async fn get_message(
    State(state): State<AppState>,
    Authenticated(ctx): Authenticated,
    Path((cid, mid)): Path<(Uuid, Uuid)>,
) -> ApiResult<axum::Json<Envelope<chat_core::Message>>> {
    let enriched = state.conversations.get_message(&ctx.user_id, cid, mid).await?;
    Ok(axum::Json(ok(enriched.message)))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UnreadCount {
    unread_count: i64,
}

async fn unread_count(
    State(state): State<AppState>,
    Authenticated(ctx): Authenticated,
) -> ApiResult<axum::Json<Envelope<UnreadCount>>> {
    let unread_count = state.conversations.get_unread_count(&ctx.user_id).await?;
    Ok(axum::Json(ok(UnreadCount { unread_count })))
}

async fn requests_received(
    State(state): State<AppState>,
    Authenticated(ctx): Authenticated,
) -> ApiResult<axum::Json<Envelope<Vec<chat_core::ContactRequest>>>> {
    let now = OffsetDateTime::now_utc();
    let requests = state.store.requests_received(&ctx.user_id, now).await.map_err(ChatError::from)?;
    Ok(axum::Json(ok(requests)))
}

async fn requests_sent(
    State(state): State<AppState>,
    Authenticated(ctx): Authenticated,
) -> ApiResult<axum::Json<Envelope<Vec<chat_core::ContactRequest>>>> {
    let now = OffsetDateTime::now_utc();
    let requests = state.store.requests_sent(&ctx.user_id, now).await.map_err(ChatError::from)?;
    Ok(axum::Json(ok(requests)))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateRequestBody {
    to_user_id: String,
    #[serde(default)]
    message: Option<String>,
}

const MAX_CONTACT_MESSAGE_LEN: usize = 500;

async fn create_request(
    State(state): State<AppState>,
    Authenticated(ctx): Authenticated,
    axum::Json(body): axum::Json<CreateRequestBody>,
) -> ApiResult<(axum::http::StatusCode, axum::Json<Envelope<chat_core::ContactRequest>>)> {
    if let Some(message) = &body.message {
        if message.chars().count() > MAX_CONTACT_MESSAGE_LEN {
            return Err(
                ChatError::validation(
                    format!("message must be at most {MAX_CONTACT_MESSAGE_LEN} characters"),
                    vec!["message".into()],
                )
                .into(),
            );
        }
    }
    let now = OffsetDateTime::now_utc();
    let counterpart = chat_service::lookup_recipient(state.store.as_ref(), &body.to_user_id).await?;
    let new_request = NewContactRequest {
        from_user_id: ctx.user_id.clone(),
        from_tenant_id: ctx.tenant_id.clone(),
        to_user_id: body.to_user_id,
        to_tenant_id: counterpart.tenant_id.clone(),
        rule_id: "manual".to_string(),
        message: body.message,
        expires_at: now + time::Duration::seconds(chat_core::ContactRequest::DEFAULT_TTL_SECONDS),
    };
    let request = state
        .store
        .create_contact_request(new_request, now)
        .await
        .map_err(ChatError::from)?;
    Ok((axum::http::StatusCode::CREATED, axum::Json(ok(request))))
}

#[derive(Deserialize)]
#[serde(rename_all = "lowercase")]
enum RespondAction {
    Accept,
    Decline,
}

#[derive(Deserialize)]
struct RespondBody {
    action: RespondAction,
}

async fn respond_request(
    State(state): State<AppState>,
    Authenticated(ctx): Authenticated,
    Path(id): Path<Uuid>,
    axum::Json(body): axum::Json<RespondBody>,
) -> ApiResult<axum::Json<Envelope<chat_core::ContactRequest>>> {
    let existing = state
        .store
        .get_contact_request(id)
        .await
        .map_err(ChatError::from)?
        .ok_or_else(|| ChatError::not_found("contact request"))?;
    if existing.to_user_id != ctx.user_id {
        return Err(ChatError::not_found("contact request").into());
    }
    let accept = matches!(body.action, RespondAction::Accept);
    let updated = state
        .store
        .respond_to_request(id, accept, OffsetDateTime::now_utc())
        .await
        .map_err(ChatError::from)?;
    Ok(axum::Json(ok(updated)))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BlockBody {
    user_id: String,
    #[serde(default)]
    reason: Option<String>,
}

async fn block_user(
    State(state): State<AppState>,
    Authenticated(ctx): Authenticated,
    axum::Json(body): axum::Json<BlockBody>,
) -> ApiResult<axum::Json<Envelope<chat_core::BlockedUser>>> {
    if body.user_id == ctx.user_id {
        return Err(ChatError::validation("cannot block yourself", vec!["userId".into()]).into());
    }
    if let Some(reason) = &body.reason {
        if reason.chars().count() > MAX_CONTACT_MESSAGE_LEN {
            return Err(
                ChatError::validation(
                    format!("reason must be at most {MAX_CONTACT_MESSAGE_LEN} characters"),
                    vec!["reason".into()],
                )
                .into(),
            );
        }
    }
    let block = state
        .store
        .create_block(
            NewBlock {
                user_id: ctx.user_id.clone(),
                blocked_user_id: body.user_id,
                reason: body.reason,
            },
            OffsetDateTime::now_utc(),
        )
        .await
        .map_err(ChatError::from)?;
    Ok(axum::Json(ok(block)))
}

#[derive(Serialize)]
struct Unblocked {
    unblocked: bool,
}

async fn unblock_user(
    State(state): State<AppState>,
    Authenticated(ctx): Authenticated,
    Path(user_id): Path<String>,
) -> ApiResult<axum::Json<Envelope<Unblocked>>> {
    let unblocked = state
        .store
        .remove_block(&ctx.user_id, &user_id)
        .await
        .map_err(ChatError::from)?;
    Ok(axum::Json(ok(Unblocked { unblocked })))
}

async fn blocked_users(
    State(state): State<AppState>,
    Authenticated(ctx): Authenticated,
) -> ApiResult<axum::Json<Envelope<Vec<chat_core::BlockedUser>>>> {
    let blocks = state.store.blocks_for_user(&ctx.user_id).await.map_err(ChatError::from)?;
    Ok(axum::Json(ok(blocks)))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CanMessage {
    can_message: bool,
    requires_approval: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
}

async fn can_message(
    State(state): State<AppState>,
    Authenticated(ctx): Authenticated,
    Path(user_id): Path<String>,
) -> ApiResult<axum::Json<Envelope<CanMessage>>> {
    let recipient = chat_service::lookup_recipient(state.store.as_ref(), &user_id).await?;
    let decision = state.permissions.can_send_message(&ctx, &recipient).await?;
    Ok(axum::Json(ok(CanMessage {
        can_message: decision.allowed,
        requires_approval: decision.requires_approval,
        reason: Some(decision.reason),
    })))
}
