//! Session manager & room fanout (C7, §4.7): the `DIAL -> AUTHENTICATING ->
//! CONNECTED -> (CLOSING) -> CLOSED` state machine for one WebSocket
//! connection, and the per-topic subscription forwarding that turns the
//! shared bus into this connection's outbound event stream.

use std::collections::HashMap;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use chat_bus::BusClient;
use chat_core::topics::{conversation_topic, tenant_topic, user_topic};
use chat_core::{AuthContext, ChatError, ClientEvent, ServerEvent};
use chat_service::SendMessageInput;
use serde::Deserialize;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::state::AppState;

/// §4.4's "short debounce before publishing `presence:offline`": how long a
/// user's last session has to reconnect before the offline flip actually
/// fires.
const PRESENCE_OFFLINE_GRACE_SECS: u64 = 5;

/// First frame a connecting client must send (§6.2 "Handshake MUST include
/// `{auth: {token, tenantId?}}`").
#[derive(Debug, Deserialize)]
struct Handshake {
    auth: HandshakeAuth,
}

#[derive(Debug, Deserialize)]
struct HandshakeAuth {
    token: String,
    #[serde(rename = "tenantId", default)]
    tenant_id: Option<String>,
}

pub async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        if let Err(err) = run_session(socket, state).await {
            warn!(error = %err, "websocket session ended with error");
        }
    })
}

async fn run_session(mut socket: WebSocket, state: AppState) -> anyhow::Result<()> {
    let ctx = match authenticate(&mut socket, &state).await {
        Some(ctx) => ctx,
        None => return Ok(()),
    };
    state.store.upsert_directory_entry(&ctx).await.ok();

    let mut session = Session::new(state, ctx);
    session.enter_connected().await;
    session.run(socket).await;
    session.leave().await;
    Ok(())
}

/// `AUTHENTICATING`: reads the handshake frame and verifies the token,
/// closing the connection on any failure before any app frame flows.
async fn authenticate(socket: &mut WebSocket, state: &AppState) -> Option<AuthContext> {
    let frame = match socket.recv().await {
        Some(Ok(Message::Text(text))) => text,
        _ => {
            let _ = socket.send(Message::Close(None)).await;
            return None;
        }
    };
    let handshake: Handshake = match serde_json::from_str(&frame) {
        Ok(h) => h,
        Err(_) => {
            let _ = socket.send(Message::Close(None)).await;
            return None;
        }
    };
    let mut ctx = match state.verifier.verify(&handshake.auth.token).await {
        Ok(ctx) => ctx,
        Err(_) => {
            let _ = socket.send(Message::Close(None)).await;
            return None;
        }
    };
    if let Some(tenant_id) = handshake.auth.tenant_id {
        ctx.tenant_id = Some(tenant_id);
    }
    Some(ctx)
}

/// One joined topic's forwarder: a task draining the bus subscription into
/// `outbound`, held alive only by its `AbortHandle`.
struct Joined {
    handle: tokio::task::AbortHandle,
}

struct Session {
    state: AppState,
    ctx: AuthContext,
    outbound_tx: mpsc::Sender<Message>,
    outbound_rx: mpsc::Receiver<Message>,
    topics: HashMap<String, Joined>,
}

impl Session {
    fn new(state: AppState, ctx: AuthContext) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(256);
        Self {
            state,
            ctx,
            outbound_tx,
            outbound_rx,
            topics: HashMap::new(),
        }
    }

    /// `CONNECTED` entry actions, in order (§4.7).
    #[instrument(skip(self), fields(user_id = %self.ctx.user_id))]
    async fn enter_connected(&mut self) {
        self.join_topic(user_topic(&self.ctx.user_id)).await;
        if let Some(tenant_id) = self.ctx.tenant_id.clone() {
            self.join_topic(tenant_topic(&tenant_id)).await;
        }

        if self.mark_online() {
            if let Some((_, handle)) = self.state.pending_offline.remove(&self.ctx.user_id) {
                handle.abort();
            }
            self.state.presence.set_online(&self.ctx.user_id, self.ctx.tenant_id.as_deref()).await.ok();
            if let Some(tenant_id) = self.ctx.tenant_id.clone() {
                self.publish(
                    &tenant_topic(&tenant_id),
                    &ServerEvent::PresenceOnline {
                        user_id: self.ctx.user_id.clone(),
                        tenant_id: Some(tenant_id),
                    },
                )
                .await;
            }
        }

        if let Ok(participants) = self.state.store.participants_for_user(&self.ctx.user_id).await {
            for p in participants {
                self.join_topic(conversation_topic(&p.conversation_id.to_string())).await;
            }
        }
        info!("session connected");
    }

    /// Joins a topic's bus subscription, spawning a forwarder task that
    /// writes every message onto the shared outbound channel. A second join
    /// of the same topic is a no-op (e.g. re-`conversation:join`).
    async fn join_topic(&mut self, topic: String) {
        if self.topics.contains_key(&topic) {
            return;
        }
        let mut sub = match self.state.bus.subscribe(&topic).await {
            Ok(sub) => sub,
            Err(err) => {
                warn!(%topic, error = %err, "failed to subscribe to topic");
                return;
            }
        };
        let tx = self.outbound_tx.clone();
        let self_user_id = self.ctx.user_id.clone();
        let handle = tokio::spawn(async move {
            while let Some(msg) = sub.recv().await {
                if self_originated_exclude(&msg.payload, &self_user_id) {
                    continue;
                }
                if tx.send(Message::Text(String::from_utf8_lossy(&msg.payload).into_owned().into())).await.is_err() {
                    break;
                }
            }
        })
        .abort_handle();
        self.topics.insert(topic, Joined { handle });
    }

    fn leave_topic(&mut self, topic: &str) {
        if let Some(joined) = self.topics.remove(topic) {
            joined.handle.abort();
        }
    }

    /// Coalesces *overlapping* sessions for one user (multiple tabs): only
    /// the connection that takes the count from 0 to 1, or back down to 0,
    /// is the one that should flip presence. The *serial* close-then-
    /// reopen case (§4.4's 5s grace window) is handled separately in
    /// [`Self::leave`] by delaying the offline flip rather than by this
    /// refcount.
    fn mark_online(&self) -> bool {
        let mut count = self.state.live_sessions.entry(self.ctx.user_id.clone()).or_insert(0);
        *count += 1;
        *count == 1
    }

    fn mark_offline(&self) -> bool {
        match self.state.live_sessions.get_mut(&self.ctx.user_id) {
            Some(mut count) => {
                *count = count.saturating_sub(1);
                *count == 0
            }
            None => true,
        }
    }

    async fn run(&mut self, mut socket: WebSocket) {
        loop {
            tokio::select! {
                inbound = socket.recv() => {
                    match inbound {
                        Some(Ok(Message::Text(text))) => self.handle_frame(&mut socket, &text).await,
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => continue,
                        Some(Err(err)) => {
                            warn!(error = %err, "websocket recv error");
                            break;
                        }
                    }
                }
                outbound = self.outbound_rx.recv() => {
                    match outbound {
                        Some(msg) => {
                            if socket.send(msg).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        }
    }

    async fn handle_frame(&mut self, socket: &mut WebSocket, text: &str) {
        let event: ClientEvent = match serde_json::from_str(text) {
            Ok(event) => event,
            Err(err) => {
                warn!(error = %err, "ignoring unrecognized client event");
                return;
            }
        };
        match event {
            ClientEvent::MessageSend {
                conversation_id,
                content,
                msg_type,
                reply_to_id,
                attachment_url,
                attachment_type,
                attachment_name,
            } => {
                self.handle_message_send(
                    socket,
                    conversation_id,
                    content,
                    msg_type,
                    reply_to_id,
                    attachment_url,
                    attachment_type,
                    attachment_name,
                )
                .await
            }
            ClientEvent::TypingStart { conversation_id } => self.handle_typing(conversation_id, true).await,
            ClientEvent::TypingStop { conversation_id } => self.handle_typing(conversation_id, false).await,
            ClientEvent::MessagesRead { conversation_id } => self.handle_messages_read(conversation_id).await,
            ClientEvent::ConversationJoin { conversation_id } => self.handle_conversation_join(socket, conversation_id).await,
            ClientEvent::ConversationLeave { conversation_id } => self.handle_conversation_leave(socket, conversation_id).await,
            ClientEvent::PresenceGet => self.handle_presence_get(socket).await,
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_message_send(
        &mut self,
        socket: &mut WebSocket,
        conversation_id: Uuid,
        content: String,
        msg_type: Option<chat_core::MessageType>,
        reply_to_id: Option<Uuid>,
        attachment_url: Option<String>,
        attachment_type: Option<String>,
        attachment_name: Option<String>,
    ) {
        let input = SendMessageInput {
            content,
            msg_type,
            reply_to_id,
            attachment_url,
            attachment_type,
            attachment_name,
        };
        match self.state.conversations.send_message(&self.ctx, conversation_id, input).await {
            Ok(enriched) => {
                let conv_topic = conversation_topic(&conversation_id.to_string());
                let payload = serde_json::to_value(&enriched.message).unwrap_or_default();
                let event = ServerEvent::MessageNew { message: payload };
                self.publish(&conv_topic, &event).await;

                if let Ok(participants) = self.state.store.participants_for_conversation(conversation_id).await {
                    for p in participants {
                        if p.user_id != self.ctx.user_id {
                            self.publish(&user_topic(&p.user_id), &event).await;
                        }
                    }
                }

                self.state.presence.set_typing(&conversation_id.to_string(), &self.ctx.user_id, false).await.ok();

                let ack = ServerEvent::MessageSent {
                    message_id: enriched.message.id,
                    conversation_id,
                    timestamp: format_rfc3339(enriched.message.created_at),
                };
                send_event(socket, &ack).await;
            }
            Err(err) => {
                let ack = ServerEvent::MessageError {
                    error: describe(&err),
                    conversation_id,
                };
                send_event(socket, &ack).await;
            }
        }
    }

    async fn handle_typing(&mut self, conversation_id: Uuid, is_typing: bool) {
        if !self.is_participant(conversation_id).await {
            return;
        }
        self.state.presence.set_typing(&conversation_id.to_string(), &self.ctx.user_id, is_typing).await.ok();
        let event = ServerEvent::TypingUpdate {
            user_id: self.ctx.user_id.clone(),
            conversation_id,
            is_typing,
        };
        self.publish_excluding_self(&conversation_topic(&conversation_id.to_string()), &event).await;
    }

    async fn handle_messages_read(&mut self, conversation_id: Uuid) {
        if !self.is_participant(conversation_id).await {
            return;
        }
        if self.state.conversations.mark_as_read(&self.ctx.user_id, conversation_id).await.is_err() {
            return;
        }
        let event = ServerEvent::MessagesRead {
            user_id: self.ctx.user_id.clone(),
            conversation_id,
            read_at: format_rfc3339(OffsetDateTime::now_utc()),
        };
        self.publish_excluding_self(&conversation_topic(&conversation_id.to_string()), &event).await;
    }

    async fn handle_conversation_join(&mut self, socket: &mut WebSocket, conversation_id: Uuid) {
        if !self.is_participant(conversation_id).await {
            send_event(
                socket,
                &ServerEvent::ConversationError {
                    error: "not a participant".into(),
                    conversation_id,
                },
            )
            .await;
            return;
        }
        self.join_topic(conversation_topic(&conversation_id.to_string())).await;
        send_event(socket, &ServerEvent::ConversationJoined { conversation_id }).await;
    }

    async fn handle_conversation_leave(&mut self, socket: &mut WebSocket, conversation_id: Uuid) {
        self.leave_topic(&conversation_topic(&conversation_id.to_string()));
        send_event(socket, &ServerEvent::ConversationLeft { conversation_id }).await;
    }

    async fn handle_presence_get(&mut self, socket: &mut WebSocket) {
        let online_users = self
            .state
            .presence
            .online_users(self.ctx.tenant_id.as_deref())
            .await
            .unwrap_or_default();
        send_event(
            socket,
            &ServerEvent::PresenceList {
                tenant_id: self.ctx.tenant_id.clone(),
                online_users,
            },
        )
        .await;
    }

    async fn is_participant(&self, conversation_id: Uuid) -> bool {
        self.state
            .permissions
            .is_participant(&self.ctx.user_id, conversation_id)
            .await
            .unwrap_or(false)
    }

    async fn publish(&self, topic: &str, event: &ServerEvent) {
        if let Ok(bytes) = serde_json::to_vec(event) {
            self.state.bus.publish(topic, bytes).await.ok();
        }
    }

    /// The bus has no per-subscriber exclude, so a self-originated
    /// `typing:update`/`messages:read` publish echoes back to every session
    /// joined to the topic, including this one. Per §4.7 those two events
    /// exclude the sender, so the forwarder in [`Self::join_topic`] drops
    /// the echo on receipt rather than this call filtering on publish.
    async fn publish_excluding_self(&self, topic: &str, event: &ServerEvent) {
        self.publish(topic, event).await;
    }

    /// `CLOSING`/`CLOSED`: drop every local subscription. If this was the
    /// user's last live session, the offline flip is delayed by
    /// `PRESENCE_OFFLINE_GRACE_SECS` rather than published synchronously, so
    /// a reconnect inside that window (caught by [`Self::enter_connected`]
    /// aborting the pending task) never surfaces a transient
    /// offline->online flap (§4.4).
    async fn leave(&mut self) {
        for joined in self.topics.values() {
            joined.handle.abort();
        }
        self.topics.clear();

        if self.mark_offline() {
            let state = self.state.clone();
            let user_id = self.ctx.user_id.clone();
            let tenant_id = self.ctx.tenant_id.clone();
            let handle = tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(PRESENCE_OFFLINE_GRACE_SECS)).await;
                state.pending_offline.remove(&user_id);
                state.presence.set_offline(&user_id, tenant_id.as_deref()).await.ok();
                if let Some(tenant_id) = tenant_id {
                    if let Ok(bytes) = serde_json::to_vec(&ServerEvent::PresenceOffline {
                        user_id: user_id.clone(),
                        tenant_id: Some(tenant_id.clone()),
                    }) {
                        state.bus.publish(&tenant_topic(&tenant_id), bytes).await.ok();
                    }
                }
            })
            .abort_handle();
            self.state.pending_offline.insert(self.ctx.user_id.clone(), handle);
        }
        info!(user_id = %self.ctx.user_id, "session closed");
    }
}

async fn send_event(socket: &mut WebSocket, event: &ServerEvent) {
    if let Ok(text) = serde_json::to_string(event) {
        let _ = socket.send(Message::Text(text.into())).await;
    }
}

fn format_rfc3339(at: OffsetDateTime) -> String {
    at.format(&Rfc3339).unwrap_or_default()
}

/// `typing:update` and `messages:read` exclude the sender (§4.7); since the
/// bus fans a publish out to every subscriber including the publisher's own
/// connection, the forwarder drops those two event kinds here when they
/// carry this session's own `userId`.
fn self_originated_exclude(payload: &[u8], self_user_id: &str) -> bool {
    let Ok(value) = serde_json::from_slice::<serde_json::Value>(payload) else {
        return false;
    };
    let is_excludable = matches!(value.get("type").and_then(|t| t.as_str()), Some("typing:update") | Some("messages:read"));
    is_excludable && value.get("userId").and_then(|u| u.as_str()) == Some(self_user_id)
}

fn describe(err: &ChatError) -> String {
    err.to_string()
}
