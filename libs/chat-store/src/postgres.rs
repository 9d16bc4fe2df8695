//! Postgres-backed [`Store`] using runtime-checked `sqlx` queries (no
//! `query!` macros, since this workspace builds without a live
//! `DATABASE_URL`) — same `query_as::<_, Row>().bind(..)` shape the rest of
//! the corpus reaches for against SQLite/Postgres pools.

use async_trait::async_trait;
use chat_core::{
    AuthContext, BlockedUser, ContactRequest, ContactRequestStatus, Conversation, ConversationType,
    Message, MessageType, MessagingRule, Participant, ParticipantRole, RuleScope, UserCache,
};
use sqlx::{postgres::PgPoolOptions, FromRow, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{classify_sqlx_error, StoreError, StoreResult};
use crate::model::{NewBlock, NewContactRequest, NewConversation, NewMessage, NewParticipant};
use crate::Store;

#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

/// Runnable DDL for every table this store touches, applied with
/// `IF NOT EXISTS` at connect time the same way `conversation/sqlite.rs`'s
/// `CREATE_TABLE_SQL` bootstraps its own schema rather than relying on an
/// external migration runner.
///
/// `conversations.direct_key` is the mechanism for P1 ("at most one DIRECT
/// conversation with participant set {a,b}"): populated only for DIRECT rows
/// as the two participant ids joined in sorted order, with a partial unique
/// index enforcing the invariant at the database level. §9 notes this can't
/// be a constraint on `participants` directly since that table is many-to-
/// many; denormalizing the pair onto `conversations` is what makes a plain
/// unique index able to express it.
const CREATE_TABLE_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS conversations (
    id UUID PRIMARY KEY,
    conv_type TEXT NOT NULL,
    name TEXT,
    description TEXT,
    avatar_url TEXT,
    direct_key TEXT,
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS conversations_direct_key_idx
    ON conversations (direct_key) WHERE conv_type = 'DIRECT';

CREATE TABLE IF NOT EXISTS participants (
    conversation_id UUID NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
    user_id TEXT NOT NULL,
    tenant_id TEXT,
    role TEXT NOT NULL,
    joined_at TIMESTAMPTZ NOT NULL,
    last_read_at TIMESTAMPTZ,
    PRIMARY KEY (conversation_id, user_id)
);

CREATE INDEX IF NOT EXISTS participants_user_id_idx ON participants (user_id);

CREATE TABLE IF NOT EXISTS messages (
    id UUID PRIMARY KEY,
    conversation_id UUID NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
    sender_id TEXT NOT NULL,
    content TEXT NOT NULL,
    msg_type TEXT NOT NULL,
    attachment_url TEXT,
    attachment_type TEXT,
    attachment_name TEXT,
    reply_to_id UUID REFERENCES messages(id),
    created_at TIMESTAMPTZ NOT NULL,
    edited_at TIMESTAMPTZ,
    deleted_at TIMESTAMPTZ
);

CREATE INDEX IF NOT EXISTS messages_conversation_created_idx
    ON messages (conversation_id, created_at DESC);

CREATE TABLE IF NOT EXISTS messaging_rules (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    source_scope TEXT NOT NULL,
    source_roles TEXT[] NOT NULL,
    target_scope TEXT NOT NULL,
    target_roles TEXT[] NOT NULL,
    require_approval BOOLEAN NOT NULL,
    max_messages_per_day INTEGER,
    is_active BOOLEAN NOT NULL,
    priority INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS contact_requests (
    id UUID PRIMARY KEY,
    from_user_id TEXT NOT NULL,
    from_tenant_id TEXT,
    to_user_id TEXT NOT NULL,
    to_tenant_id TEXT,
    rule_id TEXT NOT NULL,
    message TEXT,
    status TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL,
    responded_at TIMESTAMPTZ,
    expires_at TIMESTAMPTZ NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS contact_requests_pending_pair_idx
    ON contact_requests (from_user_id, to_user_id) WHERE status = 'PENDING';

CREATE TABLE IF NOT EXISTS blocked_users (
    user_id TEXT NOT NULL,
    blocked_user_id TEXT NOT NULL,
    reason TEXT,
    created_at TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (user_id, blocked_user_id)
);

CREATE TABLE IF NOT EXISTS user_cache (
    id TEXT PRIMARY KEY,
    email TEXT,
    first_name TEXT,
    last_name TEXT,
    avatar_url TEXT
);

CREATE TABLE IF NOT EXISTS user_directory (
    user_id TEXT PRIMARY KEY,
    tenant_id TEXT,
    tenant_role TEXT,
    platform_role TEXT,
    email TEXT,
    display_name TEXT,
    updated_at TIMESTAMPTZ NOT NULL
);
"#;

/// Canonical, order-independent key for a DIRECT participant pair.
fn direct_pair_key(a: &str, b: &str) -> String {
    if a <= b {
        format!("{a}\u{1f}{b}")
    } else {
        format!("{b}\u{1f}{a}")
    }
}

impl PostgresStore {
    pub async fn connect(dsn: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(dsn)
            .await?;
        sqlx::raw_sql(CREATE_TABLE_SQL).execute(&pool).await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(FromRow)]
struct ConversationRow {
    id: Uuid,
    conv_type: String,
    name: Option<String>,
    description: Option<String>,
    avatar_url: Option<String>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<ConversationRow> for Conversation {
    type Error = StoreError;

    fn try_from(row: ConversationRow) -> Result<Self, Self::Error> {
        Ok(Conversation {
            id: row.id,
            conv_type: parse_conv_type(&row.conv_type)?,
            name: row.name,
            description: row.description,
            avatar_url: row.avatar_url,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn parse_conv_type(raw: &str) -> StoreResult<ConversationType> {
    match raw {
        "DIRECT" => Ok(ConversationType::Direct),
        "GROUP" => Ok(ConversationType::Group),
        "SUPPORT" => Ok(ConversationType::Support),
        "ANNOUNCEMENT" => Ok(ConversationType::Announcement),
        other => Err(StoreError::Backend(anyhow::anyhow!(
            "unrecognized conversation type in database: {other}"
        ))),
    }
}

fn parse_role(raw: &str) -> StoreResult<ParticipantRole> {
    match raw {
        "OWNER" => Ok(ParticipantRole::Owner),
        "ADMIN" => Ok(ParticipantRole::Admin),
        "MEMBER" => Ok(ParticipantRole::Member),
        other => Err(StoreError::Backend(anyhow::anyhow!(
            "unrecognized participant role in database: {other}"
        ))),
    }
}

fn parse_msg_type(raw: &str) -> StoreResult<MessageType> {
    match raw {
        "TEXT" => Ok(MessageType::Text),
        "SYSTEM" => Ok(MessageType::System),
        "ATTACHMENT" => Ok(MessageType::Attachment),
        other => Err(StoreError::Backend(anyhow::anyhow!(
            "unrecognized message type in database: {other}"
        ))),
    }
}

fn parse_request_status(raw: &str) -> StoreResult<ContactRequestStatus> {
    match raw {
        "PENDING" => Ok(ContactRequestStatus::Pending),
        "ACCEPTED" => Ok(ContactRequestStatus::Accepted),
        "DECLINED" => Ok(ContactRequestStatus::Declined),
        "EXPIRED" => Ok(ContactRequestStatus::Expired),
        other => Err(StoreError::Backend(anyhow::anyhow!(
            "unrecognized contact request status in database: {other}"
        ))),
    }
}

fn parse_rule_scope(raw: &str) -> StoreResult<RuleScope> {
    match raw {
        "tenant" => Ok(RuleScope::Tenant),
        "platform" => Ok(RuleScope::Platform),
        other => Err(StoreError::Backend(anyhow::anyhow!(
            "unrecognized rule scope in database: {other}"
        ))),
    }
}

#[derive(FromRow)]
struct ParticipantRow {
    conversation_id: Uuid,
    user_id: String,
    tenant_id: Option<String>,
    role: String,
    joined_at: OffsetDateTime,
    last_read_at: Option<OffsetDateTime>,
}

impl TryFrom<ParticipantRow> for Participant {
    type Error = StoreError;

    fn try_from(row: ParticipantRow) -> Result<Self, Self::Error> {
        Ok(Participant {
            conversation_id: row.conversation_id,
            user_id: row.user_id,
            tenant_id: row.tenant_id,
            role: parse_role(&row.role)?,
            joined_at: row.joined_at,
            last_read_at: row.last_read_at,
        })
    }
}

#[derive(FromRow)]
struct MessageRow {
    id: Uuid,
    conversation_id: Uuid,
    sender_id: String,
    content: String,
    msg_type: String,
    attachment_url: Option<String>,
    attachment_type: Option<String>,
    attachment_name: Option<String>,
    reply_to_id: Option<Uuid>,
    created_at: OffsetDateTime,
    edited_at: Option<OffsetDateTime>,
    deleted_at: Option<OffsetDateTime>,
}

impl TryFrom<MessageRow> for Message {
    type Error = StoreError;

    fn try_from(row: MessageRow) -> Result<Self, Self::Error> {
        Ok(Message {
            id: row.id,
            conversation_id: row.conversation_id,
            sender_id: row.sender_id,
            content: row.content,
            msg_type: parse_msg_type(&row.msg_type)?,
            attachment_url: row.attachment_url,
            attachment_type: row.attachment_type,
            attachment_name: row.attachment_name,
            reply_to_id: row.reply_to_id,
            created_at: row.created_at,
            edited_at: row.edited_at,
            deleted_at: row.deleted_at,
        })
    }
}

#[derive(FromRow)]
struct ContactRequestRow {
    id: Uuid,
    from_user_id: String,
    from_tenant_id: Option<String>,
    to_user_id: String,
    to_tenant_id: Option<String>,
    rule_id: String,
    message: Option<String>,
    status: String,
    created_at: OffsetDateTime,
    responded_at: Option<OffsetDateTime>,
    expires_at: OffsetDateTime,
}

impl TryFrom<ContactRequestRow> for ContactRequest {
    type Error = StoreError;

    fn try_from(row: ContactRequestRow) -> Result<Self, Self::Error> {
        Ok(ContactRequest {
            id: row.id,
            from_user_id: row.from_user_id,
            from_tenant_id: row.from_tenant_id,
            to_user_id: row.to_user_id,
            to_tenant_id: row.to_tenant_id,
            rule_id: row.rule_id,
            message: row.message,
            status: parse_request_status(&row.status)?,
            created_at: row.created_at,
            responded_at: row.responded_at,
            expires_at: row.expires_at,
        })
    }
}

#[derive(FromRow)]
struct MessagingRuleRow {
    id: String,
    name: String,
    source_scope: String,
    source_roles: Vec<String>,
    target_scope: String,
    target_roles: Vec<String>,
    require_approval: bool,
    max_messages_per_day: Option<i32>,
    is_active: bool,
    priority: i32,
}

impl TryFrom<MessagingRuleRow> for MessagingRule {
    type Error = StoreError;

    fn try_from(row: MessagingRuleRow) -> Result<Self, Self::Error> {
        Ok(MessagingRule {
            id: row.id,
            name: row.name,
            source_scope: parse_rule_scope(&row.source_scope)?,
            source_roles: row.source_roles,
            target_scope: parse_rule_scope(&row.target_scope)?,
            target_roles: row.target_roles,
            require_approval: row.require_approval,
            max_messages_per_day: row.max_messages_per_day.map(|n| n as u32),
            is_active: row.is_active,
            priority: row.priority,
        })
    }
}

#[derive(FromRow)]
struct BlockedUserRow {
    user_id: String,
    blocked_user_id: String,
    reason: Option<String>,
    created_at: OffsetDateTime,
}

impl From<BlockedUserRow> for BlockedUser {
    fn from(row: BlockedUserRow) -> Self {
        BlockedUser {
            user_id: row.user_id,
            blocked_user_id: row.blocked_user_id,
            reason: row.reason,
            created_at: row.created_at,
        }
    }
}

#[derive(FromRow)]
struct UserCacheRow {
    id: String,
    email: Option<String>,
    first_name: Option<String>,
    last_name: Option<String>,
    avatar_url: Option<String>,
}

impl From<UserCacheRow> for UserCache {
    fn from(row: UserCacheRow) -> Self {
        UserCache {
            id: row.id,
            email: row.email,
            first_name: row.first_name,
            last_name: row.last_name,
            avatar_url: row.avatar_url,
        }
    }
}

#[derive(FromRow)]
struct DirectoryRow {
    user_id: String,
    tenant_id: Option<String>,
    tenant_role: Option<String>,
    platform_role: Option<String>,
    email: Option<String>,
    display_name: Option<String>,
}

impl From<DirectoryRow> for AuthContext {
    fn from(row: DirectoryRow) -> Self {
        AuthContext {
            user_id: row.user_id,
            tenant_id: row.tenant_id,
            tenant_role: row.tenant_role,
            platform_role: row.platform_role,
            email: row.email,
            display_name: row.display_name,
        }
    }
}

#[async_trait]
impl Store for PostgresStore {
    async fn get_user_cache(&self, user_id: &str) -> StoreResult<Option<UserCache>> {
        let row = sqlx::query_as::<_, UserCacheRow>(
            "SELECT id, email, first_name, last_name, avatar_url FROM user_cache WHERE id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| classify_sqlx_error(e, "get_user_cache"))?;
        Ok(row.map(Into::into))
    }

    async fn upsert_directory_entry(&self, ctx: &AuthContext) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO user_directory (user_id, tenant_id, tenant_role, platform_role, email, display_name, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, now())
            ON CONFLICT (user_id) DO UPDATE SET
                tenant_id = excluded.tenant_id,
                tenant_role = excluded.tenant_role,
                platform_role = excluded.platform_role,
                email = excluded.email,
                display_name = excluded.display_name,
                updated_at = now()
            "#,
        )
        .bind(&ctx.user_id)
        .bind(&ctx.tenant_id)
        .bind(&ctx.tenant_role)
        .bind(&ctx.platform_role)
        .bind(&ctx.email)
        .bind(&ctx.display_name)
        .execute(&self.pool)
        .await
        .map_err(|e| classify_sqlx_error(e, "upsert_directory_entry"))?;
        Ok(())
    }

    async fn get_directory_entry(&self, user_id: &str) -> StoreResult<Option<AuthContext>> {
        let row = sqlx::query_as::<_, DirectoryRow>(
            "SELECT user_id, tenant_id, tenant_role, platform_role, email, display_name FROM user_directory WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| classify_sqlx_error(e, "get_directory_entry"))?;
        Ok(row.map(Into::into))
    }

    async fn create_conversation(
        &self,
        conv: NewConversation,
        participants: Vec<NewParticipant>,
    ) -> StoreResult<Conversation> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| classify_sqlx_error(e, "create_conversation.begin"))?;

        if conv.conv_type == ConversationType::Direct {
            if let [a, b] = &participants[..] {
                let existing = sqlx::query_as::<_, ConversationRow>(
                    r#"
                    SELECT c.id, c.conv_type, c.name, c.description, c.avatar_url, c.created_at, c.updated_at
                    FROM conversations c
                    WHERE c.conv_type = 'DIRECT'
                      AND EXISTS (SELECT 1 FROM participants p WHERE p.conversation_id = c.id AND p.user_id = $1)
                      AND EXISTS (SELECT 1 FROM participants p WHERE p.conversation_id = c.id AND p.user_id = $2)
                      AND (SELECT count(*) FROM participants p WHERE p.conversation_id = c.id) = 2
                    "#,
                )
                .bind(&a.user_id)
                .bind(&b.user_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| classify_sqlx_error(e, "find_direct_conversation"))?;

                if let Some(row) = existing {
                    return row.try_into();
                }
            }
        }

        let id = Uuid::new_v4();
        let direct_key = match (&participants[..], conv.conv_type) {
            ([a, b], ConversationType::Direct) => Some(direct_pair_key(&a.user_id, &b.user_id)),
            _ => None,
        };
        let row = sqlx::query_as::<_, ConversationRow>(
            r#"
            INSERT INTO conversations (id, conv_type, name, description, avatar_url, direct_key, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, now(), now())
            RETURNING id, conv_type, name, description, avatar_url, created_at, updated_at
            "#,
        )
        .bind(id)
        .bind(conv.conv_type.as_str())
        .bind(&conv.name)
        .bind(&conv.description)
        .bind(&conv.avatar_url)
        .bind(&direct_key)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| classify_sqlx_error(e, "create_conversation.insert"))?;

        for p in &participants {
            sqlx::query(
                r#"
                INSERT INTO participants (conversation_id, user_id, tenant_id, role, joined_at)
                VALUES ($1, $2, $3, $4, now())
                "#,
            )
            .bind(id)
            .bind(&p.user_id)
            .bind(&p.tenant_id)
            .bind(p.role.as_str())
            .execute(&mut *tx)
            .await
            .map_err(|e| classify_sqlx_error(e, "create_conversation.add_participant"))?;
        }

        tx.commit()
            .await
            .map_err(|e| classify_sqlx_error(e, "create_conversation.commit"))?;

        row.try_into()
    }

    async fn get_conversation(&self, id: Uuid) -> StoreResult<Option<Conversation>> {
        let row = sqlx::query_as::<_, ConversationRow>(
            "SELECT id, conv_type, name, description, avatar_url, created_at, updated_at FROM conversations WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| classify_sqlx_error(e, "get_conversation"))?;
        row.map(TryInto::try_into).transpose()
    }

    async fn find_direct_conversation(&self, a: &str, b: &str) -> StoreResult<Option<Conversation>> {
        let row = sqlx::query_as::<_, ConversationRow>(
            r#"
            SELECT c.id, c.conv_type, c.name, c.description, c.avatar_url, c.created_at, c.updated_at
            FROM conversations c
            WHERE c.conv_type = 'DIRECT'
              AND EXISTS (SELECT 1 FROM participants p WHERE p.conversation_id = c.id AND p.user_id = $1)
              AND EXISTS (SELECT 1 FROM participants p WHERE p.conversation_id = c.id AND p.user_id = $2)
              AND (SELECT count(*) FROM participants p WHERE p.conversation_id = c.id) = 2
            "#,
        )
        .bind(a)
        .bind(b)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| classify_sqlx_error(e, "find_direct_conversation"))?;
        row.map(TryInto::try_into).transpose()
    }

    async fn touch_conversation(&self, id: Uuid, at: OffsetDateTime) -> StoreResult<()> {
        let result = sqlx::query("UPDATE conversations SET updated_at = $2 WHERE id = $1")
            .bind(id)
            .bind(at)
            .execute(&self.pool)
            .await
            .map_err(|e| classify_sqlx_error(e, "touch_conversation"))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("conversation {id}")));
        }
        Ok(())
    }

    async fn conversations_for_user(
        &self,
        user_id: &str,
        limit: u32,
        cursor: Option<OffsetDateTime>,
    ) -> StoreResult<Vec<Conversation>> {
        let rows = sqlx::query_as::<_, ConversationRow>(
            r#"
            SELECT c.id, c.conv_type, c.name, c.description, c.avatar_url, c.created_at, c.updated_at
            FROM conversations c
            JOIN participants p ON p.conversation_id = c.id
            WHERE p.user_id = $1 AND ($2::timestamptz IS NULL OR c.updated_at < $2)
            ORDER BY c.updated_at DESC
            LIMIT $3
            "#,
        )
        .bind(user_id)
        .bind(cursor)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| classify_sqlx_error(e, "conversations_for_user"))?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn add_participant(&self, p: NewParticipant, joined_at: OffsetDateTime) -> StoreResult<Participant> {
        let row = sqlx::query_as::<_, ParticipantRow>(
            r#"
            INSERT INTO participants (conversation_id, user_id, tenant_id, role, joined_at)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING conversation_id, user_id, tenant_id, role, joined_at, last_read_at
            "#,
        )
        .bind(p.conversation_id)
        .bind(&p.user_id)
        .bind(&p.tenant_id)
        .bind(p.role.as_str())
        .bind(joined_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| classify_sqlx_error(e, "add_participant"))?;
        row.try_into()
    }

    async fn get_participant(&self, conversation_id: Uuid, user_id: &str) -> StoreResult<Option<Participant>> {
        let row = sqlx::query_as::<_, ParticipantRow>(
            "SELECT conversation_id, user_id, tenant_id, role, joined_at, last_read_at FROM participants WHERE conversation_id = $1 AND user_id = $2",
        )
        .bind(conversation_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| classify_sqlx_error(e, "get_participant"))?;
        row.map(TryInto::try_into).transpose()
    }

    async fn participants_for_conversation(&self, conversation_id: Uuid) -> StoreResult<Vec<Participant>> {
        let rows = sqlx::query_as::<_, ParticipantRow>(
            "SELECT conversation_id, user_id, tenant_id, role, joined_at, last_read_at FROM participants WHERE conversation_id = $1",
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| classify_sqlx_error(e, "participants_for_conversation"))?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn participants_for_user(&self, user_id: &str) -> StoreResult<Vec<Participant>> {
        let rows = sqlx::query_as::<_, ParticipantRow>(
            "SELECT conversation_id, user_id, tenant_id, role, joined_at, last_read_at FROM participants WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| classify_sqlx_error(e, "participants_for_user"))?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn set_last_read_at(&self, conversation_id: Uuid, user_id: &str, at: OffsetDateTime) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE participants
            SET last_read_at = $3
            WHERE conversation_id = $1 AND user_id = $2 AND (last_read_at IS NULL OR last_read_at < $3)
            "#,
        )
        .bind(conversation_id)
        .bind(user_id)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(|e| classify_sqlx_error(e, "set_last_read_at"))?;
        // A no-op update (already-newer watermark) is not an error; only a
        // missing participant row is (§4.2 P7).
        if result.rows_affected() == 0 {
            let exists = self.get_participant(conversation_id, user_id).await?;
            if exists.is_none() {
                return Err(StoreError::NotFound(format!("participant {user_id} in {conversation_id}")));
            }
        }
        Ok(())
    }

    async fn insert_message(&self, msg: NewMessage, created_at: OffsetDateTime) -> StoreResult<Message> {
        let id = Uuid::new_v4();
        let row = sqlx::query_as::<_, MessageRow>(
            r#"
            INSERT INTO messages (
                id, conversation_id, sender_id, content, msg_type,
                attachment_url, attachment_type, attachment_name, reply_to_id, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING id, conversation_id, sender_id, content, msg_type,
                attachment_url, attachment_type, attachment_name, reply_to_id,
                created_at, edited_at, deleted_at
            "#,
        )
        .bind(id)
        .bind(msg.conversation_id)
        .bind(&msg.sender_id)
        .bind(&msg.content)
        .bind(msg.msg_type.as_str())
        .bind(&msg.attachment_url)
        .bind(&msg.attachment_type)
        .bind(&msg.attachment_name)
        .bind(msg.reply_to_id)
        .bind(created_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| classify_sqlx_error(e, "insert_message"))?;
        row.try_into()
    }

    async fn get_message(&self, conversation_id: Uuid, message_id: Uuid) -> StoreResult<Option<Message>> {
        let row = sqlx::query_as::<_, MessageRow>(
            r#"
            SELECT id, conversation_id, sender_id, content, msg_type,
                attachment_url, attachment_type, attachment_name, reply_to_id,
                created_at, edited_at, deleted_at
            FROM messages WHERE conversation_id = $1 AND id = $2
            "#,
        )
        .bind(conversation_id)
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| classify_sqlx_error(e, "get_message"))?;
        row.map(TryInto::try_into).transpose()
    }

    async fn messages_in(
        &self,
        conversation_id: Uuid,
        limit: u32,
        cursor: Option<OffsetDateTime>,
    ) -> StoreResult<Vec<Message>> {
        let rows = sqlx::query_as::<_, MessageRow>(
            r#"
            SELECT id, conversation_id, sender_id, content, msg_type,
                attachment_url, attachment_type, attachment_name, reply_to_id,
                created_at, edited_at, deleted_at
            FROM messages
            WHERE conversation_id = $1 AND deleted_at IS NULL
              AND ($2::timestamptz IS NULL OR created_at < $2)
            ORDER BY created_at DESC
            LIMIT $3
            "#,
        )
        .bind(conversation_id)
        .bind(cursor)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| classify_sqlx_error(e, "messages_in"))?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn last_message(&self, conversation_id: Uuid) -> StoreResult<Option<Message>> {
        let row = sqlx::query_as::<_, MessageRow>(
            r#"
            SELECT id, conversation_id, sender_id, content, msg_type,
                attachment_url, attachment_type, attachment_name, reply_to_id,
                created_at, edited_at, deleted_at
            FROM messages
            WHERE conversation_id = $1 AND deleted_at IS NULL
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(conversation_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| classify_sqlx_error(e, "last_message"))?;
        row.map(TryInto::try_into).transpose()
    }

    async fn count_unread(
        &self,
        conversation_id: Uuid,
        user_id: &str,
        since_read_at: Option<OffsetDateTime>,
    ) -> StoreResult<i64> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT count(*) FROM messages
            WHERE conversation_id = $1 AND sender_id <> $2 AND deleted_at IS NULL
              AND ($3::timestamptz IS NULL OR created_at > $3)
            "#,
        )
        .bind(conversation_id)
        .bind(user_id)
        .bind(since_read_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| classify_sqlx_error(e, "count_unread"))?;
        Ok(count)
    }

    async fn count_messages_since(
        &self,
        conversation_id: Uuid,
        sender_id: &str,
        since: OffsetDateTime,
    ) -> StoreResult<i64> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT count(*) FROM messages
            WHERE conversation_id = $1 AND sender_id = $2 AND deleted_at IS NULL AND created_at >= $3
            "#,
        )
        .bind(conversation_id)
        .bind(sender_id)
        .bind(since)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| classify_sqlx_error(e, "count_messages_since"))?;
        Ok(count)
    }

    async fn active_rules_by_priority(&self) -> StoreResult<Vec<MessagingRule>> {
        let rows = sqlx::query_as::<_, MessagingRuleRow>(
            r#"
            SELECT id, name, source_scope, source_roles, target_scope, target_roles,
                require_approval, max_messages_per_day, is_active, priority
            FROM messaging_rules
            WHERE is_active
            ORDER BY priority DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| classify_sqlx_error(e, "active_rules_by_priority"))?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn seed_default_rules_if_empty(&self) -> StoreResult<()> {
        let (count,): (i64,) = sqlx::query_as("SELECT count(*) FROM messaging_rules")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| classify_sqlx_error(e, "seed_default_rules_if_empty.count"))?;
        if count > 0 {
            return Ok(());
        }
        for rule in crate::memory::default_rules() {
            sqlx::query(
                r#"
                INSERT INTO messaging_rules (
                    id, name, source_scope, source_roles, target_scope, target_roles,
                    require_approval, max_messages_per_day, is_active, priority
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                ON CONFLICT (id) DO NOTHING
                "#,
            )
            .bind(&rule.id)
            .bind(&rule.name)
            .bind(rule_scope_str(rule.source_scope))
            .bind(&rule.source_roles)
            .bind(rule_scope_str(rule.target_scope))
            .bind(&rule.target_roles)
            .bind(rule.require_approval)
            .bind(rule.max_messages_per_day.map(|n| n as i32))
            .bind(rule.is_active)
            .bind(rule.priority)
            .execute(&self.pool)
            .await
            .map_err(|e| classify_sqlx_error(e, "seed_default_rules_if_empty.insert"))?;
        }
        Ok(())
    }

    async fn create_contact_request(
        &self,
        req: NewContactRequest,
        now: OffsetDateTime,
    ) -> StoreResult<ContactRequest> {
        let already_pending = self.pending_request(&req.from_user_id, &req.to_user_id, now).await?;
        if already_pending.is_some() {
            return Err(StoreError::Conflict(format!(
                "pending contact request already exists from {} to {}",
                req.from_user_id, req.to_user_id
            )));
        }
        let id = Uuid::new_v4();
        let row = sqlx::query_as::<_, ContactRequestRow>(
            r#"
            INSERT INTO contact_requests (
                id, from_user_id, from_tenant_id, to_user_id, to_tenant_id,
                rule_id, message, status, created_at, expires_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, 'PENDING', $8, $9)
            RETURNING id, from_user_id, from_tenant_id, to_user_id, to_tenant_id,
                rule_id, message, status, created_at, responded_at, expires_at
            "#,
        )
        .bind(id)
        .bind(&req.from_user_id)
        .bind(&req.from_tenant_id)
        .bind(&req.to_user_id)
        .bind(&req.to_tenant_id)
        .bind(&req.rule_id)
        .bind(&req.message)
        .bind(now)
        .bind(req.expires_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| classify_sqlx_error(e, "create_contact_request"))?;
        row.try_into()
    }

    async fn get_contact_request(&self, id: Uuid) -> StoreResult<Option<ContactRequest>> {
        let row = sqlx::query_as::<_, ContactRequestRow>(
            r#"
            SELECT id, from_user_id, from_tenant_id, to_user_id, to_tenant_id,
                rule_id, message, status, created_at, responded_at, expires_at
            FROM contact_requests WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| classify_sqlx_error(e, "get_contact_request"))?;
        row.map(TryInto::try_into).transpose()
    }

    async fn pending_request(&self, from: &str, to: &str, now: OffsetDateTime) -> StoreResult<Option<ContactRequest>> {
        let row = sqlx::query_as::<_, ContactRequestRow>(
            r#"
            SELECT id, from_user_id, from_tenant_id, to_user_id, to_tenant_id,
                rule_id, message, status, created_at, responded_at, expires_at
            FROM contact_requests
            WHERE from_user_id = $1 AND to_user_id = $2 AND status = 'PENDING' AND expires_at > $3
            "#,
        )
        .bind(from)
        .bind(to)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| classify_sqlx_error(e, "pending_request"))?;
        row.map(TryInto::try_into).transpose()
    }

    async fn accepted_between(&self, a: &str, b: &str) -> StoreResult<bool> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT count(*) FROM contact_requests
            WHERE status = 'ACCEPTED'
              AND ((from_user_id = $1 AND to_user_id = $2) OR (from_user_id = $2 AND to_user_id = $1))
            "#,
        )
        .bind(a)
        .bind(b)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| classify_sqlx_error(e, "accepted_between"))?;
        Ok(count > 0)
    }

    async fn requests_received(&self, user_id: &str, now: OffsetDateTime) -> StoreResult<Vec<ContactRequest>> {
        let rows = sqlx::query_as::<_, ContactRequestRow>(
            r#"
            SELECT id, from_user_id, from_tenant_id, to_user_id, to_tenant_id,
                rule_id, message, status, created_at, responded_at, expires_at
            FROM contact_requests WHERE to_user_id = $1 ORDER BY created_at DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| classify_sqlx_error(e, "requests_received"))?;
        rows.into_iter()
            .map(|row| {
                let mut req: ContactRequest = row.try_into()?;
                req.status = req.effective_status(now);
                Ok(req)
            })
            .collect()
    }

    async fn requests_sent(&self, user_id: &str, now: OffsetDateTime) -> StoreResult<Vec<ContactRequest>> {
        let rows = sqlx::query_as::<_, ContactRequestRow>(
            r#"
            SELECT id, from_user_id, from_tenant_id, to_user_id, to_tenant_id,
                rule_id, message, status, created_at, responded_at, expires_at
            FROM contact_requests WHERE from_user_id = $1 ORDER BY created_at DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| classify_sqlx_error(e, "requests_sent"))?;
        rows.into_iter()
            .map(|row| {
                let mut req: ContactRequest = row.try_into()?;
                req.status = req.effective_status(now);
                Ok(req)
            })
            .collect()
    }

    async fn respond_to_request(&self, id: Uuid, accept: bool, at: OffsetDateTime) -> StoreResult<ContactRequest> {
        let status = if accept { "ACCEPTED" } else { "DECLINED" };
        let row = sqlx::query_as::<_, ContactRequestRow>(
            r#"
            UPDATE contact_requests SET status = $2, responded_at = $3 WHERE id = $1
            RETURNING id, from_user_id, from_tenant_id, to_user_id, to_tenant_id,
                rule_id, message, status, created_at, responded_at, expires_at
            "#,
        )
        .bind(id)
        .bind(status)
        .bind(at)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| classify_sqlx_error(e, "respond_to_request"))?
        .ok_or_else(|| StoreError::NotFound(format!("contact request {id}")))?;
        row.try_into()
    }

    async fn create_block(&self, block: NewBlock, at: OffsetDateTime) -> StoreResult<BlockedUser> {
        if block.user_id == block.blocked_user_id {
            return Err(StoreError::Conflict("cannot block yourself".into()));
        }
        let row = sqlx::query_as::<_, BlockedUserRow>(
            r#"
            INSERT INTO blocked_users (user_id, blocked_user_id, reason, created_at)
            VALUES ($1, $2, $3, $4)
            RETURNING user_id, blocked_user_id, reason, created_at
            "#,
        )
        .bind(&block.user_id)
        .bind(&block.blocked_user_id)
        .bind(&block.reason)
        .bind(at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| classify_sqlx_error(e, "create_block"))?;
        Ok(row.into())
    }

    async fn remove_block(&self, user_id: &str, blocked_user_id: &str) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM blocked_users WHERE user_id = $1 AND blocked_user_id = $2")
            .bind(user_id)
            .bind(blocked_user_id)
            .execute(&self.pool)
            .await
            .map_err(|e| classify_sqlx_error(e, "remove_block"))?;
        Ok(result.rows_affected() > 0)
    }

    async fn is_blocked_either_direction(&self, a: &str, b: &str) -> StoreResult<bool> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT count(*) FROM blocked_users
            WHERE (user_id = $1 AND blocked_user_id = $2) OR (user_id = $2 AND blocked_user_id = $1)
            "#,
        )
        .bind(a)
        .bind(b)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| classify_sqlx_error(e, "is_blocked_either_direction"))?;
        Ok(count > 0)
    }

    async fn blocks_for_user(&self, user_id: &str) -> StoreResult<Vec<BlockedUser>> {
        let rows = sqlx::query_as::<_, BlockedUserRow>(
            "SELECT user_id, blocked_user_id, reason, created_at FROM blocked_users WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| classify_sqlx_error(e, "blocks_for_user"))?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn ping(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| classify_sqlx_error(e, "ping"))?;
        Ok(())
    }
}

fn rule_scope_str(scope: RuleScope) -> &'static str {
    match scope {
        RuleScope::Tenant => "tenant",
        RuleScope::Platform => "platform",
    }
}
