//! Presence & typing service (C4): online sets and a per-conversation typing
//! hash layered on the bus client's sets/hashes (§4.4). Pure pass-through —
//! no state of its own beyond the `BusClient` it wraps, so single-node
//! degraded mode (§4.3) falls out of whichever `BusClient` impl is wired in.

use std::sync::Arc;
use std::time::Duration;

use chat_bus::{BusClient, BusError};
use chat_core::topics::{last_seen_key, online_set_key, typing_key};
use time::OffsetDateTime;

/// Typing entries older than this are no longer reported (§3, §4.4).
const TYPING_LIVENESS: time::Duration = time::Duration::seconds(5);
/// Coarse key-level expiry for a conversation's typing hash (§3, §4.4).
const TYPING_KEY_TTL: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct PresenceService {
    bus: Arc<dyn BusClient>,
}

impl PresenceService {
    pub fn new(bus: Arc<dyn BusClient>) -> Self {
        Self { bus }
    }

    pub async fn set_online(&self, user_id: &str, tenant_id: Option<&str>) -> Result<(), BusError> {
        self.bus.set_add(&online_set_key(tenant_id), user_id).await?;
        self.touch_last_seen(user_id).await
    }

    pub async fn set_offline(&self, user_id: &str, tenant_id: Option<&str>) -> Result<(), BusError> {
        self.bus.set_remove(&online_set_key(tenant_id), user_id).await?;
        self.touch_last_seen(user_id).await
    }

    pub async fn is_online(&self, user_id: &str, tenant_id: Option<&str>) -> Result<bool, BusError> {
        self.bus.set_contains(&online_set_key(tenant_id), user_id).await
    }

    pub async fn online_users(&self, tenant_id: Option<&str>) -> Result<Vec<String>, BusError> {
        self.bus.set_members(&online_set_key(tenant_id)).await
    }

    pub async fn last_seen(&self, user_id: &str) -> Result<Option<OffsetDateTime>, BusError> {
        let raw = self.bus.kv_get(&last_seen_key(user_id)).await?;
        Ok(raw.and_then(|v| OffsetDateTime::parse(&v, &time::format_description::well_known::Rfc3339).ok()))
    }

    async fn touch_last_seen(&self, user_id: &str) -> Result<(), BusError> {
        let now = OffsetDateTime::now_utc()
            .format(&time::format_description::well_known::Rfc3339)
            .map_err(|e| BusError::Op(anyhow::Error::new(e)))?;
        self.bus.kv_set(&last_seen_key(user_id), &now).await
    }

    pub async fn set_typing(&self, conversation_id: &str, user_id: &str, is_typing: bool) -> Result<(), BusError> {
        let key = typing_key(conversation_id);
        if is_typing {
            self.bus.hash_set(&key, user_id, "1", Some(TYPING_KEY_TTL)).await
        } else {
            self.bus.hash_delete(&key, user_id).await
        }
    }

    /// Users whose typing field was written within the last 5s (§4.4). A
    /// field older than that is stale even if the key itself hasn't expired
    /// yet, since `key_ttl` is only a coarse upper bound.
    pub async fn typing_users(&self, conversation_id: &str) -> Result<Vec<String>, BusError> {
        let fields = self.bus.hash_get_all(&typing_key(conversation_id)).await?;
        let now = OffsetDateTime::now_utc();
        Ok(fields
            .into_iter()
            .filter(|f| now - f.last_write < TYPING_LIVENESS)
            .map(|f| f.field)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chat_bus::InMemoryBusClient;

    fn service() -> PresenceService {
        PresenceService::new(Arc::new(InMemoryBusClient::new()))
    }

    #[tokio::test]
    async fn online_users_reflect_set_and_unset() {
        let svc = service();
        svc.set_online("u1", Some("acme")).await.unwrap();
        svc.set_online("u2", Some("acme")).await.unwrap();
        assert!(svc.is_online("u1", Some("acme")).await.unwrap());

        let mut online = svc.online_users(Some("acme")).await.unwrap();
        online.sort();
        assert_eq!(online, vec!["u1".to_string(), "u2".to_string()]);

        svc.set_offline("u1", Some("acme")).await.unwrap();
        assert!(!svc.is_online("u1", Some("acme")).await.unwrap());
        assert!(svc.last_seen("u1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn typing_users_excludes_stopped() {
        let svc = service();
        svc.set_typing("c1", "u1", true).await.unwrap();
        svc.set_typing("c1", "u2", true).await.unwrap();
        svc.set_typing("c1", "u2", false).await.unwrap();

        let typing = svc.typing_users("c1").await.unwrap();
        assert_eq!(typing, vec!["u1".to_string()]);
    }
}
