//! Shared bus client (C3): pub/sub for cross-node fanout, plus the string
//! sets and TTL hashes that back presence and typing (§3, §4.3).
//!
//! Business services (C5, C6) never touch this crate directly — only C7
//! (session/fanout) and C4 (presence/typing) are wired to a [`BusClient`],
//! keeping the permission engine and conversation service unit-testable
//! without any network (§9 "Cross-node fanout").

mod memory;
mod nats;

pub use memory::InMemoryBusClient;
pub use nats::{NatsBusClient, connect_degraded};

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use time::OffsetDateTime;

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("bus publish failed: {0}")]
    Publish(#[source] anyhow::Error),
    #[error("bus subscribe failed: {0}")]
    Subscribe(#[source] anyhow::Error),
    #[error("bus operation failed: {0}")]
    Op(#[source] anyhow::Error),
}

/// A message delivered to a subscription, carrying the topic it arrived on
/// (a subscription may use wildcards in future, so the topic is not implied).
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Handle returned by [`BusClient::subscribe`]. Dropping it unsubscribes.
pub struct Subscription {
    rx: tokio::sync::mpsc::Receiver<BusMessage>,
    _guard: Option<tokio::task::AbortHandle>,
}

impl Subscription {
    pub fn new(rx: tokio::sync::mpsc::Receiver<BusMessage>) -> Self {
        Self { rx, _guard: None }
    }

    pub fn with_guard(rx: tokio::sync::mpsc::Receiver<BusMessage>, guard: tokio::task::AbortHandle) -> Self {
        Self {
            rx,
            _guard: Some(guard),
        }
    }

    pub async fn recv(&mut self) -> Option<BusMessage> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(guard) = self._guard.take() {
            guard.abort();
        }
    }
}

/// One field of a TTL hash, carrying the timestamp it was last written at so
/// callers can apply their own liveness window (e.g. typing's 5s, §4.4).
#[derive(Debug, Clone)]
pub struct HashField {
    pub field: String,
    pub value: String,
    pub last_write: OffsetDateTime,
}

/// Publish/subscribe plus the string-set and TTL-hash primitives presence
/// and typing are built on (§4.3). One publisher, one subscriber dispatch
/// loop per process (§5 "Shared resources"); publishers are concurrent-safe.
#[async_trait]
pub trait BusClient: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError>;

    async fn publish_json<T: Serialize + Sync>(
        &self,
        topic: &str,
        payload: &T,
    ) -> Result<(), BusError>
    where
        Self: Sized,
    {
        let bytes = serde_json::to_vec(payload).map_err(|e| BusError::Publish(e.into()))?;
        self.publish(topic, bytes).await
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, BusError>;

    /// Adds `member` to the string set at `key` (e.g. `online:{tenant}`).
    async fn set_add(&self, key: &str, member: &str) -> Result<(), BusError>;
    async fn set_remove(&self, key: &str, member: &str) -> Result<(), BusError>;
    async fn set_members(&self, key: &str) -> Result<Vec<String>, BusError>;
    async fn set_contains(&self, key: &str, member: &str) -> Result<bool, BusError>;

    /// Scalar key/value with no field structure (e.g. `lastSeen:{userId}`).
    async fn kv_set(&self, key: &str, value: &str) -> Result<(), BusError>;
    async fn kv_get(&self, key: &str) -> Result<Option<String>, BusError>;

    /// Writes `field = value` into the hash at `key`, stamping `last_write`
    /// with now. `key_ttl`, when set, is the coarse expiry for the whole key
    /// (typing's 10s, §3) — individual field liveness (typing's 5s) is a
    /// caller-side filter over `last_write`, not enforced here.
    async fn hash_set(
        &self,
        key: &str,
        field: &str,
        value: &str,
        key_ttl: Option<Duration>,
    ) -> Result<(), BusError>;
    async fn hash_delete(&self, key: &str, field: &str) -> Result<(), BusError>;
    async fn hash_get_all(&self, key: &str) -> Result<Vec<HashField>, BusError>;
}
