//! Process-local [`BusClient`] used in tests and as the fallback when the
//! shared bus cannot be reached at startup (single-node degraded mode, §4.3).

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use time::OffsetDateTime;
use tokio::sync::broadcast;

use crate::{BusClient, BusError, BusMessage, HashField, Subscription};

const BROADCAST_CAPACITY: usize = 256;

struct HashEntry {
    fields: BTreeMap<String, (String, OffsetDateTime)>,
    expires_at: Option<OffsetDateTime>,
}

/// Identical semantics to the NATS-backed client, with zero cross-node
/// visibility. Clone is cheap: all state lives behind `Arc`. Each map's
/// own shard locking provides the synchronization a real hash/set store
/// would need a round-trip for, so no extra `Mutex` wrapping is used.
#[derive(Clone, Default)]
pub struct InMemoryBusClient {
    topics: Arc<DashMap<String, broadcast::Sender<BusMessage>>>,
    sets: Arc<DashMap<String, HashSet<String>>>,
    scalars: Arc<DashMap<String, String>>,
    hashes: Arc<DashMap<String, HashEntry>>,
}

impl InMemoryBusClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn topic_sender(&self, topic: &str) -> broadcast::Sender<BusMessage> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(BROADCAST_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl BusClient for InMemoryBusClient {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError> {
        let sender = self.topic_sender(topic);
        // No subscribers is not an error: publishing into the void is normal.
        let _ = sender.send(BusMessage {
            topic: topic.to_string(),
            payload,
        });
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, BusError> {
        let mut rx = self.topic_sender(topic).subscribe();
        let (tx, out_rx) = tokio::sync::mpsc::channel(BROADCAST_CAPACITY);
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(msg) => {
                        if tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(Subscription::with_guard(out_rx, handle.abort_handle()))
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<(), BusError> {
        self.sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<(), BusError> {
        if let Some(mut set) = self.sets.get_mut(key) {
            set.remove(member);
        }
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, BusError> {
        Ok(match self.sets.get(key) {
            Some(set) => set.iter().cloned().collect(),
            None => Vec::new(),
        })
    }

    async fn set_contains(&self, key: &str, member: &str) -> Result<bool, BusError> {
        Ok(match self.sets.get(key) {
            Some(set) => set.contains(member),
            None => false,
        })
    }

    async fn kv_set(&self, key: &str, value: &str) -> Result<(), BusError> {
        self.scalars.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn kv_get(&self, key: &str) -> Result<Option<String>, BusError> {
        Ok(self.scalars.get(key).map(|v| v.clone()))
    }

    async fn hash_set(
        &self,
        key: &str,
        field: &str,
        value: &str,
        key_ttl: Option<Duration>,
    ) -> Result<(), BusError> {
        let now = OffsetDateTime::now_utc();
        let mut entry = self.hashes.entry(key.to_string()).or_insert_with(|| HashEntry {
            fields: BTreeMap::new(),
            expires_at: None,
        });
        if let Some(expires_at) = entry.expires_at {
            if expires_at <= now {
                entry.fields.clear();
            }
        }
        entry
            .fields
            .insert(field.to_string(), (value.to_string(), now));
        if let Some(ttl) = key_ttl {
            entry.expires_at = Some(now + time::Duration::try_from(ttl).unwrap_or_default());
        }
        Ok(())
    }

    async fn hash_delete(&self, key: &str, field: &str) -> Result<(), BusError> {
        if let Some(mut entry) = self.hashes.get_mut(key) {
            entry.fields.remove(field);
        }
        Ok(())
    }

    async fn hash_get_all(&self, key: &str) -> Result<Vec<HashField>, BusError> {
        let now = OffsetDateTime::now_utc();
        let Some(entry) = self.hashes.get(key) else {
            return Ok(Vec::new());
        };
        if let Some(expires_at) = entry.expires_at {
            if expires_at <= now {
                return Ok(Vec::new());
            }
        }
        Ok(entry
            .fields
            .iter()
            .map(|(field, (value, last_write))| HashField {
                field: field.clone(),
                value: value.clone(),
                last_write: *last_write,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    #[tokio::test]
    async fn pubsub_delivers_in_publisher_order() {
        let bus = InMemoryBusClient::new();
        let mut sub = bus.subscribe("conversation:c1").await.unwrap();
        bus.publish("conversation:c1", b"one".to_vec()).await.unwrap();
        bus.publish("conversation:c1", b"two".to_vec()).await.unwrap();
        let first = sub.recv().await.unwrap();
        let second = sub.recv().await.unwrap();
        assert_eq!(first.payload, b"one");
        assert_eq!(second.payload, b"two");
    }

    #[tokio::test]
    async fn sets_add_remove_list() {
        let bus = InMemoryBusClient::new();
        bus.set_add("online:t1", "u1").await.unwrap();
        bus.set_add("online:t1", "u2").await.unwrap();
        assert!(bus.set_contains("online:t1", "u1").await.unwrap());
        bus.set_remove("online:t1", "u1").await.unwrap();
        let members = bus.set_members("online:t1").await.unwrap();
        assert_eq!(members, vec!["u2".to_string()]);
    }

    #[tokio::test]
    async fn hash_field_expires_with_key_ttl() {
        let bus = InMemoryBusClient::new();
        bus.hash_set("typing:c1", "u1", "1", Some(StdDuration::from_millis(10)))
            .await
            .unwrap();
        assert_eq!(bus.hash_get_all("typing:c1").await.unwrap().len(), 1);
        tokio::time::sleep(StdDuration::from_millis(30)).await;
        assert!(bus.hash_get_all("typing:c1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn hash_delete_removes_single_field() {
        let bus = InMemoryBusClient::new();
        bus.hash_set("typing:c1", "u1", "1", None).await.unwrap();
        bus.hash_set("typing:c1", "u2", "1", None).await.unwrap();
        bus.hash_delete("typing:c1", "u1").await.unwrap();
        let fields = bus.hash_get_all("typing:c1").await.unwrap();
        assert_eq!(fields.len(), 1);
        assert_eq!(fields[0].field, "u2");
    }
}
