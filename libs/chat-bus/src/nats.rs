//! NATS-backed [`BusClient`]. Pub/sub rides plain NATS subjects; sets and
//! TTL hashes are JSON blobs in a JetStream KV bucket, following the same
//! get-or-create-bucket shape `gsm-idempotency`'s `NatsKvIdemStore` uses.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration as StdDuration;

use async_nats::ConnectOptions;
use async_nats::jetstream::{self, context::KeyValueErrorKind, kv};
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::{BusClient, BusError, BusMessage, HashField, Subscription};

const PRESENCE_BUCKET: &str = "chat_presence";
const TYPING_BUCKET: &str = "chat_typing";
const RECONNECT_CAP: StdDuration = StdDuration::from_secs(2);

#[derive(Clone)]
pub struct NatsBusClient {
    client: async_nats::Client,
    js: jetstream::Context,
    presence: kv::Store,
    typing: kv::Store,
}

#[derive(Serialize, Deserialize, Default)]
struct SetBlob {
    members: HashSet<String>,
}

#[derive(Serialize, Deserialize, Default)]
struct HashBlob {
    #[serde(with = "time::serde::rfc3339::option", default)]
    expires_at: Option<OffsetDateTime>,
    fields: BTreeMap<String, FieldBlob>,
}

#[derive(Serialize, Deserialize)]
struct FieldBlob {
    value: String,
    #[serde(with = "time::serde::rfc3339")]
    last_write: OffsetDateTime,
}

impl NatsBusClient {
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let client = ConnectOptions::new()
            .retry_on_initial_connect()
            .reconnect_delay_callback(|attempts| {
                std::cmp::min(StdDuration::from_millis(200 * attempts as u64), RECONNECT_CAP)
            })
            .connect(url)
            .await?;
        let js = jetstream::new(client.clone());
        let presence = get_or_create_bucket(&js, PRESENCE_BUCKET, None).await?;
        // Coarse key-level expiry for typing entries (§3): 10s bucket max-age.
        let typing = get_or_create_bucket(&js, TYPING_BUCKET, Some(StdDuration::from_secs(10))).await?;
        Ok(Self {
            client,
            js,
            presence,
            typing,
        })
    }

    async fn read_set(&self, key: &str) -> Result<SetBlob, BusError> {
        match self.presence.get(key).await.map_err(|e| BusError::Op(anyhow::Error::new(e)))? {
            Some(bytes) => serde_json::from_slice(&bytes).map_err(|e| BusError::Op(e.into())),
            None => Ok(SetBlob::default()),
        }
    }

    async fn write_set(&self, key: &str, blob: &SetBlob) -> Result<(), BusError> {
        let bytes = serde_json::to_vec(blob).map_err(|e| BusError::Op(e.into()))?;
        self.presence.put(key, bytes.into()).await.map_err(|e| BusError::Op(anyhow::Error::new(e)))?;
        Ok(())
    }

    async fn read_hash(&self, key: &str) -> Result<HashBlob, BusError> {
        match self.typing.get(key).await.map_err(|e| BusError::Op(anyhow::Error::new(e)))? {
            Some(bytes) => serde_json::from_slice(&bytes).map_err(|e| BusError::Op(e.into())),
            None => Ok(HashBlob::default()),
        }
    }

    async fn write_hash(&self, key: &str, blob: &HashBlob) -> Result<(), BusError> {
        let bytes = serde_json::to_vec(blob).map_err(|e| BusError::Op(e.into()))?;
        self.typing.put(key, bytes.into()).await.map_err(|e| BusError::Op(anyhow::Error::new(e)))?;
        Ok(())
    }
}

#[async_trait]
impl BusClient for NatsBusClient {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError> {
        self.client
            .publish(topic.to_string(), payload.into())
            .await
            .map_err(|e| BusError::Publish(e.into()))
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, BusError> {
        let mut sub = self
            .client
            .subscribe(topic.to_string())
            .await
            .map_err(|e| BusError::Subscribe(e.into()))?;
        let (tx, rx) = tokio::sync::mpsc::channel(256);
        let topic_owned = topic.to_string();
        let handle = tokio::spawn(async move {
            while let Some(msg) = sub.next().await {
                let forwarded = BusMessage {
                    topic: topic_owned.clone(),
                    payload: msg.payload.to_vec(),
                };
                if tx.send(forwarded).await.is_err() {
                    break;
                }
            }
        });
        Ok(Subscription::with_guard(rx, handle.abort_handle()))
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<(), BusError> {
        let mut blob = self.read_set(key).await?;
        blob.members.insert(member.to_string());
        self.write_set(key, &blob).await
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<(), BusError> {
        let mut blob = self.read_set(key).await?;
        blob.members.remove(member);
        self.write_set(key, &blob).await
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, BusError> {
        Ok(self.read_set(key).await?.members.into_iter().collect())
    }

    async fn set_contains(&self, key: &str, member: &str) -> Result<bool, BusError> {
        Ok(self.read_set(key).await?.members.contains(member))
    }

    async fn kv_set(&self, key: &str, value: &str) -> Result<(), BusError> {
        self.presence
            .put(key, value.as_bytes().to_vec().into())
            .await
            .map_err(|e| BusError::Op(anyhow::Error::new(e)))?;
        Ok(())
    }

    async fn kv_get(&self, key: &str) -> Result<Option<String>, BusError> {
        match self.presence.get(key).await.map_err(|e| BusError::Op(anyhow::Error::new(e)))? {
            Some(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).into_owned())),
            None => Ok(None),
        }
    }

    async fn hash_set(
        &self,
        key: &str,
        field: &str,
        value: &str,
        key_ttl: Option<StdDuration>,
    ) -> Result<(), BusError> {
        let now = OffsetDateTime::now_utc();
        let mut blob = self.read_hash(key).await?;
        if let Some(expires_at) = blob.expires_at {
            if expires_at <= now {
                blob.fields.clear();
            }
        }
        blob.fields.insert(
            field.to_string(),
            FieldBlob {
                value: value.to_string(),
                last_write: now,
            },
        );
        if let Some(ttl) = key_ttl {
            blob.expires_at = Some(now + time::Duration::try_from(ttl).unwrap_or_default());
        }
        self.write_hash(key, &blob).await
    }

    async fn hash_delete(&self, key: &str, field: &str) -> Result<(), BusError> {
        let mut blob = self.read_hash(key).await?;
        blob.fields.remove(field);
        self.write_hash(key, &blob).await
    }

    async fn hash_get_all(&self, key: &str) -> Result<Vec<HashField>, BusError> {
        let now = OffsetDateTime::now_utc();
        let blob = self.read_hash(key).await?;
        if let Some(expires_at) = blob.expires_at {
            if expires_at <= now {
                return Ok(Vec::new());
            }
        }
        Ok(blob
            .fields
            .into_iter()
            .map(|(field, f)| HashField {
                field,
                value: f.value,
                last_write: f.last_write,
            })
            .collect())
    }
}

async fn get_or_create_bucket(
    js: &jetstream::Context,
    name: &str,
    max_age: Option<StdDuration>,
) -> anyhow::Result<kv::Store> {
    match js.get_key_value(name).await {
        Ok(store) => Ok(store),
        Err(err) if err.kind() == KeyValueErrorKind::GetBucket => Ok(js
            .create_key_value(kv::Config {
                bucket: name.to_string(),
                history: 1,
                max_age: max_age.unwrap_or_default(),
                ..Default::default()
            })
            .await?),
        Err(err) => Err(anyhow::anyhow!(err).context(format!("bus kv init failed: {name}"))),
    }
}

/// Best-effort connect at startup. A failure does not abort the process: the
/// caller falls back to [`crate::InMemoryBusClient`] and runs in single-node
/// mode (§4.3).
pub async fn connect_degraded(url: &str) -> Option<NatsBusClient> {
    match NatsBusClient::connect(url).await {
        Ok(client) => {
            info!(url, "bus connected");
            Some(client)
        }
        Err(err) => {
            warn!(url, error = %err, "bus unavailable at startup; running in single-node mode");
            None
        }
    }
}
