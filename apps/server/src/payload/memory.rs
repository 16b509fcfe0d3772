//! In-process payload store keeping serialized resources in memory.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::{PayloadKey, PayloadReceipt, PayloadStore};
use crate::{Error, Result};

#[derive(Default)]
pub struct InMemoryPayloadStore {
    payloads: RwLock<HashMap<PayloadKey, Vec<u8>>>,
}

impl InMemoryPayloadStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.payloads.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.payloads.read().await.is_empty()
    }

    pub async fn keys(&self) -> Vec<PayloadKey> {
        let mut keys: Vec<PayloadKey> = self.payloads.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl PayloadStore for InMemoryPayloadStore {
    async fn store_payload(&self, key: &PayloadKey, resource: &JsonValue) -> Result<PayloadReceipt> {
        let bytes = serde_json::to_vec(resource)
            .map_err(|e| Error::PayloadStore(format!("failed to serialize {}: {}", key, e)))?;
        let size_bytes = bytes.len();

        self.payloads.write().await.insert(key.clone(), bytes);
        tracing::trace!(payload = %key, size_bytes, "Payload stored");

        Ok(PayloadReceipt {
            key: key.clone(),
            size_bytes,
            stored_at: Utc::now(),
        })
    }

    async fn read_payload(&self, key: &PayloadKey) -> Result<Option<JsonValue>> {
        let payloads = self.payloads.read().await;
        let Some(bytes) = payloads.get(key) else {
            return Ok(None);
        };
        serde_json::from_slice(bytes)
            .map(Some)
            .map_err(|e| Error::PayloadStore(format!("corrupt payload {}: {}", key, e)))
    }

    async fn delete_payload(&self, key: &PayloadKey) -> Result<()> {
        if self.payloads.write().await.remove(key).is_some() {
            tracing::trace!(payload = %key, "Payload deleted");
        }
        Ok(())
    }
}
