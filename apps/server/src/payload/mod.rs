//! Resource payload offloading
//!
//! Created resources can be written to a separate payload store while the
//! bundle is still being processed. The write runs as its own task and is
//! joined through a `PayloadHandle` before the entry completes.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use std::fmt;
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::{Error, Result};

pub use memory::InMemoryPayloadStore;

/// Identifies one stored version of a resource payload
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PayloadKey {
    pub resource_type: String,
    pub logical_id: String,
    pub version_id: i32,
}

impl PayloadKey {
    pub fn new(resource_type: impl Into<String>, logical_id: impl Into<String>, version_id: i32) -> Self {
        Self {
            resource_type: resource_type.into(),
            logical_id: logical_id.into(),
            version_id,
        }
    }
}

impl fmt::Display for PayloadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/_history/{}",
            self.resource_type, self.logical_id, self.version_id
        )
    }
}

/// Result of a completed payload write
#[derive(Debug, Clone)]
pub struct PayloadReceipt {
    pub key: PayloadKey,
    pub size_bytes: usize,
    pub stored_at: DateTime<Utc>,
}

/// Abstract interface for payload storage backends
#[async_trait]
pub trait PayloadStore: Send + Sync {
    async fn store_payload(&self, key: &PayloadKey, resource: &JsonValue) -> Result<PayloadReceipt>;

    async fn read_payload(&self, key: &PayloadKey) -> Result<Option<JsonValue>>;

    /// Remove a payload, e.g. after the bundle that wrote it was abandoned.
    /// Deleting a missing payload is not an error.
    async fn delete_payload(&self, key: &PayloadKey) -> Result<()>;
}

/// A payload write that may still be in flight
pub enum PayloadHandle {
    Ready(PayloadReceipt),
    Pending {
        key: PayloadKey,
        task: JoinHandle<Result<PayloadReceipt>>,
    },
}

impl PayloadHandle {
    /// Start writing `resource` on a separate task.
    pub fn spawn(store: Arc<dyn PayloadStore>, key: PayloadKey, resource: JsonValue) -> Self {
        let task_key = key.clone();
        let task = tokio::spawn(async move { store.store_payload(&task_key, &resource).await });
        PayloadHandle::Pending { key, task }
    }

    pub fn key(&self) -> &PayloadKey {
        match self {
            PayloadHandle::Ready(receipt) => &receipt.key,
            PayloadHandle::Pending { key, .. } => key,
        }
    }

    /// Wait for the write to finish.
    pub async fn resolve(self) -> Result<PayloadReceipt> {
        match self {
            PayloadHandle::Ready(receipt) => Ok(receipt),
            PayloadHandle::Pending { key, task } => task.await.map_err(|e| {
                Error::PayloadStore(format!("payload task for {} did not finish: {}", key, e))
            })?,
        }
    }
}

impl fmt::Debug for PayloadHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PayloadHandle::Ready(receipt) => f.debug_tuple("Ready").field(&receipt.key).finish(),
            PayloadHandle::Pending { key, task } => f
                .debug_struct("Pending")
                .field("key", key)
                .field("finished", &task.is_finished())
                .finish(),
        }
    }
}
