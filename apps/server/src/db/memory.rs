//! In-memory versioned resource store
//!
//! Every write appends a version. Deletes append a tombstone version. Writers
//! are serialized through one mutex. A `StoreTransaction` holds that mutex for
//! its whole lifetime and stages its versions privately: reads made with the
//! transaction see them, every other reader sees committed state only.

use chrono::{DateTime, Utc};
use serde_json::{json, Value as JsonValue};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use uuid::Uuid;

use crate::models::{format_instant, Resource};
use crate::{Error, Result};

type ResourceKey = (String, String);

#[derive(Default)]
struct Tables {
    /// Versions per resource, oldest first
    resources: BTreeMap<ResourceKey, Vec<Resource>>,
}

impl Tables {
    /// Committed versions of `key`, then the ones staged in `tx`.
    fn versions<'a>(
        &'a self,
        tx: Option<&'a StoreTransaction>,
        key: &ResourceKey,
    ) -> impl Iterator<Item = &'a Resource> + 'a {
        let committed = self.resources.get(key).into_iter().flatten();
        let staged = tx.and_then(|tx| tx.staged.get(key)).into_iter().flatten();
        committed.chain(staged)
    }

    fn latest<'a>(&'a self, tx: Option<&'a StoreTransaction>, key: &ResourceKey) -> Option<&'a Resource> {
        tx.and_then(|tx| tx.staged.get(key))
            .and_then(|versions| versions.last())
            .or_else(|| self.resources.get(key).and_then(|versions| versions.last()))
    }

    fn keys<'a>(&'a self, tx: Option<&'a StoreTransaction>) -> BTreeSet<&'a ResourceKey> {
        let staged = tx.into_iter().flat_map(|tx| tx.staged.keys());
        self.resources.keys().chain(staged).collect()
    }
}

#[derive(Clone, Default)]
pub struct InMemoryResourceStore {
    tables: Arc<RwLock<Tables>>,
    writer: Arc<Mutex<()>>,
}

/// Exclusive write scope over the store
pub struct StoreTransaction {
    id: Uuid,
    _writer: OwnedMutexGuard<()>,
    /// Versions written through this transaction, oldest first per resource
    staged: BTreeMap<ResourceKey, Vec<Resource>>,
    started: Instant,
}

impl StoreTransaction {
    pub fn write_count(&self) -> usize {
        self.staged.values().map(Vec::len).sum()
    }
}

impl InMemoryResourceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for any other writer, then holds write access until commit or rollback.
    pub async fn begin_transaction(&self) -> StoreTransaction {
        let guard = self.writer.clone().lock_owned().await;
        let tx = StoreTransaction {
            id: Uuid::new_v4(),
            _writer: guard,
            staged: BTreeMap::new(),
            started: Instant::now(),
        };
        tracing::debug!(transaction_id = %tx.id, "Store transaction started");
        tx
    }

    /// Publish every staged version, then release write access.
    pub async fn commit(&self, tx: StoreTransaction) {
        let writes = tx.write_count();
        let mut tables = self.tables.write().await;
        for (key, versions) in tx.staged {
            tables.resources.entry(key).or_default().extend(versions);
        }
        tracing::debug!(
            transaction_id = %tx.id,
            writes,
            elapsed_ms = tx.started.elapsed().as_millis() as u64,
            "Store transaction committed"
        );
    }

    /// Discards every version staged in `tx`. Returns how many were dropped.
    pub async fn rollback(&self, tx: StoreTransaction) -> usize {
        let removed = tx.write_count();
        tracing::debug!(
            transaction_id = %tx.id,
            removed,
            "Store transaction rolled back"
        );
        removed
    }

    /// Latest version, tombstones included.
    pub async fn read_latest(
        &self,
        tx: Option<&StoreTransaction>,
        resource_type: &str,
        id: &str,
    ) -> Option<Resource> {
        let tables = self.tables.read().await;
        tables
            .latest(tx, &(resource_type.to_string(), id.to_string()))
            .cloned()
    }

    pub async fn read_version(
        &self,
        tx: Option<&StoreTransaction>,
        resource_type: &str,
        id: &str,
        version_id: i32,
    ) -> Option<Resource> {
        let tables = self.tables.read().await;
        let key = (resource_type.to_string(), id.to_string());
        let found = tables.versions(tx, &key).find(|r| r.version_id == version_id).cloned();
        found
    }

    /// All versions in scope, newest first.
    pub async fn history(
        &self,
        tx: Option<&StoreTransaction>,
        resource_type: Option<&str>,
        id: Option<&str>,
    ) -> Vec<Resource> {
        let tables = self.tables.read().await;
        let mut out: Vec<Resource> = tables
            .keys(tx)
            .into_iter()
            .filter(|(rt, rid)| {
                resource_type.map_or(true, |t| t == rt) && id.map_or(true, |i| i == rid)
            })
            .flat_map(|key| tables.versions(tx, key).cloned().collect::<Vec<_>>())
            .collect();
        out.sort_by(|a, b| {
            b.last_updated
                .cmp(&a.last_updated)
                .then_with(|| b.version_id.cmp(&a.version_id))
        });
        out
    }

    /// Current, non-deleted versions in key order.
    pub async fn current(
        &self,
        tx: Option<&StoreTransaction>,
        resource_type: Option<&str>,
    ) -> Vec<Resource> {
        let tables = self.tables.read().await;
        tables
            .keys(tx)
            .into_iter()
            .filter(|(rt, _)| resource_type.map_or(true, |t| t == rt))
            .filter_map(|key| tables.latest(tx, key))
            .filter(|r| !r.deleted)
            .cloned()
            .collect()
    }

    /// Append a version. `content = None` writes a tombstone.
    ///
    /// Inside a transaction the version is staged until commit. Without one
    /// the write takes the writer lock for its own duration.
    pub async fn write_version(
        &self,
        tx: Option<&mut StoreTransaction>,
        resource_type: &str,
        id: &str,
        content: Option<JsonValue>,
        last_updated: DateTime<Utc>,
    ) -> Result<Resource> {
        let _autocommit = match tx {
            Some(_) => None,
            None => Some(self.writer.lock().await),
        };

        let deleted = content.is_none();
        let mut body = content.unwrap_or_else(|| json!({ "resourceType": resource_type }));
        if !body.is_object() {
            return Err(Error::InvalidResource(format!(
                "{}/{} is not a JSON object",
                resource_type, id
            )));
        }

        let key = (resource_type.to_string(), id.to_string());
        let mut tables = self.tables.write().await;
        let version_id = tables
            .latest(tx.as_deref(), &key)
            .map(|r| r.version_id + 1)
            .unwrap_or(1);

        populate_meta(&mut body, id, version_id, last_updated);

        let stored = Resource {
            id: id.to_string(),
            resource_type: resource_type.to_string(),
            version_id,
            resource: body,
            last_updated,
            deleted,
        };
        match tx {
            Some(tx) => tx.staged.entry(key).or_default().push(stored.clone()),
            None => tables.resources.entry(key).or_default().push(stored.clone()),
        }

        Ok(stored)
    }

    /// Number of live (non-deleted) committed resources.
    pub async fn live_count(&self) -> usize {
        self.current(None, None).await.len()
    }
}

/// Set `id`, `meta.versionId` and `meta.lastUpdated` on a resource body.
pub fn populate_meta(resource: &mut JsonValue, id: &str, version_id: i32, now: DateTime<Utc>) {
    if let Some(obj) = resource.as_object_mut() {
        obj.insert("id".to_string(), json!(id));

        let meta = obj.entry("meta".to_string()).or_insert_with(|| json!({}));
        if let Some(meta_obj) = meta.as_object_mut() {
            meta_obj.insert("versionId".to_string(), json!(version_id.to_string()));
            meta_obj.insert("lastUpdated".to_string(), json!(format_instant(now)));
        }
    }
}
