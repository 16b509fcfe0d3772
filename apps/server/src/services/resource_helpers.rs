//! Persistence and search boundary used by the bundle stages
//!
//! `StoreResourceHelpers` is built per bundle: it owns the store transaction of
//! a transactional bundle, so every write made through it lands in that
//! transaction until commit or rollback.

use async_trait::async_trait;
use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tessera_models::{IssueType, OperationOutcomeIssue};
use tokio::sync::Mutex;

use crate::db::{InMemoryResourceStore, StoreTransaction};
use crate::models::{
    OperationRequest, OperationResult, Resource, ResourceOperation, SearchResult,
};
use crate::payload::{PayloadHandle, PayloadKey, PayloadStore};
use crate::services::bundle::url::parse_query;
use crate::services::bundle::OperationResponse;
use crate::services::search::{references_target, HistoryParams, SearchParams};
use crate::services::OperationExecutor;
use crate::state::AppState;
use crate::{Error, Result};

#[async_trait]
pub trait ResourceHelpers: Send + Sync {
    async fn begin_transaction(&self) -> Result<()>;

    async fn commit_transaction(&self) -> Result<()>;

    /// Discard everything written since `begin_transaction`.
    async fn rollback_transaction(&self) -> Result<()>;

    /// Latest stored version, tombstones included.
    async fn read_latest(&self, resource_type: &str, id: &str) -> Result<Option<Resource>>;

    async fn do_search(
        &self,
        resource_type: Option<&str>,
        compartment: Option<(&str, &str)>,
        query: &[(String, String)],
    ) -> Result<SearchResult>;

    async fn do_read(&self, resource_type: &str, id: &str) -> Result<Resource>;

    async fn do_vread(&self, resource_type: &str, id: &str, version_id: i32) -> Result<Resource>;

    /// Versions in scope, newest first.
    async fn do_history(
        &self,
        resource_type: Option<&str>,
        id: Option<&str>,
        query: &[(String, String)],
    ) -> Result<Vec<Resource>>;

    /// Persist a resource whose id and meta were assigned when the bundle was prepared.
    async fn do_create_persist(
        &self,
        resource_type: &str,
        id: &str,
        resource: &JsonValue,
    ) -> Result<OperationResponse>;

    #[allow(clippy::too_many_arguments)]
    async fn do_patch_or_update_persist(
        &self,
        resource_type: &str,
        id: &str,
        is_patch: bool,
        resource: &JsonValue,
        prev_resource: Option<&JsonValue>,
        warnings: &[OperationOutcomeIssue],
        is_deleted: bool,
    ) -> Result<OperationResponse>;

    /// Instance delete (`id`) or conditional delete (`search_query`).
    async fn do_delete(
        &self,
        resource_type: &str,
        id: Option<&str>,
        search_query: Option<&str>,
    ) -> Result<OperationResponse>;

    async fn do_invoke(&self, request: OperationRequest) -> Result<OperationResult>;

    /// Start writing a payload. `None` when offloading is disabled.
    fn store_payload(&self, key: PayloadKey, resource: JsonValue) -> Option<PayloadHandle>;

    async fn delete_payload(&self, key: &PayloadKey) -> Result<()>;
}

pub struct StoreResourceHelpers {
    store: InMemoryResourceStore,
    payloads: Option<Arc<dyn PayloadStore>>,
    operations: Arc<OperationExecutor>,
    allow_update_create: bool,
    skip_unchanged_updates: bool,
    tx: Mutex<Option<StoreTransaction>>,
}

impl StoreResourceHelpers {
    pub fn new(store: InMemoryResourceStore, operations: Arc<OperationExecutor>) -> Self {
        Self {
            store,
            payloads: None,
            operations,
            allow_update_create: true,
            skip_unchanged_updates: true,
            tx: Mutex::new(None),
        }
    }

    pub fn from_state(state: &AppState) -> Self {
        let payload_config = &state.config.bundle.payload;
        let mut helpers = Self::new(state.store.clone(), state.operations.clone())
            .with_allow_update_create(state.config.fhir.allow_update_create)
            .with_skip_unchanged_updates(state.config.bundle.skip_unchanged_updates);
        if payload_config.offload_enabled {
            helpers = helpers.with_payloads(state.payloads.clone());
        }
        helpers
    }

    pub fn with_payloads(mut self, payloads: Arc<dyn PayloadStore>) -> Self {
        self.payloads = Some(payloads);
        self
    }

    pub fn with_allow_update_create(mut self, allow: bool) -> Self {
        self.allow_update_create = allow;
        self
    }

    pub fn with_skip_unchanged_updates(mut self, skip: bool) -> Self {
        self.skip_unchanged_updates = skip;
        self
    }

    async fn write(
        &self,
        resource_type: &str,
        id: &str,
        content: Option<JsonValue>,
        last_updated: DateTime<Utc>,
    ) -> Result<Resource> {
        let mut tx = self.tx.lock().await;
        self.store
            .write_version(tx.as_mut(), resource_type, id, content, last_updated)
            .await
    }

    async fn delete_one(
        &self,
        current: Option<Resource>,
        resource_type: &str,
        id: &str,
    ) -> Result<OperationResponse> {
        let response = OperationResponse::new(StatusCode::OK).with_identity(resource_type, id);

        match current {
            None => Ok(response.with_issue(OperationOutcomeIssue::warning(
                IssueType::NotFound,
                format!("{}/{} does not exist, nothing to delete", resource_type, id),
            ))),
            Some(current) if current.deleted => {
                let mut response = response.with_issue(OperationOutcomeIssue::warning(
                    IssueType::Deleted,
                    format!("{}/{} is already deleted", resource_type, id),
                ));
                response.version_id = Some(current.version_id);
                Ok(response)
            }
            Some(_) => {
                let tombstone = self.write(resource_type, id, None, Utc::now()).await?;
                tracing::debug!(resource = %tombstone.identity(), version = tombstone.version_id, "Resource deleted");
                Ok(OperationResponse::from_stored(tombstone, ResourceOperation::Deleted)
                    .with_issue(OperationOutcomeIssue::information(format!(
                        "Successfully deleted {}/{}",
                        resource_type, id
                    ))))
            }
        }
    }
}

#[async_trait]
impl ResourceHelpers for StoreResourceHelpers {
    async fn begin_transaction(&self) -> Result<()> {
        let mut tx = self.tx.lock().await;
        if tx.is_some() {
            return Err(Error::Internal("transaction already started".to_string()));
        }
        *tx = Some(self.store.begin_transaction().await);
        Ok(())
    }

    async fn commit_transaction(&self) -> Result<()> {
        let tx = self
            .tx
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::Internal("no transaction to commit".to_string()))?;
        self.store.commit(tx).await;
        Ok(())
    }

    async fn rollback_transaction(&self) -> Result<()> {
        let tx = self
            .tx
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::Internal("no transaction to roll back".to_string()))?;
        let removed = self.store.rollback(tx).await;
        tracing::warn!(removed, "Transaction rolled back");
        Ok(())
    }

    async fn read_latest(&self, resource_type: &str, id: &str) -> Result<Option<Resource>> {
        let tx = self.tx.lock().await;
        Ok(self.store.read_latest(tx.as_ref(), resource_type, id).await)
    }

    async fn do_search(
        &self,
        resource_type: Option<&str>,
        compartment: Option<(&str, &str)>,
        query: &[(String, String)],
    ) -> Result<SearchResult> {
        let params = SearchParams::parse(query)?;
        let mut candidates = {
            let tx = self.tx.lock().await;
            self.store.current(tx.as_ref(), resource_type).await
        };
        if let Some((owner_type, owner_id)) = compartment {
            let target = format!("{}/{}", owner_type, owner_id);
            candidates.retain(|r| references_target(&r.resource, &target));
        }
        Ok(params.apply(candidates))
    }

    async fn do_read(&self, resource_type: &str, id: &str) -> Result<Resource> {
        let current = self
            .read_latest(resource_type, id)
            .await?
            .ok_or_else(|| Error::ResourceNotFound {
                resource_type: resource_type.to_string(),
                id: id.to_string(),
            })?;
        if current.deleted {
            return Err(Error::ResourceDeleted {
                resource_type: resource_type.to_string(),
                id: id.to_string(),
                version_id: Some(current.version_id),
            });
        }
        Ok(current)
    }

    async fn do_vread(&self, resource_type: &str, id: &str, version_id: i32) -> Result<Resource> {
        let stored = {
            let tx = self.tx.lock().await;
            self.store
                .read_version(tx.as_ref(), resource_type, id, version_id)
                .await
        };
        let mut stored = stored.ok_or_else(|| Error::VersionNotFound {
            resource_type: resource_type.to_string(),
            id: id.to_string(),
            version_id,
        })?;
        if stored.deleted {
            return Err(Error::ResourceDeleted {
                resource_type: resource_type.to_string(),
                id: id.to_string(),
                version_id: Some(version_id),
            });
        }

        if let Some(payloads) = &self.payloads {
            let key = PayloadKey::new(resource_type, id, version_id);
            if let Some(body) = payloads.read_payload(&key).await? {
                stored.resource = body;
            }
        }
        Ok(stored)
    }

    async fn do_history(
        &self,
        resource_type: Option<&str>,
        id: Option<&str>,
        query: &[(String, String)],
    ) -> Result<Vec<Resource>> {
        let params = HistoryParams::parse(query)?;
        let versions = {
            let tx = self.tx.lock().await;
            self.store.history(tx.as_ref(), resource_type, id).await
        };
        if let (Some(rt), Some(id)) = (resource_type, id) {
            if versions.is_empty() {
                return Err(Error::ResourceNotFound {
                    resource_type: rt.to_string(),
                    id: id.to_string(),
                });
            }
        }
        Ok(params.apply(versions))
    }

    async fn do_create_persist(
        &self,
        resource_type: &str,
        id: &str,
        resource: &JsonValue,
    ) -> Result<OperationResponse> {
        if self.read_latest(resource_type, id).await?.is_some() {
            return Err(Error::Duplicate(format!(
                "{}/{} already exists",
                resource_type, id
            )));
        }

        let last_updated = resource
            .pointer("/meta/lastUpdated")
            .and_then(|v| v.as_str())
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        let stored = self
            .write(resource_type, id, Some(resource.clone()), last_updated)
            .await?;
        tracing::debug!(resource = %stored.identity(), "Resource created");
        Ok(OperationResponse::from_stored(stored, ResourceOperation::Created))
    }

    async fn do_patch_or_update_persist(
        &self,
        resource_type: &str,
        id: &str,
        is_patch: bool,
        resource: &JsonValue,
        prev_resource: Option<&JsonValue>,
        warnings: &[OperationOutcomeIssue],
        is_deleted: bool,
    ) -> Result<OperationResponse> {
        // Earlier entries of this bundle may have written the resource since it was prepared.
        let current = self.read_latest(resource_type, id).await?;
        let prepared_version = prev_resource.and_then(version_of);
        let current_version = current.as_ref().map(|c| c.version_id);
        let current_deleted = current.as_ref().map(|c| c.deleted).unwrap_or(false);
        if prepared_version != current_version || is_deleted != current_deleted {
            if is_patch {
                return Err(Error::Conflict(format!(
                    "{}/{} changed after the patch was computed",
                    resource_type, id
                )));
            }
            tracing::debug!(
                resource_type,
                id,
                ?prepared_version,
                ?current_version,
                "Update target changed since preparation"
            );
        }

        let operation = match &current {
            None if is_patch => {
                return Err(Error::ResourceNotFound {
                    resource_type: resource_type.to_string(),
                    id: id.to_string(),
                })
            }
            None if !self.allow_update_create => {
                return Err(Error::MethodNotAllowed(
                    "Server does not allow client-defined resource ids. \
                    Use POST to create resources with server-assigned ids."
                        .to_string(),
                ))
            }
            None => ResourceOperation::Created,
            Some(current) if current.deleted && is_patch => {
                return Err(Error::ResourceDeleted {
                    resource_type: resource_type.to_string(),
                    id: id.to_string(),
                    version_id: Some(current.version_id),
                })
            }
            Some(current) if current.deleted => ResourceOperation::Created,
            Some(current)
                if self.skip_unchanged_updates && same_content(&current.resource, resource) =>
            {
                ResourceOperation::NoOp
            }
            Some(_) => ResourceOperation::Updated,
        };

        let stored = match (operation, current) {
            (ResourceOperation::NoOp, Some(current)) => current,
            _ => {
                self.write(resource_type, id, Some(resource.clone()), Utc::now())
                    .await?
            }
        };

        tracing::debug!(
            resource = %stored.identity(),
            version = stored.version_id,
            operation = operation.as_str(),
            "Resource persisted"
        );
        Ok(OperationResponse::from_stored(stored, operation).with_issues(warnings.iter().cloned()))
    }

    async fn do_delete(
        &self,
        resource_type: &str,
        id: Option<&str>,
        search_query: Option<&str>,
    ) -> Result<OperationResponse> {
        match (id, search_query) {
            (Some(id), _) => {
                let current = self.read_latest(resource_type, id).await?;
                self.delete_one(current, resource_type, id).await
            }
            (None, Some(query)) => {
                let matches = self
                    .do_search(Some(resource_type), None, &parse_query(query)?)
                    .await?;
                match matches.resources.as_slice() {
                    [] => Ok(OperationResponse::new(StatusCode::OK).with_issue(
                        OperationOutcomeIssue::warning(
                            IssueType::NotFound,
                            format!("No {} matched '{}', nothing deleted", resource_type, query),
                        ),
                    )),
                    [single] => {
                        let id = single.id.clone();
                        self.delete_one(Some(single.clone()), resource_type, &id).await
                    }
                    _ => Err(Error::MultipleMatches(format!(
                        "Conditional delete {}?{} matched {} resources",
                        resource_type, query, matches.total
                    ))),
                }
            }
            (None, None) => Err(Error::InvalidResource(format!(
                "DELETE on {} requires an id or search criteria",
                resource_type
            ))),
        }
    }

    async fn do_invoke(&self, request: OperationRequest) -> Result<OperationResult> {
        self.operations.execute(request).await
    }

    fn store_payload(&self, key: PayloadKey, resource: JsonValue) -> Option<PayloadHandle> {
        let payloads = self.payloads.as_ref()?;
        Some(PayloadHandle::spawn(payloads.clone(), key, resource))
    }

    async fn delete_payload(&self, key: &PayloadKey) -> Result<()> {
        match &self.payloads {
            Some(payloads) => payloads.delete_payload(key).await,
            None => Ok(()),
        }
    }
}

fn version_of(resource: &JsonValue) -> Option<i32> {
    resource
        .pointer("/meta/versionId")
        .and_then(|v| v.as_str())
        .and_then(|v| v.parse().ok())
}

/// Equal apart from `meta`.
fn same_content(prev: &JsonValue, next: &JsonValue) -> bool {
    let strip = |value: &JsonValue| {
        let mut value = value.clone();
        if let Some(obj) = value.as_object_mut() {
            obj.remove("meta");
        }
        value
    };
    strip(prev) == strip(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::InMemoryPayloadStore;
    use serde_json::json;

    fn helpers() -> StoreResourceHelpers {
        helpers_on(InMemoryResourceStore::new())
    }

    fn helpers_on(store: InMemoryResourceStore) -> StoreResourceHelpers {
        let operations = Arc::new(OperationExecutor::new(store.clone()));
        StoreResourceHelpers::new(store, operations)
    }

    #[tokio::test]
    async fn test_update_semantics() -> anyhow::Result<()> {
        let helpers = helpers();
        let body = json!({"resourceType": "Patient", "id": "p1", "active": true});

        let created = helpers
            .do_patch_or_update_persist("Patient", "p1", false, &body, None, &[], false)
            .await?;
        assert_eq!(created.status, StatusCode::CREATED);

        let stored = helpers.read_latest("Patient", "p1").await?.unwrap();
        let unchanged = helpers
            .do_patch_or_update_persist("Patient", "p1", false, &body, Some(&stored.resource), &[], false)
            .await?;
        assert_eq!(unchanged.operation, Some(ResourceOperation::NoOp));
        assert_eq!(unchanged.version_id, Some(1));

        let changed = json!({"resourceType": "Patient", "id": "p1", "active": false});
        let updated = helpers
            .do_patch_or_update_persist("Patient", "p1", false, &changed, Some(&stored.resource), &[], false)
            .await?;
        assert_eq!(updated.status, StatusCode::OK);
        assert_eq!(updated.version_id, Some(2));
        Ok(())
    }

    #[tokio::test]
    async fn test_update_create_disabled() {
        let helpers = helpers().with_allow_update_create(false);
        let err = helpers
            .do_patch_or_update_persist(
                "Patient",
                "p1",
                false,
                &json!({"resourceType": "Patient"}),
                None,
                &[],
                false,
            )
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_delete_then_read_is_gone() -> anyhow::Result<()> {
        let helpers = helpers();
        helpers
            .do_create_persist("Patient", "p1", &json!({"resourceType": "Patient"}))
            .await?;

        let deleted = helpers.do_delete("Patient", Some("p1"), None).await?;
        assert_eq!(deleted.operation, Some(ResourceOperation::Deleted));
        assert_eq!(deleted.version_id, Some(2));

        let err = helpers.do_read("Patient", "p1").await.unwrap_err();
        assert_eq!(err.status(), StatusCode::GONE);

        let again = helpers.do_delete("Patient", Some("p1"), None).await?;
        assert_eq!(again.status, StatusCode::OK);
        assert!(again.outcome.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn test_conditional_delete_multiple_matches() -> anyhow::Result<()> {
        let helpers = helpers();
        for id in ["a", "b"] {
            helpers
                .do_create_persist("Patient", id, &json!({"resourceType": "Patient", "gender": "male"}))
                .await?;
        }
        let err = helpers
            .do_delete("Patient", None, Some("gender=male"))
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::PRECONDITION_FAILED);
        Ok(())
    }

    #[tokio::test]
    async fn test_vread_prefers_payload() -> anyhow::Result<()> {
        let payloads = Arc::new(InMemoryPayloadStore::new());
        let helpers = helpers().with_payloads(payloads.clone());
        helpers
            .do_create_persist("Patient", "p1", &json!({"resourceType": "Patient"}))
            .await?;
        payloads
            .store_payload(
                &PayloadKey::new("Patient", "p1", 1),
                &json!({"resourceType": "Patient", "id": "p1", "offloaded": true}),
            )
            .await?;

        let version = helpers.do_vread("Patient", "p1", 1).await?;
        assert_eq!(version.resource["offloaded"], true);

        let err = helpers.do_vread("Patient", "p1", 7).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
        Ok(())
    }

    #[tokio::test]
    async fn test_rollback_discards_transaction_writes() -> anyhow::Result<()> {
        let helpers = helpers();
        helpers.begin_transaction().await?;
        helpers
            .do_create_persist("Patient", "p1", &json!({"resourceType": "Patient"}))
            .await?;
        helpers.rollback_transaction().await?;
        assert!(helpers.read_latest("Patient", "p1").await?.is_none());
        assert!(helpers.commit_transaction().await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_unchanged_update_over_tombstone_resurrects() -> anyhow::Result<()> {
        let helpers = helpers();
        let body = json!({"resourceType": "Patient", "id": "p1", "active": true});
        helpers.do_create_persist("Patient", "p1", &body).await?;
        let live = helpers.read_latest("Patient", "p1").await?.unwrap();
        helpers.do_delete("Patient", Some("p1"), None).await?;

        // Prepared before the delete ran.
        let response = helpers
            .do_patch_or_update_persist("Patient", "p1", false, &body, Some(&live.resource), &[], false)
            .await?;
        assert_eq!(response.status, StatusCode::CREATED);
        assert_eq!(response.version_id, Some(3));

        let read = helpers.do_read("Patient", "p1").await?;
        assert_eq!(read.resource["active"], true);
        Ok(())
    }

    #[tokio::test]
    async fn test_patch_computed_on_stale_version_conflicts() -> anyhow::Result<()> {
        let helpers = helpers();
        helpers
            .do_create_persist("Patient", "p1", &json!({"resourceType": "Patient", "id": "p1"}))
            .await?;
        let v1 = helpers.read_latest("Patient", "p1").await?.unwrap();
        helpers
            .do_patch_or_update_persist(
                "Patient",
                "p1",
                false,
                &json!({"resourceType": "Patient", "id": "p1", "gender": "male"}),
                Some(&v1.resource),
                &[],
                false,
            )
            .await?;

        let err = helpers
            .do_patch_or_update_persist(
                "Patient",
                "p1",
                true,
                &json!({"resourceType": "Patient", "id": "p1", "active": false}),
                Some(&v1.resource),
                &[],
                false,
            )
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::CONFLICT);
        assert_eq!(helpers.do_read("Patient", "p1").await?.version_id, 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_open_transaction_is_invisible_to_other_readers() -> anyhow::Result<()> {
        let store = InMemoryResourceStore::new();
        let writer = helpers_on(store.clone());
        let reader = helpers_on(store);

        writer.begin_transaction().await?;
        writer
            .do_create_persist("Patient", "dirty", &json!({"resourceType": "Patient"}))
            .await?;
        assert!(writer.read_latest("Patient", "dirty").await?.is_some());

        let err = reader.do_read("Patient", "dirty").await.unwrap_err();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
        let search = reader.do_search(Some("Patient"), None, &[]).await?;
        assert_eq!(search.total, 0);

        writer.commit_transaction().await?;
        assert_eq!(reader.do_read("Patient", "dirty").await?.version_id, 1);
        Ok(())
    }
}
