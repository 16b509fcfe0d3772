//! Second stage: execute each interaction and write its response entry

use async_trait::async_trait;
use axum::http::StatusCode;
use serde_json::Value as JsonValue;
use tessera_models::{
    Bundle, BundleEntry, BundleEntryRequest, BundleEntryResponse, BundleEntrySearch,
    BundleEntrySearchMode, BundleType, OperationOutcome, OperationOutcomeIssue,
};

use super::entries::{status_line, ResponseEntries};
use super::failure::handle_entry_failure;
use super::prepare::{apply_patch, check_if_match};
use super::interaction::{
    CreateRequest, DeleteRequest, EntryContext, HistoryRequest, InvokeRequest, IssueRequest,
    PatchRequest, ReadRequest, SearchRequest, UpdateRequest, VReadRequest,
    ValidationResponseRequest,
};
use super::response::OperationResponse;
use super::visitor::InteractionVisitor;
use super::PreferReturn;
use crate::models::{
    OperationContext, OperationRequest, OperationResult, Parameters, Resource, ResourceOperation,
};
use crate::payload::PayloadKey;
use crate::services::ResourceHelpers;
use crate::Result;

pub struct PersistStage<'a> {
    helpers: &'a dyn ResourceHelpers,
    entries: &'a mut ResponseEntries,
    /// Payloads written for this bundle, for compensation if it is abandoned
    payload_ledger: &'a mut Vec<PayloadKey>,
    transaction: bool,
    prefer: PreferReturn,
    base_url: Option<&'a str>,
}

impl<'a> PersistStage<'a> {
    pub fn new(
        helpers: &'a dyn ResourceHelpers,
        entries: &'a mut ResponseEntries,
        payload_ledger: &'a mut Vec<PayloadKey>,
        transaction: bool,
        prefer: PreferReturn,
        base_url: Option<&'a str>,
    ) -> Self {
        Self {
            helpers,
            entries,
            payload_ledger,
            transaction,
            prefer,
            base_url,
        }
    }

    /// Write the entry produced by `result`, or settle its failure.
    fn settle(
        &mut self,
        ctx: &EntryContext,
        result: Result<BundleEntry>,
    ) -> Result<Option<OperationResponse>> {
        match result {
            Ok(entry) => {
                self.entries.complete(ctx, entry)?;
                Ok(None)
            }
            Err(err) => handle_entry_failure(err, self.transaction, ctx, self.entries),
        }
    }

    fn full_url(&self, ctx: &EntryContext, response: &OperationResponse) -> Option<String> {
        if let Some(full_url) = ctx.full_url() {
            return Some(full_url.to_string());
        }
        match (self.base_url, &response.resource_type, &response.id) {
            (Some(base), Some(rt), Some(id)) => {
                Some(format!("{}/{}/{}", base.trim_end_matches('/'), rt, id))
            }
            _ => None,
        }
    }

    /// Response entry for a write, shaped by the `Prefer` return preference.
    fn build_response_entry(&self, ctx: &EntryContext, response: OperationResponse) -> BundleEntry {
        let mut outcome = response.outcome.clone();
        if self.prefer == PreferReturn::OperationOutcome && outcome.is_none() {
            outcome = Some(OperationOutcome::new(vec![OperationOutcomeIssue::information(
                match response.operation {
                    Some(ResourceOperation::Created) => "Resource created",
                    Some(ResourceOperation::NoOp) => "Resource unchanged",
                    Some(ResourceOperation::Deleted) => "Resource deleted",
                    _ => "Resource updated",
                },
            )]));
        }

        let deleted = response.operation == Some(ResourceOperation::Deleted);
        BundleEntry {
            full_url: self.full_url(ctx, &response),
            response: Some(BundleEntryResponse {
                status: status_line(response.status),
                location: if deleted { None } else { response.location() },
                etag: response.etag(),
                last_modified: response.last_modified(),
                outcome: outcome.and_then(|o| o.to_value().ok()),
                ..Default::default()
            }),
            resource: match self.prefer {
                PreferReturn::Representation => response.resource,
                _ => None,
            },
            ..Default::default()
        }
    }

    /// Response entry for a read-style interaction. The body is always returned, except for HEAD.
    fn read_entry(&self, ctx: &EntryContext, stored: Resource, head: bool) -> BundleEntry {
        BundleEntry {
            full_url: ctx.full_url().map(str::to_string),
            response: Some(BundleEntryResponse {
                status: status_line(StatusCode::OK),
                location: Some(stored.versioned_location()),
                etag: Some(stored.etag()),
                last_modified: Some(stored.last_modified()),
                ..Default::default()
            }),
            resource: (!head).then_some(stored.resource),
            ..Default::default()
        }
    }

    fn ok_entry(&self, ctx: &EntryContext, resource: Option<JsonValue>) -> BundleEntry {
        BundleEntry {
            full_url: ctx.full_url().map(str::to_string),
            response: Some(BundleEntryResponse {
                status: status_line(StatusCode::OK),
                ..Default::default()
            }),
            resource,
            ..Default::default()
        }
    }

    fn resource_url(&self, resource: &Resource) -> String {
        match self.base_url {
            Some(base) => format!("{}/{}", base.trim_end_matches('/'), resource.identity()),
            None => resource.identity(),
        }
    }

    fn searchset(&self, resources: Vec<Resource>, total: usize) -> Result<JsonValue> {
        let mut bundle = Bundle::new(BundleType::Searchset);
        bundle.total = Some(total as u32);
        bundle.entry = Some(Vec::new());
        for resource in resources {
            bundle.add_entry(BundleEntry {
                full_url: Some(self.resource_url(&resource)),
                resource: Some(resource.resource),
                search: Some(BundleEntrySearch {
                    search_mode: Some(BundleEntrySearchMode::Match),
                    score: None,
                }),
                ..Default::default()
            });
        }
        Ok(bundle.to_value()?)
    }

    fn history_bundle(&self, versions: Vec<Resource>) -> Result<JsonValue> {
        let mut bundle = Bundle::new(BundleType::History);
        bundle.total = Some(versions.len() as u32);
        bundle.entry = Some(Vec::new());
        for version in versions {
            let (method, url, status) = if version.deleted {
                ("DELETE", version.identity(), StatusCode::OK)
            } else if version.version_id == 1 {
                ("POST", version.resource_type.clone(), StatusCode::CREATED)
            } else {
                ("PUT", version.identity(), StatusCode::OK)
            };
            bundle.add_entry(BundleEntry {
                full_url: Some(self.resource_url(&version)),
                request: Some(BundleEntryRequest {
                    method: method.to_string(),
                    url,
                    ..Default::default()
                }),
                response: Some(BundleEntryResponse {
                    status: status_line(status),
                    etag: Some(version.etag()),
                    last_modified: Some(version.last_modified()),
                    ..Default::default()
                }),
                resource: (!version.deleted).then_some(version.resource),
                ..Default::default()
            });
        }
        Ok(bundle.to_value()?)
    }

    async fn persist_create(&mut self, request: &mut CreateRequest) -> Result<OperationResponse> {
        let response = self
            .helpers
            .do_create_persist(&request.resource_type, &request.id, &request.resource)
            .await?;

        if let Some(handle) = request.pending_payload.take() {
            let receipt = handle.resolve().await?;
            tracing::debug!(payload = %receipt.key, size_bytes = receipt.size_bytes, "Payload stored");
            self.payload_ledger.push(receipt.key);
        }

        Ok(response.with_issues(request.warnings.iter().cloned()))
    }

    /// Update against the version current now, which an earlier entry may have changed.
    async fn persist_update(&self, request: &mut UpdateRequest) -> Result<OperationResponse> {
        let current = self
            .helpers
            .read_latest(&request.resource_type, &request.id)
            .await?;
        if let Some(expected) = request.if_match {
            check_if_match(&request.resource_type, &request.id, current.as_ref(), expected)?;
        }
        request.is_deleted = current.as_ref().map(|c| c.deleted).unwrap_or(false);
        request.prev_resource = current.map(|c| c.resource);

        self.helpers
            .do_patch_or_update_persist(
                &request.resource_type,
                &request.id,
                false,
                &request.resource,
                request.prev_resource.as_ref(),
                &request.warnings,
                request.is_deleted,
            )
            .await
    }

    /// Re-apply the patch when its target moved on since preparation.
    async fn persist_patch(&self, request: &mut PatchRequest) -> Result<OperationResponse> {
        let current = self
            .helpers
            .do_read(&request.resource_type, &request.id)
            .await?;
        if let Some(expected) = request.if_match {
            check_if_match(&request.resource_type, &request.id, Some(&current), expected)?;
        }
        if current.resource != request.prev_resource {
            tracing::debug!(
                resource = %current.identity(),
                version = current.version_id,
                "Re-applying patch to newer version"
            );
            request.resource = apply_patch(
                &request.resource_type,
                &request.id,
                &current.resource,
                &request.patch,
            )?;
            request.prev_resource = current.resource;
        }

        self.helpers
            .do_patch_or_update_persist(
                &request.resource_type,
                &request.id,
                true,
                &request.resource,
                Some(&request.prev_resource),
                &request.warnings,
                false,
            )
            .await
    }

    async fn invoke(&self, request: &InvokeRequest) -> Result<JsonValue> {
        let mut parameters = Parameters::from_query(&request.query);
        if let Some(body) = &request.resource {
            parameters.merge(Parameters::from_body(body));
        }
        let result = self
            .helpers
            .do_invoke(OperationRequest {
                operation_name: request.name.clone(),
                context: request.context.clone(),
                version_id: request.version_id,
                parameters,
            })
            .await?;

        Ok(match result {
            OperationResult::Resource(resource) => resource,
            OperationResult::Parameters(parameters) => serde_json::to_value(parameters)
                .map_err(|e| crate::Error::Internal(format!("Parameters serialization: {}", e)))?,
            OperationResult::NoContent => JsonValue::Null,
        })
    }
}

#[async_trait]
impl InteractionVisitor for PersistStage<'_> {
    async fn do_search(
        &mut self,
        ctx: &EntryContext,
        request: &SearchRequest,
    ) -> Result<Option<OperationResponse>> {
        if self.entries.is_complete(ctx.index()) {
            return Ok(None);
        }
        let compartment = request
            .compartment
            .as_ref()
            .map(|(rt, id)| (rt.as_str(), id.as_str()));
        let result = match self
            .helpers
            .do_search(request.resource_type.as_deref(), compartment, &request.query)
            .await
        {
            Ok(found) => self
                .searchset(found.resources, found.total)
                .map(|bundle| self.ok_entry(ctx, Some(bundle))),
            Err(err) => Err(err),
        };
        self.settle(ctx, result)
    }

    async fn do_vread(
        &mut self,
        ctx: &EntryContext,
        request: &VReadRequest,
    ) -> Result<Option<OperationResponse>> {
        if self.entries.is_complete(ctx.index()) {
            return Ok(None);
        }
        let result = self
            .helpers
            .do_vread(&request.resource_type, &request.id, request.version_id)
            .await
            .map(|stored| self.read_entry(ctx, stored, request.head));
        self.settle(ctx, result)
    }

    async fn do_read(
        &mut self,
        ctx: &EntryContext,
        request: &ReadRequest,
    ) -> Result<Option<OperationResponse>> {
        if self.entries.is_complete(ctx.index()) {
            return Ok(None);
        }
        let result = self
            .helpers
            .do_read(&request.resource_type, &request.id)
            .await
            .map(|stored| self.read_entry(ctx, stored, request.head));
        self.settle(ctx, result)
    }

    async fn do_history(
        &mut self,
        ctx: &EntryContext,
        request: &HistoryRequest,
    ) -> Result<Option<OperationResponse>> {
        if self.entries.is_complete(ctx.index()) {
            return Ok(None);
        }
        let result = match self
            .helpers
            .do_history(
                request.resource_type.as_deref(),
                request.id.as_deref(),
                &request.query,
            )
            .await
        {
            Ok(versions) => self
                .history_bundle(versions)
                .map(|bundle| self.ok_entry(ctx, Some(bundle))),
            Err(err) => Err(err),
        };
        self.settle(ctx, result)
    }

    async fn do_create(
        &mut self,
        ctx: &EntryContext,
        request: &mut CreateRequest,
    ) -> Result<Option<OperationResponse>> {
        if self.entries.is_complete(ctx.index()) {
            return Ok(None);
        }
        let result = self
            .persist_create(request)
            .await
            .map(|response| self.build_response_entry(ctx, response));
        self.settle(ctx, result)
    }

    async fn do_update(
        &mut self,
        ctx: &EntryContext,
        request: &mut UpdateRequest,
    ) -> Result<Option<OperationResponse>> {
        if self.entries.is_complete(ctx.index()) {
            return Ok(None);
        }
        let result = self
            .persist_update(request)
            .await
            .map(|response| self.build_response_entry(ctx, response));
        self.settle(ctx, result)
    }

    async fn do_patch(
        &mut self,
        ctx: &EntryContext,
        request: &mut PatchRequest,
    ) -> Result<Option<OperationResponse>> {
        if self.entries.is_complete(ctx.index()) {
            return Ok(None);
        }
        let result = self
            .persist_patch(request)
            .await
            .map(|response| self.build_response_entry(ctx, response));
        self.settle(ctx, result)
    }

    async fn do_delete(
        &mut self,
        ctx: &EntryContext,
        request: &DeleteRequest,
    ) -> Result<Option<OperationResponse>> {
        if self.entries.is_complete(ctx.index()) {
            return Ok(None);
        }
        let result = self
            .helpers
            .do_delete(
                &request.resource_type,
                request.id.as_deref(),
                request.search_query.as_deref(),
            )
            .await
            .map(|response| self.build_response_entry(ctx, response));
        self.settle(ctx, result)
    }

    async fn do_invoke(
        &mut self,
        ctx: &EntryContext,
        request: &InvokeRequest,
    ) -> Result<Option<OperationResponse>> {
        if self.entries.is_complete(ctx.index()) {
            return Ok(None);
        }
        let result = self.invoke(request).await.map(|body| {
            let resource = (!body.is_null()).then_some(body);
            self.ok_entry(ctx, resource)
        });
        if let OperationContext::Instance(rt, id) = &request.context {
            tracing::debug!(resource_type = %rt, id = %id, operation = %request.name, "Operation invoked");
        }
        self.settle(ctx, result)
    }

    async fn validation_response(
        &mut self,
        ctx: &EntryContext,
        request: &mut ValidationResponseRequest,
    ) -> Result<Option<OperationResponse>> {
        if self.entries.is_complete(ctx.index()) {
            return Ok(None);
        }
        let entry = std::mem::take(&mut request.entry);
        self.entries.complete(ctx, entry)?;
        Ok(None)
    }

    async fn issue(
        &mut self,
        ctx: &EntryContext,
        request: &mut IssueRequest,
    ) -> Result<Option<OperationResponse>> {
        if self.entries.is_complete(ctx.index()) {
            return Ok(None);
        }
        let entry = std::mem::take(&mut request.entry);
        self.entries.complete(ctx, entry)?;
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::InMemoryResourceStore;
    use crate::services::bundle::interaction::{BundleInteraction, Interaction};
    use crate::services::{OperationExecutor, StoreResourceHelpers};
    use serde_json::json;
    use std::sync::Arc;

    fn helpers() -> StoreResourceHelpers {
        let store = InMemoryResourceStore::new();
        let operations = Arc::new(OperationExecutor::new(store.clone()));
        StoreResourceHelpers::new(store, operations)
    }

    fn ctx(index: usize, method: &str, url: &str) -> EntryContext {
        let request = BundleEntryRequest {
            method: method.into(),
            url: url.into(),
            ..Default::default()
        };
        EntryContext::new(index, Some(&request), None)
    }

    fn create(index: usize) -> BundleInteraction {
        BundleInteraction::new(
            ctx(index, "POST", "Patient"),
            Interaction::Create(CreateRequest {
                resource_type: "Patient".into(),
                id: "p1".into(),
                resource: json!({"resourceType": "Patient", "id": "p1"}),
                local_id: None,
                warnings: vec![OperationOutcomeIssue::warning(
                    tessera_models::IssueType::Processing,
                    "id ignored",
                )],
                pending_payload: None,
            }),
        )
    }

    #[tokio::test]
    async fn test_create_entry_shape() -> anyhow::Result<()> {
        let helpers = helpers();
        let mut entries = ResponseEntries::new(1);
        let mut ledger = Vec::new();

        let mut stage = PersistStage::new(
            &helpers,
            &mut entries,
            &mut ledger,
            true,
            PreferReturn::Representation,
            Some("http://example.org/fhir"),
        );
        create(0).accept(&mut stage).await?;

        let entry = entries.into_entries()?.remove(0);
        assert_eq!(entry.full_url.as_deref(), Some("http://example.org/fhir/Patient/p1"));
        let response = entry.response.unwrap();
        assert_eq!(response.status, "201 Created");
        assert_eq!(response.location.as_deref(), Some("Patient/p1/_history/1"));
        assert_eq!(response.etag.as_deref(), Some("W/\"1\""));
        assert_eq!(response.outcome.unwrap()["issue"][0]["severity"], "warning");
        assert_eq!(entry.resource.unwrap()["meta"]["versionId"], "1");
        Ok(())
    }

    #[tokio::test]
    async fn test_completed_slot_is_not_executed_again() -> anyhow::Result<()> {
        let helpers = helpers();
        let mut entries = ResponseEntries::new(1);
        let mut ledger = Vec::new();

        let mut first = create(0);
        let mut stage = PersistStage::new(
            &helpers,
            &mut entries,
            &mut ledger,
            true,
            PreferReturn::Minimal,
            None,
        );
        first.accept(&mut stage).await?;
        // A second visit of the same entry is a no-op rather than a duplicate write.
        first.accept(&mut stage).await?;

        assert_eq!(helpers.read_latest("Patient", "p1").await?.unwrap().version_id, 1);
        let entry = entries.into_entries()?.remove(0);
        assert!(entry.resource.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_batch_read_missing_is_404_entry() -> anyhow::Result<()> {
        let helpers = helpers();
        let mut entries = ResponseEntries::new(1);
        let mut ledger = Vec::new();

        let mut read = BundleInteraction::new(
            ctx(0, "GET", "Patient/nope"),
            Interaction::Read(ReadRequest {
                resource_type: "Patient".into(),
                id: "nope".into(),
                head: false,
            }),
        );
        let mut stage = PersistStage::new(
            &helpers,
            &mut entries,
            &mut ledger,
            false,
            PreferReturn::Representation,
            None,
        );
        read.accept(&mut stage).await?;

        let entry = entries.into_entries()?.remove(0);
        assert_eq!(entry.response.unwrap().status, "404 Not Found");
        Ok(())
    }
}
