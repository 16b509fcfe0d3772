//! First stage: resolve bundle-local references and start payload writes

use async_trait::async_trait;
use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use super::entries::ResponseEntries;
use super::failure::handle_entry_failure;
use super::interaction::{CreateRequest, EntryContext, PatchRequest, UpdateRequest};
use super::local_refs::LocalReferenceMap;
use super::response::OperationResponse;
use super::visitor::InteractionVisitor;
use crate::payload::PayloadKey;
use crate::services::ResourceHelpers;
use crate::{Error, Result};

pub struct ReferenceMappingStage<'a> {
    helpers: &'a dyn ResourceHelpers,
    local_refs: &'a mut LocalReferenceMap,
    entries: &'a mut ResponseEntries,
    transaction: bool,
}

impl<'a> ReferenceMappingStage<'a> {
    pub fn new(
        helpers: &'a dyn ResourceHelpers,
        local_refs: &'a mut LocalReferenceMap,
        entries: &'a mut ResponseEntries,
        transaction: bool,
    ) -> Self {
        Self {
            helpers,
            local_refs,
            entries,
            transaction,
        }
    }

    fn map_create(&mut self, request: &CreateRequest) -> Result<OperationResponse> {
        let mut resource = request.resource.clone();
        let rewritten = self.local_refs.rewrite_references(&mut resource)?;

        let version_id = resource
            .pointer("/meta/versionId")
            .and_then(|v| v.as_str())
            .and_then(|v| v.parse::<i32>().ok())
            .unwrap_or(1);
        let last_updated = meta_last_updated(&resource);

        let key = PayloadKey::new(&request.resource_type, &request.id, version_id);
        let pending_payload = self.helpers.store_payload(key, resource.clone());

        tracing::debug!(
            resource_type = %request.resource_type,
            id = %request.id,
            rewritten,
            offloaded = pending_payload.is_some(),
            "Create references mapped"
        );

        let mut response = OperationResponse::new(StatusCode::CREATED)
            .with_identity(&request.resource_type, &request.id)
            .with_resource(resource);
        response.version_id = Some(version_id);
        response.last_updated = last_updated;
        response.pending_payload = pending_payload;
        Ok(response)
    }

    fn map_update(
        &mut self,
        resource_type: &str,
        id: &str,
        local_id: Option<&str>,
        resource: &JsonValue,
    ) -> Result<OperationResponse> {
        if let Some(local_id) = local_id {
            if !self.local_refs.is_mapped(local_id) {
                self.local_refs
                    .register(local_id, format!("{}/{}", resource_type, id));
            }
        }

        let mut resource = resource.clone();
        self.local_refs.rewrite_references(&mut resource)?;
        Ok(OperationResponse::new(StatusCode::OK)
            .with_identity(resource_type, id)
            .with_resource(resource))
    }
}

impl ReferenceMappingStage<'_> {
    /// Rewrite local references in the values a patch adds, so it can be re-applied later.
    fn map_patch_document(&self, patch: &mut json_patch::Patch) -> Result<()> {
        let mut document = serde_json::to_value(&*patch)
            .map_err(|e| Error::Internal(format!("Failed to serialize JSON Patch: {}", e)))?;
        let mut rewritten = 0;
        if let Some(ops) = document.as_array_mut() {
            for op in ops.iter_mut() {
                let key = op
                    .get("path")
                    .and_then(|p| p.as_str())
                    .and_then(|p| p.rsplit('/').next())
                    .map(str::to_string);
                if let Some(value) = op.get_mut("value") {
                    rewritten += self.local_refs.rewrite_element(key.as_deref(), value)?;
                }
            }
        }
        if rewritten > 0 {
            *patch = serde_json::from_value(document)
                .map_err(|e| Error::Internal(format!("Failed to rebuild JSON Patch: {}", e)))?;
        }
        Ok(())
    }
}

fn meta_last_updated(resource: &JsonValue) -> Option<DateTime<Utc>> {
    resource
        .pointer("/meta/lastUpdated")
        .and_then(|v| v.as_str())
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
}

#[async_trait]
impl InteractionVisitor for ReferenceMappingStage<'_> {
    async fn do_create(
        &mut self,
        ctx: &EntryContext,
        request: &mut CreateRequest,
    ) -> Result<Option<OperationResponse>> {
        match self.map_create(request) {
            Ok(response) => Ok(Some(response)),
            Err(err) => handle_entry_failure(err, self.transaction, ctx, self.entries),
        }
    }

    async fn do_update(
        &mut self,
        ctx: &EntryContext,
        request: &mut UpdateRequest,
    ) -> Result<Option<OperationResponse>> {
        let mapped = self.map_update(
            &request.resource_type,
            &request.id,
            request.local_id.as_deref(),
            &request.resource,
        );
        match mapped {
            Ok(response) => Ok(Some(response)),
            Err(err) => handle_entry_failure(err, self.transaction, ctx, self.entries),
        }
    }

    async fn do_patch(
        &mut self,
        ctx: &EntryContext,
        request: &mut PatchRequest,
    ) -> Result<Option<OperationResponse>> {
        let mapped = self
            .map_update(
                &request.resource_type,
                &request.id,
                request.local_id.as_deref(),
                &request.resource,
            )
            .and_then(|response| {
                self.map_patch_document(&mut request.patch)?;
                Ok(response)
            });
        match mapped {
            Ok(response) => Ok(Some(response)),
            Err(err) => handle_entry_failure(err, self.transaction, ctx, self.entries),
        }
    }
}
