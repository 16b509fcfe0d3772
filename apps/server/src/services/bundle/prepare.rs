//! Turning inbound bundle entries into typed interactions
//!
//! Preparation does everything that must be known before any stage runs:
//! server-assigned ids for creates, seeding of the local reference map,
//! conditional-create matching, `If-Match` checks and patch application.

use axum::http::StatusCode;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use json_patch::PatchErrorKind;
use serde_json::{json, Value as JsonValue};
use std::collections::HashSet;
use tessera_models::{
    BundleEntry, BundleEntryResponse, HttpVerb, IssueType, OperationOutcome,
    OperationOutcomeIssue,
};
use uuid::Uuid;

use super::entries::status_line;
use super::failure::{abort, error_entry};
use super::interaction::{
    BundleInteraction, CreateRequest, DeleteRequest, EntryContext, HistoryRequest, Interaction,
    InvokeRequest, IssueRequest, PatchRequest, ReadRequest, SearchRequest, UpdateRequest,
    VReadRequest, ValidationResponseRequest,
};
use super::local_refs::LocalReferenceMap;
use super::url::{parse_query, ParsedUrl};
use super::PreferReturn;
use crate::db::populate_meta;
use crate::models::{OperationContext, Resource};
use crate::services::ResourceHelpers;
use crate::{Error, Result};

pub(crate) struct Preparer<'a> {
    helpers: &'a dyn ResourceHelpers,
    local_refs: &'a mut LocalReferenceMap,
    transaction: bool,
    prefer: PreferReturn,
    seen_full_urls: HashSet<String>,
}

impl<'a> Preparer<'a> {
    pub(crate) fn new(
        helpers: &'a dyn ResourceHelpers,
        local_refs: &'a mut LocalReferenceMap,
        transaction: bool,
        prefer: PreferReturn,
    ) -> Self {
        Self {
            helpers,
            local_refs,
            transaction,
            prefer,
            seen_full_urls: HashSet::new(),
        }
    }

    /// Prepare every entry. Batch failures become `Issue` interactions; a
    /// transaction failure abandons the bundle.
    pub(crate) async fn prepare(
        &mut self,
        entries: Vec<BundleEntry>,
    ) -> Result<Vec<BundleInteraction>> {
        for full_url in entries.iter().filter_map(|e| e.full_url.as_deref()) {
            self.local_refs.declare(full_url);
        }

        let mut interactions = Vec::with_capacity(entries.len());
        for (index, entry) in entries.into_iter().enumerate() {
            let mut ctx = EntryContext::new(index, entry.request.as_ref(), entry.full_url.clone());
            let interaction = match self.prepare_entry(&mut ctx, entry).await {
                Ok(interaction) => interaction,
                Err(err) => self.failure_interaction(err, &ctx)?,
            };
            interactions.push(BundleInteraction::new(ctx, interaction));
        }

        if self.transaction {
            check_identity_overlaps(&interactions)?;
        }

        Ok(interactions)
    }

    fn failure_interaction(&self, err: Error, ctx: &EntryContext) -> Result<Interaction> {
        if err.failure_kind().is_none() {
            return Err(err);
        }
        let err = with_entry_context(err, ctx.index());
        if self.transaction {
            return Err(abort(err, ctx));
        }
        let status = err.status();
        Ok(Interaction::Issue(IssueRequest {
            status,
            entry: error_entry(ctx, status, err.issues()),
        }))
    }

    async fn prepare_entry(
        &mut self,
        ctx: &mut EntryContext,
        entry: BundleEntry,
    ) -> Result<Interaction> {
        let request = entry.request.as_ref().ok_or_else(|| {
            Error::InvalidResource(format!("Bundle entry {} missing request", ctx.index()))
        })?;
        let verb = request.verb()?;
        let url = ParsedUrl::parse(&request.url)?;
        ctx.set_url(url.clone());

        if let Some(full_url) = entry.full_url.as_deref() {
            if !self.seen_full_urls.insert(full_url.to_string()) {
                return Err(Error::Duplicate(format!(
                    "fullUrl '{}' appears more than once in the bundle",
                    full_url
                )));
            }
        }

        if let Some(name) = url.operation.clone() {
            return match verb {
                HttpVerb::Get | HttpVerb::Post => Ok(Interaction::Invoke(InvokeRequest {
                    context: operation_context(&url),
                    version_id: url.version_id,
                    name,
                    resource: entry.resource.clone(),
                    query: url.query_params()?,
                })),
                other => Err(Error::MethodNotAllowed(format!(
                    "{} is not allowed on operation ${}",
                    other, name
                ))),
            };
        }

        match verb {
            HttpVerb::Get | HttpVerb::Head => prepare_read(&url, verb == HttpVerb::Head),
            HttpVerb::Post if url.search_endpoint => Ok(Interaction::Search(SearchRequest {
                resource_type: url.resource_type.clone(),
                compartment: None,
                query: url.query_params()?,
            })),
            HttpVerb::Post => self.prepare_create(&url, entry).await,
            HttpVerb::Put => self.prepare_update(&url, entry).await,
            HttpVerb::Patch => self.prepare_patch(&url, entry).await,
            HttpVerb::Delete => prepare_delete(&url),
        }
    }

    async fn prepare_create(&mut self, url: &ParsedUrl, entry: BundleEntry) -> Result<Interaction> {
        let resource_type = match (&url.resource_type, &url.resource_id) {
            (Some(rt), None) => rt.clone(),
            _ => {
                return Err(Error::InvalidResource(
                    "POST must target a resource type, e.g. 'Patient'".to_string(),
                ))
            }
        };
        let mut resource = body_of(&entry, &resource_type)?;
        let request = entry.request.unwrap_or_default();

        if let Some(criteria) = request.if_none_exist.as_deref() {
            let query = criteria.split_once('?').map(|(_, q)| q).unwrap_or(criteria);
            let matches = self
                .helpers
                .do_search(Some(&resource_type), None, &parse_query(query)?)
                .await?;
            match matches.resources.as_slice() {
                [] => {}
                [existing] => {
                    if let Some(full_url) = entry.full_url.as_deref() {
                        self.local_refs.register(full_url, existing.identity());
                    }
                    tracing::debug!(
                        resource = %existing.identity(),
                        criteria,
                        "Conditional create matched existing resource"
                    );
                    return Ok(Interaction::ValidationResponse(ValidationResponseRequest {
                        entry: self.matched_entry(entry.full_url, existing),
                    }));
                }
                _ => {
                    return Err(Error::MultipleMatches(format!(
                        "Conditional create {}?{} matched {} resources",
                        resource_type, query, matches.total
                    )))
                }
            }
        }

        let mut warnings = Vec::new();
        if let Some(client_id) = resource.get("id").and_then(|v| v.as_str()) {
            warnings.push(
                OperationOutcomeIssue::warning(
                    IssueType::Processing,
                    format!("Ignoring client-supplied id '{}' on create", client_id),
                )
                .with_expression(format!("{}.id", resource_type)),
            );
        }

        let id = Uuid::new_v4().to_string();
        populate_meta(&mut resource, &id, 1, Utc::now());

        if let Some(full_url) = entry.full_url.as_deref() {
            if !self
                .local_refs
                .register(full_url, format!("{}/{}", resource_type, id))
            {
                return Err(Error::Duplicate(format!(
                    "Local identifier '{}' is already mapped",
                    full_url
                )));
            }
        }

        Ok(Interaction::Create(CreateRequest {
            resource_type,
            id,
            resource,
            local_id: entry.full_url,
            warnings,
            pending_payload: None,
        }))
    }

    async fn prepare_update(&mut self, url: &ParsedUrl, entry: BundleEntry) -> Result<Interaction> {
        let (resource_type, id) = instance_target(url, "PUT")?;
        let mut resource = body_of(&entry, &resource_type)?;

        match resource.get("id") {
            Some(JsonValue::String(body_id)) if body_id != &id => {
                return Err(Error::InvalidResource(format!(
                    "Resource id '{}' does not match URL id '{}'",
                    body_id, id
                )))
            }
            Some(JsonValue::String(_)) => {}
            Some(_) => {
                return Err(Error::InvalidResource(
                    "Resource id must be a string".to_string(),
                ))
            }
            None => {
                if let Some(obj) = resource.as_object_mut() {
                    obj.insert("id".to_string(), json!(id));
                }
            }
        }

        let prev = self.helpers.read_latest(&resource_type, &id).await?;
        let request = entry.request.unwrap_or_default();
        let if_match = request.if_match.as_deref().map(expected_version).transpose()?;
        if let Some(expected) = if_match {
            check_if_match(&resource_type, &id, prev.as_ref(), expected)?;
        }

        if let Some(full_url) = entry.full_url.as_deref() {
            self.seed_local_id(full_url, &resource_type, &id)?;
        }

        let is_deleted = prev.as_ref().map(|p| p.deleted).unwrap_or(false);
        Ok(Interaction::Update(UpdateRequest {
            resource_type,
            id,
            resource,
            prev_resource: prev.map(|p| p.resource),
            is_deleted,
            if_match,
            local_id: entry.full_url,
            warnings: Vec::new(),
        }))
    }

    async fn prepare_patch(&mut self, url: &ParsedUrl, entry: BundleEntry) -> Result<Interaction> {
        let (resource_type, id) = instance_target(url, "PATCH")?;
        let binary = entry.resource.as_ref().ok_or_else(|| {
            Error::InvalidResource("PATCH entry requires a Binary resource".to_string())
        })?;
        let patch = parse_json_patch_from_binary(binary)?;

        let current = self.helpers.do_read(&resource_type, &id).await?;
        let request = entry.request.unwrap_or_default();
        let if_match = request.if_match.as_deref().map(expected_version).transpose()?;
        if let Some(expected) = if_match {
            check_if_match(&resource_type, &id, Some(&current), expected)?;
        }

        let patched = apply_patch(&resource_type, &id, &current.resource, &patch)?;

        if let Some(full_url) = entry.full_url.as_deref() {
            self.seed_local_id(full_url, &resource_type, &id)?;
        }

        Ok(Interaction::Patch(PatchRequest {
            resource_type,
            id,
            patch,
            resource: patched,
            prev_resource: current.resource,
            if_match,
            local_id: entry.full_url,
            warnings: Vec::new(),
        }))
    }

    /// Map `full_url` to `Type/id` unless it already maps there.
    fn seed_local_id(&mut self, full_url: &str, resource_type: &str, id: &str) -> Result<()> {
        let target = format!("{}/{}", resource_type, id);
        if self.local_refs.register(full_url, target.clone())
            || self.local_refs.resolve(full_url) == Some(target.as_str())
        {
            return Ok(());
        }
        Err(Error::Duplicate(format!(
            "Local identifier '{}' is already mapped",
            full_url
        )))
    }

    /// `200 OK` entry for a conditional create that matched `existing`.
    fn matched_entry(&self, full_url: Option<String>, existing: &Resource) -> BundleEntry {
        let outcome = OperationOutcomeIssue::information(format!(
            "Conditional create matched existing resource {}",
            existing.identity()
        ));
        BundleEntry {
            full_url,
            response: Some(BundleEntryResponse {
                status: status_line(StatusCode::OK),
                location: Some(existing.versioned_location()),
                etag: Some(existing.etag()),
                last_modified: Some(existing.last_modified()),
                outcome: OperationOutcome::new(vec![outcome]).to_value().ok(),
                ..Default::default()
            }),
            resource: match self.prefer {
                PreferReturn::Representation => Some(existing.resource.clone()),
                _ => None,
            },
            ..Default::default()
        }
    }
}

fn prepare_read(url: &ParsedUrl, head: bool) -> Result<Interaction> {
    let query = url.query_params()?;
    match (&url.resource_type, &url.resource_id) {
        (Some(rt), Some(id)) if url.history => match url.version_id {
            Some(version_id) => Ok(Interaction::VRead(VReadRequest {
                resource_type: rt.clone(),
                id: id.clone(),
                version_id,
                head,
            })),
            None => Ok(Interaction::History(HistoryRequest {
                resource_type: Some(rt.clone()),
                id: Some(id.clone()),
                query,
            })),
        },
        (rt, None) if url.history => Ok(Interaction::History(HistoryRequest {
            resource_type: rt.clone(),
            id: None,
            query,
        })),
        (Some(rt), Some(id)) => match &url.compartment_type {
            Some(target) => Ok(Interaction::Search(SearchRequest {
                resource_type: Some(target.clone()),
                compartment: Some((rt.clone(), id.clone())),
                query,
            })),
            None => Ok(Interaction::Read(ReadRequest {
                resource_type: rt.clone(),
                id: id.clone(),
                head,
            })),
        },
        (rt, None) => Ok(Interaction::Search(SearchRequest {
            resource_type: rt.clone(),
            compartment: None,
            query,
        })),
        (None, Some(_)) => Err(Error::InvalidResource(
            "Request URL has an id without a resource type".to_string(),
        )),
    }
}

fn prepare_delete(url: &ParsedUrl) -> Result<Interaction> {
    match (&url.resource_type, &url.resource_id, &url.query) {
        (Some(rt), Some(id), _) => Ok(Interaction::Delete(DeleteRequest {
            resource_type: rt.clone(),
            id: Some(id.clone()),
            search_query: None,
        })),
        (Some(rt), None, Some(query)) => Ok(Interaction::Delete(DeleteRequest {
            resource_type: rt.clone(),
            id: None,
            search_query: Some(query.clone()),
        })),
        _ => Err(Error::InvalidResource(
            "DELETE requires 'Type/id' or 'Type?criteria'".to_string(),
        )),
    }
}

fn operation_context(url: &ParsedUrl) -> OperationContext {
    match (&url.resource_type, &url.resource_id) {
        (Some(rt), Some(id)) => OperationContext::Instance(rt.clone(), id.clone()),
        (Some(rt), None) => OperationContext::Type(rt.clone()),
        _ => OperationContext::System,
    }
}

fn instance_target(url: &ParsedUrl, method: &str) -> Result<(String, String)> {
    match (&url.resource_type, &url.resource_id) {
        (Some(rt), Some(id)) if !url.history && url.compartment_type.is_none() => {
            Ok((rt.clone(), id.clone()))
        }
        _ => Err(Error::InvalidResource(format!(
            "{} must target a resource instance, e.g. 'Patient/123'",
            method
        ))),
    }
}

/// The entry body, checked against the resource type in the URL.
fn body_of(entry: &BundleEntry, resource_type: &str) -> Result<JsonValue> {
    let resource = entry.resource.clone().ok_or_else(|| {
        Error::InvalidResource(format!("Entry for {} has no resource", resource_type))
    })?;
    match resource.get("resourceType").and_then(|v| v.as_str()) {
        Some(rt) if rt == resource_type => Ok(resource),
        Some(rt) => Err(Error::InvalidResource(format!(
            "Resource type '{}' does not match request URL type '{}'",
            rt, resource_type
        ))),
        None => Err(Error::InvalidResource(
            "Resource is missing resourceType".to_string(),
        )),
    }
}

/// Weak or strong ETag to version id: `W/"3"`, `"3"` or `3`.
pub fn parse_etag(etag: &str) -> Option<i32> {
    etag.trim()
        .trim_start_matches("W/")
        .trim_matches('"')
        .parse()
        .ok()
}

fn expected_version(if_match: &str) -> Result<i32> {
    parse_etag(if_match)
        .ok_or_else(|| Error::InvalidResource(format!("Invalid If-Match value '{}'", if_match)))
}

/// `If-Match` against the version a write will be based on.
pub(crate) fn check_if_match(
    resource_type: &str,
    id: &str,
    current: Option<&Resource>,
    expected_version: i32,
) -> Result<()> {
    let current = current.ok_or_else(|| Error::ResourceNotFound {
        resource_type: resource_type.to_string(),
        id: id.to_string(),
    })?;
    if current.version_id != expected_version {
        return Err(Error::VersionConflict {
            expected: expected_version,
            actual: current.version_id,
        });
    }
    Ok(())
}

/// Apply `patch` to `current`, keeping its `resourceType` and `id`.
pub(crate) fn apply_patch(
    resource_type: &str,
    id: &str,
    current: &JsonValue,
    patch: &json_patch::Patch,
) -> Result<JsonValue> {
    let mut patched = current.clone();
    json_patch::patch(&mut patched, &patch.0).map_err(|e| match e.kind {
        PatchErrorKind::TestFailed => Error::BusinessRule(e.to_string()),
        _ => Error::InvalidResource(e.to_string()),
    })?;

    let obj = patched.as_object_mut().ok_or_else(|| {
        Error::InvalidResource("Patched resource must be a JSON object".to_string())
    })?;
    obj.insert("resourceType".to_string(), json!(resource_type));
    obj.insert("id".to_string(), json!(id));
    Ok(patched)
}

pub fn parse_json_patch_from_binary(binary: &JsonValue) -> Result<json_patch::Patch> {
    let resource_type = binary
        .get("resourceType")
        .and_then(|v| v.as_str())
        .unwrap_or("");

    if resource_type != "Binary" {
        return Err(Error::InvalidResource(
            "PATCH entries require a Binary resource payload".to_string(),
        ));
    }

    let content_type = binary
        .get("contentType")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    if content_type != "application/json-patch+json" {
        return Err(Error::UnsupportedMediaType(format!(
            "Unsupported PATCH Binary.contentType '{}'. Supported: application/json-patch+json",
            content_type
        )));
    }

    let data_b64 = binary
        .get("data")
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::InvalidResource("Binary.data missing".to_string()))?;

    let bytes = STANDARD
        .decode(data_b64)
        .map_err(|e| Error::InvalidResource(format!("Invalid base64 in Binary.data: {}", e)))?;

    serde_json::from_slice::<json_patch::Patch>(&bytes)
        .map_err(|e| Error::InvalidResource(format!("Invalid JSON Patch document: {}", e)))
}

/// Two change interactions on one `Type/id` make a transaction ambiguous.
fn check_identity_overlaps(interactions: &[BundleInteraction]) -> Result<()> {
    let mut identities = HashSet::new();

    for interaction in interactions {
        let identity = match &interaction.interaction {
            Interaction::Update(r) => format!("{}/{}", r.resource_type, r.id),
            Interaction::Patch(r) => format!("{}/{}", r.resource_type, r.id),
            Interaction::Delete(DeleteRequest {
                resource_type,
                id: Some(id),
                ..
            }) => format!("{}/{}", resource_type, id),
            _ => continue,
        };
        if !identities.insert(identity.clone()) {
            return Err(abort(
                Error::Conflict(format!(
                    "Transaction identity overlap detected for {}",
                    identity
                )),
                interaction.context(),
            ));
        }
    }

    Ok(())
}

fn with_entry_context(err: Error, index: usize) -> Error {
    match err {
        Error::InvalidResource(msg) => {
            Error::InvalidResource(format!("Bundle entry {}: {}", index, msg))
        }
        Error::BusinessRule(msg) => Error::BusinessRule(format!("Bundle entry {}: {}", index, msg)),
        Error::PreconditionFailed(msg) => {
            Error::PreconditionFailed(format!("Bundle entry {}: {}", index, msg))
        }
        other => other,
    }
}
