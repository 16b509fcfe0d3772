//! Typed bundle interactions
//!
//! Every entry of an inbound bundle becomes one `BundleInteraction`: the entry
//! context plus a closed set of interaction kinds. Stages see interactions only
//! through `accept`, which dispatches to the matching visitor method and folds
//! what the visitor returns back into the interaction for the next stage.

use axum::http::StatusCode;
use serde_json::Value as JsonValue;
use std::time::{Duration, Instant};
use tessera_models::{BundleEntry, BundleEntryRequest, OperationOutcomeIssue};

use super::response::OperationResponse;
use super::url::ParsedUrl;
use super::visitor::InteractionVisitor;
use crate::models::OperationContext;
use crate::payload::PayloadHandle;
use crate::Result;

/// Identity of one bundle entry while it is processed.
///
/// Only the processor builds these, and response slots can only be filled
/// through one, so stages cannot write entries they were not handed.
#[derive(Debug, Clone)]
pub struct EntryContext {
    index: usize,
    method: String,
    description: String,
    full_url: Option<String>,
    url: Option<ParsedUrl>,
    started: Instant,
}

impl EntryContext {
    pub(crate) fn new(
        index: usize,
        request: Option<&BundleEntryRequest>,
        full_url: Option<String>,
    ) -> Self {
        let (method, description) = match request {
            Some(request) => {
                let method = request.method.to_ascii_uppercase();
                let description = format!("{} {}", method, request.url);
                (method, description)
            }
            None => ("UNKNOWN".to_string(), format!("entry {} without request", index)),
        };
        Self {
            index,
            method,
            description,
            full_url,
            url: None,
            started: Instant::now(),
        }
    }

    pub(crate) fn set_url(&mut self, url: ParsedUrl) {
        self.url = Some(url);
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// Human-readable request line, e.g. `POST Patient`
    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn full_url(&self) -> Option<&str> {
        self.full_url.as_deref()
    }

    /// Parsed request URL, absent when the URL itself was rejected
    pub fn url(&self) -> Option<&ParsedUrl> {
        self.url.as_ref()
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

#[derive(Debug, Clone)]
pub struct SearchRequest {
    /// `None` for system-level search
    pub resource_type: Option<String>,
    /// Compartment owner, `("Patient", "p1")`
    pub compartment: Option<(String, String)>,
    pub query: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct ReadRequest {
    pub resource_type: String,
    pub id: String,
    /// HEAD: same status and headers, no body
    pub head: bool,
}

#[derive(Debug, Clone)]
pub struct VReadRequest {
    pub resource_type: String,
    pub id: String,
    pub version_id: i32,
    pub head: bool,
}

#[derive(Debug, Clone)]
pub struct HistoryRequest {
    pub resource_type: Option<String>,
    pub id: Option<String>,
    pub query: Vec<(String, String)>,
}

#[derive(Debug)]
pub struct CreateRequest {
    pub resource_type: String,
    /// Server-assigned logical id
    pub id: String,
    pub resource: JsonValue,
    pub local_id: Option<String>,
    pub warnings: Vec<OperationOutcomeIssue>,
    pub pending_payload: Option<PayloadHandle>,
}

#[derive(Debug, Clone)]
pub struct UpdateRequest {
    pub resource_type: String,
    pub id: String,
    pub resource: JsonValue,
    /// Latest stored version, tombstones included
    pub prev_resource: Option<JsonValue>,
    pub is_deleted: bool,
    /// Version required by `If-Match`, checked again when the update runs
    pub if_match: Option<i32>,
    pub local_id: Option<String>,
    pub warnings: Vec<OperationOutcomeIssue>,
}

#[derive(Debug, Clone)]
pub struct PatchRequest {
    pub resource_type: String,
    pub id: String,
    /// Re-applied when the target changed between preparation and persistence
    pub patch: json_patch::Patch,
    /// The current version with the patch applied
    pub resource: JsonValue,
    pub prev_resource: JsonValue,
    pub if_match: Option<i32>,
    pub local_id: Option<String>,
    pub warnings: Vec<OperationOutcomeIssue>,
}

#[derive(Debug, Clone)]
pub struct DeleteRequest {
    pub resource_type: String,
    /// `None` for conditional delete
    pub id: Option<String>,
    pub search_query: Option<String>,
}

#[derive(Debug, Clone)]
pub struct InvokeRequest {
    pub context: OperationContext,
    pub version_id: Option<i32>,
    pub name: String,
    pub resource: Option<JsonValue>,
    pub query: Vec<(String, String)>,
}

/// An entry whose response was decided during preparation
#[derive(Debug, Clone)]
pub struct ValidationResponseRequest {
    pub entry: BundleEntry,
}

/// An entry that failed preparation in a batch
#[derive(Debug, Clone)]
pub struct IssueRequest {
    pub status: StatusCode,
    pub entry: BundleEntry,
}

#[derive(Debug)]
pub enum Interaction {
    Search(SearchRequest),
    VRead(VReadRequest),
    Read(ReadRequest),
    History(HistoryRequest),
    Create(CreateRequest),
    Update(UpdateRequest),
    Patch(PatchRequest),
    Delete(DeleteRequest),
    Invoke(InvokeRequest),
    ValidationResponse(ValidationResponseRequest),
    Issue(IssueRequest),
}

impl Interaction {
    pub fn label(&self) -> &'static str {
        match self {
            Interaction::Search(_) => "search",
            Interaction::VRead(_) => "vread",
            Interaction::Read(_) => "read",
            Interaction::History(_) => "history",
            Interaction::Create(_) => "create",
            Interaction::Update(_) => "update",
            Interaction::Patch(_) => "patch",
            Interaction::Delete(_) => "delete",
            Interaction::Invoke(_) => "invoke",
            Interaction::ValidationResponse(_) => "validation-response",
            Interaction::Issue(_) => "issue",
        }
    }
}

#[derive(Debug)]
pub struct BundleInteraction {
    pub(crate) ctx: EntryContext,
    pub interaction: Interaction,
}

impl BundleInteraction {
    pub(crate) fn new(ctx: EntryContext, interaction: Interaction) -> Self {
        Self { ctx, interaction }
    }

    pub fn context(&self) -> &EntryContext {
        &self.ctx
    }

    /// Dispatch to the visitor method for this kind of interaction.
    pub async fn accept<V>(&mut self, visitor: &mut V) -> Result<()>
    where
        V: InteractionVisitor + ?Sized,
    {
        let ctx = &self.ctx;
        let response = match &mut self.interaction {
            Interaction::Search(request) => visitor.do_search(ctx, request).await?,
            Interaction::VRead(request) => visitor.do_vread(ctx, request).await?,
            Interaction::Read(request) => visitor.do_read(ctx, request).await?,
            Interaction::History(request) => visitor.do_history(ctx, request).await?,
            Interaction::Create(request) => visitor.do_create(ctx, request).await?,
            Interaction::Update(request) => visitor.do_update(ctx, request).await?,
            Interaction::Patch(request) => visitor.do_patch(ctx, request).await?,
            Interaction::Delete(request) => visitor.do_delete(ctx, request).await?,
            Interaction::Invoke(request) => visitor.do_invoke(ctx, request).await?,
            Interaction::ValidationResponse(request) => {
                visitor.validation_response(ctx, request).await?
            }
            Interaction::Issue(request) => visitor.issue(ctx, request).await?,
        };

        if let Some(response) = response {
            self.absorb(response);
        }
        Ok(())
    }

    fn absorb(&mut self, response: OperationResponse) {
        match &mut self.interaction {
            Interaction::Create(request) => {
                if let Some(resource) = response.resource {
                    request.resource = resource;
                }
                if response.pending_payload.is_some() {
                    request.pending_payload = response.pending_payload;
                }
            }
            Interaction::Update(request) => {
                if let Some(resource) = response.resource {
                    request.resource = resource;
                }
            }
            Interaction::Patch(request) => {
                if let Some(resource) = response.resource {
                    request.resource = resource;
                }
            }
            _ => {}
        }
    }

    /// Take a payload write still owned by this interaction.
    pub(crate) fn take_pending_payload(&mut self) -> Option<PayloadHandle> {
        match &mut self.interaction {
            Interaction::Create(request) => request.pending_payload.take(),
            _ => None,
        }
    }
}
