//! Result of one interaction as seen by the next stage

use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use tessera_models::{OperationOutcome, OperationOutcomeIssue};

use crate::models::{format_instant, Resource, ResourceOperation};
use crate::payload::PayloadHandle;

#[derive(Debug)]
pub struct OperationResponse {
    pub status: StatusCode,
    pub resource: Option<JsonValue>,
    pub resource_type: Option<String>,
    pub id: Option<String>,
    pub version_id: Option<i32>,
    pub last_updated: Option<DateTime<Utc>>,
    pub operation: Option<ResourceOperation>,
    pub outcome: Option<OperationOutcome>,
    /// Payload write started for a create, joined before the entry completes
    pub pending_payload: Option<PayloadHandle>,
}

impl OperationResponse {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            resource: None,
            resource_type: None,
            id: None,
            version_id: None,
            last_updated: None,
            operation: None,
            outcome: None,
            pending_payload: None,
        }
    }

    /// Response describing a stored version.
    pub fn from_stored(stored: Resource, operation: ResourceOperation) -> Self {
        let status = StatusCode::from_u16(operation.status_code()).unwrap_or(StatusCode::OK);
        Self {
            status,
            resource_type: Some(stored.resource_type),
            id: Some(stored.id),
            version_id: Some(stored.version_id),
            last_updated: Some(stored.last_updated),
            operation: Some(operation),
            resource: (!stored.deleted).then_some(stored.resource),
            outcome: None,
            pending_payload: None,
        }
    }

    pub fn with_resource(mut self, resource: JsonValue) -> Self {
        self.resource = Some(resource);
        self
    }

    pub fn with_identity(mut self, resource_type: impl Into<String>, id: impl Into<String>) -> Self {
        self.resource_type = Some(resource_type.into());
        self.id = Some(id.into());
        self
    }

    pub fn with_issue(mut self, issue: OperationOutcomeIssue) -> Self {
        self.outcome
            .get_or_insert_with(|| OperationOutcome::new(Vec::new()))
            .issue
            .push(issue);
        self
    }

    pub fn with_issues(mut self, issues: impl IntoIterator<Item = OperationOutcomeIssue>) -> Self {
        for issue in issues {
            self = self.with_issue(issue);
        }
        self
    }

    /// `Type/id/_history/vid` for created or updated resources.
    pub fn location(&self) -> Option<String> {
        match (&self.resource_type, &self.id, self.version_id) {
            (Some(rt), Some(id), Some(vid)) => Some(format!("{}/{}/_history/{}", rt, id, vid)),
            _ => None,
        }
    }

    pub fn etag(&self) -> Option<String> {
        self.version_id.map(|vid| format!("W/\"{}\"", vid))
    }

    pub fn last_modified(&self) -> Option<String> {
        self.last_updated.map(format_instant)
    }
}
