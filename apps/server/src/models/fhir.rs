//! Domain models for stored resources

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// One stored version of a resource
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resource {
    pub id: String,

    pub resource_type: String,

    /// Version ID (starts at 1)
    pub version_id: i32,

    /// Full resource JSON; a stub carrying only type and id for tombstones
    pub resource: JsonValue,

    pub last_updated: DateTime<Utc>,

    /// True when this version records a delete
    pub deleted: bool,
}

impl Resource {
    pub fn identity(&self) -> String {
        format!("{}/{}", self.resource_type, self.id)
    }

    pub fn versioned_location(&self) -> String {
        format!(
            "{}/{}/_history/{}",
            self.resource_type, self.id, self.version_id
        )
    }

    pub fn etag(&self) -> String {
        format!("W/\"{}\"", self.version_id)
    }

    pub fn last_modified(&self) -> String {
        format_instant(self.last_updated)
    }
}

/// Type of operation performed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceOperation {
    /// Resource was created (HTTP 201)
    Created,
    /// Resource was updated (HTTP 200)
    Updated,
    /// Update left the content unchanged, no version written (HTTP 200)
    NoOp,
    /// Resource was deleted (HTTP 200 with OperationOutcome)
    Deleted,
}

impl ResourceOperation {
    pub fn status_code(&self) -> u16 {
        match self {
            ResourceOperation::Created => 201,
            ResourceOperation::Updated | ResourceOperation::NoOp | ResourceOperation::Deleted => {
                200
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceOperation::Created => "create",
            ResourceOperation::Updated => "update",
            ResourceOperation::NoOp => "no-op",
            ResourceOperation::Deleted => "delete",
        }
    }
}

/// Search matches, in result order
#[derive(Debug, Clone, Default)]
pub struct SearchResult {
    pub resources: Vec<Resource>,
    /// Matches before `_count` was applied
    pub total: usize,
}

/// FHIR `instant` rendering used for meta.lastUpdated and Last-Modified.
pub fn format_instant(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Millis, true)
}
