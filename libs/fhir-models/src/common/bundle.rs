//! FHIR Bundle model
//!
//! Covers the shapes a batch/transaction engine reads and writes: request
//! bundles, their response bundles, and the searchset/history bundles that
//! end up inside response entries.

use super::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// FHIR Bundle resource
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Bundle {
    /// Always "Bundle"
    #[serde(default = "default_resource_type")]
    pub resource_type: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// How the bundle is meant to be used
    #[serde(rename = "type")]
    pub bundle_type: BundleType,

    /// When the bundle was assembled
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,

    /// If search or history, the total number of matches
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<u32>,

    /// Links related to this bundle, e.g. `self`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link: Option<Vec<BundleLink>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry: Option<Vec<BundleEntry>>,

    /// Additional content beyond core fields (meta, signature, extensions)
    #[serde(flatten)]
    pub extensions: HashMap<String, Value>,
}

fn default_resource_type() -> String {
    "Bundle".to_string()
}

/// Type of Bundle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BundleType {
    Document,
    Message,
    /// Processed atomically: every entry succeeds or none does
    Transaction,
    TransactionResponse,
    /// Each entry processed on its own
    Batch,
    BatchResponse,
    /// Versions of one or more resources, newest first
    History,
    /// Results of a search
    Searchset,
    Collection,
}

impl BundleType {
    /// The bundle type a server answers with, for the two processable types.
    pub fn response_type(self) -> Option<BundleType> {
        match self {
            BundleType::Batch => Some(BundleType::BatchResponse),
            BundleType::Transaction => Some(BundleType::TransactionResponse),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BundleType::Document => "document",
            BundleType::Message => "message",
            BundleType::Transaction => "transaction",
            BundleType::TransactionResponse => "transaction-response",
            BundleType::Batch => "batch",
            BundleType::BatchResponse => "batch-response",
            BundleType::History => "history",
            BundleType::Searchset => "searchset",
            BundleType::Collection => "collection",
        }
    }
}

impl fmt::Display for BundleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Link related to the bundle or to one of its entries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleLink {
    /// Link relation, e.g. `self` or `next`
    pub relation: String,
    /// Target of the link
    pub url: String,
}

/// Entry in the bundle
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleEntry {
    /// Absolute URL or local identifier (`urn:uuid:...`) for the entry
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_url: Option<String>,

    /// Links related to this entry
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link: Option<Vec<BundleLink>>,

    /// How this entry is processed in a batch or transaction
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request: Option<BundleEntryRequest>,

    /// Outcome of the request, in batch-response and transaction-response bundles
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<BundleEntryResponse>,

    /// The resource itself, kept as raw JSON
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<Value>,

    /// Search match information, in searchset bundles
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search: Option<BundleEntrySearch>,

    #[serde(flatten)]
    pub extensions: HashMap<String, Value>,
}

/// Request details for a batch or transaction entry
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleEntryRequest {
    /// HTTP verb for the entry (GET | HEAD | POST | PUT | PATCH | DELETE)
    pub method: String,

    /// URL relative to the server base, e.g. `Patient/123` or `Patient?name=x`
    pub url: String,

    /// ETag for a conditional read (`If-None-Match`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub if_none_match: Option<String>,

    /// Instant for a conditional read (`If-Modified-Since`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub if_modified_since: Option<String>,

    /// Version the update or patch must apply to (`If-Match`), e.g. `W/"2"`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub if_match: Option<String>,

    /// Search criteria for conditional creates
    #[serde(skip_serializing_if = "Option::is_none")]
    pub if_none_exist: Option<String>,

    #[serde(flatten)]
    pub extensions: HashMap<String, Value>,
}

impl BundleEntryRequest {
    pub fn verb(&self) -> Result<HttpVerb> {
        self.method.parse()
    }
}

/// Result of processing one request entry
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleEntryResponse {
    /// Status line, e.g. `201 Created`
    pub status: String,

    /// Versioned location of a created or updated resource
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,

    /// Weak ETag of the resulting version, e.g. `W/"1"`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,

    /// meta.lastUpdated of the resulting version
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<String>,

    /// OperationOutcome with hints, warnings or the failure of this entry
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Value>,

    #[serde(flatten)]
    pub extensions: HashMap<String, Value>,
}

impl BundleEntryResponse {
    /// Numeric status code parsed from the leading digits of the status line.
    pub fn status_code(&self) -> Option<u16> {
        self.status
            .split_whitespace()
            .next()
            .and_then(|code| code.parse().ok())
    }
}

/// Why an entry is in a searchset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleEntrySearch {
    /// `match`, `include` or `outcome`
    #[serde(rename = "mode", skip_serializing_if = "Option::is_none")]
    pub search_mode: Option<BundleEntrySearchMode>,

    /// Relevance score, between 0 and 1
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BundleEntrySearchMode {
    Match,
    Include,
    Outcome,
}

/// HTTP verbs allowed in `Bundle.entry.request.method`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpVerb {
    Get,
    Head,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpVerb {
    pub fn as_str(self) -> &'static str {
        match self {
            HttpVerb::Get => "GET",
            HttpVerb::Head => "HEAD",
            HttpVerb::Post => "POST",
            HttpVerb::Put => "PUT",
            HttpVerb::Patch => "PATCH",
            HttpVerb::Delete => "DELETE",
        }
    }
}

impl FromStr for HttpVerb {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(HttpVerb::Get),
            "HEAD" => Ok(HttpVerb::Head),
            "POST" => Ok(HttpVerb::Post),
            "PUT" => Ok(HttpVerb::Put),
            "PATCH" => Ok(HttpVerb::Patch),
            "DELETE" => Ok(HttpVerb::Delete),
            other => Err(Error::InvalidResource(format!(
                "Unsupported request method '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for HttpVerb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Bundle {
    pub fn new(bundle_type: BundleType) -> Self {
        Self {
            resource_type: "Bundle".to_string(),
            id: None,
            bundle_type,
            timestamp: None,
            total: None,
            link: None,
            entry: None,
            extensions: HashMap::new(),
        }
    }

    /// Parse from JSON Value, rejecting anything that is not a Bundle.
    pub fn from_value(value: &Value) -> Result<Self> {
        match value.get("resourceType").and_then(|v| v.as_str()) {
            Some("Bundle") => {}
            Some(other) => {
                return Err(Error::InvalidResource(format!(
                    "Expected resourceType 'Bundle', got '{}'",
                    other
                )))
            }
            None => return Err(Error::MissingField("resourceType".to_string())),
        }
        serde_json::from_value(value.clone()).map_err(Error::from)
    }

    pub fn to_value(&self) -> Result<Value> {
        serde_json::to_value(self).map_err(Error::from)
    }

    pub fn is_transaction(&self) -> bool {
        matches!(self.bundle_type, BundleType::Transaction)
    }

    pub fn is_batch(&self) -> bool {
        matches!(self.bundle_type, BundleType::Batch)
    }

    pub fn entry_count(&self) -> usize {
        self.entry.as_ref().map(|e| e.len()).unwrap_or(0)
    }

    pub fn entries(&self) -> &[BundleEntry] {
        self.entry.as_deref().unwrap_or(&[])
    }

    /// Take ownership of the entries, leaving the bundle empty.
    pub fn take_entries(&mut self) -> Vec<BundleEntry> {
        self.entry.take().unwrap_or_default()
    }

    pub fn add_entry(&mut self, entry: BundleEntry) {
        self.entry.get_or_insert_with(Vec::new).push(entry);
    }

    pub fn add_link(&mut self, relation: impl Into<String>, url: impl Into<String>) {
        self.link.get_or_insert_with(Vec::new).push(BundleLink {
            relation: relation.into(),
            url: url.into(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_deserialize_transaction_bundle() {
        let json = json!({
            "resourceType": "Bundle",
            "type": "transaction",
            "entry": [
                {
                    "fullUrl": "urn:uuid:61ebe359-bfdc-4613-8bf2-c5e300945f0a",
                    "resource": {"resourceType": "Patient"},
                    "request": {"method": "POST", "url": "Patient", "ifNoneExist": "identifier=a|1"}
                }
            ]
        });

        let bundle = Bundle::from_value(&json).unwrap();
        assert!(bundle.is_transaction());
        assert_eq!(bundle.entry_count(), 1);
        let request = bundle.entries()[0].request.as_ref().unwrap();
        assert_eq!(request.verb().unwrap(), HttpVerb::Post);
        assert_eq!(request.if_none_exist.as_deref(), Some("identifier=a|1"));
    }

    #[test]
    fn test_from_value_rejects_other_resources() {
        let err = Bundle::from_value(&json!({"resourceType": "Patient"})).unwrap_err();
        assert!(err.to_string().contains("Patient"));
    }

    #[test]
    fn test_response_type_serializes_kebab_case() {
        let bundle = Bundle::new(BundleType::Batch.response_type().unwrap());
        let json = serde_json::to_value(&bundle).unwrap();
        assert_eq!(json["resourceType"], "Bundle");
        assert_eq!(json["type"], "batch-response");
        assert_eq!(BundleType::Searchset.response_type(), None);
    }

    #[test]
    fn test_entry_response_status_code() {
        let response = BundleEntryResponse {
            status: "410 Gone".to_string(),
            ..Default::default()
        };
        assert_eq!(response.status_code(), Some(410));

        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json, json!({"status": "410 Gone"}));
    }

    #[test]
    fn test_http_verb_parse() {
        assert_eq!("patch".parse::<HttpVerb>().unwrap(), HttpVerb::Patch);
        assert!("TRACE".parse::<HttpVerb>().is_err());
    }

    #[test]
    fn test_add_entry_and_link() {
        let mut bundle = Bundle::new(BundleType::Searchset);
        bundle.add_entry(BundleEntry {
            resource: Some(json!({"resourceType": "Patient", "id": "123"})),
            ..Default::default()
        });
        bundle.add_link("self", "Patient?_id=123");
        assert_eq!(bundle.entry_count(), 1);
        assert_eq!(bundle.link.as_ref().unwrap()[0].relation, "self");
        assert_eq!(bundle.take_entries().len(), 1);
        assert_eq!(bundle.entry_count(), 0);
    }

    #[test]
    fn test_entry_link_is_typed() {
        let entry: BundleEntry = serde_json::from_value(json!({
            "link": [{"relation": "alternate", "url": "Patient/123/_history/2"}],
            "request": {"method": "PUT", "url": "Patient/123", "ifMatch": "W/\"2\""}
        }))
        .unwrap();
        assert_eq!(entry.link.as_ref().unwrap()[0].relation, "alternate");
        assert!(entry.extensions.is_empty());
        assert_eq!(entry.request.unwrap().if_match.as_deref(), Some("W/\"2\""));
    }
}
