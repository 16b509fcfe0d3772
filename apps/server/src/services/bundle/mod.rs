//! Batch and transaction bundle processing
//!
//! An inbound bundle is prepared into one `BundleInteraction` per entry, then
//! every interaction is visited by the reference-mapping stage and afterwards
//! by the persistence stage. `BundleProcessor` drives the phases and owns the
//! per-bundle state the stages borrow.

pub mod entries;
pub mod failure;
pub mod interaction;
pub mod local_refs;
pub mod persist;
pub mod prepare;
pub mod processor;
pub mod reference_mapping;
pub mod response;
pub mod url;
pub mod visitor;

pub use entries::ResponseEntries;
pub use failure::issue_list_to_status;
pub use interaction::{BundleInteraction, EntryContext, Interaction};
pub use local_refs::LocalReferenceMap;
pub use persist::PersistStage;
pub use processor::{BundlePlan, BundleProcessor};
pub use reference_mapping::ReferenceMappingStage;
pub use response::OperationResponse;
pub use visitor::InteractionVisitor;

/// Prefer header return preference for response bundles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PreferReturn {
    /// Return minimal response (status/location/etag only, no resource body)
    Minimal,
    /// Return full resource representation in response
    #[default]
    Representation,
    /// Return OperationOutcome in `entry.response.outcome`
    OperationOutcome,
}

impl PreferReturn {
    /// Parse the value of `return=` (case-insensitive).
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "minimal" => Some(PreferReturn::Minimal),
            "representation" => Some(PreferReturn::Representation),
            "operationoutcome" => Some(PreferReturn::OperationOutcome),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PreferReturn::Minimal => "minimal",
            PreferReturn::Representation => "representation",
            PreferReturn::OperationOutcome => "OperationOutcome",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BundleRequestOptions {
    pub prefer_return: PreferReturn,
    /// Absolute service base, used for `fullUrl` of created and updated resources
    pub base_url: Option<String>,
}
