//! Bundle orchestration: prepare, map references, persist, then commit or roll back

use serde::Serialize;
use serde_json::Value as JsonValue;
use std::str::FromStr;
use tessera_models::{Bundle, BundleEntry, BundleType, HttpVerb, IssueType, OperationOutcomeIssue};
use uuid::Uuid;

use super::entries::ResponseEntries;
use super::interaction::BundleInteraction;
use super::local_refs::LocalReferenceMap;
use super::persist::PersistStage;
use super::prepare::Preparer;
use super::reference_mapping::ReferenceMappingStage;
use super::url::ParsedUrl;
use super::BundleRequestOptions;
use crate::config::BundleConfig;
use crate::metrics;
use crate::payload::{PayloadHandle, PayloadKey};
use crate::services::{ResourceHelpers, StoreResourceHelpers};
use crate::state::AppState;
use crate::{Error, Result};

/// Drives one batch or transaction bundle through its phases.
///
/// The helpers carry the store transaction, so a processor serves a single
/// bundle at a time.
pub struct BundleProcessor {
    helpers: Box<dyn ResourceHelpers>,
    max_entries: usize,
    compensate_on_abort: bool,
}

impl BundleProcessor {
    pub fn new(helpers: Box<dyn ResourceHelpers>, config: &BundleConfig) -> Self {
        Self {
            helpers,
            max_entries: config.max_entries,
            compensate_on_abort: config.payload.compensate_on_abort,
        }
    }

    pub fn from_state(state: &AppState) -> Self {
        Self::new(
            Box::new(StoreResourceHelpers::from_state(state)),
            &state.config.bundle,
        )
    }

    pub async fn process(
        &self,
        bundle_json: JsonValue,
        options: &BundleRequestOptions,
    ) -> Result<JsonValue> {
        let mut bundle = Bundle::from_value(&bundle_json)?;
        let (transaction, response_type) = match bundle.bundle_type {
            BundleType::Transaction => (true, BundleType::TransactionResponse),
            BundleType::Batch => (false, BundleType::BatchResponse),
            other => {
                return Err(Error::InvalidResource(format!(
                    "Unsupported Bundle type '{}'; expected 'batch' or 'transaction'",
                    other
                )))
            }
        };
        let bundle_type = bundle.bundle_type.as_str();

        let entries = bundle.take_entries();
        let entry_count = entries.len();
        if entry_count > self.max_entries {
            return Err(Error::Operation {
                message: format!(
                    "Bundle has {} entries, the limit is {}",
                    entry_count, self.max_entries
                ),
                issues: vec![OperationOutcomeIssue::error(
                    IssueType::TooCostly,
                    format!(
                        "Bundle has {} entries, the limit is {}",
                        entry_count, self.max_entries
                    ),
                )],
            });
        }

        tracing::info!(bundle_type, entries = entry_count, "Processing bundle");

        if transaction {
            self.helpers.begin_transaction().await?;
        }

        let mut interactions = Vec::new();
        let mut payload_ledger = Vec::new();
        let outcome = self
            .run(
                entries,
                transaction,
                options,
                &mut interactions,
                &mut payload_ledger,
            )
            .await;

        let outcome = match outcome {
            Ok(entries) if transaction => self.helpers.commit_transaction().await.map(|()| entries),
            other => other,
        };

        match outcome {
            Ok(response_entries) => {
                // Batch creates that failed after their payload was started.
                let leftovers = drain_pending_payloads(&mut interactions);
                self.compensate(leftovers, Vec::new()).await;

                metrics::record_bundle(bundle_type, "completed", entry_count);
                tracing::info!(
                    bundle_type,
                    entries = entry_count,
                    payloads = payload_ledger.len(),
                    "Bundle completed"
                );

                let mut response = Bundle::new(response_type);
                response.id = Some(Uuid::new_v4().to_string());
                response.entry = Some(response_entries);
                Ok(response.to_value()?)
            }
            Err(err) => {
                if transaction {
                    if let Err(rollback_err) = self.helpers.rollback_transaction().await {
                        tracing::error!(error = %rollback_err, "Rollback failed");
                    }
                }

                let pending = drain_pending_payloads(&mut interactions);
                // Payloads of committed batch entries belong to stored resources.
                let written = if transaction {
                    payload_ledger
                } else {
                    Vec::new()
                };
                self.compensate(pending, written).await;

                let result = match &err {
                    Error::BundledRequest { .. } => "aborted",
                    _ => "failed",
                };
                metrics::record_bundle(bundle_type, result, entry_count);
                tracing::warn!(bundle_type, result, error = %err, "Bundle not completed");
                Err(err)
            }
        }
    }

    async fn run(
        &self,
        entries: Vec<BundleEntry>,
        transaction: bool,
        options: &BundleRequestOptions,
        interactions: &mut Vec<BundleInteraction>,
        payload_ledger: &mut Vec<PayloadKey>,
    ) -> Result<Vec<BundleEntry>> {
        let helpers = self.helpers.as_ref();
        let mut local_refs = LocalReferenceMap::new();
        let mut slots = ResponseEntries::new(entries.len());

        tracing::debug!("Preparing bundle entries");
        *interactions = Preparer::new(helpers, &mut local_refs, transaction, options.prefer_return)
            .prepare(entries)
            .await?;
        let order = processing_order(interactions.iter().map(|i| i.context().method()));

        tracing::debug!(local_refs = local_refs.len(), "Reference mapping phase");
        let mut mapping = ReferenceMappingStage::new(helpers, &mut local_refs, &mut slots, transaction);
        for &index in &order {
            interactions[index].accept(&mut mapping).await?;
        }

        tracing::debug!("Persistence phase");
        let mut persist = PersistStage::new(
            helpers,
            &mut slots,
            payload_ledger,
            transaction,
            options.prefer_return,
            options.base_url.as_deref(),
        );
        for &index in &order {
            interactions[index].accept(&mut persist).await?;
        }

        slots.into_entries()
    }

    /// Delete payloads that no stored resource will point to.
    async fn compensate(&self, pending: Vec<PayloadHandle>, written: Vec<PayloadKey>) {
        let mut keys = written;
        for handle in pending {
            let key = handle.key().clone();
            match handle.resolve().await {
                Ok(receipt) => keys.push(receipt.key),
                Err(err) => {
                    // The write itself failed, so nothing is left behind.
                    tracing::debug!(payload = %key, error = %err, "Pending payload write failed");
                }
            }
        }

        for key in keys {
            if !self.compensate_on_abort {
                tracing::warn!(payload = %key, "Orphaned payload left in place");
                metrics::record_compensation("orphaned");
                continue;
            }
            match self.helpers.delete_payload(&key).await {
                Ok(()) => {
                    tracing::warn!(payload = %key, "Compensating payload delete");
                    metrics::record_compensation("deleted");
                }
                Err(err) => {
                    tracing::error!(payload = %key, error = %err, "Compensating payload delete failed");
                    metrics::record_compensation("failed");
                }
            }
        }
    }
}

fn drain_pending_payloads(interactions: &mut [BundleInteraction]) -> Vec<PayloadHandle> {
    interactions
        .iter_mut()
        .filter_map(BundleInteraction::take_pending_payload)
        .collect()
}

/// Entry indices in processing order: DELETE, POST, PUT/PATCH, then GET/HEAD.
///
/// Stable by original index within each group. Unrecognized methods are
/// visited with the reads, where their prepared error entry is written.
pub fn processing_order<'a>(methods: impl Iterator<Item = &'a str>) -> Vec<usize> {
    let mut delete_indices = Vec::new();
    let mut post_indices = Vec::new();
    let mut put_patch_indices = Vec::new();
    let mut get_indices = Vec::new();

    for (index, method) in methods.enumerate() {
        match HttpVerb::from_str(method) {
            Ok(HttpVerb::Delete) => delete_indices.push(index),
            Ok(HttpVerb::Post) => post_indices.push(index),
            Ok(HttpVerb::Put) | Ok(HttpVerb::Patch) => put_patch_indices.push(index),
            _ => get_indices.push(index),
        }
    }

    delete_indices
        .into_iter()
        .chain(post_indices)
        .chain(put_patch_indices)
        .chain(get_indices)
        .collect()
}

/// Processing plan of a bundle, without touching any store
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BundlePlan {
    pub bundle_type: String,
    pub steps: Vec<PlannedEntry>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannedEntry {
    pub index: usize,
    pub method: String,
    pub url: String,
    pub interaction: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_url: Option<String>,
}

impl BundlePlan {
    pub fn from_value(bundle_json: &JsonValue) -> Result<Self> {
        let bundle = Bundle::from_value(bundle_json)?;
        if bundle.bundle_type.response_type().is_none() {
            return Err(Error::InvalidResource(format!(
                "Unsupported Bundle type '{}'; expected 'batch' or 'transaction'",
                bundle.bundle_type
            )));
        }

        let entries = bundle.entries();
        let methods: Vec<String> = entries
            .iter()
            .map(|e| {
                e.request
                    .as_ref()
                    .map(|r| r.method.to_ascii_uppercase())
                    .unwrap_or_default()
            })
            .collect();

        let steps = processing_order(methods.iter().map(String::as_str))
            .into_iter()
            .map(|index| {
                let entry = &entries[index];
                let (method, url) = entry
                    .request
                    .as_ref()
                    .map(|r| (methods[index].clone(), r.url.clone()))
                    .unwrap_or_default();
                PlannedEntry {
                    index,
                    interaction: classify(&method, &url).to_string(),
                    method,
                    url,
                    full_url: entry.full_url.clone(),
                }
            })
            .collect();

        Ok(BundlePlan {
            bundle_type: bundle.bundle_type.to_string(),
            steps,
        })
    }
}

/// Interaction kind an entry would prepare into, judged from its request line alone.
fn classify(method: &str, url: &str) -> &'static str {
    let (Ok(verb), Ok(url)) = (HttpVerb::from_str(method), ParsedUrl::parse(url)) else {
        return "issue";
    };
    if url.operation.is_some() {
        return match verb {
            HttpVerb::Get | HttpVerb::Post => "invoke",
            _ => "issue",
        };
    }
    match verb {
        HttpVerb::Get | HttpVerb::Head => match (&url.resource_id, url.history, url.version_id) {
            (Some(_), true, Some(_)) => "vread",
            (_, true, _) => "history",
            (Some(_), false, _) if url.compartment_type.is_none() => "read",
            _ => "search",
        },
        HttpVerb::Post if url.search_endpoint => "search",
        HttpVerb::Post => "create",
        HttpVerb::Put => "update",
        HttpVerb::Patch => "patch",
        HttpVerb::Delete => "delete",
    }
}
