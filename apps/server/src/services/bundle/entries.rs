//! Write-once response slots, one per inbound entry

use axum::http::StatusCode;
use tessera_models::BundleEntry;

use super::interaction::EntryContext;
use crate::metrics;
use crate::{Error, Result};

#[derive(Debug)]
pub struct ResponseEntries {
    slots: Vec<Option<BundleEntry>>,
}

impl ResponseEntries {
    pub fn new(len: usize) -> Self {
        Self {
            slots: (0..len).map(|_| None).collect(),
        }
    }

    pub fn is_complete(&self, index: usize) -> bool {
        matches!(self.slots.get(index), Some(Some(_)))
    }

    /// Fill the slot of `ctx`. Writing a slot twice is an internal error.
    pub(crate) fn complete(&mut self, ctx: &EntryContext, entry: BundleEntry) -> Result<()> {
        let index = ctx.index();
        let slot = self.slots.get_mut(index).ok_or_else(|| {
            Error::Internal(format!("response slot {} out of range", index))
        })?;
        if slot.is_some() {
            return Err(Error::Internal(format!(
                "response slot {} ({}) written twice",
                index,
                ctx.description()
            )));
        }

        let status = entry
            .response
            .as_ref()
            .and_then(|r| r.status_code())
            .unwrap_or(0);
        let elapsed = ctx.elapsed();
        tracing::info!(
            entry = index,
            request = %ctx.description(),
            status,
            elapsed_ms = elapsed.as_millis() as u64,
            "Bundle entry completed"
        );
        metrics::record_entry(ctx.method(), status, elapsed);

        *slot = Some(entry);
        Ok(())
    }

    /// All entries in original order. Fails if any slot is still empty.
    pub fn into_entries(self) -> Result<Vec<BundleEntry>> {
        self.slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.ok_or_else(|| {
                    Error::Internal(format!("no response produced for entry {}", index))
                })
            })
            .collect()
    }
}

/// `201 Created` style status text for `Bundle.entry.response.status`.
pub(crate) fn status_line(status: StatusCode) -> String {
    match status.canonical_reason() {
        Some(reason) => format!("{} {}", status.as_u16(), reason),
        None => status.as_u16().to_string(),
    }
}
