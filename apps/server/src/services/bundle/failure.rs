//! Mapping of entry failures to response entries or bundle aborts

use axum::http::StatusCode;
use tessera_models::{
    BundleEntry, BundleEntryResponse, IssueType, OperationOutcome, OperationOutcomeIssue,
};

use super::entries::{status_line, ResponseEntries};
use super::interaction::EntryContext;
use super::response::OperationResponse;
use crate::{Error, Result};

/// HTTP status for an issue list, driven by its most severe issue.
///
/// Ties keep the first issue. An empty list is a server error.
pub fn issue_list_to_status(issues: &[OperationOutcomeIssue]) -> StatusCode {
    let mut worst: Option<&OperationOutcomeIssue> = None;
    for issue in issues {
        match worst {
            Some(current) if issue.severity <= current.severity => {}
            _ => worst = Some(issue),
        }
    }
    worst
        .map(|issue| issue_type_to_status(issue.code))
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

pub fn issue_type_to_status(code: IssueType) -> StatusCode {
    match code {
        IssueType::Invalid
        | IssueType::Structure
        | IssueType::Required
        | IssueType::Value
        | IssueType::Invariant
        | IssueType::Processing
        | IssueType::CodeInvalid
        | IssueType::Extension => StatusCode::BAD_REQUEST,
        IssueType::Security | IssueType::Login | IssueType::Unknown | IssueType::Expired => {
            StatusCode::UNAUTHORIZED
        }
        IssueType::Forbidden | IssueType::Suppressed | IssueType::TooCostly => {
            StatusCode::FORBIDDEN
        }
        IssueType::Duplicate | IssueType::Conflict => StatusCode::CONFLICT,
        IssueType::MultipleMatches => StatusCode::PRECONDITION_FAILED,
        IssueType::NotFound => StatusCode::NOT_FOUND,
        IssueType::Deleted => StatusCode::GONE,
        IssueType::TooLong => StatusCode::PAYLOAD_TOO_LARGE,
        IssueType::BusinessRule => StatusCode::UNPROCESSABLE_ENTITY,
        IssueType::NotSupported => StatusCode::NOT_IMPLEMENTED,
        IssueType::Informational => StatusCode::OK,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Settle a failed entry.
///
/// Domain failures abort a transaction with `Error::BundledRequest`, or become
/// an error entry in a batch (`Ok(None)`). Failures outside the domain
/// taxonomy propagate unchanged in both modes.
pub(crate) fn handle_entry_failure(
    err: Error,
    transaction: bool,
    ctx: &EntryContext,
    entries: &mut ResponseEntries,
) -> Result<Option<OperationResponse>> {
    if err.failure_kind().is_none() {
        return Err(err);
    }

    if transaction {
        return Err(abort(err, ctx));
    }

    let status = err.status();
    let issues = err.issues();
    tracing::debug!(
        entry = ctx.index(),
        status = status.as_u16(),
        error = %err,
        "Batch entry failed"
    );

    entries.complete(ctx, error_entry(ctx, status, issues))?;
    Ok(None)
}

/// Wrap a domain failure into the error that abandons a transaction.
pub(crate) fn abort(err: Error, ctx: &EntryContext) -> Error {
    let status = err.status();
    tracing::warn!(
        entry = ctx.index(),
        request = %ctx.description(),
        status = status.as_u16(),
        error = %err,
        "Transaction entry failed, abandoning bundle"
    );
    Error::BundledRequest {
        message: format!("{} failed: {}", ctx.description(), err),
        status,
        issues: err.issues(),
    }
}

pub(crate) fn error_entry(
    ctx: &EntryContext,
    status: StatusCode,
    issues: Vec<OperationOutcomeIssue>,
) -> BundleEntry {
    BundleEntry {
        full_url: ctx.full_url().map(str::to_string),
        response: Some(BundleEntryResponse {
            status: status_line(status),
            outcome: OperationOutcome::new(issues).to_value().ok(),
            ..Default::default()
        }),
        ..Default::default()
    }
}
