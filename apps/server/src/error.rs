//! Error types for the bundle engine

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use tessera_models::{IssueType, OperationOutcome, OperationOutcomeIssue};
use thiserror::Error;

use crate::services::bundle::failure::issue_list_to_status;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Resource not found: {resource_type}/{id}")]
    ResourceNotFound { resource_type: String, id: String },

    #[error("Version not found: {resource_type}/{id}/_history/{version_id}")]
    VersionNotFound {
        resource_type: String,
        id: String,
        version_id: i32,
    },

    #[error("Resource deleted: {resource_type}/{id}")]
    ResourceDeleted {
        resource_type: String,
        id: String,
        version_id: Option<i32>,
    },

    #[error("Invalid resource: {0}")]
    InvalidResource(String),

    #[error("Unresolved local reference: {0}")]
    UnresolvedReference(String),

    #[error("Duplicate: {0}")]
    Duplicate(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Business rule violation: {0}")]
    BusinessRule(String),

    #[error("Method not allowed: {0}")]
    MethodNotAllowed(String),

    #[error("Version conflict: expected {expected}, got {actual}")]
    VersionConflict { expected: i32, actual: i32 },

    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("Multiple matches: {0}")]
    MultipleMatches(String),

    #[error("Search error: {0}")]
    Search(String),

    #[error("Unsupported media type: {0}")]
    UnsupportedMediaType(String),

    #[error("Not implemented: {0}")]
    NotImplemented(String),

    /// Failure described by an explicit list of issues
    #[error("{message}")]
    Operation {
        message: String,
        issues: Vec<OperationOutcomeIssue>,
    },

    /// A transaction entry failed and the whole bundle was abandoned
    #[error("{message}")]
    BundledRequest {
        message: String,
        status: StatusCode,
        issues: Vec<OperationOutcomeIssue>,
    },

    #[error("Payload store error: {0}")]
    PayloadStore(String),

    #[error("Internal server error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// How a domain failure is settled inside a bundle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    NotFound,
    Deleted,
    Operation,
}

impl Error {
    /// `None` for failures that must end bundle processing instead of becoming an entry.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Error::ResourceNotFound { .. } | Error::VersionNotFound { .. } => {
                Some(FailureKind::NotFound)
            }
            Error::ResourceDeleted { .. } => Some(FailureKind::Deleted),
            Error::BundledRequest { .. }
            | Error::PayloadStore(_)
            | Error::Internal(_)
            | Error::Other(_) => None,
            _ => Some(FailureKind::Operation),
        }
    }

    pub fn is_search(&self) -> bool {
        matches!(self, Error::Search(_))
    }

    pub fn issue_type(&self) -> IssueType {
        match self {
            Error::ResourceNotFound { .. } | Error::VersionNotFound { .. } => IssueType::NotFound,
            Error::ResourceDeleted { .. } => IssueType::Deleted,
            Error::InvalidResource(_)
            | Error::UnresolvedReference(_)
            | Error::Search(_) => IssueType::Invalid,
            Error::Duplicate(_) => IssueType::Duplicate,
            Error::Conflict(_) | Error::VersionConflict { .. } | Error::PreconditionFailed(_) => {
                IssueType::Conflict
            }
            Error::BusinessRule(_) => IssueType::BusinessRule,
            Error::MultipleMatches(_) => IssueType::MultipleMatches,
            Error::MethodNotAllowed(_)
            | Error::UnsupportedMediaType(_)
            | Error::NotImplemented(_) => IssueType::NotSupported,
            Error::Operation { issues, .. } | Error::BundledRequest { issues, .. } => issues
                .first()
                .map(|i| i.code)
                .unwrap_or(IssueType::Processing),
            Error::PayloadStore(_) | Error::Internal(_) | Error::Other(_) => IssueType::Exception,
        }
    }

    /// Render this error as OperationOutcome issues.
    pub fn issues(&self) -> Vec<OperationOutcomeIssue> {
        match self {
            Error::Operation { issues, .. } | Error::BundledRequest { issues, .. } => {
                issues.clone()
            }
            _ => vec![OperationOutcomeIssue::error(
                self.issue_type(),
                self.to_string(),
            )],
        }
    }

    /// Statuses the issue code alone cannot express.
    pub fn status_hint(&self) -> Option<StatusCode> {
        match self {
            Error::VersionConflict { .. } | Error::PreconditionFailed(_) => {
                Some(StatusCode::PRECONDITION_FAILED)
            }
            Error::MethodNotAllowed(_) => Some(StatusCode::METHOD_NOT_ALLOWED),
            Error::UnsupportedMediaType(_) => Some(StatusCode::UNSUPPORTED_MEDIA_TYPE),
            Error::BundledRequest { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self.failure_kind() {
            Some(FailureKind::NotFound) => StatusCode::NOT_FOUND,
            Some(FailureKind::Deleted) => StatusCode::GONE,
            Some(FailureKind::Operation) if self.is_search() => StatusCode::BAD_REQUEST,
            Some(FailureKind::Operation) => self
                .status_hint()
                .unwrap_or_else(|| issue_list_to_status(&self.issues())),
            None => self
                .status_hint()
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        }
    }
}

impl From<tessera_models::Error> for Error {
    fn from(err: tessera_models::Error) -> Self {
        Error::InvalidResource(err.to_string())
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();

        let etag = match &self {
            Error::ResourceDeleted { version_id, .. } => *version_id,
            _ => None,
        };

        let issues = match &self {
            Error::PayloadStore(_) | Error::Internal(_) | Error::Other(_) => {
                tracing::error!("Internal error: {}", self);
                vec![OperationOutcomeIssue::error(
                    IssueType::Exception,
                    "Internal server error",
                )]
            }
            _ => self.issues(),
        };

        let body = OperationOutcome::new(issues);
        let mut response = (status, Json(body)).into_response();

        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/fhir+json; charset=utf-8"),
        );

        if let Some(version_id) = etag {
            if let Ok(value) = format!("W/\"{}\"", version_id).parse() {
                response.headers_mut().insert(header::ETAG, value);
            }
        }

        response
    }
}
