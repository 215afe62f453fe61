//! Response assembly.
//!
//! Outcomes arrive in execution order; the response bundle lists them in
//! submission order, one per submitted entry.

use serde_json::{Value, json};
use time::format_description::well_known::Rfc3339;

use octofhir_core::FhirReference;
use octofhir_storage::StoredResource;

use crate::bundle::{Bundle, BundleEntry, BundleEntryResponse, BundleMode};
use crate::config::PreferReturn;
use crate::entry::OperationKind;
use crate::error::{BundleError, Result};

/// HTTP-equivalent status of an entry or a whole submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseStatus {
    Ok,
    Created,
    NoContent,
    BadRequest,
    NotFound,
    Conflict,
    PreconditionFailed,
    UnprocessableEntity,
    InternalServerError,
}

impl ResponseStatus {
    pub fn code(self) -> u16 {
        match self {
            Self::Ok => 200,
            Self::Created => 201,
            Self::NoContent => 204,
            Self::BadRequest => 400,
            Self::NotFound => 404,
            Self::Conflict => 409,
            Self::PreconditionFailed => 412,
            Self::UnprocessableEntity => 422,
            Self::InternalServerError => 500,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Created => "Created",
            Self::NoContent => "No Content",
            Self::BadRequest => "Bad Request",
            Self::NotFound => "Not Found",
            Self::Conflict => "Conflict",
            Self::PreconditionFailed => "Precondition Failed",
            Self::UnprocessableEntity => "Unprocessable Entity",
            Self::InternalServerError => "Internal Server Error",
        }
    }

    /// `201 Created`
    pub fn status_line(self) -> String {
        format!("{} {}", self.code(), self.reason())
    }

    pub fn is_success(self) -> bool {
        self.code() < 300
    }
}

/// What happened to one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutcomeStatus {
    Created,
    Updated,
    Deleted,
    /// Nothing was written: an `If-None-Exist` match or an update with identical content.
    Unmodified,
    Read,
    NotFound,
    Conflict,
    Failed,
}

/// Result of executing one entry.
#[derive(Debug)]
pub struct EntryOutcome {
    pub original_index: usize,
    pub kind: OperationKind,
    pub status: OutcomeStatus,
    pub http_status: ResponseStatus,
    /// Versioned identity when a single resource was involved.
    pub identity: Option<FhirReference>,
    pub resource: Option<StoredResource>,
    /// Body that is not a stored resource (search results).
    pub body: Option<Value>,
    pub error: Option<BundleError>,
}

impl EntryOutcome {
    fn with_resource(
        original_index: usize,
        kind: OperationKind,
        status: OutcomeStatus,
        http_status: ResponseStatus,
        stored: StoredResource,
    ) -> Self {
        Self {
            original_index,
            kind,
            status,
            http_status,
            identity: Some(versioned_identity(&stored)),
            resource: Some(stored),
            body: None,
            error: None,
        }
    }

    pub fn created(original_index: usize, kind: OperationKind, stored: StoredResource) -> Self {
        Self::with_resource(
            original_index,
            kind,
            OutcomeStatus::Created,
            ResponseStatus::Created,
            stored,
        )
    }

    pub fn updated(original_index: usize, kind: OperationKind, stored: StoredResource) -> Self {
        Self::with_resource(
            original_index,
            kind,
            OutcomeStatus::Updated,
            ResponseStatus::Ok,
            stored,
        )
    }

    pub fn unmodified(original_index: usize, kind: OperationKind, stored: StoredResource) -> Self {
        Self::with_resource(
            original_index,
            kind,
            OutcomeStatus::Unmodified,
            ResponseStatus::Ok,
            stored,
        )
    }

    pub fn read(original_index: usize, stored: StoredResource) -> Self {
        Self::with_resource(
            original_index,
            OperationKind::Read,
            OutcomeStatus::Read,
            ResponseStatus::Ok,
            stored,
        )
    }

    /// `identity` is set when exactly one resource was removed.
    pub fn deleted(original_index: usize, identity: Option<FhirReference>) -> Self {
        Self {
            original_index,
            kind: OperationKind::Delete,
            status: OutcomeStatus::Deleted,
            http_status: ResponseStatus::NoContent,
            identity,
            resource: None,
            body: None,
            error: None,
        }
    }

    pub fn searched(original_index: usize, searchset: Value) -> Self {
        Self {
            original_index,
            kind: OperationKind::Search,
            status: OutcomeStatus::Read,
            http_status: ResponseStatus::Ok,
            identity: None,
            resource: None,
            body: Some(searchset),
            error: None,
        }
    }

    pub fn failed(original_index: usize, kind: OperationKind, error: BundleError) -> Self {
        let status = match error.kind() {
            crate::error::ErrorKind::NotFound => OutcomeStatus::NotFound,
            crate::error::ErrorKind::VersionConflict => OutcomeStatus::Conflict,
            _ => OutcomeStatus::Failed,
        };
        Self {
            original_index,
            kind,
            status,
            http_status: error.status(),
            identity: None,
            resource: None,
            body: None,
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

fn versioned_identity(stored: &StoredResource) -> FhirReference {
    FhirReference::with_version(&stored.resource_type, &stored.id, &stored.version_id)
}

/// The processed submission.
#[derive(Debug)]
pub struct BundleResponse {
    pub mode: BundleMode,
    pub bundle: Bundle,
    /// Outcomes in submission order.
    pub outcomes: Vec<EntryOutcome>,
}

impl BundleResponse {
    pub fn to_value(&self) -> Result<Value> {
        self.bundle.to_value()
    }

    /// Status line of each response entry, in submission order.
    pub fn statuses(&self) -> Vec<&str> {
        self.bundle
            .entry
            .iter()
            .filter_map(|e| e.response.as_ref().map(|r| r.status.as_str()))
            .collect()
    }
}

/// OperationOutcome describing a failure.
pub fn operation_outcome(error: &BundleError) -> Value {
    json!({
        "resourceType": "OperationOutcome",
        "issue": [{
            "severity": "error",
            "code": error.issue_code(),
            "diagnostics": error.to_string(),
        }]
    })
}

fn informational_outcome(diagnostics: String) -> Value {
    json!({
        "resourceType": "OperationOutcome",
        "issue": [{
            "severity": "information",
            "code": "informational",
            "diagnostics": diagnostics,
        }]
    })
}

/// Turns entry outcomes into a response bundle.
#[derive(Debug, Clone)]
pub struct ResponseAssembler {
    base_url: Option<String>,
    prefer: PreferReturn,
}

impl ResponseAssembler {
    pub fn new(base_url: Option<String>, prefer: PreferReturn) -> Self {
        Self {
            base_url: base_url.map(|u| u.trim_end_matches('/').to_string()),
            prefer,
        }
    }

    /// Orders `outcomes` by submission index and renders the response bundle.
    ///
    /// There must be exactly one outcome per submitted entry.
    pub fn assemble(
        &self,
        mode: BundleMode,
        mut outcomes: Vec<EntryOutcome>,
        entry_count: usize,
    ) -> Result<BundleResponse> {
        outcomes.sort_by_key(|o| o.original_index);
        let one_to_one = outcomes.len() == entry_count
            && outcomes
                .iter()
                .enumerate()
                .all(|(pos, o)| o.original_index == pos);
        if !one_to_one {
            return Err(BundleError::internal(format!(
                "Response has {} outcomes for {entry_count} entries",
                outcomes.len()
            )));
        }

        let mut bundle = Bundle::of_type(mode.response_type());
        bundle.timestamp = now_rfc3339();
        bundle.entry = outcomes.iter().map(|o| self.render(o)).collect();

        Ok(BundleResponse {
            mode,
            bundle,
            outcomes,
        })
    }

    fn render(&self, outcome: &EntryOutcome) -> BundleEntry {
        let stored = outcome.resource.as_ref();

        let location = match outcome.status {
            OutcomeStatus::Created | OutcomeStatus::Updated | OutcomeStatus::Unmodified => {
                outcome.identity.as_ref().map(FhirReference::to_versioned)
            }
            _ => None,
        };
        let etag = outcome
            .identity
            .as_ref()
            .and_then(|i| i.version.as_ref())
            .map(|v| format!("W/\"{v}\""));
        let last_modified = stored.and_then(|s| s.last_updated.format(&Rfc3339).ok());

        let outcome_body = match (&outcome.error, self.prefer) {
            (Some(err), _) => Some(operation_outcome(err)),
            (None, PreferReturn::OperationOutcome) => {
                Some(informational_outcome(success_message(outcome)))
            }
            (None, _) => None,
        };

        let resource = match outcome.kind {
            OperationKind::Read => stored.map(|s| s.resource.clone()),
            OperationKind::Search => outcome.body.clone(),
            _ if self.prefer == PreferReturn::Representation => stored.map(|s| s.resource.clone()),
            _ => None,
        };

        let full_url = match (&self.base_url, &resource, stored) {
            (Some(base), Some(_), Some(s)) => Some(format!("{base}/{}", s.relative_id())),
            _ => None,
        };

        BundleEntry {
            full_url,
            resource,
            search: None,
            request: None,
            response: Some(BundleEntryResponse {
                status: outcome.http_status.status_line(),
                location,
                etag,
                last_modified,
                outcome: outcome_body,
            }),
        }
    }
}

fn success_message(outcome: &EntryOutcome) -> String {
    let target = outcome
        .identity
        .as_ref()
        .map(FhirReference::to_versioned)
        .unwrap_or_default();
    match outcome.status {
        OutcomeStatus::Created => format!("Successfully created resource \"{target}\""),
        OutcomeStatus::Updated => format!("Successfully updated resource \"{target}\""),
        OutcomeStatus::Unmodified => format!("Resource \"{target}\" is unchanged"),
        OutcomeStatus::Deleted if target.is_empty() => "Delete completed".to_string(),
        OutcomeStatus::Deleted => format!("Successfully deleted resource \"{target}\""),
        _ => format!("{} completed", outcome.kind),
    }
}

fn now_rfc3339() -> Option<String> {
    time::OffsetDateTime::now_utc().format(&Rfc3339).ok()
}
