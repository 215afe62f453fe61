//! Error types for bundle processing.
//!
//! Every error carries the text that caused it (criterion, identity or
//! placeholder) so a rejected bundle can be fixed without guessing.

use std::fmt;

use octofhir_search::SearchError;
use octofhir_storage::{ErrorCategory, StorageError};

use crate::interceptor::InterceptorError;
use crate::response::ResponseStatus;

/// Classification of a bundle failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The request is structurally invalid; rejected before storage access.
    Malformed,
    /// A conditional criterion matched more than one resource.
    Ambiguous,
    /// An expected-version precondition did not hold.
    VersionConflict,
    /// The target of an operation does not exist.
    NotFound,
    /// The storage or an interceptor failed unexpectedly.
    Collaborator,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Malformed => write!(f, "malformed"),
            ErrorKind::Ambiguous => write!(f, "ambiguous"),
            ErrorKind::VersionConflict => write!(f, "version_conflict"),
            ErrorKind::NotFound => write!(f, "not_found"),
            ErrorKind::Collaborator => write!(f, "collaborator"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BundleError {
    #[error(
        "Invalid placeholder ID found: {value} - Must be of the form 'urn:uuid:[uuid]' or 'urn:oid:[oid]'"
    )]
    InvalidPlaceholder { value: String },

    #[error("Transaction bundle contains multiple resources with ID: {identity}")]
    DuplicateTarget { identity: String },

    #[error("Duplicate fullUrl in transaction at entry {index}: {full_url}")]
    DuplicateFullUrl { index: usize, full_url: String },

    #[error("Unable to process transaction where incoming Bundle.type = {bundle_type}")]
    UnsupportedBundleType { bundle_type: String },

    #[error("{message}")]
    InvalidRequest { message: String },

    /// The criterion failed to parse; the message quotes it verbatim.
    #[error(transparent)]
    InvalidCriterion(#[from] SearchError),

    #[error(
        "Failed to {operation} resource with match URL \"{url}\" because this search matched {count} resources"
    )]
    AmbiguousMatch {
        operation: &'static str,
        url: String,
        count: usize,
    },

    #[error("Invalid match URL \"{url}\" - Multiple resources match this search")]
    AmbiguousReference { url: String },

    #[error("Invalid match URL \"{url}\" - No resources match this search")]
    UnmatchedReference { url: String },

    #[error(
        "Unable to process Transaction - Request would cause multiple resources to match URL: \"{url}\". Does transaction request contain duplicates?"
    )]
    DuplicateMatchAfterWrite { url: String },

    #[error(
        "Trying to {operation} {identity}/_history/{version} but this is not the current version"
    )]
    VersionConflict {
        operation: &'static str,
        identity: String,
        version: String,
    },

    #[error("Resource {identity} is not known")]
    NotFound { identity: String },

    #[error(
        "Failed to {operation} resource with match URL \"{url}\" because no resources match this search"
    )]
    NoMatch { operation: &'static str, url: String },

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Interceptor {name} failed: {source}")]
    Interceptor {
        name: String,
        #[source]
        source: InterceptorError,
    },

    #[error("{message}")]
    InvalidPatch { message: String },

    /// Failure of a single entry, tagged with its position in the submitted bundle.
    #[error("Transaction entry {index}: {source}")]
    Entry {
        index: usize,
        #[source]
        source: Box<BundleError>,
    },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl BundleError {
    #[must_use]
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn invalid_placeholder(value: impl Into<String>) -> Self {
        Self::InvalidPlaceholder {
            value: value.into(),
        }
    }

    #[must_use]
    pub fn not_found(identity: impl fmt::Display) -> Self {
        Self::NotFound {
            identity: identity.to_string(),
        }
    }

    #[must_use]
    pub fn invalid_patch(message: impl Into<String>) -> Self {
        Self::InvalidPatch {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Tags this error with the index of the entry it came from.
    ///
    /// An error that is already tagged keeps its original index.
    #[must_use]
    pub fn with_entry(self, index: usize) -> Self {
        match self {
            tagged @ Self::Entry { .. } => tagged,
            other => Self::Entry {
                index,
                source: Box::new(other),
            },
        }
    }

    /// Index of the entry that caused this error, when known.
    pub fn entry_index(&self) -> Option<usize> {
        match self {
            Self::Entry { index, .. } => Some(*index),
            Self::DuplicateFullUrl { index, .. } => Some(*index),
            _ => None,
        }
    }

    /// The error without its entry tag.
    pub fn root(&self) -> &BundleError {
        match self {
            Self::Entry { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidPlaceholder { .. }
            | Self::DuplicateTarget { .. }
            | Self::DuplicateFullUrl { .. }
            | Self::UnsupportedBundleType { .. }
            | Self::InvalidRequest { .. }
            | Self::InvalidCriterion(_)
            | Self::InvalidPatch { .. } => ErrorKind::Malformed,
            Self::AmbiguousMatch { .. }
            | Self::AmbiguousReference { .. }
            | Self::DuplicateMatchAfterWrite { .. } => ErrorKind::Ambiguous,
            Self::VersionConflict { .. } => ErrorKind::VersionConflict,
            Self::NotFound { .. } | Self::NoMatch { .. } | Self::UnmatchedReference { .. } => {
                ErrorKind::NotFound
            }
            Self::Storage(err) => match err.category() {
                ErrorCategory::NotFound => ErrorKind::NotFound,
                ErrorCategory::Conflict => ErrorKind::VersionConflict,
                ErrorCategory::Invalid => ErrorKind::Malformed,
                ErrorCategory::Backend => ErrorKind::Collaborator,
            },
            Self::Interceptor { source, .. } => match source {
                InterceptorError::Rejected(_) => ErrorKind::Malformed,
                InterceptorError::Other(_) => ErrorKind::Collaborator,
            },
            Self::Entry { source, .. } => source.kind(),
            Self::Internal { .. } => ErrorKind::Collaborator,
        }
    }

    pub fn status(&self) -> ResponseStatus {
        match self.kind() {
            ErrorKind::Malformed => ResponseStatus::BadRequest,
            ErrorKind::Ambiguous => ResponseStatus::PreconditionFailed,
            ErrorKind::VersionConflict => ResponseStatus::Conflict,
            ErrorKind::NotFound => ResponseStatus::NotFound,
            ErrorKind::Collaborator => ResponseStatus::InternalServerError,
        }
    }

    /// FHIR `OperationOutcome.issue.code` for this error.
    pub fn issue_code(&self) -> &'static str {
        match self.root() {
            Self::DuplicateTarget { .. } | Self::DuplicateFullUrl { .. } => "duplicate",
            Self::AmbiguousMatch { .. }
            | Self::AmbiguousReference { .. }
            | Self::DuplicateMatchAfterWrite { .. } => "multiple-matches",
            Self::Interceptor { .. } => "business-rule",
            root => match root.kind() {
                ErrorKind::Malformed => "invalid",
                ErrorKind::VersionConflict => "conflict",
                ErrorKind::NotFound => "not-found",
                ErrorKind::Ambiguous => "multiple-matches",
                ErrorKind::Collaborator => "exception",
            },
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }
}

pub type Result<T> = std::result::Result<T, BundleError>;
