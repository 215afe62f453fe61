//! Storage errors.
//!
//! The bundle engine branches on these: a stale version, a missing resource and
//! a criterion the backend cannot evaluate each produce a different entry outcome.

use std::fmt;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Resource not found: {resource_type}/{id}")]
    NotFound { resource_type: String, id: String },

    /// `If-Match` named a version that is no longer current.
    #[error("Version conflict on {resource_type}/{id}: expected {expected}, found {actual}")]
    VersionConflict {
        resource_type: String,
        id: String,
        expected: String,
        actual: String,
    },

    #[error("Resource already exists: {resource_type}/{id}")]
    AlreadyExists { resource_type: String, id: String },

    /// A resource staged by a unit of work was changed by someone else before commit.
    #[error("Concurrent modification of {key}: expected version {expected}, found {actual}")]
    ConcurrentModification {
        key: String,
        expected: u64,
        actual: u64,
    },

    #[error("Invalid resource: {message}")]
    InvalidResource { message: String },

    /// The criterion itself is unusable. Never reported as an empty result.
    #[error("Invalid search: {message}")]
    InvalidSearch { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl StorageError {
    #[must_use]
    pub fn not_found(resource_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            resource_type: resource_type.into(),
            id: id.into(),
        }
    }

    #[must_use]
    pub fn version_conflict(
        resource_type: impl Into<String>,
        id: impl Into<String>,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        Self::VersionConflict {
            resource_type: resource_type.into(),
            id: id.into(),
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    #[must_use]
    pub fn already_exists(resource_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::AlreadyExists {
            resource_type: resource_type.into(),
            id: id.into(),
        }
    }

    #[must_use]
    pub fn concurrent_modification(key: impl Into<String>, expected: u64, actual: u64) -> Self {
        Self::ConcurrentModification {
            key: key.into(),
            expected,
            actual,
        }
    }

    #[must_use]
    pub fn invalid_resource(message: impl Into<String>) -> Self {
        Self::InvalidResource {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn invalid_search(message: impl Into<String>) -> Self {
        Self::InvalidSearch {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Stale `If-Match` or a lost race at commit.
    pub fn is_version_conflict(&self) -> bool {
        matches!(
            self,
            Self::VersionConflict { .. } | Self::ConcurrentModification { .. }
        )
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }

    pub fn is_invalid_search(&self) -> bool {
        matches!(self, Self::InvalidSearch { .. })
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::NotFound { .. } => ErrorCategory::NotFound,
            Self::VersionConflict { .. }
            | Self::AlreadyExists { .. }
            | Self::ConcurrentModification { .. } => ErrorCategory::Conflict,
            Self::InvalidResource { .. } | Self::InvalidSearch { .. } => ErrorCategory::Invalid,
            Self::Internal { .. } => ErrorCategory::Backend,
        }
    }
}

/// Coarse classification used for log labels and outcome mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    NotFound,
    Conflict,
    Invalid,
    Backend,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::Invalid => "invalid",
            Self::Backend => "backend",
        };
        f.write_str(label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_name_the_resource() {
        assert_eq!(
            StorageError::not_found("Patient", "123").to_string(),
            "Resource not found: Patient/123"
        );
        assert_eq!(
            StorageError::version_conflict("Patient", "123", "1", "2").to_string(),
            "Version conflict on Patient/123: expected 1, found 2"
        );
        assert_eq!(
            StorageError::concurrent_modification("Patient/9", 3, 4).to_string(),
            "Concurrent modification of Patient/9: expected version 3, found 4"
        );
    }

    #[test]
    fn test_conflicts_share_a_category() {
        let stale = StorageError::version_conflict("Patient", "1", "1", "2");
        let raced = StorageError::concurrent_modification("Patient/1", 1, 2);
        assert!(stale.is_version_conflict());
        assert!(raced.is_version_conflict());
        assert_eq!(raced.category(), ErrorCategory::Conflict);
        assert_eq!(
            StorageError::already_exists("Patient", "1").category(),
            ErrorCategory::Conflict
        );
        assert!(!stale.is_not_found());
    }

    #[test]
    fn test_invalid_search_is_not_backend_failure() {
        let err = StorageError::invalid_search("unknown parameter: foo");
        assert!(err.is_invalid_search());
        assert_eq!(err.category(), ErrorCategory::Invalid);
        assert_eq!(err.category().to_string(), "invalid");
        assert_eq!(
            StorageError::internal("disk").category(),
            ErrorCategory::Backend
        );
    }
}
