//! Optimistic-concurrency checks for mutating entries.

use octofhir_core::FhirReference;
use octofhir_storage::{StoredResource, Transaction};

use crate::entry::OperationKind;
use crate::error::{BundleError, Result};

/// Extracts the version from an `If-Match` value.
///
/// Accepts `W/"3"`, `"3"` and `3`.
pub fn parse_if_match(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    let unquoted = trimmed
        .strip_prefix("W/")
        .unwrap_or(trimmed)
        .trim()
        .trim_matches('"')
        .trim();
    if unquoted.is_empty() || unquoted.contains(char::is_whitespace) {
        return Err(BundleError::invalid_request(format!(
            "Invalid If-Match value: {raw}"
        )));
    }
    Ok(unquoted.to_string())
}

/// Compares expected versions against what the unit of work currently sees.
///
/// Reads go through the open transaction, so a resource created earlier in
/// the same bundle is checked against its pending version.
#[derive(Debug, Default, Clone, Copy)]
pub struct VersionGuard;

impl VersionGuard {
    /// Returns the current state of `identity`.
    ///
    /// With an expected version the resource must exist and be at exactly that
    /// version; otherwise the call only reports what is there.
    pub async fn check(
        &self,
        tx: &dyn Transaction,
        kind: OperationKind,
        identity: &FhirReference,
        expected: Option<&str>,
    ) -> Result<Option<StoredResource>> {
        let current = tx.read(&identity.resource_type, &identity.id).await?;
        let Some(expected) = expected else {
            return Ok(current);
        };

        match current {
            Some(stored) if stored.version_id == expected => Ok(Some(stored)),
            Some(_) => {
                tracing::debug!(
                    identity = %identity,
                    expected,
                    "Version precondition failed"
                );
                Err(BundleError::VersionConflict {
                    operation: kind.verb(),
                    identity: identity.to_relative(),
                    version: expected.to_string(),
                })
            }
            None => Err(BundleError::not_found(identity)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use octofhir_db_memory::InMemoryStorage;
    use octofhir_storage::FhirStorage;
    use serde_json::json;

    #[test]
    fn test_parse_if_match_forms() {
        assert_eq!(parse_if_match("W/\"3\"").unwrap(), "3");
        assert_eq!(parse_if_match("\"12\"").unwrap(), "12");
        assert_eq!(parse_if_match("7").unwrap(), "7");
        assert!(parse_if_match("W/\"\"").is_err());
    }

    #[tokio::test]
    async fn test_check_against_pending_version() {
        let storage = InMemoryStorage::new();
        let mut tx = storage.begin_transaction().await.unwrap();
        tx.create(&json!({"resourceType": "Patient", "id": "p1"}))
            .await
            .unwrap();

        let identity = FhirReference::new("Patient", "p1");
        let guard = VersionGuard;
        let current = guard
            .check(tx.as_ref(), OperationKind::Update, &identity, Some("1"))
            .await
            .unwrap();
        assert_eq!(current.unwrap().version_id, "1");

        let err = guard
            .check(tx.as_ref(), OperationKind::Update, &identity, Some("2"))
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Trying to update Patient/p1/_history/2 but this is not the current version"
        );
    }

    #[tokio::test]
    async fn test_check_without_precondition() {
        let storage = InMemoryStorage::new();
        let tx = storage.begin_transaction().await.unwrap();
        let identity = FhirReference::new("Patient", "missing");

        let current = VersionGuard
            .check(tx.as_ref(), OperationKind::Delete, &identity, None)
            .await
            .unwrap();
        assert!(current.is_none());

        let err = VersionGuard
            .check(tx.as_ref(), OperationKind::Delete, &identity, Some("1"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
