//! Conditional matching.
//!
//! Runs a criterion against the open unit of work and applies the
//! zero/one/many policy of the calling operation.

use std::sync::Arc;

use octofhir_core::FhirReference;
use octofhir_search::{MatchUrl, SearchParameterRegistry};
use octofhir_storage::{StorageError, StoredResource, Transaction};

use crate::entry::OperationKind;
use crate::error::{BundleError, Result};

/// Result of an `If-None-Exist` check.
#[derive(Debug, Clone)]
pub enum CreateMatch {
    Absent,
    Existing(StoredResource),
}

#[derive(Debug, Clone)]
pub struct ConditionalMatcher {
    registry: Arc<SearchParameterRegistry>,
}

impl ConditionalMatcher {
    pub fn new(registry: Arc<SearchParameterRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &SearchParameterRegistry {
        &self.registry
    }

    /// Every resource matching `criterion`, in storage order.
    ///
    /// A criterion the storage cannot evaluate is an invalid request quoting
    /// the criterion, never an empty result.
    pub async fn find_matching(
        &self,
        tx: &dyn Transaction,
        criterion: &MatchUrl,
    ) -> Result<Vec<StoredResource>> {
        let mut params = criterion.to_search_params();
        params.count = None;
        params.offset = None;

        let result = tx
            .search(criterion.resource_type(), &params)
            .await
            .map_err(|err| match err {
                StorageError::InvalidSearch { message } => BundleError::invalid_request(format!(
                    "Invalid match URL[{}] - {message}",
                    criterion.raw()
                )),
                other => BundleError::Storage(other),
            })?;

        tracing::trace!(
            criterion = %criterion,
            matches = result.entries.len(),
            "Evaluated conditional criterion"
        );
        Ok(result.entries)
    }

    /// `If-None-Exist`: zero matches creates, one returns it, more fail.
    pub async fn match_for_create(
        &self,
        tx: &dyn Transaction,
        criterion: &MatchUrl,
    ) -> Result<CreateMatch> {
        let mut matches = self.find_matching(tx, criterion).await?;
        match matches.len() {
            0 => Ok(CreateMatch::Absent),
            1 => Ok(CreateMatch::Existing(matches.remove(0))),
            count => Err(ambiguous(OperationKind::Create, criterion, count)),
        }
    }

    /// Conditional update: zero matches creates, one is the target, more fail.
    pub async fn match_for_update(
        &self,
        tx: &dyn Transaction,
        criterion: &MatchUrl,
    ) -> Result<Option<StoredResource>> {
        let mut matches = self.find_matching(tx, criterion).await?;
        match matches.len() {
            0 => Ok(None),
            1 => Ok(Some(matches.remove(0))),
            count => Err(ambiguous(OperationKind::Update, criterion, count)),
        }
    }

    /// Conditional patch: exactly one match is required.
    pub async fn match_for_patch(
        &self,
        tx: &dyn Transaction,
        criterion: &MatchUrl,
    ) -> Result<StoredResource> {
        let mut matches = self.find_matching(tx, criterion).await?;
        match matches.len() {
            0 => Err(BundleError::NoMatch {
                operation: OperationKind::Patch.match_verb(),
                url: criterion.raw().to_string(),
            }),
            1 => Ok(matches.remove(0)),
            count => Err(ambiguous(OperationKind::Patch, criterion, count)),
        }
    }

    /// Conditional delete: zero matches is a no-op, several only with `allow_multiple`.
    pub async fn match_for_delete(
        &self,
        tx: &dyn Transaction,
        criterion: &MatchUrl,
        allow_multiple: bool,
    ) -> Result<Vec<StoredResource>> {
        let matches = self.find_matching(tx, criterion).await?;
        if matches.len() > 1 && !allow_multiple {
            return Err(ambiguous(OperationKind::Delete, criterion, matches.len()));
        }
        Ok(matches)
    }

    /// Inline conditional reference (`"reference": "Patient?identifier=..."`).
    pub async fn match_for_reference(
        &self,
        tx: &dyn Transaction,
        criterion: &MatchUrl,
    ) -> Result<FhirReference> {
        let matches = self.find_matching(tx, criterion).await?;
        match matches.as_slice() {
            [only] => Ok(FhirReference::new(&only.resource_type, &only.id)),
            [] => Err(BundleError::UnmatchedReference {
                url: criterion.raw().to_string(),
            }),
            _ => Err(BundleError::AmbiguousReference {
                url: criterion.raw().to_string(),
            }),
        }
    }
}

fn ambiguous(kind: OperationKind, criterion: &MatchUrl, count: usize) -> BundleError {
    tracing::debug!(criterion = %criterion, count, operation = %kind, "Conditional criterion is ambiguous");
    BundleError::AmbiguousMatch {
        operation: kind.match_verb(),
        url: criterion.raw().to_string(),
        count,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use octofhir_db_memory::InMemoryStorage;
    use octofhir_storage::FhirStorage;
    use serde_json::json;

    async fn seeded() -> (InMemoryStorage, ConditionalMatcher) {
        let storage = InMemoryStorage::new();
        for (id, mrn) in [("a", "1"), ("b", "2"), ("c", "2")] {
            storage
                .create(&json!({
                    "resourceType": "Patient",
                    "id": id,
                    "identifier": [{"system": "http://acme.org/mrn", "value": mrn}]
                }))
                .await
                .unwrap();
        }
        let matcher = ConditionalMatcher::new(storage.registry().clone());
        (storage, matcher)
    }

    fn criterion(matcher: &ConditionalMatcher, raw: &str) -> MatchUrl {
        MatchUrl::parse_criterion(raw, None, matcher.registry()).unwrap()
    }

    #[tokio::test]
    async fn test_create_policy() {
        let (storage, matcher) = seeded().await;
        let tx = storage.begin_transaction().await.unwrap();

        let none = criterion(&matcher, "Patient?identifier=http://acme.org/mrn|9");
        assert!(matches!(
            matcher.match_for_create(tx.as_ref(), &none).await.unwrap(),
            CreateMatch::Absent
        ));

        let one = criterion(&matcher, "Patient?identifier=http://acme.org/mrn|1");
        match matcher.match_for_create(tx.as_ref(), &one).await.unwrap() {
            CreateMatch::Existing(stored) => assert_eq!(stored.id, "a"),
            CreateMatch::Absent => panic!("expected a match"),
        }

        let many = criterion(&matcher, "Patient?identifier=http://acme.org/mrn|2");
        let err = matcher.match_for_create(tx.as_ref(), &many).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "Failed to CREATE resource with match URL \"Patient?identifier=http://acme.org/mrn|2\" because this search matched 2 resources"
        );
    }

    #[tokio::test]
    async fn test_delete_policy_toggle() {
        let (storage, matcher) = seeded().await;
        let tx = storage.begin_transaction().await.unwrap();
        let many = criterion(&matcher, "Patient?identifier=http://acme.org/mrn|2");

        let err = matcher
            .match_for_delete(tx.as_ref(), &many, false)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Ambiguous);

        let all = matcher
            .match_for_delete(tx.as_ref(), &many, true)
            .await
            .unwrap();
        assert_eq!(all.len(), 2);

        let none = criterion(&matcher, "Patient?identifier=http://acme.org/mrn|9");
        assert!(
            matcher
                .match_for_delete(tx.as_ref(), &none, false)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_patch_and_reference_policy() {
        let (storage, matcher) = seeded().await;
        let tx = storage.begin_transaction().await.unwrap();

        let none = criterion(&matcher, "Patient?identifier=http://acme.org/mrn|9");
        assert!(matcher.match_for_patch(tx.as_ref(), &none).await.unwrap_err().is_not_found());

        let err = matcher
            .match_for_reference(tx.as_ref(), &none)
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid match URL \"Patient?identifier=http://acme.org/mrn|9\" - No resources match this search"
        );

        let one = criterion(&matcher, "Patient?identifier=http://acme.org/mrn|1");
        let reference = matcher.match_for_reference(tx.as_ref(), &one).await.unwrap();
        assert_eq!(reference.to_relative(), "Patient/a");
    }

    #[tokio::test]
    async fn test_update_sees_uncommitted_writes() {
        let (storage, matcher) = seeded().await;
        let mut tx = storage.begin_transaction().await.unwrap();
        tx.create(&json!({
            "resourceType": "Patient",
            "identifier": [{"system": "http://acme.org/mrn", "value": "5"}]
        }))
        .await
        .unwrap();

        let pending = criterion(&matcher, "Patient?identifier=http://acme.org/mrn|5");
        let found = matcher.match_for_update(tx.as_ref(), &pending).await.unwrap();
        assert!(found.is_some());
    }
}
