//! Backend contract used by the bundle engine.

use async_trait::async_trait;
use serde_json::Value;

use crate::StorageResult;
use crate::types::{SearchParams, SearchResult, StoredResource};

/// A FHIR resource store.
///
/// Backends are shared across tasks and do their own isolation; callers hold
/// no locks.
///
/// ```ignore
/// async fn get_patient(storage: &dyn FhirStorage, id: &str) -> StorageResult<StoredResource> {
///     storage
///         .read("Patient", id)
///         .await?
///         .ok_or_else(|| StorageError::not_found("Patient", id))
/// }
/// ```
#[async_trait]
pub trait FhirStorage: Send + Sync {
    /// Stores a new resource under its `id`, or a generated one when absent.
    ///
    /// Fails with `AlreadyExists` when a live resource has the same identity.
    async fn create(&self, resource: &Value) -> StorageResult<StoredResource>;

    /// Current version, or `None` for unknown and deleted resources.
    async fn read(&self, resource_type: &str, id: &str) -> StorageResult<Option<StoredResource>>;

    /// Writes a new version. With `if_match` the current version must equal it.
    async fn update(&self, resource: &Value, if_match: Option<&str>)
    -> StorageResult<StoredResource>;

    /// Fails with `NotFound` unless the resource is live.
    async fn delete(&self, resource_type: &str, id: &str) -> StorageResult<()>;

    /// Fails with `InvalidSearch` when the criterion cannot be evaluated.
    /// No matches is an empty result, not an error.
    async fn search(&self, resource_type: &str, params: &SearchParams)
    -> StorageResult<SearchResult>;

    async fn begin_transaction(&self) -> StorageResult<Box<dyn Transaction>>;

    fn supports_transactions(&self) -> bool;

    /// Backend name for logs.
    fn backend_name(&self) -> &'static str;
}

/// A unit of work whose writes become visible to others only on commit.
///
/// Reads and searches through the transaction observe its own uncommitted
/// writes. Rolling back, or dropping it, leaves stored state untouched.
#[async_trait]
pub trait Transaction: Send + Sync {
    /// Fails with `ConcurrentModification` when another writer changed a
    /// resource this transaction touched since it was first read.
    async fn commit(self: Box<Self>) -> StorageResult<()>;

    async fn rollback(self: Box<Self>) -> StorageResult<()>;

    async fn create(&mut self, resource: &Value) -> StorageResult<StoredResource>;

    async fn update(
        &mut self,
        resource: &Value,
        if_match: Option<&str>,
    ) -> StorageResult<StoredResource>;

    async fn delete(&mut self, resource_type: &str, id: &str) -> StorageResult<()>;

    async fn read(&self, resource_type: &str, id: &str) -> StorageResult<Option<StoredResource>>;

    async fn search(&self, resource_type: &str, params: &SearchParams)
    -> StorageResult<SearchResult>;
}
