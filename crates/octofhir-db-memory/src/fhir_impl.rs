//! `FhirStorage` for [`InMemoryStorage`].
//!
//! Direct writes are one-operation transactions applied immediately.

use async_trait::async_trait;
use serde_json::Value;

use octofhir_storage::{
    FhirStorage, SearchParams, SearchResult, StorageResult, StoredResource,
    Transaction as FhirTransaction,
};

use crate::storage::InMemoryStorage;

#[async_trait]
impl FhirStorage for InMemoryStorage {
    async fn create(&self, resource: &Value) -> StorageResult<StoredResource> {
        let mut tx = self.transaction();
        let stored = tx.create_resource(resource).await?;
        tx.apply().await?;
        Ok(stored)
    }

    async fn read(
        &self,
        resource_type: &str,
        id: &str,
    ) -> StorageResult<Option<StoredResource>> {
        Ok(self.transaction().read_resource(resource_type, id))
    }

    async fn update(
        &self,
        resource: &Value,
        if_match: Option<&str>,
    ) -> StorageResult<StoredResource> {
        let mut tx = self.transaction();
        let stored = tx.update_resource(resource, if_match).await?;
        tx.apply().await?;
        Ok(stored)
    }

    async fn delete(&self, resource_type: &str, id: &str) -> StorageResult<()> {
        let mut tx = self.transaction();
        tx.delete_resource(resource_type, id).await?;
        tx.apply().await
    }

    async fn search(
        &self,
        resource_type: &str,
        params: &SearchParams,
    ) -> StorageResult<SearchResult> {
        self.transaction().search_resources(resource_type, params)
    }

    async fn begin_transaction(&self) -> StorageResult<Box<dyn FhirTransaction>> {
        tracing::trace!(backend = self.backend_name(), "transaction opened");
        Ok(Box::new(self.transaction()))
    }

    fn supports_transactions(&self) -> bool {
        true
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
