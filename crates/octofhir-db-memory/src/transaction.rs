//! Transactions for the in-memory backend.
//!
//! Writes are staged in an overlay keyed by `Type/id`. Reads and searches see
//! the overlay first. On commit the overlay is validated against the version
//! each slot had when the transaction first touched it, then applied in one
//! step under the storage commit lock. Rollback simply drops the overlay.

use async_trait::async_trait;
use indexmap::IndexMap;
use serde_json::{Map, Value};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use octofhir_core::{generate_id, validate_id};
use octofhir_storage::{
    SearchParams, SearchResult, StorageError, StoredResource, Transaction as FhirTransaction,
};

use crate::query;
use crate::storage::{InMemoryStorage, ResourceSlot, StorageKey, storage_key};

#[derive(Debug, Clone)]
struct StagedWrite {
    /// `last_version` of the shared slot when first touched (0 if absent).
    base_version: u64,
    slot: ResourceSlot,
}

/// A unit of work over [`InMemoryStorage`].
#[derive(Debug)]
pub struct InMemoryTransaction {
    storage: InMemoryStorage,
    staged: IndexMap<StorageKey, StagedWrite>,
}

pub(crate) fn extract_resource_type(resource: &Value) -> Result<String, StorageError> {
    resource
        .get("resourceType")
        .and_then(|v| v.as_str())
        .map(String::from)
        .ok_or_else(|| StorageError::invalid_resource("Missing resourceType field"))
}

pub(crate) fn extract_id(resource: &Value) -> Option<String> {
    resource.get("id").and_then(|v| v.as_str()).map(String::from)
}

/// Sets `id`, `meta.versionId` and `meta.lastUpdated`, keeping other meta fields.
fn with_meta(resource: &Value, id: &str, version: u64, now: OffsetDateTime) -> Value {
    let mut resource = resource.clone();
    if let Some(obj) = resource.as_object_mut() {
        obj.insert("id".to_string(), Value::String(id.to_string()));
        let meta = obj
            .entry("meta")
            .or_insert_with(|| Value::Object(Map::new()));
        if !meta.is_object() {
            *meta = Value::Object(Map::new());
        }
        if let Some(meta) = meta.as_object_mut() {
            meta.insert("versionId".to_string(), Value::String(version.to_string()));
            meta.insert(
                "lastUpdated".to_string(),
                Value::String(now.format(&Rfc3339).unwrap_or_default()),
            );
        }
    }
    resource
}

impl InMemoryTransaction {
    pub(crate) fn new(storage: InMemoryStorage) -> Self {
        Self {
            storage,
            staged: IndexMap::new(),
        }
    }

    /// Number of resources written so far.
    pub fn staged_len(&self) -> usize {
        self.staged.len()
    }

    fn view(&self, key: &str) -> Option<ResourceSlot> {
        match self.staged.get(key) {
            Some(write) => Some(write.slot.clone()),
            None => self.storage.slot(key),
        }
    }

    fn stage(&mut self, key: StorageKey, slot: ResourceSlot) {
        match self.staged.get_mut(&key) {
            Some(write) => write.slot = slot,
            None => {
                let base_version = self
                    .storage
                    .slot(&key)
                    .map(|s| s.last_version)
                    .unwrap_or(0);
                self.staged.insert(key, StagedWrite { base_version, slot });
            }
        }
    }

    pub async fn create_resource(&mut self, resource: &Value) -> Result<StoredResource, StorageError> {
        let resource_type = extract_resource_type(resource)?;
        let id = extract_id(resource).unwrap_or_else(generate_id);
        validate_id(&id).map_err(|e| StorageError::invalid_resource(e.to_string()))?;

        let key = storage_key(&resource_type, &id);
        let existing = self.view(&key);
        if existing.as_ref().is_some_and(ResourceSlot::is_live) {
            return Err(StorageError::already_exists(&resource_type, &id));
        }

        let version = existing.as_ref().map_or(0, |s| s.last_version) + 1;
        let now = OffsetDateTime::now_utc();
        let stored = StoredResource {
            id: id.clone(),
            version_id: version.to_string(),
            resource_type,
            resource: with_meta(resource, &id, version, now),
            last_updated: now,
            created_at: now,
        };
        let seq = self.storage.next_seq();
        self.stage(
            key,
            ResourceSlot {
                current: Some(stored.clone()),
                last_version: version,
                seq,
            },
        );
        Ok(stored)
    }

    pub async fn update_resource(
        &mut self,
        resource: &Value,
        if_match: Option<&str>,
    ) -> Result<StoredResource, StorageError> {
        let resource_type = extract_resource_type(resource)?;
        let id = extract_id(resource)
            .ok_or_else(|| StorageError::invalid_resource("Missing id field for update"))?;

        let key = storage_key(&resource_type, &id);
        let slot = self.view(&key);
        let Some((current, seq)) = slot.and_then(|s| s.current.map(|c| (c, s.seq))) else {
            return Err(StorageError::not_found(&resource_type, &id));
        };

        if let Some(expected) = if_match
            && expected != current.version_id
        {
            return Err(StorageError::version_conflict(
                &resource_type,
                &id,
                expected,
                &current.version_id,
            ));
        }

        let version = current.version_id.parse::<u64>().unwrap_or(0) + 1;
        let stored = current.new_version(
            version.to_string(),
            with_meta(resource, &id, version, OffsetDateTime::now_utc()),
        );
        self.stage(
            key,
            ResourceSlot {
                current: Some(stored.clone()),
                last_version: version,
                seq,
            },
        );
        Ok(stored)
    }

    pub async fn delete_resource(&mut self, resource_type: &str, id: &str) -> Result<(), StorageError> {
        let key = storage_key(resource_type, id);
        match self.view(&key) {
            Some(slot) if slot.is_live() => {
                self.stage(
                    key,
                    ResourceSlot {
                        current: None,
                        last_version: slot.last_version + 1,
                        seq: slot.seq,
                    },
                );
                Ok(())
            }
            _ => Err(StorageError::not_found(resource_type, id)),
        }
    }

    pub fn read_resource(&self, resource_type: &str, id: &str) -> Option<StoredResource> {
        self.view(&storage_key(resource_type, id))
            .and_then(|slot| slot.current)
    }

    pub fn search_resources(
        &self,
        resource_type: &str,
        params: &SearchParams,
    ) -> Result<SearchResult, StorageError> {
        let filters = query::compile(resource_type, params, &self.storage.registry)?;

        let mut slots: Vec<ResourceSlot> = self
            .storage
            .slots_of_type(resource_type)
            .into_iter()
            .filter(|(key, _)| !self.staged.contains_key(key))
            .map(|(_, slot)| slot)
            .collect();
        let prefix = format!("{resource_type}/");
        slots.extend(
            self.staged
                .iter()
                .filter(|(key, _)| key.starts_with(&prefix))
                .map(|(_, write)| write.slot.clone()),
        );
        slots.sort_by_key(|slot| slot.seq);

        let matching: Vec<StoredResource> = slots
            .into_iter()
            .filter_map(|slot| slot.current)
            .filter(|stored| filters.iter().all(|f| f.matches(&stored.resource)))
            .collect();

        let total = matching.len();
        let offset = params.offset.unwrap_or(0) as usize;
        let entries: Vec<StoredResource> = match params.count {
            Some(count) => matching.into_iter().skip(offset).take(count as usize).collect(),
            None => matching.into_iter().skip(offset).collect(),
        };
        let has_more = offset + entries.len() < total;

        Ok(SearchResult::with_entries(entries)
            .with_total(total as u32)
            .with_has_more(has_more))
    }

    /// Validates base versions and applies every staged write.
    pub async fn apply(self) -> Result<(), StorageError> {
        if self.staged.is_empty() {
            return Ok(());
        }
        let _lock = self.storage.commit_lock.lock().await;

        let guard = self.storage.data.pin();
        for (key, write) in &self.staged {
            let actual = guard.get(key).map_or(0, |s| s.last_version);
            if actual != write.base_version {
                tracing::warn!(%key, expected = write.base_version, actual, "Concurrent modification detected on commit");
                return Err(StorageError::concurrent_modification(
                    key.clone(),
                    write.base_version,
                    actual,
                ));
            }
        }
        for (key, write) in self.staged {
            guard.insert(key, write.slot);
        }
        Ok(())
    }
}

#[async_trait]
impl FhirTransaction for InMemoryTransaction {
    async fn commit(self: Box<Self>) -> Result<(), StorageError> {
        (*self).apply().await
    }

    async fn rollback(self: Box<Self>) -> Result<(), StorageError> {
        tracing::debug!(discarded = self.staged.len(), "In-memory transaction rolled back");
        Ok(())
    }

    async fn create(&mut self, resource: &Value) -> Result<StoredResource, StorageError> {
        self.create_resource(resource).await
    }

    async fn update(
        &mut self,
        resource: &Value,
        if_match: Option<&str>,
    ) -> Result<StoredResource, StorageError> {
        self.update_resource(resource, if_match).await
    }

    async fn delete(&mut self, resource_type: &str, id: &str) -> Result<(), StorageError> {
        self.delete_resource(resource_type, id).await
    }

    async fn read(
        &self,
        resource_type: &str,
        id: &str,
    ) -> Result<Option<StoredResource>, StorageError> {
        Ok(self.read_resource(resource_type, id))
    }

    async fn search(
        &self,
        resource_type: &str,
        params: &SearchParams,
    ) -> Result<SearchResult, StorageError> {
        self.search_resources(resource_type, params)
    }
}
