use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use octofhir_search::SearchParameterRegistry;
use octofhir_storage::StoredResource;
use papaya::HashMap as PapayaHashMap;
use tokio::sync::Mutex;

use crate::transaction::InMemoryTransaction;

/// `Type/id`
pub type StorageKey = String;

pub(crate) fn storage_key(resource_type: &str, id: &str) -> StorageKey {
    format!("{resource_type}/{id}")
}

/// Everything known about one logical resource.
///
/// A deleted resource keeps its slot (with `current: None`) so versions keep
/// increasing if it is created again.
#[derive(Debug, Clone)]
pub(crate) struct ResourceSlot {
    pub current: Option<StoredResource>,
    pub last_version: u64,
    /// Creation order, used to return search results in a stable order.
    pub seq: u64,
}

impl ResourceSlot {
    pub fn is_live(&self) -> bool {
        self.current.is_some()
    }
}

/// Shared in-process store.
///
/// Clones share the same map. Reads go straight to papaya; writes arrive only
/// through [`InMemoryTransaction::apply`], serialized by `commit_lock`.
#[derive(Debug, Clone)]
pub struct InMemoryStorage {
    pub(crate) data: Arc<PapayaHashMap<StorageKey, ResourceSlot>>,
    pub(crate) registry: Arc<SearchParameterRegistry>,
    pub(crate) commit_lock: Arc<Mutex<()>>,
    /// Next creation sequence number.
    pub(crate) sequence: Arc<AtomicU64>,
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStorage {
    /// Creates a new in-memory storage using the built-in search parameters.
    pub fn new() -> Self {
        Self::with_registry(Arc::new(SearchParameterRegistry::with_defaults()))
    }

    /// Creates a new in-memory storage evaluating searches with `registry`.
    pub fn with_registry(registry: Arc<SearchParameterRegistry>) -> Self {
        Self {
            data: Arc::new(PapayaHashMap::new()),
            registry,
            commit_lock: Arc::new(Mutex::new(())),
            sequence: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn registry(&self) -> &Arc<SearchParameterRegistry> {
        &self.registry
    }

    /// Starts a new unit of work against this storage.
    pub fn transaction(&self) -> InMemoryTransaction {
        InMemoryTransaction::new(self.clone())
    }

    pub(crate) fn next_seq(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn slot(&self, key: &str) -> Option<ResourceSlot> {
        let guard = self.data.pin();
        guard.get(key).cloned()
    }

    /// Snapshot of all slots of one resource type.
    pub(crate) fn slots_of_type(&self, resource_type: &str) -> Vec<(StorageKey, ResourceSlot)> {
        let prefix = format!("{resource_type}/");
        let guard = self.data.pin();
        guard
            .iter()
            .filter(|(k, _)| k.starts_with(&prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Number of live (non-deleted) resources.
    pub fn count(&self) -> usize {
        let guard = self.data.pin();
        guard.iter().filter(|(_, slot)| slot.is_live()).count()
    }

    /// Number of live resources of one type.
    pub fn count_type(&self, resource_type: &str) -> usize {
        self.slots_of_type(resource_type)
            .iter()
            .filter(|(_, slot)| slot.is_live())
            .count()
    }
}
