//! Per-operation handlers.
//!
//! Every [`OperationKind`] has exactly one [`EntryHandler`] in the
//! [`HandlerTable`]. Handlers run against the open unit of work and turn a
//! resolved entry into an [`EntryOutcome`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use octofhir_core::FhirReference;
use octofhir_storage::{StorageError, StoredResource, Transaction};

use crate::bundle::{Bundle, BundleEntry, BundleEntrySearch};
use crate::config::TransactionSettings;
use crate::entry::{OperationKind, Resolution, TransactionEntry};
use crate::error::{BundleError, Result};
use crate::guard::VersionGuard;
use crate::patch::{apply_json_patch, decode_patch_document};
use crate::planner::Phase;
use crate::response::EntryOutcome;

/// What handlers need besides the entry and the unit of work.
#[derive(Debug, Clone, Copy)]
pub struct ExecutionContext<'a> {
    pub settings: &'a TransactionSettings,
    pub guard: VersionGuard,
}

impl<'a> ExecutionContext<'a> {
    pub fn new(settings: &'a TransactionSettings) -> Self {
        Self {
            settings,
            guard: VersionGuard,
        }
    }
}

#[async_trait]
pub trait EntryHandler: Send + Sync {
    fn kind(&self) -> OperationKind;

    /// Phase in which entries of this kind run.
    fn phase(&self) -> Phase {
        self.kind().phase()
    }

    async fn execute(
        &self,
        tx: &mut dyn Transaction,
        entry: &TransactionEntry,
        ctx: &ExecutionContext<'_>,
    ) -> Result<EntryOutcome>;
}

/// Dispatch table from operation kind to handler.
#[derive(Clone)]
pub struct HandlerTable {
    handlers: HashMap<OperationKind, Arc<dyn EntryHandler>>,
}

impl std::fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<_> = self.handlers.keys().collect();
        kinds.sort();
        f.debug_struct("HandlerTable").field("kinds", &kinds).finish()
    }
}

impl Default for HandlerTable {
    fn default() -> Self {
        Self::standard()
    }
}

impl HandlerTable {
    /// A table with the built-in handler for every operation kind.
    pub fn standard() -> Self {
        let mut table = Self {
            handlers: HashMap::new(),
        };
        table.register(Arc::new(CreateHandler));
        table.register(Arc::new(UpdateHandler));
        table.register(Arc::new(PatchHandler));
        table.register(Arc::new(DeleteHandler));
        table.register(Arc::new(ReadHandler));
        table.register(Arc::new(SearchHandler));
        table
    }

    /// Installs `handler`, replacing any handler for the same kind.
    pub fn register(&mut self, handler: Arc<dyn EntryHandler>) {
        self.handlers.insert(handler.kind(), handler);
    }

    pub fn phase_of(&self, kind: OperationKind) -> Phase {
        self.handlers
            .get(&kind)
            .map_or_else(|| kind.phase(), |h| h.phase())
    }

    /// Runs `entry` through its handler. Errors are tagged with the entry index.
    pub async fn execute(
        &self,
        tx: &mut dyn Transaction,
        entry: &TransactionEntry,
        ctx: &ExecutionContext<'_>,
    ) -> Result<EntryOutcome> {
        let handler = self.handlers.get(&entry.kind).ok_or_else(|| {
            BundleError::internal(format!("No handler registered for {}", entry.kind))
        })?;
        tracing::trace!(
            entry = entry.original_index,
            kind = %entry.kind,
            resource_type = %entry.resource_type,
            "Executing entry"
        );
        handler
            .execute(tx, entry, ctx)
            .await
            .map_err(|e| e.with_entry(entry.original_index))
    }
}

fn unexpected(entry: &TransactionEntry) -> BundleError {
    BundleError::internal(format!(
        "Entry {} ({} {}) reached execution as {:?}",
        entry.original_index, entry.method, entry.request_url, entry.resolution
    ))
}

/// Payload with `id` set to the identity it is written under.
fn payload_for(entry: &TransactionEntry, identity: &FhirReference) -> Result<Value> {
    let mut payload = entry.payload.clone().ok_or_else(|| {
        BundleError::invalid_request(format!(
            "Entry with method {} is missing resource",
            entry.method
        ))
    })?;
    if let Some(body) = payload.as_object_mut() {
        body.insert("id".to_string(), Value::String(identity.id.clone()));
    }
    Ok(payload)
}

/// True when two versions of a resource differ only in `meta`.
fn same_content(current: &Value, incoming: &Value) -> bool {
    fn strip(value: &Value) -> Value {
        let mut value = value.clone();
        if let Some(body) = value.as_object_mut() {
            body.remove("meta");
        }
        value
    }
    strip(current) == strip(incoming)
}

fn unresolved_target(entry: &TransactionEntry) -> BundleError {
    BundleError::not_found(entry.target_placeholder.as_deref().unwrap_or(&entry.request_url))
}

async fn create_under(
    tx: &mut dyn Transaction,
    entry: &TransactionEntry,
    identity: &FhirReference,
) -> Result<StoredResource> {
    let payload = payload_for(entry, identity)?;
    Ok(tx.create(&payload).await?)
}

struct CreateHandler;

#[async_trait]
impl EntryHandler for CreateHandler {
    fn kind(&self) -> OperationKind {
        OperationKind::Create
    }

    async fn execute(
        &self,
        tx: &mut dyn Transaction,
        entry: &TransactionEntry,
        _ctx: &ExecutionContext<'_>,
    ) -> Result<EntryOutcome> {
        match &entry.resolution {
            Resolution::Create { identity } => {
                let stored = create_under(tx, entry, identity).await?;
                Ok(EntryOutcome::created(entry.original_index, entry.kind, stored))
            }
            Resolution::Existing { identity } => {
                let stored = tx
                    .read(&identity.resource_type, &identity.id)
                    .await?
                    .ok_or_else(|| BundleError::not_found(identity))?;
                Ok(EntryOutcome::unmodified(entry.original_index, entry.kind, stored))
            }
            _ => Err(unexpected(entry)),
        }
    }
}

struct UpdateHandler;

#[async_trait]
impl EntryHandler for UpdateHandler {
    fn kind(&self) -> OperationKind {
        OperationKind::Update
    }

    async fn execute(
        &self,
        tx: &mut dyn Transaction,
        entry: &TransactionEntry,
        ctx: &ExecutionContext<'_>,
    ) -> Result<EntryOutcome> {
        let identity = match &entry.resolution {
            Resolution::Create { identity } => {
                let stored = create_under(tx, entry, identity).await?;
                return Ok(EntryOutcome::created(entry.original_index, entry.kind, stored));
            }
            Resolution::Target { identity } => identity,
            _ => return Err(unexpected(entry)),
        };

        let current = ctx
            .guard
            .check(&*tx, entry.kind, identity, entry.precondition_version.as_deref())
            .await?;
        let Some(current) = current else {
            if !ctx.settings.allow_update_create {
                return Err(BundleError::not_found(identity));
            }
            let stored = create_under(tx, entry, identity).await?;
            return Ok(EntryOutcome::created(entry.original_index, entry.kind, stored));
        };

        let payload = payload_for(entry, identity)?;
        if same_content(&current.resource, &payload) {
            tracing::debug!(identity = %identity, "Update leaves resource unchanged");
            return Ok(EntryOutcome::unmodified(entry.original_index, entry.kind, current));
        }
        let stored = tx.update(&payload, Some(&current.version_id)).await?;
        Ok(EntryOutcome::updated(entry.original_index, entry.kind, stored))
    }
}

struct PatchHandler;

#[async_trait]
impl EntryHandler for PatchHandler {
    fn kind(&self) -> OperationKind {
        OperationKind::Patch
    }

    async fn execute(
        &self,
        tx: &mut dyn Transaction,
        entry: &TransactionEntry,
        ctx: &ExecutionContext<'_>,
    ) -> Result<EntryOutcome> {
        let identity = match &entry.resolution {
            Resolution::Target { identity } => identity,
            Resolution::Unresolved => return Err(unresolved_target(entry)),
            _ => return Err(unexpected(entry)),
        };
        let document = entry
            .payload
            .as_ref()
            .ok_or_else(|| BundleError::invalid_patch("PATCH entry has no patch document"))?;
        let operations = decode_patch_document(document)?;

        let current = ctx
            .guard
            .check(&*tx, entry.kind, identity, entry.precondition_version.as_deref())
            .await?
            .ok_or_else(|| BundleError::not_found(identity))?;
        let patched = apply_json_patch(&current.resource, &operations)?;
        if same_content(&current.resource, &patched) {
            return Ok(EntryOutcome::unmodified(entry.original_index, entry.kind, current));
        }
        let stored = tx.update(&patched, Some(&current.version_id)).await?;
        Ok(EntryOutcome::updated(entry.original_index, entry.kind, stored))
    }
}

struct DeleteHandler;

#[async_trait]
impl EntryHandler for DeleteHandler {
    fn kind(&self) -> OperationKind {
        OperationKind::Delete
    }

    async fn execute(
        &self,
        tx: &mut dyn Transaction,
        entry: &TransactionEntry,
        ctx: &ExecutionContext<'_>,
    ) -> Result<EntryOutcome> {
        match &entry.resolution {
            Resolution::Target { identity } => {
                let current = ctx
                    .guard
                    .check(&*tx, entry.kind, identity, entry.precondition_version.as_deref())
                    .await?;
                if current.is_none() {
                    tracing::debug!(identity = %identity, "Delete of absent resource");
                    return Ok(EntryOutcome::deleted(entry.original_index, None));
                }
                tx.delete(&identity.resource_type, &identity.id).await?;
                Ok(EntryOutcome::deleted(entry.original_index, Some(identity.clone())))
            }
            Resolution::DeleteMany { identities } => {
                if let Some(expected) = entry.precondition_version.as_deref() {
                    for identity in identities {
                        ctx.guard.check(&*tx, entry.kind, identity, Some(expected)).await?;
                    }
                }
                for identity in identities {
                    match tx.delete(&identity.resource_type, &identity.id).await {
                        // Removed by an earlier entry of the same submission.
                        Err(StorageError::NotFound { .. }) => {}
                        other => other?,
                    }
                }
                tracing::debug!(
                    entry = entry.original_index,
                    deleted = identities.len(),
                    "Conditional delete"
                );
                let single = match identities.as_slice() {
                    [only] => Some(only.clone()),
                    _ => None,
                };
                Ok(EntryOutcome::deleted(entry.original_index, single))
            }
            Resolution::Unresolved => Ok(EntryOutcome::deleted(entry.original_index, None)),
            _ => Err(unexpected(entry)),
        }
    }
}

struct ReadHandler;

#[async_trait]
impl EntryHandler for ReadHandler {
    fn kind(&self) -> OperationKind {
        OperationKind::Read
    }

    async fn execute(
        &self,
        tx: &mut dyn Transaction,
        entry: &TransactionEntry,
        _ctx: &ExecutionContext<'_>,
    ) -> Result<EntryOutcome> {
        let identity = match &entry.resolution {
            Resolution::Target { identity } => identity,
            Resolution::Unresolved => return Err(unresolved_target(entry)),
            _ => return Err(unexpected(entry)),
        };
        let stored = tx
            .read(&identity.resource_type, &identity.id)
            .await?
            .filter(|s| identity.version.as_ref().is_none_or(|v| *v == s.version_id))
            .ok_or_else(|| BundleError::not_found(identity.to_versioned()))?;
        Ok(EntryOutcome::read(entry.original_index, stored))
    }
}

struct SearchHandler;

#[async_trait]
impl EntryHandler for SearchHandler {
    fn kind(&self) -> OperationKind {
        OperationKind::Search
    }

    async fn execute(
        &self,
        tx: &mut dyn Transaction,
        entry: &TransactionEntry,
        ctx: &ExecutionContext<'_>,
    ) -> Result<EntryOutcome> {
        let Resolution::Search { query } = &entry.resolution else {
            return Err(unexpected(entry));
        };
        let result = tx
            .search(query.resource_type(), &query.to_search_params())
            .await
            .map_err(|err| match err {
                StorageError::InvalidSearch { message } => {
                    BundleError::invalid_request(format!("Invalid search {}: {message}", query.raw()))
                }
                other => other.into(),
            })?;

        let base = ctx
            .settings
            .base_url
            .as_deref()
            .map(|b| b.trim_end_matches('/'));
        let mut searchset = Bundle::of_type("searchset");
        searchset.total = result.total;
        searchset.entry = result
            .entries
            .into_iter()
            .map(|stored| BundleEntry {
                full_url: Some(match base {
                    Some(base) => format!("{base}/{}", stored.relative_id()),
                    None => stored.relative_id(),
                }),
                resource: Some(stored.resource),
                search: Some(BundleEntrySearch {
                    mode: "match".to_string(),
                }),
                request: None,
                response: None,
            })
            .collect();
        Ok(EntryOutcome::searched(
            entry.original_index,
            searchset.to_value()?,
        ))
    }
}
