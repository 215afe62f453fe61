//! Entry graph resolution.
//!
//! Identities live in an [`IdentityArena`] keyed by the text entries use to
//! refer to each other (placeholders and literal `fullUrl`s). Resolution runs
//! in two stages so that conditional matching for creates, updates and
//! patches observes the deletes of the same transaction:
//!
//! 1. [`EntryResolver::resolve_deletes`] assigns plain identities and the
//!    matches of conditional deletes;
//! 2. [`EntryResolver::resolve_remaining`] assigns the remaining conditional
//!    and placeholder-addressed entries, then rewrites payload references
//!    through the finished arena.
//!
//! Nothing is persisted here, so reference cycles need no special handling.

use std::collections::{HashMap, HashSet};

use indexmap::IndexMap;
use serde_json::Value;

use octofhir_core::{FhirReference, conditional_reference, generate_id, parse_placeholder};
use octofhir_search::MatchUrl;
use octofhir_storage::Transaction;

use crate::config::TransactionSettings;
use crate::entry::{OperationKind, Resolution, SelfIdentity, TransactionEntry};
use crate::error::{BundleError, Result};
use crate::matcher::{ConditionalMatcher, CreateMatch};

/// Identities assigned within one submission.
#[derive(Debug, Default, Clone)]
pub struct IdentityArena {
    slots: Vec<FhirReference>,
    /// Keys in binding order.
    by_key: IndexMap<String, usize>,
    by_identity: HashMap<String, usize>,
}

impl IdentityArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `key` to `identity`. A key keeps its first binding.
    pub fn bind(&mut self, key: impl Into<String>, identity: &FhirReference) -> usize {
        let relative = identity.to_relative();
        let slot = match self.by_identity.get(&relative) {
            Some(slot) => *slot,
            None => {
                self.slots.push(identity.unversioned());
                let slot = self.slots.len() - 1;
                self.by_identity.insert(relative, slot);
                slot
            }
        };
        *self.by_key.entry(key.into()).or_insert(slot)
    }

    pub fn get(&self, key: &str) -> Option<&FhirReference> {
        self.by_key.get(key).map(|slot| &self.slots[*slot])
    }

    pub fn contains(&self, key: &str) -> bool {
        self.by_key.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.by_key.keys().map(String::as_str)
    }

    /// Number of bound keys.
    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }
}

/// Assigns identities and rewrites references for one unit of work.
pub struct EntryResolver<'a> {
    matcher: &'a ConditionalMatcher,
    settings: &'a TransactionSettings,
}

impl<'a> EntryResolver<'a> {
    pub fn new(matcher: &'a ConditionalMatcher, settings: &'a TransactionSettings) -> Self {
        Self { matcher, settings }
    }

    /// Resolves `entries` in place. Conditional criteria are evaluated through `tx`.
    pub async fn resolve(
        &self,
        tx: &dyn Transaction,
        entries: &mut [TransactionEntry],
    ) -> Result<IdentityArena> {
        let mut arena = self.resolve_deletes(tx, entries).await?;
        self.resolve_remaining(tx, entries, &mut arena).await?;
        Ok(arena)
    }

    /// First stage: identities known without a query, plus the matches of
    /// conditional deletes. Everything else waits until deletes have run.
    pub async fn resolve_deletes(
        &self,
        tx: &dyn Transaction,
        entries: &mut [TransactionEntry],
    ) -> Result<IdentityArena> {
        let mut arena = IdentityArena::new();
        for entry in entries.iter_mut() {
            assign_direct(entry);
            bind_self(entry, &mut arena);
        }

        for entry in entries.iter_mut().filter(|e| e.kind == OperationKind::Delete) {
            let index = entry.original_index;
            if entry.is_conditional() {
                self.assign_conditional(tx, entry, &arena, &mut HashMap::new())
                    .await
                    .map_err(|e| e.with_entry(index))?;
            }
            if entry.target_placeholder.is_some() {
                assign_placeholder_target(entry, &mut arena).map_err(|e| e.with_entry(index))?;
            }
        }
        Ok(arena)
    }

    /// Second stage: conditional creates, updates and patches, placeholder
    /// targets, search criteria and payload references. Matching here sees
    /// whatever `tx` holds at the time, including executed deletes.
    pub async fn resolve_remaining(
        &self,
        tx: &dyn Transaction,
        entries: &mut [TransactionEntry],
        arena: &mut IdentityArena,
    ) -> Result<()> {
        // Canonical If-None-Exist criterion -> identity it produced.
        let mut guards: HashMap<String, FhirReference> = HashMap::new();

        for entry in entries.iter_mut() {
            if entry.kind == OperationKind::Delete
                || (!entry.is_conditional() && entry.create_guard.is_none())
            {
                continue;
            }
            let index = entry.original_index;
            self.assign_conditional(tx, entry, arena, &mut guards)
                .await
                .map_err(|e| e.with_entry(index))?;
            bind_self(entry, arena);
        }

        for entry in entries.iter_mut() {
            if entry.kind != OperationKind::Delete && entry.target_placeholder.is_some() {
                assign_placeholder_target(entry, arena)
                    .map_err(|e| e.with_entry(entry.original_index))?;
                bind_self(entry, arena);
            }
            if entry.kind == OperationKind::Search
                && let Some(query) = &entry.criterion
            {
                entry.resolution = Resolution::Search {
                    query: substitute(query, arena),
                };
            }
        }

        tracing::debug!(
            entries = entries.len(),
            identities = arena.len(),
            "Assigned entry identities"
        );

        let conditional = self
            .resolve_conditional_references(tx, entries, arena, &guards)
            .await?;
        for entry in entries.iter_mut() {
            if entry.kind == OperationKind::Patch {
                continue;
            }
            if let Some(payload) = entry.payload.as_mut() {
                rewrite_value(payload, None, arena, &conditional)
                    .map_err(|e| e.with_entry(entry.original_index))?;
            }
        }
        Ok(())
    }

    async fn assign_conditional(
        &self,
        tx: &dyn Transaction,
        entry: &mut TransactionEntry,
        arena: &IdentityArena,
        guards: &mut HashMap<String, FhirReference>,
    ) -> Result<()> {
        match entry.kind {
            OperationKind::Create => {
                let Some(guard) = &entry.create_guard else {
                    return Ok(());
                };
                let criterion = substitute(guard, arena);
                let canonical = criterion.canonical();
                let resolution = match guards.get(&canonical) {
                    Some(identity) => {
                        tracing::debug!(
                            entry = entry.original_index,
                            criterion = %criterion,
                            "Folding duplicate conditional create"
                        );
                        Resolution::Existing {
                            identity: identity.clone(),
                        }
                    }
                    None => match self.matcher.match_for_create(tx, &criterion).await? {
                        CreateMatch::Absent => Resolution::Create {
                            identity: FhirReference::new(&entry.resource_type, generate_id()),
                        },
                        CreateMatch::Existing(stored) => Resolution::Existing {
                            identity: FhirReference::new(&stored.resource_type, &stored.id),
                        },
                    },
                };
                if let Some(identity) = resolution_identity(&resolution) {
                    guards.entry(canonical).or_insert_with(|| identity.clone());
                }
                entry.resolution = resolution;
                entry.resolved_criterion = Some(criterion);
            }
            OperationKind::Update => {
                let criterion = resolved_criterion(entry, arena)?;
                entry.resolution = match self.matcher.match_for_update(tx, &criterion).await? {
                    Some(stored) => {
                        let identity = FhirReference::new(&stored.resource_type, &stored.id);
                        align_payload_id(entry, &identity, &criterion)?;
                        Resolution::Target { identity }
                    }
                    None => {
                        let client_id = entry
                            .payload
                            .as_ref()
                            .and_then(|p| p.get("id"))
                            .and_then(Value::as_str)
                            .filter(|_| self.settings.allow_update_create)
                            .map(str::to_string);
                        Resolution::Create {
                            identity: FhirReference::new(
                                &entry.resource_type,
                                client_id.unwrap_or_else(generate_id),
                            ),
                        }
                    }
                };
                entry.resolved_criterion = Some(criterion);
            }
            OperationKind::Patch => {
                let criterion = resolved_criterion(entry, arena)?;
                let stored = self.matcher.match_for_patch(tx, &criterion).await?;
                entry.resolution = Resolution::Target {
                    identity: FhirReference::new(&stored.resource_type, &stored.id),
                };
            }
            OperationKind::Delete => {
                let criterion = resolved_criterion(entry, arena)?;
                let matches = self
                    .matcher
                    .match_for_delete(tx, &criterion, self.settings.allow_multiple_delete)
                    .await?;
                entry.resolution = Resolution::DeleteMany {
                    identities: matches
                        .iter()
                        .map(|s| FhirReference::new(&s.resource_type, &s.id))
                        .collect(),
                };
            }
            OperationKind::Read | OperationKind::Search => {}
        }
        Ok(())
    }

    async fn resolve_conditional_references(
        &self,
        tx: &dyn Transaction,
        entries: &[TransactionEntry],
        arena: &IdentityArena,
        guards: &HashMap<String, FhirReference>,
    ) -> Result<HashMap<String, String>> {
        let mut resolved = HashMap::new();
        for entry in entries {
            let Some(payload) = entry.payload.as_ref().filter(|_| entry.kind != OperationKind::Patch)
            else {
                continue;
            };
            let mut found = Vec::new();
            collect_references(payload, &mut found);
            for raw in found {
                if resolved.contains_key(raw) || conditional_reference(raw).is_none() {
                    continue;
                }
                let target = self
                    .resolve_conditional_reference(tx, raw, arena, guards)
                    .await
                    .map_err(|e| e.with_entry(entry.original_index))?;
                resolved.insert(raw.to_string(), target.to_relative());
            }
        }
        Ok(resolved)
    }

    async fn resolve_conditional_reference(
        &self,
        tx: &dyn Transaction,
        raw: &str,
        arena: &IdentityArena,
        guards: &HashMap<String, FhirReference>,
    ) -> Result<FhirReference> {
        let criterion = MatchUrl::parse_criterion(raw, None, self.matcher.registry())?;
        let criterion = substitute(&criterion, arena);
        if let Some(identity) = guards.get(&criterion.canonical()) {
            return Ok(identity.clone());
        }
        let identity = self.matcher.match_for_reference(tx, &criterion).await?;
        tracing::debug!(reference = raw, resolved = %identity, "Resolved conditional reference");
        Ok(identity)
    }
}

/// Entries whose identity is known without a query.
fn assign_direct(entry: &mut TransactionEntry) {
    entry.resolution = match entry.kind {
        OperationKind::Create if entry.create_guard.is_none() => Resolution::Create {
            identity: FhirReference::new(&entry.resource_type, generate_id()),
        },
        OperationKind::Create | OperationKind::Search => return,
        _ => match &entry.target {
            Some(target) => Resolution::Target {
                identity: target.clone(),
            },
            None => return,
        },
    };
}

/// `PUT urn:uuid:...` and friends: target the identity the placeholder was given.
///
/// An unbound placeholder on an update creates a new resource; on other
/// operations the entry stays unresolved and reports not-found when executed.
fn assign_placeholder_target(entry: &mut TransactionEntry, arena: &mut IdentityArena) -> Result<()> {
    let Some(raw) = entry.target_placeholder.clone() else {
        return Ok(());
    };
    match arena.get(&raw).cloned() {
        Some(identity) => {
            if entry.kind == OperationKind::Update && entry.resource_type != identity.resource_type {
                return Err(BundleError::invalid_request(format!(
                    "Resource type {} in entry does not match {raw} ({})",
                    entry.resource_type, identity.resource_type
                )));
            }
            entry.resource_type = identity.resource_type.clone();
            entry.resolution = Resolution::Target { identity };
        }
        None if entry.kind == OperationKind::Update => {
            let identity = FhirReference::new(&entry.resource_type, generate_id());
            arena.bind(raw, &identity);
            entry.resolution = Resolution::Create { identity };
        }
        None => {}
    }
    Ok(())
}

fn bind_self(entry: &TransactionEntry, arena: &mut IdentityArena) {
    let (Some(self_identity), Some(identity)) = (&entry.self_identity, entry.resolved_identity())
    else {
        return;
    };
    match self_identity {
        SelfIdentity::Placeholder(raw) => {
            arena.bind(raw.clone(), identity);
        }
        SelfIdentity::Literal { url, identity: declared } => {
            arena.bind(url.clone(), identity);
            if declared.to_relative() != identity.to_relative() {
                arena.bind(declared.to_relative(), identity);
            }
        }
    }
}

fn resolution_identity(resolution: &Resolution) -> Option<&FhirReference> {
    match resolution {
        Resolution::Create { identity } | Resolution::Existing { identity } => Some(identity),
        _ => None,
    }
}

fn resolved_criterion(entry: &TransactionEntry, arena: &IdentityArena) -> Result<MatchUrl> {
    entry
        .criterion
        .as_ref()
        .map(|c| substitute(c, arena))
        .ok_or_else(|| BundleError::internal("Conditional entry has no criterion"))
}

/// Replaces placeholder values in a criterion with the identities they resolved to.
fn substitute(criterion: &MatchUrl, arena: &IdentityArena) -> MatchUrl {
    criterion.substitute(|value| arena.get(value).map(FhirReference::to_relative))
}

fn align_payload_id(
    entry: &mut TransactionEntry,
    identity: &FhirReference,
    criterion: &MatchUrl,
) -> Result<()> {
    let Some(body) = entry.payload.as_mut().and_then(Value::as_object_mut) else {
        return Ok(());
    };
    match body.get("id").and_then(Value::as_str) {
        Some(id) if id != identity.id => Err(BundleError::invalid_request(format!(
            "Resource id {id} does not match {identity} found by match URL \"{}\"",
            criterion.raw()
        ))),
        Some(_) => Ok(()),
        None => {
            body.insert("id".to_string(), Value::String(identity.id.clone()));
            Ok(())
        }
    }
}

/// Every string held by a `reference` element.
fn collect_references<'v>(value: &'v Value, out: &mut Vec<&'v str>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                match (key.as_str(), child) {
                    ("reference", Value::String(s)) => out.push(s),
                    _ => collect_references(child, out),
                }
            }
        }
        Value::Array(items) => items.iter().for_each(|v| collect_references(v, out)),
        _ => {}
    }
}

fn rewrite_value(
    value: &mut Value,
    key: Option<&str>,
    arena: &IdentityArena,
    conditional: &HashMap<String, String>,
) -> Result<()> {
    match value {
        Value::Object(map) => {
            for (child_key, child) in map.iter_mut() {
                if child_key == "resourceType" {
                    continue;
                }
                rewrite_value(child, Some(child_key), arena, conditional)?;
            }
        }
        Value::Array(items) => {
            for item in items {
                rewrite_value(item, key, arena, conditional)?;
            }
        }
        Value::String(text) => {
            if key == Some("reference")
                && let Some(target) = conditional.get(text.as_str())
            {
                *text = target.clone();
            } else if let Some(rewritten) = rewrite_text(text, key, arena)? {
                *text = rewritten;
            }
        }
        _ => {}
    }
    Ok(())
}

fn rewrite_text(text: &str, key: Option<&str>, arena: &IdentityArena) -> Result<Option<String>> {
    if let Some(identity) = arena.get(text) {
        return Ok(Some(identity.to_relative()));
    }
    if let Some((base, fragment)) = text.split_once('#')
        && let Some(identity) = arena.get(base)
    {
        return Ok(Some(format!("{}#{fragment}", identity.to_relative())));
    }

    match key {
        Some("div") => {
            let mut rewritten = text.to_string();
            for placeholder in arena.keys() {
                if rewritten.contains(placeholder)
                    && let Some(identity) = arena.get(placeholder)
                {
                    rewritten = rewritten.replace(placeholder, &identity.to_relative());
                }
            }
            Ok((rewritten != text).then_some(rewritten))
        }
        Some("reference") => {
            let base = text.split('#').next().unwrap_or(text);
            match parse_placeholder(base) {
                Ok(Some(_)) => Err(BundleError::invalid_request(format!(
                    "Unable to satisfy placeholder ID {base} found in element named 'reference'"
                ))),
                Ok(None) => Ok(None),
                Err(_) => Err(BundleError::invalid_placeholder(base)),
            }
        }
        _ => Ok(None),
    }
}

/// Batch entries must stand alone.
///
/// Returns, per entry, the error that keeps it from running: a reference to
/// another entry's placeholder, or a second change interaction on the same
/// identity.
pub fn check_batch_independence(entries: &[&TransactionEntry]) -> Vec<Option<BundleError>> {
    let mut owners: HashMap<&str, usize> = HashMap::new();
    for entry in entries {
        if entry.kind == OperationKind::Create
            && let Some(self_identity) = &entry.self_identity
        {
            owners.insert(self_identity.key(), entry.original_index);
        }
    }

    let mut targets: HashMap<String, usize> = HashMap::new();
    for entry in entries {
        if let Some(key) = entry.literal_target_key() {
            *targets.entry(key).or_default() += 1;
        }
    }
    let contested: HashSet<String> = targets
        .into_iter()
        .filter(|(_, count)| *count > 1)
        .map(|(key, _)| key)
        .collect();

    entries
        .iter()
        .map(|entry| {
            if let Some(key) = entry.literal_target_key()
                && contested.contains(&key)
            {
                return Some(BundleError::invalid_request(format!(
                    "Batch interdependency detected: multiple change interactions target {key}"
                )));
            }

            let payload = entry.payload.as_ref()?;
            let mut found = Vec::new();
            collect_references(payload, &mut found);
            let crosses = found.iter().any(|raw| {
                let base = raw.split('#').next().unwrap_or(raw);
                owners
                    .get(base)
                    .is_some_and(|owner| *owner != entry.original_index)
            });
            crosses.then(|| {
                BundleError::invalid_request(
                    "References between resources in a batch are non-conformant (no resolution)",
                )
            })
        })
        .collect()
}
