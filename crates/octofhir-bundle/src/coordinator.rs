//! Transaction and batch processing.
//!
//! A transaction runs every entry inside one storage transaction and either
//! commits all of it or none of it. A batch runs each entry in its own
//! storage transaction and reports failures per entry.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use tracing::Instrument;

use octofhir_search::SearchParameterRegistry;
use octofhir_storage::{FhirStorage, Transaction};

use crate::bundle::{Bundle, BundleMode};
use crate::config::{EngineConfig, PreferReturn, TransactionSettings};
use crate::entry::{OperationKind, TransactionEntry, parse_entries};
use crate::error::{BundleError, Result};
use crate::executor::{EntryHandler, ExecutionContext, HandlerTable};
use crate::interceptor::{BundleContext, BundleInterceptor, EntryContext, InterceptorChain};
use crate::matcher::ConditionalMatcher;
use crate::planner::{
    ExecutionPlan, Phase, check_duplicate_full_urls, check_duplicate_targets, check_resolved_targets,
};
use crate::resolver::{EntryResolver, check_batch_independence};
use crate::response::{BundleResponse, EntryOutcome, ResponseAssembler, ResponseStatus, operation_outcome};

/// Lifecycle of one submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Received,
    GraphResolved,
    Planned,
    Executing(Phase),
    Committed,
    Aborted,
}

impl CoordinatorState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Committed | Self::Aborted)
    }

    pub fn can_advance_to(self, next: Self) -> bool {
        use CoordinatorState::*;
        match (self, next) {
            (Committed | Aborted, _) => false,
            (_, Aborted) => true,
            (Received, GraphResolved) | (GraphResolved, Planned) => true,
            (Planned, Executing(_) | Committed) => true,
            (Executing(current), Executing(next)) => next > current,
            (Executing(_), Committed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Received => write!(f, "received"),
            Self::GraphResolved => write!(f, "graph_resolved"),
            Self::Planned => write!(f, "planned"),
            Self::Executing(phase) => write!(f, "executing({phase})"),
            Self::Committed => write!(f, "committed"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

struct Lifecycle {
    mode: BundleMode,
    state: CoordinatorState,
}

impl Lifecycle {
    fn new(mode: BundleMode) -> Self {
        Self {
            mode,
            state: CoordinatorState::Received,
        }
    }

    fn advance(&mut self, next: CoordinatorState) -> Result<()> {
        if !self.state.can_advance_to(next) {
            return Err(BundleError::internal(format!(
                "Invalid {} state transition {} -> {next}",
                self.mode, self.state
            )));
        }
        tracing::debug!(mode = %self.mode, from = %self.state, to = %next, "State transition");
        self.state = next;
        Ok(())
    }

    fn abort(&mut self, err: &BundleError) {
        tracing::warn!(
            mode = %self.mode,
            from = %self.state,
            entry = ?err.entry_index(),
            kind = %err.kind(),
            error = %err,
            "Bundle aborted"
        );
        self.state = CoordinatorState::Aborted;
    }
}

/// Processes transaction and batch bundles against a storage backend.
pub struct TransactionCoordinator {
    storage: Arc<dyn FhirStorage>,
    matcher: ConditionalMatcher,
    settings: TransactionSettings,
    handlers: HandlerTable,
    interceptors: InterceptorChain,
}

impl TransactionCoordinator {
    pub fn new(
        storage: Arc<dyn FhirStorage>,
        registry: Arc<SearchParameterRegistry>,
        config: &EngineConfig,
    ) -> Self {
        tracing::info!(
            backend = storage.backend_name(),
            allow_multiple_delete = config.transaction.allow_multiple_delete,
            allow_update_create = config.transaction.allow_update_create,
            "Bundle coordinator created"
        );
        Self {
            storage,
            matcher: ConditionalMatcher::new(registry),
            settings: config.transaction.clone(),
            handlers: HandlerTable::standard(),
            interceptors: InterceptorChain::new(),
        }
    }

    #[must_use]
    pub fn with_interceptor(mut self, interceptor: Arc<dyn BundleInterceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    /// Replaces the handler for one operation kind.
    #[must_use]
    pub fn with_handler(mut self, handler: Arc<dyn EntryHandler>) -> Self {
        self.handlers.register(handler);
        self
    }

    pub fn settings(&self) -> &TransactionSettings {
        &self.settings
    }

    pub async fn process(&self, bundle: Value) -> Result<BundleResponse> {
        self.process_with_prefer(bundle, None).await
    }

    /// Processes `bundle`; `prefer` overrides the configured `Prefer: return=`.
    pub async fn process_with_prefer(
        &self,
        bundle: Value,
        prefer: Option<PreferReturn>,
    ) -> Result<BundleResponse> {
        let bundle = Bundle::from_value(bundle)?;
        let mode = BundleMode::for_bundle_type(
            bundle.bundle_type.as_deref(),
            self.settings.collection_as_batch,
        )?;
        let max = self.settings.max_entries;
        if max > 0 && bundle.entry.len() > max {
            return Err(BundleError::invalid_request(format!(
                "Bundle contains {} entries, more than the maximum of {max}",
                bundle.entry.len()
            )));
        }
        if !self.storage.supports_transactions() {
            return Err(BundleError::internal(format!(
                "Storage backend {} does not support transactions",
                self.storage.backend_name()
            )));
        }

        let assembler = ResponseAssembler::new(
            self.settings.base_url.clone(),
            prefer.unwrap_or(self.settings.prefer_return),
        );
        let ctx = BundleContext {
            mode,
            entry_count: bundle.entry.len(),
        };
        let span = tracing::info_span!("bundle", mode = %mode, entries = ctx.entry_count);
        async {
            match mode {
                BundleMode::Transaction => self.run_transaction(&bundle, ctx, &assembler).await,
                BundleMode::Batch => self.run_batch(&bundle, ctx, &assembler).await,
            }
        }
        .instrument(span)
        .await
    }

    /// Like [`process_with_prefer`](Self::process_with_prefer), rendering a
    /// failed submission as an OperationOutcome.
    pub async fn process_to_json(
        &self,
        bundle: Value,
        prefer: Option<PreferReturn>,
    ) -> (ResponseStatus, Value) {
        let rendered = match self.process_with_prefer(bundle, prefer).await {
            Ok(response) => response.to_value(),
            Err(err) => Err(err),
        };
        match rendered {
            Ok(value) => (ResponseStatus::Ok, value),
            Err(err) => (err.status(), operation_outcome(&err)),
        }
    }

    async fn run_transaction(
        &self,
        bundle: &Bundle,
        ctx: BundleContext,
        assembler: &ResponseAssembler,
    ) -> Result<BundleResponse> {
        let mut lifecycle = Lifecycle::new(ctx.mode);

        let mut entries = match self.parse_transaction(bundle) {
            Ok(entries) => entries,
            Err(err) => {
                lifecycle.abort(&err);
                return Err(err);
            }
        };

        self.interceptors.bundle_start(&ctx).await;
        let mut tx = match self.storage.begin_transaction().await {
            Ok(tx) => tx,
            Err(err) => {
                let err = BundleError::from(err);
                lifecycle.abort(&err);
                self.interceptors.bundle_end(&ctx, false).await;
                return Err(err);
            }
        };

        let executed = self
            .execute_transaction(tx.as_mut(), &mut entries, &mut lifecycle)
            .await;
        let outcomes = match executed {
            Ok(outcomes) => outcomes,
            Err(err) => {
                lifecycle.abort(&err);
                if let Err(rollback) = tx.rollback().await {
                    tracing::warn!(error = %rollback, "Rollback failed");
                }
                self.interceptors.bundle_end(&ctx, false).await;
                return Err(err);
            }
        };

        if let Err(err) = tx.commit().await {
            let err = BundleError::from(err);
            lifecycle.abort(&err);
            self.interceptors.bundle_end(&ctx, false).await;
            return Err(err);
        }
        lifecycle.advance(CoordinatorState::Committed)?;
        self.interceptors.bundle_end(&ctx, true).await;
        tracing::info!(entries = ctx.entry_count, "Transaction committed");

        assembler.assemble(ctx.mode, outcomes, ctx.entry_count)
    }

    /// Structural checks. Nothing here touches storage.
    fn parse_transaction(&self, bundle: &Bundle) -> Result<Vec<TransactionEntry>> {
        let entries = parse_entries(&bundle.entry, self.matcher.registry())
            .into_iter()
            .collect::<Result<Vec<_>>>()?;
        check_duplicate_full_urls(&entries)?;
        check_duplicate_targets(&entries)?;
        Ok(entries)
    }

    async fn execute_transaction(
        &self,
        tx: &mut dyn Transaction,
        entries: &mut [TransactionEntry],
        lifecycle: &mut Lifecycle,
    ) -> Result<Vec<EntryOutcome>> {
        let resolver = EntryResolver::new(&self.matcher, &self.settings);
        let mut arena = resolver.resolve_deletes(&*tx, entries).await?;
        check_resolved_targets(entries.iter())?;
        lifecycle.advance(CoordinatorState::GraphResolved)?;

        let plan = self.plan(entries.iter().enumerate());
        lifecycle.advance(CoordinatorState::Planned)?;

        let exec = ExecutionContext::new(&self.settings);
        let mut outcomes = Vec::with_capacity(entries.len());
        let mut deletes_only = true;
        for group in plan.groups() {
            // Conditional creates, updates and patches match against storage
            // as it stands after the deletes.
            if deletes_only
                && group
                    .entries
                    .iter()
                    .any(|&pos| entries[pos].kind != OperationKind::Delete)
            {
                resolver.resolve_remaining(&*tx, entries, &mut arena).await?;
                check_resolved_targets(entries.iter())?;
                deletes_only = false;
            }
            lifecycle.advance(CoordinatorState::Executing(group.phase))?;
            self.interceptors.phase_start(group.phase).await;

            for &pos in &group.entries {
                let entry = &entries[pos];
                let outcome = match self.run_entry(tx, entry, &exec).await {
                    Ok(outcome) => outcome,
                    // A missing read target is reported, not fatal.
                    Err(err) if !entry.kind.is_mutating() && err.is_not_found() => {
                        EntryOutcome::failed(entry.original_index, entry.kind, err)
                    }
                    Err(err) => return Err(err),
                };
                outcomes.push(outcome);
            }

            if group.phase == Phase::Mutate {
                self.verify_unique_matches(&*tx, entries.iter()).await?;
            }
            self.interceptors.phase_end(group.phase).await;
        }
        Ok(outcomes)
    }

    async fn run_batch(
        &self,
        bundle: &Bundle,
        ctx: BundleContext,
        assembler: &ResponseAssembler,
    ) -> Result<BundleResponse> {
        let mut lifecycle = Lifecycle::new(ctx.mode);
        let parsed = parse_entries(&bundle.entry, self.matcher.registry());

        let valid: Vec<&TransactionEntry> = parsed.iter().filter_map(|r| r.as_ref().ok()).collect();
        let mut independence = check_batch_independence(&valid).into_iter();

        let mut outcomes = Vec::with_capacity(parsed.len());
        let mut runnable = Vec::new();
        for (index, result) in parsed.into_iter().enumerate() {
            match result {
                Ok(entry) => match independence.next().flatten() {
                    Some(err) => outcomes.push(EntryOutcome::failed(
                        index,
                        entry.kind,
                        err.with_entry(index),
                    )),
                    None => runnable.push(entry),
                },
                Err(err) => {
                    tracing::debug!(entry = index, error = %err, "Batch entry rejected");
                    outcomes.push(EntryOutcome::failed(
                        index,
                        OperationKind::Read,
                        err,
                    ));
                }
            }
        }
        lifecycle.advance(CoordinatorState::GraphResolved)?;

        let plan = self.plan(runnable.iter().enumerate());
        lifecycle.advance(CoordinatorState::Planned)?;

        self.interceptors.bundle_start(&ctx).await;
        let exec = ExecutionContext::new(&self.settings);
        for group in plan.groups() {
            lifecycle.advance(CoordinatorState::Executing(group.phase))?;
            self.interceptors.phase_start(group.phase).await;
            for &pos in &group.entries {
                let entry = &mut runnable[pos];
                let outcome = match self.run_batch_entry(entry, &exec).await {
                    Ok(outcome) => outcome,
                    Err(err) => {
                        tracing::debug!(entry = entry.original_index, error = %err, "Batch entry failed");
                        EntryOutcome::failed(entry.original_index, entry.kind, err)
                    }
                };
                outcomes.push(outcome);
            }
            self.interceptors.phase_end(group.phase).await;
        }

        lifecycle.advance(CoordinatorState::Committed)?;
        self.interceptors.bundle_end(&ctx, true).await;
        let response = assembler.assemble(ctx.mode, outcomes, ctx.entry_count)?;
        tracing::info!(statuses = ?summarize(&response), "Batch processed");
        Ok(response)
    }

    /// One batch entry in its own storage transaction.
    async fn run_batch_entry(
        &self,
        entry: &mut TransactionEntry,
        exec: &ExecutionContext<'_>,
    ) -> Result<EntryOutcome> {
        let mut tx = self.storage.begin_transaction().await?;
        match self.execute_batch_entry(tx.as_mut(), entry, exec).await {
            Ok(outcome) => {
                tx.commit()
                    .await
                    .map_err(|e| BundleError::from(e).with_entry(entry.original_index))?;
                Ok(outcome)
            }
            Err(err) => {
                if let Err(rollback) = tx.rollback().await {
                    tracing::warn!(entry = entry.original_index, error = %rollback, "Rollback failed");
                }
                Err(err)
            }
        }
    }

    async fn execute_batch_entry(
        &self,
        tx: &mut dyn Transaction,
        entry: &mut TransactionEntry,
        exec: &ExecutionContext<'_>,
    ) -> Result<EntryOutcome> {
        EntryResolver::new(&self.matcher, &self.settings)
            .resolve(&*tx, std::slice::from_mut(entry))
            .await?;
        let outcome = self.run_entry(tx, entry, exec).await?;
        self.verify_unique_matches(&*tx, std::iter::once(&*entry))
            .await?;
        Ok(outcome)
    }

    fn plan<'e>(&self, entries: impl Iterator<Item = (usize, &'e TransactionEntry)>) -> ExecutionPlan {
        ExecutionPlan::from_phases(entries.map(|(pos, e)| (pos, self.handlers.phase_of(e.kind))))
    }

    /// Interceptors around one handler call.
    async fn run_entry(
        &self,
        tx: &mut dyn Transaction,
        entry: &TransactionEntry,
        exec: &ExecutionContext<'_>,
    ) -> Result<EntryOutcome> {
        let ctx = EntryContext {
            index: entry.original_index,
            kind: entry.kind,
            resource_type: &entry.resource_type,
            target: entry.resolved_identity(),
            payload: entry.payload.as_ref(),
        };
        self.interceptors
            .before_entry(&ctx)
            .await
            .map_err(|e| e.with_entry(entry.original_index))?;
        let outcome = self.handlers.execute(tx, entry, exec).await?;
        self.interceptors.after_entry(&ctx, &outcome).await;
        Ok(outcome)
    }

    /// Re-runs If-None-Exist and conditional update criteria after the writes.
    ///
    /// A criterion that now matches more than one resource means the
    /// submission created a duplicate.
    async fn verify_unique_matches<'e>(
        &self,
        tx: &dyn Transaction,
        entries: impl Iterator<Item = &'e TransactionEntry>,
    ) -> Result<()> {
        let mut checked = HashSet::new();
        for entry in entries {
            let Some(criterion) = &entry.resolved_criterion else {
                continue;
            };
            if !checked.insert(criterion.canonical()) {
                continue;
            }
            let matches = self
                .matcher
                .find_matching(tx, criterion)
                .await
                .map_err(|e| e.with_entry(entry.original_index))?;
            if matches.len() > 1 {
                return Err(BundleError::DuplicateMatchAfterWrite {
                    url: criterion.raw().to_string(),
                }
                .with_entry(entry.original_index));
            }
        }
        Ok(())
    }
}

/// Counts outcomes by status line, for logging.
pub fn summarize(response: &BundleResponse) -> HashMap<String, usize> {
    let mut counts = HashMap::new();
    for status in response.statuses() {
        *counts.entry(status.to_string()).or_insert(0) += 1;
    }
    counts
}
