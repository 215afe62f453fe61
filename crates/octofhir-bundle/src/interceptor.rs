//! Interceptor hooks around bundle processing.
//!
//! Interceptors are called at fixed points:
//! - once per submission (`on_bundle_start`, `on_bundle_end`)
//! - once per phase (`on_phase_start`, `on_phase_end`)
//! - around every entry (`before_entry` before storage, `after_entry` after it)
//!
//! Only `before_entry` can change the result: an error there vetoes the
//! entry. Errors from every other callback are logged and ignored.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use octofhir_core::FhirReference;

use crate::bundle::BundleMode;
use crate::entry::OperationKind;
use crate::error::BundleError;
use crate::planner::Phase;
use crate::response::EntryOutcome;

/// Error type for interceptor callbacks.
#[derive(Debug, thiserror::Error)]
pub enum InterceptorError {
    /// The interceptor refuses the entry; the message is shown to the client.
    #[error("{0}")]
    Rejected(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl InterceptorError {
    pub fn rejected(msg: impl Into<String>) -> Self {
        InterceptorError::Rejected(msg.into())
    }
}

/// Submission-wide facts handed to interceptors.
#[derive(Debug, Clone, Copy)]
pub struct BundleContext {
    pub mode: BundleMode,
    pub entry_count: usize,
}

/// The entry about to be executed.
#[derive(Debug, Clone, Copy)]
pub struct EntryContext<'a> {
    pub index: usize,
    pub kind: OperationKind,
    pub resource_type: &'a str,
    /// Resolved target, when the entry operates on one identity.
    pub target: Option<&'a FhirReference>,
    /// Payload after reference rewriting.
    pub payload: Option<&'a Value>,
}

#[async_trait]
pub trait BundleInterceptor: Send + Sync {
    /// Name used in logs and veto errors.
    fn name(&self) -> &str;

    async fn on_bundle_start(&self, _ctx: &BundleContext) -> Result<(), InterceptorError> {
        Ok(())
    }

    async fn on_phase_start(&self, _phase: Phase) -> Result<(), InterceptorError> {
        Ok(())
    }

    /// Called before the entry touches storage. An error vetoes the entry.
    async fn before_entry(&self, _entry: &EntryContext<'_>) -> Result<(), InterceptorError> {
        Ok(())
    }

    async fn after_entry(
        &self,
        _entry: &EntryContext<'_>,
        _outcome: &EntryOutcome,
    ) -> Result<(), InterceptorError> {
        Ok(())
    }

    async fn on_phase_end(&self, _phase: Phase) -> Result<(), InterceptorError> {
        Ok(())
    }

    /// `committed` is false when a transaction aborted.
    async fn on_bundle_end(
        &self,
        _ctx: &BundleContext,
        _committed: bool,
    ) -> Result<(), InterceptorError> {
        Ok(())
    }
}

/// Registered interceptors, called in registration order.
#[derive(Clone, Default)]
pub struct InterceptorChain {
    interceptors: Vec<Arc<dyn BundleInterceptor>>,
}

impl std::fmt::Debug for InterceptorChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.interceptors.iter().map(|i| i.name()))
            .finish()
    }
}

fn log_failure(name: &str, callback: &'static str, err: &InterceptorError) {
    tracing::warn!(interceptor = %name, callback, error = %err, "Interceptor failed");
}

impl InterceptorChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, interceptor: Arc<dyn BundleInterceptor>) {
        tracing::debug!(interceptor = %interceptor.name(), "Registered bundle interceptor");
        self.interceptors.push(interceptor);
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    pub async fn bundle_start(&self, ctx: &BundleContext) {
        for i in &self.interceptors {
            if let Err(err) = i.on_bundle_start(ctx).await {
                log_failure(i.name(), "on_bundle_start", &err);
            }
        }
    }

    pub async fn phase_start(&self, phase: Phase) {
        for i in &self.interceptors {
            if let Err(err) = i.on_phase_start(phase).await {
                log_failure(i.name(), "on_phase_start", &err);
            }
        }
    }

    /// Stops at the first veto.
    pub async fn before_entry(&self, entry: &EntryContext<'_>) -> Result<(), BundleError> {
        for i in &self.interceptors {
            if let Err(source) = i.before_entry(entry).await {
                tracing::debug!(
                    interceptor = %i.name(),
                    entry = entry.index,
                    error = %source,
                    "Entry vetoed by interceptor"
                );
                return Err(BundleError::Interceptor {
                    name: i.name().to_string(),
                    source,
                });
            }
        }
        Ok(())
    }

    pub async fn after_entry(&self, entry: &EntryContext<'_>, outcome: &EntryOutcome) {
        for i in &self.interceptors {
            if let Err(err) = i.after_entry(entry, outcome).await {
                log_failure(i.name(), "after_entry", &err);
            }
        }
    }

    pub async fn phase_end(&self, phase: Phase) {
        for i in &self.interceptors {
            if let Err(err) = i.on_phase_end(phase).await {
                log_failure(i.name(), "on_phase_end", &err);
            }
        }
    }

    pub async fn bundle_end(&self, ctx: &BundleContext, committed: bool) {
        for i in &self.interceptors {
            if let Err(err) = i.on_bundle_end(ctx, committed).await {
                log_failure(i.name(), "on_bundle_end", &err);
            }
        }
    }
}
