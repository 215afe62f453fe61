//! Process-scoped search parameter registry.
//!
//! Built once and handed to the parser and to storage backends. It changes
//! only through [`register`](SearchParameterRegistry::register),
//! [`refresh`](SearchParameterRegistry::refresh) and
//! [`invalidate_type`](SearchParameterRegistry::invalidate_type).

use std::sync::Arc;

use dashmap::DashMap;

use crate::common::{register_clinical_parameters, register_common_parameters};
use crate::parameters::SearchParameter;

type TypeCode = (String, String);

#[derive(Debug, Default)]
pub struct SearchParameterRegistry {
    by_type: DashMap<TypeCode, Arc<SearchParameter>>,
    /// Parameters valid on every resource type, keyed by code.
    common: DashMap<String, Arc<SearchParameter>>,
    /// Every definition once, keyed by canonical URL.
    definitions: DashMap<String, Arc<SearchParameter>>,
}

impl SearchParameterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in resource-level and clinical parameters.
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        register_common_parameters(&registry);
        register_clinical_parameters(&registry);
        registry
    }

    /// Adds `param`, replacing any definition with the same URL or the same
    /// (type, code).
    pub fn register(&self, param: SearchParameter) {
        let param = Arc::new(param);
        if param.is_common() {
            self.common.insert(param.code.clone(), Arc::clone(&param));
        }
        for base in &param.base {
            self.by_type
                .insert((base.clone(), param.code.clone()), Arc::clone(&param));
        }
        self.definitions.insert(param.url.clone(), param);
    }

    /// Swaps in a new parameter set.
    ///
    /// Not atomic for concurrent readers; refresh between submissions.
    pub fn refresh(&self, params: impl IntoIterator<Item = SearchParameter>) {
        self.by_type.clear();
        self.common.clear();
        self.definitions.clear();
        for param in params {
            self.register(param);
        }
        tracing::info!(count = self.len(), "search parameter registry refreshed");
    }

    /// Forgets the parameters declared for `resource_type`. Common parameters
    /// still apply to it afterwards. Returns how many were dropped.
    pub fn invalidate_type(&self, resource_type: &str) -> usize {
        let mut removed = 0;
        self.by_type.retain(|(rt, _), param| {
            if rt != resource_type {
                return true;
            }
            removed += 1;
            if param.base.iter().all(|b| b == resource_type) {
                self.definitions.remove(&param.url);
            }
            false
        });
        tracing::debug!(resource_type, removed, "search parameters invalidated");
        removed
    }

    /// Type-specific definition first, then a common one.
    pub fn get(&self, resource_type: &str, code: &str) -> Option<Arc<SearchParameter>> {
        self.by_type
            .get(&(resource_type.to_string(), code.to_string()))
            .map(|p| Arc::clone(p.value()))
            .or_else(|| self.common.get(code).map(|p| Arc::clone(p.value())))
    }

    pub fn has_parameter(&self, resource_type: &str, code: &str) -> bool {
        self.get(resource_type, code).is_some()
    }

    /// Distinct definitions held.
    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}
