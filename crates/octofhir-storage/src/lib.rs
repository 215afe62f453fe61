//! Backend contract for the bundle engine.
//!
//! [`FhirStorage`] is the shared store; [`Transaction`] is a unit of work
//! opened on it whose reads observe its own writes. `octofhir-db-memory`
//! provides the in-process implementation.

mod error;
mod traits;
mod types;

pub use error::{ErrorCategory, StorageError};
pub use traits::{FhirStorage, Transaction};
pub use types::{SearchClause, SearchParams, SearchResult, StoredResource};

pub type StorageResult<T> = Result<T, StorageError>;
