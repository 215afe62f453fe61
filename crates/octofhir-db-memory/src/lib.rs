//! In-process transactional backend.
//!
//! Resources live in a papaya map keyed by `Type/id`. An [`InMemoryTransaction`]
//! stages writes in an overlay and applies them together at commit, after
//! checking that nothing it read has moved on since.
//!
//! ```ignore
//! let storage = InMemoryStorage::new();
//! let created = storage.create(&json!({"resourceType": "Patient"})).await?;
//! ```

mod fhir_impl;
pub mod query;
pub mod storage;
pub mod transaction;

pub use query::{QueryFilter, TokenValue};
pub use storage::{InMemoryStorage, StorageKey};
pub use transaction::InMemoryTransaction;
