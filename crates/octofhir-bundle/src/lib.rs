//! FHIR transaction and batch bundle processing for OctoFHIR.
//!
//! A submitted `Bundle` of type `transaction` or `batch` goes through:
//!
//! 1. entry parsing and structural checks ([`entry`], [`planner`])
//! 2. identity resolution: placeholders, conditional criteria and reference
//!    rewriting ([`resolver`], [`matcher`])
//! 3. phase ordering: deletes, then creates/updates/patches, then reads ([`planner`])
//! 4. execution through per-operation handlers ([`executor`], [`guard`], [`patch`]);
//!    conditional creates, updates and patches are matched once deletes have run
//! 5. response assembly in submission order ([`response`])
//!
//! [`TransactionCoordinator`] drives the whole pipeline against any
//! [`octofhir_storage::FhirStorage`].
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use octofhir_bundle::{EngineConfig, TransactionCoordinator};
//! use octofhir_db_memory::InMemoryStorage;
//!
//! let storage = InMemoryStorage::new();
//! let coordinator = TransactionCoordinator::new(
//!     Arc::new(storage.clone()),
//!     storage.registry().clone(),
//!     &EngineConfig::default(),
//! );
//! let response = coordinator.process(bundle_json).await?;
//! ```

pub mod bundle;
pub mod config;
pub mod coordinator;
pub mod entry;
pub mod error;
pub mod executor;
pub mod guard;
pub mod interceptor;
pub mod matcher;
pub mod observability;
pub mod patch;
pub mod planner;
pub mod resolver;
pub mod response;

pub use bundle::{Bundle, BundleEntry, BundleEntryRequest, BundleEntryResponse, BundleMode};
pub use config::{EngineConfig, LoggingConfig, PreferReturn, TransactionSettings};
pub use coordinator::{CoordinatorState, TransactionCoordinator};
pub use entry::{OperationKind, Resolution, TransactionEntry};
pub use error::{BundleError, ErrorKind, Result};
pub use executor::{EntryHandler, ExecutionContext, HandlerTable};
pub use guard::VersionGuard;
pub use interceptor::{BundleContext, BundleInterceptor, EntryContext, InterceptorError};
pub use matcher::{ConditionalMatcher, CreateMatch};
pub use planner::{ExecutionPlan, Phase};
pub use resolver::{EntryResolver, IdentityArena};
pub use response::{BundleResponse, EntryOutcome, ResponseAssembler, ResponseStatus};
