//! Identity and reference primitives shared by the OctoFHIR crates.

pub mod error;
pub mod fhir_reference;
pub mod id;
pub mod placeholder;

pub use error::{CoreError, Result};
pub use fhir_reference::{
    ConditionalReference, FhirReference, UnresolvableReference, conditional_reference,
    parse_reference, reference_from_url,
};
pub use id::{IdError, generate_id, validate_id};
pub use placeholder::{Placeholder, PlaceholderKind, is_placeholder, parse_placeholder};
