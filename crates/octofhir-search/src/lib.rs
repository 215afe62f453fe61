//! Search parameter registry and match URL parsing for the OctoFHIR bundle engine.

pub mod common;
pub mod error;
pub mod parameters;
pub mod parser;
pub mod registry;

pub use error::SearchError;
pub use parameters::{SearchModifier, SearchParameter, SearchParameterType, SearchPrefix};
pub use parser::{MatchUrl, ParsedParam};
pub use registry::SearchParameterRegistry;
