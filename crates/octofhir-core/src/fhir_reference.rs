//! Literal and conditional references between resources.
//!
//! ```
//! use octofhir_core::fhir_reference::{conditional_reference, parse_reference};
//!
//! let reference = parse_reference("Patient/123/_history/2", None).unwrap();
//! assert_eq!(reference.to_relative(), "Patient/123");
//! assert_eq!(reference.version.as_deref(), Some("2"));
//!
//! let cond = conditional_reference("Patient?identifier=a|b").unwrap();
//! assert_eq!(cond.query, "identifier=a|b");
//! ```

use std::fmt;

use thiserror::Error;

const HISTORY: &str = "_history";

/// `Type/id`, optionally pinned to a version.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FhirReference {
    pub resource_type: String,
    pub id: String,
    pub version: Option<String>,
}

impl FhirReference {
    pub fn new(resource_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            id: id.into(),
            version: None,
        }
    }

    pub fn with_version(
        resource_type: impl Into<String>,
        id: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            version: Some(version.into()),
            ..Self::new(resource_type, id)
        }
    }

    pub fn to_relative(&self) -> String {
        format!("{}/{}", self.resource_type, self.id)
    }

    /// `Type/id/_history/v`, or `Type/id` when unversioned.
    pub fn to_versioned(&self) -> String {
        match &self.version {
            Some(v) => format!("{}/{HISTORY}/{v}", self.to_relative()),
            None => self.to_relative(),
        }
    }

    pub fn unversioned(&self) -> Self {
        Self::new(&self.resource_type, &self.id)
    }
}

impl fmt::Display for FhirReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.resource_type, self.id)
    }
}

/// `Type?query`: a reference to whatever a search finds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditionalReference {
    pub resource_type: String,
    pub query: String,
}

/// Why a reference text does not name a resource on this server.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UnresolvableReference {
    #[error("contained reference: #{0}")]
    Contained(String),
    #[error("URN reference: {0}")]
    Urn(String),
    #[error("external reference: {0}")]
    External(String),
    #[error("invalid reference: {0}")]
    Invalid(String),
}

/// Parses a literal reference.
///
/// An absolute URL is local only when it starts with `base_url`; without a
/// base every absolute URL is external.
///
/// ```
/// use octofhir_core::fhir_reference::{UnresolvableReference, parse_reference};
///
/// let local = parse_reference("http://localhost/fhir/Patient/123", Some("http://localhost/fhir"));
/// assert_eq!(local.unwrap().id, "123");
/// assert!(matches!(parse_reference("#c1", None), Err(UnresolvableReference::Contained(_))));
/// ```
pub fn parse_reference(
    reference: &str,
    base_url: Option<&str>,
) -> Result<FhirReference, UnresolvableReference> {
    let reference = reference.trim();
    if reference.is_empty() {
        return Err(UnresolvableReference::Invalid("empty reference".into()));
    }
    if let Some(id) = reference.strip_prefix('#') {
        return Err(UnresolvableReference::Contained(id.into()));
    }
    if reference.starts_with("urn:") {
        return Err(UnresolvableReference::Urn(reference.into()));
    }
    if !reference.contains("://") {
        return parse_path(reference, reference);
    }

    base_url
        .and_then(|base| reference.strip_prefix(base.trim_end_matches('/')))
        .map(|suffix| parse_path(suffix.trim_start_matches('/'), reference))
        .unwrap_or_else(|| Err(UnresolvableReference::External(reference.into())))
}

/// Trailing `Type/id[/_history/v]` of an absolute URL, whatever its base.
///
/// Used for `fullUrl`, which names an entry's own identity and need not share
/// the server's base.
pub fn reference_from_url(url: &str) -> Option<FhirReference> {
    let (_, rest) = url.split_once("://")?;
    let path = rest.split(['?', '#']).next().unwrap_or_default();
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    // The host is segment 0, so a match needs at least one more than its length.
    let versioned = match segments.as_slice() {
        [_, .., t, id, HISTORY, v] => parse_path(&format!("{t}/{id}/{HISTORY}/{v}"), url).ok(),
        _ => None,
    };
    versioned.or_else(|| match segments.as_slice() {
        [_, .., t, id] => parse_path(&format!("{t}/{id}"), url).ok(),
        _ => None,
    })
}

pub fn conditional_reference(reference: &str) -> Option<ConditionalReference> {
    let (resource_type, query) = reference.split_once('?')?;
    is_resource_type_name(resource_type).then(|| ConditionalReference {
        resource_type: resource_type.to_string(),
        query: query.to_string(),
    })
}

/// Uppercase ASCII letter followed by ASCII alphanumerics.
pub fn is_resource_type_name(name: &str) -> bool {
    let mut chars = name.chars();
    chars.next().is_some_and(|c| c.is_ascii_uppercase())
        && chars.all(|c| c.is_ascii_alphanumeric())
}

fn parse_path(path: &str, original: &str) -> Result<FhirReference, UnresolvableReference> {
    let invalid = |reason: String| Err(UnresolvableReference::Invalid(reason));

    let (resource_type, id, version) = match path.split('/').collect::<Vec<_>>()[..] {
        [t, id] => (t, id, None),
        [t, id, HISTORY, v, ..] if !v.is_empty() => (t, id, Some(v)),
        [_] => return invalid(format!("reference must contain at least Type/id: {original}")),
        _ => return invalid(format!("unexpected path segments: {original}")),
    };
    if !is_resource_type_name(resource_type) {
        return invalid(format!(
            "resource type must start with uppercase letter: {resource_type}"
        ));
    }
    if id.is_empty() {
        return invalid("resource id cannot be empty".into());
    }

    let mut reference = FhirReference::new(resource_type, id);
    reference.version = version.map(str::to_string);
    Ok(reference)
}
