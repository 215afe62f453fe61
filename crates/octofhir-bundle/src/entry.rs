//! Bundle entries turned into typed operations.
//!
//! Parsing is purely structural: method and URL mapping, criterion syntax,
//! placeholder syntax and payload shape are all checked here, before any
//! storage access.

use std::fmt;

use serde_json::Value;

use octofhir_core::{FhirReference, parse_placeholder, parse_reference, reference_from_url};
use octofhir_core::fhir_reference::is_resource_type_name;
use octofhir_search::{MatchUrl, SearchParameterRegistry};

use crate::bundle::BundleEntry;
use crate::error::{BundleError, Result};
use crate::guard::parse_if_match;
use crate::planner::Phase;

/// The operation an entry asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OperationKind {
    Create,
    Update,
    Delete,
    Patch,
    Read,
    Search,
}

impl OperationKind {
    pub const ALL: [OperationKind; 6] = [
        Self::Create,
        Self::Update,
        Self::Delete,
        Self::Patch,
        Self::Read,
        Self::Search,
    ];

    pub fn phase(self) -> Phase {
        match self {
            Self::Delete => Phase::Delete,
            Self::Create | Self::Update | Self::Patch => Phase::Mutate,
            Self::Read | Self::Search => Phase::Read,
        }
    }

    /// True for operations that change stored state.
    pub fn is_mutating(self) -> bool {
        !matches!(self, Self::Read | Self::Search)
    }

    /// Verb used in error messages (`Trying to update ...`).
    pub fn verb(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Patch => "patch",
            Self::Read => "read",
            Self::Search => "search",
        }
    }

    /// Upper-case verb used in match URL errors.
    pub fn match_verb(self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
            Self::Patch => "PATCH",
            Self::Read => "READ",
            Self::Search => "SEARCH",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.verb())
    }
}

/// The identity an entry declares for itself through `fullUrl` (or a
/// scheme-prefixed payload id).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelfIdentity {
    /// `urn:uuid:` / `urn:oid:` temporary identity.
    Placeholder(String),
    /// `http://server/fhir/Patient/1` or `Patient/1`.
    Literal { url: String, identity: FhirReference },
}

impl SelfIdentity {
    /// Text that other entries use to refer to this one.
    pub fn key(&self) -> &str {
        match self {
            Self::Placeholder(raw) => raw,
            Self::Literal { url, .. } => url,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        matches!(self, Self::Placeholder(_))
    }
}

/// What an entry turned out to mean once identities and matches are known.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Resolution {
    #[default]
    Unresolved,
    /// Write a new resource under this identity.
    Create { identity: FhirReference },
    /// A conditional create found (or folded onto) this resource; nothing is written.
    Existing { identity: FhirReference },
    /// Operate on this identity (update, patch, read, delete by id).
    Target { identity: FhirReference },
    /// Conditional delete: every identity to remove, possibly none.
    DeleteMany { identities: Vec<FhirReference> },
    /// Search with placeholders already substituted.
    Search { query: MatchUrl },
}

/// One client-requested operation.
#[derive(Debug, Clone)]
pub struct TransactionEntry {
    pub original_index: usize,
    pub kind: OperationKind,
    pub method: String,
    pub request_url: String,
    pub resource_type: String,
    pub payload: Option<Value>,
    /// Concrete identity from the request URL.
    pub target: Option<FhirReference>,
    /// Request URL that is itself a placeholder (`PUT urn:uuid:...`).
    pub target_placeholder: Option<String>,
    /// Conditional match criterion, or the query of a search.
    pub criterion: Option<MatchUrl>,
    /// `If-None-Exist` criterion of a create.
    pub create_guard: Option<MatchUrl>,
    /// Expected current version from `If-Match`.
    pub precondition_version: Option<String>,
    pub self_identity: Option<SelfIdentity>,
    pub full_url: Option<String>,
    pub resolution: Resolution,
    /// Criterion after placeholder substitution, re-checked before commit.
    pub resolved_criterion: Option<MatchUrl>,
}

/// Path part of a request URL.
enum UrlTarget {
    Type(String),
    Instance(FhirReference),
    Placeholder(String),
}

impl TransactionEntry {
    /// Parses one bundle entry. Errors are tagged with `index`.
    pub fn parse(
        index: usize,
        entry: &BundleEntry,
        registry: &SearchParameterRegistry,
    ) -> Result<Self> {
        Self::parse_untagged(index, entry, registry).map_err(|e| e.with_entry(index))
    }

    fn parse_untagged(
        index: usize,
        entry: &BundleEntry,
        registry: &SearchParameterRegistry,
    ) -> Result<Self> {
        let request = entry
            .request
            .as_ref()
            .ok_or_else(|| BundleError::invalid_request("Entry is missing request"))?;
        let method = request.method.trim().to_ascii_uppercase();
        let url = request.url.trim();
        if url.is_empty() {
            return Err(BundleError::invalid_request(format!(
                "Entry with method {method} is missing request.url"
            )));
        }

        let (path, query) = match url.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (url, None),
        };
        let url_target = parse_url_target(path, url)?;
        let mut payload = entry.resource.clone();

        let mut parsed = Self {
            original_index: index,
            kind: OperationKind::Read,
            method: method.clone(),
            request_url: url.to_string(),
            resource_type: String::new(),
            payload: None,
            target: None,
            target_placeholder: None,
            criterion: None,
            create_guard: None,
            precondition_version: None,
            self_identity: None,
            full_url: entry.full_url.clone(),
            resolution: Resolution::Unresolved,
            resolved_criterion: None,
        };

        match method.as_str() {
            "POST" => {
                let Some(UrlTarget::Type(resource_type)) = url_target.filter(|_| query.is_none())
                else {
                    return Err(BundleError::invalid_request(format!(
                        "Unable to process POST to {url}: POST requires a type-level URL"
                    )));
                };
                let body = require_payload(&mut payload, &method)?;
                check_payload_type(body, &resource_type)?;
                if let Some(raw) = request.if_none_exist.as_deref().map(str::trim)
                    && !raw.is_empty()
                {
                    parsed.create_guard = Some(MatchUrl::parse_criterion(
                        raw,
                        Some(&resource_type),
                        registry,
                    )?);
                }
                parsed.kind = OperationKind::Create;
                parsed.resource_type = resource_type;
            }
            "PUT" | "PATCH" | "DELETE" => {
                parsed.kind = match method.as_str() {
                    "PUT" => OperationKind::Update,
                    "PATCH" => OperationKind::Patch,
                    _ => OperationKind::Delete,
                };
                match (url_target, query) {
                    (Some(UrlTarget::Instance(target)), _) => {
                        parsed.resource_type = target.resource_type.clone();
                        parsed.target = Some(target.unversioned());
                    }
                    (Some(UrlTarget::Placeholder(raw)), _) => {
                        parsed.target_placeholder = Some(raw);
                    }
                    (Some(UrlTarget::Type(_)) | None, Some(_)) => {
                        let criterion = MatchUrl::parse_criterion(url, None, registry)?;
                        parsed.resource_type = criterion.resource_type().to_string();
                        parsed.criterion = Some(criterion);
                    }
                    (_, None) => {
                        return Err(BundleError::invalid_request(format!(
                            "Unable to process {method} to {url}: missing resource id or search criteria"
                        )));
                    }
                }

                if parsed.kind != OperationKind::Delete {
                    let body = require_payload(&mut payload, &method)?;
                    if parsed.kind == OperationKind::Update {
                        let body_type = payload_type(body)?;
                        if parsed.target_placeholder.is_some() {
                            parsed.resource_type = body_type.to_string();
                        } else {
                            check_payload_type(body, &parsed.resource_type)?;
                        }
                        if let Some(target) = &parsed.target {
                            fill_payload_id(body, target)?;
                        }
                    }
                } else {
                    payload = None;
                }

                if let Some(raw) = request.if_match.as_deref() {
                    parsed.precondition_version = Some(parse_if_match(raw)?);
                }
            }
            "GET" | "HEAD" => match url_target {
                Some(UrlTarget::Instance(target)) => {
                    parsed.kind = OperationKind::Read;
                    parsed.resource_type = target.resource_type.clone();
                    parsed.target = Some(target);
                }
                Some(UrlTarget::Type(_)) => {
                    let query = MatchUrl::parse_search(url, registry)?;
                    parsed.kind = OperationKind::Search;
                    parsed.resource_type = query.resource_type().to_string();
                    parsed.criterion = Some(query);
                }
                Some(UrlTarget::Placeholder(raw)) => {
                    parsed.kind = OperationKind::Read;
                    parsed.target_placeholder = Some(raw);
                }
                None => {
                    return Err(BundleError::invalid_request(format!(
                        "Unable to process GET to {url}: missing resource type"
                    )));
                }
            },
            other => {
                return Err(BundleError::invalid_request(format!(
                    "Unsupported HTTP method in transaction: {other}"
                )));
            }
        }

        if !parsed.kind.is_mutating() || parsed.kind == OperationKind::Delete {
            payload = None;
        }
        parsed.self_identity = self_identity(entry.full_url.as_deref(), &mut payload, parsed.kind)?;
        parsed.payload = payload;
        Ok(parsed)
    }

    /// True when the target is found by a criterion instead of an identity.
    pub fn is_conditional(&self) -> bool {
        self.kind.is_mutating() && self.criterion.is_some()
    }

    /// Identity named literally by the request URL of a mutating entry.
    pub fn literal_target_key(&self) -> Option<String> {
        if !self.kind.is_mutating() || self.kind == OperationKind::Create {
            return None;
        }
        match (&self.target, &self.target_placeholder) {
            (Some(target), _) => Some(target.unversioned().to_relative()),
            (None, Some(raw)) => Some(raw.clone()),
            (None, None) => None,
        }
    }

    /// The identity this entry operates on once resolved, if it is a single one.
    pub fn resolved_identity(&self) -> Option<&FhirReference> {
        match &self.resolution {
            Resolution::Create { identity }
            | Resolution::Existing { identity }
            | Resolution::Target { identity } => Some(identity),
            Resolution::DeleteMany { identities } if identities.len() == 1 => identities.first(),
            _ => None,
        }
    }
}

/// Parses every entry of a bundle, one result per entry.
pub fn parse_entries(
    entries: &[BundleEntry],
    registry: &SearchParameterRegistry,
) -> Vec<Result<TransactionEntry>> {
    entries
        .iter()
        .enumerate()
        .map(|(index, entry)| TransactionEntry::parse(index, entry, registry))
        .collect()
}

fn parse_url_target(path: &str, url: &str) -> Result<Option<UrlTarget>> {
    if let Some(placeholder) = parse_placeholder(path).map_err(|_| BundleError::invalid_placeholder(path))? {
        return Ok(Some(UrlTarget::Placeholder(placeholder.as_str().to_string())));
    }

    let path = match path.split_once("://") {
        Some((_, rest)) => rest.split_once('/').map_or("", |(_, p)| p),
        None => path,
    };
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let Some(start) = segments.iter().position(|s| is_resource_type_name(s)) else {
        return Ok(None);
    };

    match &segments[start..] {
        [resource_type] => Ok(Some(UrlTarget::Type((*resource_type).to_string()))),
        [_, id, ..] if id.starts_with('$') => Err(BundleError::invalid_request(format!(
            "Operations are not supported in a transaction: {url}"
        ))),
        rest => parse_reference(&rest.join("/"), None)
            .map(|r| Some(UrlTarget::Instance(r)))
            .map_err(|e| BundleError::invalid_request(format!("Invalid request URL {url}: {e}"))),
    }
}

fn require_payload<'a>(payload: &'a mut Option<Value>, method: &str) -> Result<&'a mut Value> {
    match payload {
        Some(body) if body.is_object() => Ok(body),
        Some(_) => Err(BundleError::invalid_request(format!(
            "Entry with method {method} has a resource that is not a JSON object"
        ))),
        None => Err(BundleError::invalid_request(format!(
            "Entry with method {method} is missing resource"
        ))),
    }
}

fn payload_type(body: &Value) -> Result<&str> {
    body.get("resourceType")
        .and_then(Value::as_str)
        .ok_or_else(|| BundleError::invalid_request("Resource is missing resourceType"))
}

fn check_payload_type(body: &Value, url_type: &str) -> Result<()> {
    let body_type = payload_type(body)?;
    if body_type != url_type {
        return Err(BundleError::invalid_request(format!(
            "Resource type {body_type} in entry does not match request URL type {url_type}"
        )));
    }
    Ok(())
}

fn fill_payload_id(body: &mut Value, target: &FhirReference) -> Result<()> {
    match body.get("id").and_then(Value::as_str) {
        Some(id) if id != target.id => Err(BundleError::invalid_request(format!(
            "Resource id {id} does not match request URL id {}",
            target.id
        ))),
        Some(_) => Ok(()),
        None => {
            if let Some(obj) = body.as_object_mut() {
                obj.insert("id".to_string(), Value::String(target.id.clone()));
            }
            Ok(())
        }
    }
}

/// Works out the entry's own identity from `fullUrl`, falling back to a
/// scheme-prefixed payload id on creates.
fn self_identity(
    full_url: Option<&str>,
    payload: &mut Option<Value>,
    kind: OperationKind,
) -> Result<Option<SelfIdentity>> {
    if let Some(full_url) = full_url.map(str::trim).filter(|u| !u.is_empty()) {
        let identity = classify_self_identifier(full_url)?;
        if kind == OperationKind::Create
            && let Some(body) = payload.as_mut().and_then(Value::as_object_mut)
        {
            body.remove("id");
        }
        return Ok(identity);
    }

    let Some(body) = payload.as_mut().and_then(Value::as_object_mut) else {
        return Ok(None);
    };
    let Some(id) = body.get("id").and_then(Value::as_str).map(str::to_string) else {
        return Ok(None);
    };
    match parse_placeholder(&id).map_err(|_| BundleError::invalid_placeholder(&id))? {
        Some(placeholder) => {
            body.remove("id");
            Ok(Some(SelfIdentity::Placeholder(placeholder.as_str().to_string())))
        }
        None => {
            if kind == OperationKind::Create {
                body.remove("id");
            }
            Ok(None)
        }
    }
}

fn classify_self_identifier(full_url: &str) -> Result<Option<SelfIdentity>> {
    if let Some(placeholder) =
        parse_placeholder(full_url).map_err(|_| BundleError::invalid_placeholder(full_url))?
    {
        return Ok(Some(SelfIdentity::Placeholder(placeholder.as_str().to_string())));
    }

    let identity = if full_url.contains("://") {
        reference_from_url(full_url)
    } else {
        parse_reference(full_url, None).ok()
    };
    Ok(identity.map(|identity| SelfIdentity::Literal {
        url: full_url.to_string(),
        identity: identity.unversioned(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::BundleEntryRequest;
    use serde_json::json;

    const P1: &str = "urn:uuid:1f7e1c2a-5d42-4bb4-9a0e-2c6f0d6d3f11";

    fn registry() -> SearchParameterRegistry {
        SearchParameterRegistry::with_defaults()
    }

    fn entry(method: &str, url: &str, resource: Option<Value>) -> BundleEntry {
        BundleEntry {
            resource,
            request: Some(BundleEntryRequest {
                method: method.to_string(),
                url: url.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_method_mapping() {
        let reg = registry();
        let cases = [
            (entry("POST", "Patient", Some(json!({"resourceType": "Patient"}))), OperationKind::Create),
            (entry("PUT", "Patient/1", Some(json!({"resourceType": "Patient"}))), OperationKind::Update),
            (entry("DELETE", "Patient/1", None), OperationKind::Delete),
            (entry("GET", "Patient/1", None), OperationKind::Read),
            (entry("GET", "Patient?gender=male", None), OperationKind::Search),
            (entry("HEAD", "Patient", None), OperationKind::Search),
        ];
        for (index, (e, kind)) in cases.iter().enumerate() {
            let parsed = TransactionEntry::parse(index, e, &reg).unwrap();
            assert_eq!(parsed.kind, *kind, "entry {index}");
            assert_eq!(parsed.resource_type, "Patient");
        }
    }

    #[test]
    fn test_put_fills_id_and_checks_type() {
        let reg = registry();
        let parsed = TransactionEntry::parse(
            0,
            &entry("PUT", "Patient/abc", Some(json!({"resourceType": "Patient"}))),
            &reg,
        )
        .unwrap();
        assert_eq!(parsed.payload.unwrap()["id"], "abc");

        let err = TransactionEntry::parse(
            1,
            &entry("PUT", "Patient/abc", Some(json!({"resourceType": "Patient", "id": "xyz"}))),
            &reg,
        )
        .unwrap_err();
        assert_eq!(err.entry_index(), Some(1));
        assert!(err.to_string().contains("does not match request URL id"));

        let err = TransactionEntry::parse(
            2,
            &entry("PUT", "Patient/abc", Some(json!({"resourceType": "Observation"}))),
            &reg,
        )
        .unwrap_err();
        assert!(err.to_string().contains("does not match request URL type Patient"));
    }

    #[test]
    fn test_conditional_entries() {
        let reg = registry();
        let parsed = TransactionEntry::parse(
            0,
            &entry("DELETE", "Patient?identifier=http://acme.org|1", None),
            &reg,
        )
        .unwrap();
        assert!(parsed.is_conditional());
        assert_eq!(parsed.literal_target_key(), None);

        let mut post = entry("POST", "Patient", Some(json!({"resourceType": "Patient"})));
        if let Some(request) = post.request.as_mut() {
            request.if_none_exist = Some("identifier=http://acme.org|1".into());
        }
        let parsed = TransactionEntry::parse(1, &post, &reg).unwrap();
        assert_eq!(parsed.create_guard.unwrap().resource_type(), "Patient");
    }

    #[test]
    fn test_invalid_criteria_are_malformed() {
        let reg = registry();
        let err = TransactionEntry::parse(
            0,
            &entry("DELETE", "Patient?foo=bar", None),
            &reg,
        )
        .unwrap_err();
        assert_eq!(
            err.root().to_string(),
            "Failed to parse match URL[Patient?foo=bar] - Resource type Patient does not have a parameter with name: foo"
        );

        let err = TransactionEntry::parse(0, &entry("DELETE", "?identifier=1", None), &reg)
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Malformed);
    }

    #[test]
    fn test_unsupported_method() {
        let err = TransactionEntry::parse(0, &entry("OPTIONS", "Patient", None), &registry())
            .unwrap_err();
        assert_eq!(
            err.root().to_string(),
            "Unsupported HTTP method in transaction: OPTIONS"
        );
    }

    #[test]
    fn test_self_identity() {
        let reg = registry();
        let mut e = entry("POST", "Patient", Some(json!({"resourceType": "Patient", "id": "client"})));
        e.full_url = Some(P1.into());
        let parsed = TransactionEntry::parse(0, &e, &reg).unwrap();
        assert_eq!(parsed.self_identity, Some(SelfIdentity::Placeholder(P1.into())));
        assert!(parsed.payload.unwrap().get("id").is_none());

        let e = entry("POST", "Patient", Some(json!({"resourceType": "Patient", "id": P1})));
        let parsed = TransactionEntry::parse(0, &e, &reg).unwrap();
        assert_eq!(parsed.self_identity.unwrap().key(), P1);

        let mut e = entry("PUT", "Patient/7", Some(json!({"resourceType": "Patient"})));
        e.full_url = Some("http://example.org/fhir/Patient/7".into());
        let parsed = TransactionEntry::parse(0, &e, &reg).unwrap();
        assert!(matches!(
            parsed.self_identity,
            Some(SelfIdentity::Literal { ref identity, .. }) if identity.to_relative() == "Patient/7"
        ));
    }

    #[test]
    fn test_malformed_placeholder_is_named() {
        let mut e = entry("POST", "Observation", Some(json!({"resourceType": "Observation"})));
        e.full_url = Some("cid:observation1".into());
        let err = TransactionEntry::parse(4, &e, &registry()).unwrap_err();
        assert_eq!(
            err.root().to_string(),
            "Invalid placeholder ID found: cid:observation1 - Must be of the form 'urn:uuid:[uuid]' or 'urn:oid:[oid]'"
        );
        assert_eq!(err.entry_index(), Some(4));
    }

    #[test]
    fn test_placeholder_request_url() {
        let parsed = TransactionEntry::parse(
            0,
            &entry("PUT", P1, Some(json!({"resourceType": "Patient"}))),
            &registry(),
        )
        .unwrap();
        assert_eq!(parsed.target_placeholder.as_deref(), Some(P1));
        assert_eq!(parsed.resource_type, "Patient");
        assert_eq!(parsed.literal_target_key().as_deref(), Some(P1));
    }

    #[test]
    fn test_if_match_is_parsed() {
        let mut e = entry("DELETE", "Patient/1", None);
        if let Some(request) = e.request.as_mut() {
            request.if_match = Some("W/\"3\"".into());
        }
        let parsed = TransactionEntry::parse(0, &e, &registry()).unwrap();
        assert_eq!(parsed.precondition_version.as_deref(), Some("3"));
    }
}
