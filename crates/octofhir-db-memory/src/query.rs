//! Search evaluation over raw resource JSON.
//!
//! Storage-level [`SearchParams`] are compiled against the search parameter
//! registry into a list of [`QueryFilter`]s. Clauses are ANDed, comma
//! alternatives inside a clause are ORed.

use serde_json::Value;

use octofhir_search::{SearchParameterRegistry, SearchParameterType, SearchPrefix};
use octofhir_storage::{SearchClause, SearchParams, StorageError};

type ElementPath = Vec<String>;

/// `system|code` as used by token parameters. Either side may be absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenValue {
    /// `None` means any system; `Some("")` means "no system".
    pub system: Option<String>,
    pub code: Option<String>,
}

impl TokenValue {
    pub fn parse(raw: &str) -> Self {
        match raw.split_once('|') {
            Some((system, code)) => Self {
                system: Some(system.to_string()),
                code: (!code.is_empty()).then(|| code.to_string()),
            },
            None => Self {
                system: None,
                code: Some(raw.to_string()),
            },
        }
    }

    fn matches_pair(&self, system: Option<&str>, code: Option<&str>) -> bool {
        let system_ok = match self.system.as_deref() {
            None => true,
            Some("") => system.is_none_or(str::is_empty),
            Some(expected) => system == Some(expected),
        };
        let code_ok = match self.code.as_deref() {
            None => true,
            Some(expected) => code == Some(expected),
        };
        system_ok && code_ok
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringMode {
    StartsWith,
    Exact,
    Contains,
}

/// Query filter compiled from one search clause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryFilter {
    /// `param:missing=true|false`
    Missing { paths: Vec<ElementPath>, missing: bool },
    /// Token match over Identifier, Coding, CodeableConcept and primitives.
    Token {
        paths: Vec<ElementPath>,
        alternatives: Vec<TokenValue>,
        negate: bool,
    },
    /// String match over every string leaf of the element.
    String {
        paths: Vec<ElementPath>,
        alternatives: Vec<String>,
        mode: StringMode,
    },
    /// Reference match; `Type/id`, bare `id` or absolute URL values.
    Reference {
        paths: Vec<ElementPath>,
        alternatives: Vec<String>,
        type_hint: Option<String>,
    },
    /// Identifier of a reference (`subject:identifier=system|value`).
    ReferenceIdentifier {
        paths: Vec<ElementPath>,
        alternatives: Vec<TokenValue>,
    },
    /// Date comparison at the precision of the search value.
    Date {
        paths: Vec<ElementPath>,
        alternatives: Vec<(Option<SearchPrefix>, String)>,
    },
    /// URI equality, or prefix with `:below`.
    Uri {
        paths: Vec<ElementPath>,
        alternatives: Vec<String>,
        below: bool,
    },
}

/// Compiles search parameters for `resource_type` into filters.
///
/// # Errors
///
/// Returns `StorageError::InvalidSearch` for unknown parameters, unsupported
/// modifiers and parameter types this backend cannot evaluate.
pub fn compile(
    resource_type: &str,
    params: &SearchParams,
    registry: &SearchParameterRegistry,
) -> Result<Vec<QueryFilter>, StorageError> {
    params
        .clauses
        .iter()
        .map(|clause| compile_clause(resource_type, clause, registry))
        .collect()
}

fn compile_clause(
    resource_type: &str,
    clause: &SearchClause,
    registry: &SearchParameterRegistry,
) -> Result<QueryFilter, StorageError> {
    let definition = registry.get(resource_type, &clause.name).ok_or_else(|| {
        StorageError::invalid_search(format!(
            "Resource type {resource_type} does not have a parameter with name: {}",
            clause.name
        ))
    })?;
    let paths = definition.paths_for(resource_type);
    let modifier = clause.modifier.as_deref();
    let unsupported = || {
        StorageError::invalid_search(match modifier {
            Some(m) => format!("Unsupported modifier :{m} for search parameter {}", clause.name),
            None => format!("Unsupported search parameter type for {}", clause.name),
        })
    };

    if modifier == Some("missing") {
        let missing = match clause.value.as_str() {
            "true" => true,
            "false" => false,
            _ => return Err(unsupported()),
        };
        return Ok(QueryFilter::Missing { paths, missing });
    }

    let strings = || clause.alternatives().map(str::to_string).collect::<Vec<_>>();

    let filter = match (definition.param_type, modifier) {
        (SearchParameterType::Token, None | Some("not")) => QueryFilter::Token {
            paths,
            alternatives: clause.alternatives().map(TokenValue::parse).collect(),
            negate: modifier == Some("not"),
        },
        (SearchParameterType::String, m) => QueryFilter::String {
            paths,
            alternatives: strings(),
            mode: match m {
                None => StringMode::StartsWith,
                Some("exact") => StringMode::Exact,
                Some("contains") => StringMode::Contains,
                Some(_) => return Err(unsupported()),
            },
        },
        (SearchParameterType::Reference, Some("identifier")) => QueryFilter::ReferenceIdentifier {
            paths,
            alternatives: clause.alternatives().map(TokenValue::parse).collect(),
        },
        (SearchParameterType::Reference, m) => QueryFilter::Reference {
            paths,
            alternatives: strings(),
            type_hint: match m {
                None => None,
                Some(t) if t.starts_with(|c: char| c.is_ascii_uppercase()) => Some(t.to_string()),
                Some(_) => return Err(unsupported()),
            },
        },
        (SearchParameterType::Date, None) => QueryFilter::Date {
            paths,
            alternatives: clause
                .alternatives()
                .map(|v| {
                    let (prefix, rest) = SearchPrefix::split(v);
                    (prefix, rest.to_string())
                })
                .collect(),
        },
        (SearchParameterType::Uri, None | Some("below")) => QueryFilter::Uri {
            paths,
            alternatives: strings(),
            below: modifier == Some("below"),
        },
        _ => return Err(unsupported()),
    };
    Ok(filter)
}

impl QueryFilter {
    /// Check if a resource matches this filter.
    pub fn matches(&self, resource: &Value) -> bool {
        match self {
            QueryFilter::Missing { paths, missing } => {
                collect_elements(resource, paths).is_empty() == *missing
            }
            QueryFilter::Token {
                paths,
                alternatives,
                negate,
            } => {
                let elements = collect_elements(resource, paths);
                let hit = alternatives
                    .iter()
                    .any(|alt| elements.iter().any(|e| match_token(e, alt)));
                hit != *negate
            }
            QueryFilter::String {
                paths,
                alternatives,
                mode,
            } => {
                let mut leaves = Vec::new();
                for e in collect_elements(resource, paths) {
                    string_leaves(e, &mut leaves);
                }
                alternatives
                    .iter()
                    .any(|alt| leaves.iter().any(|leaf| match_string(leaf, alt, *mode)))
            }
            QueryFilter::Reference {
                paths,
                alternatives,
                type_hint,
            } => {
                let elements = collect_elements(resource, paths);
                alternatives.iter().any(|alt| {
                    elements
                        .iter()
                        .filter_map(|e| e.get("reference").and_then(Value::as_str))
                        .any(|r| match_reference(r, alt, type_hint.as_deref()))
                })
            }
            QueryFilter::ReferenceIdentifier {
                paths,
                alternatives,
            } => {
                let elements = collect_elements(resource, paths);
                alternatives.iter().any(|alt| {
                    elements
                        .iter()
                        .filter_map(|e| e.get("identifier"))
                        .any(|ident| match_token(ident, alt))
                })
            }
            QueryFilter::Date {
                paths,
                alternatives,
            } => {
                let elements = collect_elements(resource, paths);
                alternatives.iter().any(|(prefix, value)| {
                    elements
                        .iter()
                        .flat_map(|e| date_bounds(e))
                        .any(|d| match_date(d, *prefix, value))
                })
            }
            QueryFilter::Uri {
                paths,
                alternatives,
                below,
            } => {
                let elements = collect_elements(resource, paths);
                alternatives.iter().any(|alt| {
                    elements.iter().filter_map(|e| e.as_str()).any(|uri| {
                        if *below {
                            uri.starts_with(alt.as_str())
                        } else {
                            uri == alt
                        }
                    })
                })
            }
        }
    }
}

/// Resolves element paths against a resource, flattening arrays.
///
/// A missing segment falls back to a choice-type key (`effective` matches
/// `effectiveDateTime` or `effectivePeriod`).
pub fn collect_elements<'a>(resource: &'a Value, paths: &[ElementPath]) -> Vec<&'a Value> {
    let mut out = Vec::new();
    for path in paths {
        let mut current = vec![resource];
        for segment in path {
            let mut next = Vec::new();
            for node in current {
                let Some(obj) = node.as_object() else {
                    continue;
                };
                let child = obj.get(segment.as_str()).or_else(|| {
                    obj.iter()
                        .find(|(k, _)| {
                            k.strip_prefix(segment.as_str())
                                .is_some_and(|rest| rest.starts_with(|c: char| c.is_ascii_uppercase()))
                        })
                        .map(|(_, v)| v)
                });
                match child {
                    Some(Value::Array(items)) => next.extend(items.iter()),
                    Some(Value::Null) | None => {}
                    Some(v) => next.push(v),
                }
            }
            current = next;
        }
        out.extend(current);
    }
    out
}

fn match_token(element: &Value, token: &TokenValue) -> bool {
    match element {
        Value::String(s) => token.system.is_none() && token.code.as_deref() == Some(s.as_str()),
        Value::Bool(b) => {
            token.system.is_none() && token.code.as_deref() == Some(if *b { "true" } else { "false" })
        }
        Value::Number(n) => token.system.is_none() && token.code.as_deref() == Some(n.to_string().as_str()),
        Value::Object(obj) => {
            if let Some(Value::Array(codings)) = obj.get("coding") {
                return codings.iter().any(|c| match_token(c, token));
            }
            let system = obj.get("system").and_then(Value::as_str);
            let code = obj
                .get("code")
                .or_else(|| obj.get("value"))
                .and_then(Value::as_str);
            (system.is_some() || code.is_some()) && token.matches_pair(system, code)
        }
        _ => false,
    }
}

fn string_leaves<'a>(element: &'a Value, out: &mut Vec<&'a str>) {
    match element {
        Value::String(s) => out.push(s),
        Value::Array(items) => items.iter().for_each(|i| string_leaves(i, out)),
        Value::Object(obj) => obj.values().for_each(|v| string_leaves(v, out)),
        _ => {}
    }
}

fn match_string(leaf: &str, value: &str, mode: StringMode) -> bool {
    match mode {
        StringMode::Exact => leaf == value,
        StringMode::StartsWith => leaf.to_lowercase().starts_with(&value.to_lowercase()),
        StringMode::Contains => leaf.to_lowercase().contains(&value.to_lowercase()),
    }
}

fn match_reference(reference: &str, value: &str, type_hint: Option<&str>) -> bool {
    let target = match (type_hint, value.contains('/')) {
        (Some(t), false) => format!("{t}/{value}"),
        _ => value.to_string(),
    };
    if reference == target {
        return true;
    }
    if target.contains('/') {
        // Absolute references to the same Type/id.
        return reference.ends_with(&format!("/{target}"));
    }
    // Bare id: any type unless hinted.
    reference
        .rsplit('/')
        .next()
        .is_some_and(|id| id == target)
}

/// Date strings an element contributes: a primitive, or both ends of a Period.
fn date_bounds(element: &Value) -> Vec<&str> {
    match element {
        Value::String(s) => vec![s.as_str()],
        Value::Object(obj) => ["start", "end"]
            .iter()
            .filter_map(|k| obj.get(*k).and_then(Value::as_str))
            .collect(),
        _ => Vec::new(),
    }
}

fn match_date(element: &str, prefix: Option<SearchPrefix>, value: &str) -> bool {
    // Compare at the coarser of the two precisions.
    let len = element.len().min(value.len());
    if !element.is_char_boundary(len) || !value.is_char_boundary(len) {
        return false;
    }
    let (e, v) = (&element[..len], &value[..len]);
    match prefix {
        None | Some(SearchPrefix::Eq) => e == v,
        Some(SearchPrefix::Ne) => e != v,
        Some(SearchPrefix::Gt) | Some(SearchPrefix::Sa) => e > v,
        Some(SearchPrefix::Lt) | Some(SearchPrefix::Eb) => e < v,
        Some(SearchPrefix::Ge) => e >= v,
        Some(SearchPrefix::Le) => e <= v,
    }
}
