//! Match URL parsing.
//!
//! A match URL is a resource type plus a search query, as used by conditional
//! create (`If-None-Exist`), conditional update/delete/patch request URLs,
//! inline conditional references and GET search entries of a bundle:
//!
//! ```text
//! Patient?identifier=http://acme.org/mrns|12345&active=true
//! ```

use std::borrow::Cow;
use std::fmt;

use octofhir_storage::{SearchClause, SearchParams};
use url::form_urlencoded;

use crate::error::{SearchError, SearchResult};
use crate::parameters::SearchModifier;
use crate::registry::SearchParameterRegistry;

/// Parameters that only affect response formatting and are dropped.
const IGNORED_PARAMS: &[&str] = &["_format", "_pretty", "_summary", "_elements", "_sort", "_total"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedParam {
    pub name: String,
    pub modifier: Option<SearchModifier>,
    /// Decoded value; commas separate OR alternatives.
    pub value: String,
}

impl ParsedParam {
    pub fn alternatives(&self) -> impl Iterator<Item = &str> {
        self.value.split(',').map(str::trim).filter(|v| !v.is_empty())
    }

    fn key(&self) -> Cow<'_, str> {
        match &self.modifier {
            Some(m) => Cow::Owned(format!("{}:{}", self.name, m)),
            None => Cow::Borrowed(&self.name),
        }
    }
}

/// A validated match URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchUrl {
    raw: String,
    resource_type: String,
    params: Vec<ParsedParam>,
    count: Option<u32>,
    offset: Option<u32>,
}

impl MatchUrl {
    /// Parses a conditional criterion. At least one parameter with a value is required.
    ///
    /// `default_type` is used when the URL is a bare query (`identifier=...`), as
    /// `If-None-Exist` headers often are.
    pub fn parse_criterion(
        raw: &str,
        default_type: Option<&str>,
        registry: &SearchParameterRegistry,
    ) -> SearchResult<Self> {
        let parsed = Self::parse(raw, default_type, registry)?;
        if parsed.params.is_empty() {
            return Err(SearchError::NoParameters {
                url: raw.to_string(),
            });
        }
        Ok(parsed)
    }

    /// Parses a search URL. An empty query matches every resource of the type.
    pub fn parse_search(raw: &str, registry: &SearchParameterRegistry) -> SearchResult<Self> {
        Self::parse(raw, None, registry)
    }

    fn parse(
        raw: &str,
        default_type: Option<&str>,
        registry: &SearchParameterRegistry,
    ) -> SearchResult<Self> {
        let err_url = || raw.to_string();

        if raw.chars().any(char::is_whitespace) {
            return Err(SearchError::ContainsSpaces { url: err_url() });
        }

        let (path, query) = match raw.split_once('?') {
            Some((path, query)) => (path, query),
            None if raw.contains('=') => ("", raw),
            None => (raw, ""),
        };

        let path_type = path.trim_end_matches('/').rsplit('/').next().unwrap_or_default();
        let resource_type = match (path_type, default_type) {
            ("", Some(default)) => default,
            ("", None) => return Err(SearchError::MissingResourceType { url: err_url() }),
            (explicit, _) => explicit,
        };
        if !octofhir_core::fhir_reference::is_resource_type_name(resource_type) {
            return Err(SearchError::InvalidResourceType {
                url: err_url(),
                resource_type: resource_type.to_string(),
            });
        }

        let mut params = Vec::new();
        let mut count = None;
        let mut offset = None;

        for (key, value) in form_urlencoded::parse(query.as_bytes()) {
            if key.is_empty() || IGNORED_PARAMS.contains(&key.as_ref()) {
                continue;
            }
            match key.as_ref() {
                "_count" => {
                    count = Some(parse_control(raw, "_count", &value)?);
                    continue;
                }
                "_offset" => {
                    offset = Some(parse_control(raw, "_offset", &value)?);
                    continue;
                }
                _ => {}
            }

            let (name, modifier) = split_name_and_modifier(&key);
            let Some(definition) = registry.get(resource_type, name) else {
                return Err(SearchError::UnknownParameter {
                    url: err_url(),
                    resource_type: resource_type.to_string(),
                    name: name.to_string(),
                });
            };

            let modifier = match modifier {
                None => None,
                Some(m) => match SearchModifier::parse(m) {
                    Some(parsed) if parsed.applicable_to(&definition.param_type) => Some(parsed),
                    _ => {
                        return Err(SearchError::UnsupportedModifier {
                            url: err_url(),
                            name: name.to_string(),
                            modifier: m.to_string(),
                        });
                    }
                },
            };

            if value.trim().is_empty() {
                continue;
            }

            params.push(ParsedParam {
                name: name.to_string(),
                modifier,
                value: value.into_owned(),
            });
        }

        Ok(Self {
            raw: raw.to_string(),
            resource_type: resource_type.to_string(),
            params,
            count,
            offset,
        })
    }

    /// The URL exactly as supplied.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn resource_type(&self) -> &str {
        &self.resource_type
    }

    pub fn params(&self) -> &[ParsedParam] {
        &self.params
    }

    /// Every OR alternative of every parameter value.
    pub fn values(&self) -> impl Iterator<Item = &str> {
        self.params.iter().flat_map(ParsedParam::alternatives)
    }

    /// Returns a copy with each value alternative passed through `replace`.
    ///
    /// Used to swap placeholder identities for the real ones before querying.
    /// The raw URL is kept so errors still quote what the client sent.
    #[must_use]
    pub fn substitute(&self, replace: impl Fn(&str) -> Option<String>) -> Self {
        let params = self
            .params
            .iter()
            .map(|p| ParsedParam {
                name: p.name.clone(),
                modifier: p.modifier.clone(),
                value: p
                    .alternatives()
                    .map(|alt| replace(alt).unwrap_or_else(|| alt.to_string()))
                    .collect::<Vec<_>>()
                    .join(","),
            })
            .collect();
        Self {
            raw: self.raw.clone(),
            resource_type: self.resource_type.clone(),
            params,
            count: self.count,
            offset: self.offset,
        }
    }

    /// Normalized form: identical criteria produce identical keys.
    pub fn canonical(&self) -> String {
        let mut parts: Vec<String> = self
            .params
            .iter()
            .map(|p| format!("{}={}", p.key(), p.value))
            .collect();
        parts.sort();
        format!("{}?{}", self.resource_type, parts.join("&"))
    }

    /// Converts to storage search parameters. Without `_count` all matches are returned.
    pub fn to_search_params(&self) -> SearchParams {
        let mut params = self.params.iter().fold(SearchParams::new(), |acc, p| {
            let clause = SearchClause::new(p.name.clone(), p.value.clone());
            let clause = match &p.modifier {
                Some(m) => clause.with_modifier(m.as_str()),
                None => clause,
            };
            acc.with_clause(clause)
        });
        params.count = self.count;
        params.offset = self.offset;
        params
    }
}

impl fmt::Display for MatchUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

fn split_name_and_modifier(key: &str) -> (&str, Option<&str>) {
    match key.split_once(':') {
        Some((name, modifier)) if !modifier.is_empty() => (name, Some(modifier)),
        Some((name, _)) => (name, None),
        None => (key, None),
    }
}

fn parse_control(url: &str, param: &str, value: &str) -> SearchResult<u32> {
    value.parse::<u32>().map_err(|_| SearchError::InvalidControl {
        url: url.to_string(),
        param: param.to_string(),
        message: "must be a non-negative integer".to_string(),
    })
}
