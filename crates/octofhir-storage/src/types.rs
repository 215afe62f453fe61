//! Values exchanged between the bundle engine and a backend.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

/// One version of a resource as the backend holds it.
///
/// `resource` already carries `meta.versionId` and `meta.lastUpdated`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredResource {
    pub id: String,
    pub version_id: String,
    pub resource_type: String,
    pub resource: Value,
    #[serde(with = "time::serde::rfc3339")]
    pub last_updated: OffsetDateTime,
    /// Timestamp of version 1; carried unchanged across later versions.
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl StoredResource {
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        version_id: impl Into<String>,
        resource_type: impl Into<String>,
        resource: Value,
    ) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            id: id.into(),
            version_id: version_id.into(),
            resource_type: resource_type.into(),
            resource,
            last_updated: now,
            created_at: now,
        }
    }

    /// Successor version stamped now.
    #[must_use]
    pub fn new_version(&self, version_id: impl Into<String>, resource: Value) -> Self {
        Self {
            version_id: version_id.into(),
            resource,
            last_updated: OffsetDateTime::now_utc(),
            ..self.clone()
        }
    }

    #[must_use]
    pub fn relative_id(&self) -> String {
        format!("{}/{}", self.resource_type, self.id)
    }
}

/// A page of matches.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchResult {
    pub entries: Vec<StoredResource>,
    /// Match count before `count`/`offset` were applied.
    pub total: Option<u32>,
    pub has_more: bool,
}

impl SearchResult {
    #[must_use]
    pub fn with_entries(entries: Vec<StoredResource>) -> Self {
        Self {
            entries,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_total(self, total: u32) -> Self {
        Self {
            total: Some(total),
            ..self
        }
    }

    #[must_use]
    pub fn with_has_more(self, has_more: bool) -> Self {
        Self { has_more, ..self }
    }
}

/// `name[:modifier]=value`. Clauses AND together; commas in `value` OR.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchClause {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modifier: Option<String>,
    pub value: String,
}

impl SearchClause {
    #[must_use]
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            modifier: None,
            value: value.into(),
        }
    }

    #[must_use]
    pub fn with_modifier(self, modifier: impl Into<String>) -> Self {
        Self {
            modifier: Some(modifier.into()),
            ..self
        }
    }

    pub fn alternatives(&self) -> impl Iterator<Item = &str> {
        self.value.split(',').filter(|v| !v.is_empty())
    }
}

/// A parsed criterion ready for a backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchParams {
    pub clauses: Vec<SearchClause>,
    /// `None` returns every match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<u32>,
}

impl SearchParams {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// `name` may carry a `:modifier` suffix.
    #[must_use]
    pub fn with_param(self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        let clause = match name.as_ref().split_once(':') {
            Some((base, modifier)) => SearchClause::new(base, value).with_modifier(modifier),
            None => SearchClause::new(name.as_ref(), value),
        };
        self.with_clause(clause)
    }

    #[must_use]
    pub fn with_clause(mut self, clause: SearchClause) -> Self {
        self.clauses.push(clause);
        self
    }

    #[must_use]
    pub fn with_count(self, count: u32) -> Self {
        Self {
            count: Some(count),
            ..self
        }
    }
}
