//! Search parameter definitions and the value syntax around them.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Parameter types from the FHIR search table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchParameterType {
    Number,
    Date,
    String,
    Token,
    Reference,
    Composite,
    Quantity,
    Uri,
    Special,
}

/// The `:modifier` suffix of a parameter name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SearchModifier {
    Exact,
    Contains,
    Not,
    Missing,
    Identifier,
    Below,
    Above,
    /// `subject:Patient`
    Type(String),
}

impl SearchModifier {
    /// A leading uppercase letter makes a resource type modifier.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        let modifier = match s {
            "exact" => Self::Exact,
            "contains" => Self::Contains,
            "not" => Self::Not,
            "missing" => Self::Missing,
            "identifier" => Self::Identifier,
            "below" => Self::Below,
            "above" => Self::Above,
            other if other.starts_with(|c: char| c.is_ascii_uppercase()) => {
                Self::Type(other.to_string())
            }
            _ => return None,
        };
        Some(modifier)
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Exact => "exact",
            Self::Contains => "contains",
            Self::Not => "not",
            Self::Missing => "missing",
            Self::Identifier => "identifier",
            Self::Below => "below",
            Self::Above => "above",
            Self::Type(t) => t,
        }
    }

    pub fn applicable_to(&self, param_type: &SearchParameterType) -> bool {
        use SearchParameterType as T;
        match self {
            Self::Missing => true,
            Self::Exact | Self::Contains => *param_type == T::String,
            Self::Not => *param_type == T::Token,
            Self::Below | Self::Above => matches!(param_type, T::Token | T::Uri),
            Self::Type(_) | Self::Identifier => *param_type == T::Reference,
        }
    }
}

impl fmt::Display for SearchModifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Comparator prefix on date and number values, as in `ge2020-01-01`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchPrefix {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
    /// starts after
    Sa,
    /// ends before
    Eb,
}

const PREFIXES: [(&str, SearchPrefix); 8] = [
    ("eq", SearchPrefix::Eq),
    ("ne", SearchPrefix::Ne),
    ("gt", SearchPrefix::Gt),
    ("lt", SearchPrefix::Lt),
    ("ge", SearchPrefix::Ge),
    ("le", SearchPrefix::Le),
    ("sa", SearchPrefix::Sa),
    ("eb", SearchPrefix::Eb),
];

impl SearchPrefix {
    /// Splits a leading prefix off `value`. A bare prefix with nothing after it
    /// is treated as the value itself.
    pub fn split(value: &str) -> (Option<Self>, &str) {
        for (label, prefix) in PREFIXES {
            if let Some(rest) = value.strip_prefix(label)
                && !rest.is_empty()
            {
                return (Some(prefix), rest);
            }
        }
        (None, value)
    }
}

impl fmt::Display for SearchPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = PREFIXES
            .iter()
            .find(|(_, p)| p == self)
            .map_or("eq", |(label, _)| label);
        f.write_str(label)
    }
}

/// A registered search parameter.
///
/// `expression` is restricted FHIRPath: `Type.path.to.element` alternatives
/// joined by `|`, evaluated by backends as a walk over the JSON.
#[derive(Debug, Clone)]
pub struct SearchParameter {
    pub code: String,
    pub url: String,
    pub param_type: SearchParameterType,
    pub expression: Option<String>,
    pub base: Vec<String>,
    /// Allowed target types of a reference parameter.
    pub target: Vec<String>,
}

impl SearchParameter {
    pub fn new(
        code: impl Into<String>,
        url: impl Into<String>,
        param_type: SearchParameterType,
        base: Vec<String>,
    ) -> Self {
        Self {
            code: code.into(),
            url: url.into(),
            param_type,
            expression: None,
            base,
            target: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_expression(mut self, expr: impl Into<String>) -> Self {
        self.expression = Some(expr.into());
        self
    }

    #[must_use]
    pub fn with_targets(mut self, targets: Vec<String>) -> Self {
        self.target = targets;
        self
    }

    /// Declared on `Resource` or `DomainResource`, so valid for every type.
    pub fn is_common(&self) -> bool {
        self.base.iter().any(|b| is_abstract_base(b))
    }

    /// Element paths below the resource root read for `resource_type`.
    pub fn paths_for(&self, resource_type: &str) -> Vec<Vec<String>> {
        let Some(expression) = &self.expression else {
            return Vec::new();
        };
        expression
            .split('|')
            .filter_map(|alternative| {
                let mut segments = alternative.trim().split('.');
                let head = segments.next()?;
                (head == resource_type || is_abstract_base(head))
                    .then(|| segments.map(str::to_string).collect::<Vec<_>>())
            })
            .filter(|path| !path.is_empty())
            .collect()
    }
}

fn is_abstract_base(name: &str) -> bool {
    name == "Resource" || name == "DomainResource"
}
