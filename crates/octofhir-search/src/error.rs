use thiserror::Error;

/// Errors raised while parsing a conditional match URL or search query.
///
/// Every variant carries the URL exactly as the client sent it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SearchError {
    #[error("Failed to parse match URL[{url}] - URL is invalid (must not contain spaces)")]
    ContainsSpaces { url: String },

    #[error("Invalid match URL[{url}] - URL has no search parameters")]
    NoParameters { url: String },

    #[error("Invalid match URL[{url}] - URL must specify a resource type")]
    MissingResourceType { url: String },

    #[error("Failed to parse match URL[{url}] - Unknown resource type: {resource_type}")]
    InvalidResourceType { url: String, resource_type: String },

    #[error(
        "Failed to parse match URL[{url}] - Resource type {resource_type} does not have a parameter with name: {name}"
    )]
    UnknownParameter {
        url: String,
        resource_type: String,
        name: String,
    },

    #[error("Failed to parse match URL[{url}] - Modifier :{modifier} is not supported for parameter {name}")]
    UnsupportedModifier {
        url: String,
        name: String,
        modifier: String,
    },

    #[error("Failed to parse match URL[{url}] - Invalid value for {param}: {message}")]
    InvalidControl {
        url: String,
        param: String,
        message: String,
    },
}

impl SearchError {
    /// The match URL that caused this error.
    pub fn url(&self) -> &str {
        match self {
            Self::ContainsSpaces { url }
            | Self::NoParameters { url }
            | Self::MissingResourceType { url }
            | Self::InvalidResourceType { url, .. }
            | Self::UnknownParameter { url, .. }
            | Self::UnsupportedModifier { url, .. }
            | Self::InvalidControl { url, .. } => url,
        }
    }
}

pub type SearchResult<T> = Result<T, SearchError>;
