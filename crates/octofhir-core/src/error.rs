use thiserror::Error;

use crate::fhir_reference::UnresolvableReference;
use crate::id::IdError;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error(
        "Invalid placeholder ID found: {0} - Must be of the form 'urn:uuid:[uuid]' or 'urn:oid:[oid]'"
    )]
    InvalidPlaceholder(String),

    #[error(transparent)]
    InvalidId(#[from] IdError),

    #[error(transparent)]
    Reference(#[from] UnresolvableReference),
}

impl CoreError {
    pub fn invalid_placeholder(value: impl Into<String>) -> Self {
        Self::InvalidPlaceholder(value.into())
    }

    /// The offending text as the client sent it.
    pub fn value(&self) -> &str {
        match self {
            Self::InvalidPlaceholder(value) | Self::InvalidId(IdError::Invalid(value)) => value,
            Self::Reference(
                UnresolvableReference::Contained(value)
                | UnresolvableReference::Urn(value)
                | UnresolvableReference::External(value)
                | UnresolvableReference::Invalid(value),
            ) => value,
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::validate_id;

    #[test]
    fn test_invalid_placeholder_message_names_value() {
        let err = CoreError::invalid_placeholder("cid:observation1");
        assert_eq!(
            err.to_string(),
            "Invalid placeholder ID found: cid:observation1 - Must be of the form 'urn:uuid:[uuid]' or 'urn:oid:[oid]'"
        );
        assert_eq!(err.value(), "cid:observation1");
    }

    #[test]
    fn test_conversions_keep_source_message() {
        let err: CoreError = validate_id("bad id").unwrap_err().into();
        assert_eq!(err.to_string(), "Invalid ID: bad id");
        assert_eq!(err.value(), "bad id");

        let err: CoreError = UnresolvableReference::External("http://x/Patient/1".into()).into();
        assert!(matches!(err, CoreError::Reference(_)));
        assert_eq!(err.to_string(), "external reference: http://x/Patient/1");
    }
}
