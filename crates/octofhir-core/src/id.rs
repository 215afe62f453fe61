use thiserror::Error;

const MAX_ID_LEN: usize = 64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdError {
    #[error("Invalid ID: {0}")]
    Invalid(String),
}

/// Generates a server-assigned logical id.
pub fn generate_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Checks a logical id against the FHIR `id` datatype (1-64 of `[A-Za-z0-9-.]`).
pub fn validate_id(id: &str) -> Result<(), IdError> {
    let valid = !id.is_empty()
        && id.len() <= MAX_ID_LEN
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'.');
    if valid {
        Ok(())
    } else {
        Err(IdError::Invalid(id.to_string()))
    }
}
