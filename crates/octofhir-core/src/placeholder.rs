//! Temporary identities used by bundle entries before the server assigns real ids.
//!
//! Two syntaxes are recognized: `urn:uuid:<uuid>` and `urn:oid:<dotted oid>`.
//! Any other value carrying a URI scheme (besides `http`/`https`) is rejected, so a
//! typo such as `cid:observation1` fails loudly instead of being stored verbatim.

use std::fmt;

use uuid::Uuid;

use crate::error::{CoreError, Result};

const UUID_PREFIX: &str = "urn:uuid:";
const OID_PREFIX: &str = "urn:oid:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlaceholderKind {
    Uuid,
    Oid,
}

/// A validated placeholder identity, kept in its original textual form.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Placeholder {
    raw: String,
    kind: PlaceholderKind,
}

impl Placeholder {
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn kind(&self) -> PlaceholderKind {
        self.kind
    }
}

impl fmt::Display for Placeholder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Parses a value that may be a placeholder.
///
/// Returns `Ok(None)` for values that are not scheme-prefixed at all (relative
/// references, bare ids) and for `http(s)` URLs. Returns an error for any other
/// scheme-prefixed value that is not a well-formed UUID or OID URN.
pub fn parse_placeholder(value: &str) -> Result<Option<Placeholder>> {
    if let Some(rest) = value.strip_prefix(UUID_PREFIX) {
        return match Uuid::parse_str(rest) {
            Ok(_) => Ok(Some(Placeholder {
                raw: value.to_string(),
                kind: PlaceholderKind::Uuid,
            })),
            Err(_) => Err(CoreError::invalid_placeholder(value)),
        };
    }

    if let Some(rest) = value.strip_prefix(OID_PREFIX) {
        return if is_valid_oid(rest) {
            Ok(Some(Placeholder {
                raw: value.to_string(),
                kind: PlaceholderKind::Oid,
            }))
        } else {
            Err(CoreError::invalid_placeholder(value))
        };
    }

    match uri_scheme(value) {
        None => Ok(None),
        Some(scheme) if scheme.eq_ignore_ascii_case("http") || scheme.eq_ignore_ascii_case("https") => {
            Ok(None)
        }
        Some(_) => Err(CoreError::invalid_placeholder(value)),
    }
}

/// True when the value is a syntactically valid placeholder.
pub fn is_placeholder(value: &str) -> bool {
    matches!(parse_placeholder(value), Ok(Some(_)))
}

/// Returns the URI scheme of `value` when it has one (`scheme:rest`).
fn uri_scheme(value: &str) -> Option<&str> {
    let (scheme, _) = value.split_once(':')?;
    let mut chars = scheme.chars();
    let first = chars.next()?;
    if !first.is_ascii_alphabetic() {
        return None;
    }
    chars
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
        .then_some(scheme)
}

/// `^[0-2](\.(0|[1-9][0-9]*))+$`
fn is_valid_oid(oid: &str) -> bool {
    let mut arcs = oid.split('.');
    let root_ok = matches!(arcs.next(), Some("0" | "1" | "2"));
    let mut count = 0;
    for arc in arcs {
        count += 1;
        let ok = !arc.is_empty()
            && arc.bytes().all(|b| b.is_ascii_digit())
            && (arc == "0" || !arc.starts_with('0'));
        if !ok {
            return false;
        }
    }
    root_ok && count > 0
}
