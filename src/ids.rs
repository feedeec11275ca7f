//! Opaque identifiers at the wire boundary.
//!
//! Internally every entity is keyed by a `Ulid`. Clients only ever see the
//! lowercase Crockford base32 form; `decode_id` accepts either case.

use ulid::Ulid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdError(pub String);

impl std::fmt::Display for IdError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid id: {}", self.0)
    }
}

impl std::error::Error for IdError {}

pub fn encode_id(id: Ulid) -> String {
    id.to_string().to_lowercase()
}

pub fn decode_id(token: &str) -> Result<Ulid, IdError> {
    Ulid::from_string(&token.trim().to_uppercase()).map_err(|e| IdError(format!("{token}: {e}")))
}
