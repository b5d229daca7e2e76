use serde::{Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Errors produced while validating a tenant identifier
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenError {
    #[error("Invalid tenant format: {0}")]
    InvalidTenantFormat(String),
}

/// Validated tenant identifier bound to every scoped database operation.
///
/// Only constructible through validation, so holding a `ContextToken` means the
/// identifier is a canonical 36-character UUID. The stored form is the parsed
/// UUID, which makes equality case-insensitive on the textual input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextToken(Uuid);

impl ContextToken {
    /// Length of the hyphenated `8-4-4-4-12` form
    const CANONICAL_LEN: usize = 36;
    const HYPHENS: [usize; 4] = [8, 13, 18, 23];

    /// Parse a raw tenant identifier
    pub fn parse(raw: &str) -> Result<Self, TokenError> {
        if raw.is_empty() {
            return Err(TokenError::InvalidTenantFormat("tenant identifier is empty".to_string()));
        }

        if !Self::has_canonical_shape(raw) {
            return Err(TokenError::InvalidTenantFormat(format!(
                "'{}' is not a canonical UUID",
                Self::preview(raw)
            )));
        }

        Uuid::try_parse(raw)
            .map(ContextToken)
            .map_err(|e| TokenError::InvalidTenantFormat(e.to_string()))
    }

    /// Parse a tenant claim that may be absent; absence is never defaulted
    pub fn from_claim(raw: Option<&str>) -> Result<Self, TokenError> {
        match raw {
            Some(value) => Self::parse(value),
            None => Err(TokenError::InvalidTenantFormat("tenant identifier is null".to_string())),
        }
    }

    /// Canonical lower-cased text, the value written into the tenant marker
    pub fn canonical(&self) -> String {
        self.0.hyphenated().to_string()
    }

    fn has_canonical_shape(raw: &str) -> bool {
        let bytes = raw.as_bytes();
        if bytes.len() != Self::CANONICAL_LEN {
            return false;
        }
        bytes.iter().enumerate().all(|(i, b)| {
            if Self::HYPHENS.contains(&i) {
                *b == b'-'
            } else {
                b.is_ascii_hexdigit()
            }
        })
    }

    // Keep error messages bounded when callers pass garbage
    fn preview(raw: &str) -> String {
        raw.chars().take(40).collect()
    }
}

impl FromStr for ContextToken {
    type Err = TokenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ContextToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl Serialize for ContextToken {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.canonical())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_canonical_uuid() {
        let token = ContextToken::parse("123e4567-e89b-12d3-a456-426614174000").unwrap();
        assert_eq!(token.canonical(), "123e4567-e89b-12d3-a456-426614174000");
    }

    #[test]
    fn equality_ignores_case() {
        let lower = ContextToken::parse("123e4567-e89b-12d3-a456-426614174000").unwrap();
        let upper = ContextToken::parse("123E4567-E89B-12D3-A456-426614174000").unwrap();
        assert_eq!(lower, upper);
        assert_eq!(upper.to_string(), "123e4567-e89b-12d3-a456-426614174000");
    }

    #[test]
    fn rejects_empty_null_and_garbage() {
        assert!(matches!(ContextToken::parse(""), Err(TokenError::InvalidTenantFormat(_))));
        assert!(matches!(ContextToken::parse("not-a-uuid"), Err(TokenError::InvalidTenantFormat(_))));
        assert!(matches!(ContextToken::from_claim(None), Err(TokenError::InvalidTenantFormat(_))));
    }

    #[test]
    fn rejects_non_canonical_uuid_forms() {
        // simple, braced and urn forms all parse as UUIDs but are not canonical text
        assert!(ContextToken::parse("123e4567e89b12d3a456426614174000").is_err());
        assert!(ContextToken::parse("{123e4567-e89b-12d3-a456-426614174000}").is_err());
        assert!(ContextToken::parse("urn:uuid:123e4567-e89b-12d3-a456-426614174000").is_err());
        assert!(ContextToken::parse("123e4567-e89b-12d3-a456-42661417400g").is_err());
        assert!(ContextToken::parse("123e4567-e89b-12d3-a456_426614174000").is_err());
    }

    #[test]
    fn serializes_as_canonical_string() {
        let token: ContextToken = "123E4567-E89B-12D3-A456-426614174000".parse().unwrap();
        let json = serde_json::to_value(token).unwrap();
        assert_eq!(json, serde_json::json!("123e4567-e89b-12d3-a456-426614174000"));
    }
}
