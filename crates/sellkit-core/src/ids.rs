use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::SurfaceError;

const SESSION_PREFIX: &str = "msk_";
const DIAGNOSTIC_SESSION_PREFIX: &str = "msk_debug_";
const TOKEN_PREFIX: &str = "pt_";

/// Opaque identifier of the offer a surface advertises.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct OfferId(String);

impl OfferId {
    /// Validate and wrap a raw offer identifier.
    ///
    /// # Errors
    /// Returns [`SurfaceError::Validation`] when the identifier is blank or contains
    /// whitespace or control characters.
    pub fn parse(raw: &str) -> Result<Self, SurfaceError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(SurfaceError::Validation("offer id MUST be non-empty".to_string()));
        }
        if trimmed.chars().any(|ch| ch.is_whitespace() || ch.is_control()) {
            return Err(SurfaceError::Validation(format!(
                "offer id MUST NOT contain whitespace or control characters: {trimmed:?}"
            )));
        }
        Ok(Self(trimmed.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for OfferId {
    type Error = SurfaceError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<OfferId> for String {
    fn from(value: OfferId) -> Self {
        value.0
    }
}

impl Display for OfferId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    #[must_use]
    pub fn mint() -> Self {
        Self(format!("{SESSION_PREFIX}{}", Ulid::new().to_string().to_lowercase()))
    }

    /// Identifier for a diagnostic page load. Never persisted.
    #[must_use]
    pub fn mint_diagnostic() -> Self {
        Self(format!("{DIAGNOSTIC_SESSION_PREFIX}{}", Ulid::new().to_string().to_lowercase()))
    }

    #[must_use]
    pub fn from_stored(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    #[must_use]
    pub fn is_diagnostic(&self) -> bool {
        self.0.starts_with(DIAGNOSTIC_SESSION_PREFIX)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for SessionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Correlation token minted for one checkout attempt.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct PurchaseToken(String);

impl PurchaseToken {
    #[must_use]
    pub fn mint() -> Self {
        Self(format!("{TOKEN_PREFIX}{}", Ulid::new().to_string().to_lowercase()))
    }

    #[must_use]
    pub fn from_stored(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for PurchaseToken {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offer_id_trims_and_rejects_blank_or_spaced_values() {
        match OfferId::parse("  offer-42 ") {
            Ok(id) => assert_eq!(id.as_str(), "offer-42"),
            Err(err) => panic!("offer id should parse: {err}"),
        }
        assert!(OfferId::parse("   ").is_err());
        assert!(OfferId::parse("two words").is_err());
    }

    #[test]
    fn minted_identifiers_carry_their_prefixes_and_differ() {
        let first = PurchaseToken::mint();
        let second = PurchaseToken::mint();
        assert!(first.as_str().starts_with("pt_"));
        assert_ne!(first, second);

        assert!(SessionId::mint().as_str().starts_with("msk_"));
        assert!(!SessionId::mint().is_diagnostic());
        assert!(SessionId::mint_diagnostic().is_diagnostic());
    }

    #[test]
    fn offer_id_deserialization_runs_validation() {
        let parsed: Result<OfferId, _> = serde_json::from_str("\"\"");
        assert!(parsed.is_err());
    }
}
