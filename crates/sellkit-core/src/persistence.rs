use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::ids::OfferId;

const KEY_PREFIX: &str = "mysellkit";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    /// Survives browsing sessions; expiry is read-checked by callers.
    Durable,
    /// Cleared when the browsing session ends.
    Ephemeral,
}

impl Scope {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Durable => "durable",
            Self::Ephemeral => "ephemeral",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    SessionId,
    SessionCreatedAt,
    Purchased,
    SeenAt,
    Impression,
    PurchaseToken,
}

impl Field {
    #[must_use]
    pub fn scope(self) -> Scope {
        match self {
            Self::SessionId | Self::SessionCreatedAt | Self::Purchased | Self::SeenAt => {
                Scope::Durable
            }
            Self::Impression | Self::PurchaseToken => Scope::Ephemeral,
        }
    }

    /// Global fields are shared by every offer on the device.
    #[must_use]
    pub fn is_global(self) -> bool {
        matches!(self, Self::SessionId | Self::SessionCreatedAt)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SessionId => "session_id",
            Self::SessionCreatedAt => "session_created_at",
            Self::Purchased => "purchased",
            Self::SeenAt => "seen_at",
            Self::Impression => "impression",
            Self::PurchaseToken => "purchase_token",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "session_id" => Some(Self::SessionId),
            "session_created_at" => Some(Self::SessionCreatedAt),
            "purchased" => Some(Self::Purchased),
            "seen_at" => Some(Self::SeenAt),
            "impression" => Some(Self::Impression),
            "purchase_token" => Some(Self::PurchaseToken),
            _ => None,
        }
    }

    fn flat_name(self) -> &'static str {
        match self {
            Self::SessionId => "session",
            Self::SessionCreatedAt => "session_time",
            Self::Purchased => "purchased",
            Self::SeenAt => "seen",
            Self::Impression => "impression",
            Self::PurchaseToken => "purchase_token",
        }
    }
}

/// Structured `(scope, offer, field)` address of one stored value.
///
/// The scope is fixed by the field, and only per-offer fields carry an offer id, so keys are
/// built through the named constructors rather than assembled by hand.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct StorageKey {
    field: Field,
    offer: Option<OfferId>,
}

impl StorageKey {
    #[must_use]
    pub fn session_id() -> Self {
        Self { field: Field::SessionId, offer: None }
    }

    #[must_use]
    pub fn session_created_at() -> Self {
        Self { field: Field::SessionCreatedAt, offer: None }
    }

    #[must_use]
    pub fn purchased(offer: &OfferId) -> Self {
        Self::for_offer(Field::Purchased, offer)
    }

    #[must_use]
    pub fn seen_at(offer: &OfferId) -> Self {
        Self::for_offer(Field::SeenAt, offer)
    }

    #[must_use]
    pub fn impression(offer: &OfferId) -> Self {
        Self::for_offer(Field::Impression, offer)
    }

    #[must_use]
    pub fn purchase_token(offer: &OfferId) -> Self {
        Self::for_offer(Field::PurchaseToken, offer)
    }

    fn for_offer(field: Field, offer: &OfferId) -> Self {
        Self { field, offer: Some(offer.clone()) }
    }

    /// Rebuild a key from its stored parts. Returns `None` when the offer presence does not
    /// match the field.
    #[must_use]
    pub fn from_parts(field: Field, offer: Option<OfferId>) -> Option<Self> {
        if field.is_global() == offer.is_none() {
            Some(Self { field, offer })
        } else {
            None
        }
    }

    #[must_use]
    pub fn scope(&self) -> Scope {
        self.field.scope()
    }

    #[must_use]
    pub fn field(&self) -> Field {
        self.field
    }

    #[must_use]
    pub fn offer(&self) -> Option<&OfferId> {
        self.offer.as_ref()
    }
}

impl Display for StorageKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.offer {
            Some(offer) => write!(f, "{KEY_PREFIX}_{}_{offer}", self.field.flat_name()),
            None => write!(f, "{KEY_PREFIX}_{}", self.field.flat_name()),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
#[error("persistence error: {0}")]
pub struct PersistenceError(pub String);

/// Synchronous key-value access to the durable and ephemeral scopes.
///
/// Implementations route each key to the scope returned by [`StorageKey::scope`].
pub trait PersistencePort {
    /// # Errors
    /// Returns [`PersistenceError`] when the backing store cannot be read.
    fn get(&self, key: &StorageKey) -> Result<Option<String>, PersistenceError>;

    /// # Errors
    /// Returns [`PersistenceError`] when the backing store cannot be written.
    fn set(&mut self, key: &StorageKey, value: &str) -> Result<(), PersistenceError>;

    /// # Errors
    /// Returns [`PersistenceError`] when the backing store cannot be written.
    fn remove(&mut self, key: &StorageKey) -> Result<(), PersistenceError>;

    /// # Errors
    /// Propagates read failures.
    fn get_flag(&self, key: &StorageKey) -> Result<bool, PersistenceError> {
        Ok(self.get(key)?.as_deref() == Some("true"))
    }

    /// # Errors
    /// Propagates write failures.
    fn set_flag(&mut self, key: &StorageKey) -> Result<(), PersistenceError> {
        self.set(key, "true")
    }

    /// Read a unix-millisecond timestamp. Unparseable values read as absent.
    ///
    /// # Errors
    /// Propagates read failures.
    fn get_timestamp(&self, key: &StorageKey) -> Result<Option<OffsetDateTime>, PersistenceError> {
        let Some(raw) = self.get(key)? else {
            return Ok(None);
        };
        let parsed = raw
            .trim()
            .parse::<i128>()
            .ok()
            .and_then(|millis| millis.checked_mul(1_000_000))
            .and_then(|nanos| OffsetDateTime::from_unix_timestamp_nanos(nanos).ok());
        if parsed.is_none() {
            tracing::debug!(key = %key, value = %raw, "ignoring unparseable stored timestamp");
        }
        Ok(parsed)
    }

    /// # Errors
    /// Propagates write failures.
    fn set_timestamp(&mut self, key: &StorageKey, at: OffsetDateTime) -> Result<(), PersistenceError> {
        let millis = at.unix_timestamp_nanos() / 1_000_000;
        self.set(key, &millis.to_string())
    }
}

impl<P: PersistencePort + ?Sized> PersistencePort for &mut P {
    fn get(&self, key: &StorageKey) -> Result<Option<String>, PersistenceError> {
        (**self).get(key)
    }

    fn set(&mut self, key: &StorageKey, value: &str) -> Result<(), PersistenceError> {
        (**self).set(key, value)
    }

    fn remove(&mut self, key: &StorageKey) -> Result<(), PersistenceError> {
        (**self).remove(key)
    }
}

/// In-memory port used by tests and by offline page simulations.
#[derive(Debug, Clone, Default)]
pub struct MemoryPersistence {
    durable: BTreeMap<StorageKey, String>,
    ephemeral: BTreeMap<StorageKey, String>,
}

impl MemoryPersistence {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop the ephemeral scope, as closing the browser tab would.
    pub fn end_browsing_session(&mut self) {
        self.ephemeral.clear();
    }

    #[must_use]
    pub fn len(&self, scope: Scope) -> usize {
        self.map(scope).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.durable.is_empty() && self.ephemeral.is_empty()
    }

    fn map(&self, scope: Scope) -> &BTreeMap<StorageKey, String> {
        match scope {
            Scope::Durable => &self.durable,
            Scope::Ephemeral => &self.ephemeral,
        }
    }

    fn map_mut(&mut self, scope: Scope) -> &mut BTreeMap<StorageKey, String> {
        match scope {
            Scope::Durable => &mut self.durable,
            Scope::Ephemeral => &mut self.ephemeral,
        }
    }
}

impl PersistencePort for MemoryPersistence {
    fn get(&self, key: &StorageKey) -> Result<Option<String>, PersistenceError> {
        Ok(self.map(key.scope()).get(key).cloned())
    }

    fn set(&mut self, key: &StorageKey, value: &str) -> Result<(), PersistenceError> {
        self.map_mut(key.scope()).insert(key.clone(), value.to_string());
        Ok(())
    }

    fn remove(&mut self, key: &StorageKey) -> Result<(), PersistenceError> {
        self.map_mut(key.scope()).remove(key);
        Ok(())
    }
}
