use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use crate::ids::SessionId;
use crate::persistence::{PersistenceError, PersistencePort, StorageKey};

/// Rolling validity of a stored session identity.
pub const SESSION_TTL: Duration = Duration::hours(24);

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SessionIdentity {
    pub id: SessionId,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl SessionIdentity {
    #[must_use]
    pub fn is_fresh(&self, now: OffsetDateTime) -> bool {
        now - self.created_at < SESSION_TTL
    }
}

/// Pseudo-session identity for one page load.
#[derive(Debug, Clone, Default)]
pub struct IdentityManager {
    diagnostic: bool,
    diagnostic_id: Option<SessionId>,
}

impl IdentityManager {
    #[must_use]
    pub fn new(diagnostic: bool) -> Self {
        Self { diagnostic, diagnostic_id: None }
    }

    /// Current session id.
    ///
    /// Diagnostic loads get one freshly minted id that never touches storage. Otherwise the
    /// stored identity is reused while younger than [`SESSION_TTL`] and replaced when stale or
    /// absent.
    ///
    /// # Errors
    /// Propagates persistence failures.
    pub fn session_id<S: PersistencePort>(
        &mut self,
        store: &mut S,
        now: OffsetDateTime,
    ) -> Result<SessionId, PersistenceError> {
        if self.diagnostic {
            return Ok(self.diagnostic_id.get_or_insert_with(SessionId::mint_diagnostic).clone());
        }
        if let Some(identity) = Self::stored(store)? {
            if identity.is_fresh(now) {
                return Ok(identity.id);
            }
            tracing::debug!(session_id = %identity.id, "stored session identity expired");
        }
        let id = SessionId::mint();
        store.set(&StorageKey::session_id(), id.as_str())?;
        store.set_timestamp(&StorageKey::session_created_at(), now)?;
        tracing::debug!(session_id = %id, "minted session identity");
        Ok(id)
    }

    /// Read the stored identity without minting. Half-written identities read as absent.
    ///
    /// # Errors
    /// Propagates persistence failures.
    pub fn stored<S: PersistencePort>(store: &S) -> Result<Option<SessionIdentity>, PersistenceError> {
        let id = store.get(&StorageKey::session_id())?;
        let created_at = store.get_timestamp(&StorageKey::session_created_at())?;
        Ok(match (id, created_at) {
            (Some(id), Some(created_at)) if !id.is_empty() => {
                Some(SessionIdentity { id: SessionId::from_stored(id), created_at })
            }
            _ => None,
        })
    }
}
