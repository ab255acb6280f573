//! Per-offer purchase record. Once set it is never cleared by this crate.

use crate::ids::OfferId;
use crate::persistence::{PersistenceError, PersistencePort, StorageKey};

/// # Errors
/// Propagates persistence failures.
pub fn has_purchased<S: PersistencePort + ?Sized>(
    store: &S,
    offer: &OfferId,
) -> Result<bool, PersistenceError> {
    store.get_flag(&StorageKey::purchased(offer))
}

/// Record a confirmed purchase. Returns `true` only when the record was newly set.
///
/// # Errors
/// Propagates persistence failures.
pub fn mark_purchased<S: PersistencePort + ?Sized>(
    store: &mut S,
    offer: &OfferId,
) -> Result<bool, PersistenceError> {
    if has_purchased(store, offer)? {
        return Ok(false);
    }
    store.set_flag(&StorageKey::purchased(offer))?;
    tracing::info!(offer_id = %offer, "offer marked as purchased");
    Ok(true)
}
