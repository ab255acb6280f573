use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use url::Url;

use crate::backend::{Backend, CheckoutRequest, EventKind};
use crate::clock::Clock;
use crate::config::ReturnMarkers;
use crate::host::{Notice, PageHost};
use crate::ids::{OfferId, PurchaseToken};
use crate::ledger;
use crate::persistence::{PersistenceError, PersistencePort, StorageKey};
use crate::widget::OfferWidget;
use crate::SurfaceError;

pub const CANCELLED_NOTICE: &str = "Payment was not completed. You can try again anytime!";
pub const DRAFT_NOTICE: &str = "This product is in draft mode. Checkout is disabled.";
pub const UNAVAILABLE_NOTICE: &str = "This offer is not available right now.";

const SUCCESS_PATH: &str = "payment-processing";
const MARKER_VALUE: &str = "true";

/// Call-to-action state. Stays `Loading` after a redirect since the page is going away.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CtaState {
    #[default]
    Idle,
    Loading,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CheckoutOutcome {
    /// No loaded configuration to check out against.
    Unavailable,
    NotLive,
    Redirected { target: Url, token: PurchaseToken },
    Failed { message: String },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReturnSignal {
    #[default]
    None,
    Success,
    Cancelled,
}

/// Correlation token kept in the ephemeral scope across the payment redirect.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct StoredToken {
    pub token: PurchaseToken,
    #[serde(with = "time::serde::rfc3339")]
    pub minted_at: OffsetDateTime,
}

impl StoredToken {
    /// # Errors
    /// Returns [`PersistenceError`] when the token cannot be encoded.
    pub fn encode(&self) -> Result<String, PersistenceError> {
        serde_json::to_string(self).map_err(|err| PersistenceError(format!("encode token: {err}")))
    }

    /// Older pages stored the bare token string; both shapes decode.
    #[must_use]
    pub fn decode(raw: &str) -> Option<Self> {
        if let Ok(stored) = serde_json::from_str::<Self>(raw) {
            return Some(stored);
        }
        let bare = raw.trim();
        (!bare.is_empty() && !bare.starts_with('{')).then(|| Self {
            token: PurchaseToken::from_stored(bare),
            minted_at: OffsetDateTime::UNIX_EPOCH,
        })
    }
}

/// Read the return-trip marker from a page URL. Success wins if both are present.
#[must_use]
pub fn detect_return(url: &Url, markers: &ReturnMarkers) -> ReturnSignal {
    let flagged = |name: &str| {
        url.query_pairs().any(|(key, value)| key == name && value == MARKER_VALUE)
    };
    if flagged(&markers.success) {
        ReturnSignal::Success
    } else if flagged(&markers.cancelled) {
        ReturnSignal::Cancelled
    } else {
        ReturnSignal::None
    }
}

/// Drop both return markers, keeping every other query pair in order.
#[must_use]
pub fn strip_return_markers(url: &Url, markers: &ReturnMarkers) -> Url {
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| *key != markers.success.as_str() && *key != markers.cancelled.as_str())
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();
    let mut stripped = url.clone();
    if kept.is_empty() {
        stripped.set_query(None);
    } else {
        stripped.query_pairs_mut().clear().extend_pairs(kept);
    }
    stripped
}

/// `{checkout_base}/payment-processing?token=<token>`.
#[must_use]
pub fn success_url(checkout_base: &Url, token: &PurchaseToken) -> Url {
    let mut url = checkout_base.clone();
    if let Ok(mut segments) = url.path_segments_mut() {
        segments.pop_if_empty().push(SUCCESS_PATH);
    }
    url.set_fragment(None);
    url.set_query(None);
    url.query_pairs_mut().append_pair("token", token.as_str());
    url
}

/// The current page annotated with the cancellation marker.
#[must_use]
pub fn cancel_url(current: &Url, markers: &ReturnMarkers) -> Url {
    let mut url = strip_return_markers(current, markers);
    url.query_pairs_mut().append_pair(&markers.cancelled, MARKER_VALUE);
    url
}

impl<S, B, H, C> OfferWidget<S, B, H, C>
where
    S: PersistencePort,
    B: Backend,
    H: PageHost,
    C: Clock,
{
    /// Hand the visitor off to the payment processor.
    ///
    /// Runs the live guard, mints a token, reports the click, asks the backend for a checkout
    /// session and, on success, persists the token and redirects. Failures leave a notice and
    /// an idle call-to-action; nothing is retried.
    ///
    /// # Errors
    /// Returns [`SurfaceError::Persistence`] when the session id or token cannot be stored.
    pub fn attempt_checkout(&mut self) -> Result<CheckoutOutcome, SurfaceError> {
        let (Some(offer), Some(config)) = (self.offer.clone(), self.config.as_ref()) else {
            self.host.notify(Notice::error(UNAVAILABLE_NOTICE));
            return Ok(CheckoutOutcome::Unavailable);
        };
        if !config.live {
            tracing::info!(offer_id = %offer, "checkout blocked for draft offer");
            self.host.notify(Notice::error(DRAFT_NOTICE));
            return Ok(CheckoutOutcome::NotLive);
        }
        let display_mode = config.display_mode;

        self.cta = CtaState::Loading;
        let minted = StoredToken { token: PurchaseToken::mint(), minted_at: self.clock.now() };
        self.report(EventKind::Click, Some(minted.token.clone()), Some(display_mode))?;

        let current = self.host.current_url();
        let request = CheckoutRequest {
            offer_id: offer.clone(),
            session_id: self.session_id()?,
            purchase_token: minted.token.clone(),
            success_url: success_url(&self.options.checkout_base, &minted.token),
            cancel_url: cancel_url(&current, &self.options.markers),
        };

        match self.backend.create_checkout_session(&request) {
            Ok(session) => {
                self.store.set(&StorageKey::purchase_token(&offer), &minted.encode()?)?;
                if let Some(visibility) = self.visibility.as_mut() {
                    visibility.hide_overlay();
                }
                if let Some(trigger) = self.trigger.as_mut() {
                    trigger.disarm(&mut self.host);
                }
                tracing::info!(
                    offer_id = %offer,
                    token = %minted.token,
                    target = %session.redirect_url,
                    "redirecting to checkout"
                );
                self.host.redirect(session.redirect_url.clone());
                Ok(CheckoutOutcome::Redirected { target: session.redirect_url, token: minted.token })
            }
            Err(err) => {
                tracing::warn!(offer_id = %offer, error = %err, "checkout session request failed");
                let message = err.user_message();
                self.host.notify(Notice::error(message.clone()));
                self.cta = CtaState::Idle;
                Ok(CheckoutOutcome::Failed { message })
            }
        }
    }

    /// Consume a return-trip marker left by the payment processor.
    ///
    /// Success records the purchase and forces every surface down. Cancellation posts a notice
    /// and queues the Reminder for after configuration loads. Either way the outstanding token
    /// is consumed and the marker is stripped from the address bar.
    pub(crate) fn reconcile_return(&mut self, offer: &OfferId) -> Result<ReturnSignal, SurfaceError> {
        let url = self.host.current_url();
        let signal = detect_return(&url, &self.options.markers);
        if signal == ReturnSignal::None {
            return Ok(signal);
        }

        let token_key = StorageKey::purchase_token(offer);
        match self.store.get(&token_key)?.as_deref().map(StoredToken::decode) {
            Some(stored) => {
                self.store.remove(&token_key)?;
                tracing::debug!(
                    offer_id = %offer,
                    token = ?stored.map(|stored| stored.token),
                    "purchase token consumed"
                );
            }
            None => tracing::debug!(offer_id = %offer, "return marker without outstanding token"),
        }

        match signal {
            ReturnSignal::Success => {
                ledger::mark_purchased(&mut self.store, offer)?;
                if let Some(visibility) = self.visibility.as_mut() {
                    visibility.hide_all();
                }
            }
            ReturnSignal::Cancelled => {
                self.host.notify(Notice::error(CANCELLED_NOTICE));
                self.pending_reminder = true;
            }
            ReturnSignal::None => {}
        }
        self.host.replace_url(strip_return_markers(&url, &self.options.markers));
        tracing::info!(offer_id = %offer, signal = ?signal, "return trip reconciled");
        Ok(signal)
    }
}
