use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use url::Url;

use crate::config::{DisplayMode, OfferConfig};
use crate::ids::{OfferId, PurchaseToken, SessionId};

pub const CONNECTION_ERROR_MESSAGE: &str =
    "Connection error. Please check your internet and try again.";
pub const CHECKOUT_ERROR_PREFIX: &str = "Unable to start checkout.";
pub const CHECKOUT_FALLBACK_DETAIL: &str = "Please try again or contact support.";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Impression,
    Click,
    Close,
}

impl EventKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Impression => "impression",
            Self::Click => "click",
            Self::Close => "close",
        }
    }
}

/// One analytics event. Delivery is best effort.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct EventReport {
    pub offer_id: OfferId,
    pub session_id: SessionId,
    pub kind: EventKind,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub page_url: String,
    pub user_agent: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub purchase_token: Option<PurchaseToken>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_mode: Option<DisplayMode>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CheckoutRequest {
    pub offer_id: OfferId,
    pub session_id: SessionId,
    pub purchase_token: PurchaseToken,
    pub success_url: Url,
    pub cancel_url: Url,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CheckoutSession {
    pub redirect_url: Url,
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum BackendError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("malformed response: {0}")]
    Malformed(String),
    /// The backend answered and said no. `detail` is the visitor-facing reason when one was
    /// supplied.
    #[error("request rejected: {}", detail.as_deref().unwrap_or("no detail"))]
    Rejected { detail: Option<String> },
}

impl BackendError {
    /// Text for the checkout failure notice.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::Transport(_) | Self::Timeout(_) => CONNECTION_ERROR_MESSAGE.to_string(),
            Self::Rejected { detail: Some(detail) } => format!("{CHECKOUT_ERROR_PREFIX} {detail}"),
            Self::Rejected { detail: None } | Self::Malformed(_) => {
                format!("{CHECKOUT_ERROR_PREFIX} {CHECKOUT_FALLBACK_DETAIL}")
            }
        }
    }
}

/// Remote configuration, analytics and checkout endpoints.
///
/// Calls block the single page thread until they settle; implementations bound them with a
/// timeout and report expiry as [`BackendError::Timeout`]. Nothing here retries.
pub trait Backend {
    /// # Errors
    /// Returns [`BackendError`] on transport failure, timeout, a negative answer or an envelope
    /// that cannot be read as an offer configuration.
    fn fetch_config(&self, offer: &OfferId) -> Result<OfferConfig, BackendError>;

    /// # Errors
    /// Returns [`BackendError`] when the event could not be delivered. Callers swallow it.
    fn report_event(&self, report: &EventReport) -> Result<(), BackendError>;

    /// # Errors
    /// Returns [`BackendError`] when no usable redirect target came back.
    fn create_checkout_session(
        &self,
        request: &CheckoutRequest,
    ) -> Result<CheckoutSession, BackendError>;
}

impl<B: Backend + ?Sized> Backend for &B {
    fn fetch_config(&self, offer: &OfferId) -> Result<OfferConfig, BackendError> {
        (**self).fetch_config(offer)
    }

    fn report_event(&self, report: &EventReport) -> Result<(), BackendError> {
        (**self).report_event(report)
    }

    fn create_checkout_session(
        &self,
        request: &CheckoutRequest,
    ) -> Result<CheckoutSession, BackendError> {
        (**self).create_checkout_session(request)
    }
}
