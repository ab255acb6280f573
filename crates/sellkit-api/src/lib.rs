//! Backend client for the offer surface: wire envelopes, an HTTP transport and an offline
//! fixture backend.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use sellkit_core::backend::{CHECKOUT_ERROR_PREFIX, CHECKOUT_FALLBACK_DETAIL};
use sellkit_core::{
    BackendError, CheckoutRequest, CheckoutSession, DisplayMode, DisplayOptions, EventReport,
    OfferConfig, OfferId, TriggerKind,
};
use serde_json::{json, Map, Value};
use url::Url;

mod fixture;
mod http;

pub use fixture::StaticBackend;
pub use http::HttpBackend;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

pub const CONFIG_PATH: &str = "get-popup-config";
pub const EVENT_PATH: &str = "track-event";
pub const CHECKOUT_PATH: &str = "create-checkout-session";

const CHECKOUT_DECLINED_DETAIL: &str = "The checkout session could not be created.";
const YES: &str = "yes";
const COLOR_PREFIX: &str = "color_";

/// Wire keys folded into typed [`OfferConfig`] fields. Everything else is presentation.
const TYPED_KEYS: &[&str] = &[
    "success",
    "is_live",
    "trigger_type",
    "trigger_value",
    "persistent_mode",
    "mobile_floating",
    "display_mode",
    "show_price",
    "cta_text",
    "colors",
];

/// Where the backend lives and how long a call may take.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendConfig {
    pub api_base: Url,
    pub checkout_base: Url,
    pub timeout: Duration,
}

impl BackendConfig {
    /// # Errors
    /// Returns an error when either base is not an absolute http(s) URL.
    pub fn new(api_base: &str, checkout_base: &str) -> Result<Self> {
        Ok(Self {
            api_base: parse_base(api_base).context("invalid api base")?,
            checkout_base: parse_base(checkout_base).context("invalid checkout base")?,
            timeout: DEFAULT_TIMEOUT,
        })
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Resolve an endpoint under `api_base`, keeping any path prefix the base carries.
    ///
    /// # Errors
    /// Returns an error when the base cannot carry path segments.
    pub fn endpoint(&self, path: &str) -> Result<Url> {
        let mut url = self.api_base.clone();
        url.path_segments_mut()
            .map_err(|()| anyhow!("api base {} cannot carry a path", self.api_base))?
            .pop_if_empty()
            .push(path);
        Ok(url)
    }
}

fn parse_base(raw: &str) -> Result<Url> {
    let url = Url::parse(raw.trim()).with_context(|| format!("failed to parse url {raw}"))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(anyhow!("url {raw} MUST use http or https"));
    }
    Ok(url)
}

/// Read a `get-popup-config` envelope into a typed configuration for `offer`.
///
/// # Errors
/// Returns [`BackendError::Malformed`] when the envelope is missing and
/// [`BackendError::Rejected`] when the backend answered `success != "yes"`.
pub fn parse_config_envelope(offer: &OfferId, body: &Value) -> Result<OfferConfig, BackendError> {
    let response = body
        .get("response")
        .and_then(Value::as_object)
        .ok_or_else(|| BackendError::Malformed("missing response envelope".to_string()))?;
    if text(response, "success") != Some(YES) {
        return Err(BackendError::Rejected { detail: text(response, "error").map(str::to_string) });
    }

    let trigger = TriggerKind::from_wire(text(response, "trigger_type"), number(response.get("trigger_value")));
    let display_mode = match text(response, "display_mode") {
        Some(raw) => DisplayMode::parse(raw).unwrap_or_else(|| {
            tracing::debug!(display_mode = raw, "unrecognised display mode, using overlay");
            DisplayMode::default()
        }),
        None => DisplayMode::default(),
    };

    let mut display = DisplayOptions {
        show_price: text(response, "show_price") != Some("no"),
        cta_text: text(response, "cta_text").filter(|cta| !cta.trim().is_empty()).map(str::to_string),
        ..DisplayOptions::default()
    };
    if let Some(colors) = response.get("colors").and_then(Value::as_object) {
        for (name, value) in colors {
            if let Some(value) = value.as_str() {
                display.colors.insert(name.clone(), value.to_string());
            }
        }
    }

    let mut presentation = Map::new();
    for (key, value) in response {
        if TYPED_KEYS.contains(&key.as_str()) {
            continue;
        }
        if let Some(color) = key.strip_prefix(COLOR_PREFIX) {
            if let Some(value) = value.as_str() {
                display.colors.insert(color.to_string(), value.to_string());
            }
            continue;
        }
        let value = match (key.as_str(), value.as_str()) {
            ("image", Some(image)) => Value::String(normalize_image_url(image)),
            _ => value.clone(),
        };
        presentation.insert(key.clone(), value);
    }

    Ok(OfferConfig {
        offer_id: offer.clone(),
        live: text(response, "is_live") == Some(YES),
        trigger,
        persistent_mode: text(response, "persistent_mode") == Some(YES),
        mobile_reminder: text(response, "mobile_floating") == Some(YES),
        display_mode,
        display,
        presentation,
    })
}

/// Read a `create-checkout-session` envelope.
///
/// # Errors
/// Returns [`BackendError::Rejected`] unless the envelope carries `success == "yes"` and a
/// checkout URL, or [`BackendError::Malformed`] when that URL does not parse.
pub fn parse_checkout_envelope(body: &Value) -> Result<CheckoutSession, BackendError> {
    let response = body.get("response").and_then(Value::as_object);
    if let Some(response) = response {
        if let (Some(YES), Some(raw)) = (text(response, "success"), text(response, "checkout_url")) {
            let redirect_url = Url::parse(raw)
                .map_err(|err| BackendError::Malformed(format!("checkout_url {raw}: {err}")))?;
            return Ok(CheckoutSession { redirect_url });
        }
    }
    Err(BackendError::Rejected { detail: checkout_error_detail(body) })
}

/// The visitor-facing reason carried by a failed checkout envelope, if any.
#[must_use]
pub fn checkout_error_detail(body: &Value) -> Option<String> {
    let response = body.get("response").and_then(Value::as_object);
    if let Some(error) = response.and_then(|response| text(response, "error")) {
        return Some(error.to_string());
    }
    if let Some(error) = body.get("error").and_then(Value::as_str) {
        return Some(error.to_string());
    }
    if response.and_then(|response| text(response, "success")) == Some("no") {
        return Some(CHECKOUT_DECLINED_DETAIL.to_string());
    }
    None
}

/// Full checkout notice text for a failed envelope.
#[must_use]
pub fn checkout_error_message(body: &Value) -> String {
    let detail = checkout_error_detail(body);
    format!("{CHECKOUT_ERROR_PREFIX} {}", detail.as_deref().unwrap_or(CHECKOUT_FALLBACK_DETAIL))
}

/// Protocol-relative image URLs (`//cdn/...`) are pinned to https.
#[must_use]
pub fn normalize_image_url(raw: &str) -> String {
    if raw.starts_with("//") {
        format!("https:{raw}")
    } else {
        raw.to_string()
    }
}

#[must_use]
pub fn event_payload(report: &EventReport) -> Value {
    let mut payload = json!({
        "popup_id": report.offer_id.as_str(),
        "session_id": report.session_id.as_str(),
        "event_type": report.kind.as_str(),
        "timestamp": unix_millis(report.timestamp),
        "page_url": report.page_url,
        "user_agent": report.user_agent,
    });
    if let Some(fields) = payload.as_object_mut() {
        if let Some(token) = &report.purchase_token {
            fields.insert("purchase_token".to_string(), Value::String(token.as_str().to_string()));
        }
        if let Some(mode) = report.display_mode {
            fields.insert("display_mode".to_string(), Value::String(mode.as_str().to_string()));
        }
    }
    payload
}

#[must_use]
pub fn checkout_payload(request: &CheckoutRequest) -> Value {
    json!({
        "popup_id": request.offer_id.as_str(),
        "session_id": request.session_id.as_str(),
        "purchase_token": request.purchase_token.as_str(),
        "success_url": request.success_url.as_str(),
        "cancel_url": request.cancel_url.as_str(),
    })
}

fn unix_millis(at: time::OffsetDateTime) -> i64 {
    i64::try_from(at.unix_timestamp_nanos() / 1_000_000).unwrap_or(i64::MAX)
}

fn text<'a>(fields: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    fields.get(key).and_then(Value::as_str)
}

/// `trigger_value` arrives as a number or a numeric string.
fn number(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(number) => number.as_f64(),
        Value::String(raw) => raw.trim().parse::<f64>().ok(),
        _ => None,
    }
}
