use std::cell::RefCell;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use sellkit_core::{
    Backend, BackendError, CheckoutRequest, CheckoutSession, EventReport, OfferConfig, OfferId,
};
use serde::Deserialize;
use serde_json::Value;

use crate::{parse_checkout_envelope, parse_config_envelope};

/// Offline fixture: the envelopes the backend would have answered with.
///
/// ```yaml
/// config:
///   response:
///     success: "yes"
///     is_live: "yes"
///     trigger_type: time
///     trigger_value: 5
/// checkout:
///   response:
///     success: "yes"
///     checkout_url: https://pay.example/cs_demo
/// ```
#[derive(Debug, Clone, Deserialize)]
struct Fixture {
    config: Value,
    #[serde(default)]
    checkout: Option<Value>,
}

/// [`Backend`] answering from a fixture file and recording what the widget sent.
#[derive(Debug, Default)]
pub struct StaticBackend {
    config: Value,
    checkout: Option<Value>,
    events: RefCell<Vec<EventReport>>,
    checkout_requests: RefCell<Vec<CheckoutRequest>>,
}

impl StaticBackend {
    /// # Errors
    /// Returns an error when the fixture cannot be read or is not valid YAML of the fixture
    /// shape.
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read offer fixture {}", path.display()))?;
        Self::from_yaml_str(&raw).with_context(|| format!("invalid offer fixture {}", path.display()))
    }

    /// # Errors
    /// Returns an error when `raw` is not valid YAML of the fixture shape.
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let fixture: Fixture = serde_yaml::from_str(raw).context("failed to parse fixture yaml")?;
        Ok(Self {
            config: fixture.config,
            checkout: fixture.checkout,
            ..Self::default()
        })
    }

    #[must_use]
    pub fn events(&self) -> Vec<EventReport> {
        self.events.borrow().clone()
    }

    #[must_use]
    pub fn checkout_requests(&self) -> Vec<CheckoutRequest> {
        self.checkout_requests.borrow().clone()
    }
}

impl Backend for StaticBackend {
    fn fetch_config(&self, offer: &OfferId) -> Result<OfferConfig, BackendError> {
        parse_config_envelope(offer, &self.config)
    }

    fn report_event(&self, report: &EventReport) -> Result<(), BackendError> {
        self.events.borrow_mut().push(report.clone());
        Ok(())
    }

    fn create_checkout_session(
        &self,
        request: &CheckoutRequest,
    ) -> Result<CheckoutSession, BackendError> {
        self.checkout_requests.borrow_mut().push(request.clone());
        match &self.checkout {
            Some(envelope) => parse_checkout_envelope(envelope),
            None => Err(BackendError::Transport("fixture has no checkout response".to_string())),
        }
    }
}
