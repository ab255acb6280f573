use std::io;

use sellkit_core::{
    Backend, BackendError, CheckoutRequest, CheckoutSession, EventReport, OfferConfig, OfferId,
};
use serde_json::Value;
use url::Url;

use crate::{
    checkout_payload, event_payload, parse_checkout_envelope, parse_config_envelope,
    BackendConfig, CHECKOUT_PATH, CONFIG_PATH, EVENT_PATH,
};

/// Blocking [`Backend`] over HTTP. Each call is bounded by [`BackendConfig::timeout`] and is
/// attempted exactly once.
pub struct HttpBackend {
    config: BackendConfig,
    agent: ureq::Agent,
}

impl HttpBackend {
    #[must_use]
    pub fn new(config: BackendConfig) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(config.timeout)
            .timeout(config.timeout)
            .build();
        Self { config, agent }
    }

    #[must_use]
    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    fn endpoint(&self, path: &str) -> Result<Url, BackendError> {
        self.config.endpoint(path).map_err(|err| BackendError::Transport(format!("{err:#}")))
    }

    fn read_json(&self, response: ureq::Response) -> Result<Value, BackendError> {
        response.into_json::<Value>().map_err(|err| self.classify_io(&err))
    }

    fn classify_io(&self, err: &io::Error) -> BackendError {
        if matches!(err.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) {
            BackendError::Timeout(self.config.timeout)
        } else if err.kind() == io::ErrorKind::InvalidData {
            BackendError::Malformed(err.to_string())
        } else {
            BackendError::Transport(err.to_string())
        }
    }

    fn classify_transport(&self, err: &ureq::Transport) -> BackendError {
        if is_timeout(err) || (err.kind() == ureq::ErrorKind::Io && err.to_string().contains("timed out")) {
            BackendError::Timeout(self.config.timeout)
        } else {
            BackendError::Transport(err.to_string())
        }
    }
}

impl Backend for HttpBackend {
    fn fetch_config(&self, offer: &OfferId) -> Result<OfferConfig, BackendError> {
        let url = self.endpoint(CONFIG_PATH)?;
        tracing::debug!(offer_id = %offer, url = %url, "fetching offer config");
        let body = match self.agent.request_url("GET", &url).query("popup_id", offer.as_str()).call() {
            Ok(response) => self.read_json(response)?,
            Err(ureq::Error::Status(code, _)) => {
                return Err(BackendError::Transport(format!("config fetch failed with http status {code}")));
            }
            Err(ureq::Error::Transport(err)) => return Err(self.classify_transport(&err)),
        };
        parse_config_envelope(offer, &body)
    }

    fn report_event(&self, report: &EventReport) -> Result<(), BackendError> {
        let url = self.endpoint(EVENT_PATH)?;
        match self.agent.request_url("POST", &url).send_json(event_payload(report)) {
            Ok(_) => {
                tracing::debug!(offer_id = %report.offer_id, event = report.kind.as_str(), "event reported");
                Ok(())
            }
            Err(ureq::Error::Status(code, _)) => {
                Err(BackendError::Transport(format!("event report failed with http status {code}")))
            }
            Err(ureq::Error::Transport(err)) => Err(self.classify_transport(&err)),
        }
    }

    fn create_checkout_session(
        &self,
        request: &CheckoutRequest,
    ) -> Result<CheckoutSession, BackendError> {
        let url = self.endpoint(CHECKOUT_PATH)?;
        let body = match self.agent.request_url("POST", &url).send_json(checkout_payload(request)) {
            Ok(response) => self.read_json(response)?,
            // Error statuses still carry the envelope with the visitor-facing reason.
            Err(ureq::Error::Status(code, response)) => {
                tracing::debug!(status = code, "checkout session request returned error status");
                response.into_json::<Value>().unwrap_or(Value::Null)
            }
            Err(ureq::Error::Transport(err)) => return Err(self.classify_transport(&err)),
        };
        parse_checkout_envelope(&body)
    }
}

fn is_timeout(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(err) = current {
        if let Some(io_err) = err.downcast_ref::<io::Error>() {
            if matches!(io_err.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) {
                return true;
            }
        }
        current = err.source();
    }
    false
}
