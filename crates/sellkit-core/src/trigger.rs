use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use crate::config::TriggerKind;
use crate::host::{PageHost, PageSignal, ScrollMetrics, SignalKind, Subscription};

/// Pointer-leave events with a vertical coordinate at or below this count as exit intent.
pub const EXIT_INTENT_MAX_CLIENT_Y: f64 = 10.0;

const MAX_DELAY_SECONDS: f64 = 7.0 * 24.0 * 60.0 * 60.0;

/// Scroll depth in percent, or `None` when the page has nothing to scroll.
#[must_use]
pub fn scroll_percent(metrics: ScrollMetrics) -> Option<f64> {
    let scrollable = metrics.document_height - metrics.viewport_height;
    if !scrollable.is_finite() || scrollable <= 0.0 || !metrics.scroll_y.is_finite() {
        return None;
    }
    Some(metrics.scroll_y / scrollable * 100.0)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum TriggerState {
    Armed,
    Activated,
}

/// Snapshot of how close the trigger is to firing.
#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
pub struct TriggerProgress {
    pub kind: &'static str,
    pub threshold: Option<f64>,
    pub scroll_percent: Option<f64>,
    pub elapsed_seconds: f64,
    pub activated: bool,
}

/// Single-use activation for one trigger kind.
///
/// Arming registers exactly one listener or timer with the host; the first qualifying signal
/// moves the engine to [`TriggerState::Activated`] and releases that registration.
#[derive(Debug, Clone)]
pub struct TriggerEngine {
    kind: TriggerKind,
    state: TriggerState,
    subscription: Option<Subscription>,
    armed_at: OffsetDateTime,
    last_scroll_percent: Option<f64>,
}

impl TriggerEngine {
    /// Register the trigger's listener. Manual triggers register nothing and only fire through
    /// an explicit open.
    pub fn arm<H: PageHost + ?Sized>(kind: TriggerKind, host: &mut H, now: OffsetDateTime) -> Self {
        let subscription = match kind {
            TriggerKind::Scroll { .. } => Some(host.subscribe(SignalKind::Scroll)),
            TriggerKind::ExitIntent => Some(host.subscribe(SignalKind::PointerLeave)),
            TriggerKind::Time { seconds } => Some(host.schedule(delay(seconds))),
            TriggerKind::Manual => None,
        };
        tracing::debug!(trigger = kind.as_str(), threshold = ?kind.threshold(), "trigger armed");
        Self {
            kind,
            state: TriggerState::Armed,
            subscription,
            armed_at: now,
            last_scroll_percent: None,
        }
    }

    /// Feed one page signal. Returns `true` exactly once, on the activating signal.
    pub fn observe<H: PageHost + ?Sized>(&mut self, signal: &PageSignal, host: &mut H) -> bool {
        if self.state == TriggerState::Activated {
            return false;
        }
        let fired = match (self.kind, signal) {
            (TriggerKind::Scroll { threshold_percent }, PageSignal::Scroll(metrics)) => {
                let percent = scroll_percent(*metrics);
                if percent.is_some() {
                    self.last_scroll_percent = percent;
                }
                percent.is_some_and(|percent| percent >= threshold_percent)
            }
            (TriggerKind::ExitIntent, PageSignal::PointerLeave { client_y }) => {
                *client_y <= EXIT_INTENT_MAX_CLIENT_Y
            }
            (TriggerKind::Time { .. }, PageSignal::Timer { subscription: fired }) => {
                self.subscription == Some(*fired)
            }
            _ => false,
        };
        if fired {
            self.state = TriggerState::Activated;
            self.release(host);
            tracing::debug!(trigger = self.kind.as_str(), "trigger activated");
        }
        fired
    }

    /// Release the registration without activating.
    pub fn disarm<H: PageHost + ?Sized>(&mut self, host: &mut H) {
        self.release(host);
    }

    #[must_use]
    pub fn kind(&self) -> TriggerKind {
        self.kind
    }

    #[must_use]
    pub fn state(&self) -> TriggerState {
        self.state
    }

    #[must_use]
    pub fn is_listening(&self) -> bool {
        self.subscription.is_some()
    }

    #[must_use]
    pub fn progress(&self, now: OffsetDateTime) -> TriggerProgress {
        TriggerProgress {
            kind: self.kind.as_str(),
            threshold: self.kind.threshold(),
            scroll_percent: self.last_scroll_percent,
            elapsed_seconds: (now - self.armed_at).as_seconds_f64().max(0.0),
            activated: self.state == TriggerState::Activated,
        }
    }

    fn release<H: PageHost + ?Sized>(&mut self, host: &mut H) {
        if let Some(subscription) = self.subscription.take() {
            host.unsubscribe(subscription);
        }
    }
}

fn delay(seconds: f64) -> Duration {
    let seconds = if seconds.is_finite() { seconds.clamp(0.0, MAX_DELAY_SECONDS) } else { 0.0 };
    Duration::seconds_f64(seconds)
}
