use serde::{Deserialize, Serialize};

use crate::backend::{Backend, EventKind, EventReport};
use crate::checkout::{CtaState, ReturnSignal};
use crate::clock::Clock;
use crate::config::{AutoSurface, DisplayMode, EmbedOptions, OfferConfig};
use crate::diagnostic::Diagnostic;
use crate::host::{PageHost, PageSignal};
use crate::identity::IdentityManager;
use crate::ids::{OfferId, PurchaseToken, SessionId};
use crate::ledger;
use crate::persistence::PersistencePort;
use crate::trigger::{TriggerEngine, TriggerProgress};
use crate::visibility::{AutoGate, CloseReport, EntryDecision, OpenReport, Surface, VisibilityController};
use crate::SurfaceError;

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum InitAbort {
    MissingOfferId,
    ConfigUnavailable { detail: String },
    NotLive,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum InitOutcome {
    Ready { entry: EntryDecision, returned: ReturnSignal },
    /// Purchased offer; nothing was constructed.
    Suppressed { returned: ReturnSignal },
    Aborted { reason: InitAbort },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SignalOutcome {
    Ignored,
    Gated { gate: AutoGate },
    OverlayOpened { first_impression: bool },
    ReminderShown,
}

/// One offer surface on one page load.
///
/// Owns every piece of per-instance state and reaches the outside world only through its ports.
/// Construct a new widget for each page load; listeners registered by a previous instance are
/// released when its trigger fires or the widget redirects.
pub struct OfferWidget<S, B, H, C> {
    pub(crate) options: EmbedOptions,
    pub(crate) diagnostic: Diagnostic,
    pub(crate) store: S,
    pub(crate) backend: B,
    pub(crate) host: H,
    pub(crate) clock: C,
    pub(crate) identity: IdentityManager,
    pub(crate) offer: Option<OfferId>,
    pub(crate) config: Option<OfferConfig>,
    pub(crate) visibility: Option<VisibilityController>,
    pub(crate) trigger: Option<TriggerEngine>,
    pub(crate) cta: CtaState,
    pub(crate) pending_reminder: bool,
}

impl<S, B, H, C> OfferWidget<S, B, H, C>
where
    S: PersistencePort,
    B: Backend,
    H: PageHost,
    C: Clock,
{
    /// Wire up the ports. The diagnostic override is resolved from the page as it is now.
    pub fn new(options: EmbedOptions, store: S, backend: B, host: H, clock: C) -> Self {
        let diagnostic = Diagnostic::detect(&host.current_url(), options.diagnostic_attribute);
        if diagnostic.enabled {
            tracing::debug!(source = ?diagnostic.source, "diagnostic mode enabled");
        }
        Self {
            options,
            diagnostic,
            store,
            backend,
            host,
            clock,
            identity: IdentityManager::new(diagnostic.enabled),
            offer: None,
            config: None,
            visibility: None,
            trigger: None,
            cta: CtaState::Idle,
            pending_reminder: false,
        }
    }

    /// Force the diagnostic override regardless of the page, as an embed-level flag would.
    #[must_use]
    pub fn with_diagnostic(mut self, diagnostic: Diagnostic) -> Self {
        self.diagnostic = diagnostic;
        self.identity = IdentityManager::new(diagnostic.enabled);
        self
    }

    /// Run the page-load sequence: return reconciliation, purchase gate, configuration fetch,
    /// entry-path decision. Each step completes before the next starts.
    ///
    /// # Errors
    /// Returns [`SurfaceError::Persistence`] when storage is unusable. Every other failure is
    /// reported through [`InitOutcome::Aborted`].
    pub fn init(&mut self) -> Result<InitOutcome, SurfaceError> {
        let offer = match self.options.offer() {
            Ok(offer) => offer,
            Err(err) => {
                tracing::error!(error = %err, "offer surface not initialised");
                return Ok(InitOutcome::Aborted { reason: InitAbort::MissingOfferId });
            }
        };
        self.offer = Some(offer.clone());
        self.visibility = Some(VisibilityController::new(offer.clone(), self.diagnostic.enabled, false));

        let returned = self.reconcile_return(&offer)?;

        if ledger::has_purchased(&self.store, &offer)? {
            tracing::info!(offer_id = %offer, "offer already purchased, surface suppressed");
            return Ok(InitOutcome::Suppressed { returned });
        }

        let config = match self.backend.fetch_config(&offer) {
            Ok(config) => config,
            Err(err) => {
                tracing::error!(offer_id = %offer, error = %err, "failed to load offer configuration");
                return Ok(InitOutcome::Aborted {
                    reason: InitAbort::ConfigUnavailable { detail: err.to_string() },
                });
            }
        };
        if !config.live {
            if !self.diagnostic.enabled {
                tracing::info!(offer_id = %offer, "offer is in draft mode, surface not loaded");
                return Ok(InitOutcome::Aborted { reason: InitAbort::NotLive });
            }
            tracing::info!(offer_id = %offer, "draft offer loaded in diagnostic mode");
        }

        let trigger = config.trigger;
        let persistent_mode = config.persistent_mode;
        self.config = Some(config);
        let pending_reminder = std::mem::take(&mut self.pending_reminder);

        let now = self.clock.now();
        let Some((visibility, store)) = self.visibility_and_store() else {
            return Ok(InitOutcome::Aborted { reason: InitAbort::MissingOfferId });
        };
        visibility.set_persistent_mode(persistent_mode);
        if pending_reminder && persistent_mode {
            visibility.show_reminder(store)?;
        }
        let entry = visibility.decide_entry_path(store, trigger, now)?;
        match entry {
            EntryDecision::ShowReminder => {
                visibility.show_reminder(store)?;
            }
            EntryDecision::ArmTrigger => {
                self.trigger = Some(TriggerEngine::arm(trigger, &mut self.host, now));
            }
            EntryDecision::Suppressed
            | EntryDecision::StayHidden
            | EntryDecision::AwaitingManual
            | EntryDecision::CooldownActive => {}
        }
        tracing::debug!(offer_id = %offer, entry = entry.as_str(), "entry path decided");
        Ok(InitOutcome::Ready { entry, returned })
    }

    /// Feed a page signal to the armed trigger and act on activation.
    ///
    /// # Errors
    /// Propagates persistence failures.
    pub fn handle_signal(&mut self, signal: &PageSignal) -> Result<SignalOutcome, SurfaceError> {
        let Some(trigger) = self.trigger.as_mut() else {
            return Ok(SignalOutcome::Ignored);
        };
        let fired = trigger.observe(signal, &mut self.host);
        if self.diagnostic.enabled {
            let progress = trigger.progress(self.clock.now());
            tracing::debug!(?progress, "trigger progress");
        }
        if !fired {
            return Ok(SignalOutcome::Ignored);
        }
        let (Some(offer), Some(config)) = (self.offer.clone(), self.config.as_ref()) else {
            return Ok(SignalOutcome::Ignored);
        };
        let surface = config.auto_surface(self.host.viewport_width());

        let now = self.clock.now();
        let Some((visibility, store)) = self.visibility_and_store() else {
            return Ok(SignalOutcome::Ignored);
        };
        let gate = visibility.automatic_gate(store, now)?;
        if gate != AutoGate::Open {
            tracing::debug!(offer_id = %offer, gate = ?gate, "automatic activation gated");
            return Ok(SignalOutcome::Gated { gate });
        }
        match surface {
            AutoSurface::Reminder => {
                visibility.substitute_reminder(store)?;
                Ok(SignalOutcome::ReminderShown)
            }
            AutoSurface::Overlay => {
                let report = visibility.open_overlay(store, now)?;
                self.after_open(report)?;
                Ok(SignalOutcome::OverlayOpened { first_impression: report.first_impression })
            }
        }
    }

    /// Manual open from a call-to-action on the page. Only the purchase gate applies.
    ///
    /// # Errors
    /// Propagates persistence failures.
    pub fn open(&mut self) -> Result<OpenReport, SurfaceError> {
        if self.config.is_none() {
            return Ok(OpenReport::default());
        }
        let now = self.clock.now();
        let Some((visibility, store)) = self.visibility_and_store() else {
            return Ok(OpenReport::default());
        };
        let report = visibility.open_overlay(store, now)?;
        self.after_open(report)?;
        Ok(report)
    }

    /// Close button on the Overlay.
    ///
    /// # Errors
    /// Propagates persistence failures.
    pub fn close(&mut self) -> Result<CloseReport, SurfaceError> {
        let Some(visibility) = self.visibility.as_mut() else {
            return Ok(CloseReport::default());
        };
        let report = visibility.close_overlay();
        if report.closed {
            self.report(EventKind::Close, None, None)?;
        }
        Ok(report)
    }

    /// # Errors
    /// Propagates persistence failures.
    pub fn click_reminder(&mut self) -> Result<OpenReport, SurfaceError> {
        let now = self.clock.now();
        let Some((visibility, store)) = self.visibility_and_store() else {
            return Ok(OpenReport::default());
        };
        let report = visibility.click_reminder(store, now)?;
        self.after_open(report)?;
        Ok(report)
    }

    pub fn dismiss_reminder(&mut self) -> bool {
        self.visibility.as_mut().is_some_and(VisibilityController::hide_reminder)
    }

    #[must_use]
    pub fn surface(&self) -> Surface {
        self.visibility.as_ref().map_or(Surface::Hidden, VisibilityController::surface)
    }

    #[must_use]
    pub fn diagnostic(&self) -> Diagnostic {
        self.diagnostic
    }

    #[must_use]
    pub fn config(&self) -> Option<&OfferConfig> {
        self.config.as_ref()
    }

    #[must_use]
    pub fn cta_state(&self) -> CtaState {
        self.cta
    }

    #[must_use]
    pub fn progress(&self) -> Option<TriggerProgress> {
        self.trigger.as_ref().map(|trigger| trigger.progress(self.clock.now()))
    }

    #[must_use]
    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    #[must_use]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Split borrow of the controller and the store. `None` before `init` resolved an offer.
    pub(crate) fn visibility_and_store(&mut self) -> Option<(&mut VisibilityController, &mut S)> {
        let visibility = self.visibility.as_mut()?;
        Some((visibility, &mut self.store))
    }

    pub(crate) fn session_id(&mut self) -> Result<SessionId, SurfaceError> {
        let now = self.clock.now();
        Ok(self.identity.session_id(&mut self.store, now)?)
    }

    /// Best-effort event delivery. Backend failures are logged and dropped.
    pub(crate) fn report(
        &mut self,
        kind: EventKind,
        purchase_token: Option<PurchaseToken>,
        display_mode: Option<DisplayMode>,
    ) -> Result<(), SurfaceError> {
        let Some(offer_id) = self.offer.clone() else {
            return Ok(());
        };
        let report = EventReport {
            offer_id,
            session_id: self.session_id()?,
            kind,
            timestamp: self.clock.now(),
            page_url: self.host.current_url().to_string(),
            user_agent: self.host.user_agent(),
            purchase_token,
            display_mode,
        };
        if let Err(err) = self.backend.report_event(&report) {
            tracing::warn!(event = kind.as_str(), error = %err, "event report dropped");
        }
        Ok(())
    }

    fn after_open(&mut self, report: OpenReport) -> Result<(), SurfaceError> {
        if report.first_impression {
            self.report(EventKind::Impression, None, None)?;
        }
        Ok(())
    }
}
