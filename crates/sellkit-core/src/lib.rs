//! Engagement and checkout state machine for an embeddable offer surface.
//!
//! One [`OfferWidget`] owns the state for a single offer on a single page load. Everything it
//! touches outside its own memory goes through a port: [`PersistencePort`] for the durable and
//! ephemeral storage scopes, [`Backend`] for the remote config/event/checkout endpoints,
//! [`PageHost`] for the URL, notices, listeners and timers, and [`Clock`] for time.

pub mod backend;
pub mod checkout;
pub mod clock;
pub mod config;
pub mod diagnostic;
pub mod host;
pub mod identity;
pub mod ids;
pub mod ledger;
pub mod persistence;
pub mod trigger;
pub mod visibility;
pub mod widget;

pub use backend::{
    Backend, BackendError, CheckoutRequest, CheckoutSession, EventKind, EventReport,
};
pub use checkout::{
    cancel_url, detect_return, strip_return_markers, success_url, CheckoutOutcome, CtaState,
    ReturnSignal, StoredToken, CANCELLED_NOTICE, DRAFT_NOTICE,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    AutoSurface, DisplayMode, DisplayOptions, EmbedOptions, OfferConfig, ReturnMarkers,
    TriggerKind, MOBILE_VIEWPORT_MAX_WIDTH,
};
pub use diagnostic::{Diagnostic, DiagnosticSource};
pub use host::{
    Notice, NoticeLevel, PageHost, PageSignal, ScrollMetrics, SignalKind, SimulatedPage,
    Subscription,
};
pub use identity::{IdentityManager, SessionIdentity, SESSION_TTL};
pub use ids::{OfferId, PurchaseToken, SessionId};
pub use persistence::{Field, MemoryPersistence, PersistenceError, PersistencePort, Scope, StorageKey};
pub use trigger::{scroll_percent, TriggerEngine, TriggerProgress, TriggerState};
pub use visibility::{
    AutoGate, CloseReport, EntryDecision, OpenReport, Surface, VisibilityController, COOLDOWN,
};
pub use widget::{InitAbort, InitOutcome, OfferWidget, SignalOutcome};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum SurfaceError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}
