use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use url::Url;

use crate::clock::{Clock, ManualClock};

/// Handle for one listener or timer registered with the page.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct Subscription(pub u64);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Scroll,
    PointerLeave,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ScrollMetrics {
    pub scroll_y: f64,
    pub document_height: f64,
    pub viewport_height: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum PageSignal {
    Scroll(ScrollMetrics),
    PointerLeave { client_y: f64 },
    Timer { subscription: Subscription },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum NoticeLevel {
    Info,
    Error,
}

/// Transient user-visible message (a toast on a real page).
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
}

impl Notice {
    #[must_use]
    pub fn info(message: impl Into<String>) -> Self {
        Self { level: NoticeLevel::Info, message: message.into() }
    }

    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self { level: NoticeLevel::Error, message: message.into() }
    }
}

/// Everything the widget needs from the embedding page.
pub trait PageHost {
    fn current_url(&self) -> Url;

    /// Rewrite the address bar without reloading.
    fn replace_url(&mut self, url: Url);

    /// Full-page navigation. Nothing meaningful runs in this page instance afterwards.
    fn redirect(&mut self, target: Url);

    fn notify(&mut self, notice: Notice);

    fn user_agent(&self) -> String;

    fn viewport_width(&self) -> u32;

    fn subscribe(&mut self, kind: SignalKind) -> Subscription;

    /// One-shot timer delivered as [`PageSignal::Timer`].
    fn schedule(&mut self, delay: Duration) -> Subscription;

    fn unsubscribe(&mut self, subscription: Subscription);
}

impl<H: PageHost + ?Sized> PageHost for &mut H {
    fn current_url(&self) -> Url {
        (**self).current_url()
    }

    fn replace_url(&mut self, url: Url) {
        (**self).replace_url(url);
    }

    fn redirect(&mut self, target: Url) {
        (**self).redirect(target);
    }

    fn notify(&mut self, notice: Notice) {
        (**self).notify(notice);
    }

    fn user_agent(&self) -> String {
        (**self).user_agent()
    }

    fn viewport_width(&self) -> u32 {
        (**self).viewport_width()
    }

    fn subscribe(&mut self, kind: SignalKind) -> Subscription {
        (**self).subscribe(kind)
    }

    fn schedule(&mut self, delay: Duration) -> Subscription {
        (**self).schedule(delay)
    }

    fn unsubscribe(&mut self, subscription: Subscription) {
        (**self).unsubscribe(subscription);
    }
}

/// Scripted page used by tests and the `sk visit` harness.
///
/// Signals are only produced while a matching listener is registered, and timers fire when the
/// shared [`ManualClock`] is advanced past their due time.
#[derive(Debug, Clone)]
pub struct SimulatedPage {
    url: Url,
    user_agent: String,
    viewport_width: u32,
    clock: ManualClock,
    next_subscription: u64,
    listeners: BTreeMap<Subscription, SignalKind>,
    timers: BTreeMap<Subscription, OffsetDateTime>,
    history: Vec<Url>,
    notices: Vec<Notice>,
    redirects: Vec<Url>,
}

impl SimulatedPage {
    pub const DEFAULT_USER_AGENT: &'static str = "sellkit-simulated-page/0.1";
    pub const DEFAULT_VIEWPORT_WIDTH: u32 = 1280;

    #[must_use]
    pub fn new(url: Url, clock: ManualClock) -> Self {
        Self {
            url,
            user_agent: Self::DEFAULT_USER_AGENT.to_string(),
            viewport_width: Self::DEFAULT_VIEWPORT_WIDTH,
            clock,
            next_subscription: 1,
            listeners: BTreeMap::new(),
            timers: BTreeMap::new(),
            history: Vec::new(),
            notices: Vec::new(),
            redirects: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_viewport_width(mut self, width: u32) -> Self {
        self.viewport_width = width;
        self
    }

    #[must_use]
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Start a new page load at `url`. Listeners and timers from the previous load are gone;
    /// recorded notices and redirects are kept.
    pub fn navigate(&mut self, url: Url) {
        self.url = url;
        self.listeners.clear();
        self.timers.clear();
    }

    /// Advance time and return the timers that came due, earliest first.
    pub fn advance(&mut self, by: Duration) -> Vec<PageSignal> {
        self.clock.advance(by);
        let now = self.clock.now();
        let mut due: Vec<(OffsetDateTime, Subscription)> = self
            .timers
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(subscription, at)| (*at, *subscription))
            .collect();
        due.sort();
        for (_, subscription) in &due {
            self.timers.remove(subscription);
        }
        due.into_iter().map(|(_, subscription)| PageSignal::Timer { subscription }).collect()
    }

    #[must_use]
    pub fn scroll(&self, metrics: ScrollMetrics) -> Option<PageSignal> {
        self.has_listener(SignalKind::Scroll).then_some(PageSignal::Scroll(metrics))
    }

    #[must_use]
    pub fn pointer_leave(&self, client_y: f64) -> Option<PageSignal> {
        self.has_listener(SignalKind::PointerLeave).then_some(PageSignal::PointerLeave { client_y })
    }

    #[must_use]
    pub fn active_listeners(&self) -> usize {
        self.listeners.len()
    }

    #[must_use]
    pub fn pending_timers(&self) -> usize {
        self.timers.len()
    }

    #[must_use]
    pub fn notices(&self) -> &[Notice] {
        &self.notices
    }

    #[must_use]
    pub fn redirects(&self) -> &[Url] {
        &self.redirects
    }

    /// URLs written through [`PageHost::replace_url`], oldest first.
    #[must_use]
    pub fn history(&self) -> &[Url] {
        &self.history
    }

    #[must_use]
    pub fn clock(&self) -> &ManualClock {
        &self.clock
    }

    fn has_listener(&self, kind: SignalKind) -> bool {
        self.listeners.values().any(|registered| *registered == kind)
    }

    fn next_handle(&mut self) -> Subscription {
        let handle = Subscription(self.next_subscription);
        self.next_subscription += 1;
        handle
    }
}

impl PageHost for SimulatedPage {
    fn current_url(&self) -> Url {
        self.url.clone()
    }

    fn replace_url(&mut self, url: Url) {
        self.history.push(url.clone());
        self.url = url;
    }

    fn redirect(&mut self, target: Url) {
        self.redirects.push(target);
    }

    fn notify(&mut self, notice: Notice) {
        self.notices.push(notice);
    }

    fn user_agent(&self) -> String {
        self.user_agent.clone()
    }

    fn viewport_width(&self) -> u32 {
        self.viewport_width
    }

    fn subscribe(&mut self, kind: SignalKind) -> Subscription {
        let handle = self.next_handle();
        self.listeners.insert(handle, kind);
        handle
    }

    fn schedule(&mut self, delay: Duration) -> Subscription {
        let handle = self.next_handle();
        let due = self.clock.now() + delay;
        self.timers.insert(handle, due);
        handle
    }

    fn unsubscribe(&mut self, subscription: Subscription) {
        self.listeners.remove(&subscription);
        self.timers.remove(&subscription);
    }
}
