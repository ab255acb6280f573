use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use crate::config::TriggerKind;
use crate::ids::OfferId;
use crate::ledger;
use crate::persistence::{PersistenceError, PersistencePort, StorageKey};

/// Automatic triggers stay suppressed this long after the Overlay was last shown.
pub const COOLDOWN: Duration = Duration::hours(24);

/// The one surface currently on screen. Overlay and Reminder are exclusive by construction.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Surface {
    #[default]
    Hidden,
    Overlay,
    Reminder,
}

impl Surface {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hidden => "hidden",
            Self::Overlay => "overlay",
            Self::Reminder => "reminder",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum EntryDecision {
    /// Offer already purchased; nothing is constructed.
    Suppressed,
    ShowReminder,
    /// Impressed this session without persistent mode.
    StayHidden,
    AwaitingManual,
    CooldownActive,
    ArmTrigger,
}

impl EntryDecision {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Suppressed => "suppressed",
            Self::ShowReminder => "show_reminder",
            Self::StayHidden => "stay_hidden",
            Self::AwaitingManual => "awaiting_manual",
            Self::CooldownActive => "cooldown_active",
            Self::ArmTrigger => "arm_trigger",
        }
    }
}

/// Verdict for an automatic activation at the moment it fires.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum AutoGate {
    Open,
    Purchased,
    AlreadyImpressed,
    CooldownActive,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct OpenReport {
    pub opened: bool,
    /// First Overlay display for this offer in the browsing session; the caller reports the
    /// impression event.
    pub first_impression: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct CloseReport {
    pub closed: bool,
    pub reminder_shown: bool,
}

#[derive(Debug, Clone)]
pub struct VisibilityController {
    offer: OfferId,
    diagnostic: bool,
    persistent_mode: bool,
    surface: Surface,
    impressed_in_memory: bool,
}

impl VisibilityController {
    #[must_use]
    pub fn new(offer: OfferId, diagnostic: bool, persistent_mode: bool) -> Self {
        Self { offer, diagnostic, persistent_mode, surface: Surface::Hidden, impressed_in_memory: false }
    }

    #[must_use]
    pub fn surface(&self) -> Surface {
        self.surface
    }

    #[must_use]
    pub fn persistent_mode(&self) -> bool {
        self.persistent_mode
    }

    pub fn set_persistent_mode(&mut self, persistent_mode: bool) {
        self.persistent_mode = persistent_mode;
    }

    /// Decide what a fresh page load does for this offer.
    ///
    /// The purchase gate comes first, then the session impression, then the manual path, then
    /// the cooldown. Diagnostic loads never take the Reminder path and ignore the cooldown.
    ///
    /// # Errors
    /// Propagates persistence failures.
    pub fn decide_entry_path<S: PersistencePort + ?Sized>(
        &self,
        store: &S,
        trigger: TriggerKind,
        now: OffsetDateTime,
    ) -> Result<EntryDecision, PersistenceError> {
        if ledger::has_purchased(store, &self.offer)? {
            return Ok(EntryDecision::Suppressed);
        }
        if self.has_impression(store)? {
            return Ok(if self.persistent_mode && !self.diagnostic {
                EntryDecision::ShowReminder
            } else {
                EntryDecision::StayHidden
            });
        }
        if !trigger.is_automatic() {
            return Ok(EntryDecision::AwaitingManual);
        }
        if self.cooldown_active(store, now)? {
            return Ok(EntryDecision::CooldownActive);
        }
        Ok(EntryDecision::ArmTrigger)
    }

    /// Re-check the gates when an automatic trigger fires.
    ///
    /// # Errors
    /// Propagates persistence failures.
    pub fn automatic_gate<S: PersistencePort + ?Sized>(
        &self,
        store: &S,
        now: OffsetDateTime,
    ) -> Result<AutoGate, PersistenceError> {
        if ledger::has_purchased(store, &self.offer)? {
            return Ok(AutoGate::Purchased);
        }
        if self.has_impression(store)? {
            return Ok(AutoGate::AlreadyImpressed);
        }
        if self.cooldown_active(store, now)? {
            return Ok(AutoGate::CooldownActive);
        }
        Ok(AutoGate::Open)
    }

    /// Show the Overlay. No-op when it is already open or the offer was purchased.
    ///
    /// # Errors
    /// Propagates persistence failures.
    pub fn open_overlay<S: PersistencePort + ?Sized>(
        &mut self,
        store: &mut S,
        now: OffsetDateTime,
    ) -> Result<OpenReport, PersistenceError> {
        if self.surface == Surface::Overlay || ledger::has_purchased(store, &self.offer)? {
            return Ok(OpenReport::default());
        }
        self.surface = Surface::Overlay;
        let first_impression = !self.has_impression(store)?;
        if first_impression {
            self.record_impression(store)?;
        }
        if !self.diagnostic {
            store.set_timestamp(&StorageKey::seen_at(&self.offer), now)?;
        }
        tracing::debug!(offer_id = %self.offer, first_impression, "overlay opened");
        Ok(OpenReport { opened: true, first_impression })
    }

    /// Dismiss the Overlay; persistent mode swaps in the Reminder.
    pub fn close_overlay(&mut self) -> CloseReport {
        if self.surface != Surface::Overlay {
            return CloseReport::default();
        }
        self.surface = if self.persistent_mode { Surface::Reminder } else { Surface::Hidden };
        CloseReport { closed: true, reminder_shown: self.surface == Surface::Reminder }
    }

    /// Take the Overlay down without offering the Reminder, ahead of a checkout redirect.
    pub fn hide_overlay(&mut self) -> bool {
        if self.surface != Surface::Overlay {
            return false;
        }
        self.surface = Surface::Hidden;
        true
    }

    /// Show the Reminder. Never replaces a visible Overlay.
    ///
    /// # Errors
    /// Propagates persistence failures.
    pub fn show_reminder<S: PersistencePort + ?Sized>(
        &mut self,
        store: &S,
    ) -> Result<bool, PersistenceError> {
        if self.surface != Surface::Hidden || ledger::has_purchased(store, &self.offer)? {
            return Ok(false);
        }
        self.surface = Surface::Reminder;
        Ok(true)
    }

    pub fn hide_reminder(&mut self) -> bool {
        if self.surface != Surface::Reminder {
            return false;
        }
        self.surface = Surface::Hidden;
        true
    }

    /// Reminder click: hide it and reopen the Overlay. Only the purchase gate applies.
    ///
    /// # Errors
    /// Propagates persistence failures.
    pub fn click_reminder<S: PersistencePort + ?Sized>(
        &mut self,
        store: &mut S,
        now: OffsetDateTime,
    ) -> Result<OpenReport, PersistenceError> {
        if self.surface != Surface::Reminder {
            return Ok(OpenReport::default());
        }
        self.surface = Surface::Hidden;
        self.open_overlay(store, now)
    }

    /// Automatic activation on a reminder-first layout: the Reminder stands in for the Overlay.
    /// Counts as this session's impression but writes no cooldown.
    ///
    /// # Errors
    /// Propagates persistence failures.
    pub fn substitute_reminder<S: PersistencePort + ?Sized>(
        &mut self,
        store: &mut S,
    ) -> Result<bool, PersistenceError> {
        if !self.show_reminder(store)? {
            return Ok(false);
        }
        self.record_impression(store)?;
        Ok(true)
    }

    /// Force every surface down after a confirmed purchase.
    pub fn hide_all(&mut self) {
        self.surface = Surface::Hidden;
    }

    fn has_impression<S: PersistencePort + ?Sized>(&self, store: &S) -> Result<bool, PersistenceError> {
        if self.diagnostic {
            return Ok(self.impressed_in_memory);
        }
        store.get_flag(&StorageKey::impression(&self.offer))
    }

    fn record_impression<S: PersistencePort + ?Sized>(
        &mut self,
        store: &mut S,
    ) -> Result<(), PersistenceError> {
        self.impressed_in_memory = true;
        if self.diagnostic {
            return Ok(());
        }
        store.set_flag(&StorageKey::impression(&self.offer))
    }

    fn cooldown_active<S: PersistencePort + ?Sized>(
        &self,
        store: &S,
        now: OffsetDateTime,
    ) -> Result<bool, PersistenceError> {
        if self.diagnostic {
            return Ok(false);
        }
        Ok(store
            .get_timestamp(&StorageKey::seen_at(&self.offer))?
            .is_some_and(|seen_at| now - seen_at < COOLDOWN))
    }
}
