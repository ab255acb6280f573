use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::ids::OfferId;
use crate::SurfaceError;

/// Viewports at or below this width count as mobile.
pub const MOBILE_VIEWPORT_MAX_WIDTH: u32 = 768;

pub const DEFAULT_SCROLL_PERCENT: f64 = 50.0;
pub const DEFAULT_TIME_SECONDS: f64 = 5.0;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TriggerKind {
    Scroll { threshold_percent: f64 },
    Time { seconds: f64 },
    ExitIntent,
    Manual,
}

impl TriggerKind {
    /// Map the wire `trigger_type`/`trigger_value` pair onto a trigger.
    ///
    /// Unknown kinds become `time(5)`. A missing or unusable value takes the kind's default.
    #[must_use]
    pub fn from_wire(kind: Option<&str>, value: Option<f64>) -> Self {
        let value = value.filter(|value| value.is_finite() && *value >= 0.0);
        match kind.map(str::trim) {
            Some("scroll") => Self::Scroll {
                threshold_percent: value.unwrap_or(DEFAULT_SCROLL_PERCENT),
            },
            Some("time") => Self::Time { seconds: value.unwrap_or(DEFAULT_TIME_SECONDS) },
            Some("exit" | "exit_intent") => Self::ExitIntent,
            Some("click" | "manual") => Self::Manual,
            other => {
                tracing::debug!(trigger_type = ?other, "unrecognised trigger type, using time(5)");
                Self::Time { seconds: DEFAULT_TIME_SECONDS }
            }
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Scroll { .. } => "scroll",
            Self::Time { .. } => "time",
            Self::ExitIntent => "exit_intent",
            Self::Manual => "manual",
        }
    }

    #[must_use]
    pub fn threshold(self) -> Option<f64> {
        match self {
            Self::Scroll { threshold_percent } => Some(threshold_percent),
            Self::Time { seconds } => Some(seconds),
            Self::ExitIntent | Self::Manual => None,
        }
    }

    #[must_use]
    pub fn is_automatic(self) -> bool {
        !matches!(self, Self::Manual)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum DisplayMode {
    #[default]
    Overlay,
    ReminderOnly,
    Fullscreen,
}

impl DisplayMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Overlay => "overlay",
            Self::ReminderOnly => "reminder-only",
            Self::Fullscreen => "fullscreen",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "overlay" | "popup" => Some(Self::Overlay),
            "reminder-only" | "reminder_only" | "floating" => Some(Self::ReminderOnly),
            "fullscreen" => Some(Self::Fullscreen),
            _ => None,
        }
    }
}

/// Which surface an automatic activation brings up.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum AutoSurface {
    Overlay,
    Reminder,
}

/// Presentation knobs passed through to the renderer.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct DisplayOptions {
    pub show_price: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cta_text: Option<String>,
    #[serde(default)]
    pub colors: BTreeMap<String, String>,
}

impl Default for DisplayOptions {
    fn default() -> Self {
        Self { show_price: true, cta_text: None, colors: BTreeMap::new() }
    }
}

/// Remote offer configuration after wire parsing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OfferConfig {
    pub offer_id: OfferId,
    pub live: bool,
    pub trigger: TriggerKind,
    pub persistent_mode: bool,
    /// Show the Reminder instead of the Overlay on mobile viewports.
    pub mobile_reminder: bool,
    pub display_mode: DisplayMode,
    pub display: DisplayOptions,
    /// Opaque presentation fields (title, price, image, ...).
    #[serde(default)]
    pub presentation: serde_json::Map<String, serde_json::Value>,
}

impl OfferConfig {
    #[must_use]
    pub fn new(offer_id: OfferId, trigger: TriggerKind) -> Self {
        Self {
            offer_id,
            live: true,
            trigger,
            persistent_mode: false,
            mobile_reminder: false,
            display_mode: DisplayMode::Overlay,
            display: DisplayOptions::default(),
            presentation: serde_json::Map::new(),
        }
    }

    #[must_use]
    pub fn auto_surface(&self, viewport_width: u32) -> AutoSurface {
        let mobile = viewport_width <= MOBILE_VIEWPORT_MAX_WIDTH;
        if self.display_mode == DisplayMode::ReminderOnly || (self.mobile_reminder && mobile) {
            AutoSurface::Reminder
        } else {
            AutoSurface::Overlay
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ReturnMarkers {
    pub success: String,
    pub cancelled: String,
}

impl Default for ReturnMarkers {
    fn default() -> Self {
        Self {
            success: "mysellkit_success".to_string(),
            cancelled: "mysellkit_cancelled".to_string(),
        }
    }
}

/// Options the embedding page supplies alongside the script tag.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct EmbedOptions {
    pub offer_id: Option<String>,
    #[serde(default)]
    pub diagnostic_attribute: bool,
    pub checkout_base: Url,
    #[serde(default)]
    pub markers: ReturnMarkers,
}

impl EmbedOptions {
    #[must_use]
    pub fn new(offer_id: impl Into<String>, checkout_base: Url) -> Self {
        Self {
            offer_id: Some(offer_id.into()),
            diagnostic_attribute: false,
            checkout_base,
            markers: ReturnMarkers::default(),
        }
    }

    /// # Errors
    /// Returns [`SurfaceError::Validation`] when no usable offer id was supplied.
    pub fn offer(&self) -> Result<OfferId, SurfaceError> {
        match self.offer_id.as_deref() {
            Some(raw) => OfferId::parse(raw),
            None => Err(SurfaceError::Validation("embed MUST name an offer id".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_trigger_kinds_apply_fallbacks() {
        assert_eq!(
            TriggerKind::from_wire(Some("scroll"), None),
            TriggerKind::Scroll { threshold_percent: 50.0 }
        );
        assert_eq!(
            TriggerKind::from_wire(Some("time"), Some(12.0)),
            TriggerKind::Time { seconds: 12.0 }
        );
        assert_eq!(TriggerKind::from_wire(Some("exit"), None), TriggerKind::ExitIntent);
        assert_eq!(TriggerKind::from_wire(Some("exit_intent"), Some(3.0)), TriggerKind::ExitIntent);
        assert_eq!(TriggerKind::from_wire(Some("click"), None), TriggerKind::Manual);
        assert_eq!(
            TriggerKind::from_wire(Some("hover"), Some(30.0)),
            TriggerKind::Time { seconds: 5.0 }
        );
        assert_eq!(TriggerKind::from_wire(None, None), TriggerKind::Time { seconds: 5.0 });
        assert_eq!(
            TriggerKind::from_wire(Some("time"), Some(-4.0)),
            TriggerKind::Time { seconds: 5.0 }
        );
    }

    #[test]
    fn auto_surface_prefers_reminder_for_reminder_only_and_mobile() {
        let offer = match OfferId::parse("o1") {
            Ok(id) => id,
            Err(err) => panic!("offer id should parse: {err}"),
        };
        let mut config = OfferConfig::new(offer, TriggerKind::ExitIntent);
        assert_eq!(config.auto_surface(375), AutoSurface::Overlay);

        config.mobile_reminder = true;
        assert_eq!(config.auto_surface(768), AutoSurface::Reminder);
        assert_eq!(config.auto_surface(769), AutoSurface::Overlay);

        config.mobile_reminder = false;
        config.display_mode = DisplayMode::ReminderOnly;
        assert_eq!(config.auto_surface(1440), AutoSurface::Reminder);
    }

    #[test]
    fn display_mode_accepts_wire_aliases() {
        assert_eq!(DisplayMode::parse("reminder-only"), Some(DisplayMode::ReminderOnly));
        assert_eq!(DisplayMode::parse("floating"), Some(DisplayMode::ReminderOnly));
        assert_eq!(DisplayMode::parse("fullscreen"), Some(DisplayMode::Fullscreen));
        assert_eq!(DisplayMode::parse("banner"), None);
    }
}
