//! Active-application context.
//!
//! Captured once at session start and re-queried before output so a window
//! switch mid-correction reroutes text to the clipboard instead of typing
//! into the wrong app. The OS query itself lives behind [`ContextProbe`];
//! the host crate supplies the platform implementation.

use serde::{Deserialize, Serialize};

/// Per-application style bias for the correction prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RigorLevel {
    /// Strict grammar and spelling (mail, docs).
    High,
    /// No style hint.
    Normal,
    /// Preserve natural speech (terminals, chat).
    Low,
}

/// Bundles where aggressive grammar/spelling correction is wanted.
const HIGH_RIGOR_BUNDLES: &[&str] = &[
    "com.apple.mail",
    "com.google.Chrome",
    "com.microsoft.Outlook",
    "com.microsoft.Word",
    "com.apple.Notes",
    "com.slack.Slack",
];

/// Bundles where raw speed and natural phrasing win.
const LOW_RIGOR_BUNDLES: &[&str] = &[
    "com.apple.Terminal",
    "com.googlecode.iterm2",
    "com.openai.chat",
    "com.anthropic.claudefordesktop",
];

impl RigorLevel {
    pub fn classify(bundle_id: &str) -> Self {
        if HIGH_RIGOR_BUNDLES.contains(&bundle_id) {
            RigorLevel::High
        } else if LOW_RIGOR_BUNDLES.contains(&bundle_id) {
            RigorLevel::Low
        } else {
            RigorLevel::Normal
        }
    }
}

/// Snapshot of the frontmost application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppContext {
    pub app_name: String,
    pub window_title: String,
    pub bundle_id: String,
    pub rigor: RigorLevel,
}

impl AppContext {
    pub fn new(app_name: impl Into<String>, window_title: impl Into<String>, bundle_id: impl Into<String>) -> Self {
        let bundle_id = bundle_id.into();
        let rigor = RigorLevel::classify(&bundle_id);
        Self {
            app_name: app_name.into(),
            window_title: window_title.into(),
            bundle_id,
            rigor,
        }
    }
}

/// OS-side queries the engine needs but cannot implement portably.
pub trait ContextProbe: Send + Sync {
    /// The frontmost application, or `None` when it cannot be determined.
    fn app_context(&self) -> Option<AppContext>;

    /// Currently selected text, if any. Implementations that read the
    /// selection through a clipboard round-trip must restore the clipboard
    /// on every exit path.
    fn selected_text(&self) -> Option<String> {
        None
    }
}

/// Probe for platforms without an implementation; reports no context.
pub struct NullProbe;

impl ContextProbe for NullProbe {
    fn app_context(&self) -> Option<AppContext> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rigor_classification() {
        assert_eq!(RigorLevel::classify("com.apple.mail"), RigorLevel::High);
        assert_eq!(RigorLevel::classify("com.apple.Terminal"), RigorLevel::Low);
        assert_eq!(RigorLevel::classify("com.example.editor"), RigorLevel::Normal);
    }

    #[test]
    fn context_derives_rigor_from_bundle() {
        let ctx = AppContext::new("Slack", "general", "com.slack.Slack");
        assert_eq!(ctx.rigor, RigorLevel::High);
    }
}
