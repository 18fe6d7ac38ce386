//! Privacy preferences gating outgoing signals.

use std::sync::atomic::{AtomicBool, Ordering};

/// Privacy toggles consulted before any network activity is scheduled.
///
/// Both default to enabled.
pub trait Preferences: Send + Sync + 'static {
    /// Whether "user is typing" signals may be broadcast.
    fn is_typing_indicators_enabled(&self) -> bool {
        true
    }

    /// Whether read receipts may be broadcast.
    ///
    /// Read state is persisted regardless; this only gates the broadcast.
    fn is_read_receipts_enabled(&self) -> bool {
        true
    }
}

/// In-process preferences with runtime toggles.
#[derive(Debug)]
pub struct ChatPreferences {
    typing_indicators: AtomicBool,
    read_receipts: AtomicBool,
}

impl ChatPreferences {
    /// Both toggles enabled.
    pub fn new() -> Self {
        Self { typing_indicators: AtomicBool::new(true), read_receipts: AtomicBool::new(true) }
    }

    /// Enable or disable typing indicators.
    pub fn set_typing_indicators_enabled(&self, enabled: bool) {
        self.typing_indicators.store(enabled, Ordering::Relaxed);
    }

    /// Enable or disable read receipts.
    pub fn set_read_receipts_enabled(&self, enabled: bool) {
        self.read_receipts.store(enabled, Ordering::Relaxed);
    }
}

impl Default for ChatPreferences {
    fn default() -> Self {
        Self::new()
    }
}

impl Preferences for ChatPreferences {
    fn is_typing_indicators_enabled(&self) -> bool {
        self.typing_indicators.load(Ordering::Relaxed)
    }

    fn is_read_receipts_enabled(&self) -> bool {
        self.read_receipts.load(Ordering::Relaxed)
    }
}
