//! Button press classification with debouncing
//!
//! The terminal has a single button. How long it is held decides the action,
//! reported once on release:
//!
//! - short press: sync now
//! - held 3 s: enroll a new user
//! - held 10 s: erase everything (admin)
//!
//! The tracker is fed raw samples and never touches the GPIO itself, so the
//! same logic runs on the device and in tests.

/// Debounce time in milliseconds
const DEBOUNCE_MS: u32 = 50;

pub const ENROLL_HOLD_MS: u32 = 3_000;
pub const ERASE_HOLD_MS: u32 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButtonAction {
    SyncNow,
    Enroll,
    EraseAll,
}

impl ButtonAction {
    pub fn from_hold(held_ms: u32) -> Self {
        if held_ms >= ERASE_HOLD_MS {
            ButtonAction::EraseAll
        } else if held_ms >= ENROLL_HOLD_MS {
            ButtonAction::Enroll
        } else {
            ButtonAction::SyncNow
        }
    }
}

/// Debounced press/release state machine
#[derive(Debug, Default)]
pub struct PressTracker {
    last_state: bool,
    last_change_ms: u32,
    pressed_at_ms: u32,
}

impl PressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one raw sample (`true` = pressed); returns an action on release
    ///
    /// `now_ms` may wrap at `u32::MAX`.
    pub fn update(&mut self, pressed: bool, now_ms: u32) -> Option<ButtonAction> {
        if pressed == self.last_state {
            return None;
        }
        // Debounce: only register state change after stable period
        if now_ms.wrapping_sub(self.last_change_ms) < DEBOUNCE_MS {
            return None;
        }
        self.last_state = pressed;
        self.last_change_ms = now_ms;

        if pressed {
            self.pressed_at_ms = now_ms;
            None
        } else {
            Some(ButtonAction::from_hold(
                now_ms.wrapping_sub(self.pressed_at_ms),
            ))
        }
    }

    /// How long the button has been held, if it is down
    pub fn held_ms(&self, now_ms: u32) -> Option<u32> {
        self.last_state
            .then(|| now_ms.wrapping_sub(self.pressed_at_ms))
    }
}
