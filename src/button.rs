//! Button input on a GPIO pin
//!
//! The ESP32-S3 devkit has a BOOT button on GPIO0 (active low). The pin is
//! polled from the main loop; press classification and debouncing live in
//! [`PressTracker`] so they can be tested off-target.

use esp_idf_hal::gpio::{Input, PinDriver, Pull};
use log::debug;
use punchclock::input::{ButtonAction, PressTracker};

pub struct Button<'d, P>
where
    P: esp_idf_hal::gpio::InputPin,
{
    pin: PinDriver<'d, P, Input>,
    tracker: PressTracker,
}

impl<'d, P> Button<'d, P>
where
    P: esp_idf_hal::gpio::InputPin + esp_idf_hal::gpio::OutputPin,
{
    /// Configures the pin with internal pull-up (assuming active-low button)
    pub fn new(mut pin: PinDriver<'d, P, Input>) -> anyhow::Result<Self> {
        pin.set_pull(Pull::Up)?;

        Ok(Self {
            pin,
            tracker: PressTracker::new(),
        })
    }

    /// Sample the pin; returns an action once per completed press
    pub fn poll(&mut self) -> Option<ButtonAction> {
        let action = self.tracker.update(self.pin.is_low(), millis());
        if let Some(action) = action {
            debug!("button released: {:?}", action);
        }
        action
    }
}

/// Get current time in milliseconds (wraps at u32::MAX)
fn millis() -> u32 {
    (unsafe { esp_idf_sys::esp_timer_get_time() } / 1000) as u32
}
