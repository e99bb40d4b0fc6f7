//! Sync cycle triggering
//!
//! A sync cycle runs when any of these happen:
//! - the link comes back (disconnected -> connected edge)
//! - the periodic interval has elapsed since the last cycle
//! - the operator asked for one
//!
//! The schedule holds no clock of its own; callers pass the monotonic
//! uptime so it can be driven deterministically.

/// Why a sync cycle is starting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    Reconnected,
    Periodic,
    Manual,
}

#[derive(Debug)]
pub struct SyncSchedule {
    interval_ms: u64,
    last_sync_ms: Option<u64>,
    was_connected: bool,
    manual: bool,
}

impl SyncSchedule {
    pub fn new(interval_ms: u64) -> Self {
        Self {
            interval_ms,
            last_sync_ms: None,
            was_connected: false,
            manual: false,
        }
    }

    /// Ask for a cycle on the next poll
    pub fn request_now(&mut self) {
        self.manual = true;
    }

    /// Check whether a cycle is due; a returned trigger counts as run
    pub fn poll(&mut self, now_ms: u64, connected: bool) -> Option<SyncTrigger> {
        let reconnected = connected && !self.was_connected;
        self.was_connected = connected;

        let trigger = if reconnected {
            SyncTrigger::Reconnected
        } else if self.manual {
            SyncTrigger::Manual
        } else if self.is_due(now_ms) {
            SyncTrigger::Periodic
        } else {
            return None;
        };

        self.manual = false;
        self.last_sync_ms = Some(now_ms);
        Some(trigger)
    }

    /// Milliseconds until the periodic trigger fires
    pub fn remaining_ms(&self, now_ms: u64) -> u64 {
        match self.last_sync_ms {
            None => 0,
            Some(last) => self
                .interval_ms
                .saturating_sub(now_ms.saturating_sub(last)),
        }
    }

    fn is_due(&self, now_ms: u64) -> bool {
        self.remaining_ms(now_ms) == 0
    }
}
