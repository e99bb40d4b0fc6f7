//! Time sources
//!
//! Attendance records carry wall-clock seconds (SNTP-synced on the device);
//! scheduling uses a monotonic millisecond counter that is unaffected by
//! clock corrections.

pub trait Clock {
    /// Seconds since the Unix epoch
    fn unix_now(&self) -> i64;

    /// Milliseconds since boot
    fn uptime_ms(&self) -> u64;
}

/// Clock backed by `std::time`
pub struct SystemClock {
    boot: std::time::Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            boot: std::time::Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn unix_now(&self) -> i64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    }

    fn uptime_ms(&self) -> u64 {
        self.boot.elapsed().as_millis() as u64
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::cell::Cell;

    /// Manually advanced clock
    pub(crate) struct FixedClock {
        pub unix: Cell<i64>,
        pub uptime: Cell<u64>,
    }

    impl FixedClock {
        pub fn at(unix: i64) -> Self {
            Self {
                unix: Cell::new(unix),
                uptime: Cell::new(0),
            }
        }

        pub fn advance_ms(&self, ms: u64) {
            self.uptime.set(self.uptime.get() + ms);
            self.unix.set(self.unix.get() + (ms / 1000) as i64);
        }
    }

    impl Clock for FixedClock {
        fn unix_now(&self) -> i64 {
            self.unix.get()
        }

        fn uptime_ms(&self) -> u64 {
            self.uptime.get()
        }
    }

    #[test]
    fn system_clock_is_past_2020() {
        let clock = SystemClock::new();
        assert!(clock.unix_now() > 1_577_836_800);
        assert!(clock.uptime_ms() < 60_000);
    }
}
