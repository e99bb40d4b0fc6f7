//! Fingerprint sensor boundary
//!
//! The engine only needs three things from the sensor: match a presented
//! finger against stored templates, store a new template in a given slot,
//! and wipe everything. Matching itself happens on the sensor.

pub mod r307;

use crate::SlotId;

/// Result of one capture-and-match attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureOutcome {
    Matched { slot: SlotId, confidence: u16 },
    NoFinger,
    NoMatch,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SensorError {
    /// The sensor answered with a non-zero confirmation code
    #[error("sensor rejected command (code {0:#04x})")]
    Rejected(u8),
    /// No finger was presented in time
    #[error("timed out waiting for finger")]
    Timeout,
    /// UART or framing failure; the sensor is not talking
    #[error("sensor link: {0}")]
    Link(String),
}

impl SensorError {
    /// Worth asking the operator to try again
    pub fn is_retryable(&self) -> bool {
        !matches!(self, SensorError::Link(_))
    }
}

pub trait FingerprintSensor {
    fn capture_and_match(&mut self) -> Result<CaptureOutcome, SensorError>;

    /// Capture a finger and store the resulting template in `slot`
    fn capture_and_enroll(&mut self, slot: SlotId) -> Result<(), SensorError>;

    fn erase_all(&mut self) -> Result<(), SensorError>;
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Sensor double fed from queues; empty queues mean "no finger" / success
    #[derive(Default)]
    pub(crate) struct FakeSensor {
        pub captures: VecDeque<Result<CaptureOutcome, SensorError>>,
        pub enroll_results: VecDeque<Result<(), SensorError>>,
        pub enrolled: Vec<SlotId>,
        pub enroll_attempts: Vec<SlotId>,
        pub erased: bool,
    }

    impl FingerprintSensor for FakeSensor {
        fn capture_and_match(&mut self) -> Result<CaptureOutcome, SensorError> {
            self.captures.pop_front().unwrap_or(Ok(CaptureOutcome::NoFinger))
        }

        fn capture_and_enroll(&mut self, slot: SlotId) -> Result<(), SensorError> {
            self.enroll_attempts.push(slot);
            let result = self.enroll_results.pop_front().unwrap_or(Ok(()));
            if result.is_ok() {
                self.enrolled.push(slot);
            }
            result
        }

        fn erase_all(&mut self) -> Result<(), SensorError> {
            self.erased = true;
            self.enrolled.clear();
            Ok(())
        }
    }

    #[test]
    fn only_link_failures_are_fatal() {
        assert!(SensorError::Rejected(0x06).is_retryable());
        assert!(SensorError::Timeout.is_retryable());
        assert!(!SensorError::Link("uart".into()).is_retryable());
    }
}
