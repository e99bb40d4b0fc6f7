//! Error taxonomy for the attendance engine
//!
//! Remote calls do not use this type: they report through
//! [`RemoteOutcome`](crate::remote::RemoteOutcome) so callers can pick a
//! local fallback without unwrapping an error. Everything that touches flash,
//! the sensor, or configuration ends up here.

use core::fmt;

use crate::remote::Rejection;
use crate::sensor::SensorError;

/// Which bounded space ran out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capacity {
    /// The in-memory mapping table has no free rows
    MappingTable,
    /// The server has no free primary id left
    IdentitySpace,
    /// The sensor has no free template slot for this identity
    SlotSpace,
}

impl fmt::Display for Capacity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capacity::MappingTable => f.write_str("mapping table"),
            Capacity::IdentitySpace => f.write_str("identity space"),
            Capacity::SlotSpace => f.write_str("sensor slot space"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No connectivity; always retryable later
    #[error("remote authority unreachable")]
    Unreachable,

    /// Server answered, but not with success
    #[error("remote authority rejected the request: {0}")]
    RemoteRejected(Rejection),

    /// Flash/filesystem inaccessible
    #[error("storage unavailable: {0}")]
    StorageUnavailable(#[from] std::io::Error),

    /// A persisted file exists but cannot be decoded
    #[error("corrupt {file}: {reason}")]
    CorruptStorage { file: &'static str, reason: String },

    #[error("{0} exhausted")]
    CapacityExhausted(Capacity),

    /// Capture matched a template that no identity owns
    #[error("identity not recognized")]
    UnknownIdentity,

    #[error("fingerprint sensor: {0}")]
    Sensor(#[from] SensorError),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// Storage faults leave the device running but degraded
    pub fn is_storage_fault(&self) -> bool {
        matches!(
            self,
            Error::StorageUnavailable(_) | Error::CorruptStorage { .. }
        )
    }
}

pub type Result<T, E = Error> = core::result::Result<T, E>;
