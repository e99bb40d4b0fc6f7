//! Punchclock - fingerprint attendance terminal core
//!
//! A finger is matched on the sensor, which yields a template slot. The
//! slot is resolved to the stable primary user id the server knows, and an
//! attendance record is sent to the server, or kept in a durable log on
//! flash while the link is down. A periodic sync refreshes the slot mapping
//! from the server and replays the log.
//!
//! This crate holds everything that does not touch hardware directly; the
//! ESP32 firmware in `main.rs` supplies the HTTP transport, the UART link
//! to the sensor, the clock, and the button.

pub mod clock;
pub mod config;
pub mod engine;
pub mod enrollment;
pub mod error;
pub mod event_log;
pub mod input;
pub mod mapping;
pub mod remote;
pub mod resolver;
pub mod schedule;
pub mod sensor;
pub mod status;
pub mod sync;

/// Template slot index on the fingerprint sensor
pub type SlotId = u16;

/// Stable identity assigned by the server
pub type PrimaryId = u32;

pub use config::Config;
pub use engine::Engine;
pub use error::{Error, Result};
