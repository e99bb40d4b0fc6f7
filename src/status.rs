//! Operator-facing status messages
//!
//! The display driver is not part of this crate. The engine reports
//! checkpoints as [`Status`] values to a [`StatusSink`]; their `Display`
//! text is what ends up on the screen.

use core::fmt;

use crate::{PrimaryId, SlotId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    Idle,
    /// Enrollment is waiting for template `index` of `of`
    PlaceFinger { slot: SlotId, index: usize, of: usize },
    TemplateStored { slot: SlotId },
    TryAgain { slot: SlotId },
    /// Attendance accepted; `queued` if it is waiting in the offline log
    Welcome { primary: PrimaryId, queued: bool },
    NotRecognized,
    Enrolled { primary: PrimaryId, templates: usize },
    NoIdentitySlots,
    EnrollmentAbandoned,
    Syncing,
    Synced { delivered: usize, pending: usize },
    Erased,
    /// Flash unusable; captures cannot be logged or mapped
    StorageFault,
    Error(String),
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Idle => f.write_str("Ready - place finger"),
            Status::PlaceFinger { slot, index, of } => {
                write!(f, "Place finger ({}/{}) slot {}", index + 1, of, slot)
            }
            Status::TemplateStored { slot } => write!(f, "Stored slot {}", slot),
            Status::TryAgain { slot } => write!(f, "Try again (slot {})", slot),
            Status::Welcome { primary, queued: false } => write!(f, "Welcome #{}", primary),
            Status::Welcome { primary, queued: true } => {
                write!(f, "Welcome #{} (saved offline)", primary)
            }
            Status::NotRecognized => f.write_str("Not recognized"),
            Status::Enrolled { primary, templates } => {
                write!(f, "Enrolled #{} ({} prints)", primary, templates)
            }
            Status::NoIdentitySlots => f.write_str("No identity slots available"),
            Status::EnrollmentAbandoned => f.write_str("Enrollment cancelled"),
            Status::Syncing => f.write_str("Syncing..."),
            Status::Synced { delivered, pending } => {
                write!(f, "Synced: {} sent, {} pending", delivered, pending)
            }
            Status::Erased => f.write_str("All data erased"),
            Status::StorageFault => f.write_str("STORAGE FAULT"),
            Status::Error(msg) => write!(f, "Error: {}", msg),
        }
    }
}

pub trait StatusSink {
    fn show(&mut self, status: &Status);
}

/// Sink that writes status lines to the log
///
/// The storage fault is re-shown every tick while degraded; back-to-back
/// repeats of it are logged once.
#[derive(Debug, Default)]
pub struct LogStatus {
    last: Option<Status>,
}

impl LogStatus {
    /// Remember `status`; false for a repeated storage fault
    fn changed(&mut self, status: &Status) -> bool {
        if *status == Status::StorageFault && self.last.as_ref() == Some(status) {
            return false;
        }
        self.last = Some(status.clone());
        true
    }
}

impl StatusSink for LogStatus {
    fn show(&mut self, status: &Status) {
        if !self.changed(status) {
            return;
        }
        match status {
            Status::StorageFault | Status::Error(_) => log::error!("[status] {}", status),
            _ => log::info!("[status] {}", status),
        }
    }
}

impl StatusSink for Vec<Status> {
    fn show(&mut self, status: &Status) {
        self.push(status.clone());
    }
}
