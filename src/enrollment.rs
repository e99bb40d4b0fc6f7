//! Multi-template enrollment
//!
//! ```text
//! Allocating -> Capturing(0) -> Capturing(1) -> ... -> Committed
//!      |                                          \
//!      +--> Abandoned                              +--> Abandoned (nothing stored)
//! ```
//!
//! The server hands out a primary id; template `i` goes to slot
//! `primary + i`. Capturing stops early at the sensor's slot capacity, at a
//! slot that already belongs to someone else, or if the sensor stops
//! answering. Whatever was stored by then is kept and committed: templates
//! physically on the sensor are authoritative, and a later mapping refresh
//! reconciles any divergence with the server. Until it does, an id the
//! server offers that this device still maps is refused rather than reused.
//!
//! A failed capture retries the same slot. The operator is standing at the
//! device, so there is no attempt limit.

use heapless::Vec as BoundedVec;
use log::{info, warn};

use crate::clock::Clock;
use crate::config::MAX_TEMPLATES;
use crate::mapping::MappingCache;
use crate::remote::{RemoteClient, RemoteOutcome, Transport};
use crate::sensor::FingerprintSensor;
use crate::status::{Status, StatusSink};
use crate::{PrimaryId, SlotId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrollmentState {
    Allocating,
    Capturing { index: usize },
    Committed,
    Abandoned,
}

impl EnrollmentState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, EnrollmentState::Committed | EnrollmentState::Abandoned)
    }
}

/// Per-attempt state; never persisted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnrollmentSession {
    pub primary: PrimaryId,
    pub assigned: BoundedVec<SlotId, MAX_TEMPLATES>,
    pub target: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbandonReason {
    /// The server has no free primary id
    IdentitySpaceExhausted,
    /// Allocation failed (offline or refused)
    AllocationFailed,
    /// The server offered an id this device already maps locally
    IdentityInUse,
    /// No template made it onto the sensor
    NothingStored,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnrollmentOutcome {
    Committed {
        primary: PrimaryId,
        slots: Vec<SlotId>,
        /// Result of reporting the enrollment; local state stands either way
        reported: RemoteOutcome<()>,
        /// A stored template's mapping could not be written to flash
        storage_fault: bool,
    },
    Abandoned(AbandonReason),
}

pub struct EnrollmentSequencer<'a, T, S> {
    cache: &'a mut MappingCache,
    remote: &'a mut RemoteClient<T>,
    sensor: &'a mut S,
    clock: &'a dyn Clock,
    status: &'a mut dyn StatusSink,
    slot_capacity: u16,
    target: usize,
    state: EnrollmentState,
    session: Option<EnrollmentSession>,
    storage_fault: bool,
    abandon_reason: AbandonReason,
}

impl<'a, T: Transport, S: FingerprintSensor> EnrollmentSequencer<'a, T, S> {
    pub fn new(
        cache: &'a mut MappingCache,
        remote: &'a mut RemoteClient<T>,
        sensor: &'a mut S,
        clock: &'a dyn Clock,
        status: &'a mut dyn StatusSink,
        slot_capacity: u16,
        templates: usize,
    ) -> Self {
        Self {
            cache,
            remote,
            sensor,
            clock,
            status,
            slot_capacity,
            target: templates.clamp(1, MAX_TEMPLATES),
            state: EnrollmentState::Allocating,
            session: None,
            storage_fault: false,
            abandon_reason: AbandonReason::NothingStored,
        }
    }

    pub fn state(&self) -> EnrollmentState {
        self.state
    }

    pub fn session(&self) -> Option<&EnrollmentSession> {
        self.session.as_ref()
    }

    /// Drive the state machine to a terminal state
    pub fn run(mut self) -> EnrollmentOutcome {
        while !self.state.is_terminal() {
            self.step();
        }
        self.outcome_after_terminal()
    }

    /// Advance by one transition
    pub fn step(&mut self) {
        self.state = match self.state {
            EnrollmentState::Allocating => self.allocate(),
            EnrollmentState::Capturing { index } => self.capture(index),
            terminal => terminal,
        };
    }

    fn allocate(&mut self) -> EnrollmentState {
        match self.remote.allocate_primary_id(self.slot_capacity) {
            RemoteOutcome::Success(Some(primary)) => {
                if self.cache.entries().iter().any(|row| row.primary == primary) {
                    warn!("server offered id {} which this device still maps, not enrolling", primary);
                    return self.abandon(AbandonReason::IdentityInUse);
                }
                info!("enrolling primary id {}", primary);
                self.session = Some(EnrollmentSession {
                    primary,
                    assigned: BoundedVec::new(),
                    target: self.target,
                });
                EnrollmentState::Capturing { index: 0 }
            }
            RemoteOutcome::Success(None) => {
                warn!("identity space exhausted");
                self.abandon(AbandonReason::IdentitySpaceExhausted)
            }
            RemoteOutcome::Rejected(rejection) => {
                warn!("primary id allocation rejected: {}", rejection);
                self.abandon(AbandonReason::AllocationFailed)
            }
            RemoteOutcome::Unreachable => {
                warn!("primary id allocation needs the server; offline");
                self.abandon(AbandonReason::AllocationFailed)
            }
        }
    }

    fn capture(&mut self, index: usize) -> EnrollmentState {
        let Some(primary) = self.session.as_ref().map(|s| s.primary) else {
            return self.abandon(AbandonReason::NothingStored);
        };
        if index >= self.target {
            return self.finish();
        }

        let candidate = primary + index as PrimaryId;
        if candidate >= PrimaryId::from(self.slot_capacity) {
            info!("slot {} beyond sensor capacity, stopping", candidate);
            return self.finish();
        }
        let slot = candidate as SlotId;
        if let Some(owner) = self.cache.lookup(slot) {
            warn!("slot {} already belongs to {}, stopping", slot, owner);
            return self.finish();
        }

        self.status.show(&Status::PlaceFinger {
            slot,
            index,
            of: self.target,
        });
        match self.sensor.capture_and_enroll(slot) {
            Ok(()) => {
                let mut keep_going = true;
                if let Err(e) = self.cache.upsert(slot, primary) {
                    warn!("slot {} stored on sensor but mapping not saved: {}", slot, e);
                    if e.is_storage_fault() {
                        self.storage_fault = true;
                    } else {
                        keep_going = false;
                    }
                }
                self.status.show(&Status::TemplateStored { slot });
                let pushed = self
                    .session
                    .as_mut()
                    .map(|s| s.assigned.push(slot).is_ok())
                    .unwrap_or(false);
                if !pushed || !keep_going {
                    return self.finish();
                }
                EnrollmentState::Capturing { index: index + 1 }
            }
            Err(e) if e.is_retryable() => {
                info!("capture for slot {} failed ({}), retrying", slot, e);
                self.status.show(&Status::TryAgain { slot });
                EnrollmentState::Capturing { index }
            }
            Err(e) => {
                warn!("sensor lost during enrollment: {}", e);
                self.status.show(&Status::Error(e.to_string()));
                self.finish()
            }
        }
    }

    fn finish(&mut self) -> EnrollmentState {
        let stored = self
            .session
            .as_ref()
            .map(|s| !s.assigned.is_empty())
            .unwrap_or(false);
        if stored {
            EnrollmentState::Committed
        } else {
            self.abandon(AbandonReason::NothingStored)
        }
    }

    fn abandon(&mut self, reason: AbandonReason) -> EnrollmentState {
        self.abandon_reason = reason;
        let status = match reason {
            AbandonReason::NothingStored => Status::EnrollmentAbandoned,
            _ => Status::NoIdentitySlots,
        };
        self.status.show(&status);
        EnrollmentState::Abandoned
    }

    fn outcome_after_terminal(mut self) -> EnrollmentOutcome {
        let session = match (self.state, self.session) {
            (EnrollmentState::Committed, Some(session)) => session,
            _ => return EnrollmentOutcome::Abandoned(self.abandon_reason),
        };

        let slots: Vec<SlotId> = session.assigned.iter().copied().collect();
        let reported =
            self.remote
                .push_enrollment_complete(session.primary, &slots, self.clock.unix_now());
        if !reported.is_success() {
            warn!(
                "enrollment of {} not reported ({:?}); keeping local mappings",
                session.primary, reported
            );
        }
        self.status.show(&Status::Enrolled {
            primary: session.primary,
            templates: slots.len(),
        });
        EnrollmentOutcome::Committed {
            primary: session.primary,
            slots,
            reported,
            storage_fault: self.storage_fault,
        }
    }
}
