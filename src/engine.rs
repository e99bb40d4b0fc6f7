//! Cooperative scheduler for the terminal
//!
//! One `tick` runs the capture phase and then the sync phase. Enrollment and
//! admin actions come in through [`Engine::handle`] and run to completion
//! before the next tick. Nothing here runs concurrently, so the cache and
//! the log are only ever touched through `&mut self`.

use log::{error, info, warn};

use crate::clock::Clock;
use crate::config::Config;
use crate::enrollment::{EnrollmentOutcome, EnrollmentSequencer};
use crate::error::{Error, Result};
use crate::event_log::EventLog;
use crate::input::ButtonAction;
use crate::mapping::MappingCache;
use crate::remote::{RemoteClient, RemoteOutcome, Transport};
use crate::resolver::{self, Attendance, ResolvePolicy};
use crate::sensor::{CaptureOutcome, FingerprintSensor, SensorError};
use crate::status::{Status, StatusSink};
use crate::sync::{SyncCoordinator, SyncReport};
use crate::SlotId;

/// What the capture phase saw
#[derive(Debug)]
pub enum CaptureEvent {
    /// A finger was read but matched no stored template
    NoMatch,
    Resolved(Attendance),
    /// Matched, but the record could not be saved anywhere
    Lost(Error),
    SensorFault(SensorError),
}

#[derive(Debug, Default)]
pub struct TickReport {
    pub capture: Option<CaptureEvent>,
    pub sync: Option<SyncReport>,
}

pub struct Engine<T, S, K> {
    config: Config,
    cache: MappingCache,
    log: EventLog,
    remote: RemoteClient<T>,
    sensor: S,
    clock: K,
    sync: SyncCoordinator,
    storage_fault: bool,
}

impl<T: Transport, S: FingerprintSensor, K: Clock> Engine<T, S, K> {
    /// Validate `config`, bind storage, and restore the mapping mirror
    ///
    /// A mirror that cannot be restored is logged and leaves the engine
    /// running on an empty table with the storage fault raised.
    pub fn open(config: Config, transport: T, sensor: S, clock: K) -> Result<Self> {
        config.validate()?;

        let mut cache = MappingCache::new(config.mapping_path(), config.slot_capacity as usize);
        let storage_fault = match cache.restore() {
            Ok(()) => false,
            Err(e) => {
                error!("mapping table not restored: {}", e);
                e.is_storage_fault()
            }
        };
        let log = EventLog::open(config.log_path(), config.log_temp_path());
        let sync = SyncCoordinator::new(config.sync_interval_ms());

        Ok(Self {
            config,
            cache,
            log,
            remote: RemoteClient::new(transport),
            sensor,
            clock,
            sync,
            storage_fault,
        })
    }

    pub fn tick(&mut self, status: &mut dyn StatusSink) -> TickReport {
        let capture = self.capture_phase(status);
        let sync = self.sync_phase(status);
        if self.storage_fault {
            status.show(&Status::StorageFault);
        }
        TickReport { capture, sync }
    }

    /// Poll the sensor once and record any matched finger
    pub fn capture_phase(&mut self, status: &mut dyn StatusSink) -> Option<CaptureEvent> {
        let event = match self.sensor.capture_and_match() {
            Ok(CaptureOutcome::NoFinger) => return None,
            Ok(CaptureOutcome::NoMatch) => {
                status.show(&Status::NotRecognized);
                CaptureEvent::NoMatch
            }
            Ok(CaptureOutcome::Matched { slot, confidence }) => {
                info!("finger matched slot {} (confidence {})", slot, confidence);
                self.record(slot, status)
            }
            Err(e) => {
                warn!("capture failed: {}", e);
                status.show(&Status::Error(e.to_string()));
                CaptureEvent::SensorFault(e)
            }
        };
        Some(event)
    }

    fn record(&mut self, slot: SlotId, status: &mut dyn StatusSink) -> CaptureEvent {
        let policy = ResolvePolicy {
            evict_on_remote_not_found: self.config.evict_on_remote_not_found,
        };
        match resolver::record_attendance(
            slot,
            &mut self.cache,
            &mut self.log,
            &mut self.remote,
            &self.clock,
            policy,
        ) {
            Ok(resolution) => {
                if resolution.cache_fault {
                    self.raise_storage_fault(status);
                }
                let shown = match resolution.attendance {
                    Attendance::Delivered(record) => Status::Welcome {
                        primary: record.primary,
                        queued: false,
                    },
                    Attendance::Queued(record) => Status::Welcome {
                        primary: record.primary,
                        queued: true,
                    },
                    Attendance::UnknownIdentity => Status::NotRecognized,
                };
                status.show(&shown);
                CaptureEvent::Resolved(resolution.attendance)
            }
            Err(e) => {
                error!("attendance for slot {} lost: {}", slot, e);
                if e.is_storage_fault() {
                    self.raise_storage_fault(status);
                }
                status.show(&Status::Error("attendance not saved".into()));
                CaptureEvent::Lost(e)
            }
        }
    }

    /// Run a sync cycle if one is due
    pub fn sync_phase(&mut self, status: &mut dyn StatusSink) -> Option<SyncReport> {
        let report = self.sync.poll(
            self.clock.uptime_ms(),
            &mut self.cache,
            &mut self.log,
            &mut self.remote,
        )?;
        if report.storage_fault() {
            self.raise_storage_fault(status);
        }
        if let Ok(drain) = &report.drain {
            if drain.attempted() > 0 {
                status.show(&Status::Synced {
                    delivered: drain.delivered,
                    pending: drain.retained,
                });
            }
        }
        Some(report)
    }

    pub fn handle(&mut self, action: ButtonAction, status: &mut dyn StatusSink) {
        info!("operator action: {:?}", action);
        match action {
            ButtonAction::SyncNow => {
                status.show(&Status::Syncing);
                self.sync.request_now();
                self.sync_phase(status);
            }
            ButtonAction::Enroll => {
                self.enroll(status);
            }
            ButtonAction::EraseAll => {
                if let Err(e) = self.erase_all(status) {
                    status.show(&Status::Error(e.to_string()));
                }
            }
        }
        status.show(&Status::Idle);
    }

    /// Enroll a new identity with the configured number of templates
    pub fn enroll(&mut self, status: &mut dyn StatusSink) -> EnrollmentOutcome {
        let outcome = EnrollmentSequencer::new(
            &mut self.cache,
            &mut self.remote,
            &mut self.sensor,
            &self.clock,
            status,
            self.config.slot_capacity,
            self.config.templates_per_identity as usize,
        )
        .run();
        if let EnrollmentOutcome::Committed {
            storage_fault: true,
            ..
        } = outcome
        {
            self.raise_storage_fault(status);
        }
        outcome
    }

    /// Wipe the server, the sensor, the mapping table, and the log
    ///
    /// The server goes first. If it does not confirm, nothing local is
    /// touched; otherwise the next refresh would resurrect mappings for
    /// templates that no longer exist.
    pub fn erase_all(&mut self, status: &mut dyn StatusSink) -> Result<()> {
        match self.remote.request_full_erase() {
            RemoteOutcome::Success(()) => {}
            RemoteOutcome::Rejected(rejection) => return Err(Error::RemoteRejected(rejection)),
            RemoteOutcome::Unreachable => return Err(Error::Unreachable),
        }
        self.sensor.erase_all()?;
        let local = self.cache.replace_all(&[]).and_then(|()| self.log.clear());
        if let Err(e) = local {
            if e.is_storage_fault() {
                self.raise_storage_fault(status);
            }
            return Err(e);
        }
        warn!("all templates, mappings, and queued attendance erased");
        status.show(&Status::Erased);
        Ok(())
    }

    /// Captures are accepted but may not be logged or mapped
    pub fn is_degraded(&self) -> bool {
        self.storage_fault
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn cache(&self) -> &MappingCache {
        &self.cache
    }

    pub fn log(&self) -> &EventLog {
        &self.log
    }

    pub fn remote(&self) -> &RemoteClient<T> {
        &self.remote
    }

    pub fn remote_mut(&mut self) -> &mut RemoteClient<T> {
        &mut self.remote
    }

    pub fn sensor_mut(&mut self) -> &mut S {
        &mut self.sensor
    }

    pub fn clock(&self) -> &K {
        &self.clock
    }

    /// Enter degraded mode; stays set until reboot
    pub fn raise_storage_fault(&mut self, status: &mut dyn StatusSink) {
        if !self.storage_fault {
            error!("storage fault: running degraded");
            self.storage_fault = true;
        }
        status.show(&Status::StorageFault);
    }
}
