//! Capture resolution: matched slot -> attendance record -> server or log
//!
//! Online, the server is asked who owns the slot and its answer is written
//! back into the cache. Offline, or when the server cannot answer, the
//! cache decides. The resulting record is pushed straight to the server when
//! possible and appended to the durable log otherwise.

use log::{error, info, warn};

use crate::clock::Clock;
use crate::error::Result;
use crate::event_log::{AttendanceRecord, EventLog};
use crate::mapping::MappingCache;
use crate::remote::{RemoteClient, RemoteOutcome, Transport};
use crate::{PrimaryId, SlotId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attendance {
    /// Accepted by the server
    Delivered(AttendanceRecord),
    /// Saved to the durable log for a later drain
    Queued(AttendanceRecord),
    /// No identity owns the slot; nothing recorded
    UnknownIdentity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub attendance: Attendance,
    /// A server-confirmed mapping could not be written to flash
    pub cache_fault: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ResolvePolicy {
    /// Forget a cached slot when the server says nobody owns it
    pub evict_on_remote_not_found: bool,
}

/// Turn a matched slot into a recorded attendance
///
/// Fails only when the record had to be queued and the log could not take
/// it; the capture is then lost and the caller must tell the operator.
pub fn record_attendance<T: Transport>(
    slot: SlotId,
    cache: &mut MappingCache,
    log: &mut EventLog,
    remote: &mut RemoteClient<T>,
    clock: &dyn Clock,
    policy: ResolvePolicy,
) -> Result<Resolution> {
    let mut cache_fault = false;

    let primary = match remote.resolve_primary_id(slot) {
        RemoteOutcome::Success(Some(primary)) => {
            if cache.lookup(slot) != Some(primary) {
                if let Err(e) = cache.upsert(slot, primary) {
                    error!("could not cache slot {} -> {}: {}", slot, primary, e);
                    cache_fault = e.is_storage_fault();
                }
            }
            Some(primary)
        }
        RemoteOutcome::Success(None) => {
            forget_unknown(slot, cache, policy, &mut cache_fault);
            None
        }
        RemoteOutcome::Rejected(rejection) => {
            warn!("resolve slot {} rejected ({}); using cache", slot, rejection);
            cache.lookup(slot)
        }
        RemoteOutcome::Unreachable => cache.lookup(slot),
    };

    let Some(primary) = primary else {
        info!("slot {} not mapped to any identity", slot);
        return Ok(Resolution {
            attendance: Attendance::UnknownIdentity,
            cache_fault,
        });
    };

    let attendance = deliver_or_queue(primary, log, remote, clock)?;
    Ok(Resolution {
        attendance,
        cache_fault,
    })
}

fn forget_unknown(
    slot: SlotId,
    cache: &mut MappingCache,
    policy: ResolvePolicy,
    cache_fault: &mut bool,
) {
    let Some(stale) = cache.lookup(slot) else {
        return;
    };
    if !policy.evict_on_remote_not_found {
        warn!("server does not know slot {} (cached as {}); keeping cache row", slot, stale);
        return;
    }
    warn!("server does not know slot {}; evicting cached {}", slot, stale);
    if let Err(e) = cache.remove(slot) {
        error!("could not evict slot {}: {}", slot, e);
        *cache_fault = e.is_storage_fault();
    }
}

fn deliver_or_queue<T: Transport>(
    primary: PrimaryId,
    log: &mut EventLog,
    remote: &mut RemoteClient<T>,
    clock: &dyn Clock,
) -> Result<Attendance> {
    let record = AttendanceRecord::new(primary, clock.unix_now());
    match remote.push_attendance(&record) {
        RemoteOutcome::Success(()) => return Ok(Attendance::Delivered(record)),
        RemoteOutcome::Rejected(rejection) => {
            warn!("attendance push rejected ({}); queueing", rejection)
        }
        RemoteOutcome::Unreachable => {}
    }
    log.append(record)?;
    Ok(Attendance::Queued(record))
}
