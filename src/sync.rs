//! Sync coordinator
//!
//! One cycle refreshes the mapping table from the server and then drains the
//! offline attendance log. The refresh always comes first so captures made
//! after the cycle resolve against the freshest table. A failed refresh
//! keeps the current table: stale rows beat an empty cache when the link
//! drops again.
//!
//! Once a push comes back unreachable the rest of the drain is retained
//! without further attempts; the link is gone and every remaining record
//! would only wait out its own timeout.

use log::{info, warn};

use crate::error::Error;
use crate::event_log::{Delivery, DrainReport, EventLog};
use crate::mapping::MappingCache;
use crate::remote::{Rejection, RemoteClient, RemoteOutcome, Transport};
use crate::schedule::{SyncSchedule, SyncTrigger};

/// What happened to the mapping table during a cycle
#[derive(Debug)]
pub enum MappingRefresh {
    /// Table replaced with this many rows
    Replaced(usize),
    Offline,
    Rejected(Rejection),
    /// Fetched, but the new table could not be installed
    NotInstalled(Error),
}

#[derive(Debug)]
pub struct SyncReport {
    pub trigger: SyncTrigger,
    pub mapping: MappingRefresh,
    pub drain: Result<DrainReport, Error>,
}

impl SyncReport {
    pub fn storage_fault(&self) -> bool {
        let drain_fault = matches!(&self.drain, Err(e) if e.is_storage_fault());
        let mapping_fault =
            matches!(&self.mapping, MappingRefresh::NotInstalled(e) if e.is_storage_fault());
        drain_fault || mapping_fault
    }
}

pub struct SyncCoordinator {
    schedule: SyncSchedule,
}

impl SyncCoordinator {
    pub fn new(interval_ms: u64) -> Self {
        Self {
            schedule: SyncSchedule::new(interval_ms),
        }
    }

    pub fn request_now(&mut self) {
        self.schedule.request_now();
    }

    /// Run a cycle if one is due at `now_ms`
    pub fn poll<T: Transport>(
        &mut self,
        now_ms: u64,
        cache: &mut MappingCache,
        log: &mut EventLog,
        remote: &mut RemoteClient<T>,
    ) -> Option<SyncReport> {
        let trigger = self.schedule.poll(now_ms, remote.is_connected())?;
        Some(run_cycle(trigger, cache, log, remote))
    }
}

/// Refresh the mapping table, then drain the attendance log
pub fn run_cycle<T: Transport>(
    trigger: SyncTrigger,
    cache: &mut MappingCache,
    log: &mut EventLog,
    remote: &mut RemoteClient<T>,
) -> SyncReport {
    info!("sync cycle ({:?})", trigger);
    let mapping = refresh_mapping(cache, remote);
    let drain = drain_log(log, remote);
    SyncReport {
        trigger,
        mapping,
        drain,
    }
}

fn refresh_mapping<T: Transport>(
    cache: &mut MappingCache,
    remote: &mut RemoteClient<T>,
) -> MappingRefresh {
    if !remote.is_connected() {
        return MappingRefresh::Offline;
    }
    match remote.fetch_mapping() {
        RemoteOutcome::Success(rows) => match cache.replace_all(&rows) {
            Ok(()) => MappingRefresh::Replaced(rows.len()),
            Err(e) => {
                warn!("mapping refresh not installed: {}", e);
                MappingRefresh::NotInstalled(e)
            }
        },
        RemoteOutcome::Rejected(rejection) => {
            warn!("mapping refresh rejected: {}; keeping cached table", rejection);
            MappingRefresh::Rejected(rejection)
        }
        RemoteOutcome::Unreachable => MappingRefresh::Offline,
    }
}

fn drain_log<T: Transport>(
    log: &mut EventLog,
    remote: &mut RemoteClient<T>,
) -> Result<DrainReport, Error> {
    let mut link_lost = false;
    log.drain(|record| {
        if link_lost {
            return Delivery::Retry;
        }
        match remote.push_attendance(record) {
            RemoteOutcome::Success(()) => Delivery::Delivered,
            RemoteOutcome::Rejected(rejection) if rejection.is_permanent() => {
                warn!(
                    "server refused attendance {}@{} ({}); dropping",
                    record.primary, record.timestamp, rejection
                );
                Delivery::Drop
            }
            RemoteOutcome::Rejected(_) => Delivery::Retry,
            RemoteOutcome::Unreachable => {
                link_lost = true;
                Delivery::Retry
            }
        }
    })
    .map_err(|e| {
        warn!("attendance log unavailable: {}", e);
        e
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_log::AttendanceRecord;
    use crate::mapping::MappingEntry;
    use crate::remote::tests::FakeTransport;
    use crate::remote::Method;
    use std::path::Path;
    use tempfile::tempdir;

    fn stores(dir: &Path) -> (MappingCache, EventLog) {
        (
            MappingCache::new(dir.join("mapping.dat"), 128),
            EventLog::open(dir.join("attendance.log"), dir.join("attendance.tmp")),
        )
    }

    fn paths(remote: &RemoteClient<FakeTransport>) -> Vec<String> {
        remote
            .transport()
            .calls
            .iter()
            .map(|(method, path, _)| format!("{method} {path}"))
            .collect()
    }

    #[test]
    fn refresh_precedes_drain() {
        let dir = tempdir().unwrap();
        let (mut cache, mut log) = stores(dir.path());
        log.append(AttendanceRecord::new(1, 100)).unwrap();
        log.append(AttendanceRecord::new(2, 200)).unwrap();

        let mut transport = FakeTransport::online();
        transport
            .reply(200, r#"[{"sensorId":4,"primaryUserId":2}]"#)
            .reply(200, "")
            .reply(200, "");
        let mut remote = RemoteClient::new(transport);

        let report = run_cycle(SyncTrigger::Reconnected, &mut cache, &mut log, &mut remote);
        assert_eq!(
            paths(&remote),
            vec!["GET /mapping", "POST /attendance", "POST /attendance"]
        );
        assert!(matches!(report.mapping, MappingRefresh::Replaced(1)));
        assert_eq!(report.drain.unwrap().delivered, 2);
        assert_eq!(cache.lookup(4), Some(2));
        assert!(log.is_empty().unwrap());
    }

    #[test]
    fn failed_refresh_keeps_cache() {
        let dir = tempdir().unwrap();
        let (mut cache, mut log) = stores(dir.path());
        cache.upsert(9, 3).unwrap();

        let mut transport = FakeTransport::online();
        transport.reply(500, "");
        let mut remote = RemoteClient::new(transport);

        let report = run_cycle(SyncTrigger::Periodic, &mut cache, &mut log, &mut remote);
        assert!(matches!(report.mapping, MappingRefresh::Rejected(_)));
        assert_eq!(cache.lookup(9), Some(3));
    }

    #[test]
    fn offline_cycle_retains_backlog_without_io() {
        let dir = tempdir().unwrap();
        let (mut cache, mut log) = stores(dir.path());
        log.append(AttendanceRecord::new(1, 100)).unwrap();
        let mut remote = RemoteClient::new(FakeTransport::default());

        let report = run_cycle(SyncTrigger::Periodic, &mut cache, &mut log, &mut remote);
        assert!(matches!(report.mapping, MappingRefresh::Offline));
        assert_eq!(report.drain.unwrap().retained, 1);
        assert!(remote.transport().calls.is_empty());
    }

    #[test]
    fn link_loss_mid_drain_stops_attempts() {
        let dir = tempdir().unwrap();
        let (mut cache, mut log) = stores(dir.path());
        for i in 0..4 {
            log.append(AttendanceRecord::new(i + 1, 100 + i as i64)).unwrap();
        }

        let mut transport = FakeTransport::online();
        // mapping ok, first push ok, second push has no reply (transport error)
        transport.reply(200, "[]").reply(200, "");
        let mut remote = RemoteClient::new(transport);

        let report = run_cycle(SyncTrigger::Periodic, &mut cache, &mut log, &mut remote);
        let drain = report.drain.unwrap();
        assert_eq!(drain.delivered, 1);
        assert_eq!(drain.retained, 3);
        assert_eq!(remote.transport().calls.len(), 3);
        assert_eq!(
            log.records().unwrap().iter().map(|r| r.primary).collect::<Vec<_>>(),
            vec![2, 3, 4]
        );
    }

    #[test]
    fn validation_rejections_are_dropped_transient_kept() {
        let dir = tempdir().unwrap();
        let (mut cache, mut log) = stores(dir.path());
        log.append(AttendanceRecord::new(1, 100)).unwrap();
        log.append(AttendanceRecord::new(2, 200)).unwrap();

        let mut transport = FakeTransport::online();
        transport.reply(200, "[]").reply(400, "").reply(503, "");
        let mut remote = RemoteClient::new(transport);

        let drain = run_cycle(SyncTrigger::Manual, &mut cache, &mut log, &mut remote)
            .drain
            .unwrap();
        assert_eq!(drain.dropped, 1);
        assert_eq!(drain.retained, 1);
        assert_eq!(log.records().unwrap(), vec![AttendanceRecord::new(2, 200)]);
    }

    #[test]
    fn coordinator_runs_on_reconnect() {
        let dir = tempdir().unwrap();
        let (mut cache, mut log) = stores(dir.path());
        log.append(AttendanceRecord::new(5, 500)).unwrap();
        let mut remote = RemoteClient::new(FakeTransport::default());
        let mut sync = SyncCoordinator::new(3_600_000);

        // boot offline: periodic cycle, nothing sent
        assert!(sync.poll(0, &mut cache, &mut log, &mut remote).is_some());
        assert!(sync.poll(1_000, &mut cache, &mut log, &mut remote).is_none());

        remote.transport_mut().online = true;
        remote
            .transport_mut()
            .reply(200, r#"[{"sensorId":1,"primaryUserId":5}]"#)
            .reply(200, "");
        let report = sync
            .poll(2_000, &mut cache, &mut log, &mut remote)
            .unwrap();
        assert_eq!(report.trigger, SyncTrigger::Reconnected);
        assert_eq!(remote.transport().calls[0].0, Method::Get);
        assert_eq!(cache.entries(), vec![MappingEntry::new(1, 5)]);
        assert!(log.is_empty().unwrap());
    }
}
