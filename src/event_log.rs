//! Durable attendance log
//!
//! Records that could not be delivered are appended here as text lines of
//! `primaryUserId,timestamp`. A drain pass offers every record to a delivery
//! function once, in file order, then rewrites the log with only the records
//! that must be retried.
//!
//! # Crash safety
//!
//! Compaction writes the retained records to a temp file, fsyncs it, and
//! renames it over the log. Until the rename lands the old log is intact, so
//! a power cut mid-drain can only cause redelivery, never loss. A temp file
//! found at open time is a leftover from such a cut and is discarded.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use log::{debug, info, warn};

use crate::error::{Error, Result};
use crate::PrimaryId;

/// One attendance punch, immutable once built
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttendanceRecord {
    pub primary: PrimaryId,
    /// Seconds since the Unix epoch
    pub timestamp: i64,
}

impl AttendanceRecord {
    pub fn new(primary: PrimaryId, timestamp: i64) -> Self {
        Self { primary, timestamp }
    }

    fn to_line(self) -> String {
        format!("{},{}\n", self.primary, self.timestamp)
    }

    fn parse_line(line: &str) -> Option<Self> {
        let (primary, timestamp) = line.trim().split_once(',')?;
        Some(Self {
            primary: primary.trim().parse().ok()?,
            timestamp: timestamp.trim().parse().ok()?,
        })
    }
}

/// What a delivery attempt decided for one record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Accepted by the server; remove from the log
    Delivered,
    /// Not delivered; keep for the next drain
    Retry,
    /// Will never be accepted; remove so it cannot poison the queue
    Drop,
}

/// Tally of one drain pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    pub delivered: usize,
    pub retained: usize,
    /// Rejected records plus unparseable lines
    pub dropped: usize,
}

impl DrainReport {
    pub fn attempted(&self) -> usize {
        self.delivered + self.retained + self.dropped
    }
}

pub struct EventLog {
    path: PathBuf,
    temp_path: PathBuf,
}

impl EventLog {
    /// Bind the log to its files, discarding any interrupted compaction
    pub fn open(path: impl Into<PathBuf>, temp_path: impl Into<PathBuf>) -> Self {
        let log = Self {
            path: path.into(),
            temp_path: temp_path.into(),
        };
        match fs::remove_file(&log.temp_path) {
            Ok(()) => warn!("discarded interrupted log compaction"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!("could not remove stale compaction file: {}", e),
        }
        log
    }

    /// Durably add one record
    ///
    /// A log cut off mid-line by a power loss is terminated first, so the
    /// torn fragment stays on its own line and cannot absorb this record.
    pub fn append(&mut self, record: AttendanceRecord) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)?;
        let mut line = record.to_line();
        if !ends_with_newline(&mut file)? {
            warn!("log ends in a torn line, terminating it");
            line.insert(0, '\n');
        }
        file.write_all(line.as_bytes())?;
        file.sync_data()?;
        debug!("queued attendance for {} at {}", record.primary, record.timestamp);
        Ok(())
    }

    /// Every parseable record currently queued, in file order
    pub fn records(&self) -> Result<Vec<AttendanceRecord>> {
        Ok(self
            .read_lines()?
            .iter()
            .filter_map(|line| AttendanceRecord::parse_line(line))
            .collect())
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.records()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Offer each queued record to `deliver` exactly once
    ///
    /// Records answered with [`Delivery::Retry`] stay in the log in their
    /// original order. Returns `StorageUnavailable` without calling `deliver`
    /// when the log exists but cannot be read; an absent log is just empty.
    pub fn drain<F>(&mut self, mut deliver: F) -> Result<DrainReport>
    where
        F: FnMut(&AttendanceRecord) -> Delivery,
    {
        let lines = self.read_lines()?;
        let mut report = DrainReport::default();
        let mut retained = Vec::with_capacity(lines.len());

        for line in &lines {
            let Some(record) = AttendanceRecord::parse_line(line) else {
                warn!("dropping unparseable log line {:?}", line);
                report.dropped += 1;
                continue;
            };
            match deliver(&record) {
                Delivery::Delivered => report.delivered += 1,
                Delivery::Drop => report.dropped += 1,
                Delivery::Retry => {
                    report.retained += 1;
                    retained.push(record);
                }
            }
        }

        if report.retained != lines.len() {
            self.compact(&retained)?;
        }
        if report.attempted() > 0 {
            info!(
                "log drain: {} delivered, {} retained, {} dropped",
                report.delivered, report.retained, report.dropped
            );
        }
        Ok(report)
    }

    /// Discard every queued record
    pub fn clear(&mut self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn read_lines(&self) -> Result<Vec<String>> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::StorageUnavailable(e)),
        };
        // invalid UTF-8 becomes U+FFFD, which never parses as a record
        Ok(bytes
            .split(|b| *b == b'\n')
            .map(String::from_utf8_lossy)
            .filter(|line| !line.trim().is_empty())
            .map(|line| line.into_owned())
            .collect())
    }

    fn compact(&self, retained: &[AttendanceRecord]) -> Result<()> {
        {
            let mut tmp = File::create(&self.temp_path)?;
            for record in retained {
                tmp.write_all(record.to_line().as_bytes())?;
            }
            tmp.sync_all()?;
        }
        fs::rename(&self.temp_path, &self.path)?;
        Ok(())
    }
}

fn ends_with_newline(file: &mut File) -> Result<bool> {
    if file.metadata()?.len() == 0 {
        return Ok(true);
    }
    let mut last = [0u8; 1];
    file.seek(SeekFrom::End(-1))?;
    file.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::path::Path;
    use tempfile::tempdir;

    fn log_in(dir: &Path) -> EventLog {
        EventLog::open(dir.join("attendance.log"), dir.join("attendance.tmp"))
    }

    fn seed(log: &mut EventLog, count: u32) -> Vec<AttendanceRecord> {
        (0..count)
            .map(|i| {
                let record = AttendanceRecord::new(100 + i, 1_700_000_000 + i as i64);
                log.append(record).unwrap();
                record
            })
            .collect()
    }

    #[test]
    fn append_writes_text_lines() {
        let dir = tempdir().unwrap();
        let mut log = log_in(dir.path());
        log.append(AttendanceRecord::new(12, 1_700_000_123)).unwrap();
        log.append(AttendanceRecord::new(7, 1_700_000_200)).unwrap();

        let text = fs::read_to_string(dir.path().join("attendance.log")).unwrap();
        assert_eq!(text, "12,1700000123\n7,1700000200\n");
        assert_eq!(log.len().unwrap(), 2);
    }

    #[test]
    fn failing_drain_is_idempotent() {
        let dir = tempdir().unwrap();
        let mut log = log_in(dir.path());
        let seeded = seed(&mut log, 5);

        for _ in 0..2 {
            let report = log.drain(|_| Delivery::Retry).unwrap();
            assert_eq!(report.retained, 5);
            assert_eq!(log.records().unwrap(), seeded);
        }
    }

    #[test]
    fn drain_keeps_complement_in_order() {
        let dir = tempdir().unwrap();
        let mut log = log_in(dir.path());
        let seeded = seed(&mut log, 6);
        let accepted: HashSet<PrimaryId> = [100, 103, 104].into_iter().collect();

        let report = log
            .drain(|r| {
                if accepted.contains(&r.primary) {
                    Delivery::Delivered
                } else {
                    Delivery::Retry
                }
            })
            .unwrap();

        assert_eq!(report.delivered, 3);
        let expected: Vec<_> = seeded
            .into_iter()
            .filter(|r| !accepted.contains(&r.primary))
            .collect();
        assert_eq!(log.records().unwrap(), expected);
    }

    #[test]
    fn each_record_is_offered_once_per_drain() {
        let dir = tempdir().unwrap();
        let mut log = log_in(dir.path());
        seed(&mut log, 4);

        let mut offered = Vec::new();
        log.drain(|r| {
            offered.push(r.primary);
            Delivery::Retry
        })
        .unwrap();
        assert_eq!(offered, vec![100, 101, 102, 103]);
    }

    #[test]
    fn dropped_records_leave_the_log() {
        let dir = tempdir().unwrap();
        let mut log = log_in(dir.path());
        seed(&mut log, 2);

        let report = log
            .drain(|r| if r.primary == 100 { Delivery::Drop } else { Delivery::Retry })
            .unwrap();
        assert_eq!(report.dropped, 1);
        assert_eq!(log.len().unwrap(), 1);
    }

    #[test]
    fn missing_log_drains_as_empty() {
        let dir = tempdir().unwrap();
        let mut log = log_in(dir.path());
        let report = log.drain(|_| Delivery::Delivered).unwrap();
        assert_eq!(report, DrainReport::default());
    }

    #[test]
    fn unreadable_log_is_unavailable_not_empty() {
        let dir = tempdir().unwrap();
        // a directory where the log file should be cannot be opened as a file
        fs::create_dir(dir.path().join("attendance.log")).unwrap();
        let mut log = log_in(dir.path());

        let mut called = false;
        let result = log.drain(|_| {
            called = true;
            Delivery::Delivered
        });
        assert!(result.is_err());
        assert!(!called);
    }

    #[test]
    fn append_reports_missing_storage() {
        let dir = tempdir().unwrap();
        let mut log = EventLog::open(
            dir.path().join("absent/attendance.log"),
            dir.path().join("absent/attendance.tmp"),
        );
        let err = log.append(AttendanceRecord::new(1, 1)).unwrap_err();
        assert!(err.is_storage_fault());
    }

    #[test]
    fn garbage_lines_are_dropped_during_drain() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("attendance.log"), "5,100\nnot-a-record\n6,200\n").unwrap();
        let mut log = log_in(dir.path());

        let report = log.drain(|_| Delivery::Retry).unwrap();
        assert_eq!(report.dropped, 1);
        assert_eq!(report.retained, 2);
        let text = fs::read_to_string(dir.path().join("attendance.log")).unwrap();
        assert_eq!(text, "5,100\n6,200\n");
    }

    #[test]
    fn torn_tail_does_not_swallow_next_record() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("attendance.log"), "12,17000").unwrap();
        let mut log = log_in(dir.path());

        log.append(AttendanceRecord::new(7, 1_700_000_200)).unwrap();
        let text = fs::read_to_string(dir.path().join("attendance.log")).unwrap();
        assert_eq!(text, "12,17000\n7,1700000200\n");
        assert!(log
            .records()
            .unwrap()
            .contains(&AttendanceRecord::new(7, 1_700_000_200)));
    }

    #[test]
    fn torn_garbage_tail_is_dropped_alone() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("attendance.log"), "5,100\n6,2").unwrap();
        let mut log = log_in(dir.path());
        fs::OpenOptions::new()
            .append(true)
            .open(dir.path().join("attendance.log"))
            .unwrap()
            .write_all(b"\xff")
            .unwrap();

        log.append(AttendanceRecord::new(8, 300)).unwrap();
        let report = log.drain(|_| Delivery::Retry).unwrap();
        assert_eq!(report.dropped, 1);
        assert_eq!(
            log.records().unwrap(),
            vec![AttendanceRecord::new(5, 100), AttendanceRecord::new(8, 300)]
        );
    }

    #[test]
    fn non_utf8_line_is_dropped_not_fatal() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("attendance.log"), b"5,100\n\xff\xfe\n6,200\n").unwrap();
        let mut log = log_in(dir.path());

        let mut offered = Vec::new();
        let report = log
            .drain(|r| {
                offered.push(r.primary);
                Delivery::Delivered
            })
            .unwrap();
        assert_eq!(offered, vec![5, 6]);
        assert_eq!(report.delivered, 2);
        assert_eq!(report.dropped, 1);
        assert!(log.is_empty().unwrap());
    }

    #[test]
    fn stale_compaction_file_is_discarded_and_log_kept() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("attendance.log"), "1,10\n2,20\n").unwrap();
        fs::write(dir.path().join("attendance.tmp"), "1,10\n").unwrap();

        let log = log_in(dir.path());
        assert!(!dir.path().join("attendance.tmp").exists());
        assert_eq!(log.len().unwrap(), 2);
    }

    #[test]
    fn clear_empties_the_log() {
        let dir = tempdir().unwrap();
        let mut log = log_in(dir.path());
        seed(&mut log, 3);
        log.clear().unwrap();
        assert!(log.is_empty().unwrap());
        log.clear().unwrap();
    }
}
