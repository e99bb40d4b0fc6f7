//! Identity mapping cache (sensor slot -> primary user id)
//!
//! The table lives in a fixed-capacity map sized to the sensor and is
//! mirrored to flash after every mutation. The mirror is a postcard-encoded
//! array of [`MappingEntry`], replaced atomically (write temp, fsync, rename)
//! so a power cut leaves either the old or the new table on disk.
//!
//! While the server is unreachable this table is the only way to turn a
//! matched slot into an identity.

use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use heapless::FnvIndexMap;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::config::MAX_SLOTS;
use crate::error::{Capacity, Error, Result};
use crate::{PrimaryId, SlotId};

/// One row of the mapping table
///
/// Shared between the flash mirror and the JSON wire format, hence the
/// server's field names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingEntry {
    #[serde(rename = "sensorId")]
    pub slot: SlotId,
    #[serde(rename = "primaryUserId")]
    pub primary: PrimaryId,
}

impl MappingEntry {
    pub fn new(slot: SlotId, primary: PrimaryId) -> Self {
        Self { slot, primary }
    }
}

pub struct MappingCache {
    table: FnvIndexMap<SlotId, PrimaryId, MAX_SLOTS>,
    /// Usable rows, at most `MAX_SLOTS`
    capacity: usize,
    path: PathBuf,
}

impl MappingCache {
    /// Create an empty cache mirrored at `path`
    ///
    /// Nothing is read; call [`restore`](Self::restore) to load the mirror.
    pub fn new(path: impl Into<PathBuf>, capacity: usize) -> Self {
        Self {
            table: FnvIndexMap::new(),
            capacity: capacity.min(MAX_SLOTS),
            path: path.into(),
        }
    }

    pub fn lookup(&self, slot: SlotId) -> Option<PrimaryId> {
        self.table.get(&slot).copied()
    }

    /// Insert or overwrite one mapping, then persist
    ///
    /// Re-inserting an identical row still rewrites the mirror, which keeps
    /// the call idempotent from the caller's side.
    pub fn upsert(&mut self, slot: SlotId, primary: PrimaryId) -> Result<()> {
        if !self.table.contains_key(&slot) && self.table.len() >= self.capacity {
            return Err(Error::CapacityExhausted(Capacity::MappingTable));
        }
        self.table
            .insert(slot, primary)
            .map_err(|_| Error::CapacityExhausted(Capacity::MappingTable))?;
        debug!("mapping upsert: slot {} -> {}", slot, primary);
        self.persist()
    }

    /// Drop one mapping, then persist
    pub fn remove(&mut self, slot: SlotId) -> Result<Option<PrimaryId>> {
        let removed = self.table.remove(&slot);
        if removed.is_some() {
            self.persist()?;
        }
        Ok(removed)
    }

    /// Swap the whole table for `entries`, then persist
    ///
    /// The new table is built aside first; if it does not fit, the current
    /// table is left untouched. Duplicate slots keep the last row.
    pub fn replace_all(&mut self, entries: &[MappingEntry]) -> Result<()> {
        let mut next = FnvIndexMap::<SlotId, PrimaryId, MAX_SLOTS>::new();
        for entry in entries {
            if !next.contains_key(&entry.slot) && next.len() >= self.capacity {
                return Err(Error::CapacityExhausted(Capacity::MappingTable));
            }
            next.insert(entry.slot, entry.primary)
                .map_err(|_| Error::CapacityExhausted(Capacity::MappingTable))?;
        }
        self.table = next;
        info!("mapping table replaced: {} entries", self.table.len());
        self.persist()
    }

    /// Snapshot of every row, ordered by slot
    pub fn entries(&self) -> Vec<MappingEntry> {
        let mut rows: Vec<MappingEntry> = self
            .table
            .iter()
            .map(|(slot, primary)| MappingEntry::new(*slot, *primary))
            .collect();
        rows.sort_by_key(|row| row.slot);
        rows
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Write the full table to flash
    pub fn persist(&self) -> Result<()> {
        let bytes = postcard::to_allocvec(&self.entries()).map_err(|e| Error::CorruptStorage {
            file: "mapping table",
            reason: e.to_string(),
        })?;
        write_atomically(&self.path, &bytes)
    }

    /// Replace the in-memory table with whatever was last persisted
    ///
    /// A missing mirror means "never persisted" and yields an empty table.
    /// On a decode error the in-memory table is left as it was.
    pub fn restore(&mut self) -> Result<()> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!("no mapping mirror at {}, starting empty", self.path.display());
                self.table.clear();
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        let rows: Vec<MappingEntry> =
            postcard::from_bytes(&bytes).map_err(|e| Error::CorruptStorage {
                file: "mapping table",
                reason: e.to_string(),
            })?;

        let mut next = FnvIndexMap::<SlotId, PrimaryId, MAX_SLOTS>::new();
        for row in &rows {
            if next.len() >= self.capacity && !next.contains_key(&row.slot) {
                warn!("mapping mirror larger than capacity, ignoring slot {}", row.slot);
                continue;
            }
            // Cannot fail: len is checked against capacity <= MAX_SLOTS above
            let _ = next.insert(row.slot, row.primary);
        }
        self.table = next;
        info!("mapping table restored: {} entries", self.table.len());
        Ok(())
    }
}

/// Replace `path` with `bytes` via a sibling temp file
pub(crate) fn write_atomically(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn cache_in(dir: &Path, capacity: usize) -> MappingCache {
        MappingCache::new(dir.join("mapping.dat"), capacity)
    }

    #[test]
    fn upsert_then_lookup() {
        let dir = tempdir().unwrap();
        let mut cache = cache_in(dir.path(), 128);

        assert_eq!(cache.lookup(7), None);
        cache.upsert(7, 42).unwrap();
        cache.upsert(8, 42).unwrap();
        assert_eq!(cache.lookup(7), Some(42));
        assert_eq!(cache.lookup(8), Some(42));

        // overwrite in place
        cache.upsert(7, 99).unwrap();
        assert_eq!(cache.lookup(7), Some(99));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn persisted_table_survives_restart() {
        let dir = tempdir().unwrap();
        let mut cache = cache_in(dir.path(), 128);
        cache.upsert(10, 10).unwrap();
        cache.upsert(11, 10).unwrap();
        cache.upsert(40, 3).unwrap();

        let mut rebooted = cache_in(dir.path(), 128);
        rebooted.restore().unwrap();
        assert_eq!(rebooted.lookup(10), Some(10));
        assert_eq!(rebooted.lookup(11), Some(10));
        assert_eq!(rebooted.lookup(40), Some(3));
        assert_eq!(rebooted.entries(), cache.entries());
    }

    #[test]
    fn restore_without_mirror_is_empty() {
        let dir = tempdir().unwrap();
        let mut cache = cache_in(dir.path(), 128);
        cache.restore().unwrap();
        assert!(cache.is_empty());
    }

    #[test]
    fn restore_reports_corrupt_mirror_and_keeps_table() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("mapping.dat"), [0xff, 0xff, 0xff]).unwrap();

        let mut cache = cache_in(dir.path(), 128);
        cache.table.insert(1, 1).unwrap();
        let err = cache.restore().unwrap_err();
        assert!(matches!(err, Error::CorruptStorage { .. }));
        assert_eq!(cache.lookup(1), Some(1));
    }

    #[test]
    fn full_table_rejects_new_slots_but_accepts_overwrites() {
        let dir = tempdir().unwrap();
        let mut cache = cache_in(dir.path(), 2);
        cache.upsert(1, 1).unwrap();
        cache.upsert(2, 1).unwrap();

        let err = cache.upsert(3, 2).unwrap_err();
        assert!(matches!(err, Error::CapacityExhausted(Capacity::MappingTable)));
        assert_eq!(cache.lookup(3), None);

        cache.upsert(2, 5).unwrap();
        assert_eq!(cache.lookup(2), Some(5));
    }

    #[test]
    fn replace_all_swaps_the_table() {
        let dir = tempdir().unwrap();
        let mut cache = cache_in(dir.path(), 128);
        cache.upsert(1, 1).unwrap();

        cache
            .replace_all(&[MappingEntry::new(5, 2), MappingEntry::new(6, 2)])
            .unwrap();
        assert_eq!(cache.lookup(1), None);
        assert_eq!(cache.lookup(5), Some(2));

        let mut rebooted = cache_in(dir.path(), 128);
        rebooted.restore().unwrap();
        assert_eq!(rebooted.len(), 2);
    }

    #[test]
    fn oversized_replacement_leaves_table_untouched() {
        let dir = tempdir().unwrap();
        let mut cache = cache_in(dir.path(), 2);
        cache.upsert(1, 1).unwrap();

        let rows = [
            MappingEntry::new(5, 2),
            MappingEntry::new(6, 2),
            MappingEntry::new(7, 2),
        ];
        assert!(cache.replace_all(&rows).is_err());
        assert_eq!(cache.entries(), vec![MappingEntry::new(1, 1)]);
    }

    #[test]
    fn persist_fails_when_storage_is_missing() {
        let dir = tempdir().unwrap();
        let mut cache = MappingCache::new(dir.path().join("absent/mapping.dat"), 8);
        let err = cache.upsert(1, 1).unwrap_err();
        assert!(err.is_storage_fault());
        // in-memory state still reflects the write
        assert_eq!(cache.lookup(1), Some(1));
    }

    #[test]
    fn wire_names_match_server() {
        let json = serde_json::to_string(&MappingEntry::new(3, 9)).unwrap();
        assert_eq!(json, r#"{"sensorId":3,"primaryUserId":9}"#);
    }
}
