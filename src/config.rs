//! Device configuration
//!
//! The firmware reads `punchclock.json` from the storage partition at boot.
//! Missing fields fall back to the defaults below, so an empty object is a
//! valid configuration.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Hard ceiling on sensor slots; the mapping table is sized to this
pub const MAX_SLOTS: usize = 128;

/// Hard ceiling on templates enrolled per identity
pub const MAX_TEMPLATES: usize = 5;

/// Name of the config file inside `storage_dir`
pub const CONFIG_FILE: &str = "punchclock.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base URL of the remote authority, without trailing slash
    pub server_url: String,
    pub wifi_ssid: String,
    pub wifi_password: String,
    /// Mount point of the flash filesystem
    pub storage_dir: PathBuf,
    /// Number of template slots the sensor exposes
    pub slot_capacity: u16,
    pub templates_per_identity: u8,
    pub sync_interval_secs: u64,
    pub http_timeout_ms: u64,
    /// Drop a cached mapping when the server says the slot is unknown
    pub evict_on_remote_not_found: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: "http://192.168.1.10:8000".into(),
            wifi_ssid: String::new(),
            wifi_password: String::new(),
            storage_dir: PathBuf::from("/spiffs"),
            slot_capacity: MAX_SLOTS as u16,
            templates_per_identity: 3,
            sync_interval_secs: 60 * 60,
            http_timeout_ms: 5_000,
            evict_on_remote_not_found: false,
        }
    }
}

impl Config {
    /// Parse and validate a JSON config document
    pub fn from_json(text: &str) -> Result<Self> {
        let config: Config =
            serde_json::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read `path`, falling back to defaults when the file does not exist
    pub fn load_or_default(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::from_json(&text),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.slot_capacity == 0 || self.slot_capacity as usize > MAX_SLOTS {
            return Err(Error::Config(format!(
                "slot_capacity must be within 1..={MAX_SLOTS}, got {}",
                self.slot_capacity
            )));
        }
        if self.templates_per_identity == 0 || self.templates_per_identity as usize > MAX_TEMPLATES
        {
            return Err(Error::Config(format!(
                "templates_per_identity must be within 1..={MAX_TEMPLATES}, got {}",
                self.templates_per_identity
            )));
        }
        if self.sync_interval_secs == 0 {
            return Err(Error::Config("sync_interval_secs must be positive".into()));
        }
        if self.server_url.is_empty() {
            return Err(Error::Config("server_url is empty".into()));
        }
        Ok(())
    }

    pub fn mapping_path(&self) -> PathBuf {
        self.storage_dir.join("mapping.dat")
    }

    pub fn log_path(&self) -> PathBuf {
        self.storage_dir.join("attendance.log")
    }

    /// Scratch file used while compacting the attendance log
    pub fn log_temp_path(&self) -> PathBuf {
        self.storage_dir.join("attendance.tmp")
    }

    pub fn sync_interval_ms(&self) -> u64 {
        self.sync_interval_secs.saturating_mul(1000)
    }
}
