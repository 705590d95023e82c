//! # Sync Configuration
//!
//! Configuration management for the sync engine.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     CELLSYNC_DEVICE_ID=scanner-07                                      │
//! │     CELLSYNC_MERGE_POLICY=field_clock                                  │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/inventory/sync.toml (Linux)                              │
//! │     ~/Library/Application Support/com.cellsync.inventory/sync.toml     │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! │     auto-generated device id, web device, 3 retries, LWW merge         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! # sync.toml
//! [device]
//! id = "550e8400-e29b-41d4-a716-446655440000"
//! name = "Scanner 7"
//! device_type = "mobile"
//!
//! [sync]
//! max_retries = 3
//! merge_policy = "last_write_wins"   # last_write_wins | field_clock
//! flush_interval_secs = 5
//! retention_days = 7
//!
//! [storage]
//! database_path = "/var/lib/cellsync/cellsync.db"
//! queue_key = "change_queue"
//! ```

use cellsync_core::{DeviceType, MergePolicy, DEFAULT_MAX_RETRIES};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{SyncError, SyncResult};
use crate::retry::RetryPolicy;

// =============================================================================
// Device Configuration
// =============================================================================

/// Identity of this device. Stamped on every queued change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Unique device identifier.
    /// Auto-generated on first run if not provided.
    pub id: String,

    /// Human-readable device name (e.g., "Scanner 7", "Supervisor PC").
    #[serde(default = "default_device_name")]
    pub name: String,

    /// Kind of client this device is.
    #[serde(default)]
    pub device_type: DeviceType,
}

fn default_device_name() -> String {
    "Inspection Device".to_string()
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            id: Uuid::new_v4().to_string(),
            name: default_device_name(),
            device_type: DeviceType::default(),
        }
    }
}

// =============================================================================
// Sync Settings
// =============================================================================

/// Sync behavior settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Failed applications tolerated before a change is terminally failed.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// How concurrent edits of the same cell are resolved.
    #[serde(default)]
    pub merge_policy: MergePolicy,

    /// Interval between periodic flushes (seconds).
    #[serde(default = "default_flush_interval")]
    pub flush_interval_secs: u64,

    /// Interval between store revision polls (milliseconds).
    #[serde(default = "default_watch_interval")]
    pub watch_interval_ms: u64,

    /// Delay before the first retry of a rejected change (milliseconds).
    /// 0 retries on the very next flush.
    #[serde(default)]
    pub retry_initial_delay_ms: u64,

    /// Upper bound for the retry delay (seconds).
    #[serde(default = "default_retry_max_delay")]
    pub retry_max_delay_secs: u64,

    /// Growth factor of the retry delay.
    #[serde(default = "default_retry_multiplier")]
    pub retry_multiplier: f64,

    /// Synced changes older than this are pruned (days). 0 keeps them forever.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}
fn default_flush_interval() -> u64 {
    5
}
fn default_watch_interval() -> u64 {
    2000
}
fn default_retry_max_delay() -> u64 {
    60
}
fn default_retry_multiplier() -> f64 {
    2.0
}
fn default_retention_days() -> u32 {
    7
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            max_retries: default_max_retries(),
            merge_policy: MergePolicy::default(),
            flush_interval_secs: default_flush_interval(),
            watch_interval_ms: default_watch_interval(),
            retry_initial_delay_ms: 0,
            retry_max_delay_secs: default_retry_max_delay(),
            retry_multiplier: default_retry_multiplier(),
            retention_days: default_retention_days(),
        }
    }
}

// =============================================================================
// Storage Settings
// =============================================================================

/// Where the queue snapshot and the inspection store live.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    /// SQLite database file. Defaults to the platform data directory.
    #[serde(default)]
    pub database_path: Option<PathBuf>,

    /// Slot key the change queue is persisted under.
    #[serde(default = "default_queue_key")]
    pub queue_key: String,
}

fn default_queue_key() -> String {
    "change_queue".to_string()
}

impl Default for StorageSettings {
    fn default() -> Self {
        StorageSettings {
            database_path: None,
            queue_key: default_queue_key(),
        }
    }
}

// =============================================================================
// Main Sync Configuration
// =============================================================================

/// Complete sync configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Device identity.
    #[serde(default)]
    pub device: DeviceConfig,

    /// Sync behavior settings.
    #[serde(default)]
    pub sync: SyncSettings,

    /// Persistence settings.
    #[serde(default)]
    pub storage: StorageSettings,
}

impl SyncConfig {
    /// Creates a new config with defaults and a generated device ID.
    pub fn new() -> Self {
        Self::default()
    }

    /// Config for a known device id, everything else default.
    pub fn for_device(id: impl Into<String>, device_type: DeviceType) -> Self {
        let mut config = Self::default();
        config.device.id = id.into();
        config.device.device_type = device_type;
        config
    }

    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (sync.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading sync config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Like [`load`](Self::load), but a missing config file is created from
    /// the defaults first, so a generated device id survives restarts.
    ///
    /// The file gets the defaults only; environment overrides are applied
    /// afterwards and never written.
    pub fn load_or_init(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| SyncError::ConfigLoadFailed("No config path available".into()))?;

        if !path.exists() {
            let fresh = Self::default();
            fresh.save(Some(path.clone()))?;
            info!(?path, device_id = %fresh.device.id, "Created sync config with new device id");
        }

        Self::load(Some(path))
    }

    /// Loads config or returns default if load fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load sync config: {}. Using defaults.", e);
            Self::default()
        })
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> SyncResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| SyncError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| SyncError::ConfigSaveFailed(e.to_string()))?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents).map_err(|e| SyncError::ConfigSaveFailed(e.to_string()))?;

        info!(?path, "Sync config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        if self.device.id.trim().is_empty() {
            return Err(SyncError::MissingDeviceId);
        }

        if self.sync.flush_interval_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "flush_interval_secs must be greater than 0".into(),
            ));
        }

        if self.sync.watch_interval_ms == 0 {
            return Err(SyncError::InvalidConfig(
                "watch_interval_ms must be greater than 0".into(),
            ));
        }

        // Written so that NaN is rejected too.
        if !(self.sync.retry_multiplier >= 1.0) || self.sync.retry_multiplier.is_infinite() {
            return Err(SyncError::InvalidConfig(format!(
                "retry_multiplier must be at least 1.0, got {}",
                self.sync.retry_multiplier
            )));
        }

        if self.storage.queue_key.trim().is_empty() {
            return Err(SyncError::InvalidConfig("queue_key must not be empty".into()));
        }

        Ok(())
    }

    /// Applies environment variable overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Applies overrides from `lookup`, keyed by environment variable name.
    ///
    /// Unparsable values are logged and ignored.
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(id) = lookup("CELLSYNC_DEVICE_ID") {
            debug!(device_id = %id, "Overriding device ID from environment");
            self.device.id = id;
        }

        if let Some(name) = lookup("CELLSYNC_DEVICE_NAME") {
            self.device.name = name;
        }

        if let Some(device_type) = lookup("CELLSYNC_DEVICE_TYPE") {
            match device_type.parse() {
                Ok(parsed) => self.device.device_type = parsed,
                Err(_) => warn!(device_type = %device_type, "Unknown device type in environment"),
            }
        }

        if let Some(retries) = lookup("CELLSYNC_MAX_RETRIES") {
            match retries.parse::<u32>() {
                Ok(n) => {
                    debug!(max_retries = n, "Overriding max retries from environment");
                    self.sync.max_retries = n;
                }
                Err(_) => warn!(value = %retries, "Invalid CELLSYNC_MAX_RETRIES"),
            }
        }

        if let Some(policy) = lookup("CELLSYNC_MERGE_POLICY") {
            match policy.parse() {
                Ok(parsed) => {
                    debug!(policy = %policy, "Overriding merge policy from environment");
                    self.sync.merge_policy = parsed;
                }
                Err(_) => warn!(policy = %policy, "Unknown merge policy in environment"),
            }
        }

        if let Some(path) = lookup("CELLSYNC_DB_PATH") {
            debug!(path = %path, "Overriding database path from environment");
            self.storage.database_path = Some(PathBuf::from(path));
        }
    }

    /// Returns the default config file path.
    fn default_config_path() -> Option<PathBuf> {
        Self::project_dirs().map(|dirs| dirs.config_dir().join("sync.toml"))
    }

    fn project_dirs() -> Option<directories::ProjectDirs> {
        directories::ProjectDirs::from("com", "cellsync", "inventory")
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    /// Returns the device ID.
    pub fn device_id(&self) -> &str {
        &self.device.id
    }

    /// Returns the device type.
    pub fn device_type(&self) -> DeviceType {
        self.device.device_type
    }

    /// Returns the merge policy.
    pub fn merge_policy(&self) -> MergePolicy {
        self.sync.merge_policy
    }

    /// Database file: the configured one, else `cellsync.db` in the
    /// platform data directory.
    pub fn database_path(&self) -> Option<PathBuf> {
        self.storage.database_path.clone().or_else(|| {
            Self::project_dirs().map(|dirs| dirs.data_dir().join("cellsync.db"))
        })
    }

    /// Retry schedule for rejected changes.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.sync.max_retries,
            initial_delay: Duration::from_millis(self.sync.retry_initial_delay_ms),
            max_delay: Duration::from_secs(self.sync.retry_max_delay_secs),
            multiplier: self.sync.retry_multiplier,
        }
    }

    /// Age after which synced changes are pruned, `None` to keep them.
    pub fn retention(&self) -> Option<chrono::Duration> {
        match self.sync.retention_days {
            0 => None,
            days => Some(chrono::Duration::days(i64::from(days))),
        }
    }

    /// Periodic flush interval.
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.sync.flush_interval_secs)
    }

    /// Store revision polling interval.
    pub fn watch_interval(&self) -> Duration {
        Duration::from_millis(self.sync.watch_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = SyncConfig::default();
        assert!(!config.device.id.is_empty()); // Auto-generated
        assert_eq!(config.device.device_type, DeviceType::Web);
        assert_eq!(config.sync.max_retries, 3);
        assert_eq!(config.merge_policy(), MergePolicy::LastWriteWins);
        assert_eq!(config.retry_policy().initial_delay, Duration::ZERO);
        assert_eq!(config.storage.queue_key, "change_queue");
    }

    #[test]
    fn test_config_validation() {
        let mut config = SyncConfig::default();
        assert!(config.validate().is_ok());

        config.device.id = "  ".to_string();
        assert!(matches!(config.validate(), Err(SyncError::MissingDeviceId)));

        config.device.id = "scanner".to_string();
        config.sync.flush_interval_secs = 0;
        assert!(config.validate().unwrap_err().is_config_error());

        config.sync.flush_interval_secs = 5;
        config.sync.retry_multiplier = 0.5;
        assert!(config.validate().is_err());

        config.sync.retry_multiplier = f64::NAN;
        assert!(config.validate().unwrap_err().is_config_error());

        config.sync.retry_multiplier = f64::INFINITY;
        assert!(config.validate().is_err());

        config.sync.retry_multiplier = 1.0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_generated_device_id_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cellsync").join("sync.toml");

        let first = SyncConfig::load_or_init(Some(path.clone())).unwrap();
        assert!(path.exists());

        let second = SyncConfig::load_or_init(Some(path.clone())).unwrap();
        assert_eq!(second.device_id(), first.device_id());
        assert_eq!(SyncConfig::load(Some(path)).unwrap().device_id(), first.device_id());
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            ("CELLSYNC_DEVICE_ID", "scanner-07"),
            ("CELLSYNC_DEVICE_TYPE", "mobile"),
            ("CELLSYNC_MAX_RETRIES", "5"),
            ("CELLSYNC_MERGE_POLICY", "field-clock"),
            ("CELLSYNC_DB_PATH", "/tmp/cells.db"),
        ]
        .into_iter()
        .collect();

        let mut config = SyncConfig::default();
        config.apply_overrides(|name| vars.get(name).map(|v| v.to_string()));

        assert_eq!(config.device_id(), "scanner-07");
        assert_eq!(config.device_type(), DeviceType::Mobile);
        assert_eq!(config.sync.max_retries, 5);
        assert_eq!(config.merge_policy(), MergePolicy::FieldClock);
        assert_eq!(config.database_path(), Some(PathBuf::from("/tmp/cells.db")));
    }

    #[test]
    fn test_invalid_overrides_are_ignored() {
        let mut config = SyncConfig::default();
        config.apply_overrides(|name| match name {
            "CELLSYNC_MAX_RETRIES" => Some("many".to_string()),
            "CELLSYNC_MERGE_POLICY" => Some("coin-flip".to_string()),
            _ => None,
        });

        assert_eq!(config.sync.max_retries, 3);
        assert_eq!(config.merge_policy(), MergePolicy::LastWriteWins);
    }

    #[test]
    fn test_toml_round_trip() {
        let mut config = SyncConfig::for_device("desk-1", DeviceType::Desktop);
        config.sync.merge_policy = MergePolicy::FieldClock;

        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("[device]"));
        assert!(toml_str.contains("[sync]"));
        assert!(toml_str.contains("[storage]"));

        let parsed: SyncConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.device_id(), "desk-1");
        assert_eq!(parsed.device_type(), DeviceType::Desktop);
        assert_eq!(parsed.merge_policy(), MergePolicy::FieldClock);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let parsed: SyncConfig = toml::from_str(
            r#"
            [device]
            id = "scanner-02"

            [sync]
            retention_days = 0
            "#,
        )
        .unwrap();

        assert_eq!(parsed.device.name, "Inspection Device");
        assert_eq!(parsed.sync.max_retries, 3);
        assert_eq!(parsed.retention(), None);
        assert_eq!(parsed.flush_interval(), Duration::from_secs(5));
    }
}
