//! Configuration for the Prism mirror engine.
//!
//! Configuration is loaded from a TOML file, then overridden from the
//! environment with `PRISM_`-prefixed variables. All sections have working
//! defaults so an empty file (or none at all) yields a usable configuration
//! once the two roots are set.
//!
//! # Example
//!
//! ```toml
//! master_root = "/srv/prism/master"
//! users_root = "/srv/prism/users"
//!
//! [tracker]
//! max_entries = 10000
//! ttl_secs = 1200
//!
//! [replication]
//! fail_on_collisions = false
//! ```

use crate::error::{PrismError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

// Environment variable names
pub const ENV_MASTER_ROOT: &str = "PRISM_MASTER_ROOT";
pub const ENV_USERS_ROOT: &str = "PRISM_USERS_ROOT";
pub const ENV_TRACKER_MAX_ENTRIES: &str = "PRISM_TRACKER_MAX_ENTRIES";
pub const ENV_TRACKER_TTL_SECS: &str = "PRISM_TRACKER_TTL_SECS";
pub const ENV_FAIL_ON_COLLISIONS: &str = "PRISM_FAIL_ON_COLLISIONS";

/// Top-level configuration for the mirror engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MirrorConfig {
    /// Root of the master repository tree
    pub master_root: PathBuf,

    /// Root of the per-user mirrors tree
    pub users_root: PathBuf,

    /// Self-event suppression cache settings
    pub tracker: TrackerConfig,

    /// Tree replication settings
    pub replication: ReplicationConfig,

    /// Directory watcher settings
    pub watcher: WatcherConfig,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            master_root: PathBuf::from("/var/lib/prism/master"),
            users_root: PathBuf::from("/var/lib/prism/users"),
            tracker: TrackerConfig::default(),
            replication: ReplicationConfig::default(),
            watcher: WatcherConfig::default(),
        }
    }
}

/// Settings for the self-event suppression cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Maximum tracked paths before oldest entries are evicted
    pub max_entries: usize,

    /// Seconds after which a tracked path expires
    pub ttl_secs: u64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            ttl_secs: 20 * 60,
        }
    }
}

impl TrackerConfig {
    /// The TTL as a [`Duration`].
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Settings for hard-link tree replication.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Fail on destination collisions instead of tolerating them
    pub fail_on_collisions: bool,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            fail_on_collisions: false,
        }
    }
}

/// Settings for the directory watcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    /// Capacity of the event channel between the OS callback and the
    /// dispatch loop; a full channel blocks the notification thread, so
    /// the OS facility remains the only real buffer
    pub channel_capacity: usize,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
        }
    }
}

impl MirrorConfig {
    /// Parse a configuration from a TOML string.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| PrismError::config(format!("invalid TOML: {e}")))
    }

    /// Load a configuration file, apply environment overrides, and validate.
    pub async fn load(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| PrismError::config(format!("cannot read {}: {e}", path.display())))?;
        let mut config = Self::from_toml_str(&raw)?;
        config.apply_env_overrides()?;
        config.validate()?;
        debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Override fields from `PRISM_*` environment variables.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(root) = std::env::var(ENV_MASTER_ROOT) {
            self.master_root = PathBuf::from(root);
        }
        if let Ok(root) = std::env::var(ENV_USERS_ROOT) {
            self.users_root = PathBuf::from(root);
        }
        if let Ok(raw) = std::env::var(ENV_TRACKER_MAX_ENTRIES) {
            self.tracker.max_entries = raw.parse().map_err(|_| {
                PrismError::config(format!("{ENV_TRACKER_MAX_ENTRIES} must be an integer: {raw:?}"))
            })?;
        }
        if let Ok(raw) = std::env::var(ENV_TRACKER_TTL_SECS) {
            self.tracker.ttl_secs = raw.parse().map_err(|_| {
                PrismError::config(format!("{ENV_TRACKER_TTL_SECS} must be an integer: {raw:?}"))
            })?;
        }
        if let Ok(raw) = std::env::var(ENV_FAIL_ON_COLLISIONS) {
            self.replication.fail_on_collisions = raw.parse().map_err(|_| {
                PrismError::config(format!("{ENV_FAIL_ON_COLLISIONS} must be true or false: {raw:?}"))
            })?;
        }
        Ok(())
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if !self.master_root.is_absolute() {
            return Err(PrismError::config(format!(
                "master_root must be absolute: {}",
                self.master_root.display()
            )));
        }
        if !self.users_root.is_absolute() {
            return Err(PrismError::config(format!(
                "users_root must be absolute: {}",
                self.users_root.display()
            )));
        }
        if self.master_root == self.users_root {
            return Err(PrismError::config(
                "master_root and users_root must be distinct directories",
            ));
        }
        if self.tracker.max_entries == 0 {
            return Err(PrismError::config("tracker.max_entries must be non-zero"));
        }
        if self.tracker.ttl_secs == 0 {
            return Err(PrismError::config("tracker.ttl_secs must be non-zero"));
        }
        if self.watcher.channel_capacity == 0 {
            return Err(PrismError::config("watcher.channel_capacity must be non-zero"));
        }
        Ok(())
    }
}
