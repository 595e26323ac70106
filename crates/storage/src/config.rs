//! Engine configuration.
//!
//! These structs deserialize from the `[storage]` section of the service
//! configuration file; every field has a default so partial files work.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::archive::ArchiveLimits;
use crate::ownership::Ownership;
use crate::thumbnail::{SweepPolicy, ThumbnailContext};

/// Default storage root.
pub const DEFAULT_ROOT: &str = "/data";

/// Storage engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory all operations are confined to. Must exist.
    pub root: PathBuf,

    /// User id applied to created entries (unset or 0 = leave as is).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid: Option<u32>,

    /// Group id applied to created entries (unset or 0 = leave as is).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gid: Option<u32>,

    /// Thumbnail settings.
    pub thumbnail: ThumbnailConfig,

    /// Archive quotas.
    pub archive: ArchiveLimits,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(DEFAULT_ROOT),
            uid: None,
            gid: None,
            thumbnail: ThumbnailConfig::default(),
            archive: ArchiveLimits::default(),
        }
    }
}

impl StorageConfig {
    /// Config rooted at `root` with every other setting at its default.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    /// Ownership to apply to created files and directories.
    pub fn ownership(&self) -> Ownership {
        Ownership::new(self.uid, self.gid)
    }
}

/// Thumbnail rendering and cache settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ThumbnailConfig {
    /// Longer side, in pixels, of thumbnails shown to share visitors.
    pub share_max_dim: u32,

    /// Longer side, in pixels, of thumbnails shown to administrators.
    pub admin_max_dim: u32,

    /// Maximum simultaneous renders.
    pub concurrency: usize,

    /// Seconds between background cache sweeps (0 = never).
    pub sweep_interval_secs: u64,

    /// Remove cached thumbnails older than this many seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sweep_max_age_secs: Option<u64>,

    /// Keep the cache at or below this many bytes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sweep_max_total_bytes: Option<u64>,
}

impl Default for ThumbnailConfig {
    fn default() -> Self {
        Self {
            share_max_dim: 200,
            admin_max_dim: 320,
            concurrency: 4,
            sweep_interval_secs: 0,
            sweep_max_age_secs: None,
            sweep_max_total_bytes: None,
        }
    }
}

impl ThumbnailConfig {
    /// Configured dimension for `context`.
    pub fn max_dim(&self, context: ThumbnailContext) -> u32 {
        match context {
            ThumbnailContext::Share => self.share_max_dim,
            ThumbnailContext::Admin => self.admin_max_dim,
        }
    }

    /// Eviction policy built from the sweep settings.
    pub fn sweep_policy(&self) -> SweepPolicy {
        SweepPolicy {
            max_age: self.sweep_max_age_secs.map(Duration::from_secs),
            max_total_bytes: self.sweep_max_total_bytes,
        }
    }

    /// Background sweep interval, if enabled.
    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.sweep_interval_secs > 0).then(|| Duration::from_secs(self.sweep_interval_secs))
    }
}
