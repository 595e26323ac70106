//! Optional eviction for the thumbnail cache.
//!
//! The cache never invalidates entries itself. A sweep removes blobs older
//! than a maximum age and then trims the remainder to a byte cap, oldest
//! first. Abandoned temporary files from interrupted writes are removed on
//! every sweep regardless of policy.

use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::ThumbnailCache;
use crate::error::Result;

/// Age after which an in-flight temporary blob is considered abandoned.
pub const STALE_TEMP_AGE: Duration = Duration::from_secs(10 * 60);

/// Shortest interval accepted by [`spawn_sweeper`].
const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Which cached blobs to remove.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepPolicy {
    /// Remove blobs last written longer ago than this.
    pub max_age: Option<Duration>,
    /// Keep the cache at or below this many bytes.
    pub max_total_bytes: Option<u64>,
}

impl SweepPolicy {
    /// Whether the policy would ever remove a finished blob.
    pub fn is_enabled(&self) -> bool {
        self.max_age.is_some() || self.max_total_bytes.is_some()
    }
}

/// Outcome of a single sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Blobs examined.
    pub scanned: usize,
    /// Blobs removed.
    pub removed: usize,
    /// Bytes reclaimed from removed blobs.
    pub freed_bytes: u64,
    /// Bytes still held by the cache.
    pub retained_bytes: u64,
    /// Abandoned temporary files removed.
    pub stale_temps: usize,
}

struct Blob {
    path: PathBuf,
    size: u64,
    modified: SystemTime,
}

impl ThumbnailCache {
    /// Apply `policy` to the cache directory now.
    pub fn sweep(&self, policy: &SweepPolicy) -> Result<SweepReport> {
        self.sweep_at(policy, SystemTime::now())
    }

    pub(crate) fn sweep_at(&self, policy: &SweepPolicy, now: SystemTime) -> Result<SweepReport> {
        let mut report = SweepReport::default();

        let entries = match fs::read_dir(self.cache_dir()) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(report),
            Err(e) => return Err(e.into()),
        };

        let mut kept = Vec::new();
        for entry in entries.flatten() {
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            if !metadata.is_file() {
                continue;
            }

            let name = entry.file_name().to_string_lossy().to_string();
            let modified = metadata.modified().unwrap_or(now);
            let age = now.duration_since(modified).unwrap_or_default();

            if name.starts_with('.') {
                if age > STALE_TEMP_AGE && remove_blob(&entry.path()) {
                    report.stale_temps += 1;
                }
                continue;
            }
            if !name.ends_with(".jpg") {
                continue;
            }

            report.scanned += 1;
            let blob = Blob {
                path: entry.path(),
                size: metadata.len(),
                modified,
            };

            if policy.max_age.is_some_and(|max| age > max) && remove_blob(&blob.path) {
                report.removed += 1;
                report.freed_bytes += blob.size;
                continue;
            }
            kept.push(blob);
        }

        let mut total: u64 = kept.iter().map(|b| b.size).sum();
        if let Some(cap) = policy.max_total_bytes {
            kept.sort_by_key(|b| b.modified);
            for blob in &kept {
                if total <= cap {
                    break;
                }
                if remove_blob(&blob.path) {
                    total -= blob.size;
                    report.removed += 1;
                    report.freed_bytes += blob.size;
                }
            }
        }
        report.retained_bytes = total;

        Ok(report)
    }
}

/// Remove a cache file; true when it is gone afterwards.
fn remove_blob(path: &std::path::Path) -> bool {
    match fs::remove_file(path) {
        Ok(()) => true,
        Err(e) if e.kind() == io::ErrorKind::NotFound => true,
        Err(e) => {
            warn!(path = ?path.file_name(), error = %e, "Failed to remove cached thumbnail");
            false
        }
    }
}

/// Run `cache.sweep(policy)` every `interval` until `shutdown` fires.
///
/// The first sweep runs immediately. Sweeps execute on the blocking pool.
pub fn spawn_sweeper(
    cache: Arc<ThumbnailCache>,
    policy: SweepPolicy,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval.max(MIN_SWEEP_INTERVAL));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("Thumbnail sweeper received shutdown signal");
                    break;
                }
                _ = ticker.tick() => {
                    let cache = Arc::clone(&cache);
                    match tokio::task::spawn_blocking(move || cache.sweep(&policy)).await {
                        Ok(Ok(report)) if report.removed > 0 || report.stale_temps > 0 => {
                            info!(
                                removed = report.removed,
                                freed_bytes = report.freed_bytes,
                                retained_bytes = report.retained_bytes,
                                stale_temps = report.stale_temps,
                                "Swept thumbnail cache"
                            );
                        }
                        Ok(Ok(report)) => {
                            debug!(scanned = report.scanned, "Thumbnail cache sweep found nothing to remove");
                        }
                        Ok(Err(e)) => warn!(error = %e, "Thumbnail cache sweep failed"),
                        Err(e) => warn!(error = %e, "Thumbnail cache sweep task failed"),
                    }
                }
            }
        }
    })
}
