//! Content-addressed thumbnail cache.
//!
//! A thumbnail is identified by the source's relative path, its modification
//! time and the requested size. Editing a source changes its mtime and hence
//! its key, so entries are never invalidated explicitly; stale blobs simply
//! stop being referenced (see [`sweep`] for reclaiming them).
//!
//! Blobs live under [`CACHE_DIR_NAME`] in the storage root as
//! `<sha256-hex>.jpg`.

mod render;
pub mod sweep;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::context::RequestContext;
use crate::error::{Result, StorageError};
use crate::files::write_atomic;
use crate::gate::ConcurrencyGate;
use crate::path::{PathResolver, ResolvedPath};

pub use crate::files::CACHE_DIR_NAME;
pub use render::{render_jpeg, target_dimensions, JPEG_QUALITY};
pub use sweep::{spawn_sweeper, SweepPolicy, SweepReport};

/// Extensions accepted as thumbnail sources (lowercase, no dot).
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp"];

/// Who a thumbnail is rendered for; selects the configured dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThumbnailContext {
    /// Anonymous share-link visitors.
    Share,
    /// Authenticated administrators.
    Admin,
}

/// Snapshot of cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ThumbnailStats {
    /// Requests served from an existing blob.
    pub hits: u64,
    /// Requests that had to render.
    pub misses: u64,
    /// Successful renders.
    pub renders: u64,
    /// Renders that failed to decode or encode.
    pub failures: u64,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    renders: AtomicU64,
    failures: AtomicU64,
}

/// Whether `extension` (lowercase, with its leading dot) is a supported image type.
pub fn is_image_extension(extension: &str) -> bool {
    extension
        .strip_prefix('.')
        .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext))
}

/// Cache key for a source at `rel` with modification time `mtime_nanos`.
pub fn cache_key(rel: &str, mtime_nanos: u128, max_dim: u32) -> String {
    let mut hasher = Sha256::new();
    hasher.update(rel.as_bytes());
    hasher.update([0u8]);
    hasher.update(mtime_nanos.to_be_bytes());
    hasher.update(max_dim.to_be_bytes());
    hex::encode(hasher.finalize())
}

/// Thumbnail generator backed by an on-disk cache.
#[derive(Debug)]
pub struct ThumbnailCache {
    resolver: PathResolver,
    cache_dir: PathBuf,
    gate: Arc<ConcurrencyGate>,
    counters: Counters,
}

impl ThumbnailCache {
    /// Create a cache storing blobs under the resolver root's cache directory.
    ///
    /// Renders are limited by `gate`. The directory is created lazily.
    pub fn new(resolver: PathResolver, gate: Arc<ConcurrencyGate>) -> Self {
        let cache_dir = resolver.root().path().join(CACHE_DIR_NAME);
        Self {
            resolver,
            cache_dir,
            gate,
            counters: Counters::default(),
        }
    }

    /// Directory holding cached blobs.
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// The gate bounding concurrent renders.
    pub fn gate(&self) -> &ConcurrencyGate {
        &self.gate
    }

    /// Current counter values.
    pub fn stats(&self) -> ThumbnailStats {
        ThumbnailStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            renders: self.counters.renders.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
        }
    }

    /// Return a JPEG of `rel` whose longer side is `max_dim` pixels.
    ///
    /// Served from cache when possible. Otherwise waits for a render permit,
    /// renders, stores the blob and returns the bytes. A failed cache write
    /// is logged and does not fail the call.
    pub fn thumbnail(&self, rel: &str, max_dim: u32, ctx: &RequestContext) -> Result<Vec<u8>> {
        if max_dim == 0 {
            return Err(StorageError::InvalidDimension(max_dim));
        }

        let resolved = self.resolver.resolve(rel)?;
        if !is_image_extension(&resolved.extension()) {
            return Err(StorageError::NotAnImage(resolved.relative().to_string()));
        }

        let metadata = fs::metadata(resolved.as_path())
            .map_err(|e| StorageError::from_io(resolved.relative(), e))?;
        if metadata.is_dir() {
            return Err(StorageError::NotAnImage(resolved.relative().to_string()));
        }

        let mtime = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        let blob = self.blob_path(&cache_key(resolved.relative(), mtime, max_dim));

        if let Some(bytes) = self.lookup(&blob) {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(bytes);
        }

        ctx.check()?;
        let _permit = self.gate.acquire(ctx)?;

        // Another request may have rendered this key while we waited.
        if let Some(bytes) = self.lookup(&blob) {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(bytes);
        }
        self.counters.misses.fetch_add(1, Ordering::Relaxed);

        let bytes = self.render(&resolved, max_dim, ctx)?;

        ctx.check()?;
        self.store(&blob, &bytes);
        Ok(bytes)
    }

    /// Location of the blob for `key`.
    fn blob_path(&self, key: &str) -> PathBuf {
        self.cache_dir.join(format!("{key}.jpg"))
    }

    fn lookup(&self, blob: &Path) -> Option<Vec<u8>> {
        match fs::read(blob) {
            Ok(bytes) if !bytes.is_empty() => Some(bytes),
            Ok(_) => None,
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => {
                warn!(error = %e, "Failed to read cached thumbnail");
                None
            }
        }
    }

    fn render(&self, source: &ResolvedPath, max_dim: u32, ctx: &RequestContext) -> Result<Vec<u8>> {
        let data = fs::read(source.as_path())
            .map_err(|e| StorageError::from_io(source.relative(), e))?;
        ctx.check()?;

        match render_jpeg(&data, max_dim, ctx) {
            Ok(bytes) => {
                self.counters.renders.fetch_add(1, Ordering::Relaxed);
                debug!(path = %source.relative(), max_dim, bytes = bytes.len(), "Rendered thumbnail");
                Ok(bytes)
            }
            Err(e @ (StorageError::Cancelled | StorageError::DeadlineExceeded)) => Err(e),
            Err(e) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                debug!(path = %source.relative(), error = %e, "Thumbnail render failed");
                Err(e)
            }
        }
    }

    fn store(&self, blob: &Path, bytes: &[u8]) {
        let result = fs::create_dir_all(&self.cache_dir)
            .map_err(StorageError::from)
            .and_then(|()| write_atomic(blob, bytes));
        if let Err(e) = result {
            warn!(error = %e, "Failed to write thumbnail cache entry");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::StorageRoot;
    use image::{ImageFormat, RgbImage};
    use std::io::Cursor;
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    fn cache() -> (ThumbnailCache, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let root = StorageRoot::open(temp_dir.path()).unwrap();
        let cache = ThumbnailCache::new(PathResolver::new(root), Arc::new(ConcurrencyGate::new(2)));
        (cache, temp_dir)
    }

    fn write_png(dir: &Path, rel: &str, width: u32, height: u32) {
        let img = RgbImage::from_pixel(width, height, image::Rgb([200, 100, 50]));
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, ImageFormat::Png).unwrap();
        let path = dir.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, out.into_inner()).unwrap();
    }

    fn blob_count(cache: &ThumbnailCache) -> usize {
        fs::read_dir(cache.cache_dir())
            .map(|entries| entries.count())
            .unwrap_or(0)
    }

    #[test]
    fn test_cache_key_inputs() {
        let key = cache_key("photos/a.jpg", 1, 200);
        assert_eq!(key.len(), 64);
        assert_eq!(key, cache_key("photos/a.jpg", 1, 200));
        assert_ne!(key, cache_key("photos/a.jpg", 2, 200));
        assert_ne!(key, cache_key("photos/a.jpg", 1, 320));
        assert_ne!(key, cache_key("photos/b.jpg", 1, 200));
    }

    #[test]
    fn test_is_image_extension() {
        for ext in ["jpg", "jpeg", "png", "gif", "webp"] {
            assert!(is_image_extension(&format!(".{ext}")));
        }
        assert!(!is_image_extension(".txt"));
        assert!(!is_image_extension("jpg"));
        assert!(!is_image_extension(""));
    }

    #[test]
    fn test_second_request_hits_cache() {
        let (cache, temp_dir) = cache();
        write_png(temp_dir.path(), "photos/a.png", 400, 200);
        let ctx = RequestContext::unbounded();

        let first = cache.thumbnail("photos/a.png", 200, &ctx).unwrap();
        let second = cache.thumbnail("/photos/a.png", 200, &ctx).unwrap();

        assert_eq!(first, second);
        let stats = cache.stats();
        assert_eq!(stats.renders, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(blob_count(&cache), 1);

        let decoded = image::load_from_memory(&first).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (200, 100));
    }

    #[test]
    fn test_sizes_are_cached_separately() {
        let (cache, temp_dir) = cache();
        write_png(temp_dir.path(), "a.png", 100, 100);
        let ctx = RequestContext::unbounded();

        cache.thumbnail("a.png", 200, &ctx).unwrap();
        cache.thumbnail("a.png", 320, &ctx).unwrap();
        assert_eq!(cache.stats().renders, 2);
        assert_eq!(blob_count(&cache), 2);
    }

    #[test]
    fn test_mtime_change_renders_again() {
        let (cache, temp_dir) = cache();
        write_png(temp_dir.path(), "a.png", 64, 64);
        let ctx = RequestContext::unbounded();

        cache.thumbnail("a.png", 32, &ctx).unwrap();
        let file = fs::File::options()
            .write(true)
            .open(temp_dir.path().join("a.png"))
            .unwrap();
        file.set_modified(SystemTime::now() + Duration::from_secs(60))
            .unwrap();

        cache.thumbnail("a.png", 32, &ctx).unwrap();
        assert_eq!(cache.stats().renders, 2);
    }

    #[test]
    fn test_rejections_before_decode() {
        let (cache, temp_dir) = cache();
        fs::write(temp_dir.path().join("notes.txt"), "hello").unwrap();
        fs::create_dir(temp_dir.path().join("dir.jpg")).unwrap();
        let ctx = RequestContext::unbounded();

        assert!(matches!(
            cache.thumbnail("notes.txt", 200, &ctx),
            Err(StorageError::NotAnImage(_))
        ));
        assert!(matches!(
            cache.thumbnail("dir.jpg", 200, &ctx),
            Err(StorageError::NotAnImage(_))
        ));
        assert!(matches!(
            cache.thumbnail("missing.jpg", 200, &ctx),
            Err(StorageError::NotFound(_))
        ));
        assert!(matches!(
            cache.thumbnail("a.jpg", 0, &ctx),
            Err(StorageError::InvalidDimension(0))
        ));
        assert!(matches!(
            cache.thumbnail("../a.jpg", 200, &ctx),
            Err(StorageError::PathTraversal(_))
        ));
        assert!(matches!(
            cache.thumbnail(".thumbcache/k.jpg", 200, &ctx),
            Err(StorageError::OutsideRoot)
        ));
        assert_eq!(cache.stats(), ThumbnailStats::default());
    }

    #[test]
    fn test_decode_failure_writes_nothing() {
        let (cache, temp_dir) = cache();
        fs::write(temp_dir.path().join("broken.jpg"), "not really a jpeg").unwrap();

        let result = cache.thumbnail("broken.jpg", 200, &RequestContext::unbounded());
        assert!(matches!(result, Err(StorageError::Decode(_))));
        assert_eq!(cache.stats().failures, 1);
        assert_eq!(blob_count(&cache), 0);
    }

    #[test]
    fn test_expired_deadline_writes_nothing() {
        let (cache, temp_dir) = cache();
        write_png(temp_dir.path(), "a.png", 64, 64);

        let ctx = RequestContext::unbounded().deadline(std::time::Instant::now());
        let result = cache.thumbnail("a.png", 32, &ctx);
        assert!(matches!(result, Err(StorageError::DeadlineExceeded)));
        assert_eq!(blob_count(&cache), 0);
        assert_eq!(cache.stats().renders, 0);
    }

    #[test]
    fn test_cancelled_request_writes_nothing() {
        let (cache, temp_dir) = cache();
        write_png(temp_dir.path(), "a.png", 64, 64);

        let token = CancellationToken::new();
        token.cancel();
        let ctx = RequestContext::unbounded().cancellation(token);
        let result = cache.thumbnail("a.png", 32, &ctx);
        assert!(matches!(result, Err(StorageError::Cancelled)));
        assert_eq!(blob_count(&cache), 0);
    }

    #[test]
    fn test_waits_for_gate_then_times_out() {
        let (cache, temp_dir) = cache();
        write_png(temp_dir.path(), "a.png", 64, 64);
        let _a = cache.gate().try_acquire().unwrap();
        let _b = cache.gate().try_acquire().unwrap();

        let ctx = RequestContext::with_timeout(Duration::from_millis(30));
        let result = cache.thumbnail("a.png", 32, &ctx);
        assert!(matches!(result, Err(StorageError::DeadlineExceeded)));
    }

    #[test]
    fn test_cached_hit_needs_no_permit() {
        let (cache, temp_dir) = cache();
        write_png(temp_dir.path(), "a.png", 64, 64);
        cache
            .thumbnail("a.png", 32, &RequestContext::unbounded())
            .unwrap();

        let _a = cache.gate().try_acquire().unwrap();
        let _b = cache.gate().try_acquire().unwrap();
        let ctx = RequestContext::with_timeout(Duration::from_millis(30));
        assert!(cache.thumbnail("a.png", 32, &ctx).is_ok());
    }

    #[test]
    fn test_concurrent_requests_render_once() {
        let (cache, temp_dir) = cache();
        write_png(temp_dir.path(), "a.png", 256, 256);
        let cache = Arc::new(ThumbnailCache::new(
            cache.resolver.clone(),
            Arc::new(ConcurrencyGate::new(1)),
        ));

        let handles: Vec<_> = (0..6)
            .map(|_| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    cache
                        .thumbnail("a.png", 64, &RequestContext::unbounded())
                        .unwrap()
                })
            })
            .collect();

        let outputs: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(outputs.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(cache.stats().renders, 1);
    }
}
