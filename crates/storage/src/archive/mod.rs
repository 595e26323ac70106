//! Streaming ZIP export of caller-selected files.
//!
//! [`build_archive`] enforces two quotas. The file count is checked before
//! anything is written. The byte quota is checked per entry against the
//! file's size on disk at the moment it is reached, so a file that grows or
//! shrinks between that check and the copy can push the archive past or
//! short of the limit.
//!
//! Bytes reach the sink as soon as each entry is compressed. Once the first
//! byte has gone out, an HTTP layer has already committed a success status
//! and cannot turn a later failure into an error response. On any failure
//! the builder stops writing and never emits a central directory, so a
//! client receives a detectably truncated archive rather than a
//! valid-looking partial one.

pub mod format;

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::Write;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::context::RequestContext;
use crate::error::{Result, StorageError};
use crate::path::{PathResolver, ResolvedPath};

pub use format::{EntryHeader, ZipStream, COPY_CHUNK_SIZE, DEFAULT_FILE_MODE};

/// Default maximum number of requested paths.
pub const DEFAULT_MAX_FILES: usize = 500;

/// Default maximum cumulative declared size (2 GiB).
pub const DEFAULT_MAX_BYTES: u64 = 2 * 1024 * 1024 * 1024;

/// Count and size quotas for one archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveLimits {
    /// Maximum number of requested paths.
    pub max_files: usize,
    /// Maximum cumulative size of archived files, in bytes.
    pub max_bytes: u64,
}

impl Default for ArchiveLimits {
    fn default() -> Self {
        Self {
            max_files: DEFAULT_MAX_FILES,
            max_bytes: DEFAULT_MAX_BYTES,
        }
    }
}

/// What a completed archive contains.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ArchiveSummary {
    /// File entries written.
    pub files: usize,
    /// Requested directories that were skipped.
    pub skipped_dirs: usize,
    /// Sum of the archived files' sizes on disk.
    pub declared_bytes: u64,
    /// Total bytes emitted to the sink.
    pub bytes_written: u64,
}

/// Stream a ZIP of `paths` to `sink`.
///
/// Paths are resolved through `resolver`; pass a scoped resolver to confine
/// an archive to a sub-directory. Entry names are the normalised relative
/// paths. Directories are skipped, not recursed into, and a path requested
/// twice is archived once.
pub fn build_archive<S, W>(
    resolver: &PathResolver,
    paths: &[S],
    limits: &ArchiveLimits,
    sink: W,
    ctx: &RequestContext,
) -> Result<ArchiveSummary>
where
    S: AsRef<str>,
    W: Write,
{
    if paths.len() > limits.max_files {
        return Err(StorageError::TooManyFiles {
            count: paths.len(),
            limit: limits.max_files,
        });
    }

    let entries = resolve_all(resolver, paths)?;
    ctx.check()?;

    let mut zip = ZipStream::new(sink);
    let mut summary = ArchiveSummary::default();

    for entry in &entries {
        ctx.check()?;

        let metadata = fs::metadata(entry.as_path())
            .map_err(|e| StorageError::from_io(entry.relative(), e))?;
        if metadata.is_dir() {
            summary.skipped_dirs += 1;
            continue;
        }

        let size = metadata.len();
        let attempted = summary.declared_bytes + size;
        if attempted > limits.max_bytes {
            debug!(
                files = summary.files,
                attempted,
                limit = limits.max_bytes,
                "Archive byte quota reached"
            );
            return Err(StorageError::QuotaExceeded {
                attempted,
                limit: limits.max_bytes,
            });
        }

        let mut file =
            File::open(entry.as_path()).map_err(|e| StorageError::from_io(entry.relative(), e))?;
        let header = EntryHeader {
            name: entry.relative(),
            modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            mode: entry_mode(&metadata),
            size_hint: size,
        };
        zip.write_entry(&header, &mut file, ctx)?;

        summary.files += 1;
        summary.declared_bytes = attempted;
    }

    ctx.check()?;
    let (_sink, bytes_written) = zip.finish()?;
    summary.bytes_written = bytes_written;

    info!(
        files = summary.files,
        skipped_dirs = summary.skipped_dirs,
        declared_bytes = summary.declared_bytes,
        bytes_written = summary.bytes_written,
        "Archive complete"
    );
    Ok(summary)
}

/// Resolve every path up front and drop duplicates, keeping first occurrence.
fn resolve_all<S: AsRef<str>>(resolver: &PathResolver, paths: &[S]) -> Result<Vec<ResolvedPath>> {
    let mut seen = HashSet::new();
    let mut entries = Vec::with_capacity(paths.len());
    for path in paths {
        let resolved = resolver.resolve(path.as_ref())?;
        if seen.insert(resolved.relative().to_string()) {
            entries.push(resolved);
        }
    }
    Ok(entries)
}

#[cfg(unix)]
fn entry_mode(metadata: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode()
}

#[cfg(not(unix))]
fn entry_mode(_metadata: &fs::Metadata) -> u32 {
    DEFAULT_FILE_MODE
}

#[cfg(test)]
mod tests {
    use super::format::tests::read_archive;
    use super::*;
    use crate::path::StorageRoot;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    fn resolver() -> (PathResolver, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let root = StorageRoot::open(temp_dir.path()).unwrap();
        (PathResolver::new(root), temp_dir)
    }

    fn put(dir: &TempDir, rel: &str, data: &[u8]) {
        let path = dir.path().join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, data).unwrap();
    }

    fn count_local_headers(archive: &[u8]) -> usize {
        archive.windows(4).filter(|w| *w == b"PK\x03\x04").count()
    }

    #[test]
    fn test_archive_roundtrip_with_skips_and_duplicates() {
        let (resolver, temp_dir) = resolver();
        put(&temp_dir, "photos/a.jpg", b"aaaa");
        put(&temp_dir, "photos/b.txt", b"bb");
        fs::create_dir(temp_dir.path().join("photos/nested")).unwrap();

        let mut out = Vec::new();
        let summary = build_archive(
            &resolver,
            &["photos/a.jpg", "/photos/a.jpg", "photos/nested", "photos\\b.txt"],
            &ArchiveLimits::default(),
            &mut out,
            &RequestContext::unbounded(),
        )
        .unwrap();

        assert_eq!(summary.files, 2);
        assert_eq!(summary.skipped_dirs, 1);
        assert_eq!(summary.declared_bytes, 6);
        assert_eq!(summary.bytes_written, out.len() as u64);

        let entries = read_archive(&out);
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["photos/a.jpg", "photos/b.txt"]);
        assert_eq!(entries[0].data, b"aaaa");
        assert_eq!(entries[1].data, b"bb");
    }

    #[test]
    fn test_scoped_entry_names() {
        let (resolver, temp_dir) = resolver();
        put(&temp_dir, "shares/trip/day1/a.jpg", b"a");

        let scoped = resolver.scoped("shares/trip").unwrap();
        let mut out = Vec::new();
        build_archive(
            &scoped,
            &["day1/a.jpg"],
            &ArchiveLimits::default(),
            &mut out,
            &RequestContext::unbounded(),
        )
        .unwrap();

        let entries = read_archive(&out);
        assert_eq!(entries[0].name, "day1/a.jpg");
    }

    #[test]
    fn test_too_many_files_writes_nothing() {
        let (resolver, _temp_dir) = resolver();
        let paths: Vec<String> = (0..501).map(|i| format!("f{i}.txt")).collect();
        let limits = ArchiveLimits {
            max_files: 500,
            ..ArchiveLimits::default()
        };

        let mut out = Vec::new();
        let result = build_archive(&resolver, &paths, &limits, &mut out, &RequestContext::unbounded());
        assert!(matches!(
            result,
            Err(StorageError::TooManyFiles {
                count: 501,
                limit: 500
            })
        ));
        assert!(out.is_empty());
    }

    #[test]
    fn test_quota_stops_before_copy() {
        let (resolver, temp_dir) = resolver();
        let paths: Vec<String> = (0..10).map(|i| format!("f{i}.bin")).collect();
        for path in &paths {
            put(&temp_dir, path, &[7u8; 100]);
        }
        let limits = ArchiveLimits {
            max_files: 500,
            max_bytes: 450,
        };

        let mut out = Vec::new();
        let result = build_archive(&resolver, &paths, &limits, &mut out, &RequestContext::unbounded());
        assert!(matches!(
            result,
            Err(StorageError::QuotaExceeded {
                attempted: 500,
                limit: 450
            })
        ));

        assert_eq!(count_local_headers(&out), 4);
        assert!(!out.windows(4).any(|w| w == b"PK\x05\x06"));
    }

    #[test]
    fn test_resolution_failure_writes_nothing() {
        let (resolver, temp_dir) = resolver();
        put(&temp_dir, "a.txt", b"a");

        let mut out = Vec::new();
        let result = build_archive(
            &resolver,
            &["a.txt", "../../etc/passwd"],
            &ArchiveLimits::default(),
            &mut out,
            &RequestContext::unbounded(),
        );
        assert!(matches!(result, Err(StorageError::PathTraversal(_))));
        assert!(out.is_empty());
    }

    #[test]
    fn test_cache_directory_not_archived() {
        let (resolver, temp_dir) = resolver();
        put(&temp_dir, "a.txt", b"a");
        put(&temp_dir, ".thumbcache/key.jpg", b"blob");

        let mut out = Vec::new();
        let result = build_archive(
            &resolver,
            &["a.txt", ".thumbcache/key.jpg"],
            &ArchiveLimits::default(),
            &mut out,
            &RequestContext::unbounded(),
        );
        assert!(matches!(result, Err(StorageError::OutsideRoot)));
        assert!(out.is_empty());

        assert!(matches!(
            resolver.scoped(".thumbcache"),
            Err(StorageError::OutsideRoot)
        ));
    }

    #[test]
    fn test_missing_file_mid_archive() {
        let (resolver, temp_dir) = resolver();
        put(&temp_dir, "a.txt", b"a");

        let mut out = Vec::new();
        let result = build_archive(
            &resolver,
            &["a.txt", "missing.txt"],
            &ArchiveLimits::default(),
            &mut out,
            &RequestContext::unbounded(),
        );
        assert!(matches!(result, Err(StorageError::NotFound(_))));
        assert_eq!(count_local_headers(&out), 1);
        assert!(!out.windows(4).any(|w| w == b"PK\x05\x06"));
    }

    #[test]
    fn test_cancelled_before_start() {
        let (resolver, temp_dir) = resolver();
        put(&temp_dir, "a.txt", b"a");
        let token = CancellationToken::new();
        token.cancel();

        let mut out = Vec::new();
        let result = build_archive(
            &resolver,
            &["a.txt"],
            &ArchiveLimits::default(),
            &mut out,
            &RequestContext::unbounded().cancellation(token),
        );
        assert!(matches!(result, Err(StorageError::Cancelled)));
        assert!(out.is_empty());
    }

    #[test]
    fn test_empty_request_is_empty_archive() {
        let (resolver, _temp_dir) = resolver();
        let mut out = Vec::new();
        let paths: [&str; 0] = [];
        let summary = build_archive(
            &resolver,
            &paths,
            &ArchiveLimits::default(),
            &mut out,
            &RequestContext::unbounded(),
        )
        .unwrap();
        assert_eq!(summary.files, 0);
        assert!(read_archive(&out).is_empty());
    }
}
