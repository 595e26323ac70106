//! Sandboxed file operations.
//!
//! Every operation resolves its input through the [`PathResolver`] first; a
//! rejected path never reaches the filesystem. Writes go to a hidden
//! temporary sibling and are renamed into place so readers never see a
//! partially written file.

use std::fs::{self, File, Metadata};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Result, StorageError};
use crate::ownership::{Ownership, OwnershipFailure, SharedSink, TracingSink};
use crate::path::{extension_of, validate_name, PathResolver, ResolvedPath};

/// Name of the thumbnail cache directory under the storage root.
pub const CACHE_DIR_NAME: &str = ".thumbcache";

/// Suffix of in-flight temporary files.
const TEMP_SUFFIX: &str = ".partial";

/// A directory listing record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Entry name (not full path).
    pub name: String,
    /// Size in bytes (0 for directories).
    pub size: u64,
    /// Last modified timestamp.
    pub modified: SystemTime,
    /// Whether this is a directory.
    pub is_dir: bool,
    /// Lowercase extension including the leading dot (`.jpg`); empty if none.
    pub extension: String,
}

impl FileEntry {
    fn from_metadata(name: String, metadata: &Metadata) -> Self {
        let is_dir = metadata.is_dir();

        Self {
            size: if is_dir { 0 } else { metadata.len() },
            modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            is_dir,
            extension: extension_of(&name),
            name,
        }
    }

    /// Modification time as whole seconds since the Unix epoch.
    pub fn modified_secs(&self) -> u64 {
        self.modified
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}

/// File operations sandboxed to a storage root.
#[derive(Clone)]
pub struct FileStore {
    resolver: PathResolver,
    ownership: Ownership,
    diagnostics: SharedSink,
}

impl std::fmt::Debug for FileStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStore")
            .field("resolver", &self.resolver)
            .field("ownership", &self.ownership)
            .finish_non_exhaustive()
    }
}

impl FileStore {
    /// Create a file store without ownership enforcement.
    pub fn new(resolver: PathResolver) -> Self {
        Self {
            resolver,
            ownership: Ownership::default(),
            diagnostics: Arc::new(TracingSink),
        }
    }

    /// Apply `ownership` to created files and directories.
    pub fn with_ownership(mut self, ownership: Ownership) -> Self {
        self.ownership = ownership;
        self
    }

    /// Route non-fatal diagnostics to `sink`.
    pub fn with_diagnostics(mut self, sink: SharedSink) -> Self {
        self.diagnostics = sink;
        self
    }

    /// The resolver this store validates paths with.
    pub fn resolver(&self) -> &PathResolver {
        &self.resolver
    }

    /// List the immediate children of a directory.
    ///
    /// Directories sort first, then entries by case-insensitive name.
    /// Entries that cannot be stat'ed are skipped.
    pub fn list(&self, rel: &str) -> Result<Vec<FileEntry>> {
        let resolved = self.resolver.resolve(rel)?;
        let metadata = fs::metadata(resolved.as_path())
            .map_err(|e| StorageError::from_io(resolved.relative(), e))?;
        if !metadata.is_dir() {
            return Err(StorageError::NotADirectory(resolved.relative().to_string()));
        }

        let mut results = Vec::new();
        for entry_result in fs::read_dir(resolved.as_path())? {
            let entry = match entry_result {
                Ok(e) => e,
                Err(_) => continue,
            };

            let name = entry.file_name().to_string_lossy().to_string();
            if is_internal(&resolved, &name) {
                continue;
            }

            let metadata = match entry.metadata() {
                Ok(m) => m,
                Err(_) => continue,
            };
            // Follow symlinks for type and size; skip links that dangle.
            let metadata = if metadata.file_type().is_symlink() {
                match fs::metadata(entry.path()) {
                    Ok(m) => m,
                    Err(_) => continue,
                }
            } else {
                metadata
            };

            results.push(FileEntry::from_metadata(name, &metadata));
        }

        results.sort_by(|a, b| match (a.is_dir, b.is_dir) {
            (true, false) => std::cmp::Ordering::Less,
            (false, true) => std::cmp::Ordering::Greater,
            _ => a.name.to_lowercase().cmp(&b.name.to_lowercase()),
        });

        Ok(results)
    }

    /// Metadata for a single path.
    pub fn stat(&self, rel: &str) -> Result<FileEntry> {
        let resolved = self.resolver.resolve(rel)?;
        let metadata = fs::metadata(resolved.as_path())
            .map_err(|e| StorageError::from_io(resolved.relative(), e))?;
        let name = resolved.file_name().unwrap_or("/").to_string();
        Ok(FileEntry::from_metadata(name, &metadata))
    }

    /// Whether `rel` resolves and exists. Rejected paths report `false`.
    pub fn exists(&self, rel: &str) -> bool {
        self.resolver
            .resolve(rel)
            .map(|resolved| resolved.as_path().exists())
            .unwrap_or(false)
    }

    /// Read a whole file.
    pub fn read(&self, rel: &str) -> Result<Vec<u8>> {
        let resolved = self.resolver.resolve(rel)?;
        let metadata = fs::metadata(resolved.as_path())
            .map_err(|e| StorageError::from_io(resolved.relative(), e))?;
        if metadata.is_dir() {
            return Err(StorageError::IsADirectory(resolved.relative().to_string()));
        }

        fs::read(resolved.as_path()).map_err(|e| StorageError::from_io(resolved.relative(), e))
    }

    /// Write `data` to `rel`, creating parent directories as needed.
    ///
    /// The data lands in a temporary sibling first and is renamed over the
    /// target, so concurrent readers see either the old or the new content.
    pub fn write(&self, rel: &str, data: &[u8]) -> Result<()> {
        let resolved = self.resolver.resolve(rel)?;
        if resolved.is_root() {
            return Err(StorageError::IsADirectory(String::new()));
        }
        if resolved.as_path().is_dir() {
            return Err(StorageError::IsADirectory(resolved.relative().to_string()));
        }

        let parent = resolved
            .as_path()
            .parent()
            .ok_or(StorageError::OutsideRoot)?;
        self.create_dirs(parent)?;

        write_atomic(resolved.as_path(), data)?;
        debug!(path = %resolved.relative(), bytes = data.len(), "Wrote file");

        self.apply_ownership(&resolved);
        Ok(())
    }

    /// Create a directory and any missing parents. Existing directories are fine.
    pub fn mkdir(&self, rel: &str) -> Result<()> {
        let resolved = self.resolver.resolve(rel)?;
        if resolved.as_path().is_dir() {
            return Ok(());
        }

        self.create_dirs(resolved.as_path()).map_err(|e| match e {
            StorageError::Io(ref io) if io.kind() == io::ErrorKind::AlreadyExists => {
                StorageError::NotADirectory(resolved.relative().to_string())
            }
            other => other,
        })?;

        self.apply_ownership(&resolved);
        Ok(())
    }

    /// Remove a file or directory tree. Missing paths are fine.
    ///
    /// Symlinks are removed, never followed.
    pub fn delete(&self, rel: &str) -> Result<()> {
        // Resolve the parent so a symlink leaf is removed rather than its target.
        let resolved = self.resolver.resolve(rel)?;
        if resolved.is_root() {
            return Err(StorageError::RootProtected);
        }
        let target = self.unfollowed(&resolved)?;

        let metadata = match fs::symlink_metadata(&target) {
            Ok(m) => m,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(StorageError::Io(e)),
        };

        let result = if metadata.is_dir() {
            fs::remove_dir_all(&target)
        } else {
            fs::remove_file(&target)
        };

        match result {
            Ok(()) => {
                debug!(path = %resolved.relative(), "Deleted");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    /// Rename an entry within its parent directory.
    ///
    /// `new_name` must be a bare name; moving across directories is not
    /// possible through rename.
    pub fn rename(&self, rel: &str, new_name: &str) -> Result<()> {
        validate_name(new_name)?;

        let resolved = self.resolver.resolve(rel)?;
        if resolved.is_root() {
            return Err(StorageError::RootProtected);
        }
        let source = self.unfollowed(&resolved)?;

        if let Err(e) = fs::symlink_metadata(&source) {
            return Err(StorageError::from_io(resolved.relative(), e));
        }

        let parent = source.parent().ok_or(StorageError::OutsideRoot)?;
        let destination = parent.join(new_name);
        if self.resolver.is_reserved(&destination) {
            return Err(StorageError::InvalidName(new_name.to_string()));
        }

        fs::rename(&source, &destination)
            .map_err(|e| StorageError::from_io(resolved.relative(), e))?;
        debug!(path = %resolved.relative(), new_name, "Renamed");
        Ok(())
    }

    /// The un-canonicalised location of `resolved`'s leaf.
    ///
    /// `resolve` follows symlinks; delete and rename must act on the link
    /// itself, so the leaf name is re-attached to its verified parent.
    fn unfollowed(&self, resolved: &ResolvedPath) -> Result<PathBuf> {
        let (parent_rel, leaf) = match resolved.relative().rsplit_once('/') {
            Some((parent, leaf)) => (parent, leaf),
            None => ("", resolved.relative()),
        };
        let parent = self.resolver.resolve(parent_rel)?;
        Ok(parent.as_path().join(leaf))
    }

    fn create_dirs(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)?;
        Ok(())
    }

    fn apply_ownership(&self, resolved: &ResolvedPath) {
        if !self.ownership.is_enabled() {
            return;
        }
        if let Err(error) = self.ownership.apply(resolved.as_path()) {
            self.diagnostics.ownership_failed(&OwnershipFailure {
                relative: resolved.relative(),
                ownership: self.ownership,
                error: &error,
            });
        }
    }
}

/// Write `data` to `destination` through a temporary sibling and rename.
pub(crate) fn write_atomic(destination: &Path, data: &[u8]) -> Result<()> {
    let temp_path = temp_sibling(destination);

    let result = (|| -> io::Result<()> {
        let mut file = File::create(&temp_path)?;
        file.write_all(data)?;
        file.sync_all()?;
        fs::rename(&temp_path, destination)
    })();

    if let Err(e) = result {
        if let Err(cleanup) = fs::remove_file(&temp_path) {
            if cleanup.kind() != io::ErrorKind::NotFound {
                warn!(error = %cleanup, "Failed to cleanup temp file after failed write");
            }
        }
        return Err(StorageError::Io(e));
    }
    Ok(())
}

/// A hidden, uniquely named temporary path next to `destination`.
pub(crate) fn temp_sibling(destination: &Path) -> PathBuf {
    let name = destination
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    destination.with_file_name(format!(".{}.{:016x}{}", name, rand::random::<u64>(), TEMP_SUFFIX))
}

/// Whether `name` inside `dir` is an engine-internal entry hidden from listings.
fn is_internal(dir: &ResolvedPath, name: &str) -> bool {
    (dir.is_root() && name == CACHE_DIR_NAME) || (name.starts_with('.') && name.ends_with(TEMP_SUFFIX))
}
