//! Sandboxed path resolution.
//!
//! Every engine operation turns caller input into a [`ResolvedPath`] through
//! [`PathResolver::resolve`] before touching the filesystem. Resolution is a
//! two-stage check:
//!
//! 1. A lexical pass normalises separators, strips any leading separator and
//!    rejects `..` segments and NUL bytes outright. Nothing on disk is
//!    consulted at this stage.
//! 2. The normalised path is joined onto the root, canonicalised (resolving
//!    symlinks) and verified to still lie under the root by component
//!    comparison. A root of `/data` therefore never contains `/data2`.
//!
//! The engine's own cache directory ([`CACHE_DIR_NAME`] under the storage
//! root) is refused as if it were outside the root, so callers can neither
//! read nor plant cached thumbnails.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use crate::error::{Result, StorageError};
use crate::files::CACHE_DIR_NAME;

/// The canonical directory all operations are sandboxed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageRoot {
    path: Arc<Path>,
}

impl StorageRoot {
    /// Open an existing directory as a storage root.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let canonical = fs::canonicalize(path)
            .map_err(|e| StorageError::from_io(&path.display().to_string(), e))?;

        if !canonical.is_dir() {
            return Err(StorageError::NotADirectory(path.display().to_string()));
        }

        Ok(Self {
            path: Arc::from(canonical),
        })
    }

    /// The canonical absolute root path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether `candidate` equals or descends from this root.
    pub fn contains(&self, candidate: &Path) -> bool {
        candidate.starts_with(&self.path)
    }
}

/// A path verified to lie within a [`StorageRoot`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPath {
    absolute: PathBuf,
    relative: String,
}

impl ResolvedPath {
    /// The canonical absolute path.
    pub fn as_path(&self) -> &Path {
        &self.absolute
    }

    /// The normalised, `/`-separated path relative to the root.
    ///
    /// Empty for the root itself.
    pub fn relative(&self) -> &str {
        &self.relative
    }

    /// Whether this is the root directory.
    pub fn is_root(&self) -> bool {
        self.relative.is_empty()
    }

    /// The final path segment, if any.
    pub fn file_name(&self) -> Option<&str> {
        self.relative.rsplit('/').next().filter(|s| !s.is_empty())
    }

    /// Lowercase extension including the leading dot, e.g. `.jpg`.
    pub fn extension(&self) -> String {
        extension_of(self.file_name().unwrap_or_default())
    }
}

/// Resolves caller-supplied relative paths against a storage root.
#[derive(Debug, Clone)]
pub struct PathResolver {
    root: StorageRoot,
    // The storage root holding the cache directory; differs from `root` once scoped.
    base: StorageRoot,
}

impl PathResolver {
    /// Create a resolver sandboxed to `root`.
    pub fn new(root: StorageRoot) -> Self {
        Self {
            base: root.clone(),
            root,
        }
    }

    /// The root this resolver is sandboxed to.
    pub fn root(&self) -> &StorageRoot {
        &self.root
    }

    /// Resolve `rel` to a verified path inside the root.
    ///
    /// Fails with [`StorageError::PathTraversal`] before any filesystem
    /// access when the input is syntactically hostile, and with
    /// [`StorageError::OutsideRoot`] when the canonical form escapes the root.
    pub fn resolve(&self, rel: &str) -> Result<ResolvedPath> {
        let segments = normalize(rel)?;
        let relative = segments.join("/");

        let mut joined = self.root.path().to_path_buf();
        joined.extend(&segments);

        let absolute = canonicalize_within(&joined)?;
        if !self.root.contains(&absolute) {
            tracing::warn!(input = %rel, "Rejected path resolving outside the storage root");
            return Err(StorageError::OutsideRoot);
        }
        if self.is_reserved(&absolute) {
            tracing::warn!(input = %rel, "Rejected path inside the thumbnail cache");
            return Err(StorageError::OutsideRoot);
        }

        Ok(ResolvedPath { absolute, relative })
    }

    /// Derive a resolver rooted at an existing sub-directory.
    ///
    /// Paths resolved through the returned resolver are contained by the
    /// sub-directory and, transitively, by this resolver's root.
    pub fn scoped(&self, rel_dir: &str) -> Result<PathResolver> {
        let resolved = self.resolve(rel_dir)?;
        let metadata =
            fs::metadata(resolved.as_path()).map_err(|e| StorageError::from_io(rel_dir, e))?;
        if !metadata.is_dir() {
            return Err(StorageError::NotADirectory(resolved.relative().to_string()));
        }

        Ok(PathResolver {
            root: StorageRoot {
                path: Arc::from(resolved.absolute),
            },
            base: self.base.clone(),
        })
    }

    /// Whether `path` is the cache directory or lies beneath it.
    ///
    /// The name is matched case-insensitively so case-folding filesystems
    /// cannot be used to reach it under another spelling.
    pub fn is_reserved(&self, path: &Path) -> bool {
        path.strip_prefix(self.base.path())
            .ok()
            .and_then(|rest| rest.components().next())
            .and_then(|first| first.as_os_str().to_str())
            .is_some_and(|first| first.eq_ignore_ascii_case(CACHE_DIR_NAME))
    }
}

/// Lexically normalise `rel` into path segments.
///
/// Both `/` and `\` are separators. Empty and `.` segments are dropped so a
/// leading separator is meaningless. Any `..` segment or NUL byte rejects
/// the whole input.
pub fn normalize(rel: &str) -> Result<Vec<String>> {
    if rel.contains('\0') {
        return Err(StorageError::PathTraversal(rel.replace('\0', "\\0")));
    }

    let mut segments = Vec::new();
    for segment in rel.split(['/', '\\']) {
        match segment {
            "" | "." => {}
            ".." => return Err(StorageError::PathTraversal(rel.to_string())),
            other => segments.push(other.to_string()),
        }
    }

    // Windows drive prefixes survive splitting; refuse them the same way.
    if let Some(first) = segments.first() {
        if Path::new(first)
            .components()
            .any(|c| matches!(c, Component::Prefix(_)))
        {
            return Err(StorageError::PathTraversal(rel.to_string()));
        }
    }

    Ok(segments)
}

/// Check that `name` is a bare entry name usable within a single directory.
pub fn validate_name(name: &str) -> Result<()> {
    let invalid = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0']);

    if invalid {
        return Err(StorageError::InvalidName(name.replace('\0', "\\0")));
    }
    Ok(())
}

/// Lowercase suffix of `name` from its last dot, e.g. `.jpg`; empty if none.
///
/// A dotfile such as `.hidden` is all extension.
pub(crate) fn extension_of(name: &str) -> String {
    name.rfind('.')
        .map(|dot| name[dot..].to_lowercase())
        .unwrap_or_default()
}

/// Canonicalise `path`, tolerating a missing tail.
///
/// The deepest ancestor that exists is canonicalised and the missing
/// segments are appended. An entry that exists but cannot be canonicalised
/// (a dangling symlink) is treated as escaping the root.
fn canonicalize_within(path: &Path) -> Result<PathBuf> {
    let mut existing = path;
    let mut missing: Vec<&std::ffi::OsStr> = Vec::new();

    loop {
        match fs::symlink_metadata(existing) {
            Ok(_) => break,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let (Some(parent), Some(name)) = (existing.parent(), existing.file_name()) else {
                    return Err(StorageError::OutsideRoot);
                };
                missing.push(name);
                existing = parent;
            }
            Err(e) => return Err(StorageError::Io(e)),
        }
    }

    let mut canonical = match fs::canonicalize(existing) {
        Ok(p) => p,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(StorageError::OutsideRoot),
        Err(e) => return Err(StorageError::Io(e)),
    };

    for name in missing.into_iter().rev() {
        canonical.push(name);
    }
    Ok(canonical)
}
