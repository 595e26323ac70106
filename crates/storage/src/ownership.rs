//! Optional uid/gid application for created entries.
//!
//! Ownership is a post-step: the file store applies it after a successful
//! write or mkdir and reports failures to a [`DiagnosticSink`] instead of
//! failing the operation. [`Ownership::apply`] itself returns a `Result` so
//! callers that want a hard failure can call it directly.

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Owner and group to apply to created files and directories.
///
/// A missing or zero id leaves that part of the ownership untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ownership {
    /// User id to assign.
    pub uid: Option<u32>,
    /// Group id to assign.
    pub gid: Option<u32>,
}

impl Ownership {
    /// Create an ownership setting; zero ids are treated as unset.
    pub fn new(uid: Option<u32>, gid: Option<u32>) -> Self {
        Self {
            uid: uid.filter(|&id| id > 0),
            gid: gid.filter(|&id| id > 0),
        }
    }

    /// Whether any id is configured.
    pub fn is_enabled(&self) -> bool {
        self.uid.is_some_and(|id| id > 0) || self.gid.is_some_and(|id| id > 0)
    }

    /// Apply the configured ids to `path`.
    #[cfg(unix)]
    pub fn apply(&self, path: &Path) -> std::io::Result<()> {
        use nix::unistd::{chown, Gid, Uid};

        if !self.is_enabled() {
            return Ok(());
        }

        let uid = self.uid.filter(|&id| id > 0).map(Uid::from_raw);
        let gid = self.gid.filter(|&id| id > 0).map(Gid::from_raw);
        chown(path, uid, gid).map_err(std::io::Error::from)
    }

    /// Ownership is not supported off unix; this is a no-op.
    #[cfg(not(unix))]
    pub fn apply(&self, _path: &Path) -> std::io::Result<()> {
        Ok(())
    }
}

/// A swallowed ownership failure.
#[derive(Debug)]
pub struct OwnershipFailure<'a> {
    /// Path relative to the storage root.
    pub relative: &'a str,
    /// The ownership that could not be applied.
    pub ownership: Ownership,
    /// The underlying error.
    pub error: &'a std::io::Error,
}

/// Receiver for non-fatal engine diagnostics.
pub trait DiagnosticSink: Send + Sync {
    /// Called when ownership could not be applied after a write or mkdir.
    fn ownership_failed(&self, failure: &OwnershipFailure<'_>);
}

/// Default sink that records diagnostics through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    fn ownership_failed(&self, failure: &OwnershipFailure<'_>) {
        tracing::warn!(
            path = %failure.relative,
            uid = ?failure.ownership.uid,
            gid = ?failure.ownership.gid,
            error = %failure.error,
            "Failed to apply ownership"
        );
    }
}

/// Shared handle to a diagnostic sink.
pub type SharedSink = Arc<dyn DiagnosticSink>;
