//! Sharebox storage engine.
//!
//! Exposes a directory tree to semi-trusted callers through a small,
//! sandboxed API:
//!
//! - [`path`]: resolution of caller paths to locations that are guaranteed to
//!   stay inside the storage root
//! - [`files`]: list, read, atomic write, mkdir, delete and rename
//! - [`thumbnail`]: JPEG thumbnails cached by path, mtime and size
//! - [`archive`]: streaming ZIP export under file-count and byte quotas
//!
//! [`Storage`] ties these together behind one configuration.
//!
//! # Example
//!
//! ```no_run
//! use storage::{RequestContext, Storage, StorageConfig};
//!
//! let storage = Storage::open(&StorageConfig::with_root("/srv/share"))?;
//! storage.write("photos/a.jpg", &std::fs::read("a.jpg")?)?;
//! let _thumb = storage.thumbnail("photos/a.jpg", 200, &RequestContext::unbounded())?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod archive;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod files;
pub mod gate;
pub mod ownership;
pub mod path;
pub mod thumbnail;

pub use archive::{build_archive, ArchiveLimits, ArchiveSummary};
pub use config::{StorageConfig, ThumbnailConfig};
pub use context::RequestContext;
pub use engine::Storage;
pub use error::{ErrorClass, Result, StorageError};
pub use files::{FileEntry, FileStore};
pub use gate::{ConcurrencyGate, GatePermit};
pub use ownership::{DiagnosticSink, Ownership, OwnershipFailure, SharedSink, TracingSink};
pub use path::{PathResolver, ResolvedPath, StorageRoot};
pub use thumbnail::{
    SweepPolicy, SweepReport, ThumbnailCache, ThumbnailContext, ThumbnailStats,
};
