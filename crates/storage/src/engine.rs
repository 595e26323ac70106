//! The [`Storage`] facade.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::archive::{build_archive, ArchiveLimits, ArchiveSummary};
use crate::config::{StorageConfig, ThumbnailConfig};
use crate::context::RequestContext;
use crate::error::Result;
use crate::files::{FileEntry, FileStore};
use crate::gate::ConcurrencyGate;
use crate::ownership::SharedSink;
use crate::path::{PathResolver, ResolvedPath, StorageRoot};
use crate::thumbnail::{spawn_sweeper, SweepReport, ThumbnailCache, ThumbnailContext, ThumbnailStats};

/// Sandboxed storage engine.
///
/// All methods are synchronous and may block; async callers should run them
/// on a blocking pool. Paths are relative to the configured root and must
/// already be authorised by the caller.
#[derive(Debug, Clone)]
pub struct Storage {
    resolver: PathResolver,
    files: FileStore,
    thumbnails: Arc<ThumbnailCache>,
    thumbnail_config: ThumbnailConfig,
    archive_limits: ArchiveLimits,
}

impl Storage {
    /// Open the engine on `config.root`, which must be an existing directory.
    pub fn open(config: &StorageConfig) -> Result<Self> {
        let root = StorageRoot::open(&config.root)?;
        let resolver = PathResolver::new(root);

        let files = FileStore::new(resolver.clone()).with_ownership(config.ownership());
        let gate = Arc::new(ConcurrencyGate::new(config.thumbnail.concurrency));
        let thumbnails = Arc::new(ThumbnailCache::new(resolver.clone(), gate));

        info!(
            root = %resolver.root().path().display(),
            thumbnail_concurrency = config.thumbnail.concurrency,
            max_archive_files = config.archive.max_files,
            "Storage engine ready"
        );

        Ok(Self {
            resolver,
            files,
            thumbnails,
            thumbnail_config: config.thumbnail.clone(),
            archive_limits: config.archive,
        })
    }

    /// Route non-fatal diagnostics (ownership failures) to `sink`.
    pub fn with_diagnostics(mut self, sink: SharedSink) -> Self {
        self.files = self.files.with_diagnostics(sink);
        self
    }

    /// Canonical storage root.
    pub fn root(&self) -> &Path {
        self.resolver.root().path()
    }

    /// Resolve `rel` against the root without performing any operation.
    pub fn resolve(&self, rel: &str) -> Result<ResolvedPath> {
        self.resolver.resolve(rel)
    }

    /// See [`FileStore::list`].
    pub fn list(&self, rel: &str) -> Result<Vec<FileEntry>> {
        self.files.list(rel)
    }

    /// See [`FileStore::read`].
    pub fn read(&self, rel: &str) -> Result<Vec<u8>> {
        self.files.read(rel)
    }

    /// See [`FileStore::write`].
    pub fn write(&self, rel: &str, data: &[u8]) -> Result<()> {
        self.files.write(rel, data)
    }

    /// See [`FileStore::mkdir`].
    pub fn mkdir(&self, rel: &str) -> Result<()> {
        self.files.mkdir(rel)
    }

    /// See [`FileStore::delete`].
    pub fn delete(&self, rel: &str) -> Result<()> {
        self.files.delete(rel)
    }

    /// See [`FileStore::rename`].
    pub fn rename(&self, rel: &str, new_name: &str) -> Result<()> {
        self.files.rename(rel, new_name)
    }

    /// See [`FileStore::stat`].
    pub fn stat(&self, rel: &str) -> Result<FileEntry> {
        self.files.stat(rel)
    }

    /// See [`FileStore::exists`].
    pub fn exists(&self, rel: &str) -> bool {
        self.files.exists(rel)
    }

    /// JPEG thumbnail of `rel` with longer side `max_dim`.
    pub fn thumbnail(&self, rel: &str, max_dim: u32, ctx: &RequestContext) -> Result<Vec<u8>> {
        self.thumbnails.thumbnail(rel, max_dim, ctx)
    }

    /// JPEG thumbnail of `rel` at the size configured for `context`.
    pub fn thumbnail_for(
        &self,
        rel: &str,
        context: ThumbnailContext,
        ctx: &RequestContext,
    ) -> Result<Vec<u8>> {
        self.thumbnail(rel, self.thumbnail_config.max_dim(context), ctx)
    }

    /// Thumbnail cache counters.
    pub fn thumbnail_stats(&self) -> ThumbnailStats {
        self.thumbnails.stats()
    }

    /// The shared thumbnail cache.
    pub fn thumbnail_cache(&self) -> &Arc<ThumbnailCache> {
        &self.thumbnails
    }

    /// Configured archive quotas.
    pub fn archive_limits(&self) -> ArchiveLimits {
        self.archive_limits
    }

    /// Stream a ZIP of `paths`, resolved under `base`, with the configured quotas.
    ///
    /// Entry names are relative to `base`. An empty `base` is the root.
    pub fn archive<S, W>(
        &self,
        base: &str,
        paths: &[S],
        sink: W,
        ctx: &RequestContext,
    ) -> Result<ArchiveSummary>
    where
        S: AsRef<str>,
        W: Write,
    {
        self.archive_with_limits(base, paths, &self.archive_limits, sink, ctx)
    }

    /// As [`Storage::archive`] with explicit quotas.
    pub fn archive_with_limits<S, W>(
        &self,
        base: &str,
        paths: &[S],
        limits: &ArchiveLimits,
        sink: W,
        ctx: &RequestContext,
    ) -> Result<ArchiveSummary>
    where
        S: AsRef<str>,
        W: Write,
    {
        let scoped = self.resolver.scoped(base)?;
        build_archive(&scoped, paths, limits, sink, ctx)
    }

    /// Sweep the thumbnail cache once with the configured policy.
    pub fn sweep_thumbnails(&self) -> Result<SweepReport> {
        self.thumbnails.sweep(&self.thumbnail_config.sweep_policy())
    }

    /// Start the background sweeper if a sweep interval is configured.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn_sweeper(&self, shutdown: CancellationToken) -> Option<JoinHandle<()>> {
        let interval = self.thumbnail_config.sweep_interval()?;
        Some(spawn_sweeper(
            Arc::clone(&self.thumbnails),
            self.thumbnail_config.sweep_policy(),
            interval,
            shutdown,
        ))
    }
}
