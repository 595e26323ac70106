//! Sharebox
//!
//! Administrative command-line access to the sandboxed storage engine.

use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use sharebox::config::Config;
use sharebox::format::{format_bytes, format_listing};
use sharebox::logging;
use storage::thumbnail::spawn_sweeper;
use storage::{RequestContext, Storage, ThumbnailContext};
use tokio_util::sync::CancellationToken;

/// Sharebox - sandboxed file storage with thumbnails and ZIP export.
#[derive(Parser, Debug)]
#[command(name = "sharebox")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// List a directory
    Ls {
        /// Directory relative to the storage root
        #[arg(default_value = "")]
        path: String,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Show metadata for a file or directory
    Stat {
        /// Path relative to the storage root
        path: String,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Write a file's contents to stdout
    Cat {
        /// File relative to the storage root
        path: String,
    },

    /// Upload a local file into storage
    Put {
        /// Local file to upload ("-" for stdin)
        source: PathBuf,

        /// Destination relative to the storage root
        path: String,
    },

    /// Create a directory and any missing parents
    Mkdir {
        /// Directory relative to the storage root
        path: String,
    },

    /// Delete a file or directory tree
    Rm {
        /// Path relative to the storage root
        path: String,
    },

    /// Rename an entry within its directory
    Mv {
        /// Path relative to the storage root
        path: String,

        /// New bare name
        new_name: String,
    },

    /// Render a JPEG thumbnail
    Thumb {
        /// Image relative to the storage root
        path: String,

        /// Output file ("-" for stdout)
        #[arg(long, short, default_value = "-")]
        output: PathBuf,

        /// Longer side in pixels (defaults to the configured share size)
        #[arg(long, short)]
        size: Option<u32>,

        /// Use the configured admin size instead of the share size
        #[arg(long, conflicts_with = "size")]
        admin: bool,
    },

    /// Stream a ZIP archive of files
    Zip {
        /// Files to include, relative to --base
        #[arg(required = true)]
        paths: Vec<String>,

        /// Directory the paths are relative to
        #[arg(long, default_value = "")]
        base: String,

        /// Output file ("-" for stdout)
        #[arg(long, short, default_value = "-")]
        output: PathBuf,
    },

    /// Evict cached thumbnails according to the configured policy
    Sweep {
        /// Keep sweeping periodically until interrupted
        #[arg(long)]
        watch: bool,

        /// Seconds between sweeps (defaults to the configured interval)
        #[arg(long, requires = "watch")]
        interval: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default()?
    };

    // Apply environment variable overrides
    let overrides = config.apply_env_overrides();

    // Validate configuration
    config.validate()?;

    let _log_guard = logging::init(
        &config.general.log_level,
        cli.verbose,
        config.general.log_file.as_deref(),
    )?;
    for applied in &overrides {
        applied.log();
    }

    let storage = Storage::open(&config.storage).with_context(|| {
        format!(
            "Failed to open storage root: {}",
            config.storage.root.display()
        )
    })?;

    run(cli.command, storage, &config).await
}

/// Execute one command against an opened engine.
async fn run(command: Commands, storage: Storage, config: &Config) -> anyhow::Result<()> {
    let timeout = config.request.timeout();

    match command {
        Commands::Ls { path, json } => {
            let entries = blocking(&storage, move |s| s.list(&path)).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else {
                print!("{}", format_listing(&entries));
            }
        }
        Commands::Stat { path, json } => {
            let entry = blocking(&storage, move |s| s.stat(&path)).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&entry)?);
            } else {
                println!("name:      {}", entry.name);
                println!("type:      {}", if entry.is_dir { "directory" } else { "file" });
                println!("size:      {} ({} bytes)", format_bytes(entry.size), entry.size);
                println!("modified:  {}", entry.modified_secs());
                if !entry.extension.is_empty() {
                    println!("extension: {}", entry.extension);
                }
            }
        }
        Commands::Cat { path } => {
            let data = blocking(&storage, move |s| s.read(&path)).await?;
            let mut stdout = io::stdout().lock();
            stdout.write_all(&data)?;
            stdout.flush()?;
        }
        Commands::Put { source, path } => {
            let data = read_upload(&source, config.upload.max_upload_bytes)?;
            let size = data.len() as u64;
            let target = path.clone();
            blocking(&storage, move |s| s.write(&target, &data)).await?;
            tracing::info!(path = %path, bytes = size, "Uploaded file");
            println!("Wrote {} to {}", format_bytes(size), path);
        }
        Commands::Mkdir { path } => {
            let target = path.clone();
            blocking(&storage, move |s| s.mkdir(&target)).await?;
            println!("Created {}", path);
        }
        Commands::Rm { path } => {
            let target = path.clone();
            blocking(&storage, move |s| s.delete(&target)).await?;
            println!("Deleted {}", path);
        }
        Commands::Mv { path, new_name } => {
            let (source, name) = (path.clone(), new_name.clone());
            blocking(&storage, move |s| s.rename(&source, &name)).await?;
            println!("Renamed {} to {}", path, new_name);
        }
        Commands::Thumb {
            path,
            output,
            size,
            admin,
        } => {
            let context = if admin {
                ThumbnailContext::Admin
            } else {
                ThumbnailContext::Share
            };
            let max_dim = size.unwrap_or_else(|| config.storage.thumbnail.max_dim(context));
            let ctx = RequestContext::with_timeout(timeout);

            let jpeg = blocking(&storage, move |s| s.thumbnail(&path, max_dim, &ctx)).await?;
            write_output(&output, &jpeg)?;
        }
        Commands::Zip {
            paths,
            base,
            output,
        } => {
            let ctx = RequestContext::with_timeout(timeout);
            let summary = tokio::task::spawn_blocking(move || -> anyhow::Result<_> {
                let sink = open_output(&output)?;
                let summary = storage.archive(&base, &paths, sink, &ctx)?;
                Ok(summary)
            })
            .await
            .context("Archive task failed")??;

            eprintln!(
                "Archived {} file(s), {} skipped director{}, {} written",
                summary.files,
                summary.skipped_dirs,
                if summary.skipped_dirs == 1 { "y" } else { "ies" },
                format_bytes(summary.bytes_written)
            );
        }
        Commands::Sweep { watch, interval } => {
            if watch {
                run_sweeper(&storage, config, interval).await?;
            } else {
                let report = blocking(&storage, |s| s.sweep_thumbnails()).await?;
                println!(
                    "Removed {} of {} cached thumbnail(s), freed {}, {} retained",
                    report.removed,
                    report.scanned,
                    format_bytes(report.freed_bytes),
                    format_bytes(report.retained_bytes)
                );
            }
        }
    }

    Ok(())
}

/// Run an engine call on the blocking pool.
async fn blocking<T, F>(storage: &Storage, f: F) -> anyhow::Result<T>
where
    T: Send + 'static,
    F: FnOnce(&Storage) -> storage::Result<T> + Send + 'static,
{
    let storage = storage.clone();
    let result = tokio::task::spawn_blocking(move || f(&storage))
        .await
        .context("Storage task failed")?;
    Ok(result?)
}

/// Sweep on an interval until Ctrl-C.
async fn run_sweeper(storage: &Storage, config: &Config, interval: Option<u64>) -> anyhow::Result<()> {
    let thumbnail = &config.storage.thumbnail;
    let Some(interval) = interval
        .map(Duration::from_secs)
        .or_else(|| thumbnail.sweep_interval())
    else {
        bail!("No sweep interval: pass --interval or set storage.thumbnail.sweep_interval_secs");
    };

    let policy = thumbnail.sweep_policy();
    if !policy.is_enabled() {
        tracing::warn!("No eviction policy configured; only abandoned temporary files will be removed");
    }

    let shutdown = CancellationToken::new();
    let handle = spawn_sweeper(
        storage.thumbnail_cache().clone(),
        policy,
        interval,
        shutdown.clone(),
    );
    tracing::info!("Sweeping thumbnail cache every {:?}", interval);

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    tracing::info!("Received shutdown signal");

    shutdown.cancel();
    handle.await.context("Sweeper task failed")?;
    Ok(())
}

/// Read an upload from `source`, refusing anything over `limit` bytes.
fn read_upload(source: &Path, limit: u64) -> anyhow::Result<Vec<u8>> {
    let reader: Box<dyn Read> = if source == Path::new("-") {
        Box::new(io::stdin())
    } else {
        let file = File::open(source)
            .with_context(|| format!("Failed to open {}", source.display()))?;
        let size = file.metadata()?.len();
        if size > limit {
            bail!(
                "{} is {}, over the upload limit of {}",
                source.display(),
                format_bytes(size),
                format_bytes(limit)
            );
        }
        Box::new(file)
    };

    let mut data = Vec::new();
    reader
        .take(limit.saturating_add(1))
        .read_to_end(&mut data)
        .with_context(|| format!("Failed to read {}", source.display()))?;
    if data.len() as u64 > limit {
        bail!("Upload exceeds the limit of {}", format_bytes(limit));
    }
    Ok(data)
}

fn open_output(output: &Path) -> anyhow::Result<Box<dyn Write + Send>> {
    if output == Path::new("-") {
        Ok(Box::new(BufWriter::new(io::stdout())))
    } else {
        let file = File::create(output)
            .with_context(|| format!("Failed to create {}", output.display()))?;
        Ok(Box::new(BufWriter::new(file)))
    }
}

fn write_output(output: &Path, data: &[u8]) -> anyhow::Result<()> {
    let mut sink = open_output(output)?;
    sink.write_all(data)?;
    sink.flush()?;
    Ok(())
}
