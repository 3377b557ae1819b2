//! kvfs CLI - format and inspect a kvfs data directory
//!
//! This binary provides administrative commands for kvfs stores.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use kvfs_common::{EntryKind, FsConfig};
use kvfs_core::{StorageEngine, flush_loop};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Size of each write issued by `put`
const COPY_CHUNK: usize = 1024 * 1024;

#[derive(Parser, Debug)]
#[command(name = "kvfs-cli")]
#[command(about = "kvfs administration tool")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/kvfs/kvfs.toml")]
    config: PathBuf,

    /// Data directory holding the shard stores
    #[arg(short, long, env = "KVFS_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Log level
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Format the data directory
    Mkfs {
        /// Block size in bytes
        #[arg(long)]
        block_size: Option<u32>,
        /// Number of data partitions
        #[arg(long)]
        partitions: Option<u32>,
    },
    /// Show attributes of a path
    Stat { path: String },
    /// List a directory
    Ls {
        #[arg(default_value = "/")]
        path: String,
    },
    /// Print a file to stdout
    Cat { path: String },
    /// Copy a local file into the filesystem
    Put { source: PathBuf, path: String },
}

/// Configuration file structure
#[derive(Debug, Deserialize, Default)]
struct Config {
    #[serde(default)]
    fs: FsConfig,
    #[serde(default)]
    logging: LoggingConfig,
}

#[derive(Debug, Deserialize)]
struct LoggingConfig {
    #[serde(default = "default_log_level")]
    level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "warn".to_string()
}

fn load_config(args: &Args) -> Result<Config> {
    if !args.config.exists() {
        return Ok(Config::default());
    }
    let config_str = std::fs::read_to_string(&args.config)
        .with_context(|| format!("reading {}", args.config.display()))?;
    toml::from_str(&config_str).with_context(|| format!("parsing {}", args.config.display()))
}

fn kind_char(kind: Option<EntryKind>) -> char {
    match kind {
        Some(EntryKind::Directory) => 'd',
        Some(EntryKind::Symlink) => 'l',
        _ => '-',
    }
}

fn stat(engine: &StorageEngine, path: &str) -> Result<()> {
    let st = engine.getattr(path)?;
    println!("  Path: {path}");
    println!("  Type: {}", st.kind().map_or("unknown".into(), |k| k.to_string()));
    println!("  Mode: {:o}", st.mode);
    println!(" Inode: {:016x}", st.ino);
    println!("  Size: {} ({} blocks)", st.size, st.blocks);
    println!(" Owner: {}:{}", st.uid, st.gid);
    println!("Modify: {}", st.mtime);
    if st.kind() == Some(EntryKind::Symlink) {
        println!("Target: {}", engine.readlink(path)?);
    }
    Ok(())
}

fn ls(engine: &StorageEngine, path: &str) -> Result<()> {
    let fh = engine.opendir(path)?;
    let entries = engine.readdir(fh);
    engine.release(fh)?;
    for entry in entries? {
        if entry.name == "." || entry.name == ".." {
            continue;
        }
        let child = format!("{}/{}", path.trim_end_matches('/'), entry.name);
        let st = engine.getattr(&child)?;
        println!(
            "{}{:>4o} {:>6}:{:<6} {:>12} {}",
            kind_char(st.kind()),
            st.mode & 0o7777,
            st.uid,
            st.gid,
            st.size,
            entry.name
        );
    }
    Ok(())
}

fn cat(engine: &StorageEngine, path: &str) -> Result<()> {
    use std::io::Write;

    let fh = engine.open(path)?;
    let mut stdout = std::io::stdout().lock();
    let mut offset = 0u64;
    loop {
        let chunk = engine.read_at(fh, offset, COPY_CHUNK)?;
        if chunk.is_empty() {
            break;
        }
        stdout.write_all(&chunk)?;
        offset += chunk.len() as u64;
    }
    engine.release(fh)?;
    Ok(())
}

fn put(engine: &StorageEngine, source: &Path, path: &str) -> Result<u64> {
    let data = std::fs::read(source).with_context(|| format!("reading {}", source.display()))?;
    let fh = match engine.create(path, 0o644) {
        Ok(fh) => fh,
        Err(kvfs_common::Error::AlreadyExists(_)) => {
            let fh = engine.open(path)?;
            engine.truncate(path, 0)?;
            fh
        }
        Err(e) => return Err(e.into()),
    };
    let mut offset = 0u64;
    for chunk in data.chunks(COPY_CHUNK) {
        let n = engine.write_at(fh, chunk, offset)?;
        offset += n as u64;
    }
    engine.release(fh)?;
    Ok(offset)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();
    let config = load_config(&args)?;

    // Merge CLI args with config file (CLI takes precedence)
    let log_level = if args.log_level == "warn" {
        config.logging.level.clone()
    } else {
        args.log_level.clone()
    };
    let mut fs_config = config.fs;
    if let Some(dir) = args.data_dir.clone() {
        fs_config.data_dir = dir;
    }

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if let Commands::Mkfs {
        block_size,
        partitions,
    } = &args.command
    {
        if let Some(bs) = block_size {
            fs_config.block_size = *bs;
        }
        if let Some(p) = partitions {
            fs_config.partitions = *p;
        }
        let engine = StorageEngine::format_redb(&fs_config)?;
        let sb = engine.superblock();
        println!(
            "Formatted {} (block size {}, {} partitions)",
            fs_config.data_dir.display(),
            sb.block_size,
            sb.partitions
        );
        engine.umount()?;
        return Ok(());
    }

    if !fs_config.data_dir.exists() {
        bail!("data directory {} does not exist", fs_config.data_dir.display());
    }
    let engine = Arc::new(StorageEngine::open_redb(&fs_config)?);
    info!("Opened {}", fs_config.data_dir.display());

    match args.command {
        Commands::Mkfs { .. } => unreachable!("handled above"),
        Commands::Stat { path } => stat(&engine, &path)?,
        Commands::Ls { path } => ls(&engine, &path)?,
        Commands::Cat { path } => cat(&engine, &path)?,
        Commands::Put { source, path } => {
            // Drain buffered blocks while a large copy is running
            let flusher = tokio::spawn(flush_loop(
                Arc::clone(&engine),
                fs_config.flush_interval(),
            ));
            let copier = Arc::clone(&engine);
            let written =
                tokio::task::spawn_blocking(move || put(&copier, &source, &path)).await??;
            flusher.abort();
            println!("Wrote {written} bytes");
        }
    }

    if let Err(e) = engine.umount() {
        warn!("Unmount flush failed: {e}");
        return Err(e.into());
    }
    Ok(())
}
