//! Chunk cache driver
//!
//! Reads data files through the chunk cache from several threads, checks
//! every chunk against a direct read and reports cache statistics.
//!
//! ```text
//! chunk-cache scan --threads 8 --passes 3 /var/lib/data/*-Data.db
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use chunk_cache::cache::RESERVED_POOL_SPACE_MB;
use chunk_cache::io::{
    BufferPool, Channel, ChunkReader, FileChannel, HeapBufferPool, PoolStats, ReaderFileProxy,
    Rebufferer, SimpleChunkReader, TrackingBufferPool,
};
use chunk_cache::{ChunkCache, ChunkCacheConfig, MetricsSnapshot};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Chunk cache driver
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON", global = true)]
    log_json: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Read files through the cache and verify every chunk
    Scan(ScanArgs),
}

#[derive(Args, Debug)]
struct ScanArgs {
    /// Files to read
    #[arg(required = true)]
    files: Vec<PathBuf>,

    /// Chunk size in bytes (power of two)
    #[arg(long, default_value = "65536")]
    chunk_size: usize,

    /// Reader threads
    #[arg(long, default_value = "4")]
    threads: usize,

    /// Full passes over every file per thread
    #[arg(long, default_value = "2")]
    passes: usize,

    /// File cache size in MiB
    #[arg(long, env = "CHUNK_CACHE_SIZE_MB", default_value = "512")]
    cache_size_mb: u64,

    /// MiB of the cache size held back for the buffer pool
    #[arg(long, env = "CHUNK_CACHE_RESERVED_MB", default_value_t = RESERVED_POOL_SPACE_MB)]
    reserved_mb: u64,

    /// Exact cache capacity in bytes, overriding the MiB settings
    #[arg(long, env = "CHUNK_CACHE_CAPACITY_BYTES")]
    capacity_bytes: Option<u64>,

    /// Read without the cache
    #[arg(long, env = "CHUNK_CACHE_DISABLED")]
    disable: bool,

    /// Round chunk buffers up to the next power of two
    #[arg(long)]
    round_up: bool,

    /// Attempts to reference a chunk before failing a read
    #[arg(long, default_value = "1000")]
    max_reference_attempts: u32,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,
}

impl ScanArgs {
    fn cache_config(&self) -> ChunkCacheConfig {
        ChunkCacheConfig {
            file_cache_size_mb: self.cache_size_mb,
            reserved_pool_space_mb: self.reserved_mb,
            capacity_bytes: self.capacity_bytes,
            enabled: !self.disable,
            round_up: self.round_up,
            max_reference_attempts: self.max_reference_attempts,
            ..Default::default()
        }
    }
}

// =============================================================================
// Main
// =============================================================================

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_logging(&cli);

    match cli.command {
        Command::Scan(args) => scan(args),
    }
}

fn init_logging(cli: &Cli) {
    let level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if cli.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}

// =============================================================================
// Scan
// =============================================================================

/// One opened file: the cached path and a direct channel to verify against
struct ScanFile {
    rebufferer: Arc<dyn Rebufferer>,
    direct: Arc<dyn Channel>,
    length: u64,
}

#[derive(Debug, Serialize)]
struct ScanReport {
    files: usize,
    threads: usize,
    passes: usize,
    cache_enabled: bool,
    chunks_read: u64,
    bytes_read: u64,
    elapsed_ms: u64,
    cache: MetricsSnapshot,
    pool: PoolStats,
}

fn scan(args: ScanArgs) -> anyhow::Result<()> {
    if args.threads == 0 {
        bail!("--threads must be at least 1");
    }

    let pool = Arc::new(TrackingBufferPool::new(Arc::new(HeapBufferPool::default())));
    let dyn_pool: Arc<dyn BufferPool> = pool.clone();
    let cache = ChunkCache::new(args.cache_config(), dyn_pool).context("invalid cache configuration")?;

    let mut files = Vec::with_capacity(args.files.len());
    for path in &args.files {
        let channel: Arc<dyn Channel> = Arc::new(
            FileChannel::open(path).with_context(|| format!("opening {}", path.display()))?,
        );
        let reader: Arc<dyn ChunkReader> = Arc::new(
            SimpleChunkReader::new(Arc::clone(&channel), args.chunk_size)
                .with_context(|| format!("creating reader for {}", path.display()))?,
        );
        let length = reader.file_length();
        let rebufferer = cache.maybe_wrap(reader)?.instantiate_rebufferer();
        files.push(ScanFile {
            rebufferer,
            direct: channel,
            length,
        });
    }

    info!(
        files = files.len(),
        threads = args.threads,
        passes = args.passes,
        cache_enabled = cache.is_enabled(),
        "starting scan"
    );

    let chunks_read = AtomicU64::new(0);
    let bytes_read = AtomicU64::new(0);
    let start = Instant::now();

    std::thread::scope(|scope| -> anyhow::Result<()> {
        let workers: Vec<_> = (0..args.threads)
            .map(|worker| {
                let files = &files;
                let args = &args;
                let chunks_read = &chunks_read;
                let bytes_read = &bytes_read;
                scope.spawn(move || -> anyhow::Result<()> {
                    let step = args.chunk_size as u64;
                    for _ in 0..args.passes {
                        for file in files {
                            let chunks = file.length.div_ceil(step);
                            // Stagger workers so they collide on chunks mid-scan
                            for i in 0..chunks {
                                let chunk = (i + worker as u64) % chunks;
                                let position = chunk * step + (worker as u64 % step);
                                let handle = file.rebufferer.rebuffer(position.min(file.length - 1))?;
                                verify(file, handle.aligned_offset(), handle.bytes())?;
                                chunks_read.fetch_add(1, Ordering::Relaxed);
                                bytes_read.fetch_add(handle.len() as u64, Ordering::Relaxed);
                            }
                        }
                    }
                    Ok(())
                })
            })
            .collect();

        for worker in workers {
            match worker.join() {
                Ok(result) => result?,
                Err(_) => bail!("scan worker panicked"),
            }
        }
        Ok(())
    })?;

    let elapsed = start.elapsed();
    let stats = cache.metrics();

    for file in &files {
        file.rebufferer.close_reader();
        file.rebufferer.close()?;
    }
    drop(files);
    cache.close();

    let report = ScanReport {
        files: args.files.len(),
        threads: args.threads,
        passes: args.passes,
        cache_enabled: cache.is_enabled(),
        chunks_read: chunks_read.load(Ordering::Relaxed),
        bytes_read: bytes_read.load(Ordering::Relaxed),
        elapsed_ms: elapsed.as_millis() as u64,
        cache: stats,
        pool: pool.stats(),
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "read {} chunks ({} bytes) from {} files in {} ms",
            report.chunks_read, report.bytes_read, report.files, report.elapsed_ms
        );
        println!("{}", report.cache);
        println!(
            "pool:               {} acquired, {} released, {} outstanding",
            report.pool.acquired, report.pool.released, report.pool.outstanding
        );
    }

    if report.pool.outstanding != 0 {
        warn!(
            outstanding = report.pool.outstanding,
            "buffers still outstanding after close"
        );
        bail!("{} chunk buffers leaked", report.pool.outstanding);
    }

    Ok(())
}

/// Compare a served chunk with the bytes on disk
fn verify(file: &ScanFile, offset: u64, bytes: &[u8]) -> anyhow::Result<()> {
    let mut expected = vec![0u8; bytes.len()];
    let mut filled = 0;
    while filled < expected.len() {
        let n = file
            .direct
            .read_at(&mut expected[filled..], offset + filled as u64)?;
        if n == 0 {
            break;
        }
        filled += n;
    }

    if filled != bytes.len() || expected != bytes {
        bail!(
            "chunk at {} of {} differs from the file contents",
            offset,
            file.direct.path()
        );
    }
    Ok(())
}
