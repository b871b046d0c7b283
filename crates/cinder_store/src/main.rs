// Worker binary entry point: CLI parsing, logging, and the serve loop.

use std::io::IsTerminal;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};

use cinder_store::blob::{BlobStore, MemBlobStore, DEFAULT_PART_SIZE};
use cinder_store::persist::{PersistConfig, DEFAULT_TRACKER_QUEUE};
use cinder_store::s3::S3BlobStore;
use cinder_store::{run_worker_with_shutdown, WorkerOptions};

#[derive(Parser, Debug)]
#[command(name = "cinder-store")]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Worker(WorkerArgs),
}

/// CLI options for running a worker.
#[derive(Parser, Debug)]
struct WorkerArgs {
    #[arg(long, default_value_t = 0)]
    worker_id: u64,

    #[arg(long, default_value = "127.0.0.1:6378")]
    listen: SocketAddr,

    /// Soft capacity in bytes over live chunks; 0 disables the cap.
    #[arg(long, env = "CINDER_CAPACITY", default_value_t = 1536 * 1024 * 1024)]
    capacity: u64,

    #[arg(long, value_enum, env = "CINDER_BLOB_BACKEND", default_value = "s3")]
    blob_backend: BlobBackend,

    /// Backup bucket template. A `%s` suffix slot selects the shard when
    /// `--buckets` is greater than 1.
    #[arg(long, env = "S3_BACKUP_BUCKET", default_value = "cinder.backup%s")]
    bucket: String,

    /// Object key prefix inside the bucket.
    #[arg(long, env = "CINDER_S3_PREFIX", default_value = "")]
    prefix: String,

    /// Number of bucket shards.
    #[arg(long, env = "CINDER_BUCKETS", default_value_t = 1)]
    buckets: u32,

    #[arg(long, env = "CINDER_UPLOAD_CONCURRENCY", default_value_t = 8)]
    upload_concurrency: usize,

    #[arg(long, env = "CINDER_DOWNLOAD_CONCURRENCY", default_value_t = 8)]
    download_concurrency: usize,

    /// Bound of the tracker's inbound op queue.
    #[arg(long, env = "CINDER_TRACKER_QUEUE", default_value_t = DEFAULT_TRACKER_QUEUE)]
    tracker_queue: usize,

    /// Worker lifetime in seconds before a clean drain; 0 serves forever.
    #[arg(long, env = "CINDER_LIFESPAN_SECS", default_value_t = 300)]
    lifespan_secs: u64,

    /// Per-request blob service timeout.
    #[arg(long, env = "CINDER_BLOB_TIMEOUT_MS", default_value_t = 10_000)]
    blob_timeout_ms: u64,

    /// Hold `set` replies until the mutation persisted.
    #[arg(long, env = "CINDER_ACK_AFTER_PERSIST")]
    ack_after_persist: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum BlobBackend {
    S3,
    Memory,
    None,
}

#[tokio::main]
/// Parse CLI args, initialize logging, and run the requested subcommand.
async fn main() -> anyhow::Result<()> {
    // Enable ANSI colors only when stdout is a terminal and NO_COLOR is unset.
    let ansi = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,hyper=warn,aws_config=warn".into()),
        )
        .init();

    let args = Args::parse();
    match args.cmd {
        Command::Worker(args) => run_worker_cmd(args).await,
    }
}

async fn run_worker_cmd(args: WorkerArgs) -> anyhow::Result<()> {
    let blob: Option<Arc<dyn BlobStore>> = match args.blob_backend {
        BlobBackend::S3 => Some(Arc::new(
            S3BlobStore::connect(Duration::from_millis(args.blob_timeout_ms)).await,
        )),
        BlobBackend::Memory => Some(Arc::new(MemBlobStore::new())),
        BlobBackend::None => None,
    };

    let opts = WorkerOptions {
        worker_id: args.worker_id,
        listen: args.listen,
        capacity: args.capacity,
        lifespan: (args.lifespan_secs > 0).then(|| Duration::from_secs(args.lifespan_secs)),
        ack_after_persist: args.ack_after_persist,
        blob,
        persist: PersistConfig {
            bucket_template: args.bucket,
            prefix: args.prefix,
            buckets: args.buckets,
            part_size: DEFAULT_PART_SIZE,
            upload_concurrency: args.upload_concurrency,
            download_concurrency: args.download_concurrency,
            queue_depth: args.tracker_queue,
        },
        piggyback: None,
    };

    run_worker_with_shutdown(opts, tokio::signal::ctrl_c()).await
}
