//! Ephemeral object cache worker.
//!
//! A worker holds an in-memory shard of chunked objects, persists SET/DEL
//! mutations to an S3-compatible blob tier through an ordered upload
//! tracker, and serves a Redis-style protocol to the proxy tier. Workers
//! are short-lived: they cold-start, serve for a bounded lifespan, lazily
//! recover missing chunks on demand, and drain cleanly on end-of-life.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

pub mod blob;
pub mod chunk;
pub mod ops;
pub mod persist;
pub mod redis_server;
pub mod repo;
pub mod s3;
pub mod store;

use blob::BlobStore;
use persist::{PersistConfig, PersistentStore};
use redis_server::{PiggybackFn, WorkerState};

/// `get` option bit: reply with an error on miss instead of recovering.
pub const GET_OPTION_OPTIONAL: u32 = 0x0001;
/// `get` option bit: mark the recovered chunk for buffered placement.
pub const GET_OPTION_BUFFER: u32 = 0x0002;

/// Piggyback status bits attached to object replies when a lineage status
/// provider is installed.
pub const PONG_WITH_PAYLOAD: u32 = 0x0004;
pub const PONG_RECONCILE: u32 = 0x0008;

/// Default worker lifetime before a clean drain.
pub const DEFAULT_LIFESPAN: Duration = Duration::from_secs(300);

pub(crate) fn unix_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis().min(u128::from(u64::MAX)) as u64)
        .unwrap_or(0)
}

/// Everything needed to run one worker.
pub struct WorkerOptions {
    pub worker_id: u64,
    pub listen: SocketAddr,
    /// Soft capacity in bytes over live chunks; 0 disables the cap.
    pub capacity: u64,
    /// Serve deadline; `None` serves until shutdown or drain.
    pub lifespan: Option<Duration>,
    /// Hold `set` replies until the op persisted.
    pub ack_after_persist: bool,
    /// Blob tier; `None` runs memory-only (no persistence, no recovery).
    pub blob: Option<Arc<dyn BlobStore>>,
    pub persist: PersistConfig,
    pub piggyback: Option<PiggybackFn>,
}

impl WorkerOptions {
    pub fn new(listen: SocketAddr) -> Self {
        Self {
            worker_id: 0,
            listen,
            capacity: 0,
            lifespan: Some(DEFAULT_LIFESPAN),
            ack_after_persist: false,
            blob: None,
            persist: PersistConfig::default(),
            piggyback: None,
        }
    }
}

/// Run a worker until its lifespan ends, a drain is requested, or
/// `shutdown` resolves. The tracker is always drained before returning.
pub async fn run_worker_with_shutdown<F>(opts: WorkerOptions, shutdown: F) -> anyhow::Result<()>
where
    F: std::future::Future<Output = Result<(), std::io::Error>> + Send,
{
    let store = Arc::new(PersistentStore::new(
        opts.worker_id,
        opts.capacity,
        opts.blob.clone(),
        opts.persist.clone(),
    ));
    store.start_tracker();
    let (state, mut drain_rx) =
        WorkerState::new(store.clone(), opts.ack_after_persist, opts.piggyback);

    let listener = TcpListener::bind(opts.listen)
        .await
        .with_context(|| format!("bind {}", opts.listen))?;
    tracing::info!(
        worker_id = opts.worker_id,
        addr = %opts.listen,
        persistent = store.recovery_enabled(),
        "worker serving"
    );

    // A missing lifespan still gets a deadline, just an unreachable one.
    let deadline = tokio::time::Instant::now()
        + opts
            .lifespan
            .unwrap_or(Duration::from_secs(60 * 60 * 24 * 365));
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((socket, _)) => spawn_conn(socket, state.clone()),
                    Err(err) => tracing::warn!(error = ?err, "accept failed"),
                }
            }
            _ = tokio::time::sleep_until(deadline) => {
                tracing::info!("lifespan reached, draining");
                break;
            }
            changed = drain_rx.changed() => {
                if changed.is_ok() {
                    tracing::info!("drain requested");
                    break;
                }
            }
            res = &mut shutdown => {
                res.context("shutdown signal")?;
                tracing::info!("shutdown signal, draining");
                break;
            }
        }
    }

    if store.recovery_enabled() {
        if let Err(err) = store.stop_tracker().await {
            tracing::warn!(error = ?err, "tracker stop failed");
        }
    }
    Ok(())
}

fn spawn_conn(socket: TcpStream, state: Arc<WorkerState>) {
    tokio::spawn(async move {
        if let Err(err) = redis_server::handle_conn(socket, state).await {
            tracing::debug!(error = ?err, "connection closed");
        }
    });
}

/// Handle to a worker running inside this process.
pub struct WorkerHandle {
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<anyhow::Result<()>>,
}

impl WorkerHandle {
    pub async fn shutdown(mut self) -> anyhow::Result<()> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        match self.task.await {
            Ok(res) => res,
            Err(err) => Err(anyhow::anyhow!("worker task join failed: {err}")),
        }
    }

    pub fn abort(&self) {
        self.task.abort();
    }
}

/// Start a worker in-process and wait until its listener answers.
pub async fn start_embedded_worker(opts: WorkerOptions) -> anyhow::Result<WorkerHandle> {
    let listen = opts.listen;
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(run_worker_with_shutdown(opts, async move {
        let _ = shutdown_rx.await;
        Ok::<(), std::io::Error>(())
    }));

    wait_for_listener(listen, Duration::from_secs(10), &task).await?;
    Ok(WorkerHandle {
        shutdown_tx: Some(shutdown_tx),
        task,
    })
}

async fn wait_for_listener(
    addr: SocketAddr,
    timeout: Duration,
    task: &JoinHandle<anyhow::Result<()>>,
) -> anyhow::Result<()> {
    let deadline = std::time::Instant::now() + timeout;
    loop {
        if task.is_finished() {
            anyhow::bail!("worker exited before its listener became ready");
        }
        if TcpStream::connect(addr).await.is_ok() {
            return Ok(());
        }
        if std::time::Instant::now() >= deadline {
            anyhow::bail!("timeout waiting for worker listener at {addr}");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
