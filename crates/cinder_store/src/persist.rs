//! Persistent tier: the ordered upload tracker and chunk recovery.
//!
//! Every mutation flowing through [`PersistentStore`] is wrapped in an
//! [`OpWrapper`] and enqueued to the tracker, a single-reader loop that
//! dispatches uploads with bounded concurrency and surfaces completions to
//! the `on_persisted` hook in submission order. A coalescing signal
//! mailbox lets callers ask for "commit up to here" or a graceful stop.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use bytes::{Bytes, BytesMut};
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;

use crate::blob::{BlobCodec, BlobStore, UploadProfile, DEFAULT_PART_SIZE};
use crate::chunk::{Chunk, CHUNK_TO_BE_BUFFERED};
use crate::ops::{OpRet, StoreError};
use crate::store::Store;
use crate::GET_OPTION_BUFFER;

/// Commit regardless of queued or in-flight operations.
pub const STORAGE_SIGNAL_FLAG_FORCE_COMMIT: u32 = 0x0001;

/// Upload attempts per operation before the op is recorded as failed.
const UPLOAD_ATTEMPTS: usize = 3;

/// Default bound of the tracker's inbound op queue. Deliberately small so
/// a stalled blob tier pushes back onto setters; raise via
/// `CINDER_TRACKER_QUEUE` when burst absorption matters more than memory.
pub const DEFAULT_TRACKER_QUEUE: usize = 10;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StorageSignal {
    pub flags: u32,
}

impl StorageSignal {
    pub fn force_commit() -> Self {
        Self {
            flags: STORAGE_SIGNAL_FLAG_FORCE_COMMIT,
        }
    }

    pub fn is_force_commit(self) -> bool {
        self.flags & STORAGE_SIGNAL_FLAG_FORCE_COMMIT != 0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpKind {
    Set,
    Del,
}

/// The mutation record submitted to the tracker.
#[derive(Clone, Debug)]
pub struct LineageOp {
    pub op: OpKind,
    pub key: String,
    pub id: String,
    pub size: u64,
    pub accessed: u64,
    pub bucket: String,
    /// Positive when the chunk lives in a buffer slot rather than primary
    /// placement.
    pub buff_idx: i32,
}

pub struct OpWrapper {
    pub op: LineageOp,
    pub chunk: Arc<Chunk>,
    pub body: Option<Bytes>,
    /// Submission sequence number; defines the persist-ordering.
    pub op_idx: usize,
    pub op_ret: OpRet,
    /// Already durable (a recovered download); tracked for ordering only.
    pub persisted: bool,
}

pub type PersistedFn = Box<dyn Fn(&OpWrapper) + Send + Sync>;
pub type SignalFn = Box<dyn Fn(StorageSignal) -> bool + Send + Sync>;

/// Callbacks layered above the tracker (lineage, replication). The default
/// set does nothing on persist and stops the tracker on any signal.
pub struct PersistHooks {
    pub on_persisted: PersistedFn,
    /// Runs when the tracker processes a signal; return true to stop.
    pub on_signal_tracker: SignalFn,
}

impl Default for PersistHooks {
    fn default() -> Self {
        Self {
            on_persisted: Box::new(|_| {}),
            on_signal_tracker: Box::new(|_| true),
        }
    }
}

#[derive(Clone, Debug)]
pub struct PersistConfig {
    /// Bucket template; may carry a `%s` suffix slot for sharding.
    pub bucket_template: String,
    pub prefix: String,
    pub buckets: u32,
    pub part_size: usize,
    pub upload_concurrency: usize,
    pub download_concurrency: usize,
    pub queue_depth: usize,
}

impl Default for PersistConfig {
    fn default() -> Self {
        Self {
            bucket_template: "cinder.backup%s".to_string(),
            prefix: String::new(),
            buckets: 1,
            part_size: DEFAULT_PART_SIZE,
            upload_concurrency: 8,
            download_concurrency: 8,
            queue_depth: DEFAULT_TRACKER_QUEUE,
        }
    }
}

struct TrackerHandle {
    ops_tx: mpsc::Sender<OpWrapper>,
    signal_tx: watch::Sender<Option<StorageSignal>>,
    stopped_rx: watch::Receiver<bool>,
    task: JoinHandle<()>,
}

/// Store with the blob tier as its persistent layer.
///
/// Composes the in-memory [`Store`]; without a blob backend it degrades to
/// plain local semantics (immediate results, recovery unsupported).
pub struct PersistentStore {
    store: Store,
    codec: BlobCodec,
    blob: Option<Arc<dyn BlobStore>>,
    config: PersistConfig,
    hooks: Arc<PersistHooks>,
    download_slots: Arc<Semaphore>,
    tracker: Mutex<Option<TrackerHandle>>,
}

impl PersistentStore {
    pub fn new(
        id: u64,
        capacity: u64,
        blob: Option<Arc<dyn BlobStore>>,
        config: PersistConfig,
    ) -> Self {
        Self::with_hooks(id, capacity, blob, config, PersistHooks::default())
    }

    pub fn with_hooks(
        id: u64,
        capacity: u64,
        blob: Option<Arc<dyn BlobStore>>,
        config: PersistConfig,
        hooks: PersistHooks,
    ) -> Self {
        let codec = BlobCodec::new(&config.bucket_template, &config.prefix, config.buckets);
        let download_slots = Arc::new(Semaphore::new(config.download_concurrency.max(1)));
        Self {
            store: Store::new(id, capacity),
            codec,
            blob,
            config,
            hooks: Arc::new(hooks),
            download_slots,
            tracker: Mutex::new(None),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn codec(&self) -> &BlobCodec {
        &self.codec
    }

    pub fn recovery_enabled(&self) -> bool {
        self.blob.is_some()
    }

    pub async fn get(&self, key: &str) -> Result<(String, Bytes), StoreError> {
        self.store.get(key).await
    }

    /// Insert or replace a chunk and enqueue its upload. The returned
    /// delayed result resolves when the tracker finishes the op.
    pub async fn set(&self, key: &str, chunk_id: &str, body: Bytes) -> Result<OpRet, StoreError> {
        let chunk = Arc::new(Chunk::new(
            key,
            chunk_id,
            body.len() as u64,
            self.codec.bucket_for(key),
        ));
        chunk.make_available(body.clone());
        self.store.put_chunk(key, chunk.clone())?;
        Ok(self.enqueue(OpKind::Set, chunk, Some(body), false).await)
    }

    /// Tombstone a chunk and enqueue the deletion.
    pub async fn del(&self, key: &str, reason: &str) -> Result<OpRet, StoreError> {
        let chunk = self.store.del(key, reason)?;
        Ok(self.enqueue(OpKind::Del, chunk, None, false).await)
    }

    /// Make `key` readable locally by streaming it from the blob tier.
    ///
    /// Concurrent callers for the same missing key coordinate through the
    /// chunk latch: exactly one performs the download, the rest wait and
    /// share its outcome.
    pub async fn set_recovery(
        &self,
        key: &str,
        chunk_id: &str,
        size: u64,
        opts: u32,
    ) -> Result<(), StoreError> {
        let Some(blob) = self.blob.clone() else {
            return Err(StoreError::RecoveryUnsupported);
        };

        // Already readable locally: nothing to download.
        if self.store.get_with_options(key, true).await.is_ok() {
            return Ok(());
        }

        // A fresh chunk is deleted first so the recovery claim always wins.
        let placeholder = Arc::new(Chunk::new(
            key,
            chunk_id,
            size,
            self.codec.bucket_for(key),
        ));
        placeholder.delete("prepare recovery");
        placeholder.prepare_recover();
        let (mut chunk, mut loaded) = self.store.repo().get_or_insert(key, placeholder.clone());

        // A legacy chunk from a failed download: take the entry over.
        if loaded && chunk.is_incomplete() {
            if self.store.repo().cas(key, &chunk, placeholder.clone()) {
                chunk = placeholder;
                loaded = false;
            } else {
                chunk = self.store.repo().get(key).ok_or(StoreError::NotFound)?;
                loaded = true;
            }
        }

        if loaded && !chunk.prepare_recover() {
            // Another caller owns the download.
            chunk.wait_recovered().await;
            return if chunk.is_available() {
                Ok(())
            } else {
                Err(StoreError::Incomplete)
            };
        }

        if opts & GET_OPTION_BUFFER != 0 {
            chunk.set_buff_idx(CHUNK_TO_BE_BUFFERED);
        }

        if let Err(err) = self.store.validate(&chunk, None) {
            chunk.fail_recovery();
            chunk.notify_recovered();
            return Err(err);
        }

        let outcome = self.download_into(&blob, &chunk, key, size).await;
        match outcome {
            Ok(body) => {
                chunk.make_available(body);
                match self.store.put_chunk(key, chunk.clone()) {
                    Ok(()) => {
                        // Reuse the set path for ordering; the download is
                        // already durable so the tracker skips the upload.
                        let _ = self
                            .enqueue(OpKind::Set, chunk.clone(), chunk.body(), true)
                            .await;
                        chunk.notify_recovered();
                        Ok(())
                    }
                    Err(err) => {
                        chunk.fail_recovery();
                        chunk.notify_recovered();
                        Err(err)
                    }
                }
            }
            Err(err) => {
                tracing::warn!(key, error = ?err, "chunk recovery download failed");
                chunk.fail_recovery();
                chunk.notify_recovered();
                Err(StoreError::Incomplete)
            }
        }
    }

    async fn download_into(
        &self,
        blob: &Arc<dyn BlobStore>,
        chunk: &Arc<Chunk>,
        key: &str,
        size: u64,
    ) -> anyhow::Result<Bytes> {
        let _slot = self
            .download_slots
            .acquire()
            .await
            .context("download slots closed")?;
        let mut buf = BytesMut::zeroed(size as usize);
        let bucket = self.codec.resolve_bucket(&chunk.bucket).to_string();
        let blob_key = self.codec.blob_key(key);
        let progress_chunk = chunk.clone();
        blob.download(&bucket, &blob_key, &mut buf, &move |n| {
            progress_chunk.add_recovered(n);
        })
        .await?;
        Ok(buf.freeze())
    }

    async fn enqueue(
        &self,
        op: OpKind,
        chunk: Arc<Chunk>,
        body: Option<Bytes>,
        persisted: bool,
    ) -> OpRet {
        let ops_tx = match self.tracker.lock() {
            Ok(guard) => guard.as_ref().map(|handle| handle.ops_tx.clone()),
            Err(_) => None,
        };
        let Some(ops_tx) = ops_tx else {
            return OpRet::success();
        };

        let op_ret = OpRet::delayed_success();
        let buff_idx = chunk.buff_idx();
        let wrapper = OpWrapper {
            op: LineageOp {
                op,
                key: chunk.key.clone(),
                id: chunk.id.clone(),
                size: chunk.size,
                accessed: chunk.accessed(),
                bucket: chunk.bucket.clone(),
                buff_idx: if buff_idx > 0 { buff_idx } else { 0 },
            },
            chunk,
            body,
            op_idx: 0,
            op_ret: op_ret.clone(),
            persisted,
        };
        if ops_tx.send(wrapper).await.is_err() {
            // Tracker already drained; nothing is persisting anymore.
            return OpRet::success();
        }
        op_ret
    }

    /// Spawn the tracker loop. A no-op without a blob backend or when the
    /// tracker is already running.
    pub fn start_tracker(&self) {
        let Some(blob) = self.blob.clone() else {
            return;
        };
        let Ok(mut guard) = self.tracker.lock() else {
            return;
        };
        if guard.is_some() {
            return;
        }

        let (ops_tx, ops_rx) = mpsc::channel(self.config.queue_depth.max(1));
        let (signal_tx, signal_rx) = watch::channel(None);
        let (stopped_tx, stopped_rx) = watch::channel(false);
        let ctx = TrackerContext {
            blob,
            codec: self.codec.clone(),
            hooks: self.hooks.clone(),
            small: UploadProfile::small(self.config.part_size),
            large: UploadProfile::large(self.config.part_size, self.config.upload_concurrency),
            upload_concurrency: self.config.upload_concurrency.max(1),
        };
        let task = tokio::spawn(run_tracker(
            ctx,
            ops_rx,
            signal_rx,
            signal_tx.clone(),
            stopped_tx,
        ));
        *guard = Some(TrackerHandle {
            ops_tx,
            signal_tx,
            stopped_rx,
            task,
        });
        tracing::debug!("tracking operations");
    }

    /// Post a signal to the tracker mailbox. A newer signal replaces an
    /// unseen older one. Returns false when the tracker is not running.
    pub fn signal(&self, sig: StorageSignal) -> bool {
        match self.tracker.lock() {
            Ok(guard) => match guard.as_ref() {
                Some(handle) => handle.signal_tx.send(Some(sig)).is_ok(),
                None => false,
            },
            Err(_) => false,
        }
    }

    /// Signal the tracker to stop and wait for the drain to finish.
    pub async fn stop_tracker(&self) -> anyhow::Result<()> {
        self.stop_tracker_with(StorageSignal::default()).await
    }

    pub async fn stop_tracker_with(&self, sig: StorageSignal) -> anyhow::Result<()> {
        let mut stopped_rx = match self.tracker.lock() {
            Ok(guard) => match guard.as_ref() {
                Some(handle) => handle.stopped_rx.clone(),
                None => bail!("tracker not started"),
            },
            Err(_) => bail!("tracker state poisoned"),
        };
        if !self.signal(sig) {
            bail!("tracker not started");
        }
        tracing::debug!("signaled tracker to stop");

        while !*stopped_rx.borrow_and_update() {
            stopped_rx
                .changed()
                .await
                .context("tracker exited without stopping")?;
        }

        let handle = match self.tracker.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        if let Some(handle) = handle {
            let _ = handle.task.await;
        }
        tracing::debug!("operation tracking stopped");
        Ok(())
    }
}

struct TrackerContext {
    blob: Arc<dyn BlobStore>,
    codec: BlobCodec,
    hooks: Arc<PersistHooks>,
    small: UploadProfile,
    large: UploadProfile,
    upload_concurrency: usize,
}

async fn run_tracker(
    ctx: TrackerContext,
    mut ops_rx: mpsc::Receiver<OpWrapper>,
    mut signal_rx: watch::Receiver<Option<StorageSignal>>,
    signal_tx: watch::Sender<Option<StorageSignal>>,
    stopped_tx: watch::Sender<bool>,
) {
    // Completed ops land here indexed by op_idx; the cursor walks the
    // contiguous prefix so the persist stream keeps submission order.
    let mut persisted_ops: Vec<Option<OpWrapper>> = Vec::new();
    let mut persisted = 0usize;

    // The token channel throttles uploads and carries their results back.
    let (token_tx, mut token_rx) = mpsc::channel::<Option<OpWrapper>>(ctx.upload_concurrency);
    let mut free_tokens = ctx.upload_concurrency;

    // A signal seen while uploads were still in flight.
    let mut delayed_signal: Option<StorageSignal> = None;

    let mut ops_open = true;
    let mut track_start: Option<Instant> = None;
    let mut track_duration = Duration::ZERO;

    loop {
        tokio::select! {
            maybe_op = ops_rx.recv(), if ops_open => {
                let Some(mut op) = maybe_op else {
                    ops_open = false;
                    continue;
                };
                if track_start.is_none() {
                    track_start = Some(Instant::now());
                }

                // Make sure a permit is in the channel, then take one
                // message out. It may be a completed op; handle it first so
                // completions are never lost to backpressure.
                if free_tokens > 0 {
                    free_tokens -= 1;
                    let _ = token_tx.send(None).await;
                }
                if let Some(Some(done)) = token_rx.recv().await {
                    collect_persisted(&mut persisted_ops, &mut persisted, &ctx.hooks, done);
                }

                op.op_idx = persisted_ops.len();
                persisted_ops.push(None);
                tracing::debug!(key = %op.op.key, op = ?op.op.op, idx = op.op_idx, "tracking incoming op");

                if op.op.op == OpKind::Set && !op.persisted {
                    dispatch_upload(&ctx, op, token_tx.clone());
                } else {
                    // Deletes and already-durable sets only hold an
                    // ordering slot.
                    op.op_ret.done(None);
                    let _ = token_tx.send(Some(op)).await;
                }
            }
            message = token_rx.recv() => {
                if let Some(Some(done)) = message {
                    collect_persisted(&mut persisted_ops, &mut persisted, &ctx.hooks, done);
                }
                free_tokens += 1;
                if delayed_signal.is_some() && persisted == persisted_ops.len() {
                    if let Some(sig) = delayed_signal.take() {
                        let _ = signal_tx.send(Some(sig));
                    }
                }
            }
            changed = signal_rx.changed() => {
                if changed.is_err() {
                    continue;
                }
                let Some(sig) = *signal_rx.borrow_and_update() else {
                    continue;
                };
                let force = sig.is_force_commit();
                if ops_open && !ops_rx.is_empty() && !force {
                    // More ops are queued; defer until they are tracked.
                    tracing::debug!("ops pending, deferring signal");
                    let _ = signal_tx.send(Some(sig));
                } else if persisted < persisted_ops.len() && !force {
                    tracing::debug!("uploads in flight, parking signal");
                    delayed_signal = Some(sig);
                } else {
                    if let Some(start) = track_start.take() {
                        track_duration += start.elapsed();
                    }
                    if (ctx.hooks.on_signal_tracker)(sig) {
                        let _ = stopped_tx.send(true);
                        tracing::trace!(?track_duration, "operation tracking stopped");
                        return;
                    }
                }
            }
        }
    }
}

fn dispatch_upload(ctx: &TrackerContext, op: OpWrapper, token_tx: mpsc::Sender<Option<OpWrapper>>) {
    let blob = ctx.blob.clone();
    let small = ctx.small.clone();
    let large = ctx.large.clone();
    let bucket = ctx.codec.resolve_bucket(&op.op.bucket).to_string();
    let blob_key = ctx.codec.blob_key(&op.op.key);
    tokio::spawn(async move {
        let body = op.body.clone().unwrap_or_default();
        let profile = if body.len() >= large.part_size {
            large
        } else {
            small
        };
        let start = Instant::now();
        let mut failure: Option<anyhow::Error> = None;
        for attempt in 0..UPLOAD_ATTEMPTS {
            if attempt > 0 {
                tracing::info!(attempt = attempt + 1, key = %op.op.key, "retrying upload");
            }
            match blob.upload(&bucket, &blob_key, body.clone(), &profile).await {
                Ok(()) => {
                    failure = None;
                    tracing::debug!(key = %op.op.key, elapsed = ?start.elapsed(), "upload complete");
                    break;
                }
                Err(err) => {
                    tracing::warn!(attempt = attempt + 1, key = %op.op.key, error = ?err, "upload attempt failed");
                    failure = Some(err);
                }
            }
        }
        match failure {
            None => op.op_ret.done(None),
            Some(err) => {
                tracing::error!(key = %op.op.key, error = ?err, "upload failed");
                op.op_ret
                    .done(Some(StoreError::UploadFailed(err.to_string())));
            }
        }
        let _ = token_tx.send(Some(op)).await;
    });
}

fn collect_persisted(
    persisted_ops: &mut Vec<Option<OpWrapper>>,
    persisted: &mut usize,
    hooks: &PersistHooks,
    op: OpWrapper,
) {
    let idx = op.op_idx;
    if idx < persisted_ops.len() {
        persisted_ops[idx] = Some(op);
    }
    while *persisted < persisted_ops.len() {
        let Some(done) = persisted_ops[*persisted].as_ref() else {
            break;
        };
        // Failed uploads are logged and skipped; they never hold the cursor.
        if done.op_ret.err().is_none() {
            (hooks.on_persisted)(done);
        }
        *persisted += 1;
    }
}
