//! The chunk record: one (key, chunk id) pair with an immutable body once
//! available, plus the recovery latch readers park on while a download is
//! in flight.

use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::Mutex;

use bytes::Bytes;
use tokio::sync::watch;

use crate::unix_time_ms;

/// Marks a chunk recovered with the buffered-placement option; a positive
/// index is assigned later when a buffer slot is allocated.
pub const CHUNK_TO_BE_BUFFERED: i32 = -1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChunkState {
    /// Created but no body yet.
    Pending,
    /// Body present and readable.
    Available,
    /// Tombstoned; `note` records why.
    Deleted,
    /// A download owns the chunk; readers must wait on the latch.
    Recovering,
    /// A recovery attempt failed; a later recovery may replace the chunk.
    Incomplete,
}

struct ChunkMeta {
    state: ChunkState,
    note: String,
    body: Option<Bytes>,
}

pub struct Chunk {
    pub key: String,
    pub id: String,
    /// Declared byte length. For an available chunk, `body.len() == size`.
    pub size: u64,
    /// Destination bucket when sharding is enabled; empty routes to the
    /// default bucket.
    pub bucket: String,
    /// Lineage generation counter.
    pub term: u64,
    accessed: AtomicU64,
    recovered: AtomicU64,
    buff_idx: AtomicI32,
    meta: Mutex<ChunkMeta>,
    latch_tx: watch::Sender<u64>,
}

impl Chunk {
    pub fn new(key: impl Into<String>, id: impl Into<String>, size: u64, bucket: String) -> Self {
        let (latch_tx, _) = watch::channel(0);
        Self {
            key: key.into(),
            id: id.into(),
            size,
            bucket,
            term: 1,
            accessed: AtomicU64::new(unix_time_ms()),
            recovered: AtomicU64::new(0),
            buff_idx: AtomicI32::new(0),
            meta: Mutex::new(ChunkMeta {
                state: ChunkState::Pending,
                note: String::new(),
                body: None,
            }),
            latch_tx,
        }
    }

    pub fn state(&self) -> ChunkState {
        self.meta.lock().map(|m| m.state).unwrap_or(ChunkState::Incomplete)
    }

    pub fn is_available(&self) -> bool {
        self.state() == ChunkState::Available
    }

    pub fn is_deleted(&self) -> bool {
        self.state() == ChunkState::Deleted
    }

    pub fn is_incomplete(&self) -> bool {
        self.state() == ChunkState::Incomplete
    }

    /// The frozen body. Present only once the chunk is available; a
    /// recovering chunk never exposes its partially written buffer.
    pub fn body(&self) -> Option<Bytes> {
        self.meta.lock().ok().and_then(|m| m.body.clone())
    }

    pub fn note(&self) -> String {
        self.meta.lock().map(|m| m.note.clone()).unwrap_or_default()
    }

    /// Publish a full body and make the chunk readable.
    pub fn make_available(&self, body: Bytes) {
        if let Ok(mut meta) = self.meta.lock() {
            meta.state = ChunkState::Available;
            meta.body = Some(body);
        }
    }

    /// Tombstone the chunk, recording the reason and releasing the body.
    /// Returns false when the chunk was already deleted.
    pub fn delete(&self, note: &str) -> bool {
        match self.meta.lock() {
            Ok(mut meta) => {
                let changed = meta.state != ChunkState::Deleted;
                meta.state = ChunkState::Deleted;
                meta.note = note.to_string();
                meta.body = None;
                changed
            }
            Err(_) => false,
        }
    }

    /// Claim the chunk for recovery. Exactly one caller wins; losers must
    /// wait on [`Chunk::wait_recovered`] instead.
    pub fn prepare_recover(&self) -> bool {
        match self.meta.lock() {
            Ok(mut meta) if meta.state == ChunkState::Deleted => {
                meta.state = ChunkState::Recovering;
                meta.body = None;
                true
            }
            _ => false,
        }
    }

    /// Mark a failed recovery attempt. The latch must still be notified.
    pub fn fail_recovery(&self) {
        if let Ok(mut meta) = self.meta.lock() {
            meta.state = ChunkState::Incomplete;
            meta.body = None;
        }
    }

    /// Wake every reader parked on the current recovery round.
    pub fn notify_recovered(&self) {
        self.latch_tx.send_modify(|round| *round += 1);
    }

    /// Park until the in-flight recovery round completes. Returns
    /// immediately when the chunk is not recovering.
    pub async fn wait_recovered(&self) {
        let mut rx = self.latch_tx.subscribe();
        while self.state() == ChunkState::Recovering {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn access(&self) {
        self.accessed.store(unix_time_ms(), Ordering::Relaxed);
    }

    pub fn accessed(&self) -> u64 {
        self.accessed.load(Ordering::Relaxed)
    }

    pub fn add_recovered(&self, bytes: u64) {
        self.recovered.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn recovered_bytes(&self) -> u64 {
        self.recovered.load(Ordering::Relaxed)
    }

    pub fn buff_idx(&self) -> i32 {
        self.buff_idx.load(Ordering::Relaxed)
    }

    pub fn set_buff_idx(&self, idx: i32) {
        self.buff_idx.store(idx, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for Chunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chunk")
            .field("key", &self.key)
            .field("id", &self.id)
            .field("size", &self.size)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[test]
    fn set_and_delete_transitions() {
        let chunk = Chunk::new("k", "c1", 4, String::new());
        assert_eq!(chunk.state(), ChunkState::Pending);

        chunk.make_available(Bytes::from_static(b"BODY"));
        assert!(chunk.is_available());
        assert_eq!(chunk.body().as_deref(), Some(b"BODY".as_slice()));

        chunk.delete("request");
        assert!(chunk.is_deleted());
        assert_eq!(chunk.note(), "request");
        assert_eq!(chunk.body(), None);
    }

    #[test]
    fn prepare_recover_claims_only_deleted_chunks() {
        let chunk = Chunk::new("k", "c1", 4, String::new());
        assert!(!chunk.prepare_recover());

        chunk.delete("prepare recovery");
        assert!(chunk.prepare_recover());
        assert_eq!(chunk.state(), ChunkState::Recovering);
        // The claim is exclusive.
        assert!(!chunk.prepare_recover());
    }

    #[tokio::test]
    async fn readers_park_until_notified() {
        let chunk = Arc::new(Chunk::new("k", "c1", 4, String::new()));
        chunk.delete("prepare recovery");
        assert!(chunk.prepare_recover());

        let waiter = {
            let chunk = chunk.clone();
            tokio::spawn(async move {
                chunk.wait_recovered().await;
                chunk.state()
            })
        };

        // The waiter cannot finish while the chunk is still recovering.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        chunk.make_available(Bytes::from_static(b"BODY"));
        chunk.notify_recovered();
        assert_eq!(waiter.await.expect("join waiter"), ChunkState::Available);
    }

    #[tokio::test]
    async fn wait_returns_immediately_when_not_recovering() {
        let chunk = Chunk::new("k", "c1", 4, String::new());
        chunk.make_available(Bytes::from_static(b"BODY"));
        chunk.wait_recovered().await;

        chunk.add_recovered(3);
        chunk.add_recovered(1);
        assert_eq!(chunk.recovered_bytes(), 4);
    }
}
