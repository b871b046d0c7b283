//! In-memory chunk store: get/set/del over the repo with soft capacity
//! accounting. The persistent tier composes this store and adds the
//! tracker enqueue on top.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;

use crate::chunk::{Chunk, ChunkState};
use crate::ops::{OpRet, StoreError};
use crate::repo::ChunkRepo;

/// Veto hook consulted before a chunk is admitted.
pub type ValidateFn = Box<dyn Fn(&Chunk) -> bool + Send + Sync>;

pub struct Store {
    id: u64,
    repo: ChunkRepo,
    /// Soft cap over the summed size of live chunks. Zero disables the cap.
    capacity: u64,
    used: AtomicU64,
    validator: Option<ValidateFn>,
}

impl Store {
    pub fn new(id: u64, capacity: u64) -> Self {
        Self {
            id,
            repo: ChunkRepo::new(),
            capacity,
            used: AtomicU64::new(0),
            validator: None,
        }
    }

    pub fn set_validator(&mut self, validator: ValidateFn) {
        self.validator = Some(validator);
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn used(&self) -> u64 {
        self.used.load(Ordering::Relaxed)
    }

    pub(crate) fn repo(&self) -> &ChunkRepo {
        &self.repo
    }

    /// Read a chunk's body. Blocks on the recovery latch when a download
    /// owns the chunk, then re-evaluates.
    pub async fn get(&self, key: &str) -> Result<(String, Bytes), StoreError> {
        self.get_with_options(key, true).await
    }

    pub(crate) async fn get_with_options(
        &self,
        key: &str,
        touch: bool,
    ) -> Result<(String, Bytes), StoreError> {
        let chunk = self.repo.get(key).ok_or(StoreError::NotFound)?;
        if touch {
            chunk.access();
        }
        match chunk.state() {
            ChunkState::Deleted => return Err(StoreError::Deleted(chunk.note())),
            ChunkState::Available => return read_body(&chunk),
            _ => {}
        }

        // Recovering (or a failed attempt): wait for the latch, check again.
        chunk.wait_recovered().await;
        if touch {
            chunk.access();
        }
        match chunk.state() {
            ChunkState::Deleted => Err(StoreError::Deleted(chunk.note())),
            ChunkState::Available => read_body(&chunk),
            _ => Err(StoreError::Incomplete),
        }
    }

    /// Insert or replace a chunk locally and return an immediate result.
    pub fn set(&self, key: &str, chunk_id: &str, body: Bytes) -> OpRet {
        let chunk = Arc::new(Chunk::new(key, chunk_id, body.len() as u64, String::new()));
        chunk.make_available(body);
        match self.put_chunk(key, chunk) {
            Ok(()) => OpRet::success(),
            Err(err) => OpRet::error(err),
        }
    }

    /// Admit `chunk` under `key`: validate, account, insert.
    pub(crate) fn put_chunk(&self, key: &str, chunk: Arc<Chunk>) -> Result<(), StoreError> {
        self.validate(&chunk, self.repo.get(key).as_deref())?;
        let replaced = self.repo.insert(key, chunk.clone());
        let freed = replaced
            .filter(|old| !old.is_deleted() && !Arc::ptr_eq(old, &chunk))
            .map(|old| old.size)
            .unwrap_or(0);
        self.used.fetch_add(chunk.size, Ordering::Relaxed);
        self.used.fetch_sub(freed.min(self.used()), Ordering::Relaxed);
        Ok(())
    }

    pub(crate) fn validate(
        &self,
        chunk: &Chunk,
        replacing: Option<&Chunk>,
    ) -> Result<(), StoreError> {
        if let Some(validator) = &self.validator {
            if !validator(chunk) {
                return Err(StoreError::OOStorage);
            }
        }
        if self.capacity == 0 {
            return Ok(());
        }
        let freed = replacing
            .filter(|old| !old.is_deleted())
            .map(|old| old.size)
            .unwrap_or(0);
        let projected = self
            .used()
            .saturating_sub(freed)
            .saturating_add(chunk.size);
        if projected > self.capacity {
            return Err(StoreError::OOStorage);
        }
        Ok(())
    }

    /// Tombstone a chunk, recording the reason. Returns the chunk so the
    /// persistent tier can enqueue the deletion.
    pub fn del(&self, key: &str, reason: &str) -> Result<Arc<Chunk>, StoreError> {
        let chunk = self.repo.get(key).ok_or(StoreError::NotFound)?;
        if chunk.is_deleted() {
            return Err(StoreError::Deleted(chunk.note()));
        }
        if chunk.delete(reason) {
            self.used
                .fetch_sub(chunk.size.min(self.used()), Ordering::Relaxed);
        }
        Ok(chunk)
    }

    /// Number of entries, tombstones included.
    pub fn len(&self) -> usize {
        self.repo.len()
    }

    pub fn is_empty(&self) -> bool {
        self.repo.is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        self.repo.keys()
    }
}

fn read_body(chunk: &Chunk) -> Result<(String, Bytes), StoreError> {
    chunk
        .body()
        .map(|body| (chunk.id.clone(), body))
        .ok_or(StoreError::Incomplete)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_get_round_trip() {
        let store = Store::new(1, 0);
        assert_eq!(store.set("foo", "c1", Bytes::from_static(b"BODY")).err(), None);

        let (chunk_id, body) = store.get("foo").await.expect("get");
        assert_eq!(chunk_id, "c1");
        assert_eq!(&body[..], b"BODY");
        assert_eq!(store.used(), 4);
    }

    #[tokio::test]
    async fn last_writer_wins_locally() {
        let store = Store::new(1, 0);
        store.set("foo", "c1", Bytes::from_static(b"one"));
        store.set("foo", "c2", Bytes::from_static(b"two2"));

        let (chunk_id, body) = store.get("foo").await.expect("get");
        assert_eq!(chunk_id, "c2");
        assert_eq!(&body[..], b"two2");
        assert_eq!(store.len(), 1);
        assert_eq!(store.used(), 4);
    }

    #[tokio::test]
    async fn deleted_is_not_not_found() {
        let store = Store::new(1, 0);
        store.set("foo", "c1", Bytes::from_static(b"BODY"));
        store.del("foo", "request").expect("del");

        match store.get("foo").await {
            Err(StoreError::Deleted(note)) => assert_eq!(note, "request"),
            other => panic!("expected deleted, got {other:?}"),
        }
        assert_eq!(store.get("bar").await.err(), Some(StoreError::NotFound));
        assert_eq!(store.del("bar", "x").err(), Some(StoreError::NotFound));
        assert_eq!(store.used(), 0);
        // The tombstone still occupies an entry.
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn capacity_is_enforced_at_set() {
        let store = Store::new(1, 6);
        assert_eq!(store.set("a", "c1", Bytes::from_static(b"four")).err(), None);
        assert_eq!(
            store.set("b", "c2", Bytes::from_static(b"four")).err(),
            Some(StoreError::OOStorage)
        );

        // Replacing an existing chunk frees its size first.
        assert_eq!(store.set("a", "c3", Bytes::from_static(b"sixsix")).err(), None);
        assert_eq!(store.used(), 6);
    }

    #[tokio::test]
    async fn validator_can_veto() {
        let mut store = Store::new(1, 0);
        store.set_validator(Box::new(|chunk| chunk.size <= 3));
        assert_eq!(store.set("a", "c1", Bytes::from_static(b"ok")).err(), None);
        assert_eq!(
            store.set("b", "c2", Bytes::from_static(b"toobig")).err(),
            Some(StoreError::OOStorage)
        );
    }
}
