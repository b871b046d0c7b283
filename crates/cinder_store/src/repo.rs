//! Concurrent key -> chunk map.
//!
//! The repo is the only concurrently mutated map in the worker; everything
//! the store and the recovery path need reduces to atomic get-or-insert
//! and pointer-identity compare-and-swap on its entries.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::chunk::Chunk;

#[derive(Default)]
pub struct ChunkRepo {
    map: DashMap<String, Arc<Chunk>>,
}

impl ChunkRepo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Arc<Chunk>> {
        self.map.get(key).map(|entry| entry.value().clone())
    }

    /// Insert `chunk` unless an entry already exists. Returns the entry now
    /// in the map and whether it was already loaded.
    pub fn get_or_insert(&self, key: &str, chunk: Arc<Chunk>) -> (Arc<Chunk>, bool) {
        match self.map.entry(key.to_string()) {
            Entry::Occupied(entry) => (entry.get().clone(), true),
            Entry::Vacant(entry) => {
                entry.insert(chunk.clone());
                (chunk, false)
            }
        }
    }

    /// Replace the entry for `key`, returning the previous chunk if any.
    pub fn insert(&self, key: &str, chunk: Arc<Chunk>) -> Option<Arc<Chunk>> {
        self.map.insert(key.to_string(), chunk)
    }

    /// Atomically replace `expected` with `new`. Fails when the current
    /// entry is not `expected` (by pointer identity) or is absent.
    pub fn cas(&self, key: &str, expected: &Arc<Chunk>, new: Arc<Chunk>) -> bool {
        match self.map.entry(key.to_string()) {
            Entry::Occupied(mut entry) if Arc::ptr_eq(entry.get(), expected) => {
                entry.insert(new);
                true
            }
            _ => false,
        }
    }

    pub fn remove(&self, key: &str) -> Option<Arc<Chunk>> {
        self.map.remove(key).map(|(_, chunk)| chunk)
    }

    pub fn keys(&self) -> Vec<String> {
        self.map.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(key: &str) -> Arc<Chunk> {
        Arc::new(Chunk::new(key, "c1", 4, String::new()))
    }

    #[test]
    fn get_or_insert_reports_loaded() {
        let repo = ChunkRepo::new();
        let first = chunk("k");
        let (entry, loaded) = repo.get_or_insert("k", first.clone());
        assert!(!loaded);
        assert!(Arc::ptr_eq(&entry, &first));

        let second = chunk("k");
        let (entry, loaded) = repo.get_or_insert("k", second);
        assert!(loaded);
        assert!(Arc::ptr_eq(&entry, &first));
        assert_eq!(repo.len(), 1);
    }

    #[test]
    fn cas_requires_pointer_identity() {
        let repo = ChunkRepo::new();
        let current = chunk("k");
        repo.insert("k", current.clone());

        let replacement = chunk("k");
        let stale = chunk("k");
        assert!(!repo.cas("k", &stale, replacement.clone()));
        assert!(repo.cas("k", &current, replacement.clone()));
        assert!(Arc::ptr_eq(&repo.get("k").expect("entry"), &replacement));

        assert!(!repo.cas("missing", &current, chunk("missing")));
    }

    #[test]
    fn remove_and_keys() {
        let repo = ChunkRepo::new();
        repo.insert("a", chunk("a"));
        repo.insert("b", chunk("b"));

        let mut keys = repo.keys();
        keys.sort();
        assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);

        assert!(repo.remove("a").is_some());
        assert!(repo.remove("a").is_none());
        assert_eq!(repo.len(), 1);
    }
}
