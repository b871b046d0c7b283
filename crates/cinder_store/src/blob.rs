//! Blob-tier seam: the store trait the worker uploads to and recovers
//! from, the key/bucket layout, and an in-memory backend used by tests and
//! `--blob-backend memory`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{bail, ensure};
use async_trait::async_trait;
use bytes::Bytes;
use sha2::{Digest, Sha256};

/// Default multipart threshold and part size, 8 MiB.
pub const DEFAULT_PART_SIZE: usize = 8 * 1024 * 1024;

/// Upload tuning for one attempt: bodies at or above `part_size` go through
/// multipart with up to `concurrency` parts in flight.
#[derive(Clone, Debug)]
pub struct UploadProfile {
    pub part_size: usize,
    pub concurrency: usize,
}

impl UploadProfile {
    /// Profile for small bodies: a single serial request.
    pub fn small(part_size: usize) -> Self {
        Self {
            part_size,
            concurrency: 1,
        }
    }

    /// Profile for large bodies: parallel multipart.
    pub fn large(part_size: usize, concurrency: usize) -> Self {
        Self {
            part_size,
            concurrency: concurrency.max(1),
        }
    }
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// One upload attempt. Retry policy lives in the tracker's upload
    /// worker, not here.
    async fn upload(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        profile: &UploadProfile,
    ) -> anyhow::Result<()>;

    /// Fill `buf` with the object's bytes, invoking `progress` with the
    /// length of each received part. Fails unless the object length equals
    /// `buf.len()` exactly.
    async fn download(
        &self,
        bucket: &str,
        key: &str,
        buf: &mut [u8],
        progress: &(dyn Fn(u64) + Send + Sync),
    ) -> anyhow::Result<u64>;
}

/// Derives object keys and destination buckets for chunks.
///
/// Keys follow `{prefix}chunks/{hh/hh/../hh}/{key}` where the segments are
/// the 64-bit key hash rendered as 16 hex digits in 2-character groups.
/// The bucket template may contain a `%s` suffix slot; with sharding
/// enabled it is rendered with `hash(key) % buckets`.
#[derive(Clone, Debug)]
pub struct BlobCodec {
    prefix: String,
    bucket_template: String,
    default_bucket: String,
    buckets: u32,
}

impl BlobCodec {
    pub fn new(bucket_template: &str, prefix: &str, buckets: u32) -> Self {
        Self {
            prefix: prefix.to_string(),
            bucket_template: bucket_template.to_string(),
            default_bucket: render_bucket(bucket_template, ""),
            buckets: buckets.max(1),
        }
    }

    /// 64-bit key hash: the first 8 bytes of SHA-256 over the key.
    pub fn key_hash(key: &str) -> u64 {
        let digest = Sha256::digest(key.as_bytes());
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        u64::from_be_bytes(prefix)
    }

    /// Object key for a chunk key. Deterministic: same key, same path.
    pub fn blob_key(&self, key: &str) -> String {
        let hex = format!("{:016x}", Self::key_hash(key));
        let segmented = hex
            .as_bytes()
            .chunks(2)
            .map(|pair| std::str::from_utf8(pair).unwrap_or_default())
            .collect::<Vec<_>>()
            .join("/");
        format!("{}chunks/{}/{}", self.prefix, segmented, key)
    }

    /// Chunk-recorded bucket: empty when sharding is disabled, else the
    /// template rendered with the key's shard number.
    pub fn bucket_for(&self, key: &str) -> String {
        if self.buckets <= 1 {
            return String::new();
        }
        let shard = Self::key_hash(key) % u64::from(self.buckets);
        render_bucket(&self.bucket_template, &shard.to_string())
    }

    /// Resolve a chunk's recorded bucket to the concrete destination.
    pub fn resolve_bucket<'a>(&'a self, bucket: &'a str) -> &'a str {
        if bucket.is_empty() {
            &self.default_bucket
        } else {
            bucket
        }
    }
}

fn render_bucket(template: &str, suffix: &str) -> String {
    template.replace("%s", suffix)
}

/// In-memory blob store. Backs tests and local runs without S3; carries
/// counters and failure injection so pipeline tests can observe exactly
/// what reached the blob tier.
#[derive(Default)]
pub struct MemBlobStore {
    objects: Mutex<HashMap<(String, String), Bytes>>,
    uploads: AtomicU64,
    downloads: AtomicU64,
    fail_uploads: AtomicUsize,
    upload_delay: Mutex<Duration>,
}

impl MemBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an object, bypassing the upload path.
    pub fn insert(&self, bucket: &str, key: &str, body: Bytes) {
        if let Ok(mut objects) = self.objects.lock() {
            objects.insert((bucket.to_string(), key.to_string()), body);
        }
    }

    pub fn get(&self, bucket: &str, key: &str) -> Option<Bytes> {
        self.objects
            .lock()
            .ok()
            .and_then(|objects| objects.get(&(bucket.to_string(), key.to_string())).cloned())
    }

    pub fn upload_count(&self) -> u64 {
        self.uploads.load(Ordering::Relaxed)
    }

    pub fn download_count(&self) -> u64 {
        self.downloads.load(Ordering::Relaxed)
    }

    /// Make the next `n` upload attempts fail (test hook).
    pub fn inject_upload_failures(&self, n: usize) {
        self.fail_uploads.store(n, Ordering::Relaxed);
    }

    /// Delay every upload attempt (test hook for in-flight scenarios).
    pub fn set_upload_delay(&self, delay: Duration) {
        if let Ok(mut slot) = self.upload_delay.lock() {
            *slot = delay;
        }
    }
}

#[async_trait]
impl BlobStore for MemBlobStore {
    async fn upload(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        _profile: &UploadProfile,
    ) -> anyhow::Result<()> {
        let delay = self.upload_delay.lock().map(|d| *d).unwrap_or_default();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self
            .fail_uploads
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok()
        {
            bail!("injected upload failure for {key}");
        }
        self.uploads.fetch_add(1, Ordering::Relaxed);
        self.insert(bucket, key, body);
        Ok(())
    }

    async fn download(
        &self,
        bucket: &str,
        key: &str,
        buf: &mut [u8],
        progress: &(dyn Fn(u64) + Send + Sync),
    ) -> anyhow::Result<u64> {
        self.downloads.fetch_add(1, Ordering::Relaxed);
        let Some(body) = self.get(bucket, key) else {
            bail!("no such object: {bucket}/{key}");
        };
        ensure!(
            body.len() == buf.len(),
            "object size mismatch for {key}: stored {}, declared {}",
            body.len(),
            buf.len()
        );
        buf.copy_from_slice(&body);
        progress(body.len() as u64);
        Ok(body.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_key_is_deterministic_and_segmented() {
        let codec = BlobCodec::new("cinder.backup%s", "v1/", 1);
        let key = codec.blob_key("foo");
        assert_eq!(key, codec.blob_key("foo"));
        assert!(key.starts_with("v1/chunks/"));
        assert!(key.ends_with("/foo"));

        let segments: Vec<&str> = key
            .trim_start_matches("v1/chunks/")
            .trim_end_matches("/foo")
            .split('/')
            .collect();
        assert_eq!(segments.len(), 8);
        assert!(segments
            .iter()
            .all(|s| s.len() == 2 && s.chars().all(|c| c.is_ascii_hexdigit())));

        assert_ne!(codec.blob_key("foo"), codec.blob_key("bar"));
    }

    #[test]
    fn bucket_sharding() {
        let single = BlobCodec::new("cinder.backup%s", "", 1);
        assert_eq!(single.bucket_for("foo"), "");
        assert_eq!(single.resolve_bucket(""), "cinder.backup");

        let sharded = BlobCodec::new("cinder.backup%s", "", 4);
        let bucket = sharded.bucket_for("foo");
        assert!(bucket.starts_with("cinder.backup"));
        let shard: u64 = bucket
            .trim_start_matches("cinder.backup")
            .parse()
            .expect("shard suffix");
        assert!(shard < 4);
        assert_eq!(bucket, sharded.bucket_for("foo"));
        assert_eq!(sharded.resolve_bucket(&bucket), bucket);
    }

    #[tokio::test]
    async fn memory_store_round_trip() {
        let store = MemBlobStore::new();
        let profile = UploadProfile::small(DEFAULT_PART_SIZE);
        store
            .upload("b", "k", Bytes::from_static(b"BODY"), &profile)
            .await
            .expect("upload");

        let mut buf = vec![0u8; 4];
        let seen = std::sync::atomic::AtomicU64::new(0);
        let n = store
            .download("b", "k", &mut buf, &|len| {
                seen.fetch_add(len, Ordering::Relaxed);
            })
            .await
            .expect("download");
        assert_eq!(n, 4);
        assert_eq!(&buf, b"BODY");
        assert_eq!(seen.load(Ordering::Relaxed), 4);
        assert_eq!(store.upload_count(), 1);
        assert_eq!(store.download_count(), 1);
    }

    #[tokio::test]
    async fn memory_store_rejects_size_mismatch_and_missing() {
        let store = MemBlobStore::new();
        store.insert("b", "k", Bytes::from_static(b"BODY"));

        let mut short = vec![0u8; 2];
        assert!(store.download("b", "k", &mut short, &|_| {}).await.is_err());

        let mut buf = vec![0u8; 4];
        assert!(store
            .download("b", "missing", &mut buf, &|_| {})
            .await
            .is_err());
    }

    #[tokio::test]
    async fn upload_failure_injection() {
        let store = MemBlobStore::new();
        store.inject_upload_failures(1);
        let profile = UploadProfile::small(DEFAULT_PART_SIZE);

        assert!(store
            .upload("b", "k", Bytes::from_static(b"x"), &profile)
            .await
            .is_err());
        assert!(store
            .upload("b", "k", Bytes::from_static(b"x"), &profile)
            .await
            .is_ok());
        assert_eq!(store.upload_count(), 1);
    }
}
