//! S3 blob backend.
//!
//! Bodies under the profile's part size go through a single `PutObject`;
//! larger bodies use multipart upload with the profile's part concurrency.
//! Every request is bounded by the configured service timeout.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use bytes::Bytes;
use tokio::sync::Semaphore;
use tokio::time::timeout;

use crate::blob::{BlobStore, UploadProfile};

pub struct S3BlobStore {
    client: Client,
    service_timeout: Duration,
}

impl S3BlobStore {
    /// Build a client from the ambient AWS environment. `CINDER_S3_ENDPOINT`
    /// overrides the endpoint for S3-compatible stores.
    pub async fn connect(service_timeout: Duration) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Ok(endpoint) = std::env::var("CINDER_S3_ENDPOINT") {
            loader = loader.endpoint_url(endpoint);
        }
        let config = loader.load().await;
        Self {
            client: Client::new(&config),
            service_timeout,
        }
    }

    async fn put_single(&self, bucket: &str, key: &str, body: Bytes) -> anyhow::Result<()> {
        let request = self
            .client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(body));
        timeout(self.service_timeout, request.send())
            .await
            .map_err(|_| anyhow!("put {key} timed out"))?
            .with_context(|| format!("put {key}"))?;
        Ok(())
    }

    async fn put_multipart(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        profile: &UploadProfile,
    ) -> anyhow::Result<()> {
        let create = timeout(
            self.service_timeout,
            self.client
                .create_multipart_upload()
                .bucket(bucket)
                .key(key)
                .send(),
        )
        .await
        .map_err(|_| anyhow!("create multipart {key} timed out"))?
        .with_context(|| format!("create multipart {key}"))?;
        let upload_id = create
            .upload_id()
            .ok_or_else(|| anyhow!("missing upload id for {key}"))?
            .to_string();

        let semaphore = Arc::new(Semaphore::new(profile.concurrency));
        let mut parts = Vec::new();
        let mut offset = 0usize;
        let mut part_number = 1i32;
        while offset < body.len() {
            let end = (offset + profile.part_size).min(body.len());
            let part = body.slice(offset..end);
            let client = self.client.clone();
            let bucket = bucket.to_string();
            let key = key.to_string();
            let upload_id = upload_id.clone();
            let semaphore = semaphore.clone();
            let service_timeout = self.service_timeout;
            parts.push(async move {
                let _permit = semaphore
                    .acquire()
                    .await
                    .map_err(|_| anyhow!("upload semaphore closed"))?;
                let response = timeout(
                    service_timeout,
                    client
                        .upload_part()
                        .bucket(&bucket)
                        .key(&key)
                        .upload_id(&upload_id)
                        .part_number(part_number)
                        .body(ByteStream::from(part))
                        .send(),
                )
                .await
                .map_err(|_| anyhow!("upload part {part_number} of {key} timed out"))?
                .with_context(|| format!("upload part {part_number} of {key}"))?;
                Ok::<_, anyhow::Error>((part_number, response.e_tag().map(str::to_string)))
            });
            offset = end;
            part_number += 1;
        }

        let uploaded = match futures_util::future::try_join_all(parts).await {
            Ok(uploaded) => uploaded,
            Err(err) => {
                let abort = self
                    .client
                    .abort_multipart_upload()
                    .bucket(bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send();
                if let Err(abort_err) = timeout(self.service_timeout, abort).await {
                    tracing::warn!(key, error = ?abort_err, "abort multipart upload timed out");
                }
                return Err(err);
            }
        };

        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(
                uploaded
                    .into_iter()
                    .map(|(number, e_tag)| {
                        CompletedPart::builder()
                            .part_number(number)
                            .set_e_tag(e_tag)
                            .build()
                    })
                    .collect(),
            ))
            .build();
        timeout(
            self.service_timeout,
            self.client
                .complete_multipart_upload()
                .bucket(bucket)
                .key(key)
                .upload_id(&upload_id)
                .multipart_upload(completed)
                .send(),
        )
        .await
        .map_err(|_| anyhow!("complete multipart {key} timed out"))?
        .with_context(|| format!("complete multipart {key}"))?;
        Ok(())
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn upload(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        profile: &UploadProfile,
    ) -> anyhow::Result<()> {
        if body.len() < profile.part_size {
            self.put_single(bucket, key, body).await
        } else {
            self.put_multipart(bucket, key, body, profile).await
        }
    }

    async fn download(
        &self,
        bucket: &str,
        key: &str,
        buf: &mut [u8],
        progress: &(dyn Fn(u64) + Send + Sync),
    ) -> anyhow::Result<u64> {
        let response = timeout(
            self.service_timeout,
            self.client.get_object().bucket(bucket).key(key).send(),
        )
        .await
        .map_err(|_| anyhow!("get {key} timed out"))?
        .with_context(|| format!("get {key}"))?;

        let mut body = response.body;
        let mut offset = 0usize;
        loop {
            let part = timeout(self.service_timeout, body.try_next())
                .await
                .map_err(|_| anyhow!("read {key} timed out"))?
                .with_context(|| format!("read {key}"))?;
            let Some(part) = part else {
                break;
            };
            anyhow::ensure!(
                offset + part.len() <= buf.len(),
                "object larger than declared size for {key}"
            );
            buf[offset..offset + part.len()].copy_from_slice(&part);
            offset += part.len();
            progress(part.len() as u64);
        }
        anyhow::ensure!(
            offset == buf.len(),
            "object shorter than declared size for {key}: {offset} != {}",
            buf.len()
        );
        Ok(offset as u64)
    }
}
