//! Evidence blob storage.
//!
//! The core depends on an object store with strong per-object consistency and
//! a stable URL scheme. Production uses an S3-compatible bucket; dev and tests
//! use a local directory. Repeated uploads of the same path are
//! last-writer-wins: paths are content-addressed by dedupe hash, so a repeat
//! carries identical bytes.

use async_trait::async_trait;
use std::fmt;
use std::path::PathBuf;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub enum BlobError {
    UploadFailed(String),
}

impl fmt::Display for BlobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlobError::UploadFailed(msg) => write!(f, "blob upload failed: {msg}"),
        }
    }
}

impl std::error::Error for BlobError {}

/// Object-store seam. `put` returns the stored object's URL.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(
        &self,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
        metadata: &[(String, String)],
    ) -> Result<String, BlobError>;

    /// Cheap liveness probe for health endpoints.
    async fn healthy(&self) -> bool;
}

/// Read an env var, trying the primary name first then a fallback.
fn env_or(primary: &str, fallback: &str) -> Option<String> {
    std::env::var(primary)
        .ok()
        .or_else(|| std::env::var(fallback).ok())
}

/// S3-compatible store. Supports both AWS (`AWS_*`) and local MinIO (`S3_*`)
/// naming:
///   - `AWS_ENDPOINT_URL_S3` / `S3_ENDPOINT` (optional, AWS default otherwise)
///   - `AWS_ACCESS_KEY_ID`   / `S3_ACCESS_KEY`
///   - `AWS_SECRET_ACCESS_KEY` / `S3_SECRET_KEY`
///   - `AWS_REGION`          / `S3_REGION`
pub struct S3BlobStore {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3BlobStore {
    pub fn new(client: aws_sdk_s3::Client, bucket: String) -> Self {
        Self { client, bucket }
    }

    pub async fn from_env(bucket: String) -> Self {
        let region = env_or("AWS_REGION", "S3_REGION").unwrap_or_else(|| "us-east-1".to_string());

        let mut loader = aws_config::from_env()
            .region(aws_config::Region::new(region));
        if let Some(endpoint) = env_or("AWS_ENDPOINT_URL_S3", "S3_ENDPOINT") {
            loader = loader.endpoint_url(endpoint);
        }
        let config = loader.load().await;

        Self {
            client: aws_sdk_s3::Client::new(&config),
            bucket,
        }
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn put(
        &self,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
        metadata: &[(String, String)],
    ) -> Result<String, BlobError> {
        let mut req = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(path)
            .content_type(content_type)
            .body(aws_sdk_s3::primitives::ByteStream::from(bytes));

        for (k, v) in metadata {
            req = req.metadata(k, v);
        }

        req.send().await.map_err(|e| {
            warn!(path, error = %e, "S3 put failed");
            BlobError::UploadFailed(e.to_string())
        })?;

        debug!(path, bucket = %self.bucket, "evidence uploaded");
        Ok(format!("s3://{}/{}", self.bucket, path))
    }

    async fn healthy(&self) -> bool {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .is_ok()
    }
}

/// Local-directory store for dev and tests. Side metadata lands in a `.meta`
/// sibling file.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(
        &self,
        path: &str,
        bytes: Vec<u8>,
        _content_type: &str,
        metadata: &[(String, String)],
    ) -> Result<String, BlobError> {
        let full = self.root.join(path);
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| BlobError::UploadFailed(e.to_string()))?;
        }
        tokio::fs::write(&full, bytes)
            .await
            .map_err(|e| BlobError::UploadFailed(e.to_string()))?;

        if !metadata.is_empty() {
            let meta: serde_json::Map<String, serde_json::Value> = metadata
                .iter()
                .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
                .collect();
            let meta_path = full.with_extension("json.meta");
            tokio::fs::write(&meta_path, serde_json::Value::Object(meta).to_string())
                .await
                .map_err(|e| BlobError::UploadFailed(e.to_string()))?;
        }

        Ok(format!("file://{}", full.display()))
    }

    async fn healthy(&self) -> bool {
        tokio::fs::metadata(&self.root).await.is_ok() || tokio::fs::create_dir_all(&self.root).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fs_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());

        let url = store
            .put(
                "evidence/s1/y1/lost_units/abcd1234.json",
                b"{\"ok\":true}".to_vec(),
                "application/json",
                &[("seller-id".to_string(), "s1".to_string())],
            )
            .await
            .unwrap();

        assert!(url.starts_with("file://"));
        let written = dir
            .path()
            .join("evidence/s1/y1/lost_units/abcd1234.json");
        assert_eq!(std::fs::read_to_string(written).unwrap(), "{\"ok\":true}");
        assert!(store.healthy().await);
    }

    #[tokio::test]
    async fn test_fs_store_last_writer_wins() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());

        store
            .put("evidence/a.json", b"one".to_vec(), "application/json", &[])
            .await
            .unwrap();
        store
            .put("evidence/a.json", b"two".to_vec(), "application/json", &[])
            .await
            .unwrap();

        let written = dir.path().join("evidence/a.json");
        assert_eq!(std::fs::read_to_string(written).unwrap(), "two");
    }
}
