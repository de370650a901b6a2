//! Object storage for PDFs, page previews, thumbnails, and crops.
//!
//! Keys are slash-separated paths such as
//! `drawing-previews/{project}/{set}/page_0001.png`.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use aws_sdk_s3::{config::Region, primitives::ByteStream, Client};
use thiserror::Error;

use crate::config::StorageBackend;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Object not found: {0}")]
    NotFound(String),
    #[error("Invalid storage key: {0}")]
    InvalidKey(String),
    #[error("S3 error: {0}")]
    S3(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// S3 object the OCR service can read directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextractLocation {
    pub bucket: String,
    pub key: String,
}

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    async fn get(&self, key: &str) -> StorageResult<Vec<u8>>;

    async fn put(&self, key: &str, data: &[u8], content_type: &str) -> StorageResult<()>;

    async fn exists(&self, key: &str) -> StorageResult<bool>;

    async fn delete(&self, key: &str) -> StorageResult<()>;

    /// Where the OCR service can read `key` without a download, if anywhere.
    fn textract_location(&self, key: &str) -> Option<TextractLocation>;
}

/// Build the configured backend.
pub async fn from_backend(backend: &StorageBackend) -> Arc<dyn ObjectStorage> {
    match backend {
        StorageBackend::Local(root) => Arc::new(LocalStorage::new(root.clone())),
        StorageBackend::S3 {
            bucket,
            region,
            endpoint,
            prefix,
        } => {
            let storage =
                S3Storage::new(bucket, region, endpoint.as_deref(), prefix.as_deref()).await;
            Arc::new(storage)
        }
    }
}

/// Reject absolute keys and keys that escape the storage root.
fn validate_key(key: &str) -> StorageResult<()> {
    let path = Path::new(key);
    let ok = !key.is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if ok {
        Ok(())
    } else {
        Err(StorageError::InvalidKey(key.to_string()))
    }
}

/// Filesystem storage rooted at a directory.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> StorageResult<PathBuf> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl ObjectStorage for LocalStorage {
    async fn get(&self, key: &str) -> StorageResult<Vec<u8>> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, key: &str, data: &[u8], _content_type: &str) -> StorageResult<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, data).await?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        let path = self.path_for(key)?;
        Ok(tokio::fs::try_exists(&path).await?)
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn textract_location(&self, _key: &str) -> Option<TextractLocation> {
        None
    }
}

/// S3 (or S3-compatible) storage. Credentials come from the default AWS
/// provider chain.
pub struct S3Storage {
    client: Client,
    bucket: String,
    prefix: String,
    /// Textract cannot reach custom endpoints such as MinIO.
    direct_ocr: bool,
}

impl S3Storage {
    pub async fn new(
        bucket: &str,
        region: &str,
        endpoint: Option<&str>,
        prefix: Option<&str>,
    ) -> Self {
        let sdk_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(Region::new(region.to_string()))
            .load()
            .await;

        let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config);
        if let Some(endpoint) = endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }

        Self {
            client: Client::from_conf(builder.build()),
            bucket: bucket.to_string(),
            prefix: normalize_prefix(prefix),
            direct_ocr: endpoint.is_none(),
        }
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }
}

/// "a/b" and "/a/b/" both become "a/b/"; empty stays empty.
fn normalize_prefix(prefix: Option<&str>) -> String {
    match prefix.map(|p| p.trim_matches('/')) {
        Some(p) if !p.is_empty() => format!("{}/", p),
        _ => String::new(),
    }
}

#[async_trait]
impl ObjectStorage for S3Storage {
    async fn get(&self, key: &str) -> StorageResult<Vec<u8>> {
        let full_key = self.full_key(key);

        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .send()
            .await
            .map_err(|e| {
                let e = aws_sdk_s3::error::DisplayErrorContext(e).to_string();
                if e.contains("NoSuchKey") {
                    StorageError::NotFound(key.to_string())
                } else {
                    StorageError::S3(e)
                }
            })?;

        let bytes = response
            .body
            .collect()
            .await
            .map_err(|e| StorageError::S3(e.to_string()))?;

        Ok(bytes.to_vec())
    }

    async fn put(&self, key: &str, data: &[u8], content_type: &str) -> StorageResult<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .content_type(content_type)
            .body(ByteStream::from(data.to_vec()))
            .send()
            .await
            .map_err(|e| StorageError::S3(aws_sdk_s3::error::DisplayErrorContext(e).to_string()))?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                let e = aws_sdk_s3::error::DisplayErrorContext(e).to_string();
                if e.contains("NotFound") {
                    Ok(false)
                } else {
                    Err(StorageError::S3(e))
                }
            }
        }
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .send()
            .await
            .map_err(|e| StorageError::S3(aws_sdk_s3::error::DisplayErrorContext(e).to_string()))?;
        Ok(())
    }

    fn textract_location(&self, key: &str) -> Option<TextractLocation> {
        self.direct_ocr.then(|| TextractLocation {
            bucket: self.bucket.clone(),
            key: self.full_key(key),
        })
    }
}

/// Content type for a key, by extension.
pub fn content_type_for(key: &str) -> &'static str {
    match Path::new(key)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("pdf") => "application/pdf",
        Some("json") => "application/json",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_local_roundtrip() {
        let dir = tempdir().unwrap();
        let storage = LocalStorage::new(dir.path().to_path_buf());
        let key = "drawing-previews/1/2/page_0001.png";

        assert!(!storage.exists(key).await.unwrap());
        storage.put(key, b"png", "image/png").await.unwrap();
        assert!(storage.exists(key).await.unwrap());
        assert_eq!(storage.get(key).await.unwrap(), b"png");
        assert!(dir.path().join(key).is_file());

        storage.delete(key).await.unwrap();
        assert!(!storage.exists(key).await.unwrap());
        // deleting twice is fine
        storage.delete(key).await.unwrap();
        assert!(storage.textract_location(key).is_none());
    }

    #[tokio::test]
    async fn test_local_missing_and_invalid_keys() {
        let dir = tempdir().unwrap();
        let storage = LocalStorage::new(dir.path().to_path_buf());

        assert!(matches!(
            storage.get("nope.png").await,
            Err(StorageError::NotFound(_))
        ));
        assert!(matches!(
            storage.put("../escape.png", b"x", "image/png").await,
            Err(StorageError::InvalidKey(_))
        ));
        assert!(matches!(
            storage.get("/etc/passwd").await,
            Err(StorageError::InvalidKey(_))
        ));
        assert!(matches!(storage.get("").await, Err(StorageError::InvalidKey(_))));
    }

    #[test]
    fn test_normalize_prefix() {
        assert_eq!(normalize_prefix(None), "");
        assert_eq!(normalize_prefix(Some("")), "");
        assert_eq!(normalize_prefix(Some("/")), "");
        assert_eq!(normalize_prefix(Some("prod")), "prod/");
        assert_eq!(normalize_prefix(Some("/a/b/")), "a/b/");
    }

    #[test]
    fn test_content_type_for() {
        assert_eq!(content_type_for("a/page_0001.png"), "image/png");
        assert_eq!(content_type_for("a/thumb.JPG"), "image/jpeg");
        assert_eq!(content_type_for("set.pdf"), "application/pdf");
        assert_eq!(content_type_for("blob"), "application/octet-stream");
    }

    #[test]
    fn test_s3_location() {
        let storage = S3Storage {
            client: Client::from_conf(
                aws_sdk_s3::Config::builder()
                    .behavior_version_latest()
                    .build(),
            ),
            bucket: "drawings".into(),
            prefix: "prod/".into(),
            direct_ocr: true,
        };
        assert_eq!(
            storage.textract_location("a.png"),
            Some(TextractLocation {
                bucket: "drawings".into(),
                key: "prod/a.png".into()
            })
        );
    }
}
