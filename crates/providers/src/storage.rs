//! Object storage port.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;

#[derive(Debug, Clone, thiserror::Error)]
pub enum StorageError {
    #[error("upload failed: {0}")]
    Upload(String),
    #[error("object store unavailable: {0}")]
    Unavailable(String),
}

/// Key/value object storage returning public URLs.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `bytes` under `key`, returning the public URL.
    async fn put(&self, key: &str, bytes: Bytes, content_type: &str)
        -> Result<String, StorageError>;

    /// Probe the backing bucket. Implementations cache a successful probe
    /// for the life of the process.
    async fn bucket_exists(&self) -> Result<bool, StorageError>;
}

/// In-memory store for dev/test.
pub struct InMemoryObjectStore {
    public_base_url: String,
    objects: Mutex<HashMap<String, (Bytes, String)>>,
}

impl InMemoryObjectStore {
    pub fn new(public_base_url: impl Into<String>) -> Self {
        Self {
            public_base_url: public_base_url.into(),
            objects: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.objects.lock().unwrap().get(key).map(|(b, _)| b.clone())
    }

    pub fn len(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.lock().unwrap().is_empty()
    }
}

impl Default for InMemoryObjectStore {
    fn default() -> Self {
        Self::new("http://localhost:9000/storyforge")
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn put(
        &self,
        key: &str,
        bytes: Bytes,
        content_type: &str,
    ) -> Result<String, StorageError> {
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), (bytes, content_type.to_string()));
        Ok(format!("{}/{key}", self.public_base_url))
    }

    async fn bucket_exists(&self) -> Result<bool, StorageError> {
        Ok(true)
    }
}

/// S3-compatible gateway adapter speaking plain HTTP PUT/HEAD, for MinIO-style
/// endpoints where the request tier holds the credentials.
pub struct HttpObjectStore {
    http: reqwest::Client,
    endpoint: String,
    bucket: String,
    public_base_url: String,
    bucket_verified: AtomicBool,
}

impl HttpObjectStore {
    pub fn new(
        endpoint: impl Into<String>,
        bucket: impl Into<String>,
        public_base_url: impl Into<String>,
        timeout: std::time::Duration,
    ) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .expect("reqwest client"),
            endpoint: endpoint.into(),
            bucket: bucket.into(),
            public_base_url: public_base_url.into(),
            bucket_verified: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn put(
        &self,
        key: &str,
        bytes: Bytes,
        content_type: &str,
    ) -> Result<String, StorageError> {
        let response = self
            .http
            .put(format!("{}/{}/{key}", self.endpoint, self.bucket))
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(bytes)
            .send()
            .await
            .map_err(|e| StorageError::Upload(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(StorageError::Upload(format!("status {status}")));
        }
        Ok(format!("{}/{key}", self.public_base_url))
    }

    async fn bucket_exists(&self) -> Result<bool, StorageError> {
        if self.bucket_verified.load(Ordering::Relaxed) {
            return Ok(true);
        }
        let response = self
            .http
            .head(format!("{}/{}", self.endpoint, self.bucket))
            .send()
            .await
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;

        let exists = response.status().is_success();
        if exists {
            self.bucket_verified.store(true, Ordering::Relaxed);
        }
        Ok(exists)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_returns_public_url_and_stores_bytes() {
        let store = InMemoryObjectStore::new("http://cdn.test/bucket");
        let url = store
            .put("books/b1/cover.png", Bytes::from_static(b"png"), "image/png")
            .await
            .unwrap();
        assert_eq!(url, "http://cdn.test/bucket/books/b1/cover.png");
        assert_eq!(store.get("books/b1/cover.png").unwrap(), Bytes::from_static(b"png"));
    }
}
