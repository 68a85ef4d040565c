//! Object-store port.
//!
//! The pipeline only needs three operations against the bucket provider:
//! fetch a whole object, fetch its leading bytes, and store an object (the
//! schedule service copies user submissions into the internal bucket). The
//! cloud SDK wrapper implementing this against S3 lives outside this crate;
//! the in-memory backend below backs tests and embedded runs.

use anyhow::{bail, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;

/// Remote object storage as seen by the scanner core.
#[async_trait]
pub trait RemoteStorage: Send + Sync + 'static {
    /// Fetch a whole object.
    async fn fetch(&self, bucket: &str, key: &str) -> Result<Vec<u8>>;

    /// Fetch at most `limit` leading bytes of an object.
    async fn fetch_header(&self, bucket: &str, key: &str, limit: u64) -> Result<Vec<u8>>;

    /// Store an object, overwriting any previous content.
    async fn store(&self, bucket: &str, key: &str, data: Vec<u8>) -> Result<()>;
}

/// Resolves a backend by storage type. Requests currently carry "s3" only,
/// but the indirection keeps the pipeline ignorant of providers.
pub struct RemoteStorageFactory {
    backends: HashMap<String, Arc<dyn RemoteStorage>>,
}

impl RemoteStorageFactory {
    pub fn new() -> Self {
        Self {
            backends: HashMap::new(),
        }
    }

    pub fn register(mut self, storage_type: &str, backend: Arc<dyn RemoteStorage>) -> Self {
        self.backends.insert(storage_type.to_string(), backend);
        self
    }

    pub fn get(&self, storage_type: &str) -> Result<Arc<dyn RemoteStorage>> {
        match self.backends.get(storage_type) {
            Some(backend) => Ok(backend.clone()),
            None => bail!("no remote storage registered for type '{storage_type}'"),
        }
    }
}

impl Default for RemoteStorageFactory {
    fn default() -> Self {
        Self::new()
    }
}

/// Callback invoked after a successful store with `(bucket, key, size)`.
pub type StoreHook = Arc<dyn Fn(&str, &str, u64) + Send + Sync>;

/// In-memory object store keyed by `(bucket, key)`.
#[derive(Default)]
pub struct MemoryRemoteStorage {
    objects: DashMap<(String, String), Vec<u8>>,
    store_hook: Option<StoreHook>,
}

impl MemoryRemoteStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a hook observing stores. The embedded wiring uses this to
    /// emulate the bucket notifications a real object store emits.
    pub fn with_store_hook(mut self, hook: StoreHook) -> Self {
        self.store_hook = Some(hook);
        self
    }
}

#[async_trait]
impl RemoteStorage for MemoryRemoteStorage {
    async fn fetch(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        match self
            .objects
            .get(&(bucket.to_string(), key.to_string()))
        {
            Some(entry) => Ok(entry.value().clone()),
            None => bail!("object not found: {bucket}/{key}"),
        }
    }

    async fn fetch_header(&self, bucket: &str, key: &str, limit: u64) -> Result<Vec<u8>> {
        let mut data = self.fetch(bucket, key).await?;
        data.truncate(limit as usize);
        Ok(data)
    }

    async fn store(&self, bucket: &str, key: &str, data: Vec<u8>) -> Result<()> {
        let size = data.len() as u64;
        self.objects
            .insert((bucket.to_string(), key.to_string()), data);

        if let Some(hook) = &self.store_hook {
            hook(bucket, key, size);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_store_fetch_and_header() {
        let storage = MemoryRemoteStorage::new();
        storage
            .store("bucket", "key", b"0123456789".to_vec())
            .await
            .unwrap();

        assert_eq!(storage.fetch("bucket", "key").await.unwrap(), b"0123456789");
        assert_eq!(
            storage.fetch_header("bucket", "key", 4).await.unwrap(),
            b"0123"
        );
        assert!(storage.fetch("bucket", "missing").await.is_err());
    }

    #[tokio::test]
    async fn test_factory_lookup() {
        let factory = RemoteStorageFactory::new()
            .register("s3", Arc::new(MemoryRemoteStorage::new()));

        assert!(factory.get("s3").is_ok());
        assert!(factory.get("gcs").is_err());
    }
}
