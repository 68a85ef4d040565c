//! Fetches request keys from the object store into the sandbox.

use crate::entities::ScanRequest;
use crate::storage::{RemoteStorageFactory, SandboxFactory};
use anyhow::{Context, Result};
use std::io::Write;
use std::sync::Arc;

pub struct DownloadService {
    sandbox_factory: Arc<SandboxFactory>,
    remote_factory: Arc<RemoteStorageFactory>,
}

impl DownloadService {
    pub fn new(
        sandbox_factory: Arc<SandboxFactory>,
        remote_factory: Arc<RemoteStorageFactory>,
    ) -> Self {
        Self {
            sandbox_factory,
            remote_factory,
        }
    }

    /// Download only the leading `header_size` bytes of every key, enough
    /// for magic-byte sniffing without paying for the full object.
    pub async fn download_header(&self, request: &ScanRequest, header_size: u64) -> Result<()> {
        let sandbox = self.sandbox_factory.get(&request.storage_id)?;
        let remote = self.remote_factory.get(&request.storage_type)?;

        for key in &request.keys {
            let data = remote
                .fetch_header(&request.bucket, key, header_size)
                .await
                .with_context(|| format!("failed to fetch header of {}/{key}", request.bucket))?;

            let mut file = sandbox
                .create(key)
                .with_context(|| format!("failed to create local file for {key}"))?;
            file.write_all(&data)
                .with_context(|| format!("failed to write header of {key}"))?;
        }

        Ok(())
    }

    /// Download every key of the request in full.
    pub async fn download_files(&self, request: &ScanRequest) -> Result<()> {
        let sandbox = self.sandbox_factory.get(&request.storage_id)?;
        let remote = self.remote_factory.get(&request.storage_type)?;

        for key in &request.keys {
            let data = remote
                .fetch(&request.bucket, key)
                .await
                .with_context(|| format!("failed to fetch {}/{key}", request.bucket))?;

            let mut file = sandbox
                .create(key)
                .with_context(|| format!("failed to create local file for {key}"))?;
            file.write_all(&data)
                .with_context(|| format!("failed to write {key}"))?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryRemoteStorage, RemoteStorage};
    use std::io::Read;

    async fn setup(content: &[u8]) -> (Arc<SandboxFactory>, DownloadService, ScanRequest) {
        let sandbox_factory = Arc::new(SandboxFactory::new(1024 * 1024));
        let remote = Arc::new(MemoryRemoteStorage::new());
        remote
            .store("bucket", "dir/key", content.to_vec())
            .await
            .unwrap();

        let remote_factory =
            Arc::new(RemoteStorageFactory::new().register("s3", remote));
        let service = DownloadService::new(sandbox_factory.clone(), remote_factory);

        let sandbox = sandbox_factory.acquire(0, false).unwrap();
        let request = ScanRequest {
            bucket: "bucket".into(),
            keys: vec!["dir/key".into()],
            storage_type: "s3".into(),
            storage_id: sandbox.id().to_string(),
            ..ScanRequest::default()
        };
        (sandbox_factory, service, request)
    }

    #[tokio::test]
    async fn test_full_download_lands_in_sandbox() {
        let (factory, service, request) = setup(b"file content").await;
        service.download_files(&request).await.unwrap();

        let sandbox = factory.get(&request.storage_id).unwrap();
        let mut data = Vec::new();
        sandbox
            .open("dir/key")
            .unwrap()
            .read_to_end(&mut data)
            .unwrap();
        assert_eq!(data, b"file content");
    }

    #[tokio::test]
    async fn test_header_download_truncates() {
        let (factory, service, request) = setup(&[7u8; 4096]).await;
        service.download_header(&request, 1024).await.unwrap();

        let sandbox = factory.get(&request.storage_id).unwrap();
        assert_eq!(sandbox.size("dir/key").unwrap(), 1024);
    }

    #[tokio::test]
    async fn test_missing_object_is_an_error() {
        let (_, service, mut request) = setup(b"x").await;
        request.keys = vec!["missing".into()];
        assert!(service.download_files(&request).await.is_err());
    }
}
