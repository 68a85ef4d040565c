//! Pre-process stage: everything between "a key landed" and "the sandbox
//! holds scannable plaintext".
//!
//! Jobs run strictly in order: download, companion-key expansion for
//! encrypted backups, decryption, recursive decompression, and the
//! individual-scan state flip for user-submitted files.

use super::stage::{Handler, OutputWriter};
use super::JobStatus;
use crate::crypto::{self, StreamDecryptor, SALT_HEADER_SIZE};
use crate::entities::{ResultType, ScanFlags, ScanRequest, ScheduleStatus};
use crate::services::{DecompressService, DownloadService, ScheduleService};
use crate::storage::{Sandbox, SandboxFactory};
use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::Regex;
use std::io::{Read, Write};
use std::sync::Arc;

const DECRYPT_BUFFER_SIZE: usize = 1024 * 1024;
const EXTRACT_BUFFER_SIZE: usize = 1024 * 1024;

const ARCHIVE_PATTERN: &str = r"^pgbackrest/(.*?)/archive/.*?/.*";
const BACKUP_PATTERN: &str = r"^pgbackrest/(.*?)/backup/.*/pg_data/.*";
const METADATA_PATTERN: &str = r"^pgbackrest/.*/(archive.info|backup.info|backup.manifest)";

#[async_trait]
pub trait PreprocessJob: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    async fn preprocess(&self, request: &mut ScanRequest) -> JobStatus;
}

fn matches_pattern(pattern: &str, key: &str) -> bool {
    Regex::new(pattern)
        .expect("pattern is a valid regex")
        .captures(key)
        .is_some()
}

/// Full download of every key into the sandbox.
pub struct Downloader {
    download: Arc<DownloadService>,
}

impl Downloader {
    pub fn new(download: Arc<DownloadService>) -> Self {
        Self { download }
    }
}

#[async_trait]
impl PreprocessJob for Downloader {
    fn name(&self) -> &'static str {
        "downloader"
    }

    async fn preprocess(&self, request: &mut ScanRequest) -> JobStatus {
        match self.download.download_files(request).await {
            Ok(()) => JobStatus::NextJob,
            Err(err) => {
                tracing::error!(bucket = %request.bucket, keys = ?request.keys, error = %err,
                    "failed to download request keys");
                JobStatus::Abort
            }
        }
    }
}

/// Recognizes encrypted PostgreSQL backup paths and appends the companion
/// keys the decryption chain needs, so the downloader fetches them too.
/// The metadata files themselves pass through untouched.
pub struct PreDecryption;

impl PreDecryption {
    pub fn new() -> Self {
        Self
    }

    fn additional_keys(key: &str) -> Vec<String> {
        let archive = Regex::new(r"^pgbackrest/(.*?)/.*").expect("valid regex");
        if matches_pattern(ARCHIVE_PATTERN, key) {
            if let Some(captures) = archive.captures(key) {
                let stanza = &captures[1];
                return vec![format!("pgbackrest/{stanza}/archive/{stanza}/archive.info")];
            }
        }

        let backup =
            Regex::new(r"^pgbackrest/(.*?)/backup/.*?/(.*?)/pg_data/.*").expect("valid regex");
        if let Some(captures) = backup.captures(key) {
            let stanza = &captures[1];
            let label = &captures[2];
            return vec![
                format!("pgbackrest/{stanza}/backup/{stanza}/{label}/backup.manifest"),
                format!("pgbackrest/{stanza}/backup/{stanza}/{label}/backup.info"),
            ];
        }

        Vec::new()
    }
}

impl Default for PreDecryption {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PreprocessJob for PreDecryption {
    fn name(&self) -> &'static str {
        "pre-decryption"
    }

    async fn preprocess(&self, request: &mut ScanRequest) -> JobStatus {
        if matches_pattern(METADATA_PATTERN, &request.keys[0]) {
            return JobStatus::NextJob;
        }

        let additional = Self::additional_keys(&request.keys[0]);
        request.keys.extend(additional);
        JobStatus::NextJob
    }
}

/// Executes the decryption chain on downloaded content.
///
/// Archive WAL segments unwrap once: the KEK decrypts `archive.info`, whose
/// `cipher-pass` decrypts the segment. Backup data files unwrap twice
/// through `backup.info` and `backup.manifest`. Afterwards the request
/// carries the single decrypted filename.
pub struct PostDecryption {
    kek: String,
    sandbox_factory: Arc<SandboxFactory>,
}

impl PostDecryption {
    pub fn new(sandbox_factory: Arc<SandboxFactory>, kek: &str) -> Self {
        Self {
            kek: kek.to_string(),
            sandbox_factory,
        }
    }
}

#[async_trait]
impl PreprocessJob for PostDecryption {
    fn name(&self) -> &'static str {
        "post-decryption"
    }

    async fn preprocess(&self, request: &mut ScanRequest) -> JobStatus {
        let storage = match self.sandbox_factory.get(&request.storage_id) {
            Ok(storage) => storage,
            Err(err) => {
                tracing::error!(storage_id = %request.storage_id, error = %err,
                    "failed to get local storage");
                return JobStatus::NextJob;
            }
        };

        let kek = self.kek.clone();
        let keys = request.keys.clone();
        let output = tokio::task::spawn_blocking(move || decrypt_request(&kek, &keys, &storage))
            .await;

        match output {
            Ok(key) => {
                request.keys = vec![key];
                JobStatus::NextJob
            }
            Err(err) => {
                tracing::error!(error = %err, "decryption task failed");
                JobStatus::NextJob
            }
        }
    }
}

fn decrypt_request(kek: &str, keys: &[String], storage: &Sandbox) -> String {
    // Metadata files match the path patterns too but never carry their
    // companion keys; they pass through undecrypted.
    if matches_pattern(ARCHIVE_PATTERN, &keys[0]) && keys.len() >= 2 {
        decrypt_archive(kek, keys, storage)
    } else if matches_pattern(BACKUP_PATTERN, &keys[0]) && keys.len() >= 3 {
        decrypt_backup(kek, keys, storage)
    } else {
        keys[0].clone()
    }
}

fn decrypt_archive(kek: &str, keys: &[String], storage: &Sandbox) -> String {
    let passphrase = extract_password_from_file(kek, &keys[1], storage).unwrap_or_else(|err| {
        tracing::error!(key = %keys[1], error = %err, "cannot extract passphrase");
        String::new()
    });

    match decrypt_end_file(&passphrase, &keys[0], storage) {
        Ok(decrypted) => decrypted,
        Err(err) => {
            tracing::error!(key = %keys[0], error = %err, "cannot decrypt file");
            keys[0].clone()
        }
    }
}

fn decrypt_backup(kek: &str, keys: &[String], storage: &Sandbox) -> String {
    let passphrase = extract_password_from_file(kek, &keys[2], storage).unwrap_or_else(|err| {
        tracing::error!(key = %keys[2], error = %err, "cannot extract passphrase");
        String::new()
    });
    let passphrase =
        extract_password_from_file(&passphrase, &keys[1], storage).unwrap_or_else(|err| {
            tracing::error!(key = %keys[1], error = %err, "cannot extract passphrase");
            String::new()
        });

    match decrypt_end_file(&passphrase, &keys[0], storage) {
        Ok(decrypted) => decrypted,
        Err(err) => {
            tracing::error!(key = %keys[0], error = %err, "cannot decrypt file");
            keys[0].clone()
        }
    }
}

/// Decrypt a small companion file in memory and pull the nested password
/// out of it. The `cipher-pass` pattern is permissive on purpose (it
/// mirrors what the backup tooling writes), so a file carrying the literal
/// pattern in an unexpected place would mis-drive the chain.
fn extract_password_from_file(
    passphrase: &str,
    filename: &str,
    storage: &Sandbox,
) -> Result<String> {
    let mut file = storage
        .open(filename)
        .with_context(|| format!("failed to open {filename}"))?;
    let mut data = Vec::new();
    file.read_to_end(&mut data)
        .with_context(|| format!("failed to read {filename}"))?;

    let cleartext = crypto::decrypt(passphrase, &data)
        .map_err(|err| anyhow::anyhow!("failed to decrypt {filename}: {err}"))?;

    let pattern = Regex::new(r#".*cipher-pass.*="(.*)""#).expect("valid regex");
    let text = String::from_utf8_lossy(&cleartext);
    pattern
        .captures(&text)
        .and_then(|captures| captures.get(1))
        .map(|group| group.as_str().to_string())
        .with_context(|| format!("no cipher-pass entry in {filename}"))
}

/// Stream-decrypt a large file into `decrypted-<name>` inside the same
/// sandbox and return the new name.
fn decrypt_end_file(passphrase: &str, filename: &str, storage: &Sandbox) -> Result<String> {
    let decrypted_name = format!("decrypted-{filename}");

    let mut input = storage
        .open(filename)
        .with_context(|| format!("failed to open encrypted file {filename}"))?;

    let mut header = [0u8; SALT_HEADER_SIZE];
    input
        .read_exact(&mut header)
        .with_context(|| format!("failed to read salt header of {filename}"))?;

    let mut output = storage
        .create(&decrypted_name)
        .with_context(|| format!("failed to create {decrypted_name}"))?;

    let mut decryptor = StreamDecryptor::new(passphrase, &header[8..]);
    let mut buffer = vec![0u8; DECRYPT_BUFFER_SIZE];
    loop {
        let n = input
            .read(&mut buffer)
            .with_context(|| format!("failed to read {filename}"))?;
        if n == 0 {
            break;
        }
        output
            .write_all(&decryptor.update(&buffer[..n]))
            .context("failed to write decrypted block")?;
    }

    let tail = decryptor
        .finish()
        .map_err(|err| anyhow::anyhow!("failed to finish decryption of {filename}: {err}"))?;
    output
        .write_all(&tail)
        .context("failed to write decrypted tail")?;

    Ok(decrypted_name)
}

/// Recursive archive extraction inside the sandbox.
pub struct Decompress {
    service: Arc<DecompressService>,
    sandbox_factory: Arc<SandboxFactory>,
}

impl Decompress {
    pub fn new(service: Arc<DecompressService>, sandbox_factory: Arc<SandboxFactory>) -> Self {
        Self {
            service,
            sandbox_factory,
        }
    }
}

#[async_trait]
impl PreprocessJob for Decompress {
    fn name(&self) -> &'static str {
        "decompress"
    }

    async fn preprocess(&self, request: &mut ScanRequest) -> JobStatus {
        let storage = match self.sandbox_factory.get(&request.storage_id) {
            Ok(storage) => storage,
            Err(_) => return JobStatus::Abort,
        };

        let service = self.service.clone();
        let outcome = tokio::task::spawn_blocking(move || {
            let mut buffer = vec![0u8; EXTRACT_BUFFER_SIZE];
            service.extract(&storage, &mut buffer)
        })
        .await;

        match outcome {
            Ok(Ok(())) => JobStatus::NextJob,
            Ok(Err(err)) => {
                tracing::error!(bucket = %request.bucket, error = %err, "extraction failed");
                JobStatus::Abort
            }
            Err(err) => {
                tracing::error!(error = %err, "extraction task failed");
                JobStatus::Abort
            }
        }
    }
}

/// Flips user-submitted scans to Running and rewrites the request so its
/// result is stored individually under the schedule's scan id.
pub struct IndividualScanUpdate {
    schedule: Arc<ScheduleService>,
}

impl IndividualScanUpdate {
    pub fn new(schedule: Arc<ScheduleService>) -> Self {
        Self { schedule }
    }
}

#[async_trait]
impl PreprocessJob for IndividualScanUpdate {
    fn name(&self) -> &'static str {
        "individual-scan-update"
    }

    async fn preprocess(&self, request: &mut ScanRequest) -> JobStatus {
        if !self.schedule.is_scheduled_scan(&request.bucket) {
            return JobStatus::NextJob;
        }

        let item = match self.schedule.get(&request.keys[0]).await {
            Ok(Some(item)) => item,
            Ok(None) => {
                tracing::error!(keys = ?request.keys, "no schedule record for request");
                return JobStatus::Abort;
            }
            Err(err) => {
                tracing::error!(keys = ?request.keys, error = %err,
                    "failed to get schedule record");
                return JobStatus::Abort;
            }
        };

        if item.status == ScheduleStatus::Error {
            tracing::error!(scan_id = %item.scan_id, "scheduled scan already failed");
            return JobStatus::Abort;
        }

        if let Err(err) = self
            .schedule
            .update(&item.scan_id, ScheduleStatus::Running)
            .await
        {
            tracing::error!(scan_id = %item.scan_id, error = %err,
                "failed to update schedule record");
            return JobStatus::Abort;
        }

        request.scan_id = item.scan_id;
        request.result_type = ResultType::Individual;
        request.flags.insert(ScanFlags::DISABLE_EXTERNAL_SCAN);

        JobStatus::NextJob
    }
}

/// Runs the pre-process jobs in order.
pub struct PreprocessHandler {
    jobs: Vec<Arc<dyn PreprocessJob>>,
}

impl PreprocessHandler {
    pub fn new(jobs: Vec<Arc<dyn PreprocessJob>>) -> Self {
        Self { jobs }
    }
}

#[async_trait]
impl Handler<ScanRequest, ScanRequest> for PreprocessHandler {
    fn name(&self) -> String {
        let jobs: Vec<&str> = self.jobs.iter().map(|job| job.name()).collect();
        format!("preprocess handler with jobs: {}", jobs.join(", "))
    }

    async fn handle(
        &self,
        request: &mut ScanRequest,
        out: &OutputWriter<ScanRequest>,
    ) -> anyhow::Result<()> {
        for job in &self.jobs {
            tracing::debug!(job = job.name(), "running job");
            match job.preprocess(request).await {
                JobStatus::NextJob => {}
                JobStatus::NextStage => {
                    out.write(request.clone()).await;
                    return Ok(());
                }
                JobStatus::Abort => anyhow::bail!("preprocess error"),
            }
        }

        out.write(request.clone()).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SandboxFactory;

    #[tokio::test]
    async fn test_pre_decryption_expands_archive_keys() {
        let mut request = ScanRequest {
            keys: vec!["pgbackrest/pg-app/archive/pg-app/11-1/segment.backup".into()],
            ..ScanRequest::default()
        };

        let status = PreDecryption::new().preprocess(&mut request).await;
        assert_eq!(status, JobStatus::NextJob);
        assert_eq!(request.keys.len(), 2);
        assert_eq!(
            request.keys[1],
            "pgbackrest/pg-app/archive/pg-app/archive.info"
        );
    }

    #[tokio::test]
    async fn test_pre_decryption_expands_backup_keys() {
        let mut request = ScanRequest {
            keys: vec![
                "pgbackrest/pg-app/backup/pg-app/20220319-025518F/pg_data/base.lz4".into(),
            ],
            ..ScanRequest::default()
        };

        PreDecryption::new().preprocess(&mut request).await;
        assert_eq!(
            request.keys,
            vec![
                "pgbackrest/pg-app/backup/pg-app/20220319-025518F/pg_data/base.lz4".to_string(),
                "pgbackrest/pg-app/backup/pg-app/20220319-025518F/backup.manifest".to_string(),
                "pgbackrest/pg-app/backup/pg-app/20220319-025518F/backup.info".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_pre_decryption_passes_metadata_through() {
        for key in [
            "pgbackrest/pg-app/archive/pg-app/archive.info",
            "pgbackrest/pg-app/backup/pg-app/20220319-025518F/backup.info",
            "pgbackrest/pg-app/backup/pg-app/20220319-025518F/backup.manifest",
        ] {
            let mut request = ScanRequest {
                keys: vec![key.into()],
                ..ScanRequest::default()
            };
            PreDecryption::new().preprocess(&mut request).await;
            assert_eq!(request.keys.len(), 1, "key {key} should pass through");
        }
    }

    #[tokio::test]
    async fn test_pre_decryption_ignores_ordinary_keys() {
        let mut request = ScanRequest {
            keys: vec!["backups/ordinary.tar.gz".into()],
            ..ScanRequest::default()
        };
        PreDecryption::new().preprocess(&mut request).await;
        assert_eq!(request.keys.len(), 1);
    }

    fn write_sandbox_file(sandbox: &Sandbox, path: &str, data: &[u8]) {
        let mut writer = sandbox.create(path).unwrap();
        writer.write_all(data).unwrap();
    }

    fn read_sandbox_file(sandbox: &Sandbox, path: &str) -> Vec<u8> {
        let mut data = Vec::new();
        sandbox.open(path).unwrap().read_to_end(&mut data).unwrap();
        data
    }

    #[tokio::test]
    async fn test_post_decryption_archive_chain() {
        let factory = Arc::new(SandboxFactory::new(64 * 1024 * 1024));
        let sandbox = factory.acquire(0, false).unwrap();

        // archive.info carries the inner password, wrapped with the KEK.
        let info = crypto::encrypt(
            "the-kek",
            b"saltinfo",
            br#"[cipher] cipher-pass="inner-password""#,
        );
        write_sandbox_file(&sandbox, "archive.info", &info);

        let data_key = "pgbackrest/pg-app/archive/pg-app/segment";
        let payload = b"cleartext segment content".repeat(100);
        let encrypted = crypto::encrypt("inner-password", b"saltdata", &payload);
        write_sandbox_file(&sandbox, data_key, &encrypted);

        let mut request = ScanRequest {
            keys: vec![data_key.into(), "archive.info".into()],
            storage_id: sandbox.id().to_string(),
            ..ScanRequest::default()
        };

        let job = PostDecryption::new(factory.clone(), "the-kek");
        let status = job.preprocess(&mut request).await;
        assert_eq!(status, JobStatus::NextJob);
        assert_eq!(request.keys, vec![format!("decrypted-{data_key}")]);
        assert_eq!(read_sandbox_file(&sandbox, &request.keys[0]), payload);
    }

    #[tokio::test]
    async fn test_post_decryption_backup_chain() {
        let factory = Arc::new(SandboxFactory::new(64 * 1024 * 1024));
        let sandbox = factory.acquire(0, false).unwrap();

        let info = crypto::encrypt(
            "the-kek",
            b"saltinfo",
            br#"cipher-pass="manifest-password""#,
        );
        write_sandbox_file(&sandbox, "backup.info", &info);

        let manifest = crypto::encrypt(
            "manifest-password",
            b"saltmani",
            br#"cipher-pass="data-password""#,
        );
        write_sandbox_file(&sandbox, "backup.manifest", &manifest);

        let data_key = "pgbackrest/pg-app/backup/pg-app/20220319F/pg_data/base";
        let payload = b"restored table data";
        write_sandbox_file(
            &sandbox,
            data_key,
            &crypto::encrypt("data-password", b"saltdata", payload),
        );

        let mut request = ScanRequest {
            keys: vec![
                data_key.into(),
                "backup.manifest".into(),
                "backup.info".into(),
            ],
            storage_id: sandbox.id().to_string(),
            ..ScanRequest::default()
        };

        let job = PostDecryption::new(factory.clone(), "the-kek");
        job.preprocess(&mut request).await;
        assert_eq!(request.keys, vec![format!("decrypted-{data_key}")]);
        assert_eq!(read_sandbox_file(&sandbox, &request.keys[0]), payload);
    }

    #[tokio::test]
    async fn test_post_decryption_leaves_ordinary_keys_alone() {
        let factory = Arc::new(SandboxFactory::new(1024 * 1024));
        let sandbox = factory.acquire(0, false).unwrap();
        write_sandbox_file(&sandbox, "plain.txt", b"nothing encrypted here");

        let mut request = ScanRequest {
            keys: vec!["plain.txt".into()],
            storage_id: sandbox.id().to_string(),
            ..ScanRequest::default()
        };

        let job = PostDecryption::new(factory, "the-kek");
        let status = job.preprocess(&mut request).await;
        assert_eq!(status, JobStatus::NextJob);
        assert_eq!(request.keys, vec!["plain.txt".to_string()]);
    }
}
