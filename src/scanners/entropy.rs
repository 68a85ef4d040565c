//! Shannon-entropy histogram scanner.
//!
//! High-entropy content (packed binaries, encrypted blobs) clusters in the
//! top buckets; a bucket distribution that shifts over time is the signal
//! the aggregate reports exist for.

use super::{ScanContext, SyncScanner};
use crate::entities::ScanResult;
use anyhow::{Context, Result};
use std::io::Read;

pub struct EntropyScanner;

impl EntropyScanner {
    pub fn new() -> Self {
        Self
    }
}

impl Default for EntropyScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncScanner for EntropyScanner {
    fn name(&self) -> &'static str {
        "entropy"
    }

    fn scan(&self, ctx: &ScanContext, buffer: &mut [u8]) -> Result<ScanResult> {
        let mut result = ScanResult::new("");

        let mut file = ctx
            .storage
            .open(&ctx.filename)
            .with_context(|| format!("failed to open {} for entropy scan", ctx.filename))?;

        let mut byte_counts = [0u64; 256];
        let mut size = 0u64;
        loop {
            let n = file
                .read(buffer)
                .with_context(|| format!("failed to read {}", ctx.filename))?;
            if n == 0 {
                break;
            }
            size += n as u64;
            for &byte in &buffer[..n] {
                byte_counts[byte as usize] += 1;
            }
        }

        let bucket_index = if size == 0 {
            0
        } else {
            let mut entropy = 0.0f64;
            for &count in &byte_counts {
                if count > 0 {
                    let px = count as f64 / size as f64;
                    entropy -= px * px.log2();
                }
            }
            // Rounding can nudge a uniform distribution past 8.0 bits.
            (entropy.ceil() as usize).min(8)
        };

        *result
            .entropy
            .get_mut(&bucket_index.to_string())
            .expect("entropy bucket in 0..=8") += 1;

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::ScanFlags;
    use crate::filetype::FileKind;
    use crate::storage::SandboxFactory;
    use std::io::Write;
    use std::sync::Arc;

    fn context_with(content: &[u8]) -> ScanContext {
        let factory = SandboxFactory::new(16 * 1024 * 1024);
        let sandbox = factory.acquire(0, false).unwrap();
        sandbox.create("file").unwrap().write_all(content).unwrap();

        ScanContext {
            scan_id: String::new(),
            bucket: "bucket".into(),
            key: "file".into(),
            flags: ScanFlags::default(),
            storage: sandbox,
            filename: "file".into(),
            kind: FileKind::Uncompressed,
        }
    }

    fn entropy_bucket_of(content: &[u8]) -> String {
        let ctx = context_with(content);
        let mut buffer = vec![0u8; 1024];
        let result = EntropyScanner::new().scan(&ctx, &mut buffer).unwrap();
        result
            .entropy
            .iter()
            .find(|(_, &count)| count > 0)
            .map(|(key, _)| key.clone())
            .unwrap()
    }

    #[test]
    fn test_empty_file_lands_in_bucket_zero() {
        assert_eq!(entropy_bucket_of(b""), "0");
    }

    #[test]
    fn test_single_symbol_has_zero_entropy() {
        assert_eq!(entropy_bucket_of(&[b'a'; 4096]), "0");
    }

    #[test]
    fn test_uniform_bytes_reach_bucket_eight() {
        let uniform: Vec<u8> = (0..=255u8).cycle().take(256 * 64).collect();
        assert_eq!(entropy_bucket_of(&uniform), "8");
    }

    #[test]
    fn test_english_text_lands_midrange() {
        let text = b"the quick brown fox jumps over the lazy dog and keeps going";
        let bucket: usize = entropy_bucket_of(text).parse().unwrap();
        assert!((4..=5).contains(&bucket), "got bucket {bucket}");
    }

    #[test]
    fn test_sum_of_buckets_is_one_per_scan() {
        let ctx = context_with(b"some file content");
        let mut buffer = vec![0u8; 1024];
        let result = EntropyScanner::new().scan(&ctx, &mut buffer).unwrap();
        let total: i64 = result.entropy.values().sum();
        assert_eq!(total, 1);
    }
}
