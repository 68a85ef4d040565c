//! Scan request moving through the pipeline stages.

use serde::{Deserialize, Serialize};

/// Bitmask flags attached to a [`ScanRequest`].
///
/// Flags survive stage boundaries, so a filter decision taken early (such as
/// disabling the external scanner for archive contents) is visible to the
/// scan stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanFlags(u8);

impl ScanFlags {
    /// Skip the external scanner for this request. Useful for bulk archives
    /// that would otherwise burn through the request budget.
    pub const DISABLE_EXTERNAL_SCAN: ScanFlags = ScanFlags(1);

    pub fn contains(self, other: ScanFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: ScanFlags) {
        self.0 |= other.0;
    }
}

/// How the result of a scan gets persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultType {
    /// Multiple scan results get merged into the same per-bucket key,
    /// tracked daily and monthly.
    #[default]
    Aggregate,
    /// Each scan is saved under its own scan id. Not part of the daily or
    /// monthly aggregation.
    Individual,
}

/// The unit of work moving through the pipeline.
///
/// `keys[0]` is the primary artifact; later entries name companion files
/// appended during pre-decryption. `storage_id` must reference a live sandbox
/// for every stage after pre-processing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScanRequest {
    pub scan_id: String,
    pub result_type: ResultType,
    pub bucket: String,
    /// Object keys to fetch; the first one is the file being scanned.
    pub keys: Vec<String>,
    /// Object size in the bucket, in bytes.
    pub size: u64,
    /// Storage backend kind; currently only "s3".
    pub storage_type: String,
    /// Handle of the local sandbox owning the downloaded bytes.
    pub storage_id: String,
    /// Acknowledgement handle for queue-ingested requests; empty for
    /// HTTP-origin requests.
    pub message_id: String,
    pub flags: ScanFlags,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_roundtrip() {
        let mut flags = ScanFlags::default();
        assert!(!flags.contains(ScanFlags::DISABLE_EXTERNAL_SCAN));

        flags.insert(ScanFlags::DISABLE_EXTERNAL_SCAN);
        assert!(flags.contains(ScanFlags::DISABLE_EXTERNAL_SCAN));
    }
}
