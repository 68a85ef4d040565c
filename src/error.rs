//! Typed errors for the scanner core.
//!
//! Service code that crosses the HTTP boundary uses these structured errors
//! so controllers can map them to status codes; internal plumbing keeps using
//! `anyhow` with context.

/// Result type for scanner operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Scanner errors with structured context.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Scan id is not a valid UUID.
    #[error("invalid scan id: {0}")]
    InvalidScanId(String),

    /// No schedule record exists for the given id or key.
    #[error("scan id not found: {0}")]
    ScanNotFound(String),

    /// The scan has been accepted but not picked up yet.
    #[error("scan is waiting")]
    ScanWaiting,

    /// The scan is being processed.
    #[error("scan in progress")]
    ScanInProgress,

    /// The scan terminated with an error (including the one-hour timeout).
    #[error("scan failed")]
    ScanFailed,

    /// Schedule record carries a state this version does not know.
    #[error("unknown scan state")]
    UnknownScanState,

    /// Request field missing or malformed.
    #[error("validation error: {0}")]
    Validation(String),

    /// A named distributed lock could not be obtained within the retry budget.
    #[error("failed to acquire lock '{key}' after {attempts} attempts")]
    LockFailed { key: String, attempts: u32 },

    /// Sandbox handle does not reference a live sandbox.
    #[error("storage not found: {0}")]
    StorageNotFound(String),
}

impl Error {
    /// HTTP status code this error maps to at the API boundary.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidScanId(_) | Self::Validation(_) => 400,
            Self::ScanNotFound(_) => 404,
            Self::ScanWaiting | Self::ScanInProgress => 102,
            Self::ScanFailed
            | Self::UnknownScanState
            | Self::LockFailed { .. }
            | Self::StorageNotFound(_) => 500,
        }
    }
}
