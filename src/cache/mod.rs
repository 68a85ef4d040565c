//! Shared cache port.
//!
//! Everything the scanner persists between requests goes through this trait:
//! aggregate and individual results, schedule records, the external-scan
//! wait list, rate-limit counters, and the named locks serializing
//! per-bucket read-modify-write cycles. The embedded [`MemoryCache`] backs
//! tests and single-node runs; a Redis-backed implementation plugs in at the
//! same seam for multi-node deployments.

mod memory;

pub use memory::MemoryCache;

use crate::error::Error;
use anyhow::Result;
use async_trait::async_trait;
use rand::Rng;
use std::time::Duration;

/// Retry budget for [`Cache::lock`]. Exhaustion surfaces as
/// [`Error::LockFailed`] instead of spinning forever.
pub const LOCK_MAX_ATTEMPTS: u32 = 10;

/// Upper bound of the random sleep between lock attempts.
pub const LOCK_MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Key/value cache with TTLs, lexicographic sorted sets, and named
/// distributed locks.
#[async_trait]
pub trait Cache: Send + Sync + 'static {
    /// Fetch a value. `None` when the key is absent or expired.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store a value. `ttl` of `None` means the entry never expires.
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<()>;

    /// Atomically increment a counter, creating it (with `ttl`) at 1 when
    /// absent. Returns the post-increment value.
    async fn incr(&self, key: &str, ttl: Duration) -> Result<u64>;

    /// List keys matching a glob pattern.
    async fn list(&self, pattern: &str) -> Result<Vec<String>>;

    /// Try to take a named lock once. `Ok(false)` means somebody else holds
    /// it. The lock auto-expires after `hold` to survive a crashed holder.
    async fn try_lock(&self, key: &str, hold: Duration) -> Result<bool>;

    /// Release a named lock.
    async fn unlock(&self, key: &str) -> Result<()>;

    /// Add members to a lexicographically sorted set (all with equal score).
    async fn zadd_lex(&self, list: &str, values: Vec<String>) -> Result<()>;

    /// Atomically fetch and remove the members in `[min, max)` of a sorted
    /// set. Bounds use the Redis lex syntax: `-`/`+` for the infinities,
    /// `(`/`[` prefixes for exclusive/inclusive.
    async fn zget_and_rem_lex(&self, list: &str, min: &str, max: &str) -> Result<Vec<String>>;
}

/// Take a named lock, retrying with a random backoff. Gives up after
/// [`LOCK_MAX_ATTEMPTS`] tries so a stuck holder cannot stall the pipeline
/// indefinitely.
pub async fn lock(cache: &dyn Cache, key: &str, hold: Duration) -> Result<(), Error> {
    for attempt in 0..LOCK_MAX_ATTEMPTS {
        match cache.try_lock(key, hold).await {
            Ok(true) => return Ok(()),
            Ok(false) => {}
            Err(err) => {
                tracing::warn!(key, attempt, error = %err, "lock attempt failed");
            }
        }

        if attempt + 1 < LOCK_MAX_ATTEMPTS {
            let backoff = {
                let mut rng = rand::thread_rng();
                Duration::from_millis(rng.gen_range(20..LOCK_MAX_BACKOFF.as_millis() as u64))
            };
            tokio::time::sleep(backoff).await;
        }
    }

    Err(Error::LockFailed {
        key: key.to_string(),
        attempts: LOCK_MAX_ATTEMPTS,
    })
}
