//! Sandbox factory: ownership, lookup, and the global byte quota.

use super::sandbox::{Sandbox, UsageHook};
use crate::error::Error;
use anyhow::{Context, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

/// Files at most this large, and not hinted as compressed, get a memory
/// sandbox. Anything else goes to disk.
pub const MAX_SIZE_FOR_MEMORY: u64 = 1024 * 1024;

struct FactoryState {
    sandboxes: HashMap<String, Arc<Sandbox>>,
    usage: HashMap<String, u64>,
    total: u64,
}

/// Owns every live sandbox and the running byte total. The quota check and
/// the counter updates happen under one write lock, so a rejected write
/// leaves every counter untouched.
pub struct SandboxFactory {
    max_bytes: u64,
    base_dir: PathBuf,
    state: Arc<RwLock<FactoryState>>,
}

impl SandboxFactory {
    pub fn new(max_bytes: u64) -> Self {
        Self::with_base_dir(max_bytes, std::env::temp_dir())
    }

    /// Factory with disk sandboxes rooted under `base_dir` instead of the
    /// system temp directory.
    pub fn with_base_dir(max_bytes: u64, base_dir: PathBuf) -> Self {
        Self {
            max_bytes,
            base_dir,
            state: Arc::new(RwLock::new(FactoryState {
                sandboxes: HashMap::new(),
                usage: HashMap::new(),
                total: 0,
            })),
        }
    }

    /// Acquire a fresh sandbox for a file of the given size. The
    /// `compressed_hint` forces disk backing because extraction can blow a
    /// small download up well past the memory threshold.
    pub fn acquire(&self, filesize: u64, compressed_hint: bool) -> Result<Arc<Sandbox>> {
        let id = Uuid::new_v4().to_string();
        let hook = self.usage_hook(id.clone());

        let sandbox = if filesize <= MAX_SIZE_FOR_MEMORY && !compressed_hint {
            Arc::new(Sandbox::new_memory(id.clone(), hook))
        } else {
            let root = self.base_dir.join(&id);
            Arc::new(
                Sandbox::new_disk(id.clone(), root, hook)
                    .context("failed to create disk sandbox")?,
            )
        };

        let mut state = self.state.write();
        state.sandboxes.insert(id.clone(), sandbox.clone());
        state.usage.insert(id, 0);

        Ok(sandbox)
    }

    /// Look up a live sandbox by its id.
    pub fn get(&self, storage_id: &str) -> Result<Arc<Sandbox>, Error> {
        self.state
            .read()
            .sandboxes
            .get(storage_id)
            .cloned()
            .ok_or_else(|| Error::StorageNotFound(storage_id.to_string()))
    }

    /// Remove the backing tree and release the sandbox's usage in one
    /// atomic step.
    pub fn destroy(&self, storage_id: &str) -> Result<(), Error> {
        let mut state = self.state.write();

        let sandbox = state
            .sandboxes
            .remove(storage_id)
            .ok_or_else(|| Error::StorageNotFound(storage_id.to_string()))?;

        if sandbox.remove_backing().is_err() {
            // The registration is already gone; the worst case is a leaked
            // directory that the next host cleanup sweeps up.
            tracing::warn!(storage_id, "failed to remove sandbox backing");
        }

        let used = state.usage.remove(storage_id).unwrap_or(0);
        state.total = state.total.saturating_sub(used);

        Ok(())
    }

    /// Current global usage in bytes.
    pub fn total_usage(&self) -> u64 {
        self.state.read().total
    }

    /// Usage of a single sandbox, if it is alive.
    pub fn sandbox_usage(&self, storage_id: &str) -> Option<u64> {
        self.state.read().usage.get(storage_id).copied()
    }

    fn usage_hook(&self, storage_id: String) -> UsageHook {
        let state = self.state.clone();
        let max_bytes = self.max_bytes;

        Arc::new(move |nbytes: u64| {
            let mut state = state.write();

            if !state.usage.contains_key(&storage_id) {
                return Err(io::Error::other("storage not found"));
            }
            if state.total + nbytes > max_bytes {
                return Err(io::Error::other("storage quota exceeded"));
            }

            state.total += nbytes;
            *state.usage.get_mut(&storage_id).expect("checked above") += nbytes;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_memory_or_disk_decision() {
        let factory = SandboxFactory::new(1024 * 1024 * 10);

        assert!(factory.acquire(1024, false).unwrap().is_memory());
        assert!(factory
            .acquire(MAX_SIZE_FOR_MEMORY, false)
            .unwrap()
            .is_memory());
        assert!(!factory
            .acquire(MAX_SIZE_FOR_MEMORY + 1, false)
            .unwrap()
            .is_memory());
        assert!(!factory.acquire(1024, true).unwrap().is_memory());
    }

    #[test]
    fn test_usage_accounting_across_sandboxes() {
        let factory = SandboxFactory::new(1024);
        let a = factory.acquire(10, false).unwrap();
        let b = factory.acquire(10, false).unwrap();

        a.create("x").unwrap().write_all(&[0u8; 100]).unwrap();
        b.create("y").unwrap().write_all(&[0u8; 200]).unwrap();

        assert_eq!(factory.total_usage(), 300);
        assert_eq!(factory.sandbox_usage(a.id()), Some(100));
        assert_eq!(factory.sandbox_usage(b.id()), Some(200));

        factory.destroy(a.id()).unwrap();
        assert_eq!(factory.total_usage(), 200);
        assert!(factory.get(a.id()).is_err());
    }

    #[test]
    fn test_write_over_quota_fails_without_mutating_counters() {
        let factory = SandboxFactory::new(150);
        let sandbox = factory.acquire(10, false).unwrap();

        sandbox.create("a").unwrap().write_all(&[0u8; 100]).unwrap();
        assert_eq!(factory.total_usage(), 100);

        let mut writer = sandbox.create("b").unwrap();
        assert!(writer.write_all(&[0u8; 100]).is_err());
        assert_eq!(factory.total_usage(), 100);
        assert_eq!(factory.sandbox_usage(sandbox.id()), Some(100));
    }

    #[test]
    fn test_destroy_unknown_sandbox() {
        let factory = SandboxFactory::new(1024);
        assert!(factory.destroy("nope").is_err());
    }
}
