//! Embedded cache backend.
//!
//! DashMap-backed implementation of the [`Cache`] port with the same
//! observable behavior as the Redis deployment it stands in for: lazy TTL
//! expiry, glob key listing, lex-ordered sorted sets with atomic
//! range-drain, and expiring named locks.

use super::Cache;
use anyhow::{bail, Result};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::ops::Bound;
use std::time::{Duration, Instant};

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

struct Counter {
    value: u64,
    expires_at: Instant,
}

/// In-process [`Cache`] implementation.
#[derive(Default)]
pub struct MemoryCache {
    entries: DashMap<String, Entry>,
    counters: DashMap<String, Counter>,
    locks: DashMap<String, Instant>,
    sorted_sets: Mutex<HashMap<String, BTreeSet<String>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Parse a Redis-style lex bound into a `Bound` usable with `BTreeSet`.
fn lex_bound(raw: &str, low_side: bool) -> Result<Bound<String>> {
    if (low_side && raw == "-") || (!low_side && raw == "+") {
        return Ok(Bound::Unbounded);
    }
    if let Some(rest) = raw.strip_prefix('(') {
        return Ok(Bound::Excluded(rest.to_string()));
    }
    if let Some(rest) = raw.strip_prefix('[') {
        return Ok(Bound::Included(rest.to_string()));
    }
    bail!("invalid lex bound '{raw}'")
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        if let Some(entry) = self.entries.get(key) {
            if entry.is_expired() {
                drop(entry);
                self.entries.remove(key);
                Ok(None)
            } else {
                Ok(Some(entry.value.clone()))
            }
        } else {
            Ok(None)
        }
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<()> {
        self.entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: ttl.map(|d| Instant::now() + d),
            },
        );
        Ok(())
    }

    async fn incr(&self, key: &str, ttl: Duration) -> Result<u64> {
        let mut counter = self
            .counters
            .entry(key.to_string())
            .or_insert_with(|| Counter {
                value: 0,
                expires_at: Instant::now() + ttl,
            });

        if Instant::now() >= counter.expires_at {
            counter.value = 0;
            counter.expires_at = Instant::now() + ttl;
        }

        counter.value += 1;
        Ok(counter.value)
    }

    async fn list(&self, pattern: &str) -> Result<Vec<String>> {
        let matcher = glob::Pattern::new(pattern)?;

        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| !entry.value().is_expired() && matcher.matches(entry.key()))
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn try_lock(&self, key: &str, hold: Duration) -> Result<bool> {
        let now = Instant::now();

        match self.locks.entry(key.to_string()) {
            MapEntry::Occupied(mut held) => {
                if *held.get() > now {
                    Ok(false)
                } else {
                    // Previous holder expired.
                    held.insert(now + hold);
                    Ok(true)
                }
            }
            MapEntry::Vacant(slot) => {
                slot.insert(now + hold);
                Ok(true)
            }
        }
    }

    async fn unlock(&self, key: &str) -> Result<()> {
        if self.locks.remove(key).is_none() {
            bail!("lock not found: {key}");
        }
        Ok(())
    }

    async fn zadd_lex(&self, list: &str, values: Vec<String>) -> Result<()> {
        let mut sets = self.sorted_sets.lock();
        sets.entry(list.to_string()).or_default().extend(values);
        Ok(())
    }

    async fn zget_and_rem_lex(&self, list: &str, min: &str, max: &str) -> Result<Vec<String>> {
        let low = lex_bound(min, true)?;
        let high = lex_bound(max, false)?;

        let mut sets = self.sorted_sets.lock();
        let Some(set) = sets.get_mut(list) else {
            return Ok(Vec::new());
        };

        let drained: Vec<String> = set.range((low, high)).cloned().collect();
        for member in &drained {
            set.remove(member);
        }
        Ok(drained)
    }
}
