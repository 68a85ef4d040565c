//! Scan results and their merge law.

use super::ResultType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Placeholder used when a result carries no bucket name, so merged output
/// stays readable in responses and viewer messages.
pub const NO_BUCKET: &str = "no bucket specified";

/// Outcome of scanning one request, or the accumulated outcome of a bucket
/// over a day.
///
/// Numeric fields merge additively; `entropy` merges key-wise over the fixed
/// "0".."8" domain; `last_update` takes the max; `bucket` takes the first
/// non-empty name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanResult {
    #[serde(default)]
    pub scan_id: String,
    #[serde(default)]
    pub result_type: ResultType,
    #[serde(default)]
    pub bucket: String,
    pub scanned: i64,
    pub bypassed: i64,
    pub matches: i64,
    pub errors: i64,
    pub requests: i64,
    pub entropy: HashMap<String, i64>,
    pub last_update: DateTime<Utc>,
}

impl Default for ScanResult {
    fn default() -> Self {
        Self {
            scan_id: String::new(),
            result_type: ResultType::Aggregate,
            bucket: String::new(),
            scanned: 0,
            bypassed: 0,
            matches: 0,
            errors: 0,
            requests: 0,
            entropy: HashMap::new(),
            last_update: Utc::now(),
        }
    }
}

impl ScanResult {
    /// Zeroed result for a bucket with the full nine-key entropy domain.
    pub fn new(bucket: &str) -> Self {
        Self {
            bucket: bucket.to_string(),
            entropy: generate_entropy_buckets(&[0; 9]),
            ..Self::default()
        }
    }

    /// Merge two results according to the merge law. Commutative and
    /// associative on all counted fields.
    pub fn merge(a: &ScanResult, b: &ScanResult) -> ScanResult {
        let bucket = if !a.bucket.is_empty() {
            a.bucket.clone()
        } else if !b.bucket.is_empty() {
            b.bucket.clone()
        } else {
            NO_BUCKET.to_string()
        };

        ScanResult {
            scan_id: a.scan_id.clone(),
            result_type: a.result_type,
            bucket,
            scanned: a.scanned + b.scanned,
            bypassed: a.bypassed + b.bypassed,
            matches: a.matches + b.matches,
            errors: a.errors + b.errors,
            requests: a.requests + b.requests,
            entropy: merge_entropy(&a.entropy, &b.entropy),
            last_update: a.last_update.max(b.last_update),
        }
    }
}

/// Build the fixed entropy map "0".."8" from per-bucket counts.
pub fn generate_entropy_buckets(frequencies: &[i64; 9]) -> HashMap<String, i64> {
    (0..=8)
        .map(|i| (i.to_string(), frequencies[i as usize]))
        .collect()
}

/// Key-wise additive merge over the fixed entropy domain. An empty or partial
/// side is treated as all-zeros for its missing keys.
pub fn merge_entropy(
    a: &HashMap<String, i64>,
    b: &HashMap<String, i64>,
) -> HashMap<String, i64> {
    let mut merged = generate_entropy_buckets(&[0; 9]);
    for (key, value) in merged.iter_mut() {
        *value = a.get(key).copied().unwrap_or(0) + b.get(key).copied().unwrap_or(0);
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample(bucket: &str, scanned: i64, entropy_bucket: usize) -> ScanResult {
        let mut frequencies = [0i64; 9];
        frequencies[entropy_bucket] = 1;
        ScanResult {
            bucket: bucket.to_string(),
            scanned,
            bypassed: 1,
            matches: 2,
            errors: 3,
            requests: 1,
            entropy: generate_entropy_buckets(&frequencies),
            last_update: Utc.with_ymd_and_hms(2024, 3, 5, 12, 0, 0).unwrap(),
            ..ScanResult::default()
        }
    }

    #[test]
    fn test_merge_is_commutative() {
        let a = sample("a", 1, 3);
        let b = sample("a", 2, 5);

        let ab = ScanResult::merge(&a, &b);
        let ba = ScanResult::merge(&b, &a);

        assert_eq!(ab.scanned, ba.scanned);
        assert_eq!(ab.entropy, ba.entropy);
        assert_eq!(ab.last_update, ba.last_update);
    }

    #[test]
    fn test_merge_is_associative() {
        let a = sample("a", 1, 0);
        let b = sample("a", 2, 4);
        let c = sample("a", 4, 8);

        let left = ScanResult::merge(&ScanResult::merge(&a, &b), &c);
        let right = ScanResult::merge(&a, &ScanResult::merge(&b, &c));

        assert_eq!(left.scanned, right.scanned);
        assert_eq!(left.entropy, right.entropy);
    }

    #[test]
    fn test_merge_takes_first_non_empty_bucket() {
        let empty = ScanResult::default();
        let named = sample("bucket-a", 1, 1);

        assert_eq!(ScanResult::merge(&empty, &named).bucket, "bucket-a");
        assert_eq!(ScanResult::merge(&named, &empty).bucket, "bucket-a");
        assert_eq!(ScanResult::merge(&empty, &empty.clone()).bucket, NO_BUCKET);
    }

    #[test]
    fn test_merge_takes_max_date() {
        let mut a = sample("a", 0, 0);
        let mut b = sample("a", 0, 0);
        a.last_update = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        b.last_update = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();

        assert_eq!(ScanResult::merge(&a, &b).last_update, b.last_update);
    }

    #[test]
    fn test_entropy_domain_is_always_complete() {
        let merged = merge_entropy(&HashMap::new(), &HashMap::new());
        assert_eq!(merged.len(), 9);
        for i in 0..=8 {
            assert_eq!(merged.get(&i.to_string()), Some(&0));
        }
    }

    #[test]
    fn test_entropy_merge_is_additive() {
        let a = generate_entropy_buckets(&[1, 0, 0, 0, 0, 2, 0, 0, 1]);
        let b = generate_entropy_buckets(&[0, 1, 0, 0, 0, 3, 0, 0, 1]);

        let merged = merge_entropy(&a, &b);
        assert_eq!(merged["0"], 1);
        assert_eq!(merged["1"], 1);
        assert_eq!(merged["5"], 5);
        assert_eq!(merged["8"], 2);
    }
}
