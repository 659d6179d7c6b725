//! Deterministic-key response cache and triage-job store.
//!
//! An in-process TTL key-value store. Misses are silent and the cache is
//! strictly an optimisation; nothing in the system fails readiness over
//! it. Expired entries are dropped lazily on read.
//!
//! Key scheme:
//! - `analyze:<12hex>`    — cached analyze responses (digest of request)
//! - `triage:<12hex>`     — time-range digest -> job id
//! - `triage:job:<uuid>`  — job id -> full job JSON

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use opentelemetry::KeyValue;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::model::TimeRange;
use crate::telemetry::metrics;

/// TTL for analyze responses and triage jobs alike.
pub const RESPONSE_TTL: Duration = Duration::from_secs(30 * 60);

const DIGEST_LEN: usize = 12;

struct Entry {
    value: String,
    expires_at: Instant,
}

pub struct Cache {
    entries: RwLock<HashMap<String, Entry>>,
}

impl Cache {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let hit = {
            let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
            match entries.get(key) {
                Some(entry) if entry.expires_at > Instant::now() => Some(entry.value.clone()),
                Some(_) => None, // expired, cleaned up below
                None => {
                    metrics::cache_lookups().add(1, &[KeyValue::new("outcome", "miss")]);
                    return None;
                }
            }
        };

        match hit {
            Some(value) => {
                metrics::cache_lookups().add(1, &[KeyValue::new("outcome", "hit")]);
                Some(value)
            }
            None => {
                let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
                if entries
                    .get(key)
                    .is_some_and(|e| e.expires_at <= Instant::now())
                {
                    entries.remove(key);
                }
                metrics::cache_lookups().add(1, &[KeyValue::new("outcome", "miss")]);
                debug!(key, "cache entry expired");
                None
            }
        }
    }

    pub fn put(&self, key: impl Into<String>, value: String, ttl: Duration) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.insert(
            key.into(),
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// Write several entries under one lock acquisition, so readers never
    /// observe one of the pair without the other.
    pub fn put_many(&self, pairs: Vec<(String, String)>, ttl: Duration) {
        let expires_at = Instant::now() + ttl;
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        for (key, value) in pairs {
            entries.insert(key, Entry { value, expires_at });
        }
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Cache {
    fn default() -> Self {
        Self::new()
    }
}

/// `<prefix>:<first 12 hex chars of SHA-256 over canonical JSON>`.
/// Returns None when the value cannot be serialized; callers skip caching.
pub fn digest_key<T: Serialize>(prefix: &str, value: &T) -> Option<String> {
    let raw = match serde_json::to_vec(value) {
        Ok(raw) => raw,
        Err(e) => {
            debug!(error = %e, "failed to serialize value for cache key");
            return None;
        }
    };
    let digest = Sha256::digest(&raw);
    let hex: String = digest
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<String>()
        .chars()
        .take(DIGEST_LEN)
        .collect();
    Some(format!("{prefix}:{hex}"))
}

pub fn triage_range_key(range: &TimeRange) -> Option<String> {
    digest_key("triage", range)
}

pub fn triage_job_key(job_id: &str) -> String {
    format!("triage:job:{job_id}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn put_get_round_trip() {
        let cache = Cache::new();
        cache.put("k", "v".to_string(), Duration::from_secs(60));
        assert_eq!(cache.get("k"), Some("v".to_string()));
        assert_eq!(cache.get("missing"), None);
    }

    #[test]
    fn entries_expire() {
        let cache = Cache::new();
        cache.put("k", "v".to_string(), Duration::from_millis(0));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.get("k"), None);
        // Expired entry was dropped, not just hidden.
        assert!(cache.is_empty());
    }

    #[test]
    fn put_many_writes_all_pairs() {
        let cache = Cache::new();
        cache.put_many(
            vec![
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), "2".to_string()),
            ],
            Duration::from_secs(60),
        );
        assert_eq!(cache.get("a"), Some("1".to_string()));
        assert_eq!(cache.get("b"), Some("2".to_string()));
    }

    #[test]
    fn digest_keys_are_deterministic_and_short() {
        let range = TimeRange {
            start: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2026, 1, 1, 1, 0, 0).unwrap(),
        };
        let k1 = triage_range_key(&range).unwrap();
        let k2 = triage_range_key(&range).unwrap();
        assert_eq!(k1, k2);
        assert!(k1.starts_with("triage:"));
        assert_eq!(k1.len(), "triage:".len() + 12);

        let other = TimeRange {
            start: range.start,
            end: range.end + chrono::Duration::seconds(1),
        };
        assert_ne!(k1, triage_range_key(&other).unwrap());
    }

    #[test]
    fn job_keys_embed_the_id() {
        assert_eq!(triage_job_key("abc"), "triage:job:abc");
    }
}
