//! Short-TTL read cache keyed by `(host, path, canonicalized params)`, with
//! path-prefix invalidation on write.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::Rng;

use crate::parser::RouterRow;

const TTL: Duration = Duration::from_secs(5);
/// Probability that a read-through also triggers a prune pass, bounding
/// memory growth from expired entries that are never looked up again.
const PRUNE_PROBABILITY: f64 = 0.05;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct CacheKey {
    host: String,
    path: String,
    params: String,
}

struct Entry {
    rows: Vec<RouterRow>,
    expires_at: Instant,
}

/// A TTL map of cached `print` results.
#[derive(Default)]
pub struct ReadCache {
    entries: Mutex<BTreeMap<CacheKey, Entry>>,
}

impl ReadCache {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    /// Canonicalize a parameter map into a stable string key: sorted by key
    /// name so that insertion order never affects cache hits.
    pub fn canonicalize_params(params: &BTreeMap<String, String>) -> String {
        params
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&")
    }

    /// Look up a cached result. Returns a fresh clone of the cached rows on
    /// a hit that has not yet expired.
    pub fn get(&self, host: &str, path: &str, params: &str) -> Option<Vec<RouterRow>> {
        let key = CacheKey {
            host: host.to_owned(),
            path: path.to_owned(),
            params: params.to_owned(),
        };
        let mut entries = self.entries.lock().unwrap();
        if rand::thread_rng().r#gen::<f64>() < PRUNE_PROBABILITY {
            prune_expired(&mut entries);
        }
        match entries.get(&key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.rows.clone()),
            _ => None,
        }
    }

    /// Insert (or replace) a cache entry with a fresh 5-second TTL.
    pub fn put(&self, host: &str, path: &str, params: &str, rows: Vec<RouterRow>) {
        let key = CacheKey {
            host: host.to_owned(),
            path: path.to_owned(),
            params: params.to_owned(),
        };
        self.entries.lock().unwrap().insert(
            key,
            Entry {
                rows,
                expires_at: Instant::now() + TTL,
            },
        );
    }

    /// Evict every entry whose key begins with `(host, path_prefix)`.
    /// Called after any successful write so that a `print` issued
    /// immediately afterwards never observes stale data.
    pub fn invalidate_prefix(&self, host: &str, path_prefix: &str) {
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|key, _| !(key.host == host && key.path.starts_with(path_prefix)));
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

fn prune_expired(entries: &mut BTreeMap<CacheKey, Entry>) {
    let now = Instant::now();
    entries.retain(|_, entry| entry.expires_at > now);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row() -> RouterRow {
        json!({"id": "*1"}).as_object().unwrap().clone()
    }

    #[test]
    fn hit_returns_a_clone_not_a_reference() {
        let cache = ReadCache::new();
        cache.put("r1", "/ip/address", "", vec![row()]);
        let first = cache.get("r1", "/ip/address", "").unwrap();
        let second = cache.get("r1", "/ip/address", "").unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn write_to_path_evicts_every_entry_with_that_prefix() {
        let cache = ReadCache::new();
        cache.put("r1", "/ip/address", "", vec![row()]);
        cache.put("r1", "/ip/address/settings", "", vec![row()]);
        cache.put("r1", "/ip/route", "", vec![row()]);
        cache.invalidate_prefix("r1", "/ip/address");
        assert!(cache.get("r1", "/ip/address", "").is_none());
        assert!(cache.get("r1", "/ip/address/settings", "").is_none());
        assert!(cache.get("r1", "/ip/route", "").is_some());
    }

    #[test]
    fn entry_expires_after_ttl() {
        let cache = ReadCache::new();
        cache.entries.lock().unwrap().insert(
            CacheKey {
                host: "r1".into(),
                path: "/ip/address".into(),
                params: String::new(),
            },
            Entry {
                rows: vec![row()],
                expires_at: Instant::now() - Duration::from_secs(1),
            },
        );
        assert!(cache.get("r1", "/ip/address", "").is_none());
    }

    #[test]
    fn different_hosts_do_not_collide() {
        let cache = ReadCache::new();
        cache.put("r1", "/ip/address", "", vec![row()]);
        assert!(cache.get("r2", "/ip/address", "").is_none());
    }
}
