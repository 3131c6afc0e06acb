//! Response cache
//!
//! TTL-bounded cache for GET/HEAD responses, shared process-wide across
//! scans. Only heuristically safe statuses are stored, `Cache-Control:
//! no-store` is honored, and entries carrying validators (`ETag` /
//! `Last-Modified`) stay usable after expiry through conditional
//! revalidation: the fabric re-issues with `If-None-Match` /
//! `If-Modified-Since` and a `304` refreshes the stored entry.

use bytes::Bytes;
use dashmap::DashMap;
use http::HeaderMap;
use std::time::{Duration, Instant};

/// Statuses eligible for caching
const CACHEABLE_STATUSES: [u16; 5] = [200, 203, 301, 404, 410];

/// Upper bound on stored entries; past it, expired entries are purged
/// and new inserts are skipped rather than evicting live ones.
const MAX_ENTRIES: usize = 2048;

/// A cached response body with its metadata.
#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub truncated: bool,
    stored_at: Instant,
    ttl: Duration,
    etag: Option<String>,
    last_modified: Option<String>,
}

impl CachedResponse {
    fn is_fresh(&self, now: Instant) -> bool {
        now.duration_since(self.stored_at) < self.ttl
    }

    fn has_validators(&self) -> bool {
        self.etag.is_some() || self.last_modified.is_some()
    }
}

/// Result of a cache probe.
#[derive(Debug)]
pub enum CacheLookup {
    /// Entry is within TTL; serve it without touching the wire.
    Fresh(CachedResponse),
    /// Entry expired but can be revalidated conditionally.
    Stale {
        etag: Option<String>,
        last_modified: Option<String>,
    },
    Miss,
}

/// Process-wide response cache keyed by method + URL.
pub struct ResponseCache {
    entries: DashMap<String, CachedResponse>,
    default_ttl: Duration,
}

impl ResponseCache {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            default_ttl,
        }
    }

    /// Probe the cache. Expired entries without validators are evicted.
    pub fn lookup(&self, key: &str) -> CacheLookup {
        let now = Instant::now();
        let stale = match self.entries.get(key) {
            None => return CacheLookup::Miss,
            Some(entry) => {
                if entry.is_fresh(now) {
                    return CacheLookup::Fresh(entry.clone());
                }
                if entry.has_validators() {
                    return CacheLookup::Stale {
                        etag: entry.etag.clone(),
                        last_modified: entry.last_modified.clone(),
                    };
                }
                true
            }
        };
        if stale {
            self.entries.remove(key);
        }
        CacheLookup::Miss
    }

    /// Store a response if it is cacheable.
    pub fn store(&self, key: &str, status: u16, headers: &HeaderMap, body: Bytes, truncated: bool) {
        if !CACHEABLE_STATUSES.contains(&status) || has_no_store(headers) {
            return;
        }
        if self.entries.len() >= MAX_ENTRIES {
            self.purge_expired();
            if self.entries.len() >= MAX_ENTRIES {
                return;
            }
        }

        let entry = CachedResponse {
            status,
            headers: headers.clone(),
            body,
            truncated,
            stored_at: Instant::now(),
            ttl: self.default_ttl,
            etag: header_string(headers, http::header::ETAG),
            last_modified: header_string(headers, http::header::LAST_MODIFIED),
        };
        self.entries.insert(key.to_string(), entry);
    }

    /// Revalidation succeeded (304): restart the entry's TTL and return it.
    pub fn refresh(&self, key: &str) -> Option<CachedResponse> {
        let mut entry = self.entries.get_mut(key)?;
        entry.stored_at = Instant::now();
        Some(entry.clone())
    }

    /// Drop everything (engine shutdown).
    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn purge_expired(&self) {
        let now = Instant::now();
        self.entries
            .retain(|_, entry| entry.is_fresh(now) || entry.has_validators());
    }
}

fn has_no_store(headers: &HeaderMap) -> bool {
    headers
        .get_all(http::header::CACHE_CONTROL)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.to_ascii_lowercase().contains("no-store"))
}

fn header_string(headers: &HeaderMap, name: http::header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(
                http::header::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                value.parse().unwrap(),
            );
        }
        map
    }

    #[test]
    fn test_store_and_fresh_lookup() {
        let cache = ResponseCache::new(Duration::from_secs(120));
        cache.store("GET a", 200, &HeaderMap::new(), Bytes::from("body"), false);

        match cache.lookup("GET a") {
            CacheLookup::Fresh(entry) => {
                assert_eq!(entry.status, 200);
                assert_eq!(entry.body, Bytes::from("body"));
            }
            other => panic!("expected fresh, got {:?}", other),
        }
    }

    #[test]
    fn test_uncacheable_status_skipped() {
        let cache = ResponseCache::new(Duration::from_secs(120));
        for status in [204, 302, 400, 403, 500, 503] {
            cache.store("GET a", status, &HeaderMap::new(), Bytes::new(), false);
            assert!(matches!(cache.lookup("GET a"), CacheLookup::Miss));
        }
    }

    #[test]
    fn test_cacheable_statuses() {
        let cache = ResponseCache::new(Duration::from_secs(120));
        for status in CACHEABLE_STATUSES {
            let key = format!("GET {}", status);
            cache.store(&key, status, &HeaderMap::new(), Bytes::new(), false);
            assert!(matches!(cache.lookup(&key), CacheLookup::Fresh(_)));
        }
    }

    #[test]
    fn test_no_store_honored() {
        let cache = ResponseCache::new(Duration::from_secs(120));
        let h = headers(&[("cache-control", "private, NO-STORE")]);
        cache.store("GET a", 200, &h, Bytes::new(), false);
        assert!(matches!(cache.lookup("GET a"), CacheLookup::Miss));
    }

    #[test]
    fn test_expired_without_validators_is_miss() {
        let cache = ResponseCache::new(Duration::from_millis(0));
        cache.store("GET a", 200, &HeaderMap::new(), Bytes::new(), false);
        assert!(matches!(cache.lookup("GET a"), CacheLookup::Miss));
        // Evicted
        assert!(cache.is_empty());
    }

    #[test]
    fn test_expired_with_etag_is_stale() {
        let cache = ResponseCache::new(Duration::from_millis(0));
        let h = headers(&[("etag", "\"abc\"")]);
        cache.store("GET a", 200, &h, Bytes::from("x"), false);

        match cache.lookup("GET a") {
            CacheLookup::Stale { etag, .. } => assert_eq!(etag.as_deref(), Some("\"abc\"")),
            other => panic!("expected stale, got {:?}", other),
        }
    }

    #[test]
    fn test_refresh_restores_freshness() {
        let cache = ResponseCache::new(Duration::from_millis(50));
        let h = headers(&[("last-modified", "Wed, 01 Jan 2025 00:00:00 GMT")]);
        cache.store("GET a", 200, &h, Bytes::from("x"), false);
        std::thread::sleep(Duration::from_millis(60));
        assert!(matches!(cache.lookup("GET a"), CacheLookup::Stale { .. }));

        let entry = cache.refresh("GET a").unwrap();
        assert_eq!(entry.body, Bytes::from("x"));
        assert!(matches!(cache.lookup("GET a"), CacheLookup::Fresh(_)));
    }

    #[test]
    fn test_truncated_flag_preserved() {
        let cache = ResponseCache::new(Duration::from_secs(120));
        cache.store("GET a", 200, &HeaderMap::new(), Bytes::from("partial"), true);
        match cache.lookup("GET a") {
            CacheLookup::Fresh(entry) => assert!(entry.truncated),
            other => panic!("expected fresh, got {:?}", other),
        }
    }
}
