//! HTTP fabric counters

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide fabric counters, updated lock-free from request paths.
#[derive(Debug, Default)]
pub struct HttpMetrics {
    pub retries: AtomicU64,
    pub throttle_waits: AtomicU64,
    pub rate_limited: AtomicU64,
    pub egress_blocks: AtomicU64,
    pub cache_hits: AtomicU64,
    pub coalesced_requests: AtomicU64,
    pub bytes_truncated: AtomicU64,
    pub requests_sent: AtomicU64,
}

impl HttpMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> HttpMetricsSnapshot {
        HttpMetricsSnapshot {
            retries: self.retries.load(Ordering::Relaxed),
            throttle_waits: self.throttle_waits.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            egress_blocks: self.egress_blocks.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            coalesced_requests: self.coalesced_requests.load(Ordering::Relaxed),
            bytes_truncated: self.bytes_truncated.load(Ordering::Relaxed),
            requests_sent: self.requests_sent.load(Ordering::Relaxed),
        }
    }

    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }
}

/// Point-in-time copy of the counters, serializable for `Metrics()`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpMetricsSnapshot {
    pub retries: u64,
    pub throttle_waits: u64,
    pub rate_limited: u64,
    pub egress_blocks: u64,
    pub cache_hits: u64,
    pub coalesced_requests: u64,
    pub bytes_truncated: u64,
    pub requests_sent: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_increments() {
        let metrics = HttpMetrics::new();
        HttpMetrics::inc(&metrics.retries);
        HttpMetrics::inc(&metrics.retries);
        HttpMetrics::add(&metrics.bytes_truncated, 4096);

        let snap = metrics.snapshot();
        assert_eq!(snap.retries, 2);
        assert_eq!(snap.bytes_truncated, 4096);
        assert_eq!(snap.cache_hits, 0);
    }
}
