//! Per-host request pacing
//!
//! Token-bucket pacer governing outbound request rate per host. Every
//! request acquires a token before it may touch the wire; a host that
//! answers 429/503 gets paused and slowed, and sustained success earns
//! the rate back up to a ceiling.
//!
//! Buckets are created lazily per host and synchronized individually so
//! hot hosts never contend with each other.

use super::metrics::HttpMetrics;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use webscan_core::HttpConfig;

/// Refill floor after repeated throttling, tokens/second
const MIN_REFILL_RPS: f64 = 0.25;

/// Multiplier applied to the refill rate on 429/503
const SLOWDOWN_FACTOR: f64 = 0.5;

/// Multiplier applied after a success streak
const SPEEDUP_FACTOR: f64 = 1.10;

#[derive(Debug)]
struct HostBucket {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    refill_ceiling: f64,
    last_refill: Instant,
    paused_until: Option<Instant>,
    consecutive_successes: u32,
    next_allowed: Instant,
}

impl HostBucket {
    fn new(config: &HttpConfig) -> Self {
        let now = Instant::now();
        Self {
            tokens: config.bucket_max_tokens,
            capacity: config.bucket_max_tokens,
            refill_per_sec: config.per_host_initial_rps,
            refill_ceiling: config.per_host_rps_ceiling,
            last_refill: now,
            paused_until: None,
            consecutive_successes: 0,
            next_allowed: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
            self.last_refill = now;
        }
    }

    /// Take a token if possible; otherwise the duration to wait.
    fn try_take(&mut self, now: Instant, min_interval: Duration) -> Result<(), Duration> {
        if let Some(until) = self.paused_until {
            if now < until {
                return Err(until - now);
            }
            self.paused_until = None;
        }

        if now < self.next_allowed {
            return Err(self.next_allowed - now);
        }

        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            self.next_allowed = now + min_interval;
            Ok(())
        } else {
            let deficit = 1.0 - self.tokens;
            Err(Duration::from_secs_f64(deficit / self.refill_per_sec))
        }
    }
}

/// Per-host token-bucket pacer.
pub struct HostPacer {
    buckets: DashMap<String, Arc<Mutex<HostBucket>>>,
    config: HttpConfig,
    metrics: Arc<HttpMetrics>,
}

impl HostPacer {
    pub fn new(config: HttpConfig, metrics: Arc<HttpMetrics>) -> Self {
        Self {
            buckets: DashMap::new(),
            config,
            metrics,
        }
    }

    fn bucket(&self, host: &str) -> Arc<Mutex<HostBucket>> {
        self.buckets
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(HostBucket::new(&self.config))))
            .clone()
    }

    /// Await a send slot for `host`.
    ///
    /// Returns immediately when a token is available; otherwise sleeps
    /// through pauses and refill gaps. Each wait is counted once in
    /// `throttle_waits`.
    pub async fn acquire(&self, host: &str) {
        let bucket = self.bucket(host);
        let min_interval = Duration::from_millis(self.config.per_host_min_interval_ms);
        let mut waited = false;

        loop {
            let wait = {
                let mut b = bucket.lock().await;
                match b.try_take(Instant::now(), min_interval) {
                    Ok(()) => None,
                    Err(wait) => Some(wait),
                }
            };

            match wait {
                None => return,
                Some(wait) => {
                    if !waited {
                        HttpMetrics::inc(&self.metrics.throttle_waits);
                        waited = true;
                    }
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    /// Record a throttling response (429/503).
    ///
    /// Pauses the host bucket until the server-provided deadline and
    /// halves the refill rate, floored at 0.25 tokens/second.
    pub async fn on_throttled(&self, host: &str, retry_after: Option<Duration>) {
        let bucket = self.bucket(host);
        let mut b = bucket.lock().await;

        if let Some(retry_after) = retry_after {
            let until = Instant::now() + retry_after;
            b.paused_until = Some(match b.paused_until {
                Some(existing) => existing.max(until),
                None => until,
            });
        }
        b.refill_per_sec = (b.refill_per_sec * SLOWDOWN_FACTOR).max(MIN_REFILL_RPS);
        b.consecutive_successes = 0;

        tracing::debug!(
            host,
            refill_rps = b.refill_per_sec,
            paused = retry_after.is_some(),
            "Host pacer slowed"
        );
    }

    /// Record a successful response; sustained success restores rate.
    pub async fn on_success(&self, host: &str) {
        let bucket = self.bucket(host);
        let mut b = bucket.lock().await;

        b.consecutive_successes += 1;
        if b.consecutive_successes >= self.config.success_streak_for_speedup {
            b.consecutive_successes = 0;
            let restored = (b.refill_per_sec * SPEEDUP_FACTOR).min(b.refill_ceiling);
            if restored > b.refill_per_sec {
                b.refill_per_sec = restored;
                tracing::debug!(host, refill_rps = b.refill_per_sec, "Host pacer sped up");
            }
        }
    }

    /// Current refill rate for a host, for tests and diagnostics.
    pub async fn refill_rate(&self, host: &str) -> f64 {
        self.bucket(host).lock().await.refill_per_sec
    }

    /// Earliest instant the host may be contacted, if it is paused.
    pub async fn paused_until(&self, host: &str) -> Option<Instant> {
        self.bucket(host).lock().await.paused_until
    }
}
