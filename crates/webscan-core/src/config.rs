//! Configuration management for the webscan engine

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Scan orchestration configuration
    #[serde(default)]
    pub scan: ScanConfig,
    /// HTTP fabric configuration
    #[serde(default)]
    pub http: HttpConfig,
    /// Event bus configuration
    #[serde(default)]
    pub events: EventConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config file {:?}: {}", path, e)))?;
        Self::load_from_str(&contents)
    }

    /// Load configuration from a TOML string
    pub fn load_from_str(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Build configuration from defaults overlaid with environment variables.
    ///
    /// Unset variables keep their defaults; unparsable values are logged
    /// and ignored rather than failing engine startup.
    pub fn from_env() -> Self {
        let mut config = Config::default();

        if let Some(v) = env_u64("GLOBAL_SCAN_HARD_CAP_SECONDS") {
            config.scan.global_hard_cap_seconds = v;
        }
        if let Some(v) = env_u64("PER_SCANNER_CAP_SECONDS") {
            config.scan.per_scanner_cap_seconds = v;
        }
        if let Some(v) = env_u64("MAX_CONCURRENT_SCANS") {
            config.scan.max_concurrent_scans = v as usize;
        }
        if let Some(v) = env_u64("PER_HOST_MAX_CONCURRENCY") {
            config.scan.per_host_max_concurrency = v as usize;
        }
        if let Some(v) = env_u64("EVIDENCE_MAX_BYTES") {
            config.scan.evidence_max_bytes = v as usize;
        }

        if let Some(v) = env_u64("HTTP_MAX_RETRIES") {
            config.http.max_retries = v as u32;
        }
        if let Some(v) = env_f64("HTTP_BACKOFF_BASE_SECONDS") {
            config.http.backoff_base_seconds = v;
        }
        if let Some(v) = env_f64("HTTP_BACKOFF_MAX_SECONDS") {
            config.http.backoff_max_seconds = v;
        }
        if let Some(v) = env_u64("HTTP_PER_HOST_MIN_INTERVAL_MS") {
            config.http.per_host_min_interval_ms = v;
        }
        if let Some(v) = env_f64("HTTP_BUCKET_MAX_TOKENS") {
            config.http.bucket_max_tokens = v;
        }
        if let Some(v) = env_f64("HTTP_PER_HOST_INITIAL_RPS") {
            config.http.per_host_initial_rps = v;
        }
        if let Some(v) = env_list("HTTP_ALLOWED_HOSTS") {
            config.http.allowed_hosts = v;
        }
        if let Some(v) = env_list("HTTP_BLOCKED_HOSTS") {
            config.http.blocked_hosts = v;
        }
        if let Some(v) = env_bool("BLOCK_PRIVATE_NETWORKS") {
            config.http.block_private_networks = v;
        }
        if let Some(v) = env_u64("HTTP_MAX_RESPONSE_BYTES") {
            config.http.max_response_bytes = v;
        }

        if let Some(v) = env_u64("EVENT_HISTORY_MAX") {
            config.events.history_max = v as usize;
        }

        config
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.scan.global_hard_cap_seconds == 0 {
            return Err(Error::Config(
                "global_hard_cap_seconds must be greater than 0".to_string(),
            ));
        }
        if self.scan.global_hard_cap_seconds > 3600 {
            return Err(Error::Config(
                "global_hard_cap_seconds cannot exceed 1 hour".to_string(),
            ));
        }
        if self.scan.per_scanner_cap_seconds == 0 {
            return Err(Error::Config(
                "per_scanner_cap_seconds must be greater than 0".to_string(),
            ));
        }
        if self.scan.max_concurrent_scans == 0 {
            return Err(Error::Config(
                "max_concurrent_scans must be greater than 0".to_string(),
            ));
        }
        if self.scan.per_host_max_concurrency == 0 {
            return Err(Error::Config(
                "per_host_max_concurrency must be greater than 0".to_string(),
            ));
        }

        if self.http.max_retries > 10 {
            return Err(Error::Config("max_retries cannot exceed 10".to_string()));
        }
        if self.http.backoff_base_seconds <= 0.0 {
            return Err(Error::Config(
                "backoff_base_seconds must be positive".to_string(),
            ));
        }
        if self.http.backoff_max_seconds < self.http.backoff_base_seconds {
            return Err(Error::Config(
                "backoff_max_seconds must be >= backoff_base_seconds".to_string(),
            ));
        }
        if self.http.bucket_max_tokens <= 0.0 || self.http.per_host_initial_rps <= 0.0 {
            return Err(Error::Config(
                "token bucket capacity and refill must be positive".to_string(),
            ));
        }
        if self.http.per_host_rps_ceiling < self.http.per_host_initial_rps {
            return Err(Error::Config(
                "per_host_rps_ceiling must be >= per_host_initial_rps".to_string(),
            ));
        }

        if self.events.history_max == 0 || self.events.subscriber_queue_capacity == 0 {
            return Err(Error::Config(
                "event history and subscriber queue capacity must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

/// Scan orchestration configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Upper bound on any scan's requested deadline, seconds
    pub global_hard_cap_seconds: u64,
    /// Upper bound on any per-scanner timeout, seconds
    pub per_scanner_cap_seconds: u64,
    /// Concurrent scans accepted by one engine
    pub max_concurrent_scans: usize,
    /// Default per-host concurrency cap (overridable per request)
    pub per_host_max_concurrency: usize,
    /// Stage A/B/C time-windowed admission; single priority class when off
    #[serde(default = "default_true")]
    pub staged_scheduling: bool,
    /// Evidence size cap applied before findings are published
    pub evidence_max_bytes: usize,
    /// Process RSS above which the pool sheds concurrency
    pub memory_soft_limit_bytes: u64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            global_hard_cap_seconds: 600,
            per_scanner_cap_seconds: 90,
            max_concurrent_scans: 4,
            per_host_max_concurrency: 6,
            staged_scheduling: true,
            evidence_max_bytes: 8 * 1024,
            memory_soft_limit_bytes: 1024 * 1024 * 1024, // 1 GiB
        }
    }
}

/// HTTP fabric configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Retry budget for transient failures
    pub max_retries: u32,
    /// Exponential backoff base, seconds
    pub backoff_base_seconds: f64,
    /// Backoff cap, seconds
    pub backoff_max_seconds: f64,
    /// Hard floor between requests to one host, milliseconds (0 = none)
    pub per_host_min_interval_ms: u64,
    /// Token bucket capacity per host
    pub bucket_max_tokens: f64,
    /// Initial token refill rate per host, tokens/second
    pub per_host_initial_rps: f64,
    /// Refill rate ceiling reached through sustained success
    pub per_host_rps_ceiling: f64,
    /// Hosts exempt from blocklist checks; empty = all hosts allowed
    #[serde(default)]
    pub allowed_hosts: Vec<String>,
    /// Hosts always denied
    #[serde(default)]
    pub blocked_hosts: Vec<String>,
    /// Reject targets whose resolved IPs fall in private/loopback ranges
    pub block_private_networks: bool,
    /// Response body cap in bytes (0 disables)
    pub max_response_bytes: u64,
    /// Response cache TTL, seconds
    pub cache_ttl_seconds: u64,
    /// Whole-request timeout, seconds
    pub request_timeout_seconds: u64,
    /// TCP connect timeout, seconds
    pub connect_timeout_seconds: u64,
    /// Consecutive successes before the pacer speeds a host back up
    pub success_streak_for_speedup: u32,
    /// User-Agent header sent on every request
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base_seconds: 0.5,
            backoff_max_seconds: 10.0,
            per_host_min_interval_ms: 0,
            bucket_max_tokens: 10.0,
            per_host_initial_rps: 5.0,
            per_host_rps_ceiling: 10.0,
            allowed_hosts: Vec::new(),
            blocked_hosts: Vec::new(),
            block_private_networks: true,
            max_response_bytes: 1024 * 1024,
            cache_ttl_seconds: 120,
            request_timeout_seconds: 30,
            connect_timeout_seconds: 10,
            success_streak_for_speedup: 20,
            user_agent: concat!("webscan/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// Event bus configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventConfig {
    /// Events retained for late-subscriber replay
    pub history_max: usize,
    /// Per-subscriber bounded queue depth
    pub subscriber_queue_capacity: usize,
    /// Heartbeat progress interval while a scan runs, seconds
    pub heartbeat_interval_seconds: u64,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            history_max: 200,
            subscriber_queue_capacity: 1024,
            heartbeat_interval_seconds: 1,
        }
    }
}

fn default_true() -> bool {
    true
}

fn env_u64(name: &str) -> Option<u64> {
    let raw = env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("Ignoring unparsable {}={:?}", name, raw);
            None
        }
    }
}

fn env_f64(name: &str) -> Option<f64> {
    let raw = env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("Ignoring unparsable {}={:?}", name, raw);
            None
        }
    }
}

fn env_bool(name: &str) -> Option<bool> {
    let raw = env::var(name).ok()?;
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => {
            tracing::warn!("Ignoring unparsable {}={:?}", name, raw);
            None
        }
    }
}

fn env_list(name: &str) -> Option<Vec<String>> {
    let raw = env::var(name).ok()?;
    let items: Vec<String> = raw
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    Some(items)
}
