//! Core types for the webscan engine
//!
//! Defines the scan data model: targets, requests, scanner metadata,
//! findings, per-scanner execution records, and scan-level state
//! snapshots. All externally visible types are serde-serializable.

use crate::error::{Error, Result};
use crate::errors::ScanError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use url::Url;
use uuid::Uuid;

/// Default global scan deadline in seconds
pub const DEFAULT_GLOBAL_DEADLINE_SECS: u64 = 180;
/// Default per-scanner timeout in seconds
pub const DEFAULT_SCANNER_TIMEOUT_SECS: u64 = 90;
/// Default global concurrency cap
pub const DEFAULT_MAX_CONCURRENT: usize = 16;
/// Default per-host concurrency cap
pub const DEFAULT_PER_HOST_MAX_CONCURRENT: usize = 6;
/// Default evidence size cap in bytes
pub const DEFAULT_EVIDENCE_MAX_BYTES: usize = 8 * 1024;

/// Validated scan target: absolute http/https URL with a host.
///
/// # Examples
///
/// ```
/// use webscan_core::Target;
///
/// let target = Target::parse("https://example.test/app").unwrap();
/// assert_eq!(target.host(), "example.test");
/// assert_eq!(target.origin(), "https://example.test");
///
/// assert!(Target::parse("ftp://example.test").is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Target {
    url: Url,
}

impl Target {
    /// Parse and validate a target URL.
    ///
    /// Accepts absolute URLs with scheme `http` or `https` and a host
    /// component. Anything else is an `InvalidArgument` error.
    pub fn parse(raw: &str) -> Result<Self> {
        let url = Url::parse(raw)?;
        match url.scheme() {
            "http" | "https" => {}
            other => {
                return Err(Error::InvalidArgument(format!(
                    "unsupported scheme '{}': only http and https are scannable",
                    other
                )))
            }
        }
        if url.host_str().is_none() {
            return Err(Error::InvalidArgument(format!(
                "target '{}' has no host",
                raw
            )));
        }
        Ok(Self { url })
    }

    /// The full target URL.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Host component (hostname or IP literal).
    pub fn host(&self) -> &str {
        self.url.host_str().unwrap_or_default()
    }

    /// Scheme + host (+ non-default port), without path or query.
    pub fn origin(&self) -> String {
        self.url.origin().ascii_serialization()
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.url, f)
    }
}

/// Scan type selecting which scanners run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanType {
    /// All registered scanners
    Full,
    /// Low-intensity scanners only
    Quick,
    /// Explicit scanner list (options.scanners required)
    Custom,
}

/// Enumerated per-request options with engine defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanOptions {
    /// Scanner names for custom scans; required iff scan_type is Custom
    #[serde(default)]
    pub scanners: Option<Vec<String>>,
    /// Whole-scan wall clock budget
    #[serde(default = "default_global_deadline")]
    pub global_deadline_seconds: u64,
    /// Per-scanner budget; stage caps may lower it
    #[serde(default = "default_scanner_timeout")]
    pub per_scanner_timeout_seconds: u64,
    /// Global concurrency cap
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Per-host concurrency cap
    #[serde(default = "default_per_host")]
    pub per_host_max_concurrent: usize,
}

fn default_global_deadline() -> u64 {
    DEFAULT_GLOBAL_DEADLINE_SECS
}
fn default_scanner_timeout() -> u64 {
    DEFAULT_SCANNER_TIMEOUT_SECS
}
fn default_max_concurrent() -> usize {
    DEFAULT_MAX_CONCURRENT
}
fn default_per_host() -> usize {
    DEFAULT_PER_HOST_MAX_CONCURRENT
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            scanners: None,
            global_deadline_seconds: DEFAULT_GLOBAL_DEADLINE_SECS,
            per_scanner_timeout_seconds: DEFAULT_SCANNER_TIMEOUT_SECS,
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            per_host_max_concurrent: DEFAULT_PER_HOST_MAX_CONCURRENT,
        }
    }
}

/// A scan request as accepted by the engine facade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanRequest {
    pub target: Target,
    pub scan_type: ScanType,
    #[serde(default)]
    pub options: ScanOptions,
}

impl ScanRequest {
    /// Validate option ranges and the custom-scanner requirement.
    pub fn validate(&self) -> Result<()> {
        if self.options.global_deadline_seconds == 0 {
            return Err(Error::InvalidArgument(
                "global_deadline_seconds must be greater than 0".to_string(),
            ));
        }
        if self.options.max_concurrent == 0 || self.options.per_host_max_concurrent == 0 {
            return Err(Error::InvalidArgument(
                "concurrency caps must be greater than 0".to_string(),
            ));
        }
        match (self.scan_type, &self.options.scanners) {
            (ScanType::Custom, None) => Err(Error::InvalidArgument(
                "custom scan requires options.scanners".to_string(),
            )),
            (ScanType::Custom, Some(names)) if names.is_empty() => Err(Error::InvalidArgument(
                "custom scan requires a non-empty scanner list".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

/// Scanner resource intensity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intensity {
    Low,
    Medium,
    High,
}

/// Time-windowed admission class for scanners.
///
/// Stage windows are fractions of the global deadline; D is the
/// aggregation tail and carries no scanners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    A,
    B,
    C,
}

impl Stage {
    /// Admission priority for the concurrency manager.
    pub fn priority(self) -> u8 {
        match self {
            Stage::A => 9,
            Stage::B => 6,
            Stage::C => 3,
        }
    }

    /// Per-scanner cap for this stage, in seconds.
    pub fn scanner_cap_secs(self) -> u64 {
        match self {
            Stage::A => 10,
            Stage::B => 60,
            Stage::C => 90,
        }
    }

    /// End of this stage's time window, as a fraction of the deadline.
    pub fn window_end_fraction(self) -> f64 {
        match self {
            Stage::A => 0.06,
            Stage::B => 0.50,
            Stage::C => 0.89,
        }
    }
}

/// Static scanner metadata exposed by every registered scanner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScannerMetadata {
    /// OWASP category label, e.g. "A05:2021 Security Misconfiguration"
    pub owasp_category: String,
    pub intensity: Intensity,
    pub stage: Stage,
    /// Hint that this scanner routinely consumes its full budget
    pub long_running: bool,
}

/// Finding severity, ordered from least to most severe.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Info => "info",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// A discrete security observation.
///
/// `id` is a stable content hash; two findings with equal id are the same
/// finding and are deduplicated during aggregation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub id: String,
    pub title: String,
    pub severity: Severity,
    /// CWE identifier, e.g. "CWE-693"
    pub cwe: Option<String>,
    pub cvss: Option<f32>,
    /// OWASP category of the emitting scanner
    pub category: String,
    /// Where the issue was observed (URL, header name, parameter)
    pub location: String,
    pub description: String,
    pub remediation: String,
    /// Supporting evidence, capped at the configured byte limit
    pub evidence: String,
    #[serde(default)]
    pub evidence_truncated: bool,
    pub discovered_at: DateTime<Utc>,
    pub scanner_name: String,
}

impl Finding {
    /// Compute the stable dedup id for a finding.
    ///
    /// The id is the first 16 bytes (hex) of a SHA-256 over the identity
    /// tuple. Evidence participates through a caller-chosen signature
    /// (typically a normalized excerpt), not the raw bytes, so that
    /// truncation does not change identity.
    pub fn compute_id(
        scanner_name: &str,
        finding_type: &str,
        location: &str,
        evidence_signature: &str,
    ) -> String {
        let mut hasher = Sha256::new();
        hasher.update(scanner_name.as_bytes());
        hasher.update(b"\n");
        hasher.update(finding_type.as_bytes());
        hasher.update(b"\n");
        hasher.update(location.as_bytes());
        hasher.update(b"\n");
        hasher.update(evidence_signature.as_bytes());
        let digest = hasher.finalize();
        hex_prefix(&digest, 16)
    }

    /// Truncate evidence to `max_bytes` on a char boundary, setting the flag.
    pub fn truncate_evidence(&mut self, max_bytes: usize) {
        if max_bytes == 0 || self.evidence.len() <= max_bytes {
            return;
        }
        let mut end = max_bytes;
        while !self.evidence.is_char_boundary(end) {
            end -= 1;
        }
        self.evidence.truncate(end);
        self.evidence_truncated = true;
    }
}

fn hex_prefix(bytes: &[u8], n: usize) -> String {
    bytes
        .iter()
        .take(n)
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Per-scanner execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubScanStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Timeout,
    Cancelled,
}

impl SubScanStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, SubScanStatus::Queued | SubScanStatus::Running)
    }
}

impl fmt::Display for SubScanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SubScanStatus::Queued => "queued",
            SubScanStatus::Running => "running",
            SubScanStatus::Completed => "completed",
            SubScanStatus::Failed => "failed",
            SubScanStatus::Timeout => "timeout",
            SubScanStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Execution record of a single scanner within a scan.
///
/// Created `Queued` on submit, moves to `Running` on dispatch, then to
/// exactly one terminal state, after which the orchestrator never mutates
/// it again.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubScan {
    pub scan_id: Uuid,
    pub scanner_name: String,
    pub status: SubScanStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub findings_count: usize,
    pub error: Option<ScanError>,
    #[serde(default)]
    pub evidence_truncated: bool,
}

impl SubScan {
    pub fn new(scan_id: Uuid, scanner_name: impl Into<String>) -> Self {
        Self {
            scan_id,
            scanner_name: scanner_name.into(),
            status: SubScanStatus::Queued,
            start_time: None,
            end_time: None,
            findings_count: 0,
            error: None,
            evidence_truncated: false,
        }
    }
}

/// Scan-level status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ScanStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ScanStatus::Completed | ScanStatus::Failed | ScanStatus::Cancelled
        )
    }
}

/// Human-visible scan phase, published via `scan_phase` events.
///
/// The wire values are the display labels, spaces included.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanPhase {
    Initializing,
    #[serde(rename = "Running scanners")]
    RunningScanners,
    #[serde(rename = "Aggregating results")]
    AggregatingResults,
    Completed,
    Cancelled,
    Failed,
}

impl ScanPhase {
    /// Display label, stable on the wire.
    pub fn label(self) -> &'static str {
        match self {
            ScanPhase::Initializing => "Initializing",
            ScanPhase::RunningScanners => "Running scanners",
            ScanPhase::AggregatingResults => "Aggregating results",
            ScanPhase::Completed => "Completed",
            ScanPhase::Cancelled => "Cancelled",
            ScanPhase::Failed => "Failed",
        }
    }
}

impl fmt::Display for ScanPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Per-severity finding tallies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeverityCounters {
    pub critical: usize,
    pub high: usize,
    pub medium: usize,
    pub low: usize,
    pub info: usize,
}

impl SeverityCounters {
    pub fn record(&mut self, severity: Severity) {
        match severity {
            Severity::Critical => self.critical += 1,
            Severity::High => self.high += 1,
            Severity::Medium => self.medium += 1,
            Severity::Low => self.low += 1,
            Severity::Info => self.info += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.critical + self.high + self.medium + self.low + self.info
    }
}

/// Immutable copy of scan state handed to external observers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanSnapshot {
    pub scan_id: Uuid,
    pub target: Target,
    pub scan_type: ScanType,
    pub status: ScanStatus,
    pub phase: ScanPhase,
    /// Percentage of sub-scans in a terminal state, 0..=100
    pub progress: f32,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub deadline_at: DateTime<Utc>,
    pub sub_scans: HashMap<String, SubScan>,
    pub counters: SeverityCounters,
    /// Findings per OWASP category
    pub category_counts: HashMap<String, usize>,
    /// Set when the scan terminated because the global deadline expired
    #[serde(default)]
    pub deadline_exceeded: bool,
}

/// Final (or interim) result set for a scan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanResults {
    pub scan_id: Uuid,
    pub findings: Vec<Finding>,
    pub counters: SeverityCounters,
}

/// Summary payload carried by the terminal `scan_completed` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanSummary {
    pub status: ScanStatus,
    pub total_modules: usize,
    pub completed_modules: usize,
    pub failed_modules: usize,
    pub findings_total: usize,
    pub duration_secs: f64,
    #[serde(default)]
    pub deadline_exceeded: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_parse_valid() {
        let t = Target::parse("https://example.test:8443/a/b?x=1").unwrap();
        assert_eq!(t.host(), "example.test");
        assert_eq!(t.origin(), "https://example.test:8443");
    }

    #[test]
    fn test_target_rejects_bad_scheme() {
        let err = Target::parse("ftp://example.test").unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_target_rejects_relative() {
        assert!(Target::parse("/just/a/path").is_err());
    }

    #[test]
    fn test_options_defaults() {
        let opts = ScanOptions::default();
        assert_eq!(opts.global_deadline_seconds, 180);
        assert_eq!(opts.per_scanner_timeout_seconds, 90);
        assert_eq!(opts.max_concurrent, 16);
        assert_eq!(opts.per_host_max_concurrent, 6);
    }

    #[test]
    fn test_custom_requires_scanners() {
        let req = ScanRequest {
            target: Target::parse("https://example.test").unwrap(),
            scan_type: ScanType::Custom,
            options: ScanOptions::default(),
        };
        assert!(req.validate().is_err());

        let req = ScanRequest {
            target: Target::parse("https://example.test").unwrap(),
            scan_type: ScanType::Custom,
            options: ScanOptions {
                scanners: Some(vec!["hdr".to_string()]),
                ..Default::default()
            },
        };
        assert!(req.validate().is_ok());
    }

    #[test]
    fn test_finding_id_stable() {
        let a = Finding::compute_id("hdr", "missing-hsts", "https://example.test/", "hsts");
        let b = Finding::compute_id("hdr", "missing-hsts", "https://example.test/", "hsts");
        let c = Finding::compute_id("hdr", "missing-hsts", "https://example.test/x", "hsts");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 32); // 16 bytes hex
    }

    #[test]
    fn test_evidence_truncation() {
        let mut f = Finding {
            id: "x".to_string(),
            title: "t".to_string(),
            severity: Severity::Low,
            cwe: None,
            cvss: None,
            category: "c".to_string(),
            location: "l".to_string(),
            description: String::new(),
            remediation: String::new(),
            evidence: "é".repeat(100), // 200 bytes
            evidence_truncated: false,
            discovered_at: Utc::now(),
            scanner_name: "hdr".to_string(),
        };
        f.truncate_evidence(101);
        assert!(f.evidence_truncated);
        assert!(f.evidence.len() <= 101);
        // Still valid UTF-8 (would panic on truncate otherwise)
        assert!(f.evidence.chars().count() <= 51);
    }

    #[test]
    fn test_evidence_truncation_disabled() {
        let mut f = Finding {
            id: "x".to_string(),
            title: "t".to_string(),
            severity: Severity::Low,
            cwe: None,
            cvss: None,
            category: "c".to_string(),
            location: "l".to_string(),
            description: String::new(),
            remediation: String::new(),
            evidence: "a".repeat(100),
            evidence_truncated: false,
            discovered_at: Utc::now(),
            scanner_name: "hdr".to_string(),
        };
        f.truncate_evidence(0);
        assert!(!f.evidence_truncated);
        assert_eq!(f.evidence.len(), 100);
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::High > Severity::Medium);
        assert!(Severity::Info < Severity::Low);
    }

    #[test]
    fn test_counters() {
        let mut c = SeverityCounters::default();
        c.record(Severity::Low);
        c.record(Severity::Low);
        c.record(Severity::Critical);
        assert_eq!(c.low, 2);
        assert_eq!(c.critical, 1);
        assert_eq!(c.total(), 3);
    }

    #[test]
    fn test_stage_table() {
        assert_eq!(Stage::A.priority(), 9);
        assert_eq!(Stage::B.priority(), 6);
        assert_eq!(Stage::C.priority(), 3);
        assert_eq!(Stage::A.scanner_cap_secs(), 10);
        assert_eq!(Stage::B.scanner_cap_secs(), 60);
        assert_eq!(Stage::C.scanner_cap_secs(), 90);
        assert!(Stage::A.window_end_fraction() < Stage::B.window_end_fraction());
    }

    #[test]
    fn test_sub_scan_lifecycle_flags() {
        let s = SubScan::new(Uuid::new_v4(), "hdr");
        assert_eq!(s.status, SubScanStatus::Queued);
        assert!(!s.status.is_terminal());
        assert!(SubScanStatus::Timeout.is_terminal());
        assert!(SubScanStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_phase_labels() {
        assert_eq!(ScanPhase::RunningScanners.label(), "Running scanners");
        assert_eq!(ScanPhase::AggregatingResults.label(), "Aggregating results");
    }

    #[test]
    fn test_phase_wire_values_match_labels() {
        for phase in [
            ScanPhase::Initializing,
            ScanPhase::RunningScanners,
            ScanPhase::AggregatingResults,
            ScanPhase::Completed,
            ScanPhase::Cancelled,
            ScanPhase::Failed,
        ] {
            let json = serde_json::to_value(phase).unwrap();
            assert_eq!(json, serde_json::Value::String(phase.label().to_string()));
            let back: ScanPhase = serde_json::from_value(json).unwrap();
            assert_eq!(back, phase);
        }
    }
}
