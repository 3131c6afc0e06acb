//! Sub-scan error categorization.
//!
//! Every failed sub-scan and every HTTP fabric rejection carries one of
//! these kinds. Kinds are part of the public event surface: they are
//! serialized into `module_status` events and into the final report, so
//! their names are stable.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Categories of sub-scan and fabric errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanErrorKind {
    /// URL denied by egress guardrails (scheme, host lists, private ranges)
    EgressBlocked,
    /// Per-task deadline exceeded while running
    Timeout,
    /// External cancel or global deadline before/while running
    Cancelled,
    /// Skipped at admission: could not finish before its deadline
    Deadline,
    /// Network error after the retry budget was spent
    Transport,
    /// 429 persisted through retries
    RateLimited,
    /// Non-retriable 4xx response
    Status4xx,
    /// 5xx response after the retry budget was spent
    Status5xx,
    /// Scanner panic or engine bug
    Internal,
    /// Scanner suppressed by its circuit breaker
    CircuitOpen,
}

impl ScanErrorKind {
    /// Whether a fabric error of this kind may succeed on a later attempt.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            ScanErrorKind::Transport | ScanErrorKind::RateLimited | ScanErrorKind::Status5xx
        )
    }

    /// Stable wire name, matching the serde representation.
    pub fn as_str(self) -> &'static str {
        match self {
            ScanErrorKind::EgressBlocked => "egress_blocked",
            ScanErrorKind::Timeout => "timeout",
            ScanErrorKind::Cancelled => "cancelled",
            ScanErrorKind::Deadline => "deadline",
            ScanErrorKind::Transport => "transport",
            ScanErrorKind::RateLimited => "rate_limited",
            ScanErrorKind::Status4xx => "status_4xx",
            ScanErrorKind::Status5xx => "status_5xx",
            ScanErrorKind::Internal => "internal",
            ScanErrorKind::CircuitOpen => "circuit_open",
        }
    }
}

impl fmt::Display for ScanErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Detailed sub-scan error with kind and message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanError {
    kind: ScanErrorKind,
    message: String,
}

impl ScanError {
    /// Creates a new scan error.
    pub fn new(kind: ScanErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Egress guardrail rejection.
    pub fn egress_blocked(message: impl Into<String>) -> Self {
        Self::new(ScanErrorKind::EgressBlocked, message)
    }

    /// Transport-level failure (connect/read) after retries.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(ScanErrorKind::Transport, message)
    }

    /// Cancellation observed.
    pub fn cancelled() -> Self {
        Self::new(ScanErrorKind::Cancelled, "operation cancelled")
    }

    /// Per-task deadline exceeded.
    pub fn timeout() -> Self {
        Self::new(ScanErrorKind::Timeout, "deadline exceeded")
    }

    /// Scanner panic or engine bug.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ScanErrorKind::Internal, message)
    }

    /// Returns the error category.
    pub fn kind(&self) -> ScanErrorKind {
        self.kind
    }

    /// Returns the detailed error message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Whether the error may succeed on retry.
    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }
}

impl fmt::Display for ScanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for ScanError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_wire_names() {
        assert_eq!(ScanErrorKind::EgressBlocked.as_str(), "egress_blocked");
        assert_eq!(ScanErrorKind::CircuitOpen.as_str(), "circuit_open");
        assert_eq!(ScanErrorKind::Status5xx.as_str(), "status_5xx");
    }

    #[test]
    fn test_transient_classification() {
        assert!(ScanErrorKind::Transport.is_transient());
        assert!(ScanErrorKind::RateLimited.is_transient());
        assert!(ScanErrorKind::Status5xx.is_transient());
        assert!(!ScanErrorKind::EgressBlocked.is_transient());
        assert!(!ScanErrorKind::Status4xx.is_transient());
        assert!(!ScanErrorKind::Cancelled.is_transient());
    }

    #[test]
    fn test_display() {
        let err = ScanError::egress_blocked("host 127.0.0.1 is in a blocked range");
        assert_eq!(
            err.to_string(),
            "egress_blocked: host 127.0.0.1 is in a blocked range"
        );
    }

    #[test]
    fn test_serde_round_trip() {
        let err = ScanError::new(ScanErrorKind::RateLimited, "429 after 3 attempts");
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("rate_limited"));
        let back: ScanError = serde_json::from_str(&json).unwrap();
        assert_eq!(back, err);
    }
}
