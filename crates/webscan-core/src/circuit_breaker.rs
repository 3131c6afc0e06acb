//! Circuit breaker for repeatedly failing scanners
//!
//! Tracks a sliding window of run outcomes per scanner and suppresses
//! submission of scanners whose recent failure rate crossed the
//! threshold. Benefits:
//! - Stops burning scan budget on a scanner that cannot succeed
//! - Prevents retry storms against an already unhappy target
//! - Automatic recovery probing (half-open state)
//! - Per-scanner statistics for debugging
//!
//! Breaker state is per-process: it survives across scans run by the
//! same engine and is never persisted.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation - submissions allowed
    Closed,

    /// Failure rate too high - submissions rejected
    Open,

    /// Testing recovery - a single probe is allowed through
    HalfOpen,
}

/// Per-scanner breaker statistics
#[derive(Debug, Clone)]
pub struct CircuitStats {
    pub state: CircuitState,
    pub window_len: usize,
    pub failure_rate: f64,
    pub last_failure: Option<Instant>,
    pub opened_at: Option<Instant>,
}

#[derive(Debug)]
struct Circuit {
    state: CircuitState,
    /// Sliding window of outcomes, true = failure
    window: VecDeque<bool>,
    last_failure: Option<Instant>,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

impl Circuit {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            window: VecDeque::new(),
            last_failure: None,
            opened_at: None,
            probe_in_flight: false,
        }
    }

    fn failure_rate(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let failures = self.window.iter().filter(|f| **f).count();
        failures as f64 / self.window.len() as f64
    }

    fn record(&mut self, failed: bool, window_size: usize) {
        if self.window.len() >= window_size {
            self.window.pop_front();
        }
        self.window.push_back(failed);
    }

    fn to_stats(&self) -> CircuitStats {
        CircuitStats {
            state: self.state,
            window_len: self.window.len(),
            failure_rate: self.failure_rate(),
            last_failure: self.last_failure,
            opened_at: self.opened_at,
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Sliding window length (runs)
    pub window_size: usize,

    /// Failure rate at which the circuit opens
    pub failure_rate_threshold: f64,

    /// Minimum samples before the rate is trusted
    pub min_samples: usize,

    /// How long to reject before probing recovery
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            window_size: 20,
            failure_rate_threshold: 0.5,
            min_samples: 5,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

/// Multi-scanner circuit breaker
///
/// Maintains separate circuit state for each scanner name so one broken
/// scanner never suppresses the others.
///
/// # Example
///
/// ```no_run
/// use webscan_core::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
///
/// # async fn example() {
/// let breaker = CircuitBreaker::new(CircuitBreakerConfig::default());
///
/// if breaker.should_attempt("sqli").await {
///     // run the scanner, then:
///     breaker.record_success("sqli").await;
/// } else {
///     // suppressed: record the sub-scan as circuit_open
/// }
/// # }
/// ```
pub struct CircuitBreaker {
    circuits: RwLock<HashMap<String, Circuit>>,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    /// Create a new circuit breaker
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            circuits: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Check whether a scanner may be submitted.
    ///
    /// Open circuits transition to half-open after the recovery timeout
    /// and then admit exactly one probe until its outcome is recorded.
    pub async fn should_attempt(&self, scanner: &str) -> bool {
        let mut circuits = self.circuits.write().await;
        let circuit = circuits
            .entry(scanner.to_string())
            .or_insert_with(Circuit::new);

        match circuit.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                match circuit.opened_at {
                    Some(opened_at) if opened_at.elapsed() >= self.config.recovery_timeout => {
                        circuit.state = CircuitState::HalfOpen;
                        circuit.probe_in_flight = true;
                        true
                    }
                    _ => false,
                }
            }
            CircuitState::HalfOpen => {
                if circuit.probe_in_flight {
                    false
                } else {
                    circuit.probe_in_flight = true;
                    true
                }
            }
        }
    }

    /// Record a successful run
    pub async fn record_success(&self, scanner: &str) {
        let mut circuits = self.circuits.write().await;
        let circuit = circuits
            .entry(scanner.to_string())
            .or_insert_with(Circuit::new);

        circuit.record(false, self.config.window_size);

        match circuit.state {
            CircuitState::HalfOpen => {
                // Probe succeeded: close and start from a clean window
                circuit.state = CircuitState::Closed;
                circuit.opened_at = None;
                circuit.probe_in_flight = false;
                circuit.window.clear();
            }
            CircuitState::Closed => {}
            CircuitState::Open => {
                // Late result from a run admitted before opening
            }
        }
    }

    /// Record a failed run
    pub async fn record_failure(&self, scanner: &str) {
        let mut circuits = self.circuits.write().await;
        let circuit = circuits
            .entry(scanner.to_string())
            .or_insert_with(Circuit::new);

        circuit.record(true, self.config.window_size);
        circuit.last_failure = Some(Instant::now());

        match circuit.state {
            CircuitState::Closed => {
                if circuit.window.len() >= self.config.min_samples
                    && circuit.failure_rate() >= self.config.failure_rate_threshold
                {
                    tracing::warn!(
                        scanner,
                        failure_rate = circuit.failure_rate(),
                        "Circuit opened"
                    );
                    circuit.state = CircuitState::Open;
                    circuit.opened_at = Some(Instant::now());
                }
            }
            CircuitState::HalfOpen => {
                // Probe failed: reopen with a fresh recovery timer
                circuit.state = CircuitState::Open;
                circuit.opened_at = Some(Instant::now());
                circuit.probe_in_flight = false;
            }
            CircuitState::Open => {}
        }
    }

    /// Statistics for one scanner
    pub async fn get_stats(&self, scanner: &str) -> Option<CircuitStats> {
        let circuits = self.circuits.read().await;
        circuits.get(scanner).map(|c| c.to_stats())
    }

    /// Statistics for every tracked scanner
    pub async fn get_all_stats(&self) -> HashMap<String, CircuitStats> {
        let circuits = self.circuits.read().await;
        circuits
            .iter()
            .map(|(name, circuit)| (name.clone(), circuit.to_stats()))
            .collect()
    }

    /// Forget one scanner's history
    pub async fn reset(&self, scanner: &str) {
        let mut circuits = self.circuits.write().await;
        circuits.remove(scanner);
    }

    /// Forget everything
    pub async fn reset_all(&self) {
        let mut circuits = self.circuits.write().await;
        circuits.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            window_size: 20,
            failure_rate_threshold: 0.5,
            min_samples: 5,
            recovery_timeout: Duration::from_millis(50),
        }
    }

    #[tokio::test]
    async fn test_circuit_starts_closed() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig::default());
        assert!(breaker.should_attempt("xss").await);
    }

    #[tokio::test]
    async fn test_opens_at_failure_rate_with_min_samples() {
        let breaker = CircuitBreaker::new(fast_config());

        // 4 failures: rate is 1.0 but below min_samples, stays closed
        for _ in 0..4 {
            breaker.record_failure("xss").await;
        }
        assert!(breaker.should_attempt("xss").await);

        // 5th failure crosses min_samples at rate 1.0
        breaker.record_failure("xss").await;
        let stats = breaker.get_stats("xss").await.unwrap();
        assert_eq!(stats.state, CircuitState::Open);
        assert!(!breaker.should_attempt("xss").await);
    }

    #[tokio::test]
    async fn test_mixed_outcomes_below_threshold_stay_closed() {
        let breaker = CircuitBreaker::new(fast_config());

        // 4 failures / 10 runs = 0.4 < 0.5
        for i in 0..10 {
            if i % 3 == 0 {
                breaker.record_failure("cors").await;
            } else {
                breaker.record_success("cors").await;
            }
        }
        let stats = breaker.get_stats("cors").await.unwrap();
        assert_eq!(stats.state, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_transitions_to_half_open_after_recovery() {
        let breaker = CircuitBreaker::new(fast_config());
        for _ in 0..5 {
            breaker.record_failure("sqli").await;
        }
        assert!(!breaker.should_attempt("sqli").await);

        tokio::time::sleep(Duration::from_millis(60)).await;

        // First attempt after timeout is the probe
        assert!(breaker.should_attempt("sqli").await);
        let stats = breaker.get_stats("sqli").await.unwrap();
        assert_eq!(stats.state, CircuitState::HalfOpen);
    }

    #[tokio::test]
    async fn test_half_open_admits_single_probe() {
        let breaker = CircuitBreaker::new(fast_config());
        for _ in 0..5 {
            breaker.record_failure("sqli").await;
        }
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert!(breaker.should_attempt("sqli").await);
        // Probe still in flight: nothing else admitted
        assert!(!breaker.should_attempt("sqli").await);
    }

    #[tokio::test]
    async fn test_probe_success_closes() {
        let breaker = CircuitBreaker::new(fast_config());
        for _ in 0..5 {
            breaker.record_failure("sqli").await;
        }
        tokio::time::sleep(Duration::from_millis(60)).await;
        breaker.should_attempt("sqli").await;

        breaker.record_success("sqli").await;
        let stats = breaker.get_stats("sqli").await.unwrap();
        assert_eq!(stats.state, CircuitState::Closed);
        // Window cleared: old failures no longer count
        assert_eq!(stats.window_len, 0);
        assert!(breaker.should_attempt("sqli").await);
    }

    #[tokio::test]
    async fn test_probe_failure_reopens() {
        let breaker = CircuitBreaker::new(fast_config());
        for _ in 0..5 {
            breaker.record_failure("sqli").await;
        }
        tokio::time::sleep(Duration::from_millis(60)).await;
        breaker.should_attempt("sqli").await;

        breaker.record_failure("sqli").await;
        let stats = breaker.get_stats("sqli").await.unwrap();
        assert_eq!(stats.state, CircuitState::Open);
        assert!(!breaker.should_attempt("sqli").await);
    }

    #[tokio::test]
    async fn test_scanners_tracked_independently() {
        let breaker = CircuitBreaker::new(fast_config());
        for _ in 0..5 {
            breaker.record_failure("sqli").await;
        }
        assert!(!breaker.should_attempt("sqli").await);
        assert!(breaker.should_attempt("cors").await);
    }

    #[tokio::test]
    async fn test_window_slides() {
        let config = CircuitBreakerConfig {
            window_size: 4,
            ..fast_config()
        };
        let breaker = CircuitBreaker::new(config);

        // Old failures pushed out by newer successes
        for _ in 0..4 {
            breaker.record_failure("hdr").await;
        }
        for _ in 0..4 {
            breaker.record_success("hdr").await;
        }
        let stats = breaker.get_stats("hdr").await.unwrap();
        assert_eq!(stats.window_len, 4);
        assert!(stats.failure_rate < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_reset() {
        let breaker = CircuitBreaker::new(fast_config());
        for _ in 0..5 {
            breaker.record_failure("sqli").await;
        }
        assert!(!breaker.should_attempt("sqli").await);

        breaker.reset("sqli").await;
        assert!(breaker.should_attempt("sqli").await);
    }

    #[tokio::test]
    async fn test_get_all_stats() {
        let breaker = CircuitBreaker::new(fast_config());
        breaker.record_failure("a").await;
        breaker.record_success("b").await;

        let all = breaker.get_all_stats().await;
        assert_eq!(all.len(), 2);
        assert!(all.contains_key("a"));
        assert!(all.contains_key("b"));
    }
}
