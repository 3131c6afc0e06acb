//! Process-memory monitoring for adaptive degradation
//!
//! Watches this process's resident memory against a configured soft
//! limit so the concurrency manager can shed parallelism before the
//! system starts swapping, and restore it once pressure subsides.

use std::time::{Duration, Instant};
use sysinfo::{Pid, ProcessRefreshKind, System};

/// Resource monitoring configuration
#[derive(Debug, Clone)]
pub struct ResourceMonitorConfig {
    /// Process RSS above which the engine is considered under pressure
    pub memory_soft_limit: u64,

    /// How often to re-probe (avoid refreshing sysinfo on every check)
    pub check_interval: Duration,
}

impl Default for ResourceMonitorConfig {
    fn default() -> Self {
        Self {
            memory_soft_limit: 1024 * 1024 * 1024, // 1 GiB
            check_interval: Duration::from_secs(2),
        }
    }
}

/// Memory monitor with cached status
///
/// `check()` refreshes at most once per `check_interval` and returns the
/// cached verdict in between, keeping the hot path cheap.
pub struct ResourceMonitor {
    system: System,
    pid: Option<Pid>,
    config: ResourceMonitorConfig,
    last_check: Option<Instant>,
    last_over_limit: bool,
    last_rss: u64,
}

impl ResourceMonitor {
    /// Create a new monitor
    pub fn new(config: ResourceMonitorConfig) -> Self {
        let pid = sysinfo::get_current_pid().ok();
        Self {
            system: System::new(),
            pid,
            config,
            last_check: None,
            last_over_limit: false,
            last_rss: 0,
        }
    }

    /// Whether process memory currently exceeds the soft limit.
    pub fn check(&mut self) -> bool {
        if let Some(last) = self.last_check {
            if last.elapsed() < self.config.check_interval {
                return self.last_over_limit;
            }
        }

        self.refresh();
        self.last_check = Some(Instant::now());
        self.last_over_limit = self.last_rss > self.config.memory_soft_limit;

        if self.last_over_limit {
            tracing::warn!(
                rss = self.last_rss,
                soft_limit = self.config.memory_soft_limit,
                "Process memory over soft limit"
            );
        }
        self.last_over_limit
    }

    /// Most recently observed process RSS in bytes.
    pub fn process_memory(&self) -> u64 {
        self.last_rss
    }

    /// The configured soft limit.
    pub fn soft_limit(&self) -> u64 {
        self.config.memory_soft_limit
    }

    fn refresh(&mut self) {
        let Some(pid) = self.pid else {
            return;
        };
        self.system
            .refresh_process_specifics(pid, ProcessRefreshKind::new().with_memory());
        if let Some(process) = self.system.process(pid) {
            self.last_rss = process.memory();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monitor_reports_some_memory() {
        let mut monitor = ResourceMonitor::new(ResourceMonitorConfig::default());
        monitor.check();
        // Any running test binary has nonzero RSS
        assert!(monitor.process_memory() > 0);
    }

    #[test]
    fn test_under_generous_limit() {
        let mut monitor = ResourceMonitor::new(ResourceMonitorConfig {
            memory_soft_limit: u64::MAX,
            check_interval: Duration::from_millis(0),
        });
        assert!(!monitor.check());
    }

    #[test]
    fn test_over_tiny_limit() {
        let mut monitor = ResourceMonitor::new(ResourceMonitorConfig {
            memory_soft_limit: 1,
            check_interval: Duration::from_millis(0),
        });
        assert!(monitor.check());
    }

    #[test]
    fn test_cached_between_intervals() {
        let mut monitor = ResourceMonitor::new(ResourceMonitorConfig {
            memory_soft_limit: 1,
            check_interval: Duration::from_secs(60),
        });
        let first = monitor.check();
        // Second check within the interval returns the cached verdict
        assert_eq!(monitor.check(), first);
    }
}
