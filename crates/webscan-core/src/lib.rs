//! Webscan Core Library
//!
//! Core types, error taxonomy, configuration, and event plumbing for the
//! webscan engine: the data model (targets, findings, sub-scans), the
//! per-scan event bus with bounded history replay, the per-scanner
//! circuit breaker, retry/backoff policy, and process resource
//! monitoring.
//!
//! # Examples
//!
//! ```
//! use webscan_core::{Config, ScanOptions, Target};
//!
//! let target = Target::parse("https://example.test").unwrap();
//! assert_eq!(target.host(), "example.test");
//!
//! let config = Config::default();
//! assert!(config.validate().is_ok());
//!
//! let opts = ScanOptions::default();
//! assert_eq!(opts.max_concurrent, 16);
//! ```

pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod errors;
pub mod event_bus;
pub mod events;
pub mod resource_monitor;
pub mod retry;
pub mod types;

// Re-export commonly used types
pub use config::{Config, EventConfig, HttpConfig, ScanConfig};
pub use error::{Error, Result};
pub use errors::{ScanError, ScanErrorKind};
pub use event_bus::{EventBus, EventStream};
pub use events::{ModuleStatusPayload, ScanEvent, ScanEventType};
pub use types::{
    Finding, Intensity, ScanOptions, ScanPhase, ScanRequest, ScanResults, ScanSnapshot,
    ScanStatus, ScanSummary, ScanType, ScannerMetadata, Severity, SeverityCounters, Stage,
    SubScan, SubScanStatus, Target,
};
