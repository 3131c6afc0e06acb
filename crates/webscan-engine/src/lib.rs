//! Webscan Engine
//!
//! The core scanning engine of the webscan platform: accepts a scan
//! request for a target URL, dispatches registered security checks
//! concurrently under global and per-host budgets, streams findings and
//! progress to subscribers in real time, and produces a consolidated
//! result.
//!
//! # Architecture
//!
//! - [`engine::ScanEngine`] — embedding facade (start/get/cancel/
//!   subscribe/metrics)
//! - [`orchestrator`] — per-scan lifecycle, staged scheduling, ETA,
//!   aggregation
//! - [`pool`] — bounded priority task pool with per-host caps and
//!   deadline-aware admission
//! - [`http`] — shared HTTP fabric: guardrails, coalescing, caching,
//!   per-host pacing, retries, size caps
//! - [`registry`] / [`scanner`] — scanner contract and catalog
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use webscan_core::{Config, ScanOptions, ScanRequest, ScanType, Target};
//! use webscan_engine::{ScanEngine, ScannerRegistry};
//!
//! # async fn example() -> webscan_core::Result<()> {
//! let registry = Arc::new(ScannerRegistry::new());
//! // ... registry.register(...) for each scanner plug-in ...
//! let engine = ScanEngine::new(Config::default(), registry)?;
//!
//! let scan_id = engine.start_scan(ScanRequest {
//!     target: Target::parse("https://example.test")?,
//!     scan_type: ScanType::Full,
//!     options: ScanOptions::default(),
//! })?;
//!
//! let mut events = engine.subscribe(scan_id)?;
//! while let Some(event) = events.next().await {
//!     println!("{}", event.display());
//! }
//! # Ok(())
//! # }
//! ```

pub mod engine;
pub mod http;
pub mod inventory;
pub mod orchestrator;
pub mod pool;
pub mod registry;
pub mod scanner;

pub use engine::{EngineMetrics, ScanEngine};
pub use http::{FabricResponse, HttpFabric, RequestOptions};
pub use inventory::ScanInventory;
pub use pool::{PoolStats, TaskPool};
pub use registry::ScannerRegistry;
pub use scanner::{ScanContext, Scanner};
