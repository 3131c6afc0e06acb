//! Scanner contract
//!
//! A scanner is a plug-in performing one class of security check against
//! a target. The engine treats scanners as opaque callables: it reads
//! their static metadata for scheduling and invokes `run` with a context
//! carrying cancellation, deadline, and the shared HTTP fabric.
//!
//! Scanners MUST use the fabric for all network I/O, so that pacing,
//! caching, and egress guardrails apply uniformly, and MUST check
//! cancellation at every suspension point via [`ScanContext::checkpoint`].

use crate::http::HttpFabric;
use crate::inventory::ScanInventory;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use webscan_core::{Finding, ScanError, ScanOptions, ScannerMetadata, Target};

/// One class of security check.
///
/// Implementations must be panic-free in spirit; a panic that does slip
/// through is caught at the task boundary and recorded as an internal
/// failure of that sub-scan only.
#[async_trait]
pub trait Scanner: Send + Sync {
    /// Unique scanner name (registry key).
    fn name(&self) -> &str;

    /// Static scheduling metadata.
    fn metadata(&self) -> ScannerMetadata;

    /// Execute the check. Returns all findings, possibly none.
    async fn run(&self, cx: &ScanContext) -> Result<Vec<Finding>, ScanError>;
}

/// Factory producing scanner instances, registered by name.
pub type ScannerFactory = Arc<dyn Fn() -> Arc<dyn Scanner> + Send + Sync>;

/// Everything a scanner may touch during a run.
///
/// The context is the only channel between a scanner and the engine:
/// it carries the cancellation token and deadline the scanner must
/// honor, the shared HTTP fabric it must use for I/O, and the per-scan
/// inventory it may read or extend.
#[derive(Clone)]
pub struct ScanContext {
    pub scan_id: Uuid,
    pub target: Target,
    pub options: ScanOptions,
    pub http: Arc<HttpFabric>,
    pub inventory: Arc<ScanInventory>,
    cancel: CancellationToken,
    deadline: Instant,
}

impl ScanContext {
    pub fn new(
        scan_id: Uuid,
        target: Target,
        options: ScanOptions,
        http: Arc<HttpFabric>,
        inventory: Arc<ScanInventory>,
        cancel: CancellationToken,
        deadline: Instant,
    ) -> Self {
        Self {
            scan_id,
            target,
            options,
            http,
            inventory,
            cancel,
            deadline,
        }
    }

    /// The cancellation token for this sub-scan.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Absolute deadline for this sub-scan.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Remaining budget, zero once the deadline passed.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Whether cancellation was requested or the deadline passed.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled() || self.remaining().is_zero()
    }

    /// Cooperative cancellation check for use at suspension points.
    ///
    /// ```no_run
    /// # use webscan_engine::scanner::ScanContext;
    /// # use webscan_core::ScanError;
    /// # async fn probe(cx: &ScanContext, urls: &[String]) -> Result<(), ScanError> {
    /// for url in urls {
    ///     cx.checkpoint()?;
    ///     // ... issue request through cx.http ...
    /// }
    /// # Ok(())
    /// # }
    /// ```
    pub fn checkpoint(&self) -> Result<(), ScanError> {
        if self.cancel.is_cancelled() {
            return Err(ScanError::cancelled());
        }
        if self.remaining().is_zero() {
            return Err(ScanError::timeout());
        }
        Ok(())
    }
}
