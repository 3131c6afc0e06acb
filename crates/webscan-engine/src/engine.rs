//! Engine facade
//!
//! The embedding surface of the scan engine: accept scan requests,
//! expose snapshots, results, cancellation, event subscriptions, the
//! scanner catalog, and fabric/pool metrics.
//!
//! One engine owns one shared HTTP fabric, one process-wide circuit
//! breaker and memory monitor, and a bounded task pool per scan sized
//! from the request's concurrency options. Construct it inside a Tokio
//! runtime; background loops are spawned at creation.

use crate::http::{HttpFabric, HttpMetricsSnapshot};
use crate::orchestrator::{Orchestrator, ScanHandle};
use crate::pool::{PoolStats, TaskPool};
use crate::registry::ScannerRegistry;
use crate::scanner::Scanner;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;
use webscan_core::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use webscan_core::resource_monitor::{ResourceMonitor, ResourceMonitorConfig};
use webscan_core::{
    Config, Error, EventStream, Result, ScanRequest, ScanResults, ScanSnapshot, ScanType,
    ScannerMetadata,
};

/// Counters exposed by `Metrics()`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineMetrics {
    pub http: HttpMetricsSnapshot,
    pub concurrency: PoolStats,
}

struct ScanEntry {
    handle: Arc<ScanHandle>,
    pool: Arc<TaskPool>,
}

/// Embedded scan engine. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct ScanEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    config: Config,
    registry: Arc<ScannerRegistry>,
    fabric: Arc<HttpFabric>,
    breaker: Arc<CircuitBreaker>,
    monitor: Arc<Mutex<ResourceMonitor>>,
    scans: DashMap<Uuid, ScanEntry>,
}

impl ScanEngine {
    /// Build an engine over a populated scanner registry.
    pub fn new(config: Config, registry: Arc<ScannerRegistry>) -> Result<Self> {
        config.validate()?;
        let fabric = Arc::new(HttpFabric::new(config.http.clone())?);
        let monitor = Arc::new(Mutex::new(ResourceMonitor::new(ResourceMonitorConfig {
            memory_soft_limit: config.scan.memory_soft_limit_bytes,
            ..Default::default()
        })));

        Ok(Self {
            inner: Arc::new(EngineInner {
                fabric,
                registry,
                breaker: Arc::new(CircuitBreaker::new(CircuitBreakerConfig::default())),
                monitor,
                scans: DashMap::new(),
                config,
            }),
        })
    }

    /// Accept a scan: validate synchronously, return the id, and start
    /// execution in the background.
    pub fn start_scan(&self, mut request: ScanRequest) -> Result<Uuid> {
        request.validate()?;
        let inner = &self.inner;

        // Hard caps from engine configuration bound request options
        request.options.global_deadline_seconds = request
            .options
            .global_deadline_seconds
            .min(inner.config.scan.global_hard_cap_seconds);
        request.options.per_scanner_timeout_seconds = request
            .options
            .per_scanner_timeout_seconds
            .min(inner.config.scan.per_scanner_cap_seconds);
        request.options.per_host_max_concurrent = request
            .options
            .per_host_max_concurrent
            .min(inner.config.scan.per_host_max_concurrency);

        let running = inner
            .scans
            .iter()
            .filter(|entry| !entry.handle.is_terminal())
            .count();
        if running >= inner.config.scan.max_concurrent_scans {
            return Err(Error::PreconditionFailed(format!(
                "engine at capacity: {} scans already running",
                running
            )));
        }

        let selected = self.select_scanners(&request)?;
        let scan_id = Uuid::new_v4();

        let metadata: Vec<(String, ScannerMetadata)> = selected
            .iter()
            .map(|(name, meta, _)| (name.clone(), meta.clone()))
            .collect();
        let handle = ScanHandle::new(scan_id, request.clone(), &metadata, &inner.config);

        let pool = TaskPool::with_shared(
            request.options.max_concurrent,
            request.options.per_host_max_concurrent,
            Arc::clone(&inner.breaker),
            Arc::clone(&inner.monitor),
        );

        inner.scans.insert(
            scan_id,
            ScanEntry {
                handle: Arc::clone(&handle),
                pool: Arc::clone(&pool),
            },
        );

        let orchestrator = Orchestrator::new(
            handle,
            pool,
            Arc::clone(&inner.fabric),
            selected,
            inner.config.scan.staged_scheduling,
        );
        tokio::spawn(orchestrator.run());

        tracing::info!(%scan_id, target = %request.target, "Scan accepted");
        Ok(scan_id)
    }

    /// Status, progress, counters, and per-module statuses.
    pub fn get_scan(&self, scan_id: Uuid) -> Result<ScanSnapshot> {
        self.handle(scan_id).map(|h| h.snapshot())
    }

    /// Findings and counters; final once `scan_completed` was published.
    pub fn get_results(&self, scan_id: Uuid) -> Result<ScanResults> {
        self.handle(scan_id).map(|h| h.results())
    }

    /// Cancel a scan. Idempotent; returns once the scan reached a
    /// terminal state or the 2 s grace expired.
    pub async fn cancel_scan(&self, scan_id: Uuid) -> Result<()> {
        let handle = self.handle(scan_id)?;
        if handle.is_terminal() {
            return Ok(());
        }
        handle.request_cancel();

        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if handle.is_terminal() {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        Ok(())
    }

    /// History replay followed by live events until the terminal event.
    pub fn subscribe(&self, scan_id: Uuid) -> Result<EventStream> {
        self.handle(scan_id).map(|h| h.subscribe())
    }

    /// Available scanners and their metadata.
    pub fn list_scanners(&self) -> Vec<(String, ScannerMetadata)> {
        self.inner.registry.list()
    }

    /// Fabric and pool counters, aggregated across scans.
    pub fn metrics(&self) -> EngineMetrics {
        let mut concurrency = PoolStats::default();
        let mut latency_sum = 0.0;
        let mut latency_count = 0u32;
        for entry in self.inner.scans.iter() {
            let stats = entry.pool.stats();
            concurrency.queued += stats.queued;
            concurrency.active += stats.active;
            concurrency.completed += stats.completed;
            concurrency.failed += stats.failed;
            concurrency.timeouts += stats.timeouts;
            concurrency.cancelled += stats.cancelled;
            for (host, n) in stats.per_host_active {
                *concurrency.per_host_active.entry(host).or_insert(0) += n;
            }
            if let Some(latency) = stats.avg_latency_ms {
                latency_sum += latency;
                latency_count += 1;
            }
        }
        if latency_count > 0 {
            concurrency.avg_latency_ms = Some(latency_sum / latency_count as f64);
        }
        EngineMetrics {
            http: self.inner.fabric.metrics().snapshot(),
            concurrency,
        }
    }

    /// Drain every scan and close the fabric.
    pub async fn shutdown(&self, grace: Duration) {
        let handles: Vec<(Arc<ScanHandle>, Arc<TaskPool>)> = self
            .inner
            .scans
            .iter()
            .map(|e| (Arc::clone(&e.handle), Arc::clone(&e.pool)))
            .collect();

        for (handle, _) in &handles {
            if !handle.is_terminal() {
                handle.request_cancel();
            }
        }
        for (_, pool) in &handles {
            pool.shutdown(grace).await;
        }
        self.inner.fabric.shutdown();
        tracing::info!("Engine shut down");
    }

    fn handle(&self, scan_id: Uuid) -> Result<Arc<ScanHandle>> {
        self.inner
            .scans
            .get(&scan_id)
            .map(|e| Arc::clone(&e.handle))
            .ok_or_else(|| Error::NotFound(format!("scan {}", scan_id)))
    }

    fn select_scanners(
        &self,
        request: &ScanRequest,
    ) -> Result<Vec<(String, ScannerMetadata, Arc<dyn Scanner>)>> {
        let registry = &self.inner.registry;
        let names: Vec<String> = match request.scan_type {
            ScanType::Full => registry.names(),
            ScanType::Quick => registry.names_for_quick(),
            ScanType::Custom => request.options.scanners.clone().unwrap_or_default(),
        };

        if names.is_empty() {
            return Err(Error::InvalidArgument(
                "no scanners selected for this scan".to_string(),
            ));
        }

        let mut selected = Vec::with_capacity(names.len());
        for name in names {
            let scanner = registry.get(&name)?; // unknown name -> invalid_argument
            let metadata = scanner.metadata();
            selected.push((name, metadata, scanner));
        }
        Ok(selected)
    }
}
