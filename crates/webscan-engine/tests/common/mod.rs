//! Shared test scaffolding: configurable mock scanners.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;
use webscan_core::{
    Finding, Intensity, ScanError, ScannerMetadata, Severity, Stage,
};
use webscan_engine::{ScanContext, Scanner, ScannerRegistry};

static TRACING: Once = Once::new();

/// Install a test subscriber once; `RUST_LOG` controls verbosity.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// What a mock scanner does when run.
#[derive(Clone)]
pub enum Behavior {
    /// Return these findings immediately
    Findings(Vec<Finding>),
    /// Cooperative sleep, then return no findings
    Sleep(Duration),
    /// Cooperative sleep, then return these findings
    SleepThenFindings(Duration, Vec<Finding>),
    /// Fail with this error
    Fail(ScanError),
    /// Track concurrency (current, peak) while sleeping
    TrackConcurrency(Arc<AtomicUsize>, Arc<AtomicUsize>, Duration),
    /// Mark form signals in the shared inventory, then succeed
    MarkForms,
}

pub struct MockScanner {
    pub name: String,
    pub metadata: ScannerMetadata,
    pub behavior: Behavior,
}

#[async_trait]
impl Scanner for MockScanner {
    fn name(&self) -> &str {
        &self.name
    }

    fn metadata(&self) -> ScannerMetadata {
        self.metadata.clone()
    }

    async fn run(&self, cx: &ScanContext) -> Result<Vec<Finding>, ScanError> {
        match &self.behavior {
            Behavior::Findings(findings) => Ok(findings.clone()),
            Behavior::Sleep(duration) => {
                cooperative_sleep(cx, *duration).await?;
                Ok(Vec::new())
            }
            Behavior::SleepThenFindings(duration, findings) => {
                cooperative_sleep(cx, *duration).await?;
                Ok(findings.clone())
            }
            Behavior::Fail(error) => Err(error.clone()),
            Behavior::TrackConcurrency(current, peak, duration) => {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                let result = cooperative_sleep(cx, *duration).await;
                current.fetch_sub(1, Ordering::SeqCst);
                result?;
                Ok(Vec::new())
            }
            Behavior::MarkForms => {
                cx.inventory
                    .record_url(format!("{}login", cx.target.url()));
                cx.inventory.mark_forms_seen();
                Ok(Vec::new())
            }
        }
    }
}

async fn cooperative_sleep(cx: &ScanContext, duration: Duration) -> Result<(), ScanError> {
    tokio::select! {
        _ = cx.cancellation().cancelled() => Err(ScanError::cancelled()),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

pub fn meta(stage: Stage, intensity: Intensity) -> ScannerMetadata {
    ScannerMetadata {
        owasp_category: "A05:2021 Security Misconfiguration".to_string(),
        intensity,
        stage,
        long_running: false,
    }
}

pub fn finding(scanner: &str, title: &str, severity: Severity) -> Finding {
    Finding {
        id: Finding::compute_id(scanner, title, "https://example.test/", title),
        title: title.to_string(),
        severity,
        cwe: Some("CWE-693".to_string()),
        cvss: Some(5.3),
        category: "A05:2021 Security Misconfiguration".to_string(),
        location: "https://example.test/".to_string(),
        description: format!("{} observed during response inspection", title),
        remediation: "Configure the relevant response header".to_string(),
        evidence: "HTTP/1.1 200 OK".to_string(),
        evidence_truncated: false,
        discovered_at: Utc::now(),
        scanner_name: scanner.to_string(),
    }
}

/// Register a mock scanner under `name`.
pub fn register(
    registry: &ScannerRegistry,
    name: &str,
    metadata: ScannerMetadata,
    behavior: Behavior,
) {
    let scanner_name = name.to_string();
    let scanner_meta = metadata.clone();
    registry.register(name, metadata, move || {
        Arc::new(MockScanner {
            name: scanner_name.clone(),
            metadata: scanner_meta.clone(),
            behavior: behavior.clone(),
        }) as Arc<dyn Scanner>
    });
}
