use crate::errors::ScanError;
use crate::types::{Finding, ScanPhase, ScanSummary, SeverityCounters, SubScanStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Per-module status payload for `module_status` events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleStatusPayload {
    pub name: String,
    pub status: SubScanStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ScanError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub findings_count: Option<usize>,
}

/// Main scan event enum covering the full scan lifecycle
///
/// Events are `Clone + Send + Sync` for multi-subscriber dispatch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScanEvent {
    /// Emitted once when a scan is accepted, before any module runs.
    ScanStarted {
        scan_id: Uuid,
        target: String,
        total_modules: usize,
        timestamp: DateTime<Utc>,
    },

    /// Phase transition (Initializing, Running scanners, ...).
    ScanPhase {
        scan_id: Uuid,
        phase: ScanPhase,
        timestamp: DateTime<Utc>,
    },

    /// Periodic progress update, at least 1 Hz while running.
    ScanProgress {
        scan_id: Uuid,
        /// 0..=100, terminal sub-scans over total
        progress: f32,
        completed_modules: usize,
        total_modules: usize,
        eta_seconds: Option<u64>,
        timestamp: DateTime<Utc>,
    },

    /// A module changed status (running, then exactly one terminal state).
    ModuleStatus {
        scan_id: Uuid,
        #[serde(flatten)]
        module: ModuleStatusPayload,
        timestamp: DateTime<Utc>,
    },

    /// A finding was accepted into the scan's dedup set.
    NewFinding {
        scan_id: Uuid,
        finding: Finding,
        timestamp: DateTime<Utc>,
    },

    /// URL currently being probed, for live UIs.
    CurrentTargetUrl {
        scan_id: Uuid,
        url: String,
        timestamp: DateTime<Utc>,
    },

    /// Terminal event: exactly one per scan, last on every subscription.
    ScanCompleted {
        scan_id: Uuid,
        summary: ScanSummary,
        counters: SeverityCounters,
        timestamp: DateTime<Utc>,
    },

    /// Delivered to a subscriber that fell behind; `dropped` events were
    /// discarded from its queue. The client should resync via a status
    /// fetch. Never stored in history.
    Lagged {
        scan_id: Uuid,
        dropped: u64,
        timestamp: DateTime<Utc>,
    },
}

/// Event discriminant for filtering and statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanEventType {
    ScanStarted,
    ScanPhase,
    ScanProgress,
    ModuleStatus,
    NewFinding,
    CurrentTargetUrl,
    ScanCompleted,
    Lagged,
}

impl ScanEvent {
    /// The scan this event belongs to.
    pub fn scan_id(&self) -> Uuid {
        match self {
            ScanEvent::ScanStarted { scan_id, .. }
            | ScanEvent::ScanPhase { scan_id, .. }
            | ScanEvent::ScanProgress { scan_id, .. }
            | ScanEvent::ModuleStatus { scan_id, .. }
            | ScanEvent::NewFinding { scan_id, .. }
            | ScanEvent::CurrentTargetUrl { scan_id, .. }
            | ScanEvent::ScanCompleted { scan_id, .. }
            | ScanEvent::Lagged { scan_id, .. } => *scan_id,
        }
    }

    /// Event timestamp.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            ScanEvent::ScanStarted { timestamp, .. }
            | ScanEvent::ScanPhase { timestamp, .. }
            | ScanEvent::ScanProgress { timestamp, .. }
            | ScanEvent::ModuleStatus { timestamp, .. }
            | ScanEvent::NewFinding { timestamp, .. }
            | ScanEvent::CurrentTargetUrl { timestamp, .. }
            | ScanEvent::ScanCompleted { timestamp, .. }
            | ScanEvent::Lagged { timestamp, .. } => *timestamp,
        }
    }

    /// Event discriminant.
    pub fn event_type(&self) -> ScanEventType {
        match self {
            ScanEvent::ScanStarted { .. } => ScanEventType::ScanStarted,
            ScanEvent::ScanPhase { .. } => ScanEventType::ScanPhase,
            ScanEvent::ScanProgress { .. } => ScanEventType::ScanProgress,
            ScanEvent::ModuleStatus { .. } => ScanEventType::ModuleStatus,
            ScanEvent::NewFinding { .. } => ScanEventType::NewFinding,
            ScanEvent::CurrentTargetUrl { .. } => ScanEventType::CurrentTargetUrl,
            ScanEvent::ScanCompleted { .. } => ScanEventType::ScanCompleted,
            ScanEvent::Lagged { .. } => ScanEventType::Lagged,
        }
    }

    /// Whether this is the terminal event of its scan.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ScanEvent::ScanCompleted { .. })
    }

    /// Basic structural validation before publication.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            ScanEvent::ScanProgress {
                progress,
                completed_modules,
                total_modules,
                ..
            } => {
                if !(0.0..=100.0).contains(progress) {
                    return Err(format!("progress {} out of range", progress));
                }
                if completed_modules > total_modules {
                    return Err(format!(
                        "completed_modules {} exceeds total_modules {}",
                        completed_modules, total_modules
                    ));
                }
                Ok(())
            }
            ScanEvent::ScanStarted { total_modules, .. } => {
                if *total_modules == 0 {
                    return Err("scan_started with zero modules".to_string());
                }
                Ok(())
            }
            ScanEvent::ModuleStatus { module, .. } => {
                if module.name.is_empty() {
                    return Err("module_status with empty name".to_string());
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Short human-readable form for logs.
    pub fn display(&self) -> String {
        match self {
            ScanEvent::ScanStarted {
                target,
                total_modules,
                ..
            } => format!("scan started against {} ({} modules)", target, total_modules),
            ScanEvent::ScanPhase { phase, .. } => format!("phase: {}", phase),
            ScanEvent::ScanProgress {
                progress,
                completed_modules,
                total_modules,
                ..
            } => format!(
                "progress {:.0}% ({}/{})",
                progress, completed_modules, total_modules
            ),
            ScanEvent::ModuleStatus { module, .. } => {
                format!("module {} -> {}", module.name, module.status)
            }
            ScanEvent::NewFinding { finding, .. } => {
                format!("finding [{}] {}", finding.severity, finding.title)
            }
            ScanEvent::CurrentTargetUrl { url, .. } => format!("probing {}", url),
            ScanEvent::ScanCompleted { summary, .. } => {
                format!(
                    "scan completed: {:?}, {} findings",
                    summary.status, summary.findings_total
                )
            }
            ScanEvent::Lagged { dropped, .. } => format!("subscriber lagged, {} dropped", dropped),
        }
    }
}
