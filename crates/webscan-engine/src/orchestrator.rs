//! Scan orchestration
//!
//! Drives one scan from acceptance to its terminal event: staged
//! submission of scanners to the task pool, progress/ETA publication,
//! deadline enforcement, cancellation, and final aggregation.
//!
//! State machine: pending -> running -> {completed, failed, cancelled}.
//! The scan state is single-writer: only the orchestrator and the task
//! callbacks it installs mutate it, always under its mutex; observers
//! get snapshots via the engine facade and copies via the event bus.

use crate::http::HttpFabric;
use crate::inventory::ScanInventory;
use crate::pool::{TaskDisposition, TaskId, TaskPool, TaskSpec};
use crate::scanner::{ScanContext, Scanner};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use webscan_core::{
    Config, EventBus, Finding, ModuleStatusPayload, ScanError, ScanErrorKind, ScanEvent,
    ScanPhase, ScanRequest, ScanResults, ScanSnapshot, ScanStatus, ScanSummary, ScannerMetadata,
    SeverityCounters, Stage, SubScan, SubScanStatus, Target,
};

/// Budget floor below which Stage C is not admitted and running Stage-C
/// tasks are cancelled.
const STAGE_C_MIN_BUDGET: Duration = Duration::from_secs(20);

/// Grace allowed for cooperative teardown on cancel/deadline.
const CANCEL_GRACE: Duration = Duration::from_secs(2);

/// Stage-gate poll interval.
const GATE_POLL: Duration = Duration::from_millis(50);

/// Minimum completed samples before the measured mean drives the ETA.
const ETA_MIN_SAMPLES: usize = 3;

struct ScanState {
    status: ScanStatus,
    phase: ScanPhase,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    sub_scans: HashMap<String, SubScan>,
    findings: Vec<Finding>,
    finding_ids: HashSet<String>,
    counters: SeverityCounters,
    category_counts: HashMap<String, usize>,
    completed_durations_secs: Vec<f64>,
    deadline_exceeded: bool,
    terminal_count: usize,
}

/// Everything the engine keeps per scan.
pub struct ScanHandle {
    pub scan_id: Uuid,
    target: Target,
    request: ScanRequest,
    deadline_at: DateTime<Utc>,
    deadline_instant: Instant,
    accepted_at: Instant,
    evidence_max_bytes: usize,
    state: Mutex<ScanState>,
    bus: EventBus,
    /// External cancellation (CancelScan)
    cancel: CancellationToken,
    /// Internal: stops staging, heartbeat, and watchdogs at finalize
    work: CancellationToken,
    all_terminal: Notify,
    task_ids: Mutex<HashMap<String, TaskId>>,
    stage_of: HashMap<String, Stage>,
    inventory: Arc<ScanInventory>,
}

impl ScanHandle {
    pub fn new(
        scan_id: Uuid,
        request: ScanRequest,
        scanners: &[(String, ScannerMetadata)],
        config: &Config,
    ) -> Arc<Self> {
        let deadline = Duration::from_secs(request.options.global_deadline_seconds);
        let mut sub_scans = HashMap::new();
        let mut stage_of = HashMap::new();
        for (name, metadata) in scanners {
            sub_scans.insert(name.clone(), SubScan::new(scan_id, name.clone()));
            stage_of.insert(name.clone(), metadata.stage);
        }

        Arc::new(Self {
            scan_id,
            target: request.target.clone(),
            deadline_at: Utc::now() + chrono::Duration::from_std(deadline).unwrap_or_default(),
            deadline_instant: Instant::now() + deadline,
            accepted_at: Instant::now(),
            evidence_max_bytes: config.scan.evidence_max_bytes,
            state: Mutex::new(ScanState {
                status: ScanStatus::Pending,
                phase: ScanPhase::Initializing,
                started_at: None,
                ended_at: None,
                sub_scans,
                findings: Vec::new(),
                finding_ids: HashSet::new(),
                counters: SeverityCounters::default(),
                category_counts: HashMap::new(),
                completed_durations_secs: Vec::new(),
                deadline_exceeded: false,
                terminal_count: 0,
            }),
            bus: EventBus::new(
                scan_id,
                config.events.history_max,
                config.events.subscriber_queue_capacity,
            ),
            cancel: CancellationToken::new(),
            work: CancellationToken::new(),
            all_terminal: Notify::new(),
            task_ids: Mutex::new(HashMap::new()),
            stage_of,
            inventory: Arc::new(ScanInventory::default()),
            request,
        })
    }

    /// Request cancellation of this scan.
    pub fn request_cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether the scan reached a terminal status.
    pub fn is_terminal(&self) -> bool {
        self.state.lock().status.is_terminal()
    }

    /// Subscribe to this scan's events.
    pub fn subscribe(&self) -> webscan_core::EventStream {
        self.bus.subscribe()
    }

    /// Immutable snapshot for `GetScan`.
    pub fn snapshot(&self) -> ScanSnapshot {
        let state = self.state.lock();
        ScanSnapshot {
            scan_id: self.scan_id,
            target: self.target.clone(),
            scan_type: self.request.scan_type,
            status: state.status,
            phase: state.phase,
            progress: progress_of(&state),
            started_at: state.started_at,
            ended_at: state.ended_at,
            deadline_at: self.deadline_at,
            sub_scans: state.sub_scans.clone(),
            counters: state.counters,
            category_counts: state.category_counts.clone(),
            deadline_exceeded: state.deadline_exceeded,
        }
    }

    /// Findings and counters, interim or final.
    pub fn results(&self) -> ScanResults {
        let state = self.state.lock();
        ScanResults {
            scan_id: self.scan_id,
            findings: state.findings.clone(),
            counters: state.counters,
        }
    }

    fn publish(&self, event: ScanEvent) {
        self.bus.publish(event);
    }

    fn publish_progress(&self) {
        let state = self.state.lock();
        let total = state.sub_scans.len();
        let completed = state.terminal_count;
        let eta = eta_seconds(
            total,
            completed,
            &state.completed_durations_secs,
            self.request.options.per_scanner_timeout_seconds,
            self.deadline_instant,
        );
        drop(state);

        self.publish(ScanEvent::ScanProgress {
            scan_id: self.scan_id,
            progress: 100.0 * completed as f32 / total.max(1) as f32,
            completed_modules: completed,
            total_modules: total,
            eta_seconds: eta,
            timestamp: Utc::now(),
        });
    }

    /// Move a module to `running` and publish; flips the scan phase to
    /// "Running scanners" on the first module.
    fn mark_running(&self, name: &str) {
        let phase_flip = {
            let mut state = self.state.lock();
            let Some(sub) = state.sub_scans.get_mut(name) else {
                return;
            };
            if sub.status != SubScanStatus::Queued {
                return;
            }
            sub.status = SubScanStatus::Running;
            sub.start_time = Some(Utc::now());
            if state.phase == ScanPhase::Initializing {
                state.phase = ScanPhase::RunningScanners;
                true
            } else {
                false
            }
        };

        if phase_flip {
            self.publish(ScanEvent::ScanPhase {
                scan_id: self.scan_id,
                phase: ScanPhase::RunningScanners,
                timestamp: Utc::now(),
            });
        }
        self.publish(ScanEvent::ModuleStatus {
            scan_id: self.scan_id,
            module: ModuleStatusPayload {
                name: name.to_string(),
                status: SubScanStatus::Running,
                error: None,
                findings_count: None,
            },
            timestamp: Utc::now(),
        });
        self.publish(ScanEvent::CurrentTargetUrl {
            scan_id: self.scan_id,
            url: self.target.url().to_string(),
            timestamp: Utc::now(),
        });
    }

    /// Move a module to a terminal state exactly once, publish its
    /// `module_status` and a progress update, and signal full-terminal.
    fn mark_terminal(&self, name: &str, status: SubScanStatus, error: Option<ScanError>) {
        debug_assert!(status.is_terminal());
        let (published, all_done) = {
            let mut state = self.state.lock();
            let Some(sub) = state.sub_scans.get_mut(name) else {
                return;
            };
            if sub.status.is_terminal() {
                return; // terminal sub-scans are immutable
            }
            sub.status = status;
            sub.end_time = Some(Utc::now());
            sub.error = error.clone();
            let findings_count = sub.findings_count;

            if status == SubScanStatus::Completed {
                if let (Some(start), Some(end)) = (sub.start_time, sub.end_time) {
                    let secs = (end - start).num_milliseconds().max(0) as f64 / 1000.0;
                    state.completed_durations_secs.push(secs);
                }
            }
            state.terminal_count += 1;
            let all_done = state.terminal_count == state.sub_scans.len();
            (
                ModuleStatusPayload {
                    name: name.to_string(),
                    status,
                    error,
                    findings_count: Some(findings_count),
                },
                all_done,
            )
        };

        self.publish(ScanEvent::ModuleStatus {
            scan_id: self.scan_id,
            module: published,
            timestamp: Utc::now(),
        });
        self.publish_progress();
        if all_done {
            self.all_terminal.notify_waiters();
            self.all_terminal.notify_one();
        }
    }

    /// Accept a scanner's findings: truncate evidence, dedup by id,
    /// update tallies, publish `new_finding` for each accepted one.
    fn ingest_findings(&self, name: &str, findings: Vec<Finding>) {
        let mut accepted = Vec::new();
        {
            let mut state = self.state.lock();
            let mut truncated_any = false;
            for mut finding in findings {
                finding.truncate_evidence(self.evidence_max_bytes);
                truncated_any |= finding.evidence_truncated;
                if !state.finding_ids.insert(finding.id.clone()) {
                    continue;
                }
                state.counters.record(finding.severity);
                *state
                    .category_counts
                    .entry(finding.category.clone())
                    .or_insert(0) += 1;
                state.findings.push(finding.clone());
                accepted.push(finding);
            }
            if let Some(sub) = state.sub_scans.get_mut(name) {
                sub.findings_count += accepted.len();
                sub.evidence_truncated |= truncated_any;
            }
        }

        for finding in accepted {
            self.publish(ScanEvent::NewFinding {
                scan_id: self.scan_id,
                finding,
                timestamp: Utc::now(),
            });
        }
    }

    fn names_in_stage(&self, stage: Stage) -> Vec<String> {
        let mut names: Vec<String> = self
            .stage_of
            .iter()
            .filter(|(_, s)| **s == stage)
            .map(|(n, _)| n.clone())
            .collect();
        names.sort();
        names
    }

    fn stage_all_terminal(&self, stage: Stage) -> bool {
        let state = self.state.lock();
        self.stage_of
            .iter()
            .filter(|(_, s)| **s == stage)
            .all(|(name, _)| {
                state
                    .sub_scans
                    .get(name)
                    .map(|s| s.status.is_terminal())
                    .unwrap_or(true)
            })
    }

    fn remaining_budget(&self) -> Duration {
        self.deadline_instant.saturating_duration_since(Instant::now())
    }
}

fn progress_of(state: &ScanState) -> f32 {
    let total = state.sub_scans.len();
    if total == 0 {
        return 100.0;
    }
    100.0 * state.terminal_count as f32 / total as f32
}

/// ETA after `completed` of `total` modules, clamped to the remaining
/// deadline budget. Uses the mean completed duration once enough samples
/// exist; the configured per-scanner timeout before that.
fn eta_seconds(
    total: usize,
    completed: usize,
    durations: &[f64],
    per_scanner_timeout_secs: u64,
    deadline: Instant,
) -> Option<u64> {
    if completed >= total {
        return Some(0);
    }
    let per_module = if durations.len() >= ETA_MIN_SAMPLES {
        durations.iter().sum::<f64>() / durations.len() as f64
    } else {
        per_scanner_timeout_secs as f64
    };
    let estimate = (total - completed) as f64 * per_module;
    let budget = deadline.saturating_duration_since(Instant::now()).as_secs_f64();
    Some(estimate.clamp(0.0, budget) as u64)
}

/// Scan driver: owns the full lifecycle of one accepted scan.
pub struct Orchestrator {
    handle: Arc<ScanHandle>,
    pool: Arc<TaskPool>,
    fabric: Arc<HttpFabric>,
    scanners: Vec<(String, ScannerMetadata, Arc<dyn Scanner>)>,
    staged: bool,
}

impl Orchestrator {
    pub fn new(
        handle: Arc<ScanHandle>,
        pool: Arc<TaskPool>,
        fabric: Arc<HttpFabric>,
        scanners: Vec<(String, ScannerMetadata, Arc<dyn Scanner>)>,
        staged: bool,
    ) -> Self {
        Self {
            handle,
            pool,
            fabric,
            scanners,
            staged,
        }
    }

    /// Run the scan to its terminal event. Spawned by the engine.
    pub async fn run(self) {
        let handle = Arc::clone(&self.handle);
        let total = self.scanners.len();

        handle.publish(ScanEvent::ScanStarted {
            scan_id: handle.scan_id,
            target: handle.target.url().to_string(),
            total_modules: total,
            timestamp: Utc::now(),
        });
        handle.publish(ScanEvent::ScanPhase {
            scan_id: handle.scan_id,
            phase: ScanPhase::Initializing,
            timestamp: Utc::now(),
        });
        // Start-up latency guarantee: first progress event immediately,
        // well inside the 200 ms budget.
        handle.publish_progress();

        {
            let mut state = handle.state.lock();
            state.status = ScanStatus::Running;
            state.started_at = Some(Utc::now());
        }

        self.spawn_heartbeat();
        self.spawn_stage_c_watchdog();

        let staging = {
            let this = self.clone_parts();
            tokio::spawn(async move { this.submit_stages().await })
        };

        // Wait for one of: everything terminal, external cancel, deadline.
        let outcome = tokio::select! {
            _ = handle.all_terminal.notified() => Outcome::Drained,
            _ = handle.cancel.cancelled() => Outcome::Cancelled,
            _ = tokio::time::sleep(handle.remaining_budget()) => Outcome::DeadlineExpired,
        };
        staging.abort();

        match outcome {
            // Timeouts of scan-deadline-clamped tasks have already set
            // the deadline_exceeded flag; finalize carries it through.
            Outcome::Drained => self.finalize(ScanStatus::Completed, false).await,
            Outcome::Cancelled => {
                self.teardown(SubScanStatus::Cancelled, ScanError::cancelled()).await;
                self.finalize(ScanStatus::Cancelled, false).await;
            }
            Outcome::DeadlineExpired => {
                {
                    handle.state.lock().deadline_exceeded = true;
                }
                self.teardown(SubScanStatus::Timeout, ScanError::timeout()).await;
                // Whatever was aggregated by the deadline is a valid
                // result; the marker tells clients it is incomplete.
                self.finalize(ScanStatus::Completed, true).await;
            }
        }

        // The scan is terminal; retire its pool (idempotent, instant
        // once every task has drained).
        self.pool.shutdown(Duration::from_secs(2)).await;
    }

    fn clone_parts(&self) -> Orchestrator {
        Orchestrator {
            handle: Arc::clone(&self.handle),
            pool: Arc::clone(&self.pool),
            fabric: Arc::clone(&self.fabric),
            scanners: self.scanners.clone(),
            staged: self.staged,
        }
    }

    /// Submit stages in order, honoring the admission gates.
    async fn submit_stages(&self) {
        let handle = &self.handle;

        if !self.staged {
            for (name, metadata, scanner) in &self.scanners {
                self.submit_scanner(name, metadata, Arc::clone(scanner), 6).await;
            }
            return;
        }

        let deadline_total = Duration::from_secs(handle.request.options.global_deadline_seconds);
        let window_a_end = deadline_total.mul_f64(Stage::A.window_end_fraction());
        let window_b_end = deadline_total.mul_f64(Stage::B.window_end_fraction());

        for (name, metadata, scanner) in self.in_stage(Stage::A) {
            self.submit_scanner(&name, &metadata, scanner, Stage::A.priority()).await;
        }

        // Stage B: A completed, or the shared inventory is populated, or
        // the A window elapsed.
        if !self
            .wait_gate(|h| h.stage_all_terminal(Stage::A) || h.inventory.is_populated(), window_a_end)
            .await
        {
            return;
        }
        for (name, metadata, scanner) in self.in_stage(Stage::B) {
            self.submit_scanner(&name, &metadata, scanner, Stage::B.priority()).await;
        }

        if !self
            .wait_gate(|h| h.stage_all_terminal(Stage::B), window_b_end)
            .await
        {
            return;
        }

        // Stage C: needs Stage-B signals and a workable budget.
        let admit_c = handle.inventory.has_deep_signals()
            && handle.remaining_budget() >= STAGE_C_MIN_BUDGET;
        if admit_c {
            for (name, metadata, scanner) in self.in_stage(Stage::C) {
                self.submit_scanner(&name, &metadata, scanner, Stage::C.priority()).await;
            }
        } else {
            for (name, _, _) in self.in_stage(Stage::C) {
                tracing::debug!(scanner = %name, "Stage C not admitted");
                handle.mark_terminal(
                    &name,
                    SubScanStatus::Cancelled,
                    Some(ScanError::new(
                        ScanErrorKind::Deadline,
                        "stage C not admitted: missing signals or insufficient budget",
                    )),
                );
            }
        }
    }

    fn in_stage(&self, stage: Stage) -> Vec<(String, ScannerMetadata, Arc<dyn Scanner>)> {
        let names = self.handle.names_in_stage(stage);
        self.scanners
            .iter()
            .filter(|(name, _, _)| names.contains(name))
            .cloned()
            .collect()
    }

    /// Poll `ready` until it holds, the window elapses, or the scan's
    /// work is torn down. Returns false when staging should stop.
    async fn wait_gate<F>(&self, ready: F, window_end: Duration) -> bool
    where
        F: Fn(&ScanHandle) -> bool,
    {
        let handle = &self.handle;
        loop {
            if ready(handle) {
                return true;
            }
            if handle.accepted_at.elapsed() >= window_end {
                return true;
            }
            tokio::select! {
                _ = handle.work.cancelled() => return false,
                _ = tokio::time::sleep(GATE_POLL) => {}
            }
        }
    }

    async fn submit_scanner(
        &self,
        name: &str,
        metadata: &ScannerMetadata,
        scanner: Arc<dyn Scanner>,
        priority: u8,
    ) {
        let handle = Arc::clone(&self.handle);
        let stage_cap = Duration::from_secs(metadata.stage.scanner_cap_secs());
        let scanner_timeout =
            Duration::from_secs(handle.request.options.per_scanner_timeout_seconds);
        let task_deadline = (Instant::now() + stage_cap.min(scanner_timeout))
            .min(handle.deadline_instant);

        // When min() picked the scan deadline, a timeout of this task IS
        // the scan deadline expiring.
        let clamped_by_scan = task_deadline >= handle.deadline_instant;

        let run_handle = Arc::clone(&handle);
        let run_name = name.to_string();
        let fabric = Arc::clone(&self.fabric);
        let start_handle = Arc::clone(&handle);
        let start_name = name.to_string();
        let term_handle = Arc::clone(&handle);
        let term_name = name.to_string();

        let task_id = self
            .pool
            .submit(TaskSpec {
                host: handle.target.host().to_string(),
                scanner_name: name.to_string(),
                priority,
                deadline: task_deadline,
                run: Box::new(move |token| {
                    Box::pin(async move {
                        let cx = ScanContext::new(
                            run_handle.scan_id,
                            run_handle.target.clone(),
                            run_handle.request.options.clone(),
                            fabric,
                            Arc::clone(&run_handle.inventory),
                            token,
                            task_deadline,
                        );
                        let findings = scanner.run(&cx).await?;
                        run_handle.ingest_findings(&run_name, findings);
                        Ok(())
                    })
                }),
                on_start: Some(Box::new(move || start_handle.mark_running(&start_name))),
                on_terminal: Box::new(move |disposition| {
                    let (status, error) = match disposition {
                        TaskDisposition::Completed => (SubScanStatus::Completed, None),
                        TaskDisposition::Timeout => {
                            if clamped_by_scan {
                                term_handle.state.lock().deadline_exceeded = true;
                            }
                            (SubScanStatus::Timeout, Some(ScanError::timeout()))
                        }
                        TaskDisposition::Failed(e) => (SubScanStatus::Failed, Some(e)),
                        TaskDisposition::Cancelled(e) => (SubScanStatus::Cancelled, Some(e)),
                    };
                    term_handle.mark_terminal(&term_name, status, error);
                }),
            })
            .await;

        self.handle.task_ids.lock().insert(name.to_string(), task_id);
    }

    /// 1 Hz progress heartbeat while the scan runs.
    fn spawn_heartbeat(&self) {
        let handle = Arc::clone(&self.handle);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(1));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tick.tick().await; // immediate first tick consumed
            loop {
                tokio::select! {
                    _ = handle.work.cancelled() => return,
                    _ = tick.tick() => {}
                }
                if handle.is_terminal() {
                    return;
                }
                handle.publish_progress();
            }
        });
    }

    /// Cancels still-running Stage-C tasks when the remaining budget
    /// drops to the floor.
    fn spawn_stage_c_watchdog(&self) {
        let handle = Arc::clone(&self.handle);
        let pool = Arc::clone(&self.pool);
        tokio::spawn(async move {
            let fire_in = handle
                .remaining_budget()
                .saturating_sub(STAGE_C_MIN_BUDGET);
            tokio::select! {
                _ = handle.work.cancelled() => return,
                _ = tokio::time::sleep(fire_in) => {}
            }
            let victims: Vec<TaskId> = {
                let state = handle.state.lock();
                let ids = handle.task_ids.lock();
                handle
                    .stage_of
                    .iter()
                    .filter(|(_, stage)| **stage == Stage::C)
                    .filter(|(name, _)| {
                        state
                            .sub_scans
                            .get(*name)
                            .map(|s| !s.status.is_terminal())
                            .unwrap_or(false)
                    })
                    .filter_map(|(name, _)| ids.get(name).copied())
                    .collect()
            };
            for id in victims {
                tracing::debug!(task_id = id, "Cancelling stage-C task near deadline");
                pool.cancel(id);
            }
        });
    }

    /// Cancel everything outstanding and force-mark whatever does not
    /// reach a terminal state within the grace window.
    async fn teardown(&self, status: SubScanStatus, error: ScanError) {
        let handle = &self.handle;
        {
            let ids = handle.task_ids.lock();
            for id in ids.values() {
                self.pool.cancel(*id);
            }
        }

        // Wait up to the grace window for cooperative completion.
        let grace_deadline = Instant::now() + CANCEL_GRACE;
        loop {
            let done = {
                let state = handle.state.lock();
                state.terminal_count == state.sub_scans.len()
            };
            if done || Instant::now() >= grace_deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        let stragglers: Vec<String> = {
            let state = handle.state.lock();
            state
                .sub_scans
                .iter()
                .filter(|(_, s)| !s.status.is_terminal())
                .map(|(name, _)| name.clone())
                .collect()
        };
        for name in stragglers {
            handle.mark_terminal(&name, status, Some(error.clone()));
        }
    }

    /// Publish the aggregation tail and the single terminal event.
    async fn finalize(&self, status: ScanStatus, deadline_exceeded: bool) {
        let handle = &self.handle;
        {
            let state = handle.state.lock();
            if state.status.is_terminal() {
                return;
            }
        }

        handle.publish(ScanEvent::ScanPhase {
            scan_id: handle.scan_id,
            phase: ScanPhase::AggregatingResults,
            timestamp: Utc::now(),
        });

        let (summary, counters) = {
            let mut state = handle.state.lock();
            state.status = status;
            state.ended_at = Some(Utc::now());
            state.deadline_exceeded |= deadline_exceeded;
            state.phase = match status {
                ScanStatus::Completed => ScanPhase::Completed,
                ScanStatus::Cancelled => ScanPhase::Cancelled,
                _ => ScanPhase::Failed,
            };

            // Recompute tallies from the dedup set; incremental counts
            // must agree, this is the authoritative pass.
            let mut counters = SeverityCounters::default();
            for finding in &state.findings {
                counters.record(finding.severity);
            }
            state.counters = counters;

            let completed_modules = state
                .sub_scans
                .values()
                .filter(|s| s.status == SubScanStatus::Completed)
                .count();
            let failed_modules = state
                .sub_scans
                .values()
                .filter(|s| {
                    matches!(s.status, SubScanStatus::Failed | SubScanStatus::Timeout)
                })
                .count();
            let duration_secs = state
                .started_at
                .zip(state.ended_at)
                .map(|(s, e)| (e - s).num_milliseconds().max(0) as f64 / 1000.0)
                .unwrap_or(0.0);

            (
                ScanSummary {
                    status,
                    total_modules: state.sub_scans.len(),
                    completed_modules,
                    failed_modules,
                    findings_total: state.findings.len(),
                    duration_secs,
                    deadline_exceeded: state.deadline_exceeded,
                },
                state.counters,
            )
        };

        handle.publish_progress();
        handle.publish(ScanEvent::ScanPhase {
            scan_id: handle.scan_id,
            phase: {
                let state = handle.state.lock();
                state.phase
            },
            timestamp: Utc::now(),
        });
        handle.publish(ScanEvent::ScanCompleted {
            scan_id: handle.scan_id,
            summary,
            counters,
            timestamp: Utc::now(),
        });

        handle.work.cancel();
        tracing::info!(
            scan_id = %handle.scan_id,
            ?status,
            findings = counters.total(),
            "Scan finished"
        );
    }
}

enum Outcome {
    Drained,
    Cancelled,
    DeadlineExpired,
}
