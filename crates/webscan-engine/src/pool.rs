//! Bounded task pool with priorities and per-host caps
//!
//! Executes scanner tasks under a global concurrency cap and per-host
//! caps, highest priority first with FIFO tie-break. Admission is
//! deadline-aware: a task that cannot finish before its deadline (by the
//! scanner's observed latency) is skipped instead of wasting a slot.
//! The global cap sheds 25% while process memory sits above the soft
//! limit, floored at 2 slots.
//!
//! Each task runs under its own cancellation token and deadline; a task
//! that exceeds its deadline is cancelled and recorded as a timeout, a
//! task that panics is recorded as failed, and neither affects siblings.
//! Run outcomes feed the per-scanner circuit breaker: an open circuit
//! rejects submission outright.

use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use webscan_core::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use webscan_core::resource_monitor::{ResourceMonitor, ResourceMonitorConfig};
use webscan_core::{ScanError, ScanErrorKind};

/// Admission loop tick
const ADMISSION_TICK: Duration = Duration::from_millis(20);

/// EWMA weight for latency tracking (30% newest sample)
const LATENCY_EWMA_ALPHA: f64 = 0.3;

/// Cap multiplier under memory pressure
const PRESSURE_SHED_FACTOR: f64 = 0.75;

/// Smallest cap the shedder may reach
const MIN_EFFECTIVE_CAP: usize = 2;

/// Grace given to a cancelled task before it is aborted
const CANCEL_GRACE: Duration = Duration::from_secs(2);

/// Pool-assigned task identity.
pub type TaskId = u64;

/// Terminal disposition of a task, delivered exactly once.
#[derive(Debug, Clone)]
pub enum TaskDisposition {
    Completed,
    Failed(ScanError),
    Timeout,
    Cancelled(ScanError),
}

/// Callback invoked when a task starts running.
pub type StartCallback = Box<dyn FnOnce() + Send>;
/// Callback invoked with the task's terminal disposition.
pub type TerminalCallback = Box<dyn FnOnce(TaskDisposition) + Send>;
/// The task body; receives its cancellation token.
pub type TaskRun =
    Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, Result<(), ScanError>> + Send>;

/// A unit of work for the pool.
pub struct TaskSpec {
    pub host: String,
    pub scanner_name: String,
    /// 1..=10, clamped on submit
    pub priority: u8,
    pub deadline: Instant,
    pub run: TaskRun,
    pub on_start: Option<StartCallback>,
    pub on_terminal: TerminalCallback,
}

/// Pool counters exposed via `Stats()`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolStats {
    pub queued: usize,
    pub active: usize,
    pub completed: u64,
    pub failed: u64,
    pub timeouts: u64,
    pub cancelled: u64,
    pub per_host_active: HashMap<String, usize>,
    pub avg_latency_ms: Option<f64>,
}

struct QueuedTask {
    id: TaskId,
    seq: u64,
    host: String,
    scanner_name: String,
    priority: u8,
    deadline: Instant,
    run: Option<TaskRun>,
    on_start: Option<StartCallback>,
    on_terminal: Option<TerminalCallback>,
}

struct ActiveTask {
    host: String,
    cancel: CancellationToken,
}

struct PoolState {
    queue: Vec<QueuedTask>,
    active: HashMap<TaskId, ActiveTask>,
    per_host_active: HashMap<String, usize>,
    completed: u64,
    failed: u64,
    timeouts: u64,
    cancelled: u64,
    latency_ewma_ms: Option<f64>,
    per_scanner_latency_ms: HashMap<String, f64>,
    shutting_down: bool,
}

/// Bounded priority task pool.
pub struct TaskPool {
    state: Arc<Mutex<PoolState>>,
    max_concurrent: usize,
    per_host_max: usize,
    breaker: Arc<CircuitBreaker>,
    monitor: Arc<Mutex<ResourceMonitor>>,
    notify: Arc<Notify>,
    next_id: AtomicU64,
    next_seq: AtomicU64,
    admission_cancel: CancellationToken,
    weak_self: Weak<TaskPool>,
}

impl TaskPool {
    /// Create a pool and start its admission loop.
    pub fn new(max_concurrent: usize, per_host_max: usize) -> Arc<Self> {
        Self::with_settings(
            max_concurrent,
            per_host_max,
            CircuitBreakerConfig::default(),
            ResourceMonitorConfig::default(),
        )
    }

    pub fn with_settings(
        max_concurrent: usize,
        per_host_max: usize,
        breaker_config: CircuitBreakerConfig,
        monitor_config: ResourceMonitorConfig,
    ) -> Arc<Self> {
        Self::with_shared(
            max_concurrent,
            per_host_max,
            Arc::new(CircuitBreaker::new(breaker_config)),
            Arc::new(Mutex::new(ResourceMonitor::new(monitor_config))),
        )
    }

    /// Build a pool around breaker and monitor instances shared with
    /// other pools. Breaker state is per-process: one engine's scans all
    /// feed the same per-scanner windows.
    pub fn with_shared(
        max_concurrent: usize,
        per_host_max: usize,
        breaker: Arc<CircuitBreaker>,
        monitor: Arc<Mutex<ResourceMonitor>>,
    ) -> Arc<Self> {
        let pool = Arc::new_cyclic(|weak| Self {
            state: Arc::new(Mutex::new(PoolState {
                queue: Vec::new(),
                active: HashMap::new(),
                per_host_active: HashMap::new(),
                completed: 0,
                failed: 0,
                timeouts: 0,
                cancelled: 0,
                latency_ewma_ms: None,
                per_scanner_latency_ms: HashMap::new(),
                shutting_down: false,
            })),
            max_concurrent: max_concurrent.max(1),
            per_host_max: per_host_max.max(1),
            breaker,
            monitor,
            notify: Arc::new(Notify::new()),
            next_id: AtomicU64::new(1),
            next_seq: AtomicU64::new(0),
            admission_cancel: CancellationToken::new(),
            weak_self: weak.clone(),
        });

        // The admission loop holds only a weak reference: dropping the
        // last pool handle ends the loop instead of leaking it.
        let weak = Arc::downgrade(&pool);
        let notify = Arc::clone(&pool.notify);
        let cancel = pool.admission_cancel.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(ADMISSION_TICK);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tick.tick() => {}
                    _ = notify.notified() => {}
                }
                match weak.upgrade() {
                    Some(pool) => pool.admit_ready(),
                    None => return,
                }
            }
        });
        pool
    }

    /// Enqueue a task. The circuit breaker may reject it synchronously;
    /// the terminal callback still fires exactly once either way.
    pub async fn submit(&self, mut spec: TaskSpec) -> TaskId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        spec.priority = spec.priority.clamp(1, 10);

        if !self.breaker.should_attempt(&spec.scanner_name).await {
            tracing::debug!(scanner = %spec.scanner_name, "Submission rejected: circuit open");
            let mut state = self.state.lock();
            state.failed += 1;
            drop(state);
            (spec.on_terminal)(TaskDisposition::Failed(ScanError::new(
                ScanErrorKind::CircuitOpen,
                format!("scanner {} suppressed by circuit breaker", spec.scanner_name),
            )));
            return id;
        }

        {
            let mut state = self.state.lock();
            if state.shutting_down {
                drop(state);
                (spec.on_terminal)(TaskDisposition::Cancelled(ScanError::cancelled()));
                return id;
            }
            state.queue.push(QueuedTask {
                id,
                seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
                host: spec.host,
                scanner_name: spec.scanner_name,
                priority: spec.priority,
                deadline: spec.deadline,
                run: Some(spec.run),
                on_start: spec.on_start,
                on_terminal: Some(spec.on_terminal),
            });
        }
        self.notify.notify_one();
        id
    }

    /// Cancel a task. Idempotent: unknown or already-terminal ids are a
    /// successful no-op.
    pub fn cancel(&self, task_id: TaskId) {
        let mut state = self.state.lock();
        if let Some(pos) = state.queue.iter().position(|t| t.id == task_id) {
            let mut task = state.queue.remove(pos);
            state.cancelled += 1;
            drop(state);
            if let Some(cb) = task.on_terminal.take() {
                cb(TaskDisposition::Cancelled(ScanError::cancelled()));
            }
            return;
        }
        if let Some(active) = state.active.get(&task_id) {
            active.cancel.cancel();
        }
    }

    /// Cancel every queued and running task (scan-level cancellation).
    pub fn cancel_all(&self) {
        let mut state = self.state.lock();
        let drained: Vec<QueuedTask> = state.queue.drain(..).collect();
        state.cancelled += drained.len() as u64;
        let tokens: Vec<CancellationToken> =
            state.active.values().map(|a| a.cancel.clone()).collect();
        drop(state);

        for mut task in drained {
            if let Some(cb) = task.on_terminal.take() {
                cb(TaskDisposition::Cancelled(ScanError::cancelled()));
            }
        }
        for token in tokens {
            token.cancel();
        }
    }

    /// Current pool statistics.
    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            queued: state.queue.len(),
            active: state.active.len(),
            completed: state.completed,
            failed: state.failed,
            timeouts: state.timeouts,
            cancelled: state.cancelled,
            per_host_active: state
                .per_host_active
                .iter()
                .filter(|(_, n)| **n > 0)
                .map(|(h, n)| (h.clone(), *n))
                .collect(),
            avg_latency_ms: state.latency_ewma_ms,
        }
    }

    /// Breaker handle (stats surface, tests).
    pub fn breaker(&self) -> Arc<CircuitBreaker> {
        Arc::clone(&self.breaker)
    }

    /// Stop admitting, give running tasks `grace`, then cancel them and
    /// wait for the pool to drain.
    pub async fn shutdown(&self, grace: Duration) {
        {
            let mut state = self.state.lock();
            state.shutting_down = true;
            let drained: Vec<QueuedTask> = state.queue.drain(..).collect();
            state.cancelled += drained.len() as u64;
            drop(state);
            for mut task in drained {
                if let Some(cb) = task.on_terminal.take() {
                    cb(TaskDisposition::Cancelled(ScanError::cancelled()));
                }
            }
        }

        let drained = self.wait_for_drain(grace).await;
        if !drained {
            tracing::warn!("Shutdown grace expired, cancelling in-flight tasks");
            let tokens: Vec<CancellationToken> = {
                let state = self.state.lock();
                state.active.values().map(|a| a.cancel.clone()).collect()
            };
            for token in tokens {
                token.cancel();
            }
            self.wait_for_drain(Duration::from_secs(2)).await;
        }
        self.admission_cancel.cancel();
    }

    async fn wait_for_drain(&self, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        loop {
            if self.state.lock().active.is_empty() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Effective global cap under current memory pressure.
    fn effective_cap(&self) -> usize {
        let over_limit = self.monitor.lock().check();
        if over_limit {
            (((self.max_concurrent as f64) * PRESSURE_SHED_FACTOR) as usize)
                .max(MIN_EFFECTIVE_CAP)
                .min(self.max_concurrent)
        } else {
            self.max_concurrent
        }
    }

    fn admit_ready(&self) {
        let cap = self.effective_cap();
        loop {
            let admitted = {
                let mut state = self.state.lock();
                if state.active.len() >= cap || state.queue.is_empty() {
                    break;
                }

                // Highest priority whose host has headroom; FIFO within a
                // priority via submission sequence.
                let candidate = state
                    .queue
                    .iter()
                    .enumerate()
                    .filter(|(_, t)| {
                        state.per_host_active.get(&t.host).copied().unwrap_or(0)
                            < self.per_host_max
                    })
                    .max_by(|(_, a), (_, b)| {
                        a.priority.cmp(&b.priority).then(b.seq.cmp(&a.seq))
                    })
                    .map(|(idx, _)| idx);

                let Some(idx) = candidate else { break };
                let task = state.queue.remove(idx);

                // Deadline-aware admission: skip when the scanner's
                // observed latency says it cannot finish in time. With
                // no samples yet the task is admitted optimistically
                // and bounded by its own deadline.
                let estimate = state
                    .per_scanner_latency_ms
                    .get(&task.scanner_name)
                    .map(|ms| Duration::from_millis(*ms as u64));
                if estimate.is_some_and(|est| Instant::now() + est > task.deadline) {
                    state.cancelled += 1;
                    tracing::debug!(
                        scanner = %task.scanner_name,
                        "Skipping task: cannot finish before deadline"
                    );
                    Some((task, false))
                } else {
                    let token = CancellationToken::new();
                    state.active.insert(
                        task.id,
                        ActiveTask {
                            host: task.host.clone(),
                            cancel: token.clone(),
                        },
                    );
                    *state.per_host_active.entry(task.host.clone()).or_insert(0) += 1;
                    Some((task, true))
                }
            };

            match admitted {
                None => break,
                Some((mut task, false)) => {
                    if let Some(cb) = task.on_terminal.take() {
                        cb(TaskDisposition::Cancelled(ScanError::new(
                            ScanErrorKind::Deadline,
                            "skipped at admission: deadline unreachable",
                        )));
                    }
                }
                Some((task, true)) => {
                    let token = {
                        let state = self.state.lock();
                        state.active.get(&task.id).map(|a| a.cancel.clone())
                    };
                    if let Some(token) = token {
                        self.dispatch(task, token);
                    }
                }
            }
        }
    }

    fn dispatch(&self, mut task: QueuedTask, token: CancellationToken) {
        let Some(pool) = self.weak_self.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            if let Some(on_start) = task.on_start.take() {
                on_start();
            }
            let started = Instant::now();
            let budget = task.deadline.saturating_duration_since(started);
            let run = task.run.take().expect("task.run consumed exactly once");
            let mut body = tokio::spawn(run(token.clone()));

            let disposition = tokio::select! {
                _ = token.cancelled() => {
                    // Cooperative: the task saw the token; give it the
                    // grace window to unwind before hard-aborting.
                    if tokio::time::timeout(CANCEL_GRACE, &mut body).await.is_err() {
                        body.abort();
                    }
                    TaskDisposition::Cancelled(ScanError::cancelled())
                }
                joined = tokio::time::timeout(budget, &mut body) => match joined {
                    Err(_elapsed) => {
                        token.cancel();
                        if tokio::time::timeout(CANCEL_GRACE, &mut body).await.is_err() {
                            body.abort();
                        }
                        TaskDisposition::Timeout
                    }
                    Ok(Err(join_err)) => {
                        if join_err.is_panic() {
                            tracing::error!(
                                scanner = %task.scanner_name,
                                "Scanner panicked: {}",
                                join_err
                            );
                            TaskDisposition::Failed(ScanError::internal("scanner panicked"))
                        } else {
                            TaskDisposition::Cancelled(ScanError::cancelled())
                        }
                    }
                    Ok(Ok(Ok(()))) => TaskDisposition::Completed,
                    Ok(Ok(Err(e))) => match e.kind() {
                        ScanErrorKind::Timeout => TaskDisposition::Timeout,
                        ScanErrorKind::Cancelled => TaskDisposition::Cancelled(e),
                        _ => TaskDisposition::Failed(e),
                    },
                },
            };

            pool.finish(task, disposition, started.elapsed()).await;
        });
    }

    async fn finish(
        &self,
        mut task: QueuedTask,
        disposition: TaskDisposition,
        elapsed: Duration,
    ) {
        {
            let mut state = self.state.lock();
            state.active.remove(&task.id);
            if let Some(count) = state.per_host_active.get_mut(&task.host) {
                *count = count.saturating_sub(1);
            }

            match &disposition {
                TaskDisposition::Completed => {
                    state.completed += 1;
                    let ms = elapsed.as_secs_f64() * 1000.0;
                    state.latency_ewma_ms = Some(match state.latency_ewma_ms {
                        Some(prev) => LATENCY_EWMA_ALPHA * ms + (1.0 - LATENCY_EWMA_ALPHA) * prev,
                        None => ms,
                    });
                    let per_scanner = state
                        .per_scanner_latency_ms
                        .entry(task.scanner_name.clone())
                        .or_insert(ms);
                    *per_scanner = LATENCY_EWMA_ALPHA * ms + (1.0 - LATENCY_EWMA_ALPHA) * *per_scanner;
                }
                TaskDisposition::Failed(_) => state.failed += 1,
                TaskDisposition::Timeout => state.timeouts += 1,
                TaskDisposition::Cancelled(_) => state.cancelled += 1,
            }
        }

        match &disposition {
            TaskDisposition::Completed => self.breaker.record_success(&task.scanner_name).await,
            TaskDisposition::Failed(_) | TaskDisposition::Timeout => {
                self.breaker.record_failure(&task.scanner_name).await
            }
            TaskDisposition::Cancelled(_) => {}
        }

        if let Some(cb) = task.on_terminal.take() {
            cb(disposition);
        }
        self.notify.notify_one();
    }
}

impl Drop for TaskPool {
    fn drop(&mut self) {
        self.admission_cancel.cancel();
    }
}
