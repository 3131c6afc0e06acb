//! Per-scan event bus with bounded history replay
//!
//! Thread-safe pub-sub channel delivering scan events to any number of
//! subscribers. Late joiners first receive a replay of the most recent
//! events, then the live feed, with no duplication in between.
//!
//! # Architecture
//!
//! - **Fan-out**: one `tokio::sync::broadcast` channel; every subscriber
//!   has its own bounded queue and a slow subscriber can never block a
//!   publisher. A subscriber that falls behind loses its oldest events
//!   and receives a `lagged` marker telling it how many were dropped.
//! - **History**: ring buffer of the last `history_max` events under a
//!   mutex. Subscription snapshots the history and joins the live feed
//!   under the same lock, which makes the replay/live cut consistent.
//! - **Termination**: the stream ends after yielding the scan's terminal
//!   `scan_completed` event.

use crate::events::ScanEvent;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Bus statistics: (published, dropped, subscribers, history length).
pub type BusStats = (u64, u64, usize, usize);

struct BusState {
    history: VecDeque<ScanEvent>,
    max_history: usize,
    total_events: u64,
    /// Set once the terminal event is published; later publishes are
    /// dropped so `scan_completed` is the last event on every feed.
    closed: bool,
}

/// Per-scan event bus.
///
/// Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct EventBus {
    scan_id: Uuid,
    state: Arc<Mutex<BusState>>,
    sender: broadcast::Sender<ScanEvent>,
    dropped: Arc<AtomicU64>,
}

impl EventBus {
    /// Create a bus for one scan.
    ///
    /// `max_history` bounds the replay buffer; `queue_capacity` bounds
    /// each subscriber's live queue.
    pub fn new(scan_id: Uuid, max_history: usize, queue_capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(queue_capacity.max(1));
        EventBus {
            scan_id,
            state: Arc::new(Mutex::new(BusState {
                history: VecDeque::with_capacity(max_history.min(1024)),
                max_history,
                total_events: 0,
                closed: false,
            })),
            sender,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// The scan this bus belongs to.
    pub fn scan_id(&self) -> Uuid {
        self.scan_id
    }

    /// Publish an event to all subscribers and the history buffer.
    ///
    /// Invalid events are rejected with a warning rather than poisoning
    /// subscribers. Returns the number of subscribers at publish time.
    pub fn publish(&self, event: ScanEvent) -> usize {
        if let Err(e) = event.validate() {
            tracing::warn!(scan_id = %self.scan_id, "Invalid event rejected: {}", e);
            return 0;
        }

        let mut state = self.state.lock();
        if state.closed {
            tracing::debug!(scan_id = %self.scan_id, "Event after terminal dropped");
            return 0;
        }
        if event.is_terminal() {
            state.closed = true;
        }
        state.total_events += 1;

        if state.history.len() >= state.max_history {
            state.history.pop_front();
        }
        state.history.push_back(event.clone());

        // Send while holding the lock so a concurrent subscribe sees the
        // event exactly once: in the snapshot or on the live feed.
        // Err means no live subscribers, which is fine.
        match self.sender.send(event) {
            Ok(n) => n,
            Err(_) => 0,
        }
    }

    /// Subscribe, receiving history replay followed by live events.
    pub fn subscribe(&self) -> EventStream {
        let state = self.state.lock();
        let replay: VecDeque<ScanEvent> = state.history.iter().cloned().collect();
        let receiver = self.sender.subscribe();
        // Replay already terminal? The stream still yields it, then ends.
        EventStream {
            scan_id: self.scan_id,
            replay,
            receiver,
            dropped_total: Arc::clone(&self.dropped),
            finished: false,
        }
    }

    /// Last `count` events, oldest first.
    pub fn get_history(&self, count: usize) -> Vec<ScanEvent> {
        let state = self.state.lock();
        let start = state.history.len().saturating_sub(count);
        state.history.iter().skip(start).cloned().collect()
    }

    /// Bus statistics.
    pub fn stats(&self) -> BusStats {
        let state = self.state.lock();
        (
            state.total_events,
            self.dropped.load(Ordering::Relaxed),
            self.sender.receiver_count(),
            state.history.len(),
        )
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// Subscriber handle yielding replayed history, then live events, until
/// the scan's terminal event has been delivered.
pub struct EventStream {
    scan_id: Uuid,
    replay: VecDeque<ScanEvent>,
    receiver: broadcast::Receiver<ScanEvent>,
    dropped_total: Arc<AtomicU64>,
    finished: bool,
}

impl EventStream {
    /// Next event, or `None` once the scan is complete (or the bus gone).
    pub async fn next(&mut self) -> Option<ScanEvent> {
        if self.finished {
            return None;
        }

        if let Some(event) = self.replay.pop_front() {
            if event.is_terminal() {
                self.finished = true;
            }
            return Some(event);
        }

        loop {
            match self.receiver.recv().await {
                Ok(event) => {
                    if event.is_terminal() {
                        self.finished = true;
                    }
                    return Some(event);
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.dropped_total.fetch_add(n, Ordering::Relaxed);
                    tracing::warn!(scan_id = %self.scan_id, dropped = n, "Slow subscriber lagged");
                    return Some(ScanEvent::Lagged {
                        scan_id: self.scan_id,
                        dropped: n,
                        timestamp: Utc::now(),
                    });
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.finished = true;
                    return None;
                }
            }
        }
    }

    /// Drain everything currently available without waiting.
    pub fn drain_ready(&mut self) -> Vec<ScanEvent> {
        let mut out = Vec::new();
        while let Some(event) = self.replay.pop_front() {
            if event.is_terminal() {
                self.finished = true;
            }
            out.push(event);
        }
        while !self.finished {
            match self.receiver.try_recv() {
                Ok(event) => {
                    if event.is_terminal() {
                        self.finished = true;
                    }
                    out.push(event);
                }
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    self.dropped_total.fetch_add(n, Ordering::Relaxed);
                    out.push(ScanEvent::Lagged {
                        scan_id: self.scan_id,
                        dropped: n,
                        timestamp: Utc::now(),
                    });
                }
                Err(_) => break,
            }
        }
        out
    }
}
