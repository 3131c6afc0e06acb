//! Shared discovery inventory
//!
//! Stage-A scanners publish what they learn about the target (interesting
//! URLs, presence of forms, API indicators) into a per-scan inventory;
//! later stages read it. The orchestrator also uses it for stage gating:
//! Stage B opens once the inventory is populated, Stage C only if form or
//! API signals exist.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// Default cap on inventoried URLs
pub const DEFAULT_URL_CAP: usize = 10;

/// Per-scan discovery inventory, shared between scanners via `Arc`.
#[derive(Debug)]
pub struct ScanInventory {
    urls: Mutex<Vec<String>>,
    url_cap: usize,
    forms_seen: AtomicBool,
    api_indicators: AtomicBool,
}

impl Default for ScanInventory {
    fn default() -> Self {
        Self::new(DEFAULT_URL_CAP)
    }
}

impl ScanInventory {
    pub fn new(url_cap: usize) -> Self {
        Self {
            urls: Mutex::new(Vec::new()),
            url_cap,
            forms_seen: AtomicBool::new(false),
            api_indicators: AtomicBool::new(false),
        }
    }

    /// Record a discovered URL. Duplicates and overflow beyond the cap
    /// are ignored. Returns whether the URL was stored.
    pub fn record_url(&self, url: impl Into<String>) -> bool {
        let url = url.into();
        let mut urls = self.urls.lock();
        if urls.len() >= self.url_cap || urls.iter().any(|u| *u == url) {
            return false;
        }
        urls.push(url);
        true
    }

    /// Snapshot of the inventoried URLs.
    pub fn urls(&self) -> Vec<String> {
        self.urls.lock().clone()
    }

    /// True once any URL has been recorded.
    pub fn is_populated(&self) -> bool {
        !self.urls.lock().is_empty()
    }

    pub fn mark_forms_seen(&self) {
        self.forms_seen.store(true, Ordering::Relaxed);
    }

    pub fn mark_api_indicators(&self) {
        self.api_indicators.store(true, Ordering::Relaxed);
    }

    /// Whether Stage-B probing surfaced deep-dive signals.
    pub fn has_deep_signals(&self) -> bool {
        self.forms_seen.load(Ordering::Relaxed) || self.api_indicators.load(Ordering::Relaxed)
    }
}
