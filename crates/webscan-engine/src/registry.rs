//! Scanner registry
//!
//! Explicit registry populated by `register` calls at engine
//! construction. No runtime discovery: whatever the embedder registers
//! is the complete scanner set. The registry is constructed once, then
//! treated as read-only by the engine, so lookups need no locking
//! beyond the build phase.

use crate::scanner::{Scanner, ScannerFactory};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use webscan_core::{Error, Intensity, Result, ScannerMetadata};

struct Entry {
    metadata: ScannerMetadata,
    factory: ScannerFactory,
}

/// Registry of available scanners keyed by name.
#[derive(Default)]
pub struct ScannerRegistry {
    entries: RwLock<BTreeMap<String, Entry>>,
}

impl ScannerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a scanner factory under its name.
    ///
    /// The factory is invoked once per scan to get a fresh instance.
    /// Re-registering a name replaces the previous entry.
    pub fn register<F>(&self, name: &str, metadata: ScannerMetadata, factory: F)
    where
        F: Fn() -> Arc<dyn Scanner> + Send + Sync + 'static,
    {
        let mut entries = self.entries.write();
        if entries.contains_key(name) {
            tracing::warn!(scanner = name, "Replacing existing scanner registration");
        }
        entries.insert(
            name.to_string(),
            Entry {
                metadata,
                factory: Arc::new(factory),
            },
        );
    }

    /// Instantiate a scanner by name.
    pub fn get(&self, name: &str) -> Result<Arc<dyn Scanner>> {
        let entries = self.entries.read();
        let entry = entries
            .get(name)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown scanner '{}'", name)))?;
        Ok((entry.factory)())
    }

    /// Metadata for one scanner.
    pub fn metadata(&self, name: &str) -> Option<ScannerMetadata> {
        self.entries.read().get(name).map(|e| e.metadata.clone())
    }

    /// All registered scanners with their metadata, sorted by name.
    pub fn list(&self) -> Vec<(String, ScannerMetadata)> {
        self.entries
            .read()
            .iter()
            .map(|(name, entry)| (name.clone(), entry.metadata.clone()))
            .collect()
    }

    /// Names selected by a scan type: all scanners for full scans,
    /// low-intensity only for quick scans.
    pub fn names_for_quick(&self) -> Vec<String> {
        self.entries
            .read()
            .iter()
            .filter(|(_, e)| e.metadata.intensity == Intensity::Low)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// All registered names.
    pub fn names(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
