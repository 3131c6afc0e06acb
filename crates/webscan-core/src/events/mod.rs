//! Event types for scan lifecycle tracking
//!
//! Defines every event published on a scan's event bus. All events carry
//! `scan_id` for correlation and `timestamp` for ordering, and serialize
//! with a `type` tag so transport layers can forward them unmodified.

mod types;

pub use types::{ModuleStatusPayload, ScanEvent, ScanEventType};
