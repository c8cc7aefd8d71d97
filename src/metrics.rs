// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for the drain engine.
//!
//! Uses the `metrics` crate facade; the host process picks the exporter.
//!
//! # Metric Naming Convention
//! - `dirty_drain_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `operation`: peek, save, advance, quarantine
//! - `kind`: backend, decode, protocol, config

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Record an entry persisted to the durable store and acknowledged.
pub fn record_persisted(namespace: &str, bytes: usize) {
    counter!(
        "dirty_drain_persisted_total",
        "namespace" => namespace.to_string()
    )
    .increment(1);
    counter!("dirty_drain_persisted_bytes_total").increment(bytes as u64);
}

/// Record an acknowledge that found a newer revision (entry stays dirty).
pub fn record_stale_ack() {
    counter!("dirty_drain_stale_acks_total").increment(1);
}

/// Record a failed ledger or store call.
pub fn record_error(operation: &str, kind: &str) {
    counter!(
        "dirty_drain_errors_total",
        "operation" => operation.to_string(),
        "kind" => kind.to_string()
    )
    .increment(1);
}

/// Record a key moved to quarantine.
pub fn record_quarantined() {
    counter!("dirty_drain_quarantined_total").increment(1);
}

pub fn record_latency(operation: &str, duration: Duration) {
    histogram!(
        "dirty_drain_operation_seconds",
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Entries acknowledged in one drain pass (peek until empty or error).
pub fn record_pass_size(count: usize) {
    histogram!("dirty_drain_pass_entries").record(count as f64);
}

pub fn set_pending(count: u64) {
    gauge!("dirty_drain_pending_entries").set(count as f64);
}

/// Track state machine transitions.
pub fn set_engine_state(state: &str) {
    counter!(
        "dirty_drain_state_transitions_total",
        "state" => state.to_string()
    )
    .increment(1);
}

/// A timing guard that records latency on drop
pub struct LatencyTimer {
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(self.operation, self.start.elapsed());
    }
}
