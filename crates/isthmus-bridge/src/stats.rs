//! Bridge statistics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use isthmus_core::Direction;
use serde::Serialize;

use crate::error::BridgeError;

/// Counters shared by one scope and everything built on it.
///
/// All counters only ever increase; the latency averages are cumulative means
/// over every timed conversion in that direction.
#[derive(Debug, Default)]
pub struct BridgeStats {
    /// Values converted from A to B
    pub conversions_to_b: AtomicU64,
    /// Values converted from B to A
    pub conversions_to_a: AtomicU64,
    /// Operations that failed with a conversion error
    pub conversion_errors: AtomicU64,
    /// Operations the safety gate refused
    pub gate_rejections: AtomicU64,
    /// Mapping entries skipped because their key was not a string
    pub dropped_keys: AtomicU64,
    /// Messages sent towards B
    pub messages_to_b: AtomicU64,
    /// Messages sent towards A
    pub messages_to_a: AtomicU64,
    /// Completed `emit` fan-outs
    pub events_dispatched: AtomicU64,
    /// Listeners that failed during fan-out
    pub listener_failures: AtomicU64,
    latency_to_b: Latency,
    latency_to_a: Latency,
}

#[derive(Debug, Default)]
struct Latency {
    samples: AtomicU64,
    total_nanos: AtomicU64,
}

impl Latency {
    fn record(&self, elapsed: Duration) {
        self.samples.fetch_add(1, Ordering::Relaxed);
        self.total_nanos
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    fn average_ms(&self) -> f64 {
        let samples = self.samples.load(Ordering::Relaxed);
        if samples == 0 {
            return 0.0;
        }
        self.total_nanos.load(Ordering::Relaxed) as f64 / samples as f64 / 1_000_000.0
    }
}

impl BridgeStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one successful conversion, optionally timed.
    pub fn record_conversion(&self, direction: Direction, elapsed: Option<Duration>) {
        let (counter, latency) = match direction {
            Direction::AToB => (&self.conversions_to_b, &self.latency_to_b),
            Direction::BToA => (&self.conversions_to_a, &self.latency_to_a),
        };
        counter.fetch_add(1, Ordering::Relaxed);
        if let Some(elapsed) = elapsed {
            latency.record(elapsed);
        }
    }

    /// Count a failed public operation. Only gate rejections and conversion
    /// errors are tracked.
    pub fn record_failure(&self, error: &BridgeError) {
        match error {
            BridgeError::UnsafeValue { .. } => {
                self.gate_rejections.fetch_add(1, Ordering::Relaxed);
            }
            BridgeError::Conversion { .. } => {
                self.conversion_errors.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }

    pub fn record_message(&self, direction: Direction) {
        let counter = match direction {
            Direction::AToB => &self.messages_to_b,
            Direction::BToA => &self.messages_to_a,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Get snapshot of current stats
    pub fn snapshot(&self) -> BridgeStatsSnapshot {
        let conversion_errors = self.conversion_errors.load(Ordering::Relaxed);
        let gate_rejections = self.gate_rejections.load(Ordering::Relaxed);
        let dropped_keys = self.dropped_keys.load(Ordering::Relaxed);
        BridgeStatsSnapshot {
            conversions_to_b: self.conversions_to_b.load(Ordering::Relaxed),
            conversions_to_a: self.conversions_to_a.load(Ordering::Relaxed),
            conversion_errors,
            gate_rejections,
            serialization_errors: conversion_errors + gate_rejections + dropped_keys,
            dropped_keys,
            messages_to_b: self.messages_to_b.load(Ordering::Relaxed),
            messages_to_a: self.messages_to_a.load(Ordering::Relaxed),
            events_dispatched: self.events_dispatched.load(Ordering::Relaxed),
            listener_failures: self.listener_failures.load(Ordering::Relaxed),
            avg_conversion_ms_to_b: self.latency_to_b.average_ms(),
            avg_conversion_ms_to_a: self.latency_to_a.average_ms(),
        }
    }
}

/// A point-in-time snapshot of bridge statistics
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BridgeStatsSnapshot {
    pub conversions_to_b: u64,
    pub conversions_to_a: u64,
    pub conversion_errors: u64,
    pub gate_rejections: u64,
    /// Conversion errors, gate rejections and dropped keys together
    pub serialization_errors: u64,
    pub dropped_keys: u64,
    pub messages_to_b: u64,
    pub messages_to_a: u64,
    pub events_dispatched: u64,
    pub listener_failures: u64,
    pub avg_conversion_ms_to_b: f64,
    pub avg_conversion_ms_to_a: f64,
}

impl BridgeStatsSnapshot {
    /// Total successful conversions in both directions
    pub fn total_conversions(&self) -> u64 {
        self.conversions_to_b + self.conversions_to_a
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ConversionFailure, GateReason};
    use isthmus_core::Kind;

    #[test]
    fn test_serialization_errors_sum() {
        let stats = BridgeStats::new();
        stats.record_failure(&BridgeError::UnsafeValue {
            direction: Direction::AToB,
            reason: GateReason::CallableBlocked,
        });
        stats.record_failure(&BridgeError::conversion(
            "$",
            ConversionFailure::NoMapping(Kind::Unknown),
        ));
        stats.record_failure(&BridgeError::Call(crate::error::CallFailure::RecursionLimit {
            limit: 1,
        }));
        stats.dropped_keys.fetch_add(2, Ordering::Relaxed);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.gate_rejections, 1);
        assert_eq!(snapshot.conversion_errors, 1);
        assert_eq!(snapshot.dropped_keys, 2);
        assert_eq!(snapshot.serialization_errors, 4);
    }

    #[test]
    fn test_latency_is_cumulative_mean() {
        let stats = BridgeStats::new();
        stats.record_conversion(Direction::BToA, Some(Duration::from_millis(2)));
        stats.record_conversion(Direction::BToA, Some(Duration::from_millis(4)));
        stats.record_conversion(Direction::BToA, None);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.conversions_to_a, 3);
        assert!((snapshot.avg_conversion_ms_to_a - 3.0).abs() < 1e-9);
        assert_eq!(snapshot.avg_conversion_ms_to_b, 0.0);
    }

    #[test]
    fn test_snapshot_serializes() {
        let stats = BridgeStats::new();
        stats.record_message(Direction::AToB);
        let json = stats.snapshot().to_json();
        assert_eq!(json["messages_to_b"], 1);
        assert_eq!(json["serialization_errors"], 0);
    }
}
