//! Rolling performance metrics.
//!
//! Both roles keep a bounded ring of recent message samples and aggregate
//! them on demand. Latency on the slave is `now - message.timestamp` with
//! unsynchronized clocks, so the value is indicative only, never
//! authoritative; negative skew clamps to zero.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

/// Number of samples retained in the rolling window.
pub const SAMPLE_WINDOW: usize = 512;

#[derive(Debug, Clone, Copy)]
struct Sample {
    at_ms: i64,
    latency_ms: u64,
    bytes: u64,
}

/// Aggregated view over the rolling window.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PerfMetrics {
    /// Average latency over the window, in milliseconds. Advisory only:
    /// master and slave clocks are not synchronized.
    pub average_latency_ms: f64,
    /// Messages currently in the window.
    pub window_messages: usize,
    /// Messages per second over the window span.
    pub messages_per_second: f64,
    /// Bytes accounted in the window.
    pub window_bytes: u64,
    /// Messages recorded since process start.
    pub total_messages: u64,
    /// Bytes recorded since process start.
    pub total_bytes: u64,
}

/// Single-writer-per-side sample recorder.
#[derive(Debug, Default)]
pub struct MetricsRecorder {
    ring: Mutex<VecDeque<Sample>>,
    total_messages: AtomicU64,
    total_bytes: AtomicU64,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self {
            ring: Mutex::new(VecDeque::with_capacity(SAMPLE_WINDOW)),
            total_messages: AtomicU64::new(0),
            total_bytes: AtomicU64::new(0),
        }
    }

    /// Record one message sample. `latency_ms` should already be clamped
    /// to zero by the caller when clock skew produces a negative value.
    pub fn record(&self, latency_ms: u64, bytes: u64) {
        let sample = Sample {
            at_ms: chrono::Utc::now().timestamp_millis(),
            latency_ms,
            bytes,
        };

        let mut ring = self.ring.lock();
        if ring.len() == SAMPLE_WINDOW {
            ring.pop_front();
        }
        ring.push_back(sample);
        drop(ring);

        self.total_messages.fetch_add(1, Ordering::Relaxed);
        self.total_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Aggregate the current window.
    pub fn snapshot(&self) -> PerfMetrics {
        let ring = self.ring.lock();
        let count = ring.len();

        let (latency_sum, bytes_sum) = ring
            .iter()
            .fold((0u64, 0u64), |(l, b), s| (l + s.latency_ms, b + s.bytes));

        // Window span in seconds, floored at one to keep the rate sane for
        // bursts shorter than the clock resolution.
        let span_secs = match (ring.front(), ring.back()) {
            (Some(first), Some(last)) => ((last.at_ms - first.at_ms) as f64 / 1000.0).max(1.0),
            _ => 1.0,
        };

        PerfMetrics {
            average_latency_ms: if count > 0 {
                latency_sum as f64 / count as f64
            } else {
                0.0
            },
            window_messages: count,
            messages_per_second: count as f64 / span_secs,
            window_bytes: bytes_sum,
            total_messages: self.total_messages.load(Ordering::Relaxed),
            total_bytes: self.total_bytes.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_recorder_aggregates_to_zero() {
        let metrics = MetricsRecorder::new().snapshot();
        assert_eq!(metrics.window_messages, 0);
        assert_eq!(metrics.average_latency_ms, 0.0);
        assert_eq!(metrics.total_bytes, 0);
    }

    #[test]
    fn averages_over_samples() {
        let recorder = MetricsRecorder::new();
        recorder.record(10, 100);
        recorder.record(30, 300);

        let metrics = recorder.snapshot();
        assert_eq!(metrics.window_messages, 2);
        assert_eq!(metrics.average_latency_ms, 20.0);
        assert_eq!(metrics.window_bytes, 400);
        assert_eq!(metrics.total_messages, 2);
    }

    #[test]
    fn ring_is_bounded_but_totals_keep_counting() {
        let recorder = MetricsRecorder::new();
        for _ in 0..(SAMPLE_WINDOW + 40) {
            recorder.record(1, 1);
        }

        let metrics = recorder.snapshot();
        assert_eq!(metrics.window_messages, SAMPLE_WINDOW);
        assert_eq!(metrics.total_messages, (SAMPLE_WINDOW + 40) as u64);
        assert_eq!(metrics.total_bytes, (SAMPLE_WINDOW + 40) as u64);
    }
}
